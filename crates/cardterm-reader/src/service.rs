//! Framework-agnostic facade over one reader.
//!
//! [`ReaderService::start`] wires the link tasks, the runtime task, the
//! session worker and the two session orchestrators together. Everything
//! a REST layer or a CLI needs goes through here.

use std::sync::Arc;
use std::time::Duration;

use cardterm_core::{Pin, SubProtocol};
use cardterm_hardware::mock::MockTapHandle;
use cardterm_hardware::{TapBackend, TapListener, resolve_tap_backend};
use cardterm_network::{LinkHandle, spawn_link};
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::{DEFAULT_SCHEMA, ReaderConfig, ResolvedSchema, TimingConfig};
use crate::device::DeviceEvent;
use crate::error::{ReaderError, Result};
use crate::runtime::{RuntimeHandle, spawn_runtime};
use crate::session::{
    CancelOutcome, CardReadOperation, CardReadParams, CardReadResult, SessionId,
    SessionOrchestrator, SessionSnapshot, SessionWorker, UnlockOperation, UnlockOutcome,
};
use crate::status::StatusSnapshot;

const WORKER_THREAD_NAME: &str = "cardterm-sessions";

pub struct ReaderService {
    runtime: RuntimeHandle,
    runtime_task: Mutex<Option<JoinHandle<()>>>,
    links: Vec<LinkHandle>,
    backend: TapBackend,
    worker: Arc<SessionWorker>,
    unlock: SessionOrchestrator<UnlockOperation>,
    card_read: SessionOrchestrator<CardReadOperation>,
    schemas: Vec<ResolvedSchema>,
}

impl ReaderService {
    /// Validate `config`, resolve the tap backend and start every task.
    ///
    /// `device` is the antenna listener used in device mode. Must be called
    /// from within a tokio runtime.
    ///
    /// # Errors
    /// `Validation` for a bad configuration, `HardwareUnavailable` when
    /// device mode is configured without a listener, `Io` if the session
    /// worker thread cannot start.
    pub fn start(config: &ReaderConfig, device: Option<Arc<dyn TapListener>>) -> Result<Self> {
        let settings = config.resolve()?;
        let backend = resolve_tap_backend(config.hardware, device)?;
        let worker = Arc::new(SessionWorker::new(WORKER_THREAD_NAME)?);

        let (transit_link, transit_events) = spawn_link(SubProtocol::Transit, config.transit.clone());
        let (ifsf_link, ifsf_events) = spawn_link(SubProtocol::Ifsf, config.ifsf.clone());
        let schemas = settings.schemas.clone();
        let sessions = settings.sessions.clone();
        let auth_timeout = auth_budget(&settings.timing);
        let (runtime, runtime_task) = spawn_runtime(settings, transit_events, ifsf_events);

        let unlock = SessionOrchestrator::new(
            UnlockOperation::new(runtime.clone(), auth_timeout),
            backend.listener.clone(),
            worker.clone(),
            runtime.subscribe_status(),
            &sessions,
        );
        let card_read = SessionOrchestrator::new(
            CardReadOperation::new(runtime.clone()),
            backend.listener.clone(),
            worker.clone(),
            runtime.subscribe_status(),
            &sessions,
        );

        info!(
            transit = %config.transit.addr,
            ifsf = %config.ifsf.addr,
            hardware = ?config.hardware,
            "Reader service started"
        );
        Ok(Self {
            runtime,
            runtime_task: Mutex::new(Some(runtime_task)),
            links: vec![transit_link, ifsf_link],
            backend,
            worker,
            unlock,
            card_read,
            schemas,
        })
    }

    /// Start a PIN unlock session; the PIN is verified once a card is
    /// tapped.
    ///
    /// # Errors
    /// `Validation` for a malformed PIN (no session is created),
    /// `Precondition` when the module is not ready or already unlocked.
    pub fn start_unlock(&self, pin: &str) -> Result<SessionId> {
        let pin = Pin::new(pin)?;
        self.unlock.start(pin)
    }

    pub fn get_unlock_status(&self, id: SessionId) -> Result<SessionSnapshot<UnlockOutcome>> {
        self.unlock.get(id)
    }

    /// Start a card read session with the named schema (default schema
    /// when `None`) and an optional tap wait.
    ///
    /// # Errors
    /// `Precondition` for an unknown schema, a zero timeout, or a reader
    /// that is not ready for cards.
    pub fn start_card_read(&self, schema: Option<&str>, timeout_ms: Option<u64>) -> Result<SessionId> {
        let name = schema.unwrap_or(DEFAULT_SCHEMA);
        let schema = self
            .schemas
            .iter()
            .find(|s| s.name == name)
            .cloned()
            .ok_or_else(|| ReaderError::precondition(format!("unknown card schema {name:?}")))?;
        if timeout_ms == Some(0) {
            return Err(ReaderError::precondition("card read timeout must be positive"));
        }
        self.card_read.start(CardReadParams {
            schema,
            timeout: timeout_ms.map(Duration::from_millis),
        })
    }

    pub fn get_card_read_status(&self, id: SessionId) -> Result<SessionSnapshot<CardReadResult>> {
        self.card_read.get(id)
    }

    pub fn cancel_card_read(&self, id: SessionId) -> CancelOutcome {
        self.card_read.cancel(id)
    }

    pub fn status(&self) -> StatusSnapshot {
        self.runtime.status()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<StatusSnapshot> {
        self.runtime.subscribe_status()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<DeviceEvent> {
        self.runtime.subscribe_events()
    }

    pub fn runtime(&self) -> &RuntimeHandle {
        &self.runtime
    }

    /// Tap simulator, in simulated hardware mode only.
    pub fn simulator(&self) -> Option<&MockTapHandle> {
        self.backend.simulator.as_ref()
    }

    /// Stop the runtime, the links and the session worker.
    pub async fn shutdown(&self) {
        info!("Reader service shutting down");
        self.worker.shutdown();
        self.backend.listener.unregister();
        self.runtime.shutdown().await;
        let task = self.runtime_task.lock().take();
        if let Some(task) = task {
            // A panicked runtime has nothing left to clean up.
            let _ = task.await;
        }
        for link in &self.links {
            link.shutdown();
        }
    }
}

/// Upper bound for one authentication run: every reversible step may need
/// a resend, the two irreversible steps have their own budget.
fn auth_budget(timing: &TimingConfig) -> Duration {
    timing.check_period() * 16 + timing.irreversible_step_timeout() * 2
}

#[cfg(test)]
mod tests {
    use super::*;
    use cardterm_hardware::HardwareMode;

    fn config() -> ReaderConfig {
        ReaderConfig::default()
    }

    #[tokio::test]
    async fn test_device_mode_without_listener_fails_fast() {
        let config = ReaderConfig {
            hardware: HardwareMode::Device,
            ..config()
        };
        let err = ReaderService::start(&config, None).err().unwrap();
        assert!(matches!(err, ReaderError::HardwareUnavailable(_)));
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let mut config = config();
        config.timing.tick_interval_ms = 0;
        let err = ReaderService::start(&config, None).err().unwrap();
        assert!(matches!(err, ReaderError::Validation(_)));
    }

    #[tokio::test]
    async fn test_malformed_pin_creates_no_session() {
        let service = ReaderService::start(&config(), None).unwrap();
        let err = service.start_unlock("12AB56").unwrap_err();
        assert!(matches!(err, ReaderError::Validation(_)));
        assert!(!service.simulator().unwrap().is_armed());
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_unlock_refused_before_bring_up() {
        let service = ReaderService::start(&config(), None).unwrap();
        let err = service.start_unlock("123456").unwrap_err();
        assert!(matches!(err, ReaderError::Precondition(_)));
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_card_read_argument_checks() {
        let service = ReaderService::start(&config(), None).unwrap();
        assert!(
            service
                .start_card_read(Some("metro"), None)
                .unwrap_err()
                .to_string()
                .contains("unknown card schema")
        );
        assert!(matches!(
            service.start_card_read(None, Some(0)),
            Err(ReaderError::Precondition(_))
        ));
        assert!(matches!(
            service.start_card_read(None, None),
            Err(ReaderError::Precondition(_))
        ));
        service.shutdown().await;
    }

    #[test]
    fn test_auth_budget_covers_irreversible_steps() {
        let timing = TimingConfig::default();
        assert!(auth_budget(&timing) > timing.irreversible_step_timeout() * 2);
    }
}

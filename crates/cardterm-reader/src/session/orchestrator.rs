//! Tap-triggered session orchestration.
//!
//! A [`SessionOrchestrator`] turns one [`SessionOperation`] into pollable
//! sessions:
//!
//! 1. `start` checks preconditions against the latest status snapshot and
//!    creates the session `PENDING`;
//! 2. the worker arms the tap listener (`WAITING_FOR_EVENT`) and starts the
//!    tap timer;
//! 3. the first tap moves the session to `PROCESSING` and runs the
//!    operation on the worker, ending `COMPLETED` or `FAILED`.
//!
//! Only the first tap, error or timeout of a registration counts; the rest
//! are dropped by a shared fired flag. The listener is disarmed whenever a
//! session leaves `WAITING_FOR_EVENT`.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use cardterm_hardware::{CardTap, TapCallback, TapErrorCallback, TapListener};
use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::error::{ReaderError, Result};
use crate::session::store::{SessionId, SessionSnapshot, SessionStatus, SessionStore};
use crate::session::worker::SessionWorker;
use crate::status::StatusSnapshot;

/// The business part of a tap-triggered workflow.
pub trait SessionOperation: Send + Sync + 'static {
    type Params: Clone + Send + Sync + 'static;
    type Output: Clone + Send + Sync + 'static;

    /// Listener registration tag, also used in logs.
    const SOURCE_TAG: &'static str;

    /// Refuse to start when the reader cannot serve the request.
    fn check_preconditions(&self, status: &StatusSnapshot, params: &Self::Params) -> Result<()>;

    /// Per-session tap wait; `None` uses the configured default.
    fn tap_timeout(&self, _params: &Self::Params) -> Option<Duration> {
        None
    }

    fn execute(
        &self,
        params: Self::Params,
        tap: CardTap,
    ) -> impl Future<Output = Result<Self::Output>> + Send;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    Cancelled,
    NotFoundOrAlreadyDone,
}

struct Armed {
    id: SessionId,
    fired: Arc<AtomicBool>,
    timer: Option<JoinHandle<()>>,
}

struct Inner<O: SessionOperation> {
    operation: O,
    store: SessionStore<O::Params, O::Output>,
    listener: Arc<dyn TapListener>,
    worker: Arc<SessionWorker>,
    status: watch::Receiver<StatusSnapshot>,
    default_tap_timeout: Duration,
    armed: Mutex<Option<Armed>>,
    start_lock: Mutex<()>,
}

pub struct SessionOrchestrator<O: SessionOperation> {
    inner: Arc<Inner<O>>,
}

impl<O: SessionOperation> Clone for SessionOrchestrator<O> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<O: SessionOperation> SessionOrchestrator<O> {
    /// Create the orchestrator and start its periodic session cleanup on
    /// `worker`.
    pub fn new(
        operation: O,
        listener: Arc<dyn TapListener>,
        worker: Arc<SessionWorker>,
        status: watch::Receiver<StatusSnapshot>,
        config: &SessionConfig,
    ) -> Self {
        let inner = Arc::new(Inner {
            operation,
            store: SessionStore::new(O::SOURCE_TAG),
            listener,
            worker,
            status,
            default_tap_timeout: config.tap_wait_timeout(),
            armed: Mutex::new(None),
            start_lock: Mutex::new(()),
        });
        inner.worker.spawn(cleanup_loop(
            Arc::downgrade(&inner),
            config.cleanup_interval(),
            config.ttl(),
        ));
        Self { inner }
    }

    /// Validate and create a session; the tap listener is armed on the
    /// worker right after.
    ///
    /// # Errors
    /// Whatever the operation's preconditions return, or `Precondition`
    /// if a session of this kind is still running or the listener is held
    /// by another workflow.
    pub fn start(&self, params: O::Params) -> Result<SessionId> {
        let inner = &self.inner;
        let status = inner.status.borrow().clone();
        inner.operation.check_preconditions(&status, &params)?;

        let _starting = inner.start_lock.lock();
        if inner.store.has_active() {
            return Err(ReaderError::precondition(format!(
                "a {} session is already in progress",
                O::SOURCE_TAG
            )));
        }
        // An own registration without an active session is being torn
        // down by an earlier arm job; the queue orders us after it.
        if let Some(owner) = inner.listener.registered_by()
            && owner != O::SOURCE_TAG
        {
            return Err(ReaderError::precondition(format!(
                "tap listener is busy with {owner}"
            )));
        }

        let id = inner.store.create(params);
        let job_inner = inner.clone();
        if !inner.worker.submit(async move { job_inner.arm(id) }) {
            let _ = inner.store.fail(id, "session worker stopped");
            return Err(ReaderError::precondition("session worker stopped"));
        }
        Ok(id)
    }

    /// # Errors
    /// `SessionNotFound` for unknown or evicted ids.
    pub fn get(&self, id: SessionId) -> Result<SessionSnapshot<O::Output>> {
        self.inner.store.get(id).ok_or(ReaderError::SessionNotFound(id))
    }

    /// Cancel a session that is still waiting for its card. Idempotent.
    ///
    /// A session already processing a tap runs to completion and is
    /// reported as `NotFoundOrAlreadyDone`.
    pub fn cancel(&self, id: SessionId) -> CancelOutcome {
        match self.inner.store.cancel(id, "cancelled") {
            Ok(true) => {
                info!(operation = O::SOURCE_TAG, session = %id, "Session cancelled");
                self.inner.disarm(id);
                CancelOutcome::Cancelled
            }
            Ok(false) | Err(_) => CancelOutcome::NotFoundOrAlreadyDone,
        }
    }

    pub fn operation(&self) -> &O {
        &self.inner.operation
    }
}

impl<O: SessionOperation> Inner<O> {
    fn arm(self: &Arc<Self>, id: SessionId) {
        if self.store.advance(id, SessionStatus::WaitingForEvent).is_err() {
            debug!(operation = O::SOURCE_TAG, session = %id, "Session finished before arming");
            return;
        }
        let Some(params) = self.store.params(id) else {
            return;
        };

        let fired = Arc::new(AtomicBool::new(false));
        let on_detected: TapCallback = {
            let inner = Arc::downgrade(self);
            let fired = fired.clone();
            Arc::new(move |tap: CardTap| {
                if fired.swap(true, Ordering::SeqCst) {
                    debug!(operation = O::SOURCE_TAG, session = %id, uid = %tap.uid_hex(), "Ignoring additional tap");
                    return;
                }
                let Some(inner) = inner.upgrade() else {
                    return;
                };
                let job_inner = inner.clone();
                if !inner.worker.submit(async move { job_inner.process(id, tap).await }) {
                    warn!(operation = O::SOURCE_TAG, session = %id, "Tap dropped, session worker stopped");
                }
            })
        };
        let on_error: TapErrorCallback = {
            let inner = Arc::downgrade(self);
            let fired = fired.clone();
            Arc::new(move |error| {
                if fired.swap(true, Ordering::SeqCst) {
                    return;
                }
                if let Some(inner) = inner.upgrade() {
                    warn!(operation = O::SOURCE_TAG, session = %id, error = %error, "Tap listener failed");
                    let _ = inner
                        .store
                        .fail_unless_terminal(id, format!("tap listener error: {error}"));
                    inner.disarm(id);
                }
            })
        };

        if let Err(e) = self.listener.register(O::SOURCE_TAG, on_detected, on_error) {
            let _ = self.store.fail(id, format!("cannot arm tap listener: {e}"));
            return;
        }

        let timeout = self
            .operation
            .tap_timeout(&params)
            .unwrap_or(self.default_tap_timeout);
        let timer = {
            let inner = Arc::downgrade(self);
            let fired = fired.clone();
            self.worker.spawn(async move {
                tokio::time::sleep(timeout).await;
                if fired.swap(true, Ordering::SeqCst) {
                    return;
                }
                if let Some(inner) = inner.upgrade() {
                    info!(operation = O::SOURCE_TAG, session = %id, "No card presented in time");
                    let _ = inner.store.fail_unless_terminal(
                        id,
                        format!("no card presented within {} ms", timeout.as_millis()),
                    );
                    inner.disarm(id);
                }
            })
        };

        *self.armed.lock() = Some(Armed {
            id,
            fired,
            timer: Some(timer),
        });
        info!(operation = O::SOURCE_TAG, session = %id, timeout_ms = timeout.as_millis() as u64, "Waiting for card");

        // Cancelled while registering.
        if self.store.status(id).is_none_or(|status| status.is_terminal()) {
            self.disarm(id);
        }
    }

    /// Disarm the listener if `id` holds it. Idempotent.
    fn disarm(&self, id: SessionId) {
        let armed = {
            let mut slot = self.armed.lock();
            match slot.as_ref() {
                Some(armed) if armed.id == id => slot.take(),
                _ => None,
            }
        };
        let Some(mut armed) = armed else {
            return;
        };
        armed.fired.store(true, Ordering::SeqCst);
        if let Some(timer) = armed.timer.take() {
            timer.abort();
        }
        if self.listener.registered_by().as_deref() == Some(O::SOURCE_TAG) {
            self.listener.unregister();
        }
    }

    /// Drop expired sessions, releasing the listener if one of them held it.
    fn evict_expired(&self, now: Instant, ttl: Duration) {
        for id in self.store.cleanup_at(now, ttl) {
            self.disarm(id);
        }
    }

    async fn process(self: Arc<Self>, id: SessionId, tap: CardTap) {
        self.disarm(id);
        if self.store.advance(id, SessionStatus::Processing).is_err() {
            debug!(operation = O::SOURCE_TAG, session = %id, "Tap arrived for a finished session");
            return;
        }
        let Some(params) = self.store.params(id) else {
            return;
        };
        info!(
            operation = O::SOURCE_TAG,
            session = %id,
            uid = %tap.uid_hex(),
            card_type = tap.card_type.name(),
            "Card presented"
        );

        let outcome = AssertUnwindSafe(self.operation.execute(params, tap))
            .catch_unwind()
            .await;
        let recorded = match outcome {
            Ok(Ok(output)) => self.store.complete(id, output),
            Ok(Err(e)) => self.store.fail(id, e.to_string()),
            Err(_) => self.store.fail(id, "operation panicked"),
        };
        if let Err(e) = recorded {
            // Evicted while processing.
            debug!(operation = O::SOURCE_TAG, session = %id, error = %e, "Outcome not recorded");
        }
    }
}

async fn cleanup_loop<O: SessionOperation>(
    inner: Weak<Inner<O>>,
    interval: Duration,
    ttl: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else {
            return;
        };
        inner.evict_expired(Instant::now(), ttl);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ReaderContext;
    use crate::init::InitState;
    use crate::testkit::settings;
    use cardterm_hardware::mock::{MockTapHandle, MockTapListener};
    use cardterm_hardware::{CardType, HardwareError};
    use std::sync::atomic::AtomicUsize;

    const WAIT: Duration = Duration::from_secs(5);
    const UID: [u8; 4] = [0x04, 0xA1, 0xB2, 0xC3];

    /// Echoes the parameter and the tapped UID. `0` fails, `99` panics.
    #[derive(Default)]
    struct Echo {
        executions: AtomicUsize,
        delay: Duration,
    }

    impl SessionOperation for Echo {
        type Params = u32;
        type Output = String;
        const SOURCE_TAG: &'static str = "echo";

        fn check_preconditions(&self, status: &StatusSnapshot, _params: &u32) -> Result<()> {
            if status.init_state != InitState::Done {
                return Err(ReaderError::precondition("reader not initialized"));
            }
            Ok(())
        }

        fn tap_timeout(&self, params: &u32) -> Option<Duration> {
            (*params == 7).then(|| Duration::from_millis(50))
        }

        async fn execute(&self, params: u32, tap: CardTap) -> Result<String> {
            self.executions.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            match params {
                0 => Err(ReaderError::precondition("zero")),
                99 => panic!("operation blew up"),
                n => Ok(format!("{n}:{}", tap.uid_hex())),
            }
        }
    }

    struct Fixture {
        orchestrator: SessionOrchestrator<Echo>,
        listener: Arc<dyn TapListener>,
        taps: MockTapHandle,
        status: watch::Sender<StatusSnapshot>,
    }

    fn fixture(operation: Echo) -> Fixture {
        let mut snapshot = StatusSnapshot::capture(&ReaderContext::new(settings()));
        snapshot.init_state = InitState::Done;
        let (status, status_rx) = watch::channel(snapshot);
        let (listener, taps) = MockTapListener::new();
        let listener: Arc<dyn TapListener> = Arc::new(listener);
        let worker = Arc::new(SessionWorker::new("echo-worker").unwrap());
        let orchestrator = SessionOrchestrator::new(
            operation,
            listener.clone(),
            worker,
            status_rx,
            &SessionConfig::default(),
        );
        Fixture {
            orchestrator,
            listener,
            taps,
            status,
        }
    }

    async fn wait_until(
        orchestrator: &SessionOrchestrator<Echo>,
        id: SessionId,
        mut done: impl FnMut(&SessionSnapshot<String>) -> bool,
    ) -> SessionSnapshot<String> {
        tokio::time::timeout(WAIT, async {
            loop {
                let snapshot = orchestrator.get(id).unwrap();
                if done(&snapshot) {
                    return snapshot;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("session did not reach the expected state")
    }

    async fn wait_armed(fx: &Fixture, id: SessionId) {
        wait_until(&fx.orchestrator, id, |s| s.status == SessionStatus::WaitingForEvent).await;
        assert!(fx.taps.is_armed());
    }

    #[tokio::test]
    async fn test_tap_completes_session_and_disarms() {
        let fx = fixture(Echo::default());
        let id = fx.orchestrator.start(5).unwrap();
        assert_eq!(fx.orchestrator.get(id).unwrap().history[0], SessionStatus::Pending);

        wait_armed(&fx, id).await;
        assert_eq!(fx.listener.registered_by().as_deref(), Some("echo"));
        assert!(fx.taps.tap(UID.to_vec(), CardType::MifareDESFire));

        let snapshot = wait_until(&fx.orchestrator, id, |s| s.status.is_terminal()).await;
        assert_eq!(snapshot.status, SessionStatus::Completed);
        assert_eq!(snapshot.result.as_deref(), Some("5:04A1B2C3"));
        assert_eq!(
            snapshot.history,
            vec![
                SessionStatus::Pending,
                SessionStatus::WaitingForEvent,
                SessionStatus::Processing,
                SessionStatus::Completed,
            ]
        );
        assert!(!fx.taps.is_armed());
    }

    #[tokio::test]
    async fn test_preconditions_refuse_without_session() {
        let fx = fixture(Echo::default());
        fx.status.send_modify(|s| s.init_state = InitState::Starting);

        let err = fx.orchestrator.start(5).unwrap_err();
        assert!(matches!(err, ReaderError::Precondition(_)));
        assert!(fx.orchestrator.inner.store.is_empty());
        assert!(!fx.taps.is_armed());
    }

    #[tokio::test]
    async fn test_one_active_session_at_a_time() {
        let fx = fixture(Echo::default());
        let id = fx.orchestrator.start(5).unwrap();
        wait_armed(&fx, id).await;
        assert!(matches!(
            fx.orchestrator.start(6),
            Err(ReaderError::Precondition(_))
        ));

        fx.orchestrator.cancel(id);
        let next = fx.orchestrator.start(6).unwrap();
        assert_ne!(next, id);
    }

    #[tokio::test]
    async fn test_busy_listener_is_refused() {
        let fx = fixture(Echo::default());
        fx.listener
            .register("card_read", Arc::new(|_| {}), Arc::new(|_| {}))
            .unwrap();

        let err = fx.orchestrator.start(5).unwrap_err();
        assert!(err.to_string().contains("card_read"));
    }

    #[tokio::test]
    async fn test_second_tap_is_ignored() {
        let fx = fixture(Echo {
            delay: Duration::from_millis(100),
            ..Echo::default()
        });
        let id = fx.orchestrator.start(5).unwrap();
        wait_armed(&fx, id).await;

        fx.taps.tap(UID.to_vec(), CardType::MifareDESFire);
        fx.taps.tap(vec![0x04, 0, 0, 1], CardType::MifareDESFire);

        let snapshot = wait_until(&fx.orchestrator, id, |s| s.status.is_terminal()).await;
        assert_eq!(snapshot.result.as_deref(), Some("5:04A1B2C3"));
        assert_eq!(fx.orchestrator.operation().executions.load(Ordering::SeqCst), 1);
        assert!(!fx.taps.tap(UID.to_vec(), CardType::MifareDESFire));
    }

    #[tokio::test]
    async fn test_tap_timeout_fails_session() {
        let fx = fixture(Echo::default());
        let id = fx.orchestrator.start(7).unwrap();

        let snapshot = wait_until(&fx.orchestrator, id, |s| s.status.is_terminal()).await;
        assert_eq!(snapshot.status, SessionStatus::Failed);
        assert!(snapshot.error_message.unwrap().contains("no card presented"));
        assert!(!fx.taps.is_armed());
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let fx = fixture(Echo::default());
        let id = fx.orchestrator.start(5).unwrap();
        wait_armed(&fx, id).await;

        assert_eq!(fx.orchestrator.cancel(id), CancelOutcome::Cancelled);
        assert_eq!(fx.orchestrator.cancel(id), CancelOutcome::NotFoundOrAlreadyDone);
        assert_eq!(
            fx.orchestrator.cancel(SessionId::new_random()),
            CancelOutcome::NotFoundOrAlreadyDone
        );

        let snapshot = fx.orchestrator.get(id).unwrap();
        assert_eq!(snapshot.status, SessionStatus::Failed);
        assert_eq!(snapshot.error_message.as_deref(), Some("cancelled"));
        assert!(!fx.taps.is_armed());
        assert!(!fx.taps.tap(UID.to_vec(), CardType::MifareDESFire));
    }

    #[tokio::test]
    async fn test_cancel_before_arming_leaves_listener_free() {
        let fx = fixture(Echo::default());
        let id = fx.orchestrator.start(5).unwrap();
        fx.orchestrator.cancel(id);

        // Let the queued arm job run.
        let next = fx.orchestrator.start(6).unwrap();
        wait_armed(&fx, next).await;
        assert_eq!(
            fx.orchestrator.get(id).unwrap().history,
            vec![SessionStatus::Pending, SessionStatus::Failed]
        );
    }

    #[tokio::test]
    async fn test_operation_error_and_panic_are_recorded() {
        let fx = fixture(Echo::default());

        let id = fx.orchestrator.start(0).unwrap();
        wait_armed(&fx, id).await;
        fx.taps.tap(UID.to_vec(), CardType::MifareDESFire);
        let snapshot = wait_until(&fx.orchestrator, id, |s| s.status.is_terminal()).await;
        assert_eq!(snapshot.error_message.as_deref(), Some("Illegal state: zero"));

        let id = fx.orchestrator.start(99).unwrap();
        wait_armed(&fx, id).await;
        fx.taps.tap(UID.to_vec(), CardType::MifareDESFire);
        let snapshot = wait_until(&fx.orchestrator, id, |s| s.status.is_terminal()).await;
        assert_eq!(snapshot.error_message.as_deref(), Some("operation panicked"));

        // The worker survived.
        let id = fx.orchestrator.start(3).unwrap();
        wait_armed(&fx, id).await;
        fx.taps.tap(UID.to_vec(), CardType::MifareDESFire);
        let snapshot = wait_until(&fx.orchestrator, id, |s| s.status.is_terminal()).await;
        assert_eq!(snapshot.status, SessionStatus::Completed);
    }

    #[tokio::test]
    async fn test_listener_error_fails_session() {
        let fx = fixture(Echo::default());
        let id = fx.orchestrator.start(5).unwrap();
        wait_armed(&fx, id).await;

        assert!(fx.taps.fail(HardwareError::disconnected("antenna")));
        let snapshot = fx.orchestrator.get(id).unwrap();
        assert_eq!(snapshot.status, SessionStatus::Failed);
        assert!(snapshot.error_message.unwrap().starts_with("tap listener error"));
        assert!(!fx.taps.is_armed());
    }

    #[tokio::test]
    async fn test_unknown_session_is_not_found() {
        let fx = fixture(Echo::default());
        assert!(matches!(
            fx.orchestrator.get(SessionId::new_random()),
            Err(ReaderError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_expired_waiting_session_releases_listener() {
        let fx = fixture(Echo::default());
        let id = fx.orchestrator.start(5).unwrap();
        wait_armed(&fx, id).await;

        let ttl = SessionConfig::default().ttl();
        fx.orchestrator.inner.evict_expired(Instant::now() + ttl, ttl);
        assert!(fx.orchestrator.get(id).is_err());
        assert!(!fx.taps.is_armed());
        assert_eq!(fx.listener.registered_by(), None);

        let next = fx.orchestrator.start(6).unwrap();
        wait_armed(&fx, next).await;
        fx.taps.tap(UID.to_vec(), CardType::MifareDESFire);
        let snapshot = wait_until(&fx.orchestrator, next, |s| s.status.is_terminal()).await;
        assert_eq!(snapshot.status, SessionStatus::Completed);
    }

    #[tokio::test]
    async fn test_processing_session_cannot_be_cancelled() {
        let fx = fixture(Echo {
            delay: Duration::from_millis(200),
            ..Echo::default()
        });
        let id = fx.orchestrator.start(5).unwrap();
        wait_armed(&fx, id).await;
        fx.taps.tap(UID.to_vec(), CardType::MifareDESFire);
        wait_until(&fx.orchestrator, id, |s| s.status == SessionStatus::Processing).await;

        assert_eq!(fx.orchestrator.cancel(id), CancelOutcome::NotFoundOrAlreadyDone);
        let snapshot = wait_until(&fx.orchestrator, id, |s| s.status.is_terminal()).await;
        assert_eq!(snapshot.status, SessionStatus::Completed);
        assert_eq!(snapshot.result.as_deref(), Some("5:04A1B2C3"));
    }
}

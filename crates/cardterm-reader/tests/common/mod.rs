//! Shared harness: a TCP terminal simulator and a reader service with
//! short timings pointed at it.

#![allow(dead_code)]

use std::time::Duration;

use cardterm_hardware::mock::MockTapHandle;
use cardterm_network::LinkConfig;
use cardterm_reader::config::TimingConfig;
use cardterm_reader::simulator::{TerminalModel, TerminalSimulator};
use cardterm_reader::{ReaderConfig, ReaderService, Result, SessionSnapshot, StatusSnapshot};
use tracing_subscriber::EnvFilter;

pub const WAIT: Duration = Duration::from_secs(10);

pub const UID: [u8; 7] = [0x04, 0x5A, 0x11, 0x22, 0x33, 0x44, 0x80];

/// Install a `RUST_LOG`-driven subscriber once per test binary.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn fast_timing() -> TimingConfig {
    TimingConfig {
        tick_interval_ms: 20,
        response_timeout_ms: 300,
        check_margin_ms: 20,
        post_reboot_grace_ms: 200,
        irreversible_step_timeout_ms: 600,
        keepalive_interval_ms: 100,
        keepalive_max_misses: 3,
    }
}

pub fn config_for(terminal: &TerminalSimulator) -> ReaderConfig {
    let link = |addr| LinkConfig {
        addr,
        connect_timeout_ms: 500,
        reconnect_delay_ms: 50,
        ..LinkConfig::default()
    };
    ReaderConfig {
        transit: link(terminal.transit_addr()),
        ifsf: link(terminal.ifsf_addr()),
        timing: fast_timing(),
        ..ReaderConfig::default()
    }
}

pub struct Harness {
    pub terminal: TerminalSimulator,
    pub service: ReaderService,
}

impl Harness {
    /// Simulator plus service; the terminal can be adjusted before the
    /// reader connects.
    pub async fn start_with(setup: impl FnOnce(&mut TerminalModel)) -> Self {
        init_tracing();
        let config = ReaderConfig::default();
        let sam = config.resolve().unwrap().sam;
        let terminal = TerminalSimulator::start(&sam).await.unwrap();
        terminal.update(setup);
        let service = ReaderService::start(&config_for(&terminal), None).unwrap();
        Self { terminal, service }
    }

    pub async fn start() -> Self {
        Self::start_with(|_| {}).await
    }

    pub async fn operational() -> Self {
        let harness = Self::start().await;
        harness.wait_status(|s| s.operational).await;
        harness
    }

    pub async fn wait_status(&self, predicate: impl FnMut(&StatusSnapshot) -> bool) -> StatusSnapshot {
        self.service
            .runtime()
            .wait_for_status(WAIT, predicate)
            .await
            .unwrap()
    }

    pub fn taps(&self) -> &MockTapHandle {
        self.service.simulator().unwrap()
    }

    pub async fn shutdown(self) {
        self.service.shutdown().await;
        self.terminal.shutdown();
    }
}

/// Poll a session until `done` holds.
pub async fn poll_session<R>(
    mut poll: impl FnMut() -> Result<SessionSnapshot<R>>,
    mut done: impl FnMut(&SessionSnapshot<R>) -> bool,
) -> SessionSnapshot<R> {
    tokio::time::timeout(WAIT, async {
        loop {
            let snapshot = poll().unwrap();
            if done(&snapshot) {
                return snapshot;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("session did not reach the expected state")
}

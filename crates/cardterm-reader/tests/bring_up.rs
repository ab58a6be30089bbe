//! Device bring-up against the TCP terminal simulator.

mod common;

use cardterm_reader::InitState;
use cardterm_reader::device::DeviceEvent;
use common::Harness;

#[tokio::test]
async fn test_reader_becomes_operational() {
    let harness = Harness::start().await;
    let status = harness.wait_status(|s| s.operational).await;

    assert_eq!(status.init_state, InitState::Done);
    assert!(status.transit.app_alive && status.ifsf.app_alive);
    assert_eq!(status.transit.terminal_id.as_deref(), Some("TERM-0001"));
    assert_eq!(status.versions, vec!["fw=2.4.1", "sam=1.0"]);
    assert_eq!(status.sam_slot, Some(0));
    assert_eq!(status.remaining_attempts, Some(3));
    assert!(!status.error);
    harness.shutdown().await;
}

#[tokio::test]
async fn test_module_in_second_slot_is_found() {
    let harness = Harness::start_with(|terminal| {
        terminal.atrs.swap(0, 2);
    })
    .await;
    let status = harness.wait_status(|s| s.operational).await;
    assert_eq!(status.sam_slot, Some(2));
    harness.shutdown().await;
}

#[tokio::test]
async fn test_connection_loss_restarts_bring_up() {
    let harness = Harness::operational().await;
    let mut events = harness.service.subscribe_events();

    harness.terminal.drop_connections();
    harness.wait_status(|s| !s.operational).await;
    let status = harness.wait_status(|s| s.operational).await;
    assert_eq!(status.init_state, InitState::Done);

    let mut saw_reset = false;
    while let Ok(event) = events.try_recv() {
        if matches!(event, DeviceEvent::InitStateChanged { to: InitState::Starting, .. }) {
            saw_reset = true;
        }
    }
    assert!(saw_reset);
    harness.shutdown().await;
}

#[tokio::test]
async fn test_silent_reboot_sets_extra_delay() {
    let harness = Harness::operational().await;

    harness
        .terminal
        .update(|terminal| terminal.start_marker = "boot-2".to_string());
    let status = harness.wait_status(|s| s.extra_delay).await;
    assert_ne!(status.init_state, InitState::Done);

    let status = harness.wait_status(|s| s.operational).await;
    assert!(status.auth_state.is_success());
    harness.shutdown().await;
}

//! SAM authentication over TCP, including the fatal paths.

mod common;

use std::time::Duration;

use cardterm_reader::AuthState;
use common::Harness;

#[tokio::test]
async fn test_corrupt_cryptogram_finishes_failed_and_stays_put() {
    let harness = Harness::start_with(|terminal| terminal.sam.corrupt_cryptogram = true).await;

    let status = harness
        .wait_status(|s| s.auth_state.is_finished())
        .await;
    assert_eq!(status.auth_state, AuthState::Finished { success: false });
    assert!(status.error);
    assert!(!status.operational);
    assert!(status.error_message.unwrap().contains("cryptogram"));

    // Nothing is retried on its own.
    tokio::time::sleep(Duration::from_millis(800)).await;
    let stats = harness.terminal.inspect(|terminal| terminal.sam.stats());
    assert_eq!(stats.get_challenge, 1);
    assert_eq!(stats.external_authenticate, 1);
    assert_eq!(harness.service.status().auth_run, status.auth_run);
    harness.shutdown().await;
}

#[tokio::test]
async fn test_locked_module_is_never_challenged() {
    let harness = Harness::start_with(|terminal| terminal.sam.remaining_attempts = 0).await;

    let status = harness
        .wait_status(|s| s.auth_state.is_finished())
        .await;
    assert_eq!(status.auth_state, AuthState::Finished { success: false });
    assert_eq!(status.remaining_attempts, Some(0));
    assert_eq!(harness.terminal.inspect(|t| t.sam.stats().get_challenge), 0);

    let err = harness.service.runtime().restart_auth().await.unwrap_err();
    assert!(err.to_string().contains("no authentication attempts left"));
    harness.shutdown().await;
}

#[tokio::test]
async fn test_explicit_restart_reauthenticates() {
    let harness = Harness::operational().await;
    let runtime = harness.service.runtime();

    let run = runtime.restart_auth().await.unwrap();
    let outcome = runtime
        .wait_auth_finished(run, common::WAIT)
        .await
        .unwrap();
    assert_eq!(outcome, Ok(()));
    assert_eq!(
        harness.terminal.inspect(|t| t.sam.stats().external_authenticate),
        2
    );
    harness.shutdown().await;
}

#[tokio::test]
async fn test_wrong_module_type_is_reported() {
    let harness = Harness::start_with(|terminal| terminal.sam.sam_type = vec![0x02]).await;

    let status = harness
        .wait_status(|s| s.auth_state.is_finished())
        .await;
    assert!(!status.auth_state.is_success());
    assert_eq!(status.found_sam_type.as_deref(), Some("02"));
    assert_eq!(harness.terminal.inspect(|t| t.sam.stats().get_challenge), 0);
    harness.shutdown().await;
}

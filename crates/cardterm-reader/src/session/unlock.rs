//! PIN unlock: verify the PIN with the SAM on tap, re-authenticate and mark
//! the module unlocked.

use std::time::Duration;

use cardterm_core::Pin;
use cardterm_hardware::CardTap;
use serde::Serialize;
use tracing::{info, warn};

use crate::apdu;
use crate::error::{ReaderError, Result};
use crate::init::InitState;
use crate::runtime::RuntimeHandle;
use crate::session::orchestrator::SessionOperation;
use crate::status::StatusSnapshot;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnlockOutcome {
    /// UID of the card that triggered the unlock, hex.
    pub card_uid: String,
}

pub struct UnlockOperation {
    runtime: RuntimeHandle,
    auth_timeout: Duration,
}

impl UnlockOperation {
    /// `auth_timeout` bounds the re-authentication after PIN verification.
    pub fn new(runtime: RuntimeHandle, auth_timeout: Duration) -> Self {
        Self {
            runtime,
            auth_timeout,
        }
    }
}

impl SessionOperation for UnlockOperation {
    type Params = Pin;
    type Output = UnlockOutcome;
    const SOURCE_TAG: &'static str = "unlock";

    fn check_preconditions(&self, status: &StatusSnapshot, _pin: &Pin) -> Result<()> {
        if status.init_state != InitState::Done || !status.sam_detected {
            return Err(ReaderError::precondition("SAM module is not ready"));
        }
        if !status.auth_state.is_finished() {
            return Err(ReaderError::precondition("SAM authentication still in progress"));
        }
        if status.sam_unlocked {
            return Err(ReaderError::precondition("SAM module is already unlocked"));
        }
        if status.remaining_attempts == Some(0) {
            return Err(ReaderError::precondition(
                "SAM module reports no authentication attempts left",
            ));
        }
        Ok(())
    }

    async fn execute(&self, pin: Pin, tap: CardTap) -> Result<UnlockOutcome> {
        let response = self.runtime.sam_apdu(apdu::verify_pin(&pin)).await?;
        if !response.is_success() {
            warn!(sw = format_args!("{:04X}", response.sw), "PIN rejected by SAM");
            return Err(ReaderError::status_word("PIN verification", response.sw));
        }

        let run = self.runtime.restart_auth().await?;
        info!(run, "PIN accepted, re-authenticating SAM");
        self.runtime
            .wait_auth_finished(run, self.auth_timeout)
            .await?
            .map_err(ReaderError::Authentication)?;

        self.runtime.set_unlocked(true).await?;
        info!(uid = %tap.uid_hex(), "SAM module unlocked");
        Ok(UnlockOutcome {
            card_uid: tap.uid_hex(),
        })
    }
}

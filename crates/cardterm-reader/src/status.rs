//! Immutable status snapshot of the reader.
//!
//! The runtime recomputes the snapshot after every tick, link event and
//! command and publishes it on a `watch` channel only when something other
//! than the timestamp changed.

use chrono::{DateTime, Utc};
use serde::Serialize;

use cardterm_core::to_hex;
use cardterm_network::ConnectionApp;

use crate::auth::AuthState;
use crate::context::ReaderContext;
use crate::init::InitState;

/// Connectivity of one sub-protocol.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LinkStatus {
    pub connected: bool,
    pub app_alive: bool,
    pub terminal_id: Option<String>,
}

impl LinkStatus {
    fn of(app: &ConnectionApp) -> Self {
        Self {
            connected: app.is_connected(),
            app_alive: app.is_app_alive(),
            terminal_id: app.terminal_id().map(str::to_string),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusSnapshot {
    pub init_state: InitState,
    pub transit: LinkStatus,
    pub ifsf: LinkStatus,
    pub sam_detected: bool,
    pub sam_slot: Option<u8>,
    /// Hex of the SAM type read during authentication.
    pub found_sam_type: Option<String>,
    pub sam_unlocked: bool,
    /// Bring-up done, module authenticated, both applications alive.
    pub operational: bool,
    pub error: bool,
    pub error_message: Option<String>,
    pub auth_state: AuthState,
    pub auth_run: u64,
    pub remaining_attempts: Option<u8>,
    pub versions: Vec<String>,
    pub extra_delay: bool,
    pub timestamp: DateTime<Utc>,
}

impl StatusSnapshot {
    pub fn capture(ctx: &ReaderContext) -> Self {
        let device = &ctx.device;
        let sam = &device.sam;
        let transit = LinkStatus::of(&device.transit);
        let ifsf = LinkStatus::of(&device.ifsf);

        let error_message = sam
            .last_failure()
            .map(|failure| failure.to_string())
            .or_else(|| sam.detection_error().map(str::to_string));
        let operational = device.init_state() == InitState::Done
            && sam.auth_state().is_success()
            && transit.app_alive
            && ifsf.app_alive;

        Self {
            init_state: device.init_state(),
            transit,
            ifsf,
            sam_detected: sam.is_detected(),
            sam_slot: sam.detected_slot().map(|slot| slot.as_u8()),
            found_sam_type: device.found_sam_type().map(to_hex),
            sam_unlocked: sam.is_unlocked(),
            operational,
            error: error_message.is_some(),
            error_message,
            auth_state: sam.auth_state(),
            auth_run: ctx.auth.run(),
            remaining_attempts: sam.remaining_attempts(),
            versions: device.versions().to_vec(),
            extra_delay: device.extra_delay(),
            timestamp: Utc::now(),
        }
    }

    /// Compare everything but the timestamp.
    pub fn differs_from(&self, other: &StatusSnapshot) -> bool {
        let mut aligned = other.clone();
        aligned.timestamp = self.timestamp;
        *self != aligned
    }

    pub fn is_ready_for_cards(&self) -> bool {
        self.init_state == InitState::Done && self.ifsf.app_alive
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::Rig;

    #[test]
    fn test_initial_snapshot() {
        let rig = Rig::new();
        let status = StatusSnapshot::capture(&rig.ctx);
        assert_eq!(status.init_state, InitState::Starting);
        assert!(!status.transit.connected);
        assert!(!status.operational);
        assert!(!status.error);
        assert_eq!(status.auth_state, AuthState::InitVerifyingSamDetected);
    }

    #[test]
    fn test_timestamp_alone_is_not_a_change() {
        let rig = Rig::new();
        let first = StatusSnapshot::capture(&rig.ctx);
        let mut second = first.clone();
        second.timestamp = first.timestamp + chrono::Duration::seconds(5);
        assert!(!first.differs_from(&second));

        second.sam_unlocked = true;
        assert!(first.differs_from(&second));
    }

    #[test]
    fn test_operational_after_authentication() {
        let mut rig = Rig::new();
        rig.bring_up();
        rig.run_until_auth_finished();

        let status = StatusSnapshot::capture(&rig.ctx);
        assert_eq!(status.init_state, InitState::Done);
        assert!(status.auth_state.is_success());
        assert!(status.operational);
        assert_eq!(status.found_sam_type.as_deref(), Some("01"));
        assert_eq!(status.versions, ["fw=2.4.1", "sam=1.0"]);
        assert!(status.is_ready_for_cards());
    }

    #[test]
    fn test_detection_failure_is_reported() {
        let mut rig = Rig::new();
        rig.terminal.atrs[0] = vec![0x3B, 0x00];
        rig.bring_up();

        let status = StatusSnapshot::capture(&rig.ctx);
        assert!(!status.sam_detected);
        assert!(status.error);
        assert!(status.error_message.is_some());
    }

    #[test]
    fn test_serializes_state_names() {
        let rig = Rig::new();
        let json = serde_json::to_value(StatusSnapshot::capture(&rig.ctx)).unwrap();
        assert_eq!(json["init_state"], "STARTING");
        assert_eq!(json["auth_state"], "INIT_VERIFYING_SAM_DETECTED");
    }
}

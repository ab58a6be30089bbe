//! Secure module (SAM) handle.
//!
//! Holds what the reader has learned about the module: per-slot ATR and
//! status, which slot carries a supported module, the auth process state
//! and the lockout accounting. Slot and auth data are cleared by
//! [`SamModule::reset`] on every full device re-init; the attempt counters
//! describe the physical module and survive it.

use cardterm_core::SlotIndex;
use cardterm_core::constants::{MAX_AUTH_ATTEMPTS, MAX_SAM_SLOTS};

use crate::auth::{AuthFailure, AuthState};
use crate::crypto::SessionCipher;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SlotInfo {
    /// ATR as last read; empty for an empty slot.
    pub atr: Option<Vec<u8>>,
    /// Operational status code.
    pub status: Option<u8>,
}

#[derive(Debug)]
pub struct SamModule {
    slots: [SlotInfo; MAX_SAM_SLOTS as usize],
    detected_slot: Option<SlotIndex>,
    detection_error: Option<String>,
    sam_number: Option<Vec<u8>>,
    pub(crate) auth_state: AuthState,
    authenticated: bool,
    unlocked: bool,
    remaining_attempts: Option<u8>,
    failed_attempts: u8,
    last_failure: Option<AuthFailure>,
    session: Option<SessionCipher>,
}

impl Default for SamModule {
    fn default() -> Self {
        Self::new()
    }
}

impl SamModule {
    pub fn new() -> Self {
        Self {
            slots: Default::default(),
            detected_slot: None,
            detection_error: None,
            sam_number: None,
            auth_state: AuthState::InitVerifyingSamDetected,
            authenticated: false,
            unlocked: false,
            remaining_attempts: None,
            failed_attempts: 0,
            last_failure: None,
            session: None,
        }
    }

    /// Back to defaults, keeping the attempt counters.
    pub fn reset(&mut self) {
        let remaining_attempts = self.remaining_attempts;
        let failed_attempts = self.failed_attempts;
        *self = Self::new();
        self.remaining_attempts = remaining_attempts;
        self.failed_attempts = failed_attempts;
    }

    pub fn slot(&self, slot: SlotIndex) -> &SlotInfo {
        &self.slots[slot.as_u8() as usize]
    }

    pub fn set_atr(&mut self, slot: SlotIndex, atr: Vec<u8>) {
        self.slots[slot.as_u8() as usize].atr = Some(atr);
    }

    pub fn set_status(&mut self, slot: SlotIndex, status: Option<u8>) {
        self.slots[slot.as_u8() as usize].status = status;
    }

    pub fn detected_slot(&self) -> Option<SlotIndex> {
        self.detected_slot
    }

    pub fn is_detected(&self) -> bool {
        self.detected_slot.is_some()
    }

    pub(crate) fn set_detected(&mut self, slot: SlotIndex) {
        self.detected_slot = Some(slot);
        self.detection_error = None;
    }

    pub fn detection_error(&self) -> Option<&str> {
        self.detection_error.as_deref()
    }

    pub(crate) fn set_detection_error(&mut self, message: String) {
        self.detection_error = Some(message);
    }

    /// Status code of the detected slot.
    pub fn operational_status(&self) -> Option<u8> {
        self.detected_slot.and_then(|slot| self.slot(slot).status)
    }

    pub fn sam_number(&self) -> Option<&[u8]> {
        self.sam_number.as_deref()
    }

    pub(crate) fn set_sam_number(&mut self, number: Vec<u8>) {
        self.sam_number = Some(number);
    }

    pub fn auth_state(&self) -> AuthState {
        self.auth_state
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    pub fn is_unlocked(&self) -> bool {
        self.unlocked
    }

    pub(crate) fn set_unlocked(&mut self, unlocked: bool) -> bool {
        let changed = self.unlocked != unlocked;
        self.unlocked = unlocked;
        changed
    }

    /// Attempts left as last reported by the module.
    pub fn remaining_attempts(&self) -> Option<u8> {
        self.remaining_attempts
    }

    pub(crate) fn set_remaining_attempts(&mut self, remaining: u8) {
        self.remaining_attempts = Some(remaining);
    }

    /// Attempt-consuming failures since the last successful authentication.
    pub fn failed_attempts(&self) -> u8 {
        self.failed_attempts
    }

    /// Count one spent authentication attempt.
    pub(crate) fn consume_attempt(&mut self) {
        self.failed_attempts = self.failed_attempts.saturating_add(1);
        self.remaining_attempts = self.remaining_attempts.map(|r| r.saturating_sub(1));
    }

    pub fn last_failure(&self) -> Option<&AuthFailure> {
        self.last_failure.as_ref()
    }

    pub fn session_cipher(&self) -> Option<&SessionCipher> {
        self.session.as_ref()
    }

    /// A successful authentication refills the module's attempt counter.
    pub(crate) fn on_authenticated(&mut self, session: SessionCipher) {
        self.authenticated = true;
        self.failed_attempts = 0;
        self.remaining_attempts = Some(MAX_AUTH_ATTEMPTS);
        self.last_failure = None;
        self.session = Some(session);
    }

    pub(crate) fn on_auth_failed(&mut self, failure: AuthFailure) {
        self.authenticated = false;
        self.session = None;
        self.last_failure = Some(failure);
    }

    pub(crate) fn on_auth_restarted(&mut self) {
        self.authenticated = false;
        self.session = None;
        self.auth_state = AuthState::InitVerifyingSamDetected;
    }
}

//! Emulated secure module.
//!
//! Speaks the APDU subset the reader uses: SELECT of the info and control
//! applets, GET DATA, GET CHALLENGE, EXTERNAL AUTHENTICATE and VERIFY PIN.
//! The authentication math is the reader's own, seen from the module side.

use std::fmt;
use std::sync::Arc;

use cardterm_core::constants::{CHALLENGE_LENGTH, MAX_AUTH_ATTEMPTS, SW_SUCCESS};
use tracing::debug;
use zeroize::Zeroizing;

use crate::apdu::ApduResponse;
use crate::config::SamSettings;
use crate::crypto::{self, BlockCipher, TripleDes};

pub const SW_WRONG_LENGTH: u16 = 0x6700;
pub const SW_AUTH_FAILED: u16 = 0x6300;
pub const SW_PIN_REJECTED: u16 = 0x63C0;
pub const SW_AUTH_BLOCKED: u16 = 0x6983;
pub const SW_CONDITIONS_NOT_SATISFIED: u16 = 0x6985;
pub const SW_FILE_NOT_FOUND: u16 = 0x6A82;
pub const SW_INS_NOT_SUPPORTED: u16 = 0x6D00;

/// PIN accepted by a default emulator.
pub const DEFAULT_PIN: &str = "123456";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Applet {
    Info,
    Ctrl,
}

/// Commands seen, for test assertions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SamStats {
    pub get_challenge: u32,
    pub external_authenticate: u32,
    pub verify_pin: u32,
}

pub struct SamEmulator {
    cipher: Arc<dyn BlockCipher>,
    key: Zeroizing<Vec<u8>>,
    info_aid: Vec<u8>,
    ctrl_aid: Vec<u8>,
    pub sam_type: Vec<u8>,
    pub network_id: Vec<u8>,
    pub sam_number: Vec<u8>,
    pub pin: String,
    pub remaining_attempts: u8,
    /// Flip one bit of the module cryptogram.
    pub corrupt_cryptogram: bool,
    selected: Option<Applet>,
    rnd_b: Option<Zeroizing<Vec<u8>>>,
    authenticated: bool,
    stats: SamStats,
}

impl fmt::Debug for SamEmulator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SamEmulator")
            .field("remaining_attempts", &self.remaining_attempts)
            .field("authenticated", &self.authenticated)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl SamEmulator {
    /// A module matching the reader's SAM settings.
    pub fn new(settings: &SamSettings) -> Self {
        Self {
            cipher: Arc::new(TripleDes),
            key: settings.auth_key.clone(),
            info_aid: settings.info_aid.clone(),
            ctrl_aid: settings.ctrl_aid.clone(),
            sam_type: settings.sam_type.clone(),
            network_id: settings.network_id.clone(),
            sam_number: vec![0x00, 0x00, 0x42, 0x17],
            pin: DEFAULT_PIN.to_string(),
            remaining_attempts: MAX_AUTH_ATTEMPTS,
            corrupt_cryptogram: false,
            selected: None,
            rnd_b: None,
            authenticated: false,
            stats: SamStats::default(),
        }
    }

    pub fn stats(&self) -> SamStats {
        self.stats
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    /// Process one command APDU and return the response APDU.
    pub fn process(&mut self, apdu: &[u8]) -> Vec<u8> {
        let response = match apdu {
            [0x00, 0xA4, 0x04, 0x00, _, aid @ ..] => self.select(aid),
            [0x80, 0xCA, 0x00, p2, ..] => self.get_data(*p2),
            [0x00, 0x84, 0x00, 0x00, ..] => self.get_challenge(),
            [0x00, 0x82, 0x00, 0x00, _, blob @ ..] => self.external_authenticate(blob),
            [0x00, 0x20, 0x00, _, _, pin @ ..] => self.verify_pin(pin),
            _ => status(SW_INS_NOT_SUPPORTED),
        };
        debug!(
            ins = apdu.get(1).copied().unwrap_or_default(),
            sw = response.sw,
            "SAM emulator answered"
        );
        response.to_bytes()
    }

    fn select(&mut self, aid: &[u8]) -> ApduResponse {
        self.selected = if aid == self.info_aid.as_slice() {
            Some(Applet::Info)
        } else if aid == self.ctrl_aid.as_slice() {
            Some(Applet::Ctrl)
        } else {
            return status(SW_FILE_NOT_FOUND);
        };
        status(SW_SUCCESS)
    }

    fn get_data(&self, object: u8) -> ApduResponse {
        if self.selected.is_none() {
            return status(SW_CONDITIONS_NOT_SATISFIED);
        }
        match object {
            0x01 => data(self.sam_type.clone()),
            0x02 => data(self.network_id.clone()),
            0x03 => data(self.sam_number.clone()),
            0x04 => data(vec![u8::from(self.authenticated), self.remaining_attempts]),
            _ => status(SW_FILE_NOT_FOUND),
        }
    }

    fn get_challenge(&mut self) -> ApduResponse {
        self.stats.get_challenge += 1;
        if self.selected != Some(Applet::Ctrl) {
            return status(SW_CONDITIONS_NOT_SATISFIED);
        }
        if self.remaining_attempts == 0 {
            return status(SW_AUTH_BLOCKED);
        }
        self.authenticated = false;
        let rnd_b = crypto::generate_challenge();
        match self.cipher.encrypt(&self.key, &rnd_b) {
            Ok(encrypted) => {
                self.rnd_b = Some(rnd_b);
                data(encrypted)
            }
            Err(_) => status(SW_CONDITIONS_NOT_SATISFIED),
        }
    }

    fn external_authenticate(&mut self, blob: &[u8]) -> ApduResponse {
        self.stats.external_authenticate += 1;
        let Some(rnd_b) = self.rnd_b.take() else {
            return status(SW_CONDITIONS_NOT_SATISFIED);
        };
        if blob.len() != 2 * CHALLENGE_LENGTH {
            return status(SW_WRONG_LENGTH);
        }
        let Ok(plain) = self.cipher.decrypt(&self.key, blob).map(Zeroizing::new) else {
            return status(SW_WRONG_LENGTH);
        };
        let (rnd_a, rotated_b) = plain.split_at(CHALLENGE_LENGTH);
        if rotated_b != crypto::rotate_left(&rnd_b).as_slice() {
            self.remaining_attempts = self.remaining_attempts.saturating_sub(1);
            return status(SW_AUTH_FAILED);
        }

        let Ok(mut cryptogram) = self.cipher.encrypt(&self.key, &crypto::rotate_left(rnd_a)) else {
            return status(SW_CONDITIONS_NOT_SATISFIED);
        };
        if self.corrupt_cryptogram {
            cryptogram[0] ^= 0x01;
        }
        self.authenticated = true;
        self.remaining_attempts = MAX_AUTH_ATTEMPTS;
        data(cryptogram)
    }

    fn verify_pin(&mut self, pin: &[u8]) -> ApduResponse {
        self.stats.verify_pin += 1;
        if pin == self.pin.as_bytes() {
            status(SW_SUCCESS)
        } else {
            status(SW_PIN_REJECTED)
        }
    }
}

fn status(sw: u16) -> ApduResponse {
    ApduResponse { data: Vec::new(), sw }
}

fn data(data: Vec<u8>) -> ApduResponse {
    ApduResponse { data, sw: SW_SUCCESS }
}

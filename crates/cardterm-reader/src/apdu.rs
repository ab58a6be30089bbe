//! ISO 7816-4 command APDUs used by the reader, and response parsing.

use std::fmt;

use cardterm_core::Pin;
use cardterm_core::constants::{CHALLENGE_LENGTH, SW_SUCCESS};

/// GET DATA P2 selectors understood by the module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DataObject {
    SamType = 0x01,
    NetworkId = 0x02,
    SamNumber = 0x03,
    /// Response: state byte (`00` not authenticated, `01` authenticated)
    /// followed by the remaining attempts byte.
    AuthState = 0x04,
}

pub fn select(aid: &[u8]) -> Vec<u8> {
    let mut apdu = vec![0x00, 0xA4, 0x04, 0x00, aid.len() as u8];
    apdu.extend_from_slice(aid);
    apdu
}

pub fn get_data(object: DataObject) -> Vec<u8> {
    vec![0x80, 0xCA, 0x00, object as u8, 0x00]
}

pub fn get_challenge() -> Vec<u8> {
    vec![0x00, 0x84, 0x00, 0x00, CHALLENGE_LENGTH as u8]
}

pub fn external_authenticate(blob: &[u8]) -> Vec<u8> {
    let mut apdu = vec![0x00, 0x82, 0x00, 0x00, blob.len() as u8];
    apdu.extend_from_slice(blob);
    apdu
}

pub fn verify_pin(pin: &Pin) -> Vec<u8> {
    let digits = pin.as_bytes();
    let mut apdu = vec![0x00, 0x20, 0x00, 0x01, digits.len() as u8];
    apdu.extend_from_slice(digits);
    apdu
}

/// READ BINARY addressing the file by short identifier.
pub fn read_binary(sfi: u8, offset: u8, length: u8) -> Vec<u8> {
    vec![0x00, 0xB0, 0x80 | (sfi & 0x1F), offset, length]
}

/// A response APDU split into data and status word.
#[derive(Clone, PartialEq, Eq)]
pub struct ApduResponse {
    pub data: Vec<u8>,
    pub sw: u16,
}

impl ApduResponse {
    /// Split raw response bytes. `None` if shorter than a status word.
    pub fn parse(raw: &[u8]) -> Option<Self> {
        let split = raw.len().checked_sub(2)?;
        let (data, sw) = raw.split_at(split);
        Some(Self {
            data: data.to_vec(),
            sw: u16::from_be_bytes([sw[0], sw[1]]),
        })
    }

    pub fn is_success(&self) -> bool {
        self.sw == SW_SUCCESS
    }

    /// Build raw bytes; used by the terminal simulator.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut raw = self.data.clone();
        raw.extend_from_slice(&self.sw.to_be_bytes());
        raw
    }
}

impl fmt::Debug for ApduResponse {
    // Response data may carry key material; only the length is shown.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApduResponse")
            .field("len", &self.data.len())
            .field("sw", &format_args!("{:04X}", self.sw))
            .finish()
    }
}

use crate::{
    Result,
    constants::{MAX_SAM_SLOTS, PIN_LENGTH},
    error::Error,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// The two independent protocols spoken by the reader terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubProtocol {
    /// Payment protocol.
    Ifsf,
    /// Transit protocol; also carries SAM traffic.
    Transit,
}

impl SubProtocol {
    /// Both sub-protocols, in bring-up order.
    pub const ALL: [SubProtocol; 2] = [SubProtocol::Transit, SubProtocol::Ifsf];
}

impl fmt::Display for SubProtocol {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SubProtocol::Ifsf => write!(f, "ifsf"),
            SubProtocol::Transit => write!(f, "transit"),
        }
    }
}

/// Index of a SAM slot on the reader (0-based).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SlotIndex(u8);

impl SlotIndex {
    /// Create a slot index with validation.
    ///
    /// # Errors
    /// Returns `Error::InvalidSlot` if the index is not below [`MAX_SAM_SLOTS`].
    pub fn new(index: u8) -> Result<Self> {
        if index >= MAX_SAM_SLOTS {
            return Err(Error::InvalidSlot {
                index,
                max: MAX_SAM_SLOTS - 1,
            });
        }
        Ok(SlotIndex(index))
    }

    /// Every valid slot index, in polling order.
    pub fn all() -> impl Iterator<Item = SlotIndex> {
        (0..MAX_SAM_SLOTS).map(SlotIndex)
    }

    /// Get the raw slot index.
    #[must_use]
    pub fn as_u8(&self) -> u8 {
        self.0
    }
}

impl fmt::Display for SlotIndex {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "slot{}", self.0)
    }
}

impl TryFrom<u8> for SlotIndex {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        SlotIndex::new(value)
    }
}

/// Six-digit unlock PIN.
///
/// # Security
/// The PIN is wiped from memory on drop, never printed by `Debug`, and
/// compared in constant time.
#[derive(Clone, Eq, Zeroize, ZeroizeOnDrop)]
pub struct Pin(String);

impl Pin {
    /// Create a PIN with validation.
    ///
    /// # Errors
    /// Returns `Error::InvalidPin` unless the input is exactly
    /// [`PIN_LENGTH`] ASCII digits.
    pub fn new(pin: &str) -> Result<Self> {
        if pin.len() != PIN_LENGTH {
            return Err(Error::invalid_pin(format!(
                "expected {PIN_LENGTH} digits, got {} characters",
                pin.len()
            )));
        }
        if !pin.bytes().all(|b| b.is_ascii_digit()) {
            return Err(Error::invalid_pin("PIN must contain only digits"));
        }
        Ok(Pin(pin.to_string()))
    }

    /// PIN digits as ASCII bytes, the form sent in a VERIFY APDU.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl PartialEq for Pin {
    fn eq(&self, other: &Self) -> bool {
        self.0.as_bytes().ct_eq(other.0.as_bytes()).into()
    }
}

impl fmt::Debug for Pin {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("Pin(******)")
    }
}

impl std::str::FromStr for Pin {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Pin::new(s)
    }
}

/// Decode a hex string from configuration.
///
/// Whitespace and `:` separators are ignored so that values copied from
/// vendor sheets (`3B:8F:80...`) can be pasted verbatim.
///
/// # Errors
/// Returns `Error::InvalidHex` naming `field` if the input is not valid hex.
pub fn decode_hex(field: &str, value: &str) -> Result<Vec<u8>> {
    let cleaned: String = value
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ':')
        .collect();
    hex::decode(&cleaned).map_err(|e| Error::InvalidHex {
        field: field.to_string(),
        reason: e.to_string(),
    })
}

/// Format bytes as uppercase hex for logs and snapshots.
#[must_use]
pub fn to_hex(bytes: &[u8]) -> String {
    hex::encode_upper(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0)]
    #[case(3)]
    fn test_slot_index_valid(#[case] index: u8) {
        let slot = SlotIndex::new(index).unwrap();
        assert_eq!(slot.as_u8(), index);
    }

    #[test]
    fn test_slot_index_out_of_range() {
        let err = SlotIndex::new(MAX_SAM_SLOTS).unwrap_err();
        assert!(matches!(err, Error::InvalidSlot { .. }));
    }

    #[test]
    fn test_slot_index_all() {
        let slots: Vec<u8> = SlotIndex::all().map(|s| s.as_u8()).collect();
        assert_eq!(slots, vec![0, 1, 2, 3]);
    }

    #[rstest]
    #[case("123456")]
    #[case("000000")]
    fn test_pin_valid(#[case] input: &str) {
        let pin = Pin::new(input).unwrap();
        assert_eq!(pin.as_bytes(), input.as_bytes());
    }

    #[rstest]
    #[case("12AB56")]
    #[case("12345")]
    #[case("1234567")]
    #[case("")]
    #[case("12 456")]
    fn test_pin_invalid(#[case] input: &str) {
        assert!(matches!(Pin::new(input), Err(Error::InvalidPin { .. })));
    }

    #[test]
    fn test_pin_debug_is_redacted() {
        let pin = Pin::new("123456").unwrap();
        assert!(!format!("{pin:?}").contains("123456"));
    }

    #[test]
    fn test_pin_equality() {
        assert_eq!(Pin::new("123456").unwrap(), Pin::new("123456").unwrap());
        assert_ne!(Pin::new("123456").unwrap(), Pin::new("654321").unwrap());
    }

    #[test]
    fn test_decode_hex_with_separators() {
        let bytes = decode_hex("atr", "3B:8F 80").unwrap();
        assert_eq!(bytes, vec![0x3B, 0x8F, 0x80]);
        assert_eq!(to_hex(&bytes), "3B8F80");
    }

    #[test]
    fn test_decode_hex_invalid() {
        let err = decode_hex("key", "XYZ").unwrap_err();
        assert!(matches!(err, Error::InvalidHex { field, .. } if field == "key"));
    }

    #[test]
    fn test_sub_protocol_serialization() {
        let json = serde_json::to_string(&SubProtocol::Transit).unwrap();
        assert_eq!(json, "\"transit\"");
        assert_eq!(SubProtocol::Ifsf.to_string(), "ifsf");
    }
}

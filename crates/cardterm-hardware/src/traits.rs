//! Tap listener contract and card tap data.
//!
//! The listener is callback based rather than a stream: the antenna driver
//! owns its own thread and pushes taps out as they happen. Callbacks must
//! therefore be cheap and must not block; the reader hands the tap over to
//! its session worker and returns immediately.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::error::{HardwareError, Result};

/// Minimum UID length in bytes (ISO 14443).
pub const MIN_UID_LENGTH: usize = 4;

/// Maximum UID length in bytes (ISO 14443).
pub const MAX_UID_LENGTH: usize = 10;

/// Contactless card type reported by the antenna.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CardType {
    MifareClassic1K,
    MifareClassic4K,
    MifareDESFire,
    /// ISO 14443-4 card without a more specific identification.
    Iso14443_4,
    /// Unknown card type with its ATS bytes.
    Unknown(Vec<u8>),
}

impl CardType {
    /// Get a human-readable name for the card type.
    pub fn name(&self) -> &str {
        match self {
            Self::MifareClassic1K => "Mifare Classic 1K",
            Self::MifareClassic4K => "Mifare Classic 4K",
            Self::MifareDESFire => "Mifare DESFire",
            Self::Iso14443_4 => "ISO 14443-4",
            Self::Unknown(_) => "Unknown",
        }
    }

    /// Whether the card speaks APDUs (and can be read with a schema).
    pub fn supports_apdu(&self) -> bool {
        matches!(self, Self::MifareDESFire | Self::Iso14443_4)
    }
}

/// One physical card tap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CardTap {
    /// Card unique identifier (4-10 bytes).
    pub uid: Vec<u8>,

    pub card_type: CardType,

    /// When the antenna detected the card.
    pub timestamp: DateTime<Utc>,
}

impl CardTap {
    /// Create a tap stamped with the current time.
    ///
    /// # Errors
    ///
    /// Returns `InvalidData` if the UID length is outside 4-10 bytes.
    ///
    /// # Examples
    ///
    /// ```
    /// use cardterm_hardware::{CardTap, CardType};
    ///
    /// let tap = CardTap::new(vec![0x04, 0xAB, 0xCD, 0xEF], CardType::MifareDESFire).unwrap();
    /// assert_eq!(tap.uid_hex(), "04ABCDEF");
    ///
    /// assert!(CardTap::new(vec![0x01], CardType::MifareDESFire).is_err());
    /// ```
    pub fn new(uid: Vec<u8>, card_type: CardType) -> Result<Self> {
        if !(MIN_UID_LENGTH..=MAX_UID_LENGTH).contains(&uid.len()) {
            return Err(HardwareError::invalid_data(format!(
                "UID must be {MIN_UID_LENGTH}-{MAX_UID_LENGTH} bytes, got {}",
                uid.len()
            )));
        }
        Ok(Self {
            uid,
            card_type,
            timestamp: Utc::now(),
        })
    }

    /// UID as uppercase hex.
    pub fn uid_hex(&self) -> String {
        hex::encode_upper(&self.uid)
    }
}

/// Called once per detected tap.
pub type TapCallback = Arc<dyn Fn(CardTap) + Send + Sync>;

/// Called when the antenna reports a failure while armed.
pub type TapErrorCallback = Arc<dyn Fn(HardwareError) + Send + Sync>;

/// Single-registration card tap listener.
///
/// At most one registration is active at a time. Callbacks may be invoked
/// from any thread.
pub trait TapListener: Send + Sync {
    /// Arm the listener on behalf of `source_tag`.
    ///
    /// # Errors
    ///
    /// `AlreadyRegistered` if another registration is active.
    fn register(
        &self,
        source_tag: &str,
        on_detected: TapCallback,
        on_error: TapErrorCallback,
    ) -> Result<()>;

    /// Disarm the listener. Idempotent.
    fn unregister(&self);

    /// Tag of the active registration, if any.
    fn registered_by(&self) -> Option<String>;
}

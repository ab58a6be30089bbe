use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    // Input validation
    #[error("Invalid PIN: {reason}")]
    InvalidPin { reason: String },

    #[error("Invalid SAM slot index {index} (max {max})")]
    InvalidSlot { index: u8, max: u8 },

    #[error("Invalid hex value for {field}: {reason}")]
    InvalidHex { field: String, reason: String },

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Create a new invalid PIN error.
    pub fn invalid_pin(reason: impl Into<String>) -> Self {
        Self::InvalidPin {
            reason: reason.into(),
        }
    }

    /// Create a new configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

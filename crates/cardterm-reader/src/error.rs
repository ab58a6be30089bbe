use cardterm_hardware::HardwareError;
use cardterm_network::LinkError;
use cardterm_protocol::ProtocolError;
use thiserror::Error;

use crate::auth::AuthFailure;
use crate::crypto::CryptoError;
use crate::session::SessionId;

/// Errors surfaced by the reader driver.
///
/// State-machine ticks never return these; they are logged and the machine
/// retries or times out. They reach callers of the service API and are
/// recorded on failed sessions.
#[derive(Error, Debug)]
pub enum ReaderError {
    // Transport and protocol
    #[error("Transport error: {0}")]
    Transport(#[from] LinkError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("No response to {0}")]
    NoResponse(String),

    #[error("{context} failed with status word {sw:04X}")]
    StatusWord { context: String, sw: u16 },

    // Crypto
    #[error("Cryptographic verification failed: {0}")]
    CryptoVerification(String),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("SAM authentication failed: {0}")]
    Authentication(AuthFailure),

    // Preconditions and input
    #[error("Illegal state: {0}")]
    Precondition(String),

    #[error("Invalid input: {0}")]
    Validation(#[from] cardterm_core::Error),

    #[error("Invalid state transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    // Sessions
    #[error("Session not found: {0}")]
    SessionNotFound(SessionId),

    // Hardware
    #[error("Hardware unavailable: {0}")]
    HardwareUnavailable(String),

    #[error("Hardware error: {0}")]
    Hardware(HardwareError),

    // Runtime
    #[error("Reader runtime stopped")]
    RuntimeStopped,

    #[error("Timed out waiting for {0}")]
    Timeout(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ReaderError {
    /// Create a new precondition error.
    pub fn precondition(message: impl Into<String>) -> Self {
        Self::Precondition(message.into())
    }

    /// Create a new status word error.
    pub fn status_word(context: impl Into<String>, sw: u16) -> Self {
        Self::StatusWord {
            context: context.into(),
            sw,
        }
    }
}

impl From<HardwareError> for ReaderError {
    fn from(error: HardwareError) -> Self {
        match error {
            HardwareError::Unavailable { reason } => Self::HardwareUnavailable(reason),
            other => Self::Hardware(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, ReaderError>;

use crate::commands::{CommandCode, ResponseCode};
use crate::correlation::CorrelationKey;
use thiserror::Error;

/// Errors raised while framing, parsing or correlating protocol messages.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Frame too large: {size} bytes (max {max_size})")]
    FrameTooLarge { size: usize, max_size: usize },

    #[error("Truncated TLV record: {0}")]
    Truncated(String),

    #[error("Invalid TLV length encoding: 0x{0:02X}")]
    InvalidLength(u8),

    #[error("Missing required record: {0}")]
    MissingRecord(&'static str),

    #[error("Invalid record {record}: {reason}")]
    InvalidRecord {
        record: &'static str,
        reason: String,
    },

    #[error("Message for {0} is not a response")]
    NotAResponse(CommandCode),

    #[error("Response to {command} rejected with {code}")]
    Rejected {
        command: CommandCode,
        code: ResponseCode,
    },

    #[error("No outstanding request for {0}")]
    Unmatched(CorrelationKey),

    #[error("A request for {0} is already outstanding")]
    RequestPending(CorrelationKey),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ProtocolError>;

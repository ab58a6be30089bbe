use cardterm_protocol::ProtocolError;
use thiserror::Error;

/// Errors raised by the TCP link and connection bookkeeping.
#[derive(Debug, Error)]
pub enum LinkError {
    /// No link is currently established for the sub-protocol
    #[error("Not connected")]
    NotConnected,

    /// Connection attempt timed out
    #[error("Connection timeout after {0}ms")]
    ConnectionTimeout(u64),

    /// Connection was lost while sending
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// Framing or encoding error from the codec
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Low-level I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, LinkError>;

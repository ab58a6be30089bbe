//! Wire protocol for the reader terminal.
//!
//! Both sub-protocols share the same message model: a 2-byte length prefix
//! (byte order depends on the sub-protocol) followed by a set of TLV records
//! carrying a command code, an optional response code and binary fields.
//!
//! ```text
//! +--------+----------------------------------------------+
//! | len:u16| TLV(0x01 cmd) TLV(0x02 rc)? TLV(...)*        |
//! +--------+----------------------------------------------+
//! ```
//!
//! On top of the codec sits the [`Correlator`], which pairs responses with
//! outstanding requests and expires them at their deadline.

pub mod codec;
pub mod commands;
pub mod correlation;
pub mod error;
pub mod message;
pub mod tlv;

pub use codec::{ByteOrder, DecodedFrame, FrameCodec};
pub use commands::{CommandCode, ResponseCode};
pub use correlation::{CorrelationKey, Correlator, PendingRequest, ResponseCallback};
pub use error::{ProtocolError, Result};
pub use message::Message;
pub use tlv::{Tag, TlvRecord};

//! Tokio codec for length-prefixed TLV frames.
//!
//! # Overview
//!
//! [`FrameCodec`] implements [`Decoder`] and [`Encoder<Message>`] so a TCP
//! stream can be wrapped in `tokio_util::codec::Framed`. The only
//! difference between the two sub-protocols on the wire is the byte order
//! of the length prefix:
//!
//! ```text
//! IFSF:    [len_hi, len_lo] payload
//! transit: [len_lo, len_hi] payload
//! ```
//!
//! # Error Handling
//!
//! Two classes of decode failure are distinguished:
//!
//! - A length prefix above `max_frame_size` means the stream can no longer
//!   be trusted. The decoder returns `Err(FrameTooLarge)` and `Framed`
//!   terminates the stream, so the link task reconnects.
//! - A sound length prefix with a payload that does not parse is consumed
//!   and surfaced as [`DecodedFrame::Malformed`]. The caller logs and drops
//!   it; the link stays up.
//!
//! ```rust,no_run
//! use cardterm_core::SubProtocol;
//! use cardterm_protocol::{CommandCode, DecodedFrame, FrameCodec, Message};
//! use futures::{SinkExt, StreamExt};
//! use tokio::net::TcpStream;
//! use tokio_util::codec::Framed;
//!
//! # async fn example() -> cardterm_protocol::Result<()> {
//! let stream = TcpStream::connect("127.0.0.1:9100").await?;
//! let mut framed = Framed::new(stream, FrameCodec::for_protocol(SubProtocol::Transit));
//!
//! framed.send(Message::request(CommandCode::Diagnostics)).await?;
//! if let Some(Ok(DecodedFrame::Message(response))) = framed.next().await {
//!     println!("terminal: {:?}", response.terminal_id());
//! }
//! # Ok(())
//! # }
//! ```

use bytes::{Buf, BufMut, BytesMut};
use cardterm_core::SubProtocol;
use cardterm_core::constants::{DEFAULT_MAX_FRAME_SIZE, LENGTH_PREFIX_SIZE};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{ProtocolError, Result};
use crate::message::Message;

/// Byte order of the 2-byte length prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    BigEndian,
    LittleEndian,
}

impl ByteOrder {
    /// Length-prefix byte order used by a sub-protocol.
    pub fn for_protocol(protocol: SubProtocol) -> Self {
        match protocol {
            SubProtocol::Ifsf => ByteOrder::BigEndian,
            SubProtocol::Transit => ByteOrder::LittleEndian,
        }
    }

    fn read(self, prefix: [u8; 2]) -> u16 {
        match self {
            ByteOrder::BigEndian => u16::from_be_bytes(prefix),
            ByteOrder::LittleEndian => u16::from_le_bytes(prefix),
        }
    }

    fn write(self, len: u16, dst: &mut BytesMut) {
        match self {
            ByteOrder::BigEndian => dst.put_u16(len),
            ByteOrder::LittleEndian => dst.put_u16_le(len),
        }
    }
}

/// One item produced by the decoder.
#[derive(Debug)]
pub enum DecodedFrame {
    /// A structurally valid message.
    Message(Message),
    /// A frame with a sound length whose payload failed to parse.
    Malformed { length: usize, error: ProtocolError },
}

/// Length-prefixed TLV codec.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    order: ByteOrder,
    /// Frames announcing a larger payload are rejected.
    max_frame_size: usize,
}

impl FrameCodec {
    /// Create a codec with the default maximum frame size.
    pub fn new(order: ByteOrder) -> Self {
        Self {
            order,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// Create a codec with the byte order of the given sub-protocol.
    pub fn for_protocol(protocol: SubProtocol) -> Self {
        Self::new(ByteOrder::for_protocol(protocol))
    }

    /// Override the maximum payload size.
    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    pub fn byte_order(&self) -> ByteOrder {
        self.order
    }
}

impl Decoder for FrameCodec {
    type Item = DecodedFrame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if src.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }

        let length = self.order.read([src[0], src[1]]) as usize;
        if length > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size: length,
                max_size: self.max_frame_size,
            });
        }

        let total = LENGTH_PREFIX_SIZE + length;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX_SIZE);
        let payload = src.split_to(length).freeze();

        match Message::from_payload(payload) {
            Ok(message) => Ok(Some(DecodedFrame::Message(message))),
            Err(error) => Ok(Some(DecodedFrame::Malformed { length, error })),
        }
    }
}

impl Encoder<Message> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<()> {
        let payload = item.to_payload()?;

        // The prefix is two bytes regardless of the configured maximum.
        let limit = self.max_frame_size.min(u16::MAX as usize);
        if payload.len() > limit {
            return Err(ProtocolError::FrameTooLarge {
                size: payload.len(),
                max_size: limit,
            });
        }

        dst.reserve(LENGTH_PREFIX_SIZE + payload.len());
        self.order.write(payload.len() as u16, dst);
        dst.extend_from_slice(&payload);
        Ok(())
    }
}

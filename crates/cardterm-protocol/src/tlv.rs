//! Tag-length-value records.
//!
//! Tags are a single byte. Lengths use the BER definite form:
//!
//! | First byte  | Meaning                          |
//! |-------------|----------------------------------|
//! | `00`..`7F`  | length is the byte itself        |
//! | `81 nn`     | length is `nn` (128..=255)       |
//! | `82 nn nn`  | length is big-endian `nnnn`      |
//!
//! Unknown tags are kept so that newer firmware fields survive a round trip.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{ProtocolError, Result};

/// Record tags known to this implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Tag {
    /// Command code, u16 big-endian.
    Command = 0x01,
    /// Response code, u16 big-endian. Present only on responses.
    ResponseCode = 0x02,
    /// SAM slot index, one byte.
    Slot = 0x03,
    /// Command or response APDU.
    Apdu = 0x10,
    /// Answer-to-reset bytes of a SAM slot.
    Atr = 0x11,
    /// Operational status code of a SAM slot, one byte.
    SlotStatus = 0x12,
    /// Terminal identifier, ASCII.
    TerminalId = 0x20,
    /// Firmware component version, ASCII. Repeatable.
    Version = 0x21,
    /// Boot marker reported by the device, ASCII.
    StartMarker = 0x22,
    /// Diagnostic `key=value` entry, ASCII. Repeatable.
    Diagnostic = 0x23,
}

impl Tag {
    /// Look up a known tag.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Tag::Command),
            0x02 => Some(Tag::ResponseCode),
            0x03 => Some(Tag::Slot),
            0x10 => Some(Tag::Apdu),
            0x11 => Some(Tag::Atr),
            0x12 => Some(Tag::SlotStatus),
            0x20 => Some(Tag::TerminalId),
            0x21 => Some(Tag::Version),
            0x22 => Some(Tag::StartMarker),
            0x23 => Some(Tag::Diagnostic),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// A single TLV record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlvRecord {
    /// Raw tag byte (may be a tag unknown to [`Tag`]).
    pub tag: u8,
    pub value: Bytes,
}

impl TlvRecord {
    pub fn new(tag: Tag, value: impl Into<Bytes>) -> Self {
        Self {
            tag: tag.as_u8(),
            value: value.into(),
        }
    }

    /// Whether this record carries the given known tag.
    pub fn is(&self, tag: Tag) -> bool {
        self.tag == tag.as_u8()
    }

    /// Number of bytes this record occupies on the wire.
    pub fn encoded_len(&self) -> usize {
        1 + length_header_size(self.value.len()) + self.value.len()
    }
}

fn length_header_size(len: usize) -> usize {
    match len {
        0..=0x7F => 1,
        0x80..=0xFF => 2,
        _ => 3,
    }
}

/// Append one record to `dst`.
///
/// Values longer than `u16::MAX` cannot be expressed and are rejected.
pub fn encode_record(record: &TlvRecord, dst: &mut BytesMut) -> Result<()> {
    let len = record.value.len();
    if len > u16::MAX as usize {
        return Err(ProtocolError::FrameTooLarge {
            size: len,
            max_size: u16::MAX as usize,
        });
    }

    dst.reserve(record.encoded_len());
    dst.put_u8(record.tag);
    match len {
        0..=0x7F => dst.put_u8(len as u8),
        0x80..=0xFF => {
            dst.put_u8(0x81);
            dst.put_u8(len as u8);
        }
        _ => {
            dst.put_u8(0x82);
            dst.put_u16(len as u16);
        }
    }
    dst.extend_from_slice(&record.value);
    Ok(())
}

/// Parse a complete record set.
///
/// The input must contain whole records only; trailing partial data is an
/// error because the frame boundary is already known.
pub fn decode_records(payload: &Bytes) -> Result<Vec<TlvRecord>> {
    let mut records = Vec::new();
    let mut pos = 0;

    while pos < payload.len() {
        let tag = payload[pos];
        pos += 1;

        let first = *payload
            .get(pos)
            .ok_or_else(|| ProtocolError::Truncated(format!("length of tag 0x{tag:02X}")))?;
        pos += 1;

        let len = match first {
            0x00..=0x7F => first as usize,
            0x81 => {
                let b = *payload.get(pos).ok_or_else(|| {
                    ProtocolError::Truncated(format!("long length of tag 0x{tag:02X}"))
                })?;
                pos += 1;
                b as usize
            }
            0x82 => {
                let bytes = payload.get(pos..pos + 2).ok_or_else(|| {
                    ProtocolError::Truncated(format!("long length of tag 0x{tag:02X}"))
                })?;
                pos += 2;
                u16::from_be_bytes([bytes[0], bytes[1]]) as usize
            }
            other => return Err(ProtocolError::InvalidLength(other)),
        };

        if pos + len > payload.len() {
            return Err(ProtocolError::Truncated(format!(
                "value of tag 0x{tag:02X}: need {len} bytes, have {}",
                payload.len() - pos
            )));
        }

        records.push(TlvRecord {
            tag,
            value: payload.slice(pos..pos + len),
        });
        pos += len;
    }

    Ok(records)
}

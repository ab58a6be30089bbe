//! Protocol message model.
//!
//! A [`Message`] is the decoded TLV payload of one frame. The command code
//! and response code records are lifted into typed fields; every other
//! record is kept in wire order in `records`, including tags this
//! implementation does not know.
//!
//! ```
//! use cardterm_protocol::{CommandCode, Message};
//!
//! let request = Message::request(CommandCode::SamApdu)
//!     .with_slot(1)
//!     .with_apdu(vec![0x00, 0x84, 0x00, 0x00, 0x08]);
//!
//! let payload = request.to_payload().unwrap();
//! let decoded = Message::from_payload(payload).unwrap();
//! assert_eq!(decoded.slot(), Some(1));
//! assert!(!decoded.is_response());
//! ```

use bytes::{Bytes, BytesMut};

use crate::commands::{CommandCode, ResponseCode};
use crate::correlation::CorrelationKey;
use crate::error::{ProtocolError, Result};
use crate::tlv::{self, Tag, TlvRecord};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub command: CommandCode,
    /// Present only on responses.
    pub response_code: Option<ResponseCode>,
    /// Records other than command and response code, in wire order.
    pub records: Vec<TlvRecord>,
}

impl Message {
    /// Create an empty request.
    pub fn request(command: CommandCode) -> Self {
        Self {
            command,
            response_code: None,
            records: Vec::new(),
        }
    }

    /// Create an empty response.
    pub fn response(command: CommandCode, code: ResponseCode) -> Self {
        Self {
            command,
            response_code: Some(code),
            records: Vec::new(),
        }
    }

    pub fn with_record(mut self, record: TlvRecord) -> Self {
        self.records.push(record);
        self
    }

    pub fn with_slot(self, slot: u8) -> Self {
        self.with_record(TlvRecord::new(Tag::Slot, vec![slot]))
    }

    pub fn with_apdu(self, apdu: impl Into<Bytes>) -> Self {
        self.with_record(TlvRecord::new(Tag::Apdu, apdu))
    }

    pub fn with_atr(self, atr: impl Into<Bytes>) -> Self {
        self.with_record(TlvRecord::new(Tag::Atr, atr))
    }

    pub fn with_slot_status(self, status: u8) -> Self {
        self.with_record(TlvRecord::new(Tag::SlotStatus, vec![status]))
    }

    pub fn with_terminal_id(self, id: &str) -> Self {
        self.with_record(TlvRecord::new(Tag::TerminalId, id.as_bytes().to_vec()))
    }

    pub fn with_version(self, version: &str) -> Self {
        self.with_record(TlvRecord::new(Tag::Version, version.as_bytes().to_vec()))
    }

    pub fn with_start_marker(self, marker: &str) -> Self {
        self.with_record(TlvRecord::new(Tag::StartMarker, marker.as_bytes().to_vec()))
    }

    pub fn with_diagnostic(self, key: &str, value: &str) -> Self {
        let entry = format!("{key}={value}");
        self.with_record(TlvRecord::new(Tag::Diagnostic, entry.into_bytes()))
    }

    fn first(&self, tag: Tag) -> Option<&Bytes> {
        self.records.iter().find(|r| r.is(tag)).map(|r| &r.value)
    }

    fn all(&self, tag: Tag) -> impl Iterator<Item = &Bytes> {
        self.records.iter().filter(move |r| r.is(tag)).map(|r| &r.value)
    }

    fn ascii(value: &Bytes) -> String {
        String::from_utf8_lossy(value).into_owned()
    }

    pub fn slot(&self) -> Option<u8> {
        self.first(Tag::Slot).and_then(|v| v.first().copied())
    }

    pub fn apdu(&self) -> Option<&Bytes> {
        self.first(Tag::Apdu)
    }

    /// The APDU record, or `MissingRecord` if the message has none.
    pub fn require_apdu(&self) -> Result<&Bytes> {
        self.apdu().ok_or(ProtocolError::MissingRecord("apdu"))
    }

    pub fn atr(&self) -> Option<&Bytes> {
        self.first(Tag::Atr)
    }

    pub fn slot_status(&self) -> Option<u8> {
        self.first(Tag::SlotStatus).and_then(|v| v.first().copied())
    }

    pub fn terminal_id(&self) -> Option<String> {
        self.first(Tag::TerminalId).map(Self::ascii)
    }

    pub fn versions(&self) -> Vec<String> {
        self.all(Tag::Version).map(Self::ascii).collect()
    }

    pub fn start_marker(&self) -> Option<String> {
        self.first(Tag::StartMarker).map(Self::ascii)
    }

    /// Diagnostic entries as `(key, value)` pairs. Entries without `=` get
    /// an empty value.
    pub fn diagnostics(&self) -> Vec<(String, String)> {
        self.all(Tag::Diagnostic)
            .map(|v| {
                let entry = Self::ascii(v);
                match entry.split_once('=') {
                    Some((k, v)) => (k.to_string(), v.to_string()),
                    None => (entry, String::new()),
                }
            })
            .collect()
    }

    pub fn is_response(&self) -> bool {
        self.response_code.is_some()
    }

    pub fn is_success(&self) -> bool {
        self.response_code.is_some_and(|c| c.is_success())
    }

    /// Key used to pair this message with its request or response.
    pub fn correlation_key(&self) -> CorrelationKey {
        CorrelationKey::new(self.command, self.slot())
    }

    /// Check that this is a response carrying a success code.
    ///
    /// # Errors
    /// `NotAResponse` if no response code is present, `Rejected` if the
    /// code is anything but success.
    pub fn validate_response(&self) -> Result<()> {
        match self.response_code {
            None => Err(ProtocolError::NotAResponse(self.command)),
            Some(code) if code.is_success() => Ok(()),
            Some(code) => Err(ProtocolError::Rejected {
                command: self.command,
                code,
            }),
        }
    }

    /// Encode the TLV payload (without length prefix).
    pub fn to_payload(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(
            8 + self.records.iter().map(TlvRecord::encoded_len).sum::<usize>(),
        );
        tlv::encode_record(
            &TlvRecord::new(Tag::Command, self.command.as_u16().to_be_bytes().to_vec()),
            &mut buf,
        )?;
        if let Some(code) = self.response_code {
            tlv::encode_record(
                &TlvRecord::new(Tag::ResponseCode, code.as_u16().to_be_bytes().to_vec()),
                &mut buf,
            )?;
        }
        for record in &self.records {
            tlv::encode_record(record, &mut buf)?;
        }
        Ok(buf.freeze())
    }

    /// Decode and structurally validate a TLV payload.
    ///
    /// # Errors
    /// Any TLV error, a missing command record, or a fixed-size record
    /// with the wrong length.
    pub fn from_payload(payload: Bytes) -> Result<Self> {
        let mut command = None;
        let mut response_code = None;
        let mut records = Vec::new();

        for record in tlv::decode_records(&payload)? {
            match Tag::from_u8(record.tag) {
                Some(Tag::Command) => {
                    command = Some(CommandCode::from_u16(read_u16(&record, "command")?));
                }
                Some(Tag::ResponseCode) => {
                    let code = read_u16(&record, "response_code")?;
                    response_code = Some(ResponseCode::from_u16(code));
                }
                Some(Tag::Slot) => {
                    expect_len(&record, "slot", 1)?;
                    records.push(record);
                }
                Some(Tag::SlotStatus) => {
                    expect_len(&record, "slot_status", 1)?;
                    records.push(record);
                }
                _ => records.push(record),
            }
        }

        Ok(Self {
            command: command.ok_or(ProtocolError::MissingRecord("command"))?,
            response_code,
            records,
        })
    }
}

fn expect_len(record: &TlvRecord, name: &'static str, len: usize) -> Result<()> {
    if record.value.len() != len {
        return Err(ProtocolError::InvalidRecord {
            record: name,
            reason: format!("expected {len} bytes, got {}", record.value.len()),
        });
    }
    Ok(())
}

fn read_u16(record: &TlvRecord, name: &'static str) -> Result<u16> {
    expect_len(record, name, 2)?;
    Ok(u16::from_be_bytes([record.value[0], record.value[1]]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_keeps_all_fields() {
        let msg = Message::response(CommandCode::Diagnostics, ResponseCode::Success)
            .with_terminal_id("T-0042")
            .with_start_marker("boot-7")
            .with_diagnostic("temp", "41")
            .with_diagnostic("flag", "");

        let decoded = Message::from_payload(msg.to_payload().unwrap()).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.terminal_id().as_deref(), Some("T-0042"));
        assert_eq!(decoded.start_marker().as_deref(), Some("boot-7"));
        assert_eq!(
            decoded.diagnostics(),
            vec![
                ("temp".to_string(), "41".to_string()),
                ("flag".to_string(), String::new())
            ]
        );
    }

    #[test]
    fn test_repeated_versions() {
        let msg = Message::response(CommandCode::ReadVersions, ResponseCode::Success)
            .with_version("fw=1.2.3")
            .with_version("sam=0.9");
        assert_eq!(msg.versions(), vec!["fw=1.2.3", "sam=0.9"]);
    }

    #[test]
    fn test_missing_command_record() {
        let payload = Bytes::from_static(&[0x03, 0x01, 0x00]);
        assert!(matches!(
            Message::from_payload(payload),
            Err(ProtocolError::MissingRecord("command"))
        ));
    }

    #[test]
    fn test_wrong_size_slot_record() {
        let payload = Bytes::from_static(&[0x01, 0x02, 0x01, 0x01, 0x03, 0x02, 0x00, 0x01]);
        assert!(matches!(
            Message::from_payload(payload),
            Err(ProtocolError::InvalidRecord { record: "slot", .. })
        ));
    }

    #[test]
    fn test_validate_response() {
        assert!(
            Message::response(CommandCode::SamAtr, ResponseCode::Success)
                .validate_response()
                .is_ok()
        );
        assert!(matches!(
            Message::response(CommandCode::SamAtr, ResponseCode::SlotEmpty).validate_response(),
            Err(ProtocolError::Rejected {
                code: ResponseCode::SlotEmpty,
                ..
            })
        ));
        assert!(matches!(
            Message::request(CommandCode::SamAtr).validate_response(),
            Err(ProtocolError::NotAResponse(CommandCode::SamAtr))
        ));
    }

    #[test]
    fn test_correlation_key_uses_slot() {
        let a = Message::request(CommandCode::SamAtr).with_slot(0);
        let b = Message::response(CommandCode::SamAtr, ResponseCode::Success).with_slot(0);
        let c = Message::request(CommandCode::SamAtr).with_slot(1);
        assert_eq!(a.correlation_key(), b.correlation_key());
        assert_ne!(a.correlation_key(), c.correlation_key());
    }

    #[test]
    fn test_require_apdu() {
        let msg = Message::response(CommandCode::SamApdu, ResponseCode::Success);
        assert!(matches!(
            msg.require_apdu(),
            Err(ProtocolError::MissingRecord("apdu"))
        ));
    }
}

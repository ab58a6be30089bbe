//! Command and response codes.
//!
//! Command codes are carried in the mandatory `0x01` record of every
//! message. Requests and their responses use the same command code; a
//! response is distinguished by the presence of a `0x02` response code.
//!
//! # Command Categories
//!
//! ## Application
//! - `Diagnostics` (0x0001): keepalive; the response carries terminal id,
//!   start marker and diagnostic entries
//! - `ReadVersions` (0x0002): firmware component versions
//!
//! ## SAM (transit only)
//! - `SamAtr` (0x0101): answer-to-reset of one slot
//! - `SamSlotStatus` (0x0102): operational status of one slot
//! - `SamApdu` (0x0103): APDU exchange with the module in one slot
//!
//! ## Contactless card
//! - `CardApdu` (0x0201): APDU exchange with the card on the antenna
//!
//! ```
//! use cardterm_protocol::CommandCode;
//!
//! let cmd = CommandCode::from_u16(0x0103);
//! assert_eq!(cmd, CommandCode::SamApdu);
//! assert_eq!(cmd.as_u16(), 0x0103);
//! assert_eq!(CommandCode::from_u16(0x7777), CommandCode::Unknown(0x7777));
//! ```

use std::fmt;

/// Command code of a request/response pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandCode {
    Diagnostics,
    ReadVersions,
    SamAtr,
    SamSlotStatus,
    SamApdu,
    CardApdu,
    /// A command this implementation does not know. Kept for logging.
    Unknown(u16),
}

impl CommandCode {
    pub fn from_u16(code: u16) -> Self {
        match code {
            0x0001 => CommandCode::Diagnostics,
            0x0002 => CommandCode::ReadVersions,
            0x0101 => CommandCode::SamAtr,
            0x0102 => CommandCode::SamSlotStatus,
            0x0103 => CommandCode::SamApdu,
            0x0201 => CommandCode::CardApdu,
            other => CommandCode::Unknown(other),
        }
    }

    pub fn as_u16(&self) -> u16 {
        match self {
            CommandCode::Diagnostics => 0x0001,
            CommandCode::ReadVersions => 0x0002,
            CommandCode::SamAtr => 0x0101,
            CommandCode::SamSlotStatus => 0x0102,
            CommandCode::SamApdu => 0x0103,
            CommandCode::CardApdu => 0x0201,
            CommandCode::Unknown(code) => *code,
        }
    }

    /// Human-readable name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            CommandCode::Diagnostics => "diagnostics",
            CommandCode::ReadVersions => "read_versions",
            CommandCode::SamAtr => "sam_atr",
            CommandCode::SamSlotStatus => "sam_slot_status",
            CommandCode::SamApdu => "sam_apdu",
            CommandCode::CardApdu => "card_apdu",
            CommandCode::Unknown(_) => "unknown",
        }
    }

    /// Whether requests for this command are addressed to a SAM slot.
    pub fn is_slot_addressed(&self) -> bool {
        matches!(
            self,
            CommandCode::SamAtr | CommandCode::SamSlotStatus | CommandCode::SamApdu
        )
    }
}

impl fmt::Display for CommandCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}(0x{:04X})", self.name(), self.as_u16())
    }
}

/// Application-level result carried in the `0x02` record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseCode {
    Success,
    UnknownCommand,
    SlotEmpty,
    Busy,
    InternalError,
    Other(u16),
}

impl ResponseCode {
    pub fn from_u16(code: u16) -> Self {
        match code {
            0x0000 => ResponseCode::Success,
            0x0001 => ResponseCode::UnknownCommand,
            0x0002 => ResponseCode::SlotEmpty,
            0x0003 => ResponseCode::Busy,
            0x00FF => ResponseCode::InternalError,
            other => ResponseCode::Other(other),
        }
    }

    pub fn as_u16(&self) -> u16 {
        match self {
            ResponseCode::Success => 0x0000,
            ResponseCode::UnknownCommand => 0x0001,
            ResponseCode::SlotEmpty => 0x0002,
            ResponseCode::Busy => 0x0003,
            ResponseCode::InternalError => 0x00FF,
            ResponseCode::Other(code) => *code,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ResponseCode::Success)
    }
}

impl fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ResponseCode::Success => write!(f, "success"),
            ResponseCode::UnknownCommand => write!(f, "unknown command"),
            ResponseCode::SlotEmpty => write!(f, "slot empty"),
            ResponseCode::Busy => write!(f, "busy"),
            ResponseCode::InternalError => write!(f, "internal error"),
            ResponseCode::Other(code) => write!(f, "code 0x{code:04X}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0x0001, CommandCode::Diagnostics)]
    #[case(0x0002, CommandCode::ReadVersions)]
    #[case(0x0101, CommandCode::SamAtr)]
    #[case(0x0102, CommandCode::SamSlotStatus)]
    #[case(0x0103, CommandCode::SamApdu)]
    #[case(0x0201, CommandCode::CardApdu)]
    fn test_command_code_mapping(#[case] raw: u16, #[case] expected: CommandCode) {
        assert_eq!(CommandCode::from_u16(raw), expected);
        assert_eq!(expected.as_u16(), raw);
    }

    #[test]
    fn test_unknown_command_keeps_value() {
        let cmd = CommandCode::from_u16(0xBEEF);
        assert_eq!(cmd, CommandCode::Unknown(0xBEEF));
        assert_eq!(cmd.as_u16(), 0xBEEF);
        assert_eq!(cmd.to_string(), "unknown(0xBEEF)");
    }

    #[test]
    fn test_slot_addressed_commands() {
        assert!(CommandCode::SamApdu.is_slot_addressed());
        assert!(CommandCode::SamAtr.is_slot_addressed());
        assert!(!CommandCode::CardApdu.is_slot_addressed());
        assert!(!CommandCode::Diagnostics.is_slot_addressed());
    }

    #[test]
    fn test_response_code() {
        assert!(ResponseCode::from_u16(0).is_success());
        assert_eq!(ResponseCode::from_u16(2), ResponseCode::SlotEmpty);
        assert!(!ResponseCode::Other(0x1234).is_success());
        assert_eq!(ResponseCode::Other(0x1234).to_string(), "code 0x1234");
    }
}

//! Emulated contactless card with one application of short-id files.

use std::collections::BTreeMap;

use cardterm_core::constants::SW_SUCCESS;

use crate::apdu::ApduResponse;
use crate::simulator::sam::{SW_CONDITIONS_NOT_SATISFIED, SW_FILE_NOT_FOUND, SW_INS_NOT_SUPPORTED};

pub const SW_WRONG_OFFSET: u16 = 0x6B00;

#[derive(Debug, Clone)]
pub struct CardEmulator {
    pub aid: Vec<u8>,
    pub files: BTreeMap<u8, Vec<u8>>,
    selected: bool,
    reads: u32,
}

impl Default for CardEmulator {
    /// The default card schema's application: an 8-byte card number in
    /// SFI 1 and a zero-padded holder name in SFI 2.
    fn default() -> Self {
        let mut holder = b"JANE DOE".to_vec();
        holder.resize(16, 0x00);
        let files = BTreeMap::from([
            (1, vec![0x60, 0x12, 0x34, 0x56, 0x78, 0x90, 0x12, 0x34]),
            (2, holder),
        ]);
        Self {
            aid: vec![0xA0, 0x00, 0x00, 0x04, 0x04, 0x01, 0x25],
            files,
            selected: false,
            reads: 0,
        }
    }
}

impl CardEmulator {
    pub fn reads(&self) -> u32 {
        self.reads
    }

    /// Forget the selection, as on a new tap.
    pub fn reset(&mut self) {
        self.selected = false;
    }

    pub fn process(&mut self, apdu: &[u8]) -> Vec<u8> {
        let response = match apdu {
            [0x00, 0xA4, 0x04, 0x00, _, aid @ ..] => {
                self.selected = aid == self.aid.as_slice();
                if self.selected {
                    status(SW_SUCCESS)
                } else {
                    status(SW_FILE_NOT_FOUND)
                }
            }
            [0x00, 0xB0, p1, offset, length] if p1 & 0x80 != 0 => {
                self.read_binary(p1 & 0x1F, *offset as usize, *length as usize)
            }
            _ => status(SW_INS_NOT_SUPPORTED),
        };
        response.to_bytes()
    }

    fn read_binary(&mut self, sfi: u8, offset: usize, length: usize) -> ApduResponse {
        if !self.selected {
            return status(SW_CONDITIONS_NOT_SATISFIED);
        }
        let Some(file) = self.files.get(&sfi) else {
            return status(SW_FILE_NOT_FOUND);
        };
        if offset > file.len() {
            return status(SW_WRONG_OFFSET);
        }
        self.reads += 1;
        let end = (offset + length).min(file.len());
        ApduResponse {
            data: file[offset..end].to_vec(),
            sw: SW_SUCCESS,
        }
    }
}

fn status(sw: u16) -> ApduResponse {
    ApduResponse { data: Vec::new(), sw }
}

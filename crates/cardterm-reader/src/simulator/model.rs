//! What the emulated terminal answers, independent of transport.

use std::collections::HashMap;

use cardterm_core::SubProtocol;
use cardterm_core::constants::MAX_SAM_SLOTS;
use cardterm_protocol::{CommandCode, Message, ResponseCode};
use tracing::trace;

use crate::config::SamSettings;
use crate::simulator::card::CardEmulator;
use crate::simulator::sam::SamEmulator;

/// ATR of the emulated SAM; starts with the default signature.
pub const DEFAULT_SAM_ATR: [u8; 8] = [0x3B, 0x8F, 0x80, 0x01, 0x80, 0x4F, 0x0C, 0xA0];

/// Terminal state machine shared by the TCP simulator and unit tests.
#[derive(Debug)]
pub struct TerminalModel {
    pub terminal_id: String,
    pub start_marker: String,
    pub versions: Vec<String>,
    /// ATR per slot; empty means no module.
    pub atrs: [Vec<u8>; MAX_SAM_SLOTS as usize],
    pub slot_status: [u8; MAX_SAM_SLOTS as usize],
    /// Slots whose ATR requests go unanswered.
    pub silent_atr_slots: Vec<u8>,
    pub transit_keepalive: bool,
    pub ifsf_keepalive: bool,
    pub sam: SamEmulator,
    pub card: CardEmulator,
    requests: HashMap<(SubProtocol, CommandCode), u32>,
}

impl TerminalModel {
    pub fn new(sam: &SamSettings) -> Self {
        let mut atrs: [Vec<u8>; MAX_SAM_SLOTS as usize] = Default::default();
        atrs[0] = DEFAULT_SAM_ATR.to_vec();
        Self {
            terminal_id: "TERM-0001".to_string(),
            start_marker: "boot-1".to_string(),
            versions: vec!["fw=2.4.1".to_string(), "sam=1.0".to_string()],
            atrs,
            slot_status: [0x00; MAX_SAM_SLOTS as usize],
            silent_atr_slots: Vec::new(),
            transit_keepalive: true,
            ifsf_keepalive: true,
            sam: SamEmulator::new(sam),
            card: CardEmulator::default(),
            requests: HashMap::new(),
        }
    }

    /// Requests of `command` seen on `protocol`.
    pub fn requests(&self, protocol: SubProtocol, command: CommandCode) -> u32 {
        self.requests.get(&(protocol, command)).copied().unwrap_or_default()
    }

    /// Answer one request, or `None` to stay silent.
    pub fn answer(&mut self, protocol: SubProtocol, request: &Message) -> Option<Message> {
        *self.requests.entry((protocol, request.command)).or_default() += 1;
        trace!(protocol = %protocol, command = %request.command, "Terminal model request");

        let command = request.command;
        let response = |code| Message::response(command, code);
        let on_transit = protocol == SubProtocol::Transit;

        match command {
            CommandCode::Diagnostics => {
                let enabled = if on_transit {
                    self.transit_keepalive
                } else {
                    self.ifsf_keepalive
                };
                enabled.then(|| {
                    response(ResponseCode::Success)
                        .with_terminal_id(&self.terminal_id)
                        .with_start_marker(&self.start_marker)
                        .with_diagnostic("temperature", "41")
                })
            }
            CommandCode::ReadVersions if on_transit => {
                let message = self
                    .versions
                    .iter()
                    .fold(response(ResponseCode::Success), |m, v| m.with_version(v));
                Some(message)
            }
            CommandCode::SamAtr if on_transit => {
                let slot = request.slot()?;
                if self.silent_atr_slots.contains(&slot) {
                    return None;
                }
                let atr = self.atrs.get(slot as usize)?.clone();
                Some(response(ResponseCode::Success).with_slot(slot).with_atr(atr))
            }
            CommandCode::SamSlotStatus if on_transit => {
                let slot = request.slot()?;
                let status = *self.slot_status.get(slot as usize)?;
                Some(response(ResponseCode::Success).with_slot(slot).with_slot_status(status))
            }
            CommandCode::SamApdu if on_transit => {
                let slot = request.slot()?;
                if self.atrs.get(slot as usize).is_none_or(|atr| atr.is_empty()) {
                    return Some(response(ResponseCode::SlotEmpty).with_slot(slot));
                }
                let apdu = self.sam.process(request.apdu()?);
                Some(response(ResponseCode::Success).with_slot(slot).with_apdu(apdu))
            }
            CommandCode::CardApdu if !on_transit => {
                let apdu = self.card.process(request.apdu()?);
                Some(response(ResponseCode::Success).with_apdu(apdu))
            }
            _ => Some(response(ResponseCode::UnknownCommand)),
        }
    }
}

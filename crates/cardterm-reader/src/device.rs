//! Reader device aggregate.
//!
//! [`ReaderDevice`] owns both connection apps, the SAM module handle and
//! the bring-up state. It is owned by the runtime task; nothing else
//! mutates it. Changes are announced on a broadcast bus in the order they
//! happen.

use std::collections::VecDeque;
use std::time::Instant;

use cardterm_core::constants::MAX_SAM_SLOTS;
use cardterm_core::{SlotIndex, SubProtocol};
use cardterm_network::ConnectionApp;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::auth::AuthState;
use crate::error::{ReaderError, Result};
use crate::init::InitState;
use crate::sam::SamModule;

/// Bring-up transitions kept for diagnostics.
const MAX_HISTORY_SIZE: usize = 64;

const EVENT_BUS_CAPACITY: usize = 128;

/// Device-level change notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    InitStateChanged { from: InitState, to: InitState },
    AuthStateChanged { from: AuthState, to: AuthState },
    SamDetected(SlotIndex),
    UnlockChanged(bool),
}

/// One recorded bring-up transition.
#[derive(Debug, Clone, Copy)]
pub struct InitTransition {
    pub from: InitState,
    pub to: InitState,
    pub timestamp: Instant,
}

#[derive(Debug)]
pub struct ReaderDevice {
    init_state: InitState,
    state_entered_at: Instant,
    history: VecDeque<InitTransition>,
    found_sam_type: Option<Vec<u8>>,
    extra_delay: bool,
    versions: Vec<String>,
    // Survives re-init so a changed ATR can be told apart from a re-read.
    last_atrs: [Option<Vec<u8>>; MAX_SAM_SLOTS as usize],
    pub transit: ConnectionApp,
    pub ifsf: ConnectionApp,
    pub sam: SamModule,
    events: broadcast::Sender<DeviceEvent>,
}

impl Default for ReaderDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl ReaderDevice {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self {
            init_state: InitState::Starting,
            state_entered_at: Instant::now(),
            history: VecDeque::with_capacity(MAX_HISTORY_SIZE),
            found_sam_type: None,
            extra_delay: false,
            versions: Vec::new(),
            last_atrs: Default::default(),
            transit: ConnectionApp::new(SubProtocol::Transit),
            ifsf: ConnectionApp::new(SubProtocol::Ifsf),
            sam: SamModule::new(),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.events.subscribe()
    }

    pub(crate) fn event_sender(&self) -> broadcast::Sender<DeviceEvent> {
        self.events.clone()
    }

    pub(crate) fn emit(&self, event: DeviceEvent) {
        let _ = self.events.send(event);
    }

    pub fn app(&self, protocol: SubProtocol) -> &ConnectionApp {
        match protocol {
            SubProtocol::Transit => &self.transit,
            SubProtocol::Ifsf => &self.ifsf,
        }
    }

    pub fn app_mut(&mut self, protocol: SubProtocol) -> &mut ConnectionApp {
        match protocol {
            SubProtocol::Transit => &mut self.transit,
            SubProtocol::Ifsf => &mut self.ifsf,
        }
    }

    pub fn init_state(&self) -> InitState {
        self.init_state
    }

    /// Move to `to`, which must be the next state or `Starting`.
    ///
    /// # Errors
    /// `InvalidTransition` for any other target.
    pub fn set_init_state(&mut self, to: InitState) -> Result<()> {
        let from = self.init_state;
        if !from.can_transition_to(&to) {
            return Err(ReaderError::InvalidTransition {
                from: from.to_string(),
                to: to.to_string(),
            });
        }

        let now = Instant::now();
        info!(
            from = %from,
            to = %to,
            in_state_ms = now.duration_since(self.state_entered_at).as_millis() as u64,
            "Init state transition"
        );

        if self.history.len() >= MAX_HISTORY_SIZE {
            self.history.pop_front();
        }
        self.history.push_back(InitTransition {
            from,
            to,
            timestamp: now,
        });
        self.init_state = to;
        self.state_entered_at = now;
        self.emit(DeviceEvent::InitStateChanged { from, to });
        Ok(())
    }

    pub fn history(&self) -> &VecDeque<InitTransition> {
        &self.history
    }

    pub fn extra_delay(&self) -> bool {
        self.extra_delay
    }

    pub fn set_extra_delay(&mut self, extra_delay: bool) {
        if self.extra_delay != extra_delay {
            debug!(extra_delay, "Extra delay flag updated");
            self.extra_delay = extra_delay;
        }
    }

    pub fn found_sam_type(&self) -> Option<&[u8]> {
        self.found_sam_type.as_deref()
    }

    pub fn set_found_sam_type(&mut self, sam_type: Option<Vec<u8>>) {
        self.found_sam_type = sam_type;
    }

    pub fn versions(&self) -> &[String] {
        &self.versions
    }

    pub fn set_versions(&mut self, versions: Vec<String>) {
        self.versions = versions;
    }

    /// Record the ATR read from `slot`. Returns `true` if it differs from
    /// the previous reading of that slot, including across re-inits.
    pub fn record_atr(&mut self, slot: SlotIndex, atr: &[u8]) -> bool {
        let previous = &mut self.last_atrs[slot.as_u8() as usize];
        let changed = previous.as_deref() != Some(atr);
        *previous = Some(atr.to_vec());
        changed
    }
}

//! Reader bring-up state machine.
//!
//! ```text
//! STARTING → TRANSIT_TCP_CONNECTION → TRANSIT_APP_ALIVE → TRANSIT_READING_VERSIONS
//!   → TRANSIT_SAM_SLOT_POLLING_ATR → TRANSIT_SAM_SLOT_POLLING_STATUS
//!   → IFSF_TCP_CONNECTION → IFSF_APP_ALIVE → DONE
//! ```
//!
//! The machine only ever advances one step, or falls back to `STARTING`
//! with a full local reset. Each check either advances because the
//! precondition already holds, or sends one request and waits for its
//! success response. Checks run at most once per `response timeout +
//! margin`; an answered request or an immediate transition schedules the
//! next check for the following tick.
//!
//! Response callbacks carry the generation they were issued in. A reset
//! bumps the generation, so answers to requests from before the reset are
//! ignored.

use std::fmt;
use std::time::Instant;

use cardterm_core::constants::{MAX_SAM_SLOTS, MAX_SLOT_POLL_ATTEMPTS};
use cardterm_core::{SlotIndex, SubProtocol, to_hex};
use cardterm_protocol::{CommandCode, Message};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::auth;
use crate::context::ReaderContext;
use crate::device::DeviceEvent;
use crate::liveness;

/// Bring-up states, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InitState {
    Starting,
    TransitTcpConnection,
    TransitAppAlive,
    TransitReadingVersions,
    TransitSamSlotPollingAtr,
    TransitSamSlotPollingStatus,
    IfsfTcpConnection,
    IfsfAppAlive,
    Done,
}

impl InitState {
    pub const ALL: [InitState; 9] = [
        InitState::Starting,
        InitState::TransitTcpConnection,
        InitState::TransitAppAlive,
        InitState::TransitReadingVersions,
        InitState::TransitSamSlotPollingAtr,
        InitState::TransitSamSlotPollingStatus,
        InitState::IfsfTcpConnection,
        InitState::IfsfAppAlive,
        InitState::Done,
    ];

    pub fn next(self) -> Option<InitState> {
        let index = Self::ALL.iter().position(|s| *s == self)?;
        Self::ALL.get(index + 1).copied()
    }

    /// One step forward, or a reset to `Starting`.
    ///
    /// ```
    /// use cardterm_reader::InitState;
    ///
    /// assert!(InitState::Starting.can_transition_to(&InitState::TransitTcpConnection));
    /// assert!(InitState::IfsfAppAlive.can_transition_to(&InitState::Starting));
    /// assert!(!InitState::Starting.can_transition_to(&InitState::Done));
    /// ```
    pub fn can_transition_to(&self, target: &InitState) -> bool {
        *target == InitState::Starting || self.next() == Some(*target)
    }
}

impl fmt::Display for InitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InitState::Starting => "STARTING",
            InitState::TransitTcpConnection => "TRANSIT_TCP_CONNECTION",
            InitState::TransitAppAlive => "TRANSIT_APP_ALIVE",
            InitState::TransitReadingVersions => "TRANSIT_READING_VERSIONS",
            InitState::TransitSamSlotPollingAtr => "TRANSIT_SAM_SLOT_POLLING_ATR",
            InitState::TransitSamSlotPollingStatus => "TRANSIT_SAM_SLOT_POLLING_STATUS",
            InitState::IfsfTcpConnection => "IFSF_TCP_CONNECTION",
            InitState::IfsfAppAlive => "IFSF_APP_ALIVE",
            InitState::Done => "DONE",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct SlotPoll {
    answered: bool,
    misses: u8,
}

/// Per-slot progress of one polling pass.
#[derive(Debug, Clone, Default)]
pub struct SlotPolls([SlotPoll; MAX_SAM_SLOTS as usize]);

impl SlotPolls {
    /// First slot neither answered nor given up on.
    pub fn next_pending(&self) -> Option<SlotIndex> {
        SlotIndex::all().find(|slot| {
            let poll = self.0[slot.as_u8() as usize];
            !poll.answered && poll.misses < MAX_SLOT_POLL_ATTEMPTS
        })
    }

    pub fn is_complete(&self) -> bool {
        self.next_pending().is_none()
    }

    fn answered(&mut self, slot: SlotIndex) {
        self.0[slot.as_u8() as usize].answered = true;
    }

    /// Returns `true` if the slot is now given up on.
    fn missed(&mut self, slot: SlotIndex) -> bool {
        let poll = &mut self.0[slot.as_u8() as usize];
        poll.misses += 1;
        poll.misses >= MAX_SLOT_POLL_ATTEMPTS
    }
}

/// Local bring-up bookkeeping, rebuilt on every reset.
#[derive(Debug, Clone, Default)]
pub struct InitTracker {
    next_check: Option<Instant>,
    versions_received: bool,
    atr_polls: SlotPolls,
    status_polls: SlotPolls,
    grace_until: Option<Instant>,
    generation: u64,
}

impl InitTracker {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn versions_received(&self) -> bool {
        self.versions_received
    }

    pub fn atr_polls(&self) -> &SlotPolls {
        &self.atr_polls
    }

    pub fn status_polls(&self) -> &SlotPolls {
        &self.status_polls
    }
}

/// Run the bring-up check if it is due.
pub fn tick(ctx: &mut ReaderContext, now: Instant) {
    if ctx.device.init_state() == InitState::Done {
        return;
    }
    if ctx.init.next_check.is_some_and(|at| now < at) {
        return;
    }
    ctx.init.next_check = Some(now + ctx.settings.timing.check_period());
    check(ctx, now);
}

/// Let the next tick run the check regardless of the period.
pub fn request_prompt_check(ctx: &mut ReaderContext) {
    ctx.init.next_check = None;
}

fn check(ctx: &mut ReaderContext, now: Instant) {
    match ctx.device.init_state() {
        InitState::Starting => advance(ctx),
        InitState::TransitTcpConnection => {
            if ctx.device.transit.is_connected() {
                advance(ctx);
            }
        }
        InitState::TransitAppAlive => check_app_alive(ctx, SubProtocol::Transit, now),
        InitState::TransitReadingVersions => check_versions(ctx, now),
        InitState::TransitSamSlotPollingAtr => poll_atr(ctx, now),
        InitState::TransitSamSlotPollingStatus => poll_status(ctx, now),
        InitState::IfsfTcpConnection => {
            if ctx.device.ifsf.is_connected() {
                advance(ctx);
            }
        }
        InitState::IfsfAppAlive => check_app_alive(ctx, SubProtocol::Ifsf, now),
        InitState::Done => {}
    }
}

fn advance(ctx: &mut ReaderContext) {
    let Some(to) = ctx.device.init_state().next() else {
        return;
    };
    match ctx.device.set_init_state(to) {
        Ok(()) => request_prompt_check(ctx),
        Err(e) => warn!(error = %e, "Init transition refused"),
    }
}

/// Full local reset and transition to `Starting`.
pub fn enter_starting(ctx: &mut ReaderContext, reason: &str, extra_delay: bool) {
    warn!(
        reason,
        from = %ctx.device.init_state(),
        extra_delay,
        "Full device re-init"
    );

    let generation = ctx.init.generation.wrapping_add(1);
    ctx.init = InitTracker {
        generation,
        ..InitTracker::default()
    };

    // Before the SAM reset: restart needs the auth state it interrupts.
    auth::restart(ctx, reason);

    let was_unlocked = ctx.device.sam.is_unlocked();
    ctx.device.sam.reset();
    if was_unlocked {
        ctx.device.emit(DeviceEvent::UnlockChanged(false));
    }
    ctx.device.set_versions(Vec::new());
    if extra_delay {
        ctx.device.set_extra_delay(true);
    }

    if let Err(e) = ctx.device.set_init_state(InitState::Starting) {
        warn!(error = %e, "Reset to STARTING refused");
    }
}

/// Transit keepalives stopped being answered.
pub fn on_transit_liveness_lost(ctx: &mut ReaderContext) {
    if ctx.device.init_state() != InitState::Done {
        enter_starting(ctx, "transit application stopped responding", true);
    }
}

/// The transit start marker changed under a live socket.
pub fn on_transit_restart_detected(ctx: &mut ReaderContext) {
    enter_starting(ctx, "transit device restart detected", true);
}

fn send_init_request(
    ctx: &mut ReaderContext,
    protocol: SubProtocol,
    request: Message,
    now: Instant,
    handler: impl FnOnce(&mut ReaderContext, Option<Message>) + Send + 'static,
) {
    let generation = ctx.init.generation;
    let deadline = now + ctx.settings.timing.response_timeout();
    let command = request.command;
    let result = ctx.send_request(
        protocol,
        request,
        deadline,
        Box::new(move |ctx: &mut ReaderContext, _request, response| {
            if ctx.init.generation != generation {
                debug!(command = %command, "Ignoring response from before re-init");
                return;
            }
            handler(ctx, response);
        }),
    );
    if let Err(e) = result {
        debug!(protocol = %protocol, command = %command, error = %e, "Init request not sent");
    }
}

fn check_app_alive(ctx: &mut ReaderContext, protocol: SubProtocol, now: Instant) {
    if ctx.device.app(protocol).is_app_alive() {
        advance(ctx);
    } else if ctx.device.app(protocol).is_connected() {
        liveness::send_keepalive(ctx, protocol, now);
    }
}

fn check_versions(ctx: &mut ReaderContext, now: Instant) {
    if ctx.init.versions_received {
        advance(ctx);
        return;
    }
    send_init_request(
        ctx,
        SubProtocol::Transit,
        Message::request(CommandCode::ReadVersions),
        now,
        |ctx, response| match response {
            Some(response) => {
                let versions = response.versions();
                info!(versions = ?versions, "Device versions received");
                ctx.device.set_versions(versions);
                ctx.init.versions_received = true;
                request_prompt_check(ctx);
            }
            None => warn!("No versions response, will retry"),
        },
    );
}

fn poll_atr(ctx: &mut ReaderContext, now: Instant) {
    if ctx.device.extra_delay() {
        let grace = ctx.settings.timing.post_reboot_grace();
        let until = *ctx.init.grace_until.get_or_insert(now + grace);
        if now < until {
            debug!(
                remaining_ms = until.duration_since(now).as_millis() as u64,
                "Waiting out post-reboot grace before ATR polling"
            );
            return;
        }
        info!("Post-reboot grace elapsed");
        ctx.device.set_extra_delay(false);
        ctx.init.grace_until = None;
    }

    let Some(slot) = ctx.init.atr_polls.next_pending() else {
        if !ctx.device.sam.is_detected() {
            let message = format!(
                "no slot presented an ATR matching {}",
                to_hex(&ctx.settings.sam.atr_signature)
            );
            error!(error = %message, "SAM detection failed");
            ctx.device.sam.set_detection_error(message);
        }
        advance(ctx);
        return;
    };

    send_init_request(
        ctx,
        SubProtocol::Transit,
        Message::request(CommandCode::SamAtr).with_slot(slot.as_u8()),
        now,
        move |ctx, response| match response {
            Some(response) => {
                ctx.init.atr_polls.answered(slot);
                let atr = response.atr().map(|b| b.to_vec()).unwrap_or_default();
                on_atr(ctx, slot, atr);
                request_prompt_check(ctx);
            }
            None => {
                if ctx.init.atr_polls.missed(slot) {
                    warn!(slot = %slot, "Giving up on ATR of slot");
                }
            }
        },
    );
}

fn on_atr(ctx: &mut ReaderContext, slot: SlotIndex, atr: Vec<u8>) {
    debug!(slot = %slot, atr = %to_hex(&atr), "ATR received");

    if ctx.device.record_atr(slot, &atr) && ctx.device.found_sam_type().is_some() {
        info!(slot = %slot, "ATR changed, clearing found SAM type");
        ctx.device.set_found_sam_type(None);
    }

    let supported = !atr.is_empty() && ctx.settings.sam.matches_atr(&atr);
    ctx.device.sam.set_atr(slot, atr);

    if supported {
        if ctx.device.sam.is_detected() {
            debug!(slot = %slot, "Additional supported SAM ignored");
        } else {
            info!(slot = %slot, "Supported SAM detected");
            ctx.device.sam.set_detected(slot);
            ctx.device.emit(DeviceEvent::SamDetected(slot));
        }
    }
}

fn poll_status(ctx: &mut ReaderContext, now: Instant) {
    let Some(slot) = ctx.init.status_polls.next_pending() else {
        info!(
            detected_slot = ?ctx.device.sam.detected_slot().map(|s| s.as_u8()),
            status = ?ctx.device.sam.operational_status(),
            "SAM slot polling complete"
        );
        advance(ctx);
        return;
    };

    send_init_request(
        ctx,
        SubProtocol::Transit,
        Message::request(CommandCode::SamSlotStatus).with_slot(slot.as_u8()),
        now,
        move |ctx, response| match response {
            Some(response) => {
                ctx.init.status_polls.answered(slot);
                let status = response.slot_status();
                if status.is_none() {
                    warn!(slot = %slot, "Slot status response without status record");
                }
                debug!(slot = %slot, status = ?status, "Slot status received");
                ctx.device.sam.set_status(slot, status);
                request_prompt_check(ctx);
            }
            None => {
                if ctx.init.status_polls.missed(slot) {
                    warn!(slot = %slot, "Giving up on status of slot");
                }
            }
        },
    );
}

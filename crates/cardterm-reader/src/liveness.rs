//! Application keepalive per sub-protocol.
//!
//! A DIAGNOSTICS request doubles as the keepalive. A success response marks
//! the application alive and refreshes the terminal id and diagnostics; a
//! transit response whose start marker changed means the device rebooted
//! under a live socket. `keepalive_max_misses` consecutive unanswered
//! keepalives mark the application dead.

use std::time::Instant;

use cardterm_core::SubProtocol;
use cardterm_protocol::{CommandCode, CorrelationKey, Message};
use tracing::{debug, warn};

use crate::context::ReaderContext;
use crate::init;

#[derive(Debug, Clone, Copy, Default)]
pub struct Keepalive {
    next_due: Option<Instant>,
    misses: u32,
}

impl Keepalive {
    pub fn misses(&self) -> u32 {
        self.misses
    }
}

#[derive(Debug, Clone, Default)]
pub struct Liveness {
    transit: Keepalive,
    ifsf: Keepalive,
}

impl Liveness {
    pub fn get(&self, protocol: SubProtocol) -> &Keepalive {
        match protocol {
            SubProtocol::Transit => &self.transit,
            SubProtocol::Ifsf => &self.ifsf,
        }
    }

    fn get_mut(&mut self, protocol: SubProtocol) -> &mut Keepalive {
        match protocol {
            SubProtocol::Transit => &mut self.transit,
            SubProtocol::Ifsf => &mut self.ifsf,
        }
    }

    /// Forget the schedule and miss count, e.g. on (re)connect.
    pub fn reset(&mut self, protocol: SubProtocol) {
        *self.get_mut(protocol) = Keepalive::default();
    }
}

/// Send a keepalive on every connected sub-protocol that is due.
pub fn tick(ctx: &mut ReaderContext, now: Instant) {
    for protocol in SubProtocol::ALL {
        if !ctx.device.app(protocol).is_connected() {
            continue;
        }
        if ctx.liveness.get(protocol).next_due.is_some_and(|due| now < due) {
            continue;
        }
        send_keepalive(ctx, protocol, now);
    }
}

/// Send one keepalive now. Returns `false` if one is already in flight or
/// the link refused it.
pub fn send_keepalive(ctx: &mut ReaderContext, protocol: SubProtocol, now: Instant) -> bool {
    let key = CorrelationKey::new(CommandCode::Diagnostics, None);
    if ctx.is_pending(protocol, &key) {
        return false;
    }

    ctx.liveness.get_mut(protocol).next_due = Some(now + ctx.settings.timing.keepalive_interval());
    let deadline = now + ctx.settings.timing.response_timeout();
    let result = ctx.send_request(
        protocol,
        Message::request(CommandCode::Diagnostics),
        deadline,
        Box::new(move |ctx: &mut ReaderContext, _request, response| match response {
            Some(response) => on_answered(ctx, protocol, response),
            None => on_missed(ctx, protocol),
        }),
    );
    match result {
        Ok(_) => true,
        Err(e) => {
            debug!(protocol = %protocol, error = %e, "Keepalive not sent");
            false
        }
    }
}

fn on_answered(ctx: &mut ReaderContext, protocol: SubProtocol, response: Message) {
    ctx.liveness.get_mut(protocol).misses = 0;

    let app = ctx.device.app_mut(protocol);
    let became_alive = app.set_app_alive(true);
    if let Some(terminal_id) = response.terminal_id() {
        app.set_terminal_id(Some(terminal_id));
    }
    app.record_diagnostics(response.diagnostics());
    let restarted = response
        .start_marker()
        .is_some_and(|marker| app.observe_start_marker(marker));

    if protocol == SubProtocol::Transit && restarted {
        init::on_transit_restart_detected(ctx);
    } else if became_alive {
        init::request_prompt_check(ctx);
    }
}

fn on_missed(ctx: &mut ReaderContext, protocol: SubProtocol) {
    if !ctx.device.app(protocol).is_connected() {
        return;
    }
    let max_misses = ctx.settings.timing.keepalive_max_misses;
    let keepalive = ctx.liveness.get_mut(protocol);
    keepalive.misses += 1;
    let misses = keepalive.misses;
    warn!(protocol = %protocol, misses, max_misses, "Keepalive unanswered");

    if misses < max_misses {
        return;
    }
    if ctx.device.app_mut(protocol).set_app_alive(false) && protocol == SubProtocol::Transit {
        init::on_transit_liveness_lost(ctx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::init::InitState;
    use crate::testkit::Rig;

    #[test]
    fn test_answered_keepalive_marks_app_alive() {
        let mut rig = Rig::new();
        rig.connect_both();
        rig.run_keepalive(SubProtocol::Ifsf);

        let ifsf = &rig.ctx.device.ifsf;
        assert!(ifsf.is_app_alive());
        assert_eq!(ifsf.terminal_id(), Some(rig.terminal.terminal_id.as_str()));
        assert!(!ifsf.diagnostics().is_empty());
        assert!(!rig.ctx.device.transit.is_app_alive());
    }

    #[test]
    fn test_keepalive_not_resent_while_pending() {
        let mut rig = Rig::new();
        rig.connect_both();
        rig.hold_transit(CommandCode::Diagnostics);

        let now = rig.now();
        assert!(send_keepalive(&mut rig.ctx, SubProtocol::Transit, now));
        assert!(!send_keepalive(&mut rig.ctx, SubProtocol::Transit, now));
    }

    #[test]
    fn test_single_miss_keeps_app_alive() {
        let mut rig = Rig::new();
        rig.bring_up();
        rig.hold_transit(CommandCode::Diagnostics);

        let now = rig.now();
        send_keepalive(&mut rig.ctx, SubProtocol::Transit, now);
        rig.pump();
        rig.advance_time(rig.ctx.settings.timing.response_timeout());
        rig.ctx.expire_requests(rig.now());

        assert_eq!(rig.ctx.liveness.get(SubProtocol::Transit).misses(), 1);
        assert!(rig.ctx.device.transit.is_app_alive());

        rig.unhold_transit(CommandCode::Diagnostics);
        rig.run_keepalive(SubProtocol::Transit);
        assert_eq!(rig.ctx.liveness.get(SubProtocol::Transit).misses(), 0);
    }

    #[test]
    fn test_ifsf_liveness_loss_does_not_reset() {
        let mut rig = Rig::new();
        rig.bring_up();
        rig.terminal.ifsf_keepalive = false;

        for _ in 0..rig.ctx.settings.timing.keepalive_max_misses * 4 {
            rig.advance_time(rig.ctx.settings.timing.response_timeout());
            rig.tick();
        }

        assert!(!rig.ctx.device.ifsf.is_app_alive());
        assert!(rig.ctx.device.ifsf.is_connected());
        assert_eq!(rig.ctx.device.init_state(), InitState::Done);
    }

    #[test]
    fn test_no_keepalive_without_link() {
        let mut rig = Rig::new();
        rig.tick();
        assert_eq!(rig.sent_transit(CommandCode::Diagnostics), 0);
    }
}

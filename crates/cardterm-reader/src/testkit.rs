//! Deterministic harness for the state machines.
//!
//! [`Rig`] drives a [`ReaderContext`] directly: a manual clock, in-memory
//! outbound channels standing in for the link tasks, and a
//! [`TerminalModel`] answering synchronously. Requests can be held back to
//! play out timeouts and late answers.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use cardterm_core::SubProtocol;
use cardterm_network::LinkEvent;
use cardterm_protocol::{CommandCode, Message};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::auth::AuthState;
use crate::config::{ReaderConfig, ReaderSettings};
use crate::context::ReaderContext;
use crate::init::InitState;
use crate::liveness;
use crate::simulator::TerminalModel;

const MAX_STEPS: usize = 2000;

pub(crate) fn settings() -> ReaderSettings {
    ReaderConfig::default().resolve().unwrap()
}

fn peer() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 9100))
}

pub(crate) struct Rig {
    pub ctx: ReaderContext,
    pub terminal: TerminalModel,
    now: Instant,
    transit_out: Option<mpsc::UnboundedReceiver<Message>>,
    ifsf_out: Option<mpsc::UnboundedReceiver<Message>>,
    sent: Vec<(SubProtocol, Message)>,
    held: Vec<(SubProtocol, Message)>,
    hold_commands: Vec<(SubProtocol, CommandCode)>,
    hold_ins: Vec<u8>,
    transit_silent: bool,
}

impl Rig {
    pub fn new() -> Self {
        let settings = settings();
        let terminal = TerminalModel::new(&settings.sam);
        Self {
            ctx: ReaderContext::new(settings),
            terminal,
            now: Instant::now(),
            transit_out: None,
            ifsf_out: None,
            sent: Vec::new(),
            held: Vec::new(),
            hold_commands: Vec::new(),
            hold_ins: Vec::new(),
            transit_silent: false,
        }
    }

    pub fn now(&self) -> Instant {
        self.now
    }

    pub fn advance_time(&mut self, by: Duration) {
        self.now += by;
    }

    fn outbound(&mut self, protocol: SubProtocol) -> &mut Option<mpsc::UnboundedReceiver<Message>> {
        match protocol {
            SubProtocol::Transit => &mut self.transit_out,
            SubProtocol::Ifsf => &mut self.ifsf_out,
        }
    }

    pub fn connect(&mut self, protocol: SubProtocol) {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.outbound(protocol) = Some(rx);
        self.ctx.on_link_event(
            protocol,
            LinkEvent::Connected {
                peer: peer(),
                outbound: tx,
            },
        );
    }

    pub fn connect_both(&mut self) {
        for protocol in SubProtocol::ALL {
            if !self.ctx.device.app(protocol).is_connected() {
                self.connect(protocol);
            }
        }
    }

    pub fn disconnect(&mut self, protocol: SubProtocol) {
        *self.outbound(protocol) = None;
        self.held.retain(|(p, _)| *p != protocol);
        self.ctx.on_link_event(
            protocol,
            LinkEvent::Disconnected {
                reason: "closed by test".to_string(),
            },
        );
    }

    pub fn tick(&mut self) {
        self.ctx.tick(self.now);
        self.pump();
    }

    fn step(&mut self) {
        self.advance_time(self.ctx.settings.timing.tick_interval());
        self.tick();
    }

    /// Deliver everything sent so far, answering what is not held.
    pub fn pump(&mut self) {
        loop {
            let mut outgoing = Vec::new();
            for protocol in SubProtocol::ALL {
                if let Some(rx) = self.outbound(protocol) {
                    while let Ok(message) = rx.try_recv() {
                        outgoing.push((protocol, message));
                    }
                }
            }
            if outgoing.is_empty() {
                return;
            }
            for (protocol, request) in outgoing {
                self.sent.push((protocol, request.clone()));
                if self.holds(protocol, &request) {
                    self.held.push((protocol, request));
                    continue;
                }
                if let Some(reply) = self.terminal.answer(protocol, &request) {
                    self.ctx.on_link_event(protocol, LinkEvent::Message(reply));
                }
            }
        }
    }

    fn holds(&self, protocol: SubProtocol, request: &Message) -> bool {
        if protocol == SubProtocol::Transit && self.transit_silent {
            return true;
        }
        if self.hold_commands.contains(&(protocol, request.command)) {
            return true;
        }
        request.command == CommandCode::SamApdu && sam_ins(request).is_some_and(|ins| self.hold_ins.contains(&ins))
    }

    pub fn advance_to(&mut self, target: InitState) {
        for _ in 0..MAX_STEPS {
            if self.ctx.device.init_state() == target {
                return;
            }
            self.step();
        }
        panic!(
            "init never reached {target}, stuck in {}",
            self.ctx.device.init_state()
        );
    }

    pub fn bring_up(&mut self) {
        self.connect_both();
        self.advance_to(InitState::Done);
    }

    pub fn run_until(&mut self, mut done: impl FnMut(&ReaderContext) -> bool) {
        for _ in 0..MAX_STEPS {
            if done(&self.ctx) {
                return;
            }
            self.step();
        }
        panic!("condition never met: {:?}", self.ctx);
    }

    pub fn run_until_auth_finished(&mut self) -> AuthState {
        self.run_until(|ctx| ctx.device.sam.auth_state().is_finished());
        self.ctx.device.sam.auth_state()
    }

    /// Advance the clock by `duration` in tick-sized steps.
    pub fn run_for(&mut self, duration: Duration) {
        let until = self.now + duration;
        while self.now < until {
            self.step();
        }
    }

    pub fn sent_transit(&self, command: CommandCode) -> usize {
        self.sent
            .iter()
            .filter(|(p, m)| *p == SubProtocol::Transit && m.command == command)
            .count()
    }

    /// SAM APDUs sent with instruction byte `ins`.
    pub fn sent_sam_ins(&self, ins: u8) -> usize {
        self.sent
            .iter()
            .filter(|(_, m)| m.command == CommandCode::SamApdu && sam_ins(m) == Some(ins))
            .count()
    }

    pub fn hold_transit(&mut self, command: CommandCode) {
        self.hold_commands.push((SubProtocol::Transit, command));
    }

    /// Stop holding `command` and forget what was held.
    pub fn unhold_transit(&mut self, command: CommandCode) {
        self.hold_commands.retain(|held| *held != (SubProtocol::Transit, command));
        self.held.retain(|(p, m)| !(*p == SubProtocol::Transit && m.command == command));
    }

    pub fn hold_sam_ins(&mut self, ins: u8) {
        self.hold_ins.push(ins);
    }

    pub fn take_transit_request(&mut self, command: CommandCode) -> Message {
        let index = self
            .held
            .iter()
            .position(|(p, m)| *p == SubProtocol::Transit && m.command == command)
            .unwrap_or_else(|| panic!("no held {command} request"));
        self.held.remove(index).1
    }

    pub fn take_sam_apdu(&mut self, ins: u8) -> Message {
        let index = self
            .held
            .iter()
            .position(|(_, m)| m.command == CommandCode::SamApdu && sam_ins(m) == Some(ins))
            .unwrap_or_else(|| panic!("no held SAM APDU with INS {ins:02X}"));
        self.held.remove(index).1
    }

    /// Let the terminal answer `request` now.
    pub fn reply_transit(&mut self, request: &Message) {
        if let Some(reply) = self.terminal.answer(SubProtocol::Transit, request) {
            self.ctx.on_link_event(SubProtocol::Transit, LinkEvent::Message(reply));
        }
        self.pump();
    }

    /// Silence the transit application until the reader declares it dead.
    pub fn starve_transit_keepalives(&mut self) {
        self.transit_silent = true;
        self.run_until(|ctx| !ctx.device.transit.is_app_alive());
    }

    pub fn run_keepalive(&mut self, protocol: SubProtocol) {
        liveness::send_keepalive(&mut self.ctx, protocol, self.now);
        self.pump();
    }
}

fn sam_ins(request: &Message) -> Option<u8> {
    request.apdu().and_then(|apdu| apdu.get(1).copied())
}

/// In-memory link event streams answered by a shared [`TerminalModel`].
///
/// Must be called from within a tokio runtime.
pub(crate) fn spawn_loopback() -> (
    mpsc::Receiver<LinkEvent>,
    mpsc::Receiver<LinkEvent>,
    Arc<Mutex<TerminalModel>>,
) {
    let model = Arc::new(Mutex::new(TerminalModel::new(&settings().sam)));
    let transit = loopback_link(SubProtocol::Transit, model.clone());
    let ifsf = loopback_link(SubProtocol::Ifsf, model.clone());
    (transit, ifsf, model)
}

fn loopback_link(protocol: SubProtocol, model: Arc<Mutex<TerminalModel>>) -> mpsc::Receiver<LinkEvent> {
    let (events_tx, events_rx) = mpsc::channel(64);
    tokio::spawn(async move {
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
        let connected = LinkEvent::Connected {
            peer: peer(),
            outbound: outbound_tx,
        };
        if events_tx.send(connected).await.is_err() {
            return;
        }
        while let Some(request) = outbound_rx.recv().await {
            let reply = model.lock().answer(protocol, &request);
            if let Some(reply) = reply
                && events_tx.send(LinkEvent::Message(reply)).await.is_err()
            {
                return;
            }
        }
    });
    events_rx
}

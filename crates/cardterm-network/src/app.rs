//! Per-sub-protocol connection state.
//!
//! A [`ConnectionApp`] is owned by the reader runtime and updated from
//! link events and keepalive results. It never touches the socket
//! directly; sending goes through the outbound sender handed over by the
//! link task on connect.
//!
//! Every setter reports whether the value actually changed and emits a
//! [`ConnectionEvent`] only in that case, so subscribers see one event per
//! transition in the order the transitions happened.

use std::collections::BTreeMap;
use std::net::SocketAddr;

use cardterm_core::SubProtocol;
use cardterm_protocol::Message;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::error::{LinkError, Result};

const EVENT_BUS_CAPACITY: usize = 64;

/// What changed on a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionChange {
    Connected(bool),
    AppAlive(bool),
    TerminalId(Option<String>),
    /// The start marker changed while the socket stayed up.
    RestartDetected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionEvent {
    pub protocol: SubProtocol,
    pub change: ConnectionChange,
}

#[derive(Debug)]
pub struct ConnectionApp {
    protocol: SubProtocol,
    peer: Option<SocketAddr>,
    connected: bool,
    app_alive: bool,
    terminal_id: Option<String>,
    last_start_marker: Option<String>,
    diagnostics: BTreeMap<String, String>,
    outbound: Option<mpsc::UnboundedSender<Message>>,
    events: broadcast::Sender<ConnectionEvent>,
}

impl ConnectionApp {
    pub fn new(protocol: SubProtocol) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self {
            protocol,
            peer: None,
            connected: false,
            app_alive: false,
            terminal_id: None,
            last_start_marker: None,
            diagnostics: BTreeMap::new(),
            outbound: None,
            events,
        }
    }

    pub fn protocol(&self) -> SubProtocol {
        self.protocol
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn is_app_alive(&self) -> bool {
        self.app_alive
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn terminal_id(&self) -> Option<&str> {
        self.terminal_id.as_deref()
    }

    pub fn last_start_marker(&self) -> Option<&str> {
        self.last_start_marker.as_deref()
    }

    pub fn diagnostics(&self) -> &BTreeMap<String, String> {
        &self.diagnostics
    }

    fn emit(&self, change: ConnectionChange) {
        // No subscribers is fine.
        let _ = self.events.send(ConnectionEvent {
            protocol: self.protocol,
            change,
        });
    }

    /// Record a new link and its outbound sender.
    pub fn on_connected(&mut self, peer: SocketAddr, outbound: mpsc::UnboundedSender<Message>) {
        info!(protocol = %self.protocol, peer = %peer, "Connection app online");
        self.peer = Some(peer);
        self.outbound = Some(outbound);
        if !self.connected {
            self.connected = true;
            self.emit(ConnectionChange::Connected(true));
        }
    }

    /// Forget the link and every value learned over it.
    pub fn on_disconnected(&mut self) {
        self.outbound = None;
        self.peer = None;
        self.last_start_marker = None;
        self.diagnostics.clear();
        self.set_terminal_id(None);
        self.set_app_alive(false);
        if self.connected {
            info!(protocol = %self.protocol, "Connection app offline");
            self.connected = false;
            self.emit(ConnectionChange::Connected(false));
        }
    }

    /// Returns `true` if liveness changed.
    pub fn set_app_alive(&mut self, alive: bool) -> bool {
        if self.app_alive == alive {
            return false;
        }
        if alive {
            info!(protocol = %self.protocol, "Application alive");
        } else {
            warn!(protocol = %self.protocol, "Application no longer alive");
        }
        self.app_alive = alive;
        self.emit(ConnectionChange::AppAlive(alive));
        true
    }

    /// Returns `true` if the terminal id changed.
    pub fn set_terminal_id(&mut self, terminal_id: Option<String>) -> bool {
        if self.terminal_id == terminal_id {
            return false;
        }
        debug!(protocol = %self.protocol, terminal_id = ?terminal_id, "Terminal id updated");
        self.terminal_id = terminal_id.clone();
        self.emit(ConnectionChange::TerminalId(terminal_id));
        true
    }

    /// Record the device start marker.
    ///
    /// Returns `true` if the marker differs from the previous one seen on
    /// this same connection, i.e. the device rebooted without dropping the
    /// socket.
    pub fn observe_start_marker(&mut self, marker: String) -> bool {
        let restarted = self
            .last_start_marker
            .as_ref()
            .is_some_and(|previous| *previous != marker);
        self.last_start_marker = Some(marker);
        if restarted {
            warn!(protocol = %self.protocol, "Start marker changed - device restart detected");
            self.emit(ConnectionChange::RestartDetected);
        }
        restarted
    }

    pub fn record_diagnostics(&mut self, entries: impl IntoIterator<Item = (String, String)>) {
        self.diagnostics.extend(entries);
    }

    /// Queue a message on the current link.
    ///
    /// # Errors
    /// `NotConnected` without a link, `ConnectionLost` if the link task
    /// already went away.
    pub fn send(&self, message: Message) -> Result<()> {
        let outbound = self.outbound.as_ref().ok_or(LinkError::NotConnected)?;
        outbound
            .send(message)
            .map_err(|_| LinkError::ConnectionLost("link task closed".to_string()))
    }
}

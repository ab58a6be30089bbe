//! Long-lived TCP link for one sub-protocol.
//!
//! The link task owns the socket. It connects with a timeout, wraps the
//! stream in a [`FrameCodec`] and then multiplexes two directions:
//!
//! - decoded frames are forwarded as [`LinkEvent::Message`];
//! - messages pushed into the per-connection outbound sender are encoded
//!   and written.
//!
//! When the socket drops, the task reports [`LinkEvent::Disconnected`],
//! waits `reconnect_delay_ms` and tries again, until the event receiver is
//! dropped or the [`LinkHandle`] is shut down.
//!
//! A malformed payload with a sound length prefix is logged and dropped.
//! A framing error (oversized length) ends the connection.

use std::net::SocketAddr;
use std::time::Duration;

use cardterm_core::SubProtocol;
use cardterm_core::constants::{
    DEFAULT_CONNECT_TIMEOUT_MS, DEFAULT_MAX_FRAME_SIZE, DEFAULT_RECONNECT_DELAY_MS,
};
use cardterm_protocol::{DecodedFrame, FrameCodec, Message};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tracing::{debug, info, trace, warn};

use crate::error::{LinkError, Result};

/// Capacity of the event channel towards the runtime.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Connection settings for one sub-protocol.
///
/// # Example
///
/// ```
/// use cardterm_network::LinkConfig;
///
/// let config: LinkConfig = serde_json::from_str(r#"{ "addr": "10.0.0.5:9100" }"#).unwrap();
/// assert_eq!(config.addr.port(), 9100);
/// assert_eq!(config.connect_timeout_ms, 3000);
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Terminal address for this sub-protocol
    pub addr: SocketAddr,

    /// Timeout for each connect attempt
    pub connect_timeout_ms: u64,

    /// Pause between a disconnect (or failed attempt) and the next attempt
    pub reconnect_delay_ms: u64,

    /// Largest payload accepted from the terminal
    pub max_frame_size: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([127, 0, 0, 1], 9100)),
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            reconnect_delay_ms: DEFAULT_RECONNECT_DELAY_MS,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

/// Notifications from a link task, delivered in socket order.
#[derive(Debug)]
pub enum LinkEvent {
    /// A connection is up; messages sent into `outbound` go to the peer.
    Connected {
        peer: SocketAddr,
        outbound: mpsc::UnboundedSender<Message>,
    },
    /// A structurally valid message arrived.
    Message(Message),
    /// The connection is gone; a reconnect is scheduled.
    Disconnected { reason: String },
}

/// Handle to a running link task. Dropping it stops the task.
#[derive(Debug)]
pub struct LinkHandle {
    protocol: SubProtocol,
    task: JoinHandle<()>,
}

impl LinkHandle {
    pub fn protocol(&self) -> SubProtocol {
        self.protocol
    }

    /// Stop the link task. The socket, if any, is closed.
    pub fn shutdown(&self) {
        self.task.abort();
    }
}

impl Drop for LinkHandle {
    fn drop(&mut self) {
        if !self.task.is_finished() {
            debug!(protocol = %self.protocol, "Link handle dropped - stopping link task");
            self.task.abort();
        }
    }
}

/// Spawn the link task for one sub-protocol.
///
/// Must be called from within a tokio runtime.
pub fn spawn_link(
    protocol: SubProtocol,
    config: LinkConfig,
) -> (LinkHandle, mpsc::Receiver<LinkEvent>) {
    let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let task = tokio::spawn(run_link(protocol, config, events_tx));
    (LinkHandle { protocol, task }, events_rx)
}

async fn run_link(protocol: SubProtocol, config: LinkConfig, events: mpsc::Sender<LinkEvent>) {
    let reconnect_delay = Duration::from_millis(config.reconnect_delay_ms);

    loop {
        match connect(protocol, &config).await {
            Ok(stream) => {
                let peer = stream.peer_addr().unwrap_or(config.addr);
                let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

                if events
                    .send(LinkEvent::Connected {
                        peer,
                        outbound: outbound_tx,
                    })
                    .await
                    .is_err()
                {
                    return;
                }

                let codec = FrameCodec::for_protocol(protocol)
                    .with_max_frame_size(config.max_frame_size);
                let reason = serve_connection(
                    protocol,
                    Framed::new(stream, codec),
                    outbound_rx,
                    &events,
                )
                .await;

                info!(protocol = %protocol, peer = %peer, reason = %reason, "Link disconnected");
                if events
                    .send(LinkEvent::Disconnected { reason })
                    .await
                    .is_err()
                {
                    return;
                }
            }
            Err(e) => {
                debug!(protocol = %protocol, addr = %config.addr, error = %e, "Connect attempt failed");
            }
        }

        if events.is_closed() {
            return;
        }
        tokio::time::sleep(reconnect_delay).await;
    }
}

async fn connect(protocol: SubProtocol, config: &LinkConfig) -> Result<TcpStream> {
    let timeout = Duration::from_millis(config.connect_timeout_ms);
    debug!(protocol = %protocol, addr = %config.addr, "Connecting");

    let stream = match tokio::time::timeout(timeout, TcpStream::connect(config.addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => return Err(e.into()),
        Err(_) => return Err(LinkError::ConnectionTimeout(config.connect_timeout_ms)),
    };

    // Small request/response exchanges; do not let Nagle batch them.
    if let Err(e) = stream.set_nodelay(true) {
        warn!(protocol = %protocol, error = %e, "Failed to set TCP_NODELAY");
    }

    info!(protocol = %protocol, addr = %config.addr, "Link connected");
    Ok(stream)
}

/// Pump one connection until it fails. Returns the disconnect reason.
async fn serve_connection(
    protocol: SubProtocol,
    mut framed: Framed<TcpStream, FrameCodec>,
    mut outbound: mpsc::UnboundedReceiver<Message>,
    events: &mpsc::Sender<LinkEvent>,
) -> String {
    let mut outbound_open = true;

    loop {
        tokio::select! {
            frame = framed.next() => match frame {
                Some(Ok(DecodedFrame::Message(message))) => {
                    trace!(
                        protocol = %protocol,
                        command = %message.command,
                        response_code = ?message.response_code,
                        records = message.records.len(),
                        "Received message"
                    );
                    if events.send(LinkEvent::Message(message)).await.is_err() {
                        return "runtime stopped".to_string();
                    }
                }
                Some(Ok(DecodedFrame::Malformed { length, error })) => {
                    warn!(
                        protocol = %protocol,
                        length,
                        error = %error,
                        "Dropping malformed frame (connection maintained)"
                    );
                }
                Some(Err(e)) => return format!("framing error: {e}"),
                None => return "closed by peer".to_string(),
            },

            message = outbound.recv(), if outbound_open => match message {
                Some(message) => {
                    trace!(
                        protocol = %protocol,
                        command = %message.command,
                        slot = ?message.slot(),
                        "Sending message"
                    );
                    if let Err(e) = framed.send(message).await {
                        return format!("send failed: {e}");
                    }
                }
                None => outbound_open = false,
            },
        }
    }
}

//! TCP terminal simulator serving both sub-protocols.
//!
//! One listener per sub-protocol, each connection framed with the matching
//! [`FrameCodec`] and answered from a shared [`TerminalModel`]. Used by the
//! demo binary and the integration tests.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use cardterm_core::SubProtocol;
use cardterm_protocol::{DecodedFrame, FrameCodec};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::config::SamSettings;
use crate::simulator::model::TerminalModel;

pub struct TerminalSimulator {
    transit_addr: SocketAddr,
    ifsf_addr: SocketAddr,
    model: Arc<Mutex<TerminalModel>>,
    kick: watch::Sender<u64>,
    listeners: Vec<JoinHandle<()>>,
}

impl TerminalSimulator {
    /// Listen on ephemeral localhost ports.
    pub async fn start(sam: &SamSettings) -> io::Result<Self> {
        let any = SocketAddr::from(([127, 0, 0, 1], 0));
        Self::bind(any, any, sam).await
    }

    pub async fn bind(transit: SocketAddr, ifsf: SocketAddr, sam: &SamSettings) -> io::Result<Self> {
        let transit = TcpListener::bind(transit).await?;
        let ifsf = TcpListener::bind(ifsf).await?;
        let transit_addr = transit.local_addr()?;
        let ifsf_addr = ifsf.local_addr()?;

        let model = Arc::new(Mutex::new(TerminalModel::new(sam)));
        let (kick, _) = watch::channel(0u64);
        let listeners = vec![
            tokio::spawn(accept_loop(SubProtocol::Transit, transit, model.clone(), kick.subscribe())),
            tokio::spawn(accept_loop(SubProtocol::Ifsf, ifsf, model.clone(), kick.subscribe())),
        ];

        info!(transit = %transit_addr, ifsf = %ifsf_addr, "Terminal simulator listening");
        Ok(Self {
            transit_addr,
            ifsf_addr,
            model,
            kick,
            listeners,
        })
    }

    pub fn transit_addr(&self) -> SocketAddr {
        self.transit_addr
    }

    pub fn ifsf_addr(&self) -> SocketAddr {
        self.ifsf_addr
    }

    pub fn addr(&self, protocol: SubProtocol) -> SocketAddr {
        match protocol {
            SubProtocol::Transit => self.transit_addr,
            SubProtocol::Ifsf => self.ifsf_addr,
        }
    }

    /// Change terminal behaviour. Applies to the next request.
    pub fn update(&self, f: impl FnOnce(&mut TerminalModel)) {
        f(&mut self.model.lock());
    }

    pub fn inspect<R>(&self, f: impl FnOnce(&TerminalModel) -> R) -> R {
        f(&self.model.lock())
    }

    /// Close every open connection; listeners keep accepting.
    pub fn drop_connections(&self) {
        self.kick.send_modify(|generation| *generation += 1);
    }

    pub fn shutdown(&self) {
        self.drop_connections();
        for listener in &self.listeners {
            listener.abort();
        }
    }
}

impl Drop for TerminalSimulator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn accept_loop(
    protocol: SubProtocol,
    listener: TcpListener,
    model: Arc<Mutex<TerminalModel>>,
    kick: watch::Receiver<u64>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                info!(protocol = %protocol, peer = %peer, "Simulator accepted connection");
                tokio::spawn(serve(protocol, stream, model.clone(), kick.clone()));
            }
            Err(e) => warn!(protocol = %protocol, error = %e, "Simulator accept failed"),
        }
    }
}

async fn serve(
    protocol: SubProtocol,
    stream: TcpStream,
    model: Arc<Mutex<TerminalModel>>,
    mut kick: watch::Receiver<u64>,
) {
    let mut framed = Framed::new(stream, FrameCodec::for_protocol(protocol));
    kick.mark_unchanged();

    loop {
        tokio::select! {
            frame = framed.next() => match frame {
                Some(Ok(DecodedFrame::Message(request))) => {
                    let reply = model.lock().answer(protocol, &request);
                    let Some(reply) = reply else {
                        debug!(protocol = %protocol, command = %request.command, "Simulator stays silent");
                        continue;
                    };
                    if let Err(e) = framed.send(reply).await {
                        warn!(protocol = %protocol, error = %e, "Simulator send failed");
                        break;
                    }
                }
                Some(Ok(DecodedFrame::Malformed { length, error })) => {
                    warn!(protocol = %protocol, length, error = %error, "Simulator dropped malformed frame");
                }
                Some(Err(e)) => {
                    warn!(protocol = %protocol, error = %e, "Simulator framing error");
                    break;
                }
                None => break,
            },
            _ = kick.changed() => {
                info!(protocol = %protocol, "Simulator dropping connection");
                break;
            }
        }
    }
}

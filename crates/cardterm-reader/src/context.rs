//! The explicitly owned reader context.
//!
//! [`ReaderContext`] bundles the device, the state machine trackers and
//! one correlation table per sub-protocol. Every tick, link event and
//! runtime command is applied to it by the runtime task, so tick-driven
//! and response-driven mutation never interleave.

use std::sync::Arc;
use std::time::Instant;

use cardterm_core::SubProtocol;
use cardterm_network::LinkEvent;
use cardterm_protocol::{CorrelationKey, Correlator, Message, ProtocolError, ResponseCallback};
use tracing::{debug, trace, warn};

use crate::auth::{self, AuthMachine};
use crate::config::ReaderSettings;
use crate::crypto::{BlockCipher, TripleDes};
use crate::device::ReaderDevice;
use crate::error::Result;
use crate::init::{self, InitTracker};
use crate::liveness::{self, Liveness};

pub struct ReaderContext {
    pub settings: ReaderSettings,
    pub device: ReaderDevice,
    pub init: InitTracker,
    pub auth: AuthMachine,
    pub liveness: Liveness,
    pub cipher: Arc<dyn BlockCipher>,
    transit_requests: Correlator<ReaderContext>,
    ifsf_requests: Correlator<ReaderContext>,
}

impl ReaderContext {
    pub fn new(settings: ReaderSettings) -> Self {
        Self::with_cipher(settings, Arc::new(TripleDes))
    }

    pub fn with_cipher(settings: ReaderSettings, cipher: Arc<dyn BlockCipher>) -> Self {
        Self {
            settings,
            device: ReaderDevice::new(),
            init: InitTracker::default(),
            auth: AuthMachine::default(),
            liveness: Liveness::default(),
            cipher,
            transit_requests: Correlator::new(),
            ifsf_requests: Correlator::new(),
        }
    }

    fn requests(&self, protocol: SubProtocol) -> &Correlator<ReaderContext> {
        match protocol {
            SubProtocol::Transit => &self.transit_requests,
            SubProtocol::Ifsf => &self.ifsf_requests,
        }
    }

    fn requests_mut(&mut self, protocol: SubProtocol) -> &mut Correlator<ReaderContext> {
        match protocol {
            SubProtocol::Transit => &mut self.transit_requests,
            SubProtocol::Ifsf => &mut self.ifsf_requests,
        }
    }

    pub fn is_pending(&self, protocol: SubProtocol, key: &CorrelationKey) -> bool {
        self.requests(protocol).is_pending(key)
    }

    pub fn pending_count(&self, protocol: SubProtocol) -> usize {
        self.requests(protocol).len()
    }

    /// Send `request` and register `callback` for its response.
    ///
    /// The callback runs exactly once: with the matching success response,
    /// or with `None` when `deadline` passes or the link drops.
    ///
    /// # Errors
    /// `RequestPending` if a request with the same key is outstanding,
    /// `Transport` if the link is down. The callback is dropped unrun.
    pub fn send_request(
        &mut self,
        protocol: SubProtocol,
        request: Message,
        deadline: Instant,
        callback: ResponseCallback<ReaderContext>,
    ) -> Result<CorrelationKey> {
        let key = request.correlation_key();
        if self.is_pending(protocol, &key) {
            return Err(ProtocolError::RequestPending(key).into());
        }
        self.device.app(protocol).send(request.clone())?;
        trace!(protocol = %protocol, key = %key, "Request sent");
        Ok(self.requests_mut(protocol).register(request, deadline, callback)?)
    }

    /// Complete every request whose deadline has passed with no response.
    pub fn expire_requests(&mut self, now: Instant) {
        for protocol in SubProtocol::ALL {
            let expired = self.requests_mut(protocol).take_expired(now);
            for pending in expired {
                warn!(protocol = %protocol, key = %pending.key, "Request timed out");
                pending.complete(self, None);
            }
        }
    }

    /// One scheduler tick.
    pub fn tick(&mut self, now: Instant) {
        self.expire_requests(now);
        liveness::tick(self, now);
        init::tick(self, now);
        auth::tick(self, now);
    }

    pub fn on_link_event(&mut self, protocol: SubProtocol, event: LinkEvent) {
        match event {
            LinkEvent::Connected { peer, outbound } => {
                self.device.app_mut(protocol).on_connected(peer, outbound);
                self.liveness.reset(protocol);
                init::request_prompt_check(self);
            }
            LinkEvent::Message(message) => self.dispatch(protocol, message),
            LinkEvent::Disconnected { reason } => {
                warn!(protocol = %protocol, reason = %reason, "Link lost");
                self.device.app_mut(protocol).on_disconnected();
                self.liveness.reset(protocol);
                let orphaned = self.requests_mut(protocol).drain();
                for pending in orphaned {
                    debug!(protocol = %protocol, key = %pending.key, "Completing request without response");
                    pending.complete(self, None);
                }
                if protocol == SubProtocol::Transit {
                    init::enter_starting(self, "transit link lost", false);
                }
            }
        }
    }

    fn dispatch(&mut self, protocol: SubProtocol, message: Message) {
        if !message.is_response() {
            debug!(protocol = %protocol, command = %message.command, "Dropping unsolicited request");
            return;
        }
        let resolved = self.requests_mut(protocol).resolve(message);
        match resolved {
            Ok((pending, response)) => {
                trace!(protocol = %protocol, key = %pending.key, "Response matched");
                pending.complete(self, Some(response));
            }
            Err(e) => warn!(protocol = %protocol, error = %e, "Dropping response"),
        }
    }
}

impl std::fmt::Debug for ReaderContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReaderContext")
            .field("init_state", &self.device.init_state())
            .field("auth_state", &self.device.sam.auth_state())
            .field("transit_pending", &self.transit_requests.len())
            .field("ifsf_pending", &self.ifsf_requests.len())
            .finish_non_exhaustive()
    }
}

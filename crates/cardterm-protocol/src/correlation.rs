//! Request/response correlation.
//!
//! Every outbound request is registered with a deadline and a one-shot
//! callback. The [`Correlator`] guarantees the callback runs exactly once:
//! with the matched response, with `None` once the deadline passes, or with
//! `None` when the link drops and the table is drained.
//!
//! The correlator is generic over the context `C` handed to callbacks, so
//! the owner of the state being mutated stays explicit. It does not run
//! callbacks itself; [`resolve`](Correlator::resolve),
//! [`take_expired`](Correlator::take_expired) and
//! [`drain`](Correlator::drain) hand back [`PendingRequest`]s that the
//! caller completes once it is free to lend out `&mut C`.

use std::collections::HashMap;
use std::fmt;
use std::time::Instant;

use crate::commands::CommandCode;
use crate::error::{ProtocolError, Result};
use crate::message::Message;

/// Identifies a request/response pair: command code plus slot when present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CorrelationKey {
    pub command: CommandCode,
    pub slot: Option<u8>,
}

impl CorrelationKey {
    pub fn new(command: CommandCode, slot: Option<u8>) -> Self {
        Self { command, slot }
    }
}

impl fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.slot {
            Some(slot) => write!(f, "{}/slot{}", self.command, slot),
            None => write!(f, "{}", self.command),
        }
    }
}

/// Callback invoked with the original request and the response, if any.
pub type ResponseCallback<C> = Box<dyn FnOnce(&mut C, Message, Option<Message>) + Send>;

/// An outstanding request awaiting its response.
pub struct PendingRequest<C> {
    pub key: CorrelationKey,
    pub request: Message,
    pub deadline: Instant,
    callback: ResponseCallback<C>,
}

impl<C> PendingRequest<C> {
    /// Consume the entry and run its callback.
    pub fn complete(self, ctx: &mut C, response: Option<Message>) {
        (self.callback)(ctx, self.request, response);
    }
}

impl<C> fmt::Debug for PendingRequest<C> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("PendingRequest")
            .field("key", &self.key)
            .field("deadline", &self.deadline)
            .finish_non_exhaustive()
    }
}

/// Table of outstanding requests for one sub-protocol.
pub struct Correlator<C> {
    pending: HashMap<CorrelationKey, PendingRequest<C>>,
}

impl<C> Correlator<C> {
    pub fn new() -> Self {
        Self {
            pending: HashMap::new(),
        }
    }

    /// Register an outbound request.
    ///
    /// # Errors
    /// `RequestPending` if a request with the same key is still outstanding.
    pub fn register(
        &mut self,
        request: Message,
        deadline: Instant,
        callback: ResponseCallback<C>,
    ) -> Result<CorrelationKey> {
        let key = request.correlation_key();
        if self.pending.contains_key(&key) {
            return Err(ProtocolError::RequestPending(key));
        }
        self.pending.insert(
            key,
            PendingRequest {
                key,
                request,
                deadline,
                callback,
            },
        );
        Ok(key)
    }

    pub fn is_pending(&self, key: &CorrelationKey) -> bool {
        self.pending.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Match an incoming message against the table.
    ///
    /// A rejected response leaves its request registered so that it
    /// completes with `None` at its deadline.
    ///
    /// # Errors
    /// `NotAResponse`, `Unmatched` or `Rejected`.
    pub fn resolve(&mut self, response: Message) -> Result<(PendingRequest<C>, Message)> {
        if !response.is_response() {
            return Err(ProtocolError::NotAResponse(response.command));
        }
        let key = response.correlation_key();
        if !self.pending.contains_key(&key) {
            return Err(ProtocolError::Unmatched(key));
        }
        response.validate_response()?;

        match self.pending.remove(&key) {
            Some(pending) => Ok((pending, response)),
            None => Err(ProtocolError::Unmatched(key)),
        }
    }

    /// Remove every request whose deadline is at or before `now`.
    pub fn take_expired(&mut self, now: Instant) -> Vec<PendingRequest<C>> {
        let keys: Vec<CorrelationKey> = self
            .pending
            .values()
            .filter(|p| p.deadline <= now)
            .map(|p| p.key)
            .collect();
        keys.iter()
            .filter_map(|k| self.pending.remove(k))
            .collect()
    }

    /// Remove every outstanding request, e.g. after a disconnect.
    pub fn drain(&mut self) -> Vec<PendingRequest<C>> {
        self.pending.drain().map(|(_, p)| p).collect()
    }
}

impl<C> Default for Correlator<C> {
    fn default() -> Self {
        Self::new()
    }
}

//! Session table shared by pollers and the session worker.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{ReaderError, Result};

/// Opaque, random session identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new_random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Pending,
    WaitingForEvent,
    Processing,
    Completed,
    Failed,
}

impl SessionStatus {
    /// Forward-only; any live status may fail.
    pub fn can_transition_to(&self, target: &SessionStatus) -> bool {
        use SessionStatus::*;
        matches!(
            (self, target),
            (Pending, WaitingForEvent)
                | (WaitingForEvent, Processing)
                | (Processing, Completed)
                | (Pending | WaitingForEvent | Processing, Failed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Failed)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionStatus::Pending => "PENDING",
            SessionStatus::WaitingForEvent => "WAITING_FOR_EVENT",
            SessionStatus::Processing => "PROCESSING",
            SessionStatus::Completed => "COMPLETED",
            SessionStatus::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// What pollers see of a session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot<R> {
    pub id: SessionId,
    pub status: SessionStatus,
    pub error_message: Option<String>,
    pub result: Option<R>,
    /// Every status the session went through, oldest first.
    pub history: Vec<SessionStatus>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

struct Entry<P, R> {
    params: P,
    status: SessionStatus,
    error_message: Option<String>,
    result: Option<R>,
    history: Vec<SessionStatus>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    created: Instant,
}

pub struct SessionStore<P, R> {
    name: &'static str,
    sessions: RwLock<HashMap<SessionId, Entry<P, R>>>,
}

impl<P, R> SessionStore<P, R> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Create a `PENDING` session.
    pub fn create(&self, params: P) -> SessionId {
        let id = SessionId::new_random();
        let now = Utc::now();
        self.sessions.write().insert(
            id,
            Entry {
                params,
                status: SessionStatus::Pending,
                error_message: None,
                result: None,
                history: vec![SessionStatus::Pending],
                created_at: now,
                updated_at: now,
                created: Instant::now(),
            },
        );
        info!(store = self.name, session = %id, "Session created");
        id
    }

    /// Move a session to `to`, setting message and result together.
    fn transition(
        &self,
        id: SessionId,
        to: SessionStatus,
        error_message: Option<String>,
        result: Option<R>,
    ) -> Result<()> {
        let mut sessions = self.sessions.write();
        let entry = sessions.get_mut(&id).ok_or(ReaderError::SessionNotFound(id))?;
        if !entry.status.can_transition_to(&to) {
            return Err(ReaderError::InvalidTransition {
                from: entry.status.to_string(),
                to: to.to_string(),
            });
        }
        debug!(store = self.name, session = %id, from = %entry.status, to = %to, "Session transition");
        entry.status = to;
        entry.history.push(to);
        entry.error_message = error_message;
        entry.result = result;
        entry.updated_at = Utc::now();
        Ok(())
    }

    pub fn advance(&self, id: SessionId, to: SessionStatus) -> Result<()> {
        self.transition(id, to, None, None)
    }

    pub fn complete(&self, id: SessionId, result: R) -> Result<()> {
        self.transition(id, SessionStatus::Completed, None, Some(result))?;
        info!(store = self.name, session = %id, "Session completed");
        Ok(())
    }

    pub fn fail(&self, id: SessionId, message: impl Into<String>) -> Result<()> {
        let message = message.into();
        self.transition(id, SessionStatus::Failed, Some(message.clone()), None)?;
        warn!(store = self.name, session = %id, error = %message, "Session failed");
        Ok(())
    }

    /// Fail a session that is still waiting for its card.
    ///
    /// Returns `Ok(false)` once the session is processing or finished; the
    /// operation's side effects cannot be taken back at that point.
    ///
    /// # Errors
    /// `SessionNotFound` for an unknown id.
    pub fn cancel(&self, id: SessionId, message: impl Into<String>) -> Result<bool> {
        let mut sessions = self.sessions.write();
        let entry = sessions.get_mut(&id).ok_or(ReaderError::SessionNotFound(id))?;
        if !matches!(entry.status, SessionStatus::Pending | SessionStatus::WaitingForEvent) {
            return Ok(false);
        }
        let message = message.into();
        debug!(store = self.name, session = %id, from = %entry.status, "Session cancelled");
        entry.status = SessionStatus::Failed;
        entry.history.push(SessionStatus::Failed);
        entry.error_message = Some(message);
        entry.result = None;
        entry.updated_at = Utc::now();
        Ok(true)
    }

    /// Fail the session unless it already finished.
    ///
    /// Returns `Ok(false)` for an already-terminal session.
    ///
    /// # Errors
    /// `SessionNotFound` for an unknown id.
    pub fn fail_unless_terminal(&self, id: SessionId, message: impl Into<String>) -> Result<bool> {
        let status = self.status(id).ok_or(ReaderError::SessionNotFound(id))?;
        if status.is_terminal() {
            return Ok(false);
        }
        match self.fail(id, message) {
            Ok(()) => Ok(true),
            // Finished between the check and the write.
            Err(ReaderError::InvalidTransition { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub fn status(&self, id: SessionId) -> Option<SessionStatus> {
        self.sessions.read().get(&id).map(|entry| entry.status)
    }

    /// Whether any session is not yet terminal.
    pub fn has_active(&self) -> bool {
        self.sessions.read().values().any(|entry| !entry.status.is_terminal())
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn remove(&self, id: SessionId) -> bool {
        self.sessions.write().remove(&id).is_some()
    }

    /// Evict sessions created more than `ttl` before `now`. Returns the
    /// evicted ids.
    pub fn cleanup_at(&self, now: Instant, ttl: Duration) -> Vec<SessionId> {
        let mut sessions = self.sessions.write();
        let mut evicted = Vec::new();
        sessions.retain(|id, entry| {
            if now.saturating_duration_since(entry.created) < ttl {
                return true;
            }
            if !entry.status.is_terminal() {
                warn!(store = self.name, session = %id, status = %entry.status, "Evicting unfinished session");
            }
            evicted.push(*id);
            false
        });
        if !evicted.is_empty() {
            info!(store = self.name, evicted = evicted.len(), "Expired sessions evicted");
        }
        evicted
    }
}

impl<P: Clone, R> SessionStore<P, R> {
    pub fn params(&self, id: SessionId) -> Option<P> {
        self.sessions.read().get(&id).map(|entry| entry.params.clone())
    }
}

impl<P, R: Clone> SessionStore<P, R> {
    pub fn get(&self, id: SessionId) -> Option<SessionSnapshot<R>> {
        self.sessions.read().get(&id).map(|entry| SessionSnapshot {
            id,
            status: entry.status,
            error_message: entry.error_message.clone(),
            result: entry.result.clone(),
            history: entry.history.clone(),
            created_at: entry.created_at,
            updated_at: entry.updated_at,
        })
    }
}

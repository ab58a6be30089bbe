//! Tap-triggered workflows exposed as pollable sessions.

pub mod card_read;
pub mod orchestrator;
pub mod store;
pub mod unlock;
pub mod worker;

pub use card_read::{CardReadOperation, CardReadParams, CardReadResult};
pub use orchestrator::{CancelOutcome, SessionOperation, SessionOrchestrator};
pub use store::{SessionId, SessionSnapshot, SessionStatus, SessionStore};
pub use unlock::{UnlockOperation, UnlockOutcome};
pub use worker::SessionWorker;

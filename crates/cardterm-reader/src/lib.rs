//! Reader terminal driver.
//!
//! This crate drives a payment/transit card-reader terminal over its two
//! TCP sub-protocols, authenticates its secure module (SAM), and exposes
//! tap-triggered workflows (PIN unlock, card read) as pollable sessions.
//!
//! # Architecture
//!
//! ```text
//!  ReaderService ── start_unlock / start_card_read / status
//!       │
//!       ├─ SessionOrchestrator (unlock, card read) ── session worker thread
//!       │         │ RuntimeCommand
//!       ▼         ▼
//!  ReaderRuntime task ── owns ReaderContext
//!       │   ├─ ReaderDevice (init state, SAM module, two ConnectionApps)
//!       │   ├─ init / auth state machines (ticked)
//!       │   └─ one Correlator per sub-protocol
//!       ▼
//!  link tasks (transit, IFSF) ──TCP── terminal
//! ```
//!
//! Everything that mutates reader state runs on the runtime task, so ticks
//! and response callbacks never race. Session workers talk to it through
//! [`RuntimeHandle`].

pub mod apdu;
pub mod auth;
pub mod config;
pub mod context;
pub mod crypto;
pub mod device;
pub mod error;
pub mod init;
pub mod liveness;
pub mod runtime;
pub mod sam;
pub mod service;
pub mod session;
pub mod simulator;
pub mod status;

#[cfg(test)]
pub(crate) mod testkit;

pub use auth::{AuthFailure, AuthState};
pub use config::{ReaderConfig, ReaderSettings};
pub use error::{ReaderError, Result};
pub use init::InitState;
pub use runtime::{RuntimeHandle, spawn_runtime};
pub use service::ReaderService;
pub use session::{CancelOutcome, SessionId, SessionSnapshot, SessionStatus};
pub use status::StatusSnapshot;

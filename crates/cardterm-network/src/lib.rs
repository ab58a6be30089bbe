//! Network layer for the reader terminal.
//!
//! Each sub-protocol gets one long-lived TCP link task and one
//! [`ConnectionApp`] that mirrors its state for the runtime.
//!
//! # Components
//!
//! - **Link task** ([`spawn_link`]): connects, reconnects, frames bytes with
//!   the [`FrameCodec`](cardterm_protocol::FrameCodec) and forwards decoded
//!   messages as [`LinkEvent`]s. It holds no business logic.
//! - **ConnectionApp**: connectivity, application liveness, terminal id and
//!   start marker of one sub-protocol, with a broadcast change stream.
//!
//! ```text
//! reader runtime ──outbound──> link task ──(TCP)──> terminal
//!        ^                         │
//!        └──────── LinkEvent ──────┘
//! ```

mod app;
mod error;
mod link;

pub use app::{ConnectionApp, ConnectionChange, ConnectionEvent};
pub use error::{LinkError, Result};
pub use link::{LinkConfig, LinkEvent, LinkHandle, spawn_link};

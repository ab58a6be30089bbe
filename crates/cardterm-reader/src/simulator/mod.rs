//! Emulated terminal for tests and demos.
//!
//! [`TerminalModel`] holds the answering logic: keepalives, versions, SAM
//! slots backed by a [`SamEmulator`] and a card in the field backed by a
//! [`CardEmulator`]. [`TerminalSimulator`] serves it over TCP.

pub mod card;
pub mod model;
pub mod sam;
pub mod terminal;

pub use card::CardEmulator;
pub use model::{DEFAULT_SAM_ATR, TerminalModel};
pub use sam::{DEFAULT_PIN, SamEmulator, SamStats};
pub use terminal::TerminalSimulator;

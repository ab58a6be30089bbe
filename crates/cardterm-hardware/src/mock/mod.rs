//! Simulated hardware for tests, demos and bench setups without an antenna.

pub mod tap;

pub use tap::{MockTapHandle, MockTapListener};

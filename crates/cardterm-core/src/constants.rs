//! Core constants shared by the card-reader terminal crates.
//!
//! Constants are grouped by concern: framing, SAM/module limits, timing
//! defaults and session lifetime. Timing values are the defaults used by
//! configuration structs; every one of them can be overridden at startup.
//!
//! # Usage
//!
//! ```
//! use cardterm_core::constants::*;
//! use std::time::Duration;
//!
//! assert_eq!(MAX_AUTH_ATTEMPTS, 3);
//! let grace = Duration::from_millis(DEFAULT_POST_REBOOT_GRACE_MS);
//! assert_eq!(grace.as_secs(), 5);
//! ```

// ============================================================================
// Framing
// ============================================================================

/// Size of the length prefix that precedes every frame on both sub-protocols.
pub const LENGTH_PREFIX_SIZE: usize = 2;

/// Default maximum payload size accepted by the frame codec (64 KB).
///
/// Frames announcing a larger payload are treated as a framing error and
/// the link is reset.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024;

// ============================================================================
// SAM / secure module
// ============================================================================

/// Number of SAM slots polled during bring-up.
pub const MAX_SAM_SLOTS: u8 = 4;

/// Number of failed authentications after which the SAM locks permanently.
///
/// The module enforces this itself; the terminal only tracks it so that it
/// can refuse to start an authentication that would be the last one.
pub const MAX_AUTH_ATTEMPTS: u8 = 3;

/// Unanswered ATR or status polls after which a slot is given up on.
pub const MAX_SLOT_POLL_ATTEMPTS: u8 = 3;

/// Length in bytes of the device and terminal random challenges.
pub const CHALLENGE_LENGTH: usize = 8;

/// APDU status word meaning "normal processing".
pub const SW_SUCCESS: u16 = 0x9000;

/// Number of digits in an unlock PIN.
pub const PIN_LENGTH: usize = 6;

// ============================================================================
// Timing defaults (milliseconds)
// ============================================================================

/// Default time to wait for a correlated response before giving up on it.
pub const DEFAULT_RESPONSE_TIMEOUT_MS: u64 = 3000;

/// Margin added to the response timeout to obtain the init check period.
///
/// The init state machine runs its check at most once per
/// `response timeout + margin`, so at most one request is outstanding per
/// cycle.
pub const DEFAULT_CHECK_MARGIN_MS: u64 = 500;

/// Default scheduler tick period.
pub const DEFAULT_TICK_INTERVAL_MS: u64 = 250;

/// Grace period before ATR polling after a silent device reboot.
///
/// Firmware specific: the module subsystem returns spurious errors while it
/// is still coming up.
pub const DEFAULT_POST_REBOOT_GRACE_MS: u64 = 5000;

/// Timeout for each irreversible authentication step, measured from entry.
pub const DEFAULT_IRREVERSIBLE_STEP_TIMEOUT_MS: u64 = 5000;

/// Default period of the diagnostics/keepalive exchange.
pub const DEFAULT_KEEPALIVE_INTERVAL_MS: u64 = 2000;

/// Consecutive unanswered keepalives after which the app is considered dead.
pub const DEFAULT_KEEPALIVE_MAX_MISSES: u32 = 3;

/// Default TCP connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 3000;

/// Default delay between reconnect attempts.
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 1000;

// ============================================================================
// Sessions
// ============================================================================

/// Lifetime of an async operation session before periodic cleanup evicts it.
pub const SESSION_TTL_SECS: u64 = 300;

/// Default period of the session cleanup task.
pub const DEFAULT_SESSION_CLEANUP_INTERVAL_SECS: u64 = 30;

/// Default time a session waits for a card tap before failing.
pub const DEFAULT_TAP_WAIT_TIMEOUT_MS: u64 = 60_000;

//! Hardware abstraction for the contactless antenna of the reader terminal.
//!
//! Card taps are delivered by a [`TapListener`]: a single-shot registration
//! with a detection callback and an error callback. Workflows arm the
//! listener, react to one tap and disarm it again.
//!
//! Two backends exist:
//!
//! - a device listener supplied by the embedding application, and
//! - [`MockTapListener`](mock::MockTapListener), a simulator driven through
//!   its [`MockTapHandle`](mock::MockTapHandle).
//!
//! [`resolve_tap_backend`] picks one according to [`HardwareMode`]. Asking
//! for the device backend without supplying one is an error; there is no
//! silent fallback to the simulator.
//!
//! ```
//! use cardterm_hardware::{CardType, HardwareMode, resolve_tap_backend};
//! use std::sync::Arc;
//!
//! let backend = resolve_tap_backend(HardwareMode::Simulated, None).unwrap();
//! let simulator = backend.simulator.clone().unwrap();
//!
//! backend
//!     .listener
//!     .register(
//!         "demo",
//!         Arc::new(|tap| println!("tapped {}", tap.uid_hex())),
//!         Arc::new(|err| eprintln!("antenna error: {err}")),
//!     )
//!     .unwrap();
//!
//! assert!(simulator.tap(vec![0x04, 0xA1, 0xB2, 0xC3], CardType::MifareDESFire));
//! backend.listener.unregister();
//! ```

pub mod error;
pub mod mock;
pub mod traits;

pub use error::{HardwareError, Result};
pub use traits::{CardTap, CardType, TapCallback, TapErrorCallback, TapListener};

use serde::Deserialize;
use std::sync::Arc;

/// Which tap backend the reader should use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HardwareMode {
    /// The listener supplied by the embedding application.
    Device,
    /// The in-process simulator.
    #[default]
    Simulated,
}

/// The resolved tap backend.
#[derive(Clone)]
pub struct TapBackend {
    pub listener: Arc<dyn TapListener>,
    /// Present only in simulated mode.
    pub simulator: Option<mock::MockTapHandle>,
}

impl std::fmt::Debug for TapBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TapBackend")
            .field("simulated", &self.simulator.is_some())
            .finish()
    }
}

/// Pick the tap backend for `mode`.
///
/// # Errors
/// `HardwareError::Unavailable` if `mode` is `Device` and no device
/// listener was supplied.
pub fn resolve_tap_backend(
    mode: HardwareMode,
    device: Option<Arc<dyn TapListener>>,
) -> Result<TapBackend> {
    match (mode, device) {
        (HardwareMode::Device, Some(listener)) => Ok(TapBackend {
            listener,
            simulator: None,
        }),
        (HardwareMode::Device, None) => Err(HardwareError::unavailable(
            "device mode requested but no tap listener is attached",
        )),
        (HardwareMode::Simulated, _) => {
            let (listener, handle) = mock::MockTapListener::new();
            Ok(TapBackend {
                listener: Arc::new(listener),
                simulator: Some(handle),
            })
        }
    }
}

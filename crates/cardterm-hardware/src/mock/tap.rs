//! Simulated tap listener.
//!
//! The listener and its handle share one registration slot. Tests arm the
//! listener through the [`TapListener`] trait like production code does,
//! then drive taps with [`MockTapHandle::tap`].

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::{
    HardwareError, Result,
    traits::{CardTap, CardType, TapCallback, TapErrorCallback, TapListener},
};

struct Registration {
    source_tag: String,
    on_detected: TapCallback,
    on_error: TapErrorCallback,
}

#[derive(Default)]
struct Shared {
    registration: Option<Registration>,
    delivered: u64,
    ignored: u64,
}

/// Simulated antenna.
///
/// # Examples
///
/// ```
/// use cardterm_hardware::mock::MockTapListener;
/// use cardterm_hardware::{CardType, TapListener};
/// use std::sync::Arc;
/// use std::sync::atomic::{AtomicUsize, Ordering};
///
/// let (listener, handle) = MockTapListener::new();
/// let seen = Arc::new(AtomicUsize::new(0));
/// let counter = seen.clone();
///
/// listener
///     .register(
///         "unlock",
///         Arc::new(move |_tap| {
///             counter.fetch_add(1, Ordering::SeqCst);
///         }),
///         Arc::new(|_err| {}),
///     )
///     .unwrap();
///
/// assert!(handle.tap(vec![1, 2, 3, 4], CardType::MifareDESFire));
/// listener.unregister();
/// assert!(!handle.tap(vec![1, 2, 3, 4], CardType::MifareDESFire));
/// assert_eq!(seen.load(Ordering::SeqCst), 1);
/// ```
pub struct MockTapListener {
    shared: Arc<Mutex<Shared>>,
}

impl MockTapListener {
    /// Create a listener and the handle that drives it.
    pub fn new() -> (Self, MockTapHandle) {
        let shared = Arc::new(Mutex::new(Shared::default()));
        (
            Self {
                shared: shared.clone(),
            },
            MockTapHandle { shared },
        )
    }
}

impl TapListener for MockTapListener {
    fn register(
        &self,
        source_tag: &str,
        on_detected: TapCallback,
        on_error: TapErrorCallback,
    ) -> Result<()> {
        let mut shared = self.shared.lock();
        if let Some(active) = &shared.registration {
            return Err(HardwareError::AlreadyRegistered {
                source_tag: active.source_tag.clone(),
            });
        }
        debug!(source_tag, "Simulated tap listener armed");
        shared.registration = Some(Registration {
            source_tag: source_tag.to_string(),
            on_detected,
            on_error,
        });
        Ok(())
    }

    fn unregister(&self) {
        if let Some(registration) = self.shared.lock().registration.take() {
            debug!(source_tag = %registration.source_tag, "Simulated tap listener disarmed");
        }
    }

    fn registered_by(&self) -> Option<String> {
        self.shared
            .lock()
            .registration
            .as_ref()
            .map(|r| r.source_tag.clone())
    }
}

/// Handle for presenting simulated cards.
#[derive(Clone)]
pub struct MockTapHandle {
    shared: Arc<Mutex<Shared>>,
}

impl MockTapHandle {
    /// Present a card. Returns `false` if nothing was armed.
    ///
    /// An invalid UID is reported through the error callback.
    pub fn tap(&self, uid: Vec<u8>, card_type: CardType) -> bool {
        match CardTap::new(uid, card_type) {
            Ok(tap) => self.present(tap),
            Err(e) => self.fail(e),
        }
    }

    /// Present a fully built tap. Returns `false` if nothing was armed.
    pub fn present(&self, tap: CardTap) -> bool {
        let callback = {
            let mut shared = self.shared.lock();
            match shared.registration.as_ref().map(|r| r.on_detected.clone()) {
                Some(cb) => {
                    shared.delivered += 1;
                    cb
                }
                None => {
                    shared.ignored += 1;
                    trace!(uid = %tap.uid_hex(), "Tap with no listener armed");
                    return false;
                }
            }
        };
        // Outside the lock: the callback may unregister.
        callback(tap);
        true
    }

    /// Report an antenna failure. Returns `false` if nothing was armed.
    pub fn fail(&self, error: HardwareError) -> bool {
        let callback = self
            .shared
            .lock()
            .registration
            .as_ref()
            .map(|r| r.on_error.clone());
        match callback {
            Some(cb) => {
                cb(error);
                true
            }
            None => false,
        }
    }

    pub fn is_armed(&self) -> bool {
        self.shared.lock().registration.is_some()
    }

    /// Taps delivered to a registered callback.
    pub fn delivered_taps(&self) -> u64 {
        self.shared.lock().delivered
    }

    /// Taps presented while nothing was armed.
    pub fn ignored_taps(&self) -> u64 {
        self.shared.lock().ignored
    }
}

impl std::fmt::Debug for MockTapHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockTapHandle")
            .field("armed", &self.is_armed())
            .finish()
    }
}

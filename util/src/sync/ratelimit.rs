use core::{
    fmt,
    sync::atomic::{AtomicUsize, Ordering::*},
};

/// A counter that admits a fixed number of events and then suppresses the
/// rest.
///
/// This is used to throttle log sites that may be hit on every interrupt,
/// such as diagnostics emitted from an idle loop. Unlike a time-based rate
/// limiter, a `RateLimit` never re-opens: once `burst` events have been
/// admitted, every subsequent event is only counted.
///
/// `RateLimit` is always built on `core` atomics (even under `cfg(loom)`) so
/// that it can be placed in a `static` at each call site.
pub struct RateLimit {
    burst: usize,
    seen: AtomicUsize,
}

impl RateLimit {
    /// Returns a new `RateLimit` admitting the first `burst` events.
    #[must_use]
    pub const fn new(burst: usize) -> Self {
        Self {
            burst,
            seen: AtomicUsize::new(0),
        }
    }

    /// Records an event, returning `true` if it should be reported.
    #[inline]
    pub fn allow(&self) -> bool {
        self.seen.fetch_add(1, Relaxed) < self.burst
    }

    /// Returns the total number of events recorded, including suppressed ones.
    #[must_use]
    pub fn seen(&self) -> usize {
        self.seen.load(Relaxed)
    }

    /// Returns the number of events that were suppressed.
    #[must_use]
    pub fn suppressed(&self) -> usize {
        self.seen().saturating_sub(self.burst)
    }
}

impl fmt::Debug for RateLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimit")
            .field("burst", &self.burst)
            .field("seen", &self.seen())
            .finish()
    }
}

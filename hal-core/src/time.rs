//! Timekeeping hardware abstractions.
use crate::CpuId;
use core::{
    fmt,
    ops::{Add, AddAssign, Sub},
    time::Duration,
};

/// A timestamp read from a monotonic [`Clock`], in nanoseconds since an
/// arbitrary epoch (usually boot).
///
/// Instants are stored as a single `u64` so that they can be kept in atomics.
/// [`Instant::MAX`] is reserved to mean "never": it is the expiry of a timer
/// that should not fire at all.
#[derive(Copy, Clone, Eq, PartialEq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct Instant(u64);

/// A hardware clock that returns monotonically non-decreasing timestamps.
///
/// Implementations MUST NOT return a timestamp less than one previously
/// returned, on any CPU.
pub trait Clock {
    /// Returns the current time.
    fn now(&self) -> Instant;

    /// Returns the longest duration the time base may go without being
    /// advanced before the clock source risks wrapping or accumulating
    /// unacceptable drift.
    fn max_deferment(&self) -> Duration;

    /// Returns `true` if the clock source is precise enough to drive
    /// high-resolution timers.
    fn valid_for_highres(&self) -> bool {
        true
    }
}

/// A per-CPU programmable timer interrupt source.
///
/// Each CPU owns one event device, which raises that CPU's timer interrupt
/// when the programmed deadline is reached. Only one deadline is pending per
/// CPU at a time; programming a new deadline replaces the previous one.
pub trait EventDevice {
    /// Programs `cpu`'s event device to fire at `deadline`.
    ///
    /// # Returns
    ///
    /// - `Ok(())` if the deadline was programmed.
    /// - `Err(`[`AlreadyPast`]`)` if `deadline` has already passed, in which
    ///   case nothing was programmed and no interrupt will be raised.
    fn program(&self, cpu: CpuId, deadline: Instant) -> Result<(), AlreadyPast>;

    /// Cancels any pending deadline on `cpu`'s event device.
    fn cancel(&self, cpu: CpuId);

    /// Returns `true` if `cpu`'s event device has a deadline that has not yet
    /// fired.
    ///
    /// A deadline that was programmed successfully but expired before this is
    /// called is reported as not armed.
    fn is_armed(&self, cpu: CpuId) -> bool;

    /// Returns `true` if `cpu`'s event device can be switched to oneshot mode.
    fn oneshot_available(&self, cpu: CpuId) -> bool;
}

/// Error returned by [`EventDevice::program`] when the requested deadline has
/// already passed.
#[derive(Copy, Clone, Debug, Eq, PartialEq, thiserror::Error)]
#[error("timer deadline {deadline} is already in the past")]
pub struct AlreadyPast {
    /// The deadline that could not be programmed.
    pub deadline: Instant,
}

// === impl Instant ===

impl Instant {
    /// The epoch.
    pub const ZERO: Self = Self(0);

    /// The end of time. A timer expiring at `Instant::MAX` never fires.
    pub const MAX: Self = Self(u64::MAX);

    #[must_use]
    pub const fn from_nanos(nanos: u64) -> Self {
        Self(nanos)
    }

    #[must_use]
    pub const fn as_nanos(self) -> u64 {
        self.0
    }

    /// Returns the number of whole microseconds since the epoch.
    #[must_use]
    pub const fn as_micros(self) -> u64 {
        self.0 / 1_000
    }

    /// Returns `true` if this is [`Instant::MAX`].
    #[must_use]
    pub const fn is_never(self) -> bool {
        self.0 == u64::MAX
    }

    /// Returns the amount of time elapsed from `earlier` to `self`, or zero if
    /// `earlier` is later than `self`.
    #[must_use]
    pub fn duration_since(self, earlier: Instant) -> Duration {
        Duration::from_nanos(self.0.saturating_sub(earlier.0))
    }

    /// Returns the amount of time elapsed from `earlier` to `self`, or
    /// [`None`] if `earlier` is later than `self`.
    #[must_use]
    pub fn checked_duration_since(self, earlier: Instant) -> Option<Duration> {
        self.0.checked_sub(earlier.0).map(Duration::from_nanos)
    }

    /// Returns `self + duration`, or [`None`] if the result would reach
    /// [`Instant::MAX`].
    #[must_use]
    pub fn checked_add(self, duration: Duration) -> Option<Instant> {
        let nanos = u64::try_from(duration.as_nanos()).ok()?;
        match self.0.checked_add(nanos) {
            Some(n) if n != u64::MAX => Some(Instant(n)),
            _ => None,
        }
    }

    /// Returns `self + duration`, clamped to [`Instant::MAX`].
    #[must_use]
    pub fn saturating_add(self, duration: Duration) -> Instant {
        self.checked_add(duration).unwrap_or(Instant::MAX)
    }

    /// Returns `self - duration`, clamped to [`Instant::ZERO`].
    #[must_use]
    pub fn saturating_sub(self, duration: Duration) -> Instant {
        let nanos = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);
        Instant(self.0.saturating_sub(nanos))
    }
}

impl Add<Duration> for Instant {
    type Output = Instant;

    /// Saturates at [`Instant::MAX`].
    fn add(self, rhs: Duration) -> Instant {
        self.saturating_add(rhs)
    }
}

impl AddAssign<Duration> for Instant {
    fn add_assign(&mut self, rhs: Duration) {
        *self = *self + rhs;
    }
}

impl Sub<Duration> for Instant {
    type Output = Instant;

    fn sub(self, rhs: Duration) -> Instant {
        self.saturating_sub(rhs)
    }
}

impl Sub<Instant> for Instant {
    type Output = Duration;

    fn sub(self, rhs: Instant) -> Duration {
        self.duration_since(rhs)
    }
}

impl fmt::Debug for Instant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_never() {
            return f.write_str("Instant(never)");
        }
        write!(f, "Instant({}ns)", self.0)
    }
}

impl fmt::Display for Instant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_never() {
            return f.write_str("never");
        }
        let secs = self.0 / 1_000_000_000;
        let nanos = self.0 % 1_000_000_000;
        write!(f, "{secs}.{nanos:09}s")
    }
}

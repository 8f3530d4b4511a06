//! The global tick counter ("jiffies") and its update protocol.
use crate::{loom::sync::atomic::{AtomicU64, Ordering::*}, Instant};
use core::{fmt, time::Duration};
use nohz_util::sync::SeqCount;

/// The system-wide coarse time base.
///
/// `Jiffies` counts elapsed tick periods. It is advanced by whichever CPU
/// currently holds the timekeeping duty (see [`DutyRegistry`]), and
/// opportunistically by CPUs waking from a long tickless sleep. Advancing is
/// idempotent: concurrent callers passing the same `now` only ever count each
/// elapsed period once.
///
/// All fields are grouped under a [`SeqCount`], so that readers always observe
/// a `(tick_count, last_update)` pair produced by the same update.
///
/// [`DutyRegistry`]: crate::DutyRegistry
pub struct Jiffies {
    seq: SeqCount,
    /// The number of tick periods elapsed since boot.
    ticks: AtomicU64,
    /// The instant of the last period boundary accounted in `ticks`, in
    /// nanoseconds. Zero until the first update.
    last_update: AtomicU64,
    /// The instant at which the next period begins, in nanoseconds.
    next_period: AtomicU64,
    /// The tick period, in nanoseconds.
    period: AtomicU64,
}

/// A consistent view of the time base.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Snapshot {
    /// The tick count at `last_update`.
    pub ticks: u64,
    /// The period boundary at which `ticks` was last advanced.
    pub last_update: Instant,
    /// The start of the next tick period.
    pub next_period: Instant,
    /// The length of a tick period.
    pub period: Duration,
}

impl Jiffies {
    /// Returns a new time base with the given `period`, whose first period
    /// begins at `start`.
    ///
    /// The time base is not advanced until [`Jiffies::init_or_get_next_deadline`]
    /// seeds the last-update timestamp.
    #[must_use]
    pub fn new(period: Duration, start: Instant) -> Self {
        Self {
            seq: SeqCount::new(),
            ticks: AtomicU64::new(0),
            last_update: AtomicU64::new(0),
            next_period: AtomicU64::new(start.as_nanos()),
            period: AtomicU64::new(nanos(period).max(1)),
        }
    }

    /// Returns the current tick count.
    #[inline]
    #[must_use]
    pub fn get(&self) -> u64 {
        self.ticks.load(Acquire)
    }

    /// Returns the current tick period.
    #[must_use]
    pub fn period(&self) -> Duration {
        Duration::from_nanos(self.period.load(Acquire))
    }

    /// Returns a consistent snapshot of the time base.
    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        self.seq.read(|| Snapshot {
            ticks: self.ticks.load(Acquire),
            last_update: Instant::from_nanos(self.last_update.load(Acquire)),
            next_period: Instant::from_nanos(self.next_period.load(Acquire)),
            period: Duration::from_nanos(self.period.load(Acquire)),
        })
    }

    /// Advances the tick count by the number of whole periods that elapsed
    /// between the last update and `now`.
    ///
    /// Returns the number of ticks added, which is zero if less than one
    /// period has elapsed (including when another CPU has already accounted
    /// for them).
    pub fn advance(&self, now: Instant) -> u64 {
        let now = now.as_nanos();

        // Quick check without the write lock. A stale read only costs us the
        // locked recheck below.
        let period = self.period.load(Acquire);
        if now.saturating_sub(self.last_update.load(Acquire)) < period {
            return 0;
        }

        let _write = self.seq.write();
        let period = self.period.load(Relaxed);
        let mut last = self.last_update.load(Relaxed);
        let delta = now.saturating_sub(last);
        if delta < period {
            return 0;
        }

        let delta = delta - period;
        last += period;
        let mut ticks = 0;

        // Slow path for long sleeps: consume every elapsed period in one step.
        if delta >= period {
            ticks = delta / period;
            last += period * ticks;
        }
        ticks += 1;

        self.last_update.store(last, Release);
        let total = self.ticks.fetch_add(ticks, Release) + ticks;
        self.next_period.store(last.saturating_add(period), Release);

        tracing::trace!(ticks, jiffies = total, last_update = last, "jiffies advanced");
        ticks
    }

    /// Seeds the last-update timestamp from the next period boundary if the
    /// time base has not been started yet, and returns the last update.
    ///
    /// This is used to align a CPU's scheduling timer with the global tick
    /// phase when it switches to oneshot operation.
    pub fn init_or_get_next_deadline(&self) -> Instant {
        let _write = self.seq.write();
        let mut last = self.last_update.load(Relaxed);
        if last == 0 {
            last = self.next_period.load(Relaxed);
            self.last_update.store(last, Release);
            tracing::debug!(last_update = last, "jiffies update started");
        }
        Instant::from_nanos(last)
    }

    /// Changes the tick period.
    ///
    /// Periods already accounted are not affected; the next period boundary
    /// is recomputed from the last update. A zero period is ignored.
    pub fn set_period(&self, period: Duration) -> bool {
        let period = nanos(period);
        if period == 0 {
            return false;
        }

        let _write = self.seq.write();
        self.period.store(period, Release);
        let last = self.last_update.load(Relaxed);
        if last != 0 {
            self.next_period.store(last.saturating_add(period), Release);
        }
        tracing::debug!(period_ns = period, "tick period changed");
        true
    }
}

impl fmt::Debug for Jiffies {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Snapshot {
            ticks,
            last_update,
            next_period,
            period,
        } = self.snapshot();
        f.debug_struct("Jiffies")
            .field("ticks", &ticks)
            .field("last_update", &last_update)
            .field("next_period", &next_period)
            .field("period", &period)
            .finish()
    }
}

/// Converts a [`Duration`] to nanoseconds, saturating at `u64::MAX`.
#[inline]
pub(crate) fn nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loom::{self, sync::Arc, thread};

    const PERIOD: Duration = Duration::from_millis(1);

    fn at_ms(ms: u64) -> Instant {
        Instant::from_nanos(ms * 1_000_000)
    }

    fn started() -> Jiffies {
        let jiffies = Jiffies::new(PERIOD, at_ms(10));
        assert_eq!(jiffies.init_or_get_next_deadline(), at_ms(10));
        jiffies
    }

    #[test]
    fn less_than_a_period_is_a_noop() {
        loom::model(|| {
            let jiffies = started();
            assert_eq!(jiffies.advance(at_ms(10)), 0);
            assert_eq!(jiffies.advance(at_ms(10) + Duration::from_micros(999)), 0);
            assert_eq!(jiffies.get(), 0);
        });
    }

    #[test]
    fn advances_by_whole_periods() {
        loom::model(|| {
            let jiffies = started();
            assert_eq!(jiffies.advance(at_ms(11)), 1);
            assert_eq!(jiffies.advance(at_ms(13) + Duration::from_micros(500)), 2);

            let snap = jiffies.snapshot();
            assert_eq!(snap.ticks, 3);
            assert_eq!(snap.last_update, at_ms(13));
            assert_eq!(snap.next_period, at_ms(14));

            // same `now` again: nothing left to account
            assert_eq!(jiffies.advance(at_ms(13) + Duration::from_micros(500)), 0);
        });
    }

    #[test]
    fn long_sleep_takes_the_slow_path() {
        loom::model(|| {
            let jiffies = started();
            assert_eq!(jiffies.advance(at_ms(10_010)), 10_000);
            assert_eq!(jiffies.snapshot().last_update, at_ms(10_010));
        });
    }

    #[test]
    fn init_only_seeds_once() {
        loom::model(|| {
            let jiffies = started();
            jiffies.advance(at_ms(15));
            assert_eq!(jiffies.init_or_get_next_deadline(), at_ms(15));
        });
    }

    #[test]
    fn period_change_moves_next_boundary() {
        loom::model(|| {
            let jiffies = started();
            assert!(jiffies.set_period(Duration::from_millis(4)));
            assert!(!jiffies.set_period(Duration::ZERO));
            assert_eq!(jiffies.snapshot().next_period, at_ms(14));
            assert_eq!(jiffies.advance(at_ms(17)), 1);
            assert_eq!(jiffies.advance(at_ms(18)), 1);
        });
    }

    #[test]
    fn concurrent_advances_count_each_period_once() {
        loom::model(|| {
            let jiffies = Arc::new(started());
            let threads = (0..2)
                .map(|_| {
                    let jiffies = jiffies.clone();
                    thread::spawn(move || jiffies.advance(at_ms(15)))
                })
                .collect::<Vec<_>>();

            let added: u64 = threads.into_iter().map(|t| t.join().unwrap()).sum();
            assert_eq!(added, 5);
            assert_eq!(jiffies.get(), 5);
        });
    }

    #[cfg(not(loom))]
    mod prop {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn total_is_elapsed_periods(steps in proptest::collection::vec(0u64..50_000_000, 1..64)) {
                let jiffies = started();
                let start = at_ms(10).as_nanos();
                let mut now = start;
                let mut prev = 0;
                for step in steps {
                    now += step;
                    jiffies.advance(Instant::from_nanos(now));
                    let ticks = jiffies.get();
                    prop_assert!(ticks >= prev, "jiffies went backwards: {} -> {}", prev, ticks);
                    prev = ticks;
                }
                prop_assert_eq!(jiffies.get(), (now - start) / 1_000_000);
            }
        }
    }
}

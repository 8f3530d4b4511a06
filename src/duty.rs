//! Ownership of the global timekeeping duty.
//!
//! Exactly one CPU at a time is responsible for advancing [`Jiffies`] from its
//! tick. When that CPU goes to sleep it may drop the duty; the next CPU whose
//! tick fires picks it up again. CPUs running in busy-adaptive mode (tickless
//! while running a task) complicate this: once any exist, the duty must never
//! be left unassigned, since there may be no idle CPU whose tick would notice.
//!
//! [`Jiffies`]: crate::Jiffies
use crate::{
    loom::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering::*},
    CpuId,
};
use alloc::boxed::Box;
use core::fmt;
use nohz_util::sync::RateLimit;

/// Tracks which CPU holds the timekeeping duty and which CPUs are running in
/// busy-adaptive mode.
///
/// All operations are lock-free, so they may be called from any CPU with
/// interrupts disabled.
pub struct DutyRegistry {
    /// The duty holder's CPU index, or [`NONE`].
    duty: AtomicUsize,
    /// The number of `busy` flags currently set.
    busy_count: AtomicU32,
    busy: Box<[AtomicBool]>,
}

/// The CPU asking to drop or claim the duty, as seen by
/// [`DutyRegistry::try_drop_or_claim`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Claimant {
    /// The CPU about to stop its tick.
    pub cpu: CpuId,
    /// The idle task is running on `cpu`.
    pub idle: bool,
    /// `cpu` is itself eligible for busy-adaptive operation.
    pub adaptive: bool,
}

/// The outcome of a duty handoff attempt.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DutyState {
    /// The caller already held the duty and keeps it.
    Keep(CpuId),
    /// The duty is unassigned: the caller dropped it, or never held it.
    Dropped,
    /// The caller took over the duty.
    Took(CpuId),
    /// Another CPU holds the duty and keeps it.
    Deferred(CpuId),
}

/// The result of a single handoff attempt.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Attempt {
    Done(DutyState),
    /// The registry changed while deciding; the decision may be stale.
    Retry,
}

const NONE: usize = usize::MAX;

/// The number of handoff attempts made before deferring to whoever the last
/// attempt observed.
const MAX_ATTEMPTS: usize = 2;

static RETRIES_EXHAUSTED: RateLimit = RateLimit::new(1);

impl DutyRegistry {
    /// Returns a new registry for `ncpus` CPUs, with the duty held by `initial`.
    #[must_use]
    pub fn new(ncpus: usize, initial: Option<CpuId>) -> Self {
        Self {
            duty: AtomicUsize::new(to_raw(initial)),
            busy_count: AtomicU32::new(0),
            busy: (0..ncpus).map(|_| AtomicBool::new(false)).collect(),
        }
    }

    /// Returns the CPU currently holding the duty.
    #[inline]
    #[must_use]
    pub fn holder(&self) -> Option<CpuId> {
        from_raw(self.duty.load(Acquire))
    }

    /// Returns `true` if `cpu` holds the duty.
    #[inline]
    #[must_use]
    pub fn is_holder(&self, cpu: CpuId) -> bool {
        self.duty.load(Acquire) == cpu.as_usize()
    }

    /// Returns the number of CPUs in busy-adaptive mode.
    #[inline]
    #[must_use]
    pub fn busy_adaptive_count(&self) -> u32 {
        self.busy_count.load(Acquire)
    }

    /// Returns `true` if `cpu` is marked as busy-adaptive.
    #[must_use]
    pub fn is_busy_adaptive(&self, cpu: CpuId) -> bool {
        self.busy
            .get(cpu.as_usize())
            .map_or(false, |busy| busy.load(Acquire))
    }

    /// Marks `cpu` as busy-adaptive.
    ///
    /// Returns `true` if it was not already marked.
    pub fn mark_busy_adaptive(&self, cpu: CpuId) -> bool {
        let Some(busy) = self.busy.get(cpu.as_usize()) else {
            return false;
        };
        if busy.swap(true, AcqRel) {
            return false;
        }
        let count = self.busy_count.fetch_add(1, AcqRel) + 1;
        tracing::debug!(%cpu, busy_adaptive = count, "cpu entered busy-adaptive mode");
        true
    }

    /// Clears `cpu`'s busy-adaptive mark.
    ///
    /// Returns `true` if it was marked.
    pub fn clear_busy_adaptive(&self, cpu: CpuId) -> bool {
        let Some(busy) = self.busy.get(cpu.as_usize()) else {
            return false;
        };
        if !busy.swap(false, AcqRel) {
            return false;
        }
        let prev = self.busy_count.fetch_sub(1, AcqRel);
        nohz_util::warn_on_once!(
            prev == 0,
            "busy-adaptive count underflowed clearing {}",
            cpu
        );
        tracing::debug!(%cpu, busy_adaptive = prev.wrapping_sub(1), "cpu left busy-adaptive mode");
        true
    }

    /// Claims the duty for `cpu` if nobody holds it.
    ///
    /// Returns `true` if `cpu` holds the duty afterwards.
    pub fn claim_if_unassigned(&self, cpu: CpuId) -> bool {
        match self.swap_holder(NONE, cpu.as_usize()) {
            Ok(_) => {
                tracing::debug!(%cpu, "claimed unassigned timekeeping duty");
                true
            }
            Err(holder) => holder == cpu.as_usize(),
        }
    }

    /// Releases the duty if `cpu` holds it.
    ///
    /// Returns `true` if the duty was released.
    pub fn release(&self, cpu: CpuId) -> bool {
        let released = self.swap_holder(cpu.as_usize(), NONE).is_ok();
        if released {
            tracing::debug!(%cpu, "released timekeeping duty");
        }
        released
    }

    /// Decides whether the claimant keeps, drops, or takes the timekeeping
    /// duty before stopping its tick.
    ///
    /// When no CPU is busy-adaptive, the claimant simply drops the duty if it
    /// holds it: whichever CPU ticks next will take it. Otherwise, the duty
    /// must stay assigned. The claimant keeps it if it holds it, and takes it
    /// if nobody holds it or if the holder is itself busy-adaptive (and the
    /// claimant is idle or not adaptive-eligible, so that it is a better
    /// timekeeper).
    ///
    /// Each attempt is retried at most once if the registry changed under
    /// it. If the second attempt is also stale, the claimant defers to the
    /// holder it observed.
    pub fn try_drop_or_claim(&self, claimant: Claimant) -> DutyState {
        for attempt in 0..MAX_ATTEMPTS {
            match self.attempt(claimant) {
                Attempt::Done(state) => {
                    tracing::trace!(cpu = %claimant.cpu, attempt, ?state, "duty handoff");
                    return state;
                }
                Attempt::Retry => {
                    test_trace!(cpu = %claimant.cpu, attempt, "duty handoff raced, retrying");
                }
            }
        }

        if RETRIES_EXHAUSTED.allow() {
            tracing::warn!(
                cpu = %claimant.cpu,
                "timekeeping duty handoff kept racing; deferring to the current holder"
            );
        }

        let me = claimant.cpu.as_usize();
        match self.duty.load(Acquire) {
            holder if holder == me => DutyState::Keep(claimant.cpu),
            NONE if self.busy_adaptive_count() > 0 => match self.swap_holder(NONE, me) {
                Ok(_) => DutyState::Took(claimant.cpu),
                Err(holder) => state_for(me, holder),
            },
            holder => state_for(me, holder),
        }
    }

    fn attempt(&self, claimant: Claimant) -> Attempt {
        let me = claimant.cpu.as_usize();

        if test_dbg!(self.busy_adaptive_count()) == 0 {
            let prev = match self.swap_holder(me, NONE) {
                Ok(prev) | Err(prev) => prev,
            };
            // a CPU may have entered busy-adaptive mode after we checked; if
            // so, it may be counting on the duty we just dropped.
            if test_dbg!(self.busy_adaptive_count()) > 0 {
                return Attempt::Retry;
            }
            return Attempt::Done(if prev == me {
                DutyState::Dropped
            } else {
                state_for(me, prev)
            });
        }

        let curr = test_dbg!(self.duty.load(Acquire));
        if curr == me {
            return Attempt::Done(DutyState::Keep(claimant.cpu));
        }

        let take = match from_raw(curr) {
            None => true,
            Some(holder) => {
                self.is_busy_adaptive(holder) && (claimant.idle || !claimant.adaptive)
            }
        };
        let new = if take { me } else { curr };

        // even when deferring, confirm that the holder we are deferring to
        // did not change under us.
        if self.swap_holder(curr, new).is_err() {
            return Attempt::Retry;
        }

        // the last busy-adaptive CPU may have left, in which case nobody
        // needs the duty kept.
        if test_dbg!(self.busy_adaptive_count()) == 0 {
            return Attempt::Retry;
        }

        Attempt::Done(if take {
            DutyState::Took(claimant.cpu)
        } else {
            state_for(me, curr)
        })
    }

    #[inline]
    fn swap_holder(&self, curr: usize, new: usize) -> Result<usize, usize> {
        test_dbg!(self.duty.compare_exchange(curr, new, AcqRel, Acquire))
    }
}

impl fmt::Debug for DutyRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DutyRegistry")
            .field("holder", &self.holder())
            .field("busy_adaptive_count", &self.busy_adaptive_count())
            .finish()
    }
}

fn state_for(me: usize, holder: usize) -> DutyState {
    match from_raw(holder) {
        None => DutyState::Dropped,
        Some(cpu) if holder == me => DutyState::Keep(cpu),
        Some(cpu) => DutyState::Deferred(cpu),
    }
}

fn to_raw(cpu: Option<CpuId>) -> usize {
    cpu.map_or(NONE, CpuId::as_usize)
}

fn from_raw(raw: usize) -> Option<CpuId> {
    if raw == NONE {
        return None;
    }
    u32::try_from(raw).ok().map(CpuId::new)
}

// === impl DutyState ===

impl DutyState {
    /// Returns the CPU holding the duty after the handoff.
    #[must_use]
    pub fn holder(self) -> Option<CpuId> {
        match self {
            Self::Keep(cpu) | Self::Took(cpu) | Self::Deferred(cpu) => Some(cpu),
            Self::Dropped => None,
        }
    }

    /// Returns `true` if the claimant holds the duty after the handoff.
    #[must_use]
    pub fn claimant_holds(self) -> bool {
        matches!(self, Self::Keep(_) | Self::Took(_))
    }
}

//! The per-CPU scheduling timer: the periodic tick handler, oneshot mode
//! switching, and restarting a stopped tick.
use super::{AccountingReason, TickMode, TickSched, TickState};
use crate::{
    jiffies::nanos, loom::sync::atomic::Ordering::*, platform::AccountKind, AlreadyPast, CpuId,
    Instant, Platform,
};
use core::time::Duration;

/// The expiry of a CPU's tick timer.
///
/// This only tracks where the next tick falls; arming it is done through the
/// platform's event device.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(super) struct SchedTimer {
    expires: Instant,
}

impl SchedTimer {
    pub(super) const fn new() -> Self {
        Self {
            expires: Instant::ZERO,
        }
    }

    #[inline]
    pub(super) fn expires(&self) -> Instant {
        self.expires
    }

    #[inline]
    pub(super) fn set_expires(&mut self, expires: Instant) {
        self.expires = expires;
    }

    /// Moves the expiry forward by whole multiples of `interval` until it lies
    /// strictly after `now`.
    ///
    /// Returns the number of intervals skipped, or zero if the expiry was
    /// already in the future.
    pub(super) fn forward(&mut self, now: Instant, interval: Duration) -> u64 {
        let now = now.as_nanos();
        let mut expires = self.expires.as_nanos();
        if now < expires {
            return 0;
        }

        let interval = nanos(interval).max(1);
        let delta = now - expires;
        let mut overruns = 1;
        if delta >= interval {
            overruns = delta / interval;
            expires = expires.saturating_add(interval.saturating_mul(overruns));
            if expires > now {
                self.expires = Instant::from_nanos(expires);
                return overruns;
            }
            overruns += 1;
        }
        self.expires = Instant::from_nanos(expires.saturating_add(interval));
        overruns
    }
}

impl<P: Platform> TickSched<P> {
    /// Handles `cpu`'s tick.
    ///
    /// This is the scheduling timer callback, shared by the low-resolution
    /// oneshot handler and the high-resolution tick emulation. It picks up an
    /// unassigned timekeeping duty, advances the time base if this CPU holds
    /// the duty, charges one tick to the running context, and arms the next
    /// tick.
    pub fn on_tick(&self, cpu: CpuId) {
        let mut ts = self.lock(cpu);
        let mut now = self.platform.now();
        ts.next_event = Instant::MAX;

        // Two CPUs may race to pick up a dropped duty. That is harmless, since
        // advancing the time base is idempotent.
        self.duty.claim_if_unassigned(cpu);
        if self.duty.is_holder(cpu) {
            self.jiffies.advance(now);
        }

        // This tick is charged directly below, so the flush when the tick
        // restarts must not count it again.
        if ts.tick_stopped {
            ts.saved_jiffies = ts.saved_jiffies.wrapping_add(1);
        }

        let current = self.platform.current(cpu);
        let kind = if current.idle {
            AccountKind::Idle
        } else if current.user_mode {
            AccountKind::User
        } else {
            AccountKind::System
        };
        self.platform.account_ticks(kind, cpu, 1);
        test_trace!(%cpu, ?kind, jiffies = self.jiffies.get(), "tick");

        if ts.mode == TickMode::Inactive && !ts.highres {
            // the periodic device rearms itself
            return;
        }

        let period = self.cpu_tick_period(cpu);
        loop {
            ts.timer.forward(now, period);
            let expires = ts.timer.expires();
            if self.program(cpu, &mut ts, expires) {
                break;
            }
            now = self.platform.now();
            self.jiffies.advance(now);
        }
    }

    /// Marks every CPU's clock configuration as changed, so that each CPU
    /// rechecks whether it can switch to oneshot operation.
    pub fn notify_clock_changed(&self) {
        tracing::debug!("clock source changed");
        for slot in self.cpus.iter() {
            slot.check_clocks.store(true, Release);
        }
    }

    /// Marks `cpu`'s clock configuration as changed after its event device
    /// changed.
    pub fn notify_event_device_changed(&self, cpu: CpuId) {
        tracing::debug!(%cpu, "event device changed");
        self.slot(cpu).check_clocks.store(true, Release);
    }

    /// Checks whether a clock change made oneshot operation possible on
    /// `cpu`.
    ///
    /// If `allow_nohz` is `true`, the CPU switches to low-resolution tickless
    /// operation itself. Otherwise, this returns `true` when the caller should
    /// switch the CPU to high-resolution operation with
    /// [`TickSched::setup_sched_timer`].
    pub fn check_oneshot_change(&self, cpu: CpuId, allow_nohz: bool) -> bool {
        if !self.slot(cpu).check_clocks.swap(false, AcqRel) {
            return false;
        }

        if self.lock(cpu).mode != TickMode::Inactive {
            return false;
        }

        if !self.platform.valid_for_highres() || !self.platform.oneshot_available(cpu) {
            return false;
        }

        if !allow_nohz {
            return true;
        }

        self.switch_to_nohz(cpu);
        false
    }

    /// Switches `cpu` to low-resolution tickless operation.
    ///
    /// Returns `true` if the switch happened. Nothing changes if tickless
    /// operation is disabled or the CPU's event device cannot run in oneshot
    /// mode.
    pub fn switch_to_nohz(&self, cpu: CpuId) -> bool {
        if !self.tunables.is_enabled() {
            return false;
        }

        if !self.platform.oneshot_available(cpu) {
            tracing::debug!(%cpu, "no oneshot event device, staying periodic");
            return false;
        }

        let mut ts = self.lock(cpu);
        ts.mode = TickMode::LowRes;

        let period = self.jiffies.period();
        let next = self.jiffies.init_or_get_next_deadline();
        ts.timer.set_expires(next);
        loop {
            let expires = ts.timer.expires();
            if self.program(cpu, &mut ts, expires) {
                break;
            }
            ts.timer.forward(self.platform.now(), period);
        }

        tracing::info!(%cpu, first_tick = %ts.timer.expires(), "switched to nohz mode");
        true
    }

    /// Sets up `cpu`'s high-resolution tick emulation timer, aligned to the
    /// global tick phase.
    ///
    /// If tickless operation is enabled, the CPU then runs in
    /// [`TickMode::HighRes`].
    pub fn setup_sched_timer(&self, cpu: CpuId) {
        let mut ts = self.lock(cpu);
        let mut now = self.platform.now();
        let period = self.cpu_tick_period(cpu);

        ts.highres = true;
        ts.timer.set_expires(self.jiffies.init_or_get_next_deadline());
        loop {
            ts.timer.forward(now, period);
            let expires = ts.timer.expires();
            if self.program(cpu, &mut ts, expires) {
                break;
            }
            now = self.platform.now();
        }

        if self.tunables.is_enabled() {
            ts.mode = TickMode::HighRes;
        }
        tracing::info!(%cpu, mode = ?ts.mode, first_tick = %ts.timer.expires(), "sched timer set up");
    }

    /// Tears down `cpu`'s scheduling timer when the CPU goes away.
    ///
    /// The CPU returns to [`TickMode::Inactive`] with its tick running, and
    /// no longer counts as busy-adaptive.
    pub fn cancel_sched_timer(&self, cpu: CpuId) {
        let mut ts = self.lock(cpu);
        if ts.highres {
            self.platform.cancel(cpu);
            ts.highres = false;
            ts.next_event = Instant::MAX;
        }
        self.duty.clear_busy_adaptive(cpu);
        ts.mode = TickMode::Inactive;
        ts.tick_stopped = false;
        ts.nohz_flag = false;
        ts.saved_reason = AccountingReason::None;
        tracing::debug!(%cpu, "sched timer cancelled");
    }

    /// Restarts a stopped tick: catches the time base up and re-arms the
    /// scheduling timer at its original phase.
    pub(super) fn restart_tick(&self, cpu: CpuId, ts: &mut TickState, now: Instant) {
        self.jiffies.advance(now);
        ts.tick_stopped = false;
        ts.idle_exit_time = now;
        self.restart_timer(cpu, ts, now);
        tracing::debug!(%cpu, jiffies = self.jiffies.get(), next_tick = %ts.timer.expires(), "restart tick");
    }

    fn restart_timer(&self, cpu: CpuId, ts: &mut TickState, mut now: Instant) {
        if ts.mode == TickMode::HighRes {
            self.platform.cancel(cpu);
        }
        ts.timer.set_expires(ts.last_tick);

        let period = self.cpu_tick_period(cpu);
        loop {
            ts.timer.forward(now, period);
            let expires = ts.timer.expires();
            if self.program(cpu, ts, expires) {
                return;
            }
            self.jiffies.advance(now);
            now = self.platform.now();
        }
    }

    /// Arms `cpu`'s event device at `deadline`.
    ///
    /// Returns `false` if the deadline had already passed by the time the
    /// device was armed, in which case no interrupt is pending.
    pub(super) fn program(&self, cpu: CpuId, ts: &mut TickState, deadline: Instant) -> bool {
        ts.timer.set_expires(deadline);
        match self.platform.program(cpu, deadline) {
            Ok(()) => {
                ts.next_event = deadline;
                let armed = self.platform.is_armed(cpu);
                if !armed {
                    test_trace!(%cpu, %deadline, "timer expired while arming");
                }
                armed
            }
            Err(AlreadyPast { .. }) => {
                test_trace!(%cpu, %deadline, "timer deadline already past");
                false
            }
        }
    }
}

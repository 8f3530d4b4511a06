//! Stopping the tick from the idle loop, and idle time accounting.
use super::{AccountingReason, TickMode, TickSched, TickState};
use crate::{duty::Claimant, jiffies::nanos, CpuId, Instant, Platform, NEXT_TIMER_MAX_DELTA};
use core::time::Duration;
use nohz_util::sync::RateLimit;

static SOFTIRQ_PENDING: RateLimit = RateLimit::new(10);

impl<P: Platform> TickSched<P> {
    /// Called by `cpu`'s idle loop before it goes to sleep.
    ///
    /// Starts accounting idle time and, if nothing needs the tick, stops it
    /// until the next pending timer.
    pub fn enter_idle(&self, cpu: CpuId) {
        let mut ts = self.lock(cpu);
        // set even if the tick cannot be stopped: idle time accounting still
        // relies on it
        ts.in_idle = true;
        self.idle_enter(cpu, &mut ts);
    }

    /// Called by `cpu`'s idle loop when it leaves idle to run a task.
    ///
    /// Folds the idle period into the idle (or iowait) time and restarts the
    /// tick if it was stopped, charging the skipped ticks as idle time.
    pub fn exit_idle(&self, cpu: CpuId) {
        let mut ts = self.lock(cpu);
        nohz_util::warn_on_once!(!ts.in_idle, "{} left idle without entering it", cpu);
        ts.in_idle = false;

        if !ts.idle_active && !ts.tick_stopped {
            return;
        }

        let now = self.platform.now();
        if ts.idle_active {
            self.stop_idle(cpu, &mut ts, now);
        }

        if ts.tick_stopped {
            self.restart_tick(cpu, &mut ts, now);
            self.flush(cpu, &mut ts);
            ts.saved_reason = AccountingReason::None;
        }
    }

    /// Called on interrupt entry.
    ///
    /// If the interrupt woke `cpu` from a tickless idle period, this closes
    /// the idle period and brings the time base up to date, since the duty
    /// holder may itself be asleep.
    pub fn on_irq_enter(&self, cpu: CpuId) {
        let mut ts = self.lock(cpu);
        if !ts.idle_active && !ts.tick_stopped {
            return;
        }

        let now = self.platform.now();
        if ts.idle_active {
            self.stop_idle(cpu, &mut ts, now);
        }
        if ts.tick_stopped {
            ts.idle_waketime = now;
            self.jiffies.advance(now);
        }
    }

    /// Called on interrupt exit.
    ///
    /// An interrupt that did not cause a reschedule may still have added or
    /// removed timers, so an idle CPU recomputes its next wakeup. A busy CPU
    /// checks whether it can stop its tick adaptively.
    pub fn on_irq_exit(&self, cpu: CpuId) {
        let mut ts = self.lock(cpu);
        if ts.in_idle {
            if !self.platform.need_resched(cpu) {
                self.idle_enter(cpu, &mut ts);
            }
        } else {
            self.adaptive_stop_tick(cpu, &mut ts);
        }
    }

    /// Returns the total time `cpu` spent idle, in microseconds, including the
    /// current idle period.
    ///
    /// Returns `None` if tickless operation is disabled.
    #[must_use]
    pub fn get_idle_time_us(&self, cpu: CpuId) -> Option<u64> {
        self.sleep_time_us(cpu, false)
    }

    /// Returns the total time `cpu` spent idle with tasks waiting for I/O, in
    /// microseconds, including the current idle period.
    ///
    /// Returns `None` if tickless operation is disabled.
    #[must_use]
    pub fn get_iowait_time_us(&self, cpu: CpuId) -> Option<u64> {
        self.sleep_time_us(cpu, true)
    }

    /// Folds the current idle period into `cpu`'s idle statistics, and returns
    /// the total idle time and the current time, in microseconds.
    ///
    /// Returns `None` if tickless operation is disabled.
    pub fn update_idle_time_us(&self, cpu: CpuId) -> Option<(u64, u64)> {
        self.update_sleep_time_us(cpu, false)
    }

    /// Like [`TickSched::update_idle_time_us`], but returns the iowait time.
    pub fn update_iowait_time_us(&self, cpu: CpuId) -> Option<(u64, u64)> {
        self.update_sleep_time_us(cpu, true)
    }

    fn sleep_time_us(&self, cpu: CpuId, iowait: bool) -> Option<u64> {
        if !self.tunables.is_enabled() {
            return None;
        }

        let now = self.platform.now();
        let ts = self.lock(cpu);
        let waiting = self.platform.nr_iowait(cpu) > 0;
        let total = if iowait {
            ts.iowait_sleeptime
        } else {
            ts.idle_sleeptime
        };
        let total = if ts.idle_active && waiting == iowait {
            total + now.duration_since(ts.idle_entry_time)
        } else {
            total
        };
        Some(micros(total))
    }

    fn update_sleep_time_us(&self, cpu: CpuId, iowait: bool) -> Option<(u64, u64)> {
        if !self.tunables.is_enabled() {
            return None;
        }

        let now = self.platform.now();
        let mut ts = self.lock(cpu);
        self.update_idle_stats(cpu, &mut ts, now);
        let total = if iowait {
            ts.iowait_sleeptime
        } else {
            ts.idle_sleeptime
        };
        Some((micros(total), now.as_micros()))
    }

    pub(super) fn idle_enter(&self, cpu: CpuId, ts: &mut TickState) {
        let now = self.start_idle(cpu, ts);
        if !self.can_stop_idle_tick(cpu, ts) {
            return;
        }

        let was_stopped = ts.tick_stopped;
        ts.idle_calls += 1;

        let claimant = Claimant {
            cpu,
            idle: true,
            adaptive: self.platform.cpu_in_adaptive_set(cpu),
        };
        if let Some(expires) = self.stop_tick(cpu, ts, now, claimant) {
            ts.idle_sleeps += 1;
            ts.idle_expires = expires;
        }

        if !was_stopped && ts.tick_stopped {
            ts.saved_jiffies = ts.last_jiffies;
            ts.saved_reason = AccountingReason::Idle;
        }
    }

    fn start_idle(&self, cpu: CpuId, ts: &mut TickState) -> Instant {
        let now = self.platform.now();
        // an interrupt that returned to idle without passing through
        // `on_irq_enter` leaves the previous period open
        self.update_idle_stats(cpu, ts, now);
        ts.idle_entry_time = now;

        // an idle CPU is not running a task tickless
        self.duty.clear_busy_adaptive(cpu);

        ts.idle_active = true;
        now
    }

    fn stop_idle(&self, cpu: CpuId, ts: &mut TickState, now: Instant) {
        self.update_idle_stats(cpu, ts, now);
        ts.idle_active = false;
    }

    fn update_idle_stats(&self, cpu: CpuId, ts: &mut TickState, now: Instant) {
        if !ts.idle_active {
            return;
        }

        let delta = now.duration_since(ts.idle_entry_time);
        if self.platform.nr_iowait(cpu) > 0 {
            ts.iowait_sleeptime += delta;
        } else {
            ts.idle_sleeptime += delta;
        }
        ts.idle_entry_time = now;
    }

    fn can_stop_idle_tick(&self, cpu: CpuId, ts: &TickState) -> bool {
        let online = self.platform.cpu_online(cpu);
        // an offline CPU's tick will not fire again, so whoever ticks next has
        // to take over the time base
        if !online && self.duty.release(cpu) {
            tracing::debug!(%cpu, "offline cpu gave up timekeeping duty");
        }

        if ts.mode == TickMode::Inactive {
            return false;
        }

        if self.platform.need_resched(cpu) {
            return false;
        }

        let pending = self.platform.pending_softirqs(cpu);
        if pending != 0 && online {
            if SOFTIRQ_PENDING.allow() {
                tracing::error!(%cpu, "softirq pending on nohz idle entry: {pending:#04x}");
            }
            return false;
        }

        true
    }

    /// Tries to stop `cpu`'s tick, or extends an already stopped tick, until
    /// the next pending timer.
    ///
    /// Returns the new expiry if the event device was reprogrammed (or
    /// cancelled), or `None` if nothing changed.
    pub(super) fn stop_tick(
        &self,
        cpu: CpuId,
        ts: &mut TickState,
        now: Instant,
        claimant: Claimant,
    ) -> Option<Instant> {
        let snapshot = self.jiffies.snapshot();
        let last_jiffies = snapshot.ticks;
        let max_deferment = self.platform.max_deferment();

        let next_jiffies =
            if self.platform.rcu_needs_cpu(cpu) || self.platform.arch_needs_cpu(cpu) {
                last_jiffies.saturating_add(1)
            } else {
                self.platform.next_timer_interrupt(cpu, last_jiffies)
            };

        let mut reprogrammed = None;
        'stop: {
            // a timer that is already due just needs the timer softirq
            if next_jiffies <= last_jiffies {
                self.platform.raise_timer_softirq(cpu);
                break 'stop;
            }
            let delta_jiffies = (next_jiffies - last_jiffies).min(NEXT_TIMER_MAX_DELTA);

            // stopping for a single tick buys nothing
            if !ts.tick_stopped && delta_jiffies == 1 {
                break 'stop;
            }

            let prev_holder = self.duty.holder();
            let duty = self.duty.try_drop_or_claim(claimant);

            // whoever last kept the time base must not sleep longer than the
            // clock source allows
            let capped = if duty.claimant_holds() || prev_holder == Some(cpu) {
                ts.do_timer_last = true;
                true
            } else if duty.holder().is_some() {
                ts.do_timer_last = false;
                false
            } else {
                ts.do_timer_last
            };

            let mut sleep = capped.then_some(max_deferment);
            if delta_jiffies < NEXT_TIMER_MAX_DELTA {
                let until_timer = Duration::from_nanos(
                    nanos(snapshot.period).saturating_mul(delta_jiffies),
                );
                sleep = Some(sleep.map_or(until_timer, |cap| cap.min(until_timer)));
            }
            let expires = sleep.map_or(Instant::MAX, |sleep| snapshot.last_update + sleep);

            if ts.tick_stopped && expires == ts.next_event {
                break 'stop;
            }

            reprogrammed = Some(expires);

            if !ts.tick_stopped {
                ts.last_tick = ts.timer.expires();
                ts.tick_stopped = true;
                tracing::debug!(%cpu, jiffies = last_jiffies, ?duty, %expires, "stop tick");
            }

            if expires.is_never() {
                if ts.mode == TickMode::HighRes {
                    self.platform.cancel(cpu);
                    ts.next_event = Instant::MAX;
                }
                break 'stop;
            }

            if self.program(cpu, ts, expires) {
                break 'stop;
            }

            // we crossed a tick boundary while programming: catch up now
            // rather than sleeping through the missed tick
            self.jiffies.advance(self.platform.now());
            self.platform.raise_timer_softirq(cpu);
        }

        ts.next_jiffies = next_jiffies;
        ts.last_jiffies = last_jiffies;
        ts.sleep_length = ts.next_event.duration_since(now);
        reprogrammed
    }
}

fn micros(duration: Duration) -> u64 {
    u64::try_from(duration.as_micros()).unwrap_or(u64::MAX)
}

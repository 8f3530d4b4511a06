//! Stopping the tick on a busy CPU that runs a single task.
//!
//! A CPU in an adaptive CPU set may stop its tick while running one task, as
//! long as nothing else needs the tick: no other task is runnable, the task
//! has no POSIX CPU timers, and RCU is not waiting on the CPU. While the tick
//! is stopped, CPU time is accounted at every user/kernel boundary crossing
//! instead of on each tick.
use super::{AccountingReason, TickMode, TickSched, TickState};
use crate::{duty::Claimant, CpuId, Platform};

impl<P: Platform> TickSched<P> {
    /// Returns `true` if `cpu` may run its current task without the tick.
    ///
    /// This also updates the CPU's busy-adaptive mark in the
    /// [`DutyRegistry`](crate::DutyRegistry) to match the answer.
    pub fn eligible(&self, cpu: CpuId) -> bool {
        let eligible = self.platform.sched_can_stop_tick(cpu)
            && !self.platform.posix_timers_active(cpu)
            && !self.platform.rcu_pending(cpu);

        if eligible {
            self.duty.mark_busy_adaptive(cpu);
        } else {
            self.duty.clear_busy_adaptive(cpu);
        }
        eligible
    }

    /// Tries to stop `cpu`'s tick while it runs a task.
    ///
    /// The tick is only stopped when interrupting user mode, or a kernel
    /// thread: stopping it on the way back from a system call would charge the
    /// following user time to the kernel.
    pub fn cpuset_stop_tick(&self, cpu: CpuId) {
        let mut ts = self.lock(cpu);
        self.adaptive_stop_tick(cpu, &mut ts);
    }

    /// Called when the task on `cpu` enters the kernel from user mode.
    ///
    /// If the task is running tickless, the user time since the last crossing
    /// is charged and the CPU starts saving system time. Between
    /// [`TickSched::pre_schedule`] and [`TickSched::post_schedule`] the tick
    /// may still be stopped, but no task is running tickless.
    pub fn on_kernel_entry(&self, cpu: CpuId) {
        let mut ts = self.lock(cpu);
        if !ts.running_tickless() {
            return;
        }

        self.exit_qs(cpu, &mut ts);
        nohz_util::warn_on_once!(
            ts.saved_reason != AccountingReason::User,
            "{} entered the kernel while saving {:?} time",
            cpu,
            ts.saved_reason
        );
        self.flush(cpu, &mut ts);
        ts.saved_reason = AccountingReason::System;
    }

    /// Called when the task on `cpu` returns to user mode.
    ///
    /// If the task is running tickless, the system time since the last
    /// crossing is charged and the CPU starts saving user time. RCU is told the CPU is in
    /// an extended quiescent state.
    pub fn on_kernel_exit(&self, cpu: CpuId) {
        let mut ts = self.lock(cpu);
        if !ts.running_tickless() {
            return;
        }

        nohz_util::warn_on_once!(
            ts.saved_reason != AccountingReason::System,
            "{} returned to user mode while saving {:?} time",
            cpu,
            ts.saved_reason
        );
        self.flush(cpu, &mut ts);
        ts.saved_reason = AccountingReason::User;
        self.enter_qs(cpu, &mut ts);
    }

    /// Called on exception entry. Only exceptions taken from user mode cross
    /// the accounting boundary.
    pub fn on_exception_entry(&self, cpu: CpuId, user_mode: bool) {
        if user_mode {
            self.on_kernel_entry(cpu);
        }
    }

    /// Called on exception exit. Only exceptions returning to user mode cross
    /// the accounting boundary.
    pub fn on_exception_exit(&self, cpu: CpuId, user_mode: bool) {
        if user_mode {
            self.on_kernel_exit(cpu);
        }
    }

    /// Rechecks, from the scheduler, whether `cpu` can keep running its task
    /// without the tick, restarting the tick if not.
    pub fn check_adaptive_still_eligible(&self, cpu: CpuId) {
        let mut ts = self.lock(cpu);
        if ts.tick_stopped && !self.platform.current(cpu).idle && !self.eligible(cpu) {
            self.restart_adaptive(cpu, &mut ts);
        }
    }

    /// Handles a request from another CPU to leave adaptive tickless mode.
    ///
    /// This is the handler for the IPI sent by
    /// [`TickSched::request_adaptive_exit`].
    pub fn force_exit_adaptive(&self, cpu: CpuId) {
        let mut ts = self.lock(cpu);
        tracing::debug!(%cpu, stopped = ts.tick_stopped, "nohz exit requested");
        if ts.tick_stopped && !self.platform.current(cpu).idle {
            self.restart_adaptive(cpu, &mut ts);
        }
    }

    /// Asks `target` to leave adaptive tickless mode.
    ///
    /// The request is delivered asynchronously; `target` handles it with
    /// [`TickSched::force_exit_adaptive`].
    pub fn request_adaptive_exit(&self, target: CpuId) {
        tracing::trace!(%target, "sending nohz exit ipi");
        self.platform.send_nohz_exit_ipi(target);
    }

    /// Called before a context switch on `cpu`.
    ///
    /// Closes the outgoing task's accounting. The tick is not restarted here,
    /// since the scheduler holds its run queue lock; see
    /// [`TickSched::post_schedule`].
    pub fn pre_schedule(&self, cpu: CpuId) {
        let mut ts = self.lock(cpu);
        if ts.tick_stopped {
            self.flush_times(cpu, &mut ts, true);
            ts.nohz_flag = false;
        }
    }

    /// Called after a context switch on `cpu`.
    ///
    /// If the tick is still stopped, switching to the idle task starts saving
    /// idle time; switching to any other task restarts the tick.
    pub fn post_schedule(&self, cpu: CpuId) {
        let mut ts = self.lock(cpu);
        if !ts.tick_stopped {
            return;
        }

        if self.platform.current(cpu).idle {
            self.save_ticks(&mut ts, AccountingReason::Idle);
        } else {
            let now = self.platform.now();
            self.restart_tick(cpu, &mut ts, now);
        }
    }

    /// Charges the ticks saved on `cpu` so far.
    ///
    /// If `restart_tick` is `true`, the tick is about to restart and saving
    /// stops; otherwise saving continues from the current tick count.
    pub fn flush_current_times(&self, cpu: CpuId, restart_tick: bool) {
        let mut ts = self.lock(cpu);
        self.flush_times(cpu, &mut ts, restart_tick);
    }

    /// Restarts `cpu`'s tick if it is stopped.
    pub fn restart_sched_tick(&self, cpu: CpuId) {
        let mut ts = self.lock(cpu);
        if !ts.tick_stopped {
            return;
        }
        let now = self.platform.now();
        self.restart_tick(cpu, &mut ts, now);
    }

    pub(super) fn adaptive_stop_tick(&self, cpu: CpuId, ts: &mut TickState) {
        let current = self.platform.current(cpu);
        if !self.platform.cpu_in_adaptive_set(cpu) || current.idle {
            return;
        }

        if !ts.tick_stopped && ts.mode == TickMode::Inactive {
            return;
        }

        if !self.eligible(cpu) {
            return;
        }

        if !current.user_mode && current.has_mm {
            return;
        }

        let was_stopped = ts.tick_stopped;
        let claimant = Claimant {
            cpu,
            idle: false,
            adaptive: true,
        };
        let now = self.platform.now();
        self.stop_tick(cpu, ts, now, claimant);

        if was_stopped || !ts.tick_stopped {
            return;
        }

        if nohz_util::warn_on_once!(
            ts.saved_reason != AccountingReason::None,
            "{} stopped its tick with {:?} time still saved",
            cpu,
            ts.saved_reason
        ) {
            self.flush(cpu, ts);
        }

        let reason = if current.user_mode {
            AccountingReason::User
        } else {
            AccountingReason::System
        };
        self.save_ticks(ts, reason);
        if current.user_mode {
            self.enter_qs(cpu, ts);
        }
        ts.nohz_flag = true;
        tracing::debug!(%cpu, ?reason, "task running tickless");
    }

    fn restart_adaptive(&self, cpu: CpuId, ts: &mut TickState) {
        let now = self.platform.now();
        // catch up first, so that the flush sees every tick skipped so far
        self.jiffies.advance(now);
        self.flush_times(cpu, ts, true);
        self.duty.clear_busy_adaptive(cpu);
        if ts.tick_stopped {
            self.restart_tick(cpu, ts, now);
        }
        ts.nohz_flag = false;
        self.exit_qs(cpu, ts);
        tracing::debug!(%cpu, "task tickless mode ended");
    }

    fn flush_times(&self, cpu: CpuId, ts: &mut TickState, restart_tick: bool) {
        if !ts.tick_stopped {
            return;
        }
        // `flush` re-snapshots the tick count, so saving continues from here
        // unless the tick is about to restart.
        self.flush(cpu, ts);
        if restart_tick {
            ts.saved_reason = AccountingReason::None;
        }
    }

    fn enter_qs(&self, cpu: CpuId, ts: &mut TickState) {
        if !ts.ext_qs {
            ts.ext_qs = true;
            self.platform.rcu_user_enter(cpu);
        }
    }

    fn exit_qs(&self, cpu: CpuId, ts: &mut TickState) {
        if ts.ext_qs {
            ts.ext_qs = false;
            self.platform.rcu_user_exit(cpu);
        }
    }
}

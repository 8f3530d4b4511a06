//! The interface between tick scheduling and the rest of the kernel.
//!
//! Tick scheduling makes its decisions using information owned by other
//! subsystems: the scheduler's run queues, the pending timer wheel, RCU, and
//! CPU-time accounting. Those subsystems are reached through the [`Platform`]
//! trait, which also provides the timekeeping hardware via the [`Clock`] and
//! [`EventDevice`] supertraits.
//!
//! # Reentrancy
//!
//! `Platform` methods are called while the calling CPU's tick state is
//! locked. Implementations must not call back into the
//! [`TickSched`](crate::TickSched) entry points for the same CPU from inside
//! a `Platform` method.
use crate::{Clock, CpuId, EventDevice};

/// The CPU-time accounting bucket that skipped ticks are charged to.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum AccountKind {
    /// Time spent in the idle task.
    Idle,
    /// Time spent by the current task in user mode.
    User,
    /// Time spent by the current task in kernel mode.
    System,
}

/// What the CPU is currently executing, as seen from an interrupt.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct TaskContext {
    /// The idle task is running.
    pub idle: bool,
    /// The interrupted context was executing in user mode.
    pub user_mode: bool,
    /// The current task has a user address space. Kernel threads do not.
    pub has_mm: bool,
}

/// Services consumed by tick scheduling.
///
/// Hooks with a default implementation are optional: the defaults describe a
/// platform with no such facility.
pub trait Platform: Clock + EventDevice + Send + Sync {
    /// Returns `true` if another task is ready to run on `cpu`.
    fn need_resched(&self, cpu: CpuId) -> bool;

    /// Returns the mask of soft interrupts pending on `cpu`.
    fn pending_softirqs(&self, cpu: CpuId) -> u32 {
        let _ = cpu;
        0
    }

    /// Raises the timer soft interrupt on `cpu`, so that expired timers are
    /// processed even though no tick fired.
    fn raise_timer_softirq(&self, cpu: CpuId);

    /// Returns the jiffy at which the next pending software timer on `cpu`
    /// expires, given that the current jiffy is `after`.
    ///
    /// If no timer is pending, an implementation should return a value at
    /// least [`NEXT_TIMER_MAX_DELTA`](crate::NEXT_TIMER_MAX_DELTA) jiffies
    /// after `after`.
    fn next_timer_interrupt(&self, cpu: CpuId, after: u64) -> u64;

    /// Returns `true` if RCU needs `cpu` to keep ticking (e.g. it has
    /// callbacks queued).
    fn rcu_needs_cpu(&self, cpu: CpuId) -> bool {
        let _ = cpu;
        false
    }

    /// Returns `true` if architecture-specific work needs periodic ticks on
    /// `cpu`.
    fn arch_needs_cpu(&self, cpu: CpuId) -> bool {
        let _ = cpu;
        false
    }

    /// Returns `true` if RCU is waiting for a quiescent state from `cpu`.
    fn rcu_pending(&self, cpu: CpuId) -> bool {
        let _ = cpu;
        false
    }

    /// Notifies RCU that `cpu` entered user mode with its tick stopped, which
    /// is an extended quiescent state.
    fn rcu_user_enter(&self, cpu: CpuId) {
        let _ = cpu;
    }

    /// Notifies RCU that `cpu` left the extended quiescent state entered by
    /// [`Platform::rcu_user_enter`].
    fn rcu_user_exit(&self, cpu: CpuId) {
        let _ = cpu;
    }

    /// Returns `true` if the task currently running on `cpu` has POSIX CPU
    /// timers armed, which are driven by the tick.
    fn posix_timers_active(&self, cpu: CpuId) -> bool {
        let _ = cpu;
        false
    }

    /// Returns `true` if the scheduler can run without the tick on `cpu`,
    /// i.e. at most one task is runnable there.
    fn sched_can_stop_tick(&self, cpu: CpuId) -> bool;

    /// Returns `true` if `cpu` belongs to a CPU set that allows adaptive
    /// (non-idle) tick suppression.
    fn cpu_in_adaptive_set(&self, cpu: CpuId) -> bool {
        let _ = cpu;
        false
    }

    /// Describes what `cpu` is currently executing.
    fn current(&self, cpu: CpuId) -> TaskContext;

    /// Returns the number of tasks on `cpu` blocked waiting for I/O.
    fn nr_iowait(&self, cpu: CpuId) -> usize {
        let _ = cpu;
        0
    }

    /// Returns `true` if `cpu` is online.
    fn cpu_online(&self, cpu: CpuId) -> bool {
        let _ = cpu;
        true
    }

    /// Charges `ticks` ticks of CPU time on `cpu` to the `kind` bucket.
    fn account_ticks(&self, kind: AccountKind, cpu: CpuId, ticks: u64);

    /// Sends the "leave adaptive tickless mode" inter-processor interrupt to
    /// `target`, whose handler must call
    /// [`TickSched::force_exit_adaptive`](crate::TickSched::force_exit_adaptive).
    fn send_nohz_exit_ipi(&self, target: CpuId) {
        let _ = target;
    }
}

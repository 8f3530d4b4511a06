//! Per-CPU tick scheduling.
//!
//! [`TickSched`] owns the tick state of every CPU, the global [`Jiffies`] time
//! base, and the [`DutyRegistry`]. Its methods are the hooks that the rest of
//! the kernel calls from the idle loop, interrupt entry and exit, the
//! scheduler, and the user/kernel boundary, always passing the CPU they are
//! running on.
//!
//! Each CPU's state is kept behind a spinlock that is only ever contended
//! during cross-CPU inspection (statistics, idle time queries, teardown). The
//! steady-state hooks only touch their own CPU's state and the lock-free
//! global structures.
use crate::{
    config::{Config, Tunables},
    duty::DutyRegistry,
    jiffies::Jiffies,
    loom::sync::atomic::{AtomicBool, AtomicUsize, Ordering::*},
    platform::Platform,
    CpuId, Instant,
};
use alloc::boxed::Box;
use core::{fmt, time::Duration};
use maitake_sync::{
    blocking::{Mutex, MutexGuard},
    spin::Spinlock,
};

mod account;
mod adaptive;
mod idle;
mod timer;

pub use self::account::AccountingReason;
use self::timer::SchedTimer;

/// Tick scheduling for a fixed set of CPUs.
///
/// # Panics
///
/// Methods taking a [`CpuId`] panic if it is not less than the number of CPUs
/// this `TickSched` was created for, unless documented otherwise.
pub struct TickSched<P> {
    platform: P,
    tunables: Tunables,
    jiffies: Jiffies,
    duty: DutyRegistry,
    cpus: Box<[PerCpu]>,
}

/// How a CPU's tick is currently generated.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub enum TickMode {
    /// The tick is driven by a periodic event device and cannot be stopped.
    #[default]
    Inactive,
    /// The event device runs in oneshot mode and is reprogrammed for every
    /// tick.
    LowRes,
    /// The tick is emulated by a high-resolution timer.
    HighRes,
}

/// A snapshot of a CPU's tick scheduling state, returned by
/// [`TickSched::stats`].
#[derive(Copy, Clone, Debug, PartialEq)]
#[non_exhaustive]
pub struct TickStats {
    pub mode: TickMode,
    pub tick_stopped: bool,
    /// The CPU is inside the idle loop.
    pub in_idle: bool,
    /// Idle time is currently being accounted.
    pub idle_active: bool,
    /// The CPU is marked as busy-adaptive in the duty registry.
    pub busy_adaptive: bool,
    pub idle_entry_time: Instant,
    pub idle_exit_time: Instant,
    /// When an interrupt last woke the CPU from a tickless idle period.
    pub idle_waketime: Instant,
    pub idle_sleeptime: Duration,
    pub iowait_sleeptime: Duration,
    /// The number of times the idle path tried to stop the tick.
    pub idle_calls: u64,
    /// The number of times the idle path stopped or extended a stopped tick.
    pub idle_sleeps: u64,
    pub idle_expires: Instant,
    pub sleep_length: Duration,
    pub last_jiffies: u64,
    pub next_jiffies: u64,
    /// The scheduling timer's expiry when the tick was last stopped.
    pub last_tick: Instant,
    /// The deadline currently programmed on the event device.
    pub next_event: Instant,
    pub saved_jiffies: u64,
    pub saved_reason: AccountingReason,
    /// This CPU held the timekeeping duty when it last stopped its tick.
    pub do_timer_last: bool,
    /// The tick is stopped for the running task.
    pub nohz_flag: bool,
    /// RCU was told this CPU is in an extended quiescent state.
    pub ext_qs: bool,
}

struct PerCpu {
    /// Hooks run in interrupt context, so the state is guarded by a spinlock.
    state: Mutex<TickState, Spinlock>,
    /// Set when the clock source or event device changed, so that the CPU
    /// rechecks whether it can switch to oneshot operation.
    check_clocks: AtomicBool,
    nohz_on: AtomicUsize,
}

#[derive(Debug)]
struct TickState {
    mode: TickMode,
    /// The high-resolution scheduling timer has been set up.
    highres: bool,
    tick_stopped: bool,
    in_idle: bool,
    idle_active: bool,
    idle_entry_time: Instant,
    idle_exit_time: Instant,
    idle_waketime: Instant,
    idle_sleeptime: Duration,
    iowait_sleeptime: Duration,
    idle_calls: u64,
    idle_sleeps: u64,
    idle_expires: Instant,
    sleep_length: Duration,
    last_jiffies: u64,
    next_jiffies: u64,
    last_tick: Instant,
    next_event: Instant,
    saved_jiffies: u64,
    saved_reason: AccountingReason,
    do_timer_last: bool,
    nohz_flag: bool,
    ext_qs: bool,
    timer: SchedTimer,
}

impl<P: Platform> TickSched<P> {
    /// Returns tick scheduling for `ncpus` CPUs.
    ///
    /// Every CPU starts out in [`TickMode::Inactive`], and the boot CPU holds
    /// the timekeeping duty. The time base starts at the platform's current
    /// time.
    pub fn new(platform: P, ncpus: usize, config: &Config) -> Self {
        let jiffies = Jiffies::new(config.tick_period(), platform.now());
        jiffies.init_or_get_next_deadline();
        tracing::info!(
            ncpus,
            enabled = config.enabled(),
            tick_period = ?config.tick_period(),
            nohz_tick_period = ?config.nohz_tick_period(),
            cpus_per_domain = config.cpus_per_domain(),
            "tick scheduling initialized"
        );
        Self {
            platform,
            tunables: Tunables::new(config),
            jiffies,
            duty: DutyRegistry::new(ncpus, Some(CpuId::BOOT)),
            cpus: (0..ncpus).map(|_| PerCpu::new()).collect(),
        }
    }

    #[must_use]
    pub fn platform(&self) -> &P {
        &self.platform
    }

    #[must_use]
    pub fn tunables(&self) -> &Tunables {
        &self.tunables
    }

    #[must_use]
    pub fn jiffies(&self) -> &Jiffies {
        &self.jiffies
    }

    #[must_use]
    pub fn duty(&self) -> &DutyRegistry {
        &self.duty
    }

    #[must_use]
    pub fn ncpus(&self) -> usize {
        self.cpus.len()
    }

    /// Changes the base tick period. A zero period is ignored.
    pub fn set_tick_period(&self, period: Duration) -> bool {
        self.jiffies.set_period(period)
    }

    #[must_use]
    pub fn mode(&self, cpu: CpuId) -> TickMode {
        self.lock(cpu).mode
    }

    #[must_use]
    pub fn is_tick_stopped(&self, cpu: CpuId) -> bool {
        self.lock(cpu).tick_stopped
    }

    /// Returns a snapshot of `cpu`'s tick state.
    #[must_use]
    pub fn stats(&self, cpu: CpuId) -> TickStats {
        let busy_adaptive = self.duty.is_busy_adaptive(cpu);
        self.lock(cpu).stats(busy_adaptive)
    }

    /// Returns the length of `cpu`'s current tickless sleep, as computed when
    /// the tick was last stopped or extended.
    #[must_use]
    pub fn get_sleep_length(&self, cpu: CpuId) -> Duration {
        self.lock(cpu).sleep_length
    }

    // === per-CPU nohz domains ===

    /// Returns `true` if `cpu` has been marked nohz-on. Out of range CPUs are
    /// never nohz-on.
    #[must_use]
    pub fn cpu_nohz_on(&self, cpu: CpuId) -> bool {
        self.cpus
            .get(cpu.as_usize())
            .map_or(false, |slot| slot.nohz_on.load(Acquire) > 0)
    }

    /// Adds (`on == true`) or drops a nohz-on reference for `cpu`.
    ///
    /// The reference count never goes below zero.
    pub fn set_cpu_nohz(&self, cpu: CpuId, on: bool) {
        let nohz_on = &self.slot(cpu).nohz_on;
        let count = if on {
            nohz_on.fetch_add(1, AcqRel) + 1
        } else {
            match nohz_on.fetch_update(AcqRel, Acquire, |n| n.checked_sub(1)) {
                Ok(prev) => prev - 1,
                Err(_) => 0,
            }
        };
        tracing::debug!(%cpu, nohz_on = count, "nohz reference changed");
    }

    /// Returns the CPU that should handle timers on behalf of `cpu`.
    ///
    /// A nohz-on CPU redirects to the first CPU of its domain. Other CPUs,
    /// including out of range ones, are their own target.
    #[must_use]
    pub fn nohz_target(&self, cpu: CpuId) -> CpuId {
        if !self.cpu_nohz_on(cpu) {
            return cpu;
        }
        let per_domain = self.tunables.cpus_per_domain().max(1);
        let first = (cpu.as_usize() / per_domain) * per_domain;
        u32::try_from(first).map_or(cpu, CpuId::new)
    }

    /// Returns the tick period used for `cpu`'s scheduling timer.
    #[must_use]
    pub fn cpu_tick_period(&self, cpu: CpuId) -> Duration {
        if self.cpu_nohz_on(cpu) {
            self.tunables.nohz_tick_period()
        } else {
            self.jiffies.period()
        }
    }

    // === internals ===

    fn slot(&self, cpu: CpuId) -> &PerCpu {
        &self.cpus[cpu.as_usize()]
    }

    fn lock(&self, cpu: CpuId) -> MutexGuard<'_, TickState, Spinlock> {
        self.slot(cpu).state.lock()
    }
}

impl<P: fmt::Debug> fmt::Debug for TickSched<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TickSched")
            .field("platform", &self.platform)
            .field("tunables", &self.tunables)
            .field("jiffies", &self.jiffies)
            .field("duty", &self.duty)
            .field("ncpus", &self.cpus.len())
            .finish()
    }
}

// === impl PerCpu ===

impl PerCpu {
    fn new() -> Self {
        Self {
            state: Mutex::new_with_raw_mutex(TickState::new(), Spinlock::new()),
            check_clocks: AtomicBool::new(false),
            nohz_on: AtomicUsize::new(0),
        }
    }
}

// === impl TickState ===

impl TickState {
    fn new() -> Self {
        Self {
            mode: TickMode::Inactive,
            highres: false,
            tick_stopped: false,
            in_idle: false,
            idle_active: false,
            idle_entry_time: Instant::ZERO,
            idle_exit_time: Instant::ZERO,
            idle_waketime: Instant::ZERO,
            idle_sleeptime: Duration::ZERO,
            iowait_sleeptime: Duration::ZERO,
            idle_calls: 0,
            idle_sleeps: 0,
            idle_expires: Instant::ZERO,
            sleep_length: Duration::ZERO,
            last_jiffies: 0,
            next_jiffies: 0,
            last_tick: Instant::ZERO,
            next_event: Instant::MAX,
            saved_jiffies: 0,
            saved_reason: AccountingReason::None,
            do_timer_last: false,
            nohz_flag: false,
            ext_qs: false,
            timer: SchedTimer::new(),
        }
    }

    /// The tick is stopped on behalf of the task, rather than by the idle loop
    /// or across a context switch.
    fn running_tickless(&self) -> bool {
        self.tick_stopped && self.nohz_flag
    }

    fn stats(&self, busy_adaptive: bool) -> TickStats {
        TickStats {
            mode: self.mode,
            tick_stopped: self.tick_stopped,
            in_idle: self.in_idle,
            idle_active: self.idle_active,
            busy_adaptive,
            idle_entry_time: self.idle_entry_time,
            idle_exit_time: self.idle_exit_time,
            idle_waketime: self.idle_waketime,
            idle_sleeptime: self.idle_sleeptime,
            iowait_sleeptime: self.iowait_sleeptime,
            idle_calls: self.idle_calls,
            idle_sleeps: self.idle_sleeps,
            idle_expires: self.idle_expires,
            sleep_length: self.sleep_length,
            last_jiffies: self.last_jiffies,
            next_jiffies: self.next_jiffies,
            last_tick: self.last_tick,
            next_event: self.next_event,
            saved_jiffies: self.saved_jiffies,
            saved_reason: self.saved_reason,
            do_timer_last: self.do_timer_last,
            nohz_flag: self.nohz_flag,
            ext_qs: self.ext_qs,
        }
    }
}

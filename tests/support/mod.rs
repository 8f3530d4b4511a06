#![allow(dead_code)]
//! A simulated platform for driving `TickSched` from tests.
use nohz::{
    AccountKind, AlreadyPast, Clock, Config, CpuId, EventDevice, Instant, Platform, TaskContext,
    TickSched, NEXT_TIMER_MAX_DELTA,
};
use std::{collections::HashMap, sync::Mutex, time::Duration};

pub const TICK: Duration = Duration::from_millis(1);

/// The mock clock starts here, so that the time base never sits at zero.
pub const BOOT: Instant = Instant::from_nanos(1_000_000_000);

pub fn trace_init() -> impl Drop {
    use tracing_subscriber::{prelude::*, EnvFilter};
    let filter = EnvFilter::from_env("RUST_LOG");
    tracing_subscriber::fmt()
        .with_test_writer()
        .without_time()
        .with_env_filter(filter)
        .finish()
        .set_default()
}

pub fn cpu(n: u32) -> CpuId {
    CpuId::new(n)
}

/// Returns the instant `ticks` tick periods after boot.
pub fn at_tick(ticks: u64) -> Instant {
    BOOT + TICK * ticks as u32
}

#[derive(Debug)]
pub struct MockPlatform {
    state: Mutex<State>,
}

#[derive(Debug)]
pub struct State {
    pub now: Instant,
    pub max_deferment: Duration,
    pub highres_ok: bool,
    pub cpus: Vec<MockCpu>,
    pub accounted: HashMap<(AccountKind, CpuId), u64>,
}

#[derive(Debug, Clone)]
pub struct MockCpu {
    pub need_resched: bool,
    pub softirqs: u32,
    /// The jiffy at which the next software timer expires.
    pub next_timer: Option<u64>,
    pub rcu_needs_cpu: bool,
    pub rcu_pending: bool,
    pub posix_timers: bool,
    pub runnable: usize,
    pub adaptive_set: bool,
    pub current: TaskContext,
    pub iowait: usize,
    pub online: bool,
    pub oneshot: bool,
    pub armed: Option<Instant>,
    pub programmed: Vec<Instant>,
    pub cancels: usize,
    pub timer_softirqs: usize,
    pub ipis: usize,
    pub rcu_user: bool,
}

impl MockPlatform {
    pub fn new(ncpus: usize) -> Self {
        Self {
            state: Mutex::new(State {
                now: BOOT,
                max_deferment: Duration::from_secs(10),
                highres_ok: true,
                cpus: vec![MockCpu::default(); ncpus],
                accounted: HashMap::new(),
            }),
        }
    }

    pub fn with<T>(&self, f: impl FnOnce(&mut State) -> T) -> T {
        f(&mut self.state.lock().unwrap())
    }

    pub fn cpu<T>(&self, cpu: CpuId, f: impl FnOnce(&mut MockCpu) -> T) -> T {
        self.with(|state| f(&mut state.cpus[cpu.as_usize()]))
    }

    pub fn set_now(&self, now: Instant) {
        self.with(|state| {
            assert!(now >= state.now, "mock clock must not go backwards");
            state.now = now;
        })
    }

    pub fn advance(&self, by: Duration) {
        self.with(|state| state.now += by)
    }

    pub fn set_max_deferment(&self, max: Duration) {
        self.with(|state| state.max_deferment = max)
    }

    pub fn accounted(&self, kind: AccountKind, cpu: CpuId) -> u64 {
        self.with(|state| state.accounted.get(&(kind, cpu)).copied().unwrap_or(0))
    }

    pub fn total_accounted(&self, cpu: CpuId) -> u64 {
        [AccountKind::Idle, AccountKind::User, AccountKind::System]
            .into_iter()
            .map(|kind| self.accounted(kind, cpu))
            .sum()
    }

    pub fn programmed(&self, cpu: CpuId) -> Vec<Instant> {
        self.cpu(cpu, |c| c.programmed.clone())
    }

    pub fn last_programmed(&self, cpu: CpuId) -> Option<Instant> {
        self.cpu(cpu, |c| c.programmed.last().copied())
    }

    pub fn armed(&self, cpu: CpuId) -> Option<Instant> {
        self.cpu(cpu, |c| c.armed)
    }

    /// Puts the idle task on `cpu`.
    pub fn run_idle(&self, cpu: CpuId) {
        self.cpu(cpu, |c| {
            c.current = TaskContext {
                idle: true,
                user_mode: false,
                has_mm: false,
            };
            c.runnable = 0;
        })
    }

    /// Puts a single user task on `cpu`, interrupted in user mode.
    pub fn run_user_task(&self, cpu: CpuId) {
        self.cpu(cpu, |c| {
            c.current = TaskContext {
                idle: false,
                user_mode: true,
                has_mm: true,
            };
            c.runnable = 1;
        })
    }
}

impl Default for MockCpu {
    fn default() -> Self {
        Self {
            need_resched: false,
            softirqs: 0,
            next_timer: None,
            rcu_needs_cpu: false,
            rcu_pending: false,
            posix_timers: false,
            runnable: 1,
            adaptive_set: false,
            current: TaskContext::default(),
            iowait: 0,
            online: true,
            oneshot: true,
            armed: None,
            programmed: Vec::new(),
            cancels: 0,
            timer_softirqs: 0,
            ipis: 0,
            rcu_user: false,
        }
    }
}

impl Clock for MockPlatform {
    fn now(&self) -> Instant {
        self.with(|state| state.now)
    }

    fn max_deferment(&self) -> Duration {
        self.with(|state| state.max_deferment)
    }

    fn valid_for_highres(&self) -> bool {
        self.with(|state| state.highres_ok)
    }
}

impl EventDevice for MockPlatform {
    fn program(&self, cpu: CpuId, deadline: Instant) -> Result<(), AlreadyPast> {
        self.with(|state| {
            if deadline <= state.now {
                return Err(AlreadyPast { deadline });
            }
            let c = &mut state.cpus[cpu.as_usize()];
            c.armed = Some(deadline);
            c.programmed.push(deadline);
            Ok(())
        })
    }

    fn cancel(&self, cpu: CpuId) {
        self.cpu(cpu, |c| {
            c.armed = None;
            c.cancels += 1;
        })
    }

    fn is_armed(&self, cpu: CpuId) -> bool {
        self.with(|state| {
            let now = state.now;
            state.cpus[cpu.as_usize()]
                .armed
                .map_or(false, |deadline| deadline > now)
        })
    }

    fn oneshot_available(&self, cpu: CpuId) -> bool {
        self.cpu(cpu, |c| c.oneshot)
    }
}

impl Platform for MockPlatform {
    fn need_resched(&self, cpu: CpuId) -> bool {
        self.cpu(cpu, |c| c.need_resched)
    }

    fn pending_softirqs(&self, cpu: CpuId) -> u32 {
        self.cpu(cpu, |c| c.softirqs)
    }

    fn raise_timer_softirq(&self, cpu: CpuId) {
        self.cpu(cpu, |c| c.timer_softirqs += 1)
    }

    fn next_timer_interrupt(&self, cpu: CpuId, after: u64) -> u64 {
        self.cpu(cpu, |c| c.next_timer)
            .unwrap_or(after + NEXT_TIMER_MAX_DELTA)
    }

    fn rcu_needs_cpu(&self, cpu: CpuId) -> bool {
        self.cpu(cpu, |c| c.rcu_needs_cpu)
    }

    fn rcu_pending(&self, cpu: CpuId) -> bool {
        self.cpu(cpu, |c| c.rcu_pending)
    }

    fn rcu_user_enter(&self, cpu: CpuId) {
        self.cpu(cpu, |c| c.rcu_user = true)
    }

    fn rcu_user_exit(&self, cpu: CpuId) {
        self.cpu(cpu, |c| c.rcu_user = false)
    }

    fn posix_timers_active(&self, cpu: CpuId) -> bool {
        self.cpu(cpu, |c| c.posix_timers)
    }

    fn sched_can_stop_tick(&self, cpu: CpuId) -> bool {
        self.cpu(cpu, |c| c.runnable <= 1)
    }

    fn cpu_in_adaptive_set(&self, cpu: CpuId) -> bool {
        self.cpu(cpu, |c| c.adaptive_set)
    }

    fn current(&self, cpu: CpuId) -> TaskContext {
        self.cpu(cpu, |c| c.current)
    }

    fn nr_iowait(&self, cpu: CpuId) -> usize {
        self.cpu(cpu, |c| c.iowait)
    }

    fn cpu_online(&self, cpu: CpuId) -> bool {
        self.cpu(cpu, |c| c.online)
    }

    fn account_ticks(&self, kind: AccountKind, cpu: CpuId, ticks: u64) {
        self.with(|state| *state.accounted.entry((kind, cpu)).or_default() += ticks)
    }

    fn send_nohz_exit_ipi(&self, target: CpuId) {
        self.cpu(target, |c| c.ipis += 1)
    }
}

/// Builds a `TickSched` over `ncpus` mock CPUs, all running their high
/// resolution tick emulation, with the clock at [`BOOT`].
pub fn highres(ncpus: usize) -> TickSched<MockPlatform> {
    highres_with(ncpus, &Config::new())
}

pub fn highres_with(ncpus: usize, config: &Config) -> TickSched<MockPlatform> {
    let sched = TickSched::new(MockPlatform::new(ncpus), ncpus, config);
    for cpu in CpuId::all(ncpus) {
        sched.setup_sched_timer(cpu);
    }
    sched
}

/// Advances the mock clock to `tick` and runs the tick handler on every CPU in
/// `cpus`.
pub fn tick_to(sched: &TickSched<MockPlatform>, tick: u64, cpus: &[CpuId]) {
    sched.platform().set_now(at_tick(tick));
    for &cpu in cpus {
        sched.on_tick(cpu);
    }
}

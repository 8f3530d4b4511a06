#![cfg(not(loom))]
mod support;

use nohz::{Config, CpuId, Instant, TickMode, TickSched};
use std::time::Duration;
use support::*;

fn periodic(ncpus: usize) -> TickSched<MockPlatform> {
    TickSched::new(MockPlatform::new(ncpus), ncpus, &Config::new())
}

#[test]
fn clock_change_switches_to_lowres_nohz() {
    let _trace = trace_init();
    let sched = periodic(2);
    let (cpu0, cpu1) = (cpu(0), cpu(1));
    let platform = sched.platform();

    assert!(!sched.check_oneshot_change(cpu0, true), "nothing changed yet");
    assert_eq!(sched.mode(cpu0), TickMode::Inactive);

    sched.notify_clock_changed();
    assert!(!sched.check_oneshot_change(cpu0, true));
    assert_eq!(sched.mode(cpu0), TickMode::LowRes);
    // the first deadline, at the time base's phase, had already passed
    assert_eq!(platform.programmed(cpu0), vec![at_tick(1)]);

    // the caller switches to high resolution itself
    assert!(sched.check_oneshot_change(cpu1, false));
    assert_eq!(sched.mode(cpu1), TickMode::Inactive);
    assert!(!sched.check_oneshot_change(cpu1, false), "the change was consumed");
    sched.setup_sched_timer(cpu1);
    assert_eq!(sched.mode(cpu1), TickMode::HighRes);
}

#[test]
fn lowres_tick_rearms_itself() {
    let _trace = trace_init();
    let sched = periodic(1);
    let cpu0 = cpu(0);

    assert!(sched.switch_to_nohz(cpu0));
    for tick in 1..=3 {
        tick_to(&sched, tick, &[cpu0]);
        assert_eq!(sched.platform().armed(cpu0), Some(at_tick(tick + 1)));
    }
    assert_eq!(sched.jiffies().get(), 3);

    // a late tick skips the missed periods but keeps the phase
    sched
        .platform()
        .set_now(at_tick(7) + Duration::from_micros(250));
    sched.on_tick(cpu0);
    assert_eq!(sched.jiffies().get(), 7);
    assert_eq!(sched.platform().armed(cpu0), Some(at_tick(8)));
}

#[test]
fn lowres_idle_stops_and_restarts() {
    let _trace = trace_init();
    let sched = periodic(1);
    let cpu0 = cpu(0);
    let platform = sched.platform();

    assert!(sched.switch_to_nohz(cpu0));
    tick_to(&sched, 20, &[cpu0]);
    platform.run_idle(cpu0);
    platform.cpu(cpu0, |c| c.next_timer = Some(30));

    sched.enter_idle(cpu0);
    assert!(sched.is_tick_stopped(cpu0));
    assert_eq!(platform.armed(cpu0), Some(at_tick(30)));

    platform.set_now(at_tick(25));
    sched.on_irq_enter(cpu0);
    sched.exit_idle(cpu0);
    assert!(!sched.is_tick_stopped(cpu0));
    assert_eq!(platform.armed(cpu0), Some(at_tick(26)));
    assert_eq!(platform.cpu(cpu0, |c| c.cancels), 0, "lowres never cancels");
}

#[test]
fn oneshot_switch_needs_capable_hardware() {
    let _trace = trace_init();
    let sched = periodic(2);
    let (cpu0, cpu1) = (cpu(0), cpu(1));
    let platform = sched.platform();

    platform.cpu(cpu0, |c| c.oneshot = false);
    sched.notify_event_device_changed(cpu0);
    assert!(!sched.check_oneshot_change(cpu0, true));
    assert!(!sched.switch_to_nohz(cpu0));
    assert_eq!(sched.mode(cpu0), TickMode::Inactive);

    platform.with(|state| state.highres_ok = false);
    sched.notify_event_device_changed(cpu1);
    assert!(!sched.check_oneshot_change(cpu1, true));
    assert_eq!(sched.mode(cpu1), TickMode::Inactive);
}

#[test]
fn disabled_nohz_keeps_emulating_the_tick() {
    let _trace = trace_init();
    let config = Config::parse_args(["nohz=off"]).expect("valid args");
    let sched = highres_with(1, &config);
    let cpu0 = cpu(0);
    let platform = sched.platform();

    assert!(!sched.switch_to_nohz(cpu0));
    assert_eq!(sched.mode(cpu0), TickMode::Inactive);

    tick_to(&sched, 1, &[cpu0]);
    assert_eq!(platform.armed(cpu0), Some(at_tick(2)), "tick emulation rearms");

    platform.run_idle(cpu0);
    sched.enter_idle(cpu0);
    assert!(!sched.is_tick_stopped(cpu0));
}

#[test]
fn unassigned_duty_goes_to_whoever_ticks_first() {
    let _trace = trace_init();
    let sched = highres(2);
    let (cpu0, cpu1) = (cpu(0), cpu(1));

    assert_eq!(sched.duty().holder(), Some(CpuId::BOOT));
    assert!(sched.duty().release(CpuId::BOOT));

    tick_to(&sched, 1, &[cpu1]);
    assert_eq!(sched.duty().holder(), Some(cpu1));
    assert_eq!(sched.jiffies().get(), 1);

    // only the holder advances the time base
    tick_to(&sched, 3, &[cpu0]);
    assert_eq!(sched.jiffies().get(), 1);
    tick_to(&sched, 4, &[cpu1]);
    assert_eq!(sched.jiffies().get(), 4);
}

#[test]
fn cancelled_sched_timer_returns_to_periodic() {
    let _trace = trace_init();
    let sched = highres(2);
    let (cpu0, cpu1) = (cpu(0), cpu(1));
    let platform = sched.platform();

    tick_to(&sched, 10, &[cpu0, cpu1]);
    platform.run_idle(cpu1);
    sched.enter_idle(cpu1);
    assert!(sched.is_tick_stopped(cpu1));

    sched.cancel_sched_timer(cpu1);
    let stats = sched.stats(cpu1);
    assert_eq!(stats.mode, TickMode::Inactive);
    assert!(!stats.tick_stopped);
    assert_eq!(stats.next_event, Instant::MAX);
    assert_eq!(platform.armed(cpu1), None);
}

#[test]
fn tick_period_change_applies_to_later_periods() {
    let _trace = trace_init();
    let sched = highres(1);
    let cpu0 = cpu(0);

    tick_to(&sched, 10, &[cpu0]);
    assert!(!sched.set_tick_period(Duration::ZERO));
    assert!(sched.set_tick_period(Duration::from_millis(2)));
    assert_eq!(sched.jiffies().period(), Duration::from_millis(2));

    tick_to(&sched, 14, &[cpu0]);
    assert_eq!(sched.jiffies().get(), 12);
}

#[test]
fn nohz_on_cpus_redirect_to_their_domain() {
    let _trace = trace_init();
    let config = Config::new()
        .with_cpus_per_domain(4)
        .with_nohz_tick_period(Duration::from_millis(100));
    let sched = highres_with(8, &config);
    let (cpu1, cpu5) = (cpu(1), cpu(5));

    assert!(!sched.cpu_nohz_on(cpu5));
    assert_eq!(sched.nohz_target(cpu5), cpu5);
    assert_eq!(sched.cpu_tick_period(cpu5), Duration::from_millis(1));

    sched.set_cpu_nohz(cpu5, true);
    assert!(sched.cpu_nohz_on(cpu5));
    assert_eq!(sched.nohz_target(cpu5), cpu(4));
    assert_eq!(sched.cpu_tick_period(cpu5), Duration::from_millis(100));
    assert_eq!(sched.cpu_tick_period(cpu1), Duration::from_millis(1));

    assert!(!sched.tunables().set_cpus_per_domain(0));
    assert!(sched.tunables().set_cpus_per_domain(3));
    assert_eq!(sched.nohz_target(cpu5), cpu(3));

    // out of range cpus are never nohz-on
    assert!(!sched.cpu_nohz_on(cpu(100)));
    assert_eq!(sched.nohz_target(cpu(100)), cpu(100));
}

#[test]
fn nohz_references_are_counted() {
    let _trace = trace_init();
    let sched = highres(2);
    let cpu1 = cpu(1);

    sched.set_cpu_nohz(cpu1, true);
    sched.set_cpu_nohz(cpu1, true);
    sched.set_cpu_nohz(cpu1, false);
    assert!(sched.cpu_nohz_on(cpu1));
    sched.set_cpu_nohz(cpu1, false);
    assert!(!sched.cpu_nohz_on(cpu1));

    // never below zero
    sched.set_cpu_nohz(cpu1, false);
    sched.set_cpu_nohz(cpu1, true);
    assert!(sched.cpu_nohz_on(cpu1));
}

#[test]
fn nohz_on_cpu_ticks_at_its_own_period() {
    let _trace = trace_init();
    let sched = highres(2);
    let cpu1 = cpu(1);
    sched.tunables().set_nohz_tick_period(Duration::from_millis(100));
    sched.set_cpu_nohz(cpu1, true);

    tick_to(&sched, 1, &[cpu1]);
    assert_eq!(sched.platform().armed(cpu1), Some(at_tick(101)));
}

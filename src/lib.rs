//! Adaptive tickless tick scheduling.
//!
//! This crate decides, for each CPU of a multiprocessor, when the periodic
//! scheduler tick may be stopped, for how long, and which CPU stays
//! responsible for advancing the global [`Jiffies`] time base while the others
//! sleep. The tick may be stopped when a CPU is idle, and (adaptively) while a
//! CPU in an adaptive CPU set runs a single task.
//!
//! The rest of the kernel is reached through the [`Platform`] trait, and
//! calls back into tick scheduling through the hooks on [`TickSched`]:
//!
//! | hook                                          | called from                       |
//! |-----------------------------------------------|-----------------------------------|
//! | [`enter_idle`], [`exit_idle`]                 | the idle loop                     |
//! | [`on_irq_enter`], [`on_irq_exit`]             | interrupt entry and exit          |
//! | [`on_tick`]                                   | the scheduling timer interrupt    |
//! | [`on_kernel_entry`], [`on_kernel_exit`]       | the user/kernel boundary          |
//! | [`pre_schedule`], [`post_schedule`]           | around a context switch           |
//! | [`check_adaptive_still_eligible`]             | the scheduler tick                |
//! | [`force_exit_adaptive`]                       | the nohz exit IPI handler         |
//!
//! [`enter_idle`]: TickSched::enter_idle
//! [`exit_idle`]: TickSched::exit_idle
//! [`on_irq_enter`]: TickSched::on_irq_enter
//! [`on_irq_exit`]: TickSched::on_irq_exit
//! [`on_tick`]: TickSched::on_tick
//! [`on_kernel_entry`]: TickSched::on_kernel_entry
//! [`on_kernel_exit`]: TickSched::on_kernel_exit
//! [`pre_schedule`]: TickSched::pre_schedule
//! [`post_schedule`]: TickSched::post_schedule
//! [`check_adaptive_still_eligible`]: TickSched::check_adaptive_still_eligible
//! [`force_exit_adaptive`]: TickSched::force_exit_adaptive
#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

extern crate alloc;

#[macro_use]
mod macros;

pub mod config;
pub mod duty;
pub mod jiffies;
pub(crate) mod loom;
pub mod platform;
pub mod tick_sched;

pub use self::config::{Config, ConfigError, Tunables};
pub use self::duty::{Claimant, DutyRegistry, DutyState};
pub use self::jiffies::Jiffies;
pub use self::platform::{AccountKind, Platform, TaskContext};
pub use self::tick_sched::{AccountingReason, TickMode, TickSched, TickStats};
pub use nohz_hal_core::{AlreadyPast, Clock, CpuId, EventDevice, Instant};

/// A next timer this many jiffies away (or more) means no timer is pending.
pub const NEXT_TIMER_MAX_DELTA: u64 = (1 << 30) - 1;

#[cfg(test)]
pub(crate) mod test_util {
    pub(crate) fn trace_init() -> impl Drop {
        use tracing_subscriber::{prelude::*, EnvFilter};
        let filter = EnvFilter::from_env("RUST_LOG");
        tracing_subscriber::fmt()
            .with_test_writer()
            .without_time()
            .with_env_filter(filter)
            .with_thread_names(true)
            .finish()
            .set_default()
    }
}

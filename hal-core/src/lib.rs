//! Hardware abstractions consumed by the tick scheduling code.
//!
//! The traits in this crate describe the narrow slice of the platform's
//! timekeeping hardware that tickless operation needs: a monotonic
//! [clock](time::Clock) and a per-CPU programmable [event
//! device](time::EventDevice).
#![cfg_attr(target_os = "none", no_std)]
pub mod cpu;
pub mod time;

pub use self::cpu::CpuId;
pub use self::time::{AlreadyPast, Clock, EventDevice, Instant};

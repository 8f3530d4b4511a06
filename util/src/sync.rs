//! Synchronization primitives, and utilities for implementing them.

#[cfg(loom)]
pub use loom::sync::atomic;

#[cfg(not(loom))]
pub use core::sync::atomic;

mod ratelimit;
mod seqlock;

pub use self::ratelimit::RateLimit;
pub use self::seqlock::{SeqCount, WriteGuard};

/// A wrapper for the [`core::hint`] module that emits either [`loom`] spin loop
/// hints (when `cfg(loom)` is enabled), or real spin loop hints when loom is
/// not enabled.
///
/// [`loom`]: https://crates.io/crates/loom
pub mod hint {
    #[cfg(not(loom))]
    pub use core::hint::spin_loop;

    #[cfg(loom)]
    pub use loom::hint::spin_loop;
}

//! Utilities shared by the `nohz` crates.
//!
//! This crate provides the low-level synchronization building blocks used by
//! the tick scheduling code: a [sequence lock counter](sync::SeqCount), a
//! [log throttle](sync::RateLimit), and a [`loom`]-aware re-export of the
//! atomic types, so that the same code can be model-checked.
//!
//! [`loom`]: https://crates.io/crates/loom
#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg, doc_cfg_hide))]
#![warn(missing_docs, rustdoc::broken_intra_doc_links)]

#[macro_use]
mod macros;

pub mod sync;

pub(crate) mod loom;

#[doc(hidden)]
pub use tracing as __tracing;

//! Atomic multi-key transactions over a replicated, eventually-consistent
//! key-value store.
//!
//! A transaction writes a group of sibling keys at one timestamp. Each
//! replica keeps a write pending until a quorum of replicas acknowledged
//! the timestamp, then promotes it to stable. Readers propagate causal
//! requirements across sibling keys, so after observing one write of a
//! group they never read an older version of any of its siblings.

#[macro_use]
mod utils;

pub mod client;
pub mod server;

pub use utils::{logger_init, CbtxError, ME};

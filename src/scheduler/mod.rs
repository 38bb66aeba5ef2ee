//! Deadline Scheduler
//!
//! Implements:
//! - A registry of periodic callbacks addressed by never-reused cookies
//! - Phase-preserving firing driven by an external pump
//! - Re-entrant mutation from inside callbacks
//! - Pluggable time sources for deterministic tests

mod clock;
#[cfg(feature = "pump")]
pub mod pump;
mod registry;

pub use clock::*;
pub use registry::*;

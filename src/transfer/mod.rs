//! Item transfer protocol
//!
//! Moves an ordered set of items to or from a remote system through an
//! announce, per-item request/provide and final acknowledge exchange, with a
//! deadline and retry budget on every step.

mod config;
mod engine;
mod message;
mod session;

#[cfg(test)]
pub(crate) mod testing;

pub use config::*;
pub use engine::*;
pub use message::*;
pub use session::{
    ItemsCallback, ProgressCallback, ResultCallback, SessionKey, SessionSnapshot, SessionState,
    TransferKind,
};

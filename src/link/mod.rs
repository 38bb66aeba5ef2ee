//! Outbound message link
//!
//! The engine never owns a socket. It hands every outgoing [`WireMessage`] to
//! a [`Link`], which is expected to queue it and return immediately.

mod channel;

pub use channel::*;

use std::sync::Arc;

use crate::core::{LinkError, SystemId};
use crate::transfer::WireMessage;

/// Sends wire messages to a remote system.
///
/// Implementations MUST NOT block and MUST NOT call back into the engine from
/// `send`: the engine holds its session lock while sending.
pub trait Link<I>: Send + Sync {
    /// Queue `message` for delivery to `target`.
    fn send(&self, target: SystemId, message: WireMessage<I>) -> Result<(), LinkError>;
}

impl<I, L> Link<I> for Arc<L>
where
    L: Link<I> + ?Sized,
{
    fn send(&self, target: SystemId, message: WireMessage<I>) -> Result<(), LinkError> {
        (**self).send(target, message)
    }
}

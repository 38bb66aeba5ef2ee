//! Channel-backed link.
//!
//! Queues outgoing messages on a tokio unbounded channel. The receiving half
//! is drained by whatever task owns the real connection and its codec.

use tokio::sync::mpsc;

use super::Link;
use crate::core::{LinkError, SystemId};
use crate::transfer::WireMessage;

/// A message waiting to be written to the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct Outgoing<I> {
    /// Destination system.
    pub target: SystemId,
    /// The message.
    pub message: WireMessage<I>,
}

/// [`Link`] over a tokio unbounded channel.
#[derive(Debug)]
pub struct ChannelLink<I> {
    tx: mpsc::UnboundedSender<Outgoing<I>>,
}

impl<I> ChannelLink<I> {
    /// Create a link and the receiver its messages arrive on.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Outgoing<I>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Whether the receiving half has been dropped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl<I> Clone for ChannelLink<I> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<I: Send> Link<I> for ChannelLink<I> {
    fn send(&self, target: SystemId, message: WireMessage<I>) -> Result<(), LinkError> {
        self.tx
            .send(Outgoing { target, message })
            .map_err(|_| LinkError::Closed)
    }
}

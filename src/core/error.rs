//! Error types for the item transfer engine.

use thiserror::Error;

/// Terminal outcome of a failed transfer.
///
/// Every session resolves exactly once, either with `Ok` (success) or with one
/// of these variants. The set is flat on purpose: callers match on the exact
/// reason the remote or the engine reported.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferError {
    /// A session for the same system and category is already active.
    #[error("a transfer for this system and category is already in progress")]
    Busy,

    /// The local link refused to send a message.
    #[error("connection error: local send failed")]
    ConnectionError,

    /// The retry budget ran out without an answer.
    #[error("timeout: retries exhausted")]
    Timeout,

    /// The transfer was cancelled by the caller or the remote.
    #[error("transfer cancelled")]
    Cancelled,

    /// The remote has no room for that many items.
    #[error("remote rejected the transfer: too many items")]
    TooManyItems,

    /// The remote explicitly refused the transfer.
    #[error("remote denied the transfer")]
    Denied,

    /// The remote refused a command issued alongside the transfer.
    #[error("remote denied the command")]
    CommandDenied,

    /// The remote does not implement this category or message variant.
    #[error("remote does not support this transfer")]
    Unsupported,

    /// The remote does not support the coordinate frame of an item.
    #[error("remote does not support the item frame")]
    UnsupportedFrame,

    /// The remote found an invalid parameter in an item.
    #[error("remote reported an invalid item parameter")]
    InvalidParam,

    /// Item sequence numbers are not contiguous from zero.
    #[error("invalid item sequence")]
    InvalidSequence,

    /// The requested current item is invalid.
    #[error("invalid current item")]
    CurrentInvalid,

    /// An item belongs to a different category than the transfer.
    #[error("item category does not match the transfer category")]
    MissionTypeNotConsistent,

    /// The remote broke the exchange protocol.
    #[error("protocol error")]
    ProtocolError,

    /// A download found nothing to return.
    #[error("no items available on the remote")]
    NoMissionAvailable,

    /// Catch-all that a correct engine never produces.
    #[error("unknown error")]
    Unknown,
}

impl TransferError {
    /// Whether the failure reflects transient link trouble.
    ///
    /// Retryable failures are worth starting the transfer again for; every
    /// other variant is a definitive answer that a repeat attempt would get
    /// again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransferError::ConnectionError | TransferError::Timeout)
    }

    /// Whether the failure is a definitive answer (the opposite of
    /// [`is_retryable`](Self::is_retryable)).
    pub fn is_terminal(&self) -> bool {
        !self.is_retryable()
    }
}

/// Errors reported by a [`Link`](crate::link::Link) implementation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LinkError {
    /// The receiving side of the link is gone.
    #[error("link closed")]
    Closed,

    /// The link exists but could not queue the message.
    #[error("send failed: {0}")]
    SendFailed(String),
}

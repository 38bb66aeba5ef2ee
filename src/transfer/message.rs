//! Wire message types
//!
//! The four exchange kinds of the item transfer protocol (announce, request,
//! provide, acknowledge) plus the set-current pair. Byte framing belongs to
//! the message codec; the engine only handles these values.

use std::fmt;

use crate::core::{
    ACK_ACCEPTED, ACK_DENIED, ACK_ERROR, ACK_INVALID, ACK_INVALID_PARAM1, ACK_INVALID_PARAM7,
    ACK_INVALID_SEQUENCE, ACK_NO_SPACE, ACK_OPERATION_CANCELLED, ACK_UNSUPPORTED,
    ACK_UNSUPPORTED_FRAME, Category, TransferError,
};

/// Result code carried by an Acknowledge (MAV_MISSION_RESULT).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AckCode {
    /// Transfer accepted.
    Accepted,
    /// Generic error.
    Error,
    /// Coordinate frame not supported.
    UnsupportedFrame,
    /// Command or category not supported.
    Unsupported,
    /// Not enough room for the items.
    NoSpace,
    /// A parameter has an invalid value.
    Invalid,
    /// Parameter `n` (1..=7) has an invalid value.
    InvalidParam(u8),
    /// Item received out of sequence.
    InvalidSequence,
    /// Not accepting any items.
    Denied,
    /// Current operation was cancelled.
    OperationCancelled,
    /// Code this engine does not know.
    Other(u8),
}

impl AckCode {
    /// Whether this code accepts the transfer.
    pub fn is_accepted(&self) -> bool {
        matches!(self, AckCode::Accepted)
    }

    /// Terminal error this code resolves a session with, `None` for
    /// `Accepted`.
    pub fn to_error(&self) -> Option<TransferError> {
        let err = match self {
            AckCode::Accepted => return None,
            AckCode::Error => TransferError::ProtocolError,
            AckCode::UnsupportedFrame => TransferError::UnsupportedFrame,
            AckCode::Unsupported => TransferError::Unsupported,
            AckCode::NoSpace => TransferError::TooManyItems,
            AckCode::Invalid | AckCode::InvalidParam(_) => TransferError::InvalidParam,
            AckCode::InvalidSequence => TransferError::InvalidSequence,
            AckCode::Denied => TransferError::Denied,
            AckCode::OperationCancelled => TransferError::Cancelled,
            AckCode::Other(_) => TransferError::ProtocolError,
        };
        Some(err)
    }
}

impl From<u8> for AckCode {
    fn from(raw: u8) -> Self {
        match raw {
            ACK_ACCEPTED => AckCode::Accepted,
            ACK_ERROR => AckCode::Error,
            ACK_UNSUPPORTED_FRAME => AckCode::UnsupportedFrame,
            ACK_UNSUPPORTED => AckCode::Unsupported,
            ACK_NO_SPACE => AckCode::NoSpace,
            ACK_INVALID => AckCode::Invalid,
            ACK_INVALID_PARAM1..=ACK_INVALID_PARAM7 => {
                AckCode::InvalidParam(raw - ACK_INVALID_PARAM1 + 1)
            }
            ACK_INVALID_SEQUENCE => AckCode::InvalidSequence,
            ACK_DENIED => AckCode::Denied,
            ACK_OPERATION_CANCELLED => AckCode::OperationCancelled,
            other => AckCode::Other(other),
        }
    }
}

impl From<AckCode> for u8 {
    fn from(code: AckCode) -> u8 {
        match code {
            AckCode::Accepted => ACK_ACCEPTED,
            AckCode::Error => ACK_ERROR,
            AckCode::UnsupportedFrame => ACK_UNSUPPORTED_FRAME,
            AckCode::Unsupported => ACK_UNSUPPORTED,
            AckCode::NoSpace => ACK_NO_SPACE,
            AckCode::Invalid => ACK_INVALID,
            AckCode::InvalidParam(n) => {
                ACK_INVALID_PARAM1 + n.clamp(1, ACK_INVALID_PARAM7 - ACK_INVALID_PARAM1 + 1) - 1
            }
            AckCode::InvalidSequence => ACK_INVALID_SEQUENCE,
            AckCode::Denied => ACK_DENIED,
            AckCode::OperationCancelled => ACK_OPERATION_CANCELLED,
            AckCode::Other(raw) => raw,
        }
    }
}

impl fmt::Display for AckCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AckCode::InvalidParam(n) => write!(f, "invalid-param{n}"),
            AckCode::Other(raw) => write!(f, "unknown({raw})"),
            other => {
                let name = match other {
                    AckCode::Accepted => "accepted",
                    AckCode::Error => "error",
                    AckCode::UnsupportedFrame => "unsupported-frame",
                    AckCode::Unsupported => "unsupported",
                    AckCode::NoSpace => "no-space",
                    AckCode::Invalid => "invalid",
                    AckCode::InvalidSequence => "invalid-sequence",
                    AckCode::Denied => "denied",
                    _ => "operation-cancelled",
                };
                f.write_str(name)
            }
        }
    }
}

/// One message of the item exchange.
///
/// Exchange shape:
/// ```text
/// upload:    Announce(N) ->  <- ItemRequest(0)  Provide(0) ->  ...  <- Acknowledge
/// download:  ListRequest ->  <- Announce(N)  ItemRequest(0) ->  <- Provide(0)  ...  Acknowledge ->
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum WireMessage<I> {
    /// Ask the remote to announce its item set (download start).
    ListRequest {
        /// Collection to download.
        category: Category,
    },
    /// Number of items about to be transferred.
    Announce {
        /// Collection being transferred.
        category: Category,
        /// Item count.
        count: u16,
    },
    /// Request one item by sequence number.
    ItemRequest {
        /// Collection being transferred.
        category: Category,
        /// Requested sequence number.
        seq: u16,
    },
    /// One item.
    Provide {
        /// Collection being transferred.
        category: Category,
        /// The item, carrying its own sequence number.
        item: I,
    },
    /// Final result of a transfer.
    Acknowledge {
        /// Collection being transferred.
        category: Category,
        /// Result code.
        code: AckCode,
    },
    /// Ask the remote to make mission item `seq` current.
    SetCurrent {
        /// Mission item sequence number.
        seq: u16,
    },
    /// The remote's current mission item.
    CurrentReport {
        /// Mission item sequence number.
        seq: u16,
    },
}

impl<I> WireMessage<I> {
    /// Category this message belongs to.
    ///
    /// Set-current traffic always belongs to the mission.
    pub fn category(&self) -> Category {
        match self {
            WireMessage::ListRequest { category }
            | WireMessage::Announce { category, .. }
            | WireMessage::ItemRequest { category, .. }
            | WireMessage::Provide { category, .. }
            | WireMessage::Acknowledge { category, .. } => *category,
            WireMessage::SetCurrent { .. } | WireMessage::CurrentReport { .. } => {
                Category::Mission
            }
        }
    }

    /// Short name of the message kind, for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            WireMessage::ListRequest { .. } => "list-request",
            WireMessage::Announce { .. } => "announce",
            WireMessage::ItemRequest { .. } => "item-request",
            WireMessage::Provide { .. } => "provide",
            WireMessage::Acknowledge { .. } => "acknowledge",
            WireMessage::SetCurrent { .. } => "set-current",
            WireMessage::CurrentReport { .. } => "current-report",
        }
    }
}

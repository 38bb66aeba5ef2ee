//! Protocol constants.
//!
//! Defaults for the retry machinery and the wire result codes shared with the
//! remote (MAV_MISSION_RESULT).

use std::time::Duration;

// =============================================================================
// RETRY DEFAULTS
// =============================================================================

/// Default interval between attempts of one exchange.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(500);

/// Default number of resends after the first attempt before giving up.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Environment variable that turns on per-message transfer logging.
pub const DEBUGGING_ENV_VAR: &str = "ITEM_TRANSFER_DEBUGGING";

// =============================================================================
// SCHEDULER
// =============================================================================

/// Back-dating slack for freshly added tasks so the first tick fires them.
pub const SCHEDULER_EPSILON: Duration = Duration::from_millis(1);

/// Default pump period.
pub const DEFAULT_PUMP_PERIOD: Duration = Duration::from_millis(10);

// =============================================================================
// ACKNOWLEDGE CODES (MAV_MISSION_RESULT)
// =============================================================================

/// Transfer accepted.
pub const ACK_ACCEPTED: u8 = 0;

/// Generic error.
pub const ACK_ERROR: u8 = 1;

/// Coordinate frame not supported.
pub const ACK_UNSUPPORTED_FRAME: u8 = 2;

/// Command or category not supported.
pub const ACK_UNSUPPORTED: u8 = 3;

/// Not enough room for the items.
pub const ACK_NO_SPACE: u8 = 4;

/// One of the parameters has an invalid value.
pub const ACK_INVALID: u8 = 5;

/// First per-parameter invalid code (param1).
pub const ACK_INVALID_PARAM1: u8 = 6;

/// Last per-parameter invalid code (param7).
pub const ACK_INVALID_PARAM7: u8 = 12;

/// Item received out of sequence.
pub const ACK_INVALID_SEQUENCE: u8 = 13;

/// Not accepting any items.
pub const ACK_DENIED: u8 = 14;

/// Current operation was cancelled.
pub const ACK_OPERATION_CANCELLED: u8 = 15;

//! Category clients
//!
//! Thin handles bound to one remote system and one item category, for code
//! that only ever talks about "the geofence" or "the rally points".

mod category;

pub use category::*;

//! Core traits and identifiers.
//!
//! The engine never looks inside an item. It only needs a sequence number to
//! order items and, optionally, the category an item claims to belong to.

use std::fmt;

/// MAVLink system id of the remote component a transfer talks to.
pub type SystemId = u8;

/// Logical collection an item set belongs to.
///
/// Used to route incoming messages to the right session and to tag outgoing
/// ones. Opaque to the state machine otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Category {
    /// Mission waypoints and commands.
    Mission,
    /// Geofence vertices and circles.
    Geofence,
    /// Rally points.
    Rally,
    /// Parameter tables.
    ParameterTable,
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Category::Mission => "mission",
            Category::Geofence => "geofence",
            Category::Rally => "rally",
            Category::ParameterTable => "parameter-table",
        };
        f.write_str(name)
    }
}

/// One sequence-numbered unit of a bulk transfer.
///
/// # Requirements
///
/// - `seq` MUST be stable for the lifetime of the item
/// - items of one upload MUST be numbered `0..N-1` in order
///
/// # Example
///
/// ```
/// use item_transfer::core::{Category, Item};
///
/// #[derive(Debug, Clone)]
/// struct Waypoint {
///     seq: u16,
///     lat: i32,
///     lon: i32,
/// }
///
/// impl Item for Waypoint {
///     fn seq(&self) -> u16 {
///         self.seq
///     }
///
///     fn category(&self) -> Option<Category> {
///         Some(Category::Mission)
///     }
/// }
/// ```
pub trait Item: Clone + fmt::Debug + Send + 'static {
    /// Sequence number of this item within its transfer.
    fn seq(&self) -> u16;

    /// Category the item was built for, if it carries one.
    ///
    /// Uploads reject items whose category disagrees with the transfer.
    fn category(&self) -> Option<Category> {
        None
    }
}

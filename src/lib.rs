//! # Item Transfer
//!
//! Reliable bulk transfer of sequence-numbered items (mission waypoints,
//! geofence vertices, rally points, parameter tables) between a ground
//! station and a remote vehicle over a lossy, unordered datagram link.
//!
//! Every transfer is a three-phase exchange:
//!
//! 1. **Announce**: the sender states how many items follow
//! 2. **Request/Provide**: the receiver pulls each item by sequence number
//! 3. **Acknowledge**: the receiver reports the final result code
//!
//! Each step runs under a deadline. An expired deadline resends the last
//! message until the retry budget is spent.
//!
//! ## Feature Flags
//!
//! - `pump` (default): tokio task that drives the scheduler
//!
//! ## Modules
//!
//! - [`core`]: identifiers, the `Item` trait, constants and error types
//! - [`scheduler`]: deadline scheduler and its pump
//! - [`link`]: outbound message link
//! - [`transfer`]: wire messages and the transfer engine
//! - [`client`]: handles bound to one system and category
//!
//! ## Example Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use item_transfer::prelude::*;
//!
//! #[derive(Debug, Clone, PartialEq)]
//! struct RallyPoint {
//!     seq: u16,
//!     lat: i32,
//!     lon: i32,
//! }
//!
//! impl Item for RallyPoint {
//!     fn seq(&self) -> u16 {
//!         self.seq
//!     }
//! }
//!
//! let scheduler = Arc::new(Scheduler::new());
//! let (link, mut outgoing) = ChannelLink::<RallyPoint>::new();
//! let transfer = ItemTransfer::new(link, scheduler, TransferConfig::default());
//!
//! transfer.download_async(1, Category::Rally, |result| {
//!     println!("rally points: {result:?}");
//! });
//!
//! let first = outgoing.try_recv().unwrap();
//! assert_eq!(first.message, WireMessage::ListRequest { category: Category::Rally });
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

// Core module (always included)
pub mod core;

// Deadline scheduler
pub mod scheduler;

// Outbound link
pub mod link;

// Transfer engine
pub mod transfer;

// Category-bound handles
pub mod client;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::client::CategoryClient;
    pub use crate::core::*;
    pub use crate::link::{ChannelLink, Link, Outgoing};
    pub use crate::scheduler::{Clock, Cookie, ManualClock, Scheduler, SystemClock};
    pub use crate::transfer::*;
}

// Re-export commonly used items at crate root
pub use core::{Category, Item, LinkError, SystemId, TransferError};
pub use transfer::{ItemTransfer, TransferConfig, WireMessage};

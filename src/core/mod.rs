//! Core traits, types, and error taxonomy.
//!
//! Everything here is free of I/O and timing concerns and is shared by the
//! scheduler, the link and the transfer engine.

mod constants;
mod error;
mod traits;

pub use constants::*;
pub use error::*;
pub use traits::*;

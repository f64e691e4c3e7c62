//! Database module for apimon.
//!
//! SQLite storage for monitors, checks, incidents and alert records.

mod models;
mod store;

pub use models::*;
pub use store::*;

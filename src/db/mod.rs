//! Database module for fleetprobe.
//!
//! Holds the shared model types and the SQLite blob store used to persist
//! engine state between restarts.

mod models;
mod store;

pub use models::*;
pub use store::*;

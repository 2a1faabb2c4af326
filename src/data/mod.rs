//! Data layer module
//!
//! Handles all data persistence:
//! - Users, actors and their key material
//! - Followers, blocks and fediblocks
//! - Object and outbox records
//! - The outbound delivery queue

mod database;
mod models;

pub use database::Database;
pub use models::*;

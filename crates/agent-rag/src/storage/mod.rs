//! Memory store adapters
//!
//! Provides the store traits, a SQLite-backed store and a process-local store.

mod database;
mod memory;
mod memory_store;

pub use database::{SqliteConnector, SqliteMemoryStore, DATABASE_FILE};
pub use memory::{InMemoryStore, SharedStoreConnector};
pub use memory_store::{MemoryRecord, MemoryStore, MemoryTable, StoreConnector};

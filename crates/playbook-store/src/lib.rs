//! Generic record persistence for the playbook engine.
//!
//! The engine stores everything as entities, transactions, transaction lines,
//! relationships and dynamic fields through [`PersistenceAdapter`]. Two
//! implementations ship here: [`MemoryStore`] for tests and one-shot CLI runs,
//! and [`SqliteStore`] for a durable single-node deployment.

pub mod error;
pub mod memory;
pub mod sqlite;
pub mod storage;

pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use storage::{PersistenceAdapter, RecordFilter};

/// Shared handle to a persistence adapter.
pub type SharedStore = std::sync::Arc<dyn PersistenceAdapter>;

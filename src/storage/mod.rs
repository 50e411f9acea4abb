//! Local persistence: the lead status record and the outcome audit log.
//!
//! - [`memory`]: in-process stores (tests, demos, single-run tools)
//! - [`sql`]: SQLite/MySQL via sqlx `Any`

pub mod memory;
pub mod sql;
pub mod traits;

pub use memory::{MemoryLeadStore, MemoryOutcomeStore};
pub use sql::SqlStore;
pub use traits::{LeadStore, OutcomeStore, StorageError};

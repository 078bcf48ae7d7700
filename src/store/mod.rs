//! Persistence layer: comments, strikes, Shield actions, memoized operations.

pub mod libsql_backend;
pub mod memory;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use memory::MemoryStore;
pub use traits::{Repository, ScoreRecord, StrikeWrite, ViolationRecord};

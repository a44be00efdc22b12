//! Storage Layer - SQLite-backed persistence
//!
//! The store is consumed through a narrow interface: a transaction with a
//! locking mode, statement execution returning rows or an affected count,
//! savepoints, and live-schema introspection for migration checks.

pub mod introspect;
pub mod sqlite;

pub use introspect::{LiveColumn, LiveForeignKey, LiveIndex, LiveTable};
pub use sqlite::{Outcome, RowSet, SqliteStore, StoreTxn, TxnMode};

//! # Relmap - typed relational mapping over SQLite
//!
//! Declare entities once, get schema-checked queries, versioned migrations
//! and live query streams.
//!
//! Relmap provides:
//! - Entity metadata sealed into an immutable, versioned schema snapshot
//! - Query templates validated against the snapshot before they ever run
//! - Locked, verified migration chains with destructive recreate as an opt-in
//! - Async execution with cancellation, typed record mapping and entity helpers
//! - Live queries re-run only when a committed write touches what they read

pub mod value;
pub mod schema;
pub mod query;
pub mod storage;
pub mod migration;
pub mod access;
pub mod notify;
pub mod database;
pub mod manifest;
pub mod config;
pub mod ui;

// Re-exports for convenient access
pub use access::{AccessError, ConflictStrategy, Entity, FromRow, FromValue, QueryResult, Row};
pub use database::{Database, OpenOptions};
pub use migration::{DatabaseCallback, MigrationError, MigrationReport, MigrationStep};
pub use notify::{LiveQuery, NotificationError};
pub use query::{BindError, CompiledQuery, Params, QueryTemplate, ReturnShape};
pub use schema::{ColumnDescriptor, EntityDescriptor, SchemaError, SchemaRegistry, SchemaSnapshot};
pub use storage::SqliteStore;
pub use value::Value;

/// Result type alias for Relmap operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for Relmap operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Schema error: {0}")]
    Schema(#[from] SchemaError),

    #[error("Query error: {0}")]
    Bind(#[from] BindError),

    #[error("Migration error: {0}")]
    Migration(#[from] MigrationError),

    #[error("Access error: {0}")]
    Access(#[from] AccessError),

    #[error("Notification error: {0}")]
    Notification(#[from] NotificationError),

    #[error("Manifest error: {0}")]
    Manifest(#[from] manifest::ManifestError),

    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

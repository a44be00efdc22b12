//! Schema Registry - entity metadata for the current compiled version
//!
//! - `entity`: table, column, key and index descriptors
//! - `registry`: registration, sealing and the immutable `SchemaSnapshot`
//! - `ddl`: CREATE TABLE / CREATE INDEX generation

pub mod ddl;
pub mod entity;
pub mod registry;

pub use entity::{
    ColumnDescriptor, ColumnType, EntityBuilder, EntityDescriptor, ForeignKeyAction,
    ForeignKeyRef, IndexDescriptor, PrimaryKey,
};
pub use registry::{SchemaRegistry, SchemaSnapshot};

/// Registration-time errors. Fatal: they abort startup.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchemaError {
    #[error("Duplicate table: {0}")]
    DuplicateTable(String),

    #[error("Duplicate column {column} in table {table}")]
    DuplicateColumn { table: String, column: String },

    #[error("Invalid key on {table}: {message}")]
    InvalidKey { table: String, message: String },

    #[error("Dangling foreign key {table}.{column} -> {target}")]
    DanglingForeignKey {
        table: String,
        column: String,
        target: String,
    },

    #[error("Registry is sealed; no further registration allowed")]
    RegistrySealed,

    #[error("Registry has not been sealed")]
    NotSealed,

    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("Entity {0} declares no columns")]
    EmptyEntity(String),

    #[error("Auto-increment on {0} requires a single INTEGER primary key")]
    InvalidAutoIncrement(String),
}

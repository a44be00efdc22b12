//! Query Binder - validates SQL templates against the schema snapshot
//!
//! - `lexer`: tokenizer with byte offsets
//! - `template`: declared statement, parameters and return shape
//! - `analyzer`: table/column resolution, read/write sets, row guarantee
//! - `binder`: compile cache and parameter binding

pub mod analyzer;
pub mod binder;
pub mod lexer;
pub mod template;

pub use analyzer::{RowGuarantee, StatementKind};
pub use binder::{BoundStatement, CompiledQuery, Params, QueryBinder};
pub use template::{QueryTemplate, ReturnShape, TemplateId};

/// Compile-time query errors. Fatal for the offending query only.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BindError {
    #[error("Unknown table: {0}")]
    UnknownTable(String),

    #[error("Unknown column {column} (in {table})")]
    UnknownColumn { table: String, column: String },

    #[error("Parameter mismatch: declared {expected:?}, found {found:?}")]
    ParameterMismatch {
        expected: Vec<String>,
        found: Vec<String>,
    },

    #[error("Return shape {shape} not compatible: {reason}")]
    ShapeMismatch { shape: ReturnShape, reason: String },

    #[error("Syntax error: {0}")]
    Syntax(String),

    #[error("Unsupported statement: {0}")]
    UnsupportedStatement(String),
}

//! Access Layer - executes compiled statements and shapes their results
//!
//! Every execution runs in its own store transaction (deferred for reads,
//! immediate for writes). A write reports the tables it touched only when it
//! changed at least one row; the caller publishes them after commit.

pub mod entity;
pub mod record;
pub mod result;

pub use entity::{ConflictStrategy, Entity};
pub use record::{FromRow, FromValue, Row};
pub use result::QueryResult;

use crate::query::{BindError, BoundStatement, CompiledQuery, Params, ReturnShape};
use crate::storage::{Outcome, SqliteStore, StoreTxn, TxnMode};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const INTERRUPT_RETRY: Duration = Duration::from_millis(10);

#[derive(Debug, thiserror::Error)]
pub enum AccessError {
    #[error("Query declared single-row returned {rows} rows")]
    MultipleRowsForSingularQuery { rows: usize },

    #[error("Column {column} not in result (available: {})", .available.join(", "))]
    RecordMappingError { column: String, available: Vec<String> },

    #[error("Column {column}: cannot read {found} as {expected}")]
    TypeCoercionError {
        column: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error("Parameter mismatch: declared {expected:?}, got {found:?}")]
    ParameterMismatch {
        expected: Vec<String>,
        found: Vec<String>,
    },

    #[error("Query compilation failed: {0}")]
    Compile(BindError),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Database is closed")]
    Closed,

    #[error("Storage error: {0}")]
    Storage(#[source] rusqlite::Error),

    #[error("Worker task failed: {0}")]
    Worker(String),
}

impl From<rusqlite::Error> for AccessError {
    fn from(e: rusqlite::Error) -> Self {
        if e.sqlite_error_code() == Some(rusqlite::ErrorCode::OperationInterrupted) {
            AccessError::Cancelled
        } else {
            AccessError::Storage(e)
        }
    }
}

impl From<BindError> for AccessError {
    fn from(e: BindError) -> Self {
        match e {
            BindError::ParameterMismatch { expected, found } => {
                AccessError::ParameterMismatch { expected, found }
            }
            other => AccessError::Compile(other),
        }
    }
}

/// Execute one bound statement inside `txn`. Returns the shaped result and
/// whether the statement changed any row.
pub fn run_statement(txn: &StoreTxn<'_>, bound: &BoundStatement) -> Result<(QueryResult, bool), AccessError> {
    let query = bound.query();
    let outcome = txn.execute(bound.sql(), bound.values())?;

    let changed = match &outcome {
        Outcome::Affected(n) => *n,
        Outcome::Rows(rows) if query.is_write() => rows.rows.len().max(txn.changes() as usize),
        Outcome::Rows(_) => 0,
    };
    let changed = query.is_write() && changed > 0;

    let result = match (query.shape(), outcome) {
        (ReturnShape::Affected, Outcome::Affected(n)) => QueryResult::Affected(n),
        (ReturnShape::Affected, Outcome::Rows(rows)) => QueryResult::Affected(rows.rows.len()),
        (ReturnShape::Scalar, Outcome::Rows(rows)) => QueryResult::Scalar(
            rows.rows
                .into_iter()
                .next()
                .and_then(|r| r.into_iter().next())
                .unwrap_or_default(),
        ),
        (ReturnShape::Single, Outcome::Rows(rows)) => {
            if rows.rows.len() > 1 {
                return Err(AccessError::MultipleRowsForSingularQuery { rows: rows.rows.len() });
            }
            let columns: Arc<[String]> = Arc::from(rows.columns);
            QueryResult::Single(rows.rows.into_iter().next().map(|v| Row::new(columns, v)))
        }
        (ReturnShape::Many, Outcome::Rows(rows)) => {
            let columns: Arc<[String]> = Arc::from(rows.columns);
            QueryResult::Many(
                rows.rows
                    .into_iter()
                    .map(|v| Row::new(Arc::clone(&columns), v))
                    .collect(),
            )
        }
        (ReturnShape::Scalar, Outcome::Affected(_)) => QueryResult::Scalar(Default::default()),
        (ReturnShape::Single, Outcome::Affected(_)) => QueryResult::Single(None),
        (ReturnShape::Many, Outcome::Affected(_)) => QueryResult::Many(Vec::new()),
    };
    Ok((result, changed))
}

/// Several statements in one store transaction. Collects the write-set of
/// every statement that changed rows.
pub struct Transaction<'t> {
    txn: &'t StoreTxn<'t>,
    write_set: BTreeSet<String>,
    cancel: Option<CancellationToken>,
}

impl<'t> Transaction<'t> {
    pub(crate) fn new(txn: &'t StoreTxn<'t>, cancel: Option<CancellationToken>) -> Self {
        Self {
            txn,
            write_set: BTreeSet::new(),
            cancel,
        }
    }

    fn check_cancelled(&self) -> Result<(), AccessError> {
        match &self.cancel {
            Some(token) if token.is_cancelled() => Err(AccessError::Cancelled),
            _ => Ok(()),
        }
    }

    pub fn execute_bound(&mut self, bound: &BoundStatement) -> Result<QueryResult, AccessError> {
        self.check_cancelled()?;
        let (result, changed) = run_statement(self.txn, bound)?;
        if changed {
            self.write_set.extend(bound.query().write_set().iter().cloned());
        }
        Ok(result)
    }

    pub fn execute(&mut self, query: &Arc<CompiledQuery>, params: Params) -> Result<QueryResult, AccessError> {
        let bound = query.bind(params)?;
        self.execute_bound(&bound)
    }

    /// Row id of the most recent successful insert
    pub fn last_insert_rowid(&self) -> i64 {
        self.txn.last_insert_rowid()
    }

    pub(crate) fn finish(self) -> Result<BTreeSet<String>, AccessError> {
        self.check_cancelled()?;
        Ok(self.write_set)
    }
}

/// Run `f` in a store transaction on the blocking pool.
///
/// With a token, cancellation interrupts the running statement; the token is
/// checked again before commit so a cancelled call never leaves writes behind.
/// Returns the closure's value and the committed write-set.
pub async fn run_blocking<T, F>(
    store: Arc<SqliteStore>,
    mode: TxnMode,
    cancel: Option<CancellationToken>,
    f: F,
) -> Result<(T, BTreeSet<String>), AccessError>
where
    F: FnOnce(&mut Transaction<'_>) -> Result<T, AccessError> + Send + 'static,
    T: Send + 'static,
{
    if cancel.as_ref().is_some_and(CancellationToken::is_cancelled) {
        return Err(AccessError::Cancelled);
    }
    let ticket = store.ticket();
    let worker_store = Arc::clone(&store);
    let worker_cancel = cancel.clone();
    let mut task = tokio::task::spawn_blocking(move || {
        worker_store.transaction_with_ticket(mode, Some(ticket), |txn| {
            let mut transaction = Transaction::new(txn, worker_cancel);
            let value = f(&mut transaction)?;
            let write_set = transaction.finish()?;
            Ok::<_, AccessError>((value, write_set))
        })
    });

    let joined = match cancel {
        Some(token) => {
            tokio::select! {
                joined = &mut task => joined,
                _ = token.cancelled() => {
                    // an interrupt that lands between statements is a no-op
                    loop {
                        store.interrupt(ticket);
                        tokio::select! {
                            joined = &mut task => break joined,
                            _ = tokio::time::sleep(INTERRUPT_RETRY) => {}
                        }
                    }
                }
            }
        }
        None => task.await,
    };
    joined.map_err(|e| AccessError::Worker(e.to_string()))?
}

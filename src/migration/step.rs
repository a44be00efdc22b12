//! Migration steps

use super::MigrationError;
use crate::schema::SchemaSnapshot;
use crate::storage::StoreTxn;
use std::sync::Arc;

/// Transformation run inside the step's savepoint
pub type StepFn = Arc<dyn Fn(&StoreTxn<'_>) -> rusqlite::Result<()> + Send + Sync>;

#[derive(Clone)]
pub enum StepProcedure {
    /// Statements run in order
    Sql(Vec<String>),
    Custom(StepFn),
}

impl std::fmt::Debug for StepProcedure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepProcedure::Sql(stmts) => f.debug_tuple("Sql").field(stmts).finish(),
            StepProcedure::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Moves the schema from version `from` to version `to`; afterwards the
/// live schema must match `post`
#[derive(Debug, Clone)]
pub struct MigrationStep {
    from: u32,
    to: u32,
    procedure: StepProcedure,
    post: Arc<SchemaSnapshot>,
}

impl MigrationStep {
    pub fn sql<I, S>(from: u32, to: u32, statements: I, post: Arc<SchemaSnapshot>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            from,
            to,
            procedure: StepProcedure::Sql(statements.into_iter().map(Into::into).collect()),
            post,
        }
    }

    pub fn custom<F>(from: u32, to: u32, f: F, post: Arc<SchemaSnapshot>) -> Self
    where
        F: Fn(&StoreTxn<'_>) -> rusqlite::Result<()> + Send + Sync + 'static,
    {
        Self {
            from,
            to,
            procedure: StepProcedure::Custom(Arc::new(f)),
            post,
        }
    }

    pub fn from(&self) -> u32 {
        self.from
    }

    pub fn to(&self) -> u32 {
        self.to
    }

    pub fn procedure(&self) -> &StepProcedure {
        &self.procedure
    }

    /// Snapshot the live schema must match after this step
    pub fn post_condition(&self) -> &Arc<SchemaSnapshot> {
        &self.post
    }

    pub(crate) fn validate(&self) -> Result<(), MigrationError> {
        if self.from >= self.to {
            return Err(MigrationError::InvalidStep(format!(
                "v{} -> v{} does not move forward",
                self.from, self.to
            )));
        }
        if self.post.version() != self.to {
            return Err(MigrationError::InvalidStep(format!(
                "v{} -> v{} carries a post-condition for v{}",
                self.from,
                self.to,
                self.post.version()
            )));
        }
        Ok(())
    }

    pub(crate) fn run(&self, txn: &StoreTxn<'_>) -> Result<(), MigrationError> {
        let failed = |e: rusqlite::Error| MigrationError::StepFailed {
            from: self.from,
            to: self.to,
            message: e.to_string(),
        };
        match &self.procedure {
            StepProcedure::Sql(statements) => {
                for stmt in statements {
                    txn.execute_batch(stmt).map_err(failed)?;
                }
                Ok(())
            }
            StepProcedure::Custom(f) => f(txn).map_err(failed),
        }
    }
}

//! Query binder - compiles templates against the sealed schema and binds
//! parameter values

use super::BindError;
use super::analyzer::{RowGuarantee, StatementKind, analyze};
use super::template::{QueryTemplate, ReturnShape, TemplateId};
use crate::schema::SchemaSnapshot;
use crate::value::Value;
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// A validated template, ready to bind and execute.
///
/// Compiled once per template identity and shared through the binder cache.
#[derive(Debug)]
pub struct CompiledQuery {
    id: TemplateId,
    template: QueryTemplate,
    sql: String,
    params: Vec<String>,
    kind: StatementKind,
    read_set: BTreeSet<String>,
    write_set: BTreeSet<String>,
    result_columns: Option<Vec<String>>,
    returns_rows: bool,
    row_guarantee: RowGuarantee,
}

impl CompiledQuery {
    pub fn id(&self) -> TemplateId {
        self.id
    }

    pub fn template(&self) -> &QueryTemplate {
        &self.template
    }

    /// Rewritten SQL with `?N` placeholders
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Parameter names in position order
    pub fn params(&self) -> &[String] {
        &self.params
    }

    pub fn shape(&self) -> ReturnShape {
        self.template.shape
    }

    pub fn kind(&self) -> StatementKind {
        self.kind
    }

    pub fn is_write(&self) -> bool {
        self.kind.is_write()
    }

    /// Tables the statement reads (lowercase)
    pub fn read_set(&self) -> &BTreeSet<String> {
        &self.read_set
    }

    /// Tables the statement may write, including foreign-key cascades
    pub fn write_set(&self) -> &BTreeSet<String> {
        &self.write_set
    }

    pub fn result_columns(&self) -> Option<&[String]> {
        self.result_columns.as_deref()
    }

    pub fn returns_rows(&self) -> bool {
        self.returns_rows
    }

    pub fn row_guarantee(&self) -> RowGuarantee {
        self.row_guarantee
    }

    /// Attach values to positions. No re-validation of the statement.
    pub fn bind(self: &Arc<Self>, params: Params) -> Result<BoundStatement, BindError> {
        let values = params.into_positions(&self.params)?;
        Ok(BoundStatement {
            query: Arc::clone(self),
            values,
        })
    }
}

/// Parameter values, either by name or by position
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Params {
    named: Vec<(String, Value)>,
    positional: Vec<Value>,
}

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    /// Positional values, in declaration order
    pub fn positional<I, V>(values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Self {
            named: Vec::new(),
            positional: values.into_iter().map(Into::into).collect(),
        }
    }

    /// Set a named value (replaces an earlier value of the same name)
    pub fn set(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        let name = name.into();
        let value = value.into();
        match self.named.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = value,
            None => self.named.push((name, value)),
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.named.is_empty() && self.positional.is_empty()
    }

    fn into_positions(self, declared: &[String]) -> Result<Vec<Value>, BindError> {
        let mismatch = |found: Vec<String>| BindError::ParameterMismatch {
            expected: declared.to_vec(),
            found,
        };

        if !self.named.is_empty() && !self.positional.is_empty() {
            return Err(mismatch(vec!["<mixed named and positional values>".to_string()]));
        }

        if !self.positional.is_empty() || declared.is_empty() {
            if self.positional.len() != declared.len() || !self.named.is_empty() {
                let found = (1..=self.positional.len().max(self.named.len()))
                    .map(|i| format!("?{i}"))
                    .collect();
                return Err(mismatch(found));
            }
            return Ok(self.positional);
        }

        let names: Vec<String> = self.named.iter().map(|(n, _)| n.clone()).collect();
        if names.len() != declared.len() {
            return Err(mismatch(names));
        }
        let mut named = self.named;
        declared
            .iter()
            .map(|name| {
                named
                    .iter_mut()
                    .find(|(n, _)| n == name)
                    .map(|(_, v)| std::mem::take(v))
                    .ok_or_else(|| mismatch(names.clone()))
            })
            .collect()
    }
}

impl From<Vec<Value>> for Params {
    fn from(values: Vec<Value>) -> Self {
        Self::positional(values)
    }
}

/// A compiled query plus concrete values; immutable and reusable
#[derive(Debug, Clone)]
pub struct BoundStatement {
    query: Arc<CompiledQuery>,
    values: Vec<Value>,
}

impl BoundStatement {
    pub fn query(&self) -> &Arc<CompiledQuery> {
        &self.query
    }

    pub fn sql(&self) -> &str {
        self.query.sql()
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }
}

/// Compiles templates against one sealed snapshot and caches the results
#[derive(Debug)]
pub struct QueryBinder {
    snapshot: Arc<SchemaSnapshot>,
    cache: RwLock<HashMap<TemplateId, Arc<CompiledQuery>>>,
}

impl QueryBinder {
    pub fn new(snapshot: Arc<SchemaSnapshot>) -> Self {
        Self {
            snapshot,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn snapshot(&self) -> &Arc<SchemaSnapshot> {
        &self.snapshot
    }

    /// Validate `template` and return its compiled form. Identical templates
    /// return the same `Arc`. Failures are not cached.
    pub fn compile(&self, template: &QueryTemplate) -> Result<Arc<CompiledQuery>, BindError> {
        let id = template.identity();
        if let Some(hit) = self.cache.read().get(&id) {
            tracing::debug!("Compile cache hit for {}", id);
            return Ok(Arc::clone(hit));
        }

        tracing::debug!("Compiling {} ({})", id, template.sql);
        let analysis = analyze(template, &self.snapshot)?;
        let compiled = Arc::new(CompiledQuery {
            id,
            template: template.clone(),
            sql: analysis.sql,
            params: analysis.params,
            kind: analysis.kind,
            read_set: analysis.read_set,
            write_set: analysis.write_set,
            result_columns: analysis.result_columns,
            returns_rows: analysis.returns_rows,
            row_guarantee: analysis.row_guarantee,
        });

        // another thread may have compiled the same template meanwhile
        let mut cache = self.cache.write();
        let entry = cache.entry(id).or_insert(compiled);
        Ok(Arc::clone(entry))
    }

    /// Number of cached compiled queries
    pub fn cached(&self) -> usize {
        self.cache.read().len()
    }
}

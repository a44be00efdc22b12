//! Typed entity helpers: insert, update, delete and find by primary key.
//!
//! Statements are generated from the entity's descriptor and compiled through
//! the binder like any declared query.

use super::AccessError;
use super::record::FromRow;
use crate::query::{Params, QueryTemplate};
use crate::schema::EntityDescriptor;
use crate::schema::ddl::quote;
use crate::value::Value;
use serde::{Deserialize, Serialize};

/// A record type persisted in one table
pub trait Entity: FromRow + Send + 'static {
    const TABLE: &'static str;

    /// Column values by column name
    fn to_values(&self) -> Vec<(&'static str, Value)>;
}

/// Conflict resolution for inserts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictStrategy {
    #[default]
    Abort,
    Replace,
    Ignore,
}

impl ConflictStrategy {
    fn clause(self) -> &'static str {
        match self {
            ConflictStrategy::Abort => "INSERT INTO",
            ConflictStrategy::Replace => "INSERT OR REPLACE INTO",
            ConflictStrategy::Ignore => "INSERT OR IGNORE INTO",
        }
    }
}

fn key_predicate(entity: &EntityDescriptor) -> String {
    entity
        .primary_key
        .columns
        .iter()
        .map(|c| format!("{} = :{c}", quote(c)))
        .collect::<Vec<_>>()
        .join(" AND ")
}

pub fn insert_template(entity: &EntityDescriptor, strategy: ConflictStrategy) -> QueryTemplate {
    let columns: Vec<String> = entity.columns.iter().map(|c| quote(&c.name)).collect();
    let values: Vec<String> = entity.columns.iter().map(|c| format!(":{}", c.name)).collect();
    QueryTemplate::affected(format!(
        "{} {} ({}) VALUES ({})",
        strategy.clause(),
        quote(&entity.table),
        columns.join(", "),
        values.join(", ")
    ))
    .params(entity.column_names())
}

pub fn update_template(entity: &EntityDescriptor) -> QueryTemplate {
    let mut set: Vec<&str> = entity
        .column_names()
        .filter(|c| entity.primary_key_position(c) == 0)
        .collect();
    if set.is_empty() {
        // key-only table: a no-op update still reports whether the row exists
        set = entity.primary_key.columns.iter().map(String::as_str).collect();
    }
    let assignments: Vec<String> = set.iter().map(|c| format!("{} = :{c}", quote(c))).collect();

    let mut params: Vec<&str> = set.clone();
    for key in &entity.primary_key.columns {
        if !params.contains(&key.as_str()) {
            params.push(key.as_str());
        }
    }
    QueryTemplate::affected(format!(
        "UPDATE {} SET {} WHERE {}",
        quote(&entity.table),
        assignments.join(", "),
        key_predicate(entity)
    ))
    .params(params)
}

pub fn delete_template(entity: &EntityDescriptor) -> QueryTemplate {
    QueryTemplate::affected(format!(
        "DELETE FROM {} WHERE {}",
        quote(&entity.table),
        key_predicate(entity)
    ))
    .params(entity.primary_key.columns.iter().cloned())
}

pub fn find_template(entity: &EntityDescriptor) -> QueryTemplate {
    QueryTemplate::single(format!(
        "SELECT * FROM {} WHERE {}",
        quote(&entity.table),
        key_predicate(entity)
    ))
    .params(entity.primary_key.columns.iter().cloned())
}

/// Named parameters for `template` taken from a record's values
pub fn record_params<E: Entity>(record: &E, template: &QueryTemplate) -> Result<Params, AccessError> {
    let values = record.to_values();
    let mut params = Params::new();
    for name in &template.params {
        let value = values
            .iter()
            .find(|(column, _)| column.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.clone())
            .ok_or_else(|| AccessError::RecordMappingError {
                column: name.clone(),
                available: values.iter().map(|(c, _)| c.to_string()).collect(),
            })?;
        params = params.set(name.clone(), value);
    }
    Ok(params)
}

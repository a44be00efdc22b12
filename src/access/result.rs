//! Query results by declared shape

use super::AccessError;
use super::record::{FromRow, FromValue, Row};
use crate::value::Value;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryResult {
    /// First column of the first row; NULL when there are no rows
    Scalar(Value),
    Single(Option<Row>),
    Many(Vec<Row>),
    /// Rows written
    Affected(usize),
}

impl QueryResult {
    /// All rows carried by the result
    pub fn rows(&self) -> &[Row] {
        match self {
            QueryResult::Single(Some(row)) => std::slice::from_ref(row),
            QueryResult::Many(rows) => rows,
            _ => &[],
        }
    }

    pub fn affected(&self) -> Option<usize> {
        match self {
            QueryResult::Affected(n) => Some(*n),
            _ => None,
        }
    }

    pub fn scalar_value(&self) -> Option<&Value> {
        match self {
            QueryResult::Scalar(v) => Some(v),
            _ => None,
        }
    }

    /// Decode a scalar result as `T`
    pub fn scalar<T: FromValue>(&self) -> Result<T, AccessError> {
        let value = self.scalar_value().unwrap_or(&Value::Null);
        T::from_value(value).ok_or_else(|| AccessError::TypeCoercionError {
            column: "<scalar>".to_string(),
            expected: T::TYPE_NAME,
            found: value.type_name(),
        })
    }

    /// Decode a single-row result
    pub fn one<T: FromRow>(&self) -> Result<Option<T>, AccessError> {
        self.rows().first().map(T::from_row).transpose()
    }

    /// Decode every row
    pub fn all<T: FromRow>(&self) -> Result<Vec<T>, AccessError> {
        self.rows().iter().map(T::from_row).collect()
    }
}

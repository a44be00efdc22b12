//! Rows and typed record mapping

use super::AccessError;
use crate::value::Value;
use serde::ser::{Serialize, SerializeMap, Serializer};
use std::sync::Arc;

/// One result row. Column names are shared by every row of a result.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Arc<[String]>,
    values: Vec<Value>,
}

impl Row {
    pub fn new(columns: Arc<[String]>, values: Vec<Value>) -> Self {
        Self { columns, values }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values
    }

    /// Position of `column` (case-insensitive)
    pub fn index_of(&self, column: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.eq_ignore_ascii_case(column))
    }

    pub fn value(&self, column: &str) -> Option<&Value> {
        self.index_of(column).map(|i| &self.values[i])
    }

    /// Read `column` as `T`
    pub fn get<T: FromValue>(&self, column: &str) -> Result<T, AccessError> {
        let value = self.value(column).ok_or_else(|| AccessError::RecordMappingError {
            column: column.to_string(),
            available: self.columns.to_vec(),
        })?;
        T::from_value(value).ok_or_else(|| AccessError::TypeCoercionError {
            column: column.to_string(),
            expected: T::TYPE_NAME,
            found: value.type_name(),
        })
    }
}

impl Serialize for Row {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.values.len()))?;
        for (column, value) in self.columns.iter().zip(&self.values) {
            map.serialize_entry(column, value)?;
        }
        map.end()
    }
}

/// Conversion from a stored value. Only lossless coercions succeed.
pub trait FromValue: Sized {
    /// Name used in coercion errors
    const TYPE_NAME: &'static str;

    fn from_value(value: &Value) -> Option<Self>;
}

impl FromValue for Value {
    const TYPE_NAME: &'static str = "any";

    fn from_value(value: &Value) -> Option<Self> {
        Some(value.clone())
    }
}

impl FromValue for i64 {
    const TYPE_NAME: &'static str = "integer";

    fn from_value(value: &Value) -> Option<Self> {
        value.as_i64()
    }
}

macro_rules! impl_from_value_int {
    ($($t:ty),*) => {
        $(impl FromValue for $t {
            const TYPE_NAME: &'static str = stringify!($t);

            fn from_value(value: &Value) -> Option<Self> {
                value.as_i64().and_then(|i| <$t>::try_from(i).ok())
            }
        })*
    };
}

impl_from_value_int!(i32, u32, u64, usize);

impl FromValue for bool {
    const TYPE_NAME: &'static str = "boolean";

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Integer(0) => Some(false),
            Value::Integer(1) => Some(true),
            _ => None,
        }
    }
}

/// Largest integer magnitude an f64 represents exactly
const F64_EXACT: u64 = 1 << 53;

impl FromValue for f64 {
    const TYPE_NAME: &'static str = "real";

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Real(r) => Some(*r),
            Value::Integer(i) if i.unsigned_abs() <= F64_EXACT => Some(*i as f64),
            _ => None,
        }
    }
}

impl FromValue for String {
    const TYPE_NAME: &'static str = "text";

    fn from_value(value: &Value) -> Option<Self> {
        value.as_str().map(str::to_string)
    }
}

impl FromValue for Vec<u8> {
    const TYPE_NAME: &'static str = "blob";

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Blob(b) => Some(b.clone()),
            _ => None,
        }
    }
}

impl<T: FromValue> FromValue for Option<T> {
    const TYPE_NAME: &'static str = T::TYPE_NAME;

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Null => Some(None),
            other => T::from_value(other).map(Some),
        }
    }
}

/// Build a typed record from a row, reading columns by name
pub trait FromRow: Sized {
    fn from_row(row: &Row) -> Result<Self, AccessError>;
}

impl FromRow for Row {
    fn from_row(row: &Row) -> Result<Self, AccessError> {
        Ok(row.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row() -> Row {
        Row::new(
            Arc::from(vec!["id".to_string(), "name".to_string(), "active".to_string(), "email".to_string()]),
            vec![Value::Integer(7), Value::Text("Ann".into()), Value::Integer(1), Value::Null],
        )
    }

    #[test]
    fn test_get_by_name() {
        let row = row();
        assert_eq!(row.get::<i64>("ID").unwrap(), 7);
        assert_eq!(row.get::<String>("name").unwrap(), "Ann");
        assert!(row.get::<bool>("active").unwrap());
        assert_eq!(row.get::<Option<String>>("email").unwrap(), None);
        assert_eq!(row.get::<f64>("id").unwrap(), 7.0);
    }

    #[test]
    fn test_f64_rejects_inexact_integers() {
        assert_eq!(f64::from_value(&Value::Integer(1 << 53)), Some(9007199254740992.0));
        assert_eq!(f64::from_value(&Value::Integer(-(1 << 53))), Some(-9007199254740992.0));
        assert_eq!(f64::from_value(&Value::Integer((1 << 53) + 1)), None);
        assert_eq!(f64::from_value(&Value::Integer(i64::MIN)), None);
        assert_eq!(f64::from_value(&Value::Integer(i64::MAX)), None);
    }

    #[test]
    fn test_missing_column() {
        let err = row().get::<i64>("age").unwrap_err();
        assert!(matches!(err, AccessError::RecordMappingError { ref column, .. } if column == "age"));
    }

    #[test]
    fn test_type_mismatch() {
        let err = row().get::<i64>("name").unwrap_err();
        assert!(matches!(
            err,
            AccessError::TypeCoercionError { expected: "integer", found: "text", .. }
        ));

        // NULL only maps to Option
        assert!(matches!(row().get::<String>("email"), Err(AccessError::TypeCoercionError { .. })));

        let two = Row::new(Arc::from(vec!["flag".to_string()]), vec![Value::Integer(2)]);
        assert!(matches!(two.get::<bool>("flag"), Err(AccessError::TypeCoercionError { .. })));

        let big = Row::new(Arc::from(vec!["n".to_string()]), vec![Value::Integer(i64::MAX)]);
        assert!(matches!(big.get::<f64>("n"), Err(AccessError::TypeCoercionError { .. })));
        assert!(matches!(big.get::<i32>("n"), Err(AccessError::TypeCoercionError { .. })));
    }

    #[test]
    fn test_serializes_as_object() {
        let json = serde_json::to_string(&row()).unwrap();
        assert_eq!(json, r#"{"id":7,"name":"Ann","active":1,"email":null}"#);
    }
}

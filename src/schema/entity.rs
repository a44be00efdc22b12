//! Entity metadata - tables, columns, keys and indices
//!
//! Descriptors are plain data built with [`EntityBuilder`] (or deserialized
//! from a manifest) and checked by [`EntityDescriptor::validate`]. Checks that
//! need the whole schema (foreign keys) run when the registry is sealed.

use super::SchemaError;
use crate::value::Value;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::OnceLock;

/// Semantic column types. Booleans are stored as INTEGER 0/1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Integer,
    Text,
    Real,
    Blob,
    Boolean,
}

impl ColumnType {
    /// Declared SQL type used in generated DDL
    pub fn sql_type(&self) -> &'static str {
        match self {
            ColumnType::Integer | ColumnType::Boolean => "INTEGER",
            ColumnType::Text => "TEXT",
            ColumnType::Real => "REAL",
            ColumnType::Blob => "BLOB",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ColumnType::Integer => "integer",
            ColumnType::Text => "text",
            ColumnType::Real => "real",
            ColumnType::Blob => "blob",
            ColumnType::Boolean => "boolean",
        }
    }

    /// Affinity SQLite derives from a declared type name (section 3.1 of the
    /// SQLite datatype rules), reduced to the types we generate.
    pub fn affinity_of(declared: &str) -> &'static str {
        let upper = declared.to_ascii_uppercase();
        if upper.contains("INT") {
            "INTEGER"
        } else if upper.contains("CHAR") || upper.contains("CLOB") || upper.contains("TEXT") {
            "TEXT"
        } else if upper.is_empty() || upper.contains("BLOB") {
            "BLOB"
        } else if upper.contains("REAL") || upper.contains("FLOA") || upper.contains("DOUB") {
            "REAL"
        } else {
            "NUMERIC"
        }
    }
}

impl FromStr for ColumnType {
    type Err = SchemaError;

    fn from_str(s: &str) -> Result<Self, SchemaError> {
        match s.to_lowercase().as_str() {
            "integer" | "int" | "long" => Ok(ColumnType::Integer),
            "text" | "string" | "varchar" => Ok(ColumnType::Text),
            "real" | "float" | "double" => Ok(ColumnType::Real),
            "blob" | "bytes" => Ok(ColumnType::Blob),
            "boolean" | "bool" => Ok(ColumnType::Boolean),
            _ => Err(SchemaError::InvalidIdentifier(format!("unknown column type: {s}"))),
        }
    }
}

impl std::fmt::Display for ColumnType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Referential action for a foreign key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ForeignKeyAction {
    #[default]
    NoAction,
    Restrict,
    SetNull,
    SetDefault,
    Cascade,
}

impl ForeignKeyAction {
    pub fn as_sql(&self) -> &'static str {
        match self {
            ForeignKeyAction::NoAction => "NO ACTION",
            ForeignKeyAction::Restrict => "RESTRICT",
            ForeignKeyAction::SetNull => "SET NULL",
            ForeignKeyAction::SetDefault => "SET DEFAULT",
            ForeignKeyAction::Cascade => "CASCADE",
        }
    }

    /// Parse the action text reported by `pragma_foreign_key_list`
    pub fn from_sql(s: &str) -> Self {
        match s.to_ascii_uppercase().as_str() {
            "RESTRICT" => ForeignKeyAction::Restrict,
            "SET NULL" => ForeignKeyAction::SetNull,
            "SET DEFAULT" => ForeignKeyAction::SetDefault,
            "CASCADE" => ForeignKeyAction::Cascade,
            _ => ForeignKeyAction::NoAction,
        }
    }

    /// Whether the action makes the store write to the referencing table
    pub fn writes_child(&self) -> bool {
        matches!(
            self,
            ForeignKeyAction::Cascade | ForeignKeyAction::SetNull | ForeignKeyAction::SetDefault
        )
    }
}

/// Reference from a column to another entity's primary key
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ForeignKeyRef {
    pub table: String,
    pub column: String,
    #[serde(default)]
    pub on_delete: ForeignKeyAction,
    #[serde(default)]
    pub on_update: ForeignKeyAction,
}

/// A single column of an entity
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ColumnDescriptor {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
    #[serde(default)]
    pub nullable: bool,
    /// Default value as a SQL literal (`''`, `0`, `NULL`, ...)
    #[serde(default)]
    pub default: Option<String>,
    #[serde(default)]
    pub references: Option<ForeignKeyRef>,
}

impl ColumnDescriptor {
    /// A NOT NULL column without default
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            nullable: false,
            default: None,
            references: None,
        }
    }

    pub fn integer(name: impl Into<String>) -> Self {
        Self::new(name, ColumnType::Integer)
    }

    pub fn text(name: impl Into<String>) -> Self {
        Self::new(name, ColumnType::Text)
    }

    pub fn real(name: impl Into<String>) -> Self {
        Self::new(name, ColumnType::Real)
    }

    pub fn blob(name: impl Into<String>) -> Self {
        Self::new(name, ColumnType::Blob)
    }

    pub fn boolean(name: impl Into<String>) -> Self {
        Self::new(name, ColumnType::Boolean)
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into().to_sql_literal());
        self
    }

    pub fn references(mut self, table: impl Into<String>, column: impl Into<String>) -> Self {
        self.references = Some(ForeignKeyRef {
            table: table.into(),
            column: column.into(),
            on_delete: ForeignKeyAction::NoAction,
            on_update: ForeignKeyAction::NoAction,
        });
        self
    }

    /// Set the ON DELETE action of the foreign key declared with [`Self::references`]
    pub fn on_delete(mut self, action: ForeignKeyAction) -> Self {
        if let Some(fk) = self.references.as_mut() {
            fk.on_delete = action;
        }
        self
    }

    pub fn on_update(mut self, action: ForeignKeyAction) -> Self {
        if let Some(fk) = self.references.as_mut() {
            fk.on_update = action;
        }
        self
    }
}

/// Primary key definition (composite keys allowed)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PrimaryKey {
    pub columns: Vec<String>,
    #[serde(default)]
    pub auto_increment: bool,
}

/// Secondary index, optionally unique
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IndexDescriptor {
    pub name: String,
    pub columns: Vec<String>,
    #[serde(default)]
    pub unique: bool,
}

/// Table metadata for one entity
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityDescriptor {
    pub table: String,
    pub columns: Vec<ColumnDescriptor>,
    pub primary_key: PrimaryKey,
    #[serde(default)]
    pub indices: Vec<IndexDescriptor>,
}

fn identifier_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("static pattern"))
}

/// Check a table, column or index name
pub(crate) fn check_identifier(name: &str) -> Result<(), SchemaError> {
    if !identifier_pattern().is_match(name) {
        return Err(SchemaError::InvalidIdentifier(name.to_string()));
    }
    let lower = name.to_ascii_lowercase();
    if lower.starts_with("__schema_") || lower.starts_with("sqlite_") {
        return Err(SchemaError::InvalidIdentifier(format!("{name} uses a reserved prefix")));
    }
    Ok(())
}

impl EntityDescriptor {
    /// Start building a descriptor for `table`
    pub fn builder(table: impl Into<String>) -> EntityBuilder {
        EntityBuilder {
            table: table.into(),
            columns: Vec::new(),
            primary_keys: Vec::new(),
            auto_increment: false,
            indices: Vec::new(),
        }
    }

    /// Look up a column (identifiers are case-insensitive)
    pub fn column(&self, name: &str) -> Option<&ColumnDescriptor> {
        self.columns.iter().find(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }

    /// 1-based position of `name` in the primary key, 0 if not part of it
    pub fn primary_key_position(&self, name: &str) -> usize {
        self.primary_key
            .columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(name))
            .map_or(0, |p| p + 1)
    }

    /// Whether `name` is a single-column auto-increment key
    pub fn is_auto_increment(&self, name: &str) -> bool {
        self.primary_key.auto_increment
            && self.primary_key.columns.len() == 1
            && self.primary_key.columns[0].eq_ignore_ascii_case(name)
    }

    /// Whether the generated DDL declares the column NOT NULL.
    ///
    /// Auto-increment keys stay nullable so that inserting NULL assigns a rowid.
    pub fn declares_not_null(&self, column: &ColumnDescriptor) -> bool {
        !column.nullable && !self.is_auto_increment(&column.name)
    }

    /// Column sets guaranteed unique: the primary key and every unique index
    pub fn unique_column_sets(&self) -> Vec<&[String]> {
        let mut sets = vec![self.primary_key.columns.as_slice()];
        sets.extend(
            self.indices
                .iter()
                .filter(|i| i.unique)
                .map(|i| i.columns.as_slice()),
        );
        sets
    }

    /// Columns that carry a foreign key
    pub fn foreign_keys(&self) -> impl Iterator<Item = (&ColumnDescriptor, &ForeignKeyRef)> {
        self.columns
            .iter()
            .filter_map(|c| c.references.as_ref().map(|fk| (c, fk)))
    }

    /// Local invariants: identifiers, unique columns, one valid primary key,
    /// index columns exist.
    pub fn validate(&self) -> Result<(), SchemaError> {
        check_identifier(&self.table)?;
        if self.columns.is_empty() {
            return Err(SchemaError::EmptyEntity(self.table.clone()));
        }

        for (i, column) in self.columns.iter().enumerate() {
            check_identifier(&column.name)?;
            if self.columns[..i]
                .iter()
                .any(|c| c.name.eq_ignore_ascii_case(&column.name))
            {
                return Err(SchemaError::DuplicateColumn {
                    table: self.table.clone(),
                    column: column.name.clone(),
                });
            }
        }

        if self.primary_key.columns.is_empty() {
            return Err(SchemaError::InvalidKey {
                table: self.table.clone(),
                message: "no primary key declared".to_string(),
            });
        }
        for (i, key) in self.primary_key.columns.iter().enumerate() {
            if !self.has_column(key) {
                return Err(SchemaError::InvalidKey {
                    table: self.table.clone(),
                    message: format!("primary key column {key} does not exist"),
                });
            }
            if self.primary_key.columns[..i]
                .iter()
                .any(|k| k.eq_ignore_ascii_case(key))
            {
                return Err(SchemaError::InvalidKey {
                    table: self.table.clone(),
                    message: format!("primary key column {key} listed twice"),
                });
            }
        }

        if self.primary_key.auto_increment {
            let single_integer = self.primary_key.columns.len() == 1
                && self
                    .column(&self.primary_key.columns[0])
                    .is_some_and(|c| c.column_type == ColumnType::Integer);
            if !single_integer {
                return Err(SchemaError::InvalidAutoIncrement(self.table.clone()));
            }
        }

        for (i, index) in self.indices.iter().enumerate() {
            check_identifier(&index.name)?;
            if index.columns.is_empty() {
                return Err(SchemaError::InvalidKey {
                    table: self.table.clone(),
                    message: format!("index {} has no columns", index.name),
                });
            }
            if let Some(missing) = index.columns.iter().find(|c| !self.has_column(c)) {
                return Err(SchemaError::InvalidKey {
                    table: self.table.clone(),
                    message: format!("index {} references missing column {missing}", index.name),
                });
            }
            if self.indices[..i]
                .iter()
                .any(|other| other.name.eq_ignore_ascii_case(&index.name))
            {
                return Err(SchemaError::InvalidKey {
                    table: self.table.clone(),
                    message: format!("index {} declared twice", index.name),
                });
            }
        }

        Ok(())
    }
}

/// Builder for [`EntityDescriptor`]
#[derive(Debug, Clone)]
pub struct EntityBuilder {
    table: String,
    columns: Vec<ColumnDescriptor>,
    primary_keys: Vec<Vec<String>>,
    auto_increment: bool,
    indices: Vec<IndexDescriptor>,
}

impl EntityBuilder {
    pub fn column(mut self, column: ColumnDescriptor) -> Self {
        self.columns.push(column);
        self
    }

    /// Declare the primary key (composite keys list several columns)
    pub fn primary_key<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.primary_keys
            .push(columns.into_iter().map(Into::into).collect());
        self
    }

    /// Make a single INTEGER primary key auto-incrementing
    pub fn auto_increment(mut self) -> Self {
        self.auto_increment = true;
        self
    }

    pub fn index<I, S>(mut self, name: impl Into<String>, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.indices.push(IndexDescriptor {
            name: name.into(),
            columns: columns.into_iter().map(Into::into).collect(),
            unique: false,
        });
        self
    }

    pub fn unique<I, S>(mut self, name: impl Into<String>, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.indices.push(IndexDescriptor {
            name: name.into(),
            columns: columns.into_iter().map(Into::into).collect(),
            unique: true,
        });
        self
    }

    pub fn build(self) -> Result<EntityDescriptor, SchemaError> {
        if self.primary_keys.len() > 1 {
            return Err(SchemaError::InvalidKey {
                table: self.table,
                message: "primary key declared more than once".to_string(),
            });
        }
        let descriptor = EntityDescriptor {
            table: self.table,
            columns: self.columns,
            primary_key: PrimaryKey {
                columns: self.primary_keys.into_iter().next().unwrap_or_default(),
                auto_increment: self.auto_increment,
            },
            indices: self.indices,
        };
        descriptor.validate()?;
        Ok(descriptor)
    }
}

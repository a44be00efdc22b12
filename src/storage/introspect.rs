//! Live schema introspection and the bookkeeping tables
//!
//! - `__schema_meta(version INTEGER)`: installed schema version, one row
//! - `__schema_identity(hash TEXT)`: identity hash of the installed schema, one row

use super::sqlite::StoreTxn;
use crate::schema::ForeignKeyAction;
use crate::value::Value;

pub const META_TABLE: &str = "__schema_meta";
pub const IDENTITY_TABLE: &str = "__schema_identity";

/// A column as reported by `pragma_table_info`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveColumn {
    pub name: String,
    pub declared_type: String,
    pub not_null: bool,
    /// Default expression text, as written in the DDL
    pub default: Option<String>,
    /// 1-based position in the primary key, 0 if not part of it
    pub pk: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveForeignKey {
    pub column: String,
    pub table: String,
    pub target_column: String,
    pub on_update: ForeignKeyAction,
    pub on_delete: ForeignKeyAction,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveIndex {
    pub name: String,
    pub columns: Vec<String>,
    pub unique: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveTable {
    pub name: String,
    pub columns: Vec<LiveColumn>,
    pub foreign_keys: Vec<LiveForeignKey>,
    /// Explicitly created indices only (no automatic ones)
    pub indices: Vec<LiveIndex>,
}

fn text(value: &Value) -> String {
    match value {
        Value::Text(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn int(value: &Value) -> i64 {
    value.as_i64().unwrap_or(0)
}

/// User tables in creation order (bookkeeping and `sqlite_` tables excluded)
pub fn user_tables(txn: &StoreTxn<'_>) -> rusqlite::Result<Vec<String>> {
    let rows = txn.query(
        "SELECT name FROM sqlite_master WHERE type = 'table' \
         AND substr(name, 1, 7) <> 'sqlite_' AND substr(name, 1, 9) <> '__schema_' \
         ORDER BY rowid",
        &[],
    )?;
    Ok(rows.rows.iter().map(|r| text(&r[0])).collect())
}

pub fn table_exists(txn: &StoreTxn<'_>, name: &str) -> rusqlite::Result<bool> {
    let rows = txn.query(
        "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1 COLLATE NOCASE",
        &[Value::from(name)],
    )?;
    Ok(!rows.rows.is_empty())
}

/// Read one table's columns, foreign keys and indices; `None` if absent
pub fn live_table(txn: &StoreTxn<'_>, name: &str) -> rusqlite::Result<Option<LiveTable>> {
    if !table_exists(txn, name)? {
        return Ok(None);
    }
    let arg = [Value::from(name)];

    let columns = txn
        .query("SELECT name, type, \"notnull\", dflt_value, pk FROM pragma_table_info(?1) ORDER BY cid", &arg)?
        .rows
        .iter()
        .map(|r| LiveColumn {
            name: text(&r[0]),
            declared_type: text(&r[1]),
            not_null: int(&r[2]) != 0,
            default: (!r[3].is_null()).then(|| text(&r[3])),
            pk: usize::try_from(int(&r[4])).unwrap_or(0),
        })
        .collect();

    let foreign_keys = txn
        .query(
            "SELECT \"from\", \"table\", \"to\", on_update, on_delete FROM pragma_foreign_key_list(?1) ORDER BY id, seq",
            &arg,
        )?
        .rows
        .iter()
        .map(|r| LiveForeignKey {
            column: text(&r[0]),
            table: text(&r[1]),
            target_column: text(&r[2]),
            on_update: ForeignKeyAction::from_sql(&text(&r[3])),
            on_delete: ForeignKeyAction::from_sql(&text(&r[4])),
        })
        .collect();

    let mut indices = Vec::new();
    let list = txn.query(
        "SELECT name, \"unique\" FROM pragma_index_list(?1) WHERE origin = 'c' ORDER BY name",
        &arg,
    )?;
    for row in &list.rows {
        let index_name = text(&row[0]);
        let columns = txn
            .query("SELECT name FROM pragma_index_info(?1) ORDER BY seqno", &[Value::from(index_name.as_str())])?
            .rows
            .iter()
            .map(|r| text(&r[0]))
            .collect();
        indices.push(LiveIndex {
            name: index_name,
            columns,
            unique: int(&row[1]) != 0,
        });
    }

    Ok(Some(LiveTable {
        name: name.to_string(),
        columns,
        foreign_keys,
        indices,
    }))
}

/// Create the bookkeeping tables if missing
pub fn ensure_meta_tables(txn: &StoreTxn<'_>) -> rusqlite::Result<()> {
    txn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {META_TABLE} (version INTEGER NOT NULL);
         CREATE TABLE IF NOT EXISTS {IDENTITY_TABLE} (hash TEXT NOT NULL);"
    ))
}

/// Installed version; 0 when the store has never been migrated
pub fn read_version(txn: &StoreTxn<'_>) -> rusqlite::Result<u32> {
    if !table_exists(txn, META_TABLE)? {
        return Ok(0);
    }
    let rows = txn.query(&format!("SELECT version FROM {META_TABLE} LIMIT 1"), &[])?;
    Ok(rows
        .rows
        .first()
        .and_then(|r| r[0].as_i64())
        .and_then(|v| u32::try_from(v).ok())
        .unwrap_or(0))
}

pub fn write_version(txn: &StoreTxn<'_>, version: u32) -> rusqlite::Result<()> {
    ensure_meta_tables(txn)?;
    txn.execute(&format!("DELETE FROM {META_TABLE}"), &[])?;
    txn.execute(
        &format!("INSERT INTO {META_TABLE} (version) VALUES (?1)"),
        &[Value::from(version)],
    )?;
    Ok(())
}

/// Stored identity hash, if any
pub fn read_identity(txn: &StoreTxn<'_>) -> rusqlite::Result<Option<String>> {
    if !table_exists(txn, IDENTITY_TABLE)? {
        return Ok(None);
    }
    let rows = txn.query(&format!("SELECT hash FROM {IDENTITY_TABLE} LIMIT 1"), &[])?;
    Ok(rows.rows.first().and_then(|r| r[0].as_str().map(str::to_string)))
}

pub fn write_identity(txn: &StoreTxn<'_>, hash: &str) -> rusqlite::Result<()> {
    ensure_meta_tables(txn)?;
    txn.execute(&format!("DELETE FROM {IDENTITY_TABLE}"), &[])?;
    txn.execute(
        &format!("INSERT INTO {IDENTITY_TABLE} (hash) VALUES (?1)"),
        &[Value::from(hash)],
    )?;
    Ok(())
}

/// Drop every user table (children first is not required: foreign keys are
/// deferred for the rest of the transaction)
pub fn drop_user_tables(txn: &StoreTxn<'_>) -> rusqlite::Result<Vec<String>> {
    txn.execute_batch("PRAGMA defer_foreign_keys = ON")?;
    let tables = user_tables(txn)?;
    for table in tables.iter().rev() {
        txn.execute_batch(&format!("DROP TABLE IF EXISTS `{table}`"))?;
    }
    Ok(tables)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{SqliteStore, TxnMode};

    fn store() -> SqliteStore {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .transaction(TxnMode::Immediate, |txn| {
                txn.execute_batch(
                    "CREATE TABLE person (id INTEGER PRIMARY KEY AUTOINCREMENT, name TEXT NOT NULL, city TEXT DEFAULT '');
                     CREATE TABLE pet (id INTEGER NOT NULL, owner_id INTEGER NOT NULL,
                        PRIMARY KEY(id),
                        FOREIGN KEY(owner_id) REFERENCES person(id) ON UPDATE NO ACTION ON DELETE CASCADE);
                     CREATE UNIQUE INDEX idx_pet_owner ON pet(owner_id, id);",
                )
            })
            .unwrap();
        store
    }

    #[test]
    fn test_live_table() {
        let store = store();
        let (person, pet, missing) = store
            .transaction(TxnMode::Deferred, |txn| {
                Ok::<_, rusqlite::Error>((
                    live_table(txn, "person")?.unwrap(),
                    live_table(txn, "pet")?.unwrap(),
                    live_table(txn, "nope")?,
                ))
            })
            .unwrap();

        assert!(missing.is_none());
        assert_eq!(person.columns.len(), 3);
        assert_eq!(person.columns[0].pk, 1);
        assert!(person.columns[1].not_null);
        assert_eq!(person.columns[2].default.as_deref(), Some("''"));

        assert_eq!(pet.foreign_keys.len(), 1);
        assert_eq!(pet.foreign_keys[0].on_delete, ForeignKeyAction::Cascade);
        assert_eq!(pet.indices.len(), 1);
        assert_eq!(pet.indices[0].columns, vec!["owner_id", "id"]);
        assert!(pet.indices[0].unique);
    }

    #[test]
    fn test_version_and_identity() {
        let store = store();
        store
            .transaction(TxnMode::Immediate, |txn| {
                assert_eq!(read_version(txn)?, 0);
                assert_eq!(read_identity(txn)?, None);
                write_version(txn, 3)?;
                write_version(txn, 4)?;
                write_identity(txn, "abc")?;
                assert_eq!(read_version(txn)?, 4);
                assert_eq!(read_identity(txn)?.as_deref(), Some("abc"));
                assert_eq!(user_tables(txn)?, vec!["person", "pet"]);
                Ok::<_, rusqlite::Error>(())
            })
            .unwrap();
    }

    #[test]
    fn test_drop_user_tables_keeps_meta() {
        let store = store();
        store
            .transaction(TxnMode::Immediate, |txn| {
                write_version(txn, 1)?;
                txn.execute("INSERT INTO person (name) VALUES ('a')", &[])?;
                txn.execute("INSERT INTO pet (id, owner_id) VALUES (1, 1)", &[])?;
                let dropped = drop_user_tables(txn)?;
                assert_eq!(dropped.len(), 2);
                assert!(user_tables(txn)?.is_empty());
                assert_eq!(read_version(txn)?, 1);
                Ok::<_, rusqlite::Error>(())
            })
            .unwrap();
    }
}

//! Compare the live schema against a snapshot

use crate::schema::{ColumnType, EntityDescriptor, SchemaSnapshot};
use crate::storage::introspect::{self, LiveTable};
use crate::storage::StoreTxn;

fn normalize_default(default: Option<&str>) -> Option<String> {
    default
        .map(str::trim)
        .filter(|d| !d.eq_ignore_ascii_case("NULL"))
        .map(str::to_string)
}

/// Differences between `expected` and the live table, one line each
pub fn diff_entity(expected: &EntityDescriptor, live: Option<&LiveTable>) -> Vec<String> {
    let table = &expected.table;
    let Some(live) = live else {
        return vec![format!("table {table} is missing")];
    };
    let mut diff = Vec::new();

    for column in &expected.columns {
        let Some(actual) = live
            .columns
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(&column.name))
        else {
            diff.push(format!("{table}.{} is missing", column.name));
            continue;
        };

        let expected_affinity = ColumnType::affinity_of(column.column_type.sql_type());
        let actual_affinity = ColumnType::affinity_of(&actual.declared_type);
        if expected_affinity != actual_affinity {
            diff.push(format!(
                "{table}.{}: affinity {actual_affinity}, expected {expected_affinity}",
                column.name
            ));
        }

        let not_null = expected.declares_not_null(column);
        if actual.not_null != not_null {
            diff.push(format!(
                "{table}.{}: {}, expected {}",
                column.name,
                if actual.not_null { "NOT NULL" } else { "nullable" },
                if not_null { "NOT NULL" } else { "nullable" },
            ));
        }

        let expected_default = normalize_default(column.default.as_deref());
        let actual_default = normalize_default(actual.default.as_deref());
        if expected_default != actual_default {
            diff.push(format!(
                "{table}.{}: default {}, expected {}",
                column.name,
                actual_default.as_deref().unwrap_or("none"),
                expected_default.as_deref().unwrap_or("none"),
            ));
        }

        let pk = expected.primary_key_position(&column.name);
        if actual.pk != pk {
            diff.push(format!(
                "{table}.{}: primary key position {}, expected {pk}",
                column.name, actual.pk
            ));
        }
    }

    for actual in &live.columns {
        if !expected.has_column(&actual.name) {
            diff.push(format!("{table}.{} is unexpected", actual.name));
        }
    }

    for (column, fk) in expected.foreign_keys() {
        let found = live.foreign_keys.iter().any(|l| {
            l.column.eq_ignore_ascii_case(&column.name)
                && l.table.eq_ignore_ascii_case(&fk.table)
                && l.target_column.eq_ignore_ascii_case(&fk.column)
                && l.on_delete == fk.on_delete
                && l.on_update == fk.on_update
        });
        if !found {
            diff.push(format!(
                "{table}.{}: foreign key to {}.{} (on delete {}, on update {}) is missing",
                column.name,
                fk.table,
                fk.column,
                fk.on_delete.as_sql(),
                fk.on_update.as_sql()
            ));
        }
    }
    let expected_fks = expected.foreign_keys().count();
    if live.foreign_keys.len() > expected_fks {
        diff.push(format!(
            "{table}: {} foreign keys, expected {expected_fks}",
            live.foreign_keys.len()
        ));
    }

    for index in &expected.indices {
        match live.indices.iter().find(|i| i.name.eq_ignore_ascii_case(&index.name)) {
            None => diff.push(format!("{table}: index {} is missing", index.name)),
            Some(actual) => {
                let same_columns = actual.columns.len() == index.columns.len()
                    && actual
                        .columns
                        .iter()
                        .zip(&index.columns)
                        .all(|(a, b)| a.eq_ignore_ascii_case(b));
                if !same_columns || actual.unique != index.unique {
                    diff.push(format!(
                        "{table}: index {} is {}({}), expected {}({})",
                        index.name,
                        if actual.unique { "unique " } else { "" },
                        actual.columns.join(", "),
                        if index.unique { "unique " } else { "" },
                        index.columns.join(", ")
                    ));
                }
            }
        }
    }
    for actual in &live.indices {
        if !expected.indices.iter().any(|i| i.name.eq_ignore_ascii_case(&actual.name)) {
            diff.push(format!("{table}: index {} is unexpected", actual.name));
        }
    }

    diff
}

/// Differences between every entity of `snapshot` and the live schema,
/// including user tables the snapshot does not declare
pub fn verify_snapshot(txn: &StoreTxn<'_>, snapshot: &SchemaSnapshot) -> rusqlite::Result<Vec<String>> {
    let mut diff = Vec::new();
    for entity in snapshot.entities() {
        let live = introspect::live_table(txn, &entity.table)?;
        diff.extend(diff_entity(entity, live.as_ref()));
    }
    for table in introspect::user_tables(txn)? {
        if !snapshot.has_table(&table) {
            diff.push(format!("table {table} is unexpected"));
        }
    }
    Ok(diff)
}

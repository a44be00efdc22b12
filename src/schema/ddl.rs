//! DDL generation for registered entities

use super::entity::EntityDescriptor;

/// Quote an identifier with backticks
pub fn quote(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

/// SQL to create the table for `entity`
pub fn create_table_sql(entity: &EntityDescriptor) -> String {
    let mut parts = Vec::with_capacity(entity.columns.len() + 2);

    for column in &entity.columns {
        let mut def = format!("{} {}", quote(&column.name), column.column_type.sql_type());
        if entity.is_auto_increment(&column.name) {
            def.push_str(" PRIMARY KEY AUTOINCREMENT");
        }
        if entity.declares_not_null(column) {
            def.push_str(" NOT NULL");
        }
        if let Some(default) = &column.default {
            def.push_str(" DEFAULT ");
            def.push_str(default);
        }
        parts.push(def);
    }

    if !entity.primary_key.auto_increment {
        let keys: Vec<String> = entity.primary_key.columns.iter().map(|c| quote(c)).collect();
        parts.push(format!("PRIMARY KEY({})", keys.join(", ")));
    }

    for (column, fk) in entity.foreign_keys() {
        parts.push(format!(
            "FOREIGN KEY({}) REFERENCES {}({}) ON UPDATE {} ON DELETE {}",
            quote(&column.name),
            quote(&fk.table),
            quote(&fk.column),
            fk.on_update.as_sql(),
            fk.on_delete.as_sql(),
        ));
    }

    format!(
        "CREATE TABLE IF NOT EXISTS {} ({})",
        quote(&entity.table),
        parts.join(", ")
    )
}

/// SQL to create every index of `entity`
pub fn create_index_sql(entity: &EntityDescriptor) -> Vec<String> {
    entity
        .indices
        .iter()
        .map(|index| {
            let columns: Vec<String> = index.columns.iter().map(|c| quote(c)).collect();
            format!(
                "CREATE {}INDEX IF NOT EXISTS {} ON {} ({})",
                if index.unique { "UNIQUE " } else { "" },
                quote(&index.name),
                quote(&entity.table),
                columns.join(", ")
            )
        })
        .collect()
}

/// All schema creation statements for a set of entities, tables first
pub fn all_schema_statements<'a>(
    entities: impl IntoIterator<Item = &'a EntityDescriptor>,
) -> Vec<String> {
    let entities: Vec<&EntityDescriptor> = entities.into_iter().collect();
    let mut stmts: Vec<String> = entities.iter().map(|e| create_table_sql(e)).collect();
    for entity in &entities {
        stmts.extend(create_index_sql(entity));
    }
    stmts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnDescriptor, ForeignKeyAction};

    #[test]
    fn test_autoincrement_table() {
        let entity = EntityDescriptor::builder("person")
            .column(ColumnDescriptor::integer("id"))
            .column(ColumnDescriptor::text("name"))
            .column(ColumnDescriptor::text("city").default_value(""))
            .primary_key(["id"])
            .auto_increment()
            .build()
            .unwrap();

        assert_eq!(
            create_table_sql(&entity),
            "CREATE TABLE IF NOT EXISTS `person` (`id` INTEGER PRIMARY KEY AUTOINCREMENT, \
             `name` TEXT NOT NULL, `city` TEXT NOT NULL DEFAULT '')"
        );
    }

    #[test]
    fn test_composite_key_foreign_key_and_index() {
        let entity = EntityDescriptor::builder("membership")
            .column(ColumnDescriptor::integer("person_id").references("person", "id").on_delete(ForeignKeyAction::Cascade))
            .column(ColumnDescriptor::integer("group_id"))
            .column(ColumnDescriptor::boolean("admin").nullable())
            .primary_key(["person_id", "group_id"])
            .index("idx_membership_group", ["group_id"])
            .build()
            .unwrap();

        let sql = create_table_sql(&entity);
        assert!(sql.contains("`admin` INTEGER,"));
        assert!(sql.contains("PRIMARY KEY(`person_id`, `group_id`)"));
        assert!(sql.contains(
            "FOREIGN KEY(`person_id`) REFERENCES `person`(`id`) ON UPDATE NO ACTION ON DELETE CASCADE"
        ));

        let indices = create_index_sql(&entity);
        assert_eq!(
            indices,
            vec!["CREATE INDEX IF NOT EXISTS `idx_membership_group` ON `membership` (`group_id`)".to_string()]
        );
    }
}

//! Schema registry - collects entity descriptors and seals them into an
//! immutable, versioned snapshot

use super::SchemaError;
use super::ddl;
use super::entity::EntityDescriptor;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// Immutable set of entities for one schema version.
///
/// Shared behind an `Arc` and never mutated after sealing, so concurrent
/// readers need no synchronization.
#[derive(Debug)]
pub struct SchemaSnapshot {
    version: u32,
    entities: Vec<EntityDescriptor>,
    /// lowercase table name → index into `entities`
    by_table: HashMap<String, usize>,
    identity_hash: String,
}

impl SchemaSnapshot {
    /// Validate cross-entity invariants and build the snapshot
    pub fn new(version: u32, entities: Vec<EntityDescriptor>) -> Result<Self, SchemaError> {
        let mut by_table = HashMap::with_capacity(entities.len());
        for (i, entity) in entities.iter().enumerate() {
            entity.validate()?;
            if by_table.insert(entity.table.to_ascii_lowercase(), i).is_some() {
                return Err(SchemaError::DuplicateTable(entity.table.clone()));
            }
        }

        for entity in &entities {
            for (column, fk) in entity.foreign_keys() {
                let dangling = || SchemaError::DanglingForeignKey {
                    table: entity.table.clone(),
                    column: column.name.clone(),
                    target: format!("{}.{}", fk.table, fk.column),
                };
                let target = by_table
                    .get(&fk.table.to_ascii_lowercase())
                    .map(|&i| &entities[i])
                    .ok_or_else(dangling)?;
                let is_single_key = target.primary_key.columns.len() == 1
                    && target.primary_key.columns[0].eq_ignore_ascii_case(&fk.column);
                if !is_single_key {
                    return Err(dangling());
                }
            }
        }

        let identity_hash = identity_hash(&entities);
        Ok(Self {
            version,
            entities,
            by_table,
            identity_hash,
        })
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// Entities in registration order
    pub fn entities(&self) -> &[EntityDescriptor] {
        &self.entities
    }

    /// Look up an entity by table name (case-insensitive)
    pub fn entity(&self, table: &str) -> Option<&EntityDescriptor> {
        self.by_table
            .get(&table.to_ascii_lowercase())
            .map(|&i| &self.entities[i])
    }

    pub fn has_table(&self, table: &str) -> bool {
        self.by_table.contains_key(&table.to_ascii_lowercase())
    }

    /// Digest of the canonical DDL, independent of the version number
    pub fn identity_hash(&self) -> &str {
        &self.identity_hash
    }

    /// DDL creating every table and index of this snapshot
    pub fn create_statements(&self) -> Vec<String> {
        ddl::all_schema_statements(&self.entities)
    }

    /// Tables the store also writes when `table` is written: children whose
    /// foreign keys cascade, set null or set default, followed transitively.
    /// Returned names are lowercase and include `table` itself.
    pub fn write_closure(&self, table: &str) -> BTreeSet<String> {
        let mut closure = BTreeSet::new();
        let mut pending = vec![table.to_ascii_lowercase()];
        while let Some(current) = pending.pop() {
            if !closure.insert(current.clone()) {
                continue;
            }
            for entity in &self.entities {
                let touched = entity.foreign_keys().any(|(_, fk)| {
                    fk.table.eq_ignore_ascii_case(&current)
                        && (fk.on_delete.writes_child() || fk.on_update.writes_child())
                });
                if touched {
                    pending.push(entity.table.to_ascii_lowercase());
                }
            }
        }
        closure
    }
}

fn identity_hash(entities: &[EntityDescriptor]) -> String {
    let mut hasher = blake3::Hasher::new();
    for stmt in ddl::all_schema_statements(entities) {
        hasher.update(stmt.as_bytes());
        hasher.update(b";");
    }
    hasher.finalize().to_hex().to_string()
}

/// Build-time collection of entity descriptors.
///
/// Register every entity, then [`seal`](SchemaRegistry::seal) once at startup;
/// the sealed snapshot is what the binder, migration engine and access layer
/// consume.
#[derive(Debug)]
pub struct SchemaRegistry {
    version: u32,
    entities: Vec<EntityDescriptor>,
    sealed: Option<Arc<SchemaSnapshot>>,
}

impl SchemaRegistry {
    /// Create a registry for schema `version`
    pub fn new(version: u32) -> Self {
        Self {
            version,
            entities: Vec::new(),
            sealed: None,
        }
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// Register an entity. Foreign keys are resolved at seal time, so
    /// entities may be registered in any order.
    pub fn register(&mut self, entity: EntityDescriptor) -> Result<(), SchemaError> {
        if self.sealed.is_some() {
            return Err(SchemaError::RegistrySealed);
        }
        entity.validate()?;
        if self
            .entities
            .iter()
            .any(|e| e.table.eq_ignore_ascii_case(&entity.table))
        {
            return Err(SchemaError::DuplicateTable(entity.table));
        }
        tracing::debug!("Registered entity {} (v{})", entity.table, self.version);
        self.entities.push(entity);
        Ok(())
    }

    /// Validate the whole schema and freeze it. Sealing again returns the
    /// same snapshot.
    pub fn seal(&mut self) -> Result<Arc<SchemaSnapshot>, SchemaError> {
        if let Some(snapshot) = &self.sealed {
            return Ok(Arc::clone(snapshot));
        }
        let snapshot = Arc::new(SchemaSnapshot::new(self.version, self.entities.clone())?);
        tracing::info!(
            "Sealed schema v{} with {} entities (identity {})",
            snapshot.version(),
            snapshot.entities().len(),
            &snapshot.identity_hash()[..12]
        );
        self.sealed = Some(Arc::clone(&snapshot));
        Ok(snapshot)
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.is_some()
    }

    /// The sealed snapshot for the current version
    pub fn current_snapshot(&self) -> Result<Arc<SchemaSnapshot>, SchemaError> {
        self.sealed.clone().ok_or(SchemaError::NotSealed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnDescriptor, ForeignKeyAction};

    fn person() -> EntityDescriptor {
        EntityDescriptor::builder("person")
            .column(ColumnDescriptor::integer("id"))
            .column(ColumnDescriptor::text("name"))
            .primary_key(["id"])
            .auto_increment()
            .build()
            .unwrap()
    }

    fn pet(on_delete: ForeignKeyAction) -> EntityDescriptor {
        EntityDescriptor::builder("pet")
            .column(ColumnDescriptor::integer("id"))
            .column(ColumnDescriptor::integer("owner_id").references("person", "id").on_delete(on_delete))
            .primary_key(["id"])
            .build()
            .unwrap()
    }

    #[test]
    fn test_register_and_seal() {
        let mut registry = SchemaRegistry::new(1);
        registry.register(pet(ForeignKeyAction::NoAction)).unwrap();
        registry.register(person()).unwrap();

        assert!(matches!(registry.current_snapshot(), Err(SchemaError::NotSealed)));

        let snapshot = registry.seal().unwrap();
        assert_eq!(snapshot.version(), 1);
        assert!(snapshot.has_table("PERSON"));
        assert_eq!(snapshot.entity("pet").unwrap().columns.len(), 2);
    }

    #[test]
    fn test_seal_is_idempotent() {
        let mut registry = SchemaRegistry::new(3);
        registry.register(person()).unwrap();
        let first = registry.seal().unwrap();
        let second = registry.seal().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(Arc::ptr_eq(&first, &registry.current_snapshot().unwrap()));
    }

    #[test]
    fn test_register_after_seal_fails() {
        let mut registry = SchemaRegistry::new(1);
        registry.seal().unwrap();
        assert!(matches!(registry.register(person()), Err(SchemaError::RegistrySealed)));
    }

    #[test]
    fn test_duplicate_table() {
        let mut registry = SchemaRegistry::new(1);
        registry.register(person()).unwrap();
        assert!(matches!(registry.register(person()), Err(SchemaError::DuplicateTable(_))));
    }

    #[test]
    fn test_dangling_foreign_key() {
        let mut registry = SchemaRegistry::new(1);
        registry.register(pet(ForeignKeyAction::NoAction)).unwrap();
        assert!(matches!(registry.seal(), Err(SchemaError::DanglingForeignKey { .. })));
        assert!(!registry.is_sealed());
    }

    #[test]
    fn test_foreign_key_must_target_primary_key() {
        let mut registry = SchemaRegistry::new(1);
        registry.register(person()).unwrap();
        registry
            .register(
                EntityDescriptor::builder("tag")
                    .column(ColumnDescriptor::integer("id"))
                    .column(ColumnDescriptor::text("owner").references("person", "name"))
                    .primary_key(["id"])
                    .build()
                    .unwrap(),
            )
            .unwrap();
        assert!(matches!(registry.seal(), Err(SchemaError::DanglingForeignKey { .. })));
    }

    #[test]
    fn test_write_closure_follows_cascades() {
        let mut registry = SchemaRegistry::new(1);
        registry.register(person()).unwrap();
        registry.register(pet(ForeignKeyAction::Cascade)).unwrap();
        let snapshot = registry.seal().unwrap();

        let closure = snapshot.write_closure("Person");
        assert!(closure.contains("person"));
        assert!(closure.contains("pet"));
        assert_eq!(snapshot.write_closure("pet").len(), 1);
    }

    #[test]
    fn test_identity_hash_tracks_ddl() {
        let mut a = SchemaRegistry::new(1);
        a.register(person()).unwrap();
        let mut b = SchemaRegistry::new(2);
        b.register(person()).unwrap();
        assert_eq!(a.seal().unwrap().identity_hash(), b.seal().unwrap().identity_hash());

        let mut c = SchemaRegistry::new(2);
        c.register(person()).unwrap();
        c.register(pet(ForeignKeyAction::NoAction)).unwrap();
        assert_ne!(a.seal().unwrap().identity_hash(), c.seal().unwrap().identity_hash());
    }
}

//! Migration engine
//!
//! The whole run holds an exclusive transaction. Each step runs in its own
//! savepoint together with the version write, so the recorded version always
//! describes the live schema. A failing step rolls back only its savepoint:
//! earlier steps stay committed and the error is returned.

use super::step::MigrationStep;
use super::verify::verify_snapshot;
use super::{DestructivePolicy, MigrationError, MigrationReport, MigrationState};
use crate::schema::SchemaSnapshot;
use crate::storage::introspect;
use crate::storage::{SqliteStore, StoreTxn, TxnMode};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;

/// Lifecycle hooks. Each runs inside the migration transaction.
pub trait DatabaseCallback: Send + Sync {
    /// After a fresh install created the schema
    fn on_create(&self, _txn: &StoreTxn<'_>) -> rusqlite::Result<()> {
        Ok(())
    }

    /// After every successful run, including no-ops
    fn on_open(&self, _txn: &StoreTxn<'_>) -> rusqlite::Result<()> {
        Ok(())
    }

    /// After a destructive recreate; the place to reseed data
    fn on_destructive_recreate(&self, _txn: &StoreTxn<'_>) -> rusqlite::Result<()> {
        Ok(())
    }
}

pub struct MigrationEngine {
    snapshot: Arc<SchemaSnapshot>,
    steps: Vec<MigrationStep>,
    policy: DestructivePolicy,
    callbacks: Vec<Arc<dyn DatabaseCallback>>,
    state: Mutex<MigrationState>,
}

impl std::fmt::Debug for MigrationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationEngine")
            .field("target", &self.snapshot.version())
            .field("steps", &self.steps.len())
            .field("policy", &self.policy)
            .field("state", &*self.state.lock())
            .finish()
    }
}

impl MigrationEngine {
    /// Engine migrating to `snapshot`'s version with the given steps
    pub fn new(snapshot: Arc<SchemaSnapshot>, steps: Vec<MigrationStep>) -> Result<Self, MigrationError> {
        for (i, step) in steps.iter().enumerate() {
            step.validate()?;
            if steps[..i].iter().any(|s| s.from() == step.from() && s.to() == step.to()) {
                return Err(MigrationError::InvalidStep(format!(
                    "v{} -> v{} declared twice",
                    step.from(),
                    step.to()
                )));
            }
        }
        Ok(Self {
            snapshot,
            steps,
            policy: DestructivePolicy::Never,
            callbacks: Vec::new(),
            state: Mutex::new(MigrationState::Unchecked),
        })
    }

    pub fn with_policy(mut self, policy: DestructivePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_callback(mut self, callback: Arc<dyn DatabaseCallback>) -> Self {
        self.callbacks.push(callback);
        self
    }

    pub fn target(&self) -> u32 {
        self.snapshot.version()
    }

    pub fn state(&self) -> MigrationState {
        self.state.lock().clone()
    }

    fn transition(&self, next: MigrationState) {
        let mut state = self.state.lock();
        tracing::info!("Migration state: {} -> {}", *state, next);
        *state = next;
    }

    /// Steps leading from `installed` to the target. Longer jumps are tried
    /// first; a branch that dead-ends falls back to the next shorter step.
    pub fn plan(&self, installed: u32) -> Result<Vec<&MigrationStep>, MigrationError> {
        let target = self.target();
        let mut chain = Vec::new();
        let mut dead_ends = HashSet::new();
        if installed <= target && self.search(installed, target, &mut chain, &mut dead_ends) {
            Ok(chain)
        } else {
            Err(MigrationError::MissingMigrationPath {
                from: installed,
                to: target,
            })
        }
    }

    fn search<'a>(
        &'a self,
        current: u32,
        target: u32,
        chain: &mut Vec<&'a MigrationStep>,
        dead_ends: &mut HashSet<u32>,
    ) -> bool {
        if current == target {
            return true;
        }
        if dead_ends.contains(&current) {
            return false;
        }

        let mut candidates: Vec<&MigrationStep> = self
            .steps
            .iter()
            .filter(|s| s.from() == current && s.to() <= target)
            .collect();
        candidates.sort_by_key(|s| std::cmp::Reverse(s.to()));

        for step in candidates {
            chain.push(step);
            if self.search(step.to(), target, chain, dead_ends) {
                return true;
            }
            chain.pop();
        }
        dead_ends.insert(current);
        false
    }

    /// Bring the store to the target version
    pub fn run(&self, store: &SqliteStore) -> Result<MigrationReport, MigrationError> {
        self.transition(MigrationState::Validating);

        let result = store
            .transaction(TxnMode::Exclusive, |txn| self.run_locked(txn))
            .and_then(|inner| inner);

        match result {
            Ok(report) => {
                self.transition(MigrationState::Applied { version: report.to });
                Ok(report)
            }
            Err(e) => {
                self.transition(MigrationState::Failed(e.to_string()));
                Err(e)
            }
        }
    }

    /// Outer `Err` rolls everything back; inner `Err` commits the steps
    /// applied so far and then surfaces the failure
    fn run_locked(&self, txn: &StoreTxn<'_>) -> Result<Result<MigrationReport, MigrationError>, MigrationError> {
        let target = self.target();
        // read under the lock: a contender that waited sees the finished chain
        let installed = introspect::read_version(txn)?;
        tracing::info!("Installed schema v{}, target v{}", installed, target);

        if installed == 0 {
            let report = self.install(txn, installed, false)?;
            return Ok(Ok(report));
        }

        if installed == target {
            self.check_identity(txn, target)?;
            self.notify(txn, |cb, txn| cb.on_open(txn))?;
            return Ok(Ok(MigrationReport::unchanged(target)));
        }

        let chain = match self.plan(installed) {
            Ok(chain) => chain,
            Err(MigrationError::MissingMigrationPath { .. }) if self.policy.allows(installed) => {
                tracing::warn!("No migration path from v{} to v{}; recreating", installed, target);
                return self.install(txn, installed, true).map(Ok);
            }
            Err(e) => return Err(e),
        };

        let mut applied = Vec::with_capacity(chain.len());
        for step in chain {
            let (from, to) = (step.from(), step.to());
            self.transition(MigrationState::Applying { from, to });

            let outcome = txn.savepoint(|sp| {
                step.run(sp)?;
                let diff = verify_snapshot(sp, step.post_condition())?;
                if !diff.is_empty() {
                    return Err(MigrationError::MigrationVerificationFailed { from, to, diff });
                }
                introspect::write_version(sp, to)?;
                introspect::write_identity(sp, step.post_condition().identity_hash())?;
                Ok(())
            });

            if let Err(e) = outcome {
                tracing::warn!("Migration v{} -> v{} rolled back: {}", from, to, e);
                return Ok(Err(e));
            }
            tracing::info!("Applied migration v{} -> v{}", from, to);
            applied.push((from, to));
        }

        self.notify(txn, |cb, txn| cb.on_open(txn))?;
        Ok(Ok(MigrationReport {
            from: installed,
            to: target,
            applied,
            created: false,
            recreated: false,
        }))
    }

    /// Create the target schema from the registry. With `recreate`, every
    /// existing user table is dropped first.
    fn install(&self, txn: &StoreTxn<'_>, installed: u32, recreate: bool) -> Result<MigrationReport, MigrationError> {
        let target = self.target();
        if recreate {
            let dropped = introspect::drop_user_tables(txn)?;
            tracing::info!("Dropped {} tables for recreate", dropped.len());
        }

        for stmt in self.snapshot.create_statements() {
            txn.execute_batch(&stmt)?;
        }
        let diff = verify_snapshot(txn, &self.snapshot)?;
        if !diff.is_empty() {
            return Err(MigrationError::MigrationVerificationFailed {
                from: installed,
                to: target,
                diff,
            });
        }
        introspect::write_version(txn, target)?;
        introspect::write_identity(txn, self.snapshot.identity_hash())?;

        if recreate {
            self.notify(txn, |cb, txn| cb.on_destructive_recreate(txn))?;
        } else {
            tracing::info!("Created schema v{}", target);
            self.notify(txn, |cb, txn| cb.on_create(txn))?;
        }
        self.notify(txn, |cb, txn| cb.on_open(txn))?;

        Ok(MigrationReport {
            from: installed,
            to: target,
            applied: Vec::new(),
            created: !recreate,
            recreated: recreate,
        })
    }

    fn check_identity(&self, txn: &StoreTxn<'_>, version: u32) -> Result<(), MigrationError> {
        let expected = self.snapshot.identity_hash();
        match introspect::read_identity(txn)? {
            Some(stored) if stored != expected => Err(MigrationError::IdentityMismatch {
                version,
                stored,
                expected: expected.to_string(),
            }),
            Some(_) => Ok(()),
            None => {
                tracing::debug!("Recording identity hash for v{}", version);
                introspect::write_identity(txn, expected)?;
                Ok(())
            }
        }
    }

    fn notify<F>(&self, txn: &StoreTxn<'_>, f: F) -> Result<(), MigrationError>
    where
        F: Fn(&dyn DatabaseCallback, &StoreTxn<'_>) -> rusqlite::Result<()>,
    {
        for callback in &self.callbacks {
            f(callback.as_ref(), txn)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnDescriptor, EntityDescriptor, SchemaRegistry};
    use crate::value::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn person_v1() -> EntityDescriptor {
        EntityDescriptor::builder("person")
            .column(ColumnDescriptor::integer("id"))
            .column(ColumnDescriptor::text("name"))
            .column(ColumnDescriptor::integer("age"))
            .primary_key(["id"])
            .auto_increment()
            .build()
            .unwrap()
    }

    fn snapshot(version: u32) -> Arc<SchemaSnapshot> {
        let mut person = person_v1();
        if version >= 2 {
            person.columns.push(ColumnDescriptor::text("city").default_value(""));
        }
        if version >= 3 {
            person.columns.push(ColumnDescriptor::text("email").nullable());
        }
        let mut registry = SchemaRegistry::new(version);
        registry.register(person).unwrap();
        registry.seal().unwrap()
    }

    fn add_city() -> MigrationStep {
        MigrationStep::sql(1, 2, ["ALTER TABLE person ADD COLUMN city TEXT NOT NULL DEFAULT ''"], snapshot(2))
    }

    fn add_email() -> MigrationStep {
        MigrationStep::sql(2, 3, ["ALTER TABLE person ADD COLUMN email TEXT"], snapshot(3))
    }

    fn installed(store: &SqliteStore) -> u32 {
        store
            .transaction(TxnMode::Deferred, |txn| introspect::read_version(txn))
            .unwrap()
    }

    fn seed_v1(store: &SqliteStore) {
        MigrationEngine::new(snapshot(1), vec![]).unwrap().run(store).unwrap();
        store
            .transaction(TxnMode::Immediate, |txn| {
                txn.execute("INSERT INTO person (name, age) VALUES ('Ann', 30)", &[])
            })
            .unwrap();
    }

    #[test]
    fn test_fresh_install() {
        let store = SqliteStore::open_in_memory().unwrap();
        let engine = MigrationEngine::new(snapshot(2), vec![add_city()]).unwrap();
        let report = engine.run(&store).unwrap();
        assert!(report.created);
        assert_eq!(report.to, 2);
        assert_eq!(installed(&store), 2);
        assert_eq!(engine.state(), MigrationState::Applied { version: 2 });
    }

    #[test]
    fn test_upgrade_preserves_rows_and_is_idempotent() {
        let store = SqliteStore::open_in_memory().unwrap();
        seed_v1(&store);

        let engine = MigrationEngine::new(snapshot(2), vec![add_city()]).unwrap();
        let report = engine.run(&store).unwrap();
        assert_eq!(report.applied, vec![(1, 2)]);

        let rows = store
            .transaction(TxnMode::Deferred, |txn| txn.query("SELECT name, city FROM person", &[]))
            .unwrap();
        assert_eq!(rows.rows, vec![vec![Value::Text("Ann".into()), Value::Text(String::new())]]);

        let again = engine.run(&store).unwrap();
        assert!(again.is_noop());
        assert_eq!(installed(&store), 2);
    }

    #[test]
    fn test_plan_prefers_longest_jump_and_detects_gaps() {
        let skip = MigrationStep::sql(
            1,
            3,
            [
                "ALTER TABLE person ADD COLUMN city TEXT NOT NULL DEFAULT ''",
                "ALTER TABLE person ADD COLUMN email TEXT",
            ],
            snapshot(3),
        );
        let engine = MigrationEngine::new(snapshot(3), vec![add_city(), add_email(), skip]).unwrap();
        let chain: Vec<_> = engine.plan(1).unwrap().iter().map(|s| (s.from(), s.to())).collect();
        assert_eq!(chain, vec![(1, 3)]);
        let chain: Vec<_> = engine.plan(2).unwrap().iter().map(|s| (s.from(), s.to())).collect();
        assert_eq!(chain, vec![(2, 3)]);

        let engine = MigrationEngine::new(snapshot(3), vec![add_email()]).unwrap();
        assert!(matches!(
            engine.plan(1),
            Err(MigrationError::MissingMigrationPath { from: 1, to: 3 })
        ));
        assert!(matches!(engine.plan(4), Err(MigrationError::MissingMigrationPath { .. })));
    }

    #[test]
    fn test_plan_falls_back_when_longest_jump_dead_ends() {
        let jump = MigrationStep::sql(1, 3, ["SELECT 1"], snapshot(3));
        let finish = MigrationStep::sql(2, 4, ["SELECT 1"], snapshot(4));
        let engine = MigrationEngine::new(snapshot(4), vec![jump, add_city(), finish]).unwrap();
        let chain: Vec<_> = engine.plan(1).unwrap().iter().map(|s| (s.from(), s.to())).collect();
        assert_eq!(chain, vec![(1, 2), (2, 4)]);
        assert!(matches!(
            engine.plan(3),
            Err(MigrationError::MissingMigrationPath { from: 3, to: 4 })
        ));
    }

    #[test]
    fn test_failed_step_keeps_earlier_steps() {
        let store = SqliteStore::open_in_memory().unwrap();
        seed_v1(&store);

        let broken = MigrationStep::sql(2, 3, ["ALTER TABLE person ADD COLUMN mail TEXT"], snapshot(3));
        let engine = MigrationEngine::new(snapshot(3), vec![add_city(), broken]).unwrap();
        let err = engine.run(&store).unwrap_err();
        match err {
            MigrationError::MigrationVerificationFailed { from, to, diff } => {
                assert_eq!((from, to), (2, 3));
                assert!(diff.iter().any(|d| d.contains("email is missing")));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(installed(&store), 2);
        assert!(matches!(engine.state(), MigrationState::Failed(_)));

        let live = store
            .transaction(TxnMode::Deferred, |txn| introspect::live_table(txn, "person"))
            .unwrap()
            .unwrap();
        assert!(!live.columns.iter().any(|c| c.name == "mail"));
    }

    #[test]
    fn test_missing_path_without_recreate() {
        let store = SqliteStore::open_in_memory().unwrap();
        seed_v1(&store);
        let engine = MigrationEngine::new(snapshot(2), vec![]).unwrap();
        assert!(matches!(engine.run(&store), Err(MigrationError::MissingMigrationPath { .. })));
        assert_eq!(installed(&store), 1);
    }

    struct Counting {
        created: AtomicUsize,
        recreated: AtomicUsize,
        opened: AtomicUsize,
    }

    impl DatabaseCallback for Counting {
        fn on_create(&self, _txn: &StoreTxn<'_>) -> rusqlite::Result<()> {
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn on_open(&self, _txn: &StoreTxn<'_>) -> rusqlite::Result<()> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn on_destructive_recreate(&self, txn: &StoreTxn<'_>) -> rusqlite::Result<()> {
            self.recreated.fetch_add(1, Ordering::SeqCst);
            txn.execute("INSERT INTO person (name, age, city) VALUES ('seed', 1, 'x')", &[])?;
            Ok(())
        }
    }

    #[test]
    fn test_destructive_recreate_reseeds() {
        let store = SqliteStore::open_in_memory().unwrap();
        seed_v1(&store);

        let counting = Arc::new(Counting {
            created: AtomicUsize::new(0),
            recreated: AtomicUsize::new(0),
            opened: AtomicUsize::new(0),
        });
        let engine = MigrationEngine::new(snapshot(2), vec![])
            .unwrap()
            .with_policy(DestructivePolicy::FromVersions(vec![1]))
            .with_callback(counting.clone());
        let report = engine.run(&store).unwrap();
        assert!(report.recreated);
        assert_eq!(counting.recreated.load(Ordering::SeqCst), 1);
        assert_eq!(counting.created.load(Ordering::SeqCst), 0);
        assert_eq!(counting.opened.load(Ordering::SeqCst), 1);

        let rows = store
            .transaction(TxnMode::Deferred, |txn| txn.query("SELECT name FROM person", &[]))
            .unwrap();
        assert_eq!(rows.rows, vec![vec![Value::Text("seed".into())]]);
    }

    #[test]
    fn test_identity_mismatch() {
        let store = SqliteStore::open_in_memory().unwrap();
        MigrationEngine::new(snapshot(2), vec![]).unwrap().run(&store).unwrap();

        // same version number, different entities
        let mut registry = SchemaRegistry::new(2);
        registry.register(person_v1()).unwrap();
        let drifted = registry.seal().unwrap();
        let err = MigrationEngine::new(drifted, vec![]).unwrap().run(&store).unwrap_err();
        assert!(matches!(err, MigrationError::IdentityMismatch { version: 2, .. }));
    }

    #[test]
    fn test_invalid_steps() {
        let backwards = MigrationStep::sql(2, 1, Vec::<String>::new(), snapshot(1));
        assert!(matches!(
            MigrationEngine::new(snapshot(2), vec![backwards]),
            Err(MigrationError::InvalidStep(_))
        ));
        let wrong_post = MigrationStep::sql(1, 2, Vec::<String>::new(), snapshot(3));
        assert!(matches!(
            MigrationEngine::new(snapshot(3), vec![wrong_post]),
            Err(MigrationError::InvalidStep(_))
        ));
    }
}

//! Database handle - opens and migrates the store, then serves compiled
//! queries, entity helpers, transactions and live queries

use crate::access::entity::{self, ConflictStrategy, Entity};
use crate::access::{self, AccessError, QueryResult, Transaction};
use crate::config::DatabaseConfig;
use crate::migration::{DatabaseCallback, MigrationEngine, MigrationError, MigrationReport, MigrationStep};
use crate::notify::{ChangeNotifier, LiveQuery};
use crate::query::{BindError, CompiledQuery, Params, QueryBinder, QueryTemplate};
use crate::schema::{EntityDescriptor, SchemaSnapshot};
use crate::storage::{SqliteStore, TxnMode};
use crate::value::Value;
use crate::{Error, Result};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio_util::sync::CancellationToken;

/// Everything [`Database::open`] needs
pub struct OpenOptions {
    config: DatabaseConfig,
    snapshot: Arc<SchemaSnapshot>,
    steps: Vec<MigrationStep>,
    callbacks: Vec<Arc<dyn DatabaseCallback>>,
}

impl OpenOptions {
    /// In-memory store at `snapshot`'s version, no migration steps
    pub fn new(snapshot: Arc<SchemaSnapshot>) -> Self {
        Self {
            config: DatabaseConfig::default(),
            snapshot,
            steps: Vec::new(),
            callbacks: Vec::new(),
        }
    }

    pub fn config(mut self, config: DatabaseConfig) -> Self {
        self.config = config;
        self
    }

    pub fn step(mut self, step: MigrationStep) -> Self {
        self.steps.push(step);
        self
    }

    pub fn steps(mut self, steps: impl IntoIterator<Item = MigrationStep>) -> Self {
        self.steps.extend(steps);
        self
    }

    pub fn callback(mut self, callback: Arc<dyn DatabaseCallback>) -> Self {
        self.callbacks.push(callback);
        self
    }
}

/// An open, migrated database
pub struct Database {
    store: Arc<SqliteStore>,
    binder: QueryBinder,
    notifier: ChangeNotifier,
    report: MigrationReport,
    closed: AtomicBool,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("location", &self.store.location())
            .field("version", &self.binder.snapshot().version())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Database {
    /// Open the store and bring it to the snapshot's version
    pub async fn open(options: OpenOptions) -> Result<Self> {
        let OpenOptions {
            config,
            snapshot,
            steps,
            callbacks,
        } = options;
        config.validate()?;
        if let Some(target) = config.target_version
            && target != snapshot.version()
        {
            return Err(MigrationError::TargetMismatch {
                target,
                registry: snapshot.version(),
            }
            .into());
        }

        let mut engine = MigrationEngine::new(Arc::clone(&snapshot), steps)?
            .with_policy(config.destructive_recreate.clone());
        for callback in callbacks {
            engine = engine.with_callback(callback);
        }

        let (store, report) = tokio::task::spawn_blocking(move || -> Result<_> {
            let store = SqliteStore::open(&config)?;
            let report = engine.run(&store)?;
            Ok((store, report))
        })
        .await
        .map_err(|e| Error::Access(AccessError::Worker(e.to_string())))??;

        tracing::info!(
            "Opened database at {} (schema v{}, from v{})",
            store.location(),
            report.to,
            report.from
        );
        let store = Arc::new(store);
        Ok(Self {
            notifier: ChangeNotifier::new(Arc::clone(&store)),
            binder: QueryBinder::new(snapshot),
            store,
            report,
            closed: AtomicBool::new(false),
        })
    }

    pub fn snapshot(&self) -> &Arc<SchemaSnapshot> {
        self.binder.snapshot()
    }

    /// What the migration run at open did
    pub fn migration_report(&self) -> &MigrationReport {
        &self.report
    }

    pub fn location(&self) -> &str {
        self.store.location()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> std::result::Result<(), AccessError> {
        if self.is_closed() {
            Err(AccessError::Closed)
        } else {
            Ok(())
        }
    }

    /// Validate a template against the schema (cached by template identity)
    pub fn compile(&self, template: &QueryTemplate) -> std::result::Result<Arc<CompiledQuery>, BindError> {
        self.binder.compile(template)
    }

    pub async fn execute(
        &self,
        query: &Arc<CompiledQuery>,
        params: Params,
    ) -> std::result::Result<QueryResult, AccessError> {
        self.run(query, params, None).await
    }

    /// Like [`execute`](Self::execute); cancelling `token` interrupts the
    /// statement and rolls its transaction back
    pub async fn execute_with_cancel(
        &self,
        query: &Arc<CompiledQuery>,
        params: Params,
        token: CancellationToken,
    ) -> std::result::Result<QueryResult, AccessError> {
        self.run(query, params, Some(token)).await
    }

    async fn run(
        &self,
        query: &Arc<CompiledQuery>,
        params: Params,
        token: Option<CancellationToken>,
    ) -> std::result::Result<QueryResult, AccessError> {
        self.ensure_open()?;
        let bound = query.bind(params)?;
        let mode = if query.is_write() {
            TxnMode::Immediate
        } else {
            TxnMode::Deferred
        };
        let (result, write_set) =
            access::run_blocking(Arc::clone(&self.store), mode, token, move |txn| txn.execute_bound(&bound))
                .await?;
        self.publish(&write_set);
        Ok(result)
    }

    /// Run several statements in one write transaction. Live queries see the
    /// combined write-set once, after commit.
    pub async fn transaction<T, F>(&self, f: F) -> std::result::Result<T, AccessError>
    where
        F: FnOnce(&mut Transaction<'_>) -> std::result::Result<T, AccessError> + Send + 'static,
        T: Send + 'static,
    {
        self.ensure_open()?;
        let (value, write_set) = access::run_blocking(Arc::clone(&self.store), TxnMode::Immediate, None, f).await?;
        self.publish(&write_set);
        Ok(value)
    }

    fn publish(&self, write_set: &BTreeSet<String>) {
        if !write_set.is_empty() {
            self.notifier.publish(write_set);
        }
    }

    /// Live result of a read query: the current result first, then a new one
    /// after every commit that changes it
    pub fn subscribe(&self, query: &Arc<CompiledQuery>, params: Params) -> std::result::Result<LiveQuery, AccessError> {
        self.ensure_open()?;
        if query.is_write() {
            return Err(BindError::UnsupportedStatement("live queries must be read-only".to_string()).into());
        }
        Ok(self.notifier.subscribe(query.bind(params)?))
    }

    pub fn unsubscribe(&self, handle: u64) -> bool {
        self.notifier.unsubscribe(handle)
    }

    fn entity_query<E: Entity>(
        &self,
        build: impl FnOnce(&EntityDescriptor) -> QueryTemplate,
    ) -> std::result::Result<Arc<CompiledQuery>, AccessError> {
        let descriptor = self
            .snapshot()
            .entity(E::TABLE)
            .ok_or_else(|| BindError::UnknownTable(E::TABLE.to_string()))?;
        Ok(self.binder.compile(&build(descriptor))?)
    }

    /// Insert a record. Returns its rowid, or `None` when the conflict
    /// strategy skipped it.
    pub async fn insert<E: Entity>(
        &self,
        record: &E,
        strategy: ConflictStrategy,
    ) -> std::result::Result<Option<i64>, AccessError> {
        let query = self.entity_query::<E>(|d| entity::insert_template(d, strategy))?;
        let params = entity::record_params(record, query.template())?;
        self.transaction(move |txn| {
            let written = txn.execute(&query, params)?;
            Ok((written.affected() != Some(0)).then(|| txn.last_insert_rowid()))
        })
        .await
    }

    /// Update a record by primary key. Returns whether a row matched.
    pub async fn update<E: Entity>(&self, record: &E) -> std::result::Result<bool, AccessError> {
        let query = self.entity_query::<E>(entity::update_template)?;
        let params = entity::record_params(record, query.template())?;
        Ok(self.execute(&query, params).await?.affected().unwrap_or(0) > 0)
    }

    /// Delete a record by primary key. Returns whether a row matched.
    pub async fn delete<E: Entity>(&self, record: &E) -> std::result::Result<bool, AccessError> {
        let query = self.entity_query::<E>(entity::delete_template)?;
        let params = entity::record_params(record, query.template())?;
        Ok(self.execute(&query, params).await?.affected().unwrap_or(0) > 0)
    }

    /// Fetch a record by primary key values, in key column order
    pub async fn find<E: Entity>(
        &self,
        key: impl IntoIterator<Item = impl Into<Value>>,
    ) -> std::result::Result<Option<E>, AccessError> {
        let query = self.entity_query::<E>(entity::find_template)?;
        let values: Vec<Value> = key.into_iter().map(Into::into).collect();
        if values.len() != query.params().len() {
            return Err(AccessError::ParameterMismatch {
                expected: query.params().to_vec(),
                found: (1..=values.len()).map(|i| format!("?{i}")).collect(),
            });
        }
        let params = query
            .params()
            .iter()
            .zip(values)
            .fold(Params::new(), |params, (name, value)| params.set(name.clone(), value));
        self.execute(&query, params).await?.one()
    }

    /// Stop live queries and refuse further calls. In-flight calls finish.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.notifier.shutdown();
            tracing::info!("Closed database at {}", self.store.location());
        }
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::{FromRow, Row};
    use crate::schema::{ColumnDescriptor, SchemaRegistry};
    use futures_util::StreamExt;

    #[derive(Debug, PartialEq)]
    struct Person {
        id: Option<i64>,
        name: String,
        age: i64,
    }

    impl FromRow for Person {
        fn from_row(row: &Row) -> std::result::Result<Self, AccessError> {
            Ok(Self {
                id: row.get("id")?,
                name: row.get("name")?,
                age: row.get("age")?,
            })
        }
    }

    impl Entity for Person {
        const TABLE: &'static str = "person";

        fn to_values(&self) -> Vec<(&'static str, Value)> {
            vec![
                ("id", self.id.into()),
                ("name", self.name.as_str().into()),
                ("age", self.age.into()),
            ]
        }
    }

    fn snapshot() -> Arc<SchemaSnapshot> {
        let mut registry = SchemaRegistry::new(1);
        registry
            .register(
                EntityDescriptor::builder("person")
                    .column(ColumnDescriptor::integer("id"))
                    .column(ColumnDescriptor::text("name"))
                    .column(ColumnDescriptor::integer("age"))
                    .primary_key(["id"])
                    .auto_increment()
                    .unique("person_name", ["name"])
                    .build()
                    .unwrap(),
            )
            .unwrap();
        registry.seal().unwrap()
    }

    fn person(name: &str, age: i64) -> Person {
        Person {
            id: None,
            name: name.to_string(),
            age,
        }
    }

    #[tokio::test]
    async fn test_entity_round_trip() {
        let db = Database::open(OpenOptions::new(snapshot())).await.unwrap();
        assert!(db.migration_report().created);

        let id = db.insert(&person("Ann", 30), ConflictStrategy::Abort).await.unwrap().unwrap();
        let mut found: Person = db.find([id]).await.unwrap().unwrap();
        assert_eq!(found.name, "Ann");

        found.age = 31;
        assert!(db.update(&found).await.unwrap());
        let again: Person = db.find([id]).await.unwrap().unwrap();
        assert_eq!(again.age, 31);

        assert!(db.delete(&again).await.unwrap());
        assert!(db.find::<Person>([id]).await.unwrap().is_none());
        assert!(!db.delete(&again).await.unwrap());
    }

    #[tokio::test]
    async fn test_insert_conflict_strategies() {
        let db = Database::open(OpenOptions::new(snapshot())).await.unwrap();
        db.insert(&person("Ann", 30), ConflictStrategy::Abort).await.unwrap();

        let ignored = db.insert(&person("Ann", 40), ConflictStrategy::Ignore).await.unwrap();
        assert_eq!(ignored, None);

        let err = db.insert(&person("Ann", 50), ConflictStrategy::Abort).await.unwrap_err();
        assert!(matches!(err, AccessError::Storage(_)));
    }

    #[tokio::test]
    async fn test_find_with_wrong_key_arity() {
        let db = Database::open(OpenOptions::new(snapshot())).await.unwrap();
        let err = db.find::<Person>([1, 2]).await.unwrap_err();
        assert!(matches!(err, AccessError::ParameterMismatch { .. }));
    }

    #[tokio::test]
    async fn test_target_version_must_match_registry() {
        let config = DatabaseConfig {
            target_version: Some(3),
            ..DatabaseConfig::default()
        };
        let err = Database::open(OpenOptions::new(snapshot()).config(config)).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Migration(MigrationError::TargetMismatch { target: 3, registry: 1 })
        ));
    }

    #[tokio::test]
    async fn test_rolled_back_transaction_publishes_nothing() {
        let db = Database::open(OpenOptions::new(snapshot())).await.unwrap();
        let count = db.compile(&QueryTemplate::scalar("SELECT COUNT(*) FROM person")).unwrap();
        let insert = db
            .compile(&QueryTemplate::affected("INSERT INTO person (name, age) VALUES (:name, :age)").params(["name", "age"]))
            .unwrap();
        let mut live = db.subscribe(&count, Params::new()).unwrap();
        assert_eq!(live.next().await.unwrap().unwrap(), QueryResult::Scalar(Value::Integer(0)));

        let failing = Arc::clone(&insert);
        let err = db
            .transaction(move |txn| {
                txn.execute(&failing, Params::new().set("name", "Bob").set("age", 20))?;
                txn.execute(&failing, Params::new().set("name", "Bob").set("age", 21))?;
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AccessError::Storage(_)));
        assert_eq!(db.execute(&count, Params::new()).await.unwrap(), QueryResult::Scalar(Value::Integer(0)));
        let quiet = tokio::time::timeout(std::time::Duration::from_millis(100), live.next()).await;
        assert!(quiet.is_err());

        db.execute(&insert, Params::new().set("name", "Cy").set("age", 40)).await.unwrap();
        assert_eq!(live.next().await.unwrap().unwrap(), QueryResult::Scalar(Value::Integer(1)));
    }

    #[tokio::test]
    async fn test_closed_database_refuses_calls() {
        let db = Database::open(OpenOptions::new(snapshot())).await.unwrap();
        let count = db.compile(&QueryTemplate::scalar("SELECT COUNT(*) FROM person")).unwrap();
        let mut live = db.subscribe(&count, Params::new()).unwrap();
        live.next().await.unwrap().unwrap();

        db.close();
        assert!(db.is_closed());
        assert!(matches!(db.execute(&count, Params::new()).await, Err(AccessError::Closed)));
        assert!(matches!(db.subscribe(&count, Params::new()), Err(AccessError::Closed)));
        assert!(live.next().await.is_none());
    }

    #[tokio::test]
    async fn test_write_queries_cannot_be_subscribed() {
        let db = Database::open(OpenOptions::new(snapshot())).await.unwrap();
        let delete = db.compile(&QueryTemplate::affected("DELETE FROM person")).unwrap();
        assert!(matches!(
            db.subscribe(&delete, Params::new()),
            Err(AccessError::Compile(BindError::UnsupportedStatement(_)))
        ));
    }
}

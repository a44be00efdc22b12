//! SQLite storage implementation

use crate::config::DatabaseConfig;
use crate::value::Value;
use crate::{Error, Result};
use parking_lot::Mutex;
use rusqlite::{Connection, InterruptHandle, TransactionBehavior, params_from_iter};
use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Locking mode of a store transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnMode {
    /// Reads; takes the shared lock on first access
    Deferred,
    /// Writes; takes the reserved lock at BEGIN
    Immediate,
    /// Migrations; blocks every other connection
    Exclusive,
}

impl TxnMode {
    fn behavior(self) -> TransactionBehavior {
        match self {
            TxnMode::Deferred => TransactionBehavior::Deferred,
            TxnMode::Immediate => TransactionBehavior::Immediate,
            TxnMode::Exclusive => TransactionBehavior::Exclusive,
        }
    }
}

/// Column names and values of a row-returning statement
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

/// Result of [`StoreTxn::execute`]
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Rows(RowSet),
    Affected(usize),
}

impl Outcome {
    /// Rows of a row-returning statement; empty for plain writes
    pub fn into_rows(self) -> RowSet {
        match self {
            Outcome::Rows(rows) => rows,
            Outcome::Affected(_) => RowSet::default(),
        }
    }
}

/// SQLite-backed store. One connection, serialized behind a mutex.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    interrupt: InterruptHandle,
    /// Ticket of the transaction currently holding the connection
    running: Mutex<Option<u64>>,
    next_ticket: AtomicU64,
    location: String,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore")
            .field("location", &self.location)
            .finish_non_exhaustive()
    }
}

impl SqliteStore {
    /// Open the store described by `config` (creates the file if missing)
    pub fn open(config: &DatabaseConfig) -> Result<Self> {
        config.validate()?;
        let conn = if config.is_memory() {
            Connection::open_in_memory()?
        } else {
            Connection::open(&config.store_location)?
        };
        let store = Self::from_connection(conn, config.store_location.clone());
        store.configure(config)?;
        tracing::debug!("Opened store at {}", store.location);
        Ok(store)
    }

    /// Open an in-memory database with default settings (for testing)
    pub fn open_in_memory() -> Result<Self> {
        Self::open(&DatabaseConfig::default())
    }

    fn from_connection(conn: Connection, location: String) -> Self {
        let interrupt = conn.get_interrupt_handle();
        Self {
            conn: Mutex::new(conn),
            interrupt,
            running: Mutex::new(None),
            next_ticket: AtomicU64::new(1),
            location,
        }
    }

    fn configure(&self, config: &DatabaseConfig) -> Result<()> {
        let conn = self.conn.lock();
        conn.busy_timeout(Duration::from_millis(config.busy_timeout_ms))?;
        let foreign_keys = if config.foreign_keys { "ON" } else { "OFF" };
        // journal_mode was checked against a fixed list by validate()
        conn.execute_batch(&format!(
            "PRAGMA foreign_keys = {foreign_keys}; PRAGMA journal_mode = {};",
            config.journal_mode.to_ascii_lowercase()
        ))?;
        let enabled: bool = conn.query_row("PRAGMA foreign_keys", [], |row| row.get(0))?;
        if enabled != config.foreign_keys {
            return Err(Error::Config("foreign_keys pragma could not be applied".to_string()));
        }
        Ok(())
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    /// Reserve a ticket for a cancellable transaction
    pub fn ticket(&self) -> u64 {
        self.next_ticket.fetch_add(1, Ordering::Relaxed)
    }

    /// Interrupt the running statement if it belongs to `ticket`
    pub fn interrupt(&self, ticket: u64) -> bool {
        let running = self.running.lock();
        if *running == Some(ticket) {
            self.interrupt.interrupt();
            tracing::debug!("Interrupted transaction {}", ticket);
            true
        } else {
            false
        }
    }

    /// Run `f` in a transaction: commit on `Ok`, roll back on `Err`
    pub fn transaction<T, E, F>(&self, mode: TxnMode, f: F) -> std::result::Result<T, E>
    where
        F: FnOnce(&StoreTxn<'_>) -> std::result::Result<T, E>,
        E: From<rusqlite::Error>,
    {
        self.transaction_with_ticket(mode, None, f)
    }

    /// Like [`transaction`](Self::transaction), interruptible through
    /// [`interrupt`](Self::interrupt) with the same ticket
    pub fn transaction_with_ticket<T, E, F>(
        &self,
        mode: TxnMode,
        ticket: Option<u64>,
        f: F,
    ) -> std::result::Result<T, E>
    where
        F: FnOnce(&StoreTxn<'_>) -> std::result::Result<T, E>,
        E: From<rusqlite::Error>,
    {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(mode.behavior())?;
        // only the closure's statements are interruptible, never COMMIT or ROLLBACK
        let result = {
            let _running = RunningGuard::enter(&self.running, ticket);
            let txn = StoreTxn {
                conn: &tx,
                savepoints: Cell::new(0),
            };
            f(&txn)
        };
        match result {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback) = tx.rollback() {
                    tracing::warn!("Rollback failed: {}", rollback);
                }
                Err(e)
            }
        }
    }
}

/// Marks the connection as owned by a ticket for the guard's lifetime
struct RunningGuard<'a> {
    slot: &'a Mutex<Option<u64>>,
}

impl<'a> RunningGuard<'a> {
    fn enter(slot: &'a Mutex<Option<u64>>, ticket: Option<u64>) -> Self {
        *slot.lock() = ticket;
        Self { slot }
    }
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        *self.slot.lock() = None;
    }
}

/// An open transaction. Dropped without commit means rolled back.
pub struct StoreTxn<'c> {
    conn: &'c Connection,
    savepoints: Cell<u32>,
}

impl StoreTxn<'_> {
    /// Execute one statement with positional values
    pub fn execute(&self, sql: &str, values: &[Value]) -> rusqlite::Result<Outcome> {
        let mut stmt = self.conn.prepare_cached(sql)?;
        if stmt.column_count() == 0 {
            let n = stmt.execute(params_from_iter(values.iter()))?;
            return Ok(Outcome::Affected(n));
        }

        let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
        let width = columns.len();
        let mut rows = stmt.query(params_from_iter(values.iter()))?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let mut values = Vec::with_capacity(width);
            for i in 0..width {
                values.push(Value::from(row.get_ref(i)?));
            }
            out.push(values);
        }
        Ok(Outcome::Rows(RowSet { columns, rows: out }))
    }

    /// Rows of a query
    pub fn query(&self, sql: &str, values: &[Value]) -> rusqlite::Result<RowSet> {
        self.execute(sql, values).map(Outcome::into_rows)
    }

    /// Run a script of `;`-separated statements without parameters
    pub fn execute_batch(&self, sql: &str) -> rusqlite::Result<()> {
        self.conn.execute_batch(sql)
    }

    pub fn last_insert_rowid(&self) -> i64 {
        self.conn.last_insert_rowid()
    }

    /// Rows modified by the most recent INSERT, UPDATE or DELETE
    pub fn changes(&self) -> u64 {
        self.conn.changes()
    }

    /// Run `f` inside a savepoint: released on `Ok`, rolled back on `Err`
    pub fn savepoint<T, E, F>(&self, f: F) -> std::result::Result<T, E>
    where
        F: FnOnce(&StoreTxn<'_>) -> std::result::Result<T, E>,
        E: From<rusqlite::Error>,
    {
        let depth = self.savepoints.get() + 1;
        let name = format!("relmap_sp{depth}");
        self.conn.execute_batch(&format!("SAVEPOINT {name}"))?;
        self.savepoints.set(depth);
        let result = f(self);
        self.savepoints.set(depth - 1);

        match result {
            Ok(value) => {
                self.conn.execute_batch(&format!("RELEASE {name}"))?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback) = self
                    .conn
                    .execute_batch(&format!("ROLLBACK TO {name}; RELEASE {name}"))
                {
                    tracing::warn!("Savepoint rollback failed: {}", rollback);
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_table() -> SqliteStore {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .transaction(TxnMode::Immediate, |txn| {
                txn.execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT NOT NULL)")
            })
            .unwrap();
        store
    }

    fn count(store: &SqliteStore) -> i64 {
        store
            .transaction(TxnMode::Deferred, |txn| txn.query("SELECT COUNT(*) FROM t", &[]))
            .unwrap()
            .rows[0][0]
            .as_i64()
            .unwrap()
    }

    #[test]
    fn test_execute_outcomes() {
        let store = store_with_table();
        let outcome = store
            .transaction(TxnMode::Immediate, |txn| {
                txn.execute("INSERT INTO t (name) VALUES (?1), (?2)", &["a".into(), "b".into()])
            })
            .unwrap();
        assert_eq!(outcome, Outcome::Affected(2));

        let rows = store
            .transaction(TxnMode::Deferred, |txn| {
                txn.query("SELECT id, name FROM t ORDER BY id", &[])
            })
            .unwrap();
        assert_eq!(rows.columns, vec!["id", "name"]);
        assert_eq!(rows.rows[1], vec![Value::Integer(2), Value::Text("b".into())]);
    }

    #[test]
    fn test_rollback_on_error() {
        let store = store_with_table();
        let result: std::result::Result<(), rusqlite::Error> = store.transaction(TxnMode::Immediate, |txn| {
            txn.execute("INSERT INTO t (name) VALUES ('x')", &[])?;
            txn.execute("INSERT INTO t (name) VALUES (NULL)", &[])?;
            Ok(())
        });
        assert!(result.is_err());
        assert_eq!(count(&store), 0);
    }

    #[test]
    fn test_savepoint_rolls_back_only_inner_work() {
        let store = store_with_table();
        store
            .transaction(TxnMode::Immediate, |txn| {
                txn.execute("INSERT INTO t (name) VALUES ('kept')", &[])?;
                let inner: std::result::Result<(), rusqlite::Error> = txn.savepoint(|sp| {
                    sp.execute("INSERT INTO t (name) VALUES ('dropped')", &[])?;
                    sp.execute("INSERT INTO t (name) VALUES (NULL)", &[])?;
                    Ok(())
                });
                assert!(inner.is_err());
                Ok::<_, rusqlite::Error>(())
            })
            .unwrap();
        assert_eq!(count(&store), 1);
    }

    #[test]
    fn test_pragmas_applied() {
        let store = SqliteStore::open_in_memory().unwrap();
        let rows = store
            .transaction(TxnMode::Deferred, |txn| txn.query("PRAGMA foreign_keys", &[]))
            .unwrap();
        assert_eq!(rows.rows[0][0], Value::Integer(1));
    }

    #[test]
    fn test_interrupt_only_matching_ticket() {
        let store = SqliteStore::open_in_memory().unwrap();
        let ticket = store.ticket();
        assert!(!store.interrupt(ticket));
        let seen = store
            .transaction_with_ticket(TxnMode::Deferred, Some(ticket), |_| {
                Ok::<_, rusqlite::Error>(*store.running.lock())
            })
            .unwrap();
        assert_eq!(seen, Some(ticket));
        assert_eq!(*store.running.lock(), None);
    }

    #[test]
    fn test_open_file_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.db");
        let config = DatabaseConfig::at(path.to_string_lossy());
        let store = SqliteStore::open(&config).unwrap();
        let rows = store
            .transaction(TxnMode::Deferred, |txn| txn.query("PRAGMA journal_mode", &[]))
            .unwrap();
        assert_eq!(rows.rows[0][0], Value::Text("wal".into()));
        assert!(path.exists());
    }
}

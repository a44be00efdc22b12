//! Change notifier - live queries re-run when a committed write touches
//! a table they read
//!
//! Each subscription owns one dispatch task. Publishing a write-set only
//! stores a wake permit on the matching handles, so bursts of writes collapse
//! into a single re-execution.

use crate::access::{self, AccessError, QueryResult};
use crate::query::BoundStatement;
use crate::storage::{SqliteStore, TxnMode};
use futures_util::Stream;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use tokio::sync::{Notify, mpsc};
use tokio_util::sync::CancellationToken;

/// Deliveries buffered per subscriber before the dispatch task waits
const DELIVERY_BUFFER: usize = 4;

/// Terminal failure of a live query. The handle is gone once this is seen.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Live query {handle} stopped: {message}")]
pub struct NotificationError {
    pub handle: u64,
    pub message: String,
}

struct HandleEntry {
    read_set: BTreeSet<String>,
    wake: Arc<Notify>,
    cancel: CancellationToken,
}

struct NotifierInner {
    store: Arc<SqliteStore>,
    handles: Mutex<HashMap<u64, HandleEntry>>,
    next_handle: AtomicU64,
    shutdown: CancellationToken,
}

impl NotifierInner {
    fn remove(&self, handle: u64) -> bool {
        match self.handles.lock().remove(&handle) {
            Some(entry) => {
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }
}

/// Registry of live queries over one store
#[derive(Clone)]
pub struct ChangeNotifier {
    inner: Arc<NotifierInner>,
}

impl ChangeNotifier {
    pub fn new(store: Arc<SqliteStore>) -> Self {
        Self {
            inner: Arc::new(NotifierInner {
                store,
                handles: Mutex::new(HashMap::new()),
                next_handle: AtomicU64::new(1),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Start a live query. The current result is delivered first, then a new
    /// one after every relevant commit whose result differs from the last.
    pub fn subscribe(&self, bound: BoundStatement) -> LiveQuery {
        let (tx, rx) = mpsc::channel(DELIVERY_BUFFER);
        let handle = self.inner.next_handle.fetch_add(1, Ordering::Relaxed);

        if self.inner.shutdown.is_cancelled() {
            drop(tx);
            return LiveQuery {
                handle,
                rx,
                cancel: self.inner.shutdown.clone(),
                notifier: Weak::new(),
            };
        }

        let wake = Arc::new(Notify::new());
        let cancel = self.inner.shutdown.child_token();
        self.inner.handles.lock().insert(
            handle,
            HandleEntry {
                read_set: bound.query().read_set().clone(),
                wake: Arc::clone(&wake),
                cancel: cancel.clone(),
            },
        );
        tracing::debug!(
            "Subscribed live query {} on {:?}",
            handle,
            bound.query().read_set()
        );

        let inner = Arc::downgrade(&self.inner);
        let store = Arc::clone(&self.inner.store);
        tokio::spawn(dispatch(handle, bound, store, wake, cancel.clone(), tx, inner));

        LiveQuery {
            handle,
            rx,
            cancel,
            notifier: Arc::downgrade(&self.inner),
        }
    }

    /// Stop a live query. Returns false if the handle was already gone.
    pub fn unsubscribe(&self, handle: u64) -> bool {
        let removed = self.inner.remove(handle);
        if removed {
            tracing::debug!("Unsubscribed live query {}", handle);
        }
        removed
    }

    /// Wake every live query whose read-set intersects `write_set`.
    /// Called after commit only.
    pub fn publish(&self, write_set: &BTreeSet<String>) {
        if write_set.is_empty() {
            return;
        }
        let handles = self.inner.handles.lock();
        let mut woken = 0;
        for entry in handles.values() {
            if !entry.read_set.is_disjoint(write_set) {
                entry.wake.notify_one();
                woken += 1;
            }
        }
        tracing::debug!("Published {:?} to {} live queries", write_set, woken);
    }

    /// Number of registered live queries
    pub fn active(&self) -> usize {
        self.inner.handles.lock().len()
    }

    /// Stop every live query; later subscriptions end immediately
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let drained: Vec<_> = self.inner.handles.lock().drain().collect();
        if !drained.is_empty() {
            tracing::info!("Stopped {} live queries", drained.len());
        }
    }
}

async fn dispatch(
    handle: u64,
    bound: BoundStatement,
    store: Arc<SqliteStore>,
    wake: Arc<Notify>,
    cancel: CancellationToken,
    tx: mpsc::Sender<Result<QueryResult, NotificationError>>,
    notifier: Weak<NotifierInner>,
) {
    let mut last: Option<QueryResult> = None;
    loop {
        let statement = bound.clone();
        let run = access::run_blocking(
            Arc::clone(&store),
            TxnMode::Deferred,
            Some(cancel.clone()),
            move |txn| txn.execute_bound(&statement),
        )
        .await;

        match run {
            Ok((result, _)) => {
                if cancel.is_cancelled() {
                    break;
                }
                if last.as_ref() != Some(&result) {
                    // cancellation wins over a send that is also ready
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        sent = tx.send(Ok(result.clone())) => {
                            if sent.is_err() {
                                break;
                            }
                        }
                    }
                    last = Some(result);
                }
            }
            Err(AccessError::Cancelled) => break,
            Err(e) => {
                tracing::warn!("Dropping live query {}: {}", handle, e);
                let _ = tx
                    .send(Err(NotificationError {
                        handle,
                        message: e.to_string(),
                    }))
                    .await;
                break;
            }
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = wake.notified() => {}
        }
    }

    // the token stays as is: a terminal error must still reach the reader
    if let Some(inner) = notifier.upgrade() {
        inner.handles.lock().remove(&handle);
    }
}

/// Stream of results for one live query. Dropping it unsubscribes.
///
/// Once unsubscribed the stream ends, even if results were still buffered.
pub struct LiveQuery {
    handle: u64,
    rx: mpsc::Receiver<Result<QueryResult, NotificationError>>,
    cancel: CancellationToken,
    notifier: Weak<NotifierInner>,
}

impl LiveQuery {
    pub fn handle(&self) -> u64 {
        self.handle
    }
}

impl Stream for LiveQuery {
    type Item = Result<QueryResult, NotificationError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.cancel.is_cancelled() {
            return Poll::Ready(None);
        }
        self.rx.poll_recv(cx)
    }
}

impl Drop for LiveQuery {
    fn drop(&mut self) {
        if let Some(inner) = self.notifier.upgrade() {
            inner.remove(self.handle);
        }
    }
}

impl std::fmt::Debug for LiveQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveQuery").field("handle", &self.handle).finish()
    }
}

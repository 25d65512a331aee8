//! Shared connection state per physical database.
//!
//! Every store handle pointing at the same database identity goes through
//! one `ConnectionContext`. The context owns the cached backend handle, the
//! readiness-gate chain serializing schema upgrades, the admission counters
//! and the coalescing queue (the latter two are driven from `admission.rs`
//! and `coalesce.rs`). All `ContextState` mutation happens under one
//! synchronous mutex held only across non-await steps; suspension points are
//! the backend calls and the gate awaits.

use crate::admission::AdmitGuard;
use crate::backend::{BackendDb, BackendDriver};
use crate::coalesce::{QueuedWrite, WriteStats};
use crate::error::AkvError;
use parking_lot::Mutex;
use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use tokio::sync::{oneshot, watch};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Closed,
    Opening,
    Open,
    Upgrading,
}

/// One resolve-or-reject checkpoint in the readiness chain.
#[derive(Debug, Clone)]
pub enum GateState {
    Pending,
    Done,
    Failed(AkvError),
}

pub(crate) struct ContextState {
    pub conn: ConnState,
    pub db: Option<Arc<dyn BackendDb>>,
    /// Effective version, pinned to the on-disk value when that is higher
    /// than any request.
    pub version: u64,
    /// Highest version any co-resident handle has requested.
    pub requested_version: u64,
    pub stores: BTreeSet<String>,
    /// Tail of the readiness chain; operations await it before touching the
    /// connection.
    pub ready_tail: Option<watch::Receiver<GateState>>,
    // Admission (see admission.rs). Queued starts receive their slot as a
    // guard, so a waiter dropped mid-wait gives the slot back on drop.
    pub active_txns: usize,
    pub pending_txns: VecDeque<oneshot::Sender<AdmitGuard>>,
    pub idle_generation: u64,
    // Coalescing (see coalesce.rs).
    pub queue: Vec<QueuedWrite>,
    pub flush_scheduled: bool,
}

pub struct ConnectionContext {
    driver: Arc<dyn BackendDriver>,
    name: String,
    pub(crate) state: Mutex<ContextState>,
    /// Serializes open/upgrade/reconnect work across handles.
    pub(crate) open_lock: tokio::sync::Mutex<()>,
    /// Serializes flushes. A drain that wants read-your-writes acquires it
    /// too, so it waits out a flush already applying earlier writes.
    pub(crate) flush_lock: tokio::sync::Mutex<()>,
    pub(crate) stats: WriteStats,
}

impl ConnectionContext {
    pub(crate) fn new(driver: Arc<dyn BackendDriver>, name: String) -> Self {
        Self {
            driver,
            name,
            state: Mutex::new(ContextState {
                conn: ConnState::Closed,
                db: None,
                version: 0,
                requested_version: 0,
                stores: BTreeSet::new(),
                ready_tail: None,
                active_txns: 0,
                pending_txns: VecDeque::new(),
                idle_generation: 0,
                queue: Vec::new(),
                flush_scheduled: false,
            }),
            open_lock: tokio::sync::Mutex::new(()),
            flush_lock: tokio::sync::Mutex::new(()),
            stats: WriteStats::default(),
        }
    }

    pub fn driver(&self) -> &Arc<dyn BackendDriver> {
        &self.driver
    }

    pub fn driver_name(&self) -> &str {
        self.driver.name()
    }

    pub fn database_name(&self) -> &str {
        &self.name
    }

    pub fn conn_state(&self) -> ConnState {
        self.state.lock().conn
    }

    pub fn effective_version(&self) -> u64 {
        self.state.lock().version
    }

    pub fn stats(&self) -> &WriteStats {
        &self.stats
    }

    /// Registers a store name and the version its handle requests. A request
    /// below the already-effective version is a downgrade: warned and pinned.
    pub fn register_store(&self, store: &str, version: u64) {
        let mut state = self.state.lock();
        state.stores.insert(store.to_owned());
        if version > state.requested_version {
            state.requested_version = version;
        }
        if version < state.version {
            warn!(
                database = %self.name,
                requested = version,
                effective = state.version,
                "version downgrade request ignored; pinning to on-disk version"
            );
        }
    }

    pub fn unregister_store(&self, store: &str) {
        self.state.lock().stores.remove(store);
    }

    pub fn registered_stores(&self) -> Vec<String> {
        self.state.lock().stores.iter().cloned().collect()
    }

    /// Returns an open, non-stale handle covering every registered store,
    /// opening or upgrading the connection as needed. Operations queued
    /// behind an in-flight upgrade wait on the readiness chain; a failed
    /// open rejects them, and the next call re-attempts from `Closed`.
    pub async fn ensure_open(&self) -> Result<Arc<dyn BackendDb>, AkvError> {
        loop {
            // Snapshot the tail without holding the lock across the await.
            let tail = {
                let mut state = self.state.lock();
                match state.ready_tail.as_ref().map(|rx| rx.borrow().clone()) {
                    Some(GateState::Failed(_)) => {
                        // A previous open failed; this operation arrived
                        // after the rejection fan-out, so it re-attempts.
                        state.ready_tail = None;
                        state.conn = ConnState::Closed;
                        None
                    }
                    Some(GateState::Pending) => state.ready_tail.clone(),
                    _ => None,
                }
            };
            if let Some(mut rx) = tail {
                let outcome = Self::await_gate(&mut rx).await;
                if let GateState::Failed(err) = outcome {
                    return Err(err);
                }
                // Re-check the connection now that the upgrade finished.
                continue;
            }

            if let Some(db) = self.usable_db() {
                return Ok(db);
            }
            self.open_or_upgrade().await?;
        }
    }

    /// Handles a stale-handle signal: closes the shared connection so the
    /// retry path reopens from scratch, re-resolving version compatibility.
    pub async fn reconnect(&self) -> Result<Arc<dyn BackendDb>, AkvError> {
        let db = {
            let mut state = self.state.lock();
            state.conn = ConnState::Closed;
            state.db.take()
        };
        if let Some(db) = db {
            db.close().await;
        }
        self.ensure_open().await
    }

    fn usable_db(&self) -> Option<Arc<dyn BackendDb>> {
        let state = self.state.lock();
        if state.conn != ConnState::Open {
            return None;
        }
        let db = state.db.as_ref()?;
        if db.is_stale() {
            return None;
        }
        let covered = state
            .stores
            .iter()
            .all(|store| db.store_names().contains(store));
        let versioned = db.version() >= state.requested_version;
        (covered && versioned).then(|| Arc::clone(db))
    }

    async fn await_gate(rx: &mut watch::Receiver<GateState>) -> GateState {
        loop {
            let current = rx.borrow().clone();
            if !matches!(current, GateState::Pending) {
                return current;
            }
            if rx.changed().await.is_err() {
                // Sender dropped without resolving; treat as a failed open.
                return GateState::Failed(AkvError::NotInitialized);
            }
        }
    }

    async fn open_or_upgrade(&self) -> Result<(), AkvError> {
        let _open_guard = self.open_lock.lock().await;

        // Someone else may have finished the open while we waited.
        if self.usable_db().is_some() {
            return Ok(());
        }

        let (gate_tx, prior_tail, target_version, stores, existing) = {
            let mut state = self.state.lock();
            let (tx, rx) = watch::channel(GateState::Pending);
            let prior = state.ready_tail.replace(rx);
            let upgrading = state.db.is_some();
            state.conn = if upgrading {
                ConnState::Upgrading
            } else {
                ConnState::Opening
            };
            let target = state.requested_version.max(state.version).max(1);
            let needs_bump = state.db.as_ref().is_some_and(|db| {
                !state
                    .stores
                    .iter()
                    .all(|store| db.store_names().contains(store))
            });
            let target = if needs_bump { target + 1 } else { target };
            (
                tx,
                prior,
                target,
                state.stores.iter().cloned().collect::<Vec<_>>(),
                state.db.take(),
            )
        };

        // Upgrades are strictly serialized: our gate resolves only after the
        // prior one has.
        if let Some(mut prior) = prior_tail {
            if let GateState::Failed(err) = Self::await_gate(&mut prior).await {
                self.reject_open(&gate_tx, err.clone());
                return Err(err);
            }
        }

        if let Some(db) = existing {
            db.close().await;
        }

        match self.driver.open(&self.name, target_version, &stores).await {
            Ok(outcome) => {
                let mut state = self.state.lock();
                if outcome.version > target_version {
                    debug!(
                        database = %self.name,
                        requested = target_version,
                        effective = outcome.version,
                        "opened at newer on-disk version"
                    );
                }
                state.version = outcome.version;
                state.requested_version = state.requested_version.max(outcome.version);
                state.db = Some(Arc::clone(&outcome.db));
                state.conn = ConnState::Open;
                drop(state);
                let _ = gate_tx.send(GateState::Done);
                Ok(())
            }
            Err(err) => {
                self.reject_open(&gate_tx, err.clone());
                Err(err)
            }
        }
    }

    fn reject_open(&self, gate_tx: &watch::Sender<GateState>, err: AkvError) {
        {
            let mut state = self.state.lock();
            state.conn = ConnState::Closed;
            state.db = None;
        }
        let _ = gate_tx.send(GateState::Failed(err));
    }

    /// Drops the cached handle after an idle interval; the next operation
    /// goes through `ensure_open` again.
    pub(crate) async fn close_idle(&self) {
        let db = {
            let mut state = self.state.lock();
            if state.active_txns != 0 || !state.pending_txns.is_empty() || !state.queue.is_empty()
            {
                return;
            }
            state.conn = ConnState::Closed;
            state.db.take()
        };
        if let Some(db) = db {
            debug!(database = %self.name, "closing idle connection");
            db.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryDriver;

    fn context(driver_name: &str, db: &str) -> ConnectionContext {
        let driver: Arc<dyn BackendDriver> = Arc::new(MemoryDriver::with_name(driver_name));
        ConnectionContext::new(driver, db.to_owned())
    }

    #[tokio::test]
    async fn ensure_open_creates_registered_stores() {
        let ctx = context("conn-open", "db");
        ctx.register_store("a", 1);
        ctx.register_store("b", 1);
        let db = ctx.ensure_open().await.unwrap();
        assert_eq!(db.store_names(), vec!["a".to_owned(), "b".to_owned()]);
        assert_eq!(ctx.conn_state(), ConnState::Open);
    }

    #[tokio::test]
    async fn late_store_registration_forces_upgrade() {
        let ctx = context("conn-upgrade", "db");
        ctx.register_store("a", 1);
        let first = ctx.ensure_open().await.unwrap();
        let v1 = first.version();

        ctx.register_store("b", 1);
        let second = ctx.ensure_open().await.unwrap();
        assert!(second.store_names().contains(&"b".to_owned()));
        assert!(second.version() > v1);
        assert!(first.is_stale());
    }

    #[tokio::test]
    async fn downgrade_request_is_pinned() {
        let ctx = context("conn-downgrade", "db");
        ctx.register_store("a", 5);
        ctx.ensure_open().await.unwrap();
        assert_eq!(ctx.effective_version(), 5);

        // A second handle requesting an older version shares the context.
        ctx.register_store("a", 2);
        let db = ctx.ensure_open().await.unwrap();
        assert_eq!(db.version(), 5);
        assert_eq!(ctx.effective_version(), 5);
    }

    #[tokio::test]
    async fn reconnect_reopens_after_invalidation() {
        let ctx = context("conn-reconnect", "db");
        ctx.register_store("a", 1);
        let first = ctx.ensure_open().await.unwrap();

        // Invalidate behind the context's back.
        ctx.driver().drop_database("db").await.unwrap();
        assert!(first.is_stale());

        let second = ctx.reconnect().await.unwrap();
        assert!(!second.is_stale());
        assert!(second.store_names().contains(&"a".to_owned()));
    }
}

//! In-memory reference driver.
//!
//! Keeps one versioned database table per driver instance. Transactions
//! buffer writes in a private workspace and apply them on commit under the
//! database write lock, which is what gives the driver its single-writer
//! semantics. Handles are invalidated (marked stale) by upgrades and drops.

use crate::backend::{BackendDb, BackendDriver, BackendTxn, Capability, OpenOutcome, TxnMode};
use crate::error::AkvError;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub const MEMORY_DRIVER: &str = "memory";

struct DbState {
    version: u64,
    /// Bumped by every upgrade and by drop; handles born under an older
    /// generation are stale.
    generation: u64,
    dropped: bool,
    stores: BTreeMap<String, BTreeMap<String, Value>>,
}

struct DbShared {
    name: String,
    state: RwLock<DbState>,
}

pub struct MemoryDriver {
    name: String,
    databases: RwLock<HashMap<String, Arc<DbShared>>>,
    rw_txns_started: Arc<AtomicU64>,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::with_name(MEMORY_DRIVER)
    }

    /// A driver instance under a custom registry name. Lets tests isolate
    /// their database tables and transaction counters.
    pub fn with_name(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            databases: RwLock::new(HashMap::new()),
            rw_txns_started: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Number of read-write transactions begun since construction. Used to
    /// observe how many underlying transactions a write burst produced.
    pub fn rw_transactions_started(&self) -> u64 {
        self.rw_txns_started.load(Ordering::Relaxed)
    }
}

impl Default for MemoryDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BackendDriver for MemoryDriver {
    fn name(&self) -> &str {
        &self.name
    }

    fn supports(&self, _cap: Capability) -> bool {
        true
    }

    async fn open(
        &self,
        name: &str,
        version: u64,
        stores: &[String],
    ) -> Result<OpenOutcome, AkvError> {
        let shared = {
            let mut dbs = self.databases.write();
            Arc::clone(dbs.entry(name.to_owned()).or_insert_with(|| {
                Arc::new(DbShared {
                    name: name.to_owned(),
                    state: RwLock::new(DbState {
                        version: 0,
                        generation: 0,
                        dropped: false,
                        stores: BTreeMap::new(),
                    }),
                })
            }))
        };

        let (effective, generation, upgraded) = {
            let mut state = shared.state.write();
            state.dropped = false;
            let mut upgraded = false;
            if version > state.version {
                state.version = version;
                upgraded = true;
            }
            for store in stores {
                if !state.stores.contains_key(store) {
                    state.stores.insert(store.clone(), BTreeMap::new());
                    upgraded = true;
                }
            }
            if upgraded {
                state.generation += 1;
            }
            (state.version, state.generation, upgraded)
        };

        Ok(OpenOutcome {
            db: Arc::new(MemoryDb {
                driver: self.name.clone(),
                shared,
                version: effective,
                generation,
                rw_txns_started: Arc::clone(&self.rw_txns_started),
            }),
            version: effective,
            upgraded,
        })
    }

    async fn drop_database(&self, name: &str) -> Result<(), AkvError> {
        let shared = self.databases.write().remove(name);
        if let Some(shared) = shared {
            let mut state = shared.state.write();
            state.dropped = true;
            state.generation += 1;
            state.stores.clear();
        }
        Ok(())
    }
}

struct MemoryDb {
    driver: String,
    shared: Arc<DbShared>,
    version: u64,
    generation: u64,
    rw_txns_started: Arc<AtomicU64>,
}

impl MemoryDb {
    fn stale(&self) -> bool {
        let state = self.shared.state.read();
        state.dropped || state.generation != self.generation
    }
}

#[async_trait]
impl BackendDb for MemoryDb {
    fn version(&self) -> u64 {
        self.version
    }

    fn store_names(&self) -> Vec<String> {
        self.shared.state.read().stores.keys().cloned().collect()
    }

    fn is_stale(&self) -> bool {
        self.stale()
    }

    async fn begin(&self, store: &str, mode: TxnMode) -> Result<Box<dyn BackendTxn>, AkvError> {
        if self.stale() {
            return Err(AkvError::Unavailable {
                driver: self.driver.clone(),
                message: format!("handle to '{}' was invalidated", self.shared.name),
            });
        }
        if !self.shared.state.read().stores.contains_key(store) {
            // The schema this handle was opened under predates the store.
            return Err(AkvError::Unavailable {
                driver: self.driver.clone(),
                message: format!(
                    "store '{store}' does not exist in '{}' at version {}",
                    self.shared.name, self.version
                ),
            });
        }
        if mode == TxnMode::ReadWrite {
            self.rw_txns_started.fetch_add(1, Ordering::Relaxed);
        }
        Ok(Box::new(MemoryTxn {
            driver: self.driver.clone(),
            shared: Arc::clone(&self.shared),
            generation: self.generation,
            store: store.to_owned(),
            mode,
            clear_first: false,
            workspace: Vec::new(),
        }))
    }

    async fn close(&self) {
        // Nothing to release; staleness is tracked by generation.
    }
}

struct MemoryTxn {
    driver: String,
    shared: Arc<DbShared>,
    generation: u64,
    store: String,
    mode: TxnMode,
    clear_first: bool,
    /// Buffered writes in submission order. `None` value is a delete.
    workspace: Vec<(String, Option<Value>)>,
}

impl MemoryTxn {
    fn readonly_err(&self, operation: &str) -> AkvError {
        AkvError::ReadonlyTransaction {
            operation: operation.into(),
        }
    }

    fn pending_for(&self, key: &str) -> Option<Option<&Value>> {
        self.workspace
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_ref())
    }
}

#[async_trait]
impl BackendTxn for MemoryTxn {
    async fn get(&mut self, key: &str) -> Result<Option<Value>, AkvError> {
        if let Some(pending) = self.pending_for(key) {
            return Ok(pending.cloned());
        }
        if self.clear_first {
            return Ok(None);
        }
        let state = self.shared.state.read();
        Ok(state
            .stores
            .get(&self.store)
            .and_then(|store| store.get(key))
            .cloned())
    }

    async fn put(&mut self, key: &str, value: Value) -> Result<(), AkvError> {
        if self.mode == TxnMode::ReadOnly {
            return Err(self.readonly_err("put"));
        }
        self.workspace.push((key.to_owned(), Some(value)));
        Ok(())
    }

    async fn delete(&mut self, key: &str) -> Result<(), AkvError> {
        if self.mode == TxnMode::ReadOnly {
            return Err(self.readonly_err("delete"));
        }
        self.workspace.push((key.to_owned(), None));
        Ok(())
    }

    async fn keys(&mut self) -> Result<Vec<String>, AkvError> {
        let mut merged: BTreeMap<String, bool> = BTreeMap::new();
        if !self.clear_first {
            let state = self.shared.state.read();
            if let Some(store) = state.stores.get(&self.store) {
                for key in store.keys() {
                    merged.insert(key.clone(), true);
                }
            }
        }
        for (key, value) in &self.workspace {
            merged.insert(key.clone(), value.is_some());
        }
        Ok(merged
            .into_iter()
            .filter_map(|(key, live)| live.then_some(key))
            .collect())
    }

    async fn clear(&mut self) -> Result<(), AkvError> {
        if self.mode == TxnMode::ReadOnly {
            return Err(self.readonly_err("clear"));
        }
        self.clear_first = true;
        self.workspace.clear();
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), AkvError> {
        if self.mode == TxnMode::ReadOnly {
            return Ok(());
        }
        let mut state = self.shared.state.write();
        if state.dropped || state.generation != self.generation {
            return Err(AkvError::Unavailable {
                driver: self.driver.clone(),
                message: format!("handle to '{}' was invalidated", self.shared.name),
            });
        }
        let store = state.stores.get_mut(&self.store).ok_or_else(|| {
            AkvError::Unavailable {
                driver: self.driver.clone(),
                message: format!("store '{}' vanished before commit", self.store),
            }
        })?;
        if self.clear_first {
            store.clear();
        }
        for (key, value) in self.workspace {
            match value {
                Some(value) => {
                    store.insert(key, value);
                }
                None => {
                    store.remove(&key);
                }
            }
        }
        Ok(())
    }

    async fn abort(self: Box<Self>) -> Result<(), AkvError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn writes_apply_at_commit_only() {
        let driver = MemoryDriver::new();
        let opened = driver.open("db", 1, &["s".into()]).await.unwrap();

        let mut txn = opened.db.begin("s", TxnMode::ReadWrite).await.unwrap();
        txn.put("a", json!(1)).await.unwrap();
        assert_eq!(txn.get("a").await.unwrap(), Some(json!(1)));

        let mut reader = opened.db.begin("s", TxnMode::ReadOnly).await.unwrap();
        assert_eq!(reader.get("a").await.unwrap(), None);
        reader.abort().await.unwrap();

        txn.commit().await.unwrap();
        let mut reader = opened.db.begin("s", TxnMode::ReadOnly).await.unwrap();
        assert_eq!(reader.get("a").await.unwrap(), Some(json!(1)));
        reader.abort().await.unwrap();
    }

    #[tokio::test]
    async fn readonly_transactions_reject_mutation() {
        let driver = MemoryDriver::new();
        let opened = driver.open("db", 1, &["s".into()]).await.unwrap();
        let mut txn = opened.db.begin("s", TxnMode::ReadOnly).await.unwrap();
        let err = txn.put("a", json!(1)).await.unwrap_err();
        assert_eq!(err.code_str(), "readonly_transaction");
        let err = txn.delete("a").await.unwrap_err();
        assert_eq!(err.code_str(), "readonly_transaction");
        let err = txn.clear().await.unwrap_err();
        assert_eq!(err.code_str(), "readonly_transaction");
    }

    #[tokio::test]
    async fn upgrade_invalidates_older_handles() {
        let driver = MemoryDriver::new();
        let first = driver.open("db", 1, &["s".into()]).await.unwrap();
        assert!(!first.db.is_stale());

        let second = driver.open("db", 2, &["s".into(), "t".into()]).await.unwrap();
        assert!(second.upgraded);
        assert_eq!(second.version, 2);
        assert!(first.db.is_stale());
        let err = first.db.begin("s", TxnMode::ReadOnly).await.err().unwrap();
        assert!(err.is_stale_handle());
    }

    #[tokio::test]
    async fn lower_version_open_is_pinned_to_disk() {
        let driver = MemoryDriver::new();
        driver.open("db", 3, &["s".into()]).await.unwrap();
        let reopened = driver.open("db", 1, &["s".into()]).await.unwrap();
        assert_eq!(reopened.version, 3);
        assert!(!reopened.upgraded);
    }

    #[tokio::test]
    async fn drop_database_marks_handles_stale() {
        let driver = MemoryDriver::new();
        let opened = driver.open("db", 1, &["s".into()]).await.unwrap();
        driver.drop_database("db").await.unwrap();
        assert!(opened.db.is_stale());

        let fresh = driver.open("db", 1, &["s".into()]).await.unwrap();
        let mut txn = fresh.db.begin("s", TxnMode::ReadOnly).await.unwrap();
        assert_eq!(txn.keys().await.unwrap().len(), 0);
        txn.abort().await.unwrap();
    }

    #[tokio::test]
    async fn rw_transaction_counter_tracks_begins() {
        let driver = MemoryDriver::new();
        let opened = driver.open("db", 1, &["s".into()]).await.unwrap();
        assert_eq!(driver.rw_transactions_started(), 0);
        opened.db.begin("s", TxnMode::ReadOnly).await.unwrap();
        assert_eq!(driver.rw_transactions_started(), 0);
        opened.db.begin("s", TxnMode::ReadWrite).await.unwrap();
        opened.db.begin("s", TxnMode::ReadWrite).await.unwrap();
        assert_eq!(driver.rw_transactions_started(), 2);
    }
}

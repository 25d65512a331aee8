//! akv: a concurrency-safe coordination layer over single-writer,
//! versioned, transactional key/value backends.
//!
//! The [`Store`] facade exposes web-storage-shaped operations
//! (`set_item`/`get_item`/`remove_item`, batch variants, iteration,
//! explicit transactions) while the layers underneath take care of the
//! hard parts: schema upgrades serialized through chained readiness gates,
//! bounded transaction admission with idle-connection recycling, a write
//! coalescing buffer that batches bursts into fewer backend transactions,
//! and an ordered plugin pipeline wrapping every operation.
//!
//! ```no_run
//! use akv::{AkvConfig, Store};
//! use serde_json::json;
//!
//! # async fn demo() -> Result<(), akv::AkvError> {
//! let store = Store::new(AkvConfig::default())?;
//! store.set_item("greeting", json!("hello")).await?;
//! let value = store.get_item("greeting").await?;
//! assert_eq!(value, json!("hello"));
//! # Ok(())
//! # }
//! ```

pub mod admission;
pub mod backend;
pub mod coalesce;
pub mod config;
pub mod connection;
pub mod error;
pub mod plugin;
pub mod registry;
pub mod value;

#[cfg(test)]
mod lib_tests;

pub use admission::{TransactionScope, TxnFuture};
pub use backend::memory::MemoryDriver;
pub use backend::{BackendDb, BackendDriver, BackendTxn, Capability, OpenOutcome, TxnMode};
pub use coalesce::WriteStatsSnapshot;
pub use config::{AkvConfig, Consistency, HookErrorPolicy, InitFailurePolicy};
pub use error::{AkvError, AkvErrorCode};
pub use plugin::{OpKind, Plugin, PluginContext, PluginError, StoreSnapshot};
pub use registry::{register_driver, unregister_driver};

use coalesce::{CoalesceLimits, QueuedOp, QueuedWrite};
use connection::ConnectionContext;
use parking_lot::RwLock;
use plugin::pipeline::Pipeline;
use serde_json::Value;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tracing::debug;

/// Target of a [`Store::drop_instance`] call. Unset fields default to the
/// calling store's identity.
#[derive(Debug, Clone, Default)]
pub struct DropTarget {
    pub name: Option<String>,
    pub store_name: Option<String>,
}

#[derive(Clone)]
struct Resolved {
    driver_name: String,
    ctx: Arc<ConnectionContext>,
}

/// Handle to one named object store inside one named database. Cheap to
/// share behind an `Arc`; handles with the same driver and database name
/// share a connection context (and therefore its upgrade gates, admission
/// slots, and coalescing queue).
pub struct Store {
    config: RwLock<AkvConfig>,
    pipeline: Pipeline,
    resolved: RwLock<Option<Resolved>>,
    ready_lock: AsyncMutex<()>,
    destroyed: AtomicBool,
}

impl Store {
    pub fn new(config: AkvConfig) -> Result<Self, AkvError> {
        config.validate()?;
        let pipeline = Pipeline::new(config.hook_error_policy, config.init_failure_policy);
        Ok(Self {
            config: RwLock::new(config),
            pipeline,
            resolved: RwLock::new(None),
            ready_lock: AsyncMutex::new(()),
            destroyed: AtomicBool::new(false),
        })
    }

    /// Resolves a driver, opens the connection (running any pending schema
    /// upgrade), and initializes registered plugins. Idempotent; every
    /// public operation awaits it internally.
    pub async fn ready(&self) -> Result<(), AkvError> {
        self.ensure_ready().await?;
        Ok(())
    }

    fn check_alive(&self) -> Result<(), AkvError> {
        if self.destroyed.load(Ordering::Acquire) {
            Err(AkvError::NotInitialized)
        } else {
            Ok(())
        }
    }

    async fn ensure_ready(&self) -> Result<Resolved, AkvError> {
        self.check_alive()?;
        if self.resolved.read().is_none() {
            let _guard = self.ready_lock.lock().await;
            if self.resolved.read().is_none() {
                let config = self.config.read().clone();
                let driver = self.resolve_driver(&config)?;
                let ctx = registry::connections().acquire(Arc::clone(&driver), &config.name);
                ctx.register_store(&config.store_name, config.version);
                ctx.ensure_open().await?;
                debug!(
                    driver = driver.name(),
                    database = %config.name,
                    store = %config.store_name,
                    "store ready"
                );
                *self.resolved.write() = Some(Resolved {
                    driver_name: driver.name().to_owned(),
                    ctx,
                });
            }
        }
        let resolved = self
            .resolved
            .read()
            .clone()
            .ok_or(AkvError::NotInitialized)?;
        // Plugins registered after the first ready() are picked up here.
        if !self.pipeline.is_empty() {
            let cx = self.context(OpKind::Init);
            self.pipeline.init_all(&cx).await?;
        }
        Ok(resolved)
    }

    fn resolve_driver(&self, config: &AkvConfig) -> Result<Arc<dyn BackendDriver>, AkvError> {
        for name in &config.driver_order {
            if let Some(driver) = registry::drivers().get(name) {
                if driver.supports(Capability::Core) {
                    return Ok(driver);
                }
            }
        }
        Err(AkvError::DriverNotFound {
            name: config.driver_order.join(","),
        })
    }

    fn limits(&self) -> CoalesceLimits {
        let config = self.config.read();
        CoalesceLimits {
            window_ms: config.coalesce_window_ms,
            max_batch: config.coalesce_max_batch,
            max_txns: config.max_concurrent_transactions,
            idle_ms: config.idle_close_ms,
        }
    }

    fn context(&self, operation: OpKind) -> PluginContext {
        let config = self.config.read().clone();
        let driver = self.resolved.read().as_ref().map(|r| r.driver_name.clone());
        PluginContext::new(
            operation,
            StoreSnapshot {
                driver,
                database: config.name.clone(),
                store: config.store_name.clone(),
                config,
            },
            self.pipeline.shared_bag(),
        )
    }

    fn store_name(&self) -> String {
        self.config.read().store_name.clone()
    }

    async fn drain_for_read(&self, resolved: &Resolved) {
        if matches!(self.config.read().consistency, Consistency::Strong) {
            resolved.ctx.flush_queued(self.limits()).await;
        }
    }

    /// Enqueues one write and waits for its commit unless the store runs in
    /// fire-and-forget mode.
    async fn submit_write(
        &self,
        resolved: &Resolved,
        op: QueuedOp,
    ) -> Result<Option<Value>, AkvError> {
        let fire_and_forget = {
            let config = self.config.read();
            // only honored under eventual consistency; strong writes
            // always wait for their commit
            config.fire_and_forget && matches!(config.consistency, Consistency::Eventual)
        };
        let store = self.store_name();
        if fire_and_forget {
            resolved.ctx.enqueue_write(
                QueuedWrite {
                    store,
                    op,
                    done: None,
                },
                self.limits(),
            );
            return Ok(None);
        }
        let (tx, rx) = oneshot::channel();
        resolved.ctx.enqueue_write(
            QueuedWrite {
                store,
                op,
                done: Some(tx),
            },
            self.limits(),
        );
        let committed = rx.await.map_err(|_| AkvError::OperationFailed {
            operation: "write".into(),
            key: None,
            driver: resolved.driver_name.clone(),
            source_name: "channel_closed".into(),
            source_message: "coalesced write dropped before resolution".into(),
        })??;
        Ok(Some(committed))
    }

    /// Stores a logical value under `key`, returning the value after the
    /// full plugin round trip. Callers model "undefined" as `Value::Null`.
    pub async fn set_item(&self, key: &str, value: Value) -> Result<Value, AkvError> {
        let resolved = self.ensure_ready().await?;
        let mut cx = self.context(OpKind::Set);
        let transformed = self.pipeline.before_set(&mut cx, key, value).await?;
        let committed = self
            .submit_write(
                &resolved,
                QueuedOp::Set {
                    key: key.to_owned(),
                    value: transformed.clone(),
                },
            )
            .await?
            .unwrap_or(transformed);
        self.pipeline.after_set(&mut cx, key, committed).await
    }

    /// Missing keys read as `Value::Null`.
    pub async fn get_item(&self, key: &str) -> Result<Value, AkvError> {
        let resolved = self.ensure_ready().await?;
        let mut cx = self.context(OpKind::Get);
        self.pipeline.before_get(&mut cx, key).await?;
        self.drain_for_read(&resolved).await;

        let store = self.store_name();
        let limits = self.limits();
        let key_owned: Arc<str> = Arc::from(key);
        let raw = resolved
            .ctx
            .run_with_txn(&store, TxnMode::ReadOnly, limits.max_txns, limits.idle_ms, {
                let key = Arc::clone(&key_owned);
                move |scope| {
                    let key = Arc::clone(&key);
                    Box::pin(async move { scope.get(&key).await })
                }
            })
            .await
            .map_err(|err| err.with_context("get_item", Some(key), &resolved.driver_name))?;
        let value = raw.unwrap_or(Value::Null);
        self.pipeline.after_get(&mut cx, key, value).await
    }

    pub async fn remove_item(&self, key: &str) -> Result<(), AkvError> {
        let resolved = self.ensure_ready().await?;
        let mut cx = self.context(OpKind::Remove);
        self.pipeline.before_remove(&mut cx, key).await?;
        self.submit_write(
            &resolved,
            QueuedOp::Remove {
                key: key.to_owned(),
            },
        )
        .await?;
        self.pipeline.after_remove(&mut cx, key).await
    }

    /// Stores a batch of pairs. The batch bypasses the coalescing queue (it
    /// is already a batch) and applies in admitted read-write transactions,
    /// chunked at the coalescing batch bound. Returns the pairs after the
    /// full plugin round trip.
    pub async fn set_items(
        &self,
        pairs: Vec<(String, Value)>,
    ) -> Result<Vec<(String, Value)>, AkvError> {
        let resolved = self.ensure_ready().await?;
        let mut batch_cx = self.batch_context(OpKind::SetItems, pairs.len());
        let items = self.pipeline.before_set_items(&mut batch_cx, pairs).await?;

        let mut transformed = Vec::with_capacity(items.len());
        for (key, value) in items {
            let mut cx = batch_cx.item_context(OpKind::Set);
            let value = self.pipeline.before_set(&mut cx, &key, value).await?;
            transformed.push((key, value));
        }

        let store = self.store_name();
        let limits = self.limits();
        for chunk in transformed.chunks(limits.max_batch.max(1)) {
            let chunk: Arc<Vec<(String, Value)>> = Arc::new(chunk.to_vec());
            resolved
                .ctx
                .run_with_txn(
                    &store,
                    TxnMode::ReadWrite,
                    limits.max_txns,
                    limits.idle_ms,
                    move |scope| {
                        let chunk = Arc::clone(&chunk);
                        Box::pin(async move {
                            for (key, value) in chunk.iter() {
                                scope.set(key, value.clone()).await?;
                            }
                            Ok(())
                        })
                    },
                )
                .await
                .map_err(|err| err.with_context("set_items", None, &resolved.driver_name))?;
        }

        let mut committed = Vec::with_capacity(transformed.len());
        for (key, value) in transformed {
            let mut cx = batch_cx.item_context(OpKind::Set);
            let value = self.pipeline.after_set(&mut cx, &key, value).await?;
            committed.push((key, value));
        }
        self.pipeline
            .after_set_items(&mut batch_cx, committed)
            .await
    }

    /// Reads a batch of keys in one read-only transaction; missing keys map
    /// to `Value::Null`.
    pub async fn get_items(
        &self,
        keys: Vec<String>,
    ) -> Result<Vec<(String, Value)>, AkvError> {
        let resolved = self.ensure_ready().await?;
        let mut batch_cx = self.batch_context(OpKind::GetItems, keys.len());
        let keys = self.pipeline.before_get_items(&mut batch_cx, keys).await?;
        for key in &keys {
            let mut cx = batch_cx.item_context(OpKind::Get);
            self.pipeline.before_get(&mut cx, key).await?;
        }
        self.drain_for_read(&resolved).await;

        let store = self.store_name();
        let limits = self.limits();
        let wanted = Arc::new(keys);
        let fetched = resolved
            .ctx
            .run_with_txn(&store, TxnMode::ReadOnly, limits.max_txns, limits.idle_ms, {
                let wanted = Arc::clone(&wanted);
                move |scope| {
                    let wanted = Arc::clone(&wanted);
                    Box::pin(async move {
                        let mut out = Vec::with_capacity(wanted.len());
                        for key in wanted.iter() {
                            let value = scope.get(key).await?.unwrap_or(Value::Null);
                            out.push((key.clone(), value));
                        }
                        Ok(out)
                    })
                }
            })
            .await
            .map_err(|err| err.with_context("get_items", None, &resolved.driver_name))?;

        let mut items = Vec::with_capacity(fetched.len());
        for (key, value) in fetched {
            let mut cx = batch_cx.item_context(OpKind::Get);
            let value = self.pipeline.after_get(&mut cx, &key, value).await?;
            items.push((key, value));
        }
        self.pipeline.after_get_items(&mut batch_cx, items).await
    }

    pub async fn remove_items(&self, keys: Vec<String>) -> Result<(), AkvError> {
        let resolved = self.ensure_ready().await?;
        let mut batch_cx = self.batch_context(OpKind::RemoveItems, keys.len());
        let keys = self
            .pipeline
            .before_remove_items(&mut batch_cx, keys)
            .await?;
        for key in &keys {
            let mut cx = batch_cx.item_context(OpKind::Remove);
            self.pipeline.before_remove(&mut cx, key).await?;
        }

        let store = self.store_name();
        let limits = self.limits();
        for chunk in keys.chunks(limits.max_batch.max(1)) {
            let chunk: Arc<Vec<String>> = Arc::new(chunk.to_vec());
            resolved
                .ctx
                .run_with_txn(
                    &store,
                    TxnMode::ReadWrite,
                    limits.max_txns,
                    limits.idle_ms,
                    move |scope| {
                        let chunk = Arc::clone(&chunk);
                        Box::pin(async move {
                            for key in chunk.iter() {
                                scope.remove(key).await?;
                            }
                            Ok(())
                        })
                    },
                )
                .await
                .map_err(|err| err.with_context("remove_items", None, &resolved.driver_name))?;
        }

        for key in &keys {
            let mut cx = batch_cx.item_context(OpKind::Remove);
            self.pipeline.after_remove(&mut cx, key).await?;
        }
        self.pipeline
            .after_remove_items(&mut batch_cx, keys)
            .await?;
        Ok(())
    }

    fn batch_context(&self, operation: OpKind, size: usize) -> PluginContext {
        let mut cx = self.context(operation);
        cx.op_state
            .insert(plugin::OP_STATE_BATCH.to_owned(), Value::Bool(true));
        cx.op_state.insert(
            plugin::OP_STATE_BATCH_SIZE.to_owned(),
            Value::from(size as u64),
        );
        cx
    }

    fn require_capability(
        &self,
        resolved: &Resolved,
        cap: Capability,
        operation: &str,
    ) -> Result<(), AkvError> {
        if resolved.ctx.driver().supports(cap) {
            Ok(())
        } else {
            Err(AkvError::Unsupported {
                operation: operation.to_owned(),
                driver: resolved.driver_name.clone(),
            })
        }
    }

    /// Keys in lexicographic order.
    pub async fn keys(&self) -> Result<Vec<String>, AkvError> {
        let resolved = self.ensure_ready().await?;
        self.require_capability(&resolved, Capability::Iteration, "keys")?;
        self.drain_for_read(&resolved).await;
        let store = self.store_name();
        let limits = self.limits();
        resolved
            .ctx
            .run_with_txn(
                &store,
                TxnMode::ReadOnly,
                limits.max_txns,
                limits.idle_ms,
                move |scope| Box::pin(async move { scope.keys().await }),
            )
            .await
            .map_err(|err| err.with_context("keys", None, &resolved.driver_name))
    }

    /// Key at `index` in lexicographic order, `None` past the end.
    pub async fn key(&self, index: usize) -> Result<Option<String>, AkvError> {
        let mut keys = self.keys().await?;
        if index < keys.len() {
            Ok(Some(keys.swap_remove(index)))
        } else {
            Ok(None)
        }
    }

    pub async fn length(&self) -> Result<u64, AkvError> {
        let resolved = self.ensure_ready().await?;
        self.drain_for_read(&resolved).await;
        let store = self.store_name();
        let limits = self.limits();
        resolved
            .ctx
            .run_with_txn(
                &store,
                TxnMode::ReadOnly,
                limits.max_txns,
                limits.idle_ms,
                move |scope| Box::pin(async move { scope.length().await }),
            )
            .await
            .map_err(|err| err.with_context("length", None, &resolved.driver_name))
    }

    /// Visits every pair in key order over a snapshot taken in one
    /// read-only transaction; the callback gets the key, the value after
    /// read-path plugin hooks, and the 1-based visit index.
    /// `ControlFlow::Break(t)` stops the walk and returns `Some(t)`.
    pub async fn iterate<T, F>(&self, mut f: F) -> Result<Option<T>, AkvError>
    where
        F: FnMut(&str, Value, u64) -> ControlFlow<T>,
    {
        let resolved = self.ensure_ready().await?;
        self.require_capability(&resolved, Capability::Iteration, "iterate")?;
        self.drain_for_read(&resolved).await;

        let store = self.store_name();
        let limits = self.limits();
        let snapshot = resolved
            .ctx
            .run_with_txn(
                &store,
                TxnMode::ReadOnly,
                limits.max_txns,
                limits.idle_ms,
                move |scope| {
                    Box::pin(async move {
                        let keys = scope.keys().await?;
                        let mut pairs = Vec::with_capacity(keys.len());
                        for key in keys {
                            let value = scope.get(&key).await?.unwrap_or(Value::Null);
                            pairs.push((key, value));
                        }
                        Ok(pairs)
                    })
                },
            )
            .await
            .map_err(|err| err.with_context("iterate", None, &resolved.driver_name))?;

        let mut index = 0u64;
        for (key, value) in snapshot {
            let mut cx = self.context(OpKind::Iterate);
            let value = self.pipeline.after_get(&mut cx, &key, value).await?;
            index += 1;
            if let ControlFlow::Break(out) = f(&key, value, index) {
                return Ok(Some(out));
            }
        }
        Ok(None)
    }

    /// Flushes pending coalesced writes (they still resolve), then wipes
    /// the store in one read-write transaction.
    pub async fn clear(&self) -> Result<(), AkvError> {
        let resolved = self.ensure_ready().await?;
        self.require_capability(&resolved, Capability::BulkClear, "clear")?;
        resolved.ctx.flush_queued(self.limits()).await;
        let store = self.store_name();
        let limits = self.limits();
        resolved
            .ctx
            .run_with_txn(
                &store,
                TxnMode::ReadWrite,
                limits.max_txns,
                limits.idle_ms,
                move |scope| Box::pin(async move { scope.clear().await }),
            )
            .await
            .map_err(|err| err.with_context("clear", None, &resolved.driver_name))
    }

    /// Runs `body` inside one admitted backend transaction against this
    /// store, committing on `Ok` and aborting on `Err`. The closure may be
    /// invoked again after a transparent stale-handle reconnect, so it must
    /// capture owned data.
    pub async fn run_transaction<T, F>(&self, mode: TxnMode, body: F) -> Result<T, AkvError>
    where
        F: for<'a> FnMut(&'a mut TransactionScope) -> TxnFuture<'a, T>,
    {
        let resolved = self.ensure_ready().await?;
        self.drain_for_read(&resolved).await;
        let store = self.store_name();
        let limits = self.limits();
        resolved
            .ctx
            .run_with_txn(&store, mode, limits.max_txns, limits.idle_ms, body)
            .await
            .map_err(|err| err.with_context("run_transaction", None, &resolved.driver_name))
    }

    /// Drops a store or a whole database. With a `store_name` the target
    /// store is cleared and unregistered from its context; without one the
    /// physical database is dropped, its context removed from the registry,
    /// and co-resident handles transparently reopen against fresh state.
    pub async fn drop_instance(&self, target: DropTarget) -> Result<(), AkvError> {
        let resolved = self.ensure_ready().await?;
        resolved.ctx.flush_queued(self.limits()).await;

        let config = self.config.read().clone();
        let db_name = target.name.unwrap_or_else(|| config.name.clone());
        let driver = resolved.ctx.driver().clone();

        match target.store_name {
            Some(store) => {
                let ctx = registry::connections().acquire(Arc::clone(&driver), &db_name);
                let limits = self.limits();
                ctx.run_with_txn(
                    &store,
                    TxnMode::ReadWrite,
                    limits.max_txns,
                    limits.idle_ms,
                    move |scope| Box::pin(async move { scope.clear().await }),
                )
                .await
                .map_err(|err| err.with_context("drop_instance", None, &resolved.driver_name))?;
                ctx.unregister_store(&store);
            }
            None => {
                driver.drop_database(&db_name).await?;
                registry::connections().remove(driver.name(), &db_name);
                if db_name == config.name {
                    *self.resolved.write() = None;
                }
            }
        }
        Ok(())
    }

    /// Replaces the configuration. Rejected once `ready()` has resolved a
    /// driver.
    pub fn configure(&self, config: AkvConfig) -> Result<(), AkvError> {
        self.check_alive()?;
        config.validate()?;
        if self.resolved.read().is_some() {
            return Err(AkvError::InvalidConfig {
                message: "configuration cannot change after the store is ready".into(),
            });
        }
        self.pipeline
            .set_policies(config.hook_error_policy, config.init_failure_policy);
        *self.config.write() = config;
        Ok(())
    }

    pub fn config_get(&self) -> AkvConfig {
        self.config.read().clone()
    }

    pub fn use_plugin(&self, plugin: Arc<dyn Plugin>) {
        self.use_plugin_with_priority(plugin, 0);
    }

    /// Higher priority runs earlier on the write path (and correspondingly
    /// later on the read path). Plugins added after `ready()` initialize on
    /// the next operation.
    pub fn use_plugin_with_priority(&self, plugin: Arc<dyn Plugin>, priority: i32) {
        self.pipeline.register(plugin, priority);
    }

    /// Flushes pending writes, destroys plugins in reverse registration
    /// order, and marks this handle unusable. Idempotent. The shared
    /// connection context stays alive for co-resident handles.
    pub async fn destroy(&self) -> Result<(), AkvError> {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(resolved) = self.resolved.read().clone() {
            resolved.ctx.flush_queued(self.limits()).await;
        }
        let cx = self.context(OpKind::Destroy);
        self.pipeline.destroy_all(&cx).await;
        Ok(())
    }

    pub fn stats(&self) -> WriteStatsSnapshot {
        match self.resolved.read().as_ref() {
            Some(resolved) => resolved.ctx.stats().snapshot(),
            None => WriteStatsSnapshot::default(),
        }
    }

    /// Resolved driver name, `None` before the first successful `ready()`.
    pub fn driver_name(&self) -> Option<String> {
        self.resolved.read().as_ref().map(|r| r.driver_name.clone())
    }
}

//! Backend adapter interface.
//!
//! The physical storage engine lives behind these traits. The coordination
//! layer only assumes open/begin/get/put/delete/iterate primitives, version
//! reporting, and store-existence introspection. Optional behaviors are an
//! explicit capability set; unsupported operations return
//! [`AkvError::Unsupported`] rather than being probed reflectively.

pub mod memory;

use crate::error::AkvError;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// Optional behaviors a driver may provide.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    /// get/put/delete/keys inside transactions. Every usable driver has it.
    Core,
    /// Ordered key iteration.
    Iteration,
    /// Commits are durable once acknowledged.
    Durability,
    /// Whole-store clear in one call.
    BulkClear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnMode {
    ReadOnly,
    ReadWrite,
}

/// Result of a successful open. `version` is the effective on-disk version,
/// which may exceed the requested one; `upgraded` reports whether a schema
/// upgrade ran as part of this open.
pub struct OpenOutcome {
    pub db: Arc<dyn BackendDb>,
    pub version: u64,
    pub upgraded: bool,
}

#[async_trait]
pub trait BackendDriver: Send + Sync {
    fn name(&self) -> &str;

    fn supports(&self, cap: Capability) -> bool;

    /// Opens (creating if absent) the named database at `version`, ensuring
    /// every store in `stores` exists. Opening at a version lower than the
    /// on-disk one succeeds at the on-disk version; requesting a higher
    /// version or a missing store performs the upgrade.
    async fn open(
        &self,
        name: &str,
        version: u64,
        stores: &[String],
    ) -> Result<OpenOutcome, AkvError>;

    /// Removes the named database entirely. Outstanding handles become
    /// stale.
    async fn drop_database(&self, name: &str) -> Result<(), AkvError>;
}

#[async_trait]
pub trait BackendDb: Send + Sync {
    fn version(&self) -> u64;

    fn store_names(&self) -> Vec<String>;

    /// True once the handle has been externally invalidated (closed, or the
    /// database dropped or reopened at a newer version).
    fn is_stale(&self) -> bool;

    async fn begin(&self, store: &str, mode: TxnMode) -> Result<Box<dyn BackendTxn>, AkvError>;

    async fn close(&self);
}

/// One underlying transaction. Consumed by `commit` or `abort`; dropping
/// without either aborts implicitly.
#[async_trait]
pub trait BackendTxn: Send {
    async fn get(&mut self, key: &str) -> Result<Option<Value>, AkvError>;

    async fn put(&mut self, key: &str, value: Value) -> Result<(), AkvError>;

    async fn delete(&mut self, key: &str) -> Result<(), AkvError>;

    /// Keys in ascending order, reads observing this transaction's own
    /// buffered writes.
    async fn keys(&mut self) -> Result<Vec<String>, AkvError>;

    async fn clear(&mut self) -> Result<(), AkvError>;

    async fn commit(self: Box<Self>) -> Result<(), AkvError>;

    async fn abort(self: Box<Self>) -> Result<(), AkvError>;
}

//! Plugin surface.
//!
//! Plugins wrap every public operation with before/after hooks and never see
//! storage-engine details; they operate purely on the logical key/value
//! layer. Hooks receive a [`PluginContext`] carrying the operation kind, a
//! snapshot of the owning store, a process-wide shared metadata bag for
//! persistent plugin state, and a fresh per-operation scratch bag.

pub mod pipeline;

use crate::config::AkvConfig;
use crate::error::AkvError;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Op-state key marking an item-level hook as running inside a batch.
pub const OP_STATE_BATCH: &str = "batch";
/// Op-state key carrying the batch size for item-level hooks.
pub const OP_STATE_BATCH_SIZE: &str = "batch_size";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Get,
    Set,
    Remove,
    GetItems,
    SetItems,
    RemoveItems,
    Iterate,
    Init,
    Destroy,
}

impl OpKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OpKind::Get => "get",
            OpKind::Set => "set",
            OpKind::Remove => "remove",
            OpKind::GetItems => "get_items",
            OpKind::SetItems => "set_items",
            OpKind::RemoveItems => "remove_items",
            OpKind::Iterate => "iterate",
            OpKind::Init => "init",
            OpKind::Destroy => "destroy",
        }
    }
}

/// Snapshot of the owning store handed to hooks.
#[derive(Debug, Clone)]
pub struct StoreSnapshot {
    pub driver: Option<String>,
    pub database: String,
    pub store: String,
    pub config: AkvConfig,
}

pub type SharedBag = Arc<Mutex<HashMap<String, Value>>>;

pub struct PluginContext {
    pub operation: OpKind,
    pub store: StoreSnapshot,
    /// Lives for the pipeline's lifetime; plugins needing persistent state
    /// (timers, counters) keep it here under their own keys.
    pub shared: SharedBag,
    /// Fresh per logical operation; also how batch-level hooks pass values
    /// to item-level hooks.
    pub op_state: HashMap<String, Value>,
}

impl PluginContext {
    pub(crate) fn new(operation: OpKind, store: StoreSnapshot, shared: SharedBag) -> Self {
        Self {
            operation,
            store,
            shared,
            op_state: HashMap::new(),
        }
    }

    /// Derives the context for one item of a batch operation: own scratch
    /// bag, seeded with the documented batch markers, sharing the batch's
    /// metadata bag.
    pub(crate) fn item_context(&self, operation: OpKind) -> Self {
        let mut op_state = HashMap::new();
        for key in [OP_STATE_BATCH, OP_STATE_BATCH_SIZE] {
            if let Some(value) = self.op_state.get(key) {
                op_state.insert(key.to_owned(), value.clone());
            }
        }
        Self {
            operation,
            store: self.store.clone(),
            shared: Arc::clone(&self.shared),
            op_state,
        }
    }

    pub fn in_batch(&self) -> bool {
        self.op_state
            .get(OP_STATE_BATCH)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

/// How a hook failed.
#[derive(Debug, Clone)]
pub enum PluginError {
    /// Deliberate short-circuit; always propagates regardless of policy.
    Abort { message: String },
    /// Structured domain error; always propagates regardless of policy.
    Domain(AkvError),
    /// Generic failure; recovered under the lenient policy.
    Failed(String),
}

impl From<AkvError> for PluginError {
    fn from(err: AkvError) -> Self {
        PluginError::Domain(err)
    }
}

impl PluginError {
    pub(crate) fn into_akv(self, plugin: &str, hook: &str) -> AkvError {
        match self {
            PluginError::Abort { message } => AkvError::Aborted {
                plugin: plugin.to_owned(),
                message,
            },
            PluginError::Domain(err) => err,
            PluginError::Failed(message) => AkvError::OperationFailed {
                operation: format!("{plugin}.{hook}"),
                key: None,
                driver: "plugin".into(),
                source_name: "plugin_error".into(),
                source_message: message,
            },
        }
    }

    /// Only `Failed` is recoverable under the lenient policy.
    pub(crate) fn is_recoverable(&self) -> bool {
        matches!(self, PluginError::Failed(_))
    }
}

#[allow(unused_variables)]
#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    /// Marks plugins whose correctness matters for security or integrity
    /// (encryption, signing). Drives registration-time configuration
    /// warnings only.
    fn integrity_sensitive(&self) -> bool {
        false
    }

    /// Marks plugins that shrink values. Compression running after an
    /// integrity-sensitive transform is flagged at registration time.
    fn compresses_values(&self) -> bool {
        false
    }

    /// `Ok(false)` skips the plugin for this invocation only; `Err`
    /// permanently disables it for the pipeline instance.
    async fn enabled(&self, cx: &PluginContext) -> Result<bool, PluginError> {
        Ok(true)
    }

    async fn on_init(&self, cx: &PluginContext) -> Result<(), PluginError> {
        Ok(())
    }

    async fn on_destroy(&self, cx: &PluginContext) -> Result<(), PluginError> {
        Ok(())
    }

    async fn before_set(
        &self,
        cx: &mut PluginContext,
        key: &str,
        value: Value,
    ) -> Result<Value, PluginError> {
        Ok(value)
    }

    async fn after_set(
        &self,
        cx: &mut PluginContext,
        key: &str,
        value: Value,
    ) -> Result<Value, PluginError> {
        Ok(value)
    }

    async fn before_get(&self, cx: &mut PluginContext, key: &str) -> Result<(), PluginError> {
        Ok(())
    }

    async fn after_get(
        &self,
        cx: &mut PluginContext,
        key: &str,
        value: Value,
    ) -> Result<Value, PluginError> {
        Ok(value)
    }

    async fn before_remove(&self, cx: &mut PluginContext, key: &str) -> Result<(), PluginError> {
        Ok(())
    }

    async fn after_remove(&self, cx: &mut PluginContext, key: &str) -> Result<(), PluginError> {
        Ok(())
    }

    async fn before_set_items(
        &self,
        cx: &mut PluginContext,
        items: Vec<(String, Value)>,
    ) -> Result<Vec<(String, Value)>, PluginError> {
        Ok(items)
    }

    async fn after_set_items(
        &self,
        cx: &mut PluginContext,
        items: Vec<(String, Value)>,
    ) -> Result<Vec<(String, Value)>, PluginError> {
        Ok(items)
    }

    async fn before_get_items(
        &self,
        cx: &mut PluginContext,
        keys: Vec<String>,
    ) -> Result<Vec<String>, PluginError> {
        Ok(keys)
    }

    async fn after_get_items(
        &self,
        cx: &mut PluginContext,
        items: Vec<(String, Value)>,
    ) -> Result<Vec<(String, Value)>, PluginError> {
        Ok(items)
    }

    async fn before_remove_items(
        &self,
        cx: &mut PluginContext,
        keys: Vec<String>,
    ) -> Result<Vec<String>, PluginError> {
        Ok(keys)
    }

    async fn after_remove_items(
        &self,
        cx: &mut PluginContext,
        keys: Vec<String>,
    ) -> Result<Vec<String>, PluginError> {
        Ok(keys)
    }

    /// Invoked with recovered hook errors under the lenient policy.
    async fn on_error(&self, cx: &PluginContext, err: &PluginError) {}
}

//! Ordered hook pipeline.
//!
//! Registrations sort by priority (descending) then registration order;
//! before hooks run in that order feeding each plugin's output to the next,
//! after hooks unwind in reverse. Lifecycle init runs once per plugin with
//! concurrent callers awaiting the owner through a watch channel.

use super::{Plugin, PluginContext, PluginError, SharedBag};
use crate::config::{HookErrorPolicy, InitFailurePolicy};
use crate::error::AkvError;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use smallvec::SmallVec;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tracing::warn;

struct Registration {
    plugin: Arc<dyn Plugin>,
    priority: i32,
    order: u64,
    disabled: AtomicBool,
}

enum InitRecord {
    Initializing(watch::Receiver<Option<bool>>),
    Ready,
    Failed,
}

#[derive(Clone, Copy)]
struct Policies {
    hook_error: HookErrorPolicy,
    init_failure: InitFailurePolicy,
}

pub struct Pipeline {
    regs: RwLock<Vec<Arc<Registration>>>,
    next_order: AtomicU64,
    shared: SharedBag,
    init: AsyncMutex<HashMap<String, InitRecord>>,
    destroyed: AtomicBool,
    // conditions already warned about, one warning each per pipeline
    warned: Mutex<HashSet<&'static str>>,
    policies: Mutex<Policies>,
}

impl Pipeline {
    pub fn new(hook_error: HookErrorPolicy, init_failure: InitFailurePolicy) -> Self {
        Self {
            regs: RwLock::new(Vec::new()),
            next_order: AtomicU64::new(0),
            shared: Arc::new(Mutex::new(HashMap::new())),
            init: AsyncMutex::new(HashMap::new()),
            destroyed: AtomicBool::new(false),
            warned: Mutex::new(HashSet::new()),
            policies: Mutex::new(Policies {
                hook_error,
                init_failure,
            }),
        }
    }

    pub fn shared_bag(&self) -> SharedBag {
        Arc::clone(&self.shared)
    }

    pub fn set_policies(&self, hook_error: HookErrorPolicy, init_failure: InitFailurePolicy) {
        *self.policies.lock() = Policies {
            hook_error,
            init_failure,
        };
        self.validate();
    }

    pub fn is_empty(&self) -> bool {
        self.regs.read().is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.regs
            .read()
            .iter()
            .map(|r| r.plugin.name().to_owned())
            .collect()
    }

    pub fn register(&self, plugin: Arc<dyn Plugin>, priority: i32) {
        let order = self.next_order.fetch_add(1, Ordering::Relaxed);
        {
            let mut regs = self.regs.write();
            regs.push(Arc::new(Registration {
                plugin,
                priority,
                order,
                disabled: AtomicBool::new(false),
            }));
            regs.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.order.cmp(&b.order)));
        }
        self.validate();
    }

    // Hook order in priority order for before hooks. Pipelines rarely hold
    // more than a handful of plugins, so snapshots stay inline.
    fn sorted(&self) -> SmallVec<[Arc<Registration>; 4]> {
        self.regs.read().iter().cloned().collect()
    }

    // Reverse registration order, independent of priority.
    fn registration_reversed(&self) -> SmallVec<[Arc<Registration>; 4]> {
        let mut regs = self.sorted();
        regs.sort_by(|a, b| b.order.cmp(&a.order));
        regs
    }

    fn warn_once(&self, condition: &'static str, message: &str) {
        if self.warned.lock().insert(condition) {
            warn!(condition, "{message}");
        }
    }

    fn validate(&self) {
        let policies = *self.policies.lock();
        let regs = self.sorted();
        if matches!(policies.hook_error, HookErrorPolicy::Lenient)
            && regs.iter().any(|r| r.plugin.integrity_sensitive())
        {
            self.warn_once(
                "lenient_integrity",
                "integrity-sensitive plugin registered under the lenient hook error policy; its failures will be swallowed",
            );
        }
        let mut seen_integrity = false;
        for reg in &regs {
            if reg.plugin.integrity_sensitive() {
                seen_integrity = true;
            } else if seen_integrity && reg.plugin.compresses_values() {
                self.warn_once(
                    "compression_after_encryption",
                    "compression plugin ordered after an integrity-sensitive plugin on the write path; compression will see high-entropy input",
                );
            }
        }
    }

    async fn is_active(&self, reg: &Registration, cx: &PluginContext) -> bool {
        if reg.disabled.load(Ordering::Acquire) {
            return false;
        }
        match reg.plugin.enabled(cx).await {
            Ok(flag) => flag,
            Err(err) => {
                reg.disabled.store(true, Ordering::Release);
                warn!(
                    plugin = reg.plugin.name(),
                    error = ?err,
                    "enabled check failed, plugin permanently disabled"
                );
                false
            }
        }
    }

    /// Applies the hook error policy to a failed hook. `fallback` is the
    /// pre-hook value the pipeline continues with when the error is
    /// recovered.
    async fn recover<T>(
        &self,
        reg: &Registration,
        cx: &PluginContext,
        hook: &'static str,
        fallback: T,
        err: PluginError,
    ) -> Result<T, AkvError> {
        let lenient = matches!(self.policies.lock().hook_error, HookErrorPolicy::Lenient);
        if lenient && err.is_recoverable() {
            reg.plugin.on_error(cx, &err).await;
            warn!(
                plugin = reg.plugin.name(),
                hook,
                error = ?err,
                "hook failed, continuing with pre-hook value"
            );
            Ok(fallback)
        } else {
            Err(err.into_akv(reg.plugin.name(), hook))
        }
    }

    pub async fn before_set(
        &self,
        cx: &mut PluginContext,
        key: &str,
        mut value: Value,
    ) -> Result<Value, AkvError> {
        for reg in self.sorted() {
            if !self.is_active(&reg, cx).await {
                continue;
            }
            let prev = value.clone();
            value = match reg.plugin.before_set(cx, key, value).await {
                Ok(v) => v,
                Err(err) => self.recover(&reg, cx, "before_set", prev, err).await?,
            };
        }
        Ok(value)
    }

    pub async fn after_set(
        &self,
        cx: &mut PluginContext,
        key: &str,
        mut value: Value,
    ) -> Result<Value, AkvError> {
        for reg in self.sorted().into_iter().rev() {
            if !self.is_active(&reg, cx).await {
                continue;
            }
            let prev = value.clone();
            value = match reg.plugin.after_set(cx, key, value).await {
                Ok(v) => v,
                Err(err) => self.recover(&reg, cx, "after_set", prev, err).await?,
            };
        }
        Ok(value)
    }

    pub async fn before_get(&self, cx: &mut PluginContext, key: &str) -> Result<(), AkvError> {
        for reg in self.sorted() {
            if !self.is_active(&reg, cx).await {
                continue;
            }
            if let Err(err) = reg.plugin.before_get(cx, key).await {
                self.recover(&reg, cx, "before_get", (), err).await?;
            }
        }
        Ok(())
    }

    pub async fn after_get(
        &self,
        cx: &mut PluginContext,
        key: &str,
        mut value: Value,
    ) -> Result<Value, AkvError> {
        for reg in self.sorted().into_iter().rev() {
            if !self.is_active(&reg, cx).await {
                continue;
            }
            let prev = value.clone();
            value = match reg.plugin.after_get(cx, key, value).await {
                Ok(v) => v,
                Err(err) => self.recover(&reg, cx, "after_get", prev, err).await?,
            };
        }
        Ok(value)
    }

    pub async fn before_remove(&self, cx: &mut PluginContext, key: &str) -> Result<(), AkvError> {
        for reg in self.sorted() {
            if !self.is_active(&reg, cx).await {
                continue;
            }
            if let Err(err) = reg.plugin.before_remove(cx, key).await {
                self.recover(&reg, cx, "before_remove", (), err).await?;
            }
        }
        Ok(())
    }

    pub async fn after_remove(&self, cx: &mut PluginContext, key: &str) -> Result<(), AkvError> {
        for reg in self.sorted().into_iter().rev() {
            if !self.is_active(&reg, cx).await {
                continue;
            }
            if let Err(err) = reg.plugin.after_remove(cx, key).await {
                self.recover(&reg, cx, "after_remove", (), err).await?;
            }
        }
        Ok(())
    }

    pub async fn before_set_items(
        &self,
        cx: &mut PluginContext,
        mut items: Vec<(String, Value)>,
    ) -> Result<Vec<(String, Value)>, AkvError> {
        for reg in self.sorted() {
            if !self.is_active(&reg, cx).await {
                continue;
            }
            let prev = items.clone();
            items = match reg.plugin.before_set_items(cx, items).await {
                Ok(v) => v,
                Err(err) => self.recover(&reg, cx, "before_set_items", prev, err).await?,
            };
        }
        Ok(items)
    }

    pub async fn after_set_items(
        &self,
        cx: &mut PluginContext,
        mut items: Vec<(String, Value)>,
    ) -> Result<Vec<(String, Value)>, AkvError> {
        for reg in self.sorted().into_iter().rev() {
            if !self.is_active(&reg, cx).await {
                continue;
            }
            let prev = items.clone();
            items = match reg.plugin.after_set_items(cx, items).await {
                Ok(v) => v,
                Err(err) => self.recover(&reg, cx, "after_set_items", prev, err).await?,
            };
        }
        Ok(items)
    }

    pub async fn before_get_items(
        &self,
        cx: &mut PluginContext,
        mut keys: Vec<String>,
    ) -> Result<Vec<String>, AkvError> {
        for reg in self.sorted() {
            if !self.is_active(&reg, cx).await {
                continue;
            }
            let prev = keys.clone();
            keys = match reg.plugin.before_get_items(cx, keys).await {
                Ok(v) => v,
                Err(err) => self.recover(&reg, cx, "before_get_items", prev, err).await?,
            };
        }
        Ok(keys)
    }

    pub async fn after_get_items(
        &self,
        cx: &mut PluginContext,
        mut items: Vec<(String, Value)>,
    ) -> Result<Vec<(String, Value)>, AkvError> {
        for reg in self.sorted().into_iter().rev() {
            if !self.is_active(&reg, cx).await {
                continue;
            }
            let prev = items.clone();
            items = match reg.plugin.after_get_items(cx, items).await {
                Ok(v) => v,
                Err(err) => self.recover(&reg, cx, "after_get_items", prev, err).await?,
            };
        }
        Ok(items)
    }

    pub async fn before_remove_items(
        &self,
        cx: &mut PluginContext,
        mut keys: Vec<String>,
    ) -> Result<Vec<String>, AkvError> {
        for reg in self.sorted() {
            if !self.is_active(&reg, cx).await {
                continue;
            }
            let prev = keys.clone();
            keys = match reg.plugin.before_remove_items(cx, keys).await {
                Ok(v) => v,
                Err(err) => {
                    self.recover(&reg, cx, "before_remove_items", prev, err)
                        .await?
                }
            };
        }
        Ok(keys)
    }

    pub async fn after_remove_items(
        &self,
        cx: &mut PluginContext,
        mut keys: Vec<String>,
    ) -> Result<Vec<String>, AkvError> {
        for reg in self.sorted().into_iter().rev() {
            if !self.is_active(&reg, cx).await {
                continue;
            }
            let prev = keys.clone();
            keys = match reg.plugin.after_remove_items(cx, keys).await {
                Ok(v) => v,
                Err(err) => {
                    self.recover(&reg, cx, "after_remove_items", prev, err)
                        .await?
                }
            };
        }
        Ok(keys)
    }

    /// Runs `on_init` once per registered plugin. `Fail` aborts startup on
    /// the first failed plugin; `DisableAndContinue` disables it and keeps
    /// going. Concurrent callers for the same plugin await the owner.
    pub async fn init_all(&self, cx: &PluginContext) -> Result<(), AkvError> {
        let init_failure = self.policies.lock().init_failure;
        for reg in self.sorted() {
            if !self.is_active(&reg, cx).await {
                continue;
            }
            let ok = self.init_one(&reg, cx).await?;
            if !ok {
                match init_failure {
                    InitFailurePolicy::Fail => {
                        return Err(AkvError::OperationFailed {
                            operation: format!("{}.on_init", reg.plugin.name()),
                            key: None,
                            driver: "plugin".into(),
                            source_name: "init_failed".into(),
                            source_message: "plugin initialization failed".into(),
                        });
                    }
                    InitFailurePolicy::DisableAndContinue => {
                        reg.disabled.store(true, Ordering::Release);
                        warn!(
                            plugin = reg.plugin.name(),
                            "plugin init failed, plugin disabled"
                        );
                    }
                }
            }
        }
        Ok(())
    }

    /// Returns whether the plugin ended up `Ready`. A hook error under the
    /// `Fail` policy still maps through here so the caller owns the policy
    /// decision.
    async fn init_one(&self, reg: &Registration, cx: &PluginContext) -> Result<bool, AkvError> {
        loop {
            let mut pending = None;
            let tx;
            {
                let mut table = self.init.lock().await;
                match table.get(reg.plugin.name()) {
                    Some(InitRecord::Ready) => return Ok(true),
                    Some(InitRecord::Failed) => return Ok(false),
                    Some(InitRecord::Initializing(rx)) => {
                        pending = Some(rx.clone());
                        tx = None;
                    }
                    None => {
                        let (sender, rx) = watch::channel(None);
                        table.insert(
                            reg.plugin.name().to_owned(),
                            InitRecord::Initializing(rx),
                        );
                        tx = Some(sender);
                    }
                }
            }
            if let Some(mut rx) = pending {
                while rx.borrow().is_none() {
                    if rx.changed().await.is_err() {
                        // The owner dropped mid-init without recording an
                        // outcome. Clear the orphaned record so a live
                        // caller (us, next pass) can take over; a fresh
                        // owner that already replaced it keeps its entry.
                        let mut table = self.init.lock().await;
                        let orphaned = matches!(
                            table.get(reg.plugin.name()),
                            Some(InitRecord::Initializing(cur)) if cur.has_changed().is_err()
                        );
                        if orphaned {
                            table.remove(reg.plugin.name());
                        }
                        break;
                    }
                }
                continue;
            }
            let tx = tx.expect("init ownership taken without a sender");
            let outcome = reg.plugin.on_init(cx).await;
            let ok = outcome.is_ok();
            {
                let mut table = self.init.lock().await;
                table.insert(
                    reg.plugin.name().to_owned(),
                    if ok { InitRecord::Ready } else { InitRecord::Failed },
                );
            }
            let _ = tx.send(Some(ok));
            if let Err(err) = outcome {
                warn!(
                    plugin = reg.plugin.name(),
                    error = ?err,
                    "plugin on_init failed"
                );
            }
            return Ok(ok);
        }
    }

    /// Destroys initialized plugins in reverse registration order. Errors
    /// are logged, never propagated. Idempotent.
    pub async fn destroy_all(&self, cx: &PluginContext) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        let ready: HashSet<String> = {
            let table = self.init.lock().await;
            table
                .iter()
                .filter(|(_, rec)| matches!(rec, InitRecord::Ready))
                .map(|(name, _)| name.clone())
                .collect()
        };
        for reg in self.registration_reversed() {
            if !ready.contains(reg.plugin.name()) {
                continue;
            }
            if let Err(err) = reg.plugin.on_destroy(cx).await {
                warn!(
                    plugin = reg.plugin.name(),
                    error = ?err,
                    "plugin on_destroy failed"
                );
            }
        }
        self.init.lock().await.clear();
    }
}

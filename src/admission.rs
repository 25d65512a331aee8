//! Transaction admission control and the transaction scope.
//!
//! Admission bounds the number of concurrently open backend transactions per
//! connection context. Excess starts queue FIFO behind oneshot waiters; a
//! completing transaction hands its slot to the next waiter. When a context
//! goes fully idle the cached connection handle is recycled after a
//! generation-guarded timer, so a timer firing while new activity arrives
//! observes a bumped generation and stands down instead of racing the close.

use crate::backend::{BackendTxn, TxnMode};
use crate::connection::ConnectionContext;
use crate::error::AkvError;
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

pub type TxnFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, AkvError>> + Send + 'a>>;

/// Slot held for the duration of one admitted transaction. Dropping it
/// releases the slot, wakes the next queued start, and arms the idle timer
/// when nothing is active or pending. The slot travels inside the guard
/// during a hand-off, so a waiter future dropped mid-wait still releases
/// it through the channel's drop.
pub(crate) struct AdmitGuard {
    ctx: Arc<ConnectionContext>,
    idle_ms: u64,
}

impl Drop for AdmitGuard {
    fn drop(&mut self) {
        self.ctx.release_slot(self.idle_ms);
    }
}

impl ConnectionContext {
    /// Starts a transaction slot immediately when under the bound (or when
    /// no bound is configured), otherwise queues FIFO until one frees.
    pub(crate) async fn admit(
        self: &Arc<Self>,
        max: Option<usize>,
        idle_ms: u64,
    ) -> AdmitGuard {
        let waiter = {
            let mut state = self.state.lock();
            state.idle_generation += 1;
            let under_bound = max.map_or(true, |max| state.active_txns < max);
            if under_bound {
                state.active_txns += 1;
                None
            } else {
                let (tx, rx) = oneshot::channel();
                state.pending_txns.push_back(tx);
                Some(rx)
            }
        };
        match waiter {
            None => AdmitGuard {
                ctx: Arc::clone(self),
                idle_ms,
            },
            // The releasing side transfers its slot inside the guard, so a
            // successful recv means the slot is already ours, and dropping
            // this future mid-wait drops the channel end holding the guard,
            // which releases the slot.
            Some(rx) => match rx.await {
                Ok(guard) => guard,
                Err(_) => {
                    // Sender dropped without a hand-off; only happens when
                    // the context state itself is torn down. Claim a slot
                    // directly.
                    self.state.lock().active_txns += 1;
                    AdmitGuard {
                        ctx: Arc::clone(self),
                        idle_ms,
                    }
                }
            },
        }
    }

    pub(crate) fn release_slot(self: &Arc<Self>, idle_ms: u64) {
        let waiter = {
            let mut state = self.state.lock();
            state.active_txns -= 1;
            match state.pending_txns.pop_front() {
                Some(waiter) => {
                    state.active_txns += 1;
                    waiter
                }
                None => {
                    let go_idle = state.active_txns == 0;
                    drop(state);
                    if go_idle {
                        self.arm_idle_timer(idle_ms);
                    }
                    return;
                }
            }
        };
        let guard = AdmitGuard {
            ctx: Arc::clone(self),
            idle_ms,
        };
        // A dead waiter returns the guard from `send`; its drop re-enters
        // here and passes the slot to the next in line.
        let _ = waiter.send(guard);
    }

    fn arm_idle_timer(self: &Arc<Self>, idle_ms: u64) {
        let generation = self.state.lock().idle_generation;
        let ctx = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(idle_ms)).await;
            let still_idle = ctx.state.lock().idle_generation == generation;
            if still_idle {
                ctx.close_idle().await;
            }
        });
    }

    /// Runs `body` inside one admitted backend transaction, committing on
    /// `Ok` and aborting on `Err`. A stale handle at transaction start or
    /// commit triggers one transparent reconnect-and-retry; the second
    /// failure surfaces.
    pub(crate) async fn run_with_txn<T, F>(
        self: &Arc<Self>,
        store: &str,
        mode: TxnMode,
        max: Option<usize>,
        idle_ms: u64,
        mut body: F,
    ) -> Result<T, AkvError>
    where
        F: for<'a> FnMut(&'a mut TransactionScope) -> TxnFuture<'a, T>,
    {
        let mut reconnected = false;
        loop {
            let db = if reconnected {
                self.reconnect().await?
            } else {
                self.ensure_open().await?
            };
            let _slot = self.admit(max, idle_ms).await;
            let txn = match db.begin(store, mode).await {
                Ok(txn) => txn,
                Err(err) if err.is_stale_handle() && !reconnected => {
                    reconnected = true;
                    continue;
                }
                Err(err) => return Err(err),
            };
            let mut scope = TransactionScope::new(txn, mode);
            match body(&mut scope).await {
                Ok(value) => match scope.into_txn().commit().await {
                    Ok(()) => return Ok(value),
                    Err(err) if err.is_stale_handle() && !reconnected => {
                        reconnected = true;
                        continue;
                    }
                    Err(err) => return Err(err),
                },
                Err(err) => {
                    let _ = scope.into_txn().abort().await;
                    return Err(err);
                }
            }
        }
    }
}

/// Capability object bound to one underlying transaction. Read-only scopes
/// reject every mutating call before the backend sees it.
pub struct TransactionScope {
    txn: Box<dyn BackendTxn>,
    mode: TxnMode,
}

impl TransactionScope {
    pub(crate) fn new(txn: Box<dyn BackendTxn>, mode: TxnMode) -> Self {
        Self { txn, mode }
    }

    pub(crate) fn into_txn(self) -> Box<dyn BackendTxn> {
        self.txn
    }

    pub fn mode(&self) -> TxnMode {
        self.mode
    }

    fn check_writable(&self, operation: &str) -> Result<(), AkvError> {
        if self.mode == TxnMode::ReadOnly {
            return Err(AkvError::ReadonlyTransaction {
                operation: operation.into(),
            });
        }
        Ok(())
    }

    pub async fn get(&mut self, key: &str) -> Result<Option<Value>, AkvError> {
        self.txn.get(key).await
    }

    pub async fn set(&mut self, key: &str, value: Value) -> Result<(), AkvError> {
        self.check_writable("set")?;
        self.txn.put(key, value).await
    }

    pub async fn remove(&mut self, key: &str) -> Result<(), AkvError> {
        self.check_writable("remove")?;
        self.txn.delete(key).await
    }

    pub async fn keys(&mut self) -> Result<Vec<String>, AkvError> {
        self.txn.keys().await
    }

    pub async fn clear(&mut self) -> Result<(), AkvError> {
        self.check_writable("clear")?;
        self.txn.clear().await
    }

    pub async fn length(&mut self) -> Result<u64, AkvError> {
        Ok(self.keys().await?.len() as u64)
    }
}

//! Write coalescing.
//!
//! Rapid single-item writes against one connection context are buffered and
//! applied in chunks inside fewer underlying transactions. A flush runs when
//! the window elapses or the queue reaches the batch bound, whichever comes
//! first. The queue is swapped out atomically at flush start, so writes
//! arriving mid-flush form a new queue. Each queued write resolves or
//! rejects exactly once through its oneshot sender; fire-and-forget writes
//! carry no sender and report failures through the warning side channel.
//!
//! Same-key overwrites across chunks are last-write-wins by transaction
//! commit order, not submission order. That relaxed guarantee is
//! deliberate; only within a single chunk do ops apply in submission order.

use crate::backend::TxnMode;
use crate::connection::ConnectionContext;
use crate::error::AkvError;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::warn;

#[derive(Debug, Clone)]
pub(crate) enum QueuedOp {
    Set { key: String, value: Value },
    Remove { key: String },
}

pub(crate) struct QueuedWrite {
    pub store: String,
    pub op: QueuedOp,
    /// `None` is fire-and-forget: the caller already resolved at enqueue.
    pub done: Option<oneshot::Sender<Result<Value, AkvError>>>,
}

/// Limits a flush inherits from the submitting handle's config.
#[derive(Debug, Clone, Copy)]
pub(crate) struct CoalesceLimits {
    pub window_ms: u64,
    pub max_batch: usize,
    pub max_txns: Option<usize>,
    pub idle_ms: u64,
}

#[derive(Default)]
pub struct WriteStats {
    total_writes: AtomicU64,
    coalesced_writes: AtomicU64,
    transactions_saved: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteStatsSnapshot {
    pub total_writes: u64,
    pub coalesced_writes: u64,
    pub transactions_saved: u64,
}

impl WriteStats {
    pub(crate) fn record_write(&self) {
        self.total_writes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_flush(&self, writes: u64, transactions: u64, coalesced: u64) {
        self.coalesced_writes.fetch_add(coalesced, Ordering::Relaxed);
        self.transactions_saved
            .fetch_add(writes.saturating_sub(transactions), Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> WriteStatsSnapshot {
        WriteStatsSnapshot {
            total_writes: self.total_writes.load(Ordering::Relaxed),
            coalesced_writes: self.coalesced_writes.load(Ordering::Relaxed),
            transactions_saved: self.transactions_saved.load(Ordering::Relaxed),
        }
    }
}

impl ConnectionContext {
    /// Appends a write to the coalescing queue and arranges for a flush:
    /// immediately when the queue reaches the batch bound, otherwise after
    /// the window.
    pub(crate) fn enqueue_write(
        self: &Arc<Self>,
        write: QueuedWrite,
        limits: CoalesceLimits,
    ) {
        self.stats.record_write();
        let flush_now = {
            let mut state = self.state.lock();
            state.idle_generation += 1;
            state.queue.push(write);
            if state.queue.len() >= limits.max_batch {
                true
            } else if !state.flush_scheduled {
                state.flush_scheduled = true;
                false
            } else {
                return;
            }
        };
        let ctx = Arc::clone(self);
        tokio::spawn(async move {
            if !flush_now {
                tokio::time::sleep(Duration::from_millis(limits.window_ms)).await;
            }
            ctx.flush_queued(limits).await;
        });
    }

    /// Drains and applies the current queue. Strong-consistency reads call
    /// this before touching the backend so they observe all writes
    /// submitted before the call. Flushes serialize on `flush_lock`; a
    /// caller arriving while another flush is mid-commit waits it out, so
    /// returning from here means every earlier-submitted write has settled.
    pub(crate) async fn flush_queued(self: &Arc<Self>, limits: CoalesceLimits) {
        let _flush_guard = self.flush_lock.lock().await;
        let drained = {
            let mut state = self.state.lock();
            state.flush_scheduled = false;
            std::mem::take(&mut state.queue)
        };
        if drained.is_empty() {
            return;
        }
        let total = drained.len() as u64;
        let mut transactions = 0u64;
        let mut coalesced = 0u64;

        // One store per transaction; per-store submission order preserved.
        let mut by_store: BTreeMap<String, Vec<QueuedWrite>> = BTreeMap::new();
        for write in drained {
            by_store.entry(write.store.clone()).or_default().push(write);
        }

        for (store, writes) in by_store {
            let mut writes = writes.into_iter().peekable();
            while writes.peek().is_some() {
                let chunk: Vec<QueuedWrite> =
                    writes.by_ref().take(limits.max_batch.max(1)).collect();
                transactions += 1;
                if chunk.len() > 1 {
                    coalesced += chunk.len() as u64;
                }
                self.apply_chunk(&store, chunk, limits).await;
            }
        }
        self.stats.record_flush(total, transactions, coalesced);
    }

    async fn apply_chunk(
        self: &Arc<Self>,
        store: &str,
        chunk: Vec<QueuedWrite>,
        limits: CoalesceLimits,
    ) {
        let (ops, senders): (Vec<QueuedOp>, Vec<_>) = chunk
            .into_iter()
            .map(|write| (write.op, write.done))
            .unzip();

        let ops = Arc::new(ops);
        let body_ops = Arc::clone(&ops);
        let result = self
            .run_with_txn(
                store,
                TxnMode::ReadWrite,
                limits.max_txns,
                limits.idle_ms,
                move |scope| {
                    let ops = Arc::clone(&body_ops);
                    Box::pin(async move {
                        for op in ops.iter() {
                            match op {
                                QueuedOp::Set { key, value } => {
                                    scope.set(key, value.clone()).await?;
                                }
                                QueuedOp::Remove { key } => {
                                    scope.remove(key).await?;
                                }
                            }
                        }
                        Ok(())
                    })
                },
            )
            .await;

        for (op, sender) in ops.iter().zip(senders) {
            let (operation, key) = match op {
                QueuedOp::Set { key, .. } => ("set", key),
                QueuedOp::Remove { key } => ("remove", key),
            };
            let outcome = match &result {
                Ok(()) => Ok(match op {
                    QueuedOp::Set { value, .. } => value.clone(),
                    QueuedOp::Remove { .. } => Value::Null,
                }),
                Err(err) => Err(err
                    .clone()
                    .with_context(operation, Some(key), self.driver_name())),
            };
            match sender {
                Some(sender) => {
                    // A dropped receiver means the caller gave up waiting;
                    // the write itself already settled above.
                    let _ = sender.send(outcome);
                }
                None => {
                    if let Err(err) = outcome {
                        warn!(
                            database = %self.database_name(),
                            store,
                            key = %key,
                            error = %err,
                            "fire-and-forget write failed"
                        );
                    }
                }
            }
        }
    }

    pub(crate) fn has_queued_writes(&self) -> bool {
        !self.state.lock().queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryDriver;
    use crate::backend::BackendDriver;
    use serde_json::json;

    const LIMITS: CoalesceLimits = CoalesceLimits {
        window_ms: 4,
        max_batch: 8,
        max_txns: None,
        idle_ms: 1_000,
    };

    fn context(driver_name: &str) -> (Arc<MemoryDriver>, Arc<ConnectionContext>) {
        let driver = Arc::new(MemoryDriver::with_name(driver_name));
        let ctx = Arc::new(ConnectionContext::new(
            Arc::clone(&driver) as Arc<dyn BackendDriver>,
            "db".to_owned(),
        ));
        ctx.register_store("s", 1);
        (driver, ctx)
    }

    fn queued(key: &str, value: Value) -> (QueuedWrite, oneshot::Receiver<Result<Value, AkvError>>) {
        let (tx, rx) = oneshot::channel();
        (
            QueuedWrite {
                store: "s".into(),
                op: QueuedOp::Set {
                    key: key.into(),
                    value,
                },
                done: Some(tx),
            },
            rx,
        )
    }

    #[tokio::test]
    async fn queued_writes_resolve_exactly_once_with_their_value() {
        let (_driver, ctx) = context("coal-resolve");
        let (write, rx) = queued("a", json!(1));
        ctx.enqueue_write(write, LIMITS);
        let resolved = rx.await.expect("sender must not be dropped unresolved");
        assert_eq!(resolved.unwrap(), json!(1));
    }

    #[tokio::test]
    async fn burst_coalesces_into_bounded_transactions() {
        let (driver, ctx) = context("coal-burst");
        // Warm up so the open itself is settled before counting.
        ctx.ensure_open().await.unwrap();

        let mut receivers = Vec::new();
        for i in 0..20 {
            let (write, rx) = queued(&format!("k{i}"), json!(i));
            ctx.enqueue_write(write, LIMITS);
            receivers.push(rx);
        }
        for rx in receivers {
            rx.await.unwrap().unwrap();
        }

        // 20 writes with max_batch 8 need at least ceil(20/8) = 3
        // transactions and never more than one per write.
        let txns = driver.rw_transactions_started();
        assert!((3..=20).contains(&txns), "unexpected txn count {txns}");

        let stats = ctx.stats().snapshot();
        assert_eq!(stats.total_writes, 20);
        assert!(stats.transactions_saved >= 20 - txns);
    }

    #[tokio::test]
    async fn flush_drains_removes_too() {
        let (_driver, ctx) = context("coal-remove");
        let (write, rx) = queued("a", json!("v"));
        ctx.enqueue_write(write, LIMITS);
        rx.await.unwrap().unwrap();

        let (tx, rx) = oneshot::channel();
        ctx.enqueue_write(
            QueuedWrite {
                store: "s".into(),
                op: QueuedOp::Remove { key: "a".into() },
                done: Some(tx),
            },
            LIMITS,
        );
        assert_eq!(rx.await.unwrap().unwrap(), Value::Null);

        let value = ctx
            .run_with_txn("s", TxnMode::ReadOnly, None, 1_000, |scope| {
                Box::pin(async move { scope.get("a").await })
            })
            .await
            .unwrap();
        assert_eq!(value, None);
    }

    #[tokio::test]
    async fn explicit_flush_observes_submitted_writes() {
        let (_driver, ctx) = context("coal-drain");
        let (write, _rx) = queued("a", json!(42));
        ctx.enqueue_write(write, LIMITS);
        assert!(ctx.has_queued_writes());

        ctx.flush_queued(LIMITS).await;
        assert!(!ctx.has_queued_writes());

        let value = ctx
            .run_with_txn("s", TxnMode::ReadOnly, None, 1_000, |scope| {
                Box::pin(async move { scope.get("a").await })
            })
            .await
            .unwrap();
        assert_eq!(value, Some(json!(42)));
    }

    #[tokio::test]
    async fn same_window_same_key_is_last_write_wins_within_chunk() {
        let (_driver, ctx) = context("coal-lww");
        let (w1, rx1) = queued("k", json!("first"));
        let (w2, rx2) = queued("k", json!("second"));
        ctx.enqueue_write(w1, LIMITS);
        ctx.enqueue_write(w2, LIMITS);
        rx1.await.unwrap().unwrap();
        rx2.await.unwrap().unwrap();

        let value = ctx
            .run_with_txn("s", TxnMode::ReadOnly, None, 1_000, |scope| {
                Box::pin(async move { scope.get("k").await })
            })
            .await
            .unwrap();
        assert_eq!(value, Some(json!("second")));
    }
}

use crate::*;
use serde_json::json;
use std::ops::ControlFlow;
use std::sync::Arc;

fn store_for(driver: &str, db: &str) -> Store {
    registry::register_driver(Arc::new(MemoryDriver::with_name(driver)));
    let config = AkvConfig::default()
        .with_name(db)
        .with_driver_order(vec![driver.to_owned()])
        .with_coalesce_window_ms(1);
    Store::new(config).unwrap()
}

#[tokio::test]
async fn set_get_remove_round_trip() {
    let store = store_for("facade-roundtrip", "db");
    let stored = store.set_item("a", json!({ "n": 1 })).await.unwrap();
    assert_eq!(stored, json!({ "n": 1 }));
    assert_eq!(store.get_item("a").await.unwrap(), json!({ "n": 1 }));

    store.remove_item("a").await.unwrap();
    assert_eq!(store.get_item("a").await.unwrap(), json!(null));
    // null round-trips as null, indistinguishable from missing
    store.set_item("b", json!(null)).await.unwrap();
    assert_eq!(store.get_item("b").await.unwrap(), json!(null));
}

#[tokio::test]
async fn batch_operations_and_length() {
    let store = store_for("facade-batch", "db");
    let pairs = vec![
        ("k1".to_owned(), json!(1)),
        ("k2".to_owned(), json!(2)),
        ("k3".to_owned(), json!(3)),
    ];
    let out = store.set_items(pairs.clone()).await.unwrap();
    assert_eq!(out, pairs);
    assert_eq!(store.length().await.unwrap(), 3);

    let got = store
        .get_items(vec!["k1".into(), "missing".into()])
        .await
        .unwrap();
    assert_eq!(got, vec![("k1".to_owned(), json!(1)), ("missing".to_owned(), json!(null))]);

    store.remove_items(vec!["k1".into(), "k2".into()]).await.unwrap();
    assert_eq!(store.keys().await.unwrap(), vec!["k3".to_owned()]);
    assert_eq!(store.key(0).await.unwrap(), Some("k3".to_owned()));
    assert_eq!(store.key(5).await.unwrap(), None);
}

#[tokio::test]
async fn iterate_visits_in_key_order_and_breaks() {
    let store = store_for("facade-iterate", "db");
    for key in ["b", "a", "c"] {
        store.set_item(key, json!(key)).await.unwrap();
    }
    let mut seen = Vec::new();
    let broke = store
        .iterate(|key, value, index| {
            seen.push((key.to_owned(), value, index));
            if key == "b" {
                ControlFlow::Break(index)
            } else {
                ControlFlow::Continue(())
            }
        })
        .await
        .unwrap();
    assert_eq!(broke, Some(2));
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0].0, "a");
    assert_eq!(seen[1].0, "b");
}

#[tokio::test]
async fn clear_wipes_the_store() {
    let store = store_for("facade-clear", "db");
    store.set_item("a", json!(1)).await.unwrap();
    store.set_item("b", json!(2)).await.unwrap();
    store.clear().await.unwrap();
    assert_eq!(store.length().await.unwrap(), 0);
}

#[tokio::test]
async fn configure_rejected_after_ready() {
    let store = store_for("facade-config", "db");
    store
        .configure(store.config_get().with_coalesce_max_batch(16))
        .unwrap();
    store.ready().await.unwrap();
    let err = store
        .configure(store.config_get().with_coalesce_max_batch(8))
        .unwrap_err();
    assert_eq!(err.code(), AkvErrorCode::InvalidConfig);
}

#[tokio::test]
async fn unknown_driver_is_reported() {
    let config = AkvConfig::default()
        .with_name("nodriver")
        .with_driver_order(vec!["no-such-driver".to_owned()]);
    let store = Store::new(config).unwrap();
    let err = store.ready().await.unwrap_err();
    assert!(matches!(err, AkvError::DriverNotFound { .. }));
    assert_eq!(store.driver_name(), None);
}

#[tokio::test]
async fn destroy_makes_handle_unusable_and_is_idempotent() {
    let store = store_for("facade-destroy", "db");
    store.set_item("a", json!(1)).await.unwrap();
    store.destroy().await.unwrap();
    store.destroy().await.unwrap();
    let err = store.get_item("a").await.unwrap_err();
    assert_eq!(err.code(), AkvErrorCode::NotInitialized);
}

#[tokio::test]
async fn run_transaction_commits_and_aborts() {
    let store = store_for("facade-txn", "db");
    store.ready().await.unwrap();

    store
        .run_transaction(TxnMode::ReadWrite, |scope| {
            Box::pin(async move {
                scope.set("x", json!(1)).await?;
                scope.set("y", json!(2)).await?;
                Ok(())
            })
        })
        .await
        .unwrap();
    assert_eq!(store.length().await.unwrap(), 2);

    let err: Result<(), _> = store
        .run_transaction(TxnMode::ReadWrite, |scope| {
            Box::pin(async move {
                scope.set("z", json!(3)).await?;
                Err(AkvError::NotInitialized)
            })
        })
        .await;
    assert!(err.is_err());
    // aborted transaction left no trace
    assert_eq!(store.get_item("z").await.unwrap(), json!(null));
}

struct CoreOnly(MemoryDriver);

#[async_trait::async_trait]
impl BackendDriver for CoreOnly {
    fn name(&self) -> &str {
        self.0.name()
    }

    fn supports(&self, cap: Capability) -> bool {
        matches!(cap, Capability::Core | Capability::Durability)
    }

    async fn open(
        &self,
        name: &str,
        version: u64,
        stores: &[String],
    ) -> Result<OpenOutcome, AkvError> {
        self.0.open(name, version, stores).await
    }

    async fn drop_database(&self, name: &str) -> Result<(), AkvError> {
        self.0.drop_database(name).await
    }
}

#[tokio::test]
async fn limited_driver_rejects_unsupported_operations() {
    registry::register_driver(Arc::new(CoreOnly(MemoryDriver::with_name("facade-limited"))));
    let store = Store::new(
        AkvConfig::default()
            .with_name("db")
            .with_driver_order(vec!["facade-limited".to_owned()])
            .with_coalesce_window_ms(1),
    )
    .unwrap();

    store.set_item("k", json!(1)).await.unwrap();
    let err = store.keys().await.unwrap_err();
    assert_eq!(err.code(), AkvErrorCode::Unsupported);
    let err = store.clear().await.unwrap_err();
    assert_eq!(err.code(), AkvErrorCode::Unsupported);
}

struct BrokenDb {
    stores: Vec<String>,
}

#[async_trait::async_trait]
impl BackendDb for BrokenDb {
    fn version(&self) -> u64 {
        1
    }

    fn store_names(&self) -> Vec<String> {
        self.stores.clone()
    }

    fn is_stale(&self) -> bool {
        false
    }

    async fn begin(&self, _store: &str, _mode: TxnMode) -> Result<Box<dyn BackendTxn>, AkvError> {
        Err(AkvError::Unavailable {
            driver: "facade-broken".into(),
            message: "backend lost".into(),
        })
    }

    async fn close(&self) {}
}

struct BrokenBegin;

#[async_trait::async_trait]
impl BackendDriver for BrokenBegin {
    fn name(&self) -> &str {
        "facade-broken"
    }

    fn supports(&self, _cap: Capability) -> bool {
        true
    }

    async fn open(
        &self,
        _name: &str,
        version: u64,
        stores: &[String],
    ) -> Result<OpenOutcome, AkvError> {
        Ok(OpenOutcome {
            db: Arc::new(BrokenDb {
                stores: stores.to_vec(),
            }),
            version,
            upgraded: false,
        })
    }

    async fn drop_database(&self, _name: &str) -> Result<(), AkvError> {
        Ok(())
    }
}

#[tokio::test]
async fn backend_failures_carry_operation_and_key() {
    registry::register_driver(Arc::new(BrokenBegin));
    let store = Store::new(
        AkvConfig::default()
            .with_name("db")
            .with_driver_order(vec!["facade-broken".to_owned()])
            .with_coalesce_window_ms(1),
    )
    .unwrap();

    let err = store.get_item("k1").await.unwrap_err();
    match err {
        AkvError::OperationFailed {
            operation,
            key,
            driver,
            source_name,
            ..
        } => {
            assert_eq!(operation, "get_item");
            assert_eq!(key.as_deref(), Some("k1"));
            assert_eq!(driver, "facade-broken");
            assert_eq!(source_name, "unavailable");
        }
        other => panic!("unexpected error: {other:?}"),
    }

    let err = store.set_item("k2", json!(1)).await.unwrap_err();
    match err {
        AkvError::OperationFailed { operation, key, .. } => {
            assert_eq!(operation, "set");
            assert_eq!(key.as_deref(), Some("k2"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn stats_count_writes() {
    let store = store_for("facade-stats", "db");
    for i in 0..4 {
        store.set_item(&format!("k{i}"), json!(i)).await.unwrap();
    }
    let stats = store.stats();
    assert_eq!(stats.total_writes, 4);
}

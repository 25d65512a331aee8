use akv::{
    register_driver, AkvConfig, AkvError, AkvErrorCode, MemoryDriver, Store, TxnMode,
};
use serde_json::json;
use std::sync::Arc;

fn store_for(driver: &str, max_txns: Option<usize>) -> Arc<Store> {
    register_driver(Arc::new(MemoryDriver::with_name(driver)));
    let mut config = AkvConfig::default()
        .with_name("transactions")
        .with_driver_order(vec![driver.to_owned()])
        .with_coalesce_window_ms(1);
    config.max_concurrent_transactions = max_txns;
    Arc::new(Store::new(config).unwrap())
}

#[tokio::test]
async fn read_only_scope_rejects_mutation() {
    let store = store_for("txn-readonly", None);
    store.set_item("existing", json!(1)).await.unwrap();

    let err = store
        .run_transaction(TxnMode::ReadOnly, |scope| {
            Box::pin(async move { scope.set("existing", json!(2)).await })
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), AkvErrorCode::ReadonlyTransaction);

    let err = store
        .run_transaction(TxnMode::ReadOnly, |scope| {
            Box::pin(async move { scope.clear().await })
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), AkvErrorCode::ReadonlyTransaction);

    // rejected before the backend saw anything
    assert_eq!(store.get_item("existing").await.unwrap(), json!(1));
    assert_eq!(store.length().await.unwrap(), 1);
}

#[tokio::test]
async fn serialized_increments_never_lose_updates() {
    let store = store_for("txn-serialized", Some(1));
    store.set_item("counter", json!(0)).await.unwrap();

    let mut tasks = Vec::new();
    for _ in 0..2 {
        let store = Arc::clone(&store);
        tasks.push(tokio::spawn(async move {
            store
                .run_transaction(TxnMode::ReadWrite, |scope| {
                    Box::pin(async move {
                        let current = scope
                            .get("counter")
                            .await?
                            .and_then(|v| v.as_i64())
                            .unwrap_or(0);
                        // a second transaction sneaking in here would lose
                        // an update; admission forbids it
                        tokio::task::yield_now().await;
                        scope.set("counter", json!(current + 1)).await
                    })
                })
                .await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }
    assert_eq!(store.get_item("counter").await.unwrap(), json!(2));
}

#[tokio::test]
async fn abort_rolls_back_partial_writes() {
    let store = store_for("txn-abort", None);
    store.set_item("keep", json!("original")).await.unwrap();

    let result: Result<(), AkvError> = store
        .run_transaction(TxnMode::ReadWrite, |scope| {
            Box::pin(async move {
                scope.set("keep", json!("dirty")).await?;
                scope.set("extra", json!(true)).await?;
                Err(AkvError::Aborted {
                    plugin: "caller".into(),
                    message: "changed my mind".into(),
                })
            })
        })
        .await;
    assert!(result.is_err());

    assert_eq!(store.get_item("keep").await.unwrap(), json!("original"));
    assert_eq!(store.get_item("extra").await.unwrap(), json!(null));
}

#[tokio::test]
async fn transaction_sees_its_own_writes() {
    let store = store_for("txn-own-writes", None);
    store.ready().await.unwrap();

    let seen = store
        .run_transaction(TxnMode::ReadWrite, |scope| {
            Box::pin(async move {
                scope.set("a", json!("v")).await?;
                scope.get("a").await
            })
        })
        .await
        .unwrap();
    assert_eq!(seen, Some(json!("v")));
}

//! Scoped transactions, savepoints and retry against a LOCAL backend.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tandem_db::{
    BackendConfig, Coordinator, CoordinatorConfig, Params, SqlValue, TandemError,
};

async fn setup() -> (tempfile::TempDir, Arc<Coordinator>) {
    let dir = tempfile::tempdir().unwrap();
    let config = CoordinatorConfig {
        local: Some(BackendConfig::local_path(dir.path().join("tx.db"))),
        ..Default::default()
    };
    let db = Coordinator::new(config).await.unwrap();
    db.execute_query(
        "CREATE TABLE items (id INTEGER PRIMARY KEY, label TEXT NOT NULL)",
        &Params::None,
        None,
    )
    .await
    .unwrap();
    (dir, db)
}

async fn labels(db: &Coordinator) -> Vec<String> {
    let result = db
        .execute_query("SELECT label FROM items ORDER BY label", &Params::None, None)
        .await
        .unwrap();
    result
        .rows
        .iter()
        .filter_map(|r| r.get_str("label").map(str::to_string))
        .collect()
}

#[tokio::test]
async fn test_nested_savepoint_rollback_keeps_prefix() {
    let (_dir, db) = setup().await;
    let coordinator = db.transactions().clone();

    let tx = coordinator.begin(None, None).await.unwrap();
    tx.insert("items", [("label", SqlValue::from("A"))]).unwrap();
    tx.create_savepoint("sp1").unwrap();

    // The nested context records B, then raises; the parent continues.
    let nested: Result<(), TandemError> = coordinator
        .nested(&tx, None, |child| async move {
            child.insert("items", [("label", SqlValue::from("B"))])?;
            Err(TandemError::Query("nested failure".to_string()))
        })
        .await;
    assert!(nested.is_err());

    coordinator.commit(&tx).await.unwrap();

    // Exactly {A}: the rolled-back savepoint discarded B.
    assert_eq!(labels(&db).await, vec!["A"]);
    // No savepoints survive the commit.
    assert!(tx.savepoint_names().is_empty());
    db.shutdown().await;
}

#[tokio::test]
async fn test_scoped_raise_observes_single_rollback() {
    let (_dir, db) = setup().await;
    let coordinator = db.transactions().clone();

    let err = coordinator
        .scoped(None, None, |tx| async move {
            tx.insert("items", [("label", SqlValue::from("ghost"))])?;
            Err::<(), _>(TandemError::Query("abort".to_string()))
        })
        .await
        .unwrap_err();
    assert!(err.to_string().contains("abort"));

    // Zero commits for the transaction: the table stays empty.
    assert!(labels(&db).await.is_empty());
    let metrics = coordinator.metrics();
    assert_eq!(metrics.rolled_back_transactions, 1);
    assert_eq!(metrics.successful_transactions, 0);
    db.shutdown().await;
}

#[tokio::test]
async fn test_retry_on_transient_failure_records_attempts() {
    let (_dir, db) = setup().await;
    let coordinator = db.transactions().clone();

    let attempts = Arc::new(AtomicU32::new(0));
    let counter = attempts.clone();
    let value = coordinator
        .run_with_retry(
            move || {
                let counter = counter.clone();
                async move {
                    // Fails twice with a deadlock, then succeeds.
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(TandemError::Query("deadlock detected".to_string()))
                    } else {
                        Ok("done")
                    }
                }
            },
            3,
            Duration::from_millis(10),
        )
        .await
        .unwrap();

    assert_eq!(value, "done");
    assert_eq!(attempts.load(Ordering::SeqCst), 3);

    // The monitor saw the retries.
    let recent = db.monitor().recent_transactions(1);
    assert_eq!(recent.len(), 1);
    assert!(recent[0].retry_count >= 2);
    assert!(recent[0].success);
    db.shutdown().await;
}

#[tokio::test]
async fn test_savepoint_rollback_is_prefix_truncation() {
    let (_dir, db) = setup().await;
    let coordinator = db.transactions().clone();

    let tx = coordinator.begin(None, None).await.unwrap();
    tx.insert("items", [("label", SqlValue::from("one"))]).unwrap();
    tx.insert("items", [("label", SqlValue::from("two"))]).unwrap();
    tx.create_savepoint("cut").unwrap();
    tx.insert("items", [("label", SqlValue::from("three"))]).unwrap();
    tx.create_savepoint("later").unwrap();
    tx.insert("items", [("label", SqlValue::from("four"))]).unwrap();

    tx.rollback_to_savepoint("cut").unwrap();

    // The post-state equals the prefix at the savepoint; savepoints created
    // after it are gone.
    assert_eq!(tx.operations_len(), 2);
    assert_eq!(tx.savepoint_names(), vec!["cut"]);

    coordinator.commit(&tx).await.unwrap();
    assert_eq!(labels(&db).await, vec!["one", "two"]);
    db.shutdown().await;
}

#[tokio::test]
async fn test_transaction_pins_backend() {
    let (_dir, db) = setup().await;
    let coordinator = db.transactions().clone();

    let tx = coordinator.begin(None, None).await.unwrap();
    let backend = tx.backend();
    tx.insert("items", [("label", SqlValue::from("pinned"))]).unwrap();
    coordinator.commit(&tx).await.unwrap();

    // The whole lifecycle ran against the backend chosen at begin.
    assert_eq!(backend, db.current_backend());
    db.shutdown().await;
}

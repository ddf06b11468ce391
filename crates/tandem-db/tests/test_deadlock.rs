//! Deadlock detection wired through the kernel's transaction layer.

use std::sync::Arc;
use std::time::Duration;

use tandem_db::{
    BackendConfig, Coordinator, CoordinatorConfig, DetectorConfig, Params, TransactionState,
    VictimStrategy,
};

async fn setup() -> (tempfile::TempDir, Arc<Coordinator>) {
    let dir = tempfile::tempdir().unwrap();
    let config = CoordinatorConfig {
        local: Some(BackendConfig::local_path(dir.path().join("deadlock.db"))),
        detector: DetectorConfig {
            // Tests drive detection by hand.
            detection_interval: Duration::from_secs(3600),
            strategy: VictimStrategy::AbortYoungest,
        },
        ..Default::default()
    };
    let db = Coordinator::new(config).await.unwrap();
    db.execute_query("CREATE TABLE r (id TEXT)", &Params::None, None)
        .await
        .unwrap();
    (dir, db)
}

#[tokio::test]
async fn test_two_transaction_cycle_detect_and_resolve() {
    let (_dir, db) = setup().await;
    let coordinator = db.transactions().clone();
    let detector = db.detector().clone();
    assert_eq!(detector.strategy(), VictimStrategy::AbortYoungest);

    let t1 = coordinator.begin(None, None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    let t2 = coordinator.begin(None, None).await.unwrap();
    let id1 = t1.id().to_string();
    let id2 = t2.id().to_string();

    detector.add_wait(&id1, &id2, "r1", "exclusive");
    detector.add_wait(&id2, &id1, "r2", "exclusive");

    let mut deadlocks = detector.detect();
    assert_eq!(deadlocks.len(), 1);
    let mut members = deadlocks[0].transactions.clone();
    members.sort();
    let mut expected = vec![id1.clone(), id2.clone()];
    expected.sort();
    assert_eq!(members, expected);

    assert!(detector.resolve(&mut deadlocks[0]));
    // abort_youngest picks the transaction with the later start time.
    assert_eq!(deadlocks[0].victim.as_deref(), Some(id2.as_str()));

    // The coordinator's victim listener rolls it back.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(t2.state(), TransactionState::RolledBack);
    assert_eq!(t1.state(), TransactionState::Active);

    coordinator.rollback(&t1, "test cleanup").await.unwrap();
    db.shutdown().await;
}

#[tokio::test]
async fn test_detector_statistics_flow() {
    let (_dir, db) = setup().await;
    let detector = db.detector().clone();

    detector.register("a", 0);
    detector.register("b", 0);
    detector.add_wait("a", "b", "row-1", "exclusive");
    detector.add_wait("b", "a", "row-2", "exclusive");

    let mut deadlocks = detector.detect();
    assert_eq!(deadlocks.len(), 1);
    detector.resolve(&mut deadlocks[0]);

    let stats = detector.stats();
    assert_eq!(stats.detected, 1);
    assert_eq!(stats.resolved, 1);
    assert_eq!(stats.recent_deadlocks, 1);
    assert!((stats.success_rate - 1.0).abs() < f64::EPSILON);

    detector.unregister("a");
    detector.unregister("b");
    db.shutdown().await;
}

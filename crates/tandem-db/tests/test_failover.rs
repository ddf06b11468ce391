//! Failover behavior across the two backends.
//!
//! The unreachable-PRIMARY tests run self-contained: the primary points at
//! a port nothing listens on. The recovery test against a live PostgreSQL
//! is ignored by default; run it with a DATABASE_URL and `-- --ignored`.

use std::time::Duration;

use tandem_db::{
    BackendConfig, BackendKind, Coordinator, CoordinatorConfig, Params, PoolConfig, TandemError,
};

fn unreachable_primary() -> BackendConfig {
    // Port 1 refuses immediately on loopback.
    BackendConfig::primary_url("postgresql://app@127.0.0.1:1/refused")
}

fn failover_config(dir: &tempfile::TempDir) -> CoordinatorConfig {
    CoordinatorConfig {
        primary: Some(unreachable_primary()),
        local: Some(BackendConfig::local_path(dir.path().join("failover.db"))),
        pool: PoolConfig {
            connection_timeout: Duration::from_millis(300),
            ..Default::default()
        },
        ..Default::default()
    }
}

#[tokio::test]
async fn test_failover_on_primary_outage() {
    let dir = tempfile::tempdir().unwrap();
    let db = Coordinator::new(failover_config(&dir)).await.unwrap();

    // PRIMARY is configured, so it starts as the current backend.
    assert_eq!(db.current_backend(), BackendKind::Primary);
    assert!(!db.has_failover_occurred());

    // The first operation cannot get a PRIMARY connection and lands on
    // LOCAL instead.
    let result = db
        .execute_query("SELECT 1 AS one", &Params::None, None)
        .await
        .unwrap();
    assert!(result.success);
    assert_eq!(result.rows[0].get_i64("one"), Some(1));

    assert_eq!(db.current_backend(), BackendKind::Local);
    assert!(db.has_failover_occurred());

    // PRIMARY is still down, so recovery does not switch back.
    assert!(!db.attempt_primary_recovery().await);
    assert_eq!(db.current_backend(), BackendKind::Local);

    db.reset_failover_status();
    assert!(!db.has_failover_occurred());
    db.shutdown().await;
}

#[tokio::test]
async fn test_operations_stay_on_local_after_failover() {
    let dir = tempfile::tempdir().unwrap();
    let db = Coordinator::new(failover_config(&dir)).await.unwrap();

    db.execute_query("CREATE TABLE t (v TEXT)", &Params::None, None)
        .await
        .unwrap();
    db.execute_query("INSERT INTO t (v) VALUES ('x')", &Params::None, None)
        .await
        .unwrap();

    // Everything after the failover keeps landing on the same backend.
    let rows = db
        .execute_query("SELECT v FROM t", &Params::None, None)
        .await
        .unwrap();
    assert_eq!(rows.rows.len(), 1);
    assert_eq!(db.current_backend(), BackendKind::Local);
    db.shutdown().await;
}

#[tokio::test]
async fn test_force_failover_back_to_dead_primary_fails() {
    let dir = tempfile::tempdir().unwrap();
    let db = Coordinator::new(failover_config(&dir)).await.unwrap();

    db.execute_query("SELECT 1", &Params::None, None)
        .await
        .unwrap();
    assert_eq!(db.current_backend(), BackendKind::Local);

    // Forcing a switch to the dead PRIMARY must not change the backend.
    assert!(!db.force_failover().await);
    assert_eq!(db.current_backend(), BackendKind::Local);
    db.shutdown().await;
}

#[tokio::test]
async fn test_primary_only_outage_has_no_fallback() {
    let config = CoordinatorConfig {
        primary: Some(unreachable_primary()),
        ..Default::default()
    };
    let err = Coordinator::new(config).await.unwrap_err();
    assert!(matches!(err, TandemError::ConnectionFailure { .. }));
}

#[tokio::test]
#[ignore]
async fn test_primary_recovery_with_live_database() {
    // Requires a reachable PostgreSQL; point DATABASE_URL at it.
    let url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| "postgresql://localhost/tandem_test".to_string());
    let dir = tempfile::tempdir().unwrap();

    let config = CoordinatorConfig {
        primary: Some(BackendConfig::primary_url(url)),
        local: Some(BackendConfig::local_path(dir.path().join("local.db"))),
        ..Default::default()
    };
    let db = Coordinator::new(config).await.unwrap();
    assert_eq!(db.current_backend(), BackendKind::Primary);

    // Push the kernel onto LOCAL, then recover.
    assert!(db.force_failover().await);
    assert_eq!(db.current_backend(), BackendKind::Local);
    assert!(db.attempt_primary_recovery().await);
    assert_eq!(db.current_backend(), BackendKind::Primary);
    db.shutdown().await;
}

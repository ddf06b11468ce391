//! Migration apply, rollback, checksum integrity and repair.

use std::sync::Arc;

use tandem_db::migration::{builtin, MigrationRunner, MigrationStatus};
use tandem_db::{
    BackendConfig, Coordinator, CoordinatorConfig, Operation, Params, SqlValue,
};

async fn setup() -> (tempfile::TempDir, Arc<Coordinator>, MigrationRunner) {
    let dir = tempfile::tempdir().unwrap();
    let config = CoordinatorConfig {
        local: Some(BackendConfig::local_path(dir.path().join("migrate.db"))),
        ..Default::default()
    };
    let db = Coordinator::new(config).await.unwrap();
    let runner = MigrationRunner::new(db.clone()).await.unwrap();
    (dir, db, runner)
}

async fn table_exists(db: &Coordinator, table: &str) -> bool {
    let result = db
        .execute_query(
            "SELECT COUNT(*) AS n FROM sqlite_master WHERE type = 'table' AND name = :name",
            &Params::named([("name", SqlValue::from(table))]),
            None,
        )
        .await
        .unwrap();
    result.rows[0].get_i64("n").unwrap_or(0) > 0
}

#[tokio::test]
async fn test_initialize_creates_core_tables() {
    let (_dir, db, runner) = setup().await;

    let outcome = runner.initialize().await;
    assert!(outcome.success, "{:?}", outcome.error);
    assert_eq!(outcome.initial_version, "1.0.0");
    assert_eq!(outcome.tables_created.len(), 8);
    assert_eq!(runner.current_version(), "1.0.0");

    for table in ["tenants", "users", "visual_models", "custom_components"] {
        assert!(table_exists(&db, table).await, "missing table {}", table);
    }
    db.shutdown().await;
}

#[tokio::test]
async fn test_apply_and_rollback_between_versions() {
    let (_dir, db, runner) = setup().await;
    runner.initialize().await;

    // M1 at 1.0.1 creates table x.
    let m1 = runner.create_migration(
        "create_x",
        vec![Operation::ddl("CREATE TABLE x (id TEXT PRIMARY KEY)")],
        vec![Operation::ddl("DROP TABLE IF EXISTS x")],
        vec![],
    );
    let results = runner.apply_pending(None).await;
    assert_eq!(results.len(), 1);
    assert!(results[0].success, "{:?}", results[0].error);
    assert!(table_exists(&db, "x").await);
    assert_eq!(runner.current_version(), "1.0.1");

    // M2 at 1.0.2 creates table y.
    let m2 = runner.create_migration(
        "create_y",
        vec![Operation::ddl("CREATE TABLE y (id TEXT PRIMARY KEY)")],
        vec![Operation::ddl("DROP TABLE IF EXISTS y")],
        vec![],
    );
    let results = runner.apply_pending(None).await;
    assert_eq!(results.len(), 1);
    assert!(results[0].success);
    assert!(table_exists(&db, "y").await);
    assert_eq!(runner.current_version(), "1.0.2");

    // Rolling back to 1.0.1 drops y, keeps x.
    let rollback = runner.rollback_to("1.0.1").await;
    assert!(rollback.success, "{:?}", rollback.error);
    assert!(!table_exists(&db, "y").await);
    assert!(table_exists(&db, "x").await);
    assert_eq!(runner.current_version(), "1.0.1");

    // The journal holds exactly one row per migration with the right state.
    let history = runner.history();
    let m1_rows: Vec<_> = history.iter().filter(|r| r.migration_id == m1).collect();
    assert_eq!(m1_rows.len(), 1);
    assert_eq!(m1_rows[0].status, MigrationStatus::Applied);
    let m2_rows: Vec<_> = history.iter().filter(|r| r.migration_id == m2).collect();
    assert_eq!(m2_rows.len(), 1);
    assert_eq!(m2_rows[0].status, MigrationStatus::RolledBack);
    assert!(m2_rows[0].rolled_back_at.is_some());
    db.shutdown().await;
}

#[tokio::test]
async fn test_rollback_requires_lower_version() {
    let (_dir, db, runner) = setup().await;
    runner.initialize().await;

    let outcome = runner.rollback_to("1.0.0").await;
    assert!(!outcome.success);
    assert!(outcome
        .error
        .as_deref()
        .unwrap()
        .contains("lower than current version"));

    let outcome = runner.rollback_to("2.0.0").await;
    assert!(!outcome.success);
    db.shutdown().await;
}

#[tokio::test]
async fn test_checksum_tamper_fails_validation() {
    let (_dir, db, runner) = setup().await;
    runner.initialize().await;

    let mut migration = tandem_db::migration::Migration::new(
        "tampered",
        "1.0.1",
        "A migration whose checksum no longer matches",
        vec![Operation::ddl("CREATE TABLE z (id TEXT)")],
        vec![],
        vec![],
    );
    migration.checksum = "0".repeat(64);
    runner.register(migration);

    let results = runner.apply_pending(None).await;
    assert_eq!(results.len(), 1);
    assert!(!results[0].success);
    assert!(results[0]
        .error
        .as_deref()
        .unwrap()
        .contains("checksum mismatch"));
    assert!(!table_exists(&db, "z").await);
    db.shutdown().await;
}

#[tokio::test]
async fn test_unresolved_dependency_fails_validation() {
    let (_dir, db, runner) = setup().await;
    runner.initialize().await;

    let migration = tandem_db::migration::Migration::new(
        "needs_missing",
        "1.0.1",
        "Depends on a migration nobody registered",
        vec![Operation::ddl("CREATE TABLE w (id TEXT)")],
        vec![],
        vec!["not-a-real-id".to_string()],
    );
    runner.register(migration);

    let results = runner.apply_pending(None).await;
    assert!(!results[0].success);
    assert!(results[0].error.as_deref().unwrap().contains("missing dependency"));
    db.shutdown().await;
}

#[tokio::test]
async fn test_failed_migration_leaves_no_applied_record() {
    let (_dir, db, runner) = setup().await;
    runner.initialize().await;

    runner.create_migration(
        "broken",
        vec![Operation::ddl("CREATE TABLE oops (definitely not sql")],
        vec![],
        vec![],
    );
    let results = runner.apply_pending(None).await;
    assert!(!results[0].success);

    assert!(runner.history().is_empty());
    assert_eq!(runner.current_version(), "1.0.0");
    db.shutdown().await;
}

#[tokio::test]
async fn test_repair_recreates_missing_records() {
    let (_dir, db, runner) = setup().await;
    runner.initialize().await;

    // A migration marked applied that never made it into the journal.
    let mut migration = tandem_db::migration::Migration::new(
        "ghost",
        "1.0.1",
        "Applied but unjournaled",
        vec![Operation::ddl("CREATE TABLE ghost (id TEXT)")],
        vec![],
        vec![],
    );
    migration.applied_at = Some(chrono::Utc::now());
    let id = runner.register(migration);

    let outcome = runner.repair().await;
    assert!(outcome.success);
    assert!(outcome
        .issues_found
        .iter()
        .any(|i| i.contains("missing migration record")));
    assert_eq!(outcome.repairs_applied.len(), 1);

    let history = runner.history();
    assert!(history.iter().any(|r| r.migration_id == id));
    db.shutdown().await;
}

#[tokio::test]
async fn test_builtin_multi_tenant_pack_applies() {
    let (_dir, db, runner) = setup().await;
    runner.initialize().await;

    runner.register(builtin::multi_tenant_migration(db.current_backend()));
    runner.register(builtin::indexes_migration(db.current_backend()));
    let results = runner.apply_pending(None).await;
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|r| r.success));

    assert!(table_exists(&db, "user_tenant_assignments").await);
    assert!(table_exists(&db, "tenant_configurations").await);
    assert!(table_exists(&db, "cross_tenant_access_logs").await);
    assert_eq!(runner.current_version(), "1.1.0");
    db.shutdown().await;
}

#[tokio::test]
async fn test_next_version_generation() {
    let (_dir, db, runner) = setup().await;
    assert_eq!(runner.current_version(), "0.0.0");
    assert_eq!(runner.next_version(), "0.0.1");
    runner.initialize().await;
    assert_eq!(runner.next_version(), "1.0.1");
    db.shutdown().await;
}

//! Tenant isolation: scoping, cross-tenant denial and violation journaling.

use std::sync::Arc;

use tandem_db::migration::{builtin, MigrationRunner};
use tandem_db::tenant::{TenantAccessController, TenantInfo, TenantStatus};
use tandem_db::{
    BackendConfig, Coordinator, CoordinatorConfig, Operation, Params, SqlValue, TandemError,
};

struct Fixture {
    _dir: tempfile::TempDir,
    db: Arc<Coordinator>,
    controller: Arc<TenantAccessController>,
    tenant_a: String,
    tenant_b: String,
    user_a: String,
}

async fn setup() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let config = CoordinatorConfig {
        local: Some(BackendConfig::local_path(dir.path().join("tenants.db"))),
        ..Default::default()
    };
    let db = Coordinator::new(config).await.unwrap();

    let runner = MigrationRunner::new(db.clone()).await.unwrap();
    assert!(runner.initialize().await.success);
    runner.register(builtin::multi_tenant_migration(db.current_backend()));
    assert!(runner
        .apply_pending(None)
        .await
        .iter()
        .all(|r| r.success));

    let controller = TenantAccessController::new(db.clone());
    let tenant_a = controller
        .create_tenant(TenantInfo::new("Tenant A", "a.example"))
        .await
        .unwrap();
    let tenant_b = controller
        .create_tenant(TenantInfo::new("Tenant B", "b.example"))
        .await
        .unwrap();

    // Users satisfy the foreign keys on assignments and models.
    let user_a = insert_user(&db, &tenant_a, "alice").await;
    let user_b = insert_user(&db, &tenant_b, "bob").await;
    controller.assign_user(&user_a, &tenant_a).await.unwrap();

    // One model owned by tenant B.
    let model = Operation::insert(
        "visual_models",
        [
            ("id", SqlValue::from("model-b")),
            ("tenant_id", SqlValue::Text(tenant_b.clone())),
            ("owner_id", SqlValue::Text(user_b)),
            ("name", SqlValue::from("b-flow")),
            ("model_data", SqlValue::from("{}")),
        ],
    );
    assert!(db.execute_transaction(vec![model], None).await.unwrap().success);

    Fixture {
        _dir: dir,
        db,
        controller,
        tenant_a,
        tenant_b,
        user_a,
    }
}

async fn insert_user(db: &Coordinator, tenant_id: &str, name: &str) -> String {
    let id = uuid::Uuid::new_v4().to_string();
    let op = Operation::insert(
        "users",
        [
            ("id", SqlValue::Text(id.clone())),
            ("tenant_id", SqlValue::Text(tenant_id.to_string())),
            ("username", SqlValue::from(name)),
            ("email", SqlValue::Text(format!("{}@example.com", name))),
            ("password_hash", SqlValue::from("x")),
        ],
    );
    assert!(db.execute_transaction(vec![op], None).await.unwrap().success);
    id
}

#[tokio::test]
async fn test_cross_tenant_read_is_blocked_and_journaled() {
    let fx = setup().await;

    // The row belongs to tenant B; the caller acts for tenant A.
    let result = fx
        .db
        .execute_query(
            "SELECT * FROM visual_models WHERE id = 'model-b'",
            &Params::None,
            None,
        )
        .await
        .unwrap();
    let row = &result.rows[0];

    let err = fx
        .controller
        .check_row_tenant(&fx.user_a, &fx.tenant_a, row)
        .await
        .unwrap_err();
    assert!(matches!(err, TandemError::IsolationViolation(_)));

    let summary = fx.controller.violation_summary(None).await.unwrap();
    assert_eq!(summary.total_violations, 1);
    assert_eq!(summary.blocked_violations, 1);
    assert_eq!(summary.by_kind.get("cross_tenant_access"), Some(&1));

    fx.controller.shutdown().await;
    fx.db.shutdown().await;
}

#[tokio::test]
async fn test_tenant_scoped_queries_see_only_their_rows() {
    let fx = setup().await;

    let scoped = fx
        .controller
        .with_tenant(&fx.user_a, &fx.tenant_a, |scope| async move {
            scope
                .execute_query("SELECT * FROM visual_models", &Params::None)
                .await
        })
        .await
        .unwrap();
    assert!(scoped.success);
    // Tenant B's model is invisible inside tenant A's scope.
    assert!(scoped.rows.is_empty());

    fx.controller.shutdown().await;
    fx.db.shutdown().await;
}

#[tokio::test]
async fn test_unassigned_user_is_denied_scope() {
    let fx = setup().await;

    let err = fx
        .controller
        .with_tenant(&fx.user_a, &fx.tenant_b, |_scope| async move {
            Ok::<(), TandemError>(())
        })
        .await
        .unwrap_err();
    assert!(matches!(err, TandemError::TenantAccessDenied { .. }));

    let summary = fx.controller.violation_summary(None).await.unwrap();
    assert_eq!(summary.by_kind.get("permission_denied"), Some(&1));

    fx.controller.shutdown().await;
    fx.db.shutdown().await;
}

#[tokio::test]
async fn test_cross_tenant_reference_in_data_is_denied() {
    let fx = setup().await;

    let mut data = std::collections::BTreeMap::new();
    data.insert(
        "tenant_id".to_string(),
        SqlValue::Text(fx.tenant_b.clone()),
    );

    let err = fx
        .controller
        .validate_access(&fx.user_a, &fx.tenant_a, "write", "visual_model", Some(&data))
        .await
        .unwrap_err();
    assert!(matches!(err, TandemError::IsolationViolation(_)));

    let summary = fx.controller.violation_summary(None).await.unwrap();
    assert_eq!(summary.by_kind.get("data_breach_attempt"), Some(&1));

    fx.controller.shutdown().await;
    fx.db.shutdown().await;
}

#[tokio::test]
async fn test_foreign_uuid_reference_is_denied() {
    let fx = setup().await;

    let mut data = std::collections::BTreeMap::new();
    data.insert(
        "parent_id".to_string(),
        SqlValue::Text(fx.tenant_b.clone()),
    );

    let err = fx
        .controller
        .validate_access(&fx.user_a, &fx.tenant_a, "write", "visual_model", Some(&data))
        .await
        .unwrap_err();
    assert!(matches!(err, TandemError::IsolationViolation(_)));

    fx.controller.shutdown().await;
    fx.db.shutdown().await;
}

#[tokio::test]
async fn test_query_safety_checks() {
    let fx = setup().await;

    let violations = fx
        .controller
        .check_query_safety("DROP TABLE visual_models", &fx.tenant_a);
    assert!(!violations.is_empty());

    let violations = fx.controller.check_query_safety(
        &format!(
            "SELECT * FROM visual_models WHERE tenant_id = '{}'",
            fx.tenant_b
        ),
        &fx.tenant_a,
    );
    assert!(!violations.is_empty());

    fx.controller.shutdown().await;
    fx.db.shutdown().await;
}

#[tokio::test]
async fn test_tenant_registry_lifecycle() {
    let fx = setup().await;

    let tenant = fx.controller.get_tenant(&fx.tenant_a).await.unwrap().unwrap();
    assert_eq!(tenant.name, "Tenant A");
    assert_eq!(tenant.status, TenantStatus::Active);

    let active = fx
        .controller
        .list_tenants(Some(TenantStatus::Active))
        .await
        .unwrap();
    assert_eq!(active.len(), 2);

    // Duplicate domains are rejected.
    let err = fx
        .controller
        .create_tenant(TenantInfo::new("Clone", "a.example"))
        .await
        .unwrap_err();
    assert!(matches!(err, TandemError::ValidationFailure(_)));

    assert!(fx.controller.delete_tenant(&fx.tenant_b).await.unwrap());
    let deleted = fx.controller.get_tenant(&fx.tenant_b).await.unwrap().unwrap();
    assert_eq!(deleted.status, TenantStatus::Deleted);

    fx.controller.shutdown().await;
    fx.db.shutdown().await;
}

#[tokio::test]
async fn test_tenant_export_format() {
    let fx = setup().await;

    let export = fx.controller.export_tenant(&fx.tenant_b).await.unwrap();
    assert_eq!(export["tenant_info"]["domain"], "b.example");
    assert_eq!(export["visual_models"].as_array().unwrap().len(), 1);
    assert_eq!(
        export["visual_models"][0]["name"],
        serde_json::json!("b-flow")
    );
    assert!(export["custom_components"].as_array().unwrap().is_empty());
    assert_eq!(export["export_metadata"]["version"], "1.0");
    assert_eq!(export["export_metadata"]["tenant_id"], fx.tenant_b.as_str());
    assert!(export["export_metadata"]["export_time"].is_string());

    fx.controller.shutdown().await;
    fx.db.shutdown().await;
}

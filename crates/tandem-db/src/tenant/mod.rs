//! Multi-tenant access control.
//!
//! The controller rewrites queries for tenant scoping, validates
//! user→tenant operations, installs database-level guards on tenant
//! creation and journals every denial as an access violation. Permissions
//! stay opaque `resource:operation` strings; producing user identities is
//! someone else's job.

pub mod constraints;
pub mod scoping;
pub mod violations;

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use tandem_common::{Result, TandemError};

use crate::coordinator::Coordinator;
use crate::types::{Operation, Params, QueryResult, Row, SqlValue, TransactionResult};

pub use constraints::ConstraintEnforcer;
pub use violations::{AccessViolation, Severity, ViolationKind, ViolationMonitor, ViolationSummary};

/// Tenant lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TenantStatus {
    Active,
    Suspended,
    Deleted,
}

impl TenantStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TenantStatus::Active => "active",
            TenantStatus::Suspended => "suspended",
            TenantStatus::Deleted => "deleted",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "suspended" => TenantStatus::Suspended,
            "deleted" => TenantStatus::Deleted,
            _ => TenantStatus::Active,
        }
    }
}

/// A tenant record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantInfo {
    pub id: String,
    pub name: String,
    /// Unique across tenants.
    pub domain: String,
    pub status: TenantStatus,
    pub configuration: serde_json::Value,
    pub resource_limits: serde_json::Value,
    pub billing_info: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TenantInfo {
    pub fn new(name: impl Into<String>, domain: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            domain: domain.into(),
            status: TenantStatus::Active,
            configuration: serde_json::json!({}),
            resource_limits: serde_json::json!({}),
            billing_info: serde_json::json!({}),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.name.is_empty() {
            errors.push("tenant name is required".to_string());
        }
        if self.domain.is_empty() {
            errors.push("tenant domain is required".to_string());
        }
        errors
    }

    fn from_row(row: &Row) -> Self {
        let json_field = |name: &str| {
            row.get_str(name)
                .and_then(|s| serde_json::from_str(s).ok())
                .unwrap_or_else(|| serde_json::json!({}))
        };
        Self {
            id: row.get_str("id").unwrap_or_default().to_string(),
            name: row.get_str("name").unwrap_or_default().to_string(),
            domain: row.get_str("domain").unwrap_or_default().to_string(),
            status: TenantStatus::parse(row.get_str("status").unwrap_or("active")),
            configuration: json_field("configuration"),
            resource_limits: json_field("resource_limits"),
            billing_info: json_field("billing_info"),
            created_at: row
                .get_str("created_at")
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|t| t.with_timezone(&Utc))
                .unwrap_or_else(Utc::now),
            updated_at: row
                .get_str("updated_at")
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|t| t.with_timezone(&Utc))
                .unwrap_or_else(Utc::now),
        }
    }
}

/// A tenant-bound operation scope: everything executed through it carries
/// the tenant id implicitly.
#[derive(Clone)]
pub struct TenantScope {
    db: Arc<Coordinator>,
    user_id: String,
    tenant_id: String,
}

impl TenantScope {
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub async fn execute_query(&self, query: &str, params: &Params) -> Result<QueryResult> {
        self.db
            .execute_query(query, params, Some(&self.tenant_id))
            .await
    }

    pub async fn execute_transaction(&self, operations: Vec<Operation>) -> Result<TransactionResult> {
        self.db
            .execute_transaction(operations, Some(&self.tenant_id))
            .await
    }

    pub async fn store_json(&self, table: &str, data: &serde_json::Value) -> Result<String> {
        self.db.store_json(table, data, Some(&self.tenant_id)).await
    }
}

/// Main controller for tenant access control.
pub struct TenantAccessController {
    db: Arc<Coordinator>,
    enforcer: ConstraintEnforcer,
    violations: Arc<ViolationMonitor>,
}

impl TenantAccessController {
    /// Builds the controller and starts violation monitoring.
    pub fn new(db: Arc<Coordinator>) -> Arc<Self> {
        let violations = ViolationMonitor::new(db.clone());
        violations.start();
        info!("tenant access controller initialized");
        Arc::new(Self {
            enforcer: ConstraintEnforcer::new(db.clone()),
            violations,
            db,
        })
    }

    pub fn violations(&self) -> &Arc<ViolationMonitor> {
        &self.violations
    }

    /// Creates a tenant, installs its database-level guards and seeds a
    /// default configuration row. The domain must be unique.
    pub async fn create_tenant(&self, tenant: TenantInfo) -> Result<String> {
        let errors = tenant.validate();
        if !errors.is_empty() {
            return Err(TandemError::ValidationFailure(errors.join(", ")));
        }

        let existing = self
            .db
            .execute_query(
                "SELECT COUNT(*) AS n FROM tenants WHERE domain = :domain",
                &Params::named([("domain", SqlValue::Text(tenant.domain.clone()))]),
                None,
            )
            .await?;
        if existing.success && existing.rows.first().and_then(|r| r.get_i64("n")).unwrap_or(0) > 0 {
            return Err(TandemError::ValidationFailure(format!(
                "tenant domain '{}' already exists",
                tenant.domain
            )));
        }

        let insert = Operation::insert(
            "tenants",
            [
                ("id", SqlValue::Text(tenant.id.clone())),
                ("name", SqlValue::Text(tenant.name.clone())),
                ("domain", SqlValue::Text(tenant.domain.clone())),
                (
                    "status",
                    SqlValue::Text(tenant.status.as_str().to_string()),
                ),
                (
                    "configuration",
                    SqlValue::Text(tenant.configuration.to_string()),
                ),
                (
                    "resource_limits",
                    SqlValue::Text(tenant.resource_limits.to_string()),
                ),
                (
                    "billing_info",
                    SqlValue::Text(tenant.billing_info.to_string()),
                ),
                (
                    "created_at",
                    SqlValue::Text(tenant.created_at.to_rfc3339()),
                ),
                (
                    "updated_at",
                    SqlValue::Text(tenant.updated_at.to_rfc3339()),
                ),
            ],
        );
        let result = self.db.execute_transaction(vec![insert], None).await?;
        if !result.success {
            return Err(TandemError::Query(format!(
                "failed to create tenant: {}",
                result.error.unwrap_or_default()
            )));
        }

        match self.enforcer.install(&tenant.id).await {
            Ok(true) => {}
            Ok(false) => warn!(tenant_id = %tenant.id, "tenant constraints partially installed"),
            Err(e) => warn!(tenant_id = %tenant.id, error = %e, "tenant constraint installation failed"),
        }

        let config_row = Operation::insert(
            "tenant_configurations",
            [
                ("id", SqlValue::Text(Uuid::new_v4().to_string())),
                ("tenant_id", SqlValue::Text(tenant.id.clone())),
                ("settings", SqlValue::Text("{}".to_string())),
                ("feature_flags", SqlValue::Text("{}".to_string())),
                ("resource_limits", SqlValue::Text("{}".to_string())),
            ],
        );
        if let Ok(result) = self.db.execute_transaction(vec![config_row], None).await {
            if !result.success {
                warn!(tenant_id = %tenant.id, "default tenant configuration row not created");
            }
        }

        info!(tenant_id = %tenant.id, domain = %tenant.domain, "tenant created");
        Ok(tenant.id)
    }

    pub async fn get_tenant(&self, tenant_id: &str) -> Result<Option<TenantInfo>> {
        let result = self
            .db
            .execute_query(
                "SELECT * FROM tenants WHERE id = :id",
                &Params::named([("id", SqlValue::Text(tenant_id.to_string()))]),
                None,
            )
            .await?;
        if !result.success {
            return Err(TandemError::Query(
                result.error.unwrap_or_else(|| "tenant lookup failed".into()),
            ));
        }
        Ok(result.rows.first().map(TenantInfo::from_row))
    }

    pub async fn list_tenants(&self, status: Option<TenantStatus>) -> Result<Vec<TenantInfo>> {
        let (query, params) = match status {
            Some(status) => (
                "SELECT * FROM tenants WHERE status = :status ORDER BY name".to_string(),
                Params::named([("status", SqlValue::Text(status.as_str().to_string()))]),
            ),
            None => (
                "SELECT * FROM tenants ORDER BY name".to_string(),
                Params::None,
            ),
        };
        let result = self.db.execute_query(&query, &params, None).await?;
        if !result.success {
            return Err(TandemError::Query(
                result.error.unwrap_or_else(|| "tenant listing failed".into()),
            ));
        }
        Ok(result.rows.iter().map(TenantInfo::from_row).collect())
    }

    /// Soft-deletes a tenant by marking it `deleted`.
    pub async fn delete_tenant(&self, tenant_id: &str) -> Result<bool> {
        let update = Operation::update(
            "tenants",
            [
                (
                    "status",
                    SqlValue::Text(TenantStatus::Deleted.as_str().to_string()),
                ),
                ("updated_at", SqlValue::Text(Utc::now().to_rfc3339())),
            ],
            [("id", SqlValue::Text(tenant_id.to_string()))],
        );
        let result = self.db.execute_transaction(vec![update], None).await?;
        Ok(result.success)
    }

    /// Assigns a user to a tenant with an active status.
    pub async fn assign_user(&self, user_id: &str, tenant_id: &str) -> Result<()> {
        let insert = Operation::insert(
            "user_tenant_assignments",
            [
                ("id", SqlValue::Text(Uuid::new_v4().to_string())),
                ("user_id", SqlValue::Text(user_id.to_string())),
                ("tenant_id", SqlValue::Text(tenant_id.to_string())),
                ("status", SqlValue::Text("active".to_string())),
                ("assigned_at", SqlValue::Text(Utc::now().to_rfc3339())),
            ],
        );
        let result = self.db.execute_transaction(vec![insert], None).await?;
        if !result.success {
            return Err(TandemError::Query(format!(
                "failed to assign user to tenant: {}",
                result.error.unwrap_or_default()
            )));
        }
        Ok(())
    }

    /// Whether the user has an active assignment to the tenant.
    pub async fn validate_user_access(&self, user_id: &str, tenant_id: &str) -> Result<bool> {
        let result = self
            .db
            .execute_query(
                "SELECT COUNT(*) AS n FROM user_tenant_assignments \
                 WHERE user_id = :user_id AND tenant_id = :tenant_id AND status = 'active'",
                &Params::named([
                    ("user_id", SqlValue::Text(user_id.to_string())),
                    ("tenant_id", SqlValue::Text(tenant_id.to_string())),
                ]),
                None,
            )
            .await?;
        Ok(result.success
            && result.rows.first().and_then(|r| r.get_i64("n")).unwrap_or(0) > 0)
    }

    /// Full access validation for an operation: user→tenant assignment plus
    /// cross-tenant checks over the payload. Every denial journals a
    /// violation before the error surfaces.
    pub async fn validate_access(
        &self,
        user_id: &str,
        tenant_id: &str,
        operation: &str,
        resource_type: &str,
        data: Option<&BTreeMap<String, SqlValue>>,
    ) -> Result<()> {
        if !self.validate_user_access(user_id, tenant_id).await? {
            let violation = AccessViolation::new(
                user_id,
                tenant_id,
                tenant_id,
                ViolationKind::PermissionDenied,
                Severity::Medium,
                serde_json::json!({
                    "operation": operation,
                    "resource_type": resource_type,
                }),
            );
            self.violations.log_violation(&violation).await?;
            return Err(TandemError::TenantAccessDenied {
                tenant_id: tenant_id.to_string(),
                user_id: user_id.to_string(),
                message: format!("no active assignment for operation {}", operation),
            });
        }

        if let Some(data) = data {
            let problems = self.data_violations(tenant_id, data);
            if !problems.is_empty() {
                let violation = AccessViolation::new(
                    user_id,
                    tenant_id,
                    tenant_id,
                    ViolationKind::DataBreachAttempt,
                    Severity::High,
                    serde_json::json!({
                        "operation": operation,
                        "violations": problems,
                    }),
                );
                self.violations.log_violation(&violation).await?;
                return Err(TandemError::IsolationViolation(problems.join("; ")));
            }
        }

        Ok(())
    }

    /// Validates that a row read on behalf of a tenant actually belongs to
    /// it. A mismatch journals a blocked violation and surfaces as an
    /// isolation error.
    pub async fn check_row_tenant(
        &self,
        user_id: &str,
        tenant_id: &str,
        row: &Row,
    ) -> Result<()> {
        let row_tenant = row.get_str("tenant_id").unwrap_or_default();
        if row_tenant.is_empty() || row_tenant == tenant_id {
            return Ok(());
        }

        let violation = AccessViolation::new(
            user_id,
            row_tenant,
            tenant_id,
            ViolationKind::CrossTenantAccess,
            Severity::High,
            serde_json::json!({ "row_tenant": row_tenant }),
        );
        self.violations.log_violation(&violation).await?;
        Err(TandemError::IsolationViolation(format!(
            "row belongs to tenant {}, not {}",
            row_tenant, tenant_id
        )))
    }

    /// Query-safety violations for a tenant-scoped query.
    pub fn check_query_safety(&self, query: &str, tenant_id: &str) -> Vec<String> {
        scoping::query_safety_violations(query, tenant_id)
    }

    /// Validates the user→tenant assignment and runs the closure inside a
    /// scope that carries the tenant id implicitly.
    pub async fn with_tenant<F, Fut, T>(&self, user_id: &str, tenant_id: &str, f: F) -> Result<T>
    where
        F: FnOnce(TenantScope) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if !self.validate_user_access(user_id, tenant_id).await? {
            let violation = AccessViolation::new(
                user_id,
                tenant_id,
                tenant_id,
                ViolationKind::PermissionDenied,
                Severity::Medium,
                serde_json::json!({ "operation": "tenant_context" }),
            );
            self.violations.log_violation(&violation).await?;
            return Err(TandemError::TenantAccessDenied {
                tenant_id: tenant_id.to_string(),
                user_id: user_id.to_string(),
                message: "user is not assigned to tenant".to_string(),
            });
        }

        let scope = TenantScope {
            db: self.db.clone(),
            user_id: user_id.to_string(),
            tenant_id: tenant_id.to_string(),
        };
        f(scope).await
    }

    /// Exports a tenant's data as a JSON document. Row values pass through
    /// as-is; tables that do not exist export as empty collections.
    pub async fn export_tenant(&self, tenant_id: &str) -> Result<serde_json::Value> {
        let tenant = self.get_tenant(tenant_id).await?.ok_or_else(|| {
            TandemError::ValidationFailure(format!("tenant {} not found", tenant_id))
        })?;

        let fetch = |query: String| {
            let db = self.db.clone();
            let tenant = tenant_id.to_string();
            async move {
                let params = Params::named([("tenant_id", SqlValue::Text(tenant))]);
                match db.execute_query(&query, &params, None).await {
                    Ok(result) if result.success => {
                        result.rows.iter().map(Row::to_json).collect::<Vec<_>>()
                    }
                    _ => Vec::new(),
                }
            }
        };

        let visual_models = fetch(
            "SELECT * FROM visual_models WHERE tenant_id = :tenant_id".to_string(),
        )
        .await;
        let custom_components = fetch(
            "SELECT * FROM custom_components WHERE tenant_id = :tenant_id".to_string(),
        )
        .await;
        let execution_history = fetch(
            "SELECT * FROM execution_history WHERE tenant_id = :tenant_id \
             ORDER BY start_time DESC LIMIT 1000"
                .to_string(),
        )
        .await;

        let configurations = {
            let params = Params::named([("tenant_id", SqlValue::Text(tenant_id.to_string()))]);
            match self
                .db
                .execute_query(
                    "SELECT * FROM tenant_configurations WHERE tenant_id = :tenant_id",
                    &params,
                    None,
                )
                .await
            {
                Ok(result) if result.success => result
                    .rows
                    .first()
                    .map(Row::to_json)
                    .unwrap_or_else(|| serde_json::json!({})),
                _ => serde_json::json!({}),
            }
        };

        Ok(serde_json::json!({
            "tenant_info": {
                "name": tenant.name,
                "domain": tenant.domain,
                "status": tenant.status.as_str(),
                "configuration": tenant.configuration,
                "resource_limits": tenant.resource_limits,
                "billing_info": tenant.billing_info,
            },
            "visual_models": visual_models,
            "custom_components": custom_components,
            "execution_history": execution_history,
            "configurations": configurations,
            "export_metadata": {
                "export_time": Utc::now().to_rfc3339(),
                "tenant_id": tenant_id,
                "version": "1.0",
            },
        }))
    }

    pub async fn violation_summary(&self, tenant_id: Option<&str>) -> Result<ViolationSummary> {
        self.violations.summary(tenant_id).await
    }

    pub async fn shutdown(&self) {
        self.violations.stop().await;
        info!("tenant access controller shut down");
    }

    /// Cross-tenant checks over an operation payload: a mismatched
    /// `tenant_id` field, or a UUID-shaped value in a `*_id` field that
    /// belongs to a different tenant. Cross-tenant references have no
    /// permission path; they always violate.
    fn data_violations(&self, tenant_id: &str, data: &BTreeMap<String, SqlValue>) -> Vec<String> {
        let mut violations = Vec::new();

        if let Some(SqlValue::Text(data_tenant)) = data.get("tenant_id") {
            if data_tenant != tenant_id {
                violations.push(format!(
                    "data belongs to tenant {}, not {}",
                    data_tenant, tenant_id
                ));
            }
        }

        for (key, value) in data {
            if key == "tenant_id" || !key.ends_with("_id") {
                continue;
            }
            if let SqlValue::Text(text) = value {
                if scoping::looks_like_uuid(text) && text != tenant_id {
                    violations.push(format!(
                        "unauthorized reference to tenant {} in field {}",
                        text, key
                    ));
                }
            }
        }

        violations
    }
}

impl std::fmt::Debug for TenantAccessController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantAccessController").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tenant_info_validate() {
        let good = TenantInfo::new("Acme", "acme.example");
        assert!(good.validate().is_empty());

        let bad = TenantInfo::new("", "");
        let errors = bad.validate();
        assert_eq!(errors.len(), 2);
    }

    #[test]
    fn test_tenant_status_parse() {
        assert_eq!(TenantStatus::parse("active"), TenantStatus::Active);
        assert_eq!(TenantStatus::parse("suspended"), TenantStatus::Suspended);
        assert_eq!(TenantStatus::parse("deleted"), TenantStatus::Deleted);
        assert_eq!(TenantStatus::parse("other"), TenantStatus::Active);
    }

    #[test]
    fn test_tenant_info_from_row() {
        let row = Row::new(
            vec![
                "id".into(),
                "name".into(),
                "domain".into(),
                "status".into(),
                "configuration".into(),
            ],
            vec![
                SqlValue::Text("t-1".into()),
                SqlValue::Text("Acme".into()),
                SqlValue::Text("acme.example".into()),
                SqlValue::Text("suspended".into()),
                SqlValue::Text("{\"plan\": \"pro\"}".into()),
            ],
        );
        let tenant = TenantInfo::from_row(&row);
        assert_eq!(tenant.id, "t-1");
        assert_eq!(tenant.status, TenantStatus::Suspended);
        assert_eq!(tenant.configuration["plan"], serde_json::json!("pro"));
        assert_eq!(tenant.resource_limits, serde_json::json!({}));
    }
}

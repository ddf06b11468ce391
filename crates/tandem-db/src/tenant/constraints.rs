//! Database-level tenant isolation guards.
//!
//! On PRIMARY, row-level security with a policy comparing `tenant_id`
//! against the `app.current_tenant_id` session variable. On LOCAL, which
//! has no row-level security, BEFORE INSERT and BEFORE UPDATE triggers that
//! abort on a tenant mismatch.

use std::sync::Arc;

use tracing::info;

use tandem_common::Result;

use crate::coordinator::Coordinator;
use crate::tenant::scoping::TENANT_AWARE_TABLES;
use crate::types::{BackendKind, Operation};

/// Installs per-backend tenant guards.
pub struct ConstraintEnforcer {
    db: Arc<Coordinator>,
}

impl ConstraintEnforcer {
    pub fn new(db: Arc<Coordinator>) -> Self {
        Self { db }
    }

    /// Installs the guards for a tenant on the current backend. Returns an
    /// error when the constraint transaction fails.
    pub async fn install(&self, tenant_id: &str) -> Result<bool> {
        let operations = match self.db.current_backend() {
            BackendKind::Primary => Self::primary_operations(),
            BackendKind::Local => Self::local_operations(tenant_id),
        };

        let result = self.db.execute_transaction(operations, None).await?;
        if result.success {
            info!(tenant_id = %tenant_id, "tenant constraints installed");
        }
        Ok(result.success)
    }

    /// Row-level security plus an isolation policy per tenant-aware table.
    fn primary_operations() -> Vec<Operation> {
        let mut operations = Vec::new();
        for table in TENANT_AWARE_TABLES {
            operations.push(Operation::ddl(format!(
                "ALTER TABLE {} ENABLE ROW LEVEL SECURITY",
                table
            )));
            operations.push(Operation::ddl(format!(
                "CREATE POLICY {}_tenant_isolation ON {} \
                 USING (tenant_id = current_setting('app.current_tenant_id')) \
                 WITH CHECK (tenant_id = current_setting('app.current_tenant_id'))",
                table, table
            )));
        }
        operations
    }

    /// BEFORE INSERT / BEFORE UPDATE abort triggers per tenant-aware table.
    fn local_operations(tenant_id: &str) -> Vec<Operation> {
        let mut operations = Vec::new();
        for table in TENANT_AWARE_TABLES {
            operations.push(Operation::ddl(format!(
                "CREATE TRIGGER IF NOT EXISTS {table}_tenant_insert_check \
                 BEFORE INSERT ON {table} \
                 FOR EACH ROW \
                 WHEN NEW.tenant_id != '{tenant}' \
                 BEGIN \
                     SELECT RAISE(ABORT, 'Cross-tenant access denied'); \
                 END",
                table = table,
                tenant = tenant_id
            )));
            operations.push(Operation::ddl(format!(
                "CREATE TRIGGER IF NOT EXISTS {table}_tenant_update_check \
                 BEFORE UPDATE ON {table} \
                 FOR EACH ROW \
                 WHEN OLD.tenant_id != '{tenant}' OR NEW.tenant_id != '{tenant}' \
                 BEGIN \
                     SELECT RAISE(ABORT, 'Cross-tenant access denied'); \
                 END",
                table = table,
                tenant = tenant_id
            )));
        }
        operations
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primary_operations_cover_every_table() {
        let operations = ConstraintEnforcer::primary_operations();
        // One RLS toggle plus one policy per table.
        assert_eq!(operations.len(), TENANT_AWARE_TABLES.len() * 2);
        assert!(operations[0]
            .raw_query
            .as_deref()
            .unwrap()
            .contains("ENABLE ROW LEVEL SECURITY"));
        assert!(operations[1]
            .raw_query
            .as_deref()
            .unwrap()
            .contains("current_setting('app.current_tenant_id')"));
    }

    #[test]
    fn test_local_operations_are_abort_triggers() {
        let operations = ConstraintEnforcer::local_operations("tenant-1");
        assert_eq!(operations.len(), TENANT_AWARE_TABLES.len() * 2);
        let first = operations[0].raw_query.as_deref().unwrap();
        assert!(first.contains("BEFORE INSERT"));
        assert!(first.contains("RAISE(ABORT, 'Cross-tenant access denied')"));
        assert!(first.contains("!= 'tenant-1'"));
        let second = operations[1].raw_query.as_deref().unwrap();
        assert!(second.contains("BEFORE UPDATE"));
    }
}

//! Query rewriting and operation scoping for tenant isolation.
//!
//! Rewriting is a case-insensitive substring/regex heuristic over the SQL
//! text, not a parser. That is a known approximation: it covers the query
//! shapes the kernel itself produces, and the database-level constraints
//! (row-level security / triggers) back it up.

use once_cell::sync::Lazy;
use regex::Regex;

use tandem_common::{Result, TandemError};

use crate::types::{Operation, SqlValue};

/// Closed whitelist of tables whose rows carry a `tenant_id` column and
/// require tenant scoping on every access.
pub const TENANT_AWARE_TABLES: [&str; 10] = [
    "visual_models",
    "custom_components",
    "execution_history",
    "audit_logs",
    "user_sessions",
    "configurations",
    "patterns",
    "capability_assessments",
    "enhancements",
    "learning_metrics",
];

static UUID_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-fA-F0-9]{8}-[a-fA-F0-9]{4}-[a-fA-F0-9]{4}-[a-fA-F0-9]{4}-[a-fA-F0-9]{12}$")
        .expect("uuid regex")
});

static QUOTED_ID_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"['"]([a-fA-F0-9]{8}-[a-fA-F0-9]{4}-[a-fA-F0-9]{4}-[a-fA-F0-9]{4}-[a-fA-F0-9]{12})['"]"#)
        .expect("quoted id regex")
});

static TRUNCATE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bTRUNCATE\s+TABLE\b").expect("truncate regex"));
static DROP_TABLE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bDROP\s+TABLE\b").expect("drop table regex"));
static DELETE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\s*DELETE\s+FROM\b").expect("delete regex"));
static UPDATE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\s*UPDATE\b").expect("update regex"));

/// Whether the table requires tenant scoping.
pub fn is_tenant_aware(table: &str) -> bool {
    TENANT_AWARE_TABLES.contains(&table)
}

fn touches_tenant_table(query: &str) -> bool {
    let upper = query.to_uppercase();
    TENANT_AWARE_TABLES
        .iter()
        .any(|t| upper.contains(&t.to_uppercase()))
}

/// Rewrites a query to scope it to a tenant: appends
/// `tenant_id = '<tenant>'` to the WHERE clause of queries touching a
/// tenant-aware table, inserting the clause before ORDER BY / GROUP BY /
/// LIMIT when there is no WHERE yet. Other queries pass through untouched.
pub fn scope_query(query: &str, tenant_id: &str) -> Result<String> {
    if tenant_id.is_empty() {
        return Err(TandemError::IsolationViolation(
            "tenant id is required for tenant-aware operations".to_string(),
        ));
    }

    if !touches_tenant_table(query) {
        return Ok(query.to_string());
    }

    let upper = query.to_uppercase();
    let clause = format!("tenant_id = '{}'", tenant_id);

    if upper.contains("WHERE") {
        return Ok(format!("{} AND {}", query, clause));
    }

    for keyword in ["ORDER BY", "GROUP BY", "LIMIT"] {
        if let Some(position) = upper.find(keyword) {
            return Ok(format!(
                "{} WHERE {} {}",
                query[..position].trim_end(),
                clause,
                &query[position..]
            ));
        }
    }

    Ok(format!("{} WHERE {}", query, clause))
}

/// Injects the tenant id into the data and conditions of every operation
/// touching a tenant-aware table. Other operations pass through unchanged.
pub fn scope_operations(operations: Vec<Operation>, tenant_id: &str) -> Vec<Operation> {
    operations
        .into_iter()
        .map(|mut op| {
            if is_tenant_aware(&op.table) {
                op.data
                    .insert("tenant_id".to_string(), SqlValue::Text(tenant_id.to_string()));
                op.conditions
                    .insert("tenant_id".to_string(), SqlValue::Text(tenant_id.to_string()));
            }
            op
        })
        .collect()
}

/// Checks a query for tenant-safety violations: embedded ids scoped to a
/// different tenant, and dangerous patterns (TRUNCATE, DROP TABLE,
/// DELETE/UPDATE without a tenant_id predicate).
pub fn query_safety_violations(query: &str, tenant_id: &str) -> Vec<String> {
    let mut violations = Vec::new();
    let upper = query.to_uppercase();

    if upper.contains("TENANT_ID") {
        for capture in QUOTED_ID_RE.captures_iter(query) {
            let embedded = &capture[1];
            if !embedded.eq_ignore_ascii_case(tenant_id) {
                violations.push(format!(
                    "attempt to access tenant {} from tenant {}",
                    embedded, tenant_id
                ));
            }
        }
    }

    if TRUNCATE_RE.is_match(query) {
        violations.push("dangerous operation: TRUNCATE TABLE".to_string());
    }
    if DROP_TABLE_RE.is_match(query) {
        violations.push("dangerous operation: DROP TABLE".to_string());
    }
    if DELETE_RE.is_match(query) && !upper.contains("TENANT_ID") {
        violations.push("DELETE without a tenant_id predicate".to_string());
    }
    if UPDATE_RE.is_match(query) && !upper.contains("TENANT_ID") {
        violations.push("UPDATE without a tenant_id predicate".to_string());
    }

    violations
}

/// Whether a value has the shape of a tenant/resource id (36-char UUID).
pub fn looks_like_uuid(value: &str) -> bool {
    UUID_RE.is_match(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TENANT: &str = "11111111-2222-3333-4444-555555555555";

    #[test]
    fn test_scope_query_requires_tenant() {
        assert!(scope_query("SELECT * FROM visual_models", "").is_err());
    }

    #[test]
    fn test_scope_query_appends_where() {
        let scoped = scope_query("SELECT * FROM visual_models", TENANT).unwrap();
        assert_eq!(
            scoped,
            format!("SELECT * FROM visual_models WHERE tenant_id = '{}'", TENANT)
        );
    }

    #[test]
    fn test_scope_query_extends_existing_where() {
        let scoped =
            scope_query("SELECT * FROM visual_models WHERE status = 'draft'", TENANT).unwrap();
        assert!(scoped.ends_with(&format!("AND tenant_id = '{}'", TENANT)));
    }

    #[test]
    fn test_scope_query_inserts_before_order_by() {
        let scoped =
            scope_query("SELECT * FROM visual_models ORDER BY created_at", TENANT).unwrap();
        assert_eq!(
            scoped,
            format!(
                "SELECT * FROM visual_models WHERE tenant_id = '{}' ORDER BY created_at",
                TENANT
            )
        );
    }

    #[test]
    fn test_scope_query_inserts_before_limit() {
        let scoped = scope_query("SELECT * FROM audit_logs LIMIT 10", TENANT).unwrap();
        assert_eq!(
            scoped,
            format!(
                "SELECT * FROM audit_logs WHERE tenant_id = '{}' LIMIT 10",
                TENANT
            )
        );
    }

    #[test]
    fn test_scope_query_leaves_other_tables_untouched() {
        let query = "SELECT * FROM schema_migrations";
        assert_eq!(scope_query(query, TENANT).unwrap(), query);
    }

    #[test]
    fn test_scope_operations_injects_tenant() {
        let ops = vec![
            Operation::insert("visual_models", [("name", SqlValue::from("m"))]),
            Operation::insert("schema_migrations", [("name", SqlValue::from("x"))]),
        ];
        let scoped = scope_operations(ops, TENANT);
        assert_eq!(
            scoped[0].data.get("tenant_id"),
            Some(&SqlValue::Text(TENANT.to_string()))
        );
        assert_eq!(
            scoped[0].conditions.get("tenant_id"),
            Some(&SqlValue::Text(TENANT.to_string()))
        );
        assert!(scoped[1].data.get("tenant_id").is_none());
    }

    #[test]
    fn test_query_safety_flags_foreign_tenant() {
        let other = "99999999-8888-7777-6666-555555555555";
        let query = format!(
            "SELECT * FROM visual_models WHERE tenant_id = '{}'",
            other
        );
        let violations = query_safety_violations(&query, TENANT);
        assert_eq!(violations.len(), 1);
        assert!(violations[0].contains(other));
    }

    #[test]
    fn test_query_safety_accepts_own_tenant() {
        let query = format!(
            "SELECT * FROM visual_models WHERE tenant_id = '{}'",
            TENANT
        );
        assert!(query_safety_violations(&query, TENANT).is_empty());
    }

    #[test]
    fn test_query_safety_flags_dangerous_patterns() {
        assert!(!query_safety_violations("DROP TABLE visual_models", TENANT).is_empty());
        assert!(!query_safety_violations("truncate table users", TENANT).is_empty());
        assert!(!query_safety_violations("DELETE FROM visual_models", TENANT).is_empty());
        assert!(!query_safety_violations("UPDATE visual_models SET name = 'x'", TENANT).is_empty());
    }

    #[test]
    fn test_query_safety_allows_scoped_writes() {
        let query = format!(
            "DELETE FROM visual_models WHERE tenant_id = '{}' AND id = 'm1'",
            TENANT
        );
        assert!(query_safety_violations(&query, TENANT).is_empty());
    }

    #[test]
    fn test_looks_like_uuid() {
        assert!(looks_like_uuid(TENANT));
        assert!(!looks_like_uuid("not-a-uuid"));
        assert!(!looks_like_uuid("11111111222233334444555555555555"));
    }
}

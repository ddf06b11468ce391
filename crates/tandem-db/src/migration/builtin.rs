//! Built-in schema packs: core tables, performance indexes and the
//! multi-tenant tables, each rendered per backend dialect.

use super::Migration;
use crate::types::{BackendKind, Operation};

/// Core tables created by database initialization, in creation order.
pub fn core_schema(kind: BackendKind) -> Vec<(&'static str, &'static str)> {
    match kind {
        BackendKind::Primary => vec![
            (
                "tenants",
                "CREATE TABLE IF NOT EXISTS tenants (
                    id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
                    name VARCHAR(255) NOT NULL,
                    domain VARCHAR(255) UNIQUE NOT NULL,
                    created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
                    updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
                    status VARCHAR(20) NOT NULL DEFAULT 'active',
                    configuration JSONB DEFAULT '{}',
                    resource_limits JSONB DEFAULT '{}',
                    billing_info JSONB DEFAULT '{}'
                )",
            ),
            (
                "users",
                "CREATE TABLE IF NOT EXISTS users (
                    id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
                    tenant_id UUID NOT NULL REFERENCES tenants(id) ON DELETE CASCADE,
                    username VARCHAR(255) NOT NULL,
                    email VARCHAR(255) NOT NULL,
                    password_hash VARCHAR(255) NOT NULL,
                    created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
                    last_login TIMESTAMP NULL,
                    status VARCHAR(20) NOT NULL DEFAULT 'active',
                    profile JSONB DEFAULT '{}',
                    preferences JSONB DEFAULT '{}',
                    UNIQUE(tenant_id, username),
                    UNIQUE(tenant_id, email)
                )",
            ),
            (
                "roles",
                "CREATE TABLE IF NOT EXISTS roles (
                    id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
                    tenant_id UUID NOT NULL REFERENCES tenants(id) ON DELETE CASCADE,
                    name VARCHAR(255) NOT NULL,
                    description TEXT,
                    permissions JSONB DEFAULT '[]',
                    parent_role_id UUID NULL REFERENCES roles(id) ON DELETE SET NULL,
                    created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
                    updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
                    UNIQUE(tenant_id, name)
                )",
            ),
            (
                "user_roles",
                "CREATE TABLE IF NOT EXISTS user_roles (
                    id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
                    user_id UUID NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                    role_id UUID NOT NULL REFERENCES roles(id) ON DELETE CASCADE,
                    assigned_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
                    expires_at TIMESTAMP NULL,
                    assigned_by UUID NULL REFERENCES users(id) ON DELETE SET NULL,
                    UNIQUE(user_id, role_id)
                )",
            ),
            (
                "audit_logs",
                "CREATE TABLE IF NOT EXISTS audit_logs (
                    id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
                    tenant_id UUID NOT NULL REFERENCES tenants(id) ON DELETE CASCADE,
                    user_id UUID NULL REFERENCES users(id) ON DELETE SET NULL,
                    action VARCHAR(255) NOT NULL,
                    resource_type VARCHAR(255) NOT NULL,
                    resource_id VARCHAR(255) NULL,
                    timestamp TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
                    ip_address INET NULL,
                    user_agent TEXT NULL,
                    details JSONB DEFAULT '{}',
                    signature VARCHAR(255) NOT NULL
                )",
            ),
            (
                "visual_models",
                "CREATE TABLE IF NOT EXISTS visual_models (
                    id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
                    tenant_id UUID NOT NULL REFERENCES tenants(id) ON DELETE CASCADE,
                    owner_id UUID NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                    name VARCHAR(255) NOT NULL,
                    description TEXT,
                    model_data JSONB NOT NULL DEFAULT '{}',
                    version INTEGER NOT NULL DEFAULT 1,
                    parent_version_id UUID NULL REFERENCES visual_models(id) ON DELETE SET NULL,
                    created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
                    updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
                    status VARCHAR(20) NOT NULL DEFAULT 'draft',
                    tags TEXT[] DEFAULT '{}',
                    metadata JSONB DEFAULT '{}'
                )",
            ),
            (
                "execution_records",
                "CREATE TABLE IF NOT EXISTS execution_records (
                    id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
                    tenant_id UUID NOT NULL REFERENCES tenants(id) ON DELETE CASCADE,
                    user_id UUID NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                    model_id UUID NOT NULL REFERENCES visual_models(id) ON DELETE CASCADE,
                    execution_data JSONB NOT NULL DEFAULT '{}',
                    start_time TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
                    end_time TIMESTAMP NULL,
                    status VARCHAR(20) NOT NULL DEFAULT 'running',
                    output TEXT,
                    error_message TEXT NULL,
                    performance_metrics JSONB DEFAULT '{}'
                )",
            ),
            (
                "custom_components",
                "CREATE TABLE IF NOT EXISTS custom_components (
                    id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
                    tenant_id UUID NOT NULL REFERENCES tenants(id) ON DELETE CASCADE,
                    creator_id UUID NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                    name VARCHAR(255) NOT NULL,
                    description TEXT,
                    component_data JSONB NOT NULL DEFAULT '{}',
                    category VARCHAR(255) NOT NULL,
                    tags TEXT[] DEFAULT '{}',
                    usage_count INTEGER DEFAULT 0,
                    created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
                    updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
                    is_shared BOOLEAN DEFAULT FALSE
                )",
            ),
        ],
        BackendKind::Local => vec![
            (
                "tenants",
                "CREATE TABLE IF NOT EXISTS tenants (
                    id TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    domain TEXT UNIQUE NOT NULL,
                    created_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
                    updated_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
                    status TEXT NOT NULL DEFAULT 'active',
                    configuration TEXT DEFAULT '{}',
                    resource_limits TEXT DEFAULT '{}',
                    billing_info TEXT DEFAULT '{}'
                )",
            ),
            (
                "users",
                "CREATE TABLE IF NOT EXISTS users (
                    id TEXT PRIMARY KEY,
                    tenant_id TEXT NOT NULL REFERENCES tenants(id) ON DELETE CASCADE,
                    username TEXT NOT NULL,
                    email TEXT NOT NULL,
                    password_hash TEXT NOT NULL,
                    created_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
                    last_login DATETIME NULL,
                    status TEXT NOT NULL DEFAULT 'active',
                    profile TEXT DEFAULT '{}',
                    preferences TEXT DEFAULT '{}',
                    UNIQUE(tenant_id, username),
                    UNIQUE(tenant_id, email)
                )",
            ),
            (
                "roles",
                "CREATE TABLE IF NOT EXISTS roles (
                    id TEXT PRIMARY KEY,
                    tenant_id TEXT NOT NULL REFERENCES tenants(id) ON DELETE CASCADE,
                    name TEXT NOT NULL,
                    description TEXT,
                    permissions TEXT DEFAULT '[]',
                    parent_role_id TEXT NULL REFERENCES roles(id) ON DELETE SET NULL,
                    created_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
                    updated_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
                    UNIQUE(tenant_id, name)
                )",
            ),
            (
                "user_roles",
                "CREATE TABLE IF NOT EXISTS user_roles (
                    id TEXT PRIMARY KEY,
                    user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                    role_id TEXT NOT NULL REFERENCES roles(id) ON DELETE CASCADE,
                    assigned_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
                    expires_at DATETIME NULL,
                    assigned_by TEXT NULL REFERENCES users(id) ON DELETE SET NULL,
                    UNIQUE(user_id, role_id)
                )",
            ),
            (
                "audit_logs",
                "CREATE TABLE IF NOT EXISTS audit_logs (
                    id TEXT PRIMARY KEY,
                    tenant_id TEXT NOT NULL REFERENCES tenants(id) ON DELETE CASCADE,
                    user_id TEXT NULL REFERENCES users(id) ON DELETE SET NULL,
                    action TEXT NOT NULL,
                    resource_type TEXT NOT NULL,
                    resource_id TEXT NULL,
                    timestamp DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
                    ip_address TEXT NULL,
                    user_agent TEXT NULL,
                    details TEXT DEFAULT '{}',
                    signature TEXT NOT NULL
                )",
            ),
            (
                "visual_models",
                "CREATE TABLE IF NOT EXISTS visual_models (
                    id TEXT PRIMARY KEY,
                    tenant_id TEXT NOT NULL REFERENCES tenants(id) ON DELETE CASCADE,
                    owner_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                    name TEXT NOT NULL,
                    description TEXT,
                    model_data TEXT NOT NULL DEFAULT '{}',
                    version INTEGER NOT NULL DEFAULT 1,
                    parent_version_id TEXT NULL REFERENCES visual_models(id) ON DELETE SET NULL,
                    created_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
                    updated_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
                    status TEXT NOT NULL DEFAULT 'draft',
                    tags TEXT DEFAULT '',
                    metadata TEXT DEFAULT '{}'
                )",
            ),
            (
                "execution_records",
                "CREATE TABLE IF NOT EXISTS execution_records (
                    id TEXT PRIMARY KEY,
                    tenant_id TEXT NOT NULL REFERENCES tenants(id) ON DELETE CASCADE,
                    user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                    model_id TEXT NOT NULL REFERENCES visual_models(id) ON DELETE CASCADE,
                    execution_data TEXT NOT NULL DEFAULT '{}',
                    start_time DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
                    end_time DATETIME NULL,
                    status TEXT NOT NULL DEFAULT 'running',
                    output TEXT,
                    error_message TEXT NULL,
                    performance_metrics TEXT DEFAULT '{}'
                )",
            ),
            (
                "custom_components",
                "CREATE TABLE IF NOT EXISTS custom_components (
                    id TEXT PRIMARY KEY,
                    tenant_id TEXT NOT NULL REFERENCES tenants(id) ON DELETE CASCADE,
                    creator_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                    name TEXT NOT NULL,
                    description TEXT,
                    component_data TEXT NOT NULL DEFAULT '{}',
                    category TEXT NOT NULL,
                    tags TEXT DEFAULT '',
                    usage_count INTEGER DEFAULT 0,
                    created_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
                    updated_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
                    is_shared INTEGER DEFAULT 0
                )",
            ),
        ],
    }
}

/// Index names paired with the column they cover: one per foreign key and
/// per hot-path column. The DDL is identical across dialects.
fn index_definitions() -> Vec<(&'static str, &'static str, &'static str)> {
    vec![
        ("idx_users_tenant_id", "users", "tenant_id"),
        ("idx_users_email", "users", "email"),
        ("idx_users_username", "users", "username"),
        ("idx_users_status", "users", "status"),
        ("idx_roles_tenant_id", "roles", "tenant_id"),
        ("idx_roles_parent_role_id", "roles", "parent_role_id"),
        ("idx_user_roles_user_id", "user_roles", "user_id"),
        ("idx_user_roles_role_id", "user_roles", "role_id"),
        ("idx_user_roles_expires_at", "user_roles", "expires_at"),
        ("idx_audit_logs_tenant_id", "audit_logs", "tenant_id"),
        ("idx_audit_logs_user_id", "audit_logs", "user_id"),
        ("idx_audit_logs_timestamp", "audit_logs", "timestamp"),
        ("idx_audit_logs_action", "audit_logs", "action"),
        ("idx_audit_logs_resource_type", "audit_logs", "resource_type"),
        ("idx_visual_models_tenant_id", "visual_models", "tenant_id"),
        ("idx_visual_models_owner_id", "visual_models", "owner_id"),
        ("idx_visual_models_status", "visual_models", "status"),
        ("idx_visual_models_created_at", "visual_models", "created_at"),
        ("idx_visual_models_updated_at", "visual_models", "updated_at"),
        ("idx_execution_records_tenant_id", "execution_records", "tenant_id"),
        ("idx_execution_records_user_id", "execution_records", "user_id"),
        ("idx_execution_records_model_id", "execution_records", "model_id"),
        ("idx_execution_records_status", "execution_records", "status"),
        ("idx_execution_records_start_time", "execution_records", "start_time"),
        ("idx_custom_components_tenant_id", "custom_components", "tenant_id"),
        ("idx_custom_components_creator_id", "custom_components", "creator_id"),
        ("idx_custom_components_category", "custom_components", "category"),
        ("idx_custom_components_is_shared", "custom_components", "is_shared"),
        ("idx_tenants_domain", "tenants", "domain"),
        ("idx_tenants_status", "tenants", "status"),
    ]
}

/// Performance index pack for the core tables.
pub fn indexes_migration(_kind: BackendKind) -> Migration {
    let up_ops: Vec<Operation> = index_definitions()
        .iter()
        .map(|(name, table, column)| {
            Operation::ddl(format!(
                "CREATE INDEX IF NOT EXISTS {} ON {}({})",
                name, table, column
            ))
        })
        .collect();
    let down_ops: Vec<Operation> = index_definitions()
        .iter()
        .map(|(name, _, _)| Operation::ddl(format!("DROP INDEX IF EXISTS {}", name)))
        .collect();

    Migration::new(
        "add_indexes",
        "1.1.0",
        "Add performance indexes to core tables",
        up_ops,
        down_ops,
        vec![],
    )
}

/// Multi-tenancy support tables: user→tenant assignments, per-tenant
/// configuration and the cross-tenant access journal.
pub fn multi_tenant_migration(kind: BackendKind) -> Migration {
    let tables: Vec<(&str, String)> = match kind {
        BackendKind::Primary => vec![
            (
                "user_tenant_assignments",
                "CREATE TABLE IF NOT EXISTS user_tenant_assignments (
                    id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
                    user_id UUID NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                    tenant_id UUID NOT NULL REFERENCES tenants(id) ON DELETE CASCADE,
                    permissions JSONB DEFAULT '[]',
                    status VARCHAR(20) NOT NULL DEFAULT 'active',
                    assigned_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
                    assigned_by UUID NULL REFERENCES users(id) ON DELETE SET NULL,
                    expires_at TIMESTAMP NULL,
                    UNIQUE(user_id, tenant_id)
                )"
                .to_string(),
            ),
            (
                "tenant_configurations",
                "CREATE TABLE IF NOT EXISTS tenant_configurations (
                    id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
                    tenant_id UUID NOT NULL REFERENCES tenants(id) ON DELETE CASCADE,
                    settings JSONB DEFAULT '{}',
                    feature_flags JSONB DEFAULT '{}',
                    resource_limits JSONB DEFAULT '{}',
                    ui_customization JSONB DEFAULT '{}',
                    integrations JSONB DEFAULT '{}',
                    created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
                    updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
                    UNIQUE(tenant_id)
                )"
                .to_string(),
            ),
            (
                "cross_tenant_access_logs",
                "CREATE TABLE IF NOT EXISTS cross_tenant_access_logs (
                    id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
                    user_id VARCHAR(255) NOT NULL,
                    attempted_tenant_id VARCHAR(255) NOT NULL,
                    actual_tenant_id VARCHAR(255) NOT NULL,
                    access_type VARCHAR(255) NOT NULL,
                    severity VARCHAR(20) NOT NULL DEFAULT 'medium',
                    blocked BOOLEAN NOT NULL DEFAULT TRUE,
                    timestamp TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
                    details JSONB DEFAULT '{}'
                )"
                .to_string(),
            ),
        ],
        BackendKind::Local => vec![
            (
                "user_tenant_assignments",
                "CREATE TABLE IF NOT EXISTS user_tenant_assignments (
                    id TEXT PRIMARY KEY,
                    user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                    tenant_id TEXT NOT NULL REFERENCES tenants(id) ON DELETE CASCADE,
                    permissions TEXT DEFAULT '[]',
                    status TEXT NOT NULL DEFAULT 'active',
                    assigned_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
                    assigned_by TEXT NULL REFERENCES users(id) ON DELETE SET NULL,
                    expires_at DATETIME NULL,
                    UNIQUE(user_id, tenant_id)
                )"
                .to_string(),
            ),
            (
                "tenant_configurations",
                "CREATE TABLE IF NOT EXISTS tenant_configurations (
                    id TEXT PRIMARY KEY,
                    tenant_id TEXT NOT NULL REFERENCES tenants(id) ON DELETE CASCADE,
                    settings TEXT DEFAULT '{}',
                    feature_flags TEXT DEFAULT '{}',
                    resource_limits TEXT DEFAULT '{}',
                    ui_customization TEXT DEFAULT '{}',
                    integrations TEXT DEFAULT '{}',
                    created_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
                    updated_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
                    UNIQUE(tenant_id)
                )"
                .to_string(),
            ),
            (
                "cross_tenant_access_logs",
                "CREATE TABLE IF NOT EXISTS cross_tenant_access_logs (
                    id TEXT PRIMARY KEY,
                    user_id TEXT NOT NULL,
                    attempted_tenant_id TEXT NOT NULL,
                    actual_tenant_id TEXT NOT NULL,
                    access_type TEXT NOT NULL,
                    severity TEXT NOT NULL DEFAULT 'medium',
                    blocked INTEGER NOT NULL DEFAULT 1,
                    timestamp DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
                    details TEXT DEFAULT '{}'
                )"
                .to_string(),
            ),
        ],
    };

    let up_ops: Vec<Operation> = tables
        .iter()
        .map(|(_, ddl)| Operation::ddl(ddl.clone()))
        .collect();
    let drop_suffix = match kind {
        BackendKind::Primary => " CASCADE",
        BackendKind::Local => "",
    };
    let down_ops: Vec<Operation> = tables
        .iter()
        .rev()
        .map(|(name, _)| Operation::ddl(format!("DROP TABLE IF EXISTS {}{}", name, drop_suffix)))
        .collect();

    Migration::new(
        "multi_tenant_tables",
        "1.1.0",
        "Create additional tables for multi-tenancy support",
        up_ops,
        down_ops,
        vec![],
    )
}

//! Schema migration engine with checksum integrity and journaling.
//!
//! Migrations carry semver-style versions and a SHA-256 checksum over their
//! name, version, description and serialized up-operations. The
//! `schema_migrations` journal is the authoritative record of what has been
//! applied; failed migrations leave no `applied` row behind.

pub mod builtin;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{error, info, warn};
use uuid::Uuid;

use tandem_common::{Result, TandemError};

use crate::coordinator::Coordinator;
use crate::types::{BackendKind, Operation, Params, SqlValue};

/// Name of the journal table.
pub const MIGRATIONS_TABLE: &str = "schema_migrations";

/// Journal status of a migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStatus {
    Applied,
    RolledBack,
    Failed,
}

impl MigrationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationStatus::Applied => "applied",
            MigrationStatus::RolledBack => "rolled_back",
            MigrationStatus::Failed => "failed",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "rolled_back" => MigrationStatus::RolledBack,
            "failed" => MigrationStatus::Failed,
            _ => MigrationStatus::Applied,
        }
    }
}

/// An ordered pair of up/down operation lists moving the schema between
/// versions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Migration {
    pub id: String,
    pub name: String,
    pub version: String,
    pub description: String,
    pub up_ops: Vec<Operation>,
    pub down_ops: Vec<Operation>,
    pub dependencies: Vec<String>,
    pub checksum: String,
    pub created_at: DateTime<Utc>,
    pub applied_at: Option<DateTime<Utc>>,
    pub rolled_back_at: Option<DateTime<Utc>>,
}

impl Migration {
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        description: impl Into<String>,
        up_ops: Vec<Operation>,
        down_ops: Vec<Operation>,
        dependencies: Vec<String>,
    ) -> Self {
        let mut migration = Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            version: version.into(),
            description: description.into(),
            up_ops,
            down_ops,
            dependencies,
            checksum: String::new(),
            created_at: Utc::now(),
            applied_at: None,
            rolled_back_at: None,
        };
        migration.checksum = migration.compute_checksum();
        migration
    }

    /// SHA-256 over name, version, description and the serialized
    /// up-operations. Operation payloads are `BTreeMap`s, so the serialized
    /// form is key-ordered and the checksum deterministic.
    pub fn compute_checksum(&self) -> String {
        let mut content = format!("{}:{}:{}", self.name, self.version, self.description);
        for op in &self.up_ops {
            let data = serde_json::to_string(&op.data).unwrap_or_default();
            content.push_str(&format!(":{}:{}:{}", op.kind.as_str(), op.table, data));
            if let Some(raw) = &op.raw_query {
                content.push(':');
                content.push_str(raw);
            }
        }
        let mut hasher = Sha256::new();
        hasher.update(content.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Structural validation errors, empty when the migration is sound.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.id.is_empty() {
            errors.push("migration id is required".to_string());
        }
        if self.name.is_empty() {
            errors.push("migration name is required".to_string());
        }
        if self.version.is_empty() {
            errors.push("migration version is required".to_string());
        }
        if self.up_ops.is_empty() {
            errors.push("migration must have at least one up operation".to_string());
        }
        for (i, op) in self.up_ops.iter().enumerate() {
            if !op.validate() {
                errors.push(format!("invalid up operation at index {}", i));
            }
        }
        for (i, op) in self.down_ops.iter().enumerate() {
            if !op.validate() {
                errors.push(format!("invalid down operation at index {}", i));
            }
        }
        errors
    }
}

/// One journal row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationRecord {
    pub migration_id: String,
    pub name: String,
    pub version: String,
    pub checksum: String,
    pub applied_at: DateTime<Utc>,
    pub rolled_back_at: Option<DateTime<Utc>>,
    pub execution_time: f64,
    pub status: MigrationStatus,
    pub error: Option<String>,
}

/// Result of applying one migration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationOutcome {
    pub success: bool,
    pub migration_id: String,
    pub operations_executed: usize,
    pub execution_time: f64,
    pub error: Option<String>,
}

/// Result of rolling back to a target version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackOutcome {
    pub success: bool,
    pub migration_id: String,
    pub target_version: String,
    pub operations_executed: usize,
    pub execution_time: f64,
    pub error: Option<String>,
}

/// Result of migration validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationOutcome {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub missing_dependencies: Vec<String>,
}

/// Result of database initialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitializationOutcome {
    pub success: bool,
    pub backend: BackendKind,
    pub tables_created: Vec<String>,
    pub initial_version: String,
    pub error: Option<String>,
}

/// Result of a repair pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepairOutcome {
    pub success: bool,
    pub issues_found: Vec<String>,
    pub repairs_applied: Vec<String>,
    pub error: Option<String>,
}

/// Migration engine: version-ordered application, journaling, rollback and
/// repair over the coordinator's current backend.
pub struct MigrationRunner {
    db: Arc<Coordinator>,
    migrations: Mutex<HashMap<String, Migration>>,
    history: Mutex<Vec<MigrationRecord>>,
    current_version: Mutex<String>,
    backup_dir: std::path::PathBuf,
}

impl MigrationRunner {
    /// Builds the runner: creates the journal table if missing and loads
    /// the journal into memory.
    pub async fn new(db: Arc<Coordinator>) -> Result<Self> {
        let runner = Self {
            db,
            migrations: Mutex::new(HashMap::new()),
            history: Mutex::new(Vec::new()),
            current_version: Mutex::new("0.0.0".to_string()),
            backup_dir: std::env::temp_dir().join("tandem-backups"),
        };
        runner.ensure_journal_table().await?;
        runner.load_history().await?;
        Ok(runner)
    }

    /// Overrides where pre-migration backups land.
    pub fn with_backup_dir(mut self, dir: impl Into<std::path::PathBuf>) -> Self {
        self.backup_dir = dir.into();
        self
    }

    /// Creates the core tables for the current backend and sets the schema
    /// version to 1.0.0.
    pub async fn initialize(&self) -> InitializationOutcome {
        let backend = self.db.current_backend();
        let mut tables_created = Vec::new();

        for (table, ddl) in builtin::core_schema(backend) {
            let result = match self.db.execute_query(ddl, &Params::None, None).await {
                Ok(result) => result,
                Err(e) => {
                    return InitializationOutcome {
                        success: false,
                        backend,
                        tables_created,
                        initial_version: "0.0.0".to_string(),
                        error: Some(e.to_string()),
                    }
                }
            };
            if !result.success {
                error!(table = %table, error = ?result.error, "core table creation failed");
                return InitializationOutcome {
                    success: false,
                    backend,
                    tables_created,
                    initial_version: "0.0.0".to_string(),
                    error: result.error,
                };
            }
            tables_created.push(table.to_string());
        }

        *self.current_version.lock() = "1.0.0".to_string();
        info!(backend = %backend, tables = tables_created.len(), "database initialized");
        InitializationOutcome {
            success: true,
            backend,
            tables_created,
            initial_version: "1.0.0".to_string(),
            error: None,
        }
    }

    /// Registers a migration for later application.
    pub fn register(&self, migration: Migration) -> String {
        let id = migration.id.clone();
        self.migrations.lock().insert(id.clone(), migration);
        id
    }

    /// Creates and registers a migration at the next patch version.
    pub fn create_migration(
        &self,
        name: impl Into<String>,
        up_ops: Vec<Operation>,
        down_ops: Vec<Operation>,
        dependencies: Vec<String>,
    ) -> String {
        let name = name.into();
        let version = self.next_version();
        let migration = Migration::new(
            name.clone(),
            version,
            format!("Migration: {}", name),
            up_ops,
            down_ops,
            dependencies,
        );
        info!(migration_id = %migration.id, name = %migration.name, version = %migration.version, "migration created");
        self.register(migration)
    }

    pub fn current_version(&self) -> String {
        self.current_version.lock().clone()
    }

    pub fn history(&self) -> Vec<MigrationRecord> {
        self.history.lock().clone()
    }

    /// Pending migrations sorted by version tuple.
    pub fn pending(&self) -> Vec<Migration> {
        let applied: std::collections::HashSet<String> = self
            .history
            .lock()
            .iter()
            .filter(|r| r.status == MigrationStatus::Applied)
            .map(|r| r.migration_id.clone())
            .collect();

        let mut pending: Vec<Migration> = self
            .migrations
            .lock()
            .values()
            .filter(|m| !applied.contains(&m.id))
            .cloned()
            .collect();
        pending.sort_by_key(|m| version_tuple(&m.version));
        pending
    }

    /// Validates structure, checksum integrity and dependency resolution.
    pub fn validate(&self, migration: &Migration) -> ValidationOutcome {
        let mut errors = migration.validate();
        let mut warnings = Vec::new();
        let mut missing_dependencies = Vec::new();

        {
            let migrations = self.migrations.lock();
            for dep in &migration.dependencies {
                if !migrations.contains_key(dep) {
                    missing_dependencies.push(dep.clone());
                    errors.push(format!("missing dependency: {}", dep));
                }
            }
        }

        if migration.down_ops.is_empty() {
            warnings.push("migration has no down operations; rollback will not be possible".into());
        }

        if migration.checksum != migration.compute_checksum() {
            errors.push("migration checksum mismatch".to_string());
        }

        ValidationOutcome {
            is_valid: errors.is_empty(),
            missing_dependencies,
            errors,
            warnings,
        }
    }

    /// Applies pending migrations in version order, optionally up to a
    /// target version. Halts on the first failure.
    pub async fn apply_pending(&self, target_version: Option<&str>) -> Vec<MigrationOutcome> {
        let mut pending = self.pending();
        if let Some(target) = target_version {
            let target = version_tuple(target);
            pending.retain(|m| version_tuple(&m.version) <= target);
        }

        if pending.is_empty() {
            info!("no pending migrations to apply");
            return Vec::new();
        }

        let mut results = Vec::new();
        for migration in pending {
            let validation = self.validate(&migration);
            if !validation.is_valid {
                results.push(MigrationOutcome {
                    success: false,
                    migration_id: migration.id.clone(),
                    operations_executed: 0,
                    execution_time: 0.0,
                    error: Some(format!(
                        "migration validation failed: {}",
                        validation.errors.join(", ")
                    )),
                });
                break;
            }

            self.backup_before_migration().await;

            let outcome = self.apply(&migration).await;
            let failed = !outcome.success;
            results.push(outcome);
            if failed {
                break;
            }
        }
        results
    }

    /// Rolls back applied migrations with a version above the target, in
    /// reverse-applied order. The target must be strictly below the current
    /// version.
    pub async fn rollback_to(&self, target_version: &str) -> RollbackOutcome {
        let current = self.current_version();
        if version_tuple(target_version) >= version_tuple(&current) {
            return RollbackOutcome {
                success: false,
                migration_id: String::new(),
                target_version: target_version.to_string(),
                operations_executed: 0,
                execution_time: 0.0,
                error: Some("target version must be lower than current version".to_string()),
            };
        }

        let to_rollback: Vec<MigrationRecord> = {
            let history = self.history.lock();
            history
                .iter()
                .rev()
                .filter(|r| {
                    r.status == MigrationStatus::Applied
                        && version_tuple(&r.version) > version_tuple(target_version)
                })
                .cloned()
                .collect()
        };

        if to_rollback.is_empty() {
            return RollbackOutcome {
                success: true,
                migration_id: String::new(),
                target_version: target_version.to_string(),
                operations_executed: 0,
                execution_time: 0.0,
                error: None,
            };
        }

        self.backup_before_migration().await;

        let started = Utc::now();
        let mut operations_executed = 0usize;

        for record in &to_rollback {
            let migration = self.migrations.lock().get(&record.migration_id).cloned();
            let migration = match migration {
                Some(m) => m,
                None => {
                    warn!(migration_id = %record.migration_id, "migration not found for rollback");
                    continue;
                }
            };

            for op in &migration.down_ops {
                if let Err(error) = self.execute_op(op).await {
                    return RollbackOutcome {
                        success: false,
                        migration_id: migration.id.clone(),
                        target_version: target_version.to_string(),
                        operations_executed,
                        execution_time: elapsed_secs(started),
                        error: Some(format!("rollback failed: {}", error)),
                    };
                }
                operations_executed += 1;
            }

            if let Err(e) = self
                .mark_record(&record.migration_id, MigrationStatus::RolledBack)
                .await
            {
                return RollbackOutcome {
                    success: false,
                    migration_id: migration.id.clone(),
                    target_version: target_version.to_string(),
                    operations_executed,
                    execution_time: elapsed_secs(started),
                    error: Some(e.to_string()),
                };
            }
            info!(migration_id = %migration.id, "migration rolled back");
        }

        *self.current_version.lock() = target_version.to_string();

        RollbackOutcome {
            success: true,
            migration_id: to_rollback[0].migration_id.clone(),
            target_version: target_version.to_string(),
            operations_executed,
            execution_time: elapsed_secs(started),
            error: None,
        }
    }

    /// Repairs journal inconsistencies: orphan rows are reported, missing
    /// rows for applied migrations are recreated, checksum mismatches are
    /// reported without silent correction.
    pub async fn repair(&self) -> RepairOutcome {
        let mut issues_found = Vec::new();
        let mut repairs_applied = Vec::new();

        let (orphans, missing, mismatches) = {
            let migrations = self.migrations.lock();
            let history = self.history.lock();

            let orphans: Vec<String> = history
                .iter()
                .filter(|r| !migrations.contains_key(&r.migration_id))
                .map(|r| r.migration_id.clone())
                .collect();

            let journaled: std::collections::HashSet<String> =
                history.iter().map(|r| r.migration_id.clone()).collect();
            let missing: Vec<Migration> = migrations
                .values()
                .filter(|m| m.applied_at.is_some() && !journaled.contains(&m.id))
                .cloned()
                .collect();

            let mismatches: Vec<String> = history
                .iter()
                .filter_map(|r| {
                    migrations.get(&r.migration_id).and_then(|m| {
                        (m.checksum != r.checksum).then(|| r.migration_id.clone())
                    })
                })
                .collect();

            (orphans, missing, mismatches)
        };

        for id in &orphans {
            issues_found.push(format!("orphaned migration record: {}", id));
        }
        for id in &mismatches {
            issues_found.push(format!("checksum mismatch for migration {}", id));
        }

        for migration in missing {
            issues_found.push(format!("missing migration record: {}", migration.id));
            let applied_at = migration.applied_at.unwrap_or_else(Utc::now);
            match self.insert_record(&migration, applied_at, 0.0).await {
                Ok(()) => {
                    repairs_applied.push(format!("created missing record for {}", migration.id))
                }
                Err(e) => {
                    return RepairOutcome {
                        success: false,
                        issues_found,
                        repairs_applied,
                        error: Some(e.to_string()),
                    }
                }
            }
        }

        RepairOutcome {
            success: true,
            issues_found,
            repairs_applied,
            error: None,
        }
    }

    /// Next patch version after the current one; malformed versions fall
    /// back to 1.0.1.
    pub fn next_version(&self) -> String {
        let current = self.current_version();
        let parts: Vec<&str> = current.split('.').collect();
        if parts.len() != 3 {
            return "1.0.1".to_string();
        }
        match (
            parts[0].parse::<u64>(),
            parts[1].parse::<u64>(),
            parts[2].parse::<u64>(),
        ) {
            (Ok(major), Ok(minor), Ok(patch)) => format!("{}.{}.{}", major, minor, patch + 1),
            _ => "1.0.1".to_string(),
        }
    }

    // ---- internal -------------------------------------------------------

    async fn apply(&self, migration: &Migration) -> MigrationOutcome {
        let started = Utc::now();
        let mut operations_executed = 0usize;

        // Raw-query operations run individually; the remainder execute as a
        // single transaction.
        let mut batched: Vec<Operation> = Vec::new();
        for op in &migration.up_ops {
            if op.raw_query.is_some() {
                match self.execute_op(op).await {
                    Ok(()) => operations_executed += 1,
                    Err(error) => {
                        return MigrationOutcome {
                            success: false,
                            migration_id: migration.id.clone(),
                            operations_executed,
                            execution_time: elapsed_secs(started),
                            error: Some(error),
                        };
                    }
                }
            } else {
                batched.push(op.clone());
                operations_executed += 1;
            }
        }

        if !batched.is_empty() {
            match self.db.execute_transaction(batched, None).await {
                Ok(result) if result.success => {}
                Ok(result) => {
                    return MigrationOutcome {
                        success: false,
                        migration_id: migration.id.clone(),
                        operations_executed,
                        execution_time: elapsed_secs(started),
                        error: result.error,
                    };
                }
                Err(e) => {
                    return MigrationOutcome {
                        success: false,
                        migration_id: migration.id.clone(),
                        operations_executed,
                        execution_time: elapsed_secs(started),
                        error: Some(e.to_string()),
                    };
                }
            }
        }

        let execution_time = elapsed_secs(started);
        if let Err(e) = self.insert_record(migration, Utc::now(), execution_time).await {
            return MigrationOutcome {
                success: false,
                migration_id: migration.id.clone(),
                operations_executed,
                execution_time,
                error: Some(e.to_string()),
            };
        }

        {
            let mut current = self.current_version.lock();
            if version_tuple(&migration.version) > version_tuple(&current) {
                *current = migration.version.clone();
            }
        }
        if let Some(m) = self.migrations.lock().get_mut(&migration.id) {
            m.applied_at = Some(Utc::now());
        }

        info!(migration_id = %migration.id, version = %migration.version, "migration applied");
        MigrationOutcome {
            success: true,
            migration_id: migration.id.clone(),
            operations_executed,
            execution_time,
            error: None,
        }
    }

    async fn execute_op(&self, op: &Operation) -> std::result::Result<(), String> {
        if let Some(raw) = &op.raw_query {
            match self.db.execute_query(raw, &op.params, None).await {
                Ok(result) if result.success => Ok(()),
                Ok(result) => Err(result.error.unwrap_or_else(|| "statement failed".into())),
                Err(e) => Err(e.to_string()),
            }
        } else {
            match self.db.execute_transaction(vec![op.clone()], None).await {
                Ok(result) if result.success => Ok(()),
                Ok(result) => Err(result.error.unwrap_or_else(|| "operation failed".into())),
                Err(e) => Err(e.to_string()),
            }
        }
    }

    /// Pre-migration backup is best effort: a failure is logged, never
    /// fatal. PRIMARY reports backup as unsupported, which lands here too.
    async fn backup_before_migration(&self) {
        let timestamp = Utc::now().format("%Y%m%d_%H%M%S");
        let path = self
            .backup_dir
            .join(format!("pre_migration_{}.backup", timestamp));
        match self.db.backup(&path).await {
            Ok(result) if result.success => {
                info!(path = %path.display(), "pre-migration backup created");
            }
            Ok(result) => {
                warn!(error = ?result.error, "pre-migration backup failed");
            }
            Err(e) => {
                warn!(error = %e, "pre-migration backup unavailable");
            }
        }
    }

    async fn ensure_journal_table(&self) -> Result<()> {
        let ddl = match self.db.current_backend() {
            BackendKind::Primary => format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    migration_id VARCHAR(36) PRIMARY KEY,
                    name VARCHAR(255) NOT NULL,
                    version VARCHAR(50) NOT NULL,
                    checksum VARCHAR(64) NOT NULL,
                    applied_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
                    rolled_back_at TIMESTAMP NULL,
                    execution_time FLOAT DEFAULT 0.0,
                    status VARCHAR(20) DEFAULT 'applied',
                    error_message TEXT NULL
                )",
                MIGRATIONS_TABLE
            ),
            BackendKind::Local => format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    migration_id TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    version TEXT NOT NULL,
                    checksum TEXT NOT NULL,
                    applied_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
                    rolled_back_at DATETIME NULL,
                    execution_time REAL DEFAULT 0.0,
                    status TEXT DEFAULT 'applied',
                    error_message TEXT NULL
                )",
                MIGRATIONS_TABLE
            ),
        };

        let result = self.db.execute_query(&ddl, &Params::None, None).await?;
        if !result.success {
            return Err(TandemError::migration(
                "journal",
                format!(
                    "failed to create migrations table: {}",
                    result.error.unwrap_or_default()
                ),
            ));
        }
        Ok(())
    }

    async fn load_history(&self) -> Result<()> {
        let query = format!("SELECT * FROM {} ORDER BY applied_at", MIGRATIONS_TABLE);
        let result = match self.db.execute_query(&query, &Params::None, None).await {
            Ok(result) if result.success => result,
            Ok(_) | Err(_) => {
                warn!("failed to load migration history; starting empty");
                return Ok(());
            }
        };

        let mut history = Vec::with_capacity(result.rows.len());
        for row in &result.rows {
            let record = MigrationRecord {
                migration_id: row.get_str("migration_id").unwrap_or_default().to_string(),
                name: row.get_str("name").unwrap_or_default().to_string(),
                version: row.get_str("version").unwrap_or_default().to_string(),
                checksum: row.get_str("checksum").unwrap_or_default().to_string(),
                applied_at: row
                    .get_str("applied_at")
                    .and_then(parse_timestamp)
                    .unwrap_or_else(Utc::now),
                rolled_back_at: row.get_str("rolled_back_at").and_then(parse_timestamp),
                execution_time: row.get_f64("execution_time").unwrap_or(0.0),
                status: MigrationStatus::parse(row.get_str("status").unwrap_or("applied")),
                error: row.get_str("error_message").map(str::to_string),
            };
            history.push(record);
        }

        if let Some(latest) = history
            .iter()
            .filter(|r| r.status == MigrationStatus::Applied)
            .max_by_key(|r| version_tuple(&r.version))
        {
            *self.current_version.lock() = latest.version.clone();
        }
        *self.history.lock() = history;
        Ok(())
    }

    async fn insert_record(
        &self,
        migration: &Migration,
        applied_at: DateTime<Utc>,
        execution_time: f64,
    ) -> Result<()> {
        let query = format!(
            "INSERT INTO {} (migration_id, name, version, checksum, applied_at, execution_time, status) \
             VALUES (:migration_id, :name, :version, :checksum, :applied_at, :execution_time, :status)",
            MIGRATIONS_TABLE
        );
        let params = Params::named([
            ("migration_id", SqlValue::Text(migration.id.clone())),
            ("name", SqlValue::Text(migration.name.clone())),
            ("version", SqlValue::Text(migration.version.clone())),
            ("checksum", SqlValue::Text(migration.checksum.clone())),
            ("applied_at", SqlValue::Text(applied_at.to_rfc3339())),
            ("execution_time", SqlValue::Float(execution_time)),
            (
                "status",
                SqlValue::Text(MigrationStatus::Applied.as_str().to_string()),
            ),
        ]);

        let result = self.db.execute_query(&query, &params, None).await?;
        if !result.success {
            return Err(TandemError::migration(
                migration.id.clone(),
                format!(
                    "failed to record migration: {}",
                    result.error.unwrap_or_default()
                ),
            ));
        }

        self.history.lock().push(MigrationRecord {
            migration_id: migration.id.clone(),
            name: migration.name.clone(),
            version: migration.version.clone(),
            checksum: migration.checksum.clone(),
            applied_at,
            rolled_back_at: None,
            execution_time,
            status: MigrationStatus::Applied,
            error: None,
        });
        Ok(())
    }

    async fn mark_record(&self, migration_id: &str, status: MigrationStatus) -> Result<()> {
        let rolled_back_at = (status == MigrationStatus::RolledBack).then(Utc::now);
        let query = format!(
            "UPDATE {} SET status = :status, rolled_back_at = :rolled_back_at \
             WHERE migration_id = :migration_id",
            MIGRATIONS_TABLE
        );
        let params = Params::named([
            ("status", SqlValue::Text(status.as_str().to_string())),
            (
                "rolled_back_at",
                rolled_back_at
                    .map(|t| SqlValue::Text(t.to_rfc3339()))
                    .unwrap_or(SqlValue::Null),
            ),
            ("migration_id", SqlValue::Text(migration_id.to_string())),
        ]);

        let result = self.db.execute_query(&query, &params, None).await?;
        if !result.success {
            return Err(TandemError::migration(
                migration_id.to_string(),
                format!(
                    "failed to update migration record: {}",
                    result.error.unwrap_or_default()
                ),
            ));
        }

        let mut history = self.history.lock();
        if let Some(record) = history.iter_mut().find(|r| r.migration_id == migration_id) {
            record.status = status;
            record.rolled_back_at = rolled_back_at;
        }
        Ok(())
    }
}

fn elapsed_secs(started: DateTime<Utc>) -> f64 {
    (Utc::now() - started).num_milliseconds() as f64 / 1000.0
}

fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .ok()
}

/// Tuple-wise version comparison key. Missing fields default to zero;
/// invalid strings degrade to (0, 0, 0).
pub fn version_tuple(version: &str) -> (u64, u64, u64) {
    let mut parts = version.split('.');
    let mut next = || {
        parts
            .next()
            .map(|p| p.parse::<u64>().ok())
            .unwrap_or(Some(0))
    };
    match (next(), next(), next()) {
        (Some(major), Some(minor), Some(patch)) => (major, minor, patch),
        _ => (0, 0, 0),
    }
}

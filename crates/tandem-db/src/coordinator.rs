//! Caller-facing coordinator: routing, failover and JSON record helpers.
//!
//! One coordinator per process is the intended composition root. It owns
//! one adapter per configured backend, the connection pool, the transaction
//! coordinator, the deadlock detector and the performance monitor. Between
//! two failover events every operation lands on the same backend.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use tandem_common::{Result, TandemError};

use crate::adapter::{postgres::PostgresAdapter, sqlite::SqliteAdapter, BackendAdapter};
use crate::config::BackendConfig;
use crate::deadlock::{DeadlockDetector, DetectorConfig, DetectorStats};
use crate::monitor::{MonitorConfig, MonitorHealth, PerformanceMonitor, PerformanceSummary};
use crate::pool::{ConnectionLease, ConnectionPool, PoolConfig, PoolStatistics};
use crate::tenant::scoping;
use crate::transaction::{TransactionCoordinator, TxCoordinatorConfig, TxCoordinatorMetrics};
use crate::types::{
    BackendKind, BackupResult, HealthMetrics, Operation, OptimizationResult, Params, QueryResult,
    RestoreResult, SqlValue, TransactionResult,
};

/// Top-level configuration: one entry per backend plus subsystem settings.
#[derive(Debug, Clone, Default)]
pub struct CoordinatorConfig {
    pub primary: Option<BackendConfig>,
    pub local: Option<BackendConfig>,
    pub pool: PoolConfig,
    pub transactions: TxCoordinatorConfig,
    pub detector: DetectorConfig,
    pub monitor: MonitorConfig,
}

/// Combined subsystem statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelStatistics {
    pub transactions: TxCoordinatorMetrics,
    pub deadlocks: DetectorStats,
    pub performance: PerformanceSummary,
    pub pool: PoolStatistics,
}

/// Unified entry point over both backends with automatic failover.
pub struct Coordinator {
    pool: Arc<ConnectionPool>,
    transactions: Arc<TransactionCoordinator>,
    detector: Arc<DeadlockDetector>,
    monitor: Arc<PerformanceMonitor>,
    /// Standalone adapters for health, backup and optimization fan-out.
    adapters: HashMap<BackendKind, Arc<dyn BackendAdapter>>,
    current: Mutex<BackendKind>,
    failover_occurred: AtomicBool,
}

impl Coordinator {
    /// Builds the kernel, probes backend availability and picks the initial
    /// backend (PRIMARY when configured and reachable).
    pub async fn new(config: CoordinatorConfig) -> Result<Arc<Self>> {
        if config.primary.is_none() && config.local.is_none() {
            return Err(TandemError::ValidationFailure(
                "at least one backend must be configured".to_string(),
            ));
        }

        let pool = ConnectionPool::new(config.pool.clone());
        let mut adapters: HashMap<BackendKind, Arc<dyn BackendAdapter>> = HashMap::new();

        if let Some(primary) = &config.primary {
            pool.register_backend(primary.clone())?;
            adapters.insert(
                BackendKind::Primary,
                Arc::new(PostgresAdapter::new(primary.clone())?),
            );
        }
        if let Some(local) = &config.local {
            pool.register_backend(local.clone())?;
            adapters.insert(
                BackendKind::Local,
                Arc::new(SqliteAdapter::new(local.clone())?),
            );
        }

        let current = if adapters.contains_key(&BackendKind::Primary) {
            BackendKind::Primary
        } else {
            BackendKind::Local
        };

        // Availability probe: at least one backend must answer. An
        // unreachable PRIMARY stays current until the first acquire fails
        // over, so the failover flag reflects what actually happened.
        let mut any_available = false;
        for (kind, adapter) in &adapters {
            let health = adapter.health().await;
            if health.is_available {
                any_available = true;
            } else {
                warn!(backend = %kind, "configured backend unavailable at startup");
            }
        }
        if !any_available {
            pool.close_all().await;
            return Err(TandemError::connection("none", "no backends are available"));
        }

        let detector = DeadlockDetector::new(config.detector.clone());
        detector.start();
        let monitor = PerformanceMonitor::new(config.monitor.clone());
        monitor.start();
        let transactions = TransactionCoordinator::new(
            config.transactions.clone(),
            pool.clone(),
            detector.clone(),
            monitor.clone(),
        );

        info!(backend = %current, "coordinator initialized");
        Ok(Arc::new(Self {
            pool,
            transactions,
            detector,
            monitor,
            adapters,
            current: Mutex::new(current),
            failover_occurred: AtomicBool::new(false),
        }))
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn transactions(&self) -> &Arc<TransactionCoordinator> {
        &self.transactions
    }

    pub fn detector(&self) -> &Arc<DeadlockDetector> {
        &self.detector
    }

    pub fn monitor(&self) -> &Arc<PerformanceMonitor> {
        &self.monitor
    }

    pub fn current_backend(&self) -> BackendKind {
        *self.current.lock()
    }

    pub fn has_failover_occurred(&self) -> bool {
        self.failover_occurred.load(Ordering::SeqCst)
    }

    pub fn reset_failover_status(&self) {
        self.failover_occurred.store(false, Ordering::SeqCst);
    }

    /// Acquires a connection on the current backend, failing over to the
    /// alternate when the current one cannot supply a connection.
    #[instrument(skip(self))]
    pub async fn acquire(&self) -> Result<ConnectionLease> {
        let current = self.current_backend();
        let first = self.pool.acquire(Some(current), None).await;
        let first_error = match first {
            Ok(lease) => return Ok(lease),
            Err(e) => e,
        };

        let alternate = current.alternate();
        if !self.adapters.contains_key(&alternate) {
            return Err(first_error);
        }

        warn!(from = %current, to = %alternate, "attempting failover");
        match self.pool.acquire(Some(alternate), None).await {
            Ok(lease) => {
                *self.current.lock() = alternate;
                self.failover_occurred.store(true, Ordering::SeqCst);
                info!(backend = %alternate, "failover succeeded");
                Ok(lease)
            }
            Err(second_error) => {
                error!(primary_error = %first_error, fallback_error = %second_error, "both backends unavailable");
                Err(TandemError::FailoverFailure(format!(
                    "{} failed ({}); {} failed ({})",
                    current, first_error, alternate, second_error
                )))
            }
        }
    }

    /// Unconditionally switches to the alternate backend if it is
    /// configured and can supply a healthy connection.
    pub async fn force_failover(&self) -> bool {
        let current = self.current_backend();
        let alternate = current.alternate();
        if !self.adapters.contains_key(&alternate) {
            return false;
        }

        match self.pool.acquire(Some(alternate), None).await {
            Ok(lease) => {
                let _ = self.pool.release(lease).await;
                *self.current.lock() = alternate;
                self.failover_occurred.store(true, Ordering::SeqCst);
                info!(backend = %alternate, "forced failover succeeded");
                true
            }
            Err(e) => {
                error!(error = %e, "forced failover failed");
                false
            }
        }
    }

    /// Probes PRIMARY and switches back to it on success.
    pub async fn attempt_primary_recovery(&self) -> bool {
        if self.current_backend() != BackendKind::Local
            || !self.adapters.contains_key(&BackendKind::Primary)
        {
            return false;
        }

        match self.pool.acquire(Some(BackendKind::Primary), None).await {
            Ok(lease) => {
                let _ = self.pool.release(lease).await;
                *self.current.lock() = BackendKind::Primary;
                info!("primary backend recovered");
                true
            }
            Err(_) => false,
        }
    }

    /// Executes one query, optionally rewritten for tenant scoping.
    pub async fn execute_query(
        &self,
        query: &str,
        params: &Params,
        tenant_id: Option<&str>,
    ) -> Result<QueryResult> {
        let query = match tenant_id {
            Some(tenant) => scoping::scope_query(query, tenant)?,
            None => query.to_string(),
        };

        let lease = self.acquire().await?;
        match lease.execute(&query, params).await {
            Ok(result) => {
                let _ = self.pool.release(lease).await;
                Ok(result)
            }
            Err(e) => {
                self.discard_or_release(lease, &e).await;
                Err(e)
            }
        }
    }

    /// Executes operations atomically, with tenant scoping injected into
    /// tenant-aware operations.
    pub async fn execute_transaction(
        &self,
        operations: Vec<Operation>,
        tenant_id: Option<&str>,
    ) -> Result<TransactionResult> {
        let operations = match tenant_id {
            Some(tenant) => scoping::scope_operations(operations, tenant),
            None => operations,
        };

        let lease = self.acquire().await?;
        match lease.adapter().transact(&operations).await {
            Ok(result) => {
                let _ = self.pool.release(lease).await;
                Ok(result)
            }
            Err(e) => {
                self.discard_or_release(lease, &e).await;
                Err(e)
            }
        }
    }

    /// Connection-level faults drop the connection from the pool; other
    /// surfaced kinds (deadlocks, serialization failures) leave the healthy
    /// session in rotation.
    async fn discard_or_release(&self, lease: ConnectionLease, error: &TandemError) {
        match error {
            TandemError::ConnectionFailure { .. } | TandemError::HealthCheckFailure { .. } => {
                self.pool.on_failure(&lease).await;
            }
            _ => {
                let _ = self.pool.release(lease).await;
            }
        }
    }

    /// Stores a JSON document as text with a generated id and timestamps.
    /// Returns the record id.
    pub async fn store_json(
        &self,
        table: &str,
        data: &serde_json::Value,
        tenant_id: Option<&str>,
    ) -> Result<String> {
        let record_id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();

        let mut fields: Vec<(String, SqlValue)> = vec![
            ("id".to_string(), SqlValue::Text(record_id.clone())),
            (
                "data".to_string(),
                SqlValue::Text(serde_json::to_string(data)?),
            ),
            ("created_at".to_string(), SqlValue::Text(now.clone())),
            ("updated_at".to_string(), SqlValue::Text(now)),
        ];
        if let Some(tenant) = tenant_id {
            fields.push(("tenant_id".to_string(), SqlValue::Text(tenant.to_string())));
        }

        let op = Operation::insert(table, fields);
        let result = self.execute_transaction(vec![op], tenant_id).await?;
        if !result.success {
            return Err(TandemError::Query(format!(
                "failed to store JSON record: {}",
                result.error.unwrap_or_default()
            )));
        }
        Ok(record_id)
    }

    /// Finds records whose serialized JSON contains `"<path>":<value>`.
    ///
    /// This is a substring match over the text column, not a JSON-path
    /// evaluation: a value inside a nested string matches too. The pattern
    /// mirrors the compact serialization [`Coordinator::store_json`] writes.
    /// Rows whose `data` column parses as JSON come back with it expanded
    /// in place.
    pub async fn query_json(
        &self,
        table: &str,
        json_path: &str,
        value: &SqlValue,
        tenant_id: Option<&str>,
    ) -> Result<Vec<serde_json::Value>> {
        let pattern = format!("%\"{}\":{}%", json_path, value.json_literal());
        let query = format!("SELECT * FROM {} WHERE data LIKE :search_pattern", table);
        let params = Params::named([("search_pattern", SqlValue::Text(pattern))]);

        let result = self.execute_query(&query, &params, tenant_id).await?;
        if !result.success {
            return Err(TandemError::Query(format!(
                "failed to query JSON records: {}",
                result.error.unwrap_or_default()
            )));
        }

        let mut records = Vec::with_capacity(result.rows.len());
        for row in &result.rows {
            let mut json = row.to_json();
            if let Some(serde_json::Value::String(text)) = json.get("data").cloned() {
                if let Ok(parsed) = serde_json::from_str::<serde_json::Value>(&text) {
                    json["data"] = parsed;
                }
            }
            records.push(json);
        }
        Ok(records)
    }

    /// Backs up the current backend. PRIMARY reports `Unsupported`.
    pub async fn backup(&self, path: &Path) -> Result<BackupResult> {
        let adapter = self.current_adapter()?;
        adapter.backup(path).await
    }

    /// Restores the current backend from a backup file. Pooled sessions of
    /// that backend are purged afterwards so no one reads pre-restore state.
    pub async fn restore(&self, path: &Path) -> Result<RestoreResult> {
        let current = self.current_backend();
        let adapter = self.current_adapter()?;
        let result = adapter.restore(path).await?;
        if result.success {
            let purged = self.pool.purge_backend(current).await;
            info!(backend = %current, purged, "pooled sessions purged after restore");
        }
        Ok(result)
    }

    /// Health metrics per configured backend.
    pub async fn health(&self) -> HashMap<BackendKind, HealthMetrics> {
        let mut out = HashMap::new();
        for (kind, adapter) in &self.adapters {
            out.insert(*kind, adapter.health().await);
        }
        out
    }

    /// Optimization pass per configured backend.
    pub async fn optimize(&self) -> HashMap<BackendKind, OptimizationResult> {
        let mut out = HashMap::new();
        for (kind, adapter) in &self.adapters {
            match adapter.optimize().await {
                Ok(result) => {
                    out.insert(*kind, result);
                }
                Err(e) => {
                    error!(backend = %kind, error = %e, "optimization failed");
                }
            }
        }
        out
    }

    /// Combined statistics from every subsystem.
    pub fn statistics(&self) -> KernelStatistics {
        KernelStatistics {
            transactions: self.transactions.metrics(),
            deadlocks: self.detector.stats(),
            performance: self.monitor.summary(),
            pool: self.pool.statistics(),
        }
    }

    /// Transaction-system health check.
    pub fn health_check(&self) -> MonitorHealth {
        self.monitor.health()
    }

    /// Stops every subsystem and closes all connections.
    pub async fn shutdown(&self) {
        self.transactions.shutdown().await;
        self.detector.stop().await;
        self.monitor.stop().await;
        for adapter in self.adapters.values() {
            let _ = adapter.disconnect().await;
        }
        self.pool.close_all().await;
        info!("coordinator shut down");
    }

    fn current_adapter(&self) -> Result<&Arc<dyn BackendAdapter>> {
        let current = self.current_backend();
        self.adapters.get(&current).ok_or_else(|| {
            TandemError::Internal(format!("no adapter for current backend {}", current))
        })
    }
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("current", &self.current_backend())
            .field("failover_occurred", &self.has_failover_occurred())
            .field("backends", &self.adapters.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn local_coordinator() -> (tempfile::TempDir, Arc<Coordinator>) {
        let dir = tempfile::tempdir().unwrap();
        let config = CoordinatorConfig {
            local: Some(BackendConfig::local_path(dir.path().join("kernel.db"))),
            ..Default::default()
        };
        let coordinator = Coordinator::new(config).await.unwrap();
        (dir, coordinator)
    }

    #[tokio::test]
    async fn test_requires_a_backend() {
        let err = Coordinator::new(CoordinatorConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, TandemError::ValidationFailure(_)));
    }

    #[tokio::test]
    async fn test_local_only_starts_on_local() {
        let (_dir, db) = local_coordinator().await;
        assert_eq!(db.current_backend(), BackendKind::Local);
        assert!(!db.has_failover_occurred());
        db.shutdown().await;
    }

    #[tokio::test]
    async fn test_execute_query_roundtrip() {
        let (_dir, db) = local_coordinator().await;
        let result = db
            .execute_query("CREATE TABLE notes (id TEXT, body TEXT)", &Params::None, None)
            .await
            .unwrap();
        assert!(result.success);

        let result = db
            .execute_query(
                "INSERT INTO notes (id, body) VALUES (:id, :body)",
                &Params::named([
                    ("id", SqlValue::from("n1")),
                    ("body", SqlValue::from("hello")),
                ]),
                None,
            )
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.rows_affected, 1);
        db.shutdown().await;
    }

    #[tokio::test]
    async fn test_execute_transaction_atomic() {
        let (_dir, db) = local_coordinator().await;
        db.execute_query(
            "CREATE TABLE pairs (k TEXT NOT NULL, v TEXT)",
            &Params::None,
            None,
        )
        .await
        .unwrap();

        let ops = vec![
            Operation::insert("pairs", [("k", SqlValue::from("a")), ("v", SqlValue::from("1"))]),
            Operation::insert("pairs", [("k", SqlValue::Null)]),
        ];
        let result = db.execute_transaction(ops, None).await.unwrap();
        assert!(!result.success);
        assert!(result.rollback_performed);

        let count = db
            .execute_query("SELECT COUNT(*) AS n FROM pairs", &Params::None, None)
            .await
            .unwrap();
        assert_eq!(count.rows[0].get_i64("n"), Some(0));
        db.shutdown().await;
    }

    #[tokio::test]
    async fn test_store_and_query_json() {
        let (_dir, db) = local_coordinator().await;
        db.execute_query(
            "CREATE TABLE documents (id TEXT PRIMARY KEY, data TEXT, created_at TEXT, updated_at TEXT)",
            &Params::None,
            None,
        )
        .await
        .unwrap();

        let payload = serde_json::json!({"name": "flow-1", "nodes": 3});
        let id = db.store_json("documents", &payload, None).await.unwrap();
        assert!(!id.is_empty());

        let hits = db
            .query_json("documents", "name", &SqlValue::from("flow-1"), None)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0]["data"]["nodes"], serde_json::json!(3));

        let misses = db
            .query_json("documents", "name", &SqlValue::from("flow-2"), None)
            .await
            .unwrap();
        assert!(misses.is_empty());
        db.shutdown().await;
    }

    #[tokio::test]
    async fn test_backup_restore_on_local() {
        let (dir, db) = local_coordinator().await;
        db.execute_query("CREATE TABLE t (v TEXT)", &Params::None, None)
            .await
            .unwrap();
        db.execute_query("INSERT INTO t (v) VALUES ('x')", &Params::None, None)
            .await
            .unwrap();

        let backup_path = dir.path().join("snapshot.db");
        let backup = db.backup(&backup_path).await.unwrap();
        assert!(backup.success);

        db.execute_query("DELETE FROM t", &Params::None, None)
            .await
            .unwrap();
        let restore = db.restore(&backup_path).await.unwrap();
        assert!(restore.success);

        let rows = db
            .execute_query("SELECT v FROM t", &Params::None, None)
            .await
            .unwrap();
        assert_eq!(rows.rows.len(), 1);
        db.shutdown().await;
    }

    #[tokio::test]
    async fn test_health_and_statistics() {
        let (_dir, db) = local_coordinator().await;
        let health = db.health().await;
        assert!(health[&BackendKind::Local].is_available);

        let stats = db.statistics();
        assert_eq!(stats.transactions.total_transactions, 0);
        db.shutdown().await;
    }

    #[tokio::test]
    async fn test_force_failover_without_alternate() {
        let (_dir, db) = local_coordinator().await;
        assert!(!db.force_failover().await);
        assert!(!db.attempt_primary_recovery().await);
        db.shutdown().await;
    }

    #[tokio::test]
    async fn test_optimize_runs_on_local() {
        let (_dir, db) = local_coordinator().await;
        let results = db.optimize().await;
        assert!(results[&BackendKind::Local].success);
        db.shutdown().await;
    }
}

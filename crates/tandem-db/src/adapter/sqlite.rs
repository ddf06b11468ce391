//! LOCAL backend adapter over SQLite.

use std::path::Path;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{
    SqliteArguments, SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqliteRow,
};
use sqlx::{Column, ConnectOptions, Row as SqlxRow, TypeInfo};
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use tandem_common::{Result, TandemError};

use crate::adapter::{
    build_operation_query, classify_error, prepare_statement, returns_rows, surfaces_as_error,
    BackendAdapter, PlaceholderStyle,
};
use crate::config::BackendConfig;
use crate::types::{
    BackendKind, BackupResult, ConnectionHandle, HealthMetrics, Operation, OperationKind,
    OptimizationResult, Params, QueryResult, RestoreResult, Row, SqlValue, TransactionResult,
};

type SqliteQuery<'q> = sqlx::query::Query<'q, sqlx::Sqlite, SqliteArguments<'q>>;

/// SQLite adapter owning a single live session.
pub struct SqliteAdapter {
    config: BackendConfig,
    session: Mutex<Option<SqliteConnection>>,
}

impl SqliteAdapter {
    pub fn new(config: BackendConfig) -> Result<Self> {
        config.validate()?;
        if config.kind != BackendKind::Local {
            return Err(TandemError::ValidationFailure(
                "SqliteAdapter requires a local backend config".to_string(),
            ));
        }
        Ok(Self {
            config,
            session: Mutex::new(None),
        })
    }

    fn bind<'q>(query: SqliteQuery<'q>, value: &SqlValue) -> SqliteQuery<'q> {
        match value {
            SqlValue::Null => query.bind(Option::<String>::None),
            SqlValue::Bool(v) => query.bind(*v),
            SqlValue::Int(v) => query.bind(*v),
            SqlValue::Float(v) => query.bind(*v),
            SqlValue::Text(v) => query.bind(v.clone()),
            // SQLite has no JSON column type; structured payloads are text.
            SqlValue::Json(v) => query.bind(v.to_string()),
        }
    }

    fn decode_row(row: &SqliteRow) -> Row {
        let mut columns = Vec::with_capacity(row.columns().len());
        let mut values = Vec::with_capacity(row.columns().len());

        for (i, column) in row.columns().iter().enumerate() {
            columns.push(column.name().to_string());
            let type_name = column.type_info().name().to_string();
            values.push(Self::decode_value(row, i, &type_name));
        }

        Row::new(columns, values)
    }

    fn decode_value(row: &SqliteRow, index: usize, type_name: &str) -> SqlValue {
        match type_name {
            "INTEGER" | "BOOLEAN" => match row.try_get::<Option<i64>, _>(index) {
                Ok(Some(v)) => SqlValue::Int(v),
                _ => SqlValue::Null,
            },
            "REAL" => match row.try_get::<Option<f64>, _>(index) {
                Ok(Some(v)) => SqlValue::Float(v),
                _ => SqlValue::Null,
            },
            "NULL" => SqlValue::Null,
            // TEXT, DATETIME, DATE and everything else declared textual
            _ => match row.try_get::<Option<String>, _>(index) {
                Ok(Some(v)) => SqlValue::Text(v),
                _ => SqlValue::Null,
            },
        }
    }

    async fn run_statement(
        conn: &mut SqliteConnection,
        sql: &str,
        values: &[SqlValue],
    ) -> std::result::Result<(u64, Vec<Row>), sqlx::Error> {
        let mut query = sqlx::query(sql);
        for value in values {
            query = Self::bind(query, value);
        }

        if returns_rows(sql) {
            let rows = query.fetch_all(&mut *conn).await?;
            let decoded: Vec<Row> = rows.iter().map(Self::decode_row).collect();
            let count = decoded.len() as u64;
            Ok((count, decoded))
        } else {
            let done = query.execute(&mut *conn).await?;
            Ok((done.rows_affected(), Vec::new()))
        }
    }

    fn database_path(&self) -> Result<std::path::PathBuf> {
        self.config.local_database_path()
    }
}

#[async_trait]
impl BackendAdapter for SqliteAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    fn descriptor(&self) -> String {
        self.config.descriptor()
    }

    #[instrument(skip(self), fields(backend = "local"))]
    async fn connect(&self) -> Result<ConnectionHandle> {
        let path = self.database_path()?;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| TandemError::connection("local", e.to_string()))?;
            }
        }

        // Rollback-journal mode keeps the database in a single file, which
        // the byte-copy backup/restore contract depends on.
        let options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Delete);

        let conn = options
            .connect()
            .await
            .map_err(|e| TandemError::connection("local", e.to_string()))?;

        let mut guard = self.session.lock().await;
        *guard = Some(conn);
        debug!(path = %path.display(), "local session established");

        Ok(ConnectionHandle::new(
            BackendKind::Local,
            path.display().to_string(),
        ))
    }

    async fn disconnect(&self) -> Result<()> {
        let mut guard = self.session.lock().await;
        if let Some(conn) = guard.take() {
            if let Err(e) = sqlx::Connection::close(conn).await {
                warn!(error = %e, "local session close reported an error");
            }
        }
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        let mut guard = self.session.lock().await;
        match guard.as_mut() {
            Some(conn) => sqlx::query("SELECT 1").execute(&mut *conn).await.is_ok(),
            None => false,
        }
    }

    async fn ping(&self) -> Result<()> {
        let mut guard = self.session.lock().await;
        let conn = guard
            .as_mut()
            .ok_or_else(|| TandemError::connection("local", "not connected"))?;
        sqlx::query("SELECT 1")
            .execute(&mut *conn)
            .await
            .map_err(|e| TandemError::HealthCheckFailure {
                backend: "local".to_string(),
                message: e.to_string(),
            })?;
        Ok(())
    }

    async fn execute(&self, query: &str, params: &Params) -> Result<QueryResult> {
        let start = Instant::now();
        let (sql, values) = prepare_statement(query, params, PlaceholderStyle::Question)?;

        let mut guard = self.session.lock().await;
        let conn = guard
            .as_mut()
            .ok_or_else(|| TandemError::connection("local", "not connected"))?;

        match Self::run_statement(conn, &sql, &values).await {
            Ok((rows_affected, rows)) => Ok(QueryResult::ok(rows_affected, rows, start.elapsed())),
            Err(e) => {
                let err = classify_error(e, BackendKind::Local);
                warn!(error = %err, sql = %sql.chars().take(80).collect::<String>(), "local statement failed");
                if surfaces_as_error(&err) {
                    Err(err)
                } else {
                    Ok(QueryResult::failure(err.to_string(), start.elapsed()))
                }
            }
        }
    }

    async fn transact(&self, ops: &[Operation]) -> Result<TransactionResult> {
        let start = Instant::now();
        let tx_id = Uuid::new_v4();

        let mut guard = self.session.lock().await;
        let conn = guard
            .as_mut()
            .ok_or_else(|| TandemError::connection("local", "not connected"))?;

        sqlx::query("BEGIN")
            .execute(&mut *conn)
            .await
            .map_err(|e| {
                let err = classify_error(e, BackendKind::Local);
                if surfaces_as_error(&err) {
                    err
                } else {
                    TandemError::TransactionFailure {
                        message: format!("failed to begin transaction: {}", err),
                        rollback_performed: false,
                    }
                }
            })?;

        let mut failure: Option<TandemError> = None;
        for op in ops {
            let prepared = match (&op.raw_query, op.kind) {
                (Some(raw), _) => prepare_statement(raw, &op.params, PlaceholderStyle::Question),
                (None, OperationKind::Raw) | (None, OperationKind::Ddl) => Err(
                    TandemError::ValidationFailure("raw operation without query text".to_string()),
                ),
                (None, _) => build_operation_query(op, PlaceholderStyle::Question),
            };

            let (sql, values) = match prepared {
                Ok(p) => p,
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            };

            if let Err(e) = Self::run_statement(conn, &sql, &values).await {
                failure = Some(classify_error(e, BackendKind::Local));
                break;
            }
        }

        if let Some(err) = failure {
            let rollback_performed = sqlx::query("ROLLBACK").execute(&mut *conn).await.is_ok();
            if surfaces_as_error(&err) {
                warn!(tx_id = %tx_id, error = %err, rollback_performed, "local transaction aborted");
                return Err(err);
            }
            return Ok(TransactionResult {
                success: false,
                tx_id,
                ops_count: ops.len(),
                rollback_performed,
                error: Some(err.to_string()),
                elapsed: start.elapsed(),
            });
        }

        if let Err(e) = sqlx::query("COMMIT").execute(&mut *conn).await {
            let err = classify_error(e, BackendKind::Local);
            let rollback_performed = sqlx::query("ROLLBACK").execute(&mut *conn).await.is_ok();
            if surfaces_as_error(&err) {
                warn!(tx_id = %tx_id, error = %err, rollback_performed, "local commit aborted");
                return Err(err);
            }
            return Ok(TransactionResult {
                success: false,
                tx_id,
                ops_count: ops.len(),
                rollback_performed,
                error: Some(format!("commit failed: {}", err)),
                elapsed: start.elapsed(),
            });
        }

        Ok(TransactionResult {
            success: true,
            tx_id,
            ops_count: ops.len(),
            rollback_performed: false,
            error: None,
            elapsed: start.elapsed(),
        })
    }

    async fn health(&self) -> HealthMetrics {
        let start = Instant::now();

        if !self.is_connected().await {
            if self.connect().await.is_err() {
                return HealthMetrics::unavailable(
                    BackendKind::Local,
                    start.elapsed(),
                    "cannot connect to database".to_string(),
                );
            }
        }

        // A single embedded session: one active connection, capacity one.
        HealthMetrics {
            backend: BackendKind::Local,
            is_available: true,
            response_time: start.elapsed(),
            active_connections: 1,
            max_connections: 1,
            error_count: 0,
            warnings: Vec::new(),
            last_check: Utc::now(),
        }
    }

    async fn backup(&self, path: &Path) -> Result<BackupResult> {
        let database_path = self.database_path()?;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| TandemError::Query(e.to_string()))?;
            }
        }

        match tokio::fs::copy(&database_path, path).await {
            Ok(bytes) => Ok(BackupResult {
                success: true,
                backup_path: path.to_path_buf(),
                backup_size: bytes,
                backup_time: Utc::now(),
                error: None,
            }),
            Err(e) => Ok(BackupResult {
                success: false,
                backup_path: path.to_path_buf(),
                backup_size: 0,
                backup_time: Utc::now(),
                error: Some(e.to_string()),
            }),
        }
    }

    async fn restore(&self, path: &Path) -> Result<RestoreResult> {
        let database_path = self.database_path()?;

        // The session must be closed before the file is swapped out.
        self.disconnect().await?;

        if let Err(e) = tokio::fs::copy(path, &database_path).await {
            return Ok(RestoreResult {
                success: false,
                restore_path: path.to_path_buf(),
                restore_time: Utc::now(),
                error: Some(e.to_string()),
            });
        }

        self.connect().await?;

        Ok(RestoreResult {
            success: true,
            restore_path: path.to_path_buf(),
            restore_time: Utc::now(),
            error: None,
        })
    }

    async fn optimize(&self) -> Result<OptimizationResult> {
        let start = Instant::now();
        let mut applied = Vec::new();

        let vacuum = self.execute("VACUUM", &Params::None).await?;
        if vacuum.success {
            applied.push("reclaimed unused space".to_string());
        }

        let analyze = self.execute("ANALYZE", &Params::None).await?;
        if analyze.success {
            applied.push("updated table statistics".to_string());
        }

        Ok(OptimizationResult {
            success: true,
            optimizations_applied: applied,
            elapsed: start.elapsed(),
            error: None,
        })
    }

    async fn table_info(&self, table: &str) -> Result<Vec<Row>> {
        let result = self
            .execute(&format!("PRAGMA table_info({})", table), &Params::None)
            .await?;
        if !result.success {
            return Err(TandemError::Query(
                result.error.unwrap_or_else(|| "table_info failed".to_string()),
            ));
        }
        Ok(result.rows)
    }
}

impl std::fmt::Debug for SqliteAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteAdapter")
            .field("descriptor", &self.config.descriptor())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Operation;

    fn temp_adapter() -> (tempfile::TempDir, SqliteAdapter) {
        let dir = tempfile::tempdir().unwrap();
        let config = BackendConfig::local_path(dir.path().join("test.db"));
        let adapter = SqliteAdapter::new(config).unwrap();
        (dir, adapter)
    }

    #[test]
    fn test_new_rejects_primary_config() {
        let config = BackendConfig::primary_url("postgresql://localhost/app");
        assert!(SqliteAdapter::new(config).is_err());
    }

    #[tokio::test]
    async fn test_connect_execute_roundtrip() {
        let (_dir, adapter) = temp_adapter();
        let handle = adapter.connect().await.unwrap();
        assert_eq!(handle.kind, BackendKind::Local);
        assert!(adapter.is_connected().await);

        let result = adapter
            .execute(
                "CREATE TABLE items (id INTEGER PRIMARY KEY, name TEXT)",
                &Params::None,
            )
            .await
            .unwrap();
        assert!(result.success, "{:?}", result.error);

        let result = adapter
            .execute(
                "INSERT INTO items (name) VALUES (:name)",
                &Params::named([("name", SqlValue::from("widget"))]),
            )
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.rows_affected, 1);

        let result = adapter
            .execute("SELECT id, name FROM items", &Params::None)
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.rows.len(), 1);
        assert_eq!(result.rows[0].get_str("name"), Some("widget"));
        assert_eq!(result.rows[0].get_i64("id"), Some(1));
    }

    #[tokio::test]
    async fn test_statement_failure_is_reported_in_result() {
        let (_dir, adapter) = temp_adapter();
        adapter.connect().await.unwrap();

        let result = adapter
            .execute("SELECT * FROM missing_table", &Params::None)
            .await
            .unwrap();
        assert!(!result.success);
        assert!(result.error.is_some());
    }

    #[tokio::test]
    async fn test_transact_applies_all_or_nothing() {
        let (_dir, adapter) = temp_adapter();
        adapter.connect().await.unwrap();
        adapter
            .execute(
                "CREATE TABLE accounts (id INTEGER PRIMARY KEY, name TEXT NOT NULL)",
                &Params::None,
            )
            .await
            .unwrap();

        // Second op violates NOT NULL; the first insert must not survive.
        let ops = vec![
            Operation::insert("accounts", [("name", SqlValue::from("a"))]),
            Operation::insert("accounts", [("name", SqlValue::Null)]),
        ];
        let result = adapter.transact(&ops).await.unwrap();
        assert!(!result.success);
        assert!(result.rollback_performed);

        let count = adapter
            .execute("SELECT COUNT(*) AS n FROM accounts", &Params::None)
            .await
            .unwrap();
        assert_eq!(count.rows[0].get_i64("n"), Some(0));
    }

    #[tokio::test]
    async fn test_backup_restore_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let config = BackendConfig::local_path(dir.path().join("main.db"));
        let adapter = SqliteAdapter::new(config).unwrap();
        adapter.connect().await.unwrap();

        adapter
            .execute("CREATE TABLE t (v TEXT)", &Params::None)
            .await
            .unwrap();
        adapter
            .execute(
                "INSERT INTO t (v) VALUES (:v)",
                &Params::named([("v", SqlValue::from("keep"))]),
            )
            .await
            .unwrap();

        let backup_path = dir.path().join("backup.db");
        let backup = adapter.backup(&backup_path).await.unwrap();
        assert!(backup.success);
        assert!(backup.backup_size > 0);

        adapter
            .execute("DELETE FROM t WHERE v = 'keep'", &Params::None)
            .await
            .unwrap();

        let restore = adapter.restore(&backup_path).await.unwrap();
        assert!(restore.success);

        let rows = adapter
            .execute("SELECT v FROM t", &Params::None)
            .await
            .unwrap();
        assert_eq!(rows.rows.len(), 1);
        assert_eq!(rows.rows[0].get_str("v"), Some("keep"));
    }

    #[tokio::test]
    async fn test_optimize_reports_passes() {
        let (_dir, adapter) = temp_adapter();
        adapter.connect().await.unwrap();
        let result = adapter.optimize().await.unwrap();
        assert!(result.success);
        assert_eq!(result.optimizations_applied.len(), 2);
    }

    #[tokio::test]
    async fn test_table_info() {
        let (_dir, adapter) = temp_adapter();
        adapter.connect().await.unwrap();
        adapter
            .execute("CREATE TABLE t (id INTEGER, name TEXT)", &Params::None)
            .await
            .unwrap();

        let info = adapter.table_info("t").await.unwrap();
        assert_eq!(info.len(), 2);
        let missing = adapter.table_info("nope").await.unwrap();
        assert!(missing.is_empty());
    }
}

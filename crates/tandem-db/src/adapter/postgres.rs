//! PRIMARY backend adapter over PostgreSQL.

use std::path::Path;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use sqlx::postgres::{PgArguments, PgConnection, PgRow};
use sqlx::{Column, Connection, Row as SqlxRow, TypeInfo};
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

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
use uuid::Uuid;

type PgQuery<'q> = sqlx::query::Query<'q, sqlx::Postgres, PgArguments>;

/// PostgreSQL adapter owning a single live session.
pub struct PostgresAdapter {
    config: BackendConfig,
    session: Mutex<Option<PgConnection>>,
}

impl PostgresAdapter {
    pub fn new(config: BackendConfig) -> Result<Self> {
        config.validate()?;
        if config.kind != BackendKind::Primary {
            return Err(TandemError::ValidationFailure(
                "PostgresAdapter requires a primary backend config".to_string(),
            ));
        }
        Ok(Self {
            config,
            session: Mutex::new(None),
        })
    }

    fn bind<'q>(query: PgQuery<'q>, value: &SqlValue) -> PgQuery<'q> {
        match value {
            SqlValue::Null => query.bind(Option::<String>::None),
            SqlValue::Bool(v) => query.bind(*v),
            SqlValue::Int(v) => query.bind(*v),
            SqlValue::Float(v) => query.bind(*v),
            SqlValue::Text(v) => query.bind(v.clone()),
            SqlValue::Json(v) => query.bind(v.clone()),
        }
    }

    fn decode_row(row: &PgRow) -> Row {
        let mut columns = Vec::with_capacity(row.columns().len());
        let mut values = Vec::with_capacity(row.columns().len());

        for (i, column) in row.columns().iter().enumerate() {
            columns.push(column.name().to_string());
            let type_name = column.type_info().name().to_string();
            values.push(Self::decode_value(row, i, &type_name));
        }

        Row::new(columns, values)
    }

    fn decode_value(row: &PgRow, index: usize, type_name: &str) -> SqlValue {
        match type_name {
            "BOOL" => match row.try_get::<Option<bool>, _>(index) {
                Ok(Some(v)) => SqlValue::Bool(v),
                _ => SqlValue::Null,
            },
            "INT2" => match row.try_get::<Option<i16>, _>(index) {
                Ok(Some(v)) => SqlValue::Int(v as i64),
                _ => SqlValue::Null,
            },
            "INT4" => match row.try_get::<Option<i32>, _>(index) {
                Ok(Some(v)) => SqlValue::Int(v as i64),
                _ => SqlValue::Null,
            },
            "INT8" => match row.try_get::<Option<i64>, _>(index) {
                Ok(Some(v)) => SqlValue::Int(v),
                _ => SqlValue::Null,
            },
            "FLOAT4" => match row.try_get::<Option<f32>, _>(index) {
                Ok(Some(v)) => SqlValue::Float(v as f64),
                _ => SqlValue::Null,
            },
            "FLOAT8" => match row.try_get::<Option<f64>, _>(index) {
                Ok(Some(v)) => SqlValue::Float(v),
                _ => SqlValue::Null,
            },
            "TEXT" | "VARCHAR" | "CHAR" | "BPCHAR" | "NAME" => {
                match row.try_get::<Option<String>, _>(index) {
                    Ok(Some(v)) => SqlValue::Text(v),
                    _ => SqlValue::Null,
                }
            }
            "UUID" => match row.try_get::<Option<Uuid>, _>(index) {
                Ok(Some(v)) => SqlValue::Text(v.to_string()),
                _ => SqlValue::Null,
            },
            "TIMESTAMP" => match row.try_get::<Option<NaiveDateTime>, _>(index) {
                Ok(Some(v)) => SqlValue::Text(v.to_string()),
                _ => SqlValue::Null,
            },
            "TIMESTAMPTZ" => match row.try_get::<Option<DateTime<Utc>>, _>(index) {
                Ok(Some(v)) => SqlValue::Text(v.to_rfc3339()),
                _ => SqlValue::Null,
            },
            "DATE" => match row.try_get::<Option<NaiveDate>, _>(index) {
                Ok(Some(v)) => SqlValue::Text(v.to_string()),
                _ => SqlValue::Null,
            },
            "JSON" | "JSONB" => match row.try_get::<Option<serde_json::Value>, _>(index) {
                Ok(Some(v)) => SqlValue::Json(v),
                _ => SqlValue::Null,
            },
            _ => match row.try_get::<Option<String>, _>(index) {
                Ok(Some(v)) => SqlValue::Text(v),
                _ => SqlValue::Null,
            },
        }
    }

    async fn run_statement(
        conn: &mut PgConnection,
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
}

#[async_trait]
impl BackendAdapter for PostgresAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::Primary
    }

    fn descriptor(&self) -> String {
        self.config.descriptor()
    }

    #[instrument(skip(self), fields(backend = "primary"))]
    async fn connect(&self) -> Result<ConnectionHandle> {
        let url = self.config.primary_connection_url()?;
        let conn = PgConnection::connect(&url)
            .await
            .map_err(|e| TandemError::connection("primary", e.to_string()))?;

        let mut guard = self.session.lock().await;
        *guard = Some(conn);
        debug!("primary session established");

        Ok(ConnectionHandle::new(
            BackendKind::Primary,
            self.config.descriptor(),
        ))
    }

    async fn disconnect(&self) -> Result<()> {
        let mut guard = self.session.lock().await;
        if let Some(conn) = guard.take() {
            if let Err(e) = conn.close().await {
                warn!(error = %e, "primary session close reported an error");
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
            .ok_or_else(|| TandemError::connection("primary", "not connected"))?;
        sqlx::query("SELECT 1")
            .execute(&mut *conn)
            .await
            .map_err(|e| TandemError::HealthCheckFailure {
                backend: "primary".to_string(),
                message: e.to_string(),
            })?;
        Ok(())
    }

    async fn execute(&self, query: &str, params: &Params) -> Result<QueryResult> {
        let start = Instant::now();
        let (sql, values) = prepare_statement(query, params, PlaceholderStyle::Numbered)?;

        let mut guard = self.session.lock().await;
        let conn = guard
            .as_mut()
            .ok_or_else(|| TandemError::connection("primary", "not connected"))?;

        match Self::run_statement(conn, &sql, &values).await {
            Ok((rows_affected, rows)) => Ok(QueryResult::ok(rows_affected, rows, start.elapsed())),
            Err(e) => {
                let err = classify_error(e, BackendKind::Primary);
                warn!(error = %err, sql = %sql.chars().take(80).collect::<String>(), "primary statement failed");
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
            .ok_or_else(|| TandemError::connection("primary", "not connected"))?;

        sqlx::query("BEGIN")
            .execute(&mut *conn)
            .await
            .map_err(|e| {
                let err = classify_error(e, BackendKind::Primary);
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
                (Some(raw), _) => prepare_statement(raw, &op.params, PlaceholderStyle::Numbered),
                (None, OperationKind::Raw) | (None, OperationKind::Ddl) => Err(
                    TandemError::ValidationFailure("raw operation without query text".to_string()),
                ),
                (None, _) => build_operation_query(op, PlaceholderStyle::Numbered),
            };

            let (sql, values) = match prepared {
                Ok(p) => p,
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            };

            if let Err(e) = Self::run_statement(conn, &sql, &values).await {
                failure = Some(classify_error(e, BackendKind::Primary));
                break;
            }
        }

        if let Some(err) = failure {
            let rollback_performed = sqlx::query("ROLLBACK").execute(&mut *conn).await.is_ok();
            if surfaces_as_error(&err) {
                warn!(tx_id = %tx_id, error = %err, rollback_performed, "primary transaction aborted");
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
            let err = classify_error(e, BackendKind::Primary);
            let rollback_performed = sqlx::query("ROLLBACK").execute(&mut *conn).await.is_ok();
            if surfaces_as_error(&err) {
                warn!(tx_id = %tx_id, error = %err, rollback_performed, "primary commit aborted");
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

    #[instrument(skip(self), fields(backend = "primary"))]
    async fn health(&self) -> HealthMetrics {
        let start = Instant::now();

        if !self.is_connected().await {
            if self.connect().await.is_err() {
                return HealthMetrics::unavailable(
                    BackendKind::Primary,
                    start.elapsed(),
                    "cannot connect to database".to_string(),
                );
            }
        }

        let stats_query = "SELECT count(*) AS active_connections, setting::int AS max_connections \
                           FROM pg_stat_activity, pg_settings \
                           WHERE pg_settings.name = 'max_connections' GROUP BY setting";

        match self.execute(stats_query, &Params::None).await {
            Ok(result) if result.success && !result.rows.is_empty() => {
                let row = &result.rows[0];
                HealthMetrics {
                    backend: BackendKind::Primary,
                    is_available: true,
                    response_time: start.elapsed(),
                    active_connections: row.get_i64("active_connections").unwrap_or(1) as u32,
                    max_connections: row.get_i64("max_connections").unwrap_or(100) as u32,
                    error_count: 0,
                    warnings: Vec::new(),
                    last_check: Utc::now(),
                }
            }
            Ok(_) => HealthMetrics {
                backend: BackendKind::Primary,
                is_available: true,
                response_time: start.elapsed(),
                active_connections: 1,
                max_connections: 100,
                error_count: 0,
                warnings: vec!["could not retrieve detailed statistics".to_string()],
                last_check: Utc::now(),
            },
            Err(e) => HealthMetrics::unavailable(BackendKind::Primary, start.elapsed(), e.to_string()),
        }
    }

    async fn backup(&self, _path: &Path) -> Result<BackupResult> {
        // Intentional: PRIMARY backup goes through external tooling, never
        // through the kernel.
        Err(TandemError::Unsupported(
            "primary backend backup requires external tooling".to_string(),
        ))
    }

    async fn restore(&self, _path: &Path) -> Result<RestoreResult> {
        Err(TandemError::Unsupported(
            "primary backend restore requires external tooling".to_string(),
        ))
    }

    async fn optimize(&self) -> Result<OptimizationResult> {
        let start = Instant::now();
        let mut applied = Vec::new();

        let result = self.execute("ANALYZE", &Params::None).await?;
        if result.success {
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
        let query = "SELECT column_name, data_type, is_nullable, column_default \
                     FROM information_schema.columns \
                     WHERE table_name = :table ORDER BY ordinal_position";
        let params = Params::named([("table", SqlValue::from(table))]);
        let result = self.execute(query, &params).await?;
        if !result.success {
            return Err(TandemError::Query(
                result.error.unwrap_or_else(|| "table_info failed".to_string()),
            ));
        }
        Ok(result.rows)
    }
}

impl std::fmt::Debug for PostgresAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresAdapter")
            .field("descriptor", &self.config.descriptor())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_rejects_local_config() {
        let config = BackendConfig::local_path("data/app.db");
        assert!(PostgresAdapter::new(config).is_err());
    }

    #[test]
    fn test_new_accepts_primary_url() {
        let config = BackendConfig::primary_url("postgresql://localhost/app");
        let adapter = PostgresAdapter::new(config).unwrap();
        assert_eq!(adapter.kind(), BackendKind::Primary);
        assert_eq!(adapter.descriptor(), "postgresql://localhost/app");
    }

    #[tokio::test]
    async fn test_execute_without_session_is_connection_error() {
        let adapter =
            PostgresAdapter::new(BackendConfig::primary_url("postgresql://localhost/app")).unwrap();
        let err = adapter.execute("SELECT 1", &Params::None).await.unwrap_err();
        assert!(matches!(err, TandemError::ConnectionFailure { .. }));
    }

    #[tokio::test]
    async fn test_backup_is_unsupported() {
        let adapter =
            PostgresAdapter::new(BackendConfig::primary_url("postgresql://localhost/app")).unwrap();
        let err = adapter.backup(Path::new("/tmp/x")).await.unwrap_err();
        assert!(matches!(err, TandemError::Unsupported(_)));
        let err = adapter.restore(Path::new("/tmp/x")).await.unwrap_err();
        assert!(matches!(err, TandemError::Unsupported(_)));
    }

    #[tokio::test]
    async fn test_disconnect_without_session_is_idempotent() {
        let adapter =
            PostgresAdapter::new(BackendConfig::primary_url("postgresql://localhost/app")).unwrap();
        assert!(adapter.disconnect().await.is_ok());
        assert!(adapter.disconnect().await.is_ok());
        assert!(!adapter.is_connected().await);
    }
}

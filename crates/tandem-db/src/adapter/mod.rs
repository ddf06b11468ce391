//! Backend adapter interface and shared SQL plumbing.
//!
//! The coordinator treats adapters as opaque: a successful [`BackendAdapter::connect`]
//! yields a live connection, `execute` returns a [`QueryResult`], and
//! `transact` applies all operations or none. Each adapter instance owns at
//! most one live session; the pool creates one adapter per pooled
//! connection and keeps the session alive for the connection's lifetime.
//!
//! Canonical parameter placeholders are `:name`. The PRIMARY adapter
//! expands them to the driver-native `$n` style, the LOCAL adapter to `?`
//! positional style. Positional parameter lists pass through unchanged.

pub mod postgres;
pub mod sqlite;

use std::path::Path;

use async_trait::async_trait;
use tandem_common::{Result, TandemError};

use crate::types::{
    BackendKind, BackupResult, ConnectionHandle, HealthMetrics, Operation, OperationKind,
    OptimizationResult, Params, QueryResult, RestoreResult, Row, SqlValue, TransactionResult,
};

/// Uniform facade over one backend.
#[async_trait]
pub trait BackendAdapter: Send + Sync {
    /// Which backend this adapter fronts.
    fn kind(&self) -> BackendKind;

    /// Short human-readable descriptor (host+db or file path).
    fn descriptor(&self) -> String;

    /// Establish the session. Yields a CONNECTED handle or fails with a
    /// connection error carrying the backend kind.
    async fn connect(&self) -> Result<ConnectionHandle>;

    /// Idempotent close; `is_connected` is false afterwards.
    async fn disconnect(&self) -> Result<()>;

    async fn is_connected(&self) -> bool;

    /// Lightweight liveness probe (`SELECT 1`).
    async fn ping(&self) -> Result<()>;

    /// Execute one statement. DML commits immediately. Statement-level
    /// failures are reported inside the result; a missing session is a
    /// connection error.
    async fn execute(&self, query: &str, params: &Params) -> Result<QueryResult>;

    /// Begin, apply each operation in order, commit. On any failure attempt
    /// rollback and report whether it was performed.
    async fn transact(&self, ops: &[Operation]) -> Result<TransactionResult>;

    /// Availability, response time, connection counts, warnings.
    async fn health(&self) -> HealthMetrics;

    /// File-level backup. PRIMARY reports `Unsupported`.
    async fn backup(&self, path: &Path) -> Result<BackupResult>;

    /// File-level restore. PRIMARY reports `Unsupported`.
    async fn restore(&self, path: &Path) -> Result<RestoreResult>;

    /// Backend-specific maintenance: LOCAL reclaims space and refreshes
    /// statistics, PRIMARY refreshes statistics.
    async fn optimize(&self) -> Result<OptimizationResult>;

    /// Column metadata for a table; empty when the table does not exist.
    async fn table_info(&self, table: &str) -> Result<Vec<Row>>;
}

/// Classifies a raw driver error into a [`TandemError`] kind at the point
/// it is caught, before any downgrade to a message string. SQLSTATE-aware:
/// deadlocks and serialization failures come out as their retryable kinds.
/// Connection-class faults are stamped with the backend that produced them.
pub(crate) fn classify_error(err: sqlx::Error, backend: BackendKind) -> TandemError {
    match TandemError::from(err) {
        TandemError::ConnectionFailure { message, .. } => TandemError::ConnectionFailure {
            backend: backend.as_str().to_string(),
            message,
        },
        other => other,
    }
}

/// Kinds that must surface as `Err` so callers can react to the kind
/// itself: retryable faults (deadlock, serialization failure, timeout) and
/// dead sessions. Everything else is a statement-level failure reported
/// inside the result.
pub(crate) fn surfaces_as_error(err: &TandemError) -> bool {
    err.is_retryable() || matches!(err, TandemError::ConnectionFailure { .. })
}

/// Native placeholder style of a backend driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PlaceholderStyle {
    /// `$1`, `$2`, ...; repeated names reuse one slot.
    Numbered,
    /// `?`; repeated names repeat the value.
    Question,
}

impl PlaceholderStyle {
    pub(crate) fn for_kind(kind: BackendKind) -> Self {
        match kind {
            BackendKind::Primary => PlaceholderStyle::Numbered,
            BackendKind::Local => PlaceholderStyle::Question,
        }
    }
}

/// Expands canonical `:name` placeholders into the backend-native style.
///
/// Returns the rewritten query plus the parameter names in bind order.
/// Single-quoted string literals are left untouched, as are `::type` casts.
pub(crate) fn expand_named(query: &str, style: PlaceholderStyle) -> (String, Vec<String>) {
    let bytes = query.as_bytes();
    let mut out = String::with_capacity(query.len());
    let mut order: Vec<String> = Vec::new();
    let mut slots: Vec<String> = Vec::new();
    let mut in_string = false;
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i] as char;

        if in_string {
            out.push(c);
            if c == '\'' {
                in_string = false;
            }
            i += 1;
            continue;
        }

        match c {
            '\'' => {
                in_string = true;
                out.push(c);
                i += 1;
            }
            ':' => {
                let prev_colon = i > 0 && bytes[i - 1] == b':';
                let next_colon = i + 1 < bytes.len() && bytes[i + 1] == b':';
                let starts_ident = i + 1 < bytes.len()
                    && ((bytes[i + 1] as char).is_ascii_alphabetic() || bytes[i + 1] == b'_');

                if prev_colon || next_colon || !starts_ident {
                    out.push(c);
                    i += 1;
                    continue;
                }

                let start = i + 1;
                let mut end = start;
                while end < bytes.len()
                    && ((bytes[end] as char).is_ascii_alphanumeric() || bytes[end] == b'_')
                {
                    end += 1;
                }
                let name = &query[start..end];

                match style {
                    PlaceholderStyle::Numbered => {
                        let slot = match slots.iter().position(|s| s == name) {
                            Some(pos) => pos + 1,
                            None => {
                                slots.push(name.to_string());
                                order.push(name.to_string());
                                slots.len()
                            }
                        };
                        out.push_str(&format!("${}", slot));
                    }
                    PlaceholderStyle::Question => {
                        order.push(name.to_string());
                        out.push('?');
                    }
                }
                i = end;
            }
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }

    (out, order)
}

/// Resolves canonical parameters into (rewritten query, ordered bind values).
pub(crate) fn prepare_statement(
    query: &str,
    params: &Params,
    style: PlaceholderStyle,
) -> Result<(String, Vec<SqlValue>)> {
    match params {
        Params::None => Ok((query.to_string(), Vec::new())),
        Params::Positional(values) => Ok((query.to_string(), values.clone())),
        Params::Named(map) => {
            let (rewritten, order) = expand_named(query, style);
            let mut values = Vec::with_capacity(order.len());
            for name in &order {
                let value = map.get(name).ok_or_else(|| {
                    TandemError::ValidationFailure(format!("missing named parameter :{}", name))
                })?;
                values.push(value.clone());
            }
            Ok((rewritten, values))
        }
    }
}

fn placeholder(style: PlaceholderStyle, index: usize) -> String {
    match style {
        PlaceholderStyle::Numbered => format!("${}", index),
        PlaceholderStyle::Question => "?".to_string(),
    }
}

/// Builds the SQL for a structured (non-raw) operation in the backend's
/// placeholder style. Returns the query plus bind values in placeholder
/// order: data columns first, then condition columns.
pub(crate) fn build_operation_query(
    op: &Operation,
    style: PlaceholderStyle,
) -> Result<(String, Vec<SqlValue>)> {
    if !op.validate() {
        return Err(TandemError::ValidationFailure(format!(
            "invalid {} operation on table '{}'",
            op.kind.as_str(),
            op.table
        )));
    }

    let mut values: Vec<SqlValue> = Vec::new();
    let mut index = 0usize;
    let mut next = |values: &mut Vec<SqlValue>, v: &SqlValue| {
        index += 1;
        values.push(v.clone());
        placeholder(style, index)
    };

    let query = match op.kind {
        OperationKind::Insert => {
            let columns: Vec<&str> = op.data.keys().map(String::as_str).collect();
            let placeholders: Vec<String> =
                op.data.values().map(|v| next(&mut values, v)).collect();
            format!(
                "INSERT INTO {} ({}) VALUES ({})",
                op.table,
                columns.join(", "),
                placeholders.join(", ")
            )
        }
        OperationKind::Update => {
            let set_clause: Vec<String> = op
                .data
                .iter()
                .map(|(k, v)| format!("{} = {}", k, next(&mut values, v)))
                .collect();
            let where_clause: Vec<String> = op
                .conditions
                .iter()
                .map(|(k, v)| format!("{} = {}", k, next(&mut values, v)))
                .collect();
            format!(
                "UPDATE {} SET {} WHERE {}",
                op.table,
                set_clause.join(", "),
                where_clause.join(" AND ")
            )
        }
        OperationKind::Delete => {
            let where_clause: Vec<String> = op
                .conditions
                .iter()
                .map(|(k, v)| format!("{} = {}", k, next(&mut values, v)))
                .collect();
            format!("DELETE FROM {} WHERE {}", op.table, where_clause.join(" AND "))
        }
        OperationKind::Select => {
            if op.conditions.is_empty() {
                format!("SELECT * FROM {}", op.table)
            } else {
                let where_clause: Vec<String> = op
                    .conditions
                    .iter()
                    .map(|(k, v)| format!("{} = {}", k, next(&mut values, v)))
                    .collect();
                format!(
                    "SELECT * FROM {} WHERE {}",
                    op.table,
                    where_clause.join(" AND ")
                )
            }
        }
        OperationKind::Raw | OperationKind::Ddl => {
            return Err(TandemError::ValidationFailure(
                "raw operations carry their own query text".to_string(),
            ));
        }
    };

    Ok((query, values))
}

/// Statements whose results should be fetched rather than executed.
pub(crate) fn returns_rows(query: &str) -> bool {
    let head = query.trim_start().to_ascii_uppercase();
    head.starts_with("SELECT")
        || head.starts_with("WITH")
        || head.starts_with("PRAGMA")
        || head.starts_with("SHOW")
        || head.starts_with("EXPLAIN")
}

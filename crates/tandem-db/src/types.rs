//! Shared data model for the database kernel.
//!
//! Query rows are not a single heterogeneous map: values come back as the
//! [`SqlValue`] tagged union and [`Row`] exposes typed accessors over it.
//! Operation payloads use `BTreeMap` so their serialized form is key-ordered
//! and migration checksums stay deterministic.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Supported backend kinds. PRIMARY is preferred whenever it is configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Remote PostgreSQL-style engine.
    Primary,
    /// Local embedded SQLite-style engine.
    Local,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Primary => "primary",
            BackendKind::Local => "local",
        }
    }

    /// The backend this kind fails over to, if any.
    pub fn alternate(&self) -> BackendKind {
        match self {
            BackendKind::Primary => BackendKind::Local,
            BackendKind::Local => BackendKind::Primary,
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
    Failed,
    Reconnecting,
}

/// Metadata handle for a pooled connection. The pool owns the live session;
/// this is the descriptive record that travels with it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionHandle {
    /// Stable opaque id.
    pub id: Uuid,
    pub kind: BackendKind,
    pub status: ConnectionStatus,
    pub created_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
    /// host+database for PRIMARY, filesystem path for LOCAL.
    pub descriptor: String,
}

impl ConnectionHandle {
    pub fn new(kind: BackendKind, descriptor: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            kind,
            status: ConnectionStatus::Connected,
            created_at: now,
            last_used: now,
            descriptor: descriptor.into(),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status == ConnectionStatus::Connected
    }

    pub fn mark_used(&mut self) {
        self.last_used = Utc::now();
    }

    /// Seconds since this connection was created.
    pub fn age_secs(&self) -> f64 {
        (Utc::now() - self.created_at).num_milliseconds() as f64 / 1000.0
    }

    /// Seconds since this connection was last used.
    pub fn idle_secs(&self) -> f64 {
        (Utc::now() - self.last_used).num_milliseconds() as f64 / 1000.0
    }
}

/// A single SQL value in the intersection of what both backends speak.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    /// Structured payload; stored as JSONB on PRIMARY and text on LOCAL.
    Json(serde_json::Value),
}

impl SqlValue {
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            SqlValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SqlValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            SqlValue::Float(v) => Some(*v),
            SqlValue::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            SqlValue::Bool(v) => Some(*v),
            SqlValue::Int(v) => Some(*v != 0),
            _ => None,
        }
    }

    /// Renders the value the way it appears inside a serialized JSON
    /// document. Used by the approximate JSON text search.
    pub fn json_literal(&self) -> String {
        match self {
            SqlValue::Null => "null".to_string(),
            SqlValue::Bool(v) => v.to_string(),
            SqlValue::Int(v) => v.to_string(),
            SqlValue::Float(v) => v.to_string(),
            SqlValue::Text(s) => format!("\"{}\"", s),
            SqlValue::Json(v) => v.to_string(),
        }
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Int(v)
    }
}

impl From<i32> for SqlValue {
    fn from(v: i32) -> Self {
        SqlValue::Int(v as i64)
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        SqlValue::Float(v)
    }
}

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        SqlValue::Bool(v)
    }
}

impl From<Uuid> for SqlValue {
    fn from(v: Uuid) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl From<serde_json::Value> for SqlValue {
    fn from(v: serde_json::Value) -> Self {
        SqlValue::Json(v)
    }
}

/// A decoded result row with typed accessors.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Row {
    columns: Vec<String>,
    values: Vec<SqlValue>,
}

impl Row {
    pub fn new(columns: Vec<String>, values: Vec<SqlValue>) -> Self {
        debug_assert_eq!(columns.len(), values.len());
        Self { columns, values }
    }

    pub fn get(&self, column: &str) -> Option<&SqlValue> {
        self.columns
            .iter()
            .position(|c| c == column)
            .map(|i| &self.values[i])
    }

    pub fn get_str(&self, column: &str) -> Option<&str> {
        self.get(column).and_then(SqlValue::as_str)
    }

    pub fn get_i64(&self, column: &str) -> Option<i64> {
        self.get(column).and_then(SqlValue::as_i64)
    }

    pub fn get_f64(&self, column: &str) -> Option<f64> {
        self.get(column).and_then(SqlValue::as_f64)
    }

    pub fn get_bool(&self, column: &str) -> Option<bool> {
        self.get(column).and_then(SqlValue::as_bool)
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Converts the row into a JSON object, preserving column order.
    pub fn to_json(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        for (c, v) in self.columns.iter().zip(self.values.iter()) {
            let json = match v {
                SqlValue::Null => serde_json::Value::Null,
                SqlValue::Bool(b) => serde_json::Value::Bool(*b),
                SqlValue::Int(i) => serde_json::Value::from(*i),
                SqlValue::Float(f) => {
                    serde_json::Number::from_f64(*f).map_or(serde_json::Value::Null, Into::into)
                }
                SqlValue::Text(s) => serde_json::Value::String(s.clone()),
                SqlValue::Json(j) => j.clone(),
            };
            map.insert(c.clone(), json);
        }
        serde_json::Value::Object(map)
    }
}

/// Query parameters in canonical form. Named parameters use `:name`
/// placeholders in the query text; adapters translate to the backend's
/// native style. Positional lists pass through unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub enum Params {
    #[default]
    None,
    Positional(Vec<SqlValue>),
    Named(BTreeMap<String, SqlValue>),
}

impl Params {
    pub fn named<I, K>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, SqlValue)>,
        K: Into<String>,
    {
        Params::Named(pairs.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn positional<I: IntoIterator<Item = SqlValue>>(values: I) -> Self {
        Params::Positional(values.into_iter().collect())
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Params::None => true,
            Params::Positional(v) => v.is_empty(),
            Params::Named(m) => m.is_empty(),
        }
    }
}

/// Kind of a recorded database operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Insert,
    Update,
    Delete,
    Select,
    Raw,
    Ddl,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Insert => "insert",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
            OperationKind::Select => "select",
            OperationKind::Raw => "raw",
            OperationKind::Ddl => "ddl",
        }
    }
}

/// A database operation recorded for transactional or migration execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    pub kind: OperationKind,
    pub table: String,
    #[serde(default)]
    pub data: BTreeMap<String, SqlValue>,
    #[serde(default)]
    pub conditions: BTreeMap<String, SqlValue>,
    #[serde(default)]
    pub raw_query: Option<String>,
    #[serde(default)]
    pub params: Params,
}

impl Operation {
    pub fn insert<I, K>(table: impl Into<String>, data: I) -> Self
    where
        I: IntoIterator<Item = (K, SqlValue)>,
        K: Into<String>,
    {
        Self {
            kind: OperationKind::Insert,
            table: table.into(),
            data: data.into_iter().map(|(k, v)| (k.into(), v)).collect(),
            conditions: BTreeMap::new(),
            raw_query: None,
            params: Params::None,
        }
    }

    pub fn update<I, J, K, L>(table: impl Into<String>, data: I, conditions: J) -> Self
    where
        I: IntoIterator<Item = (K, SqlValue)>,
        J: IntoIterator<Item = (L, SqlValue)>,
        K: Into<String>,
        L: Into<String>,
    {
        Self {
            kind: OperationKind::Update,
            table: table.into(),
            data: data.into_iter().map(|(k, v)| (k.into(), v)).collect(),
            conditions: conditions.into_iter().map(|(k, v)| (k.into(), v)).collect(),
            raw_query: None,
            params: Params::None,
        }
    }

    pub fn delete<I, K>(table: impl Into<String>, conditions: I) -> Self
    where
        I: IntoIterator<Item = (K, SqlValue)>,
        K: Into<String>,
    {
        Self {
            kind: OperationKind::Delete,
            table: table.into(),
            data: BTreeMap::new(),
            conditions: conditions.into_iter().map(|(k, v)| (k.into(), v)).collect(),
            raw_query: None,
            params: Params::None,
        }
    }

    pub fn raw(query: impl Into<String>, params: Params) -> Self {
        Self {
            kind: OperationKind::Raw,
            table: String::new(),
            data: BTreeMap::new(),
            conditions: BTreeMap::new(),
            raw_query: Some(query.into()),
            params,
        }
    }

    pub fn ddl(query: impl Into<String>) -> Self {
        Self {
            kind: OperationKind::Ddl,
            table: String::new(),
            data: BTreeMap::new(),
            conditions: BTreeMap::new(),
            raw_query: Some(query.into()),
            params: Params::None,
        }
    }

    /// Precondition checks: INSERT/UPDATE require data or a raw query;
    /// UPDATE/DELETE must carry conditions or a raw query.
    pub fn validate(&self) -> bool {
        if self.table.is_empty() && self.raw_query.is_none() {
            return false;
        }
        match self.kind {
            OperationKind::Insert => !self.data.is_empty() || self.raw_query.is_some(),
            OperationKind::Update => {
                (!self.data.is_empty() || self.raw_query.is_some())
                    && (!self.conditions.is_empty() || self.raw_query.is_some())
            }
            OperationKind::Delete => !self.conditions.is_empty() || self.raw_query.is_some(),
            OperationKind::Select => true,
            OperationKind::Raw | OperationKind::Ddl => self.raw_query.is_some(),
        }
    }
}

/// Result of a single query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResult {
    pub success: bool,
    pub rows_affected: u64,
    pub rows: Vec<Row>,
    pub error: Option<String>,
    pub elapsed: Duration,
    pub query_id: Uuid,
}

impl QueryResult {
    pub fn ok(rows_affected: u64, rows: Vec<Row>, elapsed: Duration) -> Self {
        Self {
            success: true,
            rows_affected,
            rows,
            error: None,
            elapsed,
            query_id: Uuid::new_v4(),
        }
    }

    pub fn failure(error: impl Into<String>, elapsed: Duration) -> Self {
        Self {
            success: false,
            rows_affected: 0,
            rows: Vec::new(),
            error: Some(error.into()),
            elapsed,
            query_id: Uuid::new_v4(),
        }
    }
}

/// Result of a multi-operation transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionResult {
    pub success: bool,
    pub tx_id: Uuid,
    pub ops_count: usize,
    pub rollback_performed: bool,
    pub error: Option<String>,
    pub elapsed: Duration,
}

/// Backend health metrics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthMetrics {
    pub backend: BackendKind,
    pub is_available: bool,
    pub response_time: Duration,
    pub active_connections: u32,
    pub max_connections: u32,
    pub error_count: u32,
    pub warnings: Vec<String>,
    pub last_check: DateTime<Utc>,
}

impl HealthMetrics {
    pub fn unavailable(backend: BackendKind, response_time: Duration, warning: String) -> Self {
        Self {
            backend,
            is_available: false,
            response_time,
            active_connections: 0,
            max_connections: 0,
            error_count: 1,
            warnings: vec![warning],
            last_check: Utc::now(),
        }
    }

    /// Healthy means available, responsive, below 90% connection usage and
    /// with a low error count.
    pub fn is_healthy(&self) -> bool {
        self.is_available
            && self.response_time < Duration::from_secs(5)
            && (self.max_connections == 0
                || (self.active_connections as f64) < self.max_connections as f64 * 0.9)
            && self.error_count < 10
    }
}

/// Result of a backup operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupResult {
    pub success: bool,
    pub backup_path: PathBuf,
    pub backup_size: u64,
    pub backup_time: DateTime<Utc>,
    pub error: Option<String>,
}

/// Result of a restore operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreResult {
    pub success: bool,
    pub restore_path: PathBuf,
    pub restore_time: DateTime<Utc>,
    pub error: Option<String>,
}

/// Result of a backend optimization pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizationResult {
    pub success: bool,
    pub optimizations_applied: Vec<String>,
    pub elapsed: Duration,
    pub error: Option<String>,
}

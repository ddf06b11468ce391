//! Transaction coordination: savepoints, nesting, retry and timeouts.
//!
//! Contexts use a deferred-operation model: operations accumulate in the
//! context while the transaction is ACTIVE and are executed on the pinned
//! connection when the context commits, inside the backend transaction the
//! coordinator opened at `begin`. Rolling back to a savepoint is therefore a
//! pure list truncation, atomic under the context lock, and a scoped
//! transaction issues exactly one COMMIT or exactly one ROLLBACK.
//!
//! Failover is monotonic within a transaction: the connection chosen at
//! `begin` serves the whole lifecycle.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use tandem_common::{Result, TandemError};

use crate::deadlock::DeadlockDetector;
use crate::monitor::{PerformanceMonitor, TxStats};
use crate::pool::{ConnectionLease, ConnectionPool};
use crate::types::{BackendKind, Operation, OperationKind, Params, SqlValue, TransactionResult};

/// Message fragments that mark a backend error as retryable.
const RETRYABLE_PATTERNS: [&str; 4] = [
    "deadlock",
    "lock timeout",
    "serialization failure",
    "could not serialize access",
];

/// Transaction isolation levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    ReadUncommitted,
    #[default]
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    pub fn to_sql(&self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

/// Transaction lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionState {
    Active,
    Committed,
    RolledBack,
    Failed,
    Prepared,
}

/// Lifecycle callback events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TxEvent {
    BeforeCommit,
    AfterCommit,
    BeforeRollback,
    AfterRollback,
}

/// Options for starting a transaction.
#[derive(Debug, Clone)]
pub struct TxOptions {
    pub isolation_level: IsolationLevel,
    pub timeout: Duration,
    pub readonly: bool,
    /// Deadlock-victim selection priority; higher survives longer under
    /// `abort_lowest_priority`.
    pub priority: i32,
    pub tenant_id: Option<String>,
}

impl Default for TxOptions {
    fn default() -> Self {
        Self {
            isolation_level: IsolationLevel::ReadCommitted,
            timeout: Duration::from_secs(300),
            readonly: false,
            priority: 0,
            tenant_id: None,
        }
    }
}

/// An intra-transaction marker enabling partial rollback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavepointInfo {
    pub name: String,
    /// Operation count at creation; rollback truncates to this index.
    pub op_index: usize,
    pub created_at: DateTime<Utc>,
}

/// Active transaction description.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveTxInfo {
    pub tx_id: Uuid,
    pub state: TransactionState,
    pub start_time: DateTime<Utc>,
    pub duration_secs: f64,
    pub operations: usize,
    pub savepoints: usize,
    pub isolation_level: IsolationLevel,
    pub readonly: bool,
    pub backend: BackendKind,
    pub connection_id: Uuid,
    pub is_expired: bool,
}

type Callback = Box<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct Callbacks {
    before_commit: Vec<Callback>,
    after_commit: Vec<Callback>,
    before_rollback: Vec<Callback>,
    after_rollback: Vec<Callback>,
}

impl Callbacks {
    fn take(&mut self, event: TxEvent) -> Vec<Callback> {
        match event {
            TxEvent::BeforeCommit => std::mem::take(&mut self.before_commit),
            TxEvent::AfterCommit => std::mem::take(&mut self.after_commit),
            TxEvent::BeforeRollback => std::mem::take(&mut self.before_rollback),
            TxEvent::AfterRollback => std::mem::take(&mut self.after_rollback),
        }
    }

    fn push(&mut self, event: TxEvent, callback: Callback) {
        match event {
            TxEvent::BeforeCommit => self.before_commit.push(callback),
            TxEvent::AfterCommit => self.after_commit.push(callback),
            TxEvent::BeforeRollback => self.before_rollback.push(callback),
            TxEvent::AfterRollback => self.after_rollback.push(callback),
        }
    }
}

struct TxInner {
    id: Uuid,
    lease: ConnectionLease,
    options: TxOptions,
    state: TransactionState,
    operations: Vec<Operation>,
    savepoints: Vec<SavepointInfo>,
    start_time: DateTime<Utc>,
    end_time: Option<DateTime<Utc>>,
    callbacks: Callbacks,
    parent: Option<Uuid>,
    children: Vec<Uuid>,
    savepoint_rollbacks: u64,
    savepoints_created: u64,
    deadlock_count: u64,
    detector: Arc<DeadlockDetector>,
}

impl TxInner {
    fn is_expired(&self) -> bool {
        let elapsed = (Utc::now() - self.start_time).num_milliseconds() as f64 / 1000.0;
        elapsed > self.options.timeout.as_secs_f64()
    }

    fn duration_secs(&self) -> f64 {
        let end = self.end_time.unwrap_or_else(Utc::now);
        (end - self.start_time).num_milliseconds() as f64 / 1000.0
    }
}

/// Handle to a live transaction context.
#[derive(Clone)]
pub struct TxHandle {
    inner: Arc<Mutex<TxInner>>,
}

impl TxHandle {
    pub fn id(&self) -> Uuid {
        self.inner.lock().id
    }

    pub fn state(&self) -> TransactionState {
        self.inner.lock().state
    }

    pub fn backend(&self) -> BackendKind {
        self.inner.lock().lease.kind
    }

    pub fn operations_len(&self) -> usize {
        self.inner.lock().operations.len()
    }

    pub fn savepoint_names(&self) -> Vec<String> {
        self.inner
            .lock()
            .savepoints
            .iter()
            .map(|s| s.name.clone())
            .collect()
    }

    pub fn is_expired(&self) -> bool {
        self.inner.lock().is_expired()
    }

    pub fn duration_secs(&self) -> f64 {
        self.inner.lock().duration_secs()
    }

    /// Id of the enclosing context, for nested contexts.
    pub fn parent_id(&self) -> Option<Uuid> {
        self.inner.lock().parent
    }

    /// Ids of nested contexts spawned from this one.
    pub fn children(&self) -> Vec<Uuid> {
        self.inner.lock().children.clone()
    }

    /// Records an operation for execution at commit.
    pub fn add_operation(&self, op: Operation) -> Result<()> {
        if !op.validate() {
            return Err(TandemError::ValidationFailure(format!(
                "invalid {} operation on table '{}'",
                op.kind.as_str(),
                op.table
            )));
        }
        let mut inner = self.inner.lock();
        if inner.state != TransactionState::Active {
            return Err(TandemError::TransactionFailure {
                message: format!("cannot add operation to {:?} transaction", inner.state),
                rollback_performed: false,
            });
        }
        if inner.options.readonly && op.kind != OperationKind::Select {
            return Err(TandemError::ValidationFailure(
                "write operation in a read-only transaction".to_string(),
            ));
        }
        inner.operations.push(op);
        let id = inner.id.to_string();
        inner.detector.record_work(&id, 1);
        Ok(())
    }

    /// Convenience insert.
    pub fn insert<I, K>(&self, table: impl Into<String>, data: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, SqlValue)>,
        K: Into<String>,
    {
        self.add_operation(Operation::insert(table, data))
    }

    /// Convenience update.
    pub fn update<I, J, K, L>(&self, table: impl Into<String>, data: I, conditions: J) -> Result<()>
    where
        I: IntoIterator<Item = (K, SqlValue)>,
        J: IntoIterator<Item = (L, SqlValue)>,
        K: Into<String>,
        L: Into<String>,
    {
        self.add_operation(Operation::update(table, data, conditions))
    }

    /// Convenience delete.
    pub fn delete<I, K>(&self, table: impl Into<String>, conditions: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, SqlValue)>,
        K: Into<String>,
    {
        self.add_operation(Operation::delete(table, conditions))
    }

    /// Records a raw statement.
    pub fn raw(&self, query: impl Into<String>, params: Params) -> Result<()> {
        self.add_operation(Operation::raw(query, params))
    }

    /// Creates a savepoint at the current operation index.
    pub fn create_savepoint(&self, name: impl Into<String>) -> Result<()> {
        let name = name.into();
        let mut inner = self.inner.lock();
        if inner.state != TransactionState::Active {
            return Err(TandemError::TransactionFailure {
                message: format!("cannot create savepoint in {:?} transaction", inner.state),
                rollback_performed: false,
            });
        }
        let op_index = inner.operations.len();
        inner.savepoints.push(SavepointInfo {
            name,
            op_index,
            created_at: Utc::now(),
        });
        inner.savepoints_created += 1;
        Ok(())
    }

    /// Rolls back to a savepoint: truncates operations to the savepoint's
    /// index and discards every savepoint created after it. The transaction
    /// stays ACTIVE.
    pub fn rollback_to_savepoint(&self, name: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        let position = inner
            .savepoints
            .iter()
            .position(|s| s.name == name)
            .ok_or_else(|| {
                TandemError::ValidationFailure(format!("savepoint '{}' not found", name))
            })?;

        let op_index = inner.savepoints[position].op_index;
        inner.operations.truncate(op_index);
        inner.savepoints.truncate(position + 1);
        inner.savepoint_rollbacks += 1;
        Ok(())
    }

    /// Registers a lifecycle callback.
    pub fn on(&self, event: TxEvent, callback: impl Fn() + Send + Sync + 'static) {
        self.inner.lock().callbacks.push(event, Box::new(callback));
    }

    fn info(&self) -> ActiveTxInfo {
        let inner = self.inner.lock();
        ActiveTxInfo {
            tx_id: inner.id,
            state: inner.state,
            start_time: inner.start_time,
            duration_secs: inner.duration_secs(),
            operations: inner.operations.len(),
            savepoints: inner.savepoints.len(),
            isolation_level: inner.options.isolation_level,
            readonly: inner.options.readonly,
            backend: inner.lease.kind,
            connection_id: inner.lease.id,
            is_expired: inner.is_expired(),
        }
    }

    fn run_callbacks(&self, event: TxEvent) {
        let callbacks = self.inner.lock().callbacks.take(event);
        for callback in &callbacks {
            callback();
        }
    }
}

impl std::fmt::Debug for TxHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("TxHandle")
            .field("id", &inner.id)
            .field("state", &inner.state)
            .field("operations", &inner.operations.len())
            .finish()
    }
}

/// Aggregate coordinator metrics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TxCoordinatorMetrics {
    pub total_transactions: u64,
    pub successful_transactions: u64,
    pub failed_transactions: u64,
    pub rolled_back_transactions: u64,
    pub expired_transactions: u64,
    pub deadlock_victims: u64,
    pub savepoints_created: u64,
    pub rollbacks_to_savepoint: u64,
    pub longest_transaction_secs: f64,
    pub average_transaction_secs: f64,
}

/// Coordinator configuration.
#[derive(Debug, Clone)]
pub struct TxCoordinatorConfig {
    pub default_isolation: IsolationLevel,
    pub default_timeout: Duration,
    /// Cadence of the expiry sweeper; tied to deadlock detection.
    pub sweep_interval: Duration,
}

impl Default for TxCoordinatorConfig {
    fn default() -> Self {
        Self {
            default_isolation: IsolationLevel::ReadCommitted,
            default_timeout: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(1),
        }
    }
}

/// Transaction coordinator over the pool, detector and monitor.
pub struct TransactionCoordinator {
    config: TxCoordinatorConfig,
    pool: Arc<ConnectionPool>,
    detector: Arc<DeadlockDetector>,
    monitor: Arc<PerformanceMonitor>,
    active: Mutex<HashMap<Uuid, TxHandle>>,
    metrics: Mutex<TxCoordinatorMetrics>,
    finished_durations: Mutex<(u64, f64)>,
    shutdown: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl TransactionCoordinator {
    /// Creates the coordinator and starts the expiry sweeper plus the
    /// deadlock-victim listener.
    pub fn new(
        config: TxCoordinatorConfig,
        pool: Arc<ConnectionPool>,
        detector: Arc<DeadlockDetector>,
        monitor: Arc<PerformanceMonitor>,
    ) -> Arc<Self> {
        let coordinator = Arc::new(Self {
            config,
            pool,
            detector,
            monitor,
            active: Mutex::new(HashMap::new()),
            metrics: Mutex::new(TxCoordinatorMetrics::default()),
            finished_durations: Mutex::new((0, 0.0)),
            shutdown: CancellationToken::new(),
            workers: Mutex::new(Vec::new()),
        });
        Self::start_workers(&coordinator);
        coordinator
    }

    /// Begins a transaction on the given connection, or acquires one from
    /// the pool. Issues `BEGIN` (with isolation on PRIMARY) and registers
    /// the context with the deadlock detector.
    pub async fn begin(
        &self,
        lease: Option<ConnectionLease>,
        options: Option<TxOptions>,
    ) -> Result<TxHandle> {
        let options = options.unwrap_or_else(|| TxOptions {
            isolation_level: self.config.default_isolation,
            timeout: self.config.default_timeout,
            ..Default::default()
        });

        let lease = match lease {
            Some(lease) => lease,
            None => self.pool.acquire(None, None).await?,
        };

        let begin_sql = match lease.kind {
            BackendKind::Primary => {
                let mut sql = format!("BEGIN ISOLATION LEVEL {}", options.isolation_level.to_sql());
                if options.readonly {
                    sql.push_str(", READ ONLY");
                }
                sql
            }
            // SQLite knows no isolation levels.
            BackendKind::Local => "BEGIN".to_string(),
        };

        let result = match lease.execute(&begin_sql, &Params::None).await {
            Ok(result) => result,
            Err(e) => {
                match &e {
                    TandemError::ConnectionFailure { .. }
                    | TandemError::HealthCheckFailure { .. } => {
                        self.pool.on_failure(&lease).await;
                    }
                    _ => {
                        let _ = self.pool.release(lease).await;
                    }
                }
                return Err(e);
            }
        };
        if !result.success {
            let message = result.error.unwrap_or_else(|| "begin failed".to_string());
            let _ = self.pool.release(lease).await;
            return Err(TandemError::TransactionFailure {
                message: format!("failed to begin transaction: {}", message),
                rollback_performed: false,
            });
        }

        let id = Uuid::new_v4();
        self.detector.register(id.to_string(), options.priority);

        let handle = TxHandle {
            inner: Arc::new(Mutex::new(TxInner {
                id,
                lease,
                options,
                state: TransactionState::Active,
                operations: Vec::new(),
                savepoints: Vec::new(),
                start_time: Utc::now(),
                end_time: None,
                callbacks: Callbacks::default(),
                parent: None,
                children: Vec::new(),
                savepoint_rollbacks: 0,
                savepoints_created: 0,
                deadlock_count: 0,
                detector: self.detector.clone(),
            })),
        };

        {
            let mut active = self.active.lock();
            active.insert(id, handle.clone());
            self.monitor.set_active_transactions(active.len());
        }
        self.metrics.lock().total_transactions += 1;
        debug!(tx_id = %id, "transaction started");
        Ok(handle)
    }

    /// Executes the recorded operations on the pinned connection and
    /// commits. Lifecycle: before_commit callbacks, statements, COMMIT,
    /// after_commit callbacks. Any failure rolls back instead.
    pub async fn commit(&self, handle: &TxHandle) -> Result<TransactionResult> {
        let (id, lease, operations, start_time) = {
            let inner = handle.inner.lock();
            if inner.state != TransactionState::Active {
                return Err(TandemError::TransactionFailure {
                    message: format!("cannot commit {:?} transaction", inner.state),
                    rollback_performed: false,
                });
            }
            (
                inner.id,
                inner.lease.clone(),
                inner.operations.clone(),
                inner.start_time,
            )
        };

        handle.run_callbacks(TxEvent::BeforeCommit);

        let mut failure: Option<TandemError> = None;
        for op in &operations {
            let (sql, params) = match canonical_statement(op) {
                Ok(prepared) => prepared,
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            };
            match lease.execute(&sql, &params).await {
                Ok(result) if result.success => {}
                Ok(result) => {
                    failure = Some(TandemError::Query(
                        result.error.unwrap_or_else(|| "statement failed".to_string()),
                    ));
                    break;
                }
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        if failure.is_none() {
            match lease.execute("COMMIT", &Params::None).await {
                Ok(result) if result.success => {}
                Ok(result) => {
                    failure = Some(TandemError::Query(
                        result.error.unwrap_or_else(|| "commit failed".to_string()),
                    ))
                }
                Err(e) => failure = Some(e),
            }
        }

        if let Some(err) = failure {
            let reason = err.to_string();
            self.rollback_with_state(handle, &reason, TransactionState::Failed)
                .await?;
            // Retryable kinds surface unchanged; the rest report as a
            // transaction failure carrying the rollback.
            return Err(if is_retryable_error(&err) {
                err
            } else {
                TandemError::TransactionFailure {
                    message: reason,
                    rollback_performed: true,
                }
            });
        }

        {
            let mut inner = handle.inner.lock();
            inner.state = TransactionState::Committed;
            inner.end_time = Some(Utc::now());
            inner.savepoints.clear();
        }
        handle.run_callbacks(TxEvent::AfterCommit);
        self.finalize(handle, true, None).await;

        let elapsed = (Utc::now() - start_time)
            .to_std()
            .unwrap_or_default();
        debug!(tx_id = %id, ops = operations.len(), "transaction committed");
        Ok(TransactionResult {
            success: true,
            tx_id: id,
            ops_count: operations.len(),
            rollback_performed: false,
            error: None,
            elapsed,
        })
    }

    /// Rolls back an active transaction with a reason.
    pub async fn rollback(&self, handle: &TxHandle, reason: &str) -> Result<()> {
        self.rollback_with_state(handle, reason, TransactionState::RolledBack)
            .await
    }

    async fn rollback_with_state(
        &self,
        handle: &TxHandle,
        reason: &str,
        final_state: TransactionState,
    ) -> Result<()> {
        let (id, lease, already_finished) = {
            let inner = handle.inner.lock();
            (
                inner.id,
                inner.lease.clone(),
                inner.state != TransactionState::Active,
            )
        };
        if already_finished {
            return Ok(());
        }

        handle.run_callbacks(TxEvent::BeforeRollback);

        if let Err(e) = lease.execute("ROLLBACK", &Params::None).await {
            warn!(tx_id = %id, error = %e, "rollback statement failed");
        }

        {
            let mut inner = handle.inner.lock();
            inner.state = final_state;
            inner.end_time = Some(Utc::now());
        }
        handle.run_callbacks(TxEvent::AfterRollback);
        self.finalize(handle, false, Some(reason.to_string())).await;
        debug!(tx_id = %id, reason = %reason, "transaction rolled back");
        Ok(())
    }

    /// Scoped transaction: begins a context, hands it to the closure,
    /// commits on success and rolls back (then re-raises) on failure.
    pub async fn scoped<F, Fut, T>(
        &self,
        lease: Option<ConnectionLease>,
        options: Option<TxOptions>,
        f: F,
    ) -> Result<T>
    where
        F: FnOnce(TxHandle) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let handle = self.begin(lease, options).await?;
        match f(handle.clone()).await {
            Ok(value) => {
                self.commit(&handle).await?;
                Ok(value)
            }
            Err(e) => {
                self.rollback(&handle, &e.to_string()).await?;
                Err(e)
            }
        }
    }

    /// Nested context backed by a named savepoint on the parent. Operations
    /// recorded on the child merge into the parent on success; on failure
    /// the parent rolls back to the savepoint and the error re-raises.
    pub async fn nested<F, Fut, T>(
        &self,
        parent: &TxHandle,
        name: Option<String>,
        f: F,
    ) -> Result<T>
    where
        F: FnOnce(TxHandle) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let savepoint = name.unwrap_or_else(|| {
            format!("nested_{}", &Uuid::new_v4().simple().to_string()[..8])
        });
        parent.create_savepoint(savepoint.clone())?;

        let child = {
            let parent_inner = parent.inner.lock();
            if parent_inner.state != TransactionState::Active {
                return Err(TandemError::TransactionFailure {
                    message: "parent transaction is not active".to_string(),
                    rollback_performed: false,
                });
            }
            let child_id = Uuid::new_v4();
            TxHandle {
                inner: Arc::new(Mutex::new(TxInner {
                    id: child_id,
                    lease: parent_inner.lease.clone(),
                    options: parent_inner.options.clone(),
                    state: TransactionState::Active,
                    operations: Vec::new(),
                    savepoints: Vec::new(),
                    start_time: Utc::now(),
                    end_time: None,
                    callbacks: Callbacks::default(),
                    parent: Some(parent_inner.id),
                    children: Vec::new(),
                    savepoint_rollbacks: 0,
                    savepoints_created: 0,
                    deadlock_count: 0,
                    detector: parent_inner.detector.clone(),
                })),
            }
        };
        {
            let child_id = child.id();
            parent.inner.lock().children.push(child_id);
        }

        match f(child.clone()).await {
            Ok(value) => {
                let child_ops = {
                    let mut child_inner = child.inner.lock();
                    child_inner.state = TransactionState::Committed;
                    child_inner.end_time = Some(Utc::now());
                    std::mem::take(&mut child_inner.operations)
                };
                parent.inner.lock().operations.extend(child_ops);
                Ok(value)
            }
            Err(e) => {
                {
                    let mut child_inner = child.inner.lock();
                    child_inner.state = TransactionState::RolledBack;
                    child_inner.end_time = Some(Utc::now());
                }
                parent.rollback_to_savepoint(&savepoint)?;
                info!(savepoint = %savepoint, error = %e, "nested context rolled back to savepoint");
                Err(e)
            }
        }
    }

    /// Invokes `f` up to `max_attempts` times, retrying only errors whose
    /// message matches the retryable pattern set. The delay doubles each
    /// attempt. The outcome, including the retry count, is recorded with
    /// the performance monitor.
    pub async fn run_with_retry<F, Fut, T>(
        &self,
        f: F,
        max_attempts: u32,
        base_delay: Duration,
    ) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let started = Utc::now();
        let mut attempt = 0u32;
        let mut last_error: Option<TandemError> = None;

        while attempt < max_attempts.max(1) {
            match f().await {
                Ok(value) => {
                    self.record_retry_outcome(started, attempt, true, None);
                    return Ok(value);
                }
                Err(e) => {
                    let retryable = is_retryable_error(&e);
                    attempt += 1;
                    if retryable && attempt < max_attempts.max(1) {
                        let delay = base_delay * 2u32.pow(attempt - 1);
                        warn!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "retryable failure, backing off");
                        tokio::time::sleep(delay).await;
                        last_error = Some(e);
                        continue;
                    }
                    self.record_retry_outcome(started, attempt - 1, false, Some(e.to_string()));
                    return Err(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| TandemError::Internal("retry loop exhausted".to_string())))
    }

    /// Information about every active transaction.
    pub fn active_transactions(&self) -> Vec<ActiveTxInfo> {
        self.active.lock().values().map(|h| h.info()).collect()
    }

    /// Rolls back expired contexts. Returns the number cleaned up.
    pub async fn sweep_expired(&self) -> usize {
        let expired: Vec<TxHandle> = {
            let active = self.active.lock();
            active.values().filter(|h| h.is_expired()).cloned().collect()
        };

        let mut cleaned = 0;
        for handle in expired {
            if self.rollback(&handle, "expired").await.is_ok() {
                self.metrics.lock().expired_transactions += 1;
                cleaned += 1;
            }
        }
        if cleaned > 0 {
            info!(count = cleaned, "expired transactions rolled back");
        }
        cleaned
    }

    pub fn metrics(&self) -> TxCoordinatorMetrics {
        self.metrics.lock().clone()
    }

    /// Rolls back every active transaction and stops the workers.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let workers: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            let _ = worker.await;
        }

        let handles: Vec<TxHandle> = self.active.lock().values().cloned().collect();
        for handle in handles {
            let _ = self.rollback(&handle, "system shutdown").await;
        }
        info!("transaction coordinator shut down");
    }

    // ---- internal -------------------------------------------------------

    fn start_workers(coordinator: &Arc<Self>) {
        let mut workers = coordinator.workers.lock();

        {
            let coordinator = coordinator.clone();
            let token = coordinator.shutdown.child_token();
            workers.push(tokio::spawn(async move {
                let mut interval = tokio::time::interval(coordinator.config.sweep_interval);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                interval.tick().await;
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = interval.tick() => {
                            coordinator.sweep_expired().await;
                        }
                    }
                }
            }));
        }

        {
            let coordinator = coordinator.clone();
            let token = coordinator.shutdown.child_token();
            let mut victims = coordinator.detector.victim_events();
            workers.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        victim = victims.recv() => {
                            let Some(victim) = victim else { break };
                            coordinator.abort_victim(&victim).await;
                        }
                    }
                }
            }));
        }
    }

    async fn abort_victim(&self, victim: &str) {
        let handle = {
            let active = self.active.lock();
            victim
                .parse::<Uuid>()
                .ok()
                .and_then(|id| active.get(&id).cloned())
        };
        if let Some(handle) = handle {
            handle.inner.lock().deadlock_count += 1;
            if self.rollback(&handle, "deadlock_victim").await.is_ok() {
                self.metrics.lock().deadlock_victims += 1;
            }
        }
    }

    /// Common epilogue: unregister from the detector, release the
    /// connection, update metrics and feed the monitor.
    async fn finalize(&self, handle: &TxHandle, success: bool, error: Option<String>) {
        let (id, lease, stats, duration) = {
            let inner = handle.inner.lock();
            let duration = inner.duration_secs();
            let stats = TxStats {
                tx_id: inner.id.to_string(),
                start_time: inner.start_time,
                end_time: inner.end_time,
                duration_secs: Some(duration),
                operations: inner.operations.len() as u64,
                rows_affected: 0,
                rollback_count: inner.savepoint_rollbacks + u64::from(!success),
                deadlock_count: inner.deadlock_count,
                retry_count: 0,
                savepoint_count: inner.savepoints_created,
                success,
                backend: Some(inner.lease.kind),
                error,
            };
            (inner.id, inner.lease.clone(), stats, duration)
        };

        self.detector.unregister(&id.to_string());

        {
            let mut active = self.active.lock();
            active.remove(&id);
            self.monitor.set_active_transactions(active.len());
        }

        {
            let mut metrics = self.metrics.lock();
            if success {
                metrics.successful_transactions += 1;
            } else {
                metrics.failed_transactions += 1;
                metrics.rolled_back_transactions += 1;
            }
            metrics.savepoints_created += stats.savepoint_count;
            metrics.rollbacks_to_savepoint += handle.inner.lock().savepoint_rollbacks;
            if duration > metrics.longest_transaction_secs {
                metrics.longest_transaction_secs = duration;
            }
            let mut finished = self.finished_durations.lock();
            finished.0 += 1;
            finished.1 += duration;
            metrics.average_transaction_secs = finished.1 / finished.0 as f64;
        }

        self.monitor.record_tx(stats);
        let _ = self.pool.release(lease).await;
    }

    fn record_retry_outcome(
        &self,
        started: DateTime<Utc>,
        retries: u32,
        success: bool,
        error: Option<String>,
    ) {
        let now = Utc::now();
        let stats = TxStats {
            tx_id: format!("retry-{}", Uuid::new_v4().simple()),
            start_time: started,
            end_time: Some(now),
            duration_secs: Some((now - started).num_milliseconds() as f64 / 1000.0),
            operations: 0,
            rows_affected: 0,
            rollback_count: 0,
            deadlock_count: 0,
            retry_count: retries as u64,
            savepoint_count: 0,
            success,
            backend: None,
            error,
        };
        self.monitor.record_tx(stats);
    }
}

/// Retryable means the error kind is classified retryable (deadlock,
/// serialization failure, pool timeout; the adapters classify raw driver
/// faults by SQLSTATE before any message string exists), or, for faults
/// that only reach us as text, the message matches one of the transient
/// fault patterns.
pub fn is_retryable_error(error: &TandemError) -> bool {
    if error.is_retryable() {
        return true;
    }
    let message = error.to_string().to_lowercase();
    RETRYABLE_PATTERNS.iter().any(|p| message.contains(p))
}

/// Renders a structured operation as canonical named-parameter SQL, leaving
/// placeholder translation to the adapter. Condition placeholders carry a
/// `cond_` prefix so a column may appear in both data and conditions.
fn canonical_statement(op: &Operation) -> Result<(String, Params)> {
    if let Some(raw) = &op.raw_query {
        return Ok((raw.clone(), op.params.clone()));
    }

    let mut named: std::collections::BTreeMap<String, SqlValue> = std::collections::BTreeMap::new();
    let sql = match op.kind {
        OperationKind::Insert => {
            let columns: Vec<&str> = op.data.keys().map(String::as_str).collect();
            let placeholders: Vec<String> = op.data.keys().map(|k| format!(":{}", k)).collect();
            for (k, v) in &op.data {
                named.insert(k.clone(), v.clone());
            }
            format!(
                "INSERT INTO {} ({}) VALUES ({})",
                op.table,
                columns.join(", "),
                placeholders.join(", ")
            )
        }
        OperationKind::Update => {
            let set_clause: Vec<String> =
                op.data.keys().map(|k| format!("{} = :{}", k, k)).collect();
            let where_clause: Vec<String> = op
                .conditions
                .keys()
                .map(|k| format!("{} = :cond_{}", k, k))
                .collect();
            for (k, v) in &op.data {
                named.insert(k.clone(), v.clone());
            }
            for (k, v) in &op.conditions {
                named.insert(format!("cond_{}", k), v.clone());
            }
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
                .keys()
                .map(|k| format!("{} = :cond_{}", k, k))
                .collect();
            for (k, v) in &op.conditions {
                named.insert(format!("cond_{}", k), v.clone());
            }
            format!("DELETE FROM {} WHERE {}", op.table, where_clause.join(" AND "))
        }
        OperationKind::Select => {
            if op.conditions.is_empty() {
                format!("SELECT * FROM {}", op.table)
            } else {
                let where_clause: Vec<String> = op
                    .conditions
                    .keys()
                    .map(|k| format!("{} = :cond_{}", k, k))
                    .collect();
                for (k, v) in &op.conditions {
                    named.insert(format!("cond_{}", k), v.clone());
                }
                format!(
                    "SELECT * FROM {} WHERE {}",
                    op.table,
                    where_clause.join(" AND ")
                )
            }
        }
        OperationKind::Raw | OperationKind::Ddl => {
            return Err(TandemError::ValidationFailure(
                "raw operation without query text".to_string(),
            ));
        }
    };

    Ok((sql, Params::Named(named)))
}

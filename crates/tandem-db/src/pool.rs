//! Connection pool with lifecycle management, health checks and auto-scaling.
//!
//! The pool exclusively owns its connections: callers receive a
//! [`ConnectionLease`] that borrows the live session, and hand it back with
//! [`ConnectionPool::release`]. Three cooperative background workers keep
//! the pool healthy: a cleanup sweep (stale eviction + auto-scaling), a
//! health sweep (pings + failed-backend retry) and a 30-second statistics
//! snapshot ring.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use tandem_common::{Result, TandemError};

use crate::adapter::{postgres::PostgresAdapter, sqlite::SqliteAdapter, BackendAdapter};
use crate::config::BackendConfig;
use crate::types::{BackendKind, ConnectionHandle, ConnectionStatus, Params, QueryResult};

/// Hard ceiling the auto-scaler never grows past.
const AUTO_SCALE_CAP: usize = 50;
/// Minimum gap between detailed per-connection health probes.
const HEALTH_PROBE_WINDOW: Duration = Duration::from_secs(30);
/// Consecutive probe failures after which a connection is invalid.
const MAX_PROBE_FAILURES: u32 = 3;
/// Snapshot cadence for the monitoring ring.
const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(30);
/// Snapshot ring capacity.
const SNAPSHOT_CAPACITY: usize = 100;
/// Snapshots older than this many hours are evicted.
const SNAPSHOT_RETENTION_HOURS: i64 = 24;

/// Connection pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    pub min_connections: usize,
    pub max_connections: usize,
    /// Maximum acquire wait.
    pub connection_timeout: Duration,
    /// Idle eviction threshold.
    pub idle_timeout: Duration,
    /// Hard age limit for any connection.
    pub connection_max_age: Duration,
    pub health_check_interval: Duration,
    pub cleanup_interval: Duration,
    /// Backoff before re-attempting a failed backend.
    pub failed_connection_retry_interval: Duration,
    /// Enables the 30s snapshot ring.
    pub monitoring_enabled: bool,
    pub auto_scale_enabled: bool,
    pub scale_up_threshold: f64,
    pub scale_down_threshold: f64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_connections: 2,
            max_connections: 10,
            connection_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(300),
            connection_max_age: Duration::from_secs(3600),
            health_check_interval: Duration::from_secs(60),
            cleanup_interval: Duration::from_secs(120),
            failed_connection_retry_interval: Duration::from_secs(30),
            monitoring_enabled: true,
            auto_scale_enabled: false,
            scale_up_threshold: 0.8,
            scale_down_threshold: 0.3,
        }
    }
}

/// Per-connection counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionMetrics {
    pub created_at: DateTime<Utc>,
    pub total_uses: u64,
    pub total_active_time: f64,
    pub last_health_check: DateTime<Utc>,
    pub health_check_failures: u32,
    /// Decays on slow responses, recovers on fast ones; clamped to [0.1, 1.0].
    pub performance_score: f64,
}

impl ConnectionMetrics {
    fn new() -> Self {
        let now = Utc::now();
        Self {
            created_at: now,
            total_uses: 0,
            total_active_time: 0.0,
            last_health_check: now,
            health_check_failures: 0,
            performance_score: 1.0,
        }
    }
}

/// Aggregate pool statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoolStatistics {
    pub total_connections: usize,
    pub active_connections: usize,
    pub idle_connections: usize,
    pub failed_connections: usize,
    pub max_connections: usize,
    pub peak_connections: usize,
    pub connections_created: u64,
    pub connections_destroyed: u64,
    pub connection_requests: u64,
    pub connection_timeouts: u64,
    pub connection_failures: u64,
    pub connection_recoveries: u64,
    pub health_check_failures: u64,
    pub stale_connections_cleaned: u64,
    pub average_wait_time: f64,
    pub average_connection_age: f64,
    /// active / total.
    pub pool_efficiency: f64,
}

/// One entry in the monitoring snapshot ring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSnapshot {
    pub timestamp: DateTime<Utc>,
    pub total_connections: usize,
    pub active_connections: usize,
    pub idle_connections: usize,
    pub failed_connections: usize,
    pub connection_requests: u64,
    pub connection_timeouts: u64,
    pub average_wait_time: f64,
    pub pool_efficiency: f64,
}

/// Overall pool health grade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolHealthStatus {
    Excellent,
    Good,
    Fair,
    Poor,
}

/// Health summary with threshold-driven recommendations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolHealthSummary {
    pub overall_status: PoolHealthStatus,
    pub health_score: f64,
    pub total_connections: usize,
    pub healthy_connections: usize,
    pub unhealthy_connections: usize,
    pub failed_connections: usize,
    pub pool_utilization: f64,
    pub average_wait_time: f64,
    pub connection_success_rate: f64,
    pub recommendations: Vec<String>,
}

/// Lifecycle detail for one connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionLifecycle {
    pub id: Uuid,
    pub kind: BackendKind,
    pub status: ConnectionStatus,
    pub created_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
    pub age_seconds: f64,
    pub idle_seconds: f64,
    pub total_uses: u64,
    pub total_active_time: f64,
    pub health_check_failures: u32,
    pub performance_score: f64,
}

/// Trend direction over recent snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Increasing,
    Decreasing,
    Stable,
    InsufficientData,
}

/// Detailed performance report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolPerformanceReport {
    pub statistics: PoolStatistics,
    pub success_rate: f64,
    pub utilization_history: Vec<(DateTime<Utc>, f64)>,
    pub connection_performance: HashMap<Uuid, ConnectionLifecycle>,
    pub utilization_trend: Trend,
    pub wait_time_trend: Trend,
}

/// A borrowed connection. The pool retains ownership; hand the lease back
/// with [`ConnectionPool::release`].
#[derive(Clone)]
pub struct ConnectionLease {
    pub id: Uuid,
    pub kind: BackendKind,
    adapter: Arc<dyn BackendAdapter>,
}

impl ConnectionLease {
    pub fn adapter(&self) -> &Arc<dyn BackendAdapter> {
        &self.adapter
    }

    pub async fn execute(&self, query: &str, params: &Params) -> Result<QueryResult> {
        self.adapter.execute(query, params).await
    }

    pub async fn ping(&self) -> Result<()> {
        self.adapter.ping().await
    }
}

impl std::fmt::Debug for ConnectionLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionLease")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

struct PoolEntry {
    handle: ConnectionHandle,
    adapter: Arc<dyn BackendAdapter>,
    metrics: ConnectionMetrics,
}

#[derive(Default)]
struct PoolState {
    entries: HashMap<Uuid, PoolEntry>,
    idle: VecDeque<Uuid>,
    loaned: HashSet<Uuid>,
    /// Backends with a recent creation failure, by failure time.
    failed: HashMap<BackendKind, DateTime<Utc>>,
    snapshots: VecDeque<PoolSnapshot>,
    stats: PoolStatistics,
    /// Current capacity; diverges from config under auto-scaling / resize.
    max_connections: usize,
    closed: bool,
}

/// Database connection pool manager.
pub struct ConnectionPool {
    config: PoolConfig,
    backends: Mutex<HashMap<BackendKind, BackendConfig>>,
    state: Mutex<PoolState>,
    returned: Notify,
    shutdown: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ConnectionPool {
    /// Creates the pool and starts its background workers.
    pub fn new(config: PoolConfig) -> Arc<Self> {
        let max_connections = config.max_connections;
        let pool = Arc::new(Self {
            config,
            backends: Mutex::new(HashMap::new()),
            state: Mutex::new(PoolState {
                max_connections,
                ..Default::default()
            }),
            returned: Notify::new(),
            shutdown: CancellationToken::new(),
            workers: Mutex::new(Vec::new()),
        });
        Self::start_workers(&pool);
        pool
    }

    /// Registers a backend the pool may create connections for.
    pub fn register_backend(&self, config: BackendConfig) -> Result<()> {
        config.validate()?;
        self.backends.lock().insert(config.kind, config);
        Ok(())
    }

    pub fn registered_backends(&self) -> Vec<BackendKind> {
        self.backends.lock().keys().copied().collect()
    }

    /// Acquires a validated connection, preferring an idle match, then
    /// creating below capacity, then waiting up to the remaining timeout.
    #[instrument(skip(self), fields(kind = ?kind))]
    pub async fn acquire(
        &self,
        kind: Option<BackendKind>,
        timeout: Option<Duration>,
    ) -> Result<ConnectionLease> {
        let timeout = timeout.unwrap_or(self.config.connection_timeout);
        let started = Instant::now();
        let deadline = started + timeout;

        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(TandemError::PoolTimeout("pool is closed".to_string()));
            }
            state.stats.connection_requests += 1;
        }

        loop {
            // Prefer an idle matching connection.
            while let Some(id) = self.pop_idle(kind) {
                if self.validate(id).await {
                    if let Some(lease) = self.loan(id, started) {
                        return Ok(lease);
                    }
                    continue;
                }
                self.remove_connection(id).await;
            }

            // Create a fresh one below capacity.
            if self.can_create() {
                match self.create_connection(kind).await {
                    Ok(Some(id)) => {
                        if let Some(lease) = self.loan(id, started) {
                            return Ok(lease);
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        debug!(error = %e, "connection creation failed during acquire");
                    }
                }
            }

            // Wait for a return, bounded by the remaining timeout.
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let notified = self.returned.notified();
            if tokio::time::timeout(remaining, notified).await.is_err() {
                break;
            }
        }

        let waited = started.elapsed().as_secs_f64();
        let mut state = self.state.lock();
        state.stats.connection_timeouts += 1;
        Self::update_wait_time(&mut state.stats, waited);
        Err(TandemError::PoolTimeout(format!(
            "no {} connection available within {:.1}s",
            kind.map(|k| k.as_str()).unwrap_or("any"),
            timeout.as_secs_f64()
        )))
    }

    /// Returns a connection to the idle queue. Validating first: invalid
    /// connections are closed instead. Releasing a lease twice is a no-op.
    pub async fn release(&self, lease: ConnectionLease) -> Result<()> {
        let id = lease.id;
        let was_loaned = {
            let mut state = self.state.lock();
            let was_loaned = state.loaned.remove(&id);
            if was_loaned {
                if let Some(entry) = state.entries.get_mut(&id) {
                    let active = (Utc::now() - entry.handle.last_used).num_milliseconds() as f64
                        / 1000.0;
                    entry.metrics.total_active_time += active.max(0.0);
                }
            }
            was_loaned
        };

        if !was_loaned {
            // Second release of the same lease: nothing to do.
            return Ok(());
        }

        if self.validate(id).await {
            let mut state = self.state.lock();
            if state.entries.contains_key(&id) && state.idle.len() < state.max_connections {
                state.idle.push_back(id);
                Self::refresh_statistics(&mut state);
                drop(state);
                self.returned.notify_one();
                return Ok(());
            }
        }

        self.remove_connection(id).await;
        Ok(())
    }

    /// Marks a connection failed, removes it, and attempts an immediate
    /// replacement; otherwise the health worker retries later.
    pub async fn on_failure(&self, lease: &ConnectionLease) -> bool {
        let kind = lease.kind;
        {
            let mut state = self.state.lock();
            if let Some(entry) = state.entries.get_mut(&lease.id) {
                entry.handle.status = ConnectionStatus::Failed;
            }
            state.failed.insert(kind, Utc::now());
            state.stats.connection_failures += 1;
        }
        self.remove_connection(lease.id).await;

        if self.can_create() {
            if let Ok(Some(_)) = self.create_connection(Some(kind)).await {
                self.state.lock().stats.connection_recoveries += 1;
                return true;
            }
        }
        false
    }

    /// Adjusts capacity; shrinking closes idle connections down to the new
    /// ceiling.
    pub async fn resize(&self, new_max: usize) -> Result<()> {
        let to_close: Vec<Uuid> = {
            let mut state = self.state.lock();
            let old_max = state.max_connections;
            state.max_connections = new_max;
            state.stats.max_connections = new_max;
            info!(old_max, new_max, "pool resized");

            if new_max >= old_max {
                Vec::new()
            } else {
                let mut out = Vec::new();
                while state.entries.len() - out.len() > new_max {
                    match state.idle.pop_front() {
                        Some(id) => out.push(id),
                        None => break,
                    }
                }
                out
            }
        };

        for id in to_close {
            self.remove_connection(id).await;
        }
        Ok(())
    }

    /// Stops background workers, closes every connection and clears all
    /// queues. Idempotent.
    pub async fn close_all(&self) {
        self.shutdown.cancel();
        let workers: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            let _ = worker.await;
        }

        let (ids, adapters): (Vec<Uuid>, Vec<Arc<dyn BackendAdapter>>) = {
            let state = self.state.lock();
            state
                .entries
                .iter()
                .map(|(id, e)| (*id, e.adapter.clone()))
                .unzip()
        };

        for adapter in adapters {
            let _ = adapter.disconnect().await;
        }

        let mut state = self.state.lock();
        state.stats.connections_destroyed += ids.len() as u64;
        state.entries.clear();
        state.idle.clear();
        state.loaned.clear();
        state.failed.clear();
        state.snapshots.clear();
        state.closed = true;
        Self::refresh_statistics(&mut state);
        info!("connection pool closed");
    }

    /// Current statistics snapshot.
    pub fn statistics(&self) -> PoolStatistics {
        let mut state = self.state.lock();
        Self::refresh_statistics(&mut state);
        state.stats.clone()
    }

    /// Health summary with a graded score and recommendations.
    pub async fn health_summary(&self) -> PoolHealthSummary {
        let ids: Vec<Uuid> = self.state.lock().entries.keys().copied().collect();

        let mut healthy = 0usize;
        let mut unhealthy = 0usize;
        for id in &ids {
            if self.validate(*id).await {
                healthy += 1;
            } else {
                unhealthy += 1;
            }
        }

        let mut state = self.state.lock();
        Self::refresh_statistics(&mut state);
        let total = state.entries.len();
        let health_score = if total > 0 {
            healthy as f64 / total as f64
        } else {
            1.0
        };
        let overall_status = if health_score >= 0.9 {
            PoolHealthStatus::Excellent
        } else if health_score >= 0.7 {
            PoolHealthStatus::Good
        } else if health_score >= 0.5 {
            PoolHealthStatus::Fair
        } else {
            PoolHealthStatus::Poor
        };

        let requests = state.stats.connection_requests.max(1);
        let success_rate = 1.0 - state.stats.connection_timeouts as f64 / requests as f64;

        PoolHealthSummary {
            overall_status,
            health_score,
            total_connections: total,
            healthy_connections: healthy,
            unhealthy_connections: unhealthy,
            failed_connections: state.failed.len(),
            pool_utilization: state.stats.pool_efficiency,
            average_wait_time: state.stats.average_wait_time,
            connection_success_rate: success_rate,
            recommendations: Self::recommendations(&state),
        }
    }

    /// Detailed performance report with utilization history and trends.
    pub fn performance_report(&self) -> PoolPerformanceReport {
        let mut state = self.state.lock();
        Self::refresh_statistics(&mut state);

        let requests = state.stats.connection_requests.max(1);
        let success_rate = 1.0 - state.stats.connection_timeouts as f64 / requests as f64;

        let utilization_history: Vec<(DateTime<Utc>, f64)> = state
            .snapshots
            .iter()
            .rev()
            .take(10)
            .rev()
            .map(|s| {
                let total = s.total_connections.max(1);
                (s.timestamp, s.active_connections as f64 / total as f64)
            })
            .collect();

        let connection_performance: HashMap<Uuid, ConnectionLifecycle> = state
            .entries
            .values()
            .map(|e| (e.handle.id, Self::lifecycle_of(e)))
            .collect();

        let recent: Vec<&PoolSnapshot> = state.snapshots.iter().rev().take(5).rev().collect();
        let utilization_trend = Self::classify_trend(
            recent
                .iter()
                .map(|s| s.active_connections as f64 / s.total_connections.max(1) as f64)
                .collect(),
        );
        let wait_time_trend =
            Self::classify_trend(recent.iter().map(|s| s.average_wait_time).collect());

        PoolPerformanceReport {
            statistics: state.stats.clone(),
            success_rate,
            utilization_history,
            connection_performance,
            utilization_trend,
            wait_time_trend,
        }
    }

    /// Lifecycle detail for one connection, if it is still pooled.
    pub fn lifecycle_info(&self, id: Uuid) -> Option<ConnectionLifecycle> {
        let state = self.state.lock();
        state.entries.get(&id).map(Self::lifecycle_of)
    }

    /// Closes every idle connection of one backend. Used after a restore,
    /// when existing sessions may hold stale state.
    pub async fn purge_backend(&self, kind: BackendKind) -> usize {
        let to_close: Vec<Uuid> = {
            let state = self.state.lock();
            state
                .entries
                .values()
                .filter(|e| e.handle.kind == kind && !state.loaned.contains(&e.handle.id))
                .map(|e| e.handle.id)
                .collect()
        };
        for id in &to_close {
            self.remove_connection(*id).await;
        }
        to_close.len()
    }

    /// Stale sweep + sizing recommendations on demand.
    pub async fn optimize(&self) -> Vec<String> {
        let cleaned = self.cleanup_stale().await;
        let mut notes = Vec::new();
        if cleaned > 0 {
            notes.push(format!("cleaned {} stale connections", cleaned));
        }

        let state = self.state.lock();
        if state.stats.connection_timeouts > 0 && state.entries.len() < state.max_connections {
            notes.push("consider increasing pool size".to_string());
        }
        if state.idle.len() > state.max_connections / 2 {
            notes.push("consider decreasing pool size".to_string());
        }
        notes
    }

    // ---- internal -------------------------------------------------------

    fn start_workers(pool: &Arc<Self>) {
        let mut workers = pool.workers.lock();

        {
            let pool = pool.clone();
            let token = pool.shutdown.child_token();
            workers.push(tokio::spawn(async move {
                let mut interval = tokio::time::interval(pool.config.cleanup_interval);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                interval.tick().await;
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = interval.tick() => {
                            let cleaned = pool.cleanup_stale().await;
                            if cleaned > 0 {
                                pool.state.lock().stats.stale_connections_cleaned += cleaned as u64;
                            }
                            pool.evict_old_snapshots();
                            if pool.config.auto_scale_enabled {
                                pool.auto_scale().await;
                            }
                        }
                    }
                }
            }));
        }

        {
            let pool = pool.clone();
            let token = pool.shutdown.child_token();
            workers.push(tokio::spawn(async move {
                let mut interval = tokio::time::interval(pool.config.health_check_interval);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                interval.tick().await;
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = interval.tick() => {
                            pool.health_pass().await;
                            pool.retry_failed_backends().await;
                        }
                    }
                }
            }));
        }

        if pool.config.monitoring_enabled {
            let pool = pool.clone();
            let token = pool.shutdown.child_token();
            workers.push(tokio::spawn(async move {
                let mut interval = tokio::time::interval(SNAPSHOT_INTERVAL);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                interval.tick().await;
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = interval.tick() => pool.capture_snapshot(),
                    }
                }
            }));
        }
    }

    fn pop_idle(&self, kind: Option<BackendKind>) -> Option<Uuid> {
        let mut state = self.state.lock();
        if let Some(kind) = kind {
            let pos = state.idle.iter().position(|id| {
                state
                    .entries
                    .get(id)
                    .map(|e| e.handle.kind == kind)
                    .unwrap_or(false)
            })?;
            state.idle.remove(pos)
        } else {
            state.idle.pop_front()
        }
    }

    fn can_create(&self) -> bool {
        let state = self.state.lock();
        !state.closed && state.entries.len() < state.max_connections
    }

    fn make_adapter(config: &BackendConfig) -> Result<Arc<dyn BackendAdapter>> {
        Ok(match config.kind {
            BackendKind::Primary => Arc::new(PostgresAdapter::new(config.clone())?),
            BackendKind::Local => Arc::new(SqliteAdapter::new(config.clone())?),
        })
    }

    /// Creates a connection for the requested backend (or the first
    /// registered one), initializing its metrics and tracking the peak.
    async fn create_connection(&self, kind: Option<BackendKind>) -> Result<Option<Uuid>> {
        let config = {
            let backends = self.backends.lock();
            let config = match kind {
                Some(kind) => backends.get(&kind).cloned(),
                None => backends.values().next().cloned(),
            };
            match config {
                Some(c) => c,
                None => return Ok(None),
            }
        };

        let adapter = Self::make_adapter(&config)?;
        let handle = match adapter.connect().await {
            Ok(handle) => handle,
            Err(e) => {
                let mut state = self.state.lock();
                state.failed.insert(config.kind, Utc::now());
                return Err(e);
            }
        };

        let id = handle.id;
        let mut state = self.state.lock();
        if state.closed || state.entries.len() >= state.max_connections {
            drop(state);
            let _ = adapter.disconnect().await;
            return Ok(None);
        }

        state.entries.insert(
            id,
            PoolEntry {
                handle,
                adapter,
                metrics: ConnectionMetrics::new(),
            },
        );
        state.stats.connections_created += 1;
        if state.entries.len() > state.stats.peak_connections {
            state.stats.peak_connections = state.entries.len();
        }
        Self::refresh_statistics(&mut state);
        debug!(connection_id = %id, kind = %config.kind, "connection created");
        Ok(Some(id))
    }

    fn loan(&self, id: Uuid, started: Instant) -> Option<ConnectionLease> {
        let waited = started.elapsed().as_secs_f64();
        let mut state = self.state.lock();
        Self::update_wait_time(&mut state.stats, waited);

        let entry = state.entries.get_mut(&id)?;
        entry.handle.mark_used();
        entry.metrics.total_uses += 1;
        if waited < 0.1 {
            entry.metrics.performance_score = (entry.metrics.performance_score + 0.01).min(1.0);
        } else if waited > 1.0 {
            entry.metrics.performance_score = (entry.metrics.performance_score - 0.05).max(0.1);
        }

        let lease = ConnectionLease {
            id,
            kind: entry.handle.kind,
            adapter: entry.adapter.clone(),
        };
        state.loaned.insert(id);
        Self::refresh_statistics(&mut state);
        Some(lease)
    }

    /// Validation rule: CONNECTED, within age and idle limits, and a
    /// successful ping when the 30s health window has lapsed. More than
    /// three consecutive ping failures invalidates the connection.
    async fn validate(&self, id: Uuid) -> bool {
        let (adapter, needs_probe) = {
            let state = self.state.lock();
            let entry = match state.entries.get(&id) {
                Some(e) => e,
                None => return false,
            };
            if entry.handle.status != ConnectionStatus::Connected {
                return false;
            }
            let now = Utc::now();
            let age = now - entry.handle.created_at;
            if age.to_std().unwrap_or_default() > self.config.connection_max_age {
                return false;
            }
            let idle = now - entry.handle.last_used;
            if idle.to_std().unwrap_or_default() > self.config.idle_timeout {
                return false;
            }
            let since_probe = now - entry.metrics.last_health_check;
            let needs_probe = since_probe.to_std().unwrap_or_default() > HEALTH_PROBE_WINDOW;
            (entry.adapter.clone(), needs_probe)
        };

        if !needs_probe {
            return true;
        }

        match adapter.ping().await {
            Ok(()) => {
                let mut state = self.state.lock();
                if let Some(entry) = state.entries.get_mut(&id) {
                    entry.metrics.last_health_check = Utc::now();
                    entry.metrics.health_check_failures = 0;
                }
                true
            }
            Err(_) => {
                let mut state = self.state.lock();
                state.stats.health_check_failures += 1;
                match state.entries.get_mut(&id) {
                    Some(entry) => {
                        entry.metrics.health_check_failures += 1;
                        entry.metrics.health_check_failures <= MAX_PROBE_FAILURES
                    }
                    None => false,
                }
            }
        }
    }

    async fn remove_connection(&self, id: Uuid) {
        let adapter = {
            let mut state = self.state.lock();
            let entry = state.entries.remove(&id);
            if entry.is_some() {
                state.idle.retain(|i| *i != id);
                state.loaned.remove(&id);
                state.stats.connections_destroyed += 1;
                Self::refresh_statistics(&mut state);
            }
            entry.map(|e| e.adapter)
        };
        if let Some(adapter) = adapter {
            let _ = adapter.disconnect().await;
            debug!(connection_id = %id, "connection closed");
        }
    }

    async fn cleanup_stale(&self) -> usize {
        let stale: Vec<Uuid> = {
            let state = self.state.lock();
            let now = Utc::now();
            state
                .entries
                .values()
                .filter(|e| !state.loaned.contains(&e.handle.id))
                .filter(|e| {
                    let idle = (now - e.handle.last_used).to_std().unwrap_or_default();
                    let age = (now - e.handle.created_at).to_std().unwrap_or_default();
                    idle > self.config.idle_timeout || age > self.config.connection_max_age
                })
                .map(|e| e.handle.id)
                .collect()
        };

        for id in &stale {
            self.remove_connection(*id).await;
        }
        if !stale.is_empty() {
            debug!(count = stale.len(), "stale connections cleaned");
        }
        stale.len()
    }

    async fn health_pass(&self) {
        let ids: Vec<(Uuid, BackendKind)> = {
            let state = self.state.lock();
            state
                .entries
                .values()
                .map(|e| (e.handle.id, e.handle.kind))
                .collect()
        };

        for (id, kind) in ids {
            if !self.validate(id).await {
                warn!(connection_id = %id, backend = %kind, "unhealthy connection detected");
                let lease = {
                    let state = self.state.lock();
                    state.entries.get(&id).map(|e| ConnectionLease {
                        id,
                        kind,
                        adapter: e.adapter.clone(),
                    })
                };
                if let Some(lease) = lease {
                    self.on_failure(&lease).await;
                }
            }
        }
    }

    /// Re-attempts connection creation for backends whose failure record
    /// has aged past the retry interval.
    async fn retry_failed_backends(&self) {
        let ready: Vec<BackendKind> = {
            let mut state = self.state.lock();
            let now = Utc::now();
            let interval = self.config.failed_connection_retry_interval;
            let ready: Vec<BackendKind> = state
                .failed
                .iter()
                .filter(|(_, failed_at)| {
                    (now - **failed_at).to_std().unwrap_or_default() >= interval
                })
                .map(|(kind, _)| *kind)
                .collect();
            for kind in &ready {
                state.failed.remove(kind);
            }
            ready
        };

        for kind in ready {
            if !self.can_create() {
                break;
            }
            if let Ok(Some(_)) = self.create_connection(Some(kind)).await {
                let mut state = self.state.lock();
                state.stats.connection_recoveries += 1;
                info!(backend = %kind, "recovered connection for failed backend");
            }
        }
    }

    async fn auto_scale(&self) {
        let decision = {
            let mut state = self.state.lock();
            Self::refresh_statistics(&mut state);
            let utilization = state.stats.pool_efficiency;
            let current = state.max_connections;

            if utilization > self.config.scale_up_threshold && current < AUTO_SCALE_CAP {
                let new_max = (current + 2).min(AUTO_SCALE_CAP);
                state.max_connections = new_max;
                state.stats.max_connections = new_max;
                info!(utilization, new_max, "pool scaled up");
                None
            } else if utilization < self.config.scale_down_threshold
                && current > self.config.min_connections
            {
                Some((current - 1).max(self.config.min_connections))
            } else {
                None
            }
        };

        if let Some(new_max) = decision {
            let _ = self.resize(new_max).await;
        }
    }

    fn capture_snapshot(&self) {
        let mut state = self.state.lock();
        Self::refresh_statistics(&mut state);
        let snapshot = PoolSnapshot {
            timestamp: Utc::now(),
            total_connections: state.entries.len(),
            active_connections: state.loaned.len(),
            idle_connections: state.idle.len(),
            failed_connections: state.failed.len(),
            connection_requests: state.stats.connection_requests,
            connection_timeouts: state.stats.connection_timeouts,
            average_wait_time: state.stats.average_wait_time,
            pool_efficiency: state.stats.pool_efficiency,
        };
        state.snapshots.push_back(snapshot);
        while state.snapshots.len() > SNAPSHOT_CAPACITY {
            state.snapshots.pop_front();
        }
    }

    fn evict_old_snapshots(&self) {
        let cutoff = Utc::now() - chrono::Duration::hours(SNAPSHOT_RETENTION_HOURS);
        let mut state = self.state.lock();
        state.snapshots.retain(|s| s.timestamp > cutoff);
    }

    fn refresh_statistics(state: &mut PoolState) {
        state.stats.total_connections = state.entries.len();
        state.stats.idle_connections = state.idle.len();
        state.stats.active_connections = state.loaned.len();
        state.stats.failed_connections = state.failed.len();
        state.stats.max_connections = state.max_connections;
        state.stats.pool_efficiency = if state.entries.is_empty() {
            0.0
        } else {
            state.loaned.len() as f64 / state.entries.len() as f64
        };
        state.stats.average_connection_age = if state.entries.is_empty() {
            0.0
        } else {
            let now = Utc::now();
            let total: f64 = state
                .entries
                .values()
                .map(|e| (now - e.metrics.created_at).num_milliseconds() as f64 / 1000.0)
                .sum();
            total / state.entries.len() as f64
        };
    }

    fn update_wait_time(stats: &mut PoolStatistics, waited: f64) {
        let requests = stats.connection_requests;
        if requests > 1 {
            stats.average_wait_time =
                (stats.average_wait_time * (requests - 1) as f64 + waited) / requests as f64;
        } else {
            stats.average_wait_time = waited;
        }
    }

    fn lifecycle_of(entry: &PoolEntry) -> ConnectionLifecycle {
        ConnectionLifecycle {
            id: entry.handle.id,
            kind: entry.handle.kind,
            status: entry.handle.status,
            created_at: entry.handle.created_at,
            last_used: entry.handle.last_used,
            age_seconds: entry.handle.age_secs(),
            idle_seconds: entry.handle.idle_secs(),
            total_uses: entry.metrics.total_uses,
            total_active_time: entry.metrics.total_active_time,
            health_check_failures: entry.metrics.health_check_failures,
            performance_score: entry.metrics.performance_score,
        }
    }

    fn classify_trend(series: Vec<f64>) -> Trend {
        if series.len() < 2 {
            return Trend::InsufficientData;
        }
        let change = series[series.len() - 1] - series[0];
        if change > 0.1 {
            Trend::Increasing
        } else if change < -0.1 {
            Trend::Decreasing
        } else {
            Trend::Stable
        }
    }

    fn recommendations(state: &PoolState) -> Vec<String> {
        let mut out = Vec::new();
        let stats = &state.stats;

        if stats.pool_efficiency > 0.9 {
            out.push("pool utilization is very high; consider increasing max_connections".into());
        } else if stats.pool_efficiency < 0.3 && stats.total_connections > 0 {
            out.push("pool utilization is low; consider decreasing max_connections".into());
        }

        let timeout_rate =
            stats.connection_timeouts as f64 / stats.connection_requests.max(1) as f64;
        if timeout_rate > 0.05 {
            out.push(
                "high timeout rate; consider increasing connection_timeout or max_connections"
                    .into(),
            );
        }

        if !state.failed.is_empty() {
            out.push(format!(
                "{} failed backend(s) awaiting retry",
                state.failed.len()
            ));
        }

        if stats.health_check_failures > 10 {
            out.push("frequent health check failures; investigate connection stability".into());
        }

        if stats.average_wait_time > 1.0 {
            out.push("high average wait time; optimize connection creation or grow the pool".into());
        }

        out
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ConnectionPool")
            .field("total", &state.entries.len())
            .field("idle", &state.idle.len())
            .field("loaned", &state.loaned.len())
            .field("max", &state.max_connections)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_config(dir: &tempfile::TempDir) -> BackendConfig {
        BackendConfig::local_path(dir.path().join("pool.db"))
    }

    fn fast_pool_config() -> PoolConfig {
        PoolConfig {
            max_connections: 3,
            connection_timeout: Duration::from_millis(200),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_acquire_creates_and_releases() {
        let dir = tempfile::tempdir().unwrap();
        let pool = ConnectionPool::new(fast_pool_config());
        pool.register_backend(local_config(&dir)).unwrap();

        let lease = pool.acquire(Some(BackendKind::Local), None).await.unwrap();
        assert_eq!(lease.kind, BackendKind::Local);
        let stats = pool.statistics();
        assert_eq!(stats.total_connections, 1);
        assert_eq!(stats.active_connections, 1);
        assert_eq!(stats.connections_created, 1);
        assert_eq!(stats.peak_connections, 1);

        pool.release(lease).await.unwrap();
        let stats = pool.statistics();
        assert_eq!(stats.idle_connections, 1);
        assert_eq!(stats.active_connections, 0);
        pool.close_all().await;
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let pool = ConnectionPool::new(fast_pool_config());
        pool.register_backend(local_config(&dir)).unwrap();

        let lease = pool.acquire(None, None).await.unwrap();
        pool.release(lease.clone()).await.unwrap();
        pool.release(lease).await.unwrap();

        let stats = pool.statistics();
        assert_eq!(stats.idle_connections, 1);
        assert_eq!(stats.total_connections, 1);
        pool.close_all().await;
    }

    #[tokio::test]
    async fn test_total_never_exceeds_max() {
        let dir = tempfile::tempdir().unwrap();
        let pool = ConnectionPool::new(fast_pool_config());
        pool.register_backend(local_config(&dir)).unwrap();

        let a = pool.acquire(None, None).await.unwrap();
        let b = pool.acquire(None, None).await.unwrap();
        let c = pool.acquire(None, None).await.unwrap();
        assert_eq!(pool.statistics().total_connections, 3);

        // Capacity exhausted: the fourth acquire times out.
        let err = pool
            .acquire(None, Some(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert!(matches!(err, TandemError::PoolTimeout(_)));
        assert_eq!(pool.statistics().connection_timeouts, 1);
        assert!(pool.statistics().total_connections <= 3);

        pool.release(a).await.unwrap();
        pool.release(b).await.unwrap();
        pool.release(c).await.unwrap();
        pool.close_all().await;
    }

    #[tokio::test]
    async fn test_waiter_wakes_on_release() {
        let dir = tempfile::tempdir().unwrap();
        let pool = ConnectionPool::new(PoolConfig {
            max_connections: 1,
            connection_timeout: Duration::from_secs(5),
            ..Default::default()
        });
        pool.register_backend(local_config(&dir)).unwrap();

        let lease = pool.acquire(None, None).await.unwrap();
        let pool2 = pool.clone();
        let waiter = tokio::spawn(async move { pool2.acquire(None, None).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        pool.release(lease).await.unwrap();

        let lease = waiter.await.unwrap().unwrap();
        pool.release(lease).await.unwrap();
        pool.close_all().await;
    }

    #[tokio::test]
    async fn test_resize_shrinks_idle_connections() {
        let dir = tempfile::tempdir().unwrap();
        let pool = ConnectionPool::new(fast_pool_config());
        pool.register_backend(local_config(&dir)).unwrap();

        let a = pool.acquire(None, None).await.unwrap();
        let b = pool.acquire(None, None).await.unwrap();
        pool.release(a).await.unwrap();
        pool.release(b).await.unwrap();
        assert_eq!(pool.statistics().total_connections, 2);

        pool.resize(1).await.unwrap();
        let stats = pool.statistics();
        assert_eq!(stats.max_connections, 1);
        assert!(stats.total_connections <= 1);
        pool.close_all().await;
    }

    #[tokio::test]
    async fn test_close_all_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let pool = ConnectionPool::new(fast_pool_config());
        pool.register_backend(local_config(&dir)).unwrap();
        let lease = pool.acquire(None, None).await.unwrap();
        pool.release(lease).await.unwrap();

        pool.close_all().await;
        pool.close_all().await;

        let stats = pool.statistics();
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.idle_connections, 0);
    }

    #[tokio::test]
    async fn test_acquire_after_close_fails() {
        let dir = tempfile::tempdir().unwrap();
        let pool = ConnectionPool::new(fast_pool_config());
        pool.register_backend(local_config(&dir)).unwrap();
        pool.close_all().await;

        let err = pool.acquire(None, None).await.unwrap_err();
        assert!(matches!(err, TandemError::PoolTimeout(_)));
    }

    #[tokio::test]
    async fn test_on_failure_replaces_connection() {
        let dir = tempfile::tempdir().unwrap();
        let pool = ConnectionPool::new(fast_pool_config());
        pool.register_backend(local_config(&dir)).unwrap();

        let lease = pool.acquire(None, None).await.unwrap();
        let replaced = pool.on_failure(&lease).await;
        assert!(replaced);

        let stats = pool.statistics();
        assert_eq!(stats.connection_failures, 1);
        assert_eq!(stats.connection_recoveries, 1);
        assert_eq!(stats.total_connections, 1);
        pool.close_all().await;
    }

    #[tokio::test]
    async fn test_health_summary_grades() {
        let dir = tempfile::tempdir().unwrap();
        let pool = ConnectionPool::new(fast_pool_config());
        pool.register_backend(local_config(&dir)).unwrap();

        let lease = pool.acquire(None, None).await.unwrap();
        pool.release(lease).await.unwrap();

        let summary = pool.health_summary().await;
        assert_eq!(summary.overall_status, PoolHealthStatus::Excellent);
        assert_eq!(summary.healthy_connections, 1);
        assert!(summary.health_score >= 0.9);
        pool.close_all().await;
    }

    #[tokio::test]
    async fn test_performance_report_trends() {
        let dir = tempfile::tempdir().unwrap();
        let pool = ConnectionPool::new(fast_pool_config());
        pool.register_backend(local_config(&dir)).unwrap();

        let report = pool.performance_report();
        assert_eq!(report.utilization_trend, Trend::InsufficientData);
        assert!(report.connection_performance.is_empty());
        pool.close_all().await;
    }

    #[tokio::test]
    async fn test_lifecycle_info() {
        let dir = tempfile::tempdir().unwrap();
        let pool = ConnectionPool::new(fast_pool_config());
        pool.register_backend(local_config(&dir)).unwrap();

        let lease = pool.acquire(None, None).await.unwrap();
        let info = pool.lifecycle_info(lease.id).unwrap();
        assert_eq!(info.total_uses, 1);
        assert!(info.performance_score >= 0.1);
        assert!(pool.lifecycle_info(Uuid::new_v4()).is_none());

        pool.release(lease).await.unwrap();
        pool.close_all().await;
    }

    #[test]
    fn test_classify_trend() {
        assert_eq!(
            ConnectionPool::classify_trend(vec![0.1, 0.5]),
            Trend::Increasing
        );
        assert_eq!(
            ConnectionPool::classify_trend(vec![0.9, 0.2]),
            Trend::Decreasing
        );
        assert_eq!(
            ConnectionPool::classify_trend(vec![0.5, 0.55]),
            Trend::Stable
        );
        assert_eq!(
            ConnectionPool::classify_trend(vec![0.5]),
            Trend::InsufficientData
        );
    }
}

//! Transaction performance monitoring, alerting and optimization hints.
//!
//! Keeps a bounded rolling history of transaction statistics (10k entries)
//! and resource usage samples (1k entries), maintains real-time gauges,
//! evaluates alert thresholds on every recorded transaction, and rolls
//! aggregates into hourly and daily buckets with retention.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::types::BackendKind;

const TX_HISTORY_CAPACITY: usize = 10_000;
const RESOURCE_HISTORY_CAPACITY: usize = 1_000;
const ALERT_HISTORY_CAPACITY: usize = 1_000;
/// Summary window over the most recent transactions.
const SUMMARY_WINDOW: usize = 100;
/// Suggestion analysis window.
const ANALYSIS_WINDOW: usize = 1_000;
/// Daily rollups are kept this many days.
const DAILY_RETENTION_DAYS: i64 = 30;

/// Configurable performance thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceThresholds {
    pub slow_transaction: Duration,
    pub long_running_transaction: Duration,
    /// Percent of recent transactions.
    pub high_rollback_rate: f64,
    pub frequent_deadlocks_per_hour: u64,
    /// Percent.
    pub pool_utilization: f64,
    pub memory_mb: f64,
    pub cpu_percent: f64,
}

impl Default for PerformanceThresholds {
    fn default() -> Self {
        Self {
            slow_transaction: Duration::from_secs(10),
            long_running_transaction: Duration::from_secs(300),
            high_rollback_rate: 20.0,
            frequent_deadlocks_per_hour: 10,
            pool_utilization: 90.0,
            memory_mb: 1024.0,
            cpu_percent: 80.0,
        }
    }
}

/// Monitor configuration.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub monitoring_interval: Duration,
    /// Hourly rollup retention.
    pub retention_hours: i64,
    pub thresholds: PerformanceThresholds,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            monitoring_interval: Duration::from_secs(5),
            retention_hours: 24,
            thresholds: PerformanceThresholds::default(),
        }
    }
}

/// Statistics for one finished transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxStats {
    pub tx_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_secs: Option<f64>,
    pub operations: u64,
    pub rows_affected: u64,
    pub rollback_count: u64,
    pub deadlock_count: u64,
    pub retry_count: u64,
    pub savepoint_count: u64,
    pub success: bool,
    pub backend: Option<BackendKind>,
    pub error: Option<String>,
}

impl TxStats {
    pub fn new(tx_id: impl Into<String>) -> Self {
        Self {
            tx_id: tx_id.into(),
            start_time: Utc::now(),
            end_time: None,
            duration_secs: None,
            operations: 0,
            rows_affected: 0,
            rollback_count: 0,
            deadlock_count: 0,
            retry_count: 0,
            savepoint_count: 0,
            success: false,
            backend: None,
            error: None,
        }
    }
}

/// One resource usage sample.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub measurement_time: DateTime<Utc>,
    pub cpu_percent: f64,
    pub memory_mb: f64,
    pub disk_read_mb: f64,
    pub disk_write_mb: f64,
}

/// Alert kinds raised by threshold evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    SlowTransaction,
    LongRunningTransaction,
    HighRollbackRate,
    FrequentDeadlocks,
    ResourceExhaustion,
    ConnectionPoolFull,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Warning,
    Error,
    Critical,
}

/// A raised alert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub kind: AlertKind,
    pub severity: AlertSeverity,
    pub message: String,
    pub tx_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Real-time gauges.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Gauges {
    pub active_transactions: usize,
    pub transactions_per_second: f64,
    pub average_response_time: f64,
    pub success_rate: f64,
    pub rollback_rate: f64,
    pub deadlock_rate: f64,
    pub pool_utilization: f64,
    pub cpu_percent: f64,
    pub memory_mb: f64,
}

/// Summary over the last [`SUMMARY_WINDOW`] transactions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceSummary {
    pub total_transactions: usize,
    pub success_rate: f64,
    pub average_duration: f64,
    pub median_duration: f64,
    pub p95_duration: f64,
    pub p99_duration: f64,
    pub rollback_rate: f64,
    pub deadlock_rate: f64,
    pub transactions_per_second: f64,
    pub active_transactions: usize,
    pub pool_utilization: f64,
    pub cpu_percent: f64,
    pub memory_mb: f64,
    pub recent_alerts: usize,
}

/// One hourly trend bucket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrendBucket {
    pub hour: String,
    pub transactions: usize,
    pub average_duration: f64,
    pub p95_duration: f64,
    pub success_rate: f64,
    pub avg_cpu_percent: f64,
    pub avg_memory_mb: f64,
}

/// Prioritized optimization suggestion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Suggestion {
    pub pattern: String,
    pub optimization: String,
    pub description: String,
    pub steps: Vec<String>,
    /// 0–1, higher is more urgent.
    pub priority: f64,
}

/// Overall monitor health level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthLevel {
    Healthy,
    Warning,
    Critical,
}

/// Health check result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorHealth {
    pub check_time: DateTime<Utc>,
    pub overall: HealthLevel,
    pub active_transactions: usize,
    pub long_running_transactions: usize,
    pub failed_last_hour: usize,
    pub deadlocks_last_hour: u64,
    pub average_response_time: f64,
    pub pool_utilization: f64,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
    pub recommendations: Vec<String>,
}

#[derive(Debug, Clone, Default)]
struct Rollup {
    transactions: usize,
    total_duration: f64,
    success_count: usize,
    rollback_count: u64,
    deadlock_count: u64,
}

#[derive(Default)]
struct MonitorState {
    tx_history: VecDeque<TxStats>,
    resource_history: VecDeque<ResourceUsage>,
    alerts: VecDeque<Alert>,
    gauges: Gauges,
    hourly: HashMap<String, Rollup>,
    daily: HashMap<String, Rollup>,
}

type AlertCallback = Arc<dyn Fn(&Alert) + Send + Sync>;

/// Transaction performance monitor.
pub struct PerformanceMonitor {
    config: MonitorConfig,
    state: Mutex<MonitorState>,
    callbacks: Mutex<Vec<AlertCallback>>,
    shutdown: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl PerformanceMonitor {
    pub fn new(config: MonitorConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            state: Mutex::new(MonitorState::default()),
            callbacks: Mutex::new(Vec::new()),
            shutdown: CancellationToken::new(),
            worker: Mutex::new(None),
        })
    }

    pub fn thresholds(&self) -> &PerformanceThresholds {
        &self.config.thresholds
    }

    /// Records a finished transaction: history append, gauge refresh,
    /// alert evaluation, rollup update.
    pub fn record_tx(&self, stats: TxStats) {
        let alerts = {
            let mut state = self.state.lock();
            state.tx_history.push_back(stats.clone());
            while state.tx_history.len() > TX_HISTORY_CAPACITY {
                state.tx_history.pop_front();
            }
            Self::refresh_gauges(&mut state);
            Self::update_rollups(&mut state, &stats);
            self.evaluate_tx_alerts(&mut state, &stats)
        };
        self.dispatch_alerts(alerts);
    }

    /// Records a resource usage sample and evaluates resource alerts.
    pub fn record_resource_usage(&self, usage: ResourceUsage) {
        let alerts = {
            let mut state = self.state.lock();
            state.gauges.cpu_percent = usage.cpu_percent;
            state.gauges.memory_mb = usage.memory_mb;
            state.resource_history.push_back(usage.clone());
            while state.resource_history.len() > RESOURCE_HISTORY_CAPACITY {
                state.resource_history.pop_front();
            }
            self.evaluate_resource_alerts(&mut state, &usage)
        };
        self.dispatch_alerts(alerts);
    }

    /// Updates the active-transaction gauge.
    pub fn set_active_transactions(&self, count: usize) {
        self.state.lock().gauges.active_transactions = count;
    }

    /// Updates the pool utilization gauge (percent).
    pub fn set_pool_utilization(&self, percent: f64) {
        self.state.lock().gauges.pool_utilization = percent;
    }

    pub fn add_alert_callback(&self, callback: impl Fn(&Alert) + Send + Sync + 'static) {
        self.callbacks.lock().push(Arc::new(callback));
    }

    pub fn gauges(&self) -> Gauges {
        self.state.lock().gauges.clone()
    }

    /// The most recent `n` recorded transactions, newest first.
    pub fn recent_transactions(&self, n: usize) -> Vec<TxStats> {
        self.state
            .lock()
            .tx_history
            .iter()
            .rev()
            .take(n)
            .cloned()
            .collect()
    }

    /// Summary over the last 100 transactions.
    pub fn summary(&self) -> PerformanceSummary {
        let state = self.state.lock();
        let recent: Vec<&TxStats> = state
            .tx_history
            .iter()
            .rev()
            .take(SUMMARY_WINDOW)
            .collect();

        if recent.is_empty() {
            return PerformanceSummary {
                total_transactions: 0,
                success_rate: 0.0,
                average_duration: 0.0,
                median_duration: 0.0,
                p95_duration: 0.0,
                p99_duration: 0.0,
                rollback_rate: 0.0,
                deadlock_rate: 0.0,
                transactions_per_second: state.gauges.transactions_per_second,
                active_transactions: state.gauges.active_transactions,
                pool_utilization: state.gauges.pool_utilization,
                cpu_percent: state.gauges.cpu_percent,
                memory_mb: state.gauges.memory_mb,
                recent_alerts: 0,
            };
        }

        let durations: Vec<f64> = recent.iter().filter_map(|t| t.duration_secs).collect();
        let success = recent.iter().filter(|t| t.success).count();
        let rollbacks: u64 = recent.iter().map(|t| t.rollback_count).sum();
        let deadlocks: u64 = recent.iter().map(|t| t.deadlock_count).sum();
        let hour_ago = Utc::now() - chrono::Duration::hours(1);

        PerformanceSummary {
            total_transactions: recent.len(),
            success_rate: success as f64 / recent.len() as f64 * 100.0,
            average_duration: Self::mean(&durations),
            median_duration: Self::percentile(&durations, 50),
            p95_duration: Self::percentile(&durations, 95),
            p99_duration: Self::percentile(&durations, 99),
            rollback_rate: rollbacks as f64 / recent.len() as f64 * 100.0,
            deadlock_rate: deadlocks as f64 / recent.len() as f64 * 100.0,
            transactions_per_second: state.gauges.transactions_per_second,
            active_transactions: state.gauges.active_transactions,
            pool_utilization: state.gauges.pool_utilization,
            cpu_percent: state.gauges.cpu_percent,
            memory_mb: state.gauges.memory_mb,
            recent_alerts: state
                .alerts
                .iter()
                .filter(|a| a.timestamp > hour_ago)
                .count(),
        }
    }

    /// Hourly trend buckets over the requested window.
    pub fn trends(&self, hours: i64) -> Vec<TrendBucket> {
        let cutoff = Utc::now() - chrono::Duration::hours(hours);
        let state = self.state.lock();

        let mut tx_by_hour: HashMap<String, Vec<&TxStats>> = HashMap::new();
        for tx in state.tx_history.iter().filter(|t| t.start_time >= cutoff) {
            tx_by_hour
                .entry(tx.start_time.format("%Y-%m-%d %H:00").to_string())
                .or_default()
                .push(tx);
        }

        let mut usage_by_hour: HashMap<String, Vec<&ResourceUsage>> = HashMap::new();
        for usage in state
            .resource_history
            .iter()
            .filter(|u| u.measurement_time >= cutoff)
        {
            usage_by_hour
                .entry(usage.measurement_time.format("%Y-%m-%d %H:00").to_string())
                .or_default()
                .push(usage);
        }

        let mut hours: Vec<String> = tx_by_hour.keys().cloned().collect();
        hours.sort();

        hours
            .into_iter()
            .map(|hour| {
                let txs = &tx_by_hour[&hour];
                let durations: Vec<f64> = txs.iter().filter_map(|t| t.duration_secs).collect();
                let success = txs.iter().filter(|t| t.success).count();
                let usage = usage_by_hour.get(&hour);
                TrendBucket {
                    transactions: txs.len(),
                    average_duration: Self::mean(&durations),
                    p95_duration: Self::percentile(&durations, 95),
                    success_rate: success as f64 / txs.len() as f64 * 100.0,
                    avg_cpu_percent: usage
                        .map(|u| Self::mean(&u.iter().map(|x| x.cpu_percent).collect::<Vec<_>>()))
                        .unwrap_or(0.0),
                    avg_memory_mb: usage
                        .map(|u| Self::mean(&u.iter().map(|x| x.memory_mb).collect::<Vec<_>>()))
                        .unwrap_or(0.0),
                    hour,
                }
            })
            .collect()
    }

    /// Heuristic optimization suggestions, highest priority first.
    pub fn suggestions(&self) -> Vec<Suggestion> {
        let state = self.state.lock();
        let recent: Vec<&TxStats> = state
            .tx_history
            .iter()
            .rev()
            .take(ANALYSIS_WINDOW)
            .collect();
        if recent.is_empty() {
            return Vec::new();
        }

        let thresholds = &self.config.thresholds;
        let mut out = Vec::new();

        let slow = recent
            .iter()
            .filter(|t| {
                t.duration_secs
                    .map(|d| d > thresholds.slow_transaction.as_secs_f64())
                    .unwrap_or(false)
            })
            .count();
        if slow as f64 > recent.len() as f64 * 0.1 {
            out.push(Suggestion {
                pattern: "slow_transactions".to_string(),
                optimization: "query".to_string(),
                description: format!(
                    "{} of the last {} transactions ran slower than {:.0}s",
                    slow,
                    recent.len(),
                    thresholds.slow_transaction.as_secs_f64()
                ),
                steps: vec![
                    "analyze slow query logs".to_string(),
                    "add indexes on hot-path columns".to_string(),
                    "restructure heavy queries".to_string(),
                    "cache repeated query results".to_string(),
                ],
                priority: 0.8,
            });
        }

        let rollback_rate =
            recent.iter().map(|t| t.rollback_count).sum::<u64>() as f64 / recent.len() as f64
                * 100.0;
        if rollback_rate > thresholds.high_rollback_rate {
            out.push(Suggestion {
                pattern: "high_rollback_rate".to_string(),
                optimization: "isolation_level".to_string(),
                description: format!("rollback rate at {:.1}%", rollback_rate),
                steps: vec![
                    "review transaction isolation levels".to_string(),
                    "narrow transaction scope".to_string(),
                    "use optimistic locking where applicable".to_string(),
                    "add retry logic for transient failures".to_string(),
                ],
                priority: 0.7,
            });
        }

        let deadlocks: u64 = recent.iter().map(|t| t.deadlock_count).sum();
        if deadlocks > thresholds.frequent_deadlocks_per_hour {
            out.push(Suggestion {
                pattern: "frequent_deadlocks".to_string(),
                optimization: "batch_size".to_string(),
                description: format!("{} deadlocks in the analysis window", deadlocks),
                steps: vec![
                    "establish a consistent lock ordering".to_string(),
                    "shorten transaction duration".to_string(),
                    "reduce batch sizes".to_string(),
                    "retry deadlock victims automatically".to_string(),
                ],
                priority: 0.9,
            });
        }

        if !state.resource_history.is_empty() {
            let samples: Vec<f64> = state
                .resource_history
                .iter()
                .rev()
                .take(100)
                .map(|u| u.memory_mb)
                .collect();
            let avg_memory = Self::mean(&samples);
            if avg_memory > thresholds.memory_mb {
                out.push(Suggestion {
                    pattern: "high_memory_usage".to_string(),
                    optimization: "batch_size".to_string(),
                    description: format!("average memory usage at {:.0} MB", avg_memory),
                    steps: vec![
                        "paginate large result sets".to_string(),
                        "stream instead of buffering bulk data".to_string(),
                        "reduce batch sizes".to_string(),
                    ],
                    priority: 0.6,
                });
            }
        }

        out.sort_by(|a, b| b.priority.partial_cmp(&a.priority).unwrap_or(std::cmp::Ordering::Equal));
        out
    }

    /// Health check over the last hour of activity.
    pub fn health(&self) -> MonitorHealth {
        let state = self.state.lock();
        let hour_ago = Utc::now() - chrono::Duration::hours(1);
        let thresholds = &self.config.thresholds;

        let recent: Vec<&TxStats> = state
            .tx_history
            .iter()
            .filter(|t| t.start_time >= hour_ago)
            .collect();
        let long_running = recent
            .iter()
            .filter(|t| {
                t.duration_secs
                    .map(|d| d > thresholds.long_running_transaction.as_secs_f64())
                    .unwrap_or(false)
            })
            .count();
        let failed = recent.iter().filter(|t| !t.success).count();
        let deadlocks: u64 = recent.iter().map(|t| t.deadlock_count).sum();

        let mut warnings = Vec::new();
        let mut errors = Vec::new();
        let mut recommendations = Vec::new();

        if long_running > 0 {
            warnings.push(format!("{} long-running transactions detected", long_running));
            recommendations.push("review and optimize long-running queries".to_string());
        }
        if failed as f64 > recent.len() as f64 * 0.05 {
            errors.push(format!("high failure rate: {} failures in the last hour", failed));
            recommendations.push("investigate transaction failure causes".to_string());
        }
        if deadlocks > thresholds.frequent_deadlocks_per_hour {
            errors.push(format!("frequent deadlocks: {} in the last hour", deadlocks));
            recommendations.push("apply deadlock prevention strategies".to_string());
        }
        if state.gauges.pool_utilization > thresholds.pool_utilization {
            warnings.push("high connection pool utilization".to_string());
            recommendations.push("consider increasing the connection pool size".to_string());
        }

        let overall = if !errors.is_empty() {
            HealthLevel::Critical
        } else if !warnings.is_empty() {
            HealthLevel::Warning
        } else {
            HealthLevel::Healthy
        };

        MonitorHealth {
            check_time: Utc::now(),
            overall,
            active_transactions: state.gauges.active_transactions,
            long_running_transactions: long_running,
            failed_last_hour: failed,
            deadlocks_last_hour: deadlocks,
            average_response_time: state.gauges.average_response_time,
            pool_utilization: state.gauges.pool_utilization,
            warnings,
            errors,
            recommendations,
        }
    }

    /// Starts the background loop: gauge refresh + rollup retention.
    pub fn start(self: &Arc<Self>) {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return;
        }
        let monitor = self.clone();
        let token = self.shutdown.child_token();
        *worker = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(monitor.config.monitoring_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        let mut state = monitor.state.lock();
                        Self::refresh_gauges(&mut state);
                        Self::evict_rollups(&mut state, monitor.config.retention_hours);
                    }
                }
            }
        }));
        info!("performance monitoring started");
    }

    pub async fn stop(&self) {
        self.shutdown.cancel();
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }
        info!("performance monitoring stopped");
    }

    // ---- internal -------------------------------------------------------

    fn dispatch_alerts(&self, alerts: Vec<Alert>) {
        if alerts.is_empty() {
            return;
        }
        let callbacks = self.callbacks.lock().clone();
        for alert in &alerts {
            warn!(kind = ?alert.kind, severity = ?alert.severity, message = %alert.message, "performance alert");
            for callback in &callbacks {
                callback(alert);
            }
        }
    }

    fn evaluate_tx_alerts(&self, state: &mut MonitorState, stats: &TxStats) -> Vec<Alert> {
        let thresholds = &self.config.thresholds;
        let mut alerts = Vec::new();

        if let Some(duration) = stats.duration_secs {
            if duration > thresholds.slow_transaction.as_secs_f64() {
                alerts.push(Alert {
                    kind: AlertKind::SlowTransaction,
                    severity: AlertSeverity::Warning,
                    message: format!("slow transaction: {:.2}s", duration),
                    tx_id: Some(stats.tx_id.clone()),
                    timestamp: Utc::now(),
                });
            }
            if duration > thresholds.long_running_transaction.as_secs_f64() {
                alerts.push(Alert {
                    kind: AlertKind::LongRunningTransaction,
                    severity: AlertSeverity::Error,
                    message: format!("long-running transaction: {:.2}s", duration),
                    tx_id: Some(stats.tx_id.clone()),
                    timestamp: Utc::now(),
                });
            }
        }

        for alert in &alerts {
            state.alerts.push_back(alert.clone());
        }
        while state.alerts.len() > ALERT_HISTORY_CAPACITY {
            state.alerts.pop_front();
        }
        alerts
    }

    fn evaluate_resource_alerts(&self, state: &mut MonitorState, usage: &ResourceUsage) -> Vec<Alert> {
        let thresholds = &self.config.thresholds;
        let mut alerts = Vec::new();

        if usage.cpu_percent > thresholds.cpu_percent {
            alerts.push(Alert {
                kind: AlertKind::ResourceExhaustion,
                severity: AlertSeverity::Warning,
                message: format!("high CPU usage: {:.1}%", usage.cpu_percent),
                tx_id: None,
                timestamp: Utc::now(),
            });
        }
        if usage.memory_mb > thresholds.memory_mb {
            alerts.push(Alert {
                kind: AlertKind::ResourceExhaustion,
                severity: AlertSeverity::Warning,
                message: format!("high memory usage: {:.1} MB", usage.memory_mb),
                tx_id: None,
                timestamp: Utc::now(),
            });
        }

        for alert in &alerts {
            state.alerts.push_back(alert.clone());
        }
        while state.alerts.len() > ALERT_HISTORY_CAPACITY {
            state.alerts.pop_front();
        }
        alerts
    }

    fn refresh_gauges(state: &mut MonitorState) {
        let recent: Vec<&TxStats> = state
            .tx_history
            .iter()
            .rev()
            .take(SUMMARY_WINDOW)
            .collect();
        if recent.is_empty() {
            return;
        }

        let newest = recent.first().map(|t| t.start_time);
        let oldest = recent.last().map(|t| t.start_time);
        if let (Some(newest), Some(oldest)) = (newest, oldest) {
            let span = (newest - oldest).num_milliseconds() as f64 / 1000.0;
            if span > 0.0 {
                state.gauges.transactions_per_second = recent.len() as f64 / span;
            }
        }

        let durations: Vec<f64> = recent.iter().filter_map(|t| t.duration_secs).collect();
        if !durations.is_empty() {
            state.gauges.average_response_time = Self::mean(&durations);
        }
        let success = recent.iter().filter(|t| t.success).count();
        state.gauges.success_rate = success as f64 / recent.len() as f64 * 100.0;
        let rollbacks: u64 = recent.iter().map(|t| t.rollback_count).sum();
        state.gauges.rollback_rate = rollbacks as f64 / recent.len() as f64 * 100.0;
        let deadlocks: u64 = recent.iter().map(|t| t.deadlock_count).sum();
        state.gauges.deadlock_rate = deadlocks as f64 / recent.len() as f64 * 100.0;
    }

    fn update_rollups(state: &mut MonitorState, stats: &TxStats) {
        let hour_key = stats.start_time.format("%Y-%m-%d %H").to_string();
        let day_key = stats.start_time.format("%Y-%m-%d").to_string();

        for rollup in [
            state.hourly.entry(hour_key).or_default(),
            state.daily.entry(day_key).or_default(),
        ] {
            rollup.transactions += 1;
            if let Some(d) = stats.duration_secs {
                rollup.total_duration += d;
            }
            if stats.success {
                rollup.success_count += 1;
            }
            rollup.rollback_count += stats.rollback_count;
            rollup.deadlock_count += stats.deadlock_count;
        }
    }

    fn evict_rollups(state: &mut MonitorState, retention_hours: i64) {
        let hourly_cutoff = Utc::now() - chrono::Duration::hours(retention_hours);
        state.hourly.retain(|key, _| {
            NaiveDateTime::parse_from_str(&format!("{}:00:00", key), "%Y-%m-%d %H:%M:%S")
                .map(|t| t.and_utc() >= hourly_cutoff)
                .unwrap_or(false)
        });

        let daily_cutoff = Utc::now() - chrono::Duration::days(DAILY_RETENTION_DAYS);
        state.daily.retain(|key, _| {
            NaiveDate::parse_from_str(key, "%Y-%m-%d")
                .map(|d| {
                    d.and_hms_opt(0, 0, 0)
                        .map(|t| t.and_utc() >= daily_cutoff)
                        .unwrap_or(false)
                })
                .unwrap_or(false)
        });
    }

    fn mean(values: &[f64]) -> f64 {
        if values.is_empty() {
            0.0
        } else {
            values.iter().sum::<f64>() / values.len() as f64
        }
    }

    fn percentile(values: &[f64], percentile: usize) -> f64 {
        if values.is_empty() {
            return 0.0;
        }
        let mut sorted = values.to_vec();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let index = (percentile as f64 / 100.0 * sorted.len() as f64) as usize;
        sorted[index.min(sorted.len() - 1)]
    }
}

impl std::fmt::Debug for PerformanceMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("PerformanceMonitor")
            .field("transactions", &state.tx_history.len())
            .field("alerts", &state.alerts.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn finished(tx_id: &str, duration: f64, success: bool) -> TxStats {
        let mut stats = TxStats::new(tx_id);
        stats.end_time = Some(Utc::now());
        stats.duration_secs = Some(duration);
        stats.success = success;
        stats
    }

    #[test]
    fn test_summary_over_recent_transactions() {
        let monitor = PerformanceMonitor::new(MonitorConfig::default());
        for i in 0..10 {
            monitor.record_tx(finished(&format!("t{}", i), 0.1 * (i + 1) as f64, i % 2 == 0));
        }

        let summary = monitor.summary();
        assert_eq!(summary.total_transactions, 10);
        assert!((summary.success_rate - 50.0).abs() < 1e-9);
        assert!(summary.average_duration > 0.0);
        assert!(summary.p99_duration >= summary.median_duration);
    }

    #[test]
    fn test_percentile() {
        let values: Vec<f64> = (1..=100).map(|v| v as f64).collect();
        assert_eq!(PerformanceMonitor::percentile(&values, 50), 51.0);
        assert_eq!(PerformanceMonitor::percentile(&values, 95), 96.0);
        assert_eq!(PerformanceMonitor::percentile(&values, 99), 100.0);
        assert_eq!(PerformanceMonitor::percentile(&[], 95), 0.0);
    }

    #[test]
    fn test_slow_transaction_alert_fires_callback() {
        let monitor = PerformanceMonitor::new(MonitorConfig::default());
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        monitor.add_alert_callback(move |alert| {
            assert_eq!(alert.kind, AlertKind::SlowTransaction);
            fired2.fetch_add(1, Ordering::SeqCst);
        });

        monitor.record_tx(finished("slow", 15.0, true));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(monitor.summary().recent_alerts, 1);
    }

    #[test]
    fn test_long_running_alert_is_error_severity() {
        let monitor = PerformanceMonitor::new(MonitorConfig::default());
        let severity = Arc::new(Mutex::new(None));
        let severity2 = severity.clone();
        monitor.add_alert_callback(move |alert| {
            if alert.kind == AlertKind::LongRunningTransaction {
                *severity2.lock() = Some(alert.severity);
            }
        });

        monitor.record_tx(finished("stuck", 400.0, false));
        assert_eq!(*severity.lock(), Some(AlertSeverity::Error));
    }

    #[test]
    fn test_resource_alerts() {
        let monitor = PerformanceMonitor::new(MonitorConfig::default());
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        monitor.add_alert_callback(move |_| {
            count2.fetch_add(1, Ordering::SeqCst);
        });

        monitor.record_resource_usage(ResourceUsage {
            measurement_time: Utc::now(),
            cpu_percent: 95.0,
            memory_mb: 2048.0,
            disk_read_mb: 0.0,
            disk_write_mb: 0.0,
        });

        // Both cpu and memory thresholds crossed.
        assert_eq!(count.load(Ordering::SeqCst), 2);
        let gauges = monitor.gauges();
        assert!((gauges.cpu_percent - 95.0).abs() < 1e-9);
    }

    #[test]
    fn test_suggestions_for_slow_transactions() {
        let monitor = PerformanceMonitor::new(MonitorConfig::default());
        for i in 0..20 {
            // Fifteen percent are slow.
            let duration = if i < 3 { 20.0 } else { 0.5 };
            monitor.record_tx(finished(&format!("t{}", i), duration, true));
        }

        let suggestions = monitor.suggestions();
        assert!(suggestions.iter().any(|s| s.pattern == "slow_transactions"));
    }

    #[test]
    fn test_suggestions_sorted_by_priority() {
        let monitor = PerformanceMonitor::new(MonitorConfig::default());
        for i in 0..20 {
            let mut stats = finished(&format!("t{}", i), 20.0, false);
            stats.rollback_count = 1;
            stats.deadlock_count = 1;
            monitor.record_tx(stats);
        }

        let suggestions = monitor.suggestions();
        assert!(suggestions.len() >= 3);
        for pair in suggestions.windows(2) {
            assert!(pair[0].priority >= pair[1].priority);
        }
        assert_eq!(suggestions[0].pattern, "frequent_deadlocks");
    }

    #[test]
    fn test_health_critical_on_deadlocks() {
        let monitor = PerformanceMonitor::new(MonitorConfig::default());
        for i in 0..12 {
            let mut stats = finished(&format!("t{}", i), 0.1, true);
            stats.deadlock_count = 1;
            monitor.record_tx(stats);
        }

        let health = monitor.health();
        assert_eq!(health.overall, HealthLevel::Critical);
        assert!(health.deadlocks_last_hour >= 11);
        assert!(!health.recommendations.is_empty());
    }

    #[test]
    fn test_health_healthy_when_quiet() {
        let monitor = PerformanceMonitor::new(MonitorConfig::default());
        monitor.record_tx(finished("ok", 0.1, true));
        assert_eq!(monitor.health().overall, HealthLevel::Healthy);
    }

    #[test]
    fn test_trends_bucket_by_hour() {
        let monitor = PerformanceMonitor::new(MonitorConfig::default());
        for i in 0..5 {
            monitor.record_tx(finished(&format!("t{}", i), 0.2, true));
        }
        let trends = monitor.trends(24);
        assert_eq!(trends.len(), 1);
        assert_eq!(trends[0].transactions, 5);
        assert!((trends[0].success_rate - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_history_is_bounded() {
        let monitor = PerformanceMonitor::new(MonitorConfig::default());
        for i in 0..(TX_HISTORY_CAPACITY + 50) {
            monitor.record_tx(finished(&format!("t{}", i), 0.01, true));
        }
        let state = monitor.state.lock();
        assert_eq!(state.tx_history.len(), TX_HISTORY_CAPACITY);
    }
}

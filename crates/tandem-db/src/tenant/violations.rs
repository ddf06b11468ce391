//! Access-violation journaling and monitoring.
//!
//! Every denial produces a journal row in `cross_tenant_access_logs`. A
//! background scan over the last ten minutes flags users accumulating
//! violations, and per-kind alert thresholds invoke registered callbacks.
//! In-memory counts start from zero on every restart.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use tandem_common::Result;

use crate::coordinator::Coordinator;
use crate::types::{Operation, Params, SqlValue};

/// Journal table for access violations.
pub const VIOLATIONS_TABLE: &str = "cross_tenant_access_logs";
/// Scan cadence of the background monitor.
const SCAN_INTERVAL: Duration = Duration::from_secs(60);
/// Scan window for suspicious-activity detection.
const SCAN_WINDOW_MINUTES: i64 = 10;
/// Violations per user inside the scan window that flag an attack.
const SUSPICIOUS_THRESHOLD: usize = 5;

/// Kinds of access violations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    CrossTenantAccess,
    PermissionDenied,
    DataBreachAttempt,
}

impl ViolationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ViolationKind::CrossTenantAccess => "cross_tenant_access",
            ViolationKind::PermissionDenied => "permission_denied",
            ViolationKind::DataBreachAttempt => "data_breach_attempt",
        }
    }

    /// Count at which an alert fires for this kind.
    fn alert_threshold(&self) -> u64 {
        match self {
            ViolationKind::CrossTenantAccess => 5,
            ViolationKind::PermissionDenied => 10,
            ViolationKind::DataBreachAttempt => 1,
        }
    }
}

/// Violation severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

/// A detected access violation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessViolation {
    pub user_id: String,
    pub attempted_tenant_id: String,
    pub actual_tenant_id: String,
    pub kind: ViolationKind,
    pub severity: Severity,
    pub blocked: bool,
    pub timestamp: DateTime<Utc>,
    pub details: serde_json::Value,
}

impl AccessViolation {
    pub fn new(
        user_id: impl Into<String>,
        attempted_tenant_id: impl Into<String>,
        actual_tenant_id: impl Into<String>,
        kind: ViolationKind,
        severity: Severity,
        details: serde_json::Value,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            attempted_tenant_id: attempted_tenant_id.into(),
            actual_tenant_id: actual_tenant_id.into(),
            kind,
            severity,
            blocked: true,
            timestamp: Utc::now(),
            details,
        }
    }
}

/// Aggregated violation summary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ViolationSummary {
    pub total_violations: usize,
    pub blocked_violations: usize,
    pub by_kind: HashMap<String, usize>,
    pub top_violators: HashMap<String, usize>,
}

type ViolationCallback = Arc<dyn Fn(&AccessViolation) + Send + Sync>;

/// Journals violations and watches for suspicious patterns.
pub struct ViolationMonitor {
    db: Arc<Coordinator>,
    /// Per user-and-kind counts; roll over to zero on restart.
    counts: Mutex<HashMap<(String, ViolationKind), u64>>,
    callbacks: Mutex<Vec<ViolationCallback>>,
    shutdown: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ViolationMonitor {
    pub fn new(db: Arc<Coordinator>) -> Arc<Self> {
        Arc::new(Self {
            db,
            counts: Mutex::new(HashMap::new()),
            callbacks: Mutex::new(Vec::new()),
            shutdown: CancellationToken::new(),
            worker: Mutex::new(None),
        })
    }

    pub fn add_alert_callback(&self, callback: impl Fn(&AccessViolation) + Send + Sync + 'static) {
        self.callbacks.lock().push(Arc::new(callback));
    }

    /// Journals a violation and evaluates the per-kind alert threshold.
    pub async fn log_violation(&self, violation: &AccessViolation) -> Result<()> {
        let op = Operation::insert(
            VIOLATIONS_TABLE,
            [
                ("id", SqlValue::Text(Uuid::new_v4().to_string())),
                ("user_id", SqlValue::Text(violation.user_id.clone())),
                (
                    "attempted_tenant_id",
                    SqlValue::Text(violation.attempted_tenant_id.clone()),
                ),
                (
                    "actual_tenant_id",
                    SqlValue::Text(violation.actual_tenant_id.clone()),
                ),
                (
                    "access_type",
                    SqlValue::Text(violation.kind.as_str().to_string()),
                ),
                (
                    "severity",
                    SqlValue::Text(violation.severity.as_str().to_string()),
                ),
                ("blocked", SqlValue::Bool(violation.blocked)),
                (
                    "timestamp",
                    SqlValue::Text(violation.timestamp.to_rfc3339()),
                ),
                ("details", SqlValue::Text(violation.details.to_string())),
            ],
        );

        let result = self.db.execute_transaction(vec![op], None).await?;
        if !result.success {
            error!(error = ?result.error, "failed to journal access violation");
            return Ok(());
        }

        warn!(
            user_id = %violation.user_id,
            kind = %violation.kind.as_str(),
            severity = %violation.severity.as_str(),
            "access violation journaled"
        );

        let count = {
            let mut counts = self.counts.lock();
            let entry = counts
                .entry((violation.user_id.clone(), violation.kind))
                .or_insert(0);
            *entry += 1;
            *entry
        };

        if count >= violation.kind.alert_threshold() {
            error!(
                user_id = %violation.user_id,
                kind = %violation.kind.as_str(),
                count,
                "violation alert threshold exceeded"
            );
            let callbacks = self.callbacks.lock().clone();
            for callback in &callbacks {
                callback(violation);
            }
        }
        Ok(())
    }

    /// Summary of journaled violations, optionally per tenant.
    pub async fn summary(&self, tenant_id: Option<&str>) -> Result<ViolationSummary> {
        let (query, params) = match tenant_id {
            Some(tenant) => (
                format!(
                    "SELECT * FROM {} WHERE attempted_tenant_id = :tenant OR actual_tenant_id = :tenant \
                     ORDER BY timestamp DESC",
                    VIOLATIONS_TABLE
                ),
                Params::named([("tenant", SqlValue::Text(tenant.to_string()))]),
            ),
            None => (
                format!("SELECT * FROM {} ORDER BY timestamp DESC", VIOLATIONS_TABLE),
                Params::None,
            ),
        };

        let result = self.db.execute_query(&query, &params, None).await?;
        if !result.success {
            return Ok(ViolationSummary::default());
        }

        let mut summary = ViolationSummary {
            total_violations: result.rows.len(),
            ..Default::default()
        };
        for row in &result.rows {
            if row.get_bool("blocked").unwrap_or(true) {
                summary.blocked_violations += 1;
            }
            let kind = row.get_str("access_type").unwrap_or("unknown").to_string();
            *summary.by_kind.entry(kind).or_insert(0) += 1;
            let user = row.get_str("user_id").unwrap_or("unknown").to_string();
            *summary.top_violators.entry(user).or_insert(0) += 1;
        }
        Ok(summary)
    }

    /// Starts the background scan over recent violations.
    pub fn start(self: &Arc<Self>) {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return;
        }
        let monitor = self.clone();
        let token = self.shutdown.child_token();
        *worker = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(SCAN_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => monitor.scan_recent().await,
                }
            }
        }));
        info!("access violation monitoring started");
    }

    pub async fn stop(&self) {
        self.shutdown.cancel();
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }
        info!("access violation monitoring stopped");
    }

    /// Flags users with a burst of violations inside the scan window.
    async fn scan_recent(&self) {
        let since = Utc::now() - chrono::Duration::minutes(SCAN_WINDOW_MINUTES);
        let query = format!(
            "SELECT user_id FROM {} WHERE timestamp >= :since",
            VIOLATIONS_TABLE
        );
        let params = Params::named([("since", SqlValue::Text(since.to_rfc3339()))]);

        let result = match self.db.execute_query(&query, &params, None).await {
            Ok(result) if result.success => result,
            _ => return,
        };

        let mut per_user: HashMap<String, usize> = HashMap::new();
        for row in &result.rows {
            let user = row.get_str("user_id").unwrap_or("unknown").to_string();
            *per_user.entry(user).or_insert(0) += 1;
        }

        for (user, count) in per_user {
            if count >= SUSPICIOUS_THRESHOLD {
                error!(
                    user_id = %user,
                    count,
                    window_minutes = SCAN_WINDOW_MINUTES,
                    "potential attack: repeated access violations"
                );
            }
        }
    }
}

impl std::fmt::Debug for ViolationMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ViolationMonitor")
            .field("tracked_users", &self.counts.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_violation_kind_thresholds() {
        assert_eq!(ViolationKind::CrossTenantAccess.alert_threshold(), 5);
        assert_eq!(ViolationKind::PermissionDenied.alert_threshold(), 10);
        assert_eq!(ViolationKind::DataBreachAttempt.alert_threshold(), 1);
    }

    #[test]
    fn test_violation_defaults_to_blocked() {
        let violation = AccessViolation::new(
            "user-1",
            "tenant-a",
            "tenant-b",
            ViolationKind::CrossTenantAccess,
            Severity::High,
            serde_json::json!({}),
        );
        assert!(violation.blocked);
        assert_eq!(violation.kind.as_str(), "cross_tenant_access");
        assert_eq!(violation.severity.as_str(), "high");
    }
}

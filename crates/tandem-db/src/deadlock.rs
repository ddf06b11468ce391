//! Wait-for-graph deadlock detection and resolution.
//!
//! Nodes are active transaction ids; an edge waiter→holder records that the
//! waiter is blocked on a lock the holder owns. Detection runs DFS cycle
//! enumeration, then re-verifies every edge of a candidate cycle so that a
//! lock released mid-detection does not produce a spurious report.
//!
//! Edges are never removed implicitly when a transaction terminates through
//! a non-deadlock path: callers must invoke [`DeadlockDetector::unregister`].
//! Victim notifications go out over a one-shot event channel, never while
//! the graph lock is held.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Bounded history sizes for detections and resolutions.
const HISTORY_CAPACITY: usize = 1000;
/// Transaction records older than this many hours are evicted by the
/// background loop.
const RECORD_RETENTION_HOURS: i64 = 1;

/// Victim-selection strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VictimStrategy {
    /// Newest start_time.
    AbortYoungest,
    /// Oldest start_time.
    AbortOldest,
    /// Lowest priority number.
    AbortLowestPriority,
    /// Fewest operations executed.
    AbortLeastWork,
    /// Uniform pick.
    AbortRandom,
}

/// Detector configuration.
#[derive(Debug, Clone)]
pub struct DetectorConfig {
    pub detection_interval: Duration,
    pub strategy: VictimStrategy,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            detection_interval: Duration::from_secs(1),
            strategy: VictimStrategy::AbortYoungest,
        }
    }
}

/// One edge of a reported cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaitLink {
    pub waiter: String,
    pub holder: String,
    pub resource_id: String,
    pub lock_kind: String,
    pub wait_secs: f64,
}

/// A verified deadlock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectedDeadlock {
    pub detection_time: DateTime<Utc>,
    /// Cycle members, without the duplicated closing node.
    pub transactions: Vec<String>,
    pub chain: Vec<WaitLink>,
    pub victim: Option<String>,
    pub strategy: Option<VictimStrategy>,
    pub confidence: f64,
}

/// Detector statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DetectorStats {
    pub detected: u64,
    pub resolved: u64,
    pub false_positives: u64,
    pub resolution_failures: u64,
    pub avg_detection_time: f64,
    pub avg_resolution_time: f64,
    pub active_transactions: usize,
    pub current_wait_edges: usize,
    pub recent_deadlocks: usize,
    pub success_rate: f64,
}

/// Snapshot of the wait-for graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphInfo {
    pub nodes: Vec<String>,
    pub edges: Vec<WaitLink>,
    pub total_nodes: usize,
    pub total_edges: usize,
}

#[derive(Debug, Clone)]
struct WaitEdge {
    resource_id: String,
    lock_kind: String,
    requested_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct TxRecord {
    start_time: DateTime<Utc>,
    priority: i32,
    work: u64,
}

#[derive(Default)]
struct GraphState {
    /// waiter -> holder -> edge metadata.
    edges: HashMap<String, HashMap<String, WaitEdge>>,
    transactions: HashMap<String, TxRecord>,
}

impl GraphState {
    fn remove_transaction(&mut self, tx_id: &str) {
        self.transactions.remove(tx_id);
        self.edges.remove(tx_id);
        for holders in self.edges.values_mut() {
            holders.remove(tx_id);
        }
    }

    fn edge_count(&self) -> usize {
        self.edges.values().map(|h| h.len()).sum()
    }
}

#[derive(Default)]
struct HistoryState {
    detections: VecDeque<DetectedDeadlock>,
    resolutions: VecDeque<DetectedDeadlock>,
    detected: u64,
    resolved: u64,
    false_positives: u64,
    resolution_failures: u64,
    avg_detection_time: f64,
    avg_resolution_time: f64,
}

/// Deadlock detection and resolution over a wait-for graph.
pub struct DeadlockDetector {
    config: DetectorConfig,
    graph: Mutex<GraphState>,
    history: Mutex<HistoryState>,
    victim_tx: Mutex<Option<mpsc::UnboundedSender<String>>>,
    shutdown: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl DeadlockDetector {
    pub fn new(config: DetectorConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            graph: Mutex::new(GraphState::default()),
            history: Mutex::new(HistoryState::default()),
            victim_tx: Mutex::new(None),
            shutdown: CancellationToken::new(),
            worker: Mutex::new(None),
        })
    }

    pub fn strategy(&self) -> VictimStrategy {
        self.config.strategy
    }

    /// Subscribes to victim notifications. The returned channel receives the
    /// tx id of every aborted victim.
    pub fn victim_events(&self) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.victim_tx.lock() = Some(tx);
        rx
    }

    /// Registers a transaction for monitoring.
    pub fn register(&self, tx_id: impl Into<String>, priority: i32) {
        let tx_id = tx_id.into();
        self.graph.lock().transactions.insert(
            tx_id,
            TxRecord {
                start_time: Utc::now(),
                priority,
                work: 0,
            },
        );
    }

    /// Removes a transaction and all of its incident edges.
    pub fn unregister(&self, tx_id: &str) {
        self.graph.lock().remove_transaction(tx_id);
    }

    /// Advances the work counter used by `abort_least_work`.
    pub fn record_work(&self, tx_id: &str, operations: u64) {
        if let Some(record) = self.graph.lock().transactions.get_mut(tx_id) {
            record.work += operations;
        }
    }

    /// Adds a waiter→holder edge tagged with the contested resource.
    pub fn add_wait(
        &self,
        waiter: impl Into<String>,
        holder: impl Into<String>,
        resource_id: impl Into<String>,
        lock_kind: impl Into<String>,
    ) {
        let mut graph = self.graph.lock();
        graph.edges.entry(waiter.into()).or_default().insert(
            holder.into(),
            WaitEdge {
                resource_id: resource_id.into(),
                lock_kind: lock_kind.into(),
                requested_at: Utc::now(),
            },
        );
    }

    /// Removes one waiter→holder edge.
    pub fn remove_wait(&self, waiter: &str, holder: &str) {
        let mut graph = self.graph.lock();
        if let Some(holders) = graph.edges.get_mut(waiter) {
            holders.remove(holder);
        }
    }

    /// Runs one detection pass: DFS cycle enumeration, then per-cycle edge
    /// re-verification. Only verified cycles are reported.
    pub fn detect(&self) -> Vec<DetectedDeadlock> {
        let started = Instant::now();
        let mut verified = Vec::new();

        {
            let graph = self.graph.lock();
            let cycles = Self::find_cycles(&graph.edges);

            for cycle in cycles {
                if cycle.len() < 2 {
                    continue;
                }
                if !Self::verify_cycle(&graph, &cycle) {
                    self.history.lock().false_positives += 1;
                    continue;
                }
                let chain = Self::build_chain(&graph, &cycle);
                let confidence = Self::confidence(&cycle, &chain);
                verified.push(DetectedDeadlock {
                    detection_time: Utc::now(),
                    transactions: cycle,
                    chain,
                    victim: None,
                    strategy: None,
                    confidence,
                });
            }
        }

        let detection_secs = started.elapsed().as_secs_f64();
        let mut history = self.history.lock();
        for deadlock in &verified {
            history.detected += 1;
            history.detections.push_back(deadlock.clone());
            while history.detections.len() > HISTORY_CAPACITY {
                history.detections.pop_front();
            }
            debug!(
                transactions = ?deadlock.transactions,
                confidence = deadlock.confidence,
                "deadlock detected"
            );
        }
        let total = history.detected.max(1);
        history.avg_detection_time =
            (history.avg_detection_time * (total - 1) as f64 + detection_secs) / total as f64;

        verified
    }

    /// Resolves one deadlock by aborting a victim chosen by the configured
    /// strategy. The victim is removed from the graph and announced on the
    /// event channel. Returns false when no victim could be selected.
    pub fn resolve(&self, deadlock: &mut DetectedDeadlock) -> bool {
        let started = Instant::now();

        let victim = self.select_victim(&deadlock.transactions);
        let victim = match victim {
            Some(v) => v,
            None => {
                error!("could not select a deadlock victim");
                self.history.lock().resolution_failures += 1;
                return false;
            }
        };

        deadlock.victim = Some(victim.clone());
        deadlock.strategy = Some(self.config.strategy);

        self.graph.lock().remove_transaction(&victim);

        // Announce outside the graph lock.
        if let Some(sender) = self.victim_tx.lock().as_ref() {
            let _ = sender.send(victim.clone());
        }

        let resolution_secs = started.elapsed().as_secs_f64();
        let mut history = self.history.lock();
        history.resolved += 1;
        history.resolutions.push_back(deadlock.clone());
        while history.resolutions.len() > HISTORY_CAPACITY {
            history.resolutions.pop_front();
        }
        let total = history.resolved.max(1);
        history.avg_resolution_time =
            (history.avg_resolution_time * (total - 1) as f64 + resolution_secs) / total as f64;

        info!(victim = %victim, strategy = ?self.config.strategy, "deadlock resolved");
        true
    }

    pub fn stats(&self) -> DetectorStats {
        let graph = self.graph.lock();
        let history = self.history.lock();
        let hour_ago = Utc::now() - chrono::Duration::hours(1);
        DetectorStats {
            detected: history.detected,
            resolved: history.resolved,
            false_positives: history.false_positives,
            resolution_failures: history.resolution_failures,
            avg_detection_time: history.avg_detection_time,
            avg_resolution_time: history.avg_resolution_time,
            active_transactions: graph.transactions.len(),
            current_wait_edges: graph.edge_count(),
            recent_deadlocks: history
                .detections
                .iter()
                .filter(|d| d.detection_time > hour_ago)
                .count(),
            success_rate: history.resolved as f64 / history.detected.max(1) as f64,
        }
    }

    pub fn graph_info(&self) -> GraphInfo {
        let graph = self.graph.lock();
        let now = Utc::now();
        let mut nodes: HashSet<String> = graph.transactions.keys().cloned().collect();
        let mut edges = Vec::new();
        for (waiter, holders) in &graph.edges {
            nodes.insert(waiter.clone());
            for (holder, edge) in holders {
                nodes.insert(holder.clone());
                edges.push(WaitLink {
                    waiter: waiter.clone(),
                    holder: holder.clone(),
                    resource_id: edge.resource_id.clone(),
                    lock_kind: edge.lock_kind.clone(),
                    wait_secs: (now - edge.requested_at).num_milliseconds() as f64 / 1000.0,
                });
            }
        }
        let mut nodes: Vec<String> = nodes.into_iter().collect();
        nodes.sort();
        GraphInfo {
            total_nodes: nodes.len(),
            total_edges: edges.len(),
            nodes,
            edges,
        }
    }

    /// Starts the background loop: detect, resolve, evict stale records.
    pub fn start(self: &Arc<Self>) {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return;
        }
        let detector = self.clone();
        let token = self.shutdown.child_token();
        *worker = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(detector.config.detection_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        let mut deadlocks = detector.detect();
                        for deadlock in deadlocks.iter_mut() {
                            detector.resolve(deadlock);
                        }
                        detector.evict_stale_records();
                    }
                }
            }
        }));
        info!("deadlock detection started");
    }

    /// Stops the background loop.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }
        info!("deadlock detection stopped");
    }

    // ---- internal -------------------------------------------------------

    fn find_cycles(edges: &HashMap<String, HashMap<String, WaitEdge>>) -> Vec<Vec<String>> {
        fn dfs(
            node: &str,
            edges: &HashMap<String, HashMap<String, WaitEdge>>,
            visited: &mut HashSet<String>,
            rec_stack: &mut HashSet<String>,
            path: &mut Vec<String>,
            cycles: &mut Vec<Vec<String>>,
        ) -> bool {
            if rec_stack.contains(node) {
                if let Some(start) = path.iter().position(|n| n == node) {
                    cycles.push(path[start..].to_vec());
                }
                return true;
            }
            if visited.contains(node) {
                return false;
            }

            visited.insert(node.to_string());
            rec_stack.insert(node.to_string());
            path.push(node.to_string());

            if let Some(holders) = edges.get(node) {
                for holder in holders.keys() {
                    if dfs(holder, edges, visited, rec_stack, path, cycles) {
                        return true;
                    }
                }
            }

            rec_stack.remove(node);
            path.pop();
            false
        }

        let mut nodes: Vec<&String> = edges.keys().collect();
        nodes.sort();

        let mut cycles = Vec::new();
        let mut visited = HashSet::new();
        for node in nodes {
            if !visited.contains(node.as_str()) {
                let mut rec_stack = HashSet::new();
                let mut path = Vec::new();
                dfs(
                    node,
                    edges,
                    &mut visited,
                    &mut rec_stack,
                    &mut path,
                    &mut cycles,
                );
            }
        }
        cycles
    }

    /// A candidate cycle is real only if every member is still registered
    /// and every edge still exists.
    fn verify_cycle(graph: &GraphState, cycle: &[String]) -> bool {
        for tx_id in cycle {
            if !graph.transactions.contains_key(tx_id) {
                return false;
            }
        }
        for i in 0..cycle.len() {
            let waiter = &cycle[i];
            let holder = &cycle[(i + 1) % cycle.len()];
            let present = graph
                .edges
                .get(waiter)
                .map(|h| h.contains_key(holder))
                .unwrap_or(false);
            if !present {
                return false;
            }
        }
        true
    }

    fn build_chain(graph: &GraphState, cycle: &[String]) -> Vec<WaitLink> {
        let now = Utc::now();
        let mut chain = Vec::with_capacity(cycle.len());
        for i in 0..cycle.len() {
            let waiter = &cycle[i];
            let holder = &cycle[(i + 1) % cycle.len()];
            if let Some(edge) = graph.edges.get(waiter).and_then(|h| h.get(holder)) {
                chain.push(WaitLink {
                    waiter: waiter.clone(),
                    holder: holder.clone(),
                    resource_id: edge.resource_id.clone(),
                    lock_kind: edge.lock_kind.clone(),
                    wait_secs: (now - edge.requested_at).num_milliseconds() as f64 / 1000.0,
                });
            }
        }
        chain
    }

    fn confidence(cycle: &[String], chain: &[WaitLink]) -> f64 {
        let mut score: f64 = 0.8;
        if cycle.len() > 3 {
            score += 0.1;
        }
        if !chain.is_empty() {
            let avg_wait: f64 = chain.iter().map(|l| l.wait_secs).sum::<f64>() / chain.len() as f64;
            if avg_wait > 10.0 {
                score += 0.1;
            }
        }
        score.min(1.0)
    }

    fn select_victim(&self, transactions: &[String]) -> Option<String> {
        if transactions.is_empty() {
            return None;
        }
        let graph = self.graph.lock();

        let known: Vec<(&String, &TxRecord)> = transactions
            .iter()
            .filter_map(|id| graph.transactions.get(id).map(|r| (id, r)))
            .collect();
        if known.is_empty() {
            return None;
        }

        match self.config.strategy {
            VictimStrategy::AbortYoungest => known
                .iter()
                .max_by_key(|(_, r)| r.start_time)
                .map(|(id, _)| (*id).clone()),
            VictimStrategy::AbortOldest => known
                .iter()
                .min_by_key(|(_, r)| r.start_time)
                .map(|(id, _)| (*id).clone()),
            VictimStrategy::AbortLowestPriority => known
                .iter()
                .min_by_key(|(_, r)| r.priority)
                .map(|(id, _)| (*id).clone()),
            VictimStrategy::AbortLeastWork => known
                .iter()
                .min_by_key(|(_, r)| r.work)
                .map(|(id, _)| (*id).clone()),
            VictimStrategy::AbortRandom => {
                let ids: Vec<&String> = known.iter().map(|(id, _)| *id).collect();
                ids.choose(&mut rand::thread_rng()).map(|id| (*id).clone())
            }
        }
    }

    fn evict_stale_records(&self) {
        let cutoff = Utc::now() - chrono::Duration::hours(RECORD_RETENTION_HOURS);
        let stale: Vec<String> = {
            let graph = self.graph.lock();
            graph
                .transactions
                .iter()
                .filter(|(_, r)| r.start_time < cutoff)
                .map(|(id, _)| id.clone())
                .collect()
        };
        for tx_id in stale {
            self.unregister(&tx_id);
        }
    }
}

impl std::fmt::Debug for DeadlockDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let graph = self.graph.lock();
        f.debug_struct("DeadlockDetector")
            .field("transactions", &graph.transactions.len())
            .field("edges", &graph.edge_count())
            .field("strategy", &self.config.strategy)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector(strategy: VictimStrategy) -> Arc<DeadlockDetector> {
        DeadlockDetector::new(DetectorConfig {
            detection_interval: Duration::from_millis(10),
            strategy,
        })
    }

    #[test]
    fn test_two_transaction_cycle_detected() {
        let d = detector(VictimStrategy::AbortYoungest);
        d.register("t1", 0);
        d.register("t2", 0);
        d.add_wait("t1", "t2", "r1", "exclusive");
        d.add_wait("t2", "t1", "r2", "exclusive");

        let deadlocks = d.detect();
        assert_eq!(deadlocks.len(), 1);
        let mut members = deadlocks[0].transactions.clone();
        members.sort();
        assert_eq!(members, vec!["t1", "t2"]);
        assert!(deadlocks[0].confidence >= 0.8);
        assert_eq!(deadlocks[0].chain.len(), 2);
    }

    #[test]
    fn test_no_cycle_no_deadlock() {
        let d = detector(VictimStrategy::AbortYoungest);
        d.register("t1", 0);
        d.register("t2", 0);
        d.add_wait("t1", "t2", "r1", "shared");

        assert!(d.detect().is_empty());
    }

    #[test]
    fn test_unverified_cycle_counts_false_positive() {
        let d = detector(VictimStrategy::AbortYoungest);
        // Edges without registered transactions fail verification.
        d.add_wait("t1", "t2", "r1", "exclusive");
        d.add_wait("t2", "t1", "r2", "exclusive");

        assert!(d.detect().is_empty());
        assert_eq!(d.stats().false_positives, 1);
    }

    #[test]
    fn test_resolve_abort_youngest() {
        let d = detector(VictimStrategy::AbortYoungest);
        d.register("older", 0);
        std::thread::sleep(Duration::from_millis(5));
        d.register("younger", 0);
        d.add_wait("older", "younger", "r1", "exclusive");
        d.add_wait("younger", "older", "r2", "exclusive");

        let mut deadlocks = d.detect();
        assert_eq!(deadlocks.len(), 1);
        assert!(d.resolve(&mut deadlocks[0]));
        assert_eq!(deadlocks[0].victim.as_deref(), Some("younger"));
        // The victim is a member of the reported cycle.
        assert!(deadlocks[0]
            .transactions
            .contains(deadlocks[0].victim.as_ref().unwrap()));

        let stats = d.stats();
        assert_eq!(stats.detected, 1);
        assert_eq!(stats.resolved, 1);
        assert!((stats.success_rate - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_resolve_abort_oldest() {
        let d = detector(VictimStrategy::AbortOldest);
        d.register("older", 0);
        std::thread::sleep(Duration::from_millis(5));
        d.register("younger", 0);
        d.add_wait("older", "younger", "r1", "exclusive");
        d.add_wait("younger", "older", "r2", "exclusive");

        let mut deadlocks = d.detect();
        assert!(d.resolve(&mut deadlocks[0]));
        assert_eq!(deadlocks[0].victim.as_deref(), Some("older"));
    }

    #[test]
    fn test_resolve_abort_lowest_priority() {
        let d = detector(VictimStrategy::AbortLowestPriority);
        d.register("high", 10);
        d.register("low", 1);
        d.add_wait("high", "low", "r1", "exclusive");
        d.add_wait("low", "high", "r2", "exclusive");

        let mut deadlocks = d.detect();
        assert!(d.resolve(&mut deadlocks[0]));
        assert_eq!(deadlocks[0].victim.as_deref(), Some("low"));
    }

    #[test]
    fn test_resolve_abort_least_work() {
        let d = detector(VictimStrategy::AbortLeastWork);
        d.register("busy", 0);
        d.register("idle", 0);
        d.record_work("busy", 25);
        d.record_work("idle", 2);
        d.add_wait("busy", "idle", "r1", "exclusive");
        d.add_wait("idle", "busy", "r2", "exclusive");

        let mut deadlocks = d.detect();
        assert!(d.resolve(&mut deadlocks[0]));
        assert_eq!(deadlocks[0].victim.as_deref(), Some("idle"));
    }

    #[test]
    fn test_resolve_abort_random_picks_member() {
        let d = detector(VictimStrategy::AbortRandom);
        d.register("t1", 0);
        d.register("t2", 0);
        d.add_wait("t1", "t2", "r1", "exclusive");
        d.add_wait("t2", "t1", "r2", "exclusive");

        let mut deadlocks = d.detect();
        assert!(d.resolve(&mut deadlocks[0]));
        let victim = deadlocks[0].victim.clone().unwrap();
        assert!(victim == "t1" || victim == "t2");
    }

    #[test]
    fn test_resolution_removes_victim_edges() {
        let d = detector(VictimStrategy::AbortYoungest);
        d.register("t1", 0);
        d.register("t2", 0);
        d.add_wait("t1", "t2", "r1", "exclusive");
        d.add_wait("t2", "t1", "r2", "exclusive");

        let mut deadlocks = d.detect();
        d.resolve(&mut deadlocks[0]);

        // The cycle is broken: nothing further to detect.
        assert!(d.detect().is_empty());
        assert_eq!(d.stats().active_transactions, 1);
    }

    #[test]
    fn test_unregister_removes_incident_edges() {
        let d = detector(VictimStrategy::AbortYoungest);
        d.register("t1", 0);
        d.register("t2", 0);
        d.register("t3", 0);
        d.add_wait("t1", "t2", "r1", "exclusive");
        d.add_wait("t3", "t1", "r2", "exclusive");

        d.unregister("t1");
        let info = d.graph_info();
        assert_eq!(info.total_edges, 0);
    }

    #[test]
    fn test_edges_persist_without_explicit_removal() {
        // Lazy cleanup: edges survive until remove_wait or unregister.
        let d = detector(VictimStrategy::AbortYoungest);
        d.register("t1", 0);
        d.register("t2", 0);
        d.add_wait("t1", "t2", "r1", "shared");

        assert_eq!(d.graph_info().total_edges, 1);
        d.remove_wait("t1", "t2");
        assert_eq!(d.graph_info().total_edges, 0);
    }

    #[tokio::test]
    async fn test_victim_events_channel() {
        let d = detector(VictimStrategy::AbortYoungest);
        let mut events = d.victim_events();
        d.register("t1", 0);
        d.register("t2", 0);
        d.add_wait("t1", "t2", "r1", "exclusive");
        d.add_wait("t2", "t1", "r2", "exclusive");

        let mut deadlocks = d.detect();
        d.resolve(&mut deadlocks[0]);

        let victim = events.recv().await.unwrap();
        assert!(victim == "t1" || victim == "t2");
    }

    #[tokio::test]
    async fn test_background_loop_resolves() {
        let d = detector(VictimStrategy::AbortYoungest);
        d.start();
        d.register("t1", 0);
        d.register("t2", 0);
        d.add_wait("t1", "t2", "r1", "exclusive");
        d.add_wait("t2", "t1", "r2", "exclusive");

        tokio::time::sleep(Duration::from_millis(100)).await;
        d.stop().await;

        let stats = d.stats();
        assert!(stats.detected >= 1);
        assert!(stats.resolved >= 1);
    }
}

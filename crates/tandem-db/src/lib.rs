//! Dual-backend database access kernel.
//!
//! tandem-db provides a single access layer over a primary PostgreSQL
//! backend and a local SQLite backend with automatic failover between them.
//! The kernel owns five tightly coupled subsystems:
//!
//! - **Connection pool** with health monitoring, auto-scaling and
//!   per-connection performance scoring ([`pool`])
//! - **Transaction coordination** with savepoints, nested contexts, retry
//!   on transient faults and lifecycle callbacks ([`transaction`])
//! - **Deadlock detection** over a wait-for graph with configurable victim
//!   selection ([`deadlock`])
//! - **Performance monitoring** with percentile summaries, alerts and
//!   optimization suggestions ([`monitor`])
//! - **Schema migrations** with checksum integrity, journaling and rollback
//!   ([`migration`])
//! - **Multi-tenant access control** with query rewriting, database-level
//!   constraints and violation journaling ([`tenant`])
//!
//! # Architecture
//!
//! ```text
//! Caller
//!   |
//! Coordinator (failover decision, tenant scoping)
//!   |
//! ConnectionPool ---- TransactionCoordinator --- DeadlockDetector
//!   |                        |
//! BackendAdapter         PerformanceMonitor
//!   |
//! sqlx (PostgreSQL / SQLite)
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use tandem_db::{BackendConfig, Coordinator, CoordinatorConfig, Operation};
//!
//! # async fn example() -> tandem_common::Result<()> {
//! let config = CoordinatorConfig {
//!     primary: Some(BackendConfig::primary_url("postgresql://localhost/app")),
//!     local: Some(BackendConfig::local_path("data/app.db")),
//!     ..Default::default()
//! };
//! let db = Coordinator::new(config).await?;
//!
//! let op = Operation::insert("audit_logs", [("action", "login".into())]);
//! db.execute_transaction(vec![op], None).await?;
//! db.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! # Thread safety
//!
//! Every public type is `Send + Sync`; a single [`Coordinator`] per process
//! is the intended composition root. Background workers (pool maintenance,
//! transaction sweeper, violation scans, monitor loop) run on the tokio
//! runtime and shut down when their owner is closed.

/// Shared data model: backend kinds, connections, operations, results.
pub mod types;

/// Backend configuration with per-kind validation.
pub mod config;

/// Backend adapter trait and the PostgreSQL / SQLite implementations.
pub mod adapter;

/// Connection pool with lifecycle management, health checks and auto-scaling.
pub mod pool;

/// Caller-facing coordinator: routing, failover, JSON record helpers.
pub mod coordinator;

/// Transaction coordination: savepoints, nesting, retry, timeouts.
pub mod transaction;

/// Wait-for-graph deadlock detection and resolution.
pub mod deadlock;

/// Transaction performance monitoring, alerting and suggestions.
pub mod monitor;

/// Schema migration engine with checksum integrity and journaling.
pub mod migration;

/// Multi-tenant access control: scoping, constraints, violations.
pub mod tenant;

pub use adapter::{postgres::PostgresAdapter, sqlite::SqliteAdapter, BackendAdapter};
pub use config::BackendConfig;
pub use coordinator::{Coordinator, CoordinatorConfig};
pub use deadlock::{DeadlockDetector, DetectorConfig, VictimStrategy};
pub use migration::{Migration, MigrationRecord, MigrationRunner, MigrationStatus};
pub use monitor::{PerformanceMonitor, PerformanceThresholds, TxStats};
pub use pool::{ConnectionLease, ConnectionPool, PoolConfig, PoolStatistics};
pub use tenant::{AccessViolation, TenantAccessController, TenantInfo, ViolationKind};
pub use transaction::{
    IsolationLevel, TransactionCoordinator, TransactionState, TxHandle, TxOptions,
};
pub use types::{
    BackendKind, ConnectionHandle, ConnectionStatus, HealthMetrics, Operation, OperationKind,
    Params, QueryResult, Row, SqlValue, TransactionResult,
};

pub use tandem_common::{Result, TandemError};

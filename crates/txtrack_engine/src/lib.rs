//! # txtrack Engine
//!
//! Keeps a search index consistent with a transactional content repository.
//!
//! This crate provides:
//! - The metadata [`Tracker`] and its synchronization cycle
//! - Commit-time windowed transaction fetching with bounded history
//! - A consistency audit of the index against the repository
//! - Shard routing of node mutations
//! - On-demand purge, reindex and index maintenance
//! - Durable cursor storage
//! - In-memory repository and index implementations
//!
//! ## Architecture
//!
//! A cycle runs in fixed order:
//! 1. Reload state if the index was rolled back or the state invalidated
//! 2. Audit the index on the first cycle
//! 3. Drain the maintenance queue
//! 4. Walk new transactions in `(commit_time, id)` order, applying their
//!    nodes on the worker pool, then their markers
//!
//! ## Key Invariants
//!
//! - The cursor never moves past a transaction whose nodes are not all
//!   applied
//! - Markers are written only while holding the index write lock
//! - A purge request beats a reindex or index request for the same target
//! - Re-applying any transaction is idempotent

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod applier;
mod auditor;
mod client;
mod config;
mod coordination;
mod error;
mod fetcher;
mod history;
mod maintenance;
mod memory;
mod pool;
mod report;
mod router;
mod service;
mod state;
mod store;
mod tracker;

pub use applier::{BatchApplier, FlushOutcome};
pub use auditor::{AuditReport, ConsistencyAuditor, FirstTxCheck, LastTxCheck};
pub use client::{Capabilities, IndexServer, RepositoryClient};
pub use config::{ShardConfig, ShardMethod, TrackerConfig};
pub use coordination::{IndexWriteLock, RollbackFlag};
pub use error::{
    ConfigError, ConsistencyError, IndexError, IndexResult, RepositoryError, RepositoryResult,
    StoreError, StoreResult, TrackError, TrackResult,
};
pub use fetcher::WindowFetcher;
pub use history::BoundedHistory;
pub use maintenance::{
    MaintenanceAction, MaintenanceContext, MaintenanceHandle, MaintenanceQueue,
    MaintenanceReport, MaintenanceRequest, MaintenanceTarget,
};
pub use memory::{IndexSnapshot, MemoryIndex, MemoryRepository};
pub use pool::WorkerPool;
pub use report::{CheckIndexBounds, DbTxLookup, IndexHealthReport, NodeReport};
pub use router::ShardRouter;
pub use service::{ServiceExit, TrackerService};
pub use state::TrackerState;
pub use store::{FileStateStore, MemoryStateStore, StateStore};
pub use tracker::{Clock, CycleReport, Tracker, TrackerStats};

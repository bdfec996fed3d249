//! Error types for the tracking engine.

use thiserror::Error;

/// Result type for tracking operations.
pub type TrackResult<T> = Result<T, TrackError>;

/// Result type for repository client calls.
pub type RepositoryResult<T> = Result<T, RepositoryError>;

/// Result type for index server calls.
pub type IndexResult<T> = Result<T, IndexError>;

/// Result type for state store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors reported by a repository client.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RepositoryError {
    /// The repository does not offer the requested capability.
    #[error("repository does not support {0}")]
    Unsupported(&'static str),

    /// The repository could not be reached or failed the request.
    #[error("repository unavailable: {message}")]
    Unavailable {
        /// Error message.
        message: String,
    },

    /// The repository rejected the credentials.
    #[error("repository authentication failed: {0}")]
    AuthenticationFailed(String),
}

impl RepositoryError {
    /// Creates an unavailable error.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }
}

/// Errors reported by the index server.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IndexError {
    /// The index does not offer the requested operation.
    #[error("index does not support {0}")]
    Unsupported(&'static str),

    /// The index could not be reached or failed the request.
    #[error("index unavailable: {message}")]
    Unavailable {
        /// Error message.
        message: String,
    },

    /// The index refused a document.
    #[error("index rejected node {node_id}: {reason}")]
    Rejected {
        /// Node that was refused.
        node_id: u64,
        /// Reason given by the index.
        reason: String,
    },
}

impl IndexError {
    /// Creates an unavailable error.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }
}

/// Errors from the durable cursor store.
#[derive(Error, Debug)]
pub enum StoreError {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The stored record could not be decoded.
    #[error("cursor record error: {0}")]
    Record(#[from] txtrack_protocol::ProtocolError),

    /// Another process holds the state file.
    #[error("state file locked: {path}")]
    Locked {
        /// Path of the lock file.
        path: String,
    },
}

/// Structural mismatch between repository and index.
///
/// These cannot be fixed by retrying; the index has to be rebuilt or the
/// connection details corrected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConsistencyError {
    /// The repository's first transaction is not in the index.
    #[error(
        "first transaction {tx_id} not found in index with commit time {commit_time_ms}; \
         the index does not match the repository and must be rebuilt"
    )]
    FirstTransactionMissing {
        /// Repository id of the first transaction.
        tx_id: u64,
        /// Its commit time.
        commit_time_ms: u64,
    },

    /// The index holds a transaction newer than anything in the repository.
    #[error(
        "index is ahead of repository: max tx in index {index_tx_id}@{index_commit_time_ms}, \
         in repository {repo_tx_id}@{repo_commit_time_ms}; the index must be rebuilt"
    )]
    IndexAheadOfRepository {
        /// Max transaction id in the index.
        index_tx_id: u64,
        /// Max commit time in the index.
        index_commit_time_ms: u64,
        /// Max transaction id in the repository.
        repo_tx_id: u64,
        /// Max commit time in the repository.
        repo_commit_time_ms: u64,
    },
}

/// Invalid tracker configuration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A property could not be parsed.
    #[error("invalid value {value:?} for {key}")]
    InvalidValue {
        /// Property key.
        key: String,
        /// Offending value.
        value: String,
    },

    /// A setting is out of range.
    #[error("{0}")]
    OutOfRange(String),
}

/// Errors that can occur during a tracking cycle.
#[derive(Error, Debug)]
pub enum TrackError {
    /// Repository failure.
    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),

    /// Index failure.
    #[error("index error: {0}")]
    Index(#[from] IndexError),

    /// Cursor store failure.
    #[error("state store error: {0}")]
    Store(#[from] StoreError),

    /// Repository and index do not match.
    #[error("consistency check failed: {0}")]
    Consistency(#[from] ConsistencyError),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// One or more node sub-batches failed to apply.
    #[error("{failed} node batch(es) failed to apply: {message}")]
    WorkerFailure {
        /// Number of failed sub-batches.
        failed: usize,
        /// First failure message.
        message: String,
    },

    /// The commit component requested a rollback.
    #[error("index rollback requested")]
    RolledBack,

    /// The cycle was cancelled.
    #[error("tracking cancelled")]
    Cancelled,

    /// Another cycle is still running on this tracker.
    #[error("a tracking cycle is already in progress")]
    CycleInProgress,

    /// The tracker stopped after an unrecoverable consistency failure.
    #[error("tracker halted: {reason}")]
    Halted {
        /// The failure that halted the tracker.
        reason: String,
    },
}

impl TrackError {
    /// Returns true if the next scheduled cycle may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            TrackError::Repository(e) => !matches!(e, RepositoryError::AuthenticationFailed(_)),
            TrackError::Index(_)
            | TrackError::Store(_)
            | TrackError::WorkerFailure { .. }
            | TrackError::RolledBack
            | TrackError::CycleInProgress => true,
            TrackError::Consistency(_)
            | TrackError::Config(_)
            | TrackError::Cancelled
            | TrackError::Halted { .. } => false,
        }
    }

    /// Returns true if an operator has to intervene.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TrackError::Consistency(_) | TrackError::Halted { .. } | TrackError::Config(_)
        )
    }
}

//! Error types for leader election

use std::io;
use std::time::Duration;

/// Errors that can occur while electing and tracking namespace leaders
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    /// A configuration value is out of range
    #[error("Invalid configuration value for '{key}': {message}")]
    InvalidConfig { key: String, message: String },

    /// A namespace cannot be mapped to a lock file under the root directory
    #[error("Invalid namespace '{namespace}': {message}")]
    InvalidNamespace { namespace: String, message: String },

    /// A leader record violates the on-disk layout
    #[error("Invalid leader info: {message}")]
    InvalidLeaderInfo { message: String },

    /// Failed to create the root directory or open the lock file
    #[error("Failed to create lock file: {0}")]
    LockFileCreation(#[source] io::Error),

    /// The lock attempt failed for a reason other than contention
    #[error("Failed to acquire lock: {0}")]
    LockAcquisition(#[source] io::Error),

    /// Every bounded attempt of a task failed
    #[error("Task '{task}' failed after {attempts} attempt(s): {source}")]
    BoundedTask {
        task: String,
        attempts: u32,
        #[source]
        source: AttemptFailure,
    },

    /// A view was started before its service built the executor pools
    #[error("Cluster service is not started")]
    ServiceNotStarted,

    /// Failed to build an executor pool
    #[error("Failed to build executor pool: {0}")]
    Runtime(#[source] io::Error),

    /// Failed to extract configuration
    #[error("Failed to load configuration: {0}")]
    Config(#[from] figment::Error),

    /// Other I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ClusterError {
    pub(crate) fn invalid_config(key: &str, message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            key: key.to_string(),
            message: message.into(),
        }
    }

    pub(crate) fn invalid_leader_info(message: impl Into<String>) -> Self {
        Self::InvalidLeaderInfo {
            message: message.into(),
        }
    }
}

/// Why a single bounded attempt did not produce a result
#[derive(Debug, thiserror::Error)]
pub enum AttemptFailure {
    /// The attempt did not finish within the per-attempt timeout
    #[error("timed out after {0:?}")]
    TimedOut(Duration),

    /// The task returned an error
    #[error("{0}")]
    Failed(#[source] io::Error),

    /// The worker running the task panicked or was cancelled
    #[error("worker aborted: {0}")]
    Aborted(String),
}

/// Result type for cluster operations
pub type Result<T> = std::result::Result<T, ClusterError>;

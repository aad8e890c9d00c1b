//! Error types for tomopar.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using tomopar's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for tomopar operations.
#[derive(Error, Debug)]
pub enum Error {
    /// The OS could not provide the requested shared memory.
    #[error("shared memory allocation of {bytes} bytes for {name} failed: {reason}")]
    AllocationFailed {
        /// Segment name.
        name: String,
        /// Requested size in bytes.
        bytes: usize,
        /// Underlying cause.
        reason: String,
    },

    /// A segment with this name already exists in the namespace.
    #[error("shared memory segment {0} already exists")]
    SegmentExists(String),

    /// The segment is not recorded as owned by this process.
    #[error("shared memory segment {0} is not owned by this process")]
    SegmentNotOwned(String),

    /// A segment exists but does not match what the caller expects.
    #[error("invalid shared memory segment: {0}")]
    InvalidSegment(String),

    /// Typed access with the wrong element type.
    #[error("element type mismatch: array holds {actual}, requested {requested}")]
    DTypeMismatch {
        /// Element type of the array.
        actual: &'static str,
        /// Element type the caller asked for.
        requested: &'static str,
    },

    /// A loaded or processed item has an unexpected shape.
    #[error("{} has shape {actual:?}, expected {expected:?}; all images must have the same dimensions", path.display())]
    DimensionMismatch {
        /// The offending file.
        path: PathBuf,
        /// Expected shape.
        expected: Vec<usize>,
        /// Actual shape.
        actual: Vec<usize>,
    },

    /// An individual item could not be read.
    #[error("could not load {}: {reason}", path.display())]
    Load {
        /// The offending file.
        path: PathBuf,
        /// Underlying cause.
        reason: String,
    },

    /// A task raised an error while processing one index.
    #[error("task failed at index {index}: {message}")]
    WorkerTask {
        /// Leading-axis index being processed.
        index: usize,
        /// Error reported by the task.
        message: String,
    },

    /// A worker process died or its pipe broke.
    #[error("worker {worker} crashed: {reason}")]
    WorkerCrashed {
        /// Worker slot index within the pool.
        worker: usize,
        /// Underlying cause.
        reason: String,
    },

    /// The worker executable could not be launched.
    #[error("failed to spawn worker: {0}")]
    WorkerSpawn(String),

    /// The pool has not been started.
    #[error("worker pool is not running")]
    PoolNotRunning,

    /// The pool was stopped and cannot be restarted.
    #[error("worker pool has been stopped")]
    PoolStopped,

    /// Malformed message on the worker control channel.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Invalid configuration value.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// System call error (via rustix).
    #[error("system error: {0}")]
    System(#[from] rustix::io::Errno),
}

impl Error {
    /// True for errors caused by bad input data rather than an unreadable file.
    pub fn is_data_error(&self) -> bool {
        matches!(self, Self::DimensionMismatch { .. })
    }
}

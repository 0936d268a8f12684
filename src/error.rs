//! Error types for procfan.

use thiserror::Error;

/// Main error type for procfan.
#[derive(Error, Debug)]
pub enum ProcfanError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("System call failed: {0}")]
    Sys(#[from] nix::errno::Errno),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to spawn worker {worker_id}: {source}")]
    Spawn {
        worker_id: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("Transport error with worker {pid}: {message}")]
    Transport { pid: i32, message: String },

    #[error("Frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: u64, max: u64 },

    #[error("Worker {pid} {reason}")]
    WorkerExit { pid: i32, reason: String },

    #[error("Task {index} failed: {message}")]
    TaskFailed { index: usize, message: String },

    #[error("All workers closed their reply pipes with {remaining} tasks unfinished")]
    PoolExhausted { remaining: usize },

    #[error("Run aborted by manual interrupt")]
    Interrupted,
}

impl ProcfanError {
    /// Build a transport error for the worker with the given pid.
    pub fn transport(pid: i32, message: impl Into<String>) -> Self {
        Self::Transport {
            pid,
            message: message.into(),
        }
    }
}

/// Result type alias for procfan operations.
pub type Result<T> = std::result::Result<T, ProcfanError>;

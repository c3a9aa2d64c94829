//! Error types for prefork.

use thiserror::Error;

/// Main error type for prefork.
#[derive(Error, Debug)]
pub enum PreforkError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Frame encode error: {0}")]
    Encode(#[from] bincode::Error),

    #[error("Frame decode error: {0}")]
    Decode(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Failed to spawn worker: {0}")]
    Spawn(String),

    #[error("Worker {pid} did not complete startup within {timeout_sec}s")]
    StartupTimeout { pid: u32, timeout_sec: u64 },

    #[error("Worker error: {0}")]
    Worker(String),

    #[error("Pool error: {0}")]
    Pool(String),

    #[error("Pool '{0}' not found")]
    PoolNotFound(String),

    #[error("Pool '{0}' already exists")]
    PoolExists(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Invalid URI pattern '{pattern}': {source}")]
    UriPattern {
        pattern: String,
        source: regex::Error,
    },

    /// Custom dispatch completed with a non-200 status. The message carries
    /// the full status string (e.g. "429 Too Many Requests").
    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Pool is shutting down")]
    ShuttingDown,
}

/// Result type alias for prefork operations.
pub type Result<T> = std::result::Result<T, PreforkError>;

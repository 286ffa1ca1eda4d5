//! Error types for local inference operations.

use std::time::Duration;

use thiserror::Error;

/// Errors for catalog and data-directory operations.
#[derive(Debug, Error)]
pub enum LocalError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Catalog file is present but unusable.
    #[error("Invalid model catalog at {path}: {reason}")]
    InvalidCatalog { path: String, reason: String },

    /// Failed to create the Eigen data directory.
    #[error("Failed to create data directory: {0}")]
    DataDirCreationFailed(String),
}

/// Reasons the inference server could not be brought to `ready`.
#[derive(Debug, Error)]
pub enum StartError {
    /// llama-server binary not found.
    #[error("llama-server binary not found at {0}")]
    BinaryNotFound(String),

    /// A model file required for launch is missing.
    #[error("Model file not found: {0}")]
    ModelMissing(String),

    /// The process could not be spawned.
    #[error("Failed to spawn llama-server: {0}")]
    Spawn(String),

    /// No local port could be reserved for the server.
    #[error("Failed to reserve a local port: {0}")]
    Port(String),

    /// A server is already running; use a restart instead.
    #[error("Inference server is already running")]
    AlreadyRunning,

    /// Health check did not pass within the startup timeout.
    #[error("Timeout waiting for server to become ready")]
    Timeout,

    /// The process exited before it became healthy.
    #[error("Server process exited during startup ({})", describe_exit(.0))]
    ProcessExited(Option<i32>),
}

/// Errors that end a model download.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// Download host answered with a non-success status.
    #[error("Download failed with HTTP {status}: {url}")]
    Status { status: u16, url: String },

    /// Connection or transfer failure.
    #[error("Transfer error: {0}")]
    Transport(#[from] reqwest::Error),

    /// I/O error while writing the file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Checksum verification failed.
    #[error("Checksum mismatch for {file}. Expected: {expected}, got: {actual}")]
    ChecksumMismatch {
        file: String,
        expected: String,
        actual: String,
    },

    /// No bytes arrived within the idle timeout.
    #[error("No data received for {0:?}")]
    Stalled(Duration),

    /// The job was cancelled.
    #[error("Download cancelled")]
    Cancelled,
}

/// Errors while talking to a running inference server.
#[derive(Debug, Error)]
pub enum StreamError {
    /// Server is not running or not reachable.
    #[error("Server not running at {0}")]
    ServerNotRunning(String),

    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Transport(#[from] reqwest::Error),

    /// Server returned an error response.
    #[error("Server returned {status}: {body}")]
    Status { status: u16, body: String },

    /// Server reported an error inside the event stream.
    #[error("Server error: {0}")]
    Server(String),

    /// A stream event could not be decoded.
    #[error("Malformed stream event: {0}")]
    Decode(String),

    /// No tokens arrived within the idle timeout.
    #[error("No tokens received for {0:?}")]
    IdleTimeout(Duration),

    /// The body ended before the `[DONE]` event.
    #[error("Stream ended before completion")]
    Truncated,

    /// The server process went away mid-generation.
    #[error("Inference server exited during generation")]
    ServerExited,
}

pub(crate) fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {}", code),
        None => "terminated by signal".to_string(),
    }
}

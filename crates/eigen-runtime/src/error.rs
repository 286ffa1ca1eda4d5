//! Errors returned by runtime commands.

use eigen_local::{DownloadError, LocalError, StartError, StreamError};
use thiserror::Error;

use crate::store::StoreError;

/// Errors from runtime commands.
///
/// Failures that happen after a command returned (download, generation,
/// server crash) arrive as events instead.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("busy: {0}")]
    Busy(&'static str),
    #[error("model '{0}' is in use")]
    InUse(String),
    #[error("model '{0}' is not in the catalog")]
    NotFound(String),
    #[error("model '{0}' is not downloaded")]
    NotDownloaded(String),
    #[error("model '{0}' was placed by hand; remove its files from the models directory")]
    NotManaged(String),
    #[error("inference server is not ready")]
    NotReady,
    #[error("server error: {0}")]
    Start(#[from] StartError),
    #[error("download error: {0}")]
    Download(#[from] DownloadError),
    #[error("stream error: {0}")]
    Stream(#[from] StreamError),
    #[error(transparent)]
    Local(#[from] LocalError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

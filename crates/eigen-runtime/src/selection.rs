//! The last model the user switched to, persisted across restarts.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::RuntimeError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSelection {
    pub model_id: String,
}

#[derive(Debug, Clone)]
pub struct SelectionStore {
    path: PathBuf,
}

impl SelectionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Saved selection. A missing or unreadable file counts as none.
    pub async fn load(&self) -> Option<ModelSelection> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!("Failed to read {}: {}", self.path.display(), e);
                return None;
            }
        };
        match serde_json::from_slice(&raw) {
            Ok(selection) => Some(selection),
            Err(e) => {
                warn!("Ignoring corrupt selection {}: {}", self.path.display(), e);
                None
            }
        }
    }

    pub async fn save(&self, model_id: &str) -> Result<(), RuntimeError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_vec_pretty(&ModelSelection {
            model_id: model_id.to_string(),
        })?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    pub async fn clear(&self) -> Result<(), RuntimeError> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_save_load_clear() {
        let dir = TempDir::new().unwrap();
        let store = SelectionStore::new(dir.path().join("nested/selection.json"));
        assert_eq!(store.load().await, None);

        store.save("qwen3-4b").await.unwrap();
        assert_eq!(
            store.load().await,
            Some(ModelSelection {
                model_id: "qwen3-4b".into()
            })
        );

        store.save("gemma-3-4b").await.unwrap();
        assert_eq!(store.load().await.unwrap().model_id, "gemma-3-4b");

        store.clear().await.unwrap();
        store.clear().await.unwrap();
        assert_eq!(store.load().await, None);
    }

    #[tokio::test]
    async fn test_corrupt_file_is_ignored() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("selection.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert_eq!(SelectionStore::new(path).load().await, None);
    }
}

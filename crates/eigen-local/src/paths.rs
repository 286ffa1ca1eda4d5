//! Path utilities for Eigen data directories.
//!
//! Layout under the data directory (default `~/.eigen/`):
//!
//! ```text
//! bin/llama-server
//! models/model-catalog.json
//! models/<model-id>/<file>.gguf
//! selection.json
//! ```

use std::path::{Path, PathBuf};

/// Default data directory (~/.eigen/), or `.eigen` in the working directory
/// when no home directory is known.
pub fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".eigen"))
        .unwrap_or_else(|| PathBuf::from(".eigen"))
}

/// Get the models directory (<data>/models/).
pub fn models_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("models")
}

/// Get the bin directory (<data>/bin/).
pub fn bin_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("bin")
}

/// Get the path to the bundled llama-server binary.
pub fn llama_server_path(data_dir: &Path) -> PathBuf {
    let binary_name = if cfg!(target_os = "windows") {
        "llama-server.exe"
    } else {
        "llama-server"
    };
    bin_dir(data_dir).join(binary_name)
}

/// Catalog file inside the models directory.
pub fn catalog_path(models_dir: &Path) -> PathBuf {
    models_dir.join("model-catalog.json")
}

/// Persisted model selection.
pub fn selection_path(data_dir: &Path) -> PathBuf {
    data_dir.join("selection.json")
}

/// Directory holding every file of one model.
pub fn model_dir(models_dir: &Path, model_id: &str) -> PathBuf {
    models_dir.join(model_id)
}

/// In-progress download target for a final file path.
pub fn partial_path(file: &Path) -> PathBuf {
    let mut name = file.as_os_str().to_owned();
    name.push(".partial");
    PathBuf::from(name)
}

/// Ensure the Eigen data directories exist.
pub fn ensure_dirs(data_dir: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(data_dir)?;
    std::fs::create_dir_all(models_dir(data_dir))?;
    std::fs::create_dir_all(bin_dir(data_dir))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        let data = Path::new("/tmp/eigen");
        assert_eq!(models_dir(data), Path::new("/tmp/eigen/models"));
        assert_eq!(
            model_dir(&models_dir(data), "qwen"),
            Path::new("/tmp/eigen/models/qwen")
        );
        assert_eq!(
            partial_path(Path::new("/m/a.gguf")),
            Path::new("/m/a.gguf.partial")
        );
    }

    #[test]
    fn test_ensure_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("data");
        ensure_dirs(&data).unwrap();
        assert!(models_dir(&data).is_dir());
        assert!(bin_dir(&data).is_dir());
    }
}

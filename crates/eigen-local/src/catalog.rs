//! Model catalog: the downloadable models and where their files live.

use std::fs;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::LocalError;
use crate::paths::model_dir;

/// Current catalog file format.
pub const CATALOG_VERSION: u32 = 1;

/// Id under which a model placed by hand in the models directory is listed.
pub const LOCAL_MODEL_ID: &str = "local";

/// What a model can do beyond plain text chat.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelCapabilities {
    /// Accepts image inputs (requires an mmproj file).
    pub vision: bool,
    /// Emits `<think>` reasoning before answering.
    #[serde(alias = "thinking")]
    pub reasoning: bool,
}

/// One downloadable file of a model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelFile {
    pub filename: String,
    pub url: String,
    pub size_bytes: u64,
    /// Expected SHA256 checksum (optional).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelFiles {
    pub model: ModelFile,
    /// Multimodal projector for vision models.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mmproj: Option<ModelFile>,
}

impl ModelFiles {
    /// Primary file first, then the projector.
    pub fn iter(&self) -> impl Iterator<Item = &ModelFile> {
        std::iter::once(&self.model).chain(self.mmproj.as_ref())
    }

    pub fn total_bytes(&self) -> u64 {
        self.iter().map(|file| file.size_bytes).sum()
    }
}

/// Static catalog entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub id: String,
    pub name: String,
    pub description: String,
    pub size_label: String,
    pub capabilities: ModelCapabilities,
    pub files: ModelFiles,
}

/// Resolved on-disk locations of an installed model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelPaths {
    pub model: PathBuf,
    pub mmproj: Option<PathBuf>,
}

/// Where a catalog model stands from the user's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelRuntimeState {
    NotDownloaded,
    Downloading,
    Downloaded,
    Current,
}

/// A catalog entry joined with its runtime state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelListing {
    #[serde(flatten)]
    pub descriptor: ModelDescriptor,
    pub state: ModelRuntimeState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_percent: Option<f64>,
}

/// The set of models Eigen knows how to fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelCatalog {
    pub version: u32,
    pub models: Vec<ModelDescriptor>,
}

impl ModelCatalog {
    /// Build a catalog from descriptors.
    pub fn new(models: Vec<ModelDescriptor>) -> Self {
        Self {
            version: CATALOG_VERSION,
            models,
        }
    }

    /// Catalog shipped with Eigen, written to disk on first run.
    pub fn builtin() -> Self {
        Self::new(vec![
            descriptor(
                "qwen3-1.7b",
                "Qwen3 1.7B",
                "Small and fast reasoning model for everyday chat.",
                "1.1 GB",
                ModelCapabilities {
                    vision: false,
                    reasoning: true,
                },
                file(
                    "Qwen3-1.7B-Q4_K_M.gguf",
                    "https://huggingface.co/unsloth/Qwen3-1.7B-GGUF/resolve/main/Qwen3-1.7B-Q4_K_M.gguf",
                    1_107_409_472,
                ),
                None,
            ),
            descriptor(
                "qwen3-4b",
                "Qwen3 4B",
                "Stronger reasoning model for longer answers and math.",
                "2.5 GB",
                ModelCapabilities {
                    vision: false,
                    reasoning: true,
                },
                file(
                    "Qwen3-4B-Q4_K_M.gguf",
                    "https://huggingface.co/unsloth/Qwen3-4B-GGUF/resolve/main/Qwen3-4B-Q4_K_M.gguf",
                    2_497_280_256,
                ),
                None,
            ),
            descriptor(
                "gemma-3-4b",
                "Gemma 3 4B",
                "Multimodal model that can describe and reason about images.",
                "3.3 GB",
                ModelCapabilities {
                    vision: true,
                    reasoning: false,
                },
                file(
                    "gemma-3-4b-it-Q4_K_M.gguf",
                    "https://huggingface.co/ggml-org/gemma-3-4b-it-GGUF/resolve/main/gemma-3-4b-it-Q4_K_M.gguf",
                    2_489_757_856,
                ),
                Some(file(
                    "mmproj-model-f16.gguf",
                    "https://huggingface.co/ggml-org/gemma-3-4b-it-GGUF/resolve/main/mmproj-model-f16.gguf",
                    851_251_104,
                )),
            ),
            descriptor(
                "llama-3.2-3b",
                "Llama 3.2 3B",
                "General-purpose instruction model.",
                "2.0 GB",
                ModelCapabilities::default(),
                file(
                    "Llama-3.2-3B-Instruct-Q4_K_M.gguf",
                    "https://huggingface.co/bartowski/Llama-3.2-3B-Instruct-GGUF/resolve/main/Llama-3.2-3B-Instruct-Q4_K_M.gguf",
                    2_019_377_376,
                ),
                None,
            ),
        ])
    }

    /// Read the catalog at `path`, writing the built-in one there if absent.
    pub fn load_or_create(path: &Path) -> Result<Self, LocalError> {
        if path.exists() {
            let content = fs::read_to_string(path)?;
            let catalog: ModelCatalog =
                serde_json::from_str(&content).map_err(|e| LocalError::InvalidCatalog {
                    path: path.display().to_string(),
                    reason: e.to_string(),
                })?;
            catalog.validate(path)?;
            return Ok(catalog);
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let catalog = Self::builtin();
        fs::write(path, serde_json::to_string_pretty(&catalog)?)?;
        info!("Created default catalog at {}", path.display());
        Ok(catalog)
    }

    fn validate(&self, path: &Path) -> Result<(), LocalError> {
        let invalid = |reason: String| LocalError::InvalidCatalog {
            path: path.display().to_string(),
            reason,
        };
        for (i, model) in self.models.iter().enumerate() {
            if !is_single_component(&model.id) {
                return Err(invalid(format!("bad model id '{}'", model.id)));
            }
            if model.id == LOCAL_MODEL_ID {
                return Err(invalid(format!("model id '{}' is reserved", model.id)));
            }
            if self.models[..i].iter().any(|other| other.id == model.id) {
                return Err(invalid(format!("duplicate model id '{}'", model.id)));
            }
            if let Some(file) = model.files.iter().find(|f| !is_single_component(&f.filename)) {
                return Err(invalid(format!(
                    "bad file name '{}' in model '{}'",
                    file.filename, model.id
                )));
            }
        }
        Ok(())
    }

    pub fn get(&self, model_id: &str) -> Option<&ModelDescriptor> {
        self.models.iter().find(|model| model.id == model_id)
    }

    pub fn descriptors(&self) -> &[ModelDescriptor] {
        &self.models
    }
}

/// Paths of every file of `descriptor`, whether present or not.
pub fn expected_paths(models_dir: &Path, descriptor: &ModelDescriptor) -> ModelPaths {
    let dir = model_dir(models_dir, &descriptor.id);
    ModelPaths {
        model: dir.join(&descriptor.files.model.filename),
        mmproj: descriptor
            .files
            .mmproj
            .as_ref()
            .map(|mmproj| dir.join(&mmproj.filename)),
    }
}

/// Paths of an installed model, or `None` if any file is missing.
///
/// Partial downloads live under a different name and never count.
pub fn installed_paths(models_dir: &Path, descriptor: &ModelDescriptor) -> Option<ModelPaths> {
    let paths = expected_paths(models_dir, descriptor);
    if !paths.model.is_file() {
        return None;
    }
    match &paths.mmproj {
        Some(mmproj) if !mmproj.is_file() => None,
        _ => Some(paths),
    }
}

pub fn is_downloaded(models_dir: &Path, descriptor: &ModelDescriptor) -> bool {
    installed_paths(models_dir, descriptor).is_some()
}

/// A `.gguf` model dropped straight into the models directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalModel {
    pub descriptor: ModelDescriptor,
    pub paths: ModelPaths,
}

/// Look for a hand-placed model in `models_dir`.
///
/// Only top-level `.gguf` files count; catalog models live in
/// subdirectories. A file whose name contains `mmproj` is taken as the
/// vision projector, and the first other file by name is the model.
pub fn discover_local_model(models_dir: &Path) -> Option<LocalModel> {
    let entries = match fs::read_dir(models_dir) {
        Ok(entries) => entries,
        Err(e) => {
            debug!("Cannot scan {}: {}", models_dir.display(), e);
            return None;
        }
    };

    let mut files: Vec<PathBuf> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && is_gguf(path))
        .collect();
    files.sort();
    let (projectors, models): (Vec<_>, Vec<_>) =
        files.into_iter().partition(|path| is_projector(path));

    let model = models.into_iter().next()?;
    let mmproj = projectors.into_iter().next();

    let files = ModelFiles {
        model: local_file(&model),
        mmproj: mmproj.as_deref().map(local_file),
    };
    let name = model
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "Local model".to_string());
    let descriptor = ModelDescriptor {
        id: LOCAL_MODEL_ID.to_string(),
        name,
        description: "Model file placed in the models directory".to_string(),
        size_label: size_label(files.total_bytes()),
        capabilities: ModelCapabilities {
            vision: mmproj.is_some(),
            reasoning: false,
        },
        files,
    };
    debug!("Found hand-placed model {}", model.display());
    Some(LocalModel {
        descriptor,
        paths: ModelPaths { model, mmproj },
    })
}

/// True if `name` is one plain path component (no separators, `.` or `..`).
fn is_single_component(name: &str) -> bool {
    if name.contains('\\') {
        return false;
    }
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(part)), None) if part == name
    )
}

fn is_gguf(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext.to_string_lossy().eq_ignore_ascii_case("gguf"))
}

fn is_projector(path: &Path) -> bool {
    path.file_name()
        .is_some_and(|name| name.to_string_lossy().to_lowercase().contains("mmproj"))
}

fn local_file(path: &Path) -> ModelFile {
    ModelFile {
        filename: path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default(),
        url: String::new(),
        size_bytes: fs::metadata(path).map(|meta| meta.len()).unwrap_or(0),
        sha256: None,
    }
}

fn size_label(bytes: u64) -> String {
    const GB: f64 = 1_000_000_000.0;
    const MB: f64 = 1_000_000.0;
    let bytes = bytes as f64;
    if bytes >= GB {
        format!("{:.1} GB", bytes / GB)
    } else {
        format!("{:.0} MB", bytes / MB)
    }
}

fn descriptor(
    id: &str,
    name: &str,
    description: &str,
    size_label: &str,
    capabilities: ModelCapabilities,
    model: ModelFile,
    mmproj: Option<ModelFile>,
) -> ModelDescriptor {
    ModelDescriptor {
        id: id.to_string(),
        name: name.to_string(),
        description: description.to_string(),
        size_label: size_label.to_string(),
        capabilities,
        files: ModelFiles { model, mmproj },
    }
}

fn file(filename: &str, url: &str, size_bytes: u64) -> ModelFile {
    ModelFile {
        filename: filename.to_string(),
        url: url.to_string(),
        size_bytes,
        sha256: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_catalog_ids_are_unique() {
        let catalog = ModelCatalog::builtin();
        assert!(catalog.validate(Path::new("builtin")).is_ok());
        assert!(catalog.get("gemma-3-4b").unwrap().capabilities.vision);
        assert!(catalog.get("missing").is_none());
    }

    #[test]
    fn test_load_or_create_writes_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("models").join("model-catalog.json");

        let created = ModelCatalog::load_or_create(&path).unwrap();
        assert!(path.exists());
        assert_eq!(created, ModelCatalog::builtin());

        let loaded = ModelCatalog::load_or_create(&path).unwrap();
        assert_eq!(loaded, created);
    }

    #[test]
    fn test_accepts_thinking_flag() {
        let json = r#"{
            "version": 1,
            "models": [{
                "id": "m",
                "name": "M",
                "description": "",
                "size_label": "1 GB",
                "capabilities": { "vision": false, "thinking": true },
                "files": { "model": { "filename": "m.gguf", "url": "http://x/m.gguf", "size_bytes": 10 } }
            }]
        }"#;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model-catalog.json");
        fs::write(&path, json).unwrap();

        let catalog = ModelCatalog::load_or_create(&path).unwrap();
        let model = catalog.get("m").unwrap();
        assert!(model.capabilities.reasoning);
        assert!(model.files.mmproj.is_none());
        assert_eq!(model.files.total_bytes(), 10);
    }

    #[test]
    fn test_rejects_duplicate_ids() {
        let mut catalog = ModelCatalog::builtin();
        let first = catalog.models[0].clone();
        catalog.models.push(first);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model-catalog.json");
        fs::write(&path, serde_json::to_string(&catalog).unwrap()).unwrap();

        assert!(matches!(
            ModelCatalog::load_or_create(&path),
            Err(LocalError::InvalidCatalog { .. })
        ));
    }

    #[test]
    fn test_installed_requires_every_file() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = ModelCatalog::builtin();
        let gemma = catalog.get("gemma-3-4b").unwrap();
        let paths = expected_paths(dir.path(), gemma);

        fs::create_dir_all(paths.model.parent().unwrap()).unwrap();
        fs::write(&paths.model, b"weights").unwrap();
        assert!(!is_downloaded(dir.path(), gemma));

        fs::write(paths.mmproj.as_ref().unwrap(), b"proj").unwrap();
        assert_eq!(installed_paths(dir.path(), gemma), Some(paths));
    }

    #[test]
    fn test_partial_file_is_not_installed() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = ModelCatalog::builtin();
        let qwen = catalog.get("qwen3-1.7b").unwrap();
        let paths = expected_paths(dir.path(), qwen);

        fs::create_dir_all(paths.model.parent().unwrap()).unwrap();
        fs::write(crate::paths::partial_path(&paths.model), b"half").unwrap();
        assert!(!is_downloaded(dir.path(), qwen));
    }

    fn catalog_with(id: &str, filename: &str) -> ModelCatalog {
        ModelCatalog::new(vec![descriptor(
            id,
            "M",
            "",
            "1 GB",
            ModelCapabilities::default(),
            file(filename, "http://x/m.gguf", 10),
            None,
        )])
    }

    #[test]
    fn test_rejects_ids_that_escape_model_dir() {
        let path = Path::new("model-catalog.json");
        for id in [".", "..", "", "a/b", "a\\b", "./a", "/abs", LOCAL_MODEL_ID] {
            assert!(
                matches!(
                    catalog_with(id, "m.gguf").validate(path),
                    Err(LocalError::InvalidCatalog { .. })
                ),
                "id {:?} accepted",
                id
            );
        }
        assert!(catalog_with("m-1.5b", "m.gguf").validate(path).is_ok());
    }

    #[test]
    fn test_rejects_file_names_outside_model_dir() {
        let path = Path::new("model-catalog.json");
        for filename in ["../x.gguf", "sub/x.gguf", ".", ".."] {
            assert!(
                catalog_with("m", filename).validate(path).is_err(),
                "file name {:?} accepted",
                filename
            );
        }

        let mut catalog = catalog_with("m", "m.gguf");
        catalog.models[0].files.mmproj = Some(file("../../proj.gguf", "http://x/p.gguf", 1));
        assert!(catalog.validate(path).is_err());
    }

    #[test]
    fn test_loading_dot_id_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model-catalog.json");
        fs::write(&path, serde_json::to_string(&catalog_with(".", "m.gguf")).unwrap()).unwrap();
        assert!(matches!(
            ModelCatalog::load_or_create(&path),
            Err(LocalError::InvalidCatalog { .. })
        ));
    }

    #[test]
    fn test_discovers_hand_placed_model_with_projector() {
        let dir = tempfile::tempdir().unwrap();
        assert!(discover_local_model(dir.path()).is_none());

        fs::write(dir.path().join("model-catalog.json"), b"{}").unwrap();
        fs::write(dir.path().join("mmproj-F16.gguf"), b"proj").unwrap();
        assert!(discover_local_model(dir.path()).is_none());

        fs::write(dir.path().join("zeta.GGUF"), b"weights-z").unwrap();
        fs::write(dir.path().join("alpha.gguf"), b"weights").unwrap();
        fs::write(dir.path().join("beta.gguf.partial"), b"half").unwrap();
        fs::create_dir_all(dir.path().join("qwen3-1.7b")).unwrap();
        fs::write(dir.path().join("qwen3-1.7b").join("inner.gguf"), b"catalog").unwrap();

        let local = discover_local_model(dir.path()).unwrap();
        assert_eq!(local.descriptor.id, LOCAL_MODEL_ID);
        assert_eq!(local.descriptor.name, "alpha");
        assert!(local.descriptor.capabilities.vision);
        assert_eq!(local.descriptor.files.total_bytes(), 11);
        assert_eq!(local.paths.model, dir.path().join("alpha.gguf"));
        assert_eq!(local.paths.mmproj, Some(dir.path().join("mmproj-F16.gguf")));
    }

    #[test]
    fn test_discovered_text_model_has_no_projector() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("tiny.gguf"), b"weights").unwrap();

        let local = discover_local_model(dir.path()).unwrap();
        assert!(!local.descriptor.capabilities.vision);
        assert!(local.paths.mmproj.is_none());
        assert!(discover_local_model(&dir.path().join("missing")).is_none());
    }
}

//! Persistence for trained classifiers.
//!
//! A saved model is an exported [`DatasetDocument`] plus a name (unique
//! across the repository), a visibility flag and the id of the user who
//! saved it. The document itself is stored verbatim.

use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::classifier::{ClassifierError, DatasetDocument};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedModel {
    pub name: String,
    pub is_public: bool,
    pub owner_id: String,
    pub created_at: DateTime<Utc>,
    pub dataset: DatasetDocument,
}

impl SavedModel {
    pub fn new(name: impl Into<String>, owner_id: impl Into<String>, is_public: bool, dataset: DatasetDocument) -> Self {
        Self {
            name: name.into(),
            is_public,
            owner_id: owner_id.into(),
            created_at: Utc::now(),
            dataset,
        }
    }

    pub fn summary(&self) -> ModelSummary {
        ModelSummary {
            name: self.name.clone(),
            is_public: self.is_public,
            owner_id: self.owner_id.clone(),
            created_at: self.created_at,
            labels: self.dataset.labels().map(str::to_string).collect(),
        }
    }
}

/// Listing entry for a saved model, without its feature data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSummary {
    pub name: String,
    pub is_public: bool,
    pub owner_id: String,
    pub created_at: DateTime<Utc>,
    pub labels: Vec<String>,
}

/// Storage for saved models.
pub trait ModelRepository {
    /// Stores a new model. Fails with [`ClassifierError::DuplicateName`] if the name is taken.
    fn save(&self, model: &SavedModel) -> Result<(), ClassifierError>;

    /// Models visible to `viewer`: every public model plus the viewer's own
    fn list(&self, viewer: Option<&str>) -> Result<Vec<ModelSummary>, ClassifierError>;

    fn load(&self, name: &str) -> Result<SavedModel, ClassifierError>;
}

/// Keeps each model as `<name>.json` in a directory.
#[derive(Debug, Clone)]
pub struct LocalModelRepository {
    dir: PathBuf,
}

impl LocalModelRepository {
    pub fn new<P: AsRef<Path>>(dir: P) -> io::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn new_default() -> io::Result<Self> {
        Self::new(Self::get_default_dir())
    }

    /// `EXEMPLAR_MODELS_DIR`, else the platform data directory
    pub fn get_default_dir() -> PathBuf {
        if let Ok(path) = env::var("EXEMPLAR_MODELS_DIR") {
            return PathBuf::from(path);
        }
        dirs::data_dir()
            .or_else(|| dirs::home_dir().map(|home| home.join(".local").join("share")))
            .unwrap_or_else(env::temp_dir)
            .join("exemplar")
            .join("saved")
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, name: &str) -> Result<PathBuf, ClassifierError> {
        let valid = !name.trim().is_empty()
            && !name.starts_with('.')
            && name.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, ' ' | '_' | '-' | '.'));
        if !valid {
            return Err(ClassifierError::Validation(format!(
                "Invalid model name '{}': use letters, digits, spaces, '_', '-' or '.'",
                name
            )));
        }
        Ok(self.dir.join(format!("{}.json", name)))
    }
}

impl ModelRepository for LocalModelRepository {
    fn save(&self, model: &SavedModel) -> Result<(), ClassifierError> {
        if model.dataset.is_empty() {
            return Err(ClassifierError::Validation("Refusing to save a model without any labels".into()));
        }
        let path = self.path_for(&model.name)?;
        if path.exists() {
            return Err(ClassifierError::DuplicateName(model.name.clone()));
        }
        fs::write(&path, serde_json::to_vec(model)?)?;
        log::info!("Saved model '{}' to {:?}", model.name, path);
        Ok(())
    }

    fn list(&self, viewer: Option<&str>) -> Result<Vec<ModelSummary>, ClassifierError> {
        let mut summaries = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let model = match read_model(&path) {
                Ok(model) => model,
                Err(e) => {
                    log::warn!("Skipping unreadable model file {:?}: {}", path, e);
                    continue;
                }
            };
            if model.is_public || viewer == Some(model.owner_id.as_str()) {
                summaries.push(model.summary());
            }
        }
        summaries.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.name.cmp(&b.name)));
        Ok(summaries)
    }

    fn load(&self, name: &str) -> Result<SavedModel, ClassifierError> {
        let path = self.path_for(name)?;
        if !path.exists() {
            return Err(ClassifierError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("No saved model named '{}'", name),
            )));
        }
        read_model(&path)
    }
}

fn read_model(path: &Path) -> Result<SavedModel, ClassifierError> {
    Ok(serde_json::from_slice(&fs::read(path)?)?)
}

use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use crate::models::ModelInfo;

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("Model not downloaded: {0}")]
    NotDownloaded(String),
    #[error("Download error: {0}")]
    DownloadError(#[from] reqwest::Error),
    #[error("Download of {url} failed with status {status}")]
    BadStatus { url: String, status: u16 },
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
    #[error("Model verification failed")]
    VerificationFailed,
    #[error("Hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },
}

/// Downloads embedding models into a local cache and verifies them.
#[derive(Clone, Debug)]
pub struct ModelManager {
    models_dir: PathBuf,
    download_lock: Arc<Mutex<()>>,
}

impl ModelManager {
    /// Creates a new ModelManager with the default models directory
    pub fn new_default() -> io::Result<Self> {
        Self::new(Self::get_default_models_dir())
    }

    /// Returns the default models directory path
    pub fn get_default_models_dir() -> PathBuf {
        if let Ok(path) = env::var("EXEMPLAR_CACHE") {
            return PathBuf::from(path).join("models");
        }

        if let Some(cache_dir) = dirs::cache_dir() {
            return cache_dir.join("exemplar").join("models");
        }

        if let Some(home_dir) = dirs::home_dir() {
            return home_dir.join(".cache").join("exemplar").join("models");
        }

        env::temp_dir().join("exemplar").join("models")
    }

    pub fn new<P: AsRef<Path>>(models_dir: P) -> io::Result<Self> {
        let models_dir = models_dir.as_ref().to_path_buf();
        fs::create_dir_all(&models_dir)?;
        Ok(Self {
            models_dir,
            download_lock: Arc::new(Mutex::new(())),
        })
    }

    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    pub fn get_model_path(&self, info: &ModelInfo) -> PathBuf {
        self.models_dir.join(&info.name).join("model.onnx")
    }

    pub fn is_model_downloaded(&self, info: &ModelInfo) -> bool {
        let model_path = self.get_model_path(info);
        log::debug!("Model path: {:?} (exists: {})", model_path, model_path.exists());
        model_path.exists()
    }

    pub async fn download_model(&self, info: &ModelInfo) -> Result<(), ModelError> {
        let _lock = self.download_lock.lock().await;

        let model_dir = self.models_dir.join(&info.name);
        log::info!("Creating model directory at {:?}", model_dir);
        fs::create_dir_all(&model_dir)?;

        let model_path = self.get_model_path(info);
        let result = if model_path.exists() && self.verify_file(&model_path, info.model_hash.as_deref())? {
            log::info!("Existing model file verified successfully");
            Ok(())
        } else {
            log::info!("Downloading model '{}'...", info.name);
            self.download_and_verify_file(&info.model_url, &model_path, info.model_hash.as_deref())
                .await
        };

        if let Err(e) = &result {
            log::error!("Failed to set up model file: {}", e);
            if let Err(cleanup) = self.remove_download(info) {
                log::warn!("Failed to remove partial download: {}", cleanup);
            }
        }
        result
    }

    fn hash_bytes(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        format!("{:x}", hasher.finalize())
    }

    fn verify_file(&self, path: &Path, expected_hash: Option<&str>) -> Result<bool, ModelError> {
        let Some(expected) = expected_hash else {
            log::warn!("No hash known for {:?}, skipping verification", path);
            return Ok(true);
        };
        let bytes = fs::read(path)?;
        let hash = Self::hash_bytes(&bytes);
        log::debug!("Calculated hash: {} (expected {})", hash, expected);
        Ok(hash == expected)
    }

    pub fn verify_model(&self, info: &ModelInfo) -> Result<bool, ModelError> {
        let model_path = self.get_model_path(info);
        if !model_path.exists() {
            return Ok(false);
        }
        self.verify_file(&model_path, info.model_hash.as_deref())
    }

    async fn download_and_verify_file(
        &self,
        url: &str,
        path: &Path,
        expected_hash: Option<&str>,
    ) -> Result<(), ModelError> {
        log::info!("Downloading {} to {:?}", url, path);
        let response = reqwest::get(url).await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ModelError::BadStatus { url: url.to_string(), status: status.as_u16() });
        }
        let bytes = response.bytes().await?;
        log::info!("Downloaded {} bytes", bytes.len());

        if let Some(expected) = expected_hash {
            let hash = Self::hash_bytes(&bytes);
            if hash != expected {
                log::error!("Model hash mismatch: expected {}, got {}", expected, hash);
                return Err(ModelError::HashMismatch { expected: expected.to_string(), actual: hash });
            }
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, &bytes)?;

        if !self.verify_file(path, expected_hash)? {
            return Err(ModelError::VerificationFailed);
        }
        Ok(())
    }

    pub fn remove_download(&self, info: &ModelInfo) -> Result<(), ModelError> {
        let model_path = self.get_model_path(info);
        if model_path.exists() {
            fs::remove_file(&model_path)?;
        }
        Ok(())
    }

    /// Ensures that a model is downloaded and verified.
    /// If the model doesn't exist, it will be downloaded.
    /// If verification fails, it will be re-downloaded.
    pub async fn ensure_model_downloaded(&self, info: &ModelInfo) -> Result<PathBuf, ModelError> {
        if !self.is_model_downloaded(info) {
            log::info!("Model '{}' not found, downloading...", info.name);
            self.download_model(info).await?;
        } else if !self.verify_model(info)? {
            log::info!("Model '{}' failed verification, re-downloading...", info.name);
            self.remove_download(info)?;
            self.download_model(info).await?;
        }
        Ok(self.get_model_path(info))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_info(hash: Option<&str>) -> ModelInfo {
        ModelInfo {
            name: "local".to_string(),
            model_url: "http://127.0.0.1:9/model.onnx".to_string(),
            model_hash: hash.map(str::to_string),
        }
    }

    #[test]
    fn test_verify_against_known_hash() -> Result<(), ModelError> {
        let dir = tempfile::tempdir()?;
        let manager = ModelManager::new(dir.path())?;
        let info = local_info(Some(&ModelManager::hash_bytes(b"weights")));

        assert!(!manager.verify_model(&info)?);

        let path = manager.get_model_path(&info);
        fs::create_dir_all(path.parent().unwrap())?;
        fs::write(&path, b"weights")?;
        assert!(manager.is_model_downloaded(&info));
        assert!(manager.verify_model(&info)?);

        fs::write(&path, b"tampered")?;
        assert!(!manager.verify_model(&info)?);

        manager.remove_download(&info)?;
        assert!(!manager.is_model_downloaded(&info));
        Ok(())
    }

    #[tokio::test]
    async fn test_cached_model_without_hash_skips_download() -> Result<(), ModelError> {
        let dir = tempfile::tempdir()?;
        let manager = ModelManager::new(dir.path())?;
        let info = local_info(None);

        let path = manager.get_model_path(&info);
        fs::create_dir_all(path.parent().unwrap())?;
        fs::write(&path, b"weights")?;

        let resolved = manager.ensure_model_downloaded(&info).await?;
        assert_eq!(resolved, path);
        Ok(())
    }

    #[test]
    fn test_default_models_dir() {
        env::set_var("EXEMPLAR_CACHE", "/tmp/test-cache");
        let path = ModelManager::get_default_models_dir();
        assert!(path.to_str().unwrap().contains("/tmp/test-cache/models"));
        env::remove_var("EXEMPLAR_CACHE");

        let path = ModelManager::get_default_models_dir();
        assert!(path.to_str().unwrap().contains("models"));
    }
}

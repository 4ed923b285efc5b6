use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::{Mutex, OnceLock};

use ndarray::Array1;
use ort::session::Session;
use ort::value::Tensor;

use super::embedding::{frame_to_tensor, FeatureExtractor, FeatureVector, Frame};
use super::error::ClassifierError;
use crate::model_manager::ModelManager;
use crate::models::{BuiltinModel, ModelCharacteristics, ModelInfo};
use crate::runtime::{create_session_builder, RuntimeConfig};

#[derive(Debug, Clone)]
enum ModelSource {
    Managed { manager: ModelManager, info: ModelInfo },
    File(PathBuf),
}

/// Feature extractor backed by an ONNX image model.
///
/// The model is expected to take a single `[1, 3, size, size]` float tensor
/// and to produce one output whose elements are used, flattened, as the
/// feature vector (logits or a pooled embedding both work).
///
/// The session is created lazily by [`FeatureExtractor::load`]; until then
/// every call to `extract` fails with [`ClassifierError::ModelLoad`].
#[derive(Debug)]
pub struct OnnxExtractor {
    source: ModelSource,
    characteristics: ModelCharacteristics,
    runtime_config: RuntimeConfig,
    session: OnceLock<Mutex<Session>>,
}

impl OnnxExtractor {
    /// Extractor for one of the built-in models, cached in the default models directory
    pub fn builtin(model: BuiltinModel) -> io::Result<Self> {
        let manager = ModelManager::new_default()?;
        Ok(Self::with_manager(model, manager))
    }

    /// Extractor for a built-in model cached by the given manager
    pub fn with_manager(model: BuiltinModel, manager: ModelManager) -> Self {
        Self {
            source: ModelSource::Managed { manager, info: model.get_model_info() },
            characteristics: model.characteristics(),
            runtime_config: RuntimeConfig::default(),
            session: OnceLock::new(),
        }
    }

    /// Extractor for a local ONNX file with known characteristics
    pub fn from_file(path: impl Into<PathBuf>, characteristics: ModelCharacteristics) -> Self {
        Self {
            source: ModelSource::File(path.into()),
            characteristics,
            runtime_config: RuntimeConfig::default(),
            session: OnceLock::new(),
        }
    }

    /// Sets the runtime configuration used when the session is created
    pub fn with_runtime_config(mut self, config: RuntimeConfig) -> Self {
        self.runtime_config = config;
        self
    }

    pub fn characteristics(&self) -> &ModelCharacteristics {
        &self.characteristics
    }

    async fn resolve_model_path(&self) -> Result<PathBuf, ClassifierError> {
        match &self.source {
            ModelSource::Managed { manager, info } => Ok(manager.ensure_model_downloaded(info).await?),
            ModelSource::File(path) => {
                if !path.exists() {
                    return Err(ClassifierError::ModelLoad(format!("Model file not found: {}", path.display())));
                }
                Ok(path.clone())
            }
        }
    }

    /// Validates that the model has the expected input/output structure
    fn validate_model(session: &Session) -> Result<(), ClassifierError> {
        if session.inputs.len() != 1 {
            return Err(ClassifierError::ModelLoad(format!(
                "Model must have exactly 1 image input, found {}",
                session.inputs.len()
            )));
        }
        if session.outputs.is_empty() {
            return Err(ClassifierError::ModelLoad("Model must have at least 1 output for features".to_string()));
        }
        Ok(())
    }
}

impl FeatureExtractor for OnnxExtractor {
    async fn load(&self) -> Result<(), ClassifierError> {
        if self.is_loaded() {
            return Ok(());
        }

        let model_path = self.resolve_model_path().await?;
        log::info!("Loading embedding model from {:?}", model_path);

        let config = self.runtime_config.clone();
        let session = tokio::task::spawn_blocking(move || -> Result<Session, ClassifierError> {
            Ok(create_session_builder(&config)?.commit_from_file(&model_path)?)
        })
        .await
        .map_err(|e| ClassifierError::ModelLoad(format!("Model loading task failed: {}", e)))??;

        Self::validate_model(&session)?;
        log::info!("Model structure validated successfully");

        // A concurrent load may have won the race; its session is equivalent.
        let _ = self.session.set(Mutex::new(session));
        Ok(())
    }

    fn is_loaded(&self) -> bool {
        self.session.get().is_some()
    }

    fn dim(&self) -> usize {
        self.characteristics.feature_dim
    }

    fn extract(&self, frame: &Frame) -> Result<FeatureVector, ClassifierError> {
        let session = self.session.get()
            .ok_or_else(|| ClassifierError::ModelLoad("Model not loaded".into()))?;

        let tensor = frame_to_tensor(frame, self.characteristics.input_size, self.characteristics.normalization)?;
        let input_dyn = tensor.into_dyn();
        let input = input_dyn.as_standard_layout();

        let session = session.lock()
            .map_err(|_| ClassifierError::Extraction("Model session lock poisoned".into()))?;

        let mut input_tensors = HashMap::new();
        input_tensors.insert(
            session.inputs[0].name.clone(),
            Tensor::from_array(&input)
                .map_err(|e| ClassifierError::Extraction(format!("Failed to create input tensor: {}", e)))?,
        );

        let outputs = session.run(input_tensors)
            .map_err(|e| ClassifierError::Extraction(format!("Failed to run model: {}", e)))?;
        let output_tensor = outputs[0].try_extract_tensor::<f32>()
            .map_err(|e| ClassifierError::Extraction(format!("Failed to extract output tensor: {}", e)))?;

        let features = Array1::from_iter(output_tensor.iter().copied());
        if features.len() != self.dim() {
            return Err(ClassifierError::Extraction(format!(
                "Model produced {} features, expected {}",
                features.len(),
                self.dim()
            )));
        }
        Ok(features)
    }
}

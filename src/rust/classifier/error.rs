use std::io;

use crate::model_manager::ModelError;

/// Represents the different types of errors that can occur while building or running the classifier.
#[derive(Debug, thiserror::Error)]
pub enum ClassifierError {
    /// The embedding model could not be fetched or initialised. Callers retry.
    #[error("Model load error: {0}")]
    ModelLoad(String),
    /// A precondition of the requested operation is not met
    #[error("Validation error: {0}")]
    Validation(String),
    /// The camera is unavailable, permission was denied or the stream died
    #[error("Device error: {0}")]
    Device(String),
    /// A frame or image could not be turned into a feature vector
    #[error("Extraction error: {0}")]
    Extraction(String),
    /// The feature store has no examples to compare against
    #[error("Feature store is empty: train or import a dataset first")]
    EmptyStore,
    /// An imported dataset does not match the expected feature dimensionality
    #[error("Shape error: label '{label}' has {len} values, not a multiple of {dim}")]
    Shape { label: String, len: usize, dim: usize },
    /// A class with this name already exists
    #[error("Class '{0}' already exists")]
    DuplicateName(String),
    /// No class with this name exists
    #[error("Unknown class '{0}'")]
    UnknownClass(String),
    /// An example or image index is out of range for its label
    #[error("Index {index} out of range for '{label}' ({len} entries)")]
    Index { label: String, index: usize, len: usize },
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl From<ModelError> for ClassifierError {
    fn from(err: ModelError) -> Self {
        ClassifierError::ModelLoad(err.to_string())
    }
}

impl From<ort::Error> for ClassifierError {
    fn from(err: ort::Error) -> Self {
        ClassifierError::ModelLoad(err.to_string())
    }
}

impl From<image::ImageError> for ClassifierError {
    fn from(err: image::ImageError) -> Self {
        ClassifierError::Extraction(err.to_string())
    }
}

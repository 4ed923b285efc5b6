mod classes;
mod embedding;
mod error;
mod onnx;
mod store;
mod utils;

pub use classes::{ClassEntry, ClassSet, SampleImage, SAMPLE_SIZE};
pub use embedding::{ensure_frame, FeatureExtractor, FeatureVector, Frame, Normalization};
pub use error::ClassifierError;
pub use onnx::OnnxExtractor;
pub use store::{DatasetDocument, LabeledFeatureStore, Prediction, PredictionResult, DEFAULT_K};

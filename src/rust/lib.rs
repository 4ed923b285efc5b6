//! An incremental, example-based image classifier.
//!
//! Images are grouped into user-named classes, embedded with a frozen
//! pretrained model and stored per label. New frames are classified by a
//! k-nearest-neighbour vote over everything stored so far, either one at a
//! time or continuously from a camera.
//!
//! # Basic Usage
//!
//! ```rust
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! use exemplar::LabeledFeatureStore;
//! use ndarray::array;
//!
//! let mut store = LabeledFeatureStore::new(2).with_k(3);
//! store.add_example("cat", array![1.0, 0.0])?;
//! store.add_example("cat", array![0.9, 0.1])?;
//! store.add_example("dog", array![0.0, 1.0])?;
//!
//! let result = store.query(&array![0.95, 0.05])?;
//! assert_eq!(result.top().map(|p| p.label.as_str()), Some("cat"));
//! assert_eq!(result.confidence("cat"), Some(67));
//! # Ok(())
//! # }
//! ```
//!
//! # Live prediction
//!
//! [`ClassifierController`] ties a [`FeatureExtractor`] (for instance
//! [`OnnxExtractor`]) to a [`Camera`] and runs the
//! `Idle -> Loading -> Training -> Ready -> Predicting` lifecycle. Trained
//! stores travel as [`DatasetDocument`]s, which a [`ModelRepository`] can
//! keep.

pub mod capture;
pub mod classifier;
pub mod controller;
pub mod model_manager;
pub mod models;
pub mod repository;
mod runtime;

pub use capture::{Camera, CaptureSession, DirectoryCamera, FrameSink, NullSink};
pub use classifier::{
    ClassEntry, ClassSet, ClassifierError, DatasetDocument, FeatureExtractor, FeatureVector, Frame,
    LabeledFeatureStore, Normalization, OnnxExtractor, Prediction, PredictionResult, SampleImage,
};
pub use controller::{ClassifierController, ControllerConfig, SessionState};
pub use model_manager::{ModelError, ModelManager};
pub use models::{BuiltinModel, ModelCharacteristics, ModelInfo};
pub use repository::{LocalModelRepository, ModelRepository, ModelSummary, SavedModel};
pub use runtime::RuntimeConfig;

pub fn init_logger() {
    env_logger::init();
}

use crate::classifier::Normalization;

/// Represents the available built-in embedding models
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BuiltinModel {
    /// MobileNet v2 (ONNX model zoo, opset 12)
    ///
    /// Characteristics:
    /// - Feature size: 1000
    /// - Input: 224x224 RGB, ImageNet normalisation
    /// - Size: ~14MB
    /// - Small enough to embed one frame per second on a laptop CPU
    MobileNetV2,
}

/// Characteristics of a model including its capabilities and requirements
#[derive(Debug, Clone, PartialEq)]
pub struct ModelCharacteristics {
    /// Length of the feature vectors produced by the model
    pub feature_dim: usize,
    /// Side length of the square input image
    pub input_size: u32,
    /// Pixel normalisation expected by the model
    pub normalization: Normalization,
    /// Approximate size of the model on disk
    pub model_size_mb: usize,
}

/// Where to fetch a model from and how to verify it
#[derive(Debug, Clone, PartialEq)]
pub struct ModelInfo {
    pub name: String,
    pub model_url: String,
    /// SHA-256 of the model file, hex encoded. Files are only verified when set.
    pub model_hash: Option<String>,
}

impl BuiltinModel {
    pub fn characteristics(&self) -> ModelCharacteristics {
        match self {
            Self::MobileNetV2 => ModelCharacteristics {
                feature_dim: 1000,
                input_size: 224,
                normalization: Normalization::IMAGENET,
                model_size_mb: 14,
            },
        }
    }

    pub fn get_model_info(&self) -> ModelInfo {
        match self {
            Self::MobileNetV2 => ModelInfo {
                name: "mobilenetv2-12".to_string(),
                model_url: "https://github.com/onnx/models/raw/main/validated/vision/classification/mobilenet/model/mobilenetv2-12.onnx".to_string(),
                model_hash: None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_model_characteristics() {
        let model = BuiltinModel::MobileNetV2;
        let info = model.get_model_info();
        assert!(info.model_url.ends_with(".onnx"));
        assert_eq!(model.characteristics().feature_dim, 1000);
        assert_eq!(model.characteristics().input_size, 224);
    }
}

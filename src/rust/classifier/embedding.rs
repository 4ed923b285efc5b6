use std::future::Future;

use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::{Array1, Array4};

use super::error::ClassifierError;

/// A decoded RGB image or video frame.
pub type Frame = RgbImage;

/// One embedding produced by a [`FeatureExtractor`].
pub type FeatureVector = Array1<f32>;

/// A frozen, pretrained image embedding model.
///
/// Implementations are loaded once and then used read-only by both the
/// training and the prediction path:
/// 1. `load()` fetches and initialises the model. Failures surface as
///    [`ClassifierError::ModelLoad`] and are not retried internally.
/// 2. `extract()` turns a decoded frame into a vector of exactly `dim()`
///    values. It must not hold on to the frame after returning, and every
///    intermediate tensor it allocates is dropped before it returns, on the
///    success path and on the error path alike.
///
/// Frames with a zero width or height (a camera that has not produced any
/// pixels yet) are rejected with [`ClassifierError::Extraction`].
pub trait FeatureExtractor: Send + Sync + 'static {
    /// Fetches and initialises the model. Calling it again after a
    /// successful load is a cheap no-op.
    fn load(&self) -> impl Future<Output = Result<(), ClassifierError>> + Send;

    /// Returns true once `load()` has completed successfully
    fn is_loaded(&self) -> bool;

    /// Length of every vector returned by `extract()`
    fn dim(&self) -> usize;

    /// Embeds a single frame
    fn extract(&self, frame: &Frame) -> Result<FeatureVector, ClassifierError>;
}

/// Rejects frames that carry no pixels.
pub fn ensure_frame(frame: &Frame) -> Result<(), ClassifierError> {
    if frame.width() == 0 || frame.height() == 0 {
        return Err(ClassifierError::Extraction(format!(
            "Frame has no pixels ({}x{}); the video source is not producing frames yet",
            frame.width(),
            frame.height()
        )));
    }
    Ok(())
}

/// Per-channel normalisation applied after scaling pixels to `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Normalization {
    pub mean: [f32; 3],
    pub std: [f32; 3],
}

impl Normalization {
    /// ImageNet statistics used by torchvision-exported models
    pub const IMAGENET: Normalization = Normalization {
        mean: [0.485, 0.456, 0.406],
        std: [0.229, 0.224, 0.225],
    };
}

/// Resizes a frame to `size`x`size` and lays it out as a `[1, 3, size, size]`
/// NCHW tensor.
pub(crate) fn frame_to_tensor(
    frame: &Frame,
    size: u32,
    norm: Normalization,
) -> Result<Array4<f32>, ClassifierError> {
    ensure_frame(frame)?;

    let resized = if frame.width() == size && frame.height() == size {
        None
    } else {
        Some(imageops::resize(frame, size, size, FilterType::Triangle))
    };
    let pixels = resized.as_ref().unwrap_or(frame);

    let side = size as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, side, side));
    for (x, y, pixel) in pixels.enumerate_pixels() {
        for c in 0..3 {
            let value = pixel[c] as f32 / 255.0;
            tensor[[0, c, y as usize, x as usize]] = (value - norm.mean[c]) / norm.std[c];
        }
    }
    Ok(tensor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_empty_frame_is_rejected() {
        let frame = Frame::new(0, 0);
        assert!(matches!(ensure_frame(&frame), Err(ClassifierError::Extraction(_))));

        let frame = Frame::new(10, 0);
        assert!(matches!(
            frame_to_tensor(&frame, 4, Normalization::IMAGENET),
            Err(ClassifierError::Extraction(_))
        ));
    }

    #[test]
    fn test_tensor_layout_and_scaling() {
        let frame = Frame::from_pixel(2, 2, Rgb([255, 0, 51]));
        let identity = Normalization { mean: [0.0; 3], std: [1.0; 3] };
        let tensor = frame_to_tensor(&frame, 2, identity).unwrap();

        assert_eq!(tensor.shape(), &[1, 3, 2, 2]);
        assert!((tensor[[0, 0, 1, 1]] - 1.0).abs() < 1e-6);
        assert!(tensor[[0, 1, 0, 0]].abs() < 1e-6);
        assert!((tensor[[0, 2, 0, 1]] - 0.2).abs() < 1e-6);
    }

    #[test]
    fn test_frames_are_resized() {
        let frame = Frame::from_pixel(7, 3, Rgb([10, 20, 30]));
        let tensor = frame_to_tensor(&frame, 4, Normalization::IMAGENET).unwrap();
        assert_eq!(tensor.shape(), &[1, 3, 4, 4]);
    }
}

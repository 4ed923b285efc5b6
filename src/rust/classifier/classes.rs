use std::io::Cursor;
use std::path::Path;

use image::imageops::{self, FilterType};
use image::ImageFormat;

use super::embedding::Frame;
use super::error::ClassifierError;

/// Side length of images captured from a camera for training
pub const SAMPLE_SIZE: u32 = 224;

/// An encoded (PNG, JPEG) example image kept for display and re-training.
#[derive(Clone, PartialEq, Eq)]
pub struct SampleImage {
    bytes: Vec<u8>,
}

impl std::fmt::Debug for SampleImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SampleImage").field("bytes", &self.bytes.len()).finish()
    }
}

impl SampleImage {
    /// Wraps already encoded image bytes
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    /// Reads an uploaded image file
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ClassifierError> {
        Ok(Self::from_bytes(std::fs::read(path)?))
    }

    /// Scales a captured frame down to a square sample and stores it as PNG
    pub fn from_frame(frame: &Frame) -> Result<Self, ClassifierError> {
        super::embedding::ensure_frame(frame)?;
        let scaled = imageops::resize(frame, SAMPLE_SIZE, SAMPLE_SIZE, FilterType::Triangle);
        let mut bytes = Vec::new();
        scaled.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)?;
        Ok(Self { bytes })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Decodes the image into an RGB frame
    pub fn decode(&self) -> Result<Frame, ClassifierError> {
        Ok(image::load_from_memory(&self.bytes)?.to_rgb8())
    }
}

/// A user-defined category and its example images.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassEntry {
    name: String,
    images: Vec<SampleImage>,
}

impl ClassEntry {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn images(&self) -> &[SampleImage] {
        &self.images
    }

    pub fn count(&self) -> usize {
        self.images.len()
    }
}

/// The classes being taught, in the order they were created.
///
/// Class names are unique at all times. Deleting a class drops its images.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClassSet {
    classes: Vec<ClassEntry>,
}

impl ClassSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts with two empty classes, "Class 1" and "Class 2"
    pub fn with_default_classes() -> Self {
        let mut set = Self::new();
        set.classes.push(ClassEntry { name: "Class 1".into(), images: Vec::new() });
        set.classes.push(ClassEntry { name: "Class 2".into(), images: Vec::new() });
        set
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ClassEntry> {
        self.classes.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.classes.iter().map(|c| c.name.as_str())
    }

    pub fn get(&self, name: &str) -> Option<&ClassEntry> {
        self.classes.iter().find(|c| c.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Total number of images over all classes
    pub fn image_count(&self) -> usize {
        self.classes.iter().map(ClassEntry::count).sum()
    }

    fn get_mut(&mut self, name: &str) -> Result<&mut ClassEntry, ClassifierError> {
        self.classes.iter_mut()
            .find(|c| c.name == name)
            .ok_or_else(|| ClassifierError::UnknownClass(name.to_string()))
    }

    fn validate_name(&self, name: &str) -> Result<(), ClassifierError> {
        if name.trim().is_empty() {
            return Err(ClassifierError::Validation("Class name cannot be empty".into()));
        }
        if self.contains(name) {
            return Err(ClassifierError::DuplicateName(name.to_string()));
        }
        Ok(())
    }

    pub fn add_class(&mut self, name: &str) -> Result<(), ClassifierError> {
        self.validate_name(name)?;
        self.classes.push(ClassEntry { name: name.to_string(), images: Vec::new() });
        Ok(())
    }

    pub fn rename_class(&mut self, old: &str, new: &str) -> Result<(), ClassifierError> {
        if old == new {
            return self.get_mut(old).map(|_| ());
        }
        self.validate_name(new)?;
        self.get_mut(old)?.name = new.to_string();
        Ok(())
    }

    /// Removes a class together with all of its images
    pub fn delete_class(&mut self, name: &str) -> Result<ClassEntry, ClassifierError> {
        let pos = self.classes.iter()
            .position(|c| c.name == name)
            .ok_or_else(|| ClassifierError::UnknownClass(name.to_string()))?;
        Ok(self.classes.remove(pos))
    }

    pub fn add_image(&mut self, name: &str, image: SampleImage) -> Result<(), ClassifierError> {
        self.get_mut(name)?.images.push(image);
        Ok(())
    }

    pub fn remove_image(&mut self, name: &str, index: usize) -> Result<SampleImage, ClassifierError> {
        let class = self.get_mut(name)?;
        if index >= class.images.len() {
            return Err(ClassifierError::Index {
                label: name.to_string(),
                index,
                len: class.images.len(),
            });
        }
        Ok(class.images.remove(index))
    }

    /// Checks that the set can be trained: at least two classes, each with an image
    pub fn validate_for_training(&self) -> Result<(), ClassifierError> {
        if self.classes.len() < 2 {
            return Err(ClassifierError::Validation(format!(
                "At least two classes are required for training, found {}",
                self.classes.len()
            )));
        }
        if let Some(empty) = self.classes.iter().find(|c| c.images.is_empty()) {
            return Err(ClassifierError::Validation(format!(
                "Class '{}' has no images; every class needs at least one",
                empty.name
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn sample(shade: u8) -> SampleImage {
        SampleImage::from_frame(&Frame::from_pixel(8, 8, Rgb([shade, shade, shade]))).unwrap()
    }

    #[test]
    fn test_default_classes() {
        let set = ClassSet::with_default_classes();
        assert_eq!(set.names().collect::<Vec<_>>(), vec!["Class 1", "Class 2"]);
        assert_eq!(set.image_count(), 0);
    }

    #[test]
    fn test_names_stay_unique() {
        let mut set = ClassSet::new();
        set.add_class("cat").unwrap();
        set.add_class("dog").unwrap();

        assert!(matches!(set.add_class("cat"), Err(ClassifierError::DuplicateName(_))));
        assert!(matches!(set.rename_class("dog", "cat"), Err(ClassifierError::DuplicateName(_))));
        assert!(matches!(set.add_class("  "), Err(ClassifierError::Validation(_))));
        assert!(matches!(set.rename_class("fish", "eel"), Err(ClassifierError::UnknownClass(_))));

        set.rename_class("dog", "wolf").unwrap();
        set.rename_class("cat", "cat").unwrap();
        assert_eq!(set.names().collect::<Vec<_>>(), vec!["cat", "wolf"]);
    }

    #[test]
    fn test_delete_cascades_to_images() {
        let mut set = ClassSet::new();
        set.add_class("cat").unwrap();
        set.add_image("cat", sample(10)).unwrap();
        set.add_image("cat", sample(20)).unwrap();

        let removed = set.delete_class("cat").unwrap();
        assert_eq!(removed.count(), 2);
        assert_eq!(set.image_count(), 0);
        assert!(matches!(set.add_image("cat", sample(30)), Err(ClassifierError::UnknownClass(_))));
    }

    #[test]
    fn test_remove_image_by_index() {
        let mut set = ClassSet::new();
        set.add_class("cat").unwrap();
        set.add_image("cat", sample(10)).unwrap();
        set.add_image("cat", sample(20)).unwrap();

        let removed = set.remove_image("cat", 0).unwrap();
        assert_eq!(removed, sample(10));
        assert_eq!(set.get("cat").unwrap().images(), &[sample(20)]);
        assert!(matches!(set.remove_image("cat", 1), Err(ClassifierError::Index { index: 1, len: 1, .. })));
    }

    #[test]
    fn test_training_preconditions() {
        let mut set = ClassSet::new();
        set.add_class("cat").unwrap();
        set.add_image("cat", sample(10)).unwrap();
        assert!(matches!(set.validate_for_training(), Err(ClassifierError::Validation(_))));

        set.add_class("dog").unwrap();
        assert!(matches!(set.validate_for_training(), Err(ClassifierError::Validation(_))));

        set.add_image("dog", sample(200)).unwrap();
        assert!(set.validate_for_training().is_ok());
    }

    #[test]
    fn test_captured_sample_is_square_png() {
        let image = SampleImage::from_frame(&Frame::from_pixel(64, 48, Rgb([1, 2, 3]))).unwrap();
        assert_eq!(image::guess_format(image.as_bytes()).unwrap(), ImageFormat::Png);
        let decoded = image.decode().unwrap();
        assert_eq!(decoded.dimensions(), (SAMPLE_SIZE, SAMPLE_SIZE));

        assert!(matches!(SampleImage::from_frame(&Frame::new(0, 0)), Err(ClassifierError::Extraction(_))));
        assert!(SampleImage::from_bytes(vec![1, 2, 3]).decode().is_err());
    }
}

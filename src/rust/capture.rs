//! Camera access for harvesting training images and feeding live prediction.
//!
//! A [`Camera`] is a device handle that must be opened before frames can be
//! read and closed when done. [`CaptureSession`] pairs one camera with an
//! optional [`FrameSink`] (a preview, a recorder) and guarantees the device
//! is released on every exit path, including drop.

use std::fs;
use std::path::{Path, PathBuf};

use crate::classifier::{ClassifierError, Frame, SampleImage};

/// A video device that delivers frames while open.
pub trait Camera: Send + 'static {
    /// Acquires the device. Fails with [`ClassifierError::Device`] when no
    /// device is present or access is denied.
    fn open(&mut self) -> Result<(), ClassifierError>;

    /// Reads the next frame from an open device
    fn read_frame(&mut self) -> Result<Frame, ClassifierError>;

    /// Releases the device. Must tolerate being called when already closed.
    fn close(&mut self);
}

/// Receives every frame a [`CaptureSession`] captures.
pub trait FrameSink: Send {
    fn show(&mut self, frame: &Frame);

    /// Called once when the session stops
    fn detach(&mut self) {}
}

/// A sink that discards frames, for headless use.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl FrameSink for NullSink {
    fn show(&mut self, _frame: &Frame) {}
}

impl<F> FrameSink for F
where
    F: FnMut(&Frame) + Send,
{
    fn show(&mut self, frame: &Frame) {
        self(frame)
    }
}

/// One camera, at most one active stream.
pub struct CaptureSession<C: Camera> {
    camera: C,
    sink: Option<Box<dyn FrameSink>>,
    active: bool,
}

impl<C: Camera> CaptureSession<C> {
    pub fn new(camera: C) -> Self {
        Self { camera, sink: None, active: false }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn camera(&self) -> &C {
        &self.camera
    }

    /// Opens the camera and attaches `sink` to the stream.
    ///
    /// Starting a session that is already active is a no-op and `sink` is
    /// dropped. If the device cannot be opened the session is stopped before
    /// the error is returned.
    pub fn start<S: FrameSink + 'static>(&mut self, sink: S) -> Result<(), ClassifierError> {
        if self.active {
            log::debug!("Capture session already active, ignoring start");
            return Ok(());
        }

        if let Err(e) = self.camera.open() {
            log::error!("Failed to access camera: {}", e);
            self.stop();
            return Err(e);
        }

        self.sink = Some(Box::new(sink));
        self.active = true;
        log::info!("Camera stream started");
        Ok(())
    }

    /// Grabs one frame and hands it to the sink
    pub fn capture(&mut self) -> Result<Frame, ClassifierError> {
        if !self.active {
            return Err(ClassifierError::Device("Capture session is not started".into()));
        }
        let frame = self.camera.read_frame()?;
        if let Some(sink) = self.sink.as_mut() {
            sink.show(&frame);
        }
        Ok(frame)
    }

    /// Captures a frame and keeps it as a training sample
    pub fn snapshot(&mut self) -> Result<SampleImage, ClassifierError> {
        let frame = self.capture()?;
        SampleImage::from_frame(&frame)
    }

    /// Releases the camera and detaches the sink. Safe to call repeatedly.
    pub fn stop(&mut self) {
        if let Some(mut sink) = self.sink.take() {
            sink.detach();
        }
        self.camera.close();
        if self.active {
            self.active = false;
            log::info!("Camera stream stopped");
        }
    }
}

impl<C: Camera> Drop for CaptureSession<C> {
    fn drop(&mut self) {
        self.stop();
    }
}

fn is_image(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()).map(|e| e.to_ascii_lowercase()).as_deref(),
        Some("png" | "jpg" | "jpeg")
    )
}

/// Replays the images of a directory, in file name order, as a looping video feed.
#[derive(Debug, Clone)]
pub struct DirectoryCamera {
    dir: PathBuf,
    files: Vec<PathBuf>,
    next: usize,
}

impl DirectoryCamera {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into(), files: Vec::new(), next: 0 }
    }

    pub fn is_open(&self) -> bool {
        !self.files.is_empty()
    }
}

impl Camera for DirectoryCamera {
    fn open(&mut self) -> Result<(), ClassifierError> {
        let entries = fs::read_dir(&self.dir)
            .map_err(|e| ClassifierError::Device(format!("Cannot open {}: {}", self.dir.display(), e)))?;

        let mut files: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.is_file() && is_image(path))
            .collect();
        files.sort();

        if files.is_empty() {
            return Err(ClassifierError::Device(format!("No images found in {}", self.dir.display())));
        }
        log::info!("Replaying {} images from {}", files.len(), self.dir.display());
        self.files = files;
        self.next = 0;
        Ok(())
    }

    fn read_frame(&mut self) -> Result<Frame, ClassifierError> {
        if self.files.is_empty() {
            return Err(ClassifierError::Device("Camera is not open".into()));
        }
        let path = &self.files[self.next % self.files.len()];
        self.next = (self.next + 1) % self.files.len();
        Ok(image::open(path)?.to_rgb8())
    }

    fn close(&mut self) {
        self.files.clear();
        self.next = 0;
    }
}

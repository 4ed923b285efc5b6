#![allow(dead_code)]

use std::io::Cursor;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use env_logger::{Builder, Env};
use exemplar::{Camera, ClassSet, ClassifierError, FeatureExtractor, FeatureVector, Frame, SampleImage};
use image::{ImageFormat, Rgb};
use ndarray::array;

pub fn init() {
    let _ = Builder::from_env(Env::default().default_filter_or("warn"))
        .is_test(true)
        .try_init();
}

pub fn solid(r: u8, g: u8, b: u8) -> Frame {
    Frame::from_pixel(8, 8, Rgb([r, g, b]))
}

/// A PNG sample of a single colour
pub fn sample(r: u8, g: u8, b: u8) -> SampleImage {
    let mut bytes = Vec::new();
    solid(r, g, b)
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .unwrap();
    SampleImage::from_bytes(bytes)
}

pub const RED: (u8, u8, u8) = (250, 0, 0);
pub const GREEN: (u8, u8, u8) = (0, 250, 0);
/// Frames with a full blue channel fail extraction
pub const POISON: (u8, u8, u8) = (0, 0, 255);

pub fn frame(colour: (u8, u8, u8)) -> Frame {
    solid(colour.0, colour.1, colour.2)
}

/// Two cat images (reddish) and one dog image (green).
pub fn pets() -> ClassSet {
    let mut classes = ClassSet::new();
    classes.add_class("cat").unwrap();
    classes.add_class("dog").unwrap();
    classes.add_image("cat", sample(250, 0, 0)).unwrap();
    classes.add_image("cat", sample(240, 20, 0)).unwrap();
    classes.add_image("dog", sample(0, 250, 0)).unwrap();
    classes
}

/// Blocks extraction until the test lets it continue.
pub struct Gate {
    entered: Mutex<mpsc::Sender<()>>,
    release: Mutex<mpsc::Receiver<()>>,
}

pub struct GateHandle {
    pub entered: mpsc::Receiver<()>,
    pub release: mpsc::Sender<()>,
}

pub fn gate() -> (Gate, GateHandle) {
    let (entered_tx, entered_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel();
    (
        Gate { entered: Mutex::new(entered_tx), release: Mutex::new(release_rx) },
        GateHandle { entered: entered_rx, release: release_tx },
    )
}

/// Deterministic two-dimensional extractor: `[red / 100, green / 100]` of the
/// top-left pixel.
#[derive(Default)]
pub struct StubExtractor {
    loaded: AtomicBool,
    failing_loads: AtomicUsize,
    pub load_calls: AtomicUsize,
    pub extract_calls: AtomicUsize,
    gate: Option<Gate>,
}

impl StubExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `n` calls to `load` fail
    pub fn failing_loads(n: usize) -> Self {
        Self { failing_loads: AtomicUsize::new(n), ..Self::default() }
    }

    pub fn gated(gate: Gate) -> Self {
        Self { gate: Some(gate), ..Self::default() }
    }
}

impl FeatureExtractor for StubExtractor {
    async fn load(&self) -> Result<(), ClassifierError> {
        self.load_calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failing_loads.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_loads.store(remaining - 1, Ordering::SeqCst);
            return Err(ClassifierError::ModelLoad("stub model unavailable".into()));
        }
        tokio::task::yield_now().await;
        self.loaded.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::SeqCst)
    }

    fn dim(&self) -> usize {
        2
    }

    fn extract(&self, frame: &Frame) -> Result<FeatureVector, ClassifierError> {
        exemplar::classifier::ensure_frame(frame)?;
        if !self.is_loaded() {
            return Err(ClassifierError::ModelLoad("stub model not loaded".into()));
        }
        self.extract_calls.fetch_add(1, Ordering::SeqCst);

        if let Some(gate) = &self.gate {
            let _ = gate.entered.lock().unwrap().send(());
            let _ = gate.release.lock().unwrap().recv_timeout(Duration::from_secs(5));
        }

        let Rgb([r, g, b]) = *frame.get_pixel(0, 0);
        if b == 255 {
            return Err(ClassifierError::Extraction("unreadable frame".into()));
        }
        Ok(array![r as f32 / 100.0, g as f32 / 100.0])
    }
}

/// Plays a fixed list of frames in a loop, optionally failing after a number of reads.
pub struct SequenceCamera {
    frames: Vec<Frame>,
    next: usize,
    reads: usize,
    fail_after: Option<usize>,
    deny: bool,
    pub open: Arc<AtomicBool>,
}

impl SequenceCamera {
    pub fn new(frames: Vec<Frame>) -> Self {
        Self {
            frames,
            next: 0,
            reads: 0,
            fail_after: None,
            deny: false,
            open: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn of(colour: (u8, u8, u8)) -> Self {
        Self::new(vec![frame(colour)])
    }

    /// Reads past the first `n` fail as if the device was unplugged
    pub fn failing_after(mut self, n: usize) -> Self {
        self.fail_after = Some(n);
        self
    }

    /// Opening the camera fails as if permission was denied
    pub fn denied(mut self) -> Self {
        self.deny = true;
        self
    }

    pub fn open_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.open)
    }
}

impl Camera for SequenceCamera {
    fn open(&mut self) -> Result<(), ClassifierError> {
        if self.deny {
            return Err(ClassifierError::Device("camera permission denied".into()));
        }
        self.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn read_frame(&mut self) -> Result<Frame, ClassifierError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(ClassifierError::Device("camera is closed".into()));
        }
        if self.fail_after.is_some_and(|n| self.reads >= n) {
            return Err(ClassifierError::Device("camera unplugged".into()));
        }
        self.reads += 1;
        let frame = self.frames[self.next % self.frames.len()].clone();
        self.next += 1;
        Ok(frame)
    }

    fn close(&mut self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

/// Polls `condition` until it holds or a second has passed
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

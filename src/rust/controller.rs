//! Training and prediction lifecycle.
//!
//! [`ClassifierController`] owns the class set, the feature store, the
//! extractor and the camera, and moves through
//! `Idle -> Loading -> Training -> Ready -> Predicting -> Ready`. Only one of
//! training and prediction can be active at a time; the state machine, not a
//! lock, is what keeps the store single-writer.

use std::env;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::capture::{Camera, CaptureSession, FrameSink};
use crate::classifier::{
    ClassSet, ClassifierError, DatasetDocument, FeatureExtractor, FeatureVector, LabeledFeatureStore,
    PredictionResult, SampleImage, DEFAULT_K,
};

/// Where the controller is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Loading,
    Training,
    Ready,
    Predicting,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Loading => "loading",
            Self::Training => "training",
            Self::Ready => "ready",
            Self::Predicting => "predicting",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ControllerConfig {
    /// Neighbours consulted per prediction
    pub k: usize,
    /// Time between prediction ticks
    pub tick_interval: Duration,
    /// Length of the extractor's feature vectors
    pub feature_dim: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            k: DEFAULT_K,
            tick_interval: Duration::from_secs(1),
            feature_dim: 1000,
        }
    }
}

impl ControllerConfig {
    /// Defaults overridden by `EXEMPLAR_K`, `EXEMPLAR_TICK_MS` and `EXEMPLAR_FEATURE_DIM`
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let parse = |name: &str| env::var(name).ok().and_then(|s| s.parse::<u64>().ok());
        Self {
            k: parse("EXEMPLAR_K").map_or(defaults.k, |k| k as usize),
            tick_interval: parse("EXEMPLAR_TICK_MS").map_or(defaults.tick_interval, Duration::from_millis),
            feature_dim: parse("EXEMPLAR_FEATURE_DIM").map_or(defaults.feature_dim, |d| d as usize),
        }
    }

    pub fn with_k(mut self, k: usize) -> Self {
        self.k = k;
        self
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    pub fn with_feature_dim(mut self, dim: usize) -> Self {
        self.feature_dim = dim;
        self
    }

    fn validate(&self) -> Result<(), ClassifierError> {
        if self.k == 0 {
            return Err(ClassifierError::Validation("k must be at least 1".into()));
        }
        if self.feature_dim == 0 {
            return Err(ClassifierError::Validation("Feature dimensionality must be positive".into()));
        }
        if self.tick_interval.is_zero() {
            return Err(ClassifierError::Validation("Tick interval must be positive".into()));
        }
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

/// State shared with the prediction task.
///
/// `generation` changes every time prediction starts or stops; a tick only
/// publishes when the generation it was started under is still current.
#[derive(Debug)]
struct Lifecycle {
    state: Mutex<SessionState>,
    generation: AtomicU64,
}

impl Lifecycle {
    fn get(&self) -> SessionState {
        *lock(&self.state)
    }

    fn set(&self, next: SessionState) {
        let mut state = lock(&self.state);
        if *state != next {
            log::info!("Session state: {} -> {}", *state, next);
            *state = next;
        }
    }
}

/// Puts the lifecycle back to `fallback` unless disarmed, so a training run
/// that fails or is cancelled never leaves the controller in `Loading` or `Training`.
struct StateGuard<'a> {
    lifecycle: &'a Lifecycle,
    fallback: SessionState,
    armed: bool,
}

impl<'a> StateGuard<'a> {
    fn new(lifecycle: &'a Lifecycle, fallback: SessionState) -> Self {
        Self { lifecycle, fallback, armed: true }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for StateGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.lifecycle.set(self.fallback);
        }
    }
}

/// Everything one prediction tick needs, cloned into the background task.
struct TickContext<E: FeatureExtractor, C: Camera> {
    extractor: Arc<E>,
    extraction: Arc<AsyncMutex<()>>,
    store: Arc<RwLock<LabeledFeatureStore>>,
    capture: Arc<Mutex<CaptureSession<C>>>,
    lifecycle: Arc<Lifecycle>,
    predictions: Arc<watch::Sender<Option<PredictionResult>>>,
    generation: u64,
}

impl<E: FeatureExtractor, C: Camera> TickContext<E, C> {
    fn is_current(&self, state: SessionState) -> bool {
        state == SessionState::Predicting && self.lifecycle.generation.load(Ordering::SeqCst) == self.generation
    }

    async fn tick(&self) -> Result<PredictionResult, ClassifierError> {
        let frame = {
            let mut session = lock(&self.capture);
            session.capture()
        }?;

        let features = extract_blocking(Arc::clone(&self.extractor), &self.extraction, move |extractor| {
            extractor.extract(&frame)
        })
        .await?;

        let result = read(&self.store).query(&features)?;
        Ok(result)
    }

    /// Publishes under the state lock so nothing lands after `stop_predict` returns.
    fn publish(&self, result: PredictionResult) {
        let state = lock(&self.lifecycle.state);
        if self.is_current(*state) {
            log::debug!("Prediction: {:?}", result.top());
            self.predictions.send_replace(Some(result));
        } else {
            log::debug!("Discarding prediction from a stopped session");
        }
    }

    /// Leaves `Predicting` after the camera failed. A tick from a session
    /// that was already stopped leaves the camera and state alone.
    fn abandon(&self) {
        let mut state = lock(&self.lifecycle.state);
        if !self.is_current(*state) {
            log::debug!("Camera failure from a stopped session, ignoring");
            return;
        }
        log::info!("Session state: {} -> {}", *state, SessionState::Ready);
        *state = SessionState::Ready;
        self.lifecycle.generation.fetch_add(1, Ordering::SeqCst);
        lock(&self.capture).stop();
    }

    async fn run(self, period: Duration) {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            interval.tick().await;
            if !self.is_current(self.lifecycle.get()) {
                break;
            }

            match self.tick().await {
                Ok(result) => self.publish(result),
                Err(ClassifierError::Device(msg)) => {
                    log::error!("Camera failed during prediction, stopping: {}", msg);
                    self.abandon();
                    break;
                }
                Err(e) => log::warn!("Skipping prediction tick: {}", e),
            }
        }
    }
}

/// Runs a feature extraction on the blocking pool, one at a time.
///
/// The `extraction` permit moves into the blocking job and is released only
/// when the job returns, so an extraction orphaned by an aborted tick still
/// holds off the next one.
async fn extract_blocking<E, F>(
    extractor: Arc<E>,
    extraction: &Arc<AsyncMutex<()>>,
    job: F,
) -> Result<FeatureVector, ClassifierError>
where
    E: FeatureExtractor,
    F: FnOnce(&E) -> Result<FeatureVector, ClassifierError> + Send + 'static,
{
    let permit = Arc::clone(extraction).lock_owned().await;
    tokio::task::spawn_blocking(move || {
        let _permit = permit;
        job(&extractor)
    })
    .await
    .map_err(|e| ClassifierError::Extraction(format!("Extraction task failed: {}", e)))?
}

/// Coordinates model loading, training over a [`ClassSet`] and periodic
/// prediction from a camera.
///
/// ```no_run
/// # async fn demo() -> Result<(), exemplar::ClassifierError> {
/// use exemplar::{BuiltinModel, ClassifierController, ControllerConfig, DirectoryCamera, NullSink, OnnxExtractor, SampleImage};
///
/// let extractor = OnnxExtractor::builtin(BuiltinModel::MobileNetV2)?;
/// let mut controller = ClassifierController::new(extractor, DirectoryCamera::new("feed"), ControllerConfig::default())?;
///
/// controller.classes_mut().add_class("cat")?;
/// controller.classes_mut().add_class("dog")?;
/// controller.classes_mut().add_image("cat", SampleImage::from_path("cat.jpg")?)?;
/// controller.classes_mut().add_image("dog", SampleImage::from_path("dog.jpg")?)?;
/// controller.train().await?;
///
/// let mut predictions = controller.subscribe();
/// controller.predict(NullSink).await?;
/// predictions.changed().await.ok();
/// println!("{:?}", predictions.borrow().as_ref().and_then(|p| p.top().cloned()));
/// controller.stop_predict();
/// # Ok(())
/// # }
/// ```
pub struct ClassifierController<E: FeatureExtractor, C: Camera> {
    config: ControllerConfig,
    classes: ClassSet,
    extractor: Arc<E>,
    /// Held for the duration of every extraction, training or tick
    extraction: Arc<AsyncMutex<()>>,
    store: Arc<RwLock<LabeledFeatureStore>>,
    capture: Arc<Mutex<CaptureSession<C>>>,
    lifecycle: Arc<Lifecycle>,
    predictions: Arc<watch::Sender<Option<PredictionResult>>>,
    ticker: Option<JoinHandle<()>>,
}

impl<E: FeatureExtractor, C: Camera> ClassifierController<E, C> {
    pub fn new(extractor: E, camera: C, config: ControllerConfig) -> Result<Self, ClassifierError> {
        config.validate()?;
        let store = LabeledFeatureStore::new(config.feature_dim).with_k(config.k);
        let (predictions, _) = watch::channel(None);

        Ok(Self {
            config,
            classes: ClassSet::new(),
            extractor: Arc::new(extractor),
            extraction: Arc::new(AsyncMutex::new(())),
            store: Arc::new(RwLock::new(store)),
            capture: Arc::new(Mutex::new(CaptureSession::new(camera))),
            lifecycle: Arc::new(Lifecycle {
                state: Mutex::new(SessionState::Idle),
                generation: AtomicU64::new(0),
            }),
            predictions: Arc::new(predictions),
            ticker: None,
        })
    }

    /// Replaces the class set, e.g. with [`ClassSet::with_default_classes`]
    pub fn with_classes(mut self, classes: ClassSet) -> Self {
        self.classes = classes;
        self
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        self.lifecycle.get()
    }

    pub fn classes(&self) -> &ClassSet {
        &self.classes
    }

    /// The raw images being taught. Changes take effect on the next `train()`.
    pub fn classes_mut(&mut self) -> &mut ClassSet {
        &mut self.classes
    }

    pub fn extractor(&self) -> &E {
        &self.extractor
    }

    /// True when the feature store holds at least one example
    pub fn is_queryable(&self) -> bool {
        read(&self.store).is_queryable()
    }

    /// A copy of the current feature store
    pub fn store_snapshot(&self) -> LabeledFeatureStore {
        read(&self.store).clone()
    }

    /// Receives every published [`PredictionResult`]
    pub fn subscribe(&self) -> watch::Receiver<Option<PredictionResult>> {
        self.predictions.subscribe()
    }

    pub fn latest_prediction(&self) -> Option<PredictionResult> {
        self.predictions.borrow().clone()
    }

    /// Loads the extractor and rebuilds the feature store from every image in the class set.
    ///
    /// Requires at least two classes, each with at least one image; otherwise
    /// fails with [`ClassifierError::Validation`] and leaves the state alone.
    /// Training is all-or-nothing: on any failure the previous store and
    /// state are kept.
    pub async fn train(&mut self) -> Result<(), ClassifierError> {
        let previous = self.state();
        if !matches!(previous, SessionState::Idle | SessionState::Ready) {
            return Err(ClassifierError::Validation(format!("Cannot train while {}", previous)));
        }
        self.classes.validate_for_training()?;

        let guard = StateGuard::new(&self.lifecycle, previous);
        self.lifecycle.set(SessionState::Loading);
        if let Err(e) = self.extractor.load().await {
            log::error!("Failed to load embedding model: {}", e);
            return Err(e);
        }
        if self.extractor.dim() != self.config.feature_dim {
            return Err(ClassifierError::ModelLoad(format!(
                "Extractor produces {} features, controller expects {}",
                self.extractor.dim(),
                self.config.feature_dim
            )));
        }

        self.lifecycle.set(SessionState::Training);
        log::info!("Training on {} images across {} classes", self.classes.image_count(), self.classes.len());

        let mut fresh = LabeledFeatureStore::new(self.config.feature_dim).with_k(self.config.k);
        for class in self.classes.iter() {
            fresh.ensure_label(class.name());
            for (index, image) in class.images().iter().enumerate() {
                let image: SampleImage = image.clone();
                let features = extract_blocking(Arc::clone(&self.extractor), &self.extraction, move |extractor| {
                    let frame = image.decode()?;
                    extractor.extract(&frame)
                })
                .await
                .map_err(|e| {
                    log::error!("Training failed on image {} of '{}': {}", index, class.name(), e);
                    e
                })?;
                fresh.add_example(class.name(), features)?;
            }
        }

        *write(&self.store) = fresh;
        guard.disarm();
        self.lifecycle.set(SessionState::Ready);
        log::info!("Model trained with collected images");
        Ok(())
    }

    /// Starts the camera and publishes a prediction every tick until stopped.
    ///
    /// Calling it while already predicting is a no-op.
    pub async fn predict<S: FrameSink + 'static>(&mut self, sink: S) -> Result<(), ClassifierError> {
        match self.state() {
            SessionState::Ready => {}
            SessionState::Predicting => return Ok(()),
            other => {
                return Err(ClassifierError::Validation(format!("Cannot start prediction while {}", other)));
            }
        }
        if !self.is_queryable() {
            return Err(ClassifierError::Validation("Train or import a dataset before predicting".into()));
        }

        self.extractor.load().await?;
        lock(&self.capture).start(sink)?;

        let generation = {
            let mut state = lock(&self.lifecycle.state);
            *state = SessionState::Predicting;
            self.lifecycle.generation.fetch_add(1, Ordering::SeqCst) + 1
        };
        log::info!("Session state: {} -> {}", SessionState::Ready, SessionState::Predicting);

        let context = TickContext {
            extractor: Arc::clone(&self.extractor),
            extraction: Arc::clone(&self.extraction),
            store: Arc::clone(&self.store),
            capture: Arc::clone(&self.capture),
            lifecycle: Arc::clone(&self.lifecycle),
            predictions: Arc::clone(&self.predictions),
            generation,
        };
        self.ticker = Some(tokio::spawn(context.run(self.config.tick_interval)));
        Ok(())
    }

    /// Stops the prediction loop and releases the camera. Safe to call at any time.
    ///
    /// A tick still in flight when this returns is discarded, never published.
    /// Its extraction may still be running; the next tick or training run
    /// waits for it to finish.
    pub fn stop_predict(&mut self) {
        {
            let mut state = lock(&self.lifecycle.state);
            self.lifecycle.generation.fetch_add(1, Ordering::SeqCst);
            if *state == SessionState::Predicting {
                log::info!("Session state: {} -> {}", *state, SessionState::Ready);
                *state = SessionState::Ready;
            }
        }
        if let Some(ticker) = self.ticker.take() {
            ticker.abort();
        }
        lock(&self.capture).stop();
    }

    /// Opens the camera to harvest training images
    pub fn start_camera<S: FrameSink + 'static>(&mut self, sink: S) -> Result<(), ClassifierError> {
        lock(&self.capture).start(sink)
    }

    /// Captures a frame from the open camera and adds it to `label`
    pub fn capture_sample(&mut self, label: &str) -> Result<(), ClassifierError> {
        if !self.classes.contains(label) {
            return Err(ClassifierError::UnknownClass(label.to_string()));
        }
        let sample = lock(&self.capture).snapshot()?;
        self.classes.add_image(label, sample)
    }

    /// Releases the camera, stopping prediction if it is running
    pub fn stop_camera(&mut self) {
        self.stop_predict();
    }

    /// Replaces the feature store with an imported dataset.
    ///
    /// The document is validated first; a malformed document fails with
    /// [`ClassifierError::Shape`] and changes nothing. A non-empty import
    /// makes the controller `Ready` without training.
    pub fn import_dataset(&mut self, doc: &DatasetDocument) -> Result<(), ClassifierError> {
        let state = self.state();
        if !matches!(state, SessionState::Idle | SessionState::Ready) {
            return Err(ClassifierError::Validation(format!("Cannot import while {}", state)));
        }

        let queryable = {
            let mut store = write(&self.store);
            store.import_dataset(doc)?;
            store.is_queryable()
        };
        self.lifecycle.set(if queryable { SessionState::Ready } else { SessionState::Idle });
        Ok(())
    }

    pub fn export_dataset(&self) -> DatasetDocument {
        read(&self.store).export_dataset()
    }

    /// Drops all trained examples and returns to `Idle`
    pub fn reset(&mut self) {
        self.stop_predict();
        write(&self.store).clear();
        self.predictions.send_replace(None);
        self.lifecycle.set(SessionState::Idle);
    }
}

impl<E: FeatureExtractor, C: Camera> Drop for ClassifierController<E, C> {
    fn drop(&mut self) {
        self.stop_predict();
    }
}

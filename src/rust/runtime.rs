//! ONNX Runtime environment and session settings for image embedding models.

use std::sync::{Mutex, PoisonError};
use std::thread;

use ort::session::builder::{GraphOptimizationLevel, SessionBuilder};
use ort::session::Session;
use ort::Result as OrtResult;

/// Set once the global ONNX Runtime environment has been committed.
static ENVIRONMENT: Mutex<bool> = Mutex::new(false);

/// Upper bound on the default intra-op thread count
const DEFAULT_MAX_THREADS: usize = 4;

/// How a model session is scheduled.
///
/// The default runs graph nodes sequentially, with up to four intra-op
/// threads per inference.
#[derive(Debug)]
pub struct RuntimeConfig {
    /// Threads inside one operator. 0 lets ONNX Runtime decide.
    pub intra_threads: usize,
    /// Run independent graph branches concurrently
    pub parallel_execution: bool,
    /// Threads across branches, only used with `parallel_execution`
    pub inter_threads: usize,
    pub optimization_level: GraphOptimizationLevel,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        let cores = thread::available_parallelism().map_or(1, |n| n.get());
        Self {
            intra_threads: cores.min(DEFAULT_MAX_THREADS),
            parallel_execution: false,
            inter_threads: 0,
            optimization_level: GraphOptimizationLevel::Level3,
        }
    }
}

impl RuntimeConfig {
    /// One intra-op thread, sequential execution
    pub fn single_threaded() -> Self {
        Self {
            intra_threads: 1,
            ..Self::default()
        }
    }

    pub fn with_intra_threads(mut self, threads: usize) -> Self {
        self.intra_threads = threads;
        self
    }

    pub fn with_optimization_level(mut self, level: GraphOptimizationLevel) -> Self {
        self.optimization_level = level;
        self
    }

    fn level(&self) -> GraphOptimizationLevel {
        match self.optimization_level {
            GraphOptimizationLevel::Disable => GraphOptimizationLevel::Disable,
            GraphOptimizationLevel::Level1 => GraphOptimizationLevel::Level1,
            GraphOptimizationLevel::Level2 => GraphOptimizationLevel::Level2,
            GraphOptimizationLevel::Level3 => GraphOptimizationLevel::Level3,
        }
    }
}

impl Clone for RuntimeConfig {
    fn clone(&self) -> Self {
        Self {
            intra_threads: self.intra_threads,
            parallel_execution: self.parallel_execution,
            inter_threads: self.inter_threads,
            optimization_level: self.level(),
        }
    }
}

/// Commits the global environment the first time it is called. Concurrent
/// first calls wait for each other; a failed commit is retried next time.
pub(crate) fn ensure_initialized() -> OrtResult<()> {
    let mut committed = ENVIRONMENT.lock().unwrap_or_else(PoisonError::into_inner);
    if !*committed {
        ort::init().with_name("exemplar").commit()?;
        log::debug!("ONNX Runtime environment initialised");
        *committed = true;
    }
    Ok(())
}

/// Session builder configured for one embedding model
pub(crate) fn create_session_builder(config: &RuntimeConfig) -> OrtResult<SessionBuilder> {
    ensure_initialized()?;

    let mut builder = Session::builder()?.with_optimization_level(config.level())?;
    if config.intra_threads > 0 {
        builder = builder.with_intra_threads(config.intra_threads)?;
    }
    if config.parallel_execution {
        builder = builder.with_parallel_execution(true)?;
        if config.inter_threads > 0 {
            builder = builder.with_inter_threads(config.inter_threads)?;
        }
    }
    Ok(builder)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_threads_are_bounded() {
        let config = RuntimeConfig::default();
        assert!(config.intra_threads >= 1 && config.intra_threads <= DEFAULT_MAX_THREADS);
        assert!(!config.parallel_execution);

        let single = RuntimeConfig::single_threaded().with_optimization_level(GraphOptimizationLevel::Level1);
        let copy = single.clone();
        assert_eq!(copy.intra_threads, 1);
        assert!(matches!(copy.optimization_level, GraphOptimizationLevel::Level1));
    }

    #[test]
    fn test_concurrent_initialisation() {
        let handles: Vec<_> = (0..4).map(|_| thread::spawn(ensure_initialized)).collect();
        for handle in handles {
            assert!(handle.join().unwrap().is_ok());
        }
        assert!(*ENVIRONMENT.lock().unwrap());
    }

    #[test]
    fn test_session_builder_accepts_configs() {
        assert!(create_session_builder(&RuntimeConfig::default()).is_ok());
        assert!(create_session_builder(&RuntimeConfig::single_threaded()).is_ok());

        let parallel = RuntimeConfig {
            parallel_execution: true,
            inter_threads: 2,
            ..RuntimeConfig::default()
        };
        assert!(create_session_builder(&parallel).is_ok());
    }
}

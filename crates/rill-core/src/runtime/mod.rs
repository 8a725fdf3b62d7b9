//! Execution runtime handles.
//!
//! Iterators do not own threads for per-element work; they schedule closures
//! through a [`Runner`] supplied by the host via [`Context`]. The default
//! runner is a rayon thread pool.
//!
//! A [`Context`] is cheap to clone and is passed down the iterator tree on
//! every call; operators clone it into long-lived coordination threads and
//! per-invocation closures.

use std::sync::Arc;

use crate::error::{PipelineError, Result};

/// A task accepted by a [`Runner`].
pub type Task = Box<dyn FnOnce() + Send>;

/// Schedules closures onto worker threads.
///
/// Implementations must run every accepted task exactly once, on any thread.
/// Tasks may block on pipeline-internal locks, so runners should not run
/// them inline on the submitting thread while the submitter holds locks.
pub trait Runner: Send + Sync {
    /// Schedules `task` for execution.
    fn spawn(&self, task: Task);
}

/// [`Runner`] backed by a rayon thread pool.
pub struct ThreadPoolRunner {
    pool: rayon::ThreadPool,
}

impl ThreadPoolRunner {
    /// Builds a pool with `num_threads` workers; `0` selects rayon's
    /// default (one per logical CPU).
    ///
    /// # Errors
    ///
    /// Returns `Internal` if the pool cannot be built.
    pub fn new(num_threads: usize) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .thread_name(|i| format!("rill-worker-{i}"))
            .build()
            .map_err(|e| PipelineError::internal(format!("failed to build worker pool: {e}")))?;
        Ok(Self { pool })
    }
}

impl Runner for ThreadPoolRunner {
    fn spawn(&self, task: Task) {
        self.pool.spawn(move || task());
    }
}

/// Per-call execution context handed to iterators.
#[derive(Clone)]
pub struct Context {
    runner: Arc<dyn Runner>,
}

impl Context {
    /// Creates a context around an explicit runner.
    #[must_use]
    pub fn new(runner: Arc<dyn Runner>) -> Self {
        Self { runner }
    }

    /// Creates a context with a dedicated pool of `num_threads` workers
    /// (`0` = one per logical CPU).
    ///
    /// # Errors
    ///
    /// Returns `Internal` if the pool cannot be built.
    pub fn with_threads(num_threads: usize) -> Result<Self> {
        Ok(Self::new(Arc::new(ThreadPoolRunner::new(num_threads)?)))
    }

    /// The runner backing this context.
    #[must_use]
    pub fn runner(&self) -> &dyn Runner {
        self.runner.as_ref()
    }
}

impl Default for Context {
    /// A context backed by a default-sized pool.
    ///
    /// # Panics
    ///
    /// Panics if the default pool cannot be built.
    fn default() -> Self {
        Self::with_threads(0).expect("failed to build the default worker pool")
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context").finish_non_exhaustive()
    }
}

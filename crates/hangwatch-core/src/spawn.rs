//! Where confirmation episodes run.
//!
//! Every inconclusive episode gets its own task; tasks are never shared
//! across episodes. The default spawns a named OS thread, which works from
//! any calling context. Hosts that already run tokio can hand over a
//! runtime handle and episodes go to its blocking pool instead.

use tracing::debug;

use crate::error::{Error, Result};

/// Name given to confirmation worker threads.
pub const CONFIRMATION_THREAD_NAME: &str = "hang-confirmation";

/// Work item for one episode.
pub type EpisodeTask = Box<dyn FnOnce() + Send + 'static>;

/// Runs one episode task off the caller's thread.
pub trait EpisodeSpawner: Send + Sync {
    fn spawn(&self, task: EpisodeTask) -> Result<()>;
}

/// Spawns a fresh named thread per episode.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadSpawner;

impl EpisodeSpawner for ThreadSpawner {
    fn spawn(&self, task: EpisodeTask) -> Result<()> {
        std::thread::Builder::new()
            .name(CONFIRMATION_THREAD_NAME.to_string())
            .spawn(task)
            .map(|_| ())
            .map_err(|e| Error::Runtime(format!("failed to spawn confirmation thread: {e}")))
    }
}

/// Submits each episode to a tokio runtime's blocking pool.
#[derive(Debug, Clone)]
pub struct TokioBlockingSpawner {
    handle: tokio::runtime::Handle,
}

impl TokioBlockingSpawner {
    #[must_use]
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        Self { handle }
    }

    /// Use the runtime the caller is running inside, if any.
    #[must_use]
    pub fn current() -> Option<Self> {
        tokio::runtime::Handle::try_current().ok().map(Self::new)
    }
}

impl EpisodeSpawner for TokioBlockingSpawner {
    fn spawn(&self, task: EpisodeTask) -> Result<()> {
        // Dropping the JoinHandle detaches the task.
        drop(self.handle.spawn_blocking(task));
        debug!("Confirmation episode submitted to tokio blocking pool");
        Ok(())
    }
}

/// Runs the task on the caller's thread before returning.
///
/// Only for tests and simulations: it blocks the signal entry point for the
/// whole confirmation budget.
#[derive(Debug, Clone, Copy, Default)]
pub struct InlineSpawner;

impl EpisodeSpawner for InlineSpawner {
    fn spawn(&self, task: EpisodeTask) -> Result<()> {
        task();
        Ok(())
    }
}

//! Foreground/background tracking.

use std::sync::atomic::{AtomicBool, Ordering};

/// Whether the process is currently user-visible.
pub trait ForegroundState: Send + Sync {
    fn is_foreground(&self) -> bool;
}

/// Atomic flag the host flips as its UI comes and goes.
#[derive(Debug, Default)]
pub struct ForegroundFlag {
    foreground: AtomicBool,
}

impl ForegroundFlag {
    #[must_use]
    pub fn new(foreground: bool) -> Self {
        Self {
            foreground: AtomicBool::new(foreground),
        }
    }

    pub fn set(&self, foreground: bool) {
        self.foreground.store(foreground, Ordering::SeqCst);
    }
}

impl ForegroundState for ForegroundFlag {
    fn is_foreground(&self) -> bool {
        self.foreground.load(Ordering::SeqCst)
    }
}

impl<F> ForegroundState for F
where
    F: Fn() -> bool + Send + Sync,
{
    fn is_foreground(&self) -> bool {
        self()
    }
}

//! Seam between platform hang detectors and the detection pipeline.
//!
//! A [`HangSignalSource`] decides *when* the primary thread might be stalled
//! and calls back into the pipeline through [`SignalCallbacks`]. The pipeline
//! never assumes how the source found out: a watchdog thread, a signal
//! handler, or a test harness are all valid.

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use tracing::debug;

use crate::config::TraceConfig;
use crate::dispatch::StackTraceProvider;
use crate::error::{ConfigError, Result};
use crate::trace::write_trace_file;

/// Entry points a signal source invokes.
///
/// Implementations must not panic and must return promptly; sources may call
/// them from threads with tight timing requirements.
pub trait SignalCallbacks: Send + Sync {
    /// The source believes the primary thread may be unresponsive.
    fn on_hang_detected(&self);

    /// A hang trace has been written to the configured hang trace file.
    fn on_hang_dump_trace(&self);

    /// A trace has been written to the print trace file on request.
    fn on_print_trace(&self);
}

/// Platform adapter that raises hang signals.
pub trait HangSignalSource: Send + Sync {
    /// Begin watching. `traces` names where captured traces go.
    fn start(&self, traces: &TraceConfig, callbacks: Arc<dyn SignalCallbacks>) -> Result<()>;

    /// Stop watching and release any background resources. Idempotent.
    fn stop(&self);

    /// Stack trace of the primary thread as of now.
    fn capture_stack_trace(&self) -> String;

    /// Write a trace to `path`, then fire [`SignalCallbacks::on_print_trace`].
    fn request_print_trace(&self, path: &Path) -> Result<()>;
}

/// Signal source driven by the host.
///
/// For embedders that already own a stall detector (a signal handler, an
/// external supervisor) and only need to forward its verdicts.
pub struct ManualSignalSource {
    trace: Arc<dyn StackTraceProvider>,
    started: RwLock<Option<Started>>,
}

struct Started {
    callbacks: Arc<dyn SignalCallbacks>,
    hang_trace_file: PathBuf,
}

impl std::fmt::Debug for ManualSignalSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManualSignalSource")
            .field("started", &self.is_started())
            .finish_non_exhaustive()
    }
}

impl ManualSignalSource {
    #[must_use]
    pub fn new(trace: Arc<dyn StackTraceProvider>) -> Self {
        Self {
            trace,
            started: RwLock::new(None),
        }
    }

    #[must_use]
    pub fn is_started(&self) -> bool {
        self.started.read().map(|s| s.is_some()).unwrap_or(false)
    }

    fn callbacks(&self) -> Option<Arc<dyn SignalCallbacks>> {
        self.started
            .read()
            .ok()
            .and_then(|s| s.as_ref().map(|s| Arc::clone(&s.callbacks)))
    }

    /// Raise a hang signal. Returns false when the source is not started.
    pub fn fire_hang(&self) -> bool {
        let Some(callbacks) = self.callbacks() else {
            debug!("Manual signal source not started; ignoring hang signal");
            return false;
        };
        callbacks.on_hang_detected();
        true
    }

    /// Write the hang trace file and announce it.
    pub fn dump_hang_trace(&self) -> Result<()> {
        let (callbacks, path) = self
            .started
            .read()
            .ok()
            .and_then(|s| {
                s.as_ref()
                    .map(|s| (Arc::clone(&s.callbacks), s.hang_trace_file.clone()))
            })
            .ok_or(ConfigError::NotInitialized)?;
        write_trace_file(&path, &self.trace.capture())?;
        callbacks.on_hang_dump_trace();
        Ok(())
    }
}

impl HangSignalSource for ManualSignalSource {
    fn start(&self, traces: &TraceConfig, callbacks: Arc<dyn SignalCallbacks>) -> Result<()> {
        if let Ok(mut started) = self.started.write() {
            *started = Some(Started {
                callbacks,
                hang_trace_file: traces.hang_trace_file.clone(),
            });
        }
        Ok(())
    }

    fn stop(&self) {
        if let Ok(mut started) = self.started.write() {
            *started = None;
        }
    }

    fn capture_stack_trace(&self) -> String {
        self.trace.capture()
    }

    fn request_print_trace(&self, path: &Path) -> Result<()> {
        let callbacks = self.callbacks().ok_or(ConfigError::NotInitialized)?;
        write_trace_file(path, &self.trace.capture())?;
        callbacks.on_print_trace();
        Ok(())
    }
}

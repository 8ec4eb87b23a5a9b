//! The hang detector: signal entry points wired to the detection pipeline.
//!
//! ```text
//! HangSignalSource ──on_hang_detected──► HangDetector
//!                                          │ foreground? + HangHeuristic::evaluate
//!                                          │ capture stack trace
//!                                          ├─ blocked ──► dispatch(direct)
//!                                          └─ otherwise ─► EpisodeSpawner
//!                                                             └─ ConfirmationLoop::run
//!                                                                  ├─ Confirmed ─► dispatch(polled)
//!                                                                  └─ Exhausted ─► drop
//! ```
//!
//! Each signal opens a fresh [`Episode`]. Episodes share nothing but the
//! dispatcher and a read-only snapshot of the most recent evidence.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

use tracing::{debug, error, info, warn};

use crate::config::{HangwatchConfig, PollingConfig, ThresholdConfig, TraceConfig};
use crate::confirmation::ConfirmationLoop;
use crate::dispatch::{
    DispatchOutcome, Episode, HangDetectedListener, HangReportDispatcher, IssueReporter,
    SceneProvider, StackTraceProvider,
};
use crate::error::{ConfigError, Result};
use crate::foreground::{ForegroundFlag, ForegroundState};
use crate::heuristic::{HangEvidence, HangHeuristic, ThresholdPolicy};
use crate::process::{ErrorStateQuery, ProcessIdentity};
use crate::queue::{PendingQueue, QueueHeadInspector};
use crate::signal::{HangSignalSource, SignalCallbacks};
use crate::spawn::{EpisodeSpawner, ThreadSpawner};
use crate::time::{Clock, MonotonicClock, Sleeper, ThreadSleeper};
use crate::trace::print_trace_file;

/// Handle on the host process, used to confirm hangs with the environment.
#[derive(Clone)]
pub struct ProcessContext {
    pub identity: ProcessIdentity,
    pub error_states: Arc<dyn ErrorStateQuery>,
}

impl ProcessContext {
    /// Context for the running process.
    #[must_use]
    pub fn current(error_states: Arc<dyn ErrorStateQuery>) -> Self {
        Self {
            identity: ProcessIdentity::current(),
            error_states,
        }
    }
}

impl std::fmt::Debug for ProcessContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessContext")
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}

/// What a hang signal led to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalOutcome {
    /// The detector has not been initialized; the signal was ignored.
    NotInitialized,
    /// The heuristic found the primary thread blocked and the report went
    /// out directly.
    Direct(DispatchOutcome),
    /// Evidence was inconclusive; a confirmation episode was handed off.
    Confirming { episode: u64 },
    /// Evidence was inconclusive while another episode was still polling;
    /// the signal was dropped.
    ConfirmationInProgress,
    /// Evidence was inconclusive and no confirmation could run.
    Dropped,
}

/// Builder for [`HangDetector`].
pub struct HangDetectorBuilder {
    source: Arc<dyn HangSignalSource>,
    queue: Arc<dyn PendingQueue>,
    traces: TraceConfig,
    process: Option<ProcessContext>,
    thresholds: ThresholdConfig,
    polling: PollingConfig,
    foreground: Arc<dyn ForegroundState>,
    reporter: Option<Arc<dyn IssueReporter>>,
    scene: Option<Arc<dyn SceneProvider>>,
    spawner: Arc<dyn EpisodeSpawner>,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
}

impl HangDetectorBuilder {
    #[must_use]
    pub fn new(source: Arc<dyn HangSignalSource>, queue: Arc<dyn PendingQueue>) -> Self {
        Self {
            source,
            queue,
            traces: TraceConfig::default(),
            process: None,
            thresholds: ThresholdConfig::default(),
            polling: PollingConfig::default(),
            foreground: Arc::new(ForegroundFlag::new(true)),
            reporter: None,
            scene: None,
            spawner: Arc::new(ThreadSpawner),
            clock: Arc::new(MonotonicClock),
            sleeper: Arc::new(ThreadSleeper),
        }
    }

    /// Apply thresholds, polling and trace paths from a loaded config.
    #[must_use]
    pub fn config(mut self, config: &HangwatchConfig) -> Self {
        self.thresholds = config.thresholds;
        self.polling = config.polling;
        self.traces = config.traces.clone();
        self
    }

    #[must_use]
    pub fn traces(mut self, traces: TraceConfig) -> Self {
        self.traces = traces;
        self
    }

    /// Without a process context, inconclusive signals are dropped.
    #[must_use]
    pub fn process(mut self, process: ProcessContext) -> Self {
        self.process = Some(process);
        self
    }

    #[must_use]
    pub fn thresholds(mut self, thresholds: ThresholdConfig) -> Self {
        self.thresholds = thresholds;
        self
    }

    #[must_use]
    pub fn polling(mut self, polling: PollingConfig) -> Self {
        self.polling = polling;
        self
    }

    #[must_use]
    pub fn foreground(mut self, foreground: Arc<dyn ForegroundState>) -> Self {
        self.foreground = foreground;
        self
    }

    #[must_use]
    pub fn reporter(mut self, reporter: Arc<dyn IssueReporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    #[must_use]
    pub fn scene(mut self, scene: Arc<dyn SceneProvider>) -> Self {
        self.scene = Some(scene);
        self
    }

    #[must_use]
    pub fn spawner(mut self, spawner: Arc<dyn EpisodeSpawner>) -> Self {
        self.spawner = spawner;
        self
    }

    /// Must be the clock the queue stamps its tasks with.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    #[must_use]
    pub fn build(self) -> HangDetector {
        let inspector = QueueHeadInspector::new(self.queue, self.clock);
        let heuristic = HangHeuristic::new(inspector, ThresholdPolicy::new(self.thresholds));
        let confirmation = self.process.map(|ctx| {
            ConfirmationLoop::new(ctx.error_states, ctx.identity, self.polling, self.sleeper)
        });

        HangDetector {
            inner: Arc::new(DetectorInner {
                source: self.source,
                traces: self.traces,
                heuristic,
                confirmation,
                foreground: self.foreground,
                dispatcher: HangReportDispatcher::new(self.reporter, self.scene),
                spawner: self.spawner,
                initialized: AtomicBool::new(false),
                confirming: AtomicBool::new(false),
                next_episode: AtomicU64::new(0),
                last_evidence: RwLock::new(None),
            }),
        }
    }
}

/// Hang detector bound to one signal source and one primary queue.
///
/// Dropping the detector releases the signal source.
pub struct HangDetector {
    inner: Arc<DetectorInner>,
}

impl std::fmt::Debug for HangDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HangDetector")
            .field("initialized", &self.is_initialized())
            .field("traces", &self.inner.traces)
            .field("dispatcher", &self.inner.dispatcher)
            .finish_non_exhaustive()
    }
}

impl HangDetector {
    #[must_use]
    pub fn builder(
        source: Arc<dyn HangSignalSource>,
        queue: Arc<dyn PendingQueue>,
    ) -> HangDetectorBuilder {
        HangDetectorBuilder::new(source, queue)
    }

    /// Start the signal source. Calling this again is a no-op.
    pub fn init(&self) -> Result<()> {
        if self
            .inner
            .initialized
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Hang detector already initialized");
            return Ok(());
        }

        let callbacks: Arc<dyn SignalCallbacks> =
            Arc::new(DetectorCallbacks(Arc::downgrade(&self.inner)));
        if let Err(err) = self.inner.source.start(&self.inner.traces, callbacks) {
            self.inner.initialized.store(false, Ordering::SeqCst);
            error!(error = %err, "Failed to start hang signal source");
            return Err(err);
        }
        info!(
            hang_trace_file = %self.inner.traces.hang_trace_file.display(),
            print_trace_file = %self.inner.traces.print_trace_file.display(),
            "Hang detector initialized"
        );
        Ok(())
    }

    /// Release the signal source. Running confirmation episodes finish on
    /// their own.
    pub fn shutdown(&self) {
        if self.inner.initialized.swap(false, Ordering::SeqCst) {
            self.inner.source.stop();
            info!("Hang detector shut down");
        }
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.inner.initialized.load(Ordering::SeqCst)
    }

    /// Register the override sink. Only the first registration takes effect.
    pub fn set_hang_detected_listener(&self, listener: Arc<dyn HangDetectedListener>) -> bool {
        self.inner.dispatcher.set_listener(listener)
    }

    /// Evidence from the most recent signal.
    #[must_use]
    pub fn last_evidence(&self) -> Option<Arc<HangEvidence>> {
        self.inner.last_evidence.read().ok().and_then(|e| e.clone())
    }

    pub fn on_hang_detected(&self) -> SignalOutcome {
        self.inner.on_hang_detected()
    }

    pub fn on_hang_dump_trace(&self) {
        self.inner.on_hang_dump_trace();
    }

    pub fn on_print_trace(&self) {
        self.inner.on_print_trace();
    }

    /// Ask the signal source for a fresh trace and log it.
    ///
    /// Failures are logged and otherwise ignored; use
    /// [`try_print_trace`](Self::try_print_trace) to inspect them.
    pub fn print_trace(&self) {
        let _ = self.try_print_trace();
    }

    /// Like [`print_trace`](Self::print_trace), but also returns the failure.
    ///
    /// Fails when the detector is not initialized or no print trace path is
    /// configured.
    pub fn try_print_trace(&self) -> Result<()> {
        if !self.is_initialized() {
            let err = ConfigError::NotInitialized;
            warn!(error = %err, "Cannot print trace");
            return Err(err.into());
        }
        let path = &self.inner.traces.print_trace_file;
        if path.as_os_str().is_empty() {
            let err = ConfigError::TracePathUnset("print");
            warn!(error = %err, "Cannot print trace");
            return Err(err.into());
        }
        self.inner.source.request_print_trace(path).inspect_err(|err| {
            error!(path = %path.display(), error = %err, "Trace request failed");
        })
    }
}

impl Drop for HangDetector {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct DetectorInner {
    source: Arc<dyn HangSignalSource>,
    traces: TraceConfig,
    heuristic: HangHeuristic,
    confirmation: Option<ConfirmationLoop>,
    foreground: Arc<dyn ForegroundState>,
    dispatcher: HangReportDispatcher,
    spawner: Arc<dyn EpisodeSpawner>,
    initialized: AtomicBool,
    /// Held while a confirmation episode is polling.
    confirming: AtomicBool,
    next_episode: AtomicU64,
    last_evidence: RwLock<Option<Arc<HangEvidence>>>,
}

/// Stack trace taken when the episode opened.
struct CapturedTrace(String);

impl StackTraceProvider for CapturedTrace {
    fn capture(&self) -> String {
        self.0.clone()
    }
}

/// Releases the confirmation slot when the episode task ends, whether it
/// ran to completion, panicked, or was never started.
struct ConfirmingGuard(Arc<DetectorInner>);

impl Drop for ConfirmingGuard {
    fn drop(&mut self) {
        self.0.confirming.store(false, Ordering::SeqCst);
    }
}

impl DetectorInner {
    fn on_hang_detected(self: &Arc<Self>) -> SignalOutcome {
        if !self.initialized.load(Ordering::SeqCst) {
            warn!("Hang signal before initialization; ignoring");
            return SignalOutcome::NotInitialized;
        }

        let is_foreground = self.foreground.is_foreground();
        let evidence = self.heuristic.evaluate(is_foreground);
        let trace = CapturedTrace(self.source.capture_stack_trace());

        if let Ok(mut last) = self.last_evidence.write() {
            *last = Some(Arc::new(evidence.clone()));
        }

        let id = self.next_episode.fetch_add(1, Ordering::SeqCst) + 1;
        info!(
            episode = id,
            is_foreground,
            overdue_ms = evidence.overdue_ms,
            pending_task = %evidence.pending_task_description,
            blocked = evidence.blocked,
            "Hang signal received"
        );
        let episode = Episode::new(id, evidence);

        if episode.evidence().blocked {
            return SignalOutcome::Direct(self.dispatcher.dispatch(&episode, &trace, false));
        }

        let Some(confirmation) = self.confirmation.clone() else {
            debug!(episode = id, "No process context; inconclusive signal dropped");
            return SignalOutcome::Dropped;
        };

        if self
            .confirming
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            info!(episode = id, "Confirmation already in progress; signal dropped");
            return SignalOutcome::ConfirmationInProgress;
        }

        let guard = ConfirmingGuard(Arc::clone(self));
        let task = Box::new(move || {
            let slot = guard;
            if confirmation.run().is_confirmed() {
                let outcome = slot.0.dispatcher.dispatch(&episode, &trace, true);
                debug!(episode = episode.id(), outcome = ?outcome, "Confirmation episode finished");
            }
        });
        match self.spawner.spawn(task) {
            Ok(()) => SignalOutcome::Confirming { episode: id },
            Err(err) => {
                self.confirming.store(false, Ordering::SeqCst);
                error!(episode = id, error = %err, "Failed to start confirmation; signal dropped");
                SignalOutcome::Dropped
            }
        }
    }

    fn on_hang_dump_trace(&self) {
        self.print("hang", &self.traces.hang_trace_file);
    }

    fn on_print_trace(&self) {
        self.print("print", &self.traces.print_trace_file);
    }

    fn print(&self, which: &'static str, path: &Path) {
        if path.as_os_str().is_empty() {
            warn!(error = %ConfigError::TracePathUnset(which), "Cannot print trace");
            return;
        }
        match print_trace_file(path) {
            Ok(lines) => debug!(path = %path.display(), lines, "Trace printed"),
            Err(err) => error!(path = %path.display(), error = %err, "Failed to print {which} trace"),
        }
    }
}

/// Callbacks handed to the signal source. Holds the detector weakly so the
/// source never keeps it alive.
struct DetectorCallbacks(Weak<DetectorInner>);

impl SignalCallbacks for DetectorCallbacks {
    fn on_hang_detected(&self) {
        if let Some(inner) = self.0.upgrade() {
            let _ = inner.on_hang_detected();
        }
    }

    fn on_hang_dump_trace(&self) {
        if let Some(inner) = self.0.upgrade() {
            inner.on_hang_dump_trace();
        }
    }

    fn on_print_trace(&self) {
        if let Some(inner) = self.0.upgrade() {
            inner.on_print_trace();
        }
    }
}

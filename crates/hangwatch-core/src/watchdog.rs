//! Heartbeat watchdog: the default [`HangSignalSource`].
//!
//! The primary loop records a heartbeat on every iteration. A background
//! thread checks the heartbeat's age every `check_interval` and raises a hang
//! signal when it goes stale.
//!
//! ```text
//! WorkQueue::run ──► heartbeat.record()
//!                          │
//!  hang-watchdog thread ───┴─► heartbeat.check()
//!        stale, armed   ──► on_hang_detected, write hang trace, on_hang_dump_trace
//!        stale, fired   ──► (nothing; one signal per stall)
//!        beat advanced  ──► re-arm
//! ```

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::config::{TraceConfig, WatchdogSettings};
use crate::dispatch::StackTraceProvider;
use crate::error::{ConfigError, Error, Result};
use crate::signal::{HangSignalSource, SignalCallbacks};
use crate::time::Clock;
use crate::trace::write_trace_file;
use crate::work_queue::WorkQueue;

/// Name of the watchdog monitor thread.
pub const WATCHDOG_THREAD_NAME: &str = "hang-watchdog";

/// Last time the primary loop made progress.
pub struct Heartbeat {
    last: AtomicU64,
    /// Clock reading when the heartbeat was created (for the grace period).
    created_at: u64,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for Heartbeat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Heartbeat")
            .field("last", &self.last_ms())
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

impl Heartbeat {
    /// A heartbeat that has never been recorded.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            last: AtomicU64::new(0),
            created_at: clock.now_ms(),
            clock,
        }
    }

    pub fn record(&self) {
        self.last.store(self.clock.now_ms(), Ordering::SeqCst);
    }

    /// Last recorded time, 0 if never recorded.
    #[must_use]
    pub fn last_ms(&self) -> u64 {
        self.last.load(Ordering::SeqCst)
    }

    /// Compare the heartbeat's age against `config`.
    #[must_use]
    pub fn check(&self, config: &WatchdogConfig) -> HeartbeatHealth {
        let now = self.clock.now_ms();
        let last = self.last_ms();
        let uptime_ms = now.saturating_sub(self.created_at);
        // A loop that never beat is measured from creation.
        let age_ms = now.saturating_sub(if last == 0 { self.created_at } else { last });

        let status = if uptime_ms < config.grace_period_ms || age_ms <= config.stale_ms {
            HeartbeatStatus::Healthy
        } else {
            HeartbeatStatus::Stale
        };

        HeartbeatHealth {
            timestamp_ms: now,
            last_heartbeat_ms: (last != 0).then_some(last),
            age_ms,
            threshold_ms: config.stale_ms,
            status,
        }
    }
}

/// Watchdog timing.
#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    /// How often the monitor thread wakes up.
    pub check_interval: Duration,
    /// Heartbeat is stale after this many ms.
    pub stale_ms: u64,
    /// Grace period after startup (ms) before flagging anything.
    pub grace_period_ms: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        WatchdogSettings::default().into()
    }
}

impl From<WatchdogSettings> for WatchdogConfig {
    fn from(settings: WatchdogSettings) -> Self {
        Self {
            check_interval: Duration::from_millis(settings.check_interval_ms),
            stale_ms: settings.stale_ms,
            grace_period_ms: settings.grace_period_ms,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeartbeatStatus {
    Healthy,
    Stale,
}

impl std::fmt::Display for HeartbeatStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Stale => write!(f, "stale"),
        }
    }
}

/// One heartbeat check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatHealth {
    pub timestamp_ms: u64,
    /// `None` if the loop never recorded a heartbeat.
    pub last_heartbeat_ms: Option<u64>,
    pub age_ms: u64,
    pub threshold_ms: u64,
    pub status: HeartbeatStatus,
}

/// Handle returned by [`spawn_watchdog`] to control the monitor thread.
pub struct WatchdogHandle {
    thread: JoinHandle<()>,
    shutdown: Arc<AtomicBool>,
}

impl WatchdogHandle {
    /// Signal the watchdog to stop and wake it up.
    pub fn signal_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.thread.thread().unpark();
    }

    /// Wait for the monitor thread to finish.
    ///
    /// Called from the monitor thread itself (a callback tearing the source
    /// down), this only signals and returns.
    pub fn join(self) {
        self.signal_shutdown();
        if self.thread.thread().id() == std::thread::current().id() {
            return;
        }
        if self.thread.join().is_err() {
            error!("Watchdog thread panicked");
        }
    }
}

/// Everything the monitor thread needs.
struct MonitorContext {
    heartbeat: Arc<Heartbeat>,
    trace: Arc<dyn StackTraceProvider>,
    config: WatchdogConfig,
    hang_trace_file: PathBuf,
    callbacks: Arc<dyn SignalCallbacks>,
}

/// Spawn the monitor thread.
fn spawn_watchdog(ctx: MonitorContext) -> Result<WatchdogHandle> {
    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&shutdown);

    let thread = std::thread::Builder::new()
        .name(WATCHDOG_THREAD_NAME.to_string())
        .spawn(move || monitor(&ctx, &flag))
        .map_err(|e| Error::Runtime(format!("failed to spawn watchdog thread: {e}")))?;

    Ok(WatchdogHandle { thread, shutdown })
}

fn monitor(ctx: &MonitorContext, shutdown: &AtomicBool) {
    info!(
        check_interval_ms = ctx.config.check_interval.as_millis(),
        stale_ms = ctx.config.stale_ms,
        "Watchdog started"
    );
    // Heartbeat value at the last signal; `None` while armed.
    let mut fired_at_beat: Option<u64> = None;

    loop {
        std::thread::park_timeout(ctx.config.check_interval);
        if shutdown.load(Ordering::SeqCst) {
            info!("Watchdog: shutdown signal received");
            break;
        }

        let health = ctx.heartbeat.check(&ctx.config);
        let beat = ctx.heartbeat.last_ms();

        if let Some(fired) = fired_at_beat {
            if beat != fired {
                info!(age_ms = health.age_ms, "Watchdog: primary thread made progress; re-armed");
                fired_at_beat = None;
            }
        }

        if health.status == HeartbeatStatus::Stale && fired_at_beat.is_none() {
            fired_at_beat = Some(beat);
            warn!(
                age_ms = health.age_ms,
                threshold_ms = health.threshold_ms,
                "Watchdog: primary thread heartbeat is stale"
            );
            if let Ok(json) = serde_json::to_string(&health) {
                debug!(diagnostic = %json, "Watchdog: heartbeat diagnostic");
            }
            raise(ctx);
        }
    }
}

fn raise(ctx: &MonitorContext) {
    guarded("on_hang_detected", || ctx.callbacks.on_hang_detected());

    if ctx.hang_trace_file.as_os_str().is_empty() {
        debug!("Hang trace file not configured; skipping trace dump");
        return;
    }
    match write_trace_file(&ctx.hang_trace_file, &ctx.trace.capture()) {
        Ok(()) => guarded("on_hang_dump_trace", || ctx.callbacks.on_hang_dump_trace()),
        Err(err) => warn!(
            path = %ctx.hang_trace_file.display(),
            error = %err,
            "Failed to write hang trace"
        ),
    }
}

/// Keep the monitor alive when a callback panics.
fn guarded(name: &str, f: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        error!(callback = name, "Signal callback panicked");
    }
}

/// Heartbeat-based [`HangSignalSource`].
pub struct WatchdogSignalSource {
    heartbeat: Arc<Heartbeat>,
    trace: Arc<dyn StackTraceProvider>,
    config: WatchdogConfig,
    callbacks: RwLock<Option<Arc<dyn SignalCallbacks>>>,
    handle: Mutex<Option<WatchdogHandle>>,
}

impl std::fmt::Debug for WatchdogSignalSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchdogSignalSource")
            .field("config", &self.config)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl WatchdogSignalSource {
    #[must_use]
    pub fn new(
        heartbeat: Arc<Heartbeat>,
        trace: Arc<dyn StackTraceProvider>,
        config: WatchdogConfig,
    ) -> Self {
        Self {
            heartbeat,
            trace,
            config,
            callbacks: RwLock::new(None),
            handle: Mutex::new(None),
        }
    }

    /// Watch a [`WorkQueue`]'s heartbeat; traces describe its primary thread.
    #[must_use]
    pub fn for_queue(queue: &Arc<WorkQueue>, config: WatchdogConfig) -> Self {
        Self::new(queue.heartbeat(), Arc::clone(queue) as Arc<dyn StackTraceProvider>, config)
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.handle.lock().map(|h| h.is_some()).unwrap_or(false)
    }
}

impl HangSignalSource for WatchdogSignalSource {
    fn start(&self, traces: &TraceConfig, callbacks: Arc<dyn SignalCallbacks>) -> Result<()> {
        let mut handle = self
            .handle
            .lock()
            .map_err(|_| Error::Runtime("watchdog state poisoned".to_string()))?;
        if handle.is_some() {
            debug!("Watchdog already running");
            return Ok(());
        }

        if let Ok(mut slot) = self.callbacks.write() {
            *slot = Some(Arc::clone(&callbacks));
        }
        *handle = Some(spawn_watchdog(MonitorContext {
            heartbeat: Arc::clone(&self.heartbeat),
            trace: Arc::clone(&self.trace),
            config: self.config.clone(),
            hang_trace_file: traces.hang_trace_file.clone(),
            callbacks,
        })?);
        Ok(())
    }

    fn stop(&self) {
        let handle = self.handle.lock().ok().and_then(|mut h| h.take());
        if let Some(handle) = handle {
            handle.join();
        }
        if let Ok(mut slot) = self.callbacks.write() {
            *slot = None;
        }
    }

    fn capture_stack_trace(&self) -> String {
        self.trace.capture()
    }

    fn request_print_trace(&self, path: &Path) -> Result<()> {
        let callbacks = self
            .callbacks
            .read()
            .ok()
            .and_then(|c| c.clone())
            .ok_or(ConfigError::NotInitialized)?;
        write_trace_file(path, &self.trace.capture())?;
        callbacks.on_print_trace();
        Ok(())
    }
}

impl Drop for WatchdogSignalSource {
    fn drop(&mut self) {
        self.stop();
    }
}

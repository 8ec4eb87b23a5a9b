//! Hang report assembly and single-sink delivery.
//!
//! A confirmed episode produces exactly one [`HangReport`], delivered to the
//! first available sink:
//!
//! 1. the registered [`HangDetectedListener`], exclusively;
//! 2. otherwise the default [`IssueReporter`], wrapped in a [`HangIssue`];
//! 3. otherwise nowhere: the report is logged at error level and dropped.
//!
//! The [`Episode`] carries a one-shot latch so the direct path and the
//! confirmation path can never both deliver.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::error::DeliveryError;
use crate::heuristic::HangEvidence;

/// Issue kind used for hang reports in the default pipeline.
pub const HANG_ISSUE_KIND: &str = "signal_hang";

/// Tag under which the default pipeline files hang issues.
pub const HANG_ISSUE_TAG: &str = "hang_detection";

/// Final event for one confirmed episode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HangReport {
    pub stack_trace: String,
    pub pending_task_description: String,
    pub overdue_ms: i64,
    pub is_foreground: bool,
    pub confirmed_by_polling: bool,
}

/// Produces the primary thread's stack trace on demand.
pub trait StackTraceProvider: Send + Sync {
    fn capture(&self) -> String;
}

impl<F> StackTraceProvider for F
where
    F: Fn() -> String + Send + Sync,
{
    fn capture(&self) -> String {
        self()
    }
}

/// Caller-supplied override sink.
pub trait HangDetectedListener: Send + Sync {
    fn on_hang_detected(
        &self,
        stack_trace: &str,
        pending_task_description: &str,
        overdue_ms: i64,
        confirmed_by_polling: bool,
    );
}

impl<F> HangDetectedListener for F
where
    F: Fn(&str, &str, i64, bool) + Send + Sync,
{
    fn on_hang_detected(
        &self,
        stack_trace: &str,
        pending_task_description: &str,
        overdue_ms: i64,
        confirmed_by_polling: bool,
    ) {
        self(
            stack_trace,
            pending_task_description,
            overdue_ms,
            confirmed_by_polling,
        );
    }
}

/// Default reporting pipeline (issue transport).
pub trait IssueReporter: Send + Sync {
    fn report(&self, issue: HangIssue) -> Result<(), DeliveryError>;
}

/// Name of whatever the user is looking at, for issue context.
pub trait SceneProvider: Send + Sync {
    fn visible_scene(&self) -> Option<String>;
}

/// Host metadata attached to issues.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentInfo {
    pub os: String,
    pub arch: String,
    pub family: String,
    pub pid: u32,
    pub hangwatch_version: String,
}

impl EnvironmentInfo {
    #[must_use]
    pub fn collect() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            family: std::env::consts::FAMILY.to_string(),
            pid: std::process::id(),
            hangwatch_version: crate::VERSION.to_string(),
        }
    }
}

/// Issue payload handed to the default pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HangIssue {
    pub kind: String,
    pub tag: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scene: Option<String>,
    pub environment: EnvironmentInfo,
    pub stack_trace: String,
    pub process_foreground: bool,
    pub pending_task_description: String,
    pub overdue_ms: i64,
    pub confirmed_by_polling: bool,
    /// RFC 3339 detection time
    pub detected_at: String,
}

impl HangIssue {
    #[must_use]
    pub fn from_report(report: &HangReport, scene: Option<String>) -> Self {
        Self {
            kind: HANG_ISSUE_KIND.to_string(),
            tag: HANG_ISSUE_TAG.to_string(),
            scene,
            environment: EnvironmentInfo::collect(),
            stack_trace: report.stack_trace.clone(),
            process_foreground: report.is_foreground,
            pending_task_description: report.pending_task_description.clone(),
            overdue_ms: report.overdue_ms,
            confirmed_by_polling: report.confirmed_by_polling,
            detected_at: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// One signal-to-resolution lifecycle.
#[derive(Debug)]
pub struct Episode {
    id: u64,
    evidence: HangEvidence,
    dispatched: AtomicBool,
}

impl Episode {
    #[must_use]
    pub fn new(id: u64, evidence: HangEvidence) -> Self {
        Self {
            id,
            evidence,
            dispatched: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn evidence(&self) -> &HangEvidence {
        &self.evidence
    }

    #[must_use]
    pub fn is_dispatched(&self) -> bool {
        self.dispatched.load(Ordering::SeqCst)
    }

    /// Claim the episode's single delivery slot.
    fn claim(&self) -> bool {
        self.dispatched
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

/// Which sink received a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkKind {
    Listener,
    IssueReporter,
}

/// Result of a dispatch attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Delivered(SinkKind),
    /// The episode already produced its report.
    AlreadyDispatched,
    /// No sink took the report.
    Dropped(DeliveryError),
}

/// Routes hang reports to exactly one sink.
#[derive(Default)]
pub struct HangReportDispatcher {
    listener: OnceLock<Arc<dyn HangDetectedListener>>,
    reporter: Option<Arc<dyn IssueReporter>>,
    scene: Option<Arc<dyn SceneProvider>>,
}

impl std::fmt::Debug for HangReportDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HangReportDispatcher")
            .field("has_listener", &self.listener.get().is_some())
            .field("has_reporter", &self.reporter.is_some())
            .field("has_scene", &self.scene.is_some())
            .finish()
    }
}

impl HangReportDispatcher {
    #[must_use]
    pub fn new(
        reporter: Option<Arc<dyn IssueReporter>>,
        scene: Option<Arc<dyn SceneProvider>>,
    ) -> Self {
        Self {
            listener: OnceLock::new(),
            reporter,
            scene,
        }
    }

    /// Register the override sink. Only the first registration takes effect.
    pub fn set_listener(&self, listener: Arc<dyn HangDetectedListener>) -> bool {
        let accepted = self.listener.set(listener).is_ok();
        if !accepted {
            warn!("Hang listener already registered; ignoring replacement");
        }
        accepted
    }

    #[must_use]
    pub fn has_listener(&self) -> bool {
        self.listener.get().is_some()
    }

    /// Assemble the report for `episode` and deliver it at most once.
    ///
    /// The stack trace is captured here, right before delivery.
    pub fn dispatch(
        &self,
        episode: &Episode,
        stack: &dyn StackTraceProvider,
        confirmed_by_polling: bool,
    ) -> DispatchOutcome {
        if !episode.claim() {
            warn!(
                episode = episode.id(),
                "Episode already reported; suppressing duplicate"
            );
            return DispatchOutcome::AlreadyDispatched;
        }

        let evidence = episode.evidence();
        let report = HangReport {
            stack_trace: stack.capture(),
            pending_task_description: evidence.pending_task_description.clone(),
            overdue_ms: evidence.overdue_ms,
            is_foreground: evidence.is_foreground,
            confirmed_by_polling,
        };

        let result = if let Some(listener) = self.listener.get() {
            deliver_to_listener(listener.as_ref(), &report).map(|()| SinkKind::Listener)
        } else if let Some(reporter) = &self.reporter {
            let scene = self.scene.as_ref().and_then(|s| s.visible_scene());
            let issue = HangIssue::from_report(&report, scene);
            deliver_to_reporter(reporter.as_ref(), issue).map(|()| SinkKind::IssueReporter)
        } else {
            Err(DeliveryError::NoSink)
        };

        match result {
            Ok(sink) => DispatchOutcome::Delivered(sink),
            Err(err) => {
                let content = serde_json::to_string(&report).unwrap_or_default();
                error!(
                    episode = episode.id(),
                    error = %err,
                    report = %content,
                    "Hang report dropped"
                );
                DispatchOutcome::Dropped(err)
            }
        }
    }
}

fn deliver_to_listener(
    listener: &dyn HangDetectedListener,
    report: &HangReport,
) -> Result<(), DeliveryError> {
    catch_unwind(AssertUnwindSafe(|| {
        listener.on_hang_detected(
            &report.stack_trace,
            &report.pending_task_description,
            report.overdue_ms,
            report.confirmed_by_polling,
        );
    }))
    .map_err(|panic| DeliveryError::SinkFailed(panic_message(&*panic)))
}

fn deliver_to_reporter(reporter: &dyn IssueReporter, issue: HangIssue) -> Result<(), DeliveryError> {
    let content = serde_json::to_string(&issue).unwrap_or_default();
    let outcome = catch_unwind(AssertUnwindSafe(|| reporter.report(issue)))
        .map_err(|panic| DeliveryError::SinkFailed(panic_message(&*panic)))?;
    if outcome.is_ok() {
        error!(issue = %content, "Confirmed hang reported");
    }
    outcome
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "sink panicked".to_string())
}

//! End-to-end hang detection: a real primary loop, the heartbeat watchdog,
//! and the detector, with a task that deliberately stalls the loop.

use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use hangwatch_core::config::{PollingConfig, ThresholdConfig, TraceConfig};
use hangwatch_core::detector::{HangDetector, ProcessContext};
use hangwatch_core::dispatch::{HangIssue, IssueReporter};
use hangwatch_core::error::DeliveryError;
use hangwatch_core::process::{FileErrorStateQuery, ProcessErrorState, ProcessIdentity};
use hangwatch_core::spawn::TokioBlockingSpawner;
use hangwatch_core::time::MonotonicClock;
use hangwatch_core::watchdog::{WatchdogConfig, WatchdogSignalSource};
use hangwatch_core::work_queue::WorkQueue;

#[derive(Debug, Clone)]
struct Report {
    stack_trace: String,
    pending_task: String,
    overdue_ms: i64,
    confirmed_by_polling: bool,
}

fn fast_watchdog() -> WatchdogConfig {
    WatchdogConfig {
        check_interval: Duration::from_millis(20),
        stale_ms: 200,
        grace_period_ms: 0,
    }
}

/// Runs `queue` on a named primary thread.
fn start_primary(queue: &Arc<WorkQueue>) -> std::thread::JoinHandle<()> {
    let runner = Arc::clone(queue);
    std::thread::Builder::new()
        .name("primary".into())
        .spawn(move || runner.run())
        .unwrap()
}

/// Posts a task that blocks the primary thread until `release` fires, then
/// a victim task that will sit overdue behind it.
fn stall(queue: &WorkQueue) -> mpsc::Sender<()> {
    let (release, wait) = mpsc::channel::<()>();
    queue.post("stall", move || {
        let _ = wait.recv_timeout(Duration::from_secs(10));
    });
    queue.post("victim", || {});
    release
}

fn listener_channel(detector: &HangDetector) -> mpsc::Receiver<Report> {
    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    let accepted = detector.set_hang_detected_listener(Arc::new(
        move |stack: &str, task: &str, overdue: i64, polled: bool| {
            let _ = tx.lock().unwrap().send(Report {
                stack_trace: stack.to_string(),
                pending_task: task.to_string(),
                overdue_ms: overdue,
                confirmed_by_polling: polled,
            });
        },
    ));
    assert!(accepted);
    rx
}

#[test]
fn stalled_primary_is_reported_directly() {
    let queue = Arc::new(WorkQueue::new(Arc::new(MonotonicClock)));
    let source = Arc::new(WatchdogSignalSource::for_queue(&queue, fast_watchdog()));
    let detector = HangDetector::builder(source, queue.clone())
        .clock(queue.clock())
        .thresholds(ThresholdConfig {
            foreground_ms: -100,
            background_ms: -100,
        })
        .build();
    let reports = listener_channel(&detector);
    detector.init().unwrap();

    let primary = start_primary(&queue);
    let release = stall(&queue);

    let report = reports.recv_timeout(Duration::from_secs(10)).unwrap();
    assert!(!report.confirmed_by_polling);
    assert_eq!(report.pending_task, "victim");
    assert!(report.overdue_ms < -100, "overdue {}", report.overdue_ms);
    assert!(report.stack_trace.contains("running: stall"));
    assert!(report.stack_trace.contains("primary thread \"primary\""));

    release.send(()).unwrap();
    queue.quit();
    primary.join().unwrap();
    detector.shutdown();

    // One stall, one report.
    assert!(reports.try_recv().is_err());
    assert!(detector.last_evidence().unwrap().blocked);
}

#[test]
fn inconclusive_stall_is_confirmed_by_error_state() {
    let tmp = tempfile::TempDir::new().unwrap();
    let errors_path = tmp.path().join("errors.json");
    let me = ProcessIdentity::current();
    std::fs::write(
        &errors_path,
        serde_json::to_string(&vec![ProcessErrorState::not_responding(me.pid, me.uid, "tests")])
            .unwrap(),
    )
    .unwrap();

    let queue = Arc::new(WorkQueue::new(Arc::new(MonotonicClock)));
    let source = Arc::new(WatchdogSignalSource::for_queue(&queue, fast_watchdog()));
    let detector = HangDetector::builder(source, queue.clone())
        .clock(queue.clock())
        .process(ProcessContext::current(Arc::new(FileErrorStateQuery::new(&errors_path))))
        .polling(PollingConfig {
            interval_ms: 10,
            max_attempts: 5,
        })
        .build();
    let reports = listener_channel(&detector);
    detector.init().unwrap();

    let primary = start_primary(&queue);
    let release = stall(&queue);

    // 200 ms overdue is far from the 2 s foreground threshold, so only the
    // error-state query can confirm this hang.
    let report = reports.recv_timeout(Duration::from_secs(10)).unwrap();
    assert!(report.confirmed_by_polling);
    assert_eq!(report.pending_task, "victim");

    release.send(()).unwrap();
    queue.quit();
    primary.join().unwrap();
}

#[test]
fn hang_trace_file_is_written_on_stall() {
    let tmp = tempfile::TempDir::new().unwrap();
    let traces = TraceConfig::new(tmp.path().join("hang.trace"), tmp.path().join("print.trace"));

    let queue = Arc::new(WorkQueue::new(Arc::new(MonotonicClock)));
    let source = Arc::new(WatchdogSignalSource::for_queue(&queue, fast_watchdog()));
    let detector = HangDetector::builder(source, queue.clone())
        .clock(queue.clock())
        .traces(traces.clone())
        .build();
    detector.init().unwrap();

    let primary = start_primary(&queue);
    let release = stall(&queue);

    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    while !traces.hang_trace_file.exists() && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(20));
    }
    release.send(()).unwrap();
    queue.quit();
    primary.join().unwrap();

    let content = std::fs::read_to_string(&traces.hang_trace_file).unwrap();
    assert!(content.contains("hang trace captured at"));
    assert!(content.contains("stall"));

    detector.try_print_trace().unwrap();
    assert!(traces.print_trace_file.exists());
}

struct ChannelReporter(Mutex<mpsc::Sender<HangIssue>>);

impl IssueReporter for ChannelReporter {
    fn report(&self, issue: HangIssue) -> Result<(), DeliveryError> {
        self.0
            .lock()
            .map_err(|e| DeliveryError::SinkFailed(e.to_string()))?
            .send(issue)
            .map_err(|e| DeliveryError::SinkFailed(e.to_string()))
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn default_reporter_receives_issue_via_tokio_spawner() {
    let tmp = tempfile::TempDir::new().unwrap();
    let errors_path = tmp.path().join("errors.json");
    let me = ProcessIdentity::current();
    std::fs::write(
        &errors_path,
        serde_json::to_string(&vec![ProcessErrorState::not_responding(me.pid, me.uid, "tests")])
            .unwrap(),
    )
    .unwrap();

    let (tx, rx) = mpsc::channel();
    let queue = Arc::new(WorkQueue::new(Arc::new(MonotonicClock)));
    let source = Arc::new(WatchdogSignalSource::for_queue(&queue, fast_watchdog()));
    let detector = HangDetector::builder(source, queue.clone())
        .clock(queue.clock())
        .process(ProcessContext::current(Arc::new(FileErrorStateQuery::new(&errors_path))))
        .polling(PollingConfig {
            interval_ms: 10,
            max_attempts: 3,
        })
        .spawner(Arc::new(TokioBlockingSpawner::current().unwrap()))
        .reporter(Arc::new(ChannelReporter(Mutex::new(tx))))
        .build();
    detector.init().unwrap();

    let primary = start_primary(&queue);
    let release = stall(&queue);

    let issue = tokio::task::spawn_blocking(move || rx.recv_timeout(Duration::from_secs(10)))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(issue.kind, "signal_hang");
    assert!(issue.confirmed_by_polling);
    assert_eq!(issue.environment.pid, std::process::id());

    release.send(()).unwrap();
    queue.quit();
    primary.join().unwrap();
}

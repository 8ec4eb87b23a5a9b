//! `hw demo`: run a primary loop, stall it, and show what gets reported.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::time::Duration;

use anyhow::{Context, Result};
use hangwatch_core::config::HangwatchConfig;
use hangwatch_core::detector::{HangDetector, ProcessContext};
use hangwatch_core::error::IntrospectionError;
use hangwatch_core::foreground::ForegroundFlag;
use hangwatch_core::process::{
    ErrorStateQuery, FileErrorStateQuery, ProcessErrorState, ProcessIdentity,
};
use hangwatch_core::time::MonotonicClock;
use hangwatch_core::watchdog::{WatchdogConfig, WatchdogSignalSource};
use hangwatch_core::work_queue::WorkQueue;
use serde_json::json;
use tracing::info;

pub struct DemoOptions {
    pub stall_ms: u64,
    pub background: bool,
    pub error_state: Option<PathBuf>,
    pub json: bool,
}

/// Reports this process as not responding while the injected stall lasts.
struct SimulatedErrorState {
    identity: ProcessIdentity,
    stalling: Arc<AtomicBool>,
}

impl ErrorStateQuery for SimulatedErrorState {
    fn processes_in_error_state(&self) -> Result<Vec<ProcessErrorState>, IntrospectionError> {
        if self.stalling.load(Ordering::SeqCst) {
            Ok(vec![ProcessErrorState::not_responding(
                self.identity.pid,
                self.identity.uid,
                "hw-demo",
            )])
        } else {
            Ok(Vec::new())
        }
    }
}

struct DemoReport {
    stack_trace: String,
    pending_task: String,
    overdue_ms: i64,
    confirmed_by_polling: bool,
}

pub fn run(config: &HangwatchConfig, opts: &DemoOptions) -> Result<()> {
    let queue = Arc::new(WorkQueue::new(Arc::new(MonotonicClock)));
    let watchdog = WatchdogConfig::from(config.watchdog);
    let stale_ms = watchdog.stale_ms;
    let check_interval = watchdog.check_interval;
    let source = Arc::new(WatchdogSignalSource::for_queue(&queue, watchdog));

    let stalling = Arc::new(AtomicBool::new(false));
    let identity = ProcessIdentity::current();
    let error_states: Arc<dyn ErrorStateQuery> = match &opts.error_state {
        Some(path) => Arc::new(FileErrorStateQuery::new(path)),
        None => Arc::new(SimulatedErrorState {
            identity,
            stalling: Arc::clone(&stalling),
        }),
    };

    let detector = HangDetector::builder(source, queue.clone())
        .config(config)
        .clock(queue.clock())
        .foreground(Arc::new(ForegroundFlag::new(!opts.background)))
        .process(ProcessContext {
            identity,
            error_states,
        })
        .build();

    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    detector.set_hang_detected_listener(Arc::new(
        move |stack: &str, task: &str, overdue_ms: i64, polled: bool| {
            if let Ok(tx) = tx.lock() {
                let _ = tx.send(DemoReport {
                    stack_trace: stack.to_string(),
                    pending_task: task.to_string(),
                    overdue_ms,
                    confirmed_by_polling: polled,
                });
            }
        },
    ));
    detector.init()?;

    let runner = Arc::clone(&queue);
    let primary = std::thread::Builder::new()
        .name("primary".into())
        .spawn(move || runner.run())
        .context("failed to spawn primary thread")?;

    let stall = Duration::from_millis(opts.stall_ms);
    let flag = Arc::clone(&stalling);
    info!(stall_ms = opts.stall_ms, "Injecting stall into primary loop");
    queue.post("demo: stall", move || {
        flag.store(true, Ordering::SeqCst);
        std::thread::sleep(stall);
        flag.store(false, Ordering::SeqCst);
    });
    queue.post("demo: input event", || {});

    // A stall shorter than the staleness threshold never raises a signal.
    let wait = if opts.stall_ms > stale_ms {
        stall + config.polling.budget() + Duration::from_secs(1)
    } else {
        stall + check_interval * 2
    };
    let report = rx.recv_timeout(wait).ok();

    queue.quit();
    if primary.join().is_err() {
        anyhow::bail!("primary thread panicked");
    }
    detector.shutdown();

    match report {
        Some(report) if opts.json => {
            let value = json!({
                "stack_trace": report.stack_trace,
                "pending_task_description": report.pending_task,
                "overdue_ms": report.overdue_ms,
                "confirmed_by_polling": report.confirmed_by_polling,
            });
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        Some(report) => {
            let source = if report.confirmed_by_polling {
                "polled"
            } else {
                "direct"
            };
            println!("Hang reported ({source})");
            println!("  pending task: {}", report.pending_task);
            println!("  overdue: {} ms", report.overdue_ms);
            println!("  trace:");
            for line in report.stack_trace.lines() {
                println!("    {line}");
            }
        }
        None if opts.json => println!("null"),
        None => println!("No hang reported"),
    }
    Ok(())
}

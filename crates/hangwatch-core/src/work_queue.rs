//! Primary-thread work queue.
//!
//! A sequential task loop in the style of a UI event loop: tasks are posted
//! from any thread with a scheduled time and run one at a time on the thread
//! that calls [`WorkQueue::run`]. The queue exposes exactly what hang
//! detection needs and nothing more:
//!
//! - a read-only snapshot of its head task ([`PendingQueue`]), republished
//!   after every mutation so observers never touch the queue lock;
//! - a [`Heartbeat`] recorded on every loop iteration, including idle wakeups;
//! - a task-level trace of what the primary thread is doing right now.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock, TryLockError};
use std::time::Duration;

use tracing::{debug, trace};

use crate::dispatch::StackTraceProvider;
use crate::error::IntrospectionError;
use crate::queue::{PendingQueue, PendingTask};
use crate::time::Clock;
use crate::watchdog::Heartbeat;

/// Longest the loop sleeps without recording a heartbeat. Must stay well
/// below any watchdog staleness threshold so an idle loop never looks stalled.
pub const IDLE_WAKEUP: Duration = Duration::from_millis(100);

type Job = Box<dyn FnOnce() + Send + 'static>;

struct QueuedTask {
    description: String,
    job: Job,
}

#[derive(Default)]
struct QueueState {
    /// Keyed by (scheduled_at_ms, sequence) so equal times stay FIFO.
    tasks: BTreeMap<(u64, u64), QueuedTask>,
    quit: bool,
}

#[derive(Debug, Clone)]
struct RunningTask {
    description: String,
    started_at_ms: u64,
}

/// Sequential task queue drained by a single primary thread.
pub struct WorkQueue {
    state: Mutex<QueueState>,
    wake: Condvar,
    head: RwLock<Option<PendingTask>>,
    running: RwLock<Option<RunningTask>>,
    primary_thread: RwLock<Option<String>>,
    pending: AtomicUsize,
    next_seq: AtomicU64,
    heartbeat: Arc<Heartbeat>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for WorkQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkQueue")
            .field("pending", &self.pending_len())
            .finish_non_exhaustive()
    }
}

impl WorkQueue {
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let heartbeat = Arc::new(Heartbeat::new(Arc::clone(&clock)));
        Self {
            state: Mutex::new(QueueState::default()),
            wake: Condvar::new(),
            head: RwLock::new(None),
            running: RwLock::new(None),
            primary_thread: RwLock::new(None),
            pending: AtomicUsize::new(0),
            next_seq: AtomicU64::new(0),
            heartbeat,
            clock,
        }
    }

    /// Heartbeat recorded by the primary loop.
    #[must_use]
    pub fn heartbeat(&self) -> Arc<Heartbeat> {
        Arc::clone(&self.heartbeat)
    }

    #[must_use]
    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    /// Run `job` as soon as the primary thread gets to it.
    pub fn post(&self, description: impl Into<String>, job: impl FnOnce() + Send + 'static) {
        let now = self.clock.now_ms();
        self.enqueue(now, description.into(), Box::new(job));
    }

    /// Run `job` no earlier than `delay` from now.
    pub fn post_delayed(
        &self,
        description: impl Into<String>,
        delay: Duration,
        job: impl FnOnce() + Send + 'static,
    ) {
        let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        let when = self.clock.now_ms().saturating_add(delay_ms);
        self.enqueue(when, description.into(), Box::new(job));
    }

    /// Run `job` before everything else. The task carries no scheduled time.
    pub fn post_at_front(&self, description: impl Into<String>, job: impl FnOnce() + Send + 'static) {
        self.enqueue(0, description.into(), Box::new(job));
    }

    /// Stop the loop after the current task. Pending tasks are discarded.
    pub fn quit(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.quit = true;
            state.tasks.clear();
            self.pending.store(0, Ordering::SeqCst);
            self.publish_head(&state);
        }
        self.wake.notify_all();
    }

    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    fn enqueue(&self, when: u64, description: String, job: Job) {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        if state.quit {
            debug!(task = %description, "Work queue has quit; dropping task");
            return;
        }
        state.tasks.insert((when, seq), QueuedTask { description, job });
        self.pending.store(state.tasks.len(), Ordering::SeqCst);
        self.publish_head(&state);
        drop(state);
        self.wake.notify_one();
    }

    fn publish_head(&self, state: &QueueState) {
        let head = state
            .tasks
            .iter()
            .next()
            .map(|((when, _), task)| PendingTask::new(task.description.clone(), *when));
        if let Ok(mut slot) = self.head.write() {
            *slot = head;
        }
    }

    /// Drain tasks on the calling thread until [`quit`](Self::quit).
    pub fn run(&self) {
        if let Ok(mut name) = self.primary_thread.write() {
            *name = Some(
                std::thread::current()
                    .name()
                    .unwrap_or("<unnamed>")
                    .to_string(),
            );
        }
        debug!("Work queue loop started");

        while let Some(task) = self.next_task() {
            let started_at_ms = self.clock.now_ms();
            if let Ok(mut running) = self.running.write() {
                *running = Some(RunningTask {
                    description: task.description.clone(),
                    started_at_ms,
                });
            }
            trace!(task = %task.description, "Running task");

            (task.job)();

            if let Ok(mut running) = self.running.write() {
                *running = None;
            }
            self.heartbeat.record();
        }

        debug!("Work queue loop stopped");
    }

    /// Block until a task is due or the queue quits.
    fn next_task(&self) -> Option<QueuedTask> {
        let mut state = self.state.lock().ok()?;
        loop {
            self.heartbeat.record();
            if state.quit {
                return None;
            }

            let now = self.clock.now_ms();
            let due_in = state
                .tasks
                .keys()
                .next()
                .map(|(when, _)| when.saturating_sub(now));

            match due_in {
                Some(0) => {
                    let (_, task) = state.tasks.pop_first()?;
                    self.pending.store(state.tasks.len(), Ordering::SeqCst);
                    self.publish_head(&state);
                    return Some(task);
                }
                Some(ms) => {
                    let wait = Duration::from_millis(ms).min(IDLE_WAKEUP);
                    state = self.wake.wait_timeout(state, wait).ok()?.0;
                }
                None => {
                    state = self.wake.wait_timeout(state, IDLE_WAKEUP).ok()?.0;
                }
            }
        }
    }

    /// Task-level trace of the primary thread.
    #[must_use]
    pub fn describe(&self) -> String {
        let mut out = String::new();
        let thread = self
            .primary_thread
            .try_read()
            .ok()
            .and_then(|n| n.clone())
            .unwrap_or_else(|| "<not started>".to_string());
        let _ = writeln!(out, "primary thread \"{thread}\"");

        match self.running.try_read().ok().and_then(|r| r.clone()) {
            Some(running) => {
                let elapsed = self.clock.now_ms().saturating_sub(running.started_at_ms);
                let _ = writeln!(
                    out,
                    "  running: {} (for {elapsed} ms)",
                    running.description
                );
            }
            None => {
                let _ = writeln!(out, "  running: <idle>");
            }
        }

        match self.peek_head_task() {
            Ok(Some(head)) if head.is_scheduled() => {
                let now = self.clock.now_ms();
                if head.scheduled_at_ms > now {
                    let ahead = head.scheduled_at_ms - now;
                    let _ = writeln!(out, "  next: {} (due in {ahead} ms)", head.description);
                } else {
                    let overdue = now - head.scheduled_at_ms;
                    let _ = writeln!(out, "  next: {} (due {overdue} ms ago)", head.description);
                }
            }
            Ok(Some(head)) => {
                let _ = writeln!(out, "  next: {} (unscheduled)", head.description);
            }
            Ok(None) => {
                let _ = writeln!(out, "  next: <empty>");
            }
            Err(err) => {
                let _ = writeln!(out, "  next: <unavailable: {err}>");
            }
        }
        let _ = write!(out, "  pending: {}", self.pending_len());
        out
    }
}

impl PendingQueue for WorkQueue {
    fn peek_head_task(&self) -> Result<Option<PendingTask>, IntrospectionError> {
        match self.head.try_read() {
            Ok(head) => Ok(head.clone()),
            Err(TryLockError::WouldBlock) => Err(IntrospectionError::QueueBusy),
            Err(TryLockError::Poisoned(_)) => Err(IntrospectionError::QueueUnavailable(
                "head snapshot poisoned".to_string(),
            )),
        }
    }
}

impl StackTraceProvider for WorkQueue {
    fn capture(&self) -> String {
        self.describe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::{ManualClock, MonotonicClock};
    use std::sync::mpsc;

    #[test]
    fn head_snapshot_tracks_earliest_task() {
        let clock = Arc::new(ManualClock::new(1_000));
        let queue = WorkQueue::new(clock);
        assert_eq!(queue.peek_head_task().unwrap(), None);

        queue.post_delayed("later", Duration::from_millis(500), || {});
        queue.post("now", || {});
        let head = queue.peek_head_task().unwrap().unwrap();
        assert_eq!(head, PendingTask::new("now", 1_000));
        assert_eq!(queue.pending_len(), 2);

        queue.post_at_front("barrier", || {});
        let head = queue.peek_head_task().unwrap().unwrap();
        assert_eq!(head.description, "barrier");
        assert!(!head.is_scheduled());
    }

    #[test]
    fn equal_times_keep_fifo_order() {
        let clock = Arc::new(ManualClock::new(50));
        let queue = WorkQueue::new(clock);
        queue.post("first", || {});
        queue.post("second", || {});
        assert_eq!(
            queue.peek_head_task().unwrap().unwrap().description,
            "first"
        );
    }

    #[test]
    fn peek_does_not_consume() {
        let queue = WorkQueue::new(Arc::new(ManualClock::new(1)));
        queue.post("only", || {});
        for _ in 0..3 {
            assert!(queue.peek_head_task().unwrap().is_some());
        }
        assert_eq!(queue.pending_len(), 1);
    }

    #[test]
    fn quit_clears_head() {
        let queue = WorkQueue::new(Arc::new(ManualClock::new(1)));
        queue.post("task", || {});
        queue.quit();
        assert_eq!(queue.peek_head_task().unwrap(), None);
        assert_eq!(queue.pending_len(), 0);
        queue.post("after quit", || {});
        assert_eq!(queue.pending_len(), 0);
    }

    #[test]
    fn run_executes_tasks_in_order_and_records_heartbeat() {
        let queue = Arc::new(WorkQueue::new(Arc::new(MonotonicClock)));
        let (tx, rx) = mpsc::channel();

        for i in 0..3 {
            let tx = tx.clone();
            queue.post(format!("task-{i}"), move || tx.send(i).unwrap());
        }
        let q = Arc::clone(&queue);
        queue.post("stop", move || q.quit());

        let runner = Arc::clone(&queue);
        let handle = std::thread::Builder::new()
            .name("primary".into())
            .spawn(move || runner.run())
            .unwrap();
        handle.join().unwrap();

        let order: Vec<i32> = rx.try_iter().collect();
        assert_eq!(order, vec![0, 1, 2]);
        assert!(queue.heartbeat().last_ms() > 0);
        assert!(queue.describe().contains("primary thread \"primary\""));
    }

    #[test]
    fn delayed_task_waits_for_its_time() {
        let queue = Arc::new(WorkQueue::new(Arc::new(MonotonicClock)));
        let (tx, rx) = mpsc::channel();
        let posted = std::time::Instant::now();
        let q = Arc::clone(&queue);
        queue.post_delayed("delayed", Duration::from_millis(50), move || {
            tx.send(posted.elapsed()).unwrap();
            q.quit();
        });

        let runner = Arc::clone(&queue);
        std::thread::spawn(move || runner.run()).join().unwrap();
        let elapsed = rx.recv().unwrap();
        assert!(elapsed >= Duration::from_millis(50));
    }

    #[test]
    fn describe_reports_idle_and_head() {
        let clock = Arc::new(ManualClock::new(10_000));
        let queue = WorkQueue::new(Arc::clone(&clock) as Arc<dyn Clock>);
        queue.post("input event", || {});
        clock.advance(Duration::from_millis(2_500));
        let text = queue.capture();
        assert!(text.contains("<not started>"));
        assert!(text.contains("running: <idle>"));
        assert!(text.contains("next: input event (due 2500 ms ago)"));
        assert!(text.contains("pending: 1"));
    }

    #[test]
    fn describe_reports_future_head_as_upcoming() {
        let clock = Arc::new(ManualClock::new(10_000));
        let queue = WorkQueue::new(Arc::clone(&clock) as Arc<dyn Clock>);
        queue.post_delayed("retry upload", Duration::from_millis(800), || {});
        clock.advance(Duration::from_millis(300));
        let text = queue.describe();
        assert!(text.contains("next: retry upload (due in 500 ms)"));
        assert!(!text.contains("ago"));
    }
}

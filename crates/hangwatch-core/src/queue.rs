//! Read-only access to the head of the primary thread's pending-work queue.
//!
//! The scheduler opts in by implementing [`PendingQueue`]; the detector
//! never reaches into scheduler internals. [`QueueHeadInspector`] turns the
//! raw head snapshot into an overdue measurement and swallows every
//! introspection failure.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::IntrospectionError;
use crate::time::Clock;

/// Snapshot of one task waiting on the primary thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingTask {
    pub description: String,
    /// Scheduled execution time on the queue's clock; 0 means unscheduled.
    pub scheduled_at_ms: u64,
}

impl PendingTask {
    #[must_use]
    pub fn new(description: impl Into<String>, scheduled_at_ms: u64) -> Self {
        Self {
            description: description.into(),
            scheduled_at_ms,
        }
    }

    #[must_use]
    pub fn is_scheduled(&self) -> bool {
        self.scheduled_at_ms != 0
    }
}

/// Capability a scheduler exposes so its head task can be observed.
///
/// Implementations must not block on the primary thread, and must not
/// enqueue, dequeue or reorder anything.
pub trait PendingQueue: Send + Sync {
    fn peek_head_task(&self) -> Result<Option<PendingTask>, IntrospectionError>;
}

/// Head task plus how overdue it is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeadObservation {
    pub description: String,
    /// `scheduled - now`; negative when past due, 0 when unscheduled.
    pub overdue_ms: i64,
}

/// Non-blocking reader for the queue head.
#[derive(Clone)]
pub struct QueueHeadInspector {
    queue: Arc<dyn PendingQueue>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for QueueHeadInspector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueHeadInspector").finish_non_exhaustive()
    }
}

impl QueueHeadInspector {
    #[must_use]
    pub fn new(queue: Arc<dyn PendingQueue>, clock: Arc<dyn Clock>) -> Self {
        Self { queue, clock }
    }

    /// Observe the head task. Failures and empty queues both yield `None`.
    #[must_use]
    pub fn peek_head(&self) -> Option<HeadObservation> {
        let task = match self.queue.peek_head_task() {
            Ok(Some(task)) => task,
            Ok(None) => return None,
            Err(err) => {
                debug!(error = %err, "Queue head inspection failed; treating as no evidence");
                return None;
            }
        };

        let overdue_ms = if task.is_scheduled() {
            overdue_between(task.scheduled_at_ms, self.clock.now_ms())
        } else {
            0
        };

        Some(HeadObservation {
            description: task.description,
            overdue_ms,
        })
    }
}

fn overdue_between(scheduled_ms: u64, now_ms: u64) -> i64 {
    let diff = i128::from(scheduled_ms) - i128::from(now_ms);
    i64::try_from(diff).unwrap_or(if diff < 0 { i64::MIN } else { i64::MAX })
}

//! Queue-head hang heuristic.
//!
//! A primary thread that is merely busy keeps draining its queue, so the
//! head task is at most slightly past due. A stalled thread leaves the head
//! task sitting well past its scheduled time. How far past due counts as
//! stalled depends on whether the process is in the foreground:
//!
//! | State      | Threshold | Blocked when          |
//! |------------|-----------|-----------------------|
//! | foreground | -2000 ms  | `overdue < -2000`     |
//! | background | -10000 ms | `overdue < -10000`    |
//!
//! An overdue value of exactly 0 means there is nothing to judge.

use serde::{Deserialize, Serialize};

use crate::config::ThresholdConfig;
use crate::queue::QueueHeadInspector;

/// Maps (foreground, overdue) to a blocked verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThresholdPolicy {
    thresholds: ThresholdConfig,
}

impl Default for ThresholdPolicy {
    fn default() -> Self {
        Self::new(ThresholdConfig::default())
    }
}

impl ThresholdPolicy {
    #[must_use]
    pub fn new(thresholds: ThresholdConfig) -> Self {
        Self { thresholds }
    }

    #[must_use]
    pub fn threshold_ms(&self, is_foreground: bool) -> i64 {
        if is_foreground {
            self.thresholds.foreground_ms
        } else {
            self.thresholds.background_ms
        }
    }

    #[must_use]
    pub fn is_blocked(&self, is_foreground: bool, overdue_ms: i64) -> bool {
        if overdue_ms == 0 {
            return false;
        }
        overdue_ms < self.threshold_ms(is_foreground)
    }
}

/// What the heuristic saw when a signal fired.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HangEvidence {
    pub is_foreground: bool,
    /// Head task description; empty when the queue could not be read.
    pub pending_task_description: String,
    /// Negative = overdue; 0 = no evidence.
    pub overdue_ms: i64,
    /// Verdict of the threshold policy for this evidence.
    pub blocked: bool,
}

impl HangEvidence {
    /// Evidence carrying nothing but the foreground flag.
    #[must_use]
    pub fn none(is_foreground: bool) -> Self {
        Self {
            is_foreground,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn has_evidence(&self) -> bool {
        self.overdue_ms != 0
    }
}

/// Single blocked/not-blocked gate run inside the signal callback.
///
/// Does no I/O and never sleeps.
#[derive(Debug, Clone)]
pub struct HangHeuristic {
    inspector: QueueHeadInspector,
    policy: ThresholdPolicy,
}

impl HangHeuristic {
    #[must_use]
    pub fn new(inspector: QueueHeadInspector, policy: ThresholdPolicy) -> Self {
        Self { inspector, policy }
    }

    #[must_use]
    pub fn policy(&self) -> &ThresholdPolicy {
        &self.policy
    }

    #[must_use]
    pub fn evaluate(&self, is_foreground: bool) -> HangEvidence {
        let Some(head) = self.inspector.peek_head() else {
            return HangEvidence::none(is_foreground);
        };

        HangEvidence {
            is_foreground,
            blocked: self.policy.is_blocked(is_foreground, head.overdue_ms),
            pending_task_description: head.description,
            overdue_ms: head.overdue_ms,
        }
    }
}

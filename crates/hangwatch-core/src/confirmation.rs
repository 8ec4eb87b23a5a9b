//! Interval-based hang confirmation against the OS error-state list.
//!
//! When the queue-head heuristic is inconclusive, the environment itself
//! may still flag this process as not responding a little later. The loop
//! polls for that verdict at a fixed interval, bounded by an attempt budget:
//!
//! ```text
//!            match                        query error
//!   Polling(n) ─────► Confirmed   Polling(n) ──────────► Exhausted
//!       │
//!       │ no match, n+1 < max: sleep(interval)
//!       ▼
//!   Polling(n+1)  ...  Polling(max-1) ── no match ──► Exhausted
//! ```
//!
//! There is no wall-clock deadline. A slow query stretches the episode
//! beyond `interval * max_attempts`.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::PollingConfig;
use crate::process::{ErrorStateQuery, ProcessIdentity};
use crate::time::Sleeper;

/// Why a confirmation episode ended without a verdict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExhaustReason {
    BudgetSpent,
    QueryFailed(String),
}

/// Confirmation state machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum ConfirmationState {
    /// `attempt` queries have been made so far.
    Polling { attempt: u32 },
    /// The environment reported this process as not responding on the
    /// `attempt`-th query (1-based).
    Confirmed { attempt: u32 },
    /// No verdict after `attempts` queries.
    Exhausted { attempts: u32, reason: ExhaustReason },
}

impl ConfirmationState {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Polling { .. })
    }

    #[must_use]
    pub fn is_confirmed(&self) -> bool {
        matches!(self, Self::Confirmed { .. })
    }
}

/// Polls an [`ErrorStateQuery`] until this process shows up as not
/// responding or the attempt budget runs out.
#[derive(Clone)]
pub struct ConfirmationLoop {
    query: Arc<dyn ErrorStateQuery>,
    identity: ProcessIdentity,
    polling: PollingConfig,
    sleeper: Arc<dyn Sleeper>,
}

impl std::fmt::Debug for ConfirmationLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfirmationLoop")
            .field("identity", &self.identity)
            .field("polling", &self.polling)
            .finish_non_exhaustive()
    }
}

impl ConfirmationLoop {
    #[must_use]
    pub fn new(
        query: Arc<dyn ErrorStateQuery>,
        identity: ProcessIdentity,
        polling: PollingConfig,
        sleeper: Arc<dyn Sleeper>,
    ) -> Self {
        Self {
            query,
            identity,
            polling,
            sleeper,
        }
    }

    #[must_use]
    pub fn polling(&self) -> PollingConfig {
        self.polling
    }

    /// Advance the state machine by one tick. Terminal states are returned
    /// unchanged.
    #[must_use]
    pub fn step(&self, state: ConfirmationState) -> ConfirmationState {
        let ConfirmationState::Polling { attempt } = state else {
            return state;
        };
        let this_attempt = attempt.saturating_add(1);

        match self.check_error_state(this_attempt) {
            Err(reason) => {
                warn!(attempt = this_attempt, error = %reason, "Error-state query failed; abandoning confirmation");
                ConfirmationState::Exhausted {
                    attempts: this_attempt,
                    reason: ExhaustReason::QueryFailed(reason),
                }
            }
            Ok(true) => ConfirmationState::Confirmed {
                attempt: this_attempt,
            },
            Ok(false) if this_attempt < self.polling.max_attempts => {
                self.sleeper.sleep(self.polling.interval());
                ConfirmationState::Polling {
                    attempt: this_attempt,
                }
            }
            Ok(false) => ConfirmationState::Exhausted {
                attempts: this_attempt,
                reason: ExhaustReason::BudgetSpent,
            },
        }
    }

    /// Run from `Polling { attempt: 0 }` to a terminal state.
    #[must_use]
    pub fn run(&self) -> ConfirmationState {
        let mut state = ConfirmationState::Polling { attempt: 0 };
        while !state.is_terminal() {
            state = self.step(state);
        }

        match &state {
            ConfirmationState::Confirmed { attempt } => {
                info!(attempt, pid = self.identity.pid, "Hang confirmed by error-state query");
            }
            ConfirmationState::Exhausted { attempts, reason } => {
                debug!(attempts, reason = ?reason, "Hang confirmation exhausted; dropping signal");
            }
            ConfirmationState::Polling { .. } => {}
        }
        state
    }

    /// One query. `Ok(true)` when this process is reported not responding.
    fn check_error_state(&self, attempt: u32) -> Result<bool, String> {
        let entries = self
            .query
            .processes_in_error_state()
            .map_err(|e| e.to_string())?;

        let mut matched = false;
        for entry in &entries {
            debug!(
                attempt,
                pid = entry.pid,
                process_name = %entry.process_name,
                condition = %entry.condition,
                "Found process in error state"
            );
            if entry.is_foreign_hang(&self.identity) {
                info!(
                    pid = entry.pid,
                    process_name = %entry.process_name,
                    "Another application may be hung; not counting it"
                );
            }
            if entry.confirms(&self.identity) {
                matched = true;
            }
        }
        Ok(matched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::IntrospectionError;
    use crate::process::{ErrorCondition, ProcessErrorState};
    use crate::time::RecordingSleeper;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    const ME: ProcessIdentity = ProcessIdentity {
        pid: 4242,
        uid: Some(10_001),
    };

    /// Returns `script[call]`, or the last entry once the script runs out.
    struct ScriptedQuery {
        calls: AtomicU32,
        script: Mutex<Vec<Result<Vec<ProcessErrorState>, IntrospectionError>>>,
    }

    impl ScriptedQuery {
        fn new(script: Vec<Result<Vec<ProcessErrorState>, IntrospectionError>>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                script: Mutex::new(script),
            })
        }

        fn matching_on(attempt: u32) -> Arc<Self> {
            let mut script: Vec<_> = (1..attempt).map(|_| Ok(Vec::new())).collect();
            script.push(Ok(vec![ProcessErrorState::not_responding(
                ME.pid, ME.uid, "me",
            )]));
            Self::new(script)
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl ErrorStateQuery for ScriptedQuery {
        fn processes_in_error_state(
            &self,
        ) -> Result<Vec<ProcessErrorState>, IntrospectionError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) as usize;
            let script = self.script.lock().unwrap();
            script
                .get(n)
                .or_else(|| script.last())
                .cloned()
                .unwrap_or(Ok(Vec::new()))
        }
    }

    fn looped(query: Arc<ScriptedQuery>, sleeper: Arc<RecordingSleeper>) -> ConfirmationLoop {
        ConfirmationLoop::new(query, ME, PollingConfig::default(), sleeper)
    }

    #[test]
    fn never_matching_query_exhausts_after_forty_attempts() {
        let query = ScriptedQuery::new(vec![Ok(Vec::new())]);
        let sleeper = Arc::new(RecordingSleeper::new());
        let state = looped(Arc::clone(&query), Arc::clone(&sleeper)).run();

        assert_eq!(
            state,
            ConfirmationState::Exhausted {
                attempts: 40,
                reason: ExhaustReason::BudgetSpent
            }
        );
        assert_eq!(query.calls(), 40);
        // One interval between consecutive queries, no trailing sleep.
        assert_eq!(sleeper.count(), 39);
        assert_eq!(sleeper.total(), Duration::from_millis(39 * 500));
        assert!(sleeper.total() <= PollingConfig::default().budget());
    }

    #[test]
    fn match_on_fifth_attempt_stops_immediately() {
        let query = ScriptedQuery::matching_on(5);
        let sleeper = Arc::new(RecordingSleeper::new());
        let state = looped(Arc::clone(&query), Arc::clone(&sleeper)).run();

        assert_eq!(state, ConfirmationState::Confirmed { attempt: 5 });
        assert_eq!(query.calls(), 5);
        assert_eq!(sleeper.count(), 4);
    }

    #[test]
    fn match_on_first_attempt_never_sleeps() {
        let query = ScriptedQuery::matching_on(1);
        let sleeper = Arc::new(RecordingSleeper::new());
        let state = looped(query, Arc::clone(&sleeper)).run();
        assert_eq!(state, ConfirmationState::Confirmed { attempt: 1 });
        assert_eq!(sleeper.count(), 0);
    }

    #[test]
    fn other_processes_never_confirm() {
        let query = ScriptedQuery::new(vec![Ok(vec![
            ProcessErrorState::not_responding(1, Some(99), "other-app"),
            ProcessErrorState {
                pid: ME.pid,
                uid: ME.uid,
                process_name: "me".into(),
                condition: ErrorCondition::Crashed,
            },
        ])]);
        let sleeper = Arc::new(RecordingSleeper::new());
        let state = looped(Arc::clone(&query), sleeper).run();
        assert!(matches!(
            state,
            ConfirmationState::Exhausted {
                attempts: 40,
                reason: ExhaustReason::BudgetSpent
            }
        ));
        assert_eq!(query.calls(), 40);
    }

    #[test]
    fn query_error_aborts_without_retry() {
        let query = ScriptedQuery::new(vec![
            Ok(Vec::new()),
            Err(IntrospectionError::PermissionDenied("no access".into())),
            Ok(vec![ProcessErrorState::not_responding(ME.pid, ME.uid, "me")]),
        ]);
        let sleeper = Arc::new(RecordingSleeper::new());
        let state = looped(Arc::clone(&query), Arc::clone(&sleeper)).run();

        match state {
            ConfirmationState::Exhausted {
                attempts,
                reason: ExhaustReason::QueryFailed(msg),
            } => {
                assert_eq!(attempts, 2);
                assert!(msg.contains("no access"));
            }
            other => panic!("unexpected state {other:?}"),
        }
        assert_eq!(query.calls(), 2);
        assert_eq!(sleeper.count(), 1);
    }

    #[test]
    fn step_leaves_terminal_states_alone() {
        let query = ScriptedQuery::new(vec![Ok(Vec::new())]);
        let lp = looped(Arc::clone(&query), Arc::new(RecordingSleeper::new()));
        let done = ConfirmationState::Confirmed { attempt: 3 };
        assert_eq!(lp.step(done.clone()), done);
        assert_eq!(query.calls(), 0);
    }

    #[test]
    fn single_attempt_budget() {
        let query = ScriptedQuery::new(vec![Ok(Vec::new())]);
        let sleeper = Arc::new(RecordingSleeper::new());
        let lp = ConfirmationLoop::new(
            query,
            ME,
            PollingConfig {
                interval_ms: 10,
                max_attempts: 1,
            },
            Arc::clone(&sleeper) as Arc<dyn Sleeper>,
        );
        assert!(matches!(
            lp.run(),
            ConfirmationState::Exhausted { attempts: 1, .. }
        ));
        assert_eq!(sleeper.count(), 0);
    }

    #[test]
    fn state_serializes_with_tag() {
        let json = serde_json::to_string(&ConfirmationState::Confirmed { attempt: 5 }).unwrap();
        assert_eq!(json, r#"{"state":"confirmed","attempt":5}"#);
    }
}

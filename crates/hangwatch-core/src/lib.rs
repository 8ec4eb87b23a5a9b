//! hangwatch-core: Core library for hangwatch
//!
//! Detects when an application's primary thread stops responding, confirms
//! the suspicion, and reports each confirmed hang exactly once.
//!
//! # Architecture
//!
//! ```text
//! WorkQueue ──heartbeat──► WatchdogSignalSource
//!     │                           │ on_hang_detected
//!     │ peek_head_task            ▼
//!     └──────────────► HangDetector ──► HangHeuristic ──blocked──► HangReportDispatcher
//!                                             │                           ▲
//!                                             └─ inconclusive ─► ConfirmationLoop
//! ```
//!
//! # Modules
//!
//! - `config`: TOML configuration (thresholds, polling, trace paths, logging)
//! - `queue`: Head-task capability and the non-blocking inspector
//! - `heuristic`: Threshold policy and blocked verdict
//! - `process`: Process identity and the environment's error-state query
//! - `confirmation`: Polling state machine that confirms inconclusive signals
//! - `dispatch`: Report assembly, sink selection, at-most-once episodes
//! - `spawn`: Where confirmation episodes run
//! - `signal`: Signal source seam and a host-driven source
//! - `watchdog`: Heartbeat watchdog signal source
//! - `work_queue`: A primary-thread task loop exposing its head
//! - `detector`: Entry points wiring all of the above together
//! - `trace`: Trace file writing and printing
//! - `logging`: tracing subscriber setup
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod config;
pub mod confirmation;
pub mod detector;
pub mod dispatch;
pub mod error;
pub mod foreground;
pub mod heuristic;
pub mod logging;
pub mod process;
pub mod queue;
pub mod signal;
pub mod spawn;
pub mod time;
pub mod trace;
pub mod watchdog;
pub mod work_queue;

pub use error::{Error, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_is_set() {
        assert!(!VERSION.is_empty());
    }
}

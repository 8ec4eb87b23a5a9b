//! Error types for hangwatch-core
//!
//! Three families matter to the detection pipeline:
//!
//! | Family                 | Origin                               | Handling                         |
//! |------------------------|--------------------------------------|----------------------------------|
//! | [`IntrospectionError`] | queue peek, OS error-state query     | recovered as "no evidence"       |
//! | [`ConfigError`]        | config files, trace paths, lifecycle | logged, operation becomes no-op  |
//! | [`DeliveryError`]      | report sinks                         | event dropped, logged at error   |
//!
//! None of them escape the heuristic or the confirmation loop.

use std::fmt::Write;
use thiserror::Error;

/// Actionable remediation guidance for an error
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Remediation {
    /// One-line summary of how to fix the issue
    pub summary: String,
    /// Additional alternative guidance
    pub alternatives: Vec<String>,
}

impl Remediation {
    /// Create a new remediation with a summary
    #[must_use]
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            alternatives: Vec::new(),
        }
    }

    /// Add an alternative suggestion
    #[must_use]
    pub fn alternative(mut self, alternative: impl Into<String>) -> Self {
        self.alternatives.push(alternative.into());
        self
    }

    /// Render remediation text for human-readable output
    #[must_use]
    pub fn render_plain(&self) -> String {
        let mut output = String::new();
        let _ = writeln!(output, "To fix:");
        let _ = writeln!(output, "  {}", self.summary);

        if !self.alternatives.is_empty() {
            let _ = writeln!(output, "  Alternatives:");
            for alt in &self.alternatives {
                let _ = writeln!(output, "    - {alt}");
            }
        }

        output
    }
}

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for hangwatch-core
#[derive(Error, Debug)]
pub enum Error {
    /// Queue or OS introspection errors
    #[error("Introspection error: {0}")]
    Introspection(#[from] IntrospectionError),

    /// Configuration and lifecycle errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Report delivery errors
    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Worker spawn failures and similar runtime errors
    #[error("Runtime error: {0}")]
    Runtime(String),
}

impl Error {
    /// Return remediation guidance when available.
    #[must_use]
    pub fn remediation(&self) -> Option<Remediation> {
        match self {
            Self::Introspection(err) => Some(err.remediation()),
            Self::Config(err) => Some(err.remediation()),
            Self::Delivery(err) => Some(err.remediation()),
            Self::Io(_) => Some(
                Remediation::new("Check filesystem permissions and paths, then retry.")
                    .alternative("Verify the trace directory exists and is writable."),
            ),
            Self::Json(_) => Some(
                Remediation::new("Validate the JSON input and retry.")
                    .alternative("Check for trailing commas or invalid UTF-8."),
            ),
            Self::Runtime(_) => None,
        }
    }
}

/// Failures while looking at the primary queue or at OS process state.
///
/// These never surface to callers of the pipeline; they collapse into
/// "no evidence" or "inconclusive".
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IntrospectionError {
    /// The queue snapshot is being replaced right now
    #[error("pending queue snapshot is busy")]
    QueueBusy,

    /// The queue cannot be inspected at all (shut down, poisoned)
    #[error("pending queue unavailable: {0}")]
    QueueUnavailable(String),

    /// Error-state query not permitted for this process
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Error-state query failed
    #[error("error-state query failed: {0}")]
    QueryFailed(String),

    /// Error-state source returned data we cannot interpret
    #[error("malformed error-state data: {0}")]
    Malformed(String),
}

impl IntrospectionError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::QueueBusy | Self::QueueUnavailable(_) => Remediation::new(
                "Queue introspection is best-effort; the signal was treated as inconclusive.",
            )
            .alternative("Make sure the primary work queue is still running."),
            Self::PermissionDenied(_) => {
                Remediation::new("Grant the process read access to the error-state source.")
            }
            Self::QueryFailed(_) | Self::Malformed(_) => Remediation::new(
                "Check the supervisor that maintains the error-state file.",
            )
            .alternative("The file must contain a JSON array of error-state entries."),
        }
    }
}

/// Configuration-specific errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    FileNotFound(String),

    #[error("Failed to read config file {path}: {message}")]
    ReadFailed { path: String, message: String },

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Failed to serialize config: {0}")]
    SerializeError(String),

    #[error("Invalid config value: {0}")]
    ValidationError(String),

    #[error("{0} trace file path has not been set")]
    TracePathUnset(&'static str),

    #[error("hang detector has not been initialized")]
    NotInitialized,
}

impl ConfigError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::FileNotFound(path) => {
                Remediation::new(format!("Create the config file or pass a valid path: {path}"))
                    .alternative("Run `hw config` to print the defaults.")
            }
            Self::ReadFailed { path, .. } => {
                Remediation::new(format!("Check permissions on {path} and retry."))
            }
            Self::ParseError(_) => Remediation::new("Fix the TOML syntax in the config file.")
                .alternative("Run `hw config` to print a known-good layout."),
            Self::SerializeError(_) => Remediation::new("Report this as a bug."),
            Self::ValidationError(_) => Remediation::new(
                "Thresholds must be negative, polling values non-zero, and watchdog.stale_ms above 100.",
            ),
            Self::TracePathUnset(_) => {
                Remediation::new("Set the trace file paths under [traces] in the config.")
            }
            Self::NotInitialized => {
                Remediation::new("Call `HangDetector::init` before requesting trace output.")
            }
        }
    }
}

/// Report delivery errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("no report sink is registered")]
    NoSink,

    #[error("report sink rejected the event: {0}")]
    SinkFailed(String),
}

impl DeliveryError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::NoSink => Remediation::new(
                "Register a hang listener or a default issue reporter on the detector.",
            ),
            Self::SinkFailed(_) => Remediation::new("Check the reporter's transport and retry."),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remediation_renders_alternatives() {
        let text = Remediation::new("do the thing")
            .alternative("or this")
            .render_plain();
        assert!(text.starts_with("To fix:"));
        assert!(text.contains("  do the thing"));
        assert!(text.contains("    - or this"));
    }

    #[test]
    fn remediation_without_alternatives_omits_section() {
        let text = Remediation::new("only summary").render_plain();
        assert!(!text.contains("Alternatives"));
    }

    #[test]
    fn introspection_error_converts_into_error() {
        let err: Error = IntrospectionError::QueueBusy.into();
        assert!(matches!(err, Error::Introspection(IntrospectionError::QueueBusy)));
        assert!(err.to_string().contains("busy"));
        assert!(err.remediation().is_some());
    }

    #[test]
    fn trace_path_unset_names_the_path() {
        let err = ConfigError::TracePathUnset("print");
        assert_eq!(err.to_string(), "print trace file path has not been set");
    }

    #[test]
    fn delivery_error_display() {
        assert_eq!(
            DeliveryError::NoSink.to_string(),
            "no report sink is registered"
        );
        let err = DeliveryError::SinkFailed("closed".into());
        assert!(err.to_string().contains("closed"));
    }

    #[test]
    fn runtime_error_has_no_remediation() {
        assert!(Error::Runtime("spawn".into()).remediation().is_none());
    }
}

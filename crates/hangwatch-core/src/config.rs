//! Configuration management for hangwatch
//!
//! Handles loading and validation of `hangwatch.toml` files. Every section
//! is optional; missing sections fall back to the built-in defaults, which
//! are the detection constants the pipeline was tuned with.
//!
//! ```toml
//! [thresholds]
//! foreground_ms = -2000
//! background_ms = -10000
//!
//! [polling]
//! interval_ms = 500
//! max_attempts = 40
//!
//! [traces]
//! hang_trace_file = "/tmp/hang_trace.txt"
//! print_trace_file = "/tmp/print_trace.txt"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::logging::LogConfig;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct HangwatchConfig {
    /// Overdue thresholds for the queue-head heuristic
    #[serde(default)]
    pub thresholds: ThresholdConfig,

    /// Confirmation loop cadence
    #[serde(default)]
    pub polling: PollingConfig,

    /// Trace file locations
    #[serde(default)]
    pub traces: TraceConfig,

    /// Logging settings
    #[serde(default)]
    pub logging: LogConfig,

    /// Heartbeat watchdog settings
    #[serde(default)]
    pub watchdog: WatchdogSettings,
}

/// How overdue the primary queue head must be before the thread counts as
/// blocked. Both values are negative: `-2000` means "two seconds past due".
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ThresholdConfig {
    #[serde(default = "default_foreground_threshold")]
    pub foreground_ms: i64,

    #[serde(default = "default_background_threshold")]
    pub background_ms: i64,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            foreground_ms: default_foreground_threshold(),
            background_ms: default_background_threshold(),
        }
    }
}

fn default_foreground_threshold() -> i64 {
    -2_000
}

fn default_background_threshold() -> i64 {
    -10_000
}

/// Confirmation loop cadence: `max_attempts` queries spaced `interval_ms`
/// apart. The product is the wall-clock budget of one episode.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PollingConfig {
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl PollingConfig {
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Upper bound on total sleep time for one confirmation episode.
    #[must_use]
    pub fn budget(&self) -> Duration {
        Duration::from_millis(self.interval_ms.saturating_mul(u64::from(self.max_attempts)))
    }
}

fn default_interval_ms() -> u64 {
    500
}

fn default_max_attempts() -> u32 {
    40
}

/// Where the signal source writes captured traces. Empty means unset.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct TraceConfig {
    /// Trace captured when a hang signal fires
    #[serde(default)]
    pub hang_trace_file: PathBuf,

    /// Trace captured on explicit `print_trace` requests
    #[serde(default)]
    pub print_trace_file: PathBuf,
}

impl TraceConfig {
    #[must_use]
    pub fn new(hang_trace_file: impl Into<PathBuf>, print_trace_file: impl Into<PathBuf>) -> Self {
        Self {
            hang_trace_file: hang_trace_file.into(),
            print_trace_file: print_trace_file.into(),
        }
    }
}

/// Heartbeat watchdog settings (milliseconds).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct WatchdogSettings {
    #[serde(default = "default_check_interval_ms")]
    pub check_interval_ms: u64,

    /// Heartbeat age after which the primary thread is suspected hung
    #[serde(default = "default_stale_ms")]
    pub stale_ms: u64,

    /// Startup window during which a missing heartbeat is ignored
    #[serde(default)]
    pub grace_period_ms: u64,
}

impl Default for WatchdogSettings {
    fn default() -> Self {
        Self {
            check_interval_ms: default_check_interval_ms(),
            stale_ms: default_stale_ms(),
            grace_period_ms: 0,
        }
    }
}

fn default_check_interval_ms() -> u64 {
    1_000
}

fn default_stale_ms() -> u64 {
    5_000
}

/// Log output format
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-friendly output
    #[default]
    Pretty,
    /// JSON lines
    Json,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pretty => write!(f, "pretty"),
            Self::Json => write!(f, "json"),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            _ => Err(format!("unknown log format: {s}. Expected pretty or json")),
        }
    }
}

impl HangwatchConfig {
    /// Load configuration from a specific path and validate it.
    pub fn load_from(path: &Path) -> crate::Result<Self> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()).into());
        }
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFailed {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        let config = Self::from_toml(&raw)?;
        tracing::debug!(path = %path.display(), "Loaded hangwatch config");
        Ok(config)
    }

    /// Parse and validate a TOML document.
    pub fn from_toml(raw: &str) -> crate::Result<Self> {
        let config: Self =
            toml::from_str(raw).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Render the configuration as TOML.
    pub fn to_toml(&self) -> crate::Result<String> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::SerializeError(e.to_string()).into())
    }

    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.thresholds.foreground_ms >= 0 {
            return Err(ConfigError::ValidationError(format!(
                "thresholds.foreground_ms must be negative, got {}",
                self.thresholds.foreground_ms
            )));
        }
        if self.thresholds.background_ms >= 0 {
            return Err(ConfigError::ValidationError(format!(
                "thresholds.background_ms must be negative, got {}",
                self.thresholds.background_ms
            )));
        }
        if self.polling.interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "polling.interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.polling.max_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "polling.max_attempts must be greater than zero".to_string(),
            ));
        }
        if self.watchdog.check_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "watchdog.check_interval_ms must be greater than zero".to_string(),
            ));
        }
        let idle_ms = crate::work_queue::IDLE_WAKEUP.as_millis();
        if u128::from(self.watchdog.stale_ms) <= idle_ms {
            return Err(ConfigError::ValidationError(format!(
                "watchdog.stale_ms must exceed the {idle_ms} ms idle heartbeat, got {}",
                self.watchdog.stale_ms
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_detection_constants() {
        let config = HangwatchConfig::default();
        assert_eq!(config.thresholds.foreground_ms, -2_000);
        assert_eq!(config.thresholds.background_ms, -10_000);
        assert_eq!(config.polling.interval_ms, 500);
        assert_eq!(config.polling.max_attempts, 40);
        assert_eq!(config.polling.budget(), Duration::from_secs(20));
        assert!(config.traces.hang_trace_file.as_os_str().is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn empty_document_uses_defaults() {
        let config = HangwatchConfig::from_toml("").unwrap();
        assert_eq!(config, HangwatchConfig::default());
    }

    #[test]
    fn partial_section_keeps_other_defaults() {
        let config = HangwatchConfig::from_toml("[polling]\ninterval_ms = 250\n").unwrap();
        assert_eq!(config.polling.interval_ms, 250);
        assert_eq!(config.polling.max_attempts, 40);
        assert_eq!(config.thresholds, ThresholdConfig::default());
    }

    #[test]
    fn positive_threshold_is_rejected() {
        let err = HangwatchConfig::from_toml("[thresholds]\nforeground_ms = 100\n").unwrap_err();
        assert!(err.to_string().contains("foreground_ms must be negative"));
    }

    #[test]
    fn zero_attempts_is_rejected() {
        let err = HangwatchConfig::from_toml("[polling]\nmax_attempts = 0\n").unwrap_err();
        assert!(err.to_string().contains("max_attempts"));
    }

    #[test]
    fn stale_below_idle_heartbeat_is_rejected() {
        let err = HangwatchConfig::from_toml("[watchdog]\nstale_ms = 50\n").unwrap_err();
        assert!(err.to_string().contains("watchdog.stale_ms"));
    }

    #[test]
    fn garbage_is_a_parse_error() {
        let err = HangwatchConfig::from_toml("[polling\n").unwrap_err();
        assert!(matches!(
            err,
            crate::Error::Config(ConfigError::ParseError(_))
        ));
    }

    #[test]
    fn toml_output_parses_back() {
        let mut config = HangwatchConfig::default();
        config.traces = TraceConfig::new("/tmp/hang.txt", "/tmp/print.txt");
        let rendered = config.to_toml().unwrap();
        assert!(rendered.contains("[thresholds]"));
        let parsed = HangwatchConfig::from_toml(&rendered).unwrap();
        assert_eq!(parsed.traces.print_trace_file, PathBuf::from("/tmp/print.txt"));
    }

    #[test]
    fn load_from_missing_file() {
        let err = HangwatchConfig::load_from(Path::new("/nonexistent/hangwatch.toml")).unwrap_err();
        assert!(matches!(
            err,
            crate::Error::Config(ConfigError::FileNotFound(_))
        ));
    }

    #[test]
    fn load_from_reads_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("hangwatch.toml");
        std::fs::write(&path, "[thresholds]\nbackground_ms = -4000\n").unwrap();
        let config = HangwatchConfig::load_from(&path).unwrap();
        assert_eq!(config.thresholds.background_ms, -4_000);
    }

    #[test]
    fn log_format_parse_and_display() {
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("pretty".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert!("xml".parse::<LogFormat>().is_err());
        assert_eq!(LogFormat::Json.to_string(), "json");
    }
}

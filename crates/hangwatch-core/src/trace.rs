//! Trace files: written by signal sources, surfaced to the log on demand.

use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

use tracing::{debug, info};

use crate::error::{ConfigError, Result};

/// Write `trace` to `path` behind a timestamp header, replacing any
/// previous content.
pub fn write_trace_file(path: &Path, trace: &str) -> Result<()> {
    if path.as_os_str().is_empty() {
        return Err(ConfigError::TracePathUnset("trace").into());
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    let mut file = File::create(path)?;
    writeln!(
        file,
        "----- hang trace captured at {} -----",
        chrono::Utc::now().to_rfc3339()
    )?;
    writeln!(file, "{trace}")?;
    file.flush()?;
    debug!(path = %path.display(), "Trace file written");
    Ok(())
}

/// Log every line of the trace file at `path` at info level.
///
/// Returns the number of lines printed.
pub fn print_trace_file(path: &Path) -> Result<usize> {
    let file = File::open(path)?;
    let mut printed = 0;
    for line in BufReader::new(file).lines() {
        let line = line?;
        info!(target: "hangwatch::trace", "{line}");
        printed += 1;
    }
    Ok(printed)
}

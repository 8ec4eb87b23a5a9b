//! `hw print-trace`

use std::path::Path;

use anyhow::{Context, Result};
use hangwatch_core::trace::print_trace_file;

pub fn run(file: &Path) -> Result<()> {
    let lines = print_trace_file(file)
        .with_context(|| format!("failed to print trace file {}", file.display()))?;
    tracing::debug!(lines, "Trace file printed");
    Ok(())
}

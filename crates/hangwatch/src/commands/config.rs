//! `hw config`

use anyhow::Result;
use hangwatch_core::config::HangwatchConfig;

pub fn run(config: &HangwatchConfig) -> Result<()> {
    config.validate()?;
    print!("{}", config.to_toml()?);
    Ok(())
}

//! Configuration inspection commands.

use anyhow::{Context, Result};
use tether_core::config::TetherConfig;

pub fn cmd_config_show(config: &TetherConfig) -> Result<()> {
    let mut shown = config.clone();
    if !shown.relay.api_key.is_empty() {
        shown.relay.api_key = "********".into();
    }
    let path = TetherConfig::file_path();
    let origin = if path.exists() { "" } else { " (not present, defaults)" };
    println!("# {}{origin}", path.display());
    print!("{}", toml::to_string_pretty(&shown).context("failed to render config")?);
    Ok(())
}

pub fn cmd_config_init() -> Result<()> {
    let existed = TetherConfig::file_path().exists();
    let path = TetherConfig::write_default_if_missing()?;
    if existed {
        println!("Config already exists at {}", path.display());
    } else {
        println!("Wrote default config to {}", path.display());
    }
    tracing::debug!(path = %path.display(), "config init");
    Ok(())
}

//! `sigbot config show`.

use std::path::Path;

use anyhow::{Context, Result};
use console::style;

use sigbot_infra::config::{load_config, resolve_config_path};
use sigbot_types::config::BotConfig;

/// Print the effective configuration as TOML (or JSON).
pub async fn show(config_path: Option<&Path>, json: bool) -> Result<()> {
    let path = resolve_config_path(config_path);
    let config = load_config(Some(path.as_path()))
        .await
        .with_context(|| format!("loading {}", path.display()))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    let source = if tokio::fs::try_exists(&path).await.unwrap_or(false) {
        path.display().to_string()
    } else {
        format!("{} (not found, defaults)", path.display())
    };
    println!("{}", style(format!("# {source}")).dim());
    println!("{}", render_toml(&config)?);
    Ok(())
}

fn render_toml(config: &BotConfig) -> Result<String> {
    toml::to_string_pretty(config).context("rendering configuration")
}

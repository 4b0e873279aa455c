//! `stepweave config`: show the effective or the default configuration.

use anyhow::Context;
use stepweave_config::AppConfig;

const REDACTED: &str = "[REDACTED]";

pub async fn run(default: bool) -> anyhow::Result<()> {
    if default {
        print!("{}", AppConfig::default_toml());
        return Ok(());
    }

    let config = AppConfig::load().context("Failed to load config")?;
    println!("# {}", AppConfig::config_dir().join("config.toml").display());
    print!("{}", render(&config)?);
    Ok(())
}

/// The configuration as TOML with secrets masked.
fn render(config: &AppConfig) -> anyhow::Result<String> {
    let mut shown = config.clone();
    if shown.api_key.is_some() {
        shown.api_key = Some(REDACTED.into());
    }
    let endpoints = shown
        .models
        .endpoints
        .values_mut()
        .chain(std::iter::once(&mut shown.models.default_endpoint));
    for endpoint in endpoints {
        if endpoint.api_key.is_some() {
            endpoint.api_key = Some(REDACTED.into());
        }
    }
    for user in &mut shown.gateway.users {
        user.token = REDACTED.into();
    }
    toml::to_string_pretty(&shown).context("Failed to render config")
}

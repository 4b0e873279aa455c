//! `stepweave serve`: start the HTTP gateway.

use anyhow::Context;
use stepweave_config::AppConfig;
use tracing::info;

pub async fn run(port_override: Option<u16>) -> anyhow::Result<()> {
    let mut config = AppConfig::load().context("Failed to load config")?;

    if let Some(port) = port_override {
        config.gateway.port = port;
    }

    if !config.has_api_key() {
        tracing::warn!("No API key configured; set STEPWEAVE_API_KEY or api_key in config.toml");
    }

    println!("Stepweave gateway");
    println!("   Listening:  {}:{}", config.gateway.host, config.gateway.port);
    println!("   Model:      {}", config.models.default_model);
    println!("   Max steps:  {}", config.agent.max_steps);
    println!(
        "   Resumable:  {}",
        if config.resumable.enabled { "on" } else { "off" }
    );

    info!(
        users = config.gateway.users.len(),
        providers = config.tools.providers.len(),
        "Serving"
    );

    stepweave_gateway::start(config)
        .await
        .map_err(|e| anyhow::anyhow!("Gateway failed: {e}"))?;

    Ok(())
}

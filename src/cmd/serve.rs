use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;

use retrogate::config::default_config_path;
use retrogate::{load_config, server, CliOverrides, Fetcher, Gateway, UpstreamClient};

pub async fn cmd_serve(config_path: Option<&Path>, overrides: CliOverrides) -> Result<()> {
    let config = load_config(config_path, overrides)?;
    info!(
        config = %config_path.map_or_else(|| default_config_path().display().to_string(), |p| p.display().to_string()),
        preset = config.preset.as_deref().unwrap_or("none"),
        "Starting retrogate {}",
        retrogate::VERSION
    );

    let client = UpstreamClient::new(
        config.server.user_agent.as_deref(),
        Duration::from_secs(config.server.timeout_secs),
    )
    .context("building upstream client")?;
    let fetcher: Arc<dyn Fetcher> = Arc::new(client);

    let gateway = Gateway::from_config(&config, fetcher)?;

    let bind = config.bind_address();
    let addr: SocketAddr = bind
        .parse()
        .with_context(|| format!("invalid bind address {bind}"))?;
    server::serve(addr, Arc::new(gateway)).await
}

//! `conductor serve` command — run the configured servers.
//!
//! Reads TOML configuration, installs logging, builds one [`HttpServer`] per
//! `[[http]]` entry and runs them under a single [`Engine`] until a shutdown
//! signal arrives or a server fails.
//!
//! [`HttpServer`]: conductor::http::HttpServer
//! [`Engine`]: conductor::Engine

use std::path::Path;
use std::sync::Arc;

use dotenvy::dotenv;

use conductor::Server;
use conductor::config::load_config;
use conductor::telemetry::Telemetry;

/// Execute the `serve` command.
///
/// # Errors
///
/// Returns an error if configuration loading fails, or the aggregate of
/// every failure observed while running and stopping the servers.
#[allow(clippy::future_not_send)]
pub async fn run(config_path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    // Load .env variables
    dotenv().ok();

    let config = load_config(config_path)?;

    let telemetry = Telemetry::new()
        .with_name(config.name())
        .with_version(env!("CARGO_PKG_VERSION"));
    let telemetry = match config.log_level() {
        Some(level) => telemetry.with_log_level(level),
        None => telemetry,
    };
    let _telemetry_guard = telemetry.register();

    let servers = config.http_servers()?;
    if servers.is_empty() {
        tracing::warn!(config = %config_path.display(), "no servers configured");
    }

    let engine = config
        .engine_builder()
        .with_servers(
            servers
                .into_iter()
                .map(|server| Arc::new(server) as Arc<dyn Server>),
        )
        .build();

    engine
        .run()
        .await
        .inspect_err(|errors| tracing::error!(%errors, "engine stopped with errors"))?;

    Ok(())
}

//! Transparent LLM API relay.
//!
//! # Architecture Overview
//!
//! ```text
//!                    ┌───────────────────────────────────────────────────────┐
//!                    │                        RELAY                          │
//!                    │                                                       │
//!   Client Request   │  ┌─────────┐    ┌──────────┐    ┌────────────────┐    │
//!  ──────────────────┼─▶│  http   │───▶│ routing  │───▶│ headers +      │    │
//!                    │  │ server  │    │credential│    │ payload rewrite│    │
//!                    │  └────┬────┘    └──────────┘    └───────┬────────┘    │
//!                    │       │                                 ▼             │
//!   Client Response  │       │                         ┌──────────────┐      │
//!  ◀─────────────────┼───────┼─────────────────────────│   forward    │◀─────┼──── Upstream
//!                    │       │                         │  (streamed)  │      │     LLM API
//!                    │       ▼                         └──────┬───────┘      │
//!                    │  ┌─────────┐                           ▼              │
//!                    │  │  admin  │◀──── stats / log stream ◀─ observability │
//!                    │  │  API    │───▶ config (env file, side files)        │
//!                    │  └─────────┘                                         │
//!                    └───────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;

use clap::Parser;
use tokio::net::TcpListener;

use llm_relay::config::{load_startup_env, ProxyConfig};
use llm_relay::lifecycle::{signals, Relay};
use llm_relay::observability::{logging, metrics};

#[derive(Debug, Parser)]
#[command(name = "llm-relay", version, about = "Transparent relay for LLM APIs")]
struct Cli {
    /// Directory holding .env, the JSON side files and backups.
    #[arg(long, env = "RELAY_ENV_DIR", default_value = "env")]
    env_dir: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let env = load_startup_env(&cli.env_dir)?;
    let config = ProxyConfig::from_env(&cli.env_dir, &env);

    logging::init(&config.observability.log_format, config.settings.debug_mode);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "llm-relay starting");
    tracing::info!(
        env_dir = ?cli.env_dir,
        target = %config.settings.target_base_url,
        port = config.settings.port,
        dashboard = config.settings.dashboard_enabled,
        preserve_host = config.settings.preserve_host,
        rewrite = config.settings.system_prompt_replacement.is_some(),
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let listener = TcpListener::bind(("0.0.0.0", config.settings.port)).await?;
    tracing::info!(address = %listener.local_addr()?, "Listening for connections");

    let relay = Relay::build(config)?;
    tokio::spawn(signals::listen(relay.shutdown()));
    relay.serve(listener).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}

//! Chatgate server - rate-limited, session-aware chat backend

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chatgate_core::prelude::*;
use chatgate_server::{router, AppState};
use clap::{Parser, Subcommand};
use tracing::{debug, info, warn};

#[derive(Debug, Parser)]
#[command(name = "chatgate")]
#[command(about = "Rate-limited, session-aware chat backend", long_about = None)]
#[command(version)]
struct Cli {
    /// Extra TOML config file layered over `chatgate.toml`
    #[arg(long, env = "CHATGATE_CONFIG_PATH")]
    config: Option<PathBuf>,

    /// Listen address, overriding `server.bind_addr`
    #[arg(long, env = "CHATGATE_BIND")]
    bind: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the HTTP server (default)
    Serve,
    /// Print the effective configuration with the credential redacted
    Config,
    /// Version information
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Version => {
            println!("chatgate {}", env!("CARGO_PKG_VERSION"));
            println!("chatgate-core {}", chatgate_core::VERSION);
        }
        Commands::Config => {
            let mut config = ChatgateConfig::load_with(cli.config.as_deref())?;
            if config.upstream.api_key.is_some() {
                config.upstream.api_key = Some("<redacted>".to_string());
            }
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        Commands::Serve => {
            let config = ChatgateConfig::load_with(cli.config.as_deref())?;
            serve(config, cli.bind).await?;
        }
    }

    Ok(())
}

async fn serve(config: ChatgateConfig, bind: Option<String>) -> Result<()> {
    if config.upstream.api_key.is_none() {
        warn!("no upstream API key configured; chat turns will be rejected by the provider");
    }

    let state = AppState::from_config(&config)?;
    spawn_sweeper(state.clone(), config.server.sweep_interval);

    let bind = bind.unwrap_or_else(|| config.server.bind_addr.clone());
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    info!(
        addr = %listener.local_addr()?,
        default_model = %config.models.default_model,
        "chatgate listening"
    );

    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutting down");
    })
    .await?;
    Ok(())
}

/// Periodically drops rate-limit state of idle clients.
fn spawn_sweeper(state: AppState, every: std::time::Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let removed = state.gate().sweep();
            if removed > 0 {
                debug!(removed, tracked = state.gate().tracked_clients(), "swept idle clients");
            }
        }
    });
}

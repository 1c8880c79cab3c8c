use std::io::Write;
use std::path::PathBuf;

use clap::Parser;
use thiserror::Error;
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::RelayConfig;
use crate::router::{build_router, AppState};
use crate::settings_store::SettingsStore;

#[derive(Parser, Debug)]
#[command(name = "agent-relay", bin_name = "agent-relay")]
#[command(about = "Local relay between desktop clients and a streaming model backend")]
#[command(version)]
pub struct AgentRelayCli {
    /// Host to bind [default: 127.0.0.1].
    #[arg(long, short = 'H')]
    host: Option<String>,

    /// Port to bind; 0 picks a free port [default: 51055].
    #[arg(long, short = 'p')]
    port: Option<u16>,

    /// Model identifier sent with every chat-completion call.
    #[arg(long, short = 'm')]
    model: Option<String>,

    /// Default chat-completion base URL, used when no override is stored.
    #[arg(long = "api-base")]
    api_base: Option<String>,

    /// Settings directory override; defaults to the per-user data directory.
    #[arg(long = "settings-dir")]
    settings_dir: Option<PathBuf>,

    /// Report offline mode in status metadata.
    #[arg(long)]
    offline: bool,
}

impl AgentRelayCli {
    /// Layer flag overrides on top of `base`; flags left unset keep the
    /// base value, so environment overrides survive.
    fn apply(&self, mut config: RelayConfig) -> RelayConfig {
        if let Some(host) = self.host.clone() {
            config.host = host;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(model) = self.model.clone() {
            config.model = model;
        }
        if let Some(api_base) = self.api_base.clone() {
            config.api_base = api_base;
        }
        if self.offline {
            config.offline_mode = true;
        }
        config
    }
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("server error: {0}")]
    Server(String),
}

pub fn run_agent_relay() -> Result<(), CliError> {
    let cli = AgentRelayCli::parse();
    init_logging();

    let config = cli.apply(RelayConfig::from_env());

    let settings_store = match cli.settings_dir.clone() {
        Some(dir) => SettingsStore::with_dir(dir),
        None => SettingsStore::new()?,
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| CliError::Server(err.to_string()))?;
    runtime.block_on(serve(config, settings_store))
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

async fn serve(config: RelayConfig, settings_store: SettingsStore) -> Result<(), CliError> {
    let addr = format!("{}:{}", config.host, config.port);
    let state = AppState::new(config, settings_store);
    let run_manager = state.run_manager();

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);
    let router = build_router(state).layer(cors);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let bound = listener.local_addr()?;
    tracing::info!(addr = %bound, "agent-relay listening");

    // supervising desktop process watches stdout for this line
    write_ready_line(bound.port())?;

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
            run_manager.shutdown().await;
        })
        .await
        .map_err(|err| CliError::Server(err.to_string()))
}

fn write_ready_line(port: u16) -> Result<(), CliError> {
    let mut out = std::io::stdout();
    writeln!(out, "AGENTRELAY READY {port}")?;
    out.flush()?;
    Ok(())
}

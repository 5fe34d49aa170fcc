//! Tether daemon - reverse proxy that resumes interrupted generation streams

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use tether::config::Config;
use tether::error::Result;
use tether::proxy::ProxyServer;

/// Tether - keeps streaming generation responses alive across interruptions
#[derive(Parser)]
#[command(name = "tether")]
#[command(about = "A reverse proxy that transparently resumes interrupted generation streams")]
#[command(version)]
pub struct Cli {
    /// Path to config file
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Start the proxy server (default command)
    #[command(name = "serve")]
    Serve,
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        None | Some(Command::Serve) => serve(cli.config).await,
    }
}

/// `RUST_LOG` wins; otherwise the debug toggle picks the level for tether.
fn init_logging(debug: bool) {
    let default_filter = if debug {
        "info,tether=debug"
    } else {
        "info,tether=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn serve(config_path: Option<PathBuf>) -> Result<()> {
    let path = Config::locate(config_path);
    let config = Config::load(path.as_deref())?;

    init_logging(config.logging.debug);

    tracing::info!("Starting Tether daemon");
    match path {
        Some(ref path) => tracing::info!("Loaded config from: {}", path.display()),
        None => tracing::info!("No config file found, using defaults"),
    }
    tracing::debug!("Config loaded: {:?}", config);

    ProxyServer::new(config).serve().await
}

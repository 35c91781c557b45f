/// VeilPort Daemon
///
/// Runs a loopback overlay that:
/// - Publishes the configured .veil hidden services
/// - Serves an authenticated SOCKS5 proxy into the overlay
/// - Reports status over a small JSON API

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use veilport_common::config::service::VANITY_YIELD_EVERY;
use veilport_common::DaemonConfig;
use veilport_core::{generate_vanity, ServiceKey};
use veilport_daemon::{ApiServer, Daemon};

const DEFAULT_CONFIG: &str = "veilport.toml";

#[derive(Parser)]
#[command(name = "veilportd", version, about = "VeilPort hidden service daemon")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Publish the configured services and serve the proxy (default)
    Run {
        #[arg(short, long, env = "VEILPORT_CONFIG", default_value = DEFAULT_CONFIG)]
        config: PathBuf,
    },
    /// Write the default configuration
    Init {
        #[arg(short, long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,
    },
    /// Generate a service key
    Keygen {
        /// Address prefix to search for
        #[arg(long)]
        vanity: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command.unwrap_or(Command::Run {
        config: PathBuf::from(DEFAULT_CONFIG),
    }) {
        Command::Run { config } => run(&config).await,
        Command::Init { config } => init(&config),
        Command::Keygen { vanity } => keygen(vanity).await,
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Load the configuration, writing the defaults when the file is missing
fn load_config(path: &Path) -> Result<DaemonConfig> {
    if path.exists() {
        return DaemonConfig::from_file(path)
            .with_context(|| format!("failed to load {}", path.display()));
    }

    let config = DaemonConfig::default();
    if let Err(e) = config.to_file(path) {
        eprintln!("Failed to save default config to {}: {}", path.display(), e);
    }
    Ok(config)
}

async fn run(path: &Path) -> Result<()> {
    let config = load_config(path)?;
    init_logging(&config.log_level);

    info!("Starting VeilPort Daemon v{}", env!("CARGO_PKG_VERSION"));
    let daemon = Daemon::start(&config).await?;

    let (stop_api, api_stopped) = tokio::sync::oneshot::channel::<()>();
    let api = match &config.api_addr {
        Some(addr) => {
            let addr: SocketAddr = addr
                .parse()
                .with_context(|| format!("invalid API address {:?}", addr))?;
            let server = ApiServer::new(addr, daemon.api_state());
            Some(tokio::spawn(async move {
                let shutdown = async {
                    let _ = api_stopped.await;
                };
                if let Err(e) = server.start(shutdown).await {
                    warn!("API server error: {}", e);
                }
            }))
        }
        None => None,
    };

    info!("Daemon is running. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    let _ = stop_api.send(());
    if let Some(api) = api {
        let _ = api.await;
    }
    daemon.shutdown().await;
    Ok(())
}

fn init(path: &Path) -> Result<()> {
    DaemonConfig::default()
        .to_file(path)
        .with_context(|| format!("failed to write {}", path.display()))?;
    println!("Wrote default configuration to {}", path.display());
    Ok(())
}

async fn keygen(vanity: Option<String>) -> Result<()> {
    let key = match vanity {
        Some(prefix) => generate_vanity(&prefix, VANITY_YIELD_EVERY).await?,
        None => ServiceKey::generate(),
    };

    println!("Address:    {}", key.address());
    println!("Secret key: {}", key.secret_hex());
    Ok(())
}

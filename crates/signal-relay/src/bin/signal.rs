//! Signal Relay server
//!
//! Topic-based WebSocket signaling relay for peer discovery.
//!
//! # Usage
//!
//! ```bash
//! # Resident relay (default)
//! signal-relay --port 4444
//!
//! # Hibernating relay with attachments in SQLite
//! signal-relay --mode hibernating --db /var/lib/signal-relay/attachments.db
//! ```

use std::net::IpAddr;
use std::path::PathBuf;

use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use signal_relay::{Config, ExecutionModel, SignalServer};

#[derive(Parser, Debug)]
#[command(name = "signal-relay")]
#[command(about = "Topic-based WebSocket signaling relay")]
#[command(version)]
struct Args {
    /// Configuration file (defaults to the platform config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "PORT")]
    port: Option<u16>,

    /// Bind address
    #[arg(short, long)]
    bind: Option<IpAddr>,

    /// Execution model
    #[arg(short, long, value_enum)]
    mode: Option<ExecutionModel>,

    /// Liveness sweep interval in milliseconds (resident model)
    #[arg(long)]
    liveness_interval_ms: Option<u64>,

    /// SQLite attachment database (hibernating model, in-memory if not specified)
    #[arg(short, long)]
    db: Option<PathBuf>,

    /// Only accept WebSocket upgrades on this path
    #[arg(long)]
    path: Option<String>,
}

impl Args {
    /// Command-line values win over the configuration file
    fn apply(self, mut config: Config) -> Config {
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(bind) = self.bind {
            config.server.bind = bind;
        }
        if let Some(path) = self.path {
            config.server.upgrade_path = Some(path);
        }
        if let Some(mode) = self.mode {
            config.relay.mode = mode;
        }
        if let Some(interval) = self.liveness_interval_ms {
            config.relay.liveness_interval_ms = interval;
        }
        if let Some(db) = self.db {
            config.relay.db_path = Some(db);
        }
        config
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(Level::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load(),
    };
    let config = args.apply(config);

    info!("Starting Signal Relay ({:?} model)", config.relay.mode);

    SignalServer::new(config).serve().await?;

    Ok(())
}

//! `tunl` command line

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{info, warn};

use tunl::client;
use tunl::config::{ClientConfig, Config, RelayConfig};
use tunl::server;

#[derive(Parser, Debug)]
#[command(
    name = "tunl",
    version = env!("CARGO_PKG_VERSION"),
    about = "Expose a local HTTP server through a public relay",
    long_about = "tunl forwards public HTTP requests over a WebSocket to a client that runs them against a local server"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration directory path
    #[arg(short, long, env = "TUNL_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, env = "TUNL_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write a default configuration file
    Init {
        /// Force overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },

    /// Run the public relay server
    Relay {
        /// Port for public HTTP and tunnel connections
        #[arg(short, long, env = "PORT", default_value = "8080")]
        port: u16,

        /// Base URL handed to clients (defaults to http://localhost:<port>)
        #[arg(long, env = "PUBLIC_URL")]
        public_url: Option<String>,
    },

    /// Expose a local port through the relay
    Http {
        /// Local port to forward to
        port: u16,

        /// Relay WebSocket URL, e.g. ws://relay.example.com/tunnel
        #[arg(env = "TUNL_RELAY")]
        relay_url: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(cli.log_level.parse()?)
                .from_env_lossy(),
        )
        .with_target(false)
        .with_thread_ids(false)
        .init();

    let config_path = match cli.config {
        Some(path) => path,
        None => Config::default_dir().context("Could not determine a configuration directory")?,
    };
    let config = Config::load(&config_path)?;

    match cli.command {
        Commands::Init { force } => {
            if Config::exists(&config_path) && !force {
                warn!("Configuration already exists. Use --force to overwrite.");
                return Ok(());
            }

            Config::default().save(&config_path)?;

            info!("✓ tunl initialized successfully");
            info!("Config directory: {:?}", config_path);
        }

        Commands::Relay { port, public_url } => {
            let relay_config = RelayConfig::new(&config.relay, port, public_url)?;
            server::run_relay(relay_config).await?;
        }

        Commands::Http { port, relay_url } => {
            let client_config = ClientConfig::new(&config.client, port, relay_url)?;
            client::run_client(client_config).await?;
        }
    }

    Ok(())
}

//! dnsdrop - covert message transport over DNS
//!
//! Agent and server binary: `send` pushes a message through the tunnel,
//! `serve` collects it and prints the reassembly on interrupt.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{error, info};
use rand::rngs::OsRng;
use rand::RngCore;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncReadExt;

use dnsdrop::{Sender, TunnelConfig, TunnelListener, TunnelServer};

const VERSION: &str = env!("CARGO_PKG_VERSION");
const BUILD_DATE: &str = env!("BUILD_DATE");
const GIT_HASH: &str = env!("GIT_HASH");

#[derive(Parser)]
#[command(name = "dnsdrop")]
#[command(version = VERSION)]
#[command(about = "Covert message transport over DNS", long_about = None)]
struct Cli {
    /// Configuration file path (TOML)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Enable verbose logging (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send a message through the tunnel (agent side)
    Send {
        /// Read the message from this file instead of standard input
        file: Option<PathBuf>,

        /// Tunnel server address
        #[arg(short, long)]
        server: Option<SocketAddr>,

        /// Tunnel base domain
        #[arg(short, long)]
        domain: Option<String>,

        /// Pre-shared key (64 hex characters)
        #[arg(short, long)]
        key: Option<String>,

        /// Plaintext bytes per chunk
        #[arg(long)]
        chunk_size: Option<usize>,

        /// Per-query timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,

        /// Retransmission cap per chunk
        #[arg(long)]
        max_retries: Option<u32>,
    },

    /// Run the tunnel server (receiver side) until interrupted
    Serve {
        /// Listen address
        #[arg(short, long)]
        bind: Option<SocketAddr>,

        /// Tunnel base domain
        #[arg(short, long)]
        domain: Option<String>,

        /// Pre-shared key (64 hex characters)
        #[arg(short, long)]
        key: Option<String>,
    },

    /// Generate a random pre-shared key
    Genkey,

    /// Write a starter configuration file with a fresh key
    Genconf {
        /// Output path
        #[arg(short, long, default_value = "dnsdrop.toml")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    let mut logger = env_logger::Builder::from_default_env();
    if cli.verbose >= 3 {
        logger.filter_module("dnsdrop", log::LevelFilter::Trace);
        logger.filter_level(log::LevelFilter::Debug);
    } else {
        logger.filter_level(log_level);
    }
    logger
        .format_timestamp_millis()
        .format_module_path(true)
        .init();

    info!("dnsdrop {} (built {}, {})", VERSION, BUILD_DATE, GIT_HASH);

    match cli.command {
        Commands::Send {
            file,
            server,
            domain,
            key,
            chunk_size,
            timeout,
            max_retries,
        } => {
            let mut config = load_config(cli.config.as_deref())?;
            if let Some(server) = server {
                config.server_addr = server;
            }
            if let Some(domain) = domain {
                config.domain = domain;
            }
            if let Some(key) = key {
                config.key = key;
            }
            if let Some(chunk_size) = chunk_size {
                config.chunk_size = chunk_size;
            }
            if let Some(timeout) = timeout {
                config.timeout_secs = timeout;
            }
            if let Some(max_retries) = max_retries {
                config.max_retries = max_retries;
            }
            run_send(config, file).await
        }

        Commands::Serve { bind, domain, key } => {
            let mut config = load_config(cli.config.as_deref())?;
            if let Some(bind) = bind {
                config.server_addr = bind;
            }
            if let Some(domain) = domain {
                config.domain = domain;
            }
            if let Some(key) = key {
                config.key = key;
            }
            run_serve(config).await
        }

        Commands::Genkey => {
            let mut key = [0u8; 32];
            OsRng.fill_bytes(&mut key);
            println!("{}", hex::encode(key));
            Ok(())
        }

        Commands::Genconf { output } => {
            let mut config = TunnelConfig::default();
            let mut key = [0u8; 32];
            OsRng.fill_bytes(&mut key);
            config.key = hex::encode(key);
            config
                .to_file(&output)
                .with_context(|| format!("failed to write {}", output.display()))?;
            println!("wrote {}", output.display());
            println!("share the key with the other endpoint over a safe channel");
            Ok(())
        }
    }
}

fn load_config(path: Option<&std::path::Path>) -> Result<TunnelConfig> {
    match path {
        Some(path) => TunnelConfig::from_file(path)
            .with_context(|| format!("failed to load {}", path.display())),
        None => Ok(TunnelConfig::default()),
    }
}

async fn run_send(config: TunnelConfig, file: Option<PathBuf>) -> Result<()> {
    config.validate().context("invalid configuration")?;

    let message = match file {
        Some(path) => {
            std::fs::read(&path).with_context(|| format!("failed to read {}", path.display()))?
        }
        None => {
            let mut buf = Vec::new();
            tokio::io::stdin()
                .read_to_end(&mut buf)
                .await
                .context("failed to read message from stdin")?;
            buf
        }
    };

    info!(
        "sending {} bytes to {} under {}",
        message.len(),
        config.server_addr,
        config.domain
    );

    let sender = Sender::from_config(&config, &message)?;
    match sender.run().await {
        Ok(report) => {
            println!(
                "delivered {} chunks in {:.2?} ({} retransmissions, {} timeouts, {} fast retransmits)",
                report.chunks,
                report.elapsed,
                report.retransmissions,
                report.timeouts,
                report.fast_retransmits
            );
            Ok(())
        }
        Err(err) => {
            error!("transfer failed: {}", err);
            Err(err.into())
        }
    }
}

async fn run_serve(config: TunnelConfig) -> Result<()> {
    config.validate().context("invalid configuration")?;

    let server = Arc::new(TunnelServer::new(&config)?);
    let listener = TunnelListener::bind(config.server_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.server_addr))?;

    let accept_loop = tokio::spawn(listener.serve(Arc::clone(&server)));

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for interrupt")?;
    info!("interrupted, rebuilding message");
    accept_loop.abort();

    let stats = server.stats().await;
    let report = server.report().await;

    println!();
    if report.received.is_empty() {
        println!("no chunks received");
        return Ok(());
    }

    println!("received chunks: {:?}", report.received);
    if report.is_complete() {
        println!("message complete ({} bytes):", report.message.len());
    } else {
        println!("missing chunks:  {:?}", report.missing);
        println!("partial message ({} bytes):", report.message.len());
    }
    println!("{}", String::from_utf8_lossy(&report.message));

    if stats.auth_failures > 0 || stats.format_errors > 0 {
        println!(
            "({} auth failures, {} malformed queries discarded)",
            stats.auth_failures, stats.format_errors
        );
    }
    Ok(())
}

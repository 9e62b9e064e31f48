//! xtunnel daemon
//!
//! Binds one address, accepts exactly one peer connection and multiplexes
//! its channels until the connection fails:
//! - Stops listening after the first accept
//! - Exits non-zero on any fatal transport error

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use xtunnel::{
    config::{generate_example_config, Config},
    transport,
    tunnel::Dispatcher,
};

/// xtunnel daemon - single-connection SOCKS5 tunnel multiplexer
#[derive(Parser, Debug)]
#[command(name = "xtunneld")]
#[command(about = "Single-connection obfuscated tunnel multiplexer")]
#[command(version)]
struct Args {
    /// Configuration file path (defaults apply when omitted)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address (overrides config)
    #[arg(short, long)]
    listen: Option<String>,

    /// Log level (overrides config; RUST_LOG wins over both)
    #[arg(short = 'v', long)]
    log_level: Option<String>,

    /// Write an example configuration to this path and exit
    #[arg(long, value_name = "PATH")]
    generate_config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if let Some(path) = args.generate_config {
        generate_example_config()
            .save(&path)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        println!("Wrote example configuration to {}", path.display());
        return Ok(());
    }

    let mut config = match &args.config {
        Some(path) => Config::load(path).context("Failed to load configuration")?,
        None => Config::default(),
    };
    if let Some(listen) = args.listen {
        config.server.listen = listen;
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }

    init_logging(&config.logging.level, &config.logging.format);

    tokio::select! {
        result = serve(&config) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down...");
            Ok(())
        }
    }
}

fn init_logging(level: &str, format: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    match format {
        "compact" => builder.compact().init(),
        "pretty" => builder.init(),
        other => {
            builder.init();
            warn!("Unknown log format {:?}, using pretty", other);
        }
    }
}

async fn serve(config: &Config) -> Result<()> {
    let listener = TcpListener::bind(&config.server.listen)
        .await
        .with_context(|| format!("Failed to bind to {}", config.server.listen))?;
    info!("xtunneld v{} bound to {}", xtunnel::VERSION, listener.local_addr()?);

    let (stream, peer_addr) = listener.accept().await.context("Accept failed")?;
    drop(listener);
    info!("Peer connected from {}, no longer listening", peer_addr);

    stream.set_nodelay(true)?;

    let (reader, writer) = transport::split(stream, config.server.obfuscator());
    let mut dispatcher = Dispatcher::new(reader, writer, config.server.channel_settings());

    dispatcher
        .run()
        .await
        .context("Physical connection failed")?;
    Ok(())
}

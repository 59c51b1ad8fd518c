//! Conjure PT Server
//!
//! Managed pluggable-transport server for a bridge. Accepts connections
//! forwarded by allow-listed Conjure stations, strips their PROXY header and
//! relays the payload to the local OR port.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use conjure_pt::{
    bridge::BridgeServer,
    config::{Config, ServerConfig},
    logging,
    proxy::AllowList,
    pt::{self, PtError, Reply, ServerInfo},
    relay::RelayPump,
    METHOD_NAME,
};
use std::path::PathBuf;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Conjure pluggable transport server
#[derive(Parser, Debug)]
#[command(name = "conjure-server")]
#[command(about = "Conjure pluggable transport server")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Comma-separated IP addresses of stations this bridge accepts connections from
    #[arg(long)]
    allowed_stations: Option<String>,

    /// Name of the log file
    #[arg(long)]
    log: Option<PathBuf>,

    /// Keep IP addresses in logs
    #[arg(long)]
    unsafe_logging: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'v', long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::load(path).context("Failed to load configuration")?,
        None => Config::default(),
    };
    let mut server_config: ServerConfig = config.server.take().unwrap_or_default();
    if let Some(stations) = &args.allowed_stations {
        server_config.allowed_stations = stations.clone();
    }
    if let Some(log) = &args.log {
        config.logging.file = Some(log.clone());
    }
    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }
    config.logging.unsafe_logging |= args.unsafe_logging;

    logging::init(&config.logging, None).context("Failed to set up logging")?;
    info!("Starting conjure-server {}", conjure_pt::VERSION);

    let mut reply = Reply::stdout();

    let pt_info = match ServerInfo::from_env() {
        Ok(info) => info,
        Err(e) => {
            if !matches!(e, PtError::UnsupportedVersion(_)) {
                reply.env_error(&e.to_string());
            }
            return Err(e).context("Error in PT server setup");
        }
    };

    let or_addr = pt_info
        .or_addr
        .ok_or_else(|| anyhow!("TOR_PT_ORPORT is required; the extended OR port is not supported"))?;

    let allow_list: AllowList = server_config
        .allowed_stations
        .parse()
        .context("Error setting station allow-list")?;

    let bridge = BridgeServer::new(
        allow_list,
        or_addr,
        server_config.proxy_header_timeout(),
        RelayPump::new(server_config.drain_timeout()),
    );

    let shutdown = CancellationToken::new();
    let mut listeners = Vec::new();

    for bindaddr in &pt_info.bindaddrs {
        if bindaddr.method_name != METHOD_NAME {
            reply.smethod_error(&bindaddr.method_name, "no such method");
            continue;
        }

        let listener = match TcpListener::bind(bindaddr.addr).await {
            Ok(listener) => listener,
            Err(e) => {
                error!("Failed to bind to address: {}", e);
                reply.smethod_error(&bindaddr.method_name, &e.to_string());
                continue;
            }
        };
        let addr = listener.local_addr()?;

        let bridge = bridge.clone();
        let shutdown = shutdown.clone();
        listeners.push(tokio::spawn(async move {
            if let Err(e) = bridge.serve(listener, shutdown).await {
                error!("Listener stopped: {}", e);
            }
        }));

        reply.smethod(&bindaddr.method_name, addr);
    }
    reply.smethods_done();

    pt::wait_for_termination().await;

    shutdown.cancel();
    for listener in listeners {
        let _ = listener.await;
    }

    Ok(())
}

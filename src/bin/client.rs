//! Conjure PT Client
//!
//! Managed pluggable-transport client that:
//! - Announces a SOCKS5 listener to the host
//! - Grants every SOCKS CONNECT immediately and buffers the client's bytes
//! - Registers with a Conjure station in the background and relays through
//!   the phantom connection once it proves live

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use conjure_pt::{
    config::{generate_example_config, ClientConfig, Config},
    logging,
    proxy::{ConnectRequest, ProxyError, Socks5Server},
    pt::{self, ClientInfo, PtError, Reply},
    relay::RelayPump,
    rendezvous::{
        ConnectionHandler, DirectRegistrar, Registrar, RegistrarKind, TransportKind,
    },
    METHOD_NAME,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::TcpStream;
use tracing::{error, info};

/// Conjure pluggable transport client
#[derive(Parser, Debug)]
#[command(name = "conjure-client")]
#[command(about = "Conjure pluggable transport client")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Write an example configuration to this path and exit
    #[arg(long)]
    write_example_config: Option<PathBuf>,

    /// Directory of rendezvous assets
    #[arg(long)]
    assets: Option<PathBuf>,

    /// Name of the log file
    #[arg(long)]
    log: Option<PathBuf>,

    /// Resolve the log file relative to the transport state directory
    #[arg(long)]
    log_to_state_dir: bool,

    /// Keep IP addresses in logs
    #[arg(long)]
    unsafe_logging: bool,

    /// Domain fronts for registration, comma separated
    #[arg(long)]
    front: Option<String>,

    /// URL of the registration API
    #[arg(long = "registerURL", visible_alias = "register-url")]
    register_url: Option<String>,

    /// Registrar (bdapi, ampcache, dns, direct)
    #[arg(long)]
    registrar: Option<String>,

    /// Phantom transport (min, prefix, dtls)
    #[arg(long)]
    transport: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'v', long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if let Some(path) = &args.write_example_config {
        generate_example_config()
            .save(path)
            .context("Failed to write example config")?;
        return Ok(());
    }

    let mut config = match &args.config {
        Some(path) => Config::load(path).context("Failed to load configuration")?,
        None => Config::default(),
    };
    let mut client_config = config.client.take().unwrap_or_default();
    apply_overrides(&args, &mut client_config, &mut config)?;

    let mut reply = Reply::stdout();

    let pt_info = match ClientInfo::from_env() {
        Ok(info) => info,
        Err(e) => {
            // Version mismatches were already reported as VERSION-ERROR
            if !matches!(e, PtError::UnsupportedVersion(_)) {
                reply.env_error(&e.to_string());
            }
            return Err(e).context("Error in PT client setup");
        }
    };

    let state_dir = pt_info
        .state_location
        .as_deref()
        .map(pt::make_state_dir)
        .transpose()
        .context("Failed to create state directory")?;

    logging::init(&config.logging, state_dir.as_deref()).context("Failed to set up logging")?;
    info!("Starting conjure-client {}", conjure_pt::VERSION);

    let asset_dir = asset_dir(&client_config, state_dir.as_deref());
    if let Some(dir) = &asset_dir {
        std::fs::create_dir_all(dir).context("Failed to create asset directory")?;
        info!("Using asset directory {}", dir.display());
    }

    if pt_info.proxy_url.is_some() {
        reply.proxy_error("proxy is not supported");
        std::process::exit(1);
    }

    let registrar = match build_registrar(&client_config) {
        Ok(registrar) => Some(registrar),
        Err(e) => {
            error!("{}", e);
            reply.cmethod_error(METHOD_NAME, &e.to_string());
            None
        }
    };

    let client_config = Arc::new(client_config);
    let mut listeners = Vec::new();

    for method in &pt_info.method_names {
        if method != METHOD_NAME {
            reply.cmethod_error(method, "no such method");
            continue;
        }
        let Some(registrar) = registrar.clone() else {
            continue;
        };

        let server = match Socks5Server::bind(&client_config.socks5_listen).await {
            Ok(server) => server,
            Err(e) => {
                error!("Failed to bind SOCKS listener: {}", e);
                reply.cmethod_error(method, &e.to_string());
                continue;
            }
        };
        let addr = server.local_addr()?;

        let handler = ConnectionHandler::new(
            registrar,
            client_config.retry_policy(),
            RelayPump::new(client_config.drain_timeout()),
        );
        let socks_config = Arc::clone(&client_config);

        listeners.push(tokio::spawn(async move {
            let result = server
                .run(move |stream, request| {
                    handle_socks(stream, request, Arc::clone(&socks_config), handler.clone())
                })
                .await;
            if let Err(e) = result {
                error!("SOCKS listener stopped: {}", e);
            }
        }));

        reply.cmethod(method, "socks5", addr);
    }
    reply.cmethods_done();

    pt::wait_for_termination().await;

    info!("Shutting down conjure client");
    for listener in listeners {
        listener.abort();
    }

    Ok(())
}

async fn handle_socks(
    stream: TcpStream,
    request: ConnectRequest,
    config: Arc<ClientConfig>,
    handler: ConnectionHandler,
) -> Result<(), ProxyError> {
    info!("SOCKS accepted: {}", request.target);

    let registration = config
        .registration_request(request.target.to_string(), &request.args)
        .map_err(|e| ProxyError::GeneralFailure(e.to_string()))?;

    if registration.registrar != RegistrarKind::Direct {
        return Err(ProxyError::GeneralFailure(format!(
            "{} registrar is not available in this build",
            registration.registrar
        )));
    }

    info!("Attempting to connect to bridge at {}", request.target);
    handler.handle(stream, registration).await;

    Ok(())
}

/// Command-line flags override the config file
fn apply_overrides(args: &Args, client: &mut ClientConfig, config: &mut Config) -> Result<()> {
    if let Some(front) = &args.front {
        client.fronts = front.split(',').map(str::to_string).collect();
    }
    if let Some(url) = &args.register_url {
        client.register_url = url.clone();
    }
    if let Some(registrar) = &args.registrar {
        client.registrar = registrar
            .parse()
            .map_err(|e| anyhow!("Invalid --registrar: {}", e))?;
    }
    if let Some(transport) = &args.transport {
        client.transport = TransportKind::from_name(transport);
    }
    if let Some(assets) = &args.assets {
        client.asset_dir = Some(assets.clone());
    }
    if let Some(log) = &args.log {
        config.logging.file = Some(log.clone());
    }
    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }
    config.logging.log_to_state_dir |= args.log_to_state_dir;
    config.logging.unsafe_logging |= args.unsafe_logging;
    Ok(())
}

fn asset_dir(client: &ClientConfig, state_dir: Option<&Path>) -> Option<PathBuf> {
    client
        .asset_dir
        .clone()
        .or_else(|| state_dir.map(|dir| dir.join("conjure")))
}

/// Only the direct registrar ships with this crate
fn build_registrar(client: &ClientConfig) -> Result<Arc<dyn Registrar>> {
    match client.registrar {
        RegistrarKind::Direct => Ok(Arc::new(DirectRegistrar::new(client.connect_timeout()))),
        other => Err(anyhow!(
            "{} registrar requires an external rendezvous library",
            other
        )),
    }
}

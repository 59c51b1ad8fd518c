//! Configuration management

use crate::pt::Args;
use crate::rendezvous::{
    RegistrarKind, RegistrationError, RegistrationRequest, RetryPolicy, TransportKind,
    RETRY_INTERVAL, STALENESS_TIMEOUT,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Client configuration
    #[serde(default)]
    pub client: Option<ClientConfig>,
    /// Bridge-side configuration
    #[serde(default)]
    pub server: Option<ServerConfig>,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, crate::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), crate::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| crate::Error::Config(format!("Failed to write config: {}", e)))
    }
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Registration channel
    pub registrar: RegistrarKind,
    /// Base URL of the registration API
    pub register_url: String,
    /// Domain fronts for the registration API
    pub fronts: Vec<String>,
    /// AMP cache URL, required by the `ampcache` registrar
    pub ampcache_url: Option<String>,
    /// uTLS client hello to mimic
    pub utls_client_id: Option<String>,
    pub utls_remove_sni: bool,
    /// Phantom transport name
    pub transport: TransportKind,
    /// STUN server for the `dtls` transport
    pub stun_addr: Option<String>,
    /// Local SOCKS5 listen address
    pub socks5_listen: String,
    /// Directory holding the rendezvous library's assets
    pub asset_dir: Option<PathBuf>,
    pub retry_interval_secs: u64,
    pub staleness_timeout_secs: u64,
    /// Connect timeout for the direct registrar
    pub connect_timeout_secs: u64,
    /// Time the relay gives the second direction after the first one ends
    pub drain_timeout_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            registrar: RegistrarKind::default(),
            register_url: String::new(),
            fronts: Vec::new(),
            ampcache_url: None,
            utls_client_id: None,
            utls_remove_sni: false,
            transport: TransportKind::default(),
            stun_addr: None,
            socks5_listen: "127.0.0.1:0".to_string(),
            asset_dir: None,
            retry_interval_secs: RETRY_INTERVAL.as_secs(),
            staleness_timeout_secs: STALENESS_TIMEOUT.as_secs(),
            connect_timeout_secs: 30,
            drain_timeout_secs: crate::relay::DEFAULT_DRAIN_TIMEOUT.as_secs(),
        }
    }
}

impl ClientConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            retry_interval: Duration::from_secs(self.retry_interval_secs),
            staleness_timeout: Duration::from_secs(self.staleness_timeout_secs),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    /// Build the request for one SOCKS connection.
    ///
    /// Transport arguments from the bridge line override the file values.
    pub fn registration_request(
        &self,
        bridge_address: impl Into<String>,
        args: &Args,
    ) -> Result<RegistrationRequest, RegistrationError> {
        let mut request = RegistrationRequest {
            registrar: self.registrar,
            register_url: self.register_url.clone(),
            fronts: self.fronts.clone(),
            ampcache_url: self.ampcache_url.clone(),
            bridge_address: bridge_address.into(),
            utls_client_id: self.utls_client_id.clone(),
            utls_remove_sni: self.utls_remove_sni,
            transport: self.transport,
            stun_addr: self.stun_addr.clone(),
        };

        if let Some(url) = args.get("url") {
            request.register_url = url.to_string();
        }
        if let Some(front) = args.get("front") {
            request.fronts = split_list(front);
        }
        if let Some(registrar) = args.get("registrar") {
            request.registrar = registrar.parse()?;
        }
        if let Some(transport) = args.get("transport") {
            request.transport = TransportKind::from_name(transport);
        }
        if let Some(ampcache) = args.get("ampcache") {
            request.ampcache_url = Some(ampcache.to_string());
        }
        if let Some(utls) = args.get("utls") {
            request.utls_client_id = Some(utls.to_string());
        }

        request.validate()?;
        Ok(request)
    }
}

/// Bridge-side configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Station addresses allowed to connect, comma separated
    pub allowed_stations: String,
    /// Deadline for the PROXY header, in milliseconds
    pub proxy_header_timeout_ms: u64,
    pub drain_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            allowed_stations: String::new(),
            proxy_header_timeout_ms: 1000,
            drain_timeout_secs: crate::relay::DEFAULT_DRAIN_TIMEOUT.as_secs(),
        }
    }
}

impl ServerConfig {
    pub fn proxy_header_timeout(&self) -> Duration {
        Duration::from_millis(self.proxy_header_timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (pretty, json, compact)
    pub format: String,
    /// Log file path; logs are discarded when unset
    pub file: Option<PathBuf>,
    /// Resolve `file` relative to the transport state directory
    pub log_to_state_dir: bool,
    /// Keep IP addresses in logs
    pub unsafe_logging: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file: None,
            log_to_state_dir: false,
            unsafe_logging: false,
        }
    }
}

/// Generate example configuration
pub fn generate_example_config() -> Config {
    Config {
        client: Some(ClientConfig {
            register_url: "https://registration.refraction.network/api".to_string(),
            fronts: vec!["cdn.sstatic.net".to_string()],
            ..ClientConfig::default()
        }),
        server: Some(ServerConfig {
            allowed_stations: "192.0.2.10".to_string(),
            ..ServerConfig::default()
        }),
        logging: LoggingConfig {
            file: Some(PathBuf::from("conjure.log")),
            ..LoggingConfig::default()
        },
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

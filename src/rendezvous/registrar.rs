//! Registration collaborator
//!
//! Registering with a station, choosing a phantom address and dialing it is
//! the job of an external rendezvous library. This module defines the seam
//! ([`Registrar`]) and the request it receives, plus a direct TCP registrar
//! that skips rendezvous entirely for lab setups.

use super::{BoxedStream, RegistrationError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, info};

/// Registration channel used to reach the station
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RegistrarKind {
    /// Bidirectional HTTP API, optionally domain fronted
    #[default]
    Bdapi,
    /// Bidirectional API through an AMP cache
    Ampcache,
    /// DNS registration (UDP, DoT or DoH per assets)
    Dns,
    /// No registration; dial the bridge directly
    Direct,
}

impl FromStr for RegistrarKind {
    type Err = RegistrationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "bdapi" | "api" => Ok(RegistrarKind::Bdapi),
            "ampcache" => Ok(RegistrarKind::Ampcache),
            "dns" => Ok(RegistrarKind::Dns),
            "direct" => Ok(RegistrarKind::Direct),
            other => Err(RegistrationError::InvalidConfig(format!(
                "unknown registrar '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for RegistrarKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RegistrarKind::Bdapi => "bdapi",
            RegistrarKind::Ampcache => "ampcache",
            RegistrarKind::Dns => "dns",
            RegistrarKind::Direct => "direct",
        };
        f.write_str(name)
    }
}

/// Phantom transport framing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Min,
    Prefix,
    Dtls,
}

impl TransportKind {
    /// Parse a transport name; anything unknown falls back to `min`
    pub fn from_name(name: &str) -> Self {
        match name.to_lowercase().as_str() {
            "prefix" => TransportKind::Prefix,
            "dtls" => TransportKind::Dtls,
            _ => TransportKind::Min,
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransportKind::Min => "min",
            TransportKind::Prefix => "prefix",
            TransportKind::Dtls => "dtls",
        };
        f.write_str(name)
    }
}

/// Everything a registrar needs for one attempt
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistrationRequest {
    pub registrar: RegistrarKind,
    /// Base URL of the registration API
    pub register_url: String,
    /// Domain fronts, one picked per attempt
    pub fronts: Vec<String>,
    pub ampcache_url: Option<String>,
    /// Bridge to reach through the phantom
    pub bridge_address: String,
    pub utls_client_id: Option<String>,
    pub utls_remove_sni: bool,
    pub transport: TransportKind,
    pub stun_addr: Option<String>,
}

impl RegistrationRequest {
    /// Check that the selected registrar has what it needs
    pub fn validate(&self) -> Result<(), RegistrationError> {
        if self.bridge_address.is_empty() {
            return Err(RegistrationError::InvalidConfig(
                "no bridge address".to_string(),
            ));
        }
        match self.registrar {
            RegistrarKind::Ampcache if self.ampcache_url.as_deref().map_or(true, str::is_empty) => {
                Err(RegistrationError::InvalidConfig(
                    "AMP cache registrar selected with no AMP cache URL".to_string(),
                ))
            }
            RegistrarKind::Bdapi | RegistrarKind::Ampcache if self.register_url.is_empty() => {
                Err(RegistrationError::InvalidConfig(format!(
                    "{} registrar selected with no registration URL",
                    self.registrar
                )))
            }
            _ => Ok(()),
        }
    }

    /// Registration endpoint for the selected registrar
    pub fn endpoint(&self) -> Option<String> {
        let base = self.register_url.trim_end_matches('/');
        match self.registrar {
            RegistrarKind::Bdapi => Some(format!("{}/api/register-bidirectional", base)),
            RegistrarKind::Ampcache => Some(format!("{}/amp/register-bidirectional", base)),
            RegistrarKind::Dns | RegistrarKind::Direct => None,
        }
    }
}

/// Performs one registration and returns the phantom connection.
///
/// Any error is treated as transient by the retry loop.
#[async_trait]
pub trait Registrar: Send + Sync {
    async fn register(
        &self,
        request: &RegistrationRequest,
    ) -> Result<BoxedStream, RegistrationError>;
}

/// Dials the bridge over plain TCP without any rendezvous
pub struct DirectRegistrar {
    connect_timeout: Duration,
}

impl DirectRegistrar {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for DirectRegistrar {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

#[async_trait]
impl Registrar for DirectRegistrar {
    async fn register(
        &self,
        request: &RegistrationRequest,
    ) -> Result<BoxedStream, RegistrationError> {
        debug!("Dialing bridge directly");

        let stream = tokio::time::timeout(
            self.connect_timeout,
            TcpStream::connect(&request.bridge_address),
        )
        .await
        .map_err(|_| RegistrationError::Timeout)??;

        stream.set_nodelay(true).ok();
        info!("Connected to bridge at {}", request.bridge_address);

        Ok(Box::new(stream))
    }
}

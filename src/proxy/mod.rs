//! Front ends
//!
//! Provides:
//! - SOCKS5 acceptor for the client side
//! - PROXY protocol header reader and station allow-list for the bridge side

mod haproxy;

#[cfg(feature = "socks5")]
mod socks5;

pub use haproxy::{read_header, AllowList, HaproxyError, ProxyHeader};

#[cfg(feature = "socks5")]
pub use socks5::{ConnectRequest, Socks5Server};

use thiserror::Error;

/// Proxy errors
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid SOCKS version: {0}")]
    InvalidSocksVersion(u8),

    #[error("Unsupported command: {0}")]
    UnsupportedCommand(u8),

    #[error("Address type not supported: {0}")]
    UnsupportedAddressType(u8),

    #[error("Authentication failed")]
    AuthenticationFailed,

    #[error("Invalid transport arguments: {0}")]
    InvalidArgs(#[from] crate::pt::PtError),

    #[error("General failure: {0}")]
    GeneralFailure(String),
}

/// Proxy target address
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    /// IPv4 address and port
    Ipv4([u8; 4], u16),
    /// IPv6 address and port
    Ipv6([u8; 16], u16),
    /// Domain name and port
    Domain(String, u16),
}

impl Address {
    /// Get the port
    pub fn port(&self) -> u16 {
        match self {
            Address::Ipv4(_, port) => *port,
            Address::Ipv6(_, port) => *port,
            Address::Domain(_, port) => *port,
        }
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Address::Ipv4(ip, port) => {
                write!(f, "{}.{}.{}.{}:{}", ip[0], ip[1], ip[2], ip[3], port)
            }
            Address::Ipv6(ip, port) => {
                let addr = std::net::Ipv6Addr::from(*ip);
                write!(f, "[{}]:{}", addr, port)
            }
            Address::Domain(domain, port) => write!(f, "{}:{}", domain, port),
        }
    }
}

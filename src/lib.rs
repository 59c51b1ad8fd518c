//! # conjure-pt
//!
//! A pluggable transport that reaches a bridge through a Conjure phantom
//! address. The slow part, registering with the station and dialing the
//! phantom, happens in the background while the local SOCKS client is
//! already talking.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐     ┌──────────────────────┐     ┌──────────────────┐
//! │ SOCKS5 client│ ──▶ │  ConnectionHandler   │ ──▶ │ DeferredConnection│
//! │   (tor)      │ ◀── │  (RelayPump)         │ ◀── │  buffer + pipe    │
//! └──────────────┘     └──────────────────────┘     └─────────▲────────┘
//!                                                             │ bind
//!                       ┌──────────────────────┐              │
//!                       │ RegistrationRetryLoop│ ─────────────┘
//!                       │  + StalenessMonitor  │ ──▶ Registrar (external)
//!                       └──────────────────────┘
//! ```
//!
//! On the bridge side, [`bridge`] accepts connections from allow-listed
//! stations and relays them to the local OR port with the same
//! [`relay::RelayPump`].

pub mod bridge;
pub mod config;
pub mod logging;
pub mod proxy;
pub mod pt;
pub mod relay;
pub mod rendezvous;

pub use config::Config;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Transport method name announced to the host
pub const METHOD_NAME: &str = "conjure";

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Registration error: {0}")]
    Registration(#[from] rendezvous::RegistrationError),

    #[error("Deferred connection error: {0}")]
    Deferred(#[from] rendezvous::DeferredError),

    #[error("Proxy error: {0}")]
    Proxy(#[from] proxy::ProxyError),

    #[error("PROXY header error: {0}")]
    Haproxy(#[from] proxy::HaproxyError),

    #[error("Bridge error: {0}")]
    Bridge(#[from] bridge::BridgeError),

    #[error("Pluggable transport error: {0}")]
    Pt(#[from] pt::PtError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Timeout")]
    Timeout,
}

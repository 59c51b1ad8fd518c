//! Rendezvous connection manager
//!
//! Provides:
//! - A deferred connection that buffers writes until a phantom connection exists
//! - Staleness detection for phantom connections that never carry traffic
//! - The registration retry loop
//! - The per-client connection handler composing all of the above

mod deferred;
mod handler;
mod registrar;
mod retry;
mod staleness;

pub use deferred::{BoundLink, DeferredConnection};
pub use handler::{ConnectionHandler, HandlerReport};
pub use registrar::{
    DirectRegistrar, Registrar, RegistrarKind, RegistrationRequest, TransportKind,
};
pub use retry::{LoopOutcome, RegistrationRetryLoop};
pub use staleness::{LinkActivity, StalenessMonitor, Verdict};

use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

/// Time a bound phantom connection has to deliver its first byte
pub const STALENESS_TIMEOUT: Duration = Duration::from_secs(5);

/// Delay between registration attempts
pub const RETRY_INTERVAL: Duration = Duration::from_secs(10);

/// Byte stream returned by a registrar
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// Boxed phantom connection
pub type BoxedStream = Box<dyn AsyncStream>;

/// Registration errors
#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Registrar not available: {0}")]
    Unavailable(String),

    #[error("Invalid registration config: {0}")]
    InvalidConfig(String),

    #[error("Station rejected registration: {0}")]
    Rejected(String),

    #[error("Timeout")]
    Timeout,
}

/// Errors binding a phantom connection
#[derive(Debug, Error)]
pub enum DeferredError {
    #[error("Failed to flush buffered data: {0}")]
    Flush(#[source] std::io::Error),

    #[error("Binding superseded by a newer connection")]
    Superseded,

    #[error("Connection closed")]
    Closed,
}

/// Timing policy for the retry loop and staleness monitor
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Delay after a failed attempt, and the defensive re-attempt deadline after a bind
    pub retry_interval: Duration,
    /// Time a fresh binding has to deliver its first byte
    pub staleness_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retry_interval: RETRY_INTERVAL,
            staleness_timeout: STALENESS_TIMEOUT,
        }
    }
}

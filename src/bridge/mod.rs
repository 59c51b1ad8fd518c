//! Bridge-side listener
//!
//! Stations forward phantom connections to the bridge. Each connection must
//! come from an allow-listed station and start with a PROXY header naming
//! the client. The remainder is relayed to the local OR port.

use crate::proxy::{read_header, AllowList, HaproxyError, ProxyHeader};
use crate::relay::{RelayPump, RelayStats};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Bridge connection errors
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Connection from {0} is not an allowed station")]
    NotAllowed(IpAddr),

    #[error("PROXY header error: {0}")]
    Header(#[from] HaproxyError),

    #[error("Timed out waiting for PROXY header")]
    HeaderTimeout,

    #[error("Failed to dial OR port: {0}")]
    OrDial(#[source] io::Error),
}

/// Accepts station connections and relays them to the OR port
#[derive(Debug, Clone)]
pub struct BridgeServer {
    allow_list: Arc<AllowList>,
    or_addr: SocketAddr,
    header_timeout: Duration,
    relay: RelayPump,
}

impl BridgeServer {
    pub fn new(
        allow_list: AllowList,
        or_addr: SocketAddr,
        header_timeout: Duration,
        relay: RelayPump,
    ) -> Self {
        Self {
            allow_list: Arc::new(allow_list),
            or_addr,
            header_timeout,
            relay,
        }
    }

    /// Accept connections until `shutdown` fires
    pub async fn serve(&self, listener: TcpListener, shutdown: CancellationToken) -> io::Result<()> {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Shutting down conjure server");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) if is_transient(&e) => continue,
                        Err(e) => {
                            error!("Error accepting conjure connection: {}", e);
                            return Err(e);
                        }
                    };
                    info!("Received client connection from {}", peer);

                    let server = self.clone();
                    tokio::spawn(async move {
                        match server.handle(stream, peer).await {
                            Ok(stats) => info!(
                                "Done proxying client connection from {} ({} bytes in, {} bytes out)",
                                peer, stats.a_to_b, stats.b_to_a
                            ),
                            Err(e) => warn!("Dropped connection from {}: {}", peer, e),
                        }
                    });
                }
            }
        }
    }

    /// Check, strip the PROXY header from, and relay one station connection
    pub async fn handle<S>(&self, mut stream: S, peer: SocketAddr) -> Result<RelayStats, BridgeError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        if !self.allow_list.contains(peer.ip()) {
            return Err(BridgeError::NotAllowed(peer.ip()));
        }

        let header = tokio::time::timeout(self.header_timeout, read_header(&mut stream))
            .await
            .map_err(|_| BridgeError::HeaderTimeout)??;

        let client = match header {
            ProxyHeader::Proxy { source, .. } => source,
            ProxyHeader::Local | ProxyHeader::Unknown => peer,
        };
        debug!("Station {} forwarded client {}", peer, client);

        let or = TcpStream::connect(self.or_addr)
            .await
            .map_err(BridgeError::OrDial)?;
        or.set_nodelay(true).ok();

        Ok(self.relay.run(stream, or).await)
    }
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}

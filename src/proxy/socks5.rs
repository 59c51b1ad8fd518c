//! SOCKS5 acceptor (RFC 1928) for the client side
//!
//! CONNECT requests are granted as soon as they are parsed; the phantom
//! connection is established later. Username/password authentication
//! (RFC 1929) is accepted unconditionally because the host uses those fields
//! to carry per-bridge transport arguments.

use super::{Address, ProxyError};
use crate::pt::{socks_args, Args};
use std::io;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info};

/// SOCKS5 version
const SOCKS_VERSION: u8 = 0x05;

/// Username/password subnegotiation version
const AUTH_VERSION: u8 = 0x01;

/// Authentication methods
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AuthMethod {
    NoAuth = 0x00,
    Gssapi = 0x01,
    UsernamePassword = 0x02,
    NoAcceptable = 0xFF,
}

/// SOCKS5 commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    Connect = 0x01,
    Bind = 0x02,
    UdpAssociate = 0x03,
}

impl TryFrom<u8> for Command {
    type Error = ProxyError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Command::Connect),
            0x02 => Ok(Command::Bind),
            0x03 => Ok(Command::UdpAssociate),
            _ => Err(ProxyError::UnsupportedCommand(value)),
        }
    }
}

/// Address types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AddressType {
    Ipv4 = 0x01,
    Domain = 0x03,
    Ipv6 = 0x04,
}

impl TryFrom<u8> for AddressType {
    type Error = ProxyError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(AddressType::Ipv4),
            0x03 => Ok(AddressType::Domain),
            0x04 => Ok(AddressType::Ipv6),
            _ => Err(ProxyError::UnsupportedAddressType(value)),
        }
    }
}

/// Reply codes
#[derive(Debug, Clone, Copy)]
#[repr(u8)]
pub enum Reply {
    Succeeded = 0x00,
    GeneralFailure = 0x01,
    CommandNotSupported = 0x07,
    AddressTypeNotSupported = 0x08,
}

/// A granted CONNECT request
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    /// Bridge address the host wants to reach
    pub target: Address,
    /// Transport arguments from the bridge line
    pub args: Args,
}

/// SOCKS5 acceptor
pub struct Socks5Server {
    listener: TcpListener,
}

impl Socks5Server {
    /// Bind a new SOCKS5 listener
    pub async fn bind(addr: &str) -> Result<Self, ProxyError> {
        let listener = TcpListener::bind(addr).await?;
        info!("Started SOCKS listener at {}", listener.local_addr()?);

        Ok(Self { listener })
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> Result<SocketAddr, ProxyError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept and handle incoming connections
    pub async fn run<F, Fut>(&self, handler: F) -> Result<(), ProxyError>
    where
        F: Fn(TcpStream, ConnectRequest) -> Fut + Clone + Send + 'static,
        Fut: std::future::Future<Output = Result<(), ProxyError>> + Send,
    {
        loop {
            let (stream, peer_addr) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) if is_transient_accept_error(&e) => {
                    error!("SOCKS5 accept error: {}", e);
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            debug!("New SOCKS5 connection from {}", peer_addr);

            let handler = handler.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, handler).await {
                    error!("SOCKS5 connection error: {}", e);
                }
            });
        }
    }

    /// Negotiate, grant the CONNECT, then hand the stream to `handler`
    pub async fn handle_connection<S, F, Fut>(mut stream: S, handler: F) -> Result<(), ProxyError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
        F: Fn(S, ConnectRequest) -> Fut,
        Fut: std::future::Future<Output = Result<(), ProxyError>>,
    {
        // Read greeting
        let mut buf = [0u8; 258];
        stream.read_exact(&mut buf[..2]).await?;

        if buf[0] != SOCKS_VERSION {
            return Err(ProxyError::InvalidSocksVersion(buf[0]));
        }

        let nmethods = buf[1] as usize;
        stream.read_exact(&mut buf[..nmethods]).await?;

        // Prefer username/password so transport arguments come through
        let offered = &buf[..nmethods];
        let method = if offered.contains(&(AuthMethod::UsernamePassword as u8)) {
            AuthMethod::UsernamePassword
        } else if offered.contains(&(AuthMethod::NoAuth as u8)) {
            AuthMethod::NoAuth
        } else {
            AuthMethod::NoAcceptable
        };

        stream.write_all(&[SOCKS_VERSION, method as u8]).await?;

        let args = match method {
            AuthMethod::NoAcceptable | AuthMethod::Gssapi => {
                return Err(ProxyError::AuthenticationFailed);
            }
            AuthMethod::NoAuth => Args::default(),
            AuthMethod::UsernamePassword => {
                stream.read_exact(&mut buf[..2]).await?;
                if buf[0] != AUTH_VERSION {
                    return Err(ProxyError::AuthenticationFailed);
                }
                let ulen = buf[1] as usize;
                stream.read_exact(&mut buf[..ulen]).await?;
                let username = String::from_utf8_lossy(&buf[..ulen]).to_string();

                stream.read_exact(&mut buf[..1]).await?;
                let plen = buf[0] as usize;
                stream.read_exact(&mut buf[..plen]).await?;
                let password = String::from_utf8_lossy(&buf[..plen]).to_string();

                match socks_args(&username, &password) {
                    Ok(args) => {
                        stream.write_all(&[AUTH_VERSION, 0x00]).await?;
                        args
                    }
                    Err(e) => {
                        stream.write_all(&[AUTH_VERSION, 0x01]).await?;
                        return Err(e.into());
                    }
                }
            }
        };

        // Read request
        stream.read_exact(&mut buf[..4]).await?;

        if buf[0] != SOCKS_VERSION {
            return Err(ProxyError::InvalidSocksVersion(buf[0]));
        }

        let command = Command::try_from(buf[1]);
        // buf[2] is reserved
        let addr_type = match AddressType::try_from(buf[3]) {
            Ok(addr_type) => addr_type,
            Err(e) => {
                let reply = Self::make_reply(Reply::AddressTypeNotSupported, &Address::Ipv4([0; 4], 0));
                stream.write_all(&reply).await?;
                return Err(e);
            }
        };

        // Read address
        let address = match addr_type {
            AddressType::Ipv4 => {
                let mut ip = [0u8; 4];
                stream.read_exact(&mut ip).await?;
                let port = stream.read_u16().await?;
                Address::Ipv4(ip, port)
            }
            AddressType::Domain => {
                stream.read_exact(&mut buf[..1]).await?;
                let len = buf[0] as usize;
                stream.read_exact(&mut buf[..len]).await?;
                let domain = String::from_utf8_lossy(&buf[..len]).to_string();
                let port = stream.read_u16().await?;
                Address::Domain(domain, port)
            }
            AddressType::Ipv6 => {
                let mut ip = [0u8; 16];
                stream.read_exact(&mut ip).await?;
                let port = stream.read_u16().await?;
                Address::Ipv6(ip, port)
            }
        };

        match command {
            Ok(Command::Connect) => {
                debug!("SOCKS5 CONNECT to {}", address);
                // Granted optimistically; the phantom connection comes later
                let reply = Self::make_reply(Reply::Succeeded, &address);
                stream.write_all(&reply).await?;

                handler(stream, ConnectRequest { target: address, args }).await
            }
            Ok(command) => {
                let reply = Self::make_reply(Reply::CommandNotSupported, &address);
                stream.write_all(&reply).await?;
                Err(ProxyError::UnsupportedCommand(command as u8))
            }
            Err(e) => {
                let reply = Self::make_reply(Reply::GeneralFailure, &address);
                stream.write_all(&reply).await?;
                Err(e)
            }
        }
    }

    fn make_reply(reply: Reply, addr: &Address) -> Vec<u8> {
        let mut buf = vec![SOCKS_VERSION, reply as u8, 0x00];

        match addr {
            Address::Ipv4(ip, port) => {
                buf.push(AddressType::Ipv4 as u8);
                buf.extend_from_slice(ip);
                buf.extend_from_slice(&port.to_be_bytes());
            }
            Address::Ipv6(ip, port) => {
                buf.push(AddressType::Ipv6 as u8);
                buf.extend_from_slice(ip);
                buf.extend_from_slice(&port.to_be_bytes());
            }
            Address::Domain(domain, port) => {
                buf.push(AddressType::Domain as u8);
                buf.push(domain.len() as u8);
                buf.extend_from_slice(domain.as_bytes());
                buf.extend_from_slice(&port.to_be_bytes());
            }
        }

        buf
    }
}

fn is_transient_accept_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tokio::io::{duplex, DuplexStream};

    type Seen = Arc<Mutex<Option<ConnectRequest>>>;

    async fn serve(server: DuplexStream) -> (Result<(), ProxyError>, Seen) {
        let seen: Seen = Arc::new(Mutex::new(None));
        let record = Arc::clone(&seen);
        let result = Socks5Server::handle_connection(server, move |mut stream, request| {
            let record = Arc::clone(&record);
            async move {
                *record.lock().unwrap() = Some(request);
                stream.write_all(b"relayed").await?;
                Ok(())
            }
        })
        .await;
        (result, seen)
    }

    #[tokio::test]
    async fn test_connect_with_args() {
        let (mut client, server) = duplex(1024);
        let server = tokio::spawn(serve(server));

        client.write_all(&[0x05, 0x02, 0x00, 0x02]).await.unwrap();
        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();
        assert_eq!(method, [0x05, 0x02]);

        let user = b"url=https://reg.example/;front=cdn.example";
        let mut auth = vec![0x01, user.len() as u8];
        auth.extend_from_slice(user);
        auth.extend_from_slice(&[0x01, 0x00]);
        client.write_all(&auth).await.unwrap();
        let mut status = [0u8; 2];
        client.read_exact(&mut status).await.unwrap();
        assert_eq!(status, [0x01, 0x00]);

        client
            .write_all(&[0x05, 0x01, 0x00, 0x01, 192, 0, 2, 7, 0x01, 0xBB])
            .await
            .unwrap();
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], Reply::Succeeded as u8);

        let mut relayed = [0u8; 7];
        client.read_exact(&mut relayed).await.unwrap();
        assert_eq!(&relayed, b"relayed");

        let (result, seen) = server.await.unwrap();
        result.unwrap();
        let request = seen.lock().unwrap().take().unwrap();
        assert_eq!(request.target, Address::Ipv4([192, 0, 2, 7], 443));
        assert_eq!(request.args.get("url"), Some("https://reg.example/"));
        assert_eq!(request.args.get("front"), Some("cdn.example"));
    }

    #[tokio::test]
    async fn test_no_auth_connect() {
        let (mut client, server) = duplex(1024);
        let server = tokio::spawn(serve(server));

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();
        assert_eq!(method, [0x05, 0x00]);

        let mut request = vec![0x05, 0x01, 0x00, 0x03, 14];
        request.extend_from_slice(b"bridge.example");
        request.extend_from_slice(&9001u16.to_be_bytes());
        client.write_all(&request).await.unwrap();

        let mut reply = [0u8; 4];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], Reply::Succeeded as u8);

        let (result, seen) = server.await.unwrap();
        result.unwrap();
        let request = seen.lock().unwrap().take().unwrap();
        assert_eq!(request.target, Address::Domain("bridge.example".into(), 9001));
        assert!(request.args.is_empty());
    }

    #[tokio::test]
    async fn test_bad_args_fail_auth() {
        let (mut client, server) = duplex(1024);
        let server = tokio::spawn(serve(server));

        client.write_all(&[0x05, 0x01, 0x02]).await.unwrap();
        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();

        client.write_all(&[0x01, 0x04, b'o', b'o', b'p', b's', 0x01, 0x00]).await.unwrap();
        let mut status = [0u8; 2];
        client.read_exact(&mut status).await.unwrap();
        assert_eq!(status, [0x01, 0x01]);

        let (result, seen) = server.await.unwrap();
        assert!(matches!(result, Err(ProxyError::InvalidArgs(_))));
        assert!(seen.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_bind_command_rejected() {
        let (mut client, server) = duplex(1024);
        let server = tokio::spawn(serve(server));

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();

        client
            .write_all(&[0x05, 0x02, 0x00, 0x01, 127, 0, 0, 1, 0, 80])
            .await
            .unwrap();
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], Reply::CommandNotSupported as u8);

        let (result, _) = server.await.unwrap();
        assert!(matches!(result, Err(ProxyError::UnsupportedCommand(0x02))));
    }
}

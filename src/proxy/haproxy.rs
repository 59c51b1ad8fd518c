//! PROXY protocol (v1 and v2) header reader
//!
//! Stations forward phantom traffic to the bridge with a PROXY header that
//! names the original client. Only stations on the allow-list may send one.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// v2 binary signature
const V2_SIGNATURE: [u8; 12] = *b"\r\n\r\n\0\r\nQUIT\n";

/// Longest legal v1 header, CRLF included
const V1_MAX_LEN: usize = 107;

/// PROXY header errors
#[derive(Debug, Error)]
pub enum HaproxyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Missing PROXY protocol header")]
    MissingHeader,

    #[error("Malformed PROXY header: {0}")]
    Malformed(String),

    #[error("Unsupported PROXY protocol version or command: {0:#04x}")]
    Unsupported(u8),

    #[error("Invalid allow-list: {0}")]
    InvalidAllowList(String),
}

/// Parsed PROXY header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyHeader {
    /// Proxied connection with the original endpoints
    Proxy {
        source: SocketAddr,
        destination: SocketAddr,
    },
    /// Health check or local connection; use the socket addresses
    Local,
    /// Proxied connection with an unknown or unsupported address family
    Unknown,
}

impl ProxyHeader {
    /// Original client address, if the header carried one
    pub fn source(&self) -> Option<SocketAddr> {
        match self {
            ProxyHeader::Proxy { source, .. } => Some(*source),
            _ => None,
        }
    }
}

/// Read one PROXY header from the front of `reader`.
///
/// Reads exactly the header bytes, so the stream is positioned at the
/// payload afterwards.
pub async fn read_header<R>(reader: &mut R) -> Result<ProxyHeader, HaproxyError>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; 12];
    reader.read_exact(&mut prefix).await?;

    if prefix == V2_SIGNATURE {
        read_v2(reader).await
    } else if prefix.starts_with(b"PROXY ") {
        read_v1(reader, &prefix).await
    } else {
        Err(HaproxyError::MissingHeader)
    }
}

async fn read_v2<R>(reader: &mut R) -> Result<ProxyHeader, HaproxyError>
where
    R: AsyncRead + Unpin,
{
    let mut fixed = [0u8; 4];
    reader.read_exact(&mut fixed).await?;

    let ver_cmd = fixed[0];
    let family = fixed[1];
    let len = u16::from_be_bytes([fixed[2], fixed[3]]) as usize;

    if ver_cmd >> 4 != 0x2 {
        return Err(HaproxyError::Unsupported(ver_cmd));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;

    match ver_cmd & 0x0F {
        0x0 => return Ok(ProxyHeader::Local),
        0x1 => {}
        _ => return Err(HaproxyError::Unsupported(ver_cmd)),
    }

    // High nibble is the address family, low nibble the transport
    match family >> 4 {
        0x1 => {
            if body.len() < 12 {
                return Err(HaproxyError::Malformed("short IPv4 address block".into()));
            }
            let src = Ipv4Addr::new(body[0], body[1], body[2], body[3]);
            let dst = Ipv4Addr::new(body[4], body[5], body[6], body[7]);
            let src_port = u16::from_be_bytes([body[8], body[9]]);
            let dst_port = u16::from_be_bytes([body[10], body[11]]);
            Ok(ProxyHeader::Proxy {
                source: SocketAddr::new(src.into(), src_port),
                destination: SocketAddr::new(dst.into(), dst_port),
            })
        }
        0x2 => {
            if body.len() < 36 {
                return Err(HaproxyError::Malformed("short IPv6 address block".into()));
            }
            let mut src = [0u8; 16];
            let mut dst = [0u8; 16];
            src.copy_from_slice(&body[..16]);
            dst.copy_from_slice(&body[16..32]);
            let src_port = u16::from_be_bytes([body[32], body[33]]);
            let dst_port = u16::from_be_bytes([body[34], body[35]]);
            Ok(ProxyHeader::Proxy {
                source: SocketAddr::new(Ipv6Addr::from(src).into(), src_port),
                destination: SocketAddr::new(Ipv6Addr::from(dst).into(), dst_port),
            })
        }
        _ => Ok(ProxyHeader::Unknown),
    }
}

async fn read_v1<R>(reader: &mut R, prefix: &[u8]) -> Result<ProxyHeader, HaproxyError>
where
    R: AsyncRead + Unpin,
{
    // A line ending inside the fixed-size prefix means payload bytes were read
    if let Some(pos) = prefix.windows(2).position(|w| w == b"\r\n") {
        if pos + 2 != prefix.len() {
            return Err(HaproxyError::Malformed("truncated v1 header".into()));
        }
    }

    let mut line = prefix.to_vec();
    while !line.ends_with(b"\r\n") {
        if line.len() >= V1_MAX_LEN {
            return Err(HaproxyError::Malformed("v1 header too long".into()));
        }
        line.push(reader.read_u8().await?);
    }
    line.truncate(line.len() - 2);

    let line = std::str::from_utf8(&line)
        .map_err(|_| HaproxyError::Malformed("v1 header is not ASCII".into()))?;
    let fields: Vec<&str> = line.split(' ').collect();

    match fields.get(1).copied() {
        Some("UNKNOWN") => Ok(ProxyHeader::Unknown),
        Some("TCP4") | Some("TCP6") if fields.len() == 6 => {
            let src_ip = parse_field::<IpAddr>(fields[2], "source address")?;
            let dst_ip = parse_field::<IpAddr>(fields[3], "destination address")?;
            let src_port = parse_field::<u16>(fields[4], "source port")?;
            let dst_port = parse_field::<u16>(fields[5], "destination port")?;

            let v4 = fields[1] == "TCP4";
            if src_ip.is_ipv4() != v4 || dst_ip.is_ipv4() != v4 {
                return Err(HaproxyError::Malformed("address family mismatch".into()));
            }

            Ok(ProxyHeader::Proxy {
                source: SocketAddr::new(src_ip, src_port),
                destination: SocketAddr::new(dst_ip, dst_port),
            })
        }
        _ => Err(HaproxyError::Malformed(format!("bad v1 header {:?}", line))),
    }
}

fn parse_field<T: FromStr>(field: &str, what: &str) -> Result<T, HaproxyError> {
    field
        .parse()
        .map_err(|_| HaproxyError::Malformed(format!("bad {} {:?}", what, field)))
}

/// Station addresses allowed to send PROXY headers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllowList {
    stations: Vec<IpAddr>,
}

impl AllowList {
    pub fn new(stations: Vec<IpAddr>) -> Result<Self, HaproxyError> {
        if stations.is_empty() {
            return Err(HaproxyError::InvalidAllowList("no stations listed".into()));
        }
        Ok(Self { stations })
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        let ip = match ip {
            IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(ip),
            v4 => v4,
        };
        self.stations.contains(&ip)
    }

    pub fn stations(&self) -> &[IpAddr] {
        &self.stations
    }
}

impl FromStr for AllowList {
    type Err = HaproxyError;

    /// Comma-separated list of IP addresses
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let stations = s
            .split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(|entry| {
                entry
                    .parse::<IpAddr>()
                    .map_err(|_| HaproxyError::InvalidAllowList(format!("bad address {:?}", entry)))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(stations)
    }
}

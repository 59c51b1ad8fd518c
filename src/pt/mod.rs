//! Pluggable transport managed-proxy protocol
//!
//! The host (tor) configures the transport through `TOR_PT_*` environment
//! variables and reads status lines from stdout. Stdout therefore belongs to
//! this protocol; logs must go elsewhere.

mod args;

pub use args::{parse_args, socks_args, Args};

use std::io::{self, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Managed-proxy protocol version we speak
pub const PT_VERSION: &str = "1";

/// Pluggable transport errors
#[derive(Debug, Error)]
pub enum PtError {
    #[error("{0} environment variable not set")]
    MissingEnv(&'static str),

    #[error("No supported managed transport version in {0:?}")]
    UnsupportedVersion(String),

    #[error("Invalid {var}: {reason}")]
    InvalidEnv { var: &'static str, reason: String },

    #[error("Invalid transport args: {0}")]
    InvalidArgs(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Host log severities
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
    Notice,
    Info,
    Debug,
}

impl Severity {
    fn as_str(&self) -> &'static str {
        match self {
            Severity::Error => "error",
            Severity::Warning => "warning",
            Severity::Notice => "notice",
            Severity::Info => "info",
            Severity::Debug => "debug",
        }
    }
}

/// Client-side configuration handed over by the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    pub method_names: Vec<String>,
    pub proxy_url: Option<String>,
    pub state_location: Option<PathBuf>,
}

/// A method/address pair from `TOR_PT_SERVER_BINDADDR`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bindaddr {
    pub method_name: String,
    pub addr: SocketAddr,
}

/// Server-side configuration handed over by the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    pub bindaddrs: Vec<Bindaddr>,
    pub or_addr: Option<SocketAddr>,
    pub extended_or_addr: Option<SocketAddr>,
    pub state_location: Option<PathBuf>,
}

fn required<F>(env: &F, var: &'static str) -> Result<String, PtError>
where
    F: Fn(&str) -> Option<String>,
{
    env(var).ok_or(PtError::MissingEnv(var))
}

fn optional<F>(env: &F, var: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    env(var).filter(|v| !v.is_empty())
}

fn parse_addr(var: &'static str, value: &str) -> Result<SocketAddr, PtError> {
    value.parse().map_err(|e| PtError::InvalidEnv {
        var,
        reason: format!("{}: {}", value, e),
    })
}

/// Negotiate the protocol version, printing `VERSION` or `VERSION-ERROR`
fn negotiate_version<F, W>(env: &F, out: &mut W) -> Result<(), PtError>
where
    F: Fn(&str) -> Option<String>,
    W: Write,
{
    let versions = required(env, "TOR_PT_MANAGED_TRANSPORT_VER")?;
    if versions.split(',').any(|v| v == PT_VERSION) {
        writeln!(out, "VERSION {}", PT_VERSION)?;
        out.flush()?;
        Ok(())
    } else {
        writeln!(out, "VERSION-ERROR no-version")?;
        out.flush()?;
        Err(PtError::UnsupportedVersion(versions))
    }
}

impl ClientInfo {
    /// Read client configuration from the process environment
    pub fn from_env() -> Result<Self, PtError> {
        Self::from_env_with(|k| std::env::var(k).ok(), &mut io::stdout())
    }

    /// Read client configuration through `env`, writing replies to `out`
    pub fn from_env_with<F, W>(env: F, out: &mut W) -> Result<Self, PtError>
    where
        F: Fn(&str) -> Option<String>,
        W: Write,
    {
        negotiate_version(&env, out)?;

        let method_names = required(&env, "TOR_PT_CLIENT_TRANSPORTS")?
            .split(',')
            .filter(|m| !m.is_empty())
            .map(str::to_string)
            .collect();

        Ok(Self {
            method_names,
            proxy_url: optional(&env, "TOR_PT_PROXY"),
            state_location: optional(&env, "TOR_PT_STATE_LOCATION").map(PathBuf::from),
        })
    }
}

impl ServerInfo {
    /// Read server configuration from the process environment
    pub fn from_env() -> Result<Self, PtError> {
        Self::from_env_with(|k| std::env::var(k).ok(), &mut io::stdout())
    }

    /// Read server configuration through `env`, writing replies to `out`
    pub fn from_env_with<F, W>(env: F, out: &mut W) -> Result<Self, PtError>
    where
        F: Fn(&str) -> Option<String>,
        W: Write,
    {
        negotiate_version(&env, out)?;

        let transports: Vec<String> = required(&env, "TOR_PT_SERVER_TRANSPORTS")?
            .split(',')
            .filter(|m| !m.is_empty())
            .map(str::to_string)
            .collect();

        let mut bindaddrs = Vec::new();
        if let Some(spec) = optional(&env, "TOR_PT_SERVER_BINDADDR") {
            for entry in spec.split(',') {
                let (method_name, addr) =
                    entry.split_once('-').ok_or_else(|| PtError::InvalidEnv {
                        var: "TOR_PT_SERVER_BINDADDR",
                        reason: format!("missing method in {:?}", entry),
                    })?;
                bindaddrs.push(Bindaddr {
                    method_name: method_name.to_string(),
                    addr: parse_addr("TOR_PT_SERVER_BINDADDR", addr)?,
                });
            }
        } else {
            // Without explicit addresses every transport listens on an ephemeral port
            for method_name in &transports {
                bindaddrs.push(Bindaddr {
                    method_name: method_name.clone(),
                    addr: SocketAddr::from(([0, 0, 0, 0], 0)),
                });
            }
        }
        bindaddrs.retain(|b| transports.contains(&b.method_name));

        let or_addr = optional(&env, "TOR_PT_ORPORT")
            .map(|v| parse_addr("TOR_PT_ORPORT", &v))
            .transpose()?;
        let extended_or_addr = optional(&env, "TOR_PT_EXTENDED_SERVER_PORT")
            .map(|v| parse_addr("TOR_PT_EXTENDED_SERVER_PORT", &v))
            .transpose()?;

        if or_addr.is_none() && extended_or_addr.is_none() {
            return Err(PtError::MissingEnv("TOR_PT_ORPORT"));
        }

        Ok(Self {
            bindaddrs,
            or_addr,
            extended_or_addr,
            state_location: optional(&env, "TOR_PT_STATE_LOCATION").map(PathBuf::from),
        })
    }
}

/// Create the state directory if it does not exist yet
pub fn make_state_dir(location: &Path) -> Result<PathBuf, PtError> {
    std::fs::create_dir_all(location)?;
    Ok(location.to_path_buf())
}

/// Whether the host asked us to exit when stdin closes
pub fn exit_on_stdin_close() -> bool {
    std::env::var("TOR_PT_EXIT_ON_STDIN_CLOSE").as_deref() == Ok("1")
}

/// Wait until the host asks us to stop.
///
/// That is SIGINT, SIGTERM, or stdin closing when
/// `TOR_PT_EXIT_ON_STDIN_CLOSE=1`.
pub async fn wait_for_termination() {
    let stdin_closed = async {
        if exit_on_stdin_close() {
            let mut stdin = tokio::io::stdin();
            if let Err(e) = tokio::io::copy(&mut stdin, &mut tokio::io::sink()).await {
                debug!("Error reading stdin: {}", e);
            }
            info!("Terminating because of stdin close");
        } else {
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received interrupt"),
        _ = terminate => info!("Received SIGTERM"),
        _ = stdin_closed => {}
    }
}

/// Quote a value for a `LOG` / `STATUS` line
fn quote(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('"');
    for c in value.chars() {
        match c {
            '"' => quoted.push_str("\\\""),
            '\\' => quoted.push_str("\\\\"),
            '\n' => quoted.push_str("\\n"),
            '\r' => quoted.push_str("\\r"),
            '\t' => quoted.push_str("\\t"),
            c => quoted.push(c),
        }
    }
    quoted.push('"');
    quoted
}

/// Line writer for protocol replies
pub struct Reply<W: Write> {
    out: W,
}

impl Reply<io::Stdout> {
    pub fn stdout() -> Self {
        Self { out: io::stdout() }
    }
}

impl<W: Write> Reply<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn line(&mut self, line: String) {
        // Nothing sensible to do if the host went away
        let _ = writeln!(self.out, "{}", line);
        let _ = self.out.flush();
    }

    pub fn env_error(&mut self, msg: &str) {
        self.line(format!("ENV-ERROR {}", msg));
    }

    pub fn proxy_error(&mut self, msg: &str) {
        self.line(format!("PROXY-ERROR {}", msg));
    }

    pub fn cmethod(&mut self, name: &str, socks: &str, addr: SocketAddr) {
        self.line(format!("CMETHOD {} {} {}", name, socks, addr));
    }

    pub fn cmethod_error(&mut self, name: &str, msg: &str) {
        self.line(format!("CMETHOD-ERROR {} {}", name, msg));
    }

    pub fn cmethods_done(&mut self) {
        self.line("CMETHODS DONE".to_string());
    }

    pub fn smethod(&mut self, name: &str, addr: SocketAddr) {
        self.line(format!("SMETHOD {} {}", name, addr));
    }

    pub fn smethod_error(&mut self, name: &str, msg: &str) {
        self.line(format!("SMETHOD-ERROR {} {}", name, msg));
    }

    pub fn smethods_done(&mut self) {
        self.line("SMETHODS DONE".to_string());
    }

    pub fn log(&mut self, severity: Severity, message: &str) {
        self.line(format!(
            "LOG SEVERITY={} MESSAGE={}",
            severity.as_str(),
            quote(message)
        ));
    }
}

/// Send a log line to the host
pub fn log(severity: Severity, message: &str) {
    Reply::stdout().log(severity, message);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn test_client_setup() {
        let mut out = Vec::new();
        let info = ClientInfo::from_env_with(
            env(&[
                ("TOR_PT_MANAGED_TRANSPORT_VER", "1"),
                ("TOR_PT_CLIENT_TRANSPORTS", "conjure,obfs4"),
                ("TOR_PT_STATE_LOCATION", "/var/lib/tor/pt_state"),
            ]),
            &mut out,
        )
        .unwrap();

        assert_eq!(info.method_names, vec!["conjure", "obfs4"]);
        assert_eq!(info.proxy_url, None);
        assert_eq!(info.state_location, Some(PathBuf::from("/var/lib/tor/pt_state")));
        assert_eq!(String::from_utf8(out).unwrap(), "VERSION 1\n");
    }

    #[test]
    fn test_unsupported_version() {
        let mut out = Vec::new();
        let result = ClientInfo::from_env_with(
            env(&[
                ("TOR_PT_MANAGED_TRANSPORT_VER", "2,3"),
                ("TOR_PT_CLIENT_TRANSPORTS", "conjure"),
            ]),
            &mut out,
        );
        assert!(matches!(result, Err(PtError::UnsupportedVersion(_))));
        assert_eq!(String::from_utf8(out).unwrap(), "VERSION-ERROR no-version\n");
    }

    #[test]
    fn test_server_setup() {
        let mut out = Vec::new();
        let info = ServerInfo::from_env_with(
            env(&[
                ("TOR_PT_MANAGED_TRANSPORT_VER", "1"),
                ("TOR_PT_SERVER_TRANSPORTS", "conjure"),
                ("TOR_PT_SERVER_BINDADDR", "conjure-0.0.0.0:4443,obfs4-0.0.0.0:4444"),
                ("TOR_PT_ORPORT", "127.0.0.1:9001"),
            ]),
            &mut out,
        )
        .unwrap();

        assert_eq!(info.bindaddrs.len(), 1);
        assert_eq!(info.bindaddrs[0].method_name, "conjure");
        assert_eq!(info.bindaddrs[0].addr, "0.0.0.0:4443".parse().unwrap());
        assert_eq!(info.or_addr, Some("127.0.0.1:9001".parse().unwrap()));
    }

    #[test]
    fn test_server_setup_requires_orport() {
        let result = ServerInfo::from_env_with(
            env(&[
                ("TOR_PT_MANAGED_TRANSPORT_VER", "1"),
                ("TOR_PT_SERVER_TRANSPORTS", "conjure"),
            ]),
            &mut Vec::new(),
        );
        assert!(matches!(result, Err(PtError::MissingEnv("TOR_PT_ORPORT"))));
    }

    #[test]
    fn test_reply_lines() {
        let mut reply = Reply::new(Vec::new());
        reply.cmethod("conjure", "socks5", "127.0.0.1:4000".parse().unwrap());
        reply.cmethod_error("obfs4", "no such method");
        reply.cmethods_done();
        reply.log(Severity::Notice, "station \"busy\"\nretrying");

        let text = String::from_utf8(reply.into_inner()).unwrap();
        assert_eq!(
            text,
            "CMETHOD conjure socks5 127.0.0.1:4000\n\
             CMETHOD-ERROR obfs4 no such method\n\
             CMETHODS DONE\n\
             LOG SEVERITY=notice MESSAGE=\"station \\\"busy\\\"\\nretrying\"\n"
        );
    }
}

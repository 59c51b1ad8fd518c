//! Logging setup
//!
//! Stdout belongs to the pluggable-transport protocol, so logs go to a file
//! or nowhere. Unless unsafe logging is enabled, IP addresses are scrubbed
//! from every line before it is written.

use crate::config::LoggingConfig;
use lazy_static::lazy_static;
use regex::Regex;
use std::borrow::Cow;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::net::Ipv6Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::fmt::writer::{BoxMakeWriter, MakeWriter};
use tracing_subscriber::EnvFilter;

/// Replacement text for scrubbed addresses
pub const SCRUBBED: &str = "[scrubbed]";

lazy_static! {
    // IPv4 with optional port
    static ref IPV4_RE: Regex = Regex::new(
        r"\b(?:\d{1,3}\.){3}\d{1,3}(?::\d{1,5})?\b"
    ).unwrap();

    // Bracketed IPv6 with port: [2001:db8::1]:443
    static ref IPV6_PORT_RE: Regex = Regex::new(
        r"\[[0-9A-Fa-f:.]*:[0-9A-Fa-f:.]*\](?::\d{1,5})?"
    ).unwrap();

    // Bare IPv6, including compressed and v4-mapped forms
    static ref IPV6_RE: Regex = Regex::new(
        r"(?:[0-9A-Fa-f]{0,4}:){2,7}(?:(?:\d{1,3}\.){3}\d{1,3}|[0-9A-Fa-f]{1,4})?"
    ).unwrap();
}

/// Replace IP addresses (and their ports) in `input`
pub fn scrub(input: &str) -> Cow<'_, str> {
    let mut s = IPV6_PORT_RE.replace_all(input, SCRUBBED).into_owned();
    let bare = IPV6_RE
        .replace_all(&s, |caps: &regex::Captures| match caps.get(0) {
            Some(m) if is_bare_ipv6(&s, m.start(), m.end()) => SCRUBBED.to_string(),
            Some(m) => m.as_str().to_string(),
            None => String::new(),
        })
        .into_owned();
    s = bare;
    s = IPV4_RE.replace_all(&s, SCRUBBED).into_owned();

    if s == input {
        Cow::Borrowed(input)
    } else {
        Cow::Owned(s)
    }
}

/// Whether `text[start..end]` is a whole IPv6 address and not part of a
/// timestamp or a `module::path`
fn is_bare_ipv6(text: &str, start: usize, end: usize) -> bool {
    let word = |c: char| c.is_ascii_alphanumeric() || c == '_' || c == ':';
    let before = text[..start].chars().next_back();
    let after = text[end..].chars().next();
    if before.map_or(false, |c| word(c) || c == '.') || after.map_or(false, word) {
        return false;
    }
    text[start..end].parse::<Ipv6Addr>().is_ok()
}

/// Writer that scrubs addresses from everything passing through it
pub struct LogScrubber<W> {
    inner: W,
}

impl<W: Write> LogScrubber<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for LogScrubber<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let text = String::from_utf8_lossy(buf);
        self.inner.write_all(scrub(&text).as_bytes())?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// [`MakeWriter`] wrapping each writer in a [`LogScrubber`]
pub struct Scrubbed<M> {
    inner: M,
}

impl<'a, M: MakeWriter<'a>> MakeWriter<'a> for Scrubbed<M> {
    type Writer = LogScrubber<M::Writer>;

    fn make_writer(&'a self) -> Self::Writer {
        LogScrubber::new(self.inner.make_writer())
    }
}

/// Where the log file goes, if anywhere
pub fn log_path(config: &LoggingConfig, state_dir: Option<&Path>) -> Option<PathBuf> {
    let file = config.file.as_ref()?;
    match state_dir {
        Some(dir) if config.log_to_state_dir => Some(dir.join(file)),
        _ => Some(file.clone()),
    }
}

/// Build the writer described by `config`
pub fn make_writer(config: &LoggingConfig, state_dir: Option<&Path>) -> io::Result<BoxMakeWriter> {
    let writer = match log_path(config, state_dir) {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            let file = Arc::new(file);
            if config.unsafe_logging {
                BoxMakeWriter::new(file)
            } else {
                BoxMakeWriter::new(Scrubbed { inner: file })
            }
        }
        None => BoxMakeWriter::new(io::sink),
    };
    Ok(writer)
}

/// Install the global subscriber
pub fn init(config: &LoggingConfig, state_dir: Option<&Path>) -> crate::Result<()> {
    let writer = make_writer(config, state_dir)
        .map_err(|e| crate::Error::Config(format!("Failed to open log file: {}", e)))?;

    let filter = EnvFilter::try_new(&config.level)
        .map_err(|e| crate::Error::Config(format!("Invalid log level: {}", e)))?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false);

    let result = match config.format.as_str() {
        "json" => builder.json().try_init(),
        "compact" => builder.compact().try_init(),
        _ => builder.pretty().try_init(),
    };

    result.map_err(|e| crate::Error::Config(format!("Failed to install logger: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scrub_ipv4() {
        assert_eq!(
            scrub("Connected to bridge at 192.0.2.7:443"),
            "Connected to bridge at [scrubbed]"
        );
        assert_eq!(scrub("peer 10.0.0.1 closed"), "peer [scrubbed] closed");
    }

    #[test]
    fn test_scrub_ipv6() {
        assert_eq!(
            scrub("dialing [2001:db8::1]:443 now"),
            "dialing [scrubbed] now"
        );
        assert_eq!(scrub("from fe80::1 ok"), "from [scrubbed] ok");
        assert_eq!(scrub("mapped ::ffff:192.0.2.1"), "mapped [scrubbed]");
    }

    #[test]
    fn test_scrub_leaves_other_text() {
        let line = "2026-10-19T12:30:45Z retrying conjure registration in 10s";
        assert_eq!(scrub(line), line);
        assert!(matches!(scrub("no addresses here"), Cow::Borrowed(_)));
    }

    #[test]
    fn test_scrub_keeps_module_paths() {
        let line = "INFO conjure_pt::rendezvous::deferred: Flushed 5 bytes; std::io::Error";
        assert!(matches!(scrub(line), Cow::Borrowed(_)));
        assert_eq!(
            scrub("conjure_pt::relay: peer fe80::1 closed"),
            "conjure_pt::relay: peer [scrubbed] closed"
        );
    }

    #[test]
    fn test_scrubber_writer() {
        let mut writer = LogScrubber::new(Vec::new());
        let line = b"SOCKS accepted: 127.0.0.1:9050\n";
        assert_eq!(writer.write(line).unwrap(), line.len());
        assert_eq!(writer.into_inner(), b"SOCKS accepted: [scrubbed]\n");
    }

    #[test]
    fn test_log_path() {
        let mut config = LoggingConfig {
            file: Some(PathBuf::from("conjure.log")),
            ..LoggingConfig::default()
        };
        let state = Path::new("/var/lib/tor/pt_state");
        assert_eq!(log_path(&config, Some(state)), Some(PathBuf::from("conjure.log")));

        config.log_to_state_dir = true;
        assert_eq!(
            log_path(&config, Some(state)),
            Some(state.join("conjure.log"))
        );

        config.file = None;
        assert_eq!(log_path(&config, Some(state)), None);
    }

    #[test]
    fn test_file_writer_scrubs() {
        let dir = tempfile::tempdir().unwrap();
        let config = LoggingConfig {
            file: Some(PathBuf::from("conjure.log")),
            log_to_state_dir: true,
            ..LoggingConfig::default()
        };

        let make = make_writer(&config, Some(dir.path())).unwrap();
        make.make_writer().write_all(b"bridge 192.0.2.7:443\n").unwrap();

        let logged = std::fs::read_to_string(dir.path().join("conjure.log")).unwrap();
        assert_eq!(logged, "bridge [scrubbed]\n");
    }
}

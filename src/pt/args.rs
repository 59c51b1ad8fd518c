//! Per-connection transport arguments
//!
//! Bridge lines carry `key=value` options that the host passes to the
//! client through the SOCKS5 username and password fields, joined as
//! `k=v;k=v` with backslash escapes for `\`, `=` and `;`.

use super::PtError;
use std::collections::HashMap;

/// Parsed `key=value` arguments; a key may repeat
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Args {
    values: HashMap<String, Vec<String>>,
}

impl Args {
    /// First value for `key`
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values
            .get(key)
            .and_then(|v| v.first())
            .map(String::as_str)
    }

    /// All values for `key`, in order of appearance
    pub fn get_all(&self, key: &str) -> &[String] {
        self.values.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn add(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.entry(key.into()).or_default().push(value.into());
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Parse a `k=v;k=v` argument string
pub fn parse_args(input: &str) -> Result<Args, PtError> {
    let mut args = Args::default();
    if input.is_empty() {
        return Ok(args);
    }

    let mut key = String::new();
    let mut value = String::new();
    let mut in_value = false;
    let mut chars = input.chars();

    loop {
        let c = chars.next();
        match c {
            Some('\\') => {
                let escaped = chars
                    .next()
                    .ok_or_else(|| PtError::InvalidArgs("nothing following final escape".to_string()))?;
                if in_value {
                    value.push(escaped);
                } else {
                    key.push(escaped);
                }
            }
            Some('=') if !in_value => {
                if key.is_empty() {
                    return Err(PtError::InvalidArgs("empty key".to_string()));
                }
                in_value = true;
            }
            Some(';') | None => {
                if !in_value {
                    if key.is_empty() && c.is_none() {
                        break;
                    }
                    return Err(PtError::InvalidArgs(format!("{:?} missing equals sign", key)));
                }
                args.add(std::mem::take(&mut key), std::mem::take(&mut value));
                in_value = false;
                if c.is_none() {
                    break;
                }
            }
            Some(c) => {
                if in_value {
                    value.push(c);
                } else {
                    key.push(c);
                }
            }
        }
    }

    Ok(args)
}

/// Recover the argument string from SOCKS5 credentials.
///
/// Hosts split long argument strings across username and password and put
/// a single NUL in the password when everything fits in the username.
pub fn socks_args(username: &str, password: &str) -> Result<Args, PtError> {
    let mut joined = String::with_capacity(username.len() + password.len());
    joined.push_str(username);
    if password != "\0" {
        joined.push_str(password);
    }
    parse_args(&joined)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_args() {
        let args = parse_args("url=https://reg.example/;front=a.example,b.example").unwrap();
        assert_eq!(args.get("url"), Some("https://reg.example/"));
        assert_eq!(args.get("front"), Some("a.example,b.example"));
        assert_eq!(args.get("missing"), None);
    }

    #[test]
    fn test_escapes_and_repeats() {
        let args = parse_args(r"k\=ey=a\;b;x=1;x=2;empty=").unwrap();
        assert_eq!(args.get("k=ey"), Some("a;b"));
        assert_eq!(args.get_all("x"), &["1".to_string(), "2".to_string()]);
        assert_eq!(args.get("empty"), Some(""));
    }

    #[test]
    fn test_invalid_args() {
        assert!(parse_args("novalue").is_err());
        assert!(parse_args("=value").is_err());
        assert!(parse_args("a=b;c").is_err());
        assert!(parse_args("a=b\\").is_err());
        assert!(parse_args("").unwrap().is_empty());
    }

    #[test]
    fn test_socks_args() {
        let args = socks_args("url=https://reg", ".example/;transport=dtls").unwrap();
        assert_eq!(args.get("url"), Some("https://reg.example/"));
        assert_eq!(args.get("transport"), Some("dtls"));

        let args = socks_args("registrar=dns", "\0").unwrap();
        assert_eq!(args.get("registrar"), Some("dns"));
    }
}

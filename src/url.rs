//! URL parsing for ferry:// addresses

use crate::protocol::DEFAULT_PORT;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteAddr {
    pub host: String,
    pub port: u16,
}

/// Accepts `ferry://host[:port][/]` or a bare `host[:port]`. IPv6 hosts go
/// in brackets. Missing port means the default.
pub fn parse_remote(s: &str) -> Option<RemoteAddr> {
    let s_trim = s.trim();
    let rest = match s_trim.find("://") {
        Some(i) => {
            if !s_trim[..i].eq_ignore_ascii_case("ferry") {
                return None;
            }
            &s_trim[i + 3..]
        }
        None => s_trim,
    };
    let hp = rest.trim_end_matches('/');
    if hp.is_empty() || hp.contains('/') {
        return None;
    }

    let (host, port) = if let Some(inner) = hp.strip_prefix('[') {
        let (h, tail) = inner.split_once(']')?;
        let port = match tail.strip_prefix(':') {
            Some(p) => p.parse().ok()?,
            None if tail.is_empty() => DEFAULT_PORT,
            None => return None,
        };
        (h.to_string(), port)
    } else {
        match hp.split_once(':') {
            Some((h, p)) => (h.to_string(), p.parse().ok()?),
            None => (hp.to_string(), DEFAULT_PORT),
        }
    };
    if host.is_empty() {
        return None;
    }
    Some(RemoteAddr { host, port })
}

//! Minimal resolv.conf reader: only `nameserver` lines matter to us.

use std::net::{IpAddr, SocketAddr};
use std::path::Path;

pub const MAX_NAMESERVERS: usize = 10;

const DNS_PORT: u16 = 53;

pub(crate) fn parse(content: &str) -> Vec<SocketAddr> {
    let mut servers = Vec::new();

    for line in content.lines() {
        let line = line.trim();
        if line.starts_with('#') || line.starts_with(';') {
            continue;
        }

        let mut tokens = line.split_whitespace();
        if tokens.next() != Some("nameserver") {
            continue;
        }

        if let Some(addr) = tokens.next().and_then(|t| t.parse::<IpAddr>().ok()) {
            servers.push(SocketAddr::new(addr, DNS_PORT));
            if servers.len() >= MAX_NAMESERVERS {
                break;
            }
        }
    }

    servers
}

/// Read the nameserver list, falling back to localhost when the file is
/// missing or names no usable servers.
pub(crate) fn load(path: &Path) -> Vec<SocketAddr> {
    let servers = match std::fs::read_to_string(path) {
        Ok(content) => parse(&content),
        Err(e) => {
            tracing::warn!("Couldn't read {}: {}", path.display(), e);
            Vec::new()
        }
    };

    if servers.is_empty() {
        vec![SocketAddr::new(IpAddr::from([127, 0, 0, 1]), DNS_PORT)]
    } else {
        servers
    }
}

//! Mesh peer identity and health state

use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Default max concurrent connections a peer advertises
pub const DEFAULT_CAPACITY: u32 = 100;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PeerParseError {
    #[error("expected host:port, got {0:?}")]
    BadAddress(String),
    #[error("invalid port in {0:?}")]
    BadPort(String),
    #[error("expected id@host:port, got {0:?}")]
    BadPeer(String),
}

/// A peer in the mesh
#[derive(Clone, Debug)]
pub struct PeerDescriptor {
    pub node_id: String,
    pub host: String,
    pub port: u16,
    /// Last measured connect round-trip, milliseconds
    pub latency: f64,
    /// Last successful probe; `None` until first seen
    pub last_seen: Option<Instant>,
    pub is_exit_capable: bool,
    /// Max concurrent connections
    pub capacity: u32,
    /// Hop expects a PQC handshake after SOCKS negotiation
    pub pqc_capable: bool,
    /// Probes failed since the last success
    pub consecutive_failures: u32,
}

impl PeerDescriptor {
    pub fn new(node_id: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            node_id: node_id.into(),
            host: host.into(),
            port,
            latency: 0.0,
            last_seen: None,
            is_exit_capable: true,
            capacity: DEFAULT_CAPACITY,
            pqc_capable: false,
            consecutive_failures: 0,
        }
    }

    pub fn with_exit(mut self, is_exit_capable: bool) -> Self {
        self.is_exit_capable = is_exit_capable;
        self
    }

    pub fn with_pqc(mut self, pqc_capable: bool) -> Self {
        self.pqc_capable = pqc_capable;
        self
    }

    pub fn with_latency(mut self, latency_ms: f64) -> Self {
        self.latency = latency_ms;
        self
    }

    pub fn with_capacity(mut self, capacity: u32) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// `now - last_seen < timeout`; never-seen peers are not alive
    pub fn is_alive(&self, timeout: Duration) -> bool {
        self.last_seen
            .map(|seen| seen.elapsed() < timeout)
            .unwrap_or(false)
    }

    /// Mark the peer as seen now
    pub fn touch(&mut self) {
        self.last_seen = Some(Instant::now());
    }
}

impl fmt::Display for PeerDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.node_id, self.address())
    }
}

/// `id@host:port`, as used for bootstrap lists
impl FromStr for PeerDescriptor {
    type Err = PeerParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (id, addr) = s
            .split_once('@')
            .filter(|(id, _)| !id.is_empty())
            .ok_or_else(|| PeerParseError::BadPeer(s.to_string()))?;
        let (host, port) = split_host_port(addr)?;
        Ok(Self::new(id, host, port))
    }
}

/// Split `host:port` or `[v6]:port`
pub fn split_host_port(addr: &str) -> Result<(String, u16), PeerParseError> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| PeerParseError::BadAddress(addr.to_string()))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(PeerParseError::BadAddress(addr.to_string()));
    }
    let port = port
        .parse::<u16>()
        .map_err(|_| PeerParseError::BadPort(addr.to_string()))?;
    Ok((host.to_string(), port))
}

/// Host part of a destination given as `host:port`, `[v6]:port` or bare host
///
/// An unbracketed host containing `:` is a bare IPv6 address and is
/// returned whole.
pub fn destination_host(destination: &str) -> &str {
    if let Some(rest) = destination.strip_prefix('[') {
        return match rest.split_once(']') {
            Some((host, _)) => host,
            None => destination,
        };
    }
    match destination.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') && port.parse::<u16>().is_ok() => host,
        _ => destination,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_liveness() {
        let mut peer = PeerDescriptor::new("a", "10.0.0.1", 10809);
        assert!(!peer.is_alive(Duration::from_secs(60)));

        peer.touch();
        assert!(peer.is_alive(Duration::from_secs(60)));
        assert!(!peer.is_alive(Duration::ZERO));
    }

    #[test]
    fn test_parse_bootstrap_entry() {
        let peer: PeerDescriptor = "node-vps1@89.125.1.107:10809".parse().unwrap();
        assert_eq!(peer.node_id, "node-vps1");
        assert_eq!(peer.host, "89.125.1.107");
        assert_eq!(peer.port, 10809);
        assert!(peer.is_exit_capable);
        assert_eq!(peer.capacity, DEFAULT_CAPACITY);

        let v6: PeerDescriptor = "six@[::1]:9000".parse().unwrap();
        assert_eq!(v6.host, "::1");
        assert_eq!(v6.address(), "[::1]:9000");

        assert!("nohost".parse::<PeerDescriptor>().is_err());
        assert!("@1.2.3.4:1".parse::<PeerDescriptor>().is_err());
        assert!("x@1.2.3.4:notaport".parse::<PeerDescriptor>().is_err());
    }

    #[test]
    fn test_destination_host() {
        assert_eq!(destination_host("example.com:443"), "example.com");
        assert_eq!(destination_host("example.com"), "example.com");
        assert_eq!(destination_host("[::1]:80"), "::1");
        assert_eq!(destination_host("[fe80::1]"), "fe80::1");
    }

    #[test]
    fn test_destination_host_bare_ipv6() {
        assert_eq!(destination_host("::1"), "::1");
        assert_eq!(destination_host("fe80::1"), "fe80::1");
        assert_eq!(destination_host("2001:db8::8080"), "2001:db8::8080");
    }
}

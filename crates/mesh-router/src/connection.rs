//! Multi-hop connection establishment
//!
//! A chain is built hop by hop over one TCP stream: connect to the entry
//! hop, negotiate no-auth, optionally run the PQC handshake, then CONNECT
//! through the chain to the next hop and repeat. The final CONNECT reaches
//! the target.
//!
//! Hops that are not PQC-capable, or whose handshake fails, carry traffic
//! unencrypted. That is logged at the time and recorded in `hop_reports()`.
//!
//! The stream stays local to the connect future until the chain is
//! established, so dropping the future closes every hop socket opened so far.

use crate::config::RouterConfig;
use crate::peer::PeerDescriptor;
use crate::route::{Route, RouteSelector};
use crate::socks5::{self, Socks5Error};
use pqc_tunnel::{AeadProvider, Aes256GcmAead, KemProvider, MlKem768, TunnelManager};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("hop {node_id} failed after {hops_completed} completed hops: {reason}")]
    HopConnectFailed {
        hops_completed: usize,
        node_id: String,
        reason: String,
    },
    #[error("target {target} unreachable through the chain: {reason}")]
    TargetConnectFailed { target: String, reason: String },
    #[error("direct connection to {target} failed: {reason}")]
    DirectConnectFailed { target: String, reason: String },
    #[error("{stage} timed out after {after:?}")]
    Timeout { stage: String, after: Duration },
    #[error("connection is not established")]
    NotEstablished,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    /// Negotiating with hop `i` (0-based)
    ConnectedHop(usize),
    /// CONNECT in flight through the chain
    Chaining,
    Established,
    Closed,
    Failed,
}

/// Whether a hop ended up with a PQC session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HopReport {
    pub node_id: String,
    pub encrypted: bool,
}

/// Timeouts and route length
#[derive(Debug, Clone, Copy)]
pub struct ConnectionSettings {
    pub hop_count: usize,
    /// TCP connect and CONNECT reply bound
    pub hop_connect_timeout: Duration,
    /// No-auth negotiation bound
    pub negotiation_timeout: Duration,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            hop_count: 2,
            hop_connect_timeout: Duration::from_secs(10),
            negotiation_timeout: Duration::from_secs(5),
        }
    }
}

impl From<&RouterConfig> for ConnectionSettings {
    fn from(config: &RouterConfig) -> Self {
        Self {
            hop_count: config.hop_count,
            hop_connect_timeout: config.hop_connect_timeout,
            negotiation_timeout: config.negotiation_timeout,
        }
    }
}

/// `host:port`, bracketing IPv6 literals
pub fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

#[derive(Debug, Error)]
enum StepError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Socks(#[from] Socks5Error),
}

async fn step<T, F>(limit: Duration, fut: F) -> Result<T, StepError>
where
    F: Future<Output = Result<T, Socks5Error>>,
{
    Ok(tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| StepError::Timeout(limit))??)
}

/// One connection through the mesh
pub struct ChainedConnection<K: KemProvider = MlKem768, A: AeadProvider = Aes256GcmAead> {
    selector: Arc<RouteSelector>,
    tunnels: Option<Arc<TunnelManager<K, A>>>,
    settings: ConnectionSettings,
    state: ConnectionState,
    route: Route,
    hops_completed: usize,
    hop_reports: Vec<HopReport>,
    stream: Option<TcpStream>,
}

impl<K: KemProvider, A: AeadProvider> ChainedConnection<K, A> {
    /// `tunnels` is `None` when this node has no PQC identity; capable hops
    /// are then reported as unencrypted.
    pub fn new(
        selector: Arc<RouteSelector>,
        tunnels: Option<Arc<TunnelManager<K, A>>>,
        settings: ConnectionSettings,
    ) -> Self {
        Self {
            selector,
            tunnels,
            settings,
            state: ConnectionState::Idle,
            route: Vec::new(),
            hops_completed: 0,
            hop_reports: Vec::new(),
            stream: None,
        }
    }

    /// Current lifecycle state
    ///
    /// A connect call holds `&mut self` until it returns, so an in-flight
    /// state seen here was left by a cancelled call and reads as `Failed`.
    pub fn state(&self) -> ConnectionState {
        match self.state {
            ConnectionState::ConnectedHop(_) | ConnectionState::Chaining => ConnectionState::Failed,
            state => state,
        }
    }

    pub fn hops_completed(&self) -> usize {
        self.hops_completed
    }

    pub fn hop_reports(&self) -> &[HopReport] {
        &self.hop_reports
    }

    /// Route used by the last attempt; empty for direct connections
    pub fn route(&self) -> &[PeerDescriptor] {
        &self.route
    }

    pub fn is_established(&self) -> bool {
        self.state == ConnectionState::Established && self.stream.is_some()
    }

    /// Resolve a route and chain through it, or connect directly when no
    /// route exists
    pub async fn connect_multi_hop(&mut self, target_host: &str, target_port: u16) -> Result<(), ConnectionError> {
        let destination = join_host_port(target_host, target_port);
        let route = self.selector.get_route(&destination, self.settings.hop_count);
        self.connect_route(route, target_host, target_port).await
    }

    /// Chain through a caller-supplied route
    pub async fn connect_route(
        &mut self,
        route: Route,
        target_host: &str,
        target_port: u16,
    ) -> Result<(), ConnectionError> {
        self.reset();

        if route.is_empty() {
            info!("No mesh route to {}, connecting directly", join_host_port(target_host, target_port));
            return self.connect_direct(target_host, target_port).await;
        }

        info!(
            "Multi-hop route: {} -> target",
            route.iter().map(|p| p.node_id.as_str()).collect::<Vec<_>>().join(" -> ")
        );
        self.route = route.clone();

        match self.build_chain(&route, target_host, target_port).await {
            Ok(stream) => {
                self.stream = Some(stream);
                self.state = ConnectionState::Established;
                let encrypted = self.hop_reports.iter().filter(|r| r.encrypted).count();
                info!(
                    "Multi-hop tunnel established ({} hops, {} PQC-encrypted)",
                    self.hops_completed, encrypted
                );
                Ok(())
            }
            Err(e) => {
                self.state = ConnectionState::Failed;
                warn!("Multi-hop connection failed: {}", e);
                Err(e)
            }
        }
    }

    /// Single hop through the best route's exit node
    pub async fn connect(&mut self, target_host: &str, target_port: u16) -> Result<(), ConnectionError> {
        let destination = join_host_port(target_host, target_port);
        let exit = self
            .selector
            .get_route(&destination, self.settings.hop_count)
            .pop();

        match exit {
            Some(exit) => self.connect_route(vec![exit], target_host, target_port).await,
            None => {
                self.reset();
                self.connect_direct(target_host, target_port).await
            }
        }
    }

    /// Established stream, for relaying
    pub fn tunnel(&mut self) -> Option<&mut TcpStream> {
        match self.state {
            ConnectionState::Established => self.stream.as_mut(),
            _ => None,
        }
    }

    /// Take the established stream out of the connection
    pub fn into_stream(mut self) -> Result<TcpStream, ConnectionError> {
        match (self.state, self.stream.take()) {
            (ConnectionState::Established, Some(stream)) => Ok(stream),
            _ => Err(ConnectionError::NotEstablished),
        }
    }

    /// Copy bytes both ways between `local` and the chain until either side
    /// closes. Returns (bytes to chain, bytes from chain).
    pub async fn relay<L>(&mut self, local: &mut L) -> Result<(u64, u64), ConnectionError>
    where
        L: AsyncRead + AsyncWrite + Unpin,
    {
        let stream = self.tunnel().ok_or(ConnectionError::NotEstablished)?;
        let copied = tokio::io::copy_bidirectional(local, stream).await;
        self.close().await;
        Ok(copied?)
    }

    /// Close the stream; safe to call repeatedly
    pub async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.shutdown().await {
                debug!("Shutdown on close failed: {}", e);
            }
        }
        if self.state() != ConnectionState::Failed {
            self.state = ConnectionState::Closed;
        }
    }

    fn reset(&mut self) {
        self.stream = None;
        self.route.clear();
        self.hops_completed = 0;
        self.hop_reports.clear();
        self.state = ConnectionState::Idle;
    }

    async fn connect_direct(&mut self, host: &str, port: u16) -> Result<(), ConnectionError> {
        let target = join_host_port(host, port);
        let limit = self.settings.hop_connect_timeout;

        match tokio::time::timeout(limit, TcpStream::connect(target.as_str())).await {
            Ok(Ok(stream)) => {
                self.stream = Some(stream);
                self.state = ConnectionState::Established;
                info!("Direct connection to {} established", target);
                Ok(())
            }
            Ok(Err(e)) => {
                self.state = ConnectionState::Failed;
                warn!("Direct connection to {} failed: {}", target, e);
                Err(ConnectionError::DirectConnectFailed {
                    target,
                    reason: e.to_string(),
                })
            }
            Err(_) => {
                self.state = ConnectionState::Failed;
                warn!("Direct connection to {} timed out", target);
                Err(ConnectionError::Timeout {
                    stage: format!("direct connect to {}", target),
                    after: limit,
                })
            }
        }
    }

    async fn build_chain(
        &mut self,
        route: &[PeerDescriptor],
        target_host: &str,
        target_port: u16,
    ) -> Result<TcpStream, ConnectionError> {
        let limit = self.settings.hop_connect_timeout;
        let first = &route[0];

        let mut stream = match tokio::time::timeout(limit, TcpStream::connect(first.address().as_str())).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(self.hop_failed(first, e)),
            Err(_) => return Err(self.hop_failed(first, StepError::Timeout(limit))),
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!("set_nodelay failed: {}", e);
        }

        for (index, hop) in route.iter().enumerate() {
            if index > 0 {
                self.state = ConnectionState::Chaining;
                step(limit, socks5::connect(&mut stream, &hop.host, hop.port))
                    .await
                    .map_err(|e| self.hop_failed(hop, e))?;
            }

            self.state = ConnectionState::ConnectedHop(index);
            step(self.settings.negotiation_timeout, socks5::negotiate_no_auth(&mut stream))
                .await
                .map_err(|e| self.hop_failed(hop, e))?;

            self.secure_hop(&mut stream, hop).await;
            self.hops_completed = index + 1;
            info!("Hop {}: {}", index + 1, hop.node_id);
        }

        self.state = ConnectionState::Chaining;
        let target = join_host_port(target_host, target_port);
        match step(limit, socks5::connect(&mut stream, target_host, target_port)).await {
            Ok(()) => {
                info!("Target {} reached through the chain", target);
                Ok(stream)
            }
            Err(StepError::Timeout(after)) => Err(ConnectionError::Timeout {
                stage: format!("CONNECT to {}", target),
                after,
            }),
            Err(StepError::Socks(e)) => Err(ConnectionError::TargetConnectFailed {
                target,
                reason: e.to_string(),
            }),
        }
    }

    /// Run the PQC handshake if the hop supports it. Never fails the chain.
    async fn secure_hop(&mut self, stream: &mut TcpStream, hop: &PeerDescriptor) {
        let encrypted = match (&self.tunnels, hop.pqc_capable) {
            (Some(tunnels), true) => match tunnels.establish(stream, &hop.node_id).await {
                Ok(()) => {
                    info!("PQC tunnel with {}", hop.node_id);
                    true
                }
                Err(e) => {
                    warn!("Hop {} continues WITHOUT PQC encryption: handshake failed: {}", hop.node_id, e);
                    false
                }
            },
            (None, true) => {
                warn!("Hop {} supports PQC but this node has no tunnel manager; hop is unencrypted", hop.node_id);
                false
            }
            (_, false) => {
                info!("Hop {} is not PQC-capable; hop is unencrypted", hop.node_id);
                false
            }
        };

        self.hop_reports.push(HopReport {
            node_id: hop.node_id.clone(),
            encrypted,
        });
    }

    fn hop_failed(&self, hop: &PeerDescriptor, reason: impl fmt::Display) -> ConnectionError {
        ConnectionError::HopConnectFailed {
            hops_completed: self.hops_completed,
            node_id: hop.node_id.clone(),
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::PeerRegistry;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    type Conn = ChainedConnection<MlKem768, Aes256GcmAead>;

    fn selector(peers: Vec<PeerDescriptor>) -> Arc<RouteSelector> {
        let registry = Arc::new(PeerRegistry::new("local", vec![]));
        for mut peer in peers {
            peer.touch();
            registry.register(peer);
        }
        Arc::new(RouteSelector::new(registry, Duration::from_secs(60)))
    }

    fn settings() -> ConnectionSettings {
        ConnectionSettings {
            hop_count: 2,
            hop_connect_timeout: Duration::from_secs(2),
            negotiation_timeout: Duration::from_millis(300),
        }
    }

    async fn echo_server() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let (mut reader, mut writer) = stream.split();
            let _ = tokio::io::copy(&mut reader, &mut writer).await;
        });
        port
    }

    #[test]
    fn test_join_host_port() {
        assert_eq!(join_host_port("example.com", 80), "example.com:80");
        assert_eq!(join_host_port("::1", 80), "[::1]:80");
    }

    #[tokio::test]
    async fn test_direct_fallback_without_peers() {
        let port = echo_server().await;
        let mut conn = Conn::new(selector(vec![]), None, settings());

        conn.connect_multi_hop("127.0.0.1", port).await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Established);
        assert_eq!(conn.hops_completed(), 0);
        assert!(conn.route().is_empty());

        let stream = conn.tunnel().unwrap();
        stream.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        conn.close().await;
        conn.close().await;
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(conn.tunnel().is_none());
    }

    #[tokio::test]
    async fn test_direct_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut conn = Conn::new(selector(vec![]), None, settings());
        let result = conn.connect_multi_hop("127.0.0.1", port).await;
        assert!(matches!(result, Err(ConnectionError::DirectConnectFailed { .. })));
        assert_eq!(conn.state(), ConnectionState::Failed);
    }

    #[tokio::test]
    async fn test_unreachable_entry_hop() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut conn = Conn::new(selector(vec![]), None, settings());
        let route = vec![PeerDescriptor::new("entry", "127.0.0.1", port)];
        match conn.connect_route(route, "example.com", 80).await {
            Err(ConnectionError::HopConnectFailed {
                hops_completed,
                node_id,
                ..
            }) => {
                assert_eq!(hops_completed, 0);
                assert_eq!(node_id, "entry");
            }
            other => panic!("unexpected: {:?}", other.err()),
        }
        assert_eq!(conn.state(), ConnectionState::Failed);
    }

    #[tokio::test]
    async fn test_silent_hop_times_out_negotiation() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let silent = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(2)).await;
            drop(stream);
        });

        let mut conn = Conn::new(selector(vec![]), None, settings());
        let route = vec![PeerDescriptor::new("mute", "127.0.0.1", port)];
        let result = conn.connect_route(route, "example.com", 80).await;
        match result {
            Err(ConnectionError::HopConnectFailed { reason, .. }) => assert!(reason.contains("timed out")),
            other => panic!("unexpected: {:?}", other.err()),
        }
        silent.abort();
    }

    #[tokio::test]
    async fn test_into_stream_requires_established() {
        let conn = Conn::new(selector(vec![]), None, settings());
        assert!(matches!(conn.into_stream(), Err(ConnectionError::NotEstablished)));

        let mut conn = Conn::new(selector(vec![]), None, settings());
        let (mut local, _other) = tokio::io::duplex(64);
        assert!(matches!(
            conn.relay(&mut local).await,
            Err(ConnectionError::NotEstablished)
        ));
    }
}

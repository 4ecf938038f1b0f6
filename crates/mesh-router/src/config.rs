//! Configuration for meshrouterd

use crate::peer::{split_host_port, PeerDescriptor};
use crate::route::RoutePreference;
use clap::Parser;
use std::time::Duration;

/// Public seed peers every node starts from
pub fn default_bootstrap() -> Vec<PeerDescriptor> {
    vec![
        PeerDescriptor::new("node-vps1", "89.125.1.107", 10809),
        PeerDescriptor::new("node-vps2", "62.133.60.252", 10809),
    ]
}

/// meshrouterd - PQC mesh router daemon
#[derive(Parser, Debug, Clone)]
#[command(name = "meshrouterd")]
#[command(author, version, about = "Post-quantum multi-hop mesh router", long_about = None)]
pub struct Config {
    /// This node's mesh id
    #[arg(long, env = "MESH_NODE_ID")]
    pub node_id: String,

    /// Bootstrap peers (comma-separated id@host:port)
    #[arg(long, value_delimiter = ',', env = "MESH_BOOTSTRAP")]
    pub bootstrap: Vec<PeerDescriptor>,

    /// Do not add the built-in seed peers
    #[arg(long)]
    pub no_default_bootstrap: bool,

    /// Bootstrap peers that expect a PQC handshake (comma-separated ids)
    #[arg(long, value_delimiter = ',')]
    pub pqc_peers: Vec<String>,

    /// Hops per route
    #[arg(long, default_value = "2")]
    pub hops: usize,

    /// Relay selection (low_latency, reliability or balanced)
    #[arg(long, default_value = "balanced")]
    pub route_preference: RoutePreference,

    /// Health probe interval in seconds
    #[arg(long, default_value = "30")]
    pub health_interval_secs: u64,

    /// TCP probe timeout in seconds
    #[arg(long, default_value = "5")]
    pub probe_timeout_secs: u64,

    /// Peer discovery interval in seconds
    #[arg(long, default_value = "60")]
    pub discovery_interval_secs: u64,

    /// Port of the peers' /api/peers endpoint (defaults to each peer's own port)
    #[arg(long)]
    pub discovery_api_port: Option<u16>,

    /// A peer unseen for this long is excluded from routes
    #[arg(long, default_value = "60")]
    pub liveness_timeout_secs: u64,

    /// Per-hop TCP connect timeout in seconds
    #[arg(long, default_value = "10")]
    pub hop_connect_timeout_secs: u64,

    /// SOCKS5 no-auth negotiation timeout in seconds
    #[arg(long, default_value = "5")]
    pub negotiation_timeout_secs: u64,

    /// PQC handshake timeout in seconds
    #[arg(long, default_value = "10")]
    pub handshake_timeout_secs: u64,

    /// Stats log interval in seconds
    #[arg(long, default_value = "60")]
    pub stats_interval_secs: u64,

    /// Build one chained connection to host:port at startup and report it
    #[arg(long)]
    pub probe_target: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Log format (json or pretty)
    #[arg(long, default_value = "pretty")]
    pub log_format: String,
}

impl Config {
    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.node_id.trim().is_empty() {
            anyhow::bail!("Node id cannot be empty");
        }
        if self.node_id.len() > u16::MAX as usize {
            anyhow::bail!("Node id too long");
        }
        if self.hops == 0 {
            anyhow::bail!("Route needs at least one hop");
        }
        for (name, secs) in [
            ("health interval", self.health_interval_secs),
            ("probe timeout", self.probe_timeout_secs),
            ("discovery interval", self.discovery_interval_secs),
            ("liveness timeout", self.liveness_timeout_secs),
            ("hop connect timeout", self.hop_connect_timeout_secs),
            ("negotiation timeout", self.negotiation_timeout_secs),
            ("handshake timeout", self.handshake_timeout_secs),
            ("stats interval", self.stats_interval_secs),
        ] {
            if secs == 0 {
                anyhow::bail!("{} must be at least 1 second", name);
            }
        }
        if self.liveness_timeout_secs <= self.health_interval_secs {
            anyhow::bail!("Liveness timeout must exceed the health interval");
        }
        if let Some(target) = &self.probe_target {
            split_host_port(target).map_err(|e| anyhow::anyhow!("Invalid probe target: {}", e))?;
        }
        if !matches!(self.log_format.as_str(), "json" | "pretty") {
            anyhow::bail!("Unknown log format: {}", self.log_format);
        }
        Ok(())
    }

    /// Library-side settings
    pub fn router_config(&self) -> RouterConfig {
        let mut bootstrap = if self.no_default_bootstrap {
            Vec::new()
        } else {
            default_bootstrap()
        };
        for peer in &self.bootstrap {
            bootstrap.retain(|p| p.node_id != peer.node_id);
            bootstrap.push(peer.clone());
        }
        for peer in &mut bootstrap {
            if self.pqc_peers.contains(&peer.node_id) {
                peer.pqc_capable = true;
            }
        }

        RouterConfig {
            node_id: self.node_id.clone(),
            bootstrap,
            hop_count: self.hops,
            route_preference: self.route_preference,
            health_interval: Duration::from_secs(self.health_interval_secs),
            probe_timeout: Duration::from_secs(self.probe_timeout_secs),
            discovery_interval: Duration::from_secs(self.discovery_interval_secs),
            discovery_api_port: self.discovery_api_port,
            liveness_timeout: Duration::from_secs(self.liveness_timeout_secs),
            hop_connect_timeout: Duration::from_secs(self.hop_connect_timeout_secs),
            negotiation_timeout: Duration::from_secs(self.negotiation_timeout_secs),
            handshake_timeout: Duration::from_secs(self.handshake_timeout_secs),
        }
    }
}

/// Router settings
#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub node_id: String,
    pub bootstrap: Vec<PeerDescriptor>,
    pub hop_count: usize,
    pub route_preference: RoutePreference,
    pub health_interval: Duration,
    pub probe_timeout: Duration,
    pub discovery_interval: Duration,
    /// `None` queries each peer on its own port
    pub discovery_api_port: Option<u16>,
    pub liveness_timeout: Duration,
    pub hop_connect_timeout: Duration,
    pub negotiation_timeout: Duration,
    pub handshake_timeout: Duration,
}

impl RouterConfig {
    /// Defaults with the public seed peers
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            bootstrap: default_bootstrap(),
            hop_count: 2,
            route_preference: RoutePreference::default(),
            health_interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(5),
            discovery_interval: Duration::from_secs(60),
            discovery_api_port: None,
            liveness_timeout: Duration::from_secs(60),
            hop_connect_timeout: Duration::from_secs(10),
            negotiation_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_bootstrap(mut self, bootstrap: Vec<PeerDescriptor>) -> Self {
        self.bootstrap = bootstrap;
        self
    }
}

//! Mesh router facade
//!
//! Owns the registry, route selector, health monitor and this node's PQC
//! tunnel manager, and hands out `ChainedConnection`s wired to them.

use crate::config::RouterConfig;
use crate::connection::{ChainedConnection, ConnectionSettings};
use crate::discovery::{DiscoveryClient, DiscoveryError};
use crate::health::HealthMonitor;
use crate::peer::PeerDescriptor;
use crate::registry::PeerRegistry;
use crate::route::{Route, RoutePreference, RouteSelector};
use parking_lot::Mutex;
use pqc_tunnel::{AeadProvider, Aes256GcmAead, KemProvider, MlKem768, TunnelManager};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Router errors
#[derive(Debug, Error)]
pub enum RouterError {
    #[error("Discovery client: {0}")]
    Discovery(#[from] DiscoveryError),
    #[error("PQC tunnel: {0}")]
    Tunnel(#[from] pqc_tunnel::Error),
    #[error("Tunnel manager belongs to {actual}, router is {expected}")]
    NodeIdMismatch { expected: String, actual: String },
}

/// Per-peer line in `RouterStats`
#[derive(Debug, Clone, Serialize)]
pub struct PeerSummary {
    pub id: String,
    pub address: String,
    pub latency: f64,
    pub alive: bool,
    pub is_exit: bool,
    pub pqc: bool,
}

/// Snapshot for the healing layer and logs
#[derive(Debug, Clone, Serialize)]
pub struct RouterStats {
    pub node_id: String,
    pub total_peers: usize,
    pub alive_peers: usize,
    pub routes_cached: usize,
    pub preference: RoutePreference,
    pub crypto_mode: String,
    pub pqc_sessions: usize,
    pub peers: Vec<PeerSummary>,
}

/// The mesh router
pub struct MeshRouter<K: KemProvider = MlKem768, A: AeadProvider = Aes256GcmAead> {
    config: RouterConfig,
    registry: Arc<PeerRegistry>,
    selector: Arc<RouteSelector>,
    monitor: Arc<HealthMonitor>,
    tunnels: Arc<TunnelManager<K, A>>,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MeshRouter {
    /// Router with ML-KEM-768 + AES-256-GCM tunnels
    pub fn new(config: RouterConfig) -> Result<Self, RouterError> {
        let session = pqc_tunnel::PqcSession::new(config.node_id.clone())?;
        let tunnels = Arc::new(TunnelManager::with_session(session, config.handshake_timeout));
        Self::with_tunnels(config, tunnels)
    }
}

impl<K: KemProvider, A: AeadProvider> MeshRouter<K, A> {
    pub fn with_tunnels(config: RouterConfig, tunnels: Arc<TunnelManager<K, A>>) -> Result<Self, RouterError> {
        if tunnels.node_id() != config.node_id {
            return Err(RouterError::NodeIdMismatch {
                expected: config.node_id.clone(),
                actual: tunnels.node_id().to_string(),
            });
        }

        let registry = Arc::new(PeerRegistry::new(config.node_id.clone(), config.bootstrap.clone()));
        let selector = Arc::new(RouteSelector::new(registry.clone(), config.liveness_timeout));
        selector.set_preference(config.route_preference);

        let discovery = DiscoveryClient::new(config.probe_timeout, config.discovery_api_port)?;
        let monitor = Arc::new(HealthMonitor::new(registry.clone(), discovery, &config));
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            config,
            registry,
            selector,
            monitor,
            tunnels,
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Spawn the health and discovery loops. No-op if already running.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            debug!("Mesh router already running");
            return;
        }

        info!("Mesh router started for {}", self.config.node_id);
        info!("Known peers: {}", self.registry.len());

        tasks.push(self.monitor.spawn_health_task(self.shutdown_tx.subscribe()));
        tasks.push(self.monitor.spawn_discovery_task(self.shutdown_tx.subscribe()));
    }

    /// Stop the loops and wait for them to exit
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(());
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Router task ended abnormally: {}", e);
            }
        }
        info!("Mesh router stopped for {}", self.config.node_id);
    }

    pub fn is_running(&self) -> bool {
        !self.tasks.lock().is_empty()
    }

    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    pub fn selector(&self) -> &Arc<RouteSelector> {
        &self.selector
    }

    pub fn monitor(&self) -> &Arc<HealthMonitor> {
        &self.monitor
    }

    pub fn tunnels(&self) -> &Arc<TunnelManager<K, A>> {
        &self.tunnels
    }

    /// Route with the configured hop count
    pub fn get_route(&self, destination: &str) -> Route {
        self.selector.get_route(destination, self.config.hop_count)
    }

    pub fn get_best_exit(&self) -> Option<PeerDescriptor> {
        self.selector.get_best_exit()
    }

    /// Manually add a peer, marked seen now
    pub fn add_peer(&self, node_id: &str, host: &str, port: u16, is_exit: bool) -> bool {
        self.registry.add_peer(node_id, host, port, is_exit)
    }

    pub fn register_peer(&self, peer: PeerDescriptor) -> bool {
        self.registry.register(peer)
    }

    /// Apply a route-preference hint. Unknown values are ignored.
    pub fn set_route_preference(&self, preference: &str) -> bool {
        match preference.parse::<RoutePreference>() {
            Ok(preference) => {
                self.selector.set_preference(preference);
                info!("Route preference set to {}", preference);
                true
            }
            Err(e) => {
                warn!("Ignoring route preference: {}", e);
                false
            }
        }
    }

    /// Drop every cached route and re-probe all peers now. Returns the
    /// number of routes invalidated.
    pub async fn trigger_aggressive_healing(&self) -> usize {
        let invalidated = self.selector.clear_cache();
        info!("Aggressive healing: invalidated {} cached routes", invalidated);

        let round = self.monitor.probe_round().await;
        info!(
            "Aggressive healing: {}/{} peers reachable",
            round.reachable, round.probed
        );
        invalidated
    }

    /// New connection using this router's routes and tunnels
    pub fn connection(&self) -> ChainedConnection<K, A> {
        ChainedConnection::new(
            self.selector.clone(),
            Some(self.tunnels.clone()),
            ConnectionSettings::from(&self.config),
        )
    }

    pub fn stats(&self) -> RouterStats {
        let liveness = self.config.liveness_timeout;
        let peers: Vec<PeerSummary> = self
            .registry
            .snapshot()
            .into_iter()
            .map(|p| PeerSummary {
                address: p.address(),
                alive: p.is_alive(liveness),
                latency: p.latency,
                is_exit: p.is_exit_capable,
                pqc: p.pqc_capable,
                id: p.node_id,
            })
            .collect();

        RouterStats {
            node_id: self.config.node_id.clone(),
            total_peers: peers.len(),
            alive_peers: peers.iter().filter(|p| p.alive).count(),
            routes_cached: self.selector.cached_routes(),
            preference: self.selector.preference(),
            crypto_mode: self.tunnels.mode().to_string(),
            pqc_sessions: self.tunnels.established_peers().len(),
            peers,
        }
    }
}

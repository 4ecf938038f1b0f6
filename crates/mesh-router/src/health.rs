//! Health probing and peer discovery loops
//!
//! A failed probe never evicts a peer. It simply stops refreshing
//! `last_seen`, and the liveness check ages it out of routing.

use crate::config::RouterConfig;
use crate::discovery::DiscoveryClient;
use crate::registry::PeerRegistry;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
    #[error("connect failed: {0}")]
    Connect(#[from] std::io::Error),
}

/// Bare TCP connect to `address`, returning the round-trip
pub async fn probe_peer(address: &str, timeout: Duration) -> Result<Duration, ProbeError> {
    let started = Instant::now();
    let stream = tokio::time::timeout(timeout, TcpStream::connect(address))
        .await
        .map_err(|_| ProbeError::Timeout(timeout))??;
    let rtt = started.elapsed();
    drop(stream);
    Ok(rtt)
}

/// Result of one probe pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProbeRound {
    pub probed: usize,
    pub reachable: usize,
}

/// Drives probing and discovery against the shared registry
pub struct HealthMonitor {
    registry: Arc<PeerRegistry>,
    discovery: DiscoveryClient,
    probe_timeout: Duration,
    health_interval: Duration,
    discovery_interval: Duration,
    liveness_timeout: Duration,
}

impl HealthMonitor {
    pub fn new(registry: Arc<PeerRegistry>, discovery: DiscoveryClient, config: &RouterConfig) -> Self {
        Self {
            registry,
            discovery,
            probe_timeout: config.probe_timeout,
            health_interval: config.health_interval,
            discovery_interval: config.discovery_interval,
            liveness_timeout: config.liveness_timeout,
        }
    }

    /// Probe every known peer once, concurrently
    pub async fn probe_round(&self) -> ProbeRound {
        let peers = self.registry.snapshot();
        let mut probes = JoinSet::new();
        for peer in peers {
            let timeout = self.probe_timeout;
            probes.spawn(async move {
                let outcome = probe_peer(&peer.address(), timeout).await;
                (peer.node_id, outcome)
            });
        }

        let mut round = ProbeRound::default();
        while let Some(joined) = probes.join_next().await {
            let (node_id, outcome) = match joined {
                Ok(result) => result,
                Err(e) => {
                    warn!("Probe task failed: {}", e);
                    continue;
                }
            };
            round.probed += 1;

            match outcome {
                Ok(rtt) => {
                    round.reachable += 1;
                    self.registry.record_probe_success(&node_id, rtt);
                    debug!("Peer {} reachable in {:.1}ms", node_id, rtt.as_secs_f64() * 1000.0);
                }
                Err(e) => {
                    let failures = self.registry.record_probe_failure(&node_id);
                    warn!("Peer {} unreachable ({}), {} consecutive failures", node_id, e, failures);
                }
            }
        }
        round
    }

    /// Ask every alive peer for its peer list and merge what is new.
    /// Returns the number of peers added.
    pub async fn discovery_round(&self) -> usize {
        let mut added = 0;
        for peer in self.registry.alive(self.liveness_timeout) {
            match self.discovery.fetch_peers(&peer).await {
                Ok(discovered) => {
                    for node_id in self.registry.merge_discovered(discovered) {
                        info!("Discovered new peer {} via {}", node_id, peer.node_id);
                        added += 1;
                    }
                }
                Err(e) => debug!("Peer discovery via {} failed: {}", peer.node_id, e),
            }
        }
        added
    }

    /// Spawn the periodic probe loop
    pub fn spawn_health_task(self: &Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) -> JoinHandle<()> {
        let monitor = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(monitor.health_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let round = monitor.probe_round().await;
                        debug!("Health round: {}/{} peers reachable", round.reachable, round.probed);
                    }
                    _ = shutdown_rx.recv() => {
                        debug!("Health loop stopping");
                        break;
                    }
                }
            }
        })
    }

    /// Spawn the periodic discovery loop
    pub fn spawn_discovery_task(self: &Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) -> JoinHandle<()> {
        let monitor = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(monitor.discovery_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        monitor.discovery_round().await;
                    }
                    _ = shutdown_rx.recv() => {
                        debug!("Discovery loop stopping");
                        break;
                    }
                }
            }
        })
    }
}

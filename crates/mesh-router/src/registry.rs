//! Shared peer registry
//!
//! All mutation goes through the methods below under one write lock; readers
//! take a `snapshot()` copy and never hold the lock across I/O.

use crate::peer::PeerDescriptor;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};

/// Known peers, keyed by node id
pub struct PeerRegistry {
    local_id: String,
    peers: RwLock<HashMap<String, PeerDescriptor>>,
}

impl PeerRegistry {
    /// Seed from a bootstrap list; our own id is skipped
    pub fn new(local_id: impl Into<String>, bootstrap: impl IntoIterator<Item = PeerDescriptor>) -> Self {
        let local_id = local_id.into();
        let peers = bootstrap
            .into_iter()
            .filter(|p| p.node_id != local_id)
            .map(|p| (p.node_id.clone(), p))
            .collect();

        Self {
            local_id,
            peers: RwLock::new(peers),
        }
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    /// Insert or replace a peer as given. Returns false for our own id.
    pub fn register(&self, peer: PeerDescriptor) -> bool {
        if peer.node_id == self.local_id {
            return false;
        }
        self.peers.write().insert(peer.node_id.clone(), peer);
        true
    }

    /// Manually add a peer and mark it seen now
    pub fn add_peer(&self, node_id: &str, host: &str, port: u16, is_exit: bool) -> bool {
        let mut peer = PeerDescriptor::new(node_id, host, port).with_exit(is_exit);
        peer.touch();
        let added = self.register(peer);
        if added {
            info!("Added peer: {} ({}:{})", node_id, host, port);
        }
        added
    }

    /// Add peers not already known. Returns the ids that were new.
    pub fn merge_discovered(&self, discovered: Vec<PeerDescriptor>) -> Vec<String> {
        let mut peers = self.peers.write();
        let mut added = Vec::new();
        for peer in discovered {
            if peer.node_id == self.local_id || peers.contains_key(&peer.node_id) {
                continue;
            }
            added.push(peer.node_id.clone());
            peers.insert(peer.node_id.clone(), peer);
        }
        added
    }

    /// Record a successful probe. Returns false if the peer is unknown.
    pub fn record_probe_success(&self, node_id: &str, rtt: Duration) -> bool {
        match self.peers.write().get_mut(node_id) {
            Some(peer) => {
                peer.latency = rtt.as_secs_f64() * 1000.0;
                peer.consecutive_failures = 0;
                peer.touch();
                true
            }
            None => false,
        }
    }

    /// Record a failed probe; liveness decays on its own. Returns the
    /// failure streak.
    pub fn record_probe_failure(&self, node_id: &str) -> u32 {
        match self.peers.write().get_mut(node_id) {
            Some(peer) => {
                peer.consecutive_failures = peer.consecutive_failures.saturating_add(1);
                peer.consecutive_failures
            }
            None => {
                debug!("Probe failure for unknown peer {}", node_id);
                0
            }
        }
    }

    pub fn get(&self, node_id: &str) -> Option<PeerDescriptor> {
        self.peers.read().get(node_id).cloned()
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.peers.read().contains_key(node_id)
    }

    /// Consistent copy of every peer, sorted by node id
    pub fn snapshot(&self) -> Vec<PeerDescriptor> {
        let mut peers: Vec<PeerDescriptor> = self.peers.read().values().cloned().collect();
        peers.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        peers
    }

    pub fn alive(&self, timeout: Duration) -> Vec<PeerDescriptor> {
        self.snapshot()
            .into_iter()
            .filter(|p| p.is_alive(timeout))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }

    pub fn stats(&self, liveness_timeout: Duration) -> RegistryStats {
        let peers = self.peers.read();
        RegistryStats {
            total: peers.len(),
            alive: peers.values().filter(|p| p.is_alive(liveness_timeout)).count(),
            exit_capable: peers.values().filter(|p| p.is_exit_capable).count(),
        }
    }
}

/// Registry statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryStats {
    pub total: usize,
    pub alive: usize,
    pub exit_capable: usize,
}

//! Hop path selection
//!
//! Routes are computed from a registry snapshot, never from the live map, so
//! concurrent probe and discovery updates cannot tear a selection. The cache
//! is advisory: callers re-resolve when a cached hop turns out unreachable.

use crate::peer::{destination_host, PeerDescriptor};
use crate::registry::PeerRegistry;
use parking_lot::RwLock;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Ordered hops; the last element is the exit node
pub type Route = Vec<PeerDescriptor>;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown route preference {0:?} (expected low_latency, reliability or balanced)")]
pub struct UnknownPreference(pub String);

/// How relays are picked once the exit is fixed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutePreference {
    /// Next-lowest latencies
    LowLatency,
    /// Fewest consecutive probe failures, latency as tiebreak
    Reliability,
    /// Uniform sample
    #[default]
    Balanced,
}

impl RoutePreference {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoutePreference::LowLatency => "low_latency",
            RoutePreference::Reliability => "reliability",
            RoutePreference::Balanced => "balanced",
        }
    }
}

impl fmt::Display for RoutePreference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RoutePreference {
    type Err = UnknownPreference;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low_latency" => Ok(RoutePreference::LowLatency),
            "reliability" => Ok(RoutePreference::Reliability),
            "balanced" => Ok(RoutePreference::Balanced),
            other => Err(UnknownPreference(other.to_string())),
        }
    }
}

/// Cache key for a destination: first 16 hex chars of its BLAKE3 hash
pub fn route_cache_key(destination: &str) -> String {
    let hash = blake3::hash(destination.as_bytes());
    hex::encode(&hash.as_bytes()[..8])
}

/// Computes hop paths from the registry
pub struct RouteSelector {
    registry: Arc<PeerRegistry>,
    liveness_timeout: Duration,
    preference: RwLock<RoutePreference>,
    cache: RwLock<HashMap<String, Route>>,
}

impl RouteSelector {
    pub fn new(registry: Arc<PeerRegistry>, liveness_timeout: Duration) -> Self {
        Self {
            registry,
            liveness_timeout,
            preference: RwLock::new(RoutePreference::default()),
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn preference(&self) -> RoutePreference {
        *self.preference.read()
    }

    pub fn set_preference(&self, preference: RoutePreference) {
        *self.preference.write() = preference;
    }

    /// Ordered route to `destination` (`host:port` or bare host)
    ///
    /// Empty when the destination is itself a known peer or no peer is alive
    /// and exit-capable; callers fall back to a direct connection.
    pub fn get_route(&self, destination: &str, hop_count: usize) -> Route {
        let snapshot = self.registry.snapshot();

        let host = destination_host(destination);
        if snapshot.iter().any(|p| p.host == host) {
            debug!("Destination {} is a mesh peer, not routing through it", destination);
            return Vec::new();
        }

        let candidates: Vec<PeerDescriptor> = snapshot
            .into_iter()
            .filter(|p| p.is_alive(self.liveness_timeout) && p.is_exit_capable)
            .collect();

        let route = select_route(candidates, hop_count, self.preference());
        if !route.is_empty() {
            debug!(
                "Route to {}: {}",
                destination,
                route.iter().map(|p| p.node_id.as_str()).collect::<Vec<_>>().join(" -> ")
            );
            self.cache
                .write()
                .insert(route_cache_key(destination), route.clone());
        }
        route
    }

    /// Lowest-latency alive exit-capable peer
    pub fn get_best_exit(&self) -> Option<PeerDescriptor> {
        self.registry
            .alive(self.liveness_timeout)
            .into_iter()
            .filter(|p| p.is_exit_capable)
            .min_by(|a, b| a.latency.total_cmp(&b.latency))
    }

    pub fn cached_route(&self, destination: &str) -> Option<Route> {
        self.cache.read().get(&route_cache_key(destination)).cloned()
    }

    pub fn cached_routes(&self) -> usize {
        self.cache.read().len()
    }

    /// Drop every cached route, returning how many there were
    pub fn clear_cache(&self) -> usize {
        let mut cache = self.cache.write();
        let count = cache.len();
        cache.clear();
        count
    }
}

/// Pick `hop_count` peers from the candidates, exit last
pub fn select_route(
    mut candidates: Vec<PeerDescriptor>,
    hop_count: usize,
    preference: RoutePreference,
) -> Route {
    if hop_count == 0 || candidates.is_empty() {
        return Vec::new();
    }

    candidates.sort_by(|a, b| a.latency.total_cmp(&b.latency));
    if candidates.len() <= hop_count {
        return candidates;
    }

    let exit = candidates.remove(0);
    let relay_count = hop_count - 1;

    let mut route: Route = match preference {
        RoutePreference::Balanced => candidates
            .choose_multiple(&mut rand::thread_rng(), relay_count)
            .cloned()
            .collect(),
        RoutePreference::LowLatency => candidates.into_iter().take(relay_count).collect(),
        RoutePreference::Reliability => {
            candidates.sort_by(|a, b| {
                a.consecutive_failures
                    .cmp(&b.consecutive_failures)
                    .then(a.latency.total_cmp(&b.latency))
            });
            candidates.into_iter().take(relay_count).collect()
        }
    };
    route.push(exit);
    route
}

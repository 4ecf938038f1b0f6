//! Peer-list discovery over HTTP
//!
//! Each alive peer serves `GET /api/peers`:
//! `{"peers": [{"id": str, "address": "host:port", "is_exit": bool, "latency": float}]}`.
//! An optional `"pqc": bool` marks hops that expect a PQC handshake.

use crate::peer::{split_host_port, PeerDescriptor};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
}

/// Body of `/api/peers`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PeerListResponse {
    #[serde(default)]
    pub peers: Vec<PeerEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerEntry {
    pub id: String,
    pub address: String,
    #[serde(default = "default_is_exit")]
    pub is_exit: bool,
    #[serde(default)]
    pub latency: f64,
    #[serde(default)]
    pub pqc: bool,
}

fn default_is_exit() -> bool {
    true
}

impl PeerListResponse {
    /// Descriptors for every entry with a usable address; none are marked seen
    pub fn into_descriptors(self) -> Vec<PeerDescriptor> {
        self.peers
            .into_iter()
            .filter_map(|entry| match split_host_port(&entry.address) {
                Ok((host, port)) => Some(
                    PeerDescriptor::new(entry.id, host, port)
                        .with_exit(entry.is_exit)
                        .with_latency(entry.latency)
                        .with_pqc(entry.pqc),
                ),
                Err(e) => {
                    debug!("Skipping discovered peer {}: {}", entry.id, e);
                    None
                }
            })
            .collect()
    }
}

/// Fetches peer lists from other nodes
#[derive(Clone)]
pub struct DiscoveryClient {
    http: reqwest::Client,
    api_port: Option<u16>,
}

impl DiscoveryClient {
    pub fn new(timeout: Duration, api_port: Option<u16>) -> Result<Self, DiscoveryError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { http, api_port })
    }

    pub fn peers_url(&self, peer: &PeerDescriptor) -> String {
        let port = self.api_port.unwrap_or(peer.port);
        if peer.host.contains(':') {
            format!("http://[{}]:{}/api/peers", peer.host, port)
        } else {
            format!("http://{}:{}/api/peers", peer.host, port)
        }
    }

    /// Query one peer's peer list
    pub async fn fetch_peers(&self, peer: &PeerDescriptor) -> Result<Vec<PeerDescriptor>, DiscoveryError> {
        let url = self.peers_url(peer);
        debug!("Querying {} for peers", url);

        let body: PeerListResponse = self
            .http
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(body.into_descriptors())
    }
}

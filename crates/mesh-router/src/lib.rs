//! Mesh routing over chained SOCKS5 hops
//!
//! This crate provides:
//! - Peer registry seeded from bootstrap peers and grown by HTTP discovery
//! - TCP health probing with liveness-based ageing
//! - Route selection with an advisory per-destination cache
//! - Multi-hop connections with per-hop PQC handshakes

pub mod config;
pub mod connection;
pub mod discovery;
pub mod health;
pub mod peer;
pub mod registry;
pub mod route;
pub mod router;
pub mod socks5;

pub use config::{Config, RouterConfig};
pub use connection::{ChainedConnection, ConnectionError, ConnectionSettings, ConnectionState, HopReport};
pub use peer::PeerDescriptor;
pub use registry::PeerRegistry;
pub use route::{Route, RoutePreference, RouteSelector};
pub use router::{MeshRouter, RouterError, RouterStats};

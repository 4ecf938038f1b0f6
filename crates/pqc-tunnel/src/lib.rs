//! Post-quantum per-hop tunnel security
//!
//! This crate provides:
//! - KEM and AEAD capability providers (ML-KEM-768, AES-256-GCM, ChaCha20-Poly1305)
//! - Per-node key exchange sessions with HKDF-derived per-peer keys
//! - Handshake message and `PQC1` packet framing
//! - A handshake driver over async byte streams

pub mod crypto;
pub mod error;
pub mod framing;
pub mod session;
pub mod tunnel;

pub use crypto::{AeadProvider, Aes256GcmAead, ChaCha20Poly1305Aead, KemProvider, KeyPair, MlKem768};
#[cfg(any(test, feature = "simulated"))]
pub use crypto::{HashStreamAead, SimulatedKem};
pub use error::{Error, Result};
pub use framing::{HandshakeMessage, PACKET_MAGIC};
pub use session::{CryptoMode, KeyExchangeSession, PqcSession, SessionKey};
pub use tunnel::TunnelManager;

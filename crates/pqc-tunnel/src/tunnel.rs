//! Handshake driver over byte streams
//!
//! `TunnelManager` runs the initiator or responder half of the KEM handshake
//! on any `AsyncRead + AsyncWrite` stream and tracks which peers completed it.

use crate::crypto::{AeadProvider, Aes256GcmAead, KemProvider, MlKem768};
use crate::error::{Error, Result};
use crate::framing::{read_frame, write_frame, HandshakeMessage};
use crate::session::{CryptoMode, KeyExchangeSession};
use parking_lot::RwLock;
use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

/// Default bound on each handshake read or write
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Owns a node's key exchange session and the set of established peers
pub struct TunnelManager<K: KemProvider = MlKem768, A: AeadProvider = Aes256GcmAead> {
    session: KeyExchangeSession<K, A>,
    established: RwLock<HashSet<String>>,
    handshake_timeout: Duration,
}

impl TunnelManager {
    /// ML-KEM-768 + AES-256-GCM with a fresh keypair
    pub fn new(node_id: impl Into<String>) -> Result<Self> {
        Ok(Self::with_session(
            KeyExchangeSession::new(node_id)?,
            DEFAULT_HANDSHAKE_TIMEOUT,
        ))
    }
}

impl<K: KemProvider, A: AeadProvider> TunnelManager<K, A> {
    pub fn with_session(session: KeyExchangeSession<K, A>, handshake_timeout: Duration) -> Self {
        let mode = session.mode();
        if mode.simulated {
            warn!(
                "PQC tunnel for {} running in simulated mode: {}",
                session.node_id(),
                mode
            );
        } else {
            info!("PQC encryption enabled for {} ({})", session.node_id(), mode);
        }

        Self {
            session,
            established: RwLock::new(HashSet::new()),
            handshake_timeout,
        }
    }

    pub fn node_id(&self) -> &str {
        self.session.node_id()
    }

    pub fn mode(&self) -> CryptoMode {
        self.session.mode()
    }

    pub fn session(&self) -> &KeyExchangeSession<K, A> {
        &self.session
    }

    /// Initiator role: send our init, read the response, derive the key
    ///
    /// Any prior session with `peer_id` is dropped first. On failure no
    /// session for `peer_id` remains; other peers are untouched.
    pub async fn establish<S>(&self, stream: &mut S, peer_id: &str) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.remove_session(peer_id);

        match self.run_initiator(stream, peer_id).await {
            Ok(()) => {
                self.established.write().insert(peer_id.to_string());
                info!("PQC tunnel established with {}", peer_id);
                Ok(())
            }
            Err(e) => {
                self.session.remove_session(peer_id);
                warn!("PQC handshake with {} failed: {}", peer_id, e);
                Err(e)
            }
        }
    }

    /// Responder role: read an init, answer it, and return the peer's id
    pub async fn accept<S>(&self, stream: &mut S) -> Result<String>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let init = self.bounded(read_frame(stream)).await.map_err(|e| {
            warn!("PQC handshake accept failed before init: {}", e);
            e
        })?;

        let (peer_id, _shared, response) = self.session.process_handshake_init(&init).map_err(|e| {
            warn!("Rejected PQC handshake init: {}", e);
            e
        })?;
        self.established.write().remove(&peer_id);

        if let Err(e) = self.bounded(write_frame(stream, &response)).await {
            self.session.remove_session(&peer_id);
            warn!("PQC handshake response to {} failed: {}", peer_id, e);
            return Err(e);
        }

        self.established.write().insert(peer_id.clone());
        info!("PQC tunnel accepted from {}", peer_id);
        Ok(peer_id)
    }

    /// Whether a handshake with `peer_id` completed and its key is live
    pub fn has_session(&self, peer_id: &str) -> bool {
        self.established.read().contains(peer_id) && self.session.has_session_key(peer_id)
    }

    pub fn remove_session(&self, peer_id: &str) {
        self.established.write().remove(peer_id);
        if self.session.remove_session(peer_id) {
            debug!("Dropped session key for {}", peer_id);
        }
    }

    pub fn established_peers(&self) -> Vec<String> {
        let mut peers: Vec<String> = self.established.read().iter().cloned().collect();
        peers.sort();
        peers
    }

    pub fn encrypt(&self, plaintext: &[u8], peer_id: &str) -> Result<Vec<u8>> {
        self.session.encrypt(plaintext, peer_id)
    }

    pub fn decrypt(&self, ciphertext: &[u8], peer_id: &str) -> Result<Vec<u8>> {
        self.session.decrypt(ciphertext, peer_id)
    }

    pub fn wrap_packet(&self, data: &[u8], peer_id: &str) -> Result<Vec<u8>> {
        self.session.wrap_packet(data, peer_id)
    }

    pub fn unwrap_packet(&self, data: &[u8], peer_id: &str) -> Result<Vec<u8>> {
        self.session.unwrap_packet(data, peer_id)
    }

    async fn run_initiator<S>(&self, stream: &mut S, peer_id: &str) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let init = self.session.create_handshake_init()?;
        self.bounded(write_frame(stream, &init)).await?;

        let response = self.bounded(read_frame(stream)).await?;

        // Check the responder's identity before touching any session state
        let header = HandshakeMessage::decode(&response)?;
        if header.node_id != peer_id {
            return Err(Error::PeerMismatch {
                expected: peer_id.to_string(),
                actual: header.node_id,
            });
        }

        self.session.process_handshake_response(&response)?;
        Ok(())
    }

    async fn bounded<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::time::timeout(self.handshake_timeout, fut)
            .await
            .map_err(|_| Error::Timeout)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{HashStreamAead, SimulatedKem};
    use tokio::io::AsyncWriteExt;

    fn sim_manager(node_id: &str, timeout: Duration) -> TunnelManager<SimulatedKem, HashStreamAead> {
        TunnelManager::with_session(KeyExchangeSession::new(node_id).unwrap(), timeout)
    }

    #[tokio::test]
    async fn test_establish_and_accept_over_duplex() {
        let a = TunnelManager::new("A").unwrap();
        let b = TunnelManager::new("B").unwrap();
        let (mut client, mut server) = tokio::io::duplex(8192);

        let (initiated, accepted) = tokio::join!(a.establish(&mut client, "B"), b.accept(&mut server));
        initiated.unwrap();
        assert_eq!(accepted.unwrap(), "A");

        assert!(a.has_session("B"));
        assert!(b.has_session("A"));

        let ct = a.encrypt(b"Hello, Quantum World!", "B").unwrap();
        assert_eq!(b.decrypt(&ct, "A").unwrap(), b"Hello, Quantum World!");

        let packet = b.wrap_packet(b"back", "A").unwrap();
        assert_eq!(a.unwrap_packet(&packet, "B").unwrap(), b"back");
    }

    #[tokio::test]
    async fn test_peer_mismatch_is_rejected() {
        let a = TunnelManager::new("A").unwrap();
        let b = TunnelManager::new("B").unwrap();
        let (mut client, mut server) = tokio::io::duplex(8192);

        let (initiated, _) = tokio::join!(a.establish(&mut client, "C"), b.accept(&mut server));
        assert!(matches!(initiated, Err(Error::PeerMismatch { .. })));
        assert!(!a.has_session("C"));
        assert!(!a.has_session("B"));
        assert!(a.established_peers().is_empty());
    }

    #[tokio::test]
    async fn test_closed_stream_fails_without_touching_others() {
        let a = sim_manager("A", Duration::from_secs(1));
        let b = sim_manager("B", Duration::from_secs(1));

        let (mut c1, mut s1) = tokio::io::duplex(1024);
        let (ok, _) = tokio::join!(a.establish(&mut c1, "B"), b.accept(&mut s1));
        ok.unwrap();

        let (mut c2, s2) = tokio::io::duplex(1024);
        drop(s2);
        assert!(a.establish(&mut c2, "C").await.is_err());

        assert!(a.has_session("B"));
        assert!(!a.has_session("C"));
        assert_eq!(a.established_peers(), vec!["B".to_string()]);
    }

    #[tokio::test]
    async fn test_silent_peer_times_out() {
        let a = sim_manager("A", Duration::from_millis(50));
        let (mut client, _server) = tokio::io::duplex(1024);

        let result = a.establish(&mut client, "B").await;
        assert!(matches!(result, Err(Error::Timeout)));
        assert!(!a.has_session("B"));
    }

    #[tokio::test]
    async fn test_accept_rejects_garbage() {
        let b = sim_manager("B", Duration::from_secs(1));
        let (mut client, mut server) = tokio::io::duplex(1024);

        write_frame(&mut client, &[0x00, 0x09, b'x']).await.unwrap();
        assert!(matches!(
            b.accept(&mut server).await,
            Err(Error::HandshakeFailed(_))
        ));
        assert!(b.established_peers().is_empty());
    }

    #[tokio::test]
    async fn test_accept_after_failed_write_has_no_session() {
        let a = sim_manager("A", Duration::from_secs(1));
        let b = sim_manager("B", Duration::from_secs(1));
        let (mut client, mut server) = tokio::io::duplex(4096);

        let init = a.session().create_handshake_init().unwrap();
        write_frame(&mut client, &init).await.unwrap();
        client.shutdown().await.unwrap();
        drop(client);

        assert!(b.accept(&mut server).await.is_err());
        assert!(!b.has_session("A"));
        assert!(!b.session().has_session_key("A"));
    }

    #[tokio::test]
    async fn test_remove_session() {
        let a = sim_manager("A", Duration::from_secs(1));
        let b = sim_manager("B", Duration::from_secs(1));
        let (mut client, mut server) = tokio::io::duplex(4096);
        let (ok, _) = tokio::join!(a.establish(&mut client, "B"), b.accept(&mut server));
        ok.unwrap();

        a.remove_session("B");
        assert!(!a.has_session("B"));
        assert!(matches!(a.encrypt(b"x", "B"), Err(Error::NoSessionKey(_))));
    }
}

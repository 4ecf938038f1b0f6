//! Per-node key exchange session
//!
//! Holds the node's KEM keypair and one derived symmetric key per peer.

use crate::crypto::{
    derive_session_key, AeadProvider, Aes256GcmAead, KemProvider, KeyPair, MlKem768, SharedSecret,
};
use crate::error::{Error, Result};
use crate::framing::{decode_packet, encode_packet, HandshakeMessage};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use zeroize::Zeroizing;

/// Production session: ML-KEM-768 + AES-256-GCM
pub type PqcSession = KeyExchangeSession<MlKem768, Aes256GcmAead>;

/// Symmetric key bound to `(local_node_id, peer_node_id)`
pub struct SessionKey {
    pub local_node_id: String,
    pub peer_node_id: String,
    key: Zeroizing<[u8; 32]>,
}

impl SessionKey {
    fn new(local_node_id: &str, peer_node_id: &str, key: Zeroizing<[u8; 32]>) -> Self {
        Self {
            local_node_id: local_node_id.to_string(),
            peer_node_id: peer_node_id.to_string(),
            key,
        }
    }

    fn bytes(&self) -> &[u8; 32] {
        &self.key
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionKey")
            .field("local_node_id", &self.local_node_id)
            .field("peer_node_id", &self.peer_node_id)
            .field("key", &"<redacted>")
            .finish()
    }
}

/// Which primitives a session runs on
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CryptoMode {
    pub kem: &'static str,
    pub aead: &'static str,
    /// True when either primitive is a hash-derived stand-in
    pub simulated: bool,
}

impl fmt::Display for CryptoMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} + {}", self.kem, self.aead)?;
        if self.simulated {
            write!(f, " (simulated, insecure)")?;
        }
        Ok(())
    }
}

/// One node's keypair plus per-peer session keys
pub struct KeyExchangeSession<K: KemProvider, A: AeadProvider> {
    kem: K,
    aead: A,
    keypair: KeyPair,
    sessions: RwLock<HashMap<String, SessionKey>>,
}

impl<K: KemProvider + Default, A: AeadProvider + Default> KeyExchangeSession<K, A> {
    /// Create a session with default-constructed providers and a fresh keypair
    pub fn new(node_id: impl Into<String>) -> Result<Self> {
        Self::with_providers(node_id, K::default(), A::default())
    }
}

impl<K: KemProvider, A: AeadProvider> KeyExchangeSession<K, A> {
    pub fn with_providers(node_id: impl Into<String>, kem: K, aead: A) -> Result<Self> {
        let node_id = node_id.into();
        let keypair = Self::generate_keypair(&kem, &node_id)?;
        Ok(Self {
            kem,
            aead,
            keypair,
            sessions: RwLock::new(HashMap::new()),
        })
    }

    /// Generate a keypair for `owner_node_id` with the given KEM
    pub fn generate_keypair(kem: &K, owner_node_id: &str) -> Result<KeyPair> {
        let (public_key, secret_key) = kem.generate_keypair()?;
        Ok(KeyPair {
            public_key,
            secret_key,
            owner_node_id: owner_node_id.to_string(),
        })
    }

    pub fn node_id(&self) -> &str {
        &self.keypair.owner_node_id
    }

    pub fn public_key(&self) -> &[u8] {
        &self.keypair.public_key
    }

    pub fn mode(&self) -> CryptoMode {
        CryptoMode {
            kem: K::NAME,
            aead: A::NAME,
            simulated: K::SIMULATED || A::SIMULATED,
        }
    }

    /// Init message: our node id and public key
    pub fn create_handshake_init(&self) -> Result<Vec<u8>> {
        HandshakeMessage::new(self.node_id(), self.keypair.public_key.clone()).encode()
    }

    /// Responder side: encapsulate against the peer's key and store the
    /// session key. Returns `(peer_node_id, shared_secret, response_bytes)`.
    pub fn process_handshake_init(&self, data: &[u8]) -> Result<(String, SharedSecret, Vec<u8>)> {
        let init = HandshakeMessage::decode(data)?;
        self.check_peer_id(&init.node_id)?;
        self.remove_session(&init.node_id);

        let (ciphertext, shared_secret) = self.kem.encapsulate(&init.payload)?;
        let key = derive_session_key(&shared_secret[..])?;
        let response = HandshakeMessage::new(self.node_id(), ciphertext).encode()?;

        self.store_session(&init.node_id, key);
        Ok((init.node_id, shared_secret, response))
    }

    /// Initiator side: decapsulate the peer's ciphertext and store the
    /// session key. Returns `(peer_node_id, shared_secret)`.
    pub fn process_handshake_response(&self, data: &[u8]) -> Result<(String, SharedSecret)> {
        let response = HandshakeMessage::decode(data)?;
        self.check_peer_id(&response.node_id)?;
        self.remove_session(&response.node_id);

        let shared_secret = self
            .kem
            .decapsulate(&self.keypair.secret_key, &response.payload)?;
        let key = derive_session_key(&shared_secret[..])?;

        self.store_session(&response.node_id, key);
        Ok((response.node_id, shared_secret))
    }

    pub fn has_session_key(&self, peer_id: &str) -> bool {
        self.sessions.read().contains_key(peer_id)
    }

    /// Drop the key for a peer. Returns whether one existed.
    pub fn remove_session(&self, peer_id: &str) -> bool {
        self.sessions.write().remove(peer_id).is_some()
    }

    pub fn encrypt(&self, plaintext: &[u8], peer_id: &str) -> Result<Vec<u8>> {
        let sessions = self.sessions.read();
        let session = sessions
            .get(peer_id)
            .ok_or_else(|| Error::NoSessionKey(peer_id.to_string()))?;
        self.aead.seal(session.bytes(), plaintext)
    }

    pub fn decrypt(&self, ciphertext: &[u8], peer_id: &str) -> Result<Vec<u8>> {
        let sessions = self.sessions.read();
        let session = sessions
            .get(peer_id)
            .ok_or_else(|| Error::NoSessionKey(peer_id.to_string()))?;
        self.aead.open(session.bytes(), ciphertext)
    }

    /// `PQC1 || u32_be(len) || encrypt(data)`
    pub fn wrap_packet(&self, data: &[u8], peer_id: &str) -> Result<Vec<u8>> {
        let ciphertext = self.encrypt(data, peer_id)?;
        encode_packet(&ciphertext)
    }

    pub fn unwrap_packet(&self, data: &[u8], peer_id: &str) -> Result<Vec<u8>> {
        let ciphertext = decode_packet(data)?;
        self.decrypt(ciphertext, peer_id)
    }

    fn check_peer_id(&self, peer_id: &str) -> Result<()> {
        if peer_id == self.node_id() {
            return Err(Error::HandshakeFailed(format!(
                "peer advertised our own node id {}",
                peer_id
            )));
        }
        Ok(())
    }

    fn store_session(&self, peer_id: &str, key: Zeroizing<[u8; 32]>) {
        let session = SessionKey::new(self.node_id(), peer_id, key);
        self.sessions.write().insert(peer_id.to_string(), session);
    }

    #[cfg(test)]
    fn session_key_bytes(&self, peer_id: &str) -> Option<[u8; 32]> {
        self.sessions.read().get(peer_id).map(|s| *s.bytes())
    }
}

impl<K: KemProvider, A: AeadProvider> fmt::Debug for KeyExchangeSession<K, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyExchangeSession")
            .field("node_id", &self.node_id())
            .field("mode", &self.mode())
            .field("sessions", &self.sessions.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{HashStreamAead, SimulatedKem};

    type SimSession = KeyExchangeSession<SimulatedKem, HashStreamAead>;

    fn handshake<K: KemProvider, A: AeadProvider>(
        initiator: &KeyExchangeSession<K, A>,
        responder: &KeyExchangeSession<K, A>,
    ) -> (SharedSecret, SharedSecret) {
        let init = initiator.create_handshake_init().unwrap();
        let (peer, responder_secret, response) = responder.process_handshake_init(&init).unwrap();
        assert_eq!(peer, initiator.node_id());
        let (peer, initiator_secret) = initiator.process_handshake_response(&response).unwrap();
        assert_eq!(peer, responder.node_id());
        (initiator_secret, responder_secret)
    }

    #[test]
    fn test_both_directions_derive_identical_keys() {
        let a = PqcSession::new("A").unwrap();
        let b = PqcSession::new("B").unwrap();

        let (ia, rb) = handshake(&a, &b);
        assert_eq!(*ia, *rb);
        assert_eq!(a.session_key_bytes("B"), b.session_key_bytes("A"));

        let (ib, ra) = handshake(&b, &a);
        assert_eq!(*ib, *ra);
        assert_eq!(a.session_key_bytes("B"), b.session_key_bytes("A"));
    }

    #[test]
    fn test_hello_quantum_world() {
        let a = PqcSession::new("A").unwrap();
        let b = PqcSession::new("B").unwrap();
        handshake(&a, &b);

        let msg = b"Hello, Quantum World!";
        let ciphertext = a.encrypt(msg, "B").unwrap();
        assert_ne!(&ciphertext[..], &msg[..]);
        assert_eq!(b.decrypt(&ciphertext, "A").unwrap(), msg);
    }

    #[test]
    fn test_roundtrip_in_fallback_mode() {
        let a = SimSession::new("A").unwrap();
        let b = SimSession::new("B").unwrap();
        handshake(&a, &b);

        let long = [0u8; 100];
        let cases: [&[u8]; 4] = [b"", b"x", &long, b"Hello, Quantum World!"];
        for msg in cases {
            let ct = a.encrypt(msg, "B").unwrap();
            assert_eq!(b.decrypt(&ct, "A").unwrap(), msg);
        }
    }

    #[test]
    fn test_fallback_tamper_is_integrity_error() {
        let a = SimSession::new("A").unwrap();
        let b = SimSession::new("B").unwrap();
        handshake(&a, &b);

        let mut ct = a.encrypt(b"do not touch", "B").unwrap();
        let mid = ct.len() / 2;
        ct[mid] ^= 0x80;
        assert!(matches!(b.decrypt(&ct, "A"), Err(Error::IntegrityError)));
    }

    #[test]
    fn test_no_session_key() {
        let a = PqcSession::new("A").unwrap();
        assert!(matches!(a.encrypt(b"x", "Z"), Err(Error::NoSessionKey(_))));
        assert!(matches!(a.decrypt(b"x", "Z"), Err(Error::NoSessionKey(_))));
        assert!(matches!(a.wrap_packet(b"x", "Z"), Err(Error::NoSessionKey(_))));
    }

    #[test]
    fn test_packet_wrap_unwrap() {
        let a = PqcSession::new("A").unwrap();
        let b = PqcSession::new("B").unwrap();
        handshake(&a, &b);

        let packet = a.wrap_packet(b"cell", "B").unwrap();
        assert_eq!(&packet[..4], b"PQC1");
        assert_eq!(b.unwrap_packet(&packet, "A").unwrap(), b"cell");

        let mut bad = packet.clone();
        bad[..4].copy_from_slice(b"PQC2");
        assert!(matches!(b.unwrap_packet(&bad, "A"), Err(Error::InvalidMagic)));
    }

    #[test]
    fn test_rehandshake_replaces_key() {
        let a = PqcSession::new("A").unwrap();
        let b = PqcSession::new("B").unwrap();
        handshake(&a, &b);
        let old_ct = a.encrypt(b"old", "B").unwrap();
        let first = a.session_key_bytes("B").unwrap();

        handshake(&a, &b);
        assert_ne!(a.session_key_bytes("B").unwrap(), first);
        assert!(matches!(b.decrypt(&old_ct, "A"), Err(Error::IntegrityError)));
    }

    #[test]
    fn test_failed_rehandshake_leaves_no_stale_key() {
        let a = PqcSession::new("A").unwrap();
        let b = PqcSession::new("B").unwrap();
        handshake(&a, &b);
        assert!(a.has_session_key("B"));

        // well-formed header, garbage ciphertext
        let bogus = HandshakeMessage::new("B", vec![0u8; 7]).encode().unwrap();
        assert!(a.process_handshake_response(&bogus).is_err());
        assert!(!a.has_session_key("B"));
    }

    #[test]
    fn test_failure_is_local_to_one_peer() {
        let a = PqcSession::new("A").unwrap();
        let b = PqcSession::new("B").unwrap();
        let c = PqcSession::new("C").unwrap();
        handshake(&a, &b);

        assert!(a.process_handshake_init(&[0x00, 0x01]).is_err());
        let bogus = HandshakeMessage::new("C", vec![1, 2, 3]).encode().unwrap();
        assert!(a.process_handshake_response(&bogus).is_err());

        assert!(a.has_session_key("B"));
        assert!(!a.has_session_key("C"));
        handshake(&a, &c);
        assert!(a.has_session_key("C"));
    }

    #[test]
    fn test_rejects_own_node_id() {
        let a = PqcSession::new("A").unwrap();
        let impostor = PqcSession::new("A").unwrap();
        let init = impostor.create_handshake_init().unwrap();
        assert!(matches!(
            a.process_handshake_init(&init),
            Err(Error::HandshakeFailed(_))
        ));
    }

    #[test]
    fn test_mode_is_observable() {
        let real = PqcSession::new("A").unwrap();
        assert_eq!(real.mode().kem, "ML-KEM-768");
        assert_eq!(real.mode().aead, "AES-256-GCM");
        assert!(!real.mode().simulated);

        let sim = SimSession::new("A").unwrap();
        assert!(sim.mode().simulated);
        assert!(sim.mode().to_string().contains("insecure"));
    }

    #[test]
    fn test_session_key_debug_redacted() {
        let key = SessionKey::new("A", "B", Zeroizing::new([0x5a; 32]));
        let rendered = format!("{:?}", key);
        assert!(rendered.contains("<redacted>"));
        assert!(!rendered.contains("5a5a"));
    }
}

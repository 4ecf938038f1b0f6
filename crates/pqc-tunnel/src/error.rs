//! Error types for the PQC tunnel layer

use thiserror::Error;

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

/// Tunnel error types
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed handshake message or a failed exchange with one peer
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// Responder answered with a different node id than the one dialled
    #[error("peer mismatch: expected {expected}, got {actual}")]
    PeerMismatch { expected: String, actual: String },

    /// Handshake did not complete within the configured timeout
    #[error("handshake timed out")]
    Timeout,

    /// No completed handshake for this peer
    #[error("no session key for peer {0}")]
    NoSessionKey(String),

    /// Ciphertext or tag did not authenticate
    #[error("integrity check failed")]
    IntegrityError,

    /// Packet did not start with the PQC1 magic
    #[error("invalid packet magic")]
    InvalidMagic,

    /// Packet shorter than its header or declared length
    #[error("truncated packet: need {needed} bytes, have {available}")]
    TruncatedPacket { needed: usize, available: usize },

    /// Length-prefixed frame over the size limit
    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),

    /// KEM keygen, encapsulation or decapsulation failed
    #[error("key encapsulation failed: {0}")]
    Kem(&'static str),

    /// AEAD could not encrypt
    #[error("encryption failed")]
    EncryptionFailed,

    /// HKDF expand failed
    #[error("key derivation failed")]
    KeyDerivation,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

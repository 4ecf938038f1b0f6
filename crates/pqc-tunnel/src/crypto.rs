//! Cryptographic primitives for the tunnel layer
//!
//! KEM and AEAD are capability providers chosen at the type level. Production
//! builds only see [`MlKem768`], [`Aes256GcmAead`] and [`ChaCha20Poly1305Aead`];
//! the simulated providers exist under `cfg(test)` or the `simulated` feature.

use crate::error::{Error, Result};
use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm,
};
use chacha20poly1305::ChaCha20Poly1305;
use fips203::ml_kem_768;
use fips203::traits::{Decaps, Encaps, KeyGen, SerDes};
use hkdf::Hkdf;
use rand::{rngs::OsRng, RngCore};
use sha2::Sha256;
use std::fmt;
use zeroize::Zeroizing;

/// HKDF info string for session keys. Bump the suffix on any change to the
/// handshake transcript.
pub const SESSION_KEY_CONTEXT: &[u8] = b"pqc-tunnel-v1";

/// AEAD nonce length (prefixed to every ciphertext)
pub const NONCE_LEN: usize = 12;

/// Shared secret produced by a KEM exchange
pub type SharedSecret = Zeroizing<[u8; 32]>;

/// Post-quantum keypair owned by one node
pub struct KeyPair {
    pub public_key: Vec<u8>,
    pub secret_key: Zeroizing<Vec<u8>>,
    pub owner_node_id: String,
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("owner_node_id", &self.owner_node_id)
            .field("public_key", &hex::encode(&self.public_key[..self.public_key.len().min(8)]))
            .field("secret_key", &"<redacted>")
            .finish()
    }
}

/// Key encapsulation capability
pub trait KemProvider: Send + Sync + 'static {
    /// Parameter set name, for logs and stats
    const NAME: &'static str;
    /// True for providers that give no security
    const SIMULATED: bool = false;

    /// Returns `(public_key, secret_key)`
    fn generate_keypair(&self) -> Result<(Vec<u8>, Zeroizing<Vec<u8>>)>;

    /// Returns `(ciphertext, shared_secret)`
    fn encapsulate(&self, public_key: &[u8]) -> Result<(Vec<u8>, SharedSecret)>;

    fn decapsulate(&self, secret_key: &[u8], ciphertext: &[u8]) -> Result<SharedSecret>;
}

/// Authenticated encryption capability
///
/// `seal` output is `nonce || ciphertext` with the nonce freshly drawn per call.
pub trait AeadProvider: Send + Sync + 'static {
    const NAME: &'static str;
    const SIMULATED: bool = false;

    fn seal(&self, key: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>>;

    fn open(&self, key: &[u8; 32], data: &[u8]) -> Result<Vec<u8>>;
}

/// ML-KEM-768 (FIPS 203)
#[derive(Clone, Copy, Debug, Default)]
pub struct MlKem768;

impl KemProvider for MlKem768 {
    const NAME: &'static str = "ML-KEM-768";

    fn generate_keypair(&self) -> Result<(Vec<u8>, Zeroizing<Vec<u8>>)> {
        let (ek, dk) = ml_kem_768::KG::try_keygen().map_err(Error::Kem)?;
        Ok((
            ek.into_bytes().to_vec(),
            Zeroizing::new(dk.into_bytes().to_vec()),
        ))
    }

    fn encapsulate(&self, public_key: &[u8]) -> Result<(Vec<u8>, SharedSecret)> {
        let bytes: [u8; ml_kem_768::EK_LEN] = public_key
            .try_into()
            .map_err(|_| Error::Kem("invalid encapsulation key length"))?;
        let ek = ml_kem_768::EncapsKey::try_from_bytes(bytes).map_err(Error::Kem)?;
        let (ssk, ct) = ek.try_encaps().map_err(Error::Kem)?;
        Ok((ct.into_bytes().to_vec(), Zeroizing::new(ssk.into_bytes())))
    }

    fn decapsulate(&self, secret_key: &[u8], ciphertext: &[u8]) -> Result<SharedSecret> {
        let dk_bytes: [u8; ml_kem_768::DK_LEN] = secret_key
            .try_into()
            .map_err(|_| Error::Kem("invalid decapsulation key length"))?;
        let ct_bytes: [u8; ml_kem_768::CT_LEN] = ciphertext
            .try_into()
            .map_err(|_| Error::Kem("invalid ciphertext length"))?;
        let dk = ml_kem_768::DecapsKey::try_from_bytes(dk_bytes).map_err(Error::Kem)?;
        let ct = ml_kem_768::CipherText::try_from_bytes(ct_bytes).map_err(Error::Kem)?;
        let ssk = dk.try_decaps(&ct).map_err(Error::Kem)?;
        Ok(Zeroizing::new(ssk.into_bytes()))
    }
}

/// AES-256-GCM, the default session cipher
#[derive(Clone, Copy, Debug, Default)]
pub struct Aes256GcmAead;

impl AeadProvider for Aes256GcmAead {
    const NAME: &'static str = "AES-256-GCM";

    fn seal(&self, key: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>> {
        let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| Error::EncryptionFailed)?;
        let nonce = random_nonce();
        let ciphertext = cipher
            .encrypt(aes_gcm::Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| Error::EncryptionFailed)?;
        Ok(prefix_nonce(nonce, ciphertext))
    }

    fn open(&self, key: &[u8; 32], data: &[u8]) -> Result<Vec<u8>> {
        let (nonce, ciphertext) = split_nonce(data)?;
        let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| Error::IntegrityError)?;
        cipher
            .decrypt(aes_gcm::Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| Error::IntegrityError)
    }
}

/// ChaCha20-Poly1305, for hosts without AES acceleration
#[derive(Clone, Copy, Debug, Default)]
pub struct ChaCha20Poly1305Aead;

impl AeadProvider for ChaCha20Poly1305Aead {
    const NAME: &'static str = "ChaCha20-Poly1305";

    fn seal(&self, key: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>> {
        let cipher =
            ChaCha20Poly1305::new_from_slice(key).map_err(|_| Error::EncryptionFailed)?;
        let nonce = random_nonce();
        let ciphertext = cipher
            .encrypt(chacha20poly1305::Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| Error::EncryptionFailed)?;
        Ok(prefix_nonce(nonce, ciphertext))
    }

    fn open(&self, key: &[u8; 32], data: &[u8]) -> Result<Vec<u8>> {
        let (nonce, ciphertext) = split_nonce(data)?;
        let cipher = ChaCha20Poly1305::new_from_slice(key).map_err(|_| Error::IntegrityError)?;
        cipher
            .decrypt(chacha20poly1305::Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| Error::IntegrityError)
    }
}

/// Derive the 32-byte session key from a KEM shared secret
pub fn derive_session_key(shared_secret: &[u8]) -> Result<Zeroizing<[u8; 32]>> {
    let hkdf = Hkdf::<Sha256>::new(None, shared_secret);
    let mut okm = Zeroizing::new([0u8; 32]);
    hkdf.expand(SESSION_KEY_CONTEXT, &mut okm[..])
        .map_err(|_| Error::KeyDerivation)?;
    Ok(okm)
}

fn random_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

fn prefix_nonce(nonce: [u8; NONCE_LEN], ciphertext: Vec<u8>) -> Vec<u8> {
    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    out
}

fn split_nonce(data: &[u8]) -> Result<(&[u8], &[u8])> {
    if data.len() < NONCE_LEN {
        return Err(Error::IntegrityError);
    }
    Ok(data.split_at(NONCE_LEN))
}

#[cfg(any(test, feature = "simulated"))]
pub use simulated::{HashStreamAead, SimulatedKem};

#[cfg(any(test, feature = "simulated"))]
mod simulated {
    //! Hash-derived stand-ins. They provide NO confidentiality against anyone
    //! who observes the handshake.

    use super::*;
    use sha2::Digest;
    use subtle::ConstantTimeEq;

    const SIM_KEM_TAG: &[u8] = b"pqc-tunnel-sim-kem-v1";
    const MAC_LEN: usize = 16;

    /// Hash-derived KEM: `ss = H(tag || pk || r)` with `r` sent in the clear
    #[derive(Clone, Copy, Debug, Default)]
    pub struct SimulatedKem;

    impl SimulatedKem {
        fn public_from_secret(secret: &[u8]) -> [u8; 32] {
            let mut hasher = Sha256::new();
            hasher.update(SIM_KEM_TAG);
            hasher.update(b"pk");
            hasher.update(secret);
            hasher.finalize().into()
        }

        fn shared(public_key: &[u8], ciphertext: &[u8]) -> SharedSecret {
            let mut hasher = Sha256::new();
            hasher.update(SIM_KEM_TAG);
            hasher.update(public_key);
            hasher.update(ciphertext);
            Zeroizing::new(hasher.finalize().into())
        }
    }

    impl KemProvider for SimulatedKem {
        const NAME: &'static str = "simulated-kem";
        const SIMULATED: bool = true;

        fn generate_keypair(&self) -> Result<(Vec<u8>, Zeroizing<Vec<u8>>)> {
            let mut secret = Zeroizing::new(vec![0u8; 32]);
            OsRng.fill_bytes(secret.as_mut_slice());
            let public = Self::public_from_secret(&secret);
            Ok((public.to_vec(), secret))
        }

        fn encapsulate(&self, public_key: &[u8]) -> Result<(Vec<u8>, SharedSecret)> {
            if public_key.len() != 32 {
                return Err(Error::Kem("invalid simulated public key length"));
            }
            let mut r = [0u8; 32];
            OsRng.fill_bytes(&mut r);
            Ok((r.to_vec(), Self::shared(public_key, &r)))
        }

        fn decapsulate(&self, secret_key: &[u8], ciphertext: &[u8]) -> Result<SharedSecret> {
            if secret_key.len() != 32 || ciphertext.len() != 32 {
                return Err(Error::Kem("invalid simulated key or ciphertext length"));
            }
            let public = Self::public_from_secret(secret_key);
            Ok(Self::shared(&public, ciphertext))
        }
    }

    /// Keystream-xor cipher with a truncated SHA-256 MAC
    ///
    /// Output: `nonce(12) || ciphertext || mac(16)`. The MAC covers
    /// `key || nonce || ciphertext` and is checked before decryption.
    #[derive(Clone, Copy, Debug, Default)]
    pub struct HashStreamAead;

    impl HashStreamAead {
        fn apply_keystream(key: &[u8; 32], nonce: &[u8], data: &[u8]) -> Vec<u8> {
            let mut out = Vec::with_capacity(data.len());
            for (counter, chunk) in data.chunks(32).enumerate() {
                let mut hasher = Sha256::new();
                hasher.update(key);
                hasher.update(nonce);
                hasher.update((counter as u64).to_be_bytes());
                let block = hasher.finalize();
                out.extend(chunk.iter().zip(block.iter()).map(|(b, k)| b ^ k));
            }
            out
        }

        fn mac(key: &[u8; 32], nonce: &[u8], ciphertext: &[u8]) -> [u8; MAC_LEN] {
            let mut hasher = Sha256::new();
            hasher.update(key);
            hasher.update(nonce);
            hasher.update(ciphertext);
            let digest = hasher.finalize();
            let mut mac = [0u8; MAC_LEN];
            mac.copy_from_slice(&digest[..MAC_LEN]);
            mac
        }
    }

    impl AeadProvider for HashStreamAead {
        const NAME: &'static str = "hash-stream";
        const SIMULATED: bool = true;

        fn seal(&self, key: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>> {
            let nonce = random_nonce();
            let ciphertext = Self::apply_keystream(key, &nonce, plaintext);
            let mac = Self::mac(key, &nonce, &ciphertext);
            let mut out = prefix_nonce(nonce, ciphertext);
            out.extend_from_slice(&mac);
            Ok(out)
        }

        fn open(&self, key: &[u8; 32], data: &[u8]) -> Result<Vec<u8>> {
            if data.len() < NONCE_LEN + MAC_LEN {
                return Err(Error::IntegrityError);
            }
            let (nonce, rest) = data.split_at(NONCE_LEN);
            let (ciphertext, mac) = rest.split_at(rest.len() - MAC_LEN);
            let expected = Self::mac(key, nonce, ciphertext);
            if !bool::from(expected[..].ct_eq(mac)) {
                return Err(Error::IntegrityError);
            }
            Ok(Self::apply_keystream(key, nonce, ciphertext))
        }
    }
}

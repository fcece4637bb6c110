//! Cryptographic primitives for Orca.
//!
//! Provides three things:
//!   1. Ed25519 identity signs holder entries, verifies other holders' entries
//!   2. SHA-256 file hashes are the content address used as the market key
//!   3. BLAKE3 chunk hashes are content addresses inside the local chunk store
//!
//! The signing key is zeroized when the identity is dropped.
//! There is no unsafe code in this module.

use std::io::Read;
use std::path::Path;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use thiserror::Error;
use zeroize::Zeroizing;

/// Length of an Ed25519 public key in bytes.
pub const PUBLIC_KEY_LEN: usize = 32;

/// Length of an Ed25519 signature in bytes.
pub const SIGNATURE_LEN: usize = 64;

// ── Hashing ───────────────────────────────────────────────────────────────────

/// BLAKE3 digest of a chunk payload.
pub fn chunk_hash(data: &[u8]) -> [u8; 32] {
    *blake3::hash(data).as_bytes()
}

/// Hex SHA-256 of a byte slice. This is the form market keys take.
pub fn file_hash_bytes(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Hex SHA-256 of a file, streamed from disk.
pub fn file_hash(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

// ── Identity ──────────────────────────────────────────────────────────────────

/// A node's long-term Ed25519 identity.
///
/// The public key is the holder identity published in market records.
/// There is no separate holder ID.
pub struct Identity {
    signing: SigningKey,
}

impl Identity {
    /// Generate a new random identity.
    pub fn generate() -> Self {
        Self {
            signing: SigningKey::generate(&mut OsRng),
        }
    }

    /// Reconstruct an identity from stored secret key bytes.
    pub fn from_secret(secret: [u8; 32]) -> Self {
        let secret = Zeroizing::new(secret);
        Self {
            signing: SigningKey::from_bytes(&secret),
        }
    }

    /// Load the secret key at `path`, generating and persisting a new one
    /// if the file does not exist.
    pub fn load_or_generate(path: &Path) -> Result<Self, CryptoError> {
        if path.exists() {
            let bytes = Zeroizing::new(std::fs::read(path).map_err(CryptoError::Io)?);
            let secret: [u8; 32] = bytes
                .as_slice()
                .try_into()
                .map_err(|_| CryptoError::BadKeyFile(bytes.len()))?;
            return Ok(Self::from_secret(secret));
        }

        let identity = Self::generate();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(CryptoError::Io)?;
        }
        std::fs::write(path, identity.signing.to_bytes()).map_err(CryptoError::Io)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
                .map_err(CryptoError::Io)?;
        }
        Ok(identity)
    }

    /// Secret key bytes, for deriving the network-layer keypair.
    pub fn secret_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.signing.to_bytes())
    }

    /// Raw public key bytes.
    pub fn public_bytes(&self) -> [u8; PUBLIC_KEY_LEN] {
        self.signing.verifying_key().to_bytes()
    }

    /// Hex public key, also used as this node's peer id.
    pub fn peer_id(&self) -> String {
        hex::encode(self.public_bytes())
    }

    /// Sign a message.
    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_LEN] {
        self.signing.sign(message).to_bytes()
    }
}

/// Verify `signature` over `message` against a raw public key.
///
/// Malformed keys or signatures verify as false rather than erroring.
pub fn verify(message: &[u8], signature: &[u8], public_key: &[u8]) -> bool {
    let Ok(key_bytes) = <[u8; PUBLIC_KEY_LEN]>::try_from(public_key) else {
        return false;
    };
    let Ok(key) = VerifyingKey::from_bytes(&key_bytes) else {
        return false;
    };
    let Ok(sig) = Signature::from_slice(signature) else {
        return false;
    };
    key.verify(message, &sig).is_ok()
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("key file I/O: {0}")]
    Io(std::io::Error),

    #[error("key file must hold 32 bytes, found {0}")]
    BadKeyFile(usize),
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_known_vector() {
        assert_eq!(
            file_hash_bytes(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn file_hash_matches_in_memory_hash() {
        let path = std::env::temp_dir().join(format!("orca-hash-{}", std::process::id()));
        let data = vec![7u8; 200_000];
        std::fs::write(&path, &data).unwrap();
        assert_eq!(file_hash(&path).unwrap(), file_hash_bytes(&data));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn sign_then_verify() {
        let id = Identity::generate();
        let sig = id.sign(b"holder entry");
        assert!(verify(b"holder entry", &sig, &id.public_bytes()));
    }

    #[test]
    fn tampered_message_fails_verification() {
        let id = Identity::generate();
        let sig = id.sign(b"holder entry");
        assert!(!verify(b"holder entrY", &sig, &id.public_bytes()));
    }

    #[test]
    fn wrong_key_fails_verification() {
        let a = Identity::generate();
        let b = Identity::generate();
        let sig = a.sign(b"msg");
        assert!(!verify(b"msg", &sig, &b.public_bytes()));
    }

    #[test]
    fn malformed_inputs_verify_false() {
        let id = Identity::generate();
        let sig = id.sign(b"msg");
        assert!(!verify(b"msg", &sig[..10], &id.public_bytes()));
        assert!(!verify(b"msg", &sig, &[1, 2, 3]));
    }

    #[test]
    fn identity_persists_across_loads() {
        let dir = std::env::temp_dir().join(format!("orca-identity-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        let path = dir.join("identity.key");

        let first = Identity::load_or_generate(&path).unwrap();
        let second = Identity::load_or_generate(&path).unwrap();
        assert_eq!(first.public_bytes(), second.public_bytes());
        assert_eq!(first.peer_id().len(), 64);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn short_key_file_is_rejected() {
        let path = std::env::temp_dir().join(format!("orca-badkey-{}", std::process::id()));
        std::fs::write(&path, [1u8; 5]).unwrap();
        assert!(matches!(
            Identity::load_or_generate(&path),
            Err(CryptoError::BadKeyFile(5))
        ));
        let _ = std::fs::remove_file(&path);
    }
}

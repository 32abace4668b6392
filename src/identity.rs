//! # Peer Identity
//!
//! Every node is identified by its Ed25519 public key:
//!
//! - [`Keypair`]: Ed25519 signing keypair (secret + public key)
//! - [`PeerId`]: 32-byte public key serving as the peer's unique identifier
//!
//! ## Identity Model
//!
//! **PeerId = Ed25519 Public Key**. Identities are self-certifying: possession
//! of the private key proves ownership, and the security upgrade and gossip
//! signatures are both verified against the PeerId bytes directly.
//!
//! ## Persistence
//!
//! [`load_or_generate`] keeps the 32-byte secret in a file so that a node
//! restarts with the same PeerId.
//!
//! ## Invariants
//!
//! - `PeerId::from_bytes(bytes).as_bytes() == bytes`
//! - A PeerId derived from a keypair never changes for that keypair
//! - Only valid Ed25519 points pass [`PeerId::is_valid`]

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Default location of the persisted secret key.
pub const DEFAULT_KEY_PATH: &str = "./local_key";

/// Returns current time as milliseconds since Unix epoch.
#[inline]
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    pub fn from_secret_key_bytes(bytes: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(bytes);
        Self { signing_key }
    }

    pub fn secret_key_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn peer_id(&self) -> PeerId {
        PeerId::from_bytes(self.public_key_bytes())
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        self.signing_key.verifying_key().verify(message, signature).is_ok()
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("peer_id", &self.peer_id().short())
            .finish_non_exhaustive()
    }
}

/// Load the keypair stored at `path`, or generate one and write it there.
///
/// The file holds exactly the 32 raw secret-key bytes. A file of any other
/// length is an error; it is never overwritten.
pub fn load_or_generate(path: impl AsRef<Path>) -> Result<Keypair> {
    let path = path.as_ref();
    match std::fs::read(path) {
        Ok(bytes) => {
            let secret: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
                anyhow::anyhow!(
                    "key file {} has {} bytes, expected 32",
                    path.display(),
                    bytes.len()
                )
            })?;
            let keypair = Keypair::from_secret_key_bytes(&secret);
            info!(path = %path.display(), peer = %keypair.peer_id(), "loaded identity");
            Ok(keypair)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let keypair = Keypair::generate();
            if let Some(parent) = path.parent()
                && !parent.as_os_str().is_empty()
            {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
            std::fs::write(path, keypair.secret_key_bytes())
                .with_context(|| format!("failed to write key file {}", path.display()))?;
            info!(path = %path.display(), peer = %keypair.peer_id(), "generated new identity");
            Ok(keypair)
        }
        Err(e) => Err(e).with_context(|| format!("failed to read key file {}", path.display())),
    }
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerId([u8; 32]);

impl PeerId {
    #[inline]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != 32 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// First 8 bytes in hex, for log lines and chat nicknames.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }

    /// Check that this PeerId is a usable Ed25519 public key.
    ///
    /// Rejects the all-zero and all-0xFF patterns up front, then requires
    /// the bytes to decode as a curve point.
    #[inline]
    pub fn is_valid(&self) -> bool {
        if self.0.iter().all(|&b| b == 0) {
            return false;
        }
        if self.0.iter().all(|&b| b == 0xFF) {
            return false;
        }
        VerifyingKey::try_from(self.0.as_slice()).is_ok()
    }
}

impl std::fmt::Debug for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PeerId({})", self.short())
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl std::str::FromStr for PeerId {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl From<[u8; 32]> for PeerId {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl From<PeerId> for [u8; 32] {
    fn from(peer: PeerId) -> Self {
        peer.0
    }
}

impl AsRef<[u8]> for PeerId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keypair_generation_yields_distinct_peers() {
        let kp1 = Keypair::generate();
        let kp2 = Keypair::generate();

        assert_ne!(kp1.peer_id(), kp2.peer_id());
        assert_ne!(kp1.public_key_bytes(), kp2.public_key_bytes());
    }

    #[test]
    fn sign_and_verify() {
        let kp = Keypair::generate();
        let message = b"hello world";

        let signature = kp.sign(message);
        assert!(kp.verify(message, &signature));
        assert!(!kp.verify(b"wrong message", &signature));

        let other = Keypair::generate();
        assert!(!other.verify(message, &signature));
    }

    #[test]
    fn peer_id_equals_public_key() {
        for _ in 0..100 {
            let kp = Keypair::generate();
            let peer = kp.peer_id();
            assert_eq!(*peer.as_bytes(), kp.public_key_bytes());
            assert_eq!(PeerId::from_bytes(*peer.as_bytes()), peer);
        }
    }

    #[test]
    fn peer_id_is_deterministic() {
        let keypair = Keypair::generate();
        assert_eq!(keypair.peer_id(), keypair.peer_id());
    }

    #[test]
    fn keypair_reconstruction_preserves_peer_id() {
        let original = Keypair::generate();
        let secret = original.secret_key_bytes();
        let reconstructed = Keypair::from_secret_key_bytes(&secret);

        assert_eq!(original.peer_id(), reconstructed.peer_id());

        let message = b"test message";
        assert_eq!(
            original.sign(message).to_bytes(),
            reconstructed.sign(message).to_bytes()
        );
    }

    #[test]
    fn hex_roundtrip() {
        for _ in 0..100 {
            let peer = Keypair::generate().peer_id();
            let hex = peer.to_hex();
            assert_eq!(hex.len(), 64);
            let recovered: PeerId = hex.parse().expect("hex decode failed");
            assert_eq!(peer, recovered);
        }
    }

    #[test]
    fn hex_rejects_invalid() {
        assert!(PeerId::from_hex("abcd").is_err());
        assert!(PeerId::from_hex(&"a".repeat(70)).is_err());
        assert!(PeerId::from_hex(&"g".repeat(64)).is_err());
    }

    #[test]
    fn short_form_is_prefix_of_hex() {
        let peer = Keypair::generate().peer_id();
        assert_eq!(peer.short().len(), 16);
        assert!(peer.to_hex().starts_with(&peer.short()));
    }

    #[test]
    fn is_valid_rejects_invalid_points() {
        assert!(!PeerId::from_bytes([0u8; 32]).is_valid());
        assert!(!PeerId::from_bytes([0xFF; 32]).is_valid());
        assert!(Keypair::generate().peer_id().is_valid());
    }

    #[test]
    fn load_or_generate_persists_identity() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("local_key");

        let first = load_or_generate(&path).expect("generate");
        assert!(path.exists());
        let second = load_or_generate(&path).expect("load");
        assert_eq!(first.peer_id(), second.peer_id());
    }

    #[test]
    fn load_or_generate_rejects_truncated_key() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("local_key");
        std::fs::write(&path, [1u8; 12]).expect("write");

        assert!(load_or_generate(&path).is_err());
    }
}

//! # Security Upgrade
//!
//! Turns a raw byte stream into an authenticated, encrypted channel bound to
//! the remote PeerId.
//!
//! ## Handshake
//!
//! ```text
//! initiator                                        responder
//!   hello = version ‖ eph_x25519 ‖ ed25519_pub ──►
//!                                              ◄── hello
//!   sig_I = Sign(domain ‖ 0x00 ‖ H)            ──►
//!                                              ◄── sig_R = Sign(domain ‖ 0x01 ‖ H)
//!
//!   H = SHA-256(label ‖ hello_I ‖ hello_R)
//!   k_I→R, k_R→I = HKDF-SHA256(salt = H, ikm = X25519(eph, eph'))
//! ```
//!
//! Both hellos go out before either side reads, so the exchange costs two
//! round trips regardless of who speaks first. Each side proves possession
//! of its static Ed25519 key by signing the transcript; the ephemeral DH
//! gives forward secrecy.
//!
//! ## Framing
//!
//! After the handshake every frame is `len:u16 BE ‖ ChaCha20-Poly1305(...)`,
//! with a per-direction counter nonce. A frame that fails authentication
//! terminates the channel.
//!
//! QUIC connections skip all of this: TLS 1.3 already did the work, so
//! [`confirm_quic`] only checks the certificate key against the expected
//! PeerId.

use std::time::Duration;

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tracing::{debug, trace};
use x25519_dalek::{EphemeralSecret, PublicKey as X25519Public};
use zeroize::Zeroizing;

use crate::crypto::{self, HANDSHAKE_SIGNATURE_DOMAIN};
use crate::error::SecurityError;
use crate::identity::{Keypair, PeerId};
use crate::transport::BoxedStream;

const HANDSHAKE_VERSION: u8 = 1;
const HELLO_LEN: usize = 1 + 32 + 32;
const TRANSCRIPT_LABEL: &[u8] = b"uconnect-secure-v1";
const KEY_INFO_INITIATOR: &[u8] = b"uconnect initiator->responder";
const KEY_INFO_RESPONDER: &[u8] = b"uconnect responder->initiator";

const ROLE_INITIATOR: u8 = 0x00;
const ROLE_RESPONDER: u8 = 0x01;

const TAG_LEN: usize = 16;

/// Largest ciphertext a frame may carry (u16 length prefix).
const MAX_CIPHERTEXT: usize = u16::MAX as usize;

/// Largest plaintext accepted by [`SecureWriter::write_frame`].
pub const MAX_SECURE_PLAINTEXT: usize = MAX_CIPHERTEXT - TAG_LEN;

/// Default bound on the whole handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

/// Encrypted channel after a successful handshake.
pub struct SecureStream {
    remote: PeerId,
    reader: SecureReader,
    writer: SecureWriter,
}

impl SecureStream {
    pub fn remote_peer(&self) -> PeerId {
        self.remote
    }

    pub fn into_split(self) -> (SecureReader, SecureWriter) {
        (self.reader, self.writer)
    }
}

impl std::fmt::Debug for SecureStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureStream")
            .field("remote", &self.remote)
            .finish_non_exhaustive()
    }
}

struct CipherState {
    cipher: ChaCha20Poly1305,
    counter: u64,
}

impl CipherState {
    fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(key)),
            counter: 0,
        }
    }

    fn next_nonce(&mut self) -> std::io::Result<[u8; 12]> {
        if self.counter == u64::MAX {
            return Err(std::io::Error::other("nonce space exhausted"));
        }
        let mut nonce = [0u8; 12];
        nonce[4..].copy_from_slice(&self.counter.to_le_bytes());
        self.counter += 1;
        Ok(nonce)
    }
}

pub struct SecureReader {
    io: ReadHalf<BoxedStream>,
    state: CipherState,
}

impl SecureReader {
    /// Read and decrypt one frame. `Ok(None)` on clean EOF at a frame boundary.
    pub async fn read_frame(&mut self) -> std::io::Result<Option<Vec<u8>>> {
        let mut len_buf = [0u8; 2];
        match self.io.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e),
        }
        let len = u16::from_be_bytes(len_buf) as usize;
        if len < TAG_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "secure frame shorter than tag",
            ));
        }
        let mut ciphertext = vec![0u8; len];
        self.io.read_exact(&mut ciphertext).await?;

        let nonce = self.state.next_nonce()?;
        self.state
            .cipher
            .decrypt(Nonce::from_slice(&nonce), ciphertext.as_slice())
            .map(Some)
            .map_err(|_| {
                std::io::Error::new(std::io::ErrorKind::InvalidData, "secure frame failed authentication")
            })
    }
}

pub struct SecureWriter {
    io: WriteHalf<BoxedStream>,
    state: CipherState,
}

impl SecureWriter {
    pub async fn write_frame(&mut self, plaintext: &[u8]) -> std::io::Result<()> {
        if plaintext.len() > MAX_SECURE_PLAINTEXT {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "secure frame too large",
            ));
        }
        let nonce = self.state.next_nonce()?;
        let ciphertext = self
            .state
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| std::io::Error::other("encryption failed"))?;

        let mut frame = Vec::with_capacity(2 + ciphertext.len());
        frame.extend_from_slice(&(ciphertext.len() as u16).to_be_bytes());
        frame.extend_from_slice(&ciphertext);
        self.io.write_all(&frame).await?;
        self.io.flush().await
    }

    pub async fn shutdown(&mut self) -> std::io::Result<()> {
        self.io.shutdown().await
    }
}

/// Secure an outbound connection. `expected` is the PeerId the dialer is
/// trying to reach, when known.
pub async fn upgrade_outbound(
    io: BoxedStream,
    keypair: &Keypair,
    expected: Option<PeerId>,
    timeout: Duration,
) -> Result<SecureStream, SecurityError> {
    run_with_timeout(handshake(io, keypair, Role::Initiator, expected), timeout).await
}

/// Secure an inbound connection. The remote PeerId is learned, not checked.
pub async fn upgrade_inbound(
    io: BoxedStream,
    keypair: &Keypair,
    timeout: Duration,
) -> Result<SecureStream, SecurityError> {
    run_with_timeout(handshake(io, keypair, Role::Responder, None), timeout).await
}

async fn run_with_timeout(
    fut: impl std::future::Future<Output = Result<SecureStream, SecurityError>>,
    timeout: Duration,
) -> Result<SecureStream, SecurityError> {
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(SecurityError::Timeout),
    }
}

fn io_failure(e: std::io::Error) -> SecurityError {
    SecurityError::HandshakeFailed(e.to_string())
}

async fn handshake(
    mut io: BoxedStream,
    keypair: &Keypair,
    role: Role,
    expected: Option<PeerId>,
) -> Result<SecureStream, SecurityError> {
    let ephemeral = EphemeralSecret::random_from_rng(OsRng);
    let ephemeral_pub = X25519Public::from(&ephemeral);

    let mut hello = [0u8; HELLO_LEN];
    hello[0] = HANDSHAKE_VERSION;
    hello[1..33].copy_from_slice(ephemeral_pub.as_bytes());
    hello[33..].copy_from_slice(&keypair.public_key_bytes());

    io.write_all(&hello).await.map_err(io_failure)?;
    io.flush().await.map_err(io_failure)?;

    let mut remote_hello = [0u8; HELLO_LEN];
    io.read_exact(&mut remote_hello).await.map_err(io_failure)?;
    if remote_hello[0] != HANDSHAKE_VERSION {
        return Err(SecurityError::HandshakeFailed(format!(
            "unsupported handshake version {}",
            remote_hello[0]
        )));
    }

    let mut remote_eph = [0u8; 32];
    remote_eph.copy_from_slice(&remote_hello[1..33]);
    let mut remote_static = [0u8; 32];
    remote_static.copy_from_slice(&remote_hello[33..]);
    let remote = PeerId::from_bytes(remote_static);
    if !remote.is_valid() {
        return Err(SecurityError::HandshakeFailed("invalid remote public key".into()));
    }
    if remote == keypair.peer_id() {
        return Err(SecurityError::HandshakeFailed("remote presented our own key".into()));
    }

    let (initiator_hello, responder_hello) = match role {
        Role::Initiator => (&hello, &remote_hello),
        Role::Responder => (&remote_hello, &hello),
    };
    let digest = Sha256::new()
        .chain_update(TRANSCRIPT_LABEL)
        .chain_update(initiator_hello)
        .chain_update(responder_hello)
        .finalize();
    let mut transcript = [0u8; 32];
    transcript.copy_from_slice(&digest);

    let (local_role, remote_role) = match role {
        Role::Initiator => (ROLE_INITIATOR, ROLE_RESPONDER),
        Role::Responder => (ROLE_RESPONDER, ROLE_INITIATOR),
    };
    let mut signed = [0u8; 33];
    signed[0] = local_role;
    signed[1..].copy_from_slice(&transcript);
    let signature = crypto::sign_with_domain(keypair, HANDSHAKE_SIGNATURE_DOMAIN, &signed);
    io.write_all(&signature).await.map_err(io_failure)?;
    io.flush().await.map_err(io_failure)?;

    let mut remote_sig = [0u8; 64];
    io.read_exact(&mut remote_sig).await.map_err(io_failure)?;
    signed[0] = remote_role;
    crypto::verify_with_domain(&remote, HANDSHAKE_SIGNATURE_DOMAIN, &signed, &remote_sig)
        .map_err(|e| SecurityError::HandshakeFailed(format!("transcript signature: {e}")))?;

    if let Some(expected) = expected
        && expected != remote
    {
        debug!(expected = %expected.short(), actual = %remote.short(), "remote identity mismatch");
        return Err(SecurityError::IdentityMismatch {
            expected,
            actual: remote,
        });
    }

    let shared = ephemeral.diffie_hellman(&X25519Public::from(remote_eph));
    if !shared.was_contributory() {
        return Err(SecurityError::HandshakeFailed("non-contributory key exchange".into()));
    }

    let hk = Hkdf::<Sha256>::new(Some(&transcript), shared.as_bytes());
    let mut initiator_key = Zeroizing::new([0u8; 32]);
    let mut responder_key = Zeroizing::new([0u8; 32]);
    hk.expand(KEY_INFO_INITIATOR, &mut initiator_key[..])
        .map_err(|_| SecurityError::HandshakeFailed("key derivation failed".into()))?;
    hk.expand(KEY_INFO_RESPONDER, &mut responder_key[..])
        .map_err(|_| SecurityError::HandshakeFailed("key derivation failed".into()))?;

    let (send_key, recv_key) = match role {
        Role::Initiator => (&initiator_key, &responder_key),
        Role::Responder => (&responder_key, &initiator_key),
    };

    let (read_half, write_half) = tokio::io::split(io);
    trace!(peer = %remote.short(), ?role, "secure channel established");
    Ok(SecureStream {
        remote,
        reader: SecureReader {
            io: read_half,
            state: CipherState::new(recv_key),
        },
        writer: SecureWriter {
            io: write_half,
            state: CipherState::new(send_key),
        },
    })
}

/// Identity confirmation for an already-encrypted QUIC connection.
///
/// On mismatch the connection is closed before returning.
pub fn confirm_quic(
    connection: &quinn::Connection,
    expected: Option<PeerId>,
) -> Result<PeerId, SecurityError> {
    let remote = crypto::extract_verified_peer(connection).ok_or_else(|| {
        SecurityError::HandshakeFailed("peer certificate carries no Ed25519 key".into())
    })?;
    if let Some(expected) = expected
        && expected != remote
    {
        connection.close(0u32.into(), b"identity mismatch");
        return Err(SecurityError::IdentityMismatch {
            expected,
            actual: remote,
        });
    }
    Ok(remote)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipe() -> (BoxedStream, BoxedStream) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        (Box::new(a), Box::new(b))
    }

    async fn connect(
        dialer: &Keypair,
        listener: &Keypair,
        expected: Option<PeerId>,
    ) -> (
        Result<SecureStream, SecurityError>,
        Result<SecureStream, SecurityError>,
    ) {
        let (a, b) = pipe();
        let timeout = Duration::from_secs(5);
        tokio::join!(
            upgrade_outbound(a, dialer, expected, timeout),
            upgrade_inbound(b, listener, timeout)
        )
    }

    #[tokio::test]
    async fn handshake_authenticates_both_sides() {
        let alice = Keypair::generate();
        let bob = Keypair::generate();
        let (out, inb) = connect(&alice, &bob, Some(bob.peer_id())).await;

        let out = out.expect("dialer handshake");
        let inb = inb.expect("listener handshake");
        assert_eq!(out.remote_peer(), bob.peer_id());
        assert_eq!(inb.remote_peer(), alice.peer_id());
    }

    #[tokio::test]
    async fn frames_roundtrip_in_both_directions() {
        let alice = Keypair::generate();
        let bob = Keypair::generate();
        let (out, inb) = connect(&alice, &bob, None).await;
        let (mut a_read, mut a_write) = out.expect("dialer").into_split();
        let (mut b_read, mut b_write) = inb.expect("listener").into_split();

        a_write.write_frame(b"hello bob").await.unwrap();
        a_write.write_frame(b"second").await.unwrap();
        b_write.write_frame(b"hello alice").await.unwrap();

        assert_eq!(b_read.read_frame().await.unwrap().unwrap(), b"hello bob");
        assert_eq!(b_read.read_frame().await.unwrap().unwrap(), b"second");
        assert_eq!(a_read.read_frame().await.unwrap().unwrap(), b"hello alice");
    }

    #[tokio::test]
    async fn wrong_expected_peer_is_identity_mismatch() {
        let alice = Keypair::generate();
        let bob = Keypair::generate();
        let mallory = Keypair::generate().peer_id();
        let (out, _inb) = connect(&alice, &bob, Some(mallory)).await;

        match out {
            Err(SecurityError::IdentityMismatch { expected, actual }) => {
                assert_eq!(expected, mallory);
                assert_eq!(actual, bob.peer_id());
            }
            other => panic!("expected IdentityMismatch, got {:?}", other.map(|s| s.remote_peer())),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn silent_peer_times_out() {
        let (a, _b) = pipe();
        let result =
            upgrade_outbound(a, &Keypair::generate(), None, Duration::from_millis(500)).await;
        assert!(matches!(result, Err(SecurityError::Timeout)));
    }

    #[tokio::test]
    async fn garbage_hello_fails_handshake() {
        let (a, mut b) = pipe();
        let writer = tokio::spawn(async move {
            b.write_all(&[0xEE; HELLO_LEN]).await.unwrap();
            b
        });
        let result =
            upgrade_outbound(a, &Keypair::generate(), None, Duration::from_secs(5)).await;
        let _b = writer.await.unwrap();
        assert!(matches!(result, Err(SecurityError::HandshakeFailed(_))));
    }

    #[tokio::test]
    async fn tampered_frame_is_rejected() {
        let (a, b) = pipe();
        let alice = Keypair::generate();
        let bob = Keypair::generate();
        let timeout = Duration::from_secs(5);
        let (out, inb) = tokio::join!(
            upgrade_outbound(a, &alice, None, timeout),
            upgrade_inbound(b, &bob, timeout)
        );
        let (_a_read, a_write) = out.unwrap().into_split();
        let (mut b_read, _b_write) = inb.unwrap().into_split();

        // Write a frame with the right length prefix but bogus ciphertext
        // underneath the cipher state.
        let mut raw = a_write.io;
        let bogus = [0u8; 32];
        raw.write_all(&(bogus.len() as u16).to_be_bytes()).await.unwrap();
        raw.write_all(&bogus).await.unwrap();

        let err = b_read.read_frame().await.expect_err("must fail authentication");
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn eof_at_frame_boundary_is_clean() {
        let alice = Keypair::generate();
        let bob = Keypair::generate();
        let (out, inb) = connect(&alice, &bob, None).await;
        let (_a_read, mut a_write) = out.unwrap().into_split();
        let (mut b_read, _b_write) = inb.unwrap().into_split();

        a_write.write_frame(b"last").await.unwrap();
        a_write.shutdown().await.unwrap();

        assert_eq!(b_read.read_frame().await.unwrap().unwrap(), b"last");
        assert!(b_read.read_frame().await.unwrap().is_none());
    }
}

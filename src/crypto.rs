//! # Session Cryptography
//!
//! Everything needed to turn a completed handshake into per-packet
//! authenticated encryption:
//!
//! - ephemeral X25519 key exchange ([`SessionKeyExchange`])
//! - the signed session-info record peers exchange ([`SessionCryptInfo`])
//! - symmetric key derivation ([`derive_session_keys`])
//! - the per-packet AEAD ([`SessionCipher`])
//!
//! ## Key Derivation
//!
//! An HKDF-shaped construction over HMAC-SHA-256 (RFC 5869 extract/expand):
//! the X25519 shared secret is extracted with a salt built from both peers'
//! handshake nonces, then expanded against a context buffer that commits to
//! both connection IDs, both certificates, and both signed session-info
//! records. One side of the connection acts as "server" and swaps each
//! local/remote pair while building the context, so the two peers derive
//! byte-identical keys with the send/receive roles mirrored.
//!
//! ## Security Invariants
//!
//! - The ephemeral private key is consumed by the exchange and never copied.
//! - The premaster secret, PRK, and context buffer are wiped after use.
//! - Derived keys zeroize on drop.

use std::fmt;

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use x25519_dalek::{EphemeralSecret, PublicKey};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::wire::serialize;

/// Lowest protocol version we will talk to.
pub const MIN_REQUIRED_PROTOCOL_VERSION: u32 = 4;

/// Version advertised in our session info.
pub const CURRENT_PROTOCOL_VERSION: u32 = 4;

/// Wire value identifying an X25519 key-exchange key.
pub const CRYPT_KEY_TYPE_CURVE25519: u8 = 1;

/// AES-GCM auth tag size appended to every data packet.
pub const AEAD_TAG_SIZE: usize = 16;

/// Per-session IV length.
pub const SESSION_IV_SIZE: usize = 12;

/// Domain label mixed into the key-derivation context buffer.
const KDF_CONTEXT_LABEL: &[u8; 14] = b"Steam datagram";

// ============================================================================
// Errors
// ============================================================================

/// Failure validating the peer's session info or running key exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CryptError {
    /// Session info failed to decode.
    Malformed,
    /// Unsupported key-exchange key type.
    BadKeyType,
    /// Key-exchange public key was not 32 bytes.
    BadKey,
    /// Signature over the session info did not verify.
    BadSignature,
    /// AEAD open failed (tampering, spoofing, or key mismatch).
    DecryptFailed,
}

impl fmt::Display for CryptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CryptError::Malformed => write!(f, "crypt info failed to decode"),
            CryptError::BadKeyType => write!(f, "unsupported DH key type"),
            CryptError::BadKey => write!(f, "invalid DH key"),
            CryptError::BadSignature => write!(f, "crypt info signature invalid"),
            CryptError::DecryptFailed => write!(f, "packet failed to decrypt"),
        }
    }
}

impl std::error::Error for CryptError {}

// ============================================================================
// Session info records
// ============================================================================

/// The session parameters a peer commits to for one connection attempt.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionCryptInfo {
    pub protocol_version: u32,
    pub key_type: u8,
    pub key_data: Vec<u8>,
    pub nonce: u64,
}

/// A serialized [`SessionCryptInfo`] plus a signature made with the identity
/// key named by the sender's certificate.
///
/// As with certificates, the signature covers `info_bytes` exactly as sent.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SignedCryptInfo {
    pub info_bytes: Vec<u8>,
    pub signature: Vec<u8>,
}

impl SignedCryptInfo {
    pub fn parse_info(&self) -> Result<SessionCryptInfo, CryptError> {
        crate::wire::deserialize_bounded(&self.info_bytes).map_err(|_| CryptError::Malformed)
    }
}

// ============================================================================
// Ephemeral key exchange
// ============================================================================

/// One connection's ephemeral X25519 keypair.
///
/// The secret half can be used exactly once; [`Self::key_exchange`] consumes
/// it and the library never regenerates one for the same connection.
pub struct SessionKeyExchange {
    secret: Option<EphemeralSecret>,
    public: PublicKey,
}

impl SessionKeyExchange {
    pub fn generate() -> Self {
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self {
            secret: Some(secret),
            public,
        }
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        *self.public.as_bytes()
    }

    /// Build our signed session info, committing to this keypair and a fresh
    /// 64-bit nonce. `sign` is called with the exact bytes the peer will
    /// verify.
    pub fn build_signed_info(
        &self,
        sign: impl FnOnce(&[u8]) -> [u8; 64],
    ) -> (SessionCryptInfo, SignedCryptInfo) {
        let info = SessionCryptInfo {
            protocol_version: CURRENT_PROTOCOL_VERSION,
            key_type: CRYPT_KEY_TYPE_CURVE25519,
            key_data: self.public_key_bytes().to_vec(),
            nonce: OsRng.next_u64(),
        };
        let info_bytes = serialize(&info);
        let signature = sign(&info_bytes).to_vec();
        (
            info,
            SignedCryptInfo {
                info_bytes,
                signature,
            },
        )
    }

    /// Perform the exchange against the peer's public key, consuming the
    /// secret half. Returns `None` if the key was already used.
    pub fn key_exchange(&mut self, remote_public: &[u8; 32]) -> Option<Premaster> {
        let secret = self.secret.take()?;
        let shared = secret.diffie_hellman(&PublicKey::from(*remote_public));
        Some(Premaster(shared.to_bytes()))
    }

    /// True until [`Self::key_exchange`] runs.
    pub fn has_secret(&self) -> bool {
        self.secret.is_some()
    }
}

/// The raw X25519 shared secret. Wiped on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct Premaster([u8; 32]);

// ============================================================================
// Key derivation
// ============================================================================

/// Derived symmetric session state. Wiped on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SessionKeys {
    pub send_key: [u8; 32],
    pub recv_key: [u8; 32],
    pub send_iv: [u8; SESSION_IV_SIZE],
    pub recv_iv: [u8; SESSION_IV_SIZE],
}

/// Everything the derivation commits to beyond the shared secret.
///
/// All byte strings are the exact serialized records from the handshake, not
/// re-encodings.
pub struct KeyDerivationContext<'a> {
    pub local_nonce: u64,
    pub remote_nonce: u64,
    pub local_conn_id: u32,
    pub remote_conn_id: u32,
    pub local_cert_bytes: &'a [u8],
    pub remote_cert_bytes: &'a [u8],
    pub local_info_bytes: &'a [u8],
    pub remote_info_bytes: &'a [u8],
    /// Exactly one peer sets this; it swaps every local/remote pair so both
    /// sides build identical context bytes.
    pub server: bool,
}

fn hmac_sha256(key: &[u8], msg: &[u8]) -> [u8; 32] {
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(key)
        .expect("HMAC-SHA-256 accepts any key length");
    mac.update(msg);
    mac.finalize().into_bytes().into()
}

/// Derive the session keys and IVs from the premaster secret, consuming it.
///
/// Produces byte-identical output on both peers, with the (send, recv) pairs
/// mirrored on the server side.
pub fn derive_session_keys(premaster: Premaster, ctx: &KeyDerivationContext<'_>) -> SessionKeys {
    // Extract: mix the premaster into a PRK, salted with both nonces.
    let mut salt = [0u8; 16];
    let (first, second) = if ctx.server {
        (ctx.local_nonce, ctx.remote_nonce)
    } else {
        (ctx.remote_nonce, ctx.local_nonce)
    };
    salt[..8].copy_from_slice(&first.to_le_bytes());
    salt[8..].copy_from_slice(&second.to_le_bytes());
    let mut prk = hmac_sha256(&salt, &premaster.0);
    drop(premaster);

    // Expand: chain four HMAC rounds over the context buffer. The first 32
    // bytes are scratch holding the previous round's digest; round one
    // hashes from just past it.
    let conn_ids = if ctx.server {
        [ctx.remote_conn_id, ctx.local_conn_id]
    } else {
        [ctx.local_conn_id, ctx.remote_conn_id]
    };
    let contexts: [&[u8]; 4] = if ctx.server {
        [
            ctx.local_cert_bytes,
            ctx.remote_cert_bytes,
            ctx.local_info_bytes,
            ctx.remote_info_bytes,
        ]
    } else {
        [
            ctx.remote_cert_bytes,
            ctx.local_cert_bytes,
            ctx.remote_info_bytes,
            ctx.local_info_bytes,
        ]
    };

    let mut buf = Vec::with_capacity(
        32 + 8 + KDF_CONTEXT_LABEL.len() + contexts.iter().map(|c| c.len()).sum::<usize>() + 1,
    );
    buf.extend_from_slice(&[0u8; 32]);
    buf.extend_from_slice(&conn_ids[0].to_le_bytes());
    buf.extend_from_slice(&conn_ids[1].to_le_bytes());
    buf.extend_from_slice(KDF_CONTEXT_LABEL);
    for c in contexts {
        buf.extend_from_slice(c);
    }
    buf.push(0);
    let last = buf.len() - 1;

    let mut digests = [[0u8; 32]; 4];
    for round in 0..4 {
        buf[last] = (round + 1) as u8;
        let start = if round == 0 { 32 } else { 0 };
        digests[round] = hmac_sha256(&prk, &buf[start..]);
        buf[..32].copy_from_slice(&digests[round]);
    }

    let mut keys = SessionKeys {
        send_key: [0; 32],
        recv_key: [0; 32],
        send_iv: [0; SESSION_IV_SIZE],
        recv_iv: [0; SESSION_IV_SIZE],
    };
    let (send_k, recv_k, send_iv, recv_iv) = if ctx.server {
        (1, 0, 3, 2)
    } else {
        (0, 1, 2, 3)
    };
    keys.send_key = digests[send_k];
    keys.recv_key = digests[recv_k];
    keys.send_iv.copy_from_slice(&digests[send_iv][..SESSION_IV_SIZE]);
    keys.recv_iv.copy_from_slice(&digests[recv_iv][..SESSION_IV_SIZE]);

    buf.zeroize();
    prk.zeroize();
    digests.iter_mut().for_each(Zeroize::zeroize);
    keys
}

// ============================================================================
// Packet AEAD
// ============================================================================

/// One direction of packet protection: AES-GCM keyed for the session, with
/// the full 64-bit packet sequence number folded into the base IV.
pub struct SessionCipher {
    cipher: Aes256Gcm,
    base_iv: [u8; SESSION_IV_SIZE],
}

impl SessionCipher {
    pub fn new(key: &[u8; 32], base_iv: &[u8; SESSION_IV_SIZE]) -> Self {
        Self {
            cipher: Aes256Gcm::new(key.into()),
            base_iv: *base_iv,
        }
    }

    /// The base IV plus the packet number in the low 8 bytes (little endian).
    fn nonce_for(&self, sequence: i64) -> [u8; SESSION_IV_SIZE] {
        let mut nonce = self.base_iv;
        let low = u64::from_le_bytes(nonce[..8].try_into().expect("IV prefix"));
        nonce[..8].copy_from_slice(&low.wrapping_add(sequence as u64).to_le_bytes());
        nonce
    }

    /// Seal a packet payload. The tag is appended to the ciphertext.
    pub fn encrypt(&self, sequence: i64, plaintext: &[u8]) -> Vec<u8> {
        let nonce = self.nonce_for(sequence);
        self.cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: &[],
                },
            )
            .expect("AES-GCM encryption is infallible for in-memory buffers")
    }

    /// Open a packet payload with the expanded sequence number.
    pub fn decrypt(&self, sequence: i64, ciphertext: &[u8]) -> Result<Vec<u8>, CryptError> {
        let nonce = self.nonce_for(sequence);
        self.cipher
            .decrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: ciphertext,
                    aad: &[],
                },
            )
            .map_err(|_| CryptError::DecryptFailed)
    }
}

impl fmt::Debug for SessionCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Key material stays out of logs.
        f.write_str("SessionCipher { .. }")
    }
}

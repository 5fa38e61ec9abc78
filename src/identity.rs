//! # Identities and Signing Keys
//!
//! This module defines the core identity types used throughout the crate:
//!
//! - [`NetIdentity`]: who a peer claims to be, independent of any address
//! - [`Keypair`]: Ed25519 signing keypair backing an identity's certificate
//! - [`key_id_for_public_key`]: 64-bit fingerprints used to select CA keys
//!
//! ## Identity Model
//!
//! Endpoints are identified by an opaque identity, not by a network address.
//! An identity is authenticated when the peer presents a certificate binding
//! that identity to an Ed25519 public key and then proves possession of the
//! matching private key during the session handshake.
//!
//! The [`NetIdentity::LocalHost`] variant is special: it denotes an
//! unauthenticated same-process loopback endpoint and is the one identity a
//! certificate authority must never issue for.

use std::fmt;
use std::net::IpAddr;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

// ============================================================================
// Steam account IDs
// ============================================================================

/// Account-type field of a packed 64-bit Steam ID (bits 52..56).
const STEAMID_ACCOUNT_TYPE_SHIFT: u32 = 52;
const STEAMID_ACCOUNT_TYPE_MASK: u64 = 0xF;

/// Account type used by anonymous game server logons.
const ACCOUNT_TYPE_ANON_GAMESERVER: u64 = 4;

/// Returns true if the packed Steam ID is an anonymous game server account.
///
/// Certificates restricted to relay regions are only honored for these
/// accounts; an ordinary user identity presenting one is rejected.
pub fn steam_id_is_anon_gameserver(steam_id: u64) -> bool {
    (steam_id >> STEAMID_ACCOUNT_TYPE_SHIFT) & STEAMID_ACCOUNT_TYPE_MASK
        == ACCOUNT_TYPE_ANON_GAMESERVER
}

// ============================================================================
// NetIdentity
// ============================================================================

/// A peer identity: a tagged value, compared by tag and payload.
///
/// Two identities are equal iff their variants and payloads match. Hashing
/// follows the derived structural form so identities can key the
/// listen-socket child maps.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NetIdentity {
    /// A packed 64-bit Steam account ID.
    SteamId(u64),
    /// A bare IP address (no authentication value on its own).
    Ip(IpAddr),
    /// A free-form UTF-8 identity string.
    Str(String),
    /// Unauthenticated same-process loopback.
    LocalHost,
    /// No identity. Never valid on an established connection.
    Invalid,
}

impl NetIdentity {
    pub fn is_invalid(&self) -> bool {
        matches!(self, NetIdentity::Invalid)
    }

    pub fn is_localhost(&self) -> bool {
        matches!(self, NetIdentity::LocalHost)
    }

    /// The packed Steam ID, if this identity is one.
    pub fn steam_id(&self) -> Option<u64> {
        match self {
            NetIdentity::SteamId(id) => Some(*id),
            _ => None,
        }
    }

    /// Parse the canonical string form produced by [`fmt::Display`].
    pub fn parse(s: &str) -> Option<Self> {
        if s == "localhost" {
            return Some(NetIdentity::LocalHost);
        }
        if s == "invalid" {
            return Some(NetIdentity::Invalid);
        }
        if let Some(rest) = s.strip_prefix("steamid:") {
            return rest.parse::<u64>().ok().map(NetIdentity::SteamId);
        }
        if let Some(rest) = s.strip_prefix("ip:") {
            return rest.parse::<IpAddr>().ok().map(NetIdentity::Ip);
        }
        if let Some(rest) = s.strip_prefix("str:") {
            return Some(NetIdentity::Str(rest.to_string()));
        }
        None
    }
}

impl fmt::Display for NetIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetIdentity::SteamId(id) => write!(f, "steamid:{id}"),
            NetIdentity::Ip(ip) => write!(f, "ip:{ip}"),
            NetIdentity::Str(s) => write!(f, "str:{s}"),
            NetIdentity::LocalHost => write!(f, "localhost"),
            NetIdentity::Invalid => write!(f, "invalid"),
        }
    }
}

// ============================================================================
// Key fingerprints
// ============================================================================

/// Reserved "no key" fingerprint.
pub const INVALID_KEY_ID: u64 = 0;

/// 64-bit fingerprint of a raw Ed25519 public key.
///
/// The little-endian first 8 bytes of SHA-256 over the raw 32-byte key.
/// Used to select which pinned CA key signed a certificate.
pub fn key_id_for_public_key(public_key: &[u8; 32]) -> u64 {
    let digest = Sha256::digest(public_key);
    u64::from_le_bytes(digest[..8].try_into().expect("digest is 32 bytes"))
}

// ============================================================================
// Keypair
// ============================================================================

/// An Ed25519 signing keypair.
///
/// Signs certificates (when acting as a CA) and session crypt info (always).
/// The raw public key is the 32-byte form carried in certificates.
#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    /// Generate a fresh keypair from the OS CSPRNG.
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

    /// Fingerprint of the public half.
    pub fn key_id(&self) -> u64 {
        key_id_for_public_key(&self.public_key_bytes())
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        self.signing_key
            .verifying_key()
            .verify(message, signature)
            .is_ok()
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never print the secret half.
        f.debug_struct("Keypair")
            .field("public", &hex::encode(self.public_key_bytes()))
            .finish()
    }
}

/// Verify an Ed25519 signature over `message` with a raw 32-byte public key.
///
/// Uses strict verification to reject malleable encodings.
pub fn verify_signature(public_key: &[u8], message: &[u8], signature: &[u8]) -> bool {
    let Ok(key_bytes) = <[u8; 32]>::try_from(public_key) else {
        return false;
    };
    let Ok(verifying_key) = VerifyingKey::from_bytes(&key_bytes) else {
        return false;
    };
    let Ok(sig_bytes) = <[u8; 64]>::try_from(signature) else {
        return false;
    };
    let sig = Signature::from_bytes(&sig_bytes);
    verifying_key.verify_strict(message, &sig).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_equality_is_tag_and_payload() {
        assert_eq!(NetIdentity::SteamId(42), NetIdentity::SteamId(42));
        assert_ne!(NetIdentity::SteamId(42), NetIdentity::SteamId(43));
        assert_ne!(
            NetIdentity::Str("42".into()),
            NetIdentity::SteamId(42),
            "different variants must never compare equal"
        );
        assert_eq!(NetIdentity::LocalHost, NetIdentity::LocalHost);
    }

    #[test]
    fn identity_display_round_trips() {
        let cases = [
            NetIdentity::SteamId(76561198000000000),
            NetIdentity::Ip("10.0.0.1".parse().unwrap()),
            NetIdentity::Ip("::1".parse().unwrap()),
            NetIdentity::Str("gameserver-7".into()),
            NetIdentity::LocalHost,
            NetIdentity::Invalid,
        ];
        for id in cases {
            let parsed = NetIdentity::parse(&id.to_string());
            assert_eq!(parsed.as_ref(), Some(&id), "round trip failed for {id}");
        }
    }

    #[test]
    fn anon_gameserver_detection() {
        // Universe 1, type 4 (anon gameserver), instance 0, account 0.
        let anon_gs = (1u64 << 56) | (4u64 << 52);
        assert!(steam_id_is_anon_gameserver(anon_gs));

        // Ordinary individual account (type 1).
        let user = (1u64 << 56) | (1u64 << 52) | 12345;
        assert!(!steam_id_is_anon_gameserver(user));
    }

    #[test]
    fn key_id_is_stable_and_nonzero() {
        let keypair = Keypair::generate();
        let id1 = keypair.key_id();
        let id2 = key_id_for_public_key(&keypair.public_key_bytes());
        assert_eq!(id1, id2);
        assert_ne!(id1, INVALID_KEY_ID, "fingerprint collision with reserved zero");
    }

    #[test]
    fn sign_and_verify() {
        let keypair = Keypair::generate();
        let msg = b"session info bytes";
        let sig = keypair.sign(msg);
        assert!(verify_signature(
            &keypair.public_key_bytes(),
            msg,
            &sig.to_bytes()
        ));
        assert!(
            !verify_signature(&keypair.public_key_bytes(), b"tampered", &sig.to_bytes()),
            "signature must not verify over different bytes"
        );
    }

    #[test]
    fn verify_rejects_malformed_inputs() {
        let keypair = Keypair::generate();
        let sig = keypair.sign(b"x").to_bytes();
        assert!(!verify_signature(&[0u8; 31], b"x", &sig));
        assert!(!verify_signature(&keypair.public_key_bytes(), b"x", &sig[..63]));
    }
}

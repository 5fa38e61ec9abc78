//! # Wire Records
//!
//! Serializable records exchanged between peers. Two channels exist:
//!
//! | Channel | Record | Protection |
//! |---------|--------|------------|
//! | Signaling | [`SignalFrame`] | signed payloads inside, carrier untrusted |
//! | Data | [`DataFrame`] list | AES-GCM, sequence-numbered |
//!
//! Everything is serialized with bincode behind size limits; raw
//! `bincode::deserialize` is never used on bytes from a peer.
//!
//! An encrypted data packet on the wire is the 16-bit truncated sequence
//! number (little endian) followed by ciphertext with the 16-byte auth tag
//! appended. The plaintext is a bincode-encoded `Vec<DataFrame>` so acks can
//! piggyback on data.

use bincode::Options;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::cert::SignedCertificate;
use crate::crypto::SignedCryptInfo;
use crate::identity::NetIdentity;

/// Hard cap on a single message submitted to `send()`.
pub const MAX_MESSAGE_SIZE: usize = 512 * 1024;

/// Maximum buffer size for deserialization.
/// Slightly larger than the message cap to allow for framing overhead.
pub const MAX_DESERIALIZE_SIZE: u64 = (MAX_MESSAGE_SIZE as u64) + 4096;

/// Returns bincode options with size limits enforced.
/// SECURITY: Always use this for deserialization to prevent OOM attacks.
fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_DESERIALIZE_SIZE)
        .with_fixint_encoding()
}

/// Deserialize with size bounds enforced.
pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}

/// Serialize a wire record.
///
/// Uses the same options as [`deserialize_bounded`] so both directions agree
/// on the encoding. Serialization of these plain records cannot fail.
pub fn serialize<T: Serialize>(value: &T) -> Vec<u8> {
    bincode_options()
        .serialize(value)
        .expect("wire records always serialize")
}

// ============================================================================
// Send flags
// ============================================================================

/// Flags accepted by `send()`. Combine with bitwise or.
pub mod send_flags {
    /// Best-effort delivery, may drop or reorder.
    pub const UNRELIABLE: u32 = 0;
    /// Bypass Nagle timers for this message and everything queued before it.
    pub const NO_NAGLE: u32 = 1;
    /// Drop instead of buffering when the link is backed up.
    pub const NO_DELAY: u32 = 4;
    /// Retransmit until acknowledged.
    pub const RELIABLE: u32 = 8;
}

// ============================================================================
// Signaling frames
// ============================================================================

/// Handshake and teardown traffic carried by the opaque signaling channel.
///
/// `to_conn_id` is zero until the sender has learned the peer's connection
/// ID; `to_virtual_port` routes a connect request to a listen socket.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SignalFrame {
    pub from_identity: NetIdentity,
    pub to_identity: NetIdentity,
    pub from_conn_id: u32,
    pub to_conn_id: u32,
    pub to_virtual_port: u32,
    pub body: SignalBody,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum SignalBody {
    /// Initiator's half of the handshake. Retransmitted until answered.
    ConnectRequest {
        cert: SignedCertificate,
        crypt: SignedCryptInfo,
    },
    /// Acceptor's half of the handshake.
    ConnectOk {
        cert: SignedCertificate,
        crypt: SignedCryptInfo,
    },
    /// Graceful or abrupt teardown notice.
    ConnectionClosed { reason: u32, debug: String },
}

// ============================================================================
// Data frames
// ============================================================================

/// Plaintext frames inside an encrypted data packet.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum DataFrame {
    /// One application message. The minimal segmentation layer maps one
    /// message to one packet; the size cap makes that sound.
    Message {
        msg_num: i64,
        reliable: bool,
        payload: Vec<u8>,
    },
    /// Acknowledges a reliable message.
    Ack { msg_num: i64 },
    /// Liveness probe. `reply_requested` asks the peer to answer promptly so
    /// the sender can measure round-trip time and detect a dying link.
    Keepalive { reply_requested: bool },
}

/// Encode the plaintext of a data packet.
pub fn encode_frames(frames: &[DataFrame]) -> Vec<u8> {
    serialize(&frames.to_vec())
}

/// Decode the plaintext of a data packet.
pub fn decode_frames(bytes: &[u8]) -> Result<Vec<DataFrame>, bincode::Error> {
    deserialize_bounded(bytes)
}

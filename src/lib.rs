//! # steamnet - Connection-Oriented Secure Datagram Messaging
//!
//! A peer-to-peer, message-oriented transport core where endpoints are
//! identified by cryptographic identities rather than addresses. Every
//! connection runs an end-to-end handshake — certificate validation against
//! a compile-time trust store, ephemeral X25519 key exchange, symmetric key
//! derivation — and then protects each packet with AES-GCM keyed to that
//! session.
//!
//! ## Architecture
//!
//! The crate uses the **handle + scheduler task** pattern throughout:
//! a [`Sockets`] handle is cheap to clone and talks over channels to a
//! single task that owns every connection, listen socket, and received
//! message. Connections are cooperative "thinkers": each names the next
//! time it needs to run, and the task sleeps until the earliest deadline.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `sockets` | public API handle, scheduler task, connection registry |
//! | `connection` | the nine-state connection lifecycle and handshake |
//! | `cert` | certificates, the pinned CA trust store, text forms |
//! | `crypto` | key exchange, key derivation, packet AEAD |
//! | `identity` | peer identities and Ed25519 keys |
//! | `queue` | received-message pool with dual-queue membership |
//! | `snp` | minimal segmentation/reliability layer |
//! | `stats` | sequence expansion, replay window, liveness tracking |
//! | `socket` | listen sockets |
//! | `pipe` | same-process loopback pairs |
//! | `wire` | serialized wire records, size-bounded decoding |
//!
//! ## Example
//!
//! ```ignore
//! let sockets = Sockets::new(SocketsConfig::default());
//! let (a, b) = sockets.create_loopback_pair().await?;
//! sockets.send(a, b"hello".to_vec(), send_flags::RELIABLE).await?;
//! let messages = sockets.recv(b, 16).await?;
//! assert_eq!(messages[0].payload, b"hello");
//! ```

#![forbid(unsafe_code)]

pub mod cert;
pub mod connection;
pub mod crypto;
pub mod identity;
mod pipe;
pub mod queue;
mod snp;
mod socket;
pub mod sockets;
mod stats;
pub mod wire;

pub use cert::{
    cert_from_text, cert_to_text, create_cert, CertError, CertParams, Certificate,
    SignedCertificate,
};
pub use connection::{
    end_reason, ApiError, ConnectionConfig, ConnectionInfo, ConnectionState, QuickStatus,
    RemoteUnsignedCertPolicy,
};
pub use identity::{Keypair, NetIdentity};
pub use queue::ReceivedMessage;
pub use sockets::{
    ConnHandle, ListenHandle, Sockets, SocketsConfig, StatusChangedEvent, Transport,
};
pub use wire::{send_flags, SignalBody, SignalFrame, MAX_MESSAGE_SIZE};

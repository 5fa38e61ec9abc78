//! # The Connection State Machine
//!
//! One [`Connection`] per end-to-end session. The lifecycle traverses nine
//! states:
//!
//! | State | Meaning |
//! |-------|---------|
//! | `None` | freshly constructed, not yet initialized |
//! | `Connecting` | handshake in flight |
//! | `FindingRoute` | handshake accepted, waiting for first end-to-end packet |
//! | `Connected` | fully established |
//! | `ClosedByPeer` | peer closed; waiting for the app to release us |
//! | `ProblemDetectedLocally` | we closed; waiting for the app to release us |
//! | `FinWait` | hidden: absorbing stragglers before self-destruction |
//! | `Linger` | hidden: draining queued sends after a graceful close |
//! | `Dead` | hidden: reaped by the scheduler on its next tick |
//!
//! The hidden states collapse to `None` in everything the application sees.
//! `set_state` is the only mutation path; it records the entry timestamp,
//! purges/wipes as required, and emits a status-change effect when the
//! API-visible state moved.
//!
//! Connections never touch the transport or the message store directly.
//! Methods push [`Effect`] values into an outbox that the owning scheduler
//! task drains and executes; that keeps all cross-connection and I/O work on
//! the one thread that owns it.

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, warn};

use crate::cert::{Certificate, SignedCertificate, CERT_KEY_TYPE_ED25519};
use crate::crypto::{
    derive_session_keys, KeyDerivationContext, SessionCipher, SessionCryptInfo,
    SessionKeyExchange, SignedCryptInfo, CRYPT_KEY_TYPE_CURVE25519,
    MIN_REQUIRED_PROTOCOL_VERSION,
};
use crate::identity::{steam_id_is_anon_gameserver, verify_signature, Keypair, NetIdentity};
use crate::queue::QueueTag;
use crate::snp::{AssembledMessage, SnpState};
use crate::stats::{
    LinkStats, AGGRESSIVE_PING_INTERVAL_USEC, KEEPALIVE_INTERVAL_USEC, MAX_REPLY_TIMEOUTS,
    MAX_SEQ_NUM_GAP, MILLION,
};
use crate::wire::{
    decode_frames, encode_frames, send_flags, DataFrame, SignalBody, MAX_MESSAGE_SIZE,
};

// ============================================================================
// Timing constants
// ============================================================================

/// Resend cadence for the connect request while `Connecting`.
pub const CONNECT_RETRY_INTERVAL_USEC: u64 = MILLION / 2;

/// Grace period spent in `FinWait` before self-destructing.
pub const FIN_WAIT_TIMEOUT_USEC: u64 = MILLION / 2;

/// Default handshake deadline, milliseconds.
pub const DEFAULT_TIMEOUT_INITIAL_MS: u32 = 10_000;

/// Default established-connection timeout, milliseconds.
pub const DEFAULT_TIMEOUT_CONNECTED_MS: u32 = 10_000;

/// Never: sentinel think time for "no deferred work".
pub const THINK_NEVER: u64 = u64::MAX;

// ============================================================================
// End reasons
// ============================================================================

/// Numeric codes latched into `end_reason` when a connection dies.
///
/// Application codes live in 1000..=1999 (normal) and 2000..=2999
/// (exception); locally detected problems and remote misbehavior use the
/// 4000/5000 families.
pub mod end_reason {
    pub const INVALID: u32 = 0;
    pub const APP_GENERIC: u32 = 1000;
    pub const APP_MAX: u32 = 1999;
    pub const APP_EXCEPTION_GENERIC: u32 = 2000;
    pub const APP_EXCEPTION_MAX: u32 = 2999;
    pub const REMOTE_TIMEOUT: u32 = 4001;
    pub const REMOTE_BAD_CRYPT: u32 = 4002;
    pub const REMOTE_BAD_CERT: u32 = 4003;
    pub const REMOTE_BAD_PROTOCOL_VERSION: u32 = 4006;
    pub const MISC_GENERIC: u32 = 5001;
    pub const MISC_INTERNAL_ERROR: u32 = 5002;
    pub const MISC_TIMEOUT: u32 = 5003;
}

// ============================================================================
// API errors
// ============================================================================

/// Errors returned to the caller without touching connection state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    /// The connection is in a state that cannot service the call.
    InvalidState,
    /// A parameter was out of range (e.g. message too large).
    InvalidParam,
    /// The connection is already closed or the handle is unknown.
    NoConnection,
    /// A process-wide limit was hit (registry full, ID space exhausted).
    LimitExceeded,
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApiError::InvalidState => write!(f, "connection is in the wrong state for this call"),
            ApiError::InvalidParam => write!(f, "invalid parameter"),
            ApiError::NoConnection => write!(f, "no such connection"),
            ApiError::LimitExceeded => write!(f, "resource limit exceeded"),
        }
    }
}

impl std::error::Error for ApiError {}

// ============================================================================
// Spam-reply rate limit
// ============================================================================

/// Timestamp of the last reply sent to a potentially forged packet.
static LAST_SPAM_REPLY_USEC: AtomicU64 = AtomicU64::new(0);

/// One process-wide token: replies to packets that have not authenticated
/// yet (unknown connection IDs, connect requests to closed ports) may go out
/// at most once per 250 ms, no matter how many connections exist. Returns
/// true if the caller may send its reply now.
pub fn check_global_spam_reply_rate_limit(now: u64) -> bool {
    let mut last = LAST_SPAM_REPLY_USEC.load(Ordering::Relaxed);
    loop {
        if last != 0 && now < last + 250_000 {
            return false;
        }
        match LAST_SPAM_REPLY_USEC.compare_exchange_weak(
            last,
            now,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => return true,
            Err(observed) => last = observed,
        }
    }
}

// ============================================================================
// States and configuration
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    None,
    Connecting,
    FindingRoute,
    Connected,
    ClosedByPeer,
    ProblemDetectedLocally,
    FinWait,
    Linger,
    Dead,
}

impl ConnectionState {
    /// Collapse hidden internal states to what the application is shown.
    pub fn api_state(self) -> ConnectionState {
        match self {
            ConnectionState::FinWait | ConnectionState::Linger | ConnectionState::Dead => {
                ConnectionState::None
            }
            s => s,
        }
    }
}

/// What to do about a peer that presents a cert with no CA signature.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RemoteUnsignedCertPolicy {
    /// Accept silently. Loopback pairs use this; it's us talking to us.
    Allow,
    /// Accept but log that the connection is not secure.
    AllowWarn,
    /// Refuse the connection.
    Reject,
}

/// Per-connection tunables.
#[derive(Clone, Debug)]
pub struct ConnectionConfig {
    /// Handshake deadline, milliseconds.
    pub timeout_initial_ms: u32,
    /// Established-link receive timeout, milliseconds.
    pub timeout_connected_ms: u32,
    /// May we fall back to an unsigned local cert when no CA-issued one was
    /// provisioned?
    pub allow_local_unsigned_cert: bool,
    /// Policy toward peers with unsigned certs.
    pub remote_unsigned_cert: RemoteUnsignedCertPolicy,
    /// Honor CA-signed certs past their expiry (log-only). Off by default;
    /// an expired cert then fails validation.
    pub allow_expired_certs: bool,
    /// Application ID certs must be issued for.
    pub app_id: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            timeout_initial_ms: DEFAULT_TIMEOUT_INITIAL_MS,
            timeout_connected_ms: DEFAULT_TIMEOUT_CONNECTED_MS,
            allow_local_unsigned_cert: true,
            remote_unsigned_cert: RemoteUnsignedCertPolicy::AllowWarn,
            allow_expired_certs: false,
            app_id: 0,
        }
    }
}

/// What the application sees in `info()`.
#[derive(Clone, Debug)]
pub struct ConnectionInfo {
    pub identity_remote: NetIdentity,
    pub id_remote: u32,
    pub state: ConnectionState,
    pub end_reason: u32,
    pub end_debug: String,
    pub listen_socket: Option<u32>,
    /// The peer presented a CA-signed certificate.
    pub peer_cert_signed: bool,
    /// Both certificates bind their connection's identity (no anonymous
    /// or identity-less certs involved).
    pub identity_authenticated: bool,
    pub peer_protocol_version: u32,
}

/// Cheap point-in-time status snapshot.
#[derive(Clone, Debug)]
pub struct QuickStatus {
    pub state: ConnectionState,
    /// Round-trip estimate in milliseconds, -1 until measured.
    pub ping_ms: i32,
    /// Fraction of sequenced packets that arrived, 0..=1; -1 until known.
    pub quality_local: f32,
    /// Peer's view of the same; synthesized for loopback, else -1.
    pub quality_remote: f32,
    pub pkts_sent: u64,
    pub pkts_recv: u64,
    /// Microseconds since anything arrived from the peer.
    pub usec_since_last_recv: u64,
    /// Microseconds since we last put anything on the wire.
    pub usec_since_last_send: u64,
    pub pending_send: usize,
    pub pending_reliable_unacked: usize,
}

/// How this connection moves bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ConnectionKind {
    /// Ordinary peer-to-peer connection over the transport seam.
    P2p,
    /// Half of a loopback pair; `partner` is the partner's full local ID.
    Pipe { partner: u32 },
}

/// Deferred work a connection asks its owner to perform.
#[derive(Debug)]
pub(crate) enum Effect {
    /// Send a signaling frame to the peer (addressing filled by the owner).
    SendSignal(SignalBody),
    /// Send an encrypted data packet over the transport.
    SendPacket(Vec<u8>),
    /// Deliver a message straight to the pipe partner.
    PipeDeliver { msg_num: i64, payload: Vec<u8> },
    /// API-visible state changed; notify the application.
    StatusChanged {
        old_state: ConnectionState,
        new_state: ConnectionState,
    },
    /// Discard everything in the receive queue.
    PurgeRecvQueue,
}

// ============================================================================
// Connection
// ============================================================================

pub(crate) struct Connection {
    pub(crate) id_local: u32,
    pub(crate) id_remote: u32,
    pub(crate) identity_local: NetIdentity,
    pub(crate) identity_remote: NetIdentity,
    pub(crate) virtual_port_remote: u32,
    pub(crate) kind: ConnectionKind,
    /// True on the accepting side; selects the key-derivation role.
    pub(crate) is_server: bool,

    state: ConnectionState,
    pub(crate) state_entered_at: u64,
    pub(crate) end_reason: u32,
    pub(crate) end_debug: String,
    pub(crate) config: ConnectionConfig,

    // Local crypto.
    signing_key_local: Option<Keypair>,
    pub(crate) signed_cert_local: SignedCertificate,
    pub(crate) cert_has_identity: bool,
    crypt_local: Option<SessionCryptInfo>,
    pub(crate) signed_crypt_local: SignedCryptInfo,
    kex: Option<SessionKeyExchange>,

    // Remote crypto. The signed session info is consumed by key
    // derivation and not retained.
    pub(crate) signed_cert_remote: Option<SignedCertificate>,
    cert_remote: Option<Certificate>,
    pub(crate) peer_protocol_version: u32,

    // Derived session state. `crypt_keys_valid` is monotonic: once true it
    // stays true, even after the ciphers are wiped.
    pub(crate) crypt_keys_valid: bool,
    cipher_send: Option<SessionCipher>,
    cipher_recv: Option<SessionCipher>,

    pub(crate) recv_queue: QueueTag,
    /// Weak back-pointer to the owning listen socket's handle.
    pub(crate) parent_listen_socket: Option<u32>,
    /// An inbound connection's stored handshake, validated at accept time.
    pub(crate) pending_remote_handshake: Option<(SignedCertificate, SignedCryptInfo)>,

    pub(crate) snp: SnpState,
    pub(crate) stats: LinkStats,

    /// Earliest time `think` wants to run again.
    next_think: u64,
    /// Latest acceptable time for that wakeup (jitter tolerance).
    next_think_latest: u64,
    /// Whether the transport can move data packets right now.
    pub(crate) transport_ok: bool,

    pub(crate) when_sent_connect_request: u64,
    last_decrypt_warn: u64,

    outbox: Vec<Effect>,
}

impl Connection {
    pub(crate) fn new(
        kind: ConnectionKind,
        id_local: u32,
        identity_local: NetIdentity,
        identity_remote: NetIdentity,
        config: ConnectionConfig,
        recv_queue: QueueTag,
        now: u64,
    ) -> Self {
        Self {
            id_local,
            id_remote: 0,
            identity_local,
            identity_remote,
            virtual_port_remote: 0,
            kind,
            is_server: false,
            state: ConnectionState::None,
            state_entered_at: now,
            end_reason: end_reason::INVALID,
            end_debug: String::new(),
            config,
            signing_key_local: None,
            signed_cert_local: SignedCertificate::default(),
            cert_has_identity: false,
            crypt_local: None,
            signed_crypt_local: SignedCryptInfo::default(),
            kex: None,
            signed_cert_remote: None,
            cert_remote: None,
            peer_protocol_version: 0,
            crypt_keys_valid: false,
            cipher_send: None,
            cipher_recv: None,
            recv_queue,
            parent_listen_socket: None,
            pending_remote_handshake: None,
            snp: SnpState::new(),
            stats: LinkStats::new(now),
            next_think: THINK_NEVER,
            next_think_latest: THINK_NEVER,
            transport_ok: true,
            when_sent_connect_request: 0,
            last_decrypt_warn: 0,
            outbox: Vec::new(),
        }
    }

    /// Short description for log lines.
    pub(crate) fn description(&self) -> String {
        format!("#{} {}", self.id_local & 0xFFFF, self.identity_remote)
    }

    pub(crate) fn take_effects(&mut self) -> Vec<Effect> {
        std::mem::take(&mut self.outbox)
    }

    // ------------------------------------------------------------------
    // State machine
    // ------------------------------------------------------------------

    pub(crate) fn state(&self) -> ConnectionState {
        self.state
    }

    pub(crate) fn api_state(&self) -> ConnectionState {
        self.state.api_state()
    }

    /// The only place `state` changes. Records the entry time, emits the
    /// status-change effect when API-visible, and performs the cleanup each
    /// destination state demands.
    fn set_state(&mut self, new_state: ConnectionState, now: u64) {
        if new_state == self.state {
            return;
        }
        let old_state = self.state;
        self.state = new_state;
        self.state_entered_at = now;
        debug!(
            conn = %self.description(),
            from = ?old_state,
            to = ?new_state,
            "state transition"
        );

        let old_api = old_state.api_state();
        let new_api = new_state.api_state();
        if old_api != new_api {
            self.outbox.push(Effect::StatusChanged {
                old_state: old_api,
                new_state: new_api,
            });
        }

        match new_state {
            // Nothing more will arrive or be sent; the secrets have no
            // further use. Already-received messages stay readable until
            // the application releases the handle.
            ConnectionState::ClosedByPeer | ConnectionState::ProblemDetectedLocally => {
                self.wipe_crypto();
            }
            // Gone from the API's point of view: discard anything unread.
            ConnectionState::FinWait | ConnectionState::Dead => {
                self.outbox.push(Effect::PurgeRecvQueue);
                self.wipe_crypto();
            }
            // Linger still delivers inbound data and drains outbound, so
            // the session keys stay.
            ConnectionState::Linger => {}
            ConnectionState::Connected | ConnectionState::FindingRoute => {
                debug_assert!(self.crypt_keys_valid, "connected without session keys");
            }
            ConnectionState::Connecting => {
                debug_assert!(!self.crypt_keys_valid, "connecting twice?");
            }
            ConnectionState::None => {}
        }

        // Whatever changed, the scheduler should look at us promptly.
        self.ensure_min_think_time(now);
    }

    fn wipe_crypto(&mut self) {
        // SessionKeys zeroize on drop; the ciphers fall with their contexts.
        self.cipher_send = None;
        self.cipher_recv = None;
        self.kex = None;
        self.signing_key_local = None;
    }

    /// Latch the end reason exactly once.
    fn latch_end_reason(&mut self, reason: u32, debug_str: &str) {
        if self.end_reason == end_reason::INVALID {
            self.end_reason = reason;
            self.end_debug = debug_str.to_string();
        }
    }

    /// A local failure: timeout, crypto error, protocol violation.
    pub(crate) fn problem_detected_locally(&mut self, reason: u32, debug_str: &str, now: u64) {
        warn!(conn = %self.description(), reason, %debug_str, "problem detected locally");
        if self.end_reason == end_reason::INVALID || self.state == ConnectionState::Linger {
            self.end_reason = reason;
            self.end_debug = debug_str.to_string();
        }

        match self.state {
            ConnectionState::None | ConnectionState::Dead => {
                debug_assert!(false, "problem reported on unreachable connection");
            }
            ConnectionState::ProblemDetectedLocally
            | ConnectionState::FinWait
            | ConnectionState::ClosedByPeer => {}
            ConnectionState::Linger => {
                // The peer never got a close notice; send it with the
                // original close reason, not this failure.
                self.outbox.push(Effect::SendSignal(SignalBody::ConnectionClosed {
                    reason: self.end_reason,
                    debug: self.end_debug.clone(),
                }));
                self.begin_fin_wait(now);
            }
            ConnectionState::Connecting
            | ConnectionState::FindingRoute
            | ConnectionState::Connected => {
                // Give the peer a chance to learn why we vanished.
                self.outbox.push(Effect::SendSignal(SignalBody::ConnectionClosed {
                    reason,
                    debug: debug_str.to_string(),
                }));
                self.set_state(ConnectionState::ProblemDetectedLocally, now);
            }
        }
    }

    /// The peer told us it is going away.
    pub(crate) fn closed_by_peer(&mut self, reason: u32, debug_str: &str, now: u64) {
        match self.state {
            ConnectionState::None | ConnectionState::Dead => {
                debug_assert!(false, "peer close on unreachable connection");
            }
            ConnectionState::FinWait | ConnectionState::ProblemDetectedLocally
            | ConnectionState::ClosedByPeer => {
                // Already shutting down; nothing changes.
            }
            ConnectionState::Linger => self.begin_fin_wait(now),
            ConnectionState::Connecting
            | ConnectionState::FindingRoute
            | ConnectionState::Connected => {
                let debug_str = if debug_str.is_empty() {
                    "The remote host closed the connection."
                } else {
                    debug_str
                };
                self.latch_end_reason(reason, debug_str);
                self.set_state(ConnectionState::ClosedByPeer, now);
            }
        }
    }

    pub(crate) fn begin_fin_wait(&mut self, now: u64) {
        match self.state {
            ConnectionState::None | ConnectionState::Dead => {
                debug_assert!(false, "fin-wait from unreachable state");
            }
            ConnectionState::FinWait => {}
            _ => self.set_state(ConnectionState::FinWait, now),
        }
    }

    pub(crate) fn begin_connecting(&mut self, now: u64) {
        debug_assert_eq!(self.state, ConnectionState::None);
        self.set_state(ConnectionState::Connecting, now);
    }

    pub(crate) fn begin_finding_route(&mut self, now: u64) {
        debug_assert_eq!(self.state, ConnectionState::Connecting);
        debug_assert!(self.crypt_keys_valid);
        // Route probes start immediately on the next think.
        self.when_sent_connect_request = 0;
        self.set_state(ConnectionState::FindingRoute, now);
    }

    pub(crate) fn mark_connected(&mut self, now: u64) {
        debug_assert!(matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::FindingRoute
        ));
        debug_assert!(self.crypt_keys_valid);
        self.set_state(ConnectionState::Connected, now);
    }

    /// Move to `Dead`; the scheduler deletes us on its next visit. Deferred
    /// so no caller ever frees a connection out from under itself.
    pub(crate) fn queue_destroy(&mut self, now: u64) {
        if self.state != ConnectionState::Dead {
            self.set_state(ConnectionState::Dead, now);
        }
        self.set_next_think(now);
    }

    /// The application closed us. Latches the app's reason, notifies the
    /// peer, and either drains (`linger`) or heads straight for FinWait.
    pub(crate) fn api_close(&mut self, reason: u32, debug_str: &str, linger: bool, now: u64) {
        if self.end_reason == end_reason::INVALID
            || matches!(
                self.state,
                ConnectionState::Connecting
                    | ConnectionState::FindingRoute
                    | ConnectionState::Connected
            )
        {
            let reason = if reason == 0 {
                end_reason::APP_GENERIC
            } else if !(end_reason::APP_GENERIC..=end_reason::APP_EXCEPTION_MAX).contains(&reason) {
                end_reason::APP_EXCEPTION_GENERIC
            } else {
                reason
            };
            if self.end_reason == end_reason::INVALID {
                self.end_reason = reason;
                self.end_debug = debug_str.to_string();
            }
        }

        match self.state {
            ConnectionState::None | ConnectionState::Dead => {}
            ConnectionState::FinWait | ConnectionState::Linger => {
                if !linger {
                    // Cutting a drain short; the peer still gets its notice.
                    if self.state == ConnectionState::Linger {
                        self.outbox.push(Effect::SendSignal(
                            SignalBody::ConnectionClosed {
                                reason: self.end_reason,
                                debug: self.end_debug.clone(),
                            },
                        ));
                    }
                    self.begin_fin_wait(now);
                }
            }
            ConnectionState::ClosedByPeer
            | ConnectionState::ProblemDetectedLocally
            | ConnectionState::Connecting
            | ConnectionState::FindingRoute => {
                self.notify_peer_of_close();
                self.begin_fin_wait(now);
            }
            ConnectionState::Connected => {
                if linger {
                    // The peer hears nothing yet; it learns of the close
                    // when the drain finishes and we enter FinWait.
                    self.set_state(ConnectionState::Linger, now);
                } else {
                    self.notify_peer_of_close();
                    self.begin_fin_wait(now);
                }
            }
        }
    }

    fn notify_peer_of_close(&mut self) {
        // Only states that ever talked to a peer owe them a notice.
        if matches!(
            self.state,
            ConnectionState::Connecting
                | ConnectionState::FindingRoute
                | ConnectionState::Connected
        ) {
            self.outbox.push(Effect::SendSignal(SignalBody::ConnectionClosed {
                reason: self.end_reason,
                debug: self.end_debug.clone(),
            }));
        }
    }

    // ------------------------------------------------------------------
    // Local crypto setup
    // ------------------------------------------------------------------

    /// Provision this connection with a signed cert and its matching key.
    pub(crate) fn init_local_crypto(
        &mut self,
        signed_cert: SignedCertificate,
        signing_key: Keypair,
        cert_has_identity: bool,
    ) {
        debug_assert!(self.crypt_local.is_none(), "local crypto initialized twice");
        self.signed_cert_local = signed_cert;
        self.cert_has_identity = cert_has_identity;

        let kex = SessionKeyExchange::generate();
        let (info, signed_info) =
            kex.build_signed_info(|bytes| signing_key.sign(bytes).to_bytes());
        self.kex = Some(kex);
        self.crypt_local = Some(info);
        self.signed_crypt_local = signed_info;
        self.signing_key_local = Some(signing_key);
    }

    /// Generate a throwaway key and an unsigned cert naming our identity.
    /// Used for loopback and for endpoints running without a CA.
    pub(crate) fn init_local_crypto_unsigned(&mut self) {
        let keypair = Keypair::generate();
        let cert = Certificate {
            key_data: keypair.public_key_bytes().to_vec(),
            key_type: CERT_KEY_TYPE_ED25519,
            time_created: crate::cert::now_secs(),
            time_expiry: 0,
            // Always present, even for app 0, so the peer's restriction
            // check sees a bound cert.
            app_ids: vec![self.config.app_id],
            pop_ids: Vec::new(),
            identity: self.identity_local.to_string(),
            legacy_steam_id: self.identity_local.steam_id().unwrap_or(0),
        };
        let signed = SignedCertificate::unsigned(&cert);
        self.init_local_crypto(signed, keypair, true);
    }

    pub(crate) fn has_local_crypto(&self) -> bool {
        self.crypt_local.is_some()
    }

    /// Our half of the handshake, for the connect request / accept reply.
    pub(crate) fn local_handshake(&self) -> (SignedCertificate, SignedCryptInfo) {
        (
            self.signed_cert_local.clone(),
            self.signed_crypt_local.clone(),
        )
    }

    // ------------------------------------------------------------------
    // Handshake validation and key derivation
    // ------------------------------------------------------------------

    /// Validate the peer's cert + session info and derive the session keys.
    ///
    /// On any failure the connection has already transitioned to
    /// `ProblemDetectedLocally` with the appropriate end reason; the `Err`
    /// just tells the caller to stop.
    pub(crate) fn recv_crypto_handshake(
        &mut self,
        msg_cert: &SignedCertificate,
        msg_crypt: &SignedCryptInfo,
        server: bool,
        now: u64,
    ) -> Result<(), ()> {
        if self.crypt_keys_valid {
            return Ok(());
        }
        self.is_server = server;

        if msg_cert.cert_bytes.is_empty() || msg_crypt.info_bytes.is_empty() {
            self.problem_detected_locally(
                end_reason::REMOTE_BAD_CRYPT,
                "Crypto handshake missing cert or session data",
                now,
            );
            return Err(());
        }

        // Certificate record.
        let cert = match msg_cert.parse_cert() {
            Ok(c) => c,
            Err(_) => {
                self.problem_detected_locally(
                    end_reason::REMOTE_BAD_CRYPT,
                    "Cert failed to decode",
                    now,
                );
                return Err(());
            }
        };
        let cert_public_key = match cert.public_key() {
            Ok(k) => k,
            Err(_) => {
                self.problem_detected_locally(
                    end_reason::REMOTE_BAD_CRYPT,
                    "Cert has invalid identity key",
                    now,
                );
                return Err(());
            }
        };

        // We need our own crypto before we can answer.
        if !self.has_local_crypto() {
            if !self.config.allow_local_unsigned_cert {
                warn!(
                    conn = %self.description(),
                    "no provisioned cert and unsigned certs disallowed; continuing unsigned"
                );
            }
            self.init_local_crypto_unsigned();
        }

        // Restriction families.
        if let Err(()) = self.check_cert_restrictions(msg_cert, &cert, now) {
            return Err(());
        }

        // CA signature and expiry.
        if msg_cert.has_ca_signature() {
            if let Err(e) = msg_cert.verify_ca_signature() {
                self.problem_detected_locally(
                    end_reason::REMOTE_BAD_CERT,
                    &e.to_string(),
                    now,
                );
                return Err(());
            }
            if cert.has_expired(crate::cert::now_secs()) {
                if self.config.allow_expired_certs {
                    warn!(
                        conn = %self.description(),
                        expiry = cert.time_expiry,
                        "peer cert has expired; allowed by config"
                    );
                } else {
                    self.problem_detected_locally(
                        end_reason::REMOTE_BAD_CERT,
                        "Cert has expired",
                        now,
                    );
                    return Err(());
                }
            }
        } else {
            match self.config.remote_unsigned_cert {
                RemoteUnsignedCertPolicy::Allow => {}
                RemoteUnsignedCertPolicy::AllowWarn => {
                    warn!(
                        conn = %self.description(),
                        "remote host is using an unsigned cert; allowing, but it's not secure"
                    );
                }
                RemoteUnsignedCertPolicy::Reject => {
                    self.problem_detected_locally(
                        end_reason::REMOTE_BAD_CERT,
                        "Unsigned certs are not allowed",
                        now,
                    );
                    return Err(());
                }
            }
        }

        // Session info record.
        let crypt = match msg_crypt.parse_info() {
            Ok(c) => c,
            Err(_) => {
                self.problem_detected_locally(
                    end_reason::REMOTE_BAD_CRYPT,
                    "Crypt info failed to decode",
                    now,
                );
                return Err(());
            }
        };
        if crypt.protocol_version < MIN_REQUIRED_PROTOCOL_VERSION {
            let debug = format!(
                "Peer is running old software and needs to be updated.  (V{}, >=V{} is required)",
                crypt.protocol_version, MIN_REQUIRED_PROTOCOL_VERSION
            );
            self.problem_detected_locally(end_reason::REMOTE_BAD_PROTOCOL_VERSION, &debug, now);
            return Err(());
        }
        if self.peer_protocol_version != 0 && self.peer_protocol_version != crypt.protocol_version
        {
            let debug = format!(
                "Claiming protocol V{} now, but earlier was using V{}",
                crypt.protocol_version, self.peer_protocol_version
            );
            self.problem_detected_locally(end_reason::REMOTE_BAD_PROTOCOL_VERSION, &debug, now);
            return Err(());
        }
        self.peer_protocol_version = crypt.protocol_version;

        // The session info must be signed by the key the cert vouches for.
        if !verify_signature(&cert_public_key, &msg_crypt.info_bytes, &msg_crypt.signature) {
            self.problem_detected_locally(
                end_reason::REMOTE_BAD_CRYPT,
                "Crypt info signature invalid",
                now,
            );
            return Err(());
        }

        if crypt.key_type != CRYPT_KEY_TYPE_CURVE25519 {
            self.problem_detected_locally(
                end_reason::REMOTE_BAD_CRYPT,
                "Unsupported DH key type",
                now,
            );
            return Err(());
        }
        let remote_kex_key = match <[u8; 32]>::try_from(crypt.key_data.as_slice()) {
            Ok(k) => k,
            Err(_) => {
                self.problem_detected_locally(
                    end_reason::REMOTE_BAD_CRYPT,
                    "Invalid DH key",
                    now,
                );
                return Err(());
            }
        };

        // Key exchange and derivation.
        let premaster = match self.kex.as_mut().and_then(|k| k.key_exchange(&remote_kex_key)) {
            Some(p) => p,
            None => {
                self.problem_detected_locally(
                    end_reason::REMOTE_BAD_CRYPT,
                    "Key exchange failed",
                    now,
                );
                return Err(());
            }
        };
        let local_info = self
            .crypt_local
            .as_ref()
            .expect("local crypto initialized above");
        let keys = derive_session_keys(
            premaster,
            &KeyDerivationContext {
                local_nonce: local_info.nonce,
                remote_nonce: crypt.nonce,
                local_conn_id: self.id_local,
                remote_conn_id: self.id_remote,
                local_cert_bytes: &self.signed_cert_local.cert_bytes,
                remote_cert_bytes: &msg_cert.cert_bytes,
                local_info_bytes: &self.signed_crypt_local.info_bytes,
                remote_info_bytes: &msg_crypt.info_bytes,
                server,
            },
        );
        self.cipher_send = Some(SessionCipher::new(&keys.send_key, &keys.send_iv));
        self.cipher_recv = Some(SessionCipher::new(&keys.recv_key, &keys.recv_iv));
        drop(keys);

        // The ephemeral secret is spent; forget the public half too.
        self.kex = None;

        self.signed_cert_remote = Some(msg_cert.clone());
        self.cert_remote = Some(cert);
        self.crypt_keys_valid = true;
        Ok(())
    }

    /// Enforce the cert's restriction families against this connection.
    fn check_cert_restrictions(
        &mut self,
        msg_cert: &SignedCertificate,
        cert: &Certificate,
        now: u64,
    ) -> Result<(), ()> {
        if !cert.app_ids.is_empty() && !cert.app_ids.contains(&self.config.app_id) {
            let debug = format!(
                "Cert is for AppID {:?} instead of {}",
                cert.app_ids, self.config.app_id
            );
            self.problem_detected_locally(end_reason::REMOTE_BAD_CERT, &debug, now);
            return Err(());
        }

        if !cert.pop_ids.is_empty() && msg_cert.has_ca_signature() {
            // Region-restricted certs: gameserver material. They must not
            // also carry an app restriction, and the peer must be an
            // anonymous gameserver account.
            if !cert.app_ids.is_empty() {
                self.problem_detected_locally(
                    end_reason::REMOTE_BAD_CERT,
                    "Cert must carry exactly one restriction family",
                    now,
                );
                return Err(());
            }
            let is_anon_gs = self
                .identity_remote
                .steam_id()
                .is_some_and(steam_id_is_anon_gameserver);
            if !is_anon_gs {
                let debug = format!(
                    "Certs restricted to relay regions are for anon gameservers only.  Not {}",
                    self.identity_remote
                );
                self.problem_detected_locally(end_reason::REMOTE_BAD_CERT, &debug, now);
                return Err(());
            }
        } else {
            if cert.app_ids.is_empty() {
                self.problem_detected_locally(
                    end_reason::REMOTE_BAD_CERT,
                    "Cert must be bound to an AppID.",
                    now,
                );
                return Err(());
            }
            let Some(cert_identity) = cert.bound_identity() else {
                self.problem_detected_locally(
                    end_reason::REMOTE_BAD_CERT,
                    "Bad cert identity",
                    now,
                );
                return Err(());
            };
            if cert_identity != self.identity_remote {
                // An unsigned localhost cert is the anonymous-logon case.
                let anonymous = cert_identity.is_localhost() && !msg_cert.has_ca_signature();
                if !anonymous {
                    let debug = format!(
                        "Cert was issued to {cert_identity}, not {}",
                        self.identity_remote
                    );
                    self.problem_detected_locally(end_reason::REMOTE_BAD_CERT, &debug, now);
                    return Err(());
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Send path
    // ------------------------------------------------------------------

    /// Queue (or, for pipes, deliver) one message. Returns its number.
    pub(crate) fn api_send_message(
        &mut self,
        payload: Vec<u8>,
        flags: u32,
        now: u64,
    ) -> Result<i64, ApiError> {
        if payload.len() > MAX_MESSAGE_SIZE {
            return Err(ApiError::InvalidParam);
        }
        match self.state {
            ConnectionState::Connecting
            | ConnectionState::FindingRoute
            | ConnectionState::Connected => {}
            ConnectionState::ClosedByPeer | ConnectionState::ProblemDetectedLocally => {
                return Err(ApiError::NoConnection)
            }
            ConnectionState::None
            | ConnectionState::FinWait
            | ConnectionState::Linger
            | ConnectionState::Dead => return Err(ApiError::InvalidState),
        }

        if let ConnectionKind::Pipe { .. } = self.kind {
            let msg_num = self.snp.assign_msg_num();
            self.stats.track_sent_packet(now);
            self.outbox.push(Effect::PipeDeliver { msg_num, payload });
            return Ok(msg_num);
        }

        let reliable = flags & send_flags::RELIABLE != 0;
        let no_nagle = flags & (send_flags::NO_NAGLE | send_flags::NO_DELAY) != 0;
        let msg_num = self.snp.submit_message(payload, reliable, no_nagle, now);
        self.ensure_min_think_time(now);
        Ok(msg_num)
    }

    pub(crate) fn api_flush(&mut self, now: u64) -> Result<(), ApiError> {
        match self.state {
            ConnectionState::Connecting
            | ConnectionState::FindingRoute
            | ConnectionState::Connected => {}
            ConnectionState::ClosedByPeer | ConnectionState::ProblemDetectedLocally => {
                return Err(ApiError::NoConnection)
            }
            _ => return Err(ApiError::InvalidState),
        }
        self.snp.flush(now);
        self.ensure_min_think_time(now);
        Ok(())
    }

    /// Encrypt one packet's frames and push the wire bytes to the outbox.
    fn encrypt_and_send_frames(&mut self, frames: &[DataFrame], now: u64) {
        let Some(cipher) = self.cipher_send.as_ref() else {
            debug_assert!(false, "sending without session keys");
            return;
        };
        let (full, wire_seq) = self.stats.consume_send_packet_number();
        let plaintext = encode_frames(frames);
        let ciphertext = cipher.encrypt(full, &plaintext);
        let mut packet = Vec::with_capacity(2 + ciphertext.len());
        packet.extend_from_slice(&wire_seq.to_le_bytes());
        packet.extend_from_slice(&ciphertext);
        self.stats.track_sent_packet(now);
        self.outbox.push(Effect::SendPacket(packet));
    }

    fn send_keepalive(&mut self, reply_requested: bool, now: u64) {
        self.encrypt_and_send_frames(
            &[DataFrame::Keepalive { reply_requested }],
            now,
        );
        if reply_requested {
            self.stats.track_sent_ping_request(now);
        }
    }

    // ------------------------------------------------------------------
    // Receive path
    // ------------------------------------------------------------------

    /// Process one encrypted wire packet. Returns the messages it completed,
    /// in order, for the owner to link into the receive queues.
    pub(crate) fn receive_packet(&mut self, packet: &[u8], now: u64) -> Vec<AssembledMessage> {
        if !self.crypt_keys_valid || self.cipher_recv.is_none() {
            return Vec::new();
        }
        if packet.len() < 2 {
            return Vec::new();
        }
        let wire_seq = u16::from_le_bytes(packet[..2].try_into().expect("length checked"));

        // Track flow even if we end up discarding this.
        let had_reply_in_flight = self.stats.in_flight_reply_timeout != 0;
        self.stats.track_recv_packet(now);

        let Some(full_seq) = self.stats.expand_wire_packet_number(wire_seq) else {
            return Vec::new();
        };
        let plaintext = match self
            .cipher_recv
            .as_ref()
            .expect("checked above")
            .decrypt(full_seq, &packet[2..])
        {
            Ok(p) => p,
            Err(_) => {
                // Tampering, spoofing, or a bug. Drop it quietly so a
                // spoofer can't amplify their efforts into a teardown.
                if now >= self.last_decrypt_warn + MILLION {
                    self.last_decrypt_warn = now;
                    warn!(
                        conn = %self.description(),
                        "packet data chunk failed to decrypt; could be tampering or a bug"
                    );
                }
                return Vec::new();
            }
        };

        // Authenticated. A huge forward lurch would desynchronize the
        // truncated wire sequence, so treat it as fatal.
        let gap = full_seq - self.stats.max_recv_packet_number();
        if gap > MAX_SEQ_NUM_GAP {
            let debug = format!(
                "Pkt number lurch by {gap}; {:04x}->{:04x}",
                self.stats.max_recv_packet_number() as u16,
                wire_seq
            );
            self.problem_detected_locally(end_reason::MISC_GENERIC, &debug, now);
            return Vec::new();
        }

        let frames = match decode_frames(&plaintext) {
            Ok(f) => f,
            Err(_) => {
                warn!(conn = %self.description(), "authenticated packet failed to parse");
                return Vec::new();
            }
        };
        self.stats.track_process_sequenced_packet(full_seq);

        if had_reply_in_flight && self.stats.last_send_expecting_reply > 0 {
            let rtt = now.saturating_sub(self.stats.last_send_expecting_reply);
            self.stats.received_ping_sample(rtt);
        }

        // First end-to-end packet completes the route search.
        if self.state == ConnectionState::FindingRoute {
            self.mark_connected(now);
        }

        let mut keepalive_reply = false;
        for frame in &frames {
            if let DataFrame::Keepalive {
                reply_requested: true,
            } = frame
            {
                keepalive_reply = true;
            }
        }
        let assembled = self.snp.recv_frames(frames);
        if keepalive_reply {
            self.send_keepalive(false, now);
        }
        self.ensure_min_think_time(now);
        assembled
    }

    // ------------------------------------------------------------------
    // Thinking
    // ------------------------------------------------------------------

    pub(crate) fn next_think_time(&self) -> u64 {
        self.next_think
    }

    pub(crate) fn set_next_think(&mut self, when: u64) {
        self.next_think = when;
        self.next_think_latest = when;
    }

    pub(crate) fn ensure_min_think_time(&mut self, when: u64) {
        if when < self.next_think {
            self.next_think = when;
        }
    }

    /// Record a deferred-work deadline with a jitter tolerance. The
    /// scheduler promises a wakeup between the earliest pending deadline
    /// and its latest-acceptable bound.
    fn update_think_window(&mut self, earliest: u64, tolerance_usec: u64) {
        if earliest < self.next_think {
            self.next_think = earliest;
        }
        let latest = earliest.saturating_add(tolerance_usec);
        if latest < self.next_think_latest {
            self.next_think_latest = latest;
        }
    }

    /// Periodic work. Computes the next think window as it goes.
    pub(crate) fn think(&mut self, now: u64) {
        self.next_think = THINK_NEVER;
        self.next_think_latest = THINK_NEVER;

        match self.state {
            ConnectionState::Dead | ConnectionState::None => {
                // The scheduler reaps Dead connections before thinking;
                // nothing to do here.
                return;
            }

            ConnectionState::FinWait => {
                let deadline = self.state_entered_at + FIN_WAIT_TIMEOUT_USEC;
                if now >= deadline {
                    self.queue_destroy(now);
                } else {
                    self.update_think_window(deadline, 10_000);
                }
                return;
            }

            ConnectionState::ProblemDetectedLocally | ConnectionState::ClosedByPeer => {
                // No data, no keepalives. Waiting on the app to close us.
                return;
            }

            ConnectionState::Connecting | ConnectionState::FindingRoute => {
                let timeout = self.state_entered_at
                    + u64::from(self.config.timeout_initial_ms) * 1000;
                if now >= timeout {
                    self.connection_timed_out(now);
                    return;
                }
                self.update_think_window(timeout, 10_000);

                match self.state {
                    ConnectionState::Connecting => {
                        // The initiating side retransmits its connect
                        // request; an accepted child just waits for the app.
                        if !self.is_server && self.has_local_crypto() {
                            let retry =
                                self.when_sent_connect_request + CONNECT_RETRY_INTERVAL_USEC;
                            if now >= retry {
                                let (cert, crypt) = self.local_handshake();
                                self.outbox.push(Effect::SendSignal(
                                    SignalBody::ConnectRequest { cert, crypt },
                                ));
                                self.when_sent_connect_request = now;
                            }
                            self.update_think_window(
                                self.when_sent_connect_request + CONNECT_RETRY_INTERVAL_USEC,
                                5_000,
                            );
                        }
                    }
                    ConnectionState::FindingRoute => {
                        // Probe end-to-end until something comes back. The
                        // first probe goes out immediately.
                        if self.transport_ok {
                            let retry = if self.when_sent_connect_request == 0 {
                                now
                            } else {
                                self.when_sent_connect_request + CONNECT_RETRY_INTERVAL_USEC
                            };
                            if now >= retry {
                                self.send_keepalive(true, now);
                                self.when_sent_connect_request = now;
                            }
                            self.update_think_window(
                                self.when_sent_connect_request + CONNECT_RETRY_INTERVAL_USEC,
                                5_000,
                            );
                        } else {
                            self.update_think_window(now + 20_000, 5_000);
                        }
                    }
                    _ => unreachable!(),
                }
                return;
            }

            ConnectionState::Linger => {
                if self.snp.queued_and_unacked_empty() {
                    // Drained. Now the peer gets its close notice.
                    self.outbox.push(Effect::SendSignal(SignalBody::ConnectionClosed {
                        reason: self.end_reason,
                        debug: self.end_debug.clone(),
                    }));
                    self.begin_fin_wait(now);
                    return;
                }
                // Still draining; fall through to connected behavior.
            }

            ConnectionState::Connected => {}
        }

        // Connected or draining Linger from here on.
        if self.transport_ok {
            // Let the segmentation layer emit what it has.
            let mut budget = 16;
            while budget > 0 {
                let Some(frames) = self.snp.produce_packet(now) else {
                    break;
                };
                self.encrypt_and_send_frames(&frames, now);
                budget -= 1;
            }
            let snp_next = self.snp.next_think_time(now);
            if snp_next != THINK_NEVER {
                self.update_think_window(snp_next.max(now + 1_000), 1_000);
            }
        } else {
            self.update_think_window(now + 20_000, 5_000);
        }

        self.stats.think(now);

        // Connection-level timeout and the keepalive ladder.
        let e2e_timeout =
            self.stats.time_last_recv + u64::from(self.config.timeout_connected_ms) * 1000;
        if now >= e2e_timeout {
            if self.stats.reply_timeouts_since_last_recv >= MAX_REPLY_TIMEOUTS
                || !self.transport_ok
            {
                self.connection_timed_out(now);
                return;
            }
            // Expired but not enough confirmed losses yet; check back soon.
            self.update_think_window(now + 100_000, 100_000);
        } else {
            self.update_think_window(e2e_timeout, 100_000);
        }

        if self.stats.reply_timeouts_since_last_recv > 0 {
            // The link looks sick; ping aggressively.
            let due = self
                .stats
                .time_last_recv
                .max(self.stats.last_send_expecting_reply)
                + AGGRESSIVE_PING_INTERVAL_USEC;
            if now >= due {
                if self.transport_ok {
                    debug!(
                        conn = %self.description(),
                        timeouts = self.stats.reply_timeouts_since_last_recv,
                        "reply timeout; sending aggressive keepalive"
                    );
                    self.send_keepalive(true, now);
                } else {
                    self.update_think_window(now + 20_000, 5_000);
                }
            } else {
                self.update_think_window(due, 20_000);
            }
        }

        if self.stats.in_flight_reply_timeout == 0 {
            let due = self.stats.time_last_recv + KEEPALIVE_INTERVAL_USEC;
            if now >= due {
                if self.transport_ok {
                    self.send_keepalive(true, now);
                } else {
                    self.update_think_window(now + 20_000, 5_000);
                }
            } else {
                self.update_think_window(due, 100_000);
            }
        } else {
            self.update_think_window(self.stats.in_flight_reply_timeout, 20_000);
        }
    }

    fn connection_timed_out(&mut self, now: u64) {
        let debug = match self.state {
            ConnectionState::Connecting | ConnectionState::FindingRoute => {
                "Timed out attempting to connect"
            }
            _ => "Connection timed out",
        };
        self.problem_detected_locally(end_reason::MISC_TIMEOUT, debug, now);
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    pub(crate) fn info(&self) -> ConnectionInfo {
        let peer_cert_signed = self
            .signed_cert_remote
            .as_ref()
            .is_some_and(SignedCertificate::has_ca_signature);
        let peer_identity_bound = self
            .cert_remote
            .as_ref()
            .and_then(Certificate::bound_identity)
            .is_some_and(|id| id == self.identity_remote);
        ConnectionInfo {
            identity_remote: self.identity_remote.clone(),
            id_remote: self.id_remote,
            state: self.api_state(),
            end_reason: self.end_reason,
            end_debug: self.end_debug.clone(),
            listen_socket: self.parent_listen_socket,
            peer_cert_signed,
            identity_authenticated: peer_cert_signed
                && peer_identity_bound
                && self.cert_has_identity,
            peer_protocol_version: self.peer_protocol_version,
        }
    }

    pub(crate) fn quick_status(&self, now: u64) -> QuickStatus {
        let quality_local = if self.stats.pkts_recv == 0 {
            -1.0
        } else {
            let seen = self.stats.pkts_recv + self.stats.pkts_dropped;
            self.stats.pkts_recv as f32 / seen as f32
        };
        let quality_remote = match self.kind {
            ConnectionKind::Pipe { .. } => 1.0,
            ConnectionKind::P2p => -1.0,
        };
        let ping_ms = match self.kind {
            ConnectionKind::Pipe { .. } => 0,
            ConnectionKind::P2p => {
                if self.stats.ping_usec < 0 {
                    -1
                } else {
                    (self.stats.ping_usec / 1000) as i32
                }
            }
        };
        QuickStatus {
            state: self.api_state(),
            ping_ms,
            quality_local,
            quality_remote,
            pkts_sent: self.stats.pkts_sent,
            pkts_recv: self.stats.pkts_recv,
            usec_since_last_recv: now.saturating_sub(self.stats.time_last_recv),
            usec_since_last_send: now.saturating_sub(self.stats.time_last_send),
            pending_send: self.snp.queued_len(),
            pending_reliable_unacked: self.snp.unacked_len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cert::{create_cert, trust_test_ca, CertParams};
    use crate::queue::MessageStore;

    fn test_identity(n: u64) -> NetIdentity {
        // Individual account in universe 1.
        NetIdentity::SteamId((1u64 << 56) | (1u64 << 52) | n)
    }

    fn new_conn(
        store: &mut MessageStore,
        id_local: u32,
        local: NetIdentity,
        remote: NetIdentity,
    ) -> Connection {
        let q = store.create_queue();
        let mut conn = Connection::new(
            ConnectionKind::P2p,
            id_local,
            local,
            remote,
            ConnectionConfig::default(),
            q,
            0,
        );
        conn.begin_connecting(0);
        conn
    }

    /// Wire two connections' handshakes together, client first.
    fn handshake_pair(client: &mut Connection, server: &mut Connection) -> Result<(), ()> {
        client.id_remote = server.id_local;
        server.id_remote = client.id_local;
        let (c_cert, c_crypt) = client.local_handshake();
        let (s_cert, s_crypt) = server.local_handshake();
        server.recv_crypto_handshake(&c_cert, &c_crypt, true, 0)?;
        client.recv_crypto_handshake(&s_cert, &s_crypt, false, 0)?;
        Ok(())
    }

    fn unsigned_pair(store: &mut MessageStore) -> (Connection, Connection) {
        let mut client = new_conn(store, 0x11112222, test_identity(1), test_identity(2));
        let mut server = new_conn(store, 0x33334444, test_identity(2), test_identity(1));
        client.init_local_crypto_unsigned();
        server.init_local_crypto_unsigned();
        (client, server)
    }

    #[test]
    fn unsigned_handshake_derives_matching_keys() {
        let mut store = MessageStore::new();
        let (mut client, mut server) = unsigned_pair(&mut store);
        handshake_pair(&mut client, &mut server).expect("handshake");
        assert!(client.crypt_keys_valid);
        assert!(server.crypt_keys_valid);

        // Packets sealed by one side open on the other.
        client.begin_finding_route(0);
        server.begin_finding_route(0);
        client.encrypt_and_send_frames(&[DataFrame::Keepalive { reply_requested: false }], 0);
        let effects = client.take_effects();
        let packet = effects
            .iter()
            .find_map(|e| match e {
                Effect::SendPacket(p) => Some(p.clone()),
                _ => None,
            })
            .expect("a packet was sent");
        let msgs = server.receive_packet(&packet, 1);
        assert!(msgs.is_empty());
        assert_eq!(server.state(), ConnectionState::Connected);
    }

    #[test]
    fn ca_signed_handshake_succeeds_and_tamper_fails() {
        let ca = Keypair::generate();
        trust_test_ca(&ca);

        let mut store = MessageStore::new();
        let mut client = new_conn(&mut store, 0x11112222, test_identity(1), test_identity(2));
        let mut server = new_conn(&mut store, 0x33334444, test_identity(2), test_identity(1));
        // Reject unsigned remotes so we know the CA path ran.
        client.config.remote_unsigned_cert = RemoteUnsignedCertPolicy::Reject;
        server.config.remote_unsigned_cert = RemoteUnsignedCertPolicy::Reject;

        let client_key = Keypair::generate();
        let server_key = Keypair::generate();
        let client_cert = create_cert(
            &CertParams {
                public_key: client_key.public_key_bytes(),
                identity: Some(test_identity(1)),
                app_ids: vec![0],
                pop_ids: vec![],
                expiry_days: 1,
            },
            &ca,
        );
        let server_cert = create_cert(
            &CertParams {
                public_key: server_key.public_key_bytes(),
                identity: Some(test_identity(2)),
                app_ids: vec![0],
                pop_ids: vec![],
                expiry_days: 1,
            },
            &ca,
        );
        client.init_local_crypto(client_cert.clone(), client_key, true);
        server.init_local_crypto(server_cert, server_key, true);

        handshake_pair(&mut client, &mut server).expect("CA-signed handshake");
        assert_eq!(server.state(), ConnectionState::Connecting);

        // With keys derived, both sides can walk to Connected.
        client.begin_finding_route(0);
        client.mark_connected(0);
        server.begin_finding_route(0);
        server.mark_connected(0);
        assert_eq!(client.state(), ConnectionState::Connected);
        let info = client.info();
        assert!(info.peer_cert_signed, "peer presented a CA-signed cert");
        assert!(info.identity_authenticated);

        // Same exchange with one byte of the client cert flipped.
        let mut store2 = MessageStore::new();
        let mut server2 = new_conn(&mut store2, 0x55556666, test_identity(2), test_identity(1));
        server2.config.remote_unsigned_cert = RemoteUnsignedCertPolicy::Reject;
        server2.init_local_crypto_unsigned();
        server2.id_remote = 0x11112222;
        let mut tampered = client_cert;
        let last = tampered.cert_bytes.len() - 1;
        tampered.cert_bytes[last] ^= 0x40;
        let (_, c_crypt) = client.local_handshake();
        assert!(server2
            .recv_crypto_handshake(&tampered, &c_crypt, true, 0)
            .is_err());
        assert_eq!(server2.state(), ConnectionState::ProblemDetectedLocally);
        assert_eq!(server2.end_reason, end_reason::REMOTE_BAD_CERT);
    }

    #[test]
    fn old_protocol_version_is_rejected_with_version_in_debug() {
        let mut store = MessageStore::new();
        let (mut client, mut server) = unsigned_pair(&mut store);
        client.id_remote = server.id_local;
        server.id_remote = client.id_local;

        let (c_cert, mut c_crypt) = client.local_handshake();
        // Re-sign a downgraded session info with the cert's key. The signing
        // key is private to the connection, so forge the whole local crypto:
        // build a fresh client whose advertised version is too old.
        let mut info: SessionCryptInfo = c_crypt.parse_info().unwrap();
        info.protocol_version = MIN_REQUIRED_PROTOCOL_VERSION - 1;
        // Signature no longer matters; version check precedes it.
        c_crypt.info_bytes = crate::wire::serialize(&info);

        assert!(server
            .recv_crypto_handshake(&c_cert, &c_crypt, true, 0)
            .is_err());
        assert_eq!(server.end_reason, end_reason::REMOTE_BAD_PROTOCOL_VERSION);
        assert!(
            server.end_debug.contains(&format!(
                "V{}",
                MIN_REQUIRED_PROTOCOL_VERSION - 1
            )),
            "debug should name the offending version: {}",
            server.end_debug
        );
    }

    #[test]
    fn identity_mismatch_is_bad_cert() {
        let mut store = MessageStore::new();
        let mut client = new_conn(&mut store, 0x11112222, test_identity(1), test_identity(2));
        // Server believes it is talking to identity 9, but the cert names 1.
        let mut server = new_conn(&mut store, 0x33334444, test_identity(2), test_identity(9));
        client.init_local_crypto_unsigned();
        server.init_local_crypto_unsigned();
        server.id_remote = client.id_local;

        let (c_cert, c_crypt) = client.local_handshake();
        assert!(server
            .recv_crypto_handshake(&c_cert, &c_crypt, true, 0)
            .is_err());
        assert_eq!(server.end_reason, end_reason::REMOTE_BAD_CERT);
    }

    #[test]
    fn connected_requires_keys_and_send_gates_follow_state() {
        let mut store = MessageStore::new();
        let (mut client, mut server) = unsigned_pair(&mut store);
        handshake_pair(&mut client, &mut server).expect("handshake");
        client.begin_finding_route(0);
        client.mark_connected(0);
        assert!(client.crypt_keys_valid, "Connected implies valid keys");

        assert!(client.api_send_message(b"ok".to_vec(), 0, 1).is_ok());

        client.api_close(1000, "done", false, 2);
        assert_eq!(client.state(), ConnectionState::FinWait);
        assert_eq!(
            client.api_send_message(b"late".to_vec(), 0, 3),
            Err(ApiError::InvalidState)
        );
        assert_eq!(client.end_reason, 1000);

        // close is idempotent; the first reason sticks.
        client.api_close(1234, "again", false, 4);
        assert_eq!(client.end_reason, 1000);
        assert_eq!(client.end_debug, "done");
    }

    #[test]
    fn oversized_message_is_invalid_param() {
        let mut store = MessageStore::new();
        let (mut client, mut server) = unsigned_pair(&mut store);
        handshake_pair(&mut client, &mut server).expect("handshake");
        client.begin_finding_route(0);
        client.mark_connected(0);
        let huge = vec![0u8; MAX_MESSAGE_SIZE + 1];
        assert_eq!(
            client.api_send_message(huge, 0, 0),
            Err(ApiError::InvalidParam)
        );
    }

    #[test]
    fn sequence_lurch_closes_with_misc_generic() {
        let mut store = MessageStore::new();
        let (mut client, mut server) = unsigned_pair(&mut store);
        handshake_pair(&mut client, &mut server).expect("handshake");
        client.begin_finding_route(0);
        client.mark_connected(0);
        server.begin_finding_route(0);
        server.mark_connected(0);

        // Jump the sender's packet number beyond the tolerated gap, staying
        // inside the signed 16-bit window so expansion still succeeds.
        for _ in 0..(MAX_SEQ_NUM_GAP + 2) {
            let _ = client.stats.consume_send_packet_number();
        }
        client.encrypt_and_send_frames(&[DataFrame::Keepalive { reply_requested: false }], 0);
        let packet = client
            .take_effects()
            .into_iter()
            .find_map(|e| match e {
                Effect::SendPacket(p) => Some(p),
                _ => None,
            })
            .expect("packet");
        let msgs = server.receive_packet(&packet, 1);
        assert!(msgs.is_empty());
        assert_eq!(server.state(), ConnectionState::ProblemDetectedLocally);
        assert_eq!(server.end_reason, end_reason::MISC_GENERIC);
        assert!(server.end_debug.contains("lurch"));
    }

    #[test]
    fn fin_wait_self_destructs_after_grace() {
        let mut store = MessageStore::new();
        let (mut client, mut server) = unsigned_pair(&mut store);
        handshake_pair(&mut client, &mut server).expect("handshake");
        client.begin_finding_route(0);
        client.mark_connected(0);
        client.api_close(0, "", false, 100);
        assert_eq!(client.state(), ConnectionState::FinWait);

        client.think(100 + FIN_WAIT_TIMEOUT_USEC - 1);
        assert_eq!(client.state(), ConnectionState::FinWait);
        client.think(100 + FIN_WAIT_TIMEOUT_USEC);
        assert_eq!(client.state(), ConnectionState::Dead);
    }

    #[test]
    fn initial_timeout_reports_misc_timeout() {
        let mut store = MessageStore::new();
        let mut conn = new_conn(&mut store, 0x11112222, test_identity(1), test_identity(2));
        conn.init_local_crypto_unsigned();
        let timeout = u64::from(conn.config.timeout_initial_ms) * 1000;
        conn.think(timeout);
        assert_eq!(conn.state(), ConnectionState::ProblemDetectedLocally);
        assert_eq!(conn.end_reason, end_reason::MISC_TIMEOUT);
    }

    #[test]
    fn linger_drains_then_fin_waits() {
        let mut store = MessageStore::new();
        let (mut client, mut server) = unsigned_pair(&mut store);
        handshake_pair(&mut client, &mut server).expect("handshake");
        client.begin_finding_route(0);
        client.mark_connected(0);
        server.begin_finding_route(0);
        server.mark_connected(0);

        let n = client
            .api_send_message(b"x".to_vec(), send_flags::RELIABLE | send_flags::NO_NAGLE, 0)
            .expect("queued");
        client.api_close(1000, "bye", true, 10);
        assert_eq!(client.state(), ConnectionState::Linger);

        // Draining: the message goes out but stays unacked.
        client.think(20);
        assert_eq!(client.state(), ConnectionState::Linger);
        assert_eq!(client.snp.unacked_len(), 1);

        // Ack arrives; the next think finishes the close.
        client.snp.recv_frames(vec![DataFrame::Ack { msg_num: n }]);
        client.think(30);
        assert_eq!(client.state(), ConnectionState::FinWait);
    }

    #[test]
    fn spam_reply_gate_allows_at_most_one_per_window() {
        let base = 77_000_000_000_000u64; // far from anything else in the process
        let mut allowed = 0;
        for i in 0..10 {
            if check_global_spam_reply_rate_limit(base + i * 1_000) {
                allowed += 1;
            }
        }
        assert!(allowed <= 1, "gate must not open twice within 250ms");
        assert!(check_global_spam_reply_rate_limit(base + 250_000));
    }

    #[test]
    fn decrypt_failure_drops_packet_without_closing() {
        let mut store = MessageStore::new();
        let (mut client, mut server) = unsigned_pair(&mut store);
        handshake_pair(&mut client, &mut server).expect("handshake");
        server.begin_finding_route(0);
        server.mark_connected(0);

        // A random packet with a plausible header.
        let mut junk = vec![1u8, 0];
        junk.extend_from_slice(&[0xAB; 40]);
        let msgs = server.receive_packet(&junk, 5);
        assert!(msgs.is_empty());
        assert_eq!(server.state(), ConnectionState::Connected);
    }
}

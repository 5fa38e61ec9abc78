//! # The Sockets Facade and Its Scheduler Task
//!
//! A [`Sockets`] instance is a cloneable handle to one scheduler task that
//! owns every connection, listen socket, and received message created
//! through it. Public API calls enqueue a command and await a oneshot
//! reply; inbound transport traffic enqueues fire-and-forget deliveries.
//! The task interleaves command handling with "thinking": each connection
//! names the next time it wants to run, and the task sleeps until the
//! earliest such deadline.
//!
//! ```text
//! app / transport          scheduler task
//!      │  Command  ┌──────────────────────────┐
//!      ├──────────►│ connections: handle → C  │
//!      │           │ listen sockets, queues   │
//!      ◄───────────┤ retired-ID FIFO          │
//!        oneshot   │ think timer (earliest)   │
//!                  └──────────────────────────┘
//! ```
//!
//! Everything mutable lives on that one task, which is what makes the
//! connection state machine single-threaded by construction.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, OnceLock};

use rand::rngs::OsRng;
use rand::RngCore;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cert::SignedCertificate;
use crate::connection::{
    check_global_spam_reply_rate_limit, end_reason, ApiError, Connection, ConnectionConfig,
    ConnectionInfo, ConnectionKind, ConnectionState, Effect, QuickStatus,
    RemoteUnsignedCertPolicy, THINK_NEVER,
};
use crate::identity::{Keypair, NetIdentity};
use crate::pipe::establish_pipe_pair;
use crate::queue::{MessageStore, QueueLink, ReceivedMessage};
use crate::snp::AssembledMessage;
use crate::socket::ListenSocket;
use crate::wire::{SignalBody, SignalFrame};

/// Registry capacity: the low 16 bits of a connection ID are the handle, so
/// we keep the table comfortably below that space.
const MAX_CONNECTIONS: usize = 0x1FFF;

/// Retired low-16 handle halves remembered to avoid prompt reuse.
const MAX_RETIRED_CONNECTION_IDS: usize = 256;

/// A connection handle: the low 16 bits of the connection's local ID.
pub type ConnHandle = u16;

/// A listen-socket handle.
pub type ListenHandle = u32;

// ============================================================================
// Clock
// ============================================================================

/// All scheduler tasks in the process share one epoch so that process-wide
/// state (the spam-reply gate) sees one timeline.
static PROCESS_EPOCH: OnceLock<Instant> = OnceLock::new();

fn now_usec() -> u64 {
    PROCESS_EPOCH.get_or_init(Instant::now).elapsed().as_micros() as u64
}

fn instant_for(usec: u64) -> Instant {
    *PROCESS_EPOCH.get_or_init(Instant::now) + std::time::Duration::from_micros(usec)
}

// ============================================================================
// Transport seam
// ============================================================================

/// How frames leave this process. Signaling carries handshake records and
/// close notices; packets carry the encrypted data stream. Implementations
/// must not block: queue and return.
pub trait Transport: Send + Sync {
    /// Deliver a signaling frame toward `frame.to_identity`.
    fn send_signal(&self, frame: SignalFrame);

    /// Deliver an encrypted packet to the peer connection `remote_cid` at
    /// `to`.
    fn send_packet(&self, to: &NetIdentity, remote_cid: u32, packet: Vec<u8>);

    /// Whether data packets can move right now (route known, socket up).
    fn can_send_packets(&self) -> bool {
        true
    }
}

// ============================================================================
// Configuration and events
// ============================================================================

/// Construction parameters for a [`Sockets`] instance.
pub struct SocketsConfig {
    /// Who we are. Certificates must bind to this to authenticate us.
    pub identity: NetIdentity,
    /// Application ID our peers' certs must be issued for.
    pub app_id: u32,
    /// Identity signing key; required to present `signed_cert`.
    pub keypair: Option<Keypair>,
    /// CA-issued certificate for `identity`, if provisioned.
    pub signed_cert: Option<SignedCertificate>,
    /// Defaults applied to every connection.
    pub connection: ConnectionConfig,
    /// Outbound path for signaling and packets. `None` supports
    /// loopback-only instances.
    pub transport: Option<Arc<dyn Transport>>,
}

impl Default for SocketsConfig {
    fn default() -> Self {
        Self {
            identity: NetIdentity::LocalHost,
            app_id: 0,
            keypair: None,
            signed_cert: None,
            connection: ConnectionConfig::default(),
            transport: None,
        }
    }
}

/// Emitted whenever a connection's API-visible state changes, in the order
/// the transitions occurred.
#[derive(Clone, Debug)]
pub struct StatusChangedEvent {
    pub conn: ConnHandle,
    pub old_state: ConnectionState,
    pub info: ConnectionInfo,
}

// ============================================================================
// Commands
// ============================================================================

enum Command {
    CreateListenSocket {
        virtual_port: u32,
        config: Option<ConnectionConfig>,
        reply: oneshot::Sender<Result<ListenHandle, ApiError>>,
    },
    CloseListenSocket {
        listen: ListenHandle,
        reply: oneshot::Sender<Result<(), ApiError>>,
    },
    Connect {
        identity: NetIdentity,
        virtual_port: u32,
        config: Option<ConnectionConfig>,
        reply: oneshot::Sender<Result<ConnHandle, ApiError>>,
    },
    CreateLoopbackPair {
        reply: oneshot::Sender<Result<(ConnHandle, ConnHandle), ApiError>>,
    },
    Accept {
        conn: ConnHandle,
        reply: oneshot::Sender<Result<(), ApiError>>,
    },
    Send {
        conn: ConnHandle,
        payload: Vec<u8>,
        flags: u32,
        reply: oneshot::Sender<Result<i64, ApiError>>,
    },
    Flush {
        conn: ConnHandle,
        reply: oneshot::Sender<Result<(), ApiError>>,
    },
    Recv {
        conn: ConnHandle,
        max: usize,
        reply: oneshot::Sender<Result<Vec<ReceivedMessage>, ApiError>>,
    },
    RecvOnListenSocket {
        listen: ListenHandle,
        max: usize,
        reply: oneshot::Sender<Result<Vec<ReceivedMessage>, ApiError>>,
    },
    Close {
        conn: ConnHandle,
        reason: u32,
        debug: String,
        linger: bool,
        reply: oneshot::Sender<Result<(), ApiError>>,
    },
    Info {
        conn: ConnHandle,
        reply: oneshot::Sender<Result<ConnectionInfo, ApiError>>,
    },
    QuickStatus {
        conn: ConnHandle,
        reply: oneshot::Sender<Result<QuickStatus, ApiError>>,
    },
    TakeStatusEvents {
        reply: oneshot::Sender<Option<mpsc::UnboundedReceiver<StatusChangedEvent>>>,
    },
    DeliverSignal {
        frame: SignalFrame,
    },
    DeliverPacket {
        from: NetIdentity,
        to_cid: u32,
        packet: Vec<u8>,
    },
}

// ============================================================================
// Public handle
// ============================================================================

/// Cloneable handle to one scheduler task. Dropping every clone shuts the
/// task down and releases everything it owns.
#[derive(Clone)]
pub struct Sockets {
    tx: mpsc::UnboundedSender<Command>,
}

impl Sockets {
    /// Spawn the scheduler task. Requires a tokio runtime.
    pub fn new(config: SocketsConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let actor = SocketsActor::new(config);
        tokio::spawn(actor.run(rx));
        Self { tx }
    }

    async fn call<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<T, ApiError>>) -> Command,
    ) -> Result<T, ApiError> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(make(reply)).map_err(|_| ApiError::NoConnection)?;
        rx.await.unwrap_or(Err(ApiError::NoConnection))
    }

    /// Open a listen socket on a local virtual port.
    pub async fn create_listen_socket(
        &self,
        virtual_port: u32,
        config: Option<ConnectionConfig>,
    ) -> Result<ListenHandle, ApiError> {
        self.call(|reply| Command::CreateListenSocket {
            virtual_port,
            config,
            reply,
        })
        .await
    }

    /// Destroy a listen socket and every connection accepted through it.
    pub async fn close_listen_socket(&self, listen: ListenHandle) -> Result<(), ApiError> {
        self.call(|reply| Command::CloseListenSocket { listen, reply })
            .await
    }

    /// Begin connecting to `identity` on its virtual port.
    pub async fn connect(
        &self,
        identity: NetIdentity,
        virtual_port: u32,
        config: Option<ConnectionConfig>,
    ) -> Result<ConnHandle, ApiError> {
        self.call(|reply| Command::Connect {
            identity,
            virtual_port,
            config,
            reply,
        })
        .await
    }

    /// Create two connected loopback endpoints in this process.
    pub async fn create_loopback_pair(&self) -> Result<(ConnHandle, ConnHandle), ApiError> {
        self.call(|reply| Command::CreateLoopbackPair { reply }).await
    }

    /// Accept an incoming connection that arrived on a listen socket.
    pub async fn accept(&self, conn: ConnHandle) -> Result<(), ApiError> {
        self.call(|reply| Command::Accept { conn, reply }).await
    }

    /// Queue one message. See [`crate::wire::send_flags`] for `flags`.
    pub async fn send(
        &self,
        conn: ConnHandle,
        payload: Vec<u8>,
        flags: u32,
    ) -> Result<i64, ApiError> {
        self.call(|reply| Command::Send {
            conn,
            payload,
            flags,
            reply,
        })
        .await
    }

    /// Push any nagle-delayed messages onto the wire.
    pub async fn flush(&self, conn: ConnHandle) -> Result<(), ApiError> {
        self.call(|reply| Command::Flush { conn, reply }).await
    }

    /// Drain up to `max` received messages from one connection.
    pub async fn recv(
        &self,
        conn: ConnHandle,
        max: usize,
    ) -> Result<Vec<ReceivedMessage>, ApiError> {
        self.call(|reply| Command::Recv { conn, max, reply }).await
    }

    /// Drain up to `max` received messages across all of a listen socket's
    /// children.
    pub async fn recv_on_listen_socket(
        &self,
        listen: ListenHandle,
        max: usize,
    ) -> Result<Vec<ReceivedMessage>, ApiError> {
        self.call(|reply| Command::RecvOnListenSocket { listen, max, reply })
            .await
    }

    /// Close a connection. With `linger`, queued reliable sends drain
    /// first. Idempotent; the first close latches the end reason.
    pub async fn close(
        &self,
        conn: ConnHandle,
        reason: u32,
        debug: &str,
        linger: bool,
    ) -> Result<(), ApiError> {
        let debug = debug.to_string();
        self.call(|reply| Command::Close {
            conn,
            reason,
            debug,
            linger,
            reply,
        })
        .await
    }

    pub async fn info(&self, conn: ConnHandle) -> Result<ConnectionInfo, ApiError> {
        self.call(|reply| Command::Info { conn, reply }).await
    }

    pub async fn quick_status(&self, conn: ConnHandle) -> Result<QuickStatus, ApiError> {
        self.call(|reply| Command::QuickStatus { conn, reply }).await
    }

    /// Take the status-change event receiver. Yields `Some` exactly once.
    pub async fn take_status_events(
        &self,
    ) -> Option<mpsc::UnboundedReceiver<StatusChangedEvent>> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(Command::TakeStatusEvents { reply }).ok()?;
        rx.await.ok().flatten()
    }

    /// Inbound signaling from the transport. Fire-and-forget.
    pub fn deliver_signal(&self, frame: SignalFrame) {
        let _ = self.tx.send(Command::DeliverSignal { frame });
    }

    /// Inbound encrypted packet from the transport. `to_cid` is the full
    /// 32-bit local connection ID named by the sender.
    pub fn deliver_packet(&self, from: NetIdentity, to_cid: u32, packet: Vec<u8>) {
        let _ = self.tx.send(Command::DeliverPacket {
            from,
            to_cid,
            packet,
        });
    }
}

// ============================================================================
// The scheduler task
// ============================================================================

struct SocketsActor {
    identity: NetIdentity,
    app_id: u32,
    keypair: Option<Keypair>,
    signed_cert: Option<SignedCertificate>,
    cert_has_identity: bool,
    default_config: ConnectionConfig,
    transport: Option<Arc<dyn Transport>>,

    connections: HashMap<ConnHandle, Connection>,
    retired_ids: VecDeque<u16>,
    listen_sockets: HashMap<ListenHandle, ListenSocket>,
    next_listen_handle: ListenHandle,
    store: MessageStore,

    status_tx: mpsc::UnboundedSender<StatusChangedEvent>,
    status_rx: Option<mpsc::UnboundedReceiver<StatusChangedEvent>>,
}

impl SocketsActor {
    fn new(config: SocketsConfig) -> Self {
        let cert_has_identity = match (&config.signed_cert, &config.identity) {
            (Some(cert), identity) => cert
                .parse_cert()
                .ok()
                .and_then(|c| c.bound_identity())
                .is_some_and(|bound| bound == *identity),
            _ => false,
        };
        let mut default_config = config.connection;
        default_config.app_id = config.app_id;
        let (status_tx, status_rx) = mpsc::unbounded_channel();
        Self {
            identity: config.identity,
            app_id: config.app_id,
            keypair: config.keypair,
            signed_cert: config.signed_cert,
            cert_has_identity,
            default_config,
            transport: config.transport,
            connections: HashMap::new(),
            retired_ids: VecDeque::new(),
            listen_sockets: HashMap::new(),
            next_listen_handle: 1,
            store: MessageStore::new(),
            status_tx,
            status_rx: Some(status_rx),
        }
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        info!(identity = %self.identity, "sockets scheduler running");
        loop {
            let now = now_usec();
            self.reap_dead_connections(now);

            // When nothing wants to think, park on a long idle tick; the
            // command channel wakes us for real work either way.
            let deadline = self
                .earliest_think_time()
                .min(now.saturating_add(3_600_000_000));
            tokio::select! {
                cmd = rx.recv() => {
                    match cmd {
                        Some(cmd) => {
                            let now = now_usec();
                            self.handle_command(cmd, now);
                        }
                        // Every handle dropped: tear down.
                        None => break,
                    }
                }
                _ = tokio::time::sleep_until(instant_for(deadline)) => {
                    let now = now_usec();
                    self.run_thinks(now);
                }
            }
        }
        debug!(identity = %self.identity, "sockets scheduler stopped");
    }

    // ------------------------------------------------------------------
    // Scheduling
    // ------------------------------------------------------------------

    fn earliest_think_time(&self) -> u64 {
        self.connections
            .values()
            .map(Connection::next_think_time)
            .min()
            .unwrap_or(THINK_NEVER)
    }

    fn run_thinks(&mut self, now: u64) {
        let transport_ok = self.transport.as_ref().map_or(true, |t| t.can_send_packets());
        let due: Vec<ConnHandle> = self
            .connections
            .iter()
            .filter(|(_, c)| c.next_think_time() <= now)
            .map(|(&h, _)| h)
            .collect();
        for handle in due {
            if let Some(conn) = self.connections.get_mut(&handle) {
                if let ConnectionKind::P2p = conn.kind {
                    conn.transport_ok = transport_ok;
                }
                conn.think(now);
            }
            self.drain_effects(handle, now);
        }
        self.reap_dead_connections(now);
    }

    /// Delete connections that entered `Dead`. Deferred to scheduler visits
    /// so nothing frees a connection out from under its own method.
    fn reap_dead_connections(&mut self, _now: u64) {
        let dead: Vec<ConnHandle> = self
            .connections
            .iter()
            .filter(|(_, c)| c.state() == ConnectionState::Dead)
            .map(|(&h, _)| h)
            .collect();
        for handle in dead {
            self.destroy_connection(handle);
        }
    }

    fn destroy_connection(&mut self, handle: ConnHandle) {
        let Some(mut conn) = self.connections.remove(&handle) else {
            return;
        };
        debug!(conn = %conn.description(), "destroying connection");

        // Detach from the parent listen socket: back-pointer first, then
        // the map entry.
        if let Some(ls_handle) = conn.parent_listen_socket.take() {
            if let Some(ls) = self.listen_sockets.get_mut(&ls_handle) {
                ls.remove_child(&conn.identity_remote, conn.id_remote);
            }
        }

        self.store.purge(conn.recv_queue, QueueLink::Connection);
        self.store.destroy_queue(conn.recv_queue);

        // Remember the handle so it isn't reused in the near future.
        while self.retired_ids.len() >= MAX_RETIRED_CONNECTION_IDS {
            self.retired_ids.pop_front();
        }
        self.retired_ids.push_back(conn.id_local as u16);
    }

    // ------------------------------------------------------------------
    // Connection-ID allocation
    // ------------------------------------------------------------------

    fn allocate_connection_id(&self) -> Result<u32, ApiError> {
        if self.connections.len() >= MAX_CONNECTIONS {
            warn!("too many connections");
            return Err(ApiError::LimitExceeded);
        }
        let mut tries = 0;
        loop {
            tries += 1;
            if tries > 10_000 {
                // Misc_InternalError territory; the ID space is wedged.
                warn!("unable to find unique connection ID");
                return Err(ApiError::LimitExceeded);
            }
            let id = OsRng.next_u32();
            if id & 0xFFFF == 0 || id & 0xFFFF_0000 == 0 {
                continue;
            }
            let low = id as u16;
            if self.retired_ids.contains(&low) {
                continue;
            }
            if self.connections.contains_key(&low) {
                continue;
            }
            return Ok(id);
        }
    }

    fn new_connection(
        &mut self,
        kind: ConnectionKind,
        identity_remote: NetIdentity,
        config: ConnectionConfig,
        now: u64,
    ) -> Result<ConnHandle, ApiError> {
        let id = self.allocate_connection_id()?;
        let queue = self.store.create_queue();
        let mut conn = Connection::new(
            kind,
            id,
            self.identity.clone(),
            identity_remote,
            config,
            queue,
            now,
        );
        conn.begin_connecting(now);
        let handle = id as u16;
        self.connections.insert(handle, conn);
        Ok(handle)
    }

    // ------------------------------------------------------------------
    // Command handling
    // ------------------------------------------------------------------

    fn handle_command(&mut self, cmd: Command, now: u64) {
        match cmd {
            Command::CreateListenSocket {
                virtual_port,
                config,
                reply,
            } => {
                let _ = reply.send(self.create_listen_socket(virtual_port, config));
            }
            Command::CloseListenSocket { listen, reply } => {
                let _ = reply.send(self.close_listen_socket(listen, now));
            }
            Command::Connect {
                identity,
                virtual_port,
                config,
                reply,
            } => {
                let _ = reply.send(self.start_connect(identity, virtual_port, config, now));
            }
            Command::CreateLoopbackPair { reply } => {
                let _ = reply.send(self.create_loopback_pair(now));
            }
            Command::Accept { conn, reply } => {
                let _ = reply.send(self.accept_connection(conn, now));
            }
            Command::Send {
                conn,
                payload,
                flags,
                reply,
            } => {
                let result = match self.connections.get_mut(&conn) {
                    Some(c) => c.api_send_message(payload, flags, now),
                    None => Err(ApiError::NoConnection),
                };
                self.drain_effects(conn, now);
                let _ = reply.send(result);
            }
            Command::Flush { conn, reply } => {
                let result = match self.connections.get_mut(&conn) {
                    Some(c) => c.api_flush(now),
                    None => Err(ApiError::NoConnection),
                };
                let _ = reply.send(result);
            }
            Command::Recv { conn, max, reply } => {
                let result = match self.connections.get(&conn) {
                    Some(c) => Ok(self.store.remove_up_to(c.recv_queue, max)),
                    None => Err(ApiError::NoConnection),
                };
                let _ = reply.send(result);
            }
            Command::RecvOnListenSocket { listen, max, reply } => {
                let result = match self.listen_sockets.get(&listen) {
                    Some(ls) => Ok(self.store.remove_up_to(ls.recv_queue, max)),
                    None => Err(ApiError::NoConnection),
                };
                let _ = reply.send(result);
            }
            Command::Close {
                conn,
                reason,
                debug,
                linger,
                reply,
            } => {
                let result = match self.connections.get_mut(&conn) {
                    Some(c) => {
                        c.api_close(reason, &debug, linger, now);
                        Ok(())
                    }
                    None => Err(ApiError::NoConnection),
                };
                self.drain_effects(conn, now);
                let _ = reply.send(result);
            }
            Command::Info { conn, reply } => {
                let result = self
                    .connections
                    .get(&conn)
                    .map(Connection::info)
                    .ok_or(ApiError::NoConnection);
                let _ = reply.send(result);
            }
            Command::QuickStatus { conn, reply } => {
                let result = self
                    .connections
                    .get(&conn)
                    .map(|c| c.quick_status(now))
                    .ok_or(ApiError::NoConnection);
                let _ = reply.send(result);
            }
            Command::TakeStatusEvents { reply } => {
                let _ = reply.send(self.status_rx.take());
            }
            Command::DeliverSignal { frame } => {
                self.handle_signal(frame, now);
            }
            Command::DeliverPacket {
                from,
                to_cid,
                packet,
            } => {
                self.handle_packet(from, to_cid, packet, now);
            }
        }
    }

    fn create_listen_socket(
        &mut self,
        virtual_port: u32,
        config: Option<ConnectionConfig>,
    ) -> Result<ListenHandle, ApiError> {
        if self
            .listen_sockets
            .values()
            .any(|ls| ls.virtual_port == virtual_port)
        {
            return Err(ApiError::InvalidParam);
        }
        let handle = self.next_listen_handle;
        self.next_listen_handle += 1;
        let queue = self.store.create_queue();
        let config = config.unwrap_or_else(|| self.default_config.clone());
        self.listen_sockets
            .insert(handle, ListenSocket::new(handle, virtual_port, config, queue));
        debug!(virtual_port, handle, "listen socket created");
        Ok(handle)
    }

    fn close_listen_socket(
        &mut self,
        listen: ListenHandle,
        now: u64,
    ) -> Result<(), ApiError> {
        let Some(ls) = self.listen_sockets.get(&listen) else {
            return Err(ApiError::NoConnection);
        };
        debug!(listen, children = ls.child_count(), "destroying listen socket");
        // Children go first.
        for child in ls.child_handles() {
            if let Some(conn) = self.connections.get_mut(&child) {
                conn.parent_listen_socket = None;
                conn.queue_destroy(now);
            }
            self.drain_effects(child, now);
        }
        self.reap_dead_connections(now);
        let ls = self
            .listen_sockets
            .remove(&listen)
            .expect("checked above");
        self.store.purge(ls.recv_queue, QueueLink::ListenSocket);
        self.store.destroy_queue(ls.recv_queue);
        Ok(())
    }

    fn start_connect(
        &mut self,
        identity: NetIdentity,
        virtual_port: u32,
        config: Option<ConnectionConfig>,
        now: u64,
    ) -> Result<ConnHandle, ApiError> {
        if identity.is_invalid() {
            return Err(ApiError::InvalidParam);
        }
        let config = config.unwrap_or_else(|| self.default_config.clone());
        let handle = self.new_connection(ConnectionKind::P2p, identity, config, now)?;

        let conn = self.connections.get_mut(&handle).expect("just inserted");
        conn.virtual_port_remote = virtual_port;
        match (&self.signed_cert, &self.keypair) {
            (Some(cert), Some(key)) => {
                conn.init_local_crypto(cert.clone(), key.clone(), self.cert_has_identity);
            }
            _ => conn.init_local_crypto_unsigned(),
        }
        let (cert, crypt) = conn.local_handshake();
        conn.when_sent_connect_request = now;
        conn.ensure_min_think_time(now + crate::connection::CONNECT_RETRY_INTERVAL_USEC);
        self.send_signal_from(handle, SignalBody::ConnectRequest { cert, crypt });
        self.drain_effects(handle, now);
        Ok(handle)
    }

    fn create_loopback_pair(&mut self, now: u64) -> Result<(ConnHandle, ConnHandle), ApiError> {
        let mut config = self.default_config.clone();
        config.remote_unsigned_cert = RemoteUnsignedCertPolicy::Allow;

        let a = self.new_connection(
            ConnectionKind::Pipe { partner: 0 },
            NetIdentity::LocalHost,
            config.clone(),
            now,
        )?;
        let b = match self.new_connection(
            ConnectionKind::Pipe { partner: 0 },
            NetIdentity::LocalHost,
            config,
            now,
        ) {
            Ok(b) => b,
            Err(e) => {
                if let Some(conn) = self.connections.get_mut(&a) {
                    conn.queue_destroy(now);
                }
                self.reap_dead_connections(now);
                return Err(e);
            }
        };

        // Cross-wire the halves, then run the real handshake. One half is
        // taken out of the table so both can be borrowed mutably.
        let (a_id, b_id) = (
            self.connections[&a].id_local,
            self.connections[&b].id_local,
        );
        let mut conn_b = self.connections.remove(&b).expect("just inserted");
        let conn_a = self.connections.get_mut(&a).expect("just inserted");
        conn_a.kind = ConnectionKind::Pipe { partner: b_id };
        conn_b.kind = ConnectionKind::Pipe { partner: a_id };
        conn_a.id_remote = b_id;
        conn_b.id_remote = a_id;
        // Loopback endpoints are the unauthenticated local identity no
        // matter who this instance is.
        conn_a.identity_local = NetIdentity::LocalHost;
        conn_b.identity_local = NetIdentity::LocalHost;

        let established = establish_pipe_pair(conn_a, &mut conn_b, now);
        self.connections.insert(b, conn_b);
        if established.is_err() {
            for h in [a, b] {
                if let Some(conn) = self.connections.get_mut(&h) {
                    conn.queue_destroy(now);
                }
                self.drain_effects(h, now);
            }
            self.reap_dead_connections(now);
            return Err(ApiError::LimitExceeded);
        }
        self.drain_effects(a, now);
        self.drain_effects(b, now);
        info!(a, b, "loopback pair established");
        Ok((a, b))
    }

    fn accept_connection(&mut self, handle: ConnHandle, now: u64) -> Result<(), ApiError> {
        let Some(conn) = self.connections.get_mut(&handle) else {
            return Err(ApiError::NoConnection);
        };
        if conn.state() != ConnectionState::Connecting {
            return Err(ApiError::InvalidState);
        }
        let Some((cert, crypt)) = conn.pending_remote_handshake.take() else {
            // Not an inbound connection (or accepted twice).
            return Err(ApiError::InvalidState);
        };

        match (&self.signed_cert, &self.keypair) {
            (Some(local_cert), Some(key)) => {
                conn.init_local_crypto(local_cert.clone(), key.clone(), self.cert_has_identity);
            }
            _ => conn.init_local_crypto_unsigned(),
        }

        let accepted = conn.recv_crypto_handshake(&cert, &crypt, true, now);
        if accepted.is_ok() {
            let (cert, crypt) = {
                let conn = self.connections.get_mut(&handle).expect("still present");
                conn.begin_finding_route(now);
                conn.local_handshake()
            };
            self.send_signal_from(handle, SignalBody::ConnectOk { cert, crypt });
        }
        self.drain_effects(handle, now);
        accepted.map_err(|_| ApiError::InvalidState)
    }

    // ------------------------------------------------------------------
    // Inbound traffic
    // ------------------------------------------------------------------

    fn handle_signal(&mut self, frame: SignalFrame, now: u64) {
        match frame.body.clone() {
            SignalBody::ConnectRequest { cert, crypt } => {
                self.handle_connect_request(frame, cert, crypt, now);
            }
            SignalBody::ConnectOk { cert, crypt } => {
                let Some(handle) = self.lookup_by_cid(frame.to_conn_id) else {
                    return;
                };
                let conn = self.connections.get_mut(&handle).expect("looked up");
                if conn.state() != ConnectionState::Connecting {
                    return;
                }
                conn.id_remote = frame.from_conn_id;
                if conn.recv_crypto_handshake(&cert, &crypt, false, now).is_ok() {
                    conn.begin_finding_route(now);
                }
                self.drain_effects(handle, now);
                self.run_thinks(now);
            }
            SignalBody::ConnectionClosed { reason, debug } => {
                let Some(handle) = self.lookup_by_cid(frame.to_conn_id) else {
                    // Nothing to close. A reply here would let a spoofer use
                    // us as an amplifier, so it rides the global gate; with
                    // nothing useful to say, we just stay quiet.
                    let _ = check_global_spam_reply_rate_limit(now);
                    return;
                };
                let conn = self.connections.get_mut(&handle).expect("looked up");
                if conn.state() != ConnectionState::None {
                    conn.closed_by_peer(reason, &debug, now);
                }
                self.drain_effects(handle, now);
            }
        }
    }

    fn handle_connect_request(
        &mut self,
        frame: SignalFrame,
        cert: SignedCertificate,
        crypt: crate::crypto::SignedCryptInfo,
        now: u64,
    ) {
        let Some(listen_handle) = self
            .listen_sockets
            .values()
            .find(|ls| ls.virtual_port == frame.to_virtual_port)
            .map(|ls| ls.handle)
        else {
            // Unauthenticated sender; any reply must pass the spam gate.
            if check_global_spam_reply_rate_limit(now) {
                if let Some(transport) = &self.transport {
                    transport.send_signal(SignalFrame {
                        from_identity: self.identity.clone(),
                        to_identity: frame.from_identity.clone(),
                        from_conn_id: 0,
                        to_conn_id: frame.from_conn_id,
                        to_virtual_port: 0,
                        body: SignalBody::ConnectionClosed {
                            reason: end_reason::MISC_GENERIC,
                            debug: "No listen socket on that virtual port".into(),
                        },
                    });
                }
            }
            return;
        };

        // Retransmitted request for an existing child?
        let existing = self
            .listen_sockets
            .get(&listen_handle)
            .and_then(|ls| ls.find_child(&frame.from_identity, frame.from_conn_id));
        if let Some(child) = existing {
            let resend = self
                .connections
                .get(&child)
                .filter(|c| {
                    matches!(
                        c.state(),
                        ConnectionState::FindingRoute | ConnectionState::Connected
                    )
                })
                .map(|c| c.local_handshake());
            if let Some((cert, crypt)) = resend {
                self.send_signal_from(child, SignalBody::ConnectOk { cert, crypt });
            }
            return;
        }

        let config = self.listen_sockets[&listen_handle].config.clone();
        let handle = match self.new_connection(
            ConnectionKind::P2p,
            frame.from_identity.clone(),
            config,
            now,
        ) {
            Ok(h) => h,
            Err(_) => {
                warn!("dropping connect request: connection table full");
                return;
            }
        };
        {
            let conn = self.connections.get_mut(&handle).expect("just inserted");
            conn.id_remote = frame.from_conn_id;
            conn.parent_listen_socket = Some(listen_handle);
            conn.pending_remote_handshake = Some((cert, crypt));
            // Nothing to do until the app accepts or the timeout fires.
        }
        self.listen_sockets
            .get_mut(&listen_handle)
            .expect("present")
            .insert_child(frame.from_identity, frame.from_conn_id, handle);
        debug!(
            conn = handle,
            listen = listen_handle,
            "incoming connection awaiting accept"
        );
        self.drain_effects(handle, now);
    }

    fn handle_packet(&mut self, from: NetIdentity, to_cid: u32, packet: Vec<u8>, now: u64) {
        let Some(handle) = self.lookup_by_cid(to_cid) else {
            // Unknown connection. Anything we send back is a reply to an
            // unauthenticated packet: consult the gate.
            if check_global_spam_reply_rate_limit(now) {
                if let Some(transport) = &self.transport {
                    transport.send_signal(SignalFrame {
                        from_identity: self.identity.clone(),
                        to_identity: from,
                        from_conn_id: 0,
                        to_conn_id: 0,
                        to_virtual_port: 0,
                        body: SignalBody::ConnectionClosed {
                            reason: end_reason::MISC_GENERIC,
                            debug: "No connection".into(),
                        },
                    });
                }
            }
            return;
        };
        let conn = self.connections.get_mut(&handle).expect("looked up");
        let messages = conn.receive_packet(&packet, now);
        self.deliver_messages(handle, messages, now);
        self.drain_effects(handle, now);
    }

    fn lookup_by_cid(&self, cid: u32) -> Option<ConnHandle> {
        let handle = cid as u16;
        let conn = self.connections.get(&handle)?;
        // The low half routes; the full value must match to foil guessing.
        if conn.id_local != cid {
            return None;
        }
        Some(handle)
    }

    // ------------------------------------------------------------------
    // Effects
    // ------------------------------------------------------------------

    fn drain_effects(&mut self, handle: ConnHandle, now: u64) {
        let Some(conn) = self.connections.get_mut(&handle) else {
            return;
        };
        let effects = conn.take_effects();
        for effect in effects {
            match effect {
                Effect::SendSignal(body) => self.send_signal_from(handle, body),
                Effect::SendPacket(packet) => {
                    let Some(conn) = self.connections.get(&handle) else {
                        continue;
                    };
                    if let Some(transport) = &self.transport {
                        transport.send_packet(&conn.identity_remote, conn.id_remote, packet);
                    }
                }
                Effect::PipeDeliver { msg_num, payload } => {
                    self.pipe_deliver(handle, msg_num, payload, now);
                }
                Effect::StatusChanged {
                    old_state,
                    new_state,
                } => {
                    let Some(conn) = self.connections.get(&handle) else {
                        continue;
                    };
                    debug!(conn = handle, ?old_state, ?new_state, "status changed");
                    // Several transitions can drain in one batch; each event
                    // reports its own transition, not the latest snapshot.
                    let mut info = conn.info();
                    info.state = new_state;
                    let _ = self.status_tx.send(StatusChangedEvent {
                        conn: handle,
                        old_state,
                        info,
                    });
                }
                Effect::PurgeRecvQueue => {
                    let Some(conn) = self.connections.get(&handle) else {
                        continue;
                    };
                    self.store.purge(conn.recv_queue, QueueLink::Connection);
                }
            }
        }
    }

    /// Route an outbound signal: pipes short-circuit to their partner, P2P
    /// goes through the transport.
    fn send_signal_from(&mut self, handle: ConnHandle, body: SignalBody) {
        let Some(conn) = self.connections.get(&handle) else {
            return;
        };
        match conn.kind {
            ConnectionKind::Pipe { partner } => {
                if let SignalBody::ConnectionClosed { reason, debug } = body {
                    let now = now_usec();
                    let partner_handle = partner as u16;
                    if let Some(p) = self.connections.get_mut(&partner_handle) {
                        if p.state() != ConnectionState::None
                            && p.state() != ConnectionState::Dead
                        {
                            p.closed_by_peer(reason, &debug, now);
                        }
                    }
                    self.drain_effects(partner_handle, now);
                }
            }
            ConnectionKind::P2p => {
                let frame = SignalFrame {
                    from_identity: self.identity.clone(),
                    to_identity: conn.identity_remote.clone(),
                    from_conn_id: conn.id_local,
                    to_conn_id: conn.id_remote,
                    to_virtual_port: conn.virtual_port_remote,
                    body,
                };
                match &self.transport {
                    Some(transport) => transport.send_signal(frame),
                    None => {
                        warn!(conn = %conn.description(), "no transport; dropping signal")
                    }
                }
            }
        }
    }

    /// Loopback delivery: the partner "receives" instantly.
    fn pipe_deliver(&mut self, sender: ConnHandle, msg_num: i64, payload: Vec<u8>, now: u64) {
        let Some(sender_conn) = self.connections.get(&sender) else {
            return;
        };
        let ConnectionKind::Pipe { partner } = sender_conn.kind else {
            debug_assert!(false, "pipe delivery from a non-pipe connection");
            return;
        };
        let partner_handle = partner as u16;

        // Synthesize the wire round trip, sender first.
        let wire_seq = {
            let sender_conn = self.connections.get_mut(&sender).expect("looked up");
            let (_, wire) = sender_conn.stats.consume_send_packet_number();
            wire
        };
        let Some(partner_conn) = self.connections.get_mut(&partner_handle) else {
            return;
        };
        if !matches!(
            partner_conn.state(),
            ConnectionState::Connected | ConnectionState::Linger
        ) {
            return;
        }
        partner_conn.stats.track_recv_packet(now);
        if let Some(pkt_num) = partner_conn.stats.expand_wire_packet_number(wire_seq) {
            partner_conn.stats.track_process_sequenced_packet(pkt_num);
        }
        partner_conn.stats.received_ping_sample(0);

        self.deliver_messages(
            partner_handle,
            vec![AssembledMessage { msg_num, payload }],
            now,
        );
    }

    /// Link fully assembled messages into the receiving connection's queue
    /// and, for accepted connections, the parent listen socket's queue.
    fn deliver_messages(
        &mut self,
        handle: ConnHandle,
        messages: Vec<AssembledMessage>,
        now: u64,
    ) {
        if messages.is_empty() {
            return;
        }
        let Some(conn) = self.connections.get(&handle) else {
            return;
        };
        let sender = conn.identity_remote.clone();
        let conn_queue = conn.recv_queue;
        let socket_queue = conn
            .parent_listen_socket
            .and_then(|ls| self.listen_sockets.get(&ls))
            .map(|ls| ls.recv_queue);

        for msg in messages {
            debug!(
                conn = handle,
                msg_num = msg.msg_num,
                size = msg.payload.len(),
                "message received"
            );
            let id = self.store.insert(ReceivedMessage {
                conn: u32::from(handle),
                sender: sender.clone(),
                payload: msg.payload,
                msg_num: msg.msg_num,
                time_received: now,
            });
            self.store.link_tail(id, QueueLink::Connection, conn_queue);
            if let Some(sq) = socket_queue {
                self.store.link_tail(id, QueueLink::ListenSocket, sq);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Drive the scheduler state directly; these tests never run the loop.
    fn bare_actor() -> SocketsActor {
        SocketsActor::new(SocketsConfig::default())
    }

    #[test]
    fn retired_id_fifo_is_bounded_and_evicts_oldest_first() {
        let mut actor = bare_actor();
        let mut retired_order = Vec::new();
        for _ in 0..300 {
            let handle = actor
                .new_connection(
                    ConnectionKind::P2p,
                    NetIdentity::LocalHost,
                    ConnectionConfig::default(),
                    0,
                )
                .expect("allocate");
            retired_order.push(handle);
            actor
                .connections
                .get_mut(&handle)
                .expect("present")
                .queue_destroy(0);
            actor.reap_dead_connections(0);
        }
        assert_eq!(actor.retired_ids.len(), MAX_RETIRED_CONNECTION_IDS);
        let expected: Vec<u16> = retired_order[300 - MAX_RETIRED_CONNECTION_IDS..].to_vec();
        let actual: Vec<u16> = actor.retired_ids.iter().copied().collect();
        assert_eq!(actual, expected, "eviction must be oldest-first");
    }

    #[test]
    fn allocation_avoids_retired_and_live_low_halves() {
        let mut actor = bare_actor();
        let live = actor
            .new_connection(
                ConnectionKind::P2p,
                NetIdentity::LocalHost,
                ConnectionConfig::default(),
                0,
            )
            .expect("allocate");
        for _ in 0..64 {
            let id = actor.allocate_connection_id().expect("allocate");
            assert_ne!(id as u16, live, "low half collides with a live connection");
            assert_ne!(id & 0xFFFF, 0);
            assert_ne!(id & 0xFFFF_0000, 0);
            assert!(!actor.retired_ids.contains(&(id as u16)));
        }
    }

    #[tokio::test]
    async fn loopback_pair_echoes_a_message() {
        let sockets = Sockets::new(SocketsConfig::default());
        let (a, b) = sockets.create_loopback_pair().await.expect("pair");

        let msg_num = sockets
            .send(a, b"hello".to_vec(), crate::wire::send_flags::RELIABLE)
            .await
            .expect("send");
        assert_eq!(msg_num, 1);

        let msgs = sockets.recv(b, 10).await.expect("recv");
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].payload, b"hello");
        assert_eq!(msgs[0].msg_num, 1);
        assert_eq!(msgs[0].conn, u32::from(b));
        assert_eq!(msgs[0].sender, NetIdentity::LocalHost);
    }

    #[tokio::test]
    async fn loopback_handles_have_distinct_low_halves() {
        let sockets = Sockets::new(SocketsConfig::default());
        let mut handles = std::collections::HashSet::new();
        for _ in 0..50 {
            let (a, b) = sockets.create_loopback_pair().await.expect("pair");
            assert!(handles.insert(a), "handle reuse across live connections");
            assert!(handles.insert(b), "handle reuse across live connections");
        }
    }

    #[tokio::test]
    async fn send_after_close_is_rejected() {
        let sockets = Sockets::new(SocketsConfig::default());
        let (a, _b) = sockets.create_loopback_pair().await.expect("pair");

        sockets.close(a, 1000, "done", false).await.expect("close");
        let err = sockets.send(a, b"late".to_vec(), 0).await.unwrap_err();
        assert!(
            matches!(err, ApiError::InvalidState | ApiError::NoConnection),
            "got {err:?}"
        );
    }

    #[tokio::test]
    async fn info_reports_latched_end_reason() {
        let sockets = Sockets::new(SocketsConfig::default());
        let (a, _b) = sockets.create_loopback_pair().await.expect("pair");
        sockets.close(a, 1500, "species reasons", false).await.expect("close");
        let info = sockets.info(a).await.expect("info");
        assert_eq!(info.end_reason, 1500);
        assert_eq!(info.end_debug, "species reasons");
    }

    #[tokio::test]
    async fn closing_one_pipe_half_notifies_the_partner() {
        let sockets = Sockets::new(SocketsConfig::default());
        let (a, b) = sockets.create_loopback_pair().await.expect("pair");
        sockets.close(a, 1000, "bye", false).await.expect("close");

        let info = sockets.info(b).await.expect("info");
        assert_eq!(info.state, ConnectionState::ClosedByPeer);
        assert_eq!(info.end_reason, 1000);
    }

    #[tokio::test(start_paused = true)]
    async fn dead_connections_are_reaped_and_handles_retired() {
        let sockets = Sockets::new(SocketsConfig::default());
        let (a, b) = sockets.create_loopback_pair().await.expect("pair");
        sockets.close(a, 0, "", false).await.expect("close");
        sockets.close(b, 0, "", false).await.expect("close");

        // FinWait grace, then the reaper runs on the next tick.
        tokio::time::sleep(std::time::Duration::from_secs(2)).await;
        let err = sockets.info(a).await.unwrap_err();
        assert_eq!(err, ApiError::NoConnection);
    }
}

//! End-to-end tests across two `Sockets` instances joined by an in-process
//! transport.
//!
//! The transport seam is the same one a real signaling/UDP layer would
//! implement; here it just forwards frames into the peer instance's
//! delivery entry points. Time-dependent scenarios run under tokio's
//! paused clock so a ten-second timeout costs no wall time.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::time::timeout;

use steamnet::{
    end_reason, send_flags, ApiError, ConnHandle, ConnectionState, NetIdentity, SignalFrame,
    Sockets, SocketsConfig, StatusChangedEvent, Transport,
};

const TEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Forwards everything to the peer instance, once linked.
struct LocalRail {
    local_identity: NetIdentity,
    peer: OnceLock<Sockets>,
}

impl LocalRail {
    fn new(local_identity: NetIdentity) -> Arc<Self> {
        Arc::new(Self {
            local_identity,
            peer: OnceLock::new(),
        })
    }

    fn link(&self, peer: Sockets) {
        let _ = self.peer.set(peer);
    }
}

impl Transport for LocalRail {
    fn send_signal(&self, frame: SignalFrame) {
        if let Some(peer) = self.peer.get() {
            peer.deliver_signal(frame);
        }
    }

    fn send_packet(&self, _to: &NetIdentity, remote_cid: u32, packet: Vec<u8>) {
        if let Some(peer) = self.peer.get() {
            peer.deliver_packet(self.local_identity.clone(), remote_cid, packet);
        }
    }
}

/// A transport that drops everything on the floor.
struct BlackHole;

impl Transport for BlackHole {
    fn send_signal(&self, _frame: SignalFrame) {}
    fn send_packet(&self, _to: &NetIdentity, _remote_cid: u32, _packet: Vec<u8>) {}
}

fn identity(n: u64) -> NetIdentity {
    NetIdentity::SteamId((1u64 << 56) | (1u64 << 52) | n)
}

/// Two instances wired at each other.
fn linked_instances(a_id: NetIdentity, b_id: NetIdentity) -> (Sockets, Sockets) {
    let rail_a = LocalRail::new(a_id.clone());
    let rail_b = LocalRail::new(b_id.clone());
    let a = Sockets::new(SocketsConfig {
        identity: a_id,
        transport: Some(rail_a.clone()),
        ..SocketsConfig::default()
    });
    let b = Sockets::new(SocketsConfig {
        identity: b_id,
        transport: Some(rail_b.clone()),
        ..SocketsConfig::default()
    });
    rail_a.link(b.clone());
    rail_b.link(a.clone());
    (a, b)
}

/// Wait until `conn` reports the wanted state via status events.
async fn wait_for_state(
    events: &mut tokio::sync::mpsc::UnboundedReceiver<StatusChangedEvent>,
    conn: ConnHandle,
    wanted: ConnectionState,
) {
    loop {
        let ev = timeout(TEST_TIMEOUT, events.recv())
            .await
            .expect("state event in time")
            .expect("events channel open");
        if ev.conn == conn && ev.info.state == wanted {
            return;
        }
    }
}

/// Wait for an incoming connection on the acceptor and return its handle.
async fn wait_for_incoming(
    events: &mut tokio::sync::mpsc::UnboundedReceiver<StatusChangedEvent>,
) -> ConnHandle {
    loop {
        let ev = timeout(TEST_TIMEOUT, events.recv())
            .await
            .expect("incoming connection event")
            .expect("events channel open");
        if ev.info.state == ConnectionState::Connecting
            && ev.info.listen_socket.is_some()
        {
            return ev.conn;
        }
    }
}

#[tokio::test(start_paused = true)]
async fn connect_accept_and_exchange() {
    let (server, client) = linked_instances(identity(1), identity(2));
    let mut server_events = server.take_status_events().await.expect("events");
    let mut client_events = client.take_status_events().await.expect("events");

    let listen = server.create_listen_socket(7, None).await.expect("listen");
    let conn_out = client.connect(identity(1), 7, None).await.expect("connect");

    let conn_in = wait_for_incoming(&mut server_events).await;
    server.accept(conn_in).await.expect("accept");

    wait_for_state(&mut server_events, conn_in, ConnectionState::Connected).await;
    wait_for_state(&mut client_events, conn_out, ConnectionState::Connected).await;

    // Client to server, drained through the listen socket's shared queue.
    client
        .send(conn_out, b"ping".to_vec(), send_flags::RELIABLE | send_flags::NO_NAGLE)
        .await
        .expect("send");
    let received = loop {
        let msgs = server
            .recv_on_listen_socket(listen, 16)
            .await
            .expect("recv on listen socket");
        if !msgs.is_empty() {
            break msgs;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    };
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].payload, b"ping");
    assert_eq!(received[0].conn, u32::from(conn_in));
    assert_eq!(received[0].sender, identity(2), "sender is the authenticated peer");

    // And the other direction, drained per connection. This one leaves
    // nagle on and flushes explicitly.
    server
        .send(conn_in, b"pong".to_vec(), send_flags::RELIABLE)
        .await
        .expect("send");
    server.flush(conn_in).await.expect("flush");
    let reply = loop {
        let msgs = client.recv(conn_out, 16).await.expect("recv");
        if !msgs.is_empty() {
            break msgs;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    };
    assert_eq!(reply[0].payload, b"pong");

    let info = client.info(conn_out).await.expect("info");
    assert_eq!(info.identity_remote, identity(1));
    assert_ne!(info.id_remote, 0, "remote connection ID was learned");
}

#[tokio::test(start_paused = true)]
async fn unanswered_connect_times_out_locally() {
    let client = Sockets::new(SocketsConfig {
        identity: identity(9),
        transport: Some(Arc::new(BlackHole)),
        ..SocketsConfig::default()
    });
    let conn = client
        .connect(identity(1), 7, None)
        .await
        .expect("connect starts");

    // Default TimeoutInitial is ten seconds.
    tokio::time::sleep(Duration::from_secs(11)).await;

    let info = client.info(conn).await.expect("info");
    assert_eq!(info.state, ConnectionState::ProblemDetectedLocally);
    assert_eq!(info.end_reason, end_reason::MISC_TIMEOUT);
    assert!(!info.end_debug.is_empty());
}

#[tokio::test(start_paused = true)]
async fn graceful_close_with_linger_drains_reliable_sends() {
    let (server, client) = linked_instances(identity(1), identity(2));
    let mut server_events = server.take_status_events().await.expect("events");
    let mut client_events = client.take_status_events().await.expect("events");

    let listen = server.create_listen_socket(7, None).await.expect("listen");
    let conn_out = client.connect(identity(1), 7, None).await.expect("connect");
    let conn_in = wait_for_incoming(&mut server_events).await;
    server.accept(conn_in).await.expect("accept");
    wait_for_state(&mut client_events, conn_out, ConnectionState::Connected).await;

    // Queue ten reliable messages, then close with linger: all ten must
    // arrive before the connection finishes dying.
    for i in 0..10u8 {
        client
            .send(conn_out, vec![i], send_flags::RELIABLE)
            .await
            .expect("send");
    }
    client
        .close(conn_out, 1000, "done sending", true)
        .await
        .expect("close");

    let mut received = Vec::new();
    while received.len() < 10 {
        let msgs = server
            .recv_on_listen_socket(listen, 64)
            .await
            .expect("recv");
        received.extend(msgs);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let payloads: Vec<u8> = received.iter().map(|m| m.payload[0]).collect();
    assert_eq!(payloads, (0..10).collect::<Vec<u8>>());

    // Once the drain and FinWait grace complete, the handle is gone.
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(client.info(conn_out).await.unwrap_err(), ApiError::NoConnection);
}

#[tokio::test(start_paused = true)]
async fn peer_learns_of_abrupt_close() {
    let (server, client) = linked_instances(identity(1), identity(2));
    let mut server_events = server.take_status_events().await.expect("events");
    let mut client_events = client.take_status_events().await.expect("events");

    server.create_listen_socket(7, None).await.expect("listen");
    let conn_out = client.connect(identity(1), 7, None).await.expect("connect");
    let conn_in = wait_for_incoming(&mut server_events).await;
    server.accept(conn_in).await.expect("accept");
    wait_for_state(&mut client_events, conn_out, ConnectionState::Connected).await;

    client
        .close(conn_out, 1001, "shutting down", false)
        .await
        .expect("close");
    wait_for_state(&mut server_events, conn_in, ConnectionState::ClosedByPeer).await;

    let info = server.info(conn_in).await.expect("info");
    assert_eq!(info.end_reason, 1001);
    assert_eq!(info.end_debug, "shutting down");
}

#[tokio::test(start_paused = true)]
async fn closing_listen_socket_destroys_children() {
    let (server, client) = linked_instances(identity(1), identity(2));
    let mut server_events = server.take_status_events().await.expect("events");
    let mut client_events = client.take_status_events().await.expect("events");

    let listen = server.create_listen_socket(7, None).await.expect("listen");
    let conn_out = client.connect(identity(1), 7, None).await.expect("connect");
    let conn_in = wait_for_incoming(&mut server_events).await;
    server.accept(conn_in).await.expect("accept");
    wait_for_state(&mut client_events, conn_out, ConnectionState::Connected).await;

    server.close_listen_socket(listen).await.expect("close listen");
    assert_eq!(server.info(conn_in).await.unwrap_err(), ApiError::NoConnection);
    assert_eq!(
        server.recv_on_listen_socket(listen, 1).await.unwrap_err(),
        ApiError::NoConnection
    );
}

#[tokio::test(start_paused = true)]
async fn connect_to_closed_port_is_refused() {
    // The acceptor is up but has no listen socket on port 42.
    let (_server, client) = linked_instances(identity(1), identity(2));
    let mut client_events = client.take_status_events().await.expect("events");

    let conn = client.connect(identity(1), 42, None).await.expect("connect");

    // The refusal rides the spam-reply gate, which other tests in this
    // process share; if every reply window was consumed we fall back to the
    // local handshake timeout instead.
    let terminal = loop {
        let ev = timeout(TEST_TIMEOUT, client_events.recv())
            .await
            .expect("terminal event in time")
            .expect("events channel open");
        if ev.conn == conn
            && matches!(
                ev.info.state,
                ConnectionState::ClosedByPeer | ConnectionState::ProblemDetectedLocally
            )
        {
            break ev.info;
        }
    };
    match terminal.state {
        ConnectionState::ClosedByPeer => {
            assert_eq!(terminal.end_reason, end_reason::MISC_GENERIC);
        }
        ConnectionState::ProblemDetectedLocally => {
            assert_eq!(terminal.end_reason, end_reason::MISC_TIMEOUT);
        }
        other => panic!("unexpected terminal state {other:?}"),
    }
}

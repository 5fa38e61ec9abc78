//! # Loopback Pairs
//!
//! A loopback pair is two connections in the same process wired directly at
//! each other: `send` on one feeds the partner's receive path with no
//! transport, no packets, and no latency. The handshake still runs for real
//! (with unsigned self-signed certs, silently allowed because both ends are
//! us), so key material exists and the state machine is indistinguishable
//! from a networked connection. Ping and loss statistics are synthesized:
//! zero ping, zero loss.

use crate::connection::{Connection, ConnectionState};

/// Run the cross-wired handshake and bring both halves to `Connected`.
///
/// Expects both connections freshly created in `Connecting` with their
/// identities and connection IDs already pointing at each other. On failure
/// the offending connection has recorded the problem; the caller unwinds
/// the pair.
pub(crate) fn establish_pipe_pair(
    a: &mut Connection,
    b: &mut Connection,
    now: u64,
) -> Result<(), ()> {
    debug_assert_eq!(a.state(), ConnectionState::Connecting);
    debug_assert_eq!(b.state(), ConnectionState::Connecting);

    a.init_local_crypto_unsigned();
    b.init_local_crypto_unsigned();

    let (a_cert, a_crypt) = a.local_handshake();
    let (b_cert, b_crypt) = b.local_handshake();
    a.recv_crypto_handshake(&b_cert, &b_crypt, false, now)?;
    b.recv_crypto_handshake(&a_cert, &a_crypt, true, now)?;

    // Trade a dummy packet each way so sequence numbers, receive times,
    // and ping all look like a live link.
    fake_send_stats(a, b, now);
    fake_send_stats(b, a, now);

    a.mark_connected(now);
    b.mark_connected(now);
    Ok(())
}

/// Pretend `sender` put a packet on the wire and `receiver` got it
/// instantly.
pub(crate) fn fake_send_stats(sender: &mut Connection, receiver: &mut Connection, now: u64) {
    let (_, wire_seq) = sender.stats.consume_send_packet_number();
    sender.stats.track_sent_packet(now);

    receiver.stats.track_recv_packet(now);
    if let Some(pkt_num) = receiver.stats.expand_wire_packet_number(wire_seq) {
        receiver.stats.track_process_sequenced_packet(pkt_num);
    }
    receiver.stats.received_ping_sample(0);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionConfig, ConnectionKind, RemoteUnsignedCertPolicy};
    use crate::identity::NetIdentity;
    use crate::queue::MessageStore;

    fn pipe_conn(store: &mut MessageStore, id: u32, partner: u32, now: u64) -> Connection {
        let q = store.create_queue();
        let mut config = ConnectionConfig::default();
        config.remote_unsigned_cert = RemoteUnsignedCertPolicy::Allow;
        let mut conn = Connection::new(
            ConnectionKind::Pipe { partner },
            id,
            NetIdentity::LocalHost,
            NetIdentity::LocalHost,
            config,
            q,
            now,
        );
        conn.begin_connecting(now);
        conn
    }

    #[test]
    fn pair_reaches_connected_with_valid_keys_and_zero_ping() {
        let mut store = MessageStore::new();
        let mut a = pipe_conn(&mut store, 0x0101_0202, 0x0303_0404, 0);
        let mut b = pipe_conn(&mut store, 0x0303_0404, 0x0101_0202, 0);
        a.id_remote = b.id_local;
        b.id_remote = a.id_local;

        establish_pipe_pair(&mut a, &mut b, 0).expect("loopback handshake");
        assert_eq!(a.state(), ConnectionState::Connected);
        assert_eq!(b.state(), ConnectionState::Connected);
        assert!(a.crypt_keys_valid && b.crypt_keys_valid);

        let status = a.quick_status(0);
        assert_eq!(status.ping_ms, 0);
        assert_eq!(status.quality_remote, 1.0);
        assert!(status.pkts_sent >= 1 && status.pkts_recv >= 1);
    }
}

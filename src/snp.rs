//! # Minimal Segmentation/Reliability Layer
//!
//! The connection core drives its reliability layer through a narrow seam:
//! submit a message, flush, feed the frames of a received packet, produce
//! the next outgoing packet, and ask when it next wants to think. This
//! module is the in-tree implementation of that seam.
//!
//! It is deliberately small: one message maps to one packet (the hard
//! per-message size cap makes that sound), reliable messages are
//! retransmitted until acked, and there is no congestion control or
//! fragmentation. The connection core neither knows nor cares; anything
//! honoring the same seam could replace it.

use std::collections::{HashSet, VecDeque};

use crate::wire::DataFrame;

/// Nagle hold-off applied to sends without the no-nagle flag.
const NAGLE_USEC: u64 = 5_000;

/// Retransmit cadence for unacked reliable messages.
const RETRANSMIT_USEC: u64 = 250_000;

/// Delivered reliable message numbers are remembered this far back to
/// absorb duplicate retransmissions.
const RELIABLE_DEDUP_HORIZON: i64 = 1024;

#[derive(Debug)]
struct PendingMessage {
    msg_num: i64,
    reliable: bool,
    payload: Vec<u8>,
    /// Earliest time this message may go on the wire (nagle).
    ready_at: u64,
    /// Last transmission, 0 if never sent.
    last_sent: u64,
}

/// A message fully received from the peer, ready for the receive queue.
#[derive(Debug)]
pub struct AssembledMessage {
    pub msg_num: i64,
    pub payload: Vec<u8>,
}

/// Send/receive state for one connection's message stream.
#[derive(Debug)]
pub struct SnpState {
    next_send_msg_num: i64,
    /// Submitted, not yet transmitted (or unreliable awaiting first send).
    queued: VecDeque<PendingMessage>,
    /// Transmitted reliable messages awaiting acknowledgment.
    unacked: VecDeque<PendingMessage>,
    /// Acks owed to the peer, piggybacked on the next packet.
    pending_acks: Vec<i64>,
    /// Reliable message numbers already delivered (replay of lost acks).
    delivered_reliable: HashSet<i64>,
    highest_delivered_reliable: i64,
}

impl SnpState {
    pub fn new() -> Self {
        Self {
            next_send_msg_num: 1,
            queued: VecDeque::new(),
            unacked: VecDeque::new(),
            pending_acks: Vec::new(),
            delivered_reliable: HashSet::new(),
            highest_delivered_reliable: 0,
        }
    }

    /// Claim a message number without queueing anything. Loopback pipes
    /// deliver directly and only need the numbering.
    pub fn assign_msg_num(&mut self) -> i64 {
        let n = self.next_send_msg_num;
        self.next_send_msg_num += 1;
        n
    }

    // ------------------------------------------------------------------
    // Seam: submit / flush
    // ------------------------------------------------------------------

    /// Queue an outgoing message. Returns its message number.
    pub fn submit_message(&mut self, payload: Vec<u8>, reliable: bool, no_nagle: bool, now: u64) -> i64 {
        let msg_num = self.next_send_msg_num;
        self.next_send_msg_num += 1;
        let ready_at = if no_nagle { now } else { now + NAGLE_USEC };
        self.queued.push_back(PendingMessage {
            msg_num,
            reliable,
            payload,
            ready_at,
            last_sent: 0,
        });
        msg_num
    }

    /// Clear nagle timers so everything queued is ready to transmit.
    pub fn flush(&mut self, now: u64) {
        for msg in &mut self.queued {
            msg.ready_at = msg.ready_at.min(now);
        }
    }

    // ------------------------------------------------------------------
    // Seam: feed received frames
    // ------------------------------------------------------------------

    /// Process the data frames of one decrypted packet. Returns messages to
    /// deliver, in the order the peer emitted them.
    pub fn recv_frames(&mut self, frames: Vec<DataFrame>) -> Vec<AssembledMessage> {
        let mut assembled = Vec::new();
        for frame in frames {
            match frame {
                DataFrame::Message {
                    msg_num,
                    reliable,
                    payload,
                } => {
                    if reliable {
                        // Always re-ack; the previous ack may have been lost.
                        self.pending_acks.push(msg_num);
                        if !self.note_reliable_delivered(msg_num) {
                            continue;
                        }
                    }
                    assembled.push(AssembledMessage { msg_num, payload });
                }
                DataFrame::Ack { msg_num } => {
                    self.unacked.retain(|m| m.msg_num != msg_num);
                }
                // Keepalives are handled by the connection; nothing here.
                DataFrame::Keepalive { .. } => {}
            }
        }
        assembled
    }

    /// Track a delivered reliable message. False if it is a duplicate.
    fn note_reliable_delivered(&mut self, msg_num: i64) -> bool {
        if msg_num + RELIABLE_DEDUP_HORIZON <= self.highest_delivered_reliable {
            return false;
        }
        if !self.delivered_reliable.insert(msg_num) {
            return false;
        }
        if msg_num > self.highest_delivered_reliable {
            self.highest_delivered_reliable = msg_num;
            let floor = self.highest_delivered_reliable - RELIABLE_DEDUP_HORIZON;
            self.delivered_reliable.retain(|&n| n > floor);
        }
        true
    }

    // ------------------------------------------------------------------
    // Seam: produce next packet
    // ------------------------------------------------------------------

    /// Build the frames for the next outgoing packet, or `None` when there
    /// is nothing to say.
    pub fn produce_packet(&mut self, now: u64) -> Option<Vec<DataFrame>> {
        let mut frames: Vec<DataFrame> = self
            .pending_acks
            .drain(..)
            .map(|msg_num| DataFrame::Ack { msg_num })
            .collect();

        // Retransmit the oldest overdue reliable message, if any.
        if let Some(overdue) = self
            .unacked
            .iter_mut()
            .find(|m| now >= m.last_sent + RETRANSMIT_USEC)
        {
            overdue.last_sent = now;
            frames.push(DataFrame::Message {
                msg_num: overdue.msg_num,
                reliable: true,
                payload: overdue.payload.clone(),
            });
        } else if let Some(pos) = self.queued.iter().position(|m| now >= m.ready_at) {
            let mut msg = self.queued.remove(pos).expect("position just found");
            msg.last_sent = now;
            frames.push(DataFrame::Message {
                msg_num: msg.msg_num,
                reliable: msg.reliable,
                payload: msg.payload.clone(),
            });
            if msg.reliable {
                self.unacked.push_back(msg);
            }
        }

        if frames.is_empty() {
            None
        } else {
            Some(frames)
        }
    }

    // ------------------------------------------------------------------
    // Seam: next think time
    // ------------------------------------------------------------------

    /// When this layer next has work, `u64::MAX` when idle.
    pub fn next_think_time(&self, _now: u64) -> u64 {
        if !self.pending_acks.is_empty() {
            return 0;
        }
        let mut next = u64::MAX;
        for m in &self.queued {
            next = next.min(m.ready_at);
        }
        for m in &self.unacked {
            next = next.min(m.last_sent + RETRANSMIT_USEC);
        }
        next
    }

    /// True when nothing is queued and nothing awaits an ack. The linger
    /// state drains until this holds.
    pub fn queued_and_unacked_empty(&self) -> bool {
        self.queued.is_empty() && self.unacked.is_empty()
    }

    pub fn queued_len(&self) -> usize {
        self.queued.len()
    }

    pub fn unacked_len(&self) -> usize {
        self.unacked.len()
    }
}

impl Default for SnpState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_numbers_are_monotonic_from_one() {
        let mut snp = SnpState::new();
        assert_eq!(snp.submit_message(b"a".to_vec(), false, true, 0), 1);
        assert_eq!(snp.submit_message(b"b".to_vec(), true, true, 0), 2);
        assert_eq!(snp.assign_msg_num(), 3);
    }

    #[test]
    fn nagle_defers_until_flush() {
        let mut snp = SnpState::new();
        snp.submit_message(b"a".to_vec(), false, false, 1000);
        assert!(snp.produce_packet(1000).is_none(), "nagle should hold it");
        snp.flush(1000);
        let frames = snp.produce_packet(1000).expect("flushed message");
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn reliable_messages_retransmit_until_acked() {
        let mut snp = SnpState::new();
        let num = snp.submit_message(b"r".to_vec(), true, true, 0);
        assert!(snp.produce_packet(0).is_some());
        assert_eq!(snp.unacked_len(), 1);

        // Not yet due.
        assert!(snp.produce_packet(RETRANSMIT_USEC / 2).is_none());
        // Due: retransmitted.
        assert!(snp.produce_packet(RETRANSMIT_USEC).is_some());

        snp.recv_frames(vec![DataFrame::Ack { msg_num: num }]);
        assert!(snp.queued_and_unacked_empty());
        assert!(snp.produce_packet(10 * RETRANSMIT_USEC).is_none());
    }

    #[test]
    fn unreliable_messages_are_fire_and_forget() {
        let mut snp = SnpState::new();
        snp.submit_message(b"u".to_vec(), false, true, 0);
        assert!(snp.produce_packet(0).is_some());
        assert!(snp.queued_and_unacked_empty());
    }

    #[test]
    fn duplicate_reliable_delivery_is_suppressed_but_reacked() {
        let mut snp = SnpState::new();
        let frame = DataFrame::Message {
            msg_num: 5,
            reliable: true,
            payload: b"x".to_vec(),
        };
        let first = snp.recv_frames(vec![frame.clone()]);
        assert_eq!(first.len(), 1);
        let second = snp.recv_frames(vec![frame]);
        assert!(second.is_empty(), "duplicate must not deliver twice");
        // Both receipts owe the peer an ack.
        let frames = snp.produce_packet(0).expect("acks pending");
        let acks = frames
            .iter()
            .filter(|f| matches!(f, DataFrame::Ack { msg_num: 5 }))
            .count();
        assert_eq!(acks, 2);
    }

    #[test]
    fn next_think_tracks_pending_work() {
        let mut snp = SnpState::new();
        assert_eq!(snp.next_think_time(0), u64::MAX);
        snp.submit_message(b"a".to_vec(), true, false, 100);
        assert_eq!(snp.next_think_time(100), 100 + NAGLE_USEC);
        snp.flush(100);
        assert_eq!(snp.next_think_time(100), 100);
    }
}

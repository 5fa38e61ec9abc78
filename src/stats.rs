//! # End-to-End Link Statistics
//!
//! Per-connection bookkeeping for the sequenced packet stream: sequence
//! number generation on send, wire-sequence expansion and replay rejection
//! on receive, keepalive/reply-timeout tracking, and a coarse ping estimate.
//!
//! ## Sequence Numbers
//!
//! The sender keeps a 64-bit monotonic packet number but the wire carries
//! only the low 16 bits. The receiver expands a wire value against the
//! highest packet number seen so far by interpreting the 16-bit difference
//! as signed, which is unambiguous while the true gap stays within ±32K.
//! A 128-bit bitmask over the most recent packet numbers rejects duplicates
//! (replay protection) and packets that have fallen out of the window.

/// One million, for second/microsecond conversions.
pub const MILLION: u64 = 1_000_000;

/// Send a plain keepalive if nothing has been heard for this long.
pub const KEEPALIVE_INTERVAL_USEC: u64 = 10 * MILLION;

/// Ping cadence while the connection looks like it is timing out.
pub const AGGRESSIVE_PING_INTERVAL_USEC: u64 = 200_000;

/// Floor for how long we wait on a reply before counting a timeout.
pub const MIN_REPLY_TIMEOUT_USEC: u64 = 250_000;

/// Forward jumps beyond this lose our ability to keep the truncated wire
/// sequence in sync, so the connection is torn down.
pub const MAX_SEQ_NUM_GAP: i64 = 0x4000;

/// Reply timeouts tolerated before declaring the connection dead, once the
/// last-receive clock has also expired.
pub const MAX_REPLY_TIMEOUTS: u32 = 4;

/// End-to-end statistics and sequence state for one connection.
#[derive(Debug)]
pub struct LinkStats {
    /// Next packet number to send. The first packet is 1.
    next_send_pkt_num: i64,
    /// Highest packet number processed from the peer.
    max_recv_pkt_num: i64,
    /// Bit window over recent packet numbers; see [`Self::mark_processed`].
    recv_pkt_mask: [u64; 2],

    /// When anything was last received (any packet, sequenced or not).
    pub time_last_recv: u64,
    /// When we last sent anything.
    pub time_last_send: u64,
    /// When we last sent something expecting an immediate reply.
    pub last_send_expecting_reply: u64,
    /// Deadline for an outstanding expected reply; 0 when none in flight.
    pub in_flight_reply_timeout: u64,
    /// Expected replies that never arrived since the last receive.
    pub reply_timeouts_since_last_recv: u32,

    /// Smoothed round-trip estimate, microseconds. Negative until measured.
    pub ping_usec: i64,

    pub pkts_sent: u64,
    pub pkts_recv: u64,
    /// Sequenced packets inferred dropped from gaps.
    pub pkts_dropped: u64,
}

impl LinkStats {
    pub fn new(now: u64) -> Self {
        Self {
            next_send_pkt_num: 1,
            max_recv_pkt_num: 0,
            recv_pkt_mask: [0; 2],
            time_last_recv: now,
            time_last_send: 0,
            last_send_expecting_reply: 0,
            in_flight_reply_timeout: 0,
            reply_timeouts_since_last_recv: 0,
            ping_usec: -1,
            pkts_sent: 0,
            pkts_recv: 0,
            pkts_dropped: 0,
        }
    }

    // ------------------------------------------------------------------
    // Send side
    // ------------------------------------------------------------------

    /// Claim the next packet number; returns the full value and the
    /// truncated form that goes on the wire.
    pub fn consume_send_packet_number(&mut self) -> (i64, u16) {
        let full = self.next_send_pkt_num;
        self.next_send_pkt_num += 1;
        (full, full as u16)
    }

    pub fn track_sent_packet(&mut self, now: u64) {
        self.pkts_sent += 1;
        self.time_last_send = now;
    }

    /// Record that we just sent something the peer should answer promptly.
    pub fn track_sent_ping_request(&mut self, now: u64) {
        self.last_send_expecting_reply = now;
        if self.in_flight_reply_timeout == 0 {
            self.in_flight_reply_timeout = now + self.reply_timeout();
        }
    }

    /// How long to wait on an expected reply: generous multiple of the ping,
    /// floored for unmeasured links.
    fn reply_timeout(&self) -> u64 {
        if self.ping_usec > 0 {
            MIN_REPLY_TIMEOUT_USEC.max(2 * self.ping_usec as u64)
        } else {
            MIN_REPLY_TIMEOUT_USEC
        }
    }

    // ------------------------------------------------------------------
    // Receive side
    // ------------------------------------------------------------------

    /// Expand a wire sequence number to its full 64-bit form and screen out
    /// stale or duplicate packets. Does not yet mark the number as
    /// processed; that happens only after the packet authenticates.
    pub fn expand_wire_packet_number(&self, wire: u16) -> Option<i64> {
        let gap = wire.wrapping_sub(self.max_recv_pkt_num as u16) as i16;
        let pkt_num = self.max_recv_pkt_num + i64::from(gap);
        if pkt_num <= 0 || self.is_old_or_duplicate(pkt_num) {
            return None;
        }
        Some(pkt_num)
    }

    fn window_base(&self) -> i64 {
        self.max_recv_pkt_num & !63
    }

    fn is_old_or_duplicate(&self, pkt_num: i64) -> bool {
        if pkt_num > self.max_recv_pkt_num {
            return false;
        }
        let base = self.window_base();
        if pkt_num < base - 64 {
            // Fell out of the replay window; can't prove it's new.
            return true;
        }
        let offset = pkt_num - (base - 64);
        let (word, bit) = ((offset / 64) as usize, (offset % 64) as u32);
        self.recv_pkt_mask[word] & (1u64 << bit) != 0
    }

    /// Record any authenticated arrival (sequenced or not).
    pub fn track_recv_packet(&mut self, now: u64) {
        self.pkts_recv += 1;
        self.time_last_recv = now;
        self.in_flight_reply_timeout = 0;
        self.reply_timeouts_since_last_recv = 0;
    }

    /// Record a processed sequenced packet, sliding the replay window.
    /// Call only with values returned by [`Self::expand_wire_packet_number`].
    pub fn track_process_sequenced_packet(&mut self, pkt_num: i64) {
        debug_assert!(pkt_num > 0);
        if pkt_num > self.max_recv_pkt_num {
            let gap = pkt_num - self.max_recv_pkt_num;
            if gap > 1 {
                self.pkts_dropped += (gap - 1) as u64;
            }
            let old_base = self.window_base();
            let new_base = pkt_num & !63;
            let shift = (new_base - old_base) / 64;
            match shift {
                0 => {}
                1 => {
                    self.recv_pkt_mask[0] = self.recv_pkt_mask[1];
                    self.recv_pkt_mask[1] = 0;
                }
                _ => self.recv_pkt_mask = [0; 2],
            }
            self.max_recv_pkt_num = pkt_num;
        }
        let offset = pkt_num - (self.window_base() - 64);
        let (word, bit) = ((offset / 64) as usize, (offset % 64) as u32);
        self.recv_pkt_mask[word] |= 1u64 << bit;
    }

    pub fn max_recv_packet_number(&self) -> i64 {
        self.max_recv_pkt_num
    }

    /// Start expecting packets after `pkt_num`.
    #[cfg(test)]
    pub fn init_max_recv_packet_number(&mut self, pkt_num: i64) {
        self.max_recv_pkt_num = pkt_num;
        self.recv_pkt_mask = [0; 2];
    }

    // ------------------------------------------------------------------
    // Liveness
    // ------------------------------------------------------------------

    /// Update reply-timeout accounting. Called from the connection's think.
    pub fn think(&mut self, now: u64) {
        if self.in_flight_reply_timeout != 0 && now >= self.in_flight_reply_timeout {
            self.in_flight_reply_timeout = 0;
            self.reply_timeouts_since_last_recv += 1;
        }
    }

    /// Fold in a fresh round-trip sample (exponential smoothing).
    pub fn received_ping_sample(&mut self, rtt_usec: u64) {
        let rtt = rtt_usec as i64;
        self.ping_usec = if self.ping_usec < 0 {
            rtt
        } else {
            (self.ping_usec * 7 + rtt) / 8
        };
    }
}

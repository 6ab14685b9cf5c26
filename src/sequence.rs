//! The sliding sequence window and ack mask.
//!
//! All sequence numbers are 32-bit and wrap; distances are always computed
//! with wrapping subtraction. On the wire sequences are truncated to
//! [`SEQUENCE_BITS`] (send) / [`ACK_SEQUENCE_BITS`] (ack anchor) bits and
//! reconstructed against the receiver's window position.

/// Packet window size is `2^PACKET_WINDOW_SHIFT`.
pub const PACKET_WINDOW_SHIFT: u32 = 5;
/// Maximum number of packets in flight in the packet window.
pub const PACKET_WINDOW_SIZE: u32 = 1 << PACKET_WINDOW_SHIFT;
/// Mask for indexing per-slot window state.
pub const PACKET_WINDOW_MASK: u32 = PACKET_WINDOW_SIZE - 1;
/// Each ack word covers 32 packets.
pub const ACK_MASK_WORDS: usize = 1 << (PACKET_WINDOW_SHIFT - 5);
/// Maximum number of ack bytes sent in each packet.
pub const MAX_ACK_BYTES: u32 = (ACK_MASK_WORDS as u32) << 2;

/// Bit width of the send sequence field on the wire.
pub const SEQUENCE_BITS: u32 = 11;
pub const SEQUENCE_WINDOW_SIZE: u32 = 1 << SEQUENCE_BITS;
pub const SEQUENCE_MASK: u32 = !(SEQUENCE_WINDOW_SIZE - 1);

/// Bit width of the ack anchor field on the wire.
pub const ACK_SEQUENCE_BITS: u32 = 10;
pub const ACK_SEQUENCE_WINDOW_SIZE: u32 = 1 << ACK_SEQUENCE_BITS;
pub const ACK_SEQUENCE_MASK: u32 = !(ACK_SEQUENCE_WINDOW_SIZE - 1);

/// Recovers a full 32-bit sequence from its truncated wire form.
///
/// The high bits come from `reference` (the highest sequence seen so far for
/// this field); if the result lands below the reference the truncated value
/// wrapped, so one window size is added.
fn reconstruct(partial: u32, reference: u32, window_size: u32, high_mask: u32) -> u32 {
    let mut seq = partial | (reference & high_mask);
    if seq < reference {
        seq = seq.wrapping_add(window_size);
    }
    seq
}

/// Sequence/window state of one connection.
pub struct SequenceWindow {
    /// Random 32-bit starting sequence chosen at creation.
    pub initial_send_seq: u32,
    /// Sequence of the most recently sent data packet.
    pub last_send_seq: u32,
    /// The highest sequence the remote side has acknowledged.
    pub highest_acked_seq: u32,

    /// The peer's initial send sequence, learned at handshake.
    pub initial_recv_seq: u32,
    /// The highest in-window sequence received from the peer.
    pub last_seq_recvd: u32,
    /// Receipt bits; bit i of word 0 covers sequence `last_seq_recvd - i`
    /// and is set iff that sequence arrived as a data packet.
    pub ack_mask: [u32; ACK_MASK_WORDS],
    /// The highest of our received sequences the peer is known to have seen
    /// an ack for; bounds the ack bytes we must keep transmitting.
    pub last_recv_ack_ack: u32,
    /// Snapshot of `last_seq_recvd` at the time we sent the data packet in
    /// window slot k; advances `last_recv_ack_ack` when that packet is acked.
    pub last_seq_recvd_at_send: [u32; PACKET_WINDOW_SIZE as usize],
}

impl SequenceWindow {
    pub fn new(initial_send_seq: u32) -> SequenceWindow {
        SequenceWindow {
            initial_send_seq,
            // sending starts at initial_send_seq + 1
            last_send_seq: initial_send_seq,
            highest_acked_seq: initial_send_seq,
            initial_recv_seq: 0,
            last_seq_recvd: 0,
            ack_mask: [0; ACK_MASK_WORDS],
            last_recv_ack_ack: 0,
            last_seq_recvd_at_send: [0; PACKET_WINDOW_SIZE as usize],
        }
    }

    pub fn set_initial_recv_sequence(&mut self, sequence: u32) {
        self.initial_recv_seq = sequence;
        self.last_seq_recvd = sequence;
        self.last_recv_ack_ack = sequence;
    }

    /// True if no more data packets fit into the send window.
    pub fn window_full(&self) -> bool {
        self.last_send_seq.wrapping_sub(self.highest_acked_seq) >= PACKET_WINDOW_SIZE - 2
    }

    pub fn has_unacked_sent_packets(&self) -> bool {
        self.last_send_seq != self.highest_acked_seq
    }

    pub fn next_send_sequence(&self) -> u32 {
        self.last_send_seq.wrapping_add(1)
    }

    /// Number of ack bytes needed to cover everything the peer may not yet
    /// know we received.
    pub fn ack_byte_count(&self) -> u32 {
        (self.last_seq_recvd.wrapping_sub(self.last_recv_ack_ack) + 7) / 8
    }

    /// Reconstructs a received send-sequence field. Returns `None` when the
    /// result is outside the receive window (out-of-order or stale packet).
    pub fn reconstruct_sequence(&self, partial: u32) -> Option<u32> {
        let seq = reconstruct(partial, self.last_seq_recvd, SEQUENCE_WINDOW_SIZE, SEQUENCE_MASK);
        if seq.wrapping_sub(self.last_seq_recvd) > PACKET_WINDOW_SIZE - 1 {
            return None;
        }
        Some(seq)
    }

    /// Reconstructs a received highest-ack field. Returns `None` when the
    /// result is beyond the newest sequence we actually sent.
    pub fn reconstruct_highest_ack(&self, partial: u32) -> Option<u32> {
        let ack = reconstruct(partial, self.highest_acked_seq, ACK_SEQUENCE_WINDOW_SIZE, ACK_SEQUENCE_MASK);
        if ack.wrapping_sub(self.highest_acked_seq) > self.last_send_seq.wrapping_sub(self.highest_acked_seq) {
            return None;
        }
        Some(ack)
    }

    /// Shifts the ack mask up to the newly accepted sequence. Every sequence
    /// in the gap is recorded as not received; the low bit becomes 1 iff the
    /// accepted packet is a data packet. Shift 0 (a re-sent ping or ack) is
    /// a no-op, which keeps receipt processing idempotent.
    pub fn shift_ack_mask(&mut self, mut shift: u32, is_data_packet: bool) {
        while shift > 32 {
            for i in (1..ACK_MASK_WORDS).rev() {
                self.ack_mask[i] = self.ack_mask[i - 1];
            }
            self.ack_mask[0] = 0;
            shift -= 32;
        }

        let mut carry = if is_data_packet && shift > 0 { 1u32 } else { 0 };
        for word in self.ack_mask.iter_mut() {
            let wide = ((*word as u64) << shift) | carry as u64;
            *word = wide as u32;
            carry = (wide >> 32) as u32;
        }
    }

    /// Records the window snapshot for a just-sent data packet.
    pub fn record_data_send(&mut self, sequence: u32) {
        self.last_seq_recvd_at_send[(sequence & PACKET_WINDOW_MASK) as usize] = self.last_seq_recvd;
    }
}

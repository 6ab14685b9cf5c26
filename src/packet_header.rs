//! Packet header framing for the notification protocol.
//!
//! The first [`HEADER_BYTES`] bytes are cleartext and double as the cipher
//! nonce; everything after them is inside the encryption boundary. See the
//! crate docs for the full bit layout.

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::bit_stream::BitStream;
use crate::error::PacketDropReason;
use crate::sequence::{ACK_MASK_WORDS, ACK_SEQUENCE_BITS, MAX_ACK_BYTES, SEQUENCE_BITS};

/// Two-bit identifier for each connected-protocol packet.
#[derive(Debug, Clone, Copy, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum PacketType {
    /// Standard data packet; each one sent increments the send sequence.
    Data = 0,
    /// Sent when this side has not heard from the peer for a while. Does not
    /// increment the send sequence.
    Ping = 1,
    /// Sent in response to a ping or a half-full ack window. Does not
    /// increment the send sequence.
    Ack = 2,
}

/// Bits in the cleartext header prefix: 2 type bits, 1 data-packet flag,
/// the truncated send sequence and the truncated ack anchor.
pub const HEADER_BITS: u32 = 3 + SEQUENCE_BITS + ACK_SEQUENCE_BITS;
/// The cleartext prefix rounded up to whole bytes; encryption starts here.
pub const HEADER_BYTES: usize = ((HEADER_BITS + 7) >> 3) as usize;
/// Zero bits padding the prefix to a byte boundary.
pub const HEADER_PAD_BITS: u32 = (HEADER_BYTES as u32 * 8) - HEADER_BITS;

/// The cleartext fields of a received header, still truncated to their wire
/// widths. Sequence reconstruction needs the connection's window state and
/// happens one layer up.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct HeaderPrefix {
    /// Raw 2-bit packet type; validated after decryption.
    pub packet_type: u32,
    pub partial_sequence: u32,
    pub partial_highest_ack: u32,
}

/// Writes the header: cleartext prefix, then the ack section (which ends up
/// inside the encrypted region).
pub fn write_header(
    stream: &mut BitStream,
    packet_type: PacketType,
    send_seq: u32,
    last_seq_recvd: u32,
    ack_byte_count: u32,
    ack_mask: &[u32; ACK_MASK_WORDS],
) {
    debug_assert!(ack_byte_count <= MAX_ACK_BYTES);

    stream.write_integer(u8::from(packet_type) as u32, 2);
    stream.write_integer(send_seq & 0x1F, 5);
    // the 8th bit: marks connected-protocol packets for interface routing
    stream.write_bool(true);
    stream.write_integer((send_seq >> 5) & ((1 << (SEQUENCE_BITS - 5)) - 1), SEQUENCE_BITS - 5);
    stream.write_integer(last_seq_recvd & ((1 << ACK_SEQUENCE_BITS) - 1), ACK_SEQUENCE_BITS);
    stream.write_integer(0, HEADER_PAD_BITS);

    stream.write_ranged_u32(ack_byte_count, 0, MAX_ACK_BYTES);
    let word_count = ((ack_byte_count + 3) >> 2) as usize;
    for i in 0..word_count {
        let bits = if i == word_count - 1 {
            (ack_byte_count - i as u32 * 4) * 8
        } else {
            32
        };
        stream.write_integer(ack_mask[i] & mask_for_bits(bits), bits);
    }
}

/// Reads the cleartext prefix. Rejects a missing data-packet flag or
/// non-zero pad bits.
pub fn read_header_prefix(stream: &mut BitStream) -> Result<HeaderPrefix, PacketDropReason> {
    let packet_type = stream.read_integer(2);
    let mut partial_sequence = stream.read_integer(5);
    let data_packet_flag = stream.read_bool();
    partial_sequence |= stream.read_integer(SEQUENCE_BITS - 5) << 5;
    let partial_highest_ack = stream.read_integer(ACK_SEQUENCE_BITS);
    let pad = stream.read_integer(HEADER_PAD_BITS);

    if !data_packet_flag || pad != 0 || stream.overrun() {
        return Err(PacketDropReason::MalformedHeader);
    }

    Ok(HeaderPrefix {
        packet_type,
        partial_sequence,
        partial_highest_ack,
    })
}

/// Reads the ack section from the decrypted region: the ranged byte count
/// and the mask words (the final word may be partial).
pub fn read_ack_section(stream: &mut BitStream) -> Result<(u32, [u32; ACK_MASK_WORDS]), PacketDropReason> {
    let ack_byte_count = stream.read_ranged_u32(0, MAX_ACK_BYTES);
    if ack_byte_count > MAX_ACK_BYTES {
        return Err(PacketDropReason::AckByteCountOversize);
    }

    let mut ack_mask = [0u32; ACK_MASK_WORDS];
    let word_count = ((ack_byte_count + 3) >> 2) as usize;
    for i in 0..word_count {
        let bits = if i == word_count - 1 {
            (ack_byte_count - i as u32 * 4) * 8
        } else {
            32
        };
        ack_mask[i] = stream.read_integer(bits);
    }
    Ok((ack_byte_count, ack_mask))
}

fn mask_for_bits(bits: u32) -> u32 {
    if bits >= 32 {
        u32::MAX
    } else {
        (1 << bits) - 1
    }
}

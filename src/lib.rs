//! nudp is a secure, connection-oriented transport protocol on top of UDP.
//!
//! ## Design goals
//!
//! It provides exactly four things, and deliberately nothing more:
//! * A cryptographic handshake that establishes a per-connection symmetric
//!   key while resisting IP spoofing (identity-token echo) and CPU
//!   exhaustion (client puzzles) - the host commits no state until the
//!   initiator has proven reachability and burned some CPU.
//! * A *notification* protocol: for every data packet sent, the application
//!   is told exactly once, and in send order, whether the peer received it
//!   or dropped it. Payloads are not retransmitted - the application decides
//!   what a drop means and what to resend. This suits state-replication
//!   workloads where a newer update supersedes a lost one.
//! * Keep-alive pings and timeout detection.
//! * Packet confidentiality and integrity: a symmetric cipher keyed at
//!   handshake time, with per-packet counters bound to the header's sequence
//!   fields and a truncated-MAC trailing signature.
//!
//! Explicitly out of scope: fragmentation/reassembly, retransmission,
//! congestion control, stream multiplexing, and ordered payload delivery
//! (only the ack notifications are ordered).
//!
//! ## Packet format
//!
//! Connected-protocol packets are bit-packed (LSB-first within each byte):
//!
//! ```ascii
//!  bits 0-1:   packet type (00 data, 01 ping, 10 ack)
//!  bits 2-6:   send sequence, low 5 bits
//!  bit  7:     data-packet flag, always 1 (tells connected-protocol
//!              packets apart from handshake packets, which keep their
//!              first byte below 0x80)
//!  bits 8-13:  send sequence, remaining 6 of 11 bits
//!  bits 14-23: received-sequence ack anchor, 10 bits
//!  --- encryption boundary (3 cleartext bytes) ---
//!  ack byte count: ranged uint in [0, 4]
//!  ack mask:   ack_byte_count * 8 bits
//!  payload:    length-prefixed buffer (data packets only)
//!  signature:  5 bytes, HMAC-SHA-256 truncated
//! ```
//!
//! The cleartext sequence fields double as the cipher counter, so replaying
//! or reordering a packet breaks its signature. Sequences travel truncated
//! and are reconstructed against a 32-entry sliding window; anything outside
//! the window is silently dropped.
//!
//! ## Notification protocol
//!
//! Each side's header carries the highest sequence it has seen from the peer
//! plus a bitmap of receipt bits below that anchor. From the anchor's
//! progress the sender derives, for every packet it ever sent, exactly one
//! ACK or NACK notification, emitted upward in strictly increasing sequence
//! order. An ack-ack watermark bounds the bitmap each side must keep
//! transmitting, and ack packets are volunteered for pings and half-full
//! windows so notification progress never depends on application traffic.
//!
//! ## Structure
//!
//! [`connection::Connection`] is the core: the per-peer state machine tying
//! together the window ([`sequence`]), the framing ([`packet_header`],
//! [`bit_stream`]), the encryption binding ([`cipher`]) and the keep-alive
//! driver. It is synchronous, lock-free and driven entirely by its host.
//! [`interface::Interface`] owns the UDP socket, routes datagrams, runs the
//! handshake ([`client_puzzle`], [`connection_params`]) and delivers
//! [`event::ConnectionEvent`]s through a queue.

pub mod bit_stream;
pub mod cipher;
pub mod client_puzzle;
pub mod config;
pub mod connection;
pub mod connection_params;
pub mod error;
pub mod event;
pub mod host;
pub mod interface;
pub mod packet_header;
pub mod sequence;

pub use config::{ConnectionConfig, InterfaceConfig};
pub use connection::{Connection, ConnectionState};
pub use error::{PacketDropReason, SendResult, TerminationReason};
pub use event::{ConnectionEvent, InterfaceEvent};
pub use interface::Interface;

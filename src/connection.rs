//! The per-peer connection state machine.
//!
//! A connection combines the sliding sequence window, the notification
//! protocol, the handshake-parameter carrier, the keep-alive timer and the
//! encryption binding. It implements a notification protocol on top of the
//! unreliable datagram transport: for every data packet sent, the application
//! is told exactly once - and in send order - whether the peer received or
//! dropped it. Payloads are never retransmitted by this layer; what to do
//! about a dropped packet is the application's call.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, trace};

use crate::bit_stream::BitStream;
use crate::cipher::{self, PacketCounter, SymmetricCipher};
use crate::config::ConnectionConfig;
use crate::connection_params::{ConnectionParameters, Nonce};
use crate::error::{PacketDropReason, SendResult};
use crate::event::ConnectionEvent;
use crate::host::{ConnectDataCodec, ConnectionHost};
use crate::packet_header::{self, PacketType, HEADER_BYTES};
use crate::sequence::{SequenceWindow, MAX_ACK_BYTES, PACKET_WINDOW_MASK, PACKET_WINDOW_SIZE};

/// Lifecycle states of a connection.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ConnectionState {
    /// Initial state - not connected.
    NotConnected,
    /// Challenge request sent, awaiting the response.
    AwaitingChallengeResponse,
    /// Pending arranged connection, neither side has heard from the other.
    SendingPunchPackets,
    /// Challenge response received, working on the puzzle.
    ComputingPuzzleSolution,
    /// Connect request sent, awaiting accept or reject.
    AwaitingConnectResponse,
    /// The connection process timed out.
    ConnectTimedOut,
    /// The connect request was rejected.
    ConnectRejected,
    /// Established and able to carry data packets.
    Connected,
    /// Terminated by either side.
    Disconnected,
    /// Ping retries exhausted.
    TimedOut,
}

/// One logical peer relationship.
pub struct Connection {
    host: Arc<dyn ConnectionHost>,
    codec: Arc<dyn ConnectDataCodec>,
    peer_addr: SocketAddr,
    config: ConnectionConfig,

    params: ConnectionParameters,
    cipher: Option<SymmetricCipher>,
    window: SequenceWindow,
    state: ConnectionState,

    ping_send_count: u32,
    last_ping_send_time: Option<Instant>,
    last_packet_recv_time: Option<Instant>,
}

impl Connection {
    pub fn new(
        host: Arc<dyn ConnectionHost>,
        peer_addr: SocketAddr,
        config: ConnectionConfig,
        codec: Arc<dyn ConnectDataCodec>,
    ) -> Connection {
        let initial_send_seq = host.random_u32();
        let mut nonce = [0u8; Nonce::SIZE];
        host.random_bytes(&mut nonce);

        let params = ConnectionParameters {
            local_nonce: Nonce(nonce),
            ..ConnectionParameters::default()
        };

        Connection {
            host,
            codec,
            peer_addr,
            config,
            params,
            cipher: None,
            window: SequenceWindow::new(initial_send_seq),
            state: ConnectionState::NotConnected,
            ping_send_count: 0,
            last_ping_send_time: None,
            last_packet_recv_time: None,
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: ConnectionState) {
        trace!("connection {:?}: state {:?} -> {:?}", self.peer_addr, self.state, state);
        self.state = state;
    }

    /// True once the handshake has completed successfully.
    pub fn is_established(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn is_initiator(&self) -> bool {
        self.params.is_initiator
    }

    pub fn params(&self) -> &ConnectionParameters {
        &self.params
    }

    pub(crate) fn params_mut(&mut self) -> &mut ConnectionParameters {
        &mut self.params
    }

    pub(crate) fn codec(&self) -> &Arc<dyn ConnectDataCodec> {
        &self.codec
    }

    /// The first sequence this side counts from; the peer learns it during
    /// the handshake.
    pub fn initial_send_sequence(&self) -> u32 {
        self.window.initial_send_seq
    }

    /// Installs the peer's initial send sequence, learned at handshake.
    pub fn set_initial_recv_sequence(&mut self, sequence: u32) {
        self.window.set_initial_recv_sequence(sequence);
    }

    /// Installs the symmetric cipher. Until one is set (pre-handshake, or in
    /// test setups) packets travel unencrypted and unsigned.
    pub fn set_symmetric_cipher(&mut self, the_cipher: SymmetricCipher) {
        self.cipher = Some(the_cipher);
    }

    pub fn set_ping_timeouts(&mut self, time_per_ping: std::time::Duration, ping_retry_count: u32) {
        self.config.ping_timeout = time_per_ping;
        self.config.ping_retry_count = ping_retry_count;
    }

    /// Simulates a lossy, slow network for this connection.
    pub fn set_simulated_net_params(&mut self, packet_loss: f32, latency: std::time::Duration) {
        self.config.simulated_packet_loss = packet_loss;
        self.config.simulated_latency = latency;
    }

    /// True if the send window is full and no data packet can be sent.
    pub fn window_full(&self) -> bool {
        self.window.window_full()
    }

    /// The sequence the next data packet will be assigned.
    pub fn next_send_sequence(&self) -> u32 {
        self.window.next_send_sequence()
    }

    /// When the last packet was successfully read from the peer, if ever.
    pub fn last_packet_recv_time(&self) -> Option<Instant> {
        self.last_packet_recv_time
    }

    /// Marks the connection established and tells the application.
    pub(crate) fn mark_established(&mut self) {
        self.set_state(ConnectionState::Connected);
        self.host.post_event(ConnectionEvent::Established);
    }

    /// Terminates the connection locally and posts the terminal event. The
    /// host interface drains the connection afterwards.
    pub fn disconnect(&mut self, data: &[u8]) {
        if matches!(self.state, ConnectionState::Disconnected | ConnectionState::TimedOut) {
            return;
        }
        self.set_state(ConnectionState::Disconnected);
        self.host.post_event(ConnectionEvent::Disconnected { data: data.to_vec() });
    }

    pub(crate) fn on_timed_out(&mut self) {
        if matches!(self.state, ConnectionState::Disconnected | ConnectionState::TimedOut) {
            return;
        }
        self.set_state(ConnectionState::TimedOut);
        self.host.post_event(ConnectionEvent::TimedOut { data: Vec::new() });
    }

    /// Sends a data packet. On success the assigned sequence is returned so
    /// the application can correlate the eventual notify event.
    pub fn send_data_packet(&mut self, payload: &[u8]) -> SendResult {
        if self.state != ConnectionState::Connected {
            return SendResult::NotConnected;
        }
        if self.window.window_full() {
            return SendResult::WindowFull;
        }

        let stream = self.write_raw_packet(PacketType::Data, Some(payload));
        let sequence = self.window.last_send_seq;
        debug_assert!(
            self.window.last_send_seq.wrapping_sub(self.window.highest_acked_seq) <= PACKET_WINDOW_SIZE - 2
        );
        self.send_packet(stream);
        SendResult::Sent { sequence }
    }

    /// Sends a ping to find out whether the peer is still alive and what its
    /// packet window looks like.
    fn send_ping_packet(&mut self) {
        let stream = self.write_raw_packet(PacketType::Ping, None);
        trace!("connection {:?}: send ping {}", self.peer_addr, self.window.last_send_seq);
        self.send_packet(stream);
    }

    /// Sends an ack packet, reusing the current send sequence.
    fn send_ack_packet(&mut self) {
        let stream = self.write_raw_packet(PacketType::Ack, None);
        trace!("connection {:?}: send ack {}", self.peer_addr, self.window.last_send_seq);
        self.send_packet(stream);
    }

    /// Writes a full packet of the given type: header, optional payload,
    /// then encryption and signature.
    fn write_raw_packet(&mut self, packet_type: PacketType, payload: Option<&[u8]>) -> BitStream {
        debug_assert!(packet_type != PacketType::Data || !self.window.window_full());

        let ack_byte_count = self.window.ack_byte_count().min(MAX_ACK_BYTES);

        if packet_type == PacketType::Data {
            self.window.last_send_seq = self.window.last_send_seq.wrapping_add(1);
        }

        let mut stream = BitStream::with_capacity(64);
        packet_header::write_header(
            &mut stream,
            packet_type,
            self.window.last_send_seq,
            self.window.last_seq_recvd,
            ack_byte_count,
            &self.window.ack_mask,
        );

        if packet_type == PacketType::Data {
            // a re-sent ping or ack must not advance the snapshot, in case
            // it arrives while the previous data packet is still in flight
            self.window.record_data_send(self.window.last_send_seq);
        }

        if let Some(payload) = payload {
            stream.write_byte_buffer(payload);
        }

        if let Some(the_cipher) = &self.cipher {
            let counter = PacketCounter {
                sequence: self.window.last_send_seq,
                ack_sequence: self.window.last_seq_recvd,
                packet_type: packet_type.into(),
            };
            cipher::encrypt_and_sign(the_cipher, &counter, &mut stream, HEADER_BYTES);
        }
        stream
    }

    /// Hands a finished packet to the socket, subject to the simulated-network
    /// hooks. A simulated send drop still consumed the sequence number - it
    /// models network loss, not back-pressure.
    fn send_packet(&mut self, stream: BitStream) {
        if self.config.simulated_packet_loss > 0.0 && self.host.random_unit() < self.config.simulated_packet_loss {
            trace!("connection {:?}: SENDDROP {}", self.peer_addr, self.window.last_send_seq);
            return;
        }

        let bytes = stream.into_bytes();
        if !self.config.simulated_latency.is_zero() {
            self.host.send_to_delayed(self.peer_addr, &bytes, self.config.simulated_latency);
        } else {
            self.host.send_to(self.peer_addr, &bytes);
        }
    }

    /// Processes an incoming datagram, as dispatched by the host interface.
    ///
    /// All wire-derived failures are local: the packet is dropped, state is
    /// untouched and no event is raised.
    pub fn read_raw_packet(&mut self, datagram: &[u8]) -> Result<(), PacketDropReason> {
        if self.state != ConnectionState::Connected {
            trace!("connection {:?}: packet in state {:?} - ignoring", self.peer_addr, self.state);
            return Ok(());
        }
        if self.config.simulated_packet_loss > 0.0 && self.host.random_unit() < self.config.simulated_packet_loss {
            trace!("connection {:?}: RECVDROP", self.peer_addr);
            return Err(PacketDropReason::SimulatedLoss);
        }

        let mut stream = BitStream::from_bytes(datagram.to_vec());
        let new_data_packet = self.read_packet_header(&mut stream)?;
        self.last_packet_recv_time = Some(self.host.now());

        if new_data_packet {
            let data = stream.read_byte_buffer();
            let sequence = self.window.last_seq_recvd;
            self.host.post_event(ConnectionEvent::Packet { sequence, data });
        }
        Ok(())
    }

    /// Reads and applies the notify-protocol header. Returns true if the
    /// packet is a data packet whose payload should be decoded.
    fn read_packet_header(&mut self, stream: &mut BitStream) -> Result<bool, PacketDropReason> {
        let prefix = packet_header::read_header_prefix(stream)?;

        let pk_sequence_number = self
            .window
            .reconstruct_sequence(prefix.partial_sequence)
            .ok_or(PacketDropReason::OutOfWindowSequence)?;
        let pk_highest_ack = self
            .window
            .reconstruct_highest_ack(prefix.partial_highest_ack)
            .ok_or(PacketDropReason::OutOfWindowAck)?;

        if let Some(the_cipher) = &self.cipher {
            let counter = PacketCounter {
                sequence: pk_sequence_number,
                ack_sequence: pk_highest_ack,
                packet_type: prefix.packet_type as u8,
            };
            if !cipher::verify_and_decrypt(the_cipher, &counter, stream, HEADER_BYTES) {
                debug!("connection {:?}: packet failed crypto", self.peer_addr);
                return Err(PacketDropReason::CryptoRejected);
            }
        }

        let (_ack_byte_count, pk_ack_mask) = packet_header::read_ack_section(stream)?;
        let packet_type = PacketType::try_from(prefix.packet_type as u8)
            .map_err(|_| PacketDropReason::MalformedHeader)?;

        // shift up the ack mask by the sequence delta; this records every
        // packet in the gap as dropped
        let ack_mask_shift = pk_sequence_number.wrapping_sub(self.window.last_seq_recvd);
        self.window.shift_ack_mask(ack_mask_shift, packet_type == PacketType::Data);

        // notify for each bit of progress in the peer's highest-ack
        let notify_count = pk_highest_ack.wrapping_sub(self.window.highest_acked_seq);
        for i in 0..notify_count {
            let notify_index = self.window.highest_acked_seq.wrapping_add(i + 1);
            let offset = pk_highest_ack.wrapping_sub(notify_index);
            let delivered =
                (pk_ack_mask[(offset >> 5) as usize] >> (offset & 0x1F)) & 1 == 1;

            trace!("connection {:?}: notify {} {}", self.peer_addr, notify_index, delivered);
            self.host.post_event(ConnectionEvent::PacketNotify {
                sequence: notify_index,
                delivered,
            });

            if delivered {
                self.window.last_recv_ack_ack =
                    self.window.last_seq_recvd_at_send[(notify_index & PACKET_WINDOW_MASK) as usize];
            }
        }

        // the peer cannot possibly be missing acks older than a full window
        if pk_sequence_number.wrapping_sub(self.window.last_recv_ack_ack) > PACKET_WINDOW_SIZE {
            self.window.last_recv_ack_ack = pk_sequence_number.wrapping_sub(PACKET_WINDOW_SIZE);
        }

        self.window.highest_acked_seq = pk_highest_ack;

        self.keep_alive();

        let prev_last_sequence = self.window.last_seq_recvd;
        self.window.last_seq_recvd = pk_sequence_number;

        // ack back any pings or half-full windows so ack progress never
        // depends on the application having data to send
        if packet_type == PacketType::Ping
            || pk_sequence_number.wrapping_sub(self.window.last_recv_ack_ack) > PACKET_WINDOW_SIZE / 2
        {
            self.send_ack_packet();
        }

        Ok(prev_last_sequence != pk_sequence_number && packet_type == PacketType::Data)
    }

    /// Stops any timeout action in progress; called for every successfully
    /// read packet.
    fn keep_alive(&mut self) {
        self.last_ping_send_time = None;
        self.ping_send_count = 0;
    }

    /// Checks whether the connection timed out, sending a ping if it has been
    /// quiet for too long. Returns true once the retry budget is exhausted;
    /// the caller then terminates the connection.
    pub fn check_timeout(&mut self, current_time: Instant) -> bool {
        let last_ping = *self.last_ping_send_time.get_or_insert(current_time);

        if current_time.duration_since(last_ping) > self.config.ping_timeout {
            if self.ping_send_count >= self.config.ping_retry_count {
                return true;
            }
            self.last_ping_send_time = Some(current_time);
            self.ping_send_count += 1;
            self.send_ping_packet();
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{MockConnectionHost, NullConnectDataCodec};
    use crate::sequence::SEQUENCE_WINDOW_SIZE;
    use rstest::*;
    use std::sync::Mutex;
    use std::time::Duration;

    type Events = Arc<Mutex<Vec<ConnectionEvent>>>;
    type Sent = Arc<Mutex<Vec<Vec<u8>>>>;

    fn test_addr() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 9999))
    }

    fn recording_host(initial_send_seq: u32, random_unit: f32) -> (MockConnectionHost, Events, Sent) {
        let events: Events = Arc::new(Mutex::new(Vec::new()));
        let sent: Sent = Arc::new(Mutex::new(Vec::new()));

        let mut host = MockConnectionHost::new();
        host.expect_random_u32().return_const(initial_send_seq);
        host.expect_random_bytes().returning(|buf| buf.fill(7));
        host.expect_random_unit().return_const(random_unit);
        host.expect_now().returning(Instant::now);
        host.expect_send_to_delayed().returning(|_, _, _| ());
        {
            let sent = sent.clone();
            host.expect_send_to()
                .returning(move |_, datagram| sent.lock().unwrap().push(datagram.to_vec()));
        }
        {
            let events = events.clone();
            host.expect_post_event()
                .returning(move |event| events.lock().unwrap().push(event));
        }
        (host, events, sent)
    }

    fn connected(initial_send_seq: u32, initial_recv_seq: u32) -> (Connection, Events, Sent) {
        let (host, events, sent) = recording_host(initial_send_seq, 1.0);
        let mut conn = Connection::new(
            Arc::new(host),
            test_addr(),
            ConnectionConfig::default(),
            Arc::new(NullConnectDataCodec),
        );
        conn.set_state(ConnectionState::Connected);
        conn.set_initial_recv_sequence(initial_recv_seq);
        (conn, events, sent)
    }

    /// Builds a packet as the peer would: its send sequence and its record
    /// of our packets become our received sequence and highest ack.
    fn peer_packet(
        packet_type: PacketType,
        peer_seq: u32,
        acked_seq: u32,
        ack_byte_count: u32,
        ack_mask: u32,
    ) -> BitStream {
        let mut stream = BitStream::new();
        packet_header::write_header(&mut stream, packet_type, peer_seq, acked_seq, ack_byte_count, &[ack_mask]);
        stream
    }

    fn notify_events(events: &Events) -> Vec<(u32, bool)> {
        events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                ConnectionEvent::PacketNotify { sequence, delivered } => Some((*sequence, *delivered)),
                _ => None,
            })
            .collect()
    }

    fn packet_type_of(datagram: &[u8]) -> u8 {
        datagram[0] & 0b11
    }

    #[test]
    fn test_sequential_ack() {
        let (mut conn, events, _sent) = connected(100, 500);

        for expected in 101..=110 {
            assert_eq!(conn.send_data_packet(b"x"), SendResult::Sent { sequence: expected });
        }

        // peer received everything and reports highest ack 110, bitmap 0x3FF
        let packet = peer_packet(PacketType::Ack, 501, 110, 2, 0x3FF);
        conn.read_raw_packet(packet.as_bytes()).unwrap();

        let expected: Vec<(u32, bool)> = (101..=110).map(|s| (s, true)).collect();
        assert_eq!(notify_events(&events), expected);
        assert_eq!(conn.window.highest_acked_seq, 110);
        assert_eq!(conn.window.last_seq_recvd, 501);
    }

    #[test]
    fn test_gap_then_recovery() {
        let (mut conn, events, _sent) = connected(100, 500);

        for _ in 0..5 {
            conn.send_data_packet(b"x");
        }

        // peer got only 103 and 105: bit 0 (105) and bit 2 (103)
        let packet = peer_packet(PacketType::Ack, 501, 105, 1, 0b101);
        conn.read_raw_packet(packet.as_bytes()).unwrap();

        assert_eq!(
            notify_events(&events),
            vec![(101, false), (102, false), (103, true), (104, false), (105, true)]
        );
        assert_eq!(conn.window.highest_acked_seq, 105);
    }

    #[test]
    fn test_notifies_not_repeated_for_resent_ack() {
        let (mut conn, events, _sent) = connected(100, 500);
        for _ in 0..5 {
            conn.send_data_packet(b"x");
        }

        let packet = peer_packet(PacketType::Ack, 501, 105, 1, 0x1F);
        conn.read_raw_packet(packet.as_bytes()).unwrap();
        let first = notify_events(&events);

        conn.read_raw_packet(packet.as_bytes()).unwrap();
        assert_eq!(notify_events(&events), first);
        assert_eq!(conn.window.last_seq_recvd, 501);
    }

    #[test]
    fn test_sequence_wrap_accepted() {
        let (mut conn, events, _sent) = connected(100, SEQUENCE_WINDOW_SIZE - 1);

        let mut packet = peer_packet(PacketType::Data, SEQUENCE_WINDOW_SIZE, 100, 0, 0);
        packet.write_byte_buffer(b"hi");
        conn.read_raw_packet(packet.as_bytes()).unwrap();

        assert_eq!(conn.window.last_seq_recvd, SEQUENCE_WINDOW_SIZE);
        assert_eq!(conn.window.ack_mask[0], 1);
        assert_eq!(
            events.lock().unwrap().last(),
            Some(&ConnectionEvent::Packet { sequence: SEQUENCE_WINDOW_SIZE, data: b"hi".to_vec() })
        );
    }

    #[test]
    fn test_out_of_window_sequence_dropped() {
        let (mut conn, events, _sent) = connected(100, 50);

        let mut packet = peer_packet(PacketType::Data, 100, 100, 0, 0);
        packet.write_byte_buffer(b"hi");

        assert_eq!(
            conn.read_raw_packet(packet.as_bytes()),
            Err(PacketDropReason::OutOfWindowSequence)
        );
        assert_eq!(conn.window.last_seq_recvd, 50);
        assert!(events.lock().unwrap().is_empty());
    }

    #[test]
    fn test_out_of_window_ack_dropped() {
        let (mut conn, events, _sent) = connected(100, 50);

        // peer claims an ack for sequence 105, but we never sent past 100
        let packet = peer_packet(PacketType::Ack, 51, 105, 0, 0);
        assert_eq!(
            conn.read_raw_packet(packet.as_bytes()),
            Err(PacketDropReason::OutOfWindowAck)
        );
        assert!(events.lock().unwrap().is_empty());
    }

    fn encrypted_peer_packet(the_cipher: &SymmetricCipher, peer_seq: u32, acked_seq: u32) -> Vec<u8> {
        let mut stream = peer_packet(PacketType::Data, peer_seq, acked_seq, 0, 0);
        stream.write_byte_buffer(b"secret");
        let counter = PacketCounter {
            sequence: peer_seq,
            ack_sequence: acked_seq,
            packet_type: PacketType::Data.into(),
        };
        cipher::encrypt_and_sign(the_cipher, &counter, &mut stream, HEADER_BYTES);
        stream.into_bytes()
    }

    #[test]
    fn test_encrypted_packet_roundtrip() {
        let (mut conn, events, _sent) = connected(100, 50);
        conn.set_symmetric_cipher(SymmetricCipher::new(&[1; 16], &[2; 16]));

        let packet = encrypted_peer_packet(&SymmetricCipher::new(&[1; 16], &[2; 16]), 51, 100);
        conn.read_raw_packet(&packet).unwrap();

        assert_eq!(
            events.lock().unwrap().last(),
            Some(&ConnectionEvent::Packet { sequence: 51, data: b"secret".to_vec() })
        );
    }

    #[test]
    fn test_mac_corruption_rejected() {
        let (mut conn, events, _sent) = connected(100, 50);
        conn.set_symmetric_cipher(SymmetricCipher::new(&[1; 16], &[2; 16]));

        let mut packet = encrypted_peer_packet(&SymmetricCipher::new(&[1; 16], &[2; 16]), 51, 100);
        packet[HEADER_BYTES] ^= 0x10; // first ciphertext byte

        assert_eq!(conn.read_raw_packet(&packet), Err(PacketDropReason::CryptoRejected));
        assert_eq!(conn.window.last_seq_recvd, 50);
        assert!(events.lock().unwrap().is_empty());
    }

    #[test]
    fn test_window_full_refuses_send() {
        let (mut conn, _events, sent) = connected(100, 500);

        for i in 0..PACKET_WINDOW_SIZE - 2 {
            assert_eq!(conn.send_data_packet(b"x"), SendResult::Sent { sequence: 101 + i });
        }
        assert!(conn.window_full());
        assert_eq!(conn.send_data_packet(b"x"), SendResult::WindowFull);

        // refused send had no side effects
        assert_eq!(conn.window.last_send_seq, 100 + PACKET_WINDOW_SIZE - 2);
        assert_eq!(sent.lock().unwrap().len(), (PACKET_WINDOW_SIZE - 2) as usize);
    }

    #[test]
    fn test_data_packet_requires_connected_state() {
        let (host, _events, sent) = recording_host(100, 1.0);
        let mut conn = Connection::new(
            Arc::new(host),
            test_addr(),
            ConnectionConfig::default(),
            Arc::new(NullConnectDataCodec),
        );

        assert_eq!(conn.send_data_packet(b"x"), SendResult::NotConnected);
        assert!(sent.lock().unwrap().is_empty());
    }

    #[test]
    fn test_ping_triggers_ack_response() {
        let (mut conn, _events, sent) = connected(100, 500);

        let packet = peer_packet(PacketType::Ping, 501, 100, 0, 0);
        conn.read_raw_packet(packet.as_bytes()).unwrap();

        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(packet_type_of(&sent[0]), u8::from(PacketType::Ack));
    }

    #[test]
    fn test_half_window_without_ack_ack_triggers_ack() {
        let (mut conn, _events, sent) = connected(100, 500);

        // drive the peer's sequence forward without it ever learning that we
        // ack; past half a window we must volunteer an ack packet
        for peer_seq in 501..=501 + PACKET_WINDOW_SIZE / 2 {
            let mut packet = peer_packet(PacketType::Data, peer_seq, 100, 0, 0);
            packet.write_byte_buffer(b"d");
            conn.read_raw_packet(packet.as_bytes()).unwrap();
        }

        let sent = sent.lock().unwrap();
        assert!(!sent.is_empty());
        assert!(sent.iter().all(|d| packet_type_of(d) == u8::from(PacketType::Ack)));
    }

    #[rstest]
    #[case::default_retries(5)]
    #[case::single_retry(1)]
    fn test_timeout_after_ping_retries(#[case] retries: u32) {
        let (mut conn, events, sent) = connected(100, 500);
        conn.set_ping_timeouts(Duration::from_millis(5_000), retries);

        let t0 = Instant::now();
        assert!(!conn.check_timeout(t0)); // baselines the timer

        let step = Duration::from_millis(5_001);
        for i in 1..=retries {
            assert!(!conn.check_timeout(t0 + step * i));
        }

        {
            let sent = sent.lock().unwrap();
            assert_eq!(sent.len(), retries as usize);
            assert!(sent.iter().all(|d| packet_type_of(d) == u8::from(PacketType::Ping)));
        }

        assert!(conn.check_timeout(t0 + step * (retries + 1)));
        assert!(events.lock().unwrap().is_empty()); // the caller posts the event

        conn.on_timed_out();
        assert_eq!(conn.state(), ConnectionState::TimedOut);
        assert_eq!(
            events.lock().unwrap().as_slice(),
            &[ConnectionEvent::TimedOut { data: Vec::new() }]
        );
    }

    #[test]
    fn test_received_packet_resets_ping_counter() {
        let (mut conn, _events, _sent) = connected(100, 500);

        let t0 = Instant::now();
        conn.check_timeout(t0);
        conn.check_timeout(t0 + Duration::from_millis(5_001));
        conn.check_timeout(t0 + Duration::from_millis(10_002));
        assert_eq!(conn.ping_send_count, 2);

        let packet = peer_packet(PacketType::Ack, 501, 100, 0, 0);
        conn.read_raw_packet(packet.as_bytes()).unwrap();

        assert_eq!(conn.ping_send_count, 0);
        assert!(conn.last_ping_send_time.is_none());
    }

    #[test]
    fn test_simulated_send_loss_consumes_sequence() {
        let (host, _events, sent) = recording_host(100, 0.0); // every draw drops
        let mut conn = Connection::new(
            Arc::new(host),
            test_addr(),
            ConnectionConfig::default(),
            Arc::new(NullConnectDataCodec),
        );
        conn.set_state(ConnectionState::Connected);
        conn.set_initial_recv_sequence(500);
        conn.set_simulated_net_params(0.5, Duration::ZERO);

        assert_eq!(conn.send_data_packet(b"x"), SendResult::Sent { sequence: 101 });
        assert!(sent.lock().unwrap().is_empty());
        assert_eq!(conn.window.last_send_seq, 101);
    }

    #[test]
    fn test_simulated_recv_loss_drops_silently() {
        let (host, events, _sent) = recording_host(100, 0.0);
        let mut conn = Connection::new(
            Arc::new(host),
            test_addr(),
            ConnectionConfig::default(),
            Arc::new(NullConnectDataCodec),
        );
        conn.set_state(ConnectionState::Connected);
        conn.set_initial_recv_sequence(500);
        conn.set_simulated_net_params(0.5, Duration::ZERO);

        let mut packet = peer_packet(PacketType::Data, 501, 100, 0, 0);
        packet.write_byte_buffer(b"hi");
        assert_eq!(conn.read_raw_packet(packet.as_bytes()), Err(PacketDropReason::SimulatedLoss));
        assert_eq!(conn.window.last_seq_recvd, 500);
        assert!(events.lock().unwrap().is_empty());
    }

    #[test]
    fn test_simulated_latency_routes_through_delayed_send() {
        let delayed: Sent = Arc::new(Mutex::new(Vec::new()));
        let sent: Sent = Arc::new(Mutex::new(Vec::new()));

        let mut host = MockConnectionHost::new();
        host.expect_random_u32().return_const(100u32);
        host.expect_random_bytes().returning(|buf| buf.fill(7));
        host.expect_random_unit().return_const(1.0f32);
        host.expect_now().returning(Instant::now);
        {
            let sent = sent.clone();
            host.expect_send_to()
                .returning(move |_, datagram| sent.lock().unwrap().push(datagram.to_vec()));
        }
        {
            let delayed = delayed.clone();
            host.expect_send_to_delayed()
                .returning(move |_, datagram, _| delayed.lock().unwrap().push(datagram.to_vec()));
        }
        host.expect_post_event().returning(|_| ());

        let mut conn = Connection::new(
            Arc::new(host),
            test_addr(),
            ConnectionConfig::default(),
            Arc::new(NullConnectDataCodec),
        );
        conn.set_state(ConnectionState::Connected);
        conn.set_initial_recv_sequence(500);
        conn.set_simulated_net_params(0.0, Duration::from_millis(50));

        conn.send_data_packet(b"x");
        assert_eq!(delayed.lock().unwrap().len(), 1);
        assert!(sent.lock().unwrap().is_empty());
    }

    #[test]
    fn test_disconnect_posts_single_terminal_event() {
        let (mut conn, events, _sent) = connected(100, 500);

        conn.disconnect(b"bye");
        conn.disconnect(b"again");

        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert_eq!(
            events.lock().unwrap().as_slice(),
            &[ConnectionEvent::Disconnected { data: b"bye".to_vec() }]
        );
    }

    #[test]
    fn test_monotonic_progress() {
        let (mut conn, _events, _sent) = connected(100, 500);

        for _ in 0..6 {
            conn.send_data_packet(b"x");
        }

        let packet = peer_packet(PacketType::Ack, 501, 103, 1, 0b111);
        conn.read_raw_packet(packet.as_bytes()).unwrap();
        assert_eq!(conn.window.highest_acked_seq, 103);

        // an older (but in-window) ack anchor cannot move progress backwards
        let packet = peer_packet(PacketType::Ack, 502, 103, 1, 0b111);
        conn.read_raw_packet(packet.as_bytes()).unwrap();
        assert_eq!(conn.window.highest_acked_seq, 103);
        assert_eq!(conn.window.last_seq_recvd, 502);
    }
}

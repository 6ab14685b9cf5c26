//! The host interface: socket ownership, packet routing, the connection
//! handshake and the upward event queue.
//!
//! Datagrams whose first byte has the high bit set belong to the connected
//! protocol and are dispatched to their connection. Everything else is a
//! handshake packet, identified by its first byte:
//!
//! ```ascii
//! challenge request:  type(u8) initiator_nonce(8)
//! challenge response: type(u8) initiator_nonce(8) host_nonce(8)
//!                     client_identity(u32) puzzle_difficulty(ranged)
//!                     host_public_key(buffer)
//! connect request:    type(u8) initiator_nonce(8) host_nonce(8)
//!                     client_identity(u32) puzzle_difficulty(ranged)
//!                     puzzle_solution(u32) initiator_public_key(buffer)
//!                     || symmetric_key(16) initial_send_seq(u32)
//!                        connect_data(buffer) [custom request data]
//! connect accept:     type(u8) initiator_nonce(8) host_nonce(8)
//!                     || initial_send_seq(u32) init_vector(16)
//!                        [custom accept data]
//! connect reject:     type(u8) initiator_nonce(8) host_nonce(8)
//!                     reason(u8) reason_data(buffer)
//! disconnect:         type(u8) initiator_nonce(8) host_nonce(8)
//!                     reason_data(buffer)
//! ```
//!
//! `||` marks the encryption boundary: the remainder is encrypted and signed
//! with a cipher keyed from the X25519 shared secret, so the symmetric key
//! and initial sequences never travel in the clear.
//!
//! The challenge exchange commits no host-side state: the challenge response
//! carries an identity token (a keyed hash of the initiator's address and
//! nonce) that must be echoed in the connect request, and the connect request
//! must carry a valid client-puzzle solution before a connection object is
//! created.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use bytes::BytesMut;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use rand::{Rng, RngCore};
use rustc_hash::FxHashMap;
use sha2::{Digest, Sha256};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};
use x25519_dalek::StaticSecret;

use crate::bit_stream::BitStream;
use crate::cipher::{self, PacketCounter, SymmetricCipher};
use crate::client_puzzle::{self, ClientPuzzleManager, SolutionCheck, MAX_PUZZLE_DIFFICULTY};
use crate::config::InterfaceConfig;
use crate::connection::{Connection, ConnectionState};
use crate::connection_params::Nonce;
use crate::error::{SendResult, TerminationReason};
use crate::event::{ConnectionEvent, InterfaceEvent};
use crate::host::{ConnectDataCodec, ConnectionHost, NullConnectDataCodec};

/// First-byte identifiers of handshake packets. Values stay below 0x80 so
/// they can never collide with connected-protocol packets.
#[derive(Debug, Clone, Copy, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
enum HandshakePacketType {
    ConnectChallengeRequest = 0,
    ConnectChallengeResponse = 1,
    ConnectRequest = 2,
    ConnectReject = 3,
    ConnectAccept = 4,
    Disconnect = 5,
    Punch = 6,
    ArrangedConnectRequest = 7,
}

/// Abstraction over the outgoing half of the UDP socket, introduced so the
/// I/O can be faked in tests.
pub trait DatagramSocket: Send + Sync + 'static {
    fn send_datagram(&self, to: SocketAddr, datagram: &[u8]);

    fn send_datagram_delayed(&self, to: SocketAddr, datagram: &[u8], delay: Duration);

    fn local_addr(&self) -> SocketAddr;
}

impl DatagramSocket for Arc<UdpSocket> {
    fn send_datagram(&self, to: SocketAddr, datagram: &[u8]) {
        trace!("UDP socket: sending {} bytes to {:?}", datagram.len(), to);
        if let Err(e) = self.try_send_to(datagram, to) {
            error!("error sending UDP packet to {:?}: {}", to, e);
        }
    }

    fn send_datagram_delayed(&self, to: SocketAddr, datagram: &[u8], delay: Duration) {
        let socket = self.clone();
        let datagram = datagram.to_vec();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            socket.send_datagram(to, &datagram);
        });
    }

    fn local_addr(&self) -> SocketAddr {
        self.as_ref()
            .local_addr()
            .expect("UdpSocket should have an initialized local addr")
    }
}

/// The capabilities shared between the interface and the host handles it
/// hands to its connections.
struct InterfaceShared {
    socket: Arc<dyn DatagramSocket>,
    event_tx: mpsc::UnboundedSender<InterfaceEvent>,
}

impl InterfaceShared {
    fn post(&self, peer: SocketAddr, event: ConnectionEvent) {
        // the receiver is only dropped when the application shuts down
        let _ = self.event_tx.send(InterfaceEvent { peer, event });
    }

    fn send(&self, to: SocketAddr, stream: BitStream) {
        self.socket.send_datagram(to, &stream.into_bytes());
    }
}

/// Per-connection host handle passed into [`Connection::new`].
struct InterfaceHostHandle {
    shared: Arc<InterfaceShared>,
    peer: SocketAddr,
}

impl ConnectionHost for InterfaceHostHandle {
    fn send_to(&self, addr: SocketAddr, datagram: &[u8]) {
        self.shared.socket.send_datagram(addr, datagram);
    }

    fn send_to_delayed(&self, addr: SocketAddr, datagram: &[u8], delay: Duration) {
        self.shared.socket.send_datagram_delayed(addr, datagram, delay);
    }

    fn now(&self) -> Instant {
        Instant::now()
    }

    fn random_u32(&self) -> u32 {
        rand::rng().next_u32()
    }

    fn random_unit(&self) -> f32 {
        rand::rng().random()
    }

    fn random_bytes(&self, buf: &mut [u8]) {
        rand::rng().fill_bytes(buf);
    }

    fn post_event(&self, event: ConnectionEvent) {
        self.shared.post(self.peer, event);
    }
}

/// A connection that has not completed its handshake yet, with its retry
/// bookkeeping.
struct PendingConnection {
    conn: Connection,
    last_send_time: Instant,
    send_count: u32,
    /// Trial value for the incremental puzzle search.
    trial_solution: u32,
}

/// Owns the UDP socket and all connections communicating through it.
///
/// The interface is driven either by [`run`](Interface::run) (the production
/// receive loop) or by calling [`handle_datagram`](Interface::handle_datagram)
/// and [`tick`](Interface::tick) directly. All connection processing happens
/// on the caller's task; connections never lock.
pub struct Interface {
    shared: Arc<InterfaceShared>,
    udp: Option<Arc<UdpSocket>>,
    config: InterfaceConfig,
    codec: Arc<dyn ConnectDataCodec>,

    connections: FxHashMap<SocketAddr, Connection>,
    pending: FxHashMap<SocketAddr, PendingConnection>,

    puzzle_manager: ClientPuzzleManager,
    private_key: StaticSecret,
    /// Keyed into the client-identity hash to make tokens unforgeable.
    random_hash_data: [u8; 12],

    last_timeout_check: Option<Instant>,
}

impl Interface {
    /// Creates an interface over an arbitrary datagram socket. Returns the
    /// interface and the receiver for its upward event queue.
    pub fn new(
        socket: Arc<dyn DatagramSocket>,
        config: InterfaceConfig,
        codec: Arc<dyn ConnectDataCodec>,
    ) -> anyhow::Result<(Interface, mpsc::UnboundedReceiver<InterfaceEvent>)> {
        config.validate()?;

        let mut rng = rand::rng();
        let mut key_bytes = [0u8; 32];
        rng.fill_bytes(&mut key_bytes);
        let mut random_hash_data = [0u8; 12];
        rng.fill_bytes(&mut random_hash_data);

        let puzzle_manager = ClientPuzzleManager::new(
            config.puzzle_difficulty,
            random_nonce(&mut rng),
            random_nonce(&mut rng),
        );

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let interface = Interface {
            shared: Arc::new(InterfaceShared { socket, event_tx }),
            udp: None,
            config,
            codec,
            connections: FxHashMap::default(),
            pending: FxHashMap::default(),
            puzzle_manager,
            private_key: StaticSecret::from(key_bytes),
            random_hash_data,
            last_timeout_check: None,
        };
        Ok((interface, event_rx))
    }

    /// Binds a UDP socket and creates an interface over it.
    pub async fn bind(
        addr: SocketAddr,
        config: InterfaceConfig,
    ) -> anyhow::Result<(Interface, mpsc::UnboundedReceiver<InterfaceEvent>)> {
        let socket = Arc::new(UdpSocket::bind(addr).await.context("binding interface socket")?);
        info!("bound interface socket to {:?}", UdpSocket::local_addr(&socket)?);

        let (mut interface, event_rx) =
            Interface::new(Arc::new(socket.clone()), config, Arc::new(NullConnectDataCodec))?;
        interface.udp = Some(socket);
        Ok((interface, event_rx))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.shared.socket.local_addr()
    }

    /// Replaces the connect-data codec used for subsequently created
    /// connections.
    pub fn set_connect_data_codec(&mut self, codec: Arc<dyn ConnectDataCodec>) {
        self.codec = codec;
    }

    pub fn is_established(&self, addr: SocketAddr) -> bool {
        self.connections.get(&addr).map(Connection::is_established).unwrap_or(false)
    }

    /// Sends a data packet on the connection to `addr`.
    pub fn send(&mut self, addr: SocketAddr, payload: &[u8]) -> SendResult {
        match self.connections.get_mut(&addr) {
            Some(conn) => conn.send_data_packet(payload),
            None => SendResult::NotConnected,
        }
    }

    /// Initiates a connection to a remote host.
    pub fn connect(&mut self, addr: SocketAddr, connect_data: Vec<u8>) {
        if self.connections.contains_key(&addr) {
            self.disconnect(addr, b"reconnecting");
        }

        let handle = self.host_handle(addr);
        let mut conn = Connection::new(handle, addr, self.config.connection.clone(), self.codec.clone());
        conn.params_mut().is_initiator = true;
        conn.params_mut().connect_data = connect_data;
        conn.set_state(ConnectionState::AwaitingChallengeResponse);

        debug!("sending challenge request to {:?}", addr);
        self.shared.send(addr, build_challenge_request(&conn));

        self.pending.insert(
            addr,
            PendingConnection {
                conn,
                last_send_time: Instant::now(),
                send_count: 1,
                trial_solution: 0,
            },
        );
    }

    /// Terminates the connection to `addr`, notifying the peer.
    pub fn disconnect(&mut self, addr: SocketAddr, reason_data: &[u8]) {
        if let Some(mut conn) = self.connections.remove(&addr) {
            let (initiator_nonce, host_nonce) = ordered_nonces(&conn);
            self.shared.send(addr, build_disconnect(initiator_nonce, host_nonce, reason_data));
            conn.disconnect(reason_data);
        } else if let Some(mut pending) = self.pending.remove(&addr) {
            pending.conn.disconnect(reason_data);
        }
    }

    /// Production receive loop: dispatches datagrams and drives the periodic
    /// tick until the socket is closed.
    pub async fn run(&mut self) -> anyhow::Result<()> {
        let socket = self.udp.clone().context("interface was created without a UDP socket")?;
        let mut tick_interval = tokio::time::interval(self.config.timeout_check_interval);
        let mut buf = BytesMut::zeroed(2048);

        info!("starting interface loop on {:?}", self.local_addr());
        loop {
            tokio::select! {
                received = socket.recv_from(&mut buf) => {
                    match received {
                        Ok((len, from)) => self.handle_datagram(from, &buf[..len]),
                        Err(e) => {
                            error!("socket error: {}", e);
                            continue;
                        }
                    }
                }
                _ = tick_interval.tick() => {
                    self.tick(Instant::now());
                }
            }
        }
    }

    /// Dispatches one received datagram.
    pub fn handle_datagram(&mut self, from: SocketAddr, datagram: &[u8]) {
        let Some(&first_byte) = datagram.first() else {
            return;
        };

        if first_byte & 0x80 != 0 {
            match self.connections.get_mut(&from) {
                Some(conn) => {
                    if let Err(reason) = conn.read_raw_packet(datagram) {
                        debug!("dropping packet from {:?}: {:?}", from, reason);
                    }
                }
                None => trace!("connected-protocol packet from unknown peer {:?}", from),
            }
            return;
        }

        let mut stream = BitStream::from_bytes(datagram.to_vec());
        let packet_type = stream.read_integer(8) as u8;
        match HandshakePacketType::try_from(packet_type) {
            Ok(HandshakePacketType::ConnectChallengeRequest) => self.handle_challenge_request(from, &mut stream),
            Ok(HandshakePacketType::ConnectChallengeResponse) => self.handle_challenge_response(from, &mut stream),
            Ok(HandshakePacketType::ConnectRequest) => self.handle_connect_request(from, &mut stream),
            Ok(HandshakePacketType::ConnectReject) => self.handle_connect_reject(from, &mut stream),
            Ok(HandshakePacketType::ConnectAccept) => self.handle_connect_accept(from, &mut stream),
            Ok(HandshakePacketType::Disconnect) => self.handle_disconnect(from, &mut stream),
            // arranged-connection rendezvous is negotiated elsewhere
            Ok(HandshakePacketType::Punch) | Ok(HandshakePacketType::ArrangedConnectRequest) => {
                trace!("ignoring arranged-connection packet from {:?}", from);
            }
            Err(_) => debug!("unknown handshake packet type {} from {:?}", packet_type, from),
        }
    }

    /// Drives retries, puzzle solving, puzzle-nonce rotation and the
    /// connection timeout sweep.
    pub fn tick(&mut self, now: Instant) {
        let mut rng = rand::rng();
        let fresh = random_nonce(&mut rng);
        self.puzzle_manager.tick(now, fresh);

        self.continue_pending_puzzles();
        self.retry_pending(now);

        let last_check = *self.last_timeout_check.get_or_insert(now);
        if now.duration_since(last_check) >= self.config.timeout_check_interval {
            self.last_timeout_check = Some(now);
            self.check_connection_timeouts(now);
        }
    }

    fn check_connection_timeouts(&mut self, now: Instant) {
        let mut timed_out = Vec::new();
        for (addr, conn) in self.connections.iter_mut() {
            if conn.check_timeout(now) {
                timed_out.push(*addr);
            }
        }

        for addr in timed_out {
            warn!("connection {:?} timed out", addr);
            if let Some(mut conn) = self.connections.remove(&addr) {
                conn.on_timed_out();
            }
        }
    }

    fn retry_pending(&mut self, now: Instant) {
        let shared = self.shared.clone();
        let config = self.config.clone();
        let mut expired = Vec::new();

        for (&addr, pending) in self.pending.iter_mut() {
            let (interval, retry_count) = match pending.conn.state() {
                ConnectionState::AwaitingChallengeResponse => {
                    (config.challenge_retry_interval, config.challenge_retry_count)
                }
                ConnectionState::AwaitingConnectResponse => {
                    (config.connect_retry_interval, config.connect_retry_count)
                }
                _ => continue,
            };

            if now.duration_since(pending.last_send_time) < interval {
                continue;
            }
            if pending.send_count >= retry_count {
                expired.push(addr);
                continue;
            }

            pending.last_send_time = now;
            pending.send_count += 1;
            match pending.conn.state() {
                ConnectionState::AwaitingChallengeResponse => {
                    debug!("re-sending challenge request to {:?}", addr);
                    shared.send(addr, build_challenge_request(&pending.conn));
                }
                ConnectionState::AwaitingConnectResponse => {
                    debug!("re-sending connect request to {:?}", addr);
                    shared.send(addr, build_connect_request(&pending.conn));
                }
                _ => {}
            }
        }

        for addr in expired {
            if let Some(mut pending) = self.pending.remove(&addr) {
                warn!("connection attempt to {:?} timed out", addr);
                pending.conn.set_state(ConnectionState::ConnectTimedOut);
                self.shared.post(addr, ConnectionEvent::TimedOut { data: Vec::new() });
            }
        }
    }

    fn continue_pending_puzzles(&mut self) {
        let addrs: Vec<SocketAddr> = self
            .pending
            .iter()
            .filter(|(_, p)| p.conn.state() == ConnectionState::ComputingPuzzleSolution)
            .map(|(addr, _)| *addr)
            .collect();
        for addr in addrs {
            self.continue_puzzle(addr);
        }
    }

    /// Spends one iteration budget on the pending connection's puzzle; sends
    /// the connect request once a solution is found.
    fn continue_puzzle(&mut self, addr: SocketAddr) {
        let shared = self.shared.clone();
        let Some(pending) = self.pending.get_mut(&addr) else {
            return;
        };

        let params = pending.conn.params();
        let solved = {
            let (initiator_nonce, host_nonce) = (params.local_nonce, params.peer_nonce);
            let (difficulty, identity) = (params.puzzle_difficulty, params.client_identity);
            client_puzzle::solve_puzzle(
                &mut pending.trial_solution,
                &initiator_nonce,
                &host_nonce,
                difficulty,
                identity,
            )
        };
        if !solved {
            return;
        }

        debug!("puzzle solved for {:?}, sending connect request", addr);
        pending.conn.params_mut().puzzle_solution = pending.trial_solution;
        pending.conn.set_state(ConnectionState::AwaitingConnectResponse);
        pending.last_send_time = Instant::now();
        pending.send_count = 1;
        shared.send(addr, build_connect_request(&pending.conn));
    }

    fn handle_challenge_request(&mut self, from: SocketAddr, stream: &mut BitStream) {
        if !self.config.allow_connections {
            return;
        }
        let Some(initiator_nonce) = read_nonce(stream) else {
            return;
        };

        // deliberately stateless: the identity token proves address
        // reachability before any per-connection state is committed
        let identity = self.client_identity(from, &initiator_nonce);

        let mut out = BitStream::new();
        out.write_integer(u8::from(HandshakePacketType::ConnectChallengeResponse) as u32, 8);
        out.write_bytes(&initiator_nonce.0);
        out.write_bytes(&self.puzzle_manager.current_nonce().0);
        out.write_integer(identity, 32);
        out.write_ranged_u32(self.puzzle_manager.current_difficulty(), 0, MAX_PUZZLE_DIFFICULTY);
        out.write_byte_buffer(x25519_dalek::PublicKey::from(&self.private_key).as_bytes());

        trace!("sending challenge response to {:?}", from);
        self.shared.send(from, out);
    }

    fn handle_challenge_response(&mut self, from: SocketAddr, stream: &mut BitStream) {
        let Some(echoed_nonce) = read_nonce(stream) else {
            return;
        };
        let Some(host_nonce) = read_nonce(stream) else {
            return;
        };
        let identity = stream.read_integer(32);
        let difficulty = stream.read_ranged_u32(0, MAX_PUZZLE_DIFFICULTY);
        let public_key = stream.read_byte_buffer();

        let Some(pending) = self.pending.get_mut(&from) else {
            return;
        };
        if pending.conn.state() != ConnectionState::AwaitingChallengeResponse {
            return;
        }
        if pending.conn.params().local_nonce != echoed_nonce {
            debug!("challenge response from {:?} with wrong nonce - ignoring", from);
            return;
        }
        if difficulty > MAX_PUZZLE_DIFFICULTY || stream.overrun() {
            debug!("malformed challenge response from {:?}", from);
            return;
        }
        let Ok(public_key) = <[u8; 32]>::try_from(public_key.as_slice()) else {
            debug!("challenge response from {:?} with bad public key length", from);
            return;
        };
        if !pending.conn.codec().validate_public_key(&public_key, true) {
            debug!("rejecting host public key from {:?}", from);
            return;
        }

        let mut rng = rand::rng();
        let mut key_bytes = [0u8; 32];
        rng.fill_bytes(&mut key_bytes);

        {
            let params = pending.conn.params_mut();
            params.peer_nonce = host_nonce;
            params.client_identity = identity;
            params.puzzle_difficulty = difficulty;
            params.peer_public_key = Some(public_key);
            params.private_key = Some(StaticSecret::from(key_bytes));
            params.compute_shared_secret();
            rng.fill_bytes(&mut params.symmetric_key);
        }

        debug!("received challenge from {:?}, difficulty {}", from, difficulty);
        pending.conn.set_state(ConnectionState::ComputingPuzzleSolution);
        pending.trial_solution = 0;
        self.continue_puzzle(from);
    }

    fn handle_connect_request(&mut self, from: SocketAddr, stream: &mut BitStream) {
        let Some(initiator_nonce) = read_nonce(stream) else {
            return;
        };
        let Some(host_nonce) = read_nonce(stream) else {
            return;
        };

        // a duplicated connect request for an established connection means
        // our accept was lost - just send it again
        if let Some(existing) = self.connections.get(&from) {
            let params = existing.params();
            if params.peer_nonce == initiator_nonce && params.local_nonce == host_nonce {
                debug!("duplicate connect request from {:?} - re-sending accept", from);
                self.shared.send(from, build_connect_accept(existing));
            }
            return;
        }
        if !self.config.allow_connections {
            return;
        }

        let identity = stream.read_integer(32);
        if identity != self.client_identity(from, &initiator_nonce) {
            debug!("client identity disagreement from {:?}", from);
            return;
        }

        let difficulty = stream.read_ranged_u32(0, MAX_PUZZLE_DIFFICULTY);
        let solution = stream.read_integer(32);
        let check = self.puzzle_manager.check_solution(solution, initiator_nonce, host_nonce, difficulty, identity);
        if check != SolutionCheck::Success {
            debug!("puzzle solution from {:?} rejected: {:?}", from, check);
            self.shared.send(
                from,
                build_connect_reject(initiator_nonce, host_nonce, TerminationReason::FailedPuzzle, &[]),
            );
            return;
        }

        let public_key = stream.read_byte_buffer();
        let Ok(public_key) = <[u8; 32]>::try_from(public_key.as_slice()) else {
            debug!("connect request from {:?} with bad public key length", from);
            return;
        };
        if !self.codec.validate_public_key(&public_key, false) {
            debug!("rejecting initiator public key from {:?}", from);
            return;
        }

        let shared_secret = self
            .private_key
            .diffie_hellman(&x25519_dalek::PublicKey::from(public_key))
            .as_bytes()
            .to_vec();

        stream.align_to_byte();
        let cleartext_bytes = stream.byte_position();
        let handshake_cipher = SymmetricCipher::from_shared_secret(&shared_secret);
        if !cipher::verify_and_decrypt(&handshake_cipher, &PacketCounter::HANDSHAKE, stream, cleartext_bytes) {
            debug!("connect request from {:?} failed crypto", from);
            return;
        }

        let symmetric_key = stream.read_bytes(SymmetricCipher::KEY_SIZE);
        let initial_send_seq = stream.read_integer(32);
        let connect_data = stream.read_byte_buffer();
        if stream.overrun() {
            debug!("truncated connect request from {:?}", from);
            return;
        }
        if let Err(reason) = self.codec.read_request(stream) {
            debug!("connect request from {:?} rejected by application", from);
            self.shared.send(
                from,
                build_connect_reject(initiator_nonce, host_nonce, TerminationReason::RejectedByHost, &reason),
            );
            return;
        }

        let handle = self.host_handle(from);
        let mut conn = Connection::new(handle, from, self.config.connection.clone(), self.codec.clone());
        {
            let params = conn.params_mut();
            params.is_initiator = false;
            params.local_nonce = host_nonce;
            params.peer_nonce = initiator_nonce;
            params.puzzle_difficulty = difficulty;
            params.puzzle_solution = solution;
            params.client_identity = identity;
            params.peer_public_key = Some(public_key);
            params.shared_secret = Some(shared_secret);
            params.symmetric_key.copy_from_slice(&symmetric_key);
            rand::rng().fill_bytes(&mut params.init_vector);
            params.connect_data = connect_data;
        }

        let the_cipher = SymmetricCipher::new(&conn.params().symmetric_key, &conn.params().init_vector);
        conn.set_symmetric_cipher(the_cipher);
        conn.set_initial_recv_sequence(initial_send_seq);

        info!("accepted connection from {:?}", from);
        self.shared.send(from, build_connect_accept(&conn));
        conn.mark_established();
        self.connections.insert(from, conn);
    }

    fn handle_connect_accept(&mut self, from: SocketAddr, stream: &mut BitStream) {
        let Some(initiator_nonce) = read_nonce(stream) else {
            return;
        };
        let Some(host_nonce) = read_nonce(stream) else {
            return;
        };

        {
            let Some(pending) = self.pending.get(&from) else {
                return;
            };
            if pending.conn.state() != ConnectionState::AwaitingConnectResponse {
                return;
            }
            let params = pending.conn.params();
            if params.local_nonce != initiator_nonce || params.peer_nonce != host_nonce {
                debug!("connect accept from {:?} with wrong nonces - ignoring", from);
                return;
            }
        }

        let mut pending = self.pending.remove(&from).expect("pending entry was just checked");
        let shared_secret = pending.conn.params().shared_secret.clone().unwrap_or_default();

        stream.align_to_byte();
        let cleartext_bytes = stream.byte_position();
        let handshake_cipher = SymmetricCipher::from_shared_secret(&shared_secret);
        if !cipher::verify_and_decrypt(&handshake_cipher, &PacketCounter::HANDSHAKE, stream, cleartext_bytes) {
            debug!("connect accept from {:?} failed crypto", from);
            self.pending.insert(from, pending);
            return;
        }

        let initial_send_seq = stream.read_integer(32);
        let init_vector = stream.read_bytes(SymmetricCipher::BLOCK_SIZE);
        if stream.overrun() || !pending.conn.codec().read_accept(stream) {
            debug!("malformed connect accept from {:?}", from);
            self.pending.insert(from, pending);
            return;
        }

        pending.conn.params_mut().init_vector.copy_from_slice(&init_vector);
        let the_cipher = SymmetricCipher::new(
            &pending.conn.params().symmetric_key,
            &pending.conn.params().init_vector,
        );
        pending.conn.set_symmetric_cipher(the_cipher);
        pending.conn.set_initial_recv_sequence(initial_send_seq);

        info!("connection to {:?} established", from);
        pending.conn.mark_established();
        self.connections.insert(from, pending.conn);
    }

    fn handle_connect_reject(&mut self, from: SocketAddr, stream: &mut BitStream) {
        let Some(initiator_nonce) = read_nonce(stream) else {
            return;
        };
        let Some(host_nonce) = read_nonce(stream) else {
            return;
        };
        let reason = stream.read_integer(8) as u8;
        let reason_data = stream.read_byte_buffer();

        let Some(pending) = self.pending.get_mut(&from) else {
            return;
        };
        if !matches!(
            pending.conn.state(),
            ConnectionState::AwaitingConnectResponse | ConnectionState::ComputingPuzzleSolution
        ) {
            return;
        }
        let params = pending.conn.params();
        if params.local_nonce != initiator_nonce || params.peer_nonce != host_nonce {
            return;
        }

        // a stale puzzle solution gets one fresh attempt before giving up
        if reason == u8::from(TerminationReason::FailedPuzzle) && !params.puzzle_retried {
            debug!("puzzle rejected by {:?} - retrying with a fresh challenge", from);
            pending.conn.params_mut().puzzle_retried = true;
            pending.conn.set_state(ConnectionState::AwaitingChallengeResponse);
            pending.last_send_time = Instant::now();
            pending.send_count = 1;
            let request = build_challenge_request(&pending.conn);
            self.shared.send(from, request);
            return;
        }

        warn!("connection to {:?} rejected (reason {})", from, reason);
        pending.conn.set_state(ConnectionState::ConnectRejected);
        self.pending.remove(&from);
        self.shared.post(from, ConnectionEvent::Disconnected { data: reason_data });
    }

    fn handle_disconnect(&mut self, from: SocketAddr, stream: &mut BitStream) {
        let Some(initiator_nonce) = read_nonce(stream) else {
            return;
        };
        let Some(host_nonce) = read_nonce(stream) else {
            return;
        };
        let reason_data = stream.read_byte_buffer();

        if let Some(conn) = self.connections.get(&from) {
            let (our_initiator, our_host) = ordered_nonces(conn);
            if our_initiator != initiator_nonce || our_host != host_nonce {
                debug!("disconnect from {:?} with wrong nonces - ignoring", from);
                return;
            }
            let mut conn = self.connections.remove(&from).expect("connection was just checked");
            conn.disconnect(&reason_data);
        } else if let Some(pending) = self.pending.get(&from) {
            let (our_initiator, our_host) = ordered_nonces(&pending.conn);
            if our_initiator != initiator_nonce || our_host != host_nonce {
                return;
            }
            let mut pending = self.pending.remove(&from).expect("pending entry was just checked");
            pending.conn.disconnect(&reason_data);
        }
    }

    /// The identity token for a connecting peer: a keyed hash of its address
    /// and nonce. Cheap to recompute, impossible to guess without having
    /// seen a challenge response at that address.
    fn client_identity(&self, addr: SocketAddr, nonce: &Nonce) -> u32 {
        let mut hasher = Sha256::new();
        match addr.ip() {
            std::net::IpAddr::V4(ip) => hasher.update(ip.octets()),
            std::net::IpAddr::V6(ip) => hasher.update(ip.octets()),
        }
        hasher.update(addr.port().to_le_bytes());
        hasher.update(nonce.0);
        hasher.update(self.random_hash_data);
        let hash = hasher.finalize();
        u32::from_le_bytes(hash[..4].try_into().unwrap())
    }

    fn host_handle(&self, peer: SocketAddr) -> Arc<dyn ConnectionHost> {
        Arc::new(InterfaceHostHandle {
            shared: self.shared.clone(),
            peer,
        })
    }
}

fn random_nonce(rng: &mut impl RngCore) -> Nonce {
    let mut bytes = [0u8; Nonce::SIZE];
    rng.fill_bytes(&mut bytes);
    Nonce(bytes)
}

fn read_nonce(stream: &mut BitStream) -> Option<Nonce> {
    let bytes = stream.read_bytes(Nonce::SIZE);
    if stream.overrun() {
        return None;
    }
    Nonce::from_slice(&bytes)
}

/// The (initiator, host) nonce pair for a connection, independent of which
/// side we are on.
fn ordered_nonces(conn: &Connection) -> (Nonce, Nonce) {
    let params = conn.params();
    if params.is_initiator {
        (params.local_nonce, params.peer_nonce)
    } else {
        (params.peer_nonce, params.local_nonce)
    }
}

fn build_challenge_request(conn: &Connection) -> BitStream {
    let mut out = BitStream::new();
    out.write_integer(u8::from(HandshakePacketType::ConnectChallengeRequest) as u32, 8);
    out.write_bytes(&conn.params().local_nonce.0);
    out
}

fn build_connect_request(conn: &Connection) -> BitStream {
    let params = conn.params();
    let mut out = BitStream::new();
    out.write_integer(u8::from(HandshakePacketType::ConnectRequest) as u32, 8);
    out.write_bytes(&params.local_nonce.0);
    out.write_bytes(&params.peer_nonce.0);
    out.write_integer(params.client_identity, 32);
    out.write_ranged_u32(params.puzzle_difficulty, 0, MAX_PUZZLE_DIFFICULTY);
    out.write_integer(params.puzzle_solution, 32);
    out.write_byte_buffer(&params.public_key().unwrap_or_default());

    out.align_to_byte();
    let cleartext_bytes = out.byte_position();
    out.write_bytes(&params.symmetric_key);
    out.write_integer(conn.initial_send_sequence(), 32);
    out.write_byte_buffer(&params.connect_data);
    conn.codec().write_request(params, &mut out);

    let handshake_cipher = SymmetricCipher::from_shared_secret(params.shared_secret.as_deref().unwrap_or(&[]));
    cipher::encrypt_and_sign(&handshake_cipher, &PacketCounter::HANDSHAKE, &mut out, cleartext_bytes);
    out
}

fn build_connect_accept(conn: &Connection) -> BitStream {
    let params = conn.params();
    let mut out = BitStream::new();
    out.write_integer(u8::from(HandshakePacketType::ConnectAccept) as u32, 8);
    out.write_bytes(&params.peer_nonce.0); // initiator nonce
    out.write_bytes(&params.local_nonce.0); // host nonce

    out.align_to_byte();
    let cleartext_bytes = out.byte_position();
    out.write_integer(conn.initial_send_sequence(), 32);
    out.write_bytes(&params.init_vector);
    conn.codec().write_accept(params, &mut out);

    let handshake_cipher = SymmetricCipher::from_shared_secret(params.shared_secret.as_deref().unwrap_or(&[]));
    cipher::encrypt_and_sign(&handshake_cipher, &PacketCounter::HANDSHAKE, &mut out, cleartext_bytes);
    out
}

fn build_connect_reject(
    initiator_nonce: Nonce,
    host_nonce: Nonce,
    reason: TerminationReason,
    reason_data: &[u8],
) -> BitStream {
    let mut out = BitStream::new();
    out.write_integer(u8::from(HandshakePacketType::ConnectReject) as u32, 8);
    out.write_bytes(&initiator_nonce.0);
    out.write_bytes(&host_nonce.0);
    out.write_integer(u8::from(reason) as u32, 8);
    out.write_byte_buffer(reason_data);
    out
}

fn build_disconnect(initiator_nonce: Nonce, host_nonce: Nonce, reason_data: &[u8]) -> BitStream {
    let mut out = BitStream::new();
    out.write_integer(u8::from(HandshakePacketType::Disconnect) as u32, 8);
    out.write_bytes(&initiator_nonce.0);
    out.write_bytes(&host_nonce.0);
    out.write_byte_buffer(reason_data);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::sync::mpsc::UnboundedReceiver;

    /// Captures outgoing datagrams instead of touching a real socket.
    struct TestSocket {
        addr: SocketAddr,
        sent: Mutex<Vec<(SocketAddr, Vec<u8>)>>,
    }

    impl TestSocket {
        fn new(port: u16) -> Arc<TestSocket> {
            Arc::new(TestSocket {
                addr: SocketAddr::from(([127, 0, 0, 1], port)),
                sent: Mutex::new(Vec::new()),
            })
        }

        fn drain(&self) -> Vec<(SocketAddr, Vec<u8>)> {
            std::mem::take(&mut *self.sent.lock().unwrap())
        }
    }

    impl DatagramSocket for Arc<TestSocket> {
        fn send_datagram(&self, to: SocketAddr, datagram: &[u8]) {
            self.sent.lock().unwrap().push((to, datagram.to_vec()));
        }

        fn send_datagram_delayed(&self, to: SocketAddr, datagram: &[u8], _delay: Duration) {
            self.send_datagram(to, datagram);
        }

        fn local_addr(&self) -> SocketAddr {
            self.addr
        }
    }

    struct TestNode {
        interface: Interface,
        socket: Arc<TestSocket>,
        events: UnboundedReceiver<InterfaceEvent>,
    }

    fn test_node(port: u16) -> TestNode {
        let socket = TestSocket::new(port);
        let config = InterfaceConfig {
            // a trivial puzzle keeps the handshake inside one solve fragment
            puzzle_difficulty: 1,
            ..InterfaceConfig::default()
        };
        let (interface, events) =
            Interface::new(Arc::new(socket.clone()), config, Arc::new(NullConnectDataCodec)).unwrap();
        TestNode { interface, socket, events }
    }

    /// Shuttles datagrams between the two nodes until the network is quiet.
    fn pump(a: &mut TestNode, b: &mut TestNode) {
        loop {
            let from_a = a.socket.drain();
            let from_b = b.socket.drain();
            if from_a.is_empty() && from_b.is_empty() {
                return;
            }
            for (to, datagram) in from_a {
                assert_eq!(to, b.socket.addr);
                b.interface.handle_datagram(a.socket.addr, &datagram);
            }
            for (to, datagram) in from_b {
                assert_eq!(to, a.socket.addr);
                a.interface.handle_datagram(b.socket.addr, &datagram);
            }
        }
    }

    fn drain_events(node: &mut TestNode) -> Vec<ConnectionEvent> {
        let mut events = Vec::new();
        while let Ok(event) = node.events.try_recv() {
            events.push(event.event);
        }
        events
    }

    fn establish(initiator: &mut TestNode, host: &mut TestNode) {
        let host_addr = host.socket.addr;
        initiator.interface.connect(host_addr, b"hello host".to_vec());
        pump(initiator, host);

        assert!(initiator.interface.is_established(host_addr));
        assert!(host.interface.is_established(initiator.socket.addr));
        assert_eq!(drain_events(initiator), vec![ConnectionEvent::Established]);
        assert_eq!(drain_events(host), vec![ConnectionEvent::Established]);
    }

    #[test]
    fn test_handshake_establishes_both_sides() {
        let mut initiator = test_node(1001);
        let mut host = test_node(1002);
        establish(&mut initiator, &mut host);

        // the host learned the initiator's connect data
        let conn = host.interface.connections.get(&initiator.socket.addr).unwrap();
        assert_eq!(conn.params().connect_data, b"hello host".to_vec());
        assert!(!conn.is_initiator());

        // both sides agreed on key material
        let initiator_conn = initiator.interface.connections.get(&host.socket.addr).unwrap();
        assert_eq!(initiator_conn.params().symmetric_key, conn.params().symmetric_key);
        assert_eq!(initiator_conn.params().init_vector, conn.params().init_vector);
        assert_eq!(initiator_conn.params().shared_secret, conn.params().shared_secret);
    }

    #[test]
    fn test_data_and_notify_over_established_connection() {
        let mut initiator = test_node(1011);
        let mut host = test_node(1012);
        establish(&mut initiator, &mut host);

        let sequence = match initiator.interface.send(host.socket.addr, b"payload") {
            SendResult::Sent { sequence } => sequence,
            other => panic!("send failed: {:?}", other),
        };
        pump(&mut initiator, &mut host);

        assert_eq!(
            drain_events(&mut host),
            vec![ConnectionEvent::Packet { sequence, data: b"payload".to_vec() }]
        );

        // the host's next packet carries the ack and produces the notify
        host.interface.send(initiator.socket.addr, b"reply");
        pump(&mut initiator, &mut host);

        let events = drain_events(&mut initiator);
        assert!(
            events.contains(&ConnectionEvent::PacketNotify { sequence, delivered: true }),
            "expected delivery notify in {:?}",
            events
        );
    }

    #[test]
    fn test_challenge_request_commits_no_host_state() {
        let mut initiator = test_node(1021);
        let mut host = test_node(1022);

        initiator.interface.connect(host.socket.addr, Vec::new());
        let challenge = initiator.socket.drain();
        assert_eq!(challenge.len(), 1);
        host.interface.handle_datagram(initiator.socket.addr, &challenge[0].1);

        assert!(host.interface.connections.is_empty());
        assert!(host.interface.pending.is_empty());
        assert_eq!(host.socket.drain().len(), 1); // but it did answer
    }

    #[test]
    fn test_disconnect_notifies_peer() {
        let mut initiator = test_node(1031);
        let mut host = test_node(1032);
        establish(&mut initiator, &mut host);

        initiator.interface.disconnect(host.socket.addr, b"done");
        pump(&mut initiator, &mut host);

        assert_eq!(
            drain_events(&mut initiator),
            vec![ConnectionEvent::Disconnected { data: b"done".to_vec() }]
        );
        assert_eq!(
            drain_events(&mut host),
            vec![ConnectionEvent::Disconnected { data: b"done".to_vec() }]
        );
        assert!(host.interface.connections.is_empty());
        assert!(initiator.interface.connections.is_empty());
    }

    #[test]
    fn test_refusing_host_ignores_challenge_request() {
        let mut initiator = test_node(1041);
        let mut host = test_node(1042);
        host.interface.config.allow_connections = false;

        initiator.interface.connect(host.socket.addr, Vec::new());
        pump(&mut initiator, &mut host);

        assert!(!initiator.interface.is_established(host.socket.addr));
        assert!(host.interface.connections.is_empty());
    }

    #[test]
    fn test_challenge_retries_then_times_out() {
        let mut initiator = test_node(1051);
        let host_addr = SocketAddr::from(([127, 0, 0, 1], 1052));

        initiator.interface.connect(host_addr, Vec::new());
        assert_eq!(initiator.socket.drain().len(), 1);

        let t0 = Instant::now();
        let interval = initiator.interface.config.challenge_retry_interval;
        for i in 1..initiator.interface.config.challenge_retry_count {
            initiator.interface.tick(t0 + interval * i + Duration::from_millis(1));
            assert_eq!(initiator.socket.drain().len(), 1, "retry {} missing", i);
        }

        initiator.interface.tick(t0 + interval * 10);
        assert!(initiator.socket.drain().is_empty());
        assert!(initiator.interface.pending.is_empty());
        assert_eq!(
            drain_events(&mut initiator),
            vec![ConnectionEvent::TimedOut { data: Vec::new() }]
        );
    }

    #[test]
    fn test_duplicate_connect_request_resends_accept() {
        let mut initiator = test_node(1061);
        let mut host = test_node(1062);

        initiator.interface.connect(host.socket.addr, Vec::new());

        // walk the handshake manually so the connect request can be replayed
        let challenge_request = initiator.socket.drain().remove(0).1;
        host.interface.handle_datagram(initiator.socket.addr, &challenge_request);
        let challenge_response = host.socket.drain().remove(0).1;
        initiator.interface.handle_datagram(host.socket.addr, &challenge_response);
        let connect_request = initiator.socket.drain().remove(0).1;

        host.interface.handle_datagram(initiator.socket.addr, &connect_request);
        assert_eq!(host.socket.drain().len(), 1);
        assert!(host.interface.is_established(initiator.socket.addr));

        host.interface.handle_datagram(initiator.socket.addr, &connect_request);
        let resent = host.socket.drain();
        assert_eq!(resent.len(), 1);
        assert_eq!(
            resent[0].1[0],
            u8::from(HandshakePacketType::ConnectAccept),
            "duplicate connect request should re-send the accept"
        );

        // still exactly one connection, one established event
        assert_eq!(host.interface.connections.len(), 1);
        assert_eq!(drain_events(&mut host), vec![ConnectionEvent::Established]);
    }

    #[test]
    fn test_timeout_sweep_removes_dead_connection() {
        let mut initiator = test_node(1071);
        let mut host = test_node(1072);
        establish(&mut initiator, &mut host);

        let conn = initiator.interface.connections.get_mut(&host.socket.addr).unwrap();
        conn.set_ping_timeouts(Duration::from_millis(10), 2);

        let t0 = Instant::now();
        let mut t = t0;
        for _ in 0..8 {
            t += Duration::from_millis(1_600);
            initiator.interface.tick(t);
        }

        assert!(initiator.interface.connections.is_empty());
        assert_eq!(
            drain_events(&mut initiator),
            vec![ConnectionEvent::TimedOut { data: Vec::new() }]
        );
    }
}

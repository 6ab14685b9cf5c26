use std::net::SocketAddr;

/// Events a connection posts upward to the application.
///
/// Exactly one terminal event (`Disconnected` or `TimedOut`) is posted per
/// connection lifetime. `PacketNotify` events are posted in strictly
/// increasing sequence order, exactly once per sent data packet.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ConnectionEvent {
    /// The handshake completed and the connection reached the connected state.
    Established,
    /// A data packet arrived and was decoded.
    Packet { sequence: u32, data: Vec<u8> },
    /// A previously sent data packet was confirmed delivered or dropped.
    PacketNotify { sequence: u32, delivered: bool },
    /// The peer or this side terminated the connection.
    Disconnected { data: Vec<u8> },
    /// Ping retries were exhausted without hearing from the peer.
    TimedOut { data: Vec<u8> },
}

/// A connection event tagged with the peer it belongs to, as delivered
/// through the interface's event queue.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct InterfaceEvent {
    pub peer: SocketAddr,
    pub event: ConnectionEvent,
}

use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Why an incoming datagram was discarded without touching connection state.
///
/// All of these are local decisions: the packet is dropped, no counters are
/// updated and no event is raised. If the silence persists, the timeout
/// driver eventually notices.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum PacketDropReason {
    /// Pad bits non-zero, data-packet flag missing, or invalid packet type.
    MalformedHeader,
    /// Reconstructed sequence is beyond the receive window.
    OutOfWindowSequence,
    /// Reconstructed highest-ack is beyond anything we actually sent.
    OutOfWindowAck,
    /// The trailing packet signature did not verify.
    CryptoRejected,
    /// The advertised ack byte count exceeds the protocol maximum.
    AckByteCountOversize,
    /// Dropped by the simulated-loss hook.
    SimulatedLoss,
}

/// Outcome of a data-packet send attempt.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SendResult {
    /// The packet was handed to the socket; `sequence` correlates later
    /// notify events with this send.
    Sent { sequence: u32 },
    /// The send window has no room - nothing was sent, retry after the next
    /// notify makes progress.
    WindowFull,
    /// Data packets are only valid on an established connection.
    NotConnected,
}

/// Reason codes carried in reject and disconnect frames.
#[derive(Debug, Clone, Copy, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum TerminationReason {
    Timeout = 0,
    FailedPuzzle = 1,
    RejectedByHost = 2,
    SelfDisconnect = 3,
    PeerDisconnect = 4,
    Error = 5,
}

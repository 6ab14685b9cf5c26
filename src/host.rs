//! Capability interfaces between a connection and its host.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

#[cfg(test)]
use mockall::automock;

use crate::bit_stream::BitStream;
use crate::connection_params::ConnectionParameters;
use crate::event::ConnectionEvent;

/// The small interface the host supplies to each connection: socket sends,
/// delayed sends (for latency simulation), time, randomness and the upward
/// event channel. All methods are synchronous and non-blocking.
#[cfg_attr(test, automock)]
pub trait ConnectionHost: Send + Sync {
    fn send_to(&self, addr: SocketAddr, datagram: &[u8]);

    fn send_to_delayed(&self, addr: SocketAddr, datagram: &[u8], delay: Duration);

    fn now(&self) -> Instant;

    fn random_u32(&self) -> u32;

    /// Uniform draw in `[0, 1)`, used by the simulated-loss hook.
    fn random_unit(&self) -> f32;

    fn random_bytes(&self, buf: &mut [u8]);

    fn post_event(&self, event: ConnectionEvent);
}

/// Application hooks for custom connect-request/accept payloads and public
/// key policy, injected at connection construction.
pub trait ConnectDataCodec: Send + Sync {
    /// Writes additional application data into the connect request.
    fn write_request(&self, params: &ConnectionParameters, stream: &mut BitStream) {
        let _ = (params, stream);
    }

    /// Reads the data written by [`write_request`](Self::write_request) on
    /// the host side. `Err` rejects the connection with the given reason
    /// buffer.
    fn read_request(&self, stream: &mut BitStream) -> Result<(), Vec<u8>> {
        let _ = stream;
        Ok(())
    }

    /// Writes additional application data into the connect accept.
    fn write_accept(&self, params: &ConnectionParameters, stream: &mut BitStream) {
        let _ = (params, stream);
    }

    /// Reads the data written by [`write_accept`](Self::write_accept) on the
    /// initiator side; returning false abandons the connection.
    fn read_accept(&self, stream: &mut BitStream) -> bool {
        let _ = stream;
        true
    }

    /// Validates the peer's public key. Hosts requiring certified keys
    /// return false here.
    fn validate_public_key(&self, key: &[u8], is_initiator: bool) -> bool {
        let _ = (key, is_initiator);
        true
    }
}

/// Accepts every connection and carries no custom payloads.
pub struct NullConnectDataCodec;

impl ConnectDataCodec for NullConnectDataCodec {}

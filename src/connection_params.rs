//! The handshake-parameter carrier.
//!
//! Built up incrementally while a connection is negotiated, read-only once
//! the connection reaches the connected state.

use std::net::SocketAddr;

use x25519_dalek::{PublicKey, StaticSecret};

use crate::cipher::SymmetricCipher;

/// Fresh random bytes bound into the handshake transcript to prevent replay.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Hash)]
pub struct Nonce(pub [u8; Nonce::SIZE]);

impl Nonce {
    pub const SIZE: usize = 8;

    pub fn from_slice(bytes: &[u8]) -> Option<Nonce> {
        bytes.try_into().ok().map(Nonce)
    }
}

/// All data associated with the negotiation of one connection.
pub struct ConnectionParameters {
    /// True if this host initiated the connection.
    pub is_initiator: bool,
    /// True if the connection was negotiated by a third-party introducer.
    pub is_arranged: bool,
    /// Candidate addresses for the remote host (arranged connections only).
    pub possible_addresses: Vec<SocketAddr>,

    /// True once a puzzle solution was rejected by the host; a second
    /// rejection is terminal.
    pub puzzle_retried: bool,
    /// Nonce generated locally for this connection.
    pub local_nonce: Nonce,
    /// Nonce generated by the remote host.
    pub peer_nonce: Nonce,
    /// Difficulty of the client puzzle issued for this connection.
    pub puzzle_difficulty: u32,
    /// The solution found (initiator) or submitted (host).
    pub puzzle_solution: u32,
    /// Identity token computed by the host from our address and nonce;
    /// echoed in the connect request to prove source-address reachability.
    pub client_identity: u32,

    /// The remote host's X25519 public key.
    pub peer_public_key: Option<[u8; 32]>,
    /// The local X25519 private key, possibly generated just for this attempt.
    pub private_key: Option<StaticSecret>,
    /// Diffie-Hellman shared secret protecting the connect exchange.
    pub shared_secret: Option<Vec<u8>>,
    /// Secret arranged by the connection introducer (arranged only).
    pub arranged_secret: Option<Vec<u8>>,

    /// Symmetric key for the connection, generated by the initiator.
    pub symmetric_key: [u8; SymmetricCipher::KEY_SIZE],
    /// Init vector, generated by the host.
    pub init_vector: [u8; SymmetricCipher::BLOCK_SIZE],

    /// Application data carried in the connect request.
    pub connect_data: Vec<u8>,
}

impl Default for ConnectionParameters {
    fn default() -> Self {
        ConnectionParameters {
            is_initiator: false,
            is_arranged: false,
            possible_addresses: Vec::new(),
            puzzle_retried: false,
            local_nonce: Nonce::default(),
            peer_nonce: Nonce::default(),
            puzzle_difficulty: 0,
            puzzle_solution: 0,
            client_identity: 0,
            peer_public_key: None,
            private_key: None,
            shared_secret: None,
            arranged_secret: None,
            symmetric_key: [0; SymmetricCipher::KEY_SIZE],
            init_vector: [0; SymmetricCipher::BLOCK_SIZE],
            connect_data: Vec::new(),
        }
    }
}

impl ConnectionParameters {
    /// The local public key matching `private_key`.
    pub fn public_key(&self) -> Option<[u8; 32]> {
        self.private_key.as_ref().map(|secret| PublicKey::from(secret).to_bytes())
    }

    /// Computes and stores the shared secret from our private key and the
    /// peer's public key. Returns false if either key is missing.
    pub fn compute_shared_secret(&mut self) -> bool {
        match (&self.private_key, &self.peer_public_key) {
            (Some(secret), Some(peer)) => {
                let shared = secret.diffie_hellman(&PublicKey::from(*peer));
                self.shared_secret = Some(shared.as_bytes().to_vec());
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_secret_agreement() {
        let mut initiator = ConnectionParameters {
            private_key: Some(StaticSecret::from([1u8; 32])),
            ..ConnectionParameters::default()
        };
        let mut host = ConnectionParameters {
            private_key: Some(StaticSecret::from([2u8; 32])),
            ..ConnectionParameters::default()
        };

        initiator.peer_public_key = host.public_key();
        host.peer_public_key = initiator.public_key();

        assert!(initiator.compute_shared_secret());
        assert!(host.compute_shared_secret());
        assert_eq!(initiator.shared_secret, host.shared_secret);
        assert_eq!(initiator.shared_secret.as_ref().unwrap().len(), 32);
    }

    #[test]
    fn test_shared_secret_requires_both_keys() {
        let mut params = ConnectionParameters::default();
        assert!(!params.compute_shared_secret());

        params.private_key = Some(StaticSecret::from([3u8; 32]));
        assert!(!params.compute_shared_secret());
        assert!(params.shared_secret.is_none());
    }
}

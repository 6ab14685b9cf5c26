//! Per-packet encryption and integrity.
//!
//! Everything after the cleartext header bytes is encrypted with AES-128 in
//! CFB mode. The CFB chain is seeded from a counter block derived by adding
//! `(send sequence, receive sequence, packet type, 0)` into the connection's
//! init vector - the sequence fields in the cleartext header double as the
//! nonce, so a replayed or reordered packet decrypts under the wrong
//! keystream and fails its signature.
//!
//! The signature is encrypt-then-MAC: HMAC-SHA-256 over the cleartext header
//! and the ciphertext, truncated to [`SIGNATURE_BYTES`] and appended in the
//! clear. Verification happens before any decryption work.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Aes128;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::bit_stream::BitStream;

type HmacSha256 = Hmac<Sha256>;

/// Trailing signature length in bytes.
pub const SIGNATURE_BYTES: usize = 5;

/// The per-packet counter mixed into the cipher's init vector.
///
/// The sender derives it from its own send/receive state; the receiver
/// re-derives it from the reconstructed header fields.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct PacketCounter {
    pub sequence: u32,
    pub ack_sequence: u32,
    pub packet_type: u8,
}

impl PacketCounter {
    /// Counter for handshake packets, which carry no sequence state yet.
    pub const HANDSHAKE: PacketCounter = PacketCounter {
        sequence: 0,
        ack_sequence: 0,
        packet_type: 0,
    };
}

/// Symmetric cipher bound to one connection's key material.
pub struct SymmetricCipher {
    aes: Aes128,
    key: [u8; SymmetricCipher::KEY_SIZE],
    init_vector: [u8; SymmetricCipher::BLOCK_SIZE],
}

impl SymmetricCipher {
    pub const KEY_SIZE: usize = 16;
    pub const BLOCK_SIZE: usize = 16;

    pub fn new(key: &[u8; Self::KEY_SIZE], init_vector: &[u8; Self::BLOCK_SIZE]) -> SymmetricCipher {
        SymmetricCipher {
            aes: Aes128::new(GenericArray::from_slice(key)),
            key: *key,
            init_vector: *init_vector,
        }
    }

    /// Keys a cipher from a 32-byte shared secret: the first half is the key,
    /// the second half the init vector. Used for handshake packets.
    pub fn from_shared_secret(secret: &[u8]) -> SymmetricCipher {
        let mut key = [0u8; Self::KEY_SIZE];
        let mut init_vector = [0u8; Self::BLOCK_SIZE];
        if secret.len() >= Self::KEY_SIZE + Self::BLOCK_SIZE {
            key.copy_from_slice(&secret[..Self::KEY_SIZE]);
            init_vector.copy_from_slice(&secret[Self::KEY_SIZE..Self::KEY_SIZE + Self::BLOCK_SIZE]);
        }
        SymmetricCipher::new(&key, &init_vector)
    }

    /// The CFB seed block: init vector with the counter values added into the
    /// first four little-endian words.
    fn counter_block(&self, counter: &PacketCounter) -> [u8; Self::BLOCK_SIZE] {
        let mut block = self.init_vector;
        let values = [counter.sequence, counter.ack_sequence, counter.packet_type as u32, 0];
        for (i, v) in values.iter().enumerate() {
            let word = u32::from_le_bytes(block[i * 4..i * 4 + 4].try_into().unwrap()).wrapping_add(*v);
            block[i * 4..i * 4 + 4].copy_from_slice(&word.to_le_bytes());
        }
        block
    }

    pub fn encrypt_in_place(&self, counter: &PacketCounter, buf: &mut [u8]) {
        let mut pad = self.counter_block(counter);
        self.aes.encrypt_block(GenericArray::from_mut_slice(&mut pad));
        let mut used = 0;
        for b in buf {
            if used == Self::BLOCK_SIZE {
                // the pad register holds the previous ciphertext block
                self.aes.encrypt_block(GenericArray::from_mut_slice(&mut pad));
                used = 0;
            }
            let c = *b ^ pad[used];
            pad[used] = c;
            *b = c;
            used += 1;
        }
    }

    pub fn decrypt_in_place(&self, counter: &PacketCounter, buf: &mut [u8]) {
        let mut pad = self.counter_block(counter);
        self.aes.encrypt_block(GenericArray::from_mut_slice(&mut pad));
        let mut used = 0;
        for b in buf {
            if used == Self::BLOCK_SIZE {
                self.aes.encrypt_block(GenericArray::from_mut_slice(&mut pad));
                used = 0;
            }
            let c = *b;
            *b = c ^ pad[used];
            pad[used] = c;
            used += 1;
        }
    }

    fn mac(&self, bytes: &[u8]) -> HmacSha256 {
        let mut mac =
            <HmacSha256 as Mac>::new_from_slice(&self.key).expect("HMAC accepts any key length");
        mac.update(bytes);
        mac
    }
}

/// Encrypts everything after `cleartext_bytes` and appends the truncated
/// signature. The stream is complete and sendable afterwards.
pub fn encrypt_and_sign(cipher: &SymmetricCipher, counter: &PacketCounter, stream: &mut BitStream, cleartext_bytes: usize) {
    stream.align_to_byte();
    cipher.encrypt_in_place(counter, &mut stream.as_mut_bytes()[cleartext_bytes..]);

    let signature = cipher.mac(stream.as_bytes()).finalize().into_bytes();
    stream.extend_raw(&signature[..SIGNATURE_BYTES]);
}

/// Verifies the trailing signature and, on success, decrypts everything
/// after `cleartext_bytes` and strips the signature from the stream.
pub fn verify_and_decrypt(cipher: &SymmetricCipher, counter: &PacketCounter, stream: &mut BitStream, cleartext_bytes: usize) -> bool {
    let total = stream.byte_len();
    if total < cleartext_bytes + SIGNATURE_BYTES {
        return false;
    }
    let body_len = total - SIGNATURE_BYTES;

    let (body, signature) = stream.as_bytes().split_at(body_len);
    if cipher.mac(body).verify_truncated_left(signature).is_err() {
        return false;
    }

    cipher.decrypt_in_place(counter, &mut stream.as_mut_bytes()[cleartext_bytes..body_len]);
    stream.truncate_bytes(body_len);
    true
}

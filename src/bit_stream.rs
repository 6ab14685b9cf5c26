//! Bit-packed codec used for all packet framing.
//!
//! Values are packed LSB-first within each byte: the first bit written lands
//! in bit 0 of byte 0, the eighth in bit 7. This is what puts the data-packet
//! flag - the eighth header bit - into the high bit of the first byte, which
//! is how the interface tells connected-protocol packets apart from handshake
//! packets.
//!
//! Reading past the end of the buffer is not an error: missing bits read as
//! zero and the `overrun` flag is set. Any packet short enough to trigger
//! this fails its signature check one layer up.

/// Upper bound for length-prefixed byte buffers (connect data, payloads).
pub const MAX_BYTE_BUFFER_SIZE: u32 = 1023;

/// A contiguous byte buffer with a bit cursor, shared by the read and write
/// paths. Writes extend the buffer; reads consume it front to back.
#[derive(Debug, Clone, Default)]
pub struct BitStream {
    data: Vec<u8>,
    bit_pos: usize,
    /// Number of valid bits. Tracks `bit_pos` while writing; fixed by the
    /// datagram length while reading.
    bit_limit: usize,
    overrun: bool,
}

impl BitStream {
    pub fn new() -> BitStream {
        BitStream::default()
    }

    pub fn with_capacity(bytes: usize) -> BitStream {
        BitStream {
            data: Vec::with_capacity(bytes),
            ..BitStream::default()
        }
    }

    /// Wraps a received datagram for reading.
    pub fn from_bytes(data: Vec<u8>) -> BitStream {
        let bit_limit = data.len() * 8;
        BitStream {
            data,
            bit_pos: 0,
            bit_limit,
            overrun: false,
        }
    }

    pub fn bit_position(&self) -> usize {
        self.bit_pos
    }

    /// Byte position of the cursor, rounded up to the next whole byte.
    pub fn byte_position(&self) -> usize {
        (self.bit_pos + 7) >> 3
    }

    /// Number of valid whole bytes in the stream.
    pub fn byte_len(&self) -> usize {
        (self.bit_limit + 7) >> 3
    }

    /// True if any read consumed bits past the end of the buffer.
    pub fn overrun(&self) -> bool {
        self.overrun
    }

    pub fn write_bool(&mut self, value: bool) {
        let byte = self.bit_pos >> 3;
        if byte == self.data.len() {
            self.data.push(0);
        }
        if value {
            self.data[byte] |= 1 << (self.bit_pos & 7);
        }
        self.bit_pos += 1;
        if self.bit_pos > self.bit_limit {
            self.bit_limit = self.bit_pos;
        }
    }

    pub fn read_bool(&mut self) -> bool {
        if self.bit_pos >= self.bit_limit {
            self.overrun = true;
            self.bit_pos += 1;
            return false;
        }
        let bit = (self.data[self.bit_pos >> 3] >> (self.bit_pos & 7)) & 1;
        self.bit_pos += 1;
        bit == 1
    }

    /// Writes the low `bits` bits of `value`, low bit first.
    pub fn write_integer(&mut self, value: u32, bits: u32) {
        debug_assert!(bits <= 32);
        debug_assert!(bits == 32 || value < (1u32 << bits) || bits == 0);
        for i in 0..bits {
            self.write_bool((value >> i) & 1 == 1);
        }
    }

    pub fn read_integer(&mut self, bits: u32) -> u32 {
        debug_assert!(bits <= 32);
        let mut value = 0;
        for i in 0..bits {
            value |= (self.read_bool() as u32) << i;
        }
        value
    }

    /// Writes `value - lo` in just enough bits to cover `hi - lo`.
    pub fn write_ranged_u32(&mut self, value: u32, lo: u32, hi: u32) {
        debug_assert!(lo <= value && value <= hi);
        self.write_integer(value - lo, bits_for_range(lo, hi));
    }

    /// Inverse of [`write_ranged_u32`](Self::write_ranged_u32). On garbage
    /// input the result may exceed `hi`; callers validate.
    pub fn read_ranged_u32(&mut self, lo: u32, hi: u32) -> u32 {
        lo.wrapping_add(self.read_integer(bits_for_range(lo, hi)))
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        if self.bit_pos & 7 == 0 && self.bit_pos == self.bit_limit {
            self.data.extend_from_slice(bytes);
            self.bit_pos += bytes.len() * 8;
            self.bit_limit = self.bit_pos;
        } else {
            for &b in bytes {
                self.write_integer(b as u32, 8);
            }
        }
    }

    pub fn read_bytes(&mut self, len: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(len);
        for _ in 0..len {
            out.push(self.read_integer(8) as u8);
        }
        out
    }

    /// Length-prefixed byte buffer; the length is a ranged uint in
    /// `[0, MAX_BYTE_BUFFER_SIZE]`.
    pub fn write_byte_buffer(&mut self, bytes: &[u8]) {
        debug_assert!(bytes.len() as u32 <= MAX_BYTE_BUFFER_SIZE);
        self.write_ranged_u32(bytes.len() as u32, 0, MAX_BYTE_BUFFER_SIZE);
        self.write_bytes(bytes);
    }

    pub fn read_byte_buffer(&mut self) -> Vec<u8> {
        let len = self.read_ranged_u32(0, MAX_BYTE_BUFFER_SIZE);
        self.read_bytes(len.min(MAX_BYTE_BUFFER_SIZE) as usize)
    }

    /// Advances the cursor to the next byte boundary. On the write path the
    /// skipped bits are zero; on the read path they are discarded.
    pub fn align_to_byte(&mut self) {
        while self.bit_pos & 7 != 0 {
            if self.bit_pos < self.bit_limit {
                self.bit_pos += 1;
            } else {
                self.write_bool(false);
            }
        }
    }

    /// The valid bytes of the stream; the final partial byte is zero-padded.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data[..self.byte_len()]
    }

    pub fn as_mut_bytes(&mut self) -> &mut [u8] {
        let len = self.byte_len();
        &mut self.data[..len]
    }

    /// Appends whole bytes after the current end of the stream (used for the
    /// trailing packet signature).
    pub fn extend_raw(&mut self, bytes: &[u8]) {
        debug_assert!(self.bit_limit % 8 == 0 || self.bit_limit == self.bit_pos);
        self.data.truncate(self.byte_len());
        self.data.extend_from_slice(bytes);
        self.bit_limit = self.data.len() * 8;
    }

    /// Shrinks the stream to `byte_len` bytes (used to strip the signature
    /// before parsing continues).
    pub fn truncate_bytes(&mut self, byte_len: usize) {
        debug_assert!(byte_len <= self.byte_len());
        self.data.truncate(byte_len);
        self.bit_limit = byte_len * 8;
    }

    pub fn into_bytes(mut self) -> Vec<u8> {
        self.data.truncate(self.byte_len());
        self.data
    }
}

/// Number of bits needed to encode any value in `[0, hi - lo]`.
fn bits_for_range(lo: u32, hi: u32) -> u32 {
    debug_assert!(lo <= hi);
    32 - (hi - lo).leading_zeros()
}

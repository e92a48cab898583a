//! Raw bit container exchanged with the network layer.
//!
//! A [`BitBuffer`] is a fixed-length sequence of bits, packed MSB-first into
//! bytes.  The network layer carries one buffer per PDU and knows nothing
//! about what the bits mean; [`crate::packet`] gives them structure.
//!
//! Integer fields are written with [`BitBuffer::put`], which behaves like a
//! circular buffer: a value wider than the field keeps only its low `width`
//! bits.

use std::fmt;

/// Fixed-length, zero-initialised bit sequence.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct BitBuffer {
    bytes: Vec<u8>,
    len: usize,
}

impl BitBuffer {
    /// Allocate `len` bits, all cleared.
    pub fn new(len: usize) -> Self {
        Self {
            bytes: vec![0u8; len.div_ceil(8)],
            len,
        }
    }

    /// Number of bits in the buffer.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Read bit `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index >= len()`.
    pub fn get(&self, index: usize) -> bool {
        assert!(index < self.len, "bit index {index} out of range ({})", self.len);
        self.bytes[index / 8] & (0x80 >> (index % 8)) != 0
    }

    /// Set bit `index` to `value`.
    ///
    /// # Panics
    ///
    /// Panics if `index >= len()`.
    pub fn set(&mut self, index: usize, value: bool) {
        assert!(index < self.len, "bit index {index} out of range ({})", self.len);
        let mask = 0x80 >> (index % 8);
        if value {
            self.bytes[index / 8] |= mask;
        } else {
            self.bytes[index / 8] &= !mask;
        }
    }

    /// Write `value` into bits `start..start + width`, most significant bit
    /// first.  Only the low `width` bits of `value` are kept (the value wraps
    /// modulo 2^width).
    ///
    /// # Panics
    ///
    /// Panics if the range runs past the end of the buffer or `width > 64`.
    pub fn put(&mut self, start: usize, width: usize, value: u64) {
        assert!(width <= 64, "field width {width} exceeds 64 bits");
        assert!(
            start + width <= self.len,
            "field {start}..{} out of range ({})",
            start + width,
            self.len
        );
        for i in 0..width {
            let bit = (value >> (width - 1 - i)) & 1 == 1;
            self.set(start + i, bit);
        }
    }

    /// Read bits `start..start + width` as an unsigned integer, most
    /// significant bit first.
    ///
    /// # Panics
    ///
    /// Panics if the range runs past the end of the buffer or `width > 64`.
    pub fn read(&self, start: usize, width: usize) -> u64 {
        assert!(width <= 64, "field width {width} exceeds 64 bits");
        (start..start + width).fold(0u64, |acc, i| (acc << 1) | u64::from(self.get(i)))
    }
}

impl fmt::Debug for BitBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BitBuffer({}: {self})", self.len)
    }
}

impl fmt::Display for BitBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for i in 0..self.len {
            f.write_str(if self.get(i) { "1" } else { "0" })?;
        }
        Ok(())
    }
}

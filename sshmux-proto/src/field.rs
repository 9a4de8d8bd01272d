//! Positional field encoding used inside mux packets.
//!
//! The master parses messages field by field in a fixed order, so every
//! integer is a big-endian `u32` and every string is a `u32` length
//! followed by that many bytes.

/// Errors from decoding a packet payload.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum DecodeError {
    /// Fewer bytes remained than the next field needs.
    #[error("short buffer: need {needed} bytes, {remaining} remaining")]
    ShortBuffer {
        /// Bytes required by the field being decoded.
        needed: usize,
        /// Bytes left in the payload.
        remaining: usize,
    },

    /// A string field was not valid UTF-8.
    #[error("string field is not valid UTF-8")]
    InvalidUtf8,
}

/// Appends fields to a payload buffer.
#[derive(Debug, Default)]
pub struct Encoder {
    /// Bytes written so far.
    buf: Vec<u8>,
}

impl Encoder {
    /// Creates an empty encoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a big-endian `u32`.
    pub fn put_u32(&mut self, v: u32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    /// Appends a length-prefixed string.
    ///
    /// # Panics
    ///
    /// Panics if `s` is longer than `u32::MAX` bytes.
    pub fn put_str(&mut self, s: &str) -> &mut Self {
        #[allow(clippy::cast_possible_truncation)]
        let len = s.len() as u32;
        assert_eq!(len as usize, s.len(), "string field exceeds u32::MAX");
        self.put_u32(len);
        self.buf.extend_from_slice(s.as_bytes());
        self
    }

    /// Returns the encoded payload.
    pub fn finish(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }
}

/// Consumes fields from the front of a payload.
#[derive(Debug, Clone, Copy)]
pub struct Decoder<'a> {
    /// Bytes not yet consumed.
    rest: &'a [u8],
}

impl<'a> Decoder<'a> {
    /// Starts decoding `payload` from its first byte.
    pub const fn new(payload: &'a [u8]) -> Self {
        Self { rest: payload }
    }

    /// Pops a big-endian `u32`.
    pub fn get_u32(&mut self) -> Result<u32, DecodeError> {
        let bytes = self.take(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Pops a length-prefixed UTF-8 string.
    pub fn get_str(&mut self) -> Result<&'a str, DecodeError> {
        let len = self.get_u32()? as usize;
        let bytes = self.take(len)?;
        std::str::from_utf8(bytes).map_err(|_| DecodeError::InvalidUtf8)
    }

    /// Bytes left after the fields consumed so far.
    pub const fn remaining(&self) -> usize {
        self.rest.len()
    }

    /// Splits `n` bytes off the front.
    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.rest.len() < n {
            return Err(DecodeError::ShortBuffer {
                needed: n,
                remaining: self.rest.len(),
            });
        }
        let (head, tail) = self.rest.split_at(n);
        self.rest = tail;
        Ok(head)
    }
}

//! Minimal XDR (RFC 4506) primitives: big-endian integers and floats, counted strings.

use bytes::{Buf, BufMut, BytesMut};

/// Rounds `len` up to the next multiple of 4.
pub const fn round_up_4(len: usize) -> usize {
    (len + 3) & !3
}

/// Number of bytes reserved for a string of `len` bytes when estimating a datagram size.
///
/// This is an upper bound of the actual encoded size (`4 + round_up_4(len)`),
/// it accounts for a terminating byte that XDR does not write.
pub const fn string_budget(len: usize) -> usize {
    round_up_4(len + 1) + 4
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum XdrError {
    #[error("xdr buffer exhausted: {needed} bytes needed but only {remaining} available")]
    BufferExhausted { needed: usize, remaining: usize },
    #[error("string of {0} bytes cannot be encoded")]
    StringTooLong(usize),
    #[error("invalid string length {0}")]
    InvalidLength(i32),
    #[error("string is not valid UTF-8")]
    InvalidUtf8(#[source] std::string::FromUtf8Error),
}

/// Writes XDR primitives to a buffer, never growing it past a fixed limit.
pub struct XdrWriter<'a> {
    buf: &'a mut BytesMut,
    limit: usize,
}

impl<'a> XdrWriter<'a> {
    pub fn new(buf: &'a mut BytesMut, limit: usize) -> Self {
        Self { buf, limit }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn reserve(&mut self, n: usize) -> Result<(), XdrError> {
        let remaining = self.limit.saturating_sub(self.buf.len());
        if n > remaining {
            return Err(XdrError::BufferExhausted { needed: n, remaining });
        }
        self.buf.reserve(n);
        Ok(())
    }

    pub fn put_i32(&mut self, v: i32) -> Result<(), XdrError> {
        self.reserve(4)?;
        self.buf.put_i32(v);
        Ok(())
    }

    pub fn put_f32(&mut self, v: f32) -> Result<(), XdrError> {
        self.reserve(4)?;
        self.buf.put_f32(v);
        Ok(())
    }

    pub fn put_f64(&mut self, v: f64) -> Result<(), XdrError> {
        self.reserve(8)?;
        self.buf.put_f64(v);
        Ok(())
    }

    pub fn put_string(&mut self, s: &str) -> Result<(), XdrError> {
        let len = s.len();
        let len_i32 = i32::try_from(len).map_err(|_| XdrError::StringTooLong(len))?;
        let padded = round_up_4(len);
        self.reserve(4 + padded)?;
        self.buf.put_i32(len_i32);
        self.buf.put_slice(s.as_bytes());
        self.buf.put_bytes(0, padded - len);
        Ok(())
    }
}

/// Reads XDR primitives from a byte slice.
pub struct XdrReader<'a> {
    buf: &'a [u8],
}

impl<'a> XdrReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    fn check(&self, needed: usize) -> Result<(), XdrError> {
        let remaining = self.buf.remaining();
        if needed > remaining {
            return Err(XdrError::BufferExhausted { needed, remaining });
        }
        Ok(())
    }

    pub fn get_i32(&mut self) -> Result<i32, XdrError> {
        self.check(4)?;
        Ok(self.buf.get_i32())
    }

    pub fn get_f32(&mut self) -> Result<f32, XdrError> {
        self.check(4)?;
        Ok(self.buf.get_f32())
    }

    pub fn get_f64(&mut self) -> Result<f64, XdrError> {
        self.check(8)?;
        Ok(self.buf.get_f64())
    }

    pub fn get_string(&mut self) -> Result<String, XdrError> {
        let len = self.get_i32()?;
        let len_usize = usize::try_from(len).map_err(|_| XdrError::InvalidLength(len))?;
        let padded = round_up_4(len_usize);
        self.check(padded)?;
        let bytes = self.buf[..len_usize].to_vec();
        self.buf.advance(padded);
        String::from_utf8(bytes).map_err(XdrError::InvalidUtf8)
    }
}

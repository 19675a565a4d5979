//! Transport framing for key material and ciphertexts.
//!
//! Two concerns live here and nothing else: turning opaque byte buffers into
//! transport-safe base64 strings (and back), and a tiny big-endian
//! reader/writer pair used by the wire formats in
//! [`crate::crypto::session`]. The module holds no state.

use {
    base64::{engine::general_purpose::STANDARD, Engine as _},
    thiserror::Error,
};

/// Failures while decoding transport material.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("unexpected end of input: needed {needed} more bytes")]
    Truncated { needed: usize },
    #[error("expected {expected} bytes, got {actual}")]
    Length { expected: usize, actual: usize },
    #[error("invalid flag byte {0:#04x}")]
    Flag(u8),
}

/// Encode bytes with the standard padded base64 alphabet.
pub fn to_base64(bytes: impl AsRef<[u8]>) -> String {
    STANDARD.encode(bytes)
}

/// Decode standard padded base64.
pub fn from_base64(text: &str) -> Result<Vec<u8>, CodecError> {
    Ok(STANDARD.decode(text.trim())?)
}

/// Decode base64 that must carry exactly `N` bytes.
pub fn from_base64_array<const N: usize>(text: &str) -> Result<[u8; N], CodecError> {
    let raw = from_base64(text)?;
    <[u8; N]>::try_from(raw.as_slice()).map_err(|_| CodecError::Length {
        expected: N,
        actual: raw.len(),
    })
}

/// Append-only big-endian writer.
#[derive(Default)]
pub struct ByteWriter {
    buf: Vec<u8>,
}

impl ByteWriter {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    pub fn put_u8(&mut self, value: u8) -> &mut Self {
        self.buf.push(value);
        self
    }

    pub fn put_u32(&mut self, value: u32) -> &mut Self {
        self.buf.extend_from_slice(&value.to_be_bytes());
        self
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(bytes);
        self
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}

/// Cursor over a borrowed buffer. Every read is bounds checked.
pub struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn take(&mut self, len: usize) -> Result<&'a [u8], CodecError> {
        if self.remaining() < len {
            return Err(CodecError::Truncated {
                needed: len - self.remaining(),
            });
        }
        let out = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    pub fn take_array<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take_array::<1>()?[0])
    }

    pub fn u32(&mut self) -> Result<u32, CodecError> {
        Ok(u32::from_be_bytes(self.take_array()?))
    }

    /// Reads a `0`/`1` presence flag.
    pub fn flag(&mut self) -> Result<bool, CodecError> {
        match self.u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(CodecError::Flag(other)),
        }
    }

    /// Consumes and returns everything that is left.
    pub fn rest(&mut self) -> &'a [u8] {
        let out = &self.data[self.pos..];
        self.pos = self.data.len();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base64_uses_padded_standard_alphabet() {
        assert_eq!(to_base64([0xfbu8, 0xff]), "+/8=");
        assert_eq!(from_base64("+/8=").unwrap(), vec![0xfb, 0xff]);
    }

    #[test]
    fn base64_array_rejects_wrong_length() {
        let text = to_base64([7u8; 31]);
        assert_eq!(
            from_base64_array::<32>(&text),
            Err(CodecError::Length {
                expected: 32,
                actual: 31
            })
        );
    }

    #[test]
    fn base64_rejects_garbage() {
        assert!(matches!(from_base64("not base64!"), Err(CodecError::Base64(_))));
    }

    #[test]
    fn reader_reports_truncation() {
        let mut w = ByteWriter::default();
        w.put_u32(0xdead_beef).put_u8(1);
        let bytes = w.into_inner();

        let mut r = ByteReader::new(&bytes);
        assert_eq!(r.u32().unwrap(), 0xdead_beef);
        assert!(r.flag().unwrap());
        assert_eq!(r.u32(), Err(CodecError::Truncated { needed: 4 }));
    }

    #[test]
    fn reader_rejects_bad_flag() {
        let mut r = ByteReader::new(&[2]);
        assert_eq!(r.flag(), Err(CodecError::Flag(2)));
    }

    #[test]
    fn rest_drains_the_reader() {
        let mut r = ByteReader::new(b"abcdef");
        r.take(2).unwrap();
        assert_eq!(r.rest(), b"cdef");
        assert_eq!(r.remaining(), 0);
    }
}

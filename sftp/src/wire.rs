//! Primitive SFTP wire types.
//!
//! Everything on the wire is big-endian. Variable sized fields are prefixed with a 32-bit length:
//! `data` is an opaque byte blob, `string` is the same layout holding UTF-8 text.

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Malformed or inconsistent bytes received from (or about to be sent to) the server.
///
/// Any of these on the input side means the stream parse position can no longer be trusted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("empty packet")]
    Empty,
    #[error("packet truncated while reading {what}: {needed} more bytes needed")]
    Truncated { what: &'static str, needed: usize },
    #[error("{what} is not valid UTF-8")]
    InvalidUtf8 { what: &'static str },
    #[error("unknown packet type {0}")]
    UnknownPacketType(u8),
    #[error("packet type {got} where {expected} was expected")]
    UnexpectedPacketType { expected: &'static str, got: u8 },
    #[error("unknown status code {0}")]
    UnknownStatus(u32),
    #[error("{kind} flags {bits:#010x} contain unknown bits")]
    InvalidFlags { kind: &'static str, bits: u32 },
    #[error("{extra} trailing bytes after {what}")]
    TrailingBytes { what: &'static str, extra: usize },
}

pub fn put_data(buf: &mut BytesMut, data: &[u8]) {
    buf.put_u32(data.len() as u32);
    buf.put_slice(data);
}

pub fn put_string(buf: &mut BytesMut, s: &str) {
    put_data(buf, s.as_bytes());
}

/// Cursor over a received packet body.
///
/// Every accessor names the field it reads so that a truncated packet produces a useful error.
#[derive(Debug)]
pub struct Reader {
    buf: Bytes,
}

impl Reader {
    pub fn new(buf: Bytes) -> Self {
        Self { buf }
    }

    fn need(&self, what: &'static str, len: usize) -> Result<(), WireError> {
        if self.buf.remaining() < len {
            return Err(WireError::Truncated {
                what,
                needed: len - self.buf.remaining(),
            });
        }
        Ok(())
    }

    pub fn u8(&mut self, what: &'static str) -> Result<u8, WireError> {
        self.need(what, 1)?;
        Ok(self.buf.get_u8())
    }

    pub fn u32(&mut self, what: &'static str) -> Result<u32, WireError> {
        self.need(what, 4)?;
        Ok(self.buf.get_u32())
    }

    pub fn u64(&mut self, what: &'static str) -> Result<u64, WireError> {
        self.need(what, 8)?;
        Ok(self.buf.get_u64())
    }

    /// Reads a length-prefixed blob without copying.
    pub fn data(&mut self, what: &'static str) -> Result<Bytes, WireError> {
        let len = self.u32(what)? as usize;
        self.need(what, len)?;
        Ok(self.buf.split_to(len))
    }

    pub fn string(&mut self, what: &'static str) -> Result<String, WireError> {
        let raw = self.data(what)?;
        String::from_utf8(raw.to_vec()).map_err(|_| WireError::InvalidUtf8 { what })
    }

    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    /// Consumes whatever is left, used for opaque trailers such as extended replies.
    pub fn rest(&mut self) -> Bytes {
        self.buf.split_to(self.buf.remaining())
    }

    /// Fails if anything is left unread.
    pub fn finish(self, what: &'static str) -> Result<(), WireError> {
        match self.buf.remaining() {
            0 => Ok(()),
            extra => Err(WireError::TrailingBytes { what, extra }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitives_are_big_endian() {
        let mut buf = BytesMut::new();
        buf.put_u32(0x0102_0304);
        buf.put_u64(5);
        put_string(&mut buf, "ab");
        assert_eq!(
            &buf[..],
            &[1, 2, 3, 4, 0, 0, 0, 0, 0, 0, 0, 5, 0, 0, 0, 2, b'a', b'b']
        );
        let mut reader = Reader::new(buf.freeze());
        assert_eq!(reader.u32("a").unwrap(), 0x0102_0304);
        assert_eq!(reader.u64("b").unwrap(), 5);
        assert_eq!(reader.string("c").unwrap(), "ab");
        reader.finish("test").unwrap();
    }

    #[test]
    fn truncated_blob_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32(10);
        buf.put_slice(b"short");
        let mut reader = Reader::new(buf.freeze());
        assert_eq!(
            reader.data("payload"),
            Err(WireError::Truncated {
                what: "payload",
                needed: 5
            })
        );
    }

    #[test]
    fn invalid_utf8_is_rejected() {
        let mut buf = BytesMut::new();
        put_data(&mut buf, &[0xff, 0xfe]);
        let mut reader = Reader::new(buf.freeze());
        assert_eq!(
            reader.string("filename"),
            Err(WireError::InvalidUtf8 { what: "filename" })
        );
    }

    #[test]
    fn trailing_bytes_are_reported() {
        let reader = Reader::new(Bytes::from_static(&[0, 1]));
        assert_eq!(
            reader.finish("status"),
            Err(WireError::TrailingBytes {
                what: "status",
                extra: 2
            })
        );
    }
}

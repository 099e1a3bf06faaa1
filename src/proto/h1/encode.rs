use std::fmt::Write;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

/// Encoders to handle different Transfer-Encodings.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Encoder {
    kind: Kind,
}

#[derive(Debug, PartialEq, Clone)]
enum Kind {
    /// An Encoder for when Transfer-Encoding includes `chunked`.
    Chunked,
    /// An Encoder for when Content-Length is set.
    ///
    /// Enforces that the body is exactly as long as the header promised.
    Length(u64),
}

impl Encoder {
    pub(crate) fn chunked() -> Encoder {
        Encoder {
            kind: Kind::Chunked,
        }
    }

    pub(crate) fn length(len: u64) -> Encoder {
        Encoder {
            kind: Kind::Length(len),
        }
    }

    pub(crate) fn is_chunked(&self) -> bool {
        matches!(self.kind, Kind::Chunked)
    }

    pub(crate) fn is_eof(&self) -> bool {
        matches!(self.kind, Kind::Length(0))
    }

    /// Frames one body chunk for the wire.
    ///
    /// A zero-length chunk encodes to nothing at all: `0\r\n` is the chunked
    /// terminator and must only ever be produced by [`Encoder::end`].
    pub(crate) fn encode(&mut self, msg: &[u8]) -> Result<Bytes> {
        let len = msg.len();
        if len == 0 {
            return Ok(Bytes::new());
        }

        match self.kind {
            Kind::Chunked => {
                trace!("encoding chunked {}B", len);
                let mut buf = BytesMut::with_capacity(len + 18);
                write!(ChunkSize(&mut buf), "{:x}\r\n", len)
                    .expect("BytesMut has capacity for a chunk header");
                buf.put_slice(msg);
                buf.put_slice(b"\r\n");
                Ok(buf.freeze())
            }
            Kind::Length(ref mut remaining) => {
                trace!("sized write, len = {}", len);
                if len as u64 > *remaining {
                    return Err(Error::new_body_framing());
                }
                *remaining -= len as u64;
                Ok(Bytes::copy_from_slice(msg))
            }
        }
    }

    /// Frames the end of the message.
    ///
    /// Fails if a `Content-Length` body stopped short of its declared size.
    pub(crate) fn end(&self) -> Result<Bytes> {
        match self.kind {
            Kind::Chunked => Ok(Bytes::from_static(b"0\r\n\r\n")),
            Kind::Length(0) => Ok(Bytes::new()),
            Kind::Length(n) => {
                debug!("sized body ended {} bytes early", n);
                Err(Error::new_body_framing())
            }
        }
    }
}

struct ChunkSize<'a>(&'a mut BytesMut);

impl Write for ChunkSize<'_> {
    fn write_str(&mut self, s: &str) -> std::fmt::Result {
        self.0.put_slice(s.as_bytes());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunked_frames_each_piece() {
        let mut encoder = Encoder::chunked();

        assert_eq!(&*encoder.encode(b"foo").unwrap(), b"3\r\nfoo\r\n");
        assert_eq!(&*encoder.encode(b"bar").unwrap(), b"3\r\nbar\r\n");
        assert_eq!(
            &*encoder.encode(b"bazzzzzzzzzzzzzzzzzzzzzz").unwrap(),
            b"18\r\nbazzzzzzzzzzzzzzzzzzzzzz\r\n",
        );
        assert_eq!(&*encoder.end().unwrap(), b"0\r\n\r\n");
    }

    #[test]
    fn chunked_suppresses_empty_chunks() {
        let mut encoder = Encoder::chunked();

        assert!(encoder.encode(b"").unwrap().is_empty());
        // the terminator is still the only place a zero-size line appears
        assert_eq!(&*encoder.end().unwrap(), b"0\r\n\r\n");
    }

    #[test]
    fn chunk_sizes_are_lowercase_hex() {
        let mut encoder = Encoder::chunked();
        let piece = encoder.encode(&[b'x'; 26]).unwrap();
        assert!(piece.starts_with(b"1a\r\n"));
    }

    #[test]
    fn length_passes_bytes_through() {
        let mut encoder = Encoder::length(10);
        assert_eq!(&*encoder.encode(b"hello").unwrap(), b"hello");
        assert_eq!(&*encoder.encode(b"world").unwrap(), b"world");
        assert!(encoder.end().unwrap().is_empty());
    }

    #[test]
    fn length_rejects_overflow() {
        let mut encoder = Encoder::length(3);
        encoder.encode(b"foo").unwrap();
        let err = encoder.encode(b"x").unwrap_err();
        assert!(err.is_protocol());
    }

    #[test]
    fn length_rejects_early_end() {
        let mut encoder = Encoder::length(5);
        encoder.encode(b"hi").unwrap();
        let err = encoder.end().unwrap_err();
        assert!(err.is_protocol());
    }

    #[test]
    fn empty_length_body_is_eof() {
        let encoder = Encoder::length(0);
        assert!(encoder.is_eof());
        assert!(encoder.end().unwrap().is_empty());
    }
}

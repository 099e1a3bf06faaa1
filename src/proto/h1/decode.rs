use bytes::{Buf, Bytes, BytesMut};

use crate::error::{Error, Result};

use self::Kind::{Chunked, Eof, Length};

/// Maximum amount of bytes allowed in chunked extensions.
///
/// This limit is applied for the entire body, not per chunk.
const CHUNKED_EXTENSIONS_LIMIT: u64 = 1024 * 16;

/// Decoders to handle different Transfer-Encodings.
///
/// If a message body does not include a Transfer-Encoding, it *should*
/// include a Content-Length header.
///
/// The decoder is sans-I/O: it is fed the connection's receive buffer and
/// reports [`Decode::NeedData`] when it runs dry.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Decoder {
    kind: Kind,
}

#[derive(Debug, Clone, PartialEq)]
enum Kind {
    /// A Reader used when a Content-Length header is passed with a positive integer.
    Length(u64),
    /// A Reader used when Transfer-Encoding is `chunked`.
    Chunked {
        state: ChunkedState,
        chunk_len: u64,
        extensions_cnt: u64,
    },
    /// A Reader used for responses that don't indicate a length or chunked.
    ///
    /// The bool tracks when EOF is seen on the transport. Only ever used
    /// for responses; a request without framing has no body at all.
    Eof(bool),
}

/// One step of body decoding.
#[derive(Debug, PartialEq)]
pub(crate) enum Decode {
    /// A chunk of body data.
    Data(Bytes),
    /// The buffer ran dry mid-message; feed more bytes and call again.
    NeedData,
    /// The body is complete.
    End,
}

#[derive(Debug, PartialEq, Clone, Copy)]
enum ChunkedState {
    Start,
    Size,
    SizeLws,
    Extension,
    SizeLf,
    Body,
    BodyCr,
    BodyLf,
    Trailer,
    TrailerLf,
    EndCr,
    EndLf,
    End,
}

enum Step {
    Next(ChunkedState),
    NeedData,
}

impl Decoder {
    pub(crate) fn length(x: u64) -> Decoder {
        Decoder {
            kind: Kind::Length(x),
        }
    }

    pub(crate) fn chunked() -> Decoder {
        Decoder {
            kind: Kind::Chunked {
                state: ChunkedState::new(),
                chunk_len: 0,
                extensions_cnt: 0,
            },
        }
    }

    pub(crate) fn eof() -> Decoder {
        Decoder {
            kind: Kind::Eof(false),
        }
    }

    /// Whether this body is delimited by connection close.
    ///
    /// Such a body can never leave the connection reusable.
    pub(crate) fn is_close_delimited(&self) -> bool {
        matches!(self.kind, Eof(..))
    }

    pub(crate) fn decode(&mut self, buf: &mut BytesMut, eof: bool) -> Result<Decode> {
        trace!("decode; state={:?}", self.kind);
        match self.kind {
            Length(ref mut remaining) => {
                if *remaining == 0 {
                    return Ok(Decode::End);
                }
                if buf.is_empty() {
                    if eof {
                        return Err(Error::new_incomplete());
                    }
                    return Ok(Decode::NeedData);
                }
                let take = std::cmp::min(*remaining, buf.len() as u64) as usize;
                *remaining -= take as u64;
                Ok(Decode::Data(buf.split_to(take).freeze()))
            }
            Chunked {
                ref mut state,
                ref mut chunk_len,
                ref mut extensions_cnt,
            } => {
                loop {
                    let mut data = None;
                    // advances the chunked state
                    *state = match state.step(buf, eof, chunk_len, extensions_cnt, &mut data)? {
                        Step::Next(next) => next,
                        Step::NeedData => return Ok(Decode::NeedData),
                    };
                    if *state == ChunkedState::End {
                        trace!("end of chunked");
                        return Ok(Decode::End);
                    }
                    if let Some(data) = data {
                        return Ok(Decode::Data(data));
                    }
                }
            }
            Eof(ref mut is_eof) => {
                if *is_eof {
                    Ok(Decode::End)
                } else if !buf.is_empty() {
                    Ok(Decode::Data(buf.split().freeze()))
                } else if eof {
                    *is_eof = true;
                    Ok(Decode::End)
                } else {
                    Ok(Decode::NeedData)
                }
            }
        }
    }
}

macro_rules! byte (
    ($buf:ident, $eof:expr) => ({
        if let Some(&b) = $buf.first() {
            $buf.advance(1);
            b
        } else if $eof {
            return Err(Error::new_incomplete());
        } else {
            return Ok(Step::NeedData);
        }
    })
);

macro_rules! or_overflow {
    ($e:expr) => (
        match $e {
            Some(val) => val,
            None => {
                debug!("invalid chunk size: overflow");
                return Err(Error::new_body_framing());
            }
        }
    )
}

impl ChunkedState {
    fn new() -> ChunkedState {
        ChunkedState::Start
    }

    fn step(
        &self,
        buf: &mut BytesMut,
        eof: bool,
        size: &mut u64,
        extensions_cnt: &mut u64,
        data: &mut Option<Bytes>,
    ) -> Result<Step> {
        use self::ChunkedState::*;
        match *self {
            Start => ChunkedState::read_start(buf, eof, size),
            Size => ChunkedState::read_size(buf, eof, size),
            SizeLws => ChunkedState::read_size_lws(buf, eof),
            Extension => ChunkedState::read_extension(buf, eof, extensions_cnt),
            SizeLf => ChunkedState::read_size_lf(buf, eof, *size),
            Body => ChunkedState::read_body(buf, eof, size, data),
            BodyCr => ChunkedState::read_body_cr(buf, eof),
            BodyLf => ChunkedState::read_body_lf(buf, eof),
            Trailer => ChunkedState::read_trailer(buf, eof),
            TrailerLf => ChunkedState::read_trailer_lf(buf, eof),
            EndCr => ChunkedState::read_end_cr(buf, eof),
            EndLf => ChunkedState::read_end_lf(buf, eof),
            End => Ok(Step::Next(ChunkedState::End)),
        }
    }

    fn read_start(buf: &mut BytesMut, eof: bool, size: &mut u64) -> Result<Step> {
        trace!("Read chunk start");

        let radix = 16;
        match byte!(buf, eof) {
            b @ b'0'..=b'9' => {
                *size = or_overflow!(size.checked_mul(radix));
                *size = or_overflow!(size.checked_add((b - b'0') as u64));
            }
            b @ b'a'..=b'f' => {
                *size = or_overflow!(size.checked_mul(radix));
                *size = or_overflow!(size.checked_add((b + 10 - b'a') as u64));
            }
            b @ b'A'..=b'F' => {
                *size = or_overflow!(size.checked_mul(radix));
                *size = or_overflow!(size.checked_add((b + 10 - b'A') as u64));
            }
            _ => {
                debug!("invalid chunk size line: missing size digit");
                return Err(Error::new_body_framing());
            }
        }

        Ok(Step::Next(ChunkedState::Size))
    }

    fn read_size(buf: &mut BytesMut, eof: bool, size: &mut u64) -> Result<Step> {
        trace!("Read chunk hex size");

        let radix = 16;
        match byte!(buf, eof) {
            b @ b'0'..=b'9' => {
                *size = or_overflow!(size.checked_mul(radix));
                *size = or_overflow!(size.checked_add((b - b'0') as u64));
            }
            b @ b'a'..=b'f' => {
                *size = or_overflow!(size.checked_mul(radix));
                *size = or_overflow!(size.checked_add((b + 10 - b'a') as u64));
            }
            b @ b'A'..=b'F' => {
                *size = or_overflow!(size.checked_mul(radix));
                *size = or_overflow!(size.checked_add((b + 10 - b'A') as u64));
            }
            b'\t' | b' ' => return Ok(Step::Next(ChunkedState::SizeLws)),
            b';' => return Ok(Step::Next(ChunkedState::Extension)),
            b'\r' => return Ok(Step::Next(ChunkedState::SizeLf)),
            _ => {
                debug!("invalid chunk size line: invalid size");
                return Err(Error::new_body_framing());
            }
        }
        Ok(Step::Next(ChunkedState::Size))
    }

    fn read_size_lws(buf: &mut BytesMut, eof: bool) -> Result<Step> {
        trace!("read_size_lws");
        match byte!(buf, eof) {
            // LWS can follow the chunk size, but no more digits can come
            b'\t' | b' ' => Ok(Step::Next(ChunkedState::SizeLws)),
            b';' => Ok(Step::Next(ChunkedState::Extension)),
            b'\r' => Ok(Step::Next(ChunkedState::SizeLf)),
            _ => {
                debug!("invalid chunk size linear white space");
                Err(Error::new_body_framing())
            }
        }
    }

    fn read_extension(buf: &mut BytesMut, eof: bool, extensions_cnt: &mut u64) -> Result<Step> {
        trace!("read_extension");
        // Extensions "end" at the next CRLF, and we don't interpret them.
        // Some implementations may not check for the CR, so to save them
        // from themselves, reject extensions containing plain LF as well.
        match byte!(buf, eof) {
            b'\r' => Ok(Step::Next(ChunkedState::SizeLf)),
            b'\n' => {
                debug!("invalid chunk extension contains newline");
                Err(Error::new_body_framing())
            }
            _ => {
                *extensions_cnt += 1;
                if *extensions_cnt >= CHUNKED_EXTENSIONS_LIMIT {
                    debug!("chunk extensions over limit");
                    Err(Error::new_body_framing())
                } else {
                    Ok(Step::Next(ChunkedState::Extension))
                }
            }
        }
    }

    fn read_size_lf(buf: &mut BytesMut, eof: bool, size: u64) -> Result<Step> {
        trace!("Chunk size is {:?}", size);
        match byte!(buf, eof) {
            b'\n' => {
                if size == 0 {
                    Ok(Step::Next(ChunkedState::EndCr))
                } else {
                    debug!("incoming chunked header: {0:#x} ({0} bytes)", size);
                    Ok(Step::Next(ChunkedState::Body))
                }
            }
            _ => {
                debug!("invalid chunk size LF");
                Err(Error::new_body_framing())
            }
        }
    }

    fn read_body(
        buf: &mut BytesMut,
        eof: bool,
        rem: &mut u64,
        data: &mut Option<Bytes>,
    ) -> Result<Step> {
        trace!("Chunked read, remaining={:?}", rem);

        if buf.is_empty() {
            if eof {
                *rem = 0;
                return Err(Error::new_incomplete());
            }
            return Ok(Step::NeedData);
        }

        let take = std::cmp::min(*rem, buf.len() as u64) as usize;
        *data = Some(buf.split_to(take).freeze());
        *rem -= take as u64;

        if *rem > 0 {
            Ok(Step::Next(ChunkedState::Body))
        } else {
            Ok(Step::Next(ChunkedState::BodyCr))
        }
    }

    fn read_body_cr(buf: &mut BytesMut, eof: bool) -> Result<Step> {
        match byte!(buf, eof) {
            b'\r' => Ok(Step::Next(ChunkedState::BodyLf)),
            _ => {
                debug!("invalid chunk body CR");
                Err(Error::new_body_framing())
            }
        }
    }

    fn read_body_lf(buf: &mut BytesMut, eof: bool) -> Result<Step> {
        match byte!(buf, eof) {
            b'\n' => Ok(Step::Next(ChunkedState::Start)),
            _ => {
                debug!("invalid chunk body LF");
                Err(Error::new_body_framing())
            }
        }
    }

    // Trailer fields are consumed and discarded: the client core yields raw
    // body bytes and nothing downstream consumes trailers.
    fn read_trailer(buf: &mut BytesMut, eof: bool) -> Result<Step> {
        trace!("read_trailer");
        match byte!(buf, eof) {
            b'\r' => Ok(Step::Next(ChunkedState::TrailerLf)),
            _ => Ok(Step::Next(ChunkedState::Trailer)),
        }
    }

    fn read_trailer_lf(buf: &mut BytesMut, eof: bool) -> Result<Step> {
        match byte!(buf, eof) {
            b'\n' => Ok(Step::Next(ChunkedState::EndCr)),
            _ => {
                debug!("invalid trailer end LF");
                Err(Error::new_body_framing())
            }
        }
    }

    fn read_end_cr(buf: &mut BytesMut, eof: bool) -> Result<Step> {
        match byte!(buf, eof) {
            b'\r' => Ok(Step::Next(ChunkedState::EndLf)),
            _ => Ok(Step::Next(ChunkedState::Trailer)),
        }
    }

    fn read_end_lf(buf: &mut BytesMut, eof: bool) -> Result<Step> {
        match byte!(buf, eof) {
            b'\n' => Ok(Step::Next(ChunkedState::End)),
            _ => {
                debug!("invalid chunk end LF");
                Err(Error::new_body_framing())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buf(bytes: &[u8]) -> BytesMut {
        BytesMut::from(bytes)
    }

    fn all_data(decoder: &mut Decoder, buf: &mut BytesMut) -> Vec<u8> {
        let mut out = Vec::new();
        loop {
            match decoder.decode(buf, false).expect("decode") {
                Decode::Data(data) => out.extend_from_slice(&data),
                Decode::End => return out,
                Decode::NeedData => panic!("unexpected NeedData"),
            }
        }
    }

    #[test]
    fn test_decode_length() {
        let mut decoder = Decoder::length(5);
        let mut buf = buf(b"helloextra");
        assert_eq!(all_data(&mut decoder, &mut buf), b"hello");
        // bytes past the message body stay in the buffer
        assert_eq!(&buf[..], b"extra");
    }

    #[test]
    fn test_decode_length_eof_early() {
        let mut decoder = Decoder::length(10);
        let mut buf = buf(b"hell");
        assert!(matches!(
            decoder.decode(&mut buf, false).unwrap(),
            Decode::Data(_)
        ));
        let err = decoder.decode(&mut buf, true).unwrap_err();
        assert!(err.is_incomplete_message());
    }

    #[test]
    fn test_decode_chunked() {
        let mut decoder = Decoder::chunked();
        let mut buf = buf(b"3\r\nfoo\r\n3\r\nbar\r\n0\r\n\r\n");
        assert_eq!(all_data(&mut decoder, &mut buf), b"foobar");
    }

    #[test]
    fn test_decode_chunked_uppercase_size() {
        let mut decoder = Decoder::chunked();
        let mut buf = buf(b"A\r\n0123456789\r\n0\r\n\r\n");
        assert_eq!(all_data(&mut decoder, &mut buf), b"0123456789");
    }

    #[test]
    fn test_decode_chunked_across_feeds() {
        let mut decoder = Decoder::chunked();
        let mut buf = buf(b"4\r\nch");
        assert_eq!(
            decoder.decode(&mut buf, false).unwrap(),
            Decode::Data(Bytes::from_static(b"ch"))
        );
        assert_eq!(decoder.decode(&mut buf, false).unwrap(), Decode::NeedData);

        buf.extend_from_slice(b"un\r\n0\r\n\r\n");
        assert_eq!(
            decoder.decode(&mut buf, false).unwrap(),
            Decode::Data(Bytes::from_static(b"un"))
        );
        assert_eq!(decoder.decode(&mut buf, false).unwrap(), Decode::End);
    }

    #[test]
    fn test_decode_chunked_extension() {
        let mut decoder = Decoder::chunked();
        let mut buf = buf(b"3;name=value\r\nfoo\r\n0\r\n\r\n");
        assert_eq!(all_data(&mut decoder, &mut buf), b"foo");
    }

    #[test]
    fn test_decode_chunked_trailers_discarded() {
        let mut decoder = Decoder::chunked();
        let mut buf = buf(b"3\r\nfoo\r\n0\r\nExpires: never\r\nX-More: yes\r\n\r\nrest");
        assert_eq!(all_data(&mut decoder, &mut buf), b"foo");
        assert_eq!(&buf[..], b"rest");
    }

    #[test]
    fn test_decode_chunked_invalid_size() {
        let mut decoder = Decoder::chunked();
        let mut buf = buf(b"xyz\r\nfoo\r\n");
        let err = decoder.decode(&mut buf, false).unwrap_err();
        assert!(err.is_protocol());
    }

    #[test]
    fn test_decode_chunked_size_overflow() {
        let mut decoder = Decoder::chunked();
        let mut buf = buf(b"ffffffffffffffff0\r\n");
        let err = decoder.decode(&mut buf, false).unwrap_err();
        assert!(err.is_protocol());
    }

    #[test]
    fn test_decode_chunked_eof_mid_chunk() {
        let mut decoder = Decoder::chunked();
        let mut buf = buf(b"8\r\nfour");
        assert!(matches!(
            decoder.decode(&mut buf, false).unwrap(),
            Decode::Data(_)
        ));
        let err = decoder.decode(&mut buf, true).unwrap_err();
        assert!(err.is_incomplete_message());
    }

    #[test]
    fn test_decode_eof_until_close() {
        let mut decoder = Decoder::eof();
        assert!(decoder.is_close_delimited());

        let mut buf = buf(b"some bytes");
        assert_eq!(
            decoder.decode(&mut buf, false).unwrap(),
            Decode::Data(Bytes::from_static(b"some bytes"))
        );
        assert_eq!(decoder.decode(&mut buf, false).unwrap(), Decode::NeedData);
        assert_eq!(decoder.decode(&mut buf, true).unwrap(), Decode::End);
        // stays ended
        assert_eq!(decoder.decode(&mut buf, true).unwrap(), Decode::End);
    }

    #[test]
    fn test_decode_zero_length() {
        let mut decoder = Decoder::length(0);
        let mut buf = buf(b"");
        assert_eq!(decoder.decode(&mut buf, false).unwrap(), Decode::End);
    }
}

use bytes::{Buf, BytesMut};
use http::header::{HeaderName, HeaderValue, CONTENT_LENGTH, TRANSFER_ENCODING};
use http::{HeaderMap, Method, StatusCode, Version};

use super::{Decoder, Encoder};
use crate::error::{Error, Parse, Result};
use crate::proto::{BodyLength, RequestHead, ResponseHead};

pub(crate) const DEFAULT_MAX_HEADERS: usize = 100;
const AVERAGE_HEADER_SIZE: usize = 30; // totally scientific

/// Parses a response head out of `buf`, consuming the parsed bytes.
///
/// Returns `None` until a complete head is buffered.
pub(crate) fn parse_response(buf: &mut BytesMut) -> Result<Option<ResponseHead>> {
    if buf.is_empty() {
        return Ok(None);
    }

    let mut headers = [httparse::EMPTY_HEADER; DEFAULT_MAX_HEADERS];
    trace!("Response.parse([Header; {}], [u8; {}])", headers.len(), buf.len());
    let mut res = httparse::Response::new(&mut headers);

    let (head, len) = match res.parse(buf)? {
        httparse::Status::Complete(len) => {
            trace!("Response.parse Complete({})", len);
            let code = res.code.expect("complete parse has a status code");
            let status =
                StatusCode::from_u16(code).map_err(|_| Error::new_parse(Parse::Status))?;
            let version = match res.version.expect("complete parse has a version") {
                0 => Version::HTTP_10,
                1 => Version::HTTP_11,
                _ => return Err(Error::new_bad_version()),
            };

            let mut map = HeaderMap::with_capacity(res.headers.len());
            for header in res.headers.iter() {
                let name = HeaderName::from_bytes(header.name.as_bytes())
                    .map_err(|_| Error::new_parse(Parse::Header))?;
                let value = HeaderValue::from_bytes(header.value)
                    .map_err(|_| Error::new_parse(Parse::Header))?;
                map.append(name, value);
            }

            (
                ResponseHead {
                    status,
                    version,
                    headers: map,
                },
                len,
            )
        }
        httparse::Status::Partial => return Ok(None),
    };

    buf.advance(len);
    Ok(Some(head))
}

/// Picks the body decoder for a response, per RFC 7230 section 3.3.3.
pub(crate) fn response_decoder(head: &ResponseHead, method: Option<&Method>) -> Result<Decoder> {
    // 1. HEAD responses, and Status 1xx, 204, and 304 cannot have a body.
    // 2. Status 2xx to a CONNECT cannot have a body.
    // 3. Transfer-Encoding: chunked has a chunked body.
    // 4. Conflicting framing headers close the connection.
    // 5. Content-Length header has a sized body.
    // 7. Read till EOF.
    match head.status.as_u16() {
        204 | 304 => return Ok(Decoder::length(0)),
        _ => (),
    }
    match method {
        Some(&Method::HEAD) => {
            return Ok(Decoder::length(0));
        }
        Some(&Method::CONNECT) if head.status.is_success() => {
            // the connection is a tunnel now; there is no message body
            return Ok(Decoder::length(0));
        }
        Some(_) => {}
        None => {
            trace!("response_decoder is missing the request method");
        }
    }

    if head.headers.contains_key(TRANSFER_ENCODING) {
        if head.version == Version::HTTP_10 {
            debug!("HTTP/1.0 response with Transfer-Encoding header");
            return Err(Error::new_parse(Parse::Header));
        }
        if head.headers.contains_key(CONTENT_LENGTH) {
            debug!("response with both Transfer-Encoding and Content-Length");
            return Err(Error::new_parse(Parse::ConflictingFraming));
        }
        if transfer_encoding_is_chunked(&head.headers) {
            Ok(Decoder::chunked())
        } else {
            trace!("not chunked, read till eof");
            Ok(Decoder::eof())
        }
    } else if let Some(len) = content_length_parse(&head.headers)? {
        Ok(Decoder::length(len))
    } else {
        trace!("neither Transfer-Encoding nor Content-Length");
        Ok(Decoder::eof())
    }
}

/// Serializes a request head into `dst` and returns the matching body
/// encoder.
///
/// Framing precedence: an explicit `Transfer-Encoding: chunked` wins, then
/// an explicit `Content-Length`; otherwise framing headers are derived from
/// `body`: a known length becomes `Content-Length`, an unknown one becomes
/// `Transfer-Encoding: chunked`, and `None` means no body at all.
pub(crate) fn encode_request(
    head: &RequestHead,
    body: Option<BodyLength>,
    dst: &mut Vec<u8>,
) -> Result<Encoder> {
    trace!("Client::encode method={:?}, body={:?}", head.method, body);

    let has_te = head.headers.contains_key(TRANSFER_ENCODING);
    let explicit_len = content_length_parse(&head.headers)?;

    if has_te && explicit_len.is_some() {
        debug!("request with both Transfer-Encoding and Content-Length");
        return Err(Error::new_parse(Parse::ConflictingFraming));
    }

    let (encoder, inject) = if has_te {
        if !transfer_encoding_is_chunked(&head.headers) {
            // A request body can only be framed by a final chunked coding.
            debug!("request transfer-encoding does not end in chunked");
            return Err(Error::new_parse(Parse::Header));
        }
        (Encoder::chunked(), None)
    } else if let Some(len) = explicit_len {
        (Encoder::length(len), None)
    } else {
        match body {
            Some(BodyLength::Known(len)) => (Encoder::length(len), Some(Framing::Length(len))),
            Some(BodyLength::Unknown) => (Encoder::chunked(), Some(Framing::Chunked)),
            None => (Encoder::length(0), None),
        }
    };

    let init_cap = 30 + head.headers.len() * AVERAGE_HEADER_SIZE;
    dst.reserve(init_cap);
    dst.extend_from_slice(head.method.as_str().as_bytes());
    dst.push(b' ');
    dst.extend_from_slice(head.target.as_bytes());
    dst.extend_from_slice(b" HTTP/1.1\r\n");

    write_headers(&head.headers, dst);

    match inject {
        Some(Framing::Length(len)) => {
            let mut buf = [0u8; 20];
            dst.extend_from_slice(b"content-length: ");
            dst.extend_from_slice(write_decimal(&mut buf, len));
            dst.extend_from_slice(b"\r\n");
        }
        Some(Framing::Chunked) => {
            dst.extend_from_slice(b"transfer-encoding: chunked\r\n");
        }
        None => {}
    }

    dst.extend_from_slice(b"\r\n");

    Ok(encoder)
}

enum Framing {
    Length(u64),
    Chunked,
}

/// Header names go out lowercased ASCII; values are passed through as the
/// opaque (latin-1) bytes they already are.
pub(crate) fn write_headers(headers: &HeaderMap, dst: &mut Vec<u8>) {
    for (name, value) in headers.iter() {
        dst.extend_from_slice(name.as_str().as_bytes());
        dst.extend_from_slice(b": ");
        dst.extend_from_slice(value.as_bytes());
        dst.extend_from_slice(b"\r\n");
    }
}

fn write_decimal(buf: &mut [u8; 20], mut value: u64) -> &[u8] {
    let mut pos = buf.len();
    loop {
        pos -= 1;
        buf[pos] = b'0' + (value % 10) as u8;
        value /= 10;
        if value == 0 {
            break;
        }
    }
    &buf[pos..]
}

/// Parses Content-Length, rejecting differing duplicates.
fn content_length_parse(headers: &HeaderMap) -> Result<Option<u64>> {
    let mut len = None;
    for value in headers.get_all(CONTENT_LENGTH) {
        let parsed = value
            .to_str()
            .ok()
            .and_then(|s| s.trim().parse::<u64>().ok())
            .ok_or_else(|| Error::new_parse(Parse::ContentLength))?;
        if let Some(prev) = len {
            if prev != parsed {
                debug!("differing Content-Length values: {} != {}", prev, parsed);
                return Err(Error::new_parse(Parse::ContentLength));
            }
        }
        len = Some(parsed);
    }
    Ok(len)
}

/// True when the final transfer coding is `chunked`.
fn transfer_encoding_is_chunked(headers: &HeaderMap) -> bool {
    let mut last = None;
    for value in headers.get_all(TRANSFER_ENCODING) {
        let value = match value.to_str() {
            Ok(value) => value,
            Err(_) => return false,
        };
        for coding in value.split(',') {
            let coding = coding.trim();
            if !coding.is_empty() {
                last = Some(coding);
            }
        }
    }
    matches!(last, Some(coding) if coding.eq_ignore_ascii_case("chunked"))
}

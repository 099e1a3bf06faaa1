//! Wire-protocol types shared by the framing layer and the client.

pub(crate) mod h1;

use http::{HeaderMap, Method, StatusCode, Version};

/// The head of an outgoing request: everything before the body.
#[derive(Debug)]
pub(crate) struct RequestHead {
    pub(crate) method: Method,
    /// Origin-form target (`/path?query`), or authority-form for CONNECT.
    pub(crate) target: String,
    pub(crate) headers: HeaderMap,
}

impl RequestHead {
    pub(crate) fn new(method: Method, target: String) -> RequestHead {
        RequestHead {
            method,
            target,
            headers: HeaderMap::new(),
        }
    }
}

/// The head of an incoming response.
///
/// Only final (`>= 200`) responses are surfaced by the client; informational
/// responses are consumed by the framing engine's caller.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    /// The response status code.
    pub status: StatusCode,
    /// The HTTP version the peer announced (1.0 or 1.1).
    pub version: Version,
    /// The response headers, in wire order.
    pub headers: HeaderMap,
}

/// How much body the caller intends to send.
///
/// The framing engine turns this into wire framing: a known length becomes
/// `Content-Length`, an unknown one becomes `Transfer-Encoding: chunked`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BodyLength {
    /// Content-Length
    Known(u64),
    /// Transfer-Encoding: chunked
    Unknown,
}

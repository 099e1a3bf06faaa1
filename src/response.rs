//! Responses and their lazy bodies.

use std::fmt;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use http::{HeaderMap, Method, StatusCode, Version};
use url::Url;

use crate::client::conn::Connection;
use crate::client::connect::Stream;
use crate::client::pool::Pooled;
use crate::error::Result;
use crate::proto::ResponseHead;

/// An HTTP response.
///
/// The body is a single-use lazy sequence of byte chunks backed by the
/// pooled connection. Draining it to end-of-message hands the connection
/// back to its pool; dropping the response mid-stream closes the
/// connection instead, because its framing state cannot be rewound.
pub struct Response {
    head: ResponseHead,
    url: Url,
    body: Incoming,
}

impl Response {
    pub(crate) async fn new(
        head: ResponseHead,
        url: Url,
        method: Method,
        conn: Pooled<Connection<Stream>>,
        read_timeout: Option<Duration>,
    ) -> Response {
        let mut body = Incoming {
            conn: Some(conn),
            read_timeout,
            done: false,
        };
        // A bodiless response is already at end-of-message; pulling the
        // terminator now recycles the connection without waiting for the
        // caller to read a body that does not exist.
        if bodiless(&head, &method) {
            let _ = body.chunk().await;
        }
        Response { head, url, body }
    }

    /// The response status code.
    pub fn status(&self) -> StatusCode {
        self.head.status
    }

    /// The HTTP version the server answered with.
    pub fn version(&self) -> Version {
        self.head.version
    }

    /// The response headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.head.headers
    }

    /// The URL that produced this response (after any redirects).
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Pulls the next body chunk; `None` once the body is complete.
    pub async fn chunk(&mut self) -> Result<Option<Bytes>> {
        self.body.chunk().await
    }

    /// Reads the whole body into one buffer.
    pub async fn bytes(mut self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        while let Some(chunk) = self.body.chunk().await? {
            buf.extend_from_slice(&chunk);
        }
        Ok(buf.freeze())
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.head.status)
            .field("url", &self.url.as_str())
            .finish()
    }
}

fn bodiless(head: &ResponseHead, method: &Method) -> bool {
    *method == Method::HEAD
        || matches!(head.status.as_u16(), 204 | 304)
        || head
            .headers
            .get(http::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim() == "0")
            .unwrap_or(false)
}

/// The lazy body handle owning the pooled connection.
struct Incoming {
    conn: Option<Pooled<Connection<Stream>>>,
    read_timeout: Option<Duration>,
    done: bool,
}

impl Incoming {
    async fn chunk(&mut self) -> Result<Option<Bytes>> {
        if self.done {
            return Ok(None);
        }
        let conn = match self.conn {
            Some(ref mut conn) => conn,
            None => return Ok(None),
        };
        match conn.read_body_chunk(self.read_timeout).await {
            Ok(Some(chunk)) => Ok(Some(chunk)),
            Ok(None) => {
                self.done = true;
                // end-of-message already cycled (or closed) the engine;
                // dropping the checkout recycles or discards accordingly
                self.conn.take();
                Ok(None)
            }
            Err(err) => {
                self.done = true;
                if let Some(conn) = self.conn.take() {
                    conn.discard();
                }
                Err(err)
            }
        }
    }
}

// Dropping `Incoming` drops the `Pooled` guard. A mid-stream drop leaves
// the engine non-idle, so the guard closes the connection rather than
// pooling it.

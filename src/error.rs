//! Error and Result module.

use std::error::Error as StdError;
use std::fmt;

use crate::proto::ResponseHead;

/// Result type often returned from methods that can have filament `Error`s.
pub type Result<T> = std::result::Result<T, Error>;

type Cause = Box<dyn StdError + Send + Sync>;

/// Represents errors that can occur while handling an HTTP exchange.
pub struct Error {
    inner: Box<ErrorImpl>,
}

struct ErrorImpl {
    kind: Kind,
    cause: Option<Cause>,
    url: Option<url::Url>,
    tunnel_response: Option<ResponseHead>,
}

#[derive(Debug)]
pub(super) enum Kind {
    /// The transport did not finish connecting within the connect timeout.
    ConnectTimeout,
    /// The transport failed to establish a new connection.
    NewConnection,
    /// A read did not complete within the read timeout.
    ReadTimeout,
    /// An HTTP/1.1 framing invariant was broken, or the peer closed the
    /// stream mid-message.
    Protocol(Parse),
    /// The response announced an HTTP version other than 1.0 or 1.1.
    BadVersion,
    /// TLS handshake, certificate verification, or fingerprint mismatch.
    Tls,
    /// The proxy answered the CONNECT request with a non-2xx status.
    FailedTunnel,
    /// The request body is text or not an accepted shape.
    InvalidBody,
    /// The request body had to be replayed but could not record or restore
    /// its read position.
    UnrewindableBody,
    /// The retry policy is exhausted; wraps the last cause.
    MaxRetry,
    /// The pool is at capacity and no connection became available in time.
    PoolEmpty,
    /// The pool has been closed.
    PoolClosed,
    /// The request URL (or a redirect target) could not be used.
    InvalidUrl,
}

#[derive(Debug)]
pub(super) enum Parse {
    Status,
    Header,
    TooLarge,
    ContentLength,
    ConflictingFraming,
    /// The peer closed the connection before the message completed.
    IncompleteMessage,
    /// Received bytes (or a message) when not expecting one.
    UnexpectedMessage,
    /// An exchange was started while a previous one was still in flight.
    State,
    /// More (or less) body than the declared framing allows.
    BodyFraming,
}

impl Error {
    /// Returns true if the connect phase timed out.
    pub fn is_connect_timeout(&self) -> bool {
        matches!(self.inner.kind, Kind::ConnectTimeout)
    }

    /// Returns true if this error happened while establishing a connection.
    pub fn is_connect(&self) -> bool {
        matches!(self.inner.kind, Kind::ConnectTimeout | Kind::NewConnection)
    }

    /// Returns true if a read exceeded the read timeout.
    pub fn is_read_timeout(&self) -> bool {
        matches!(self.inner.kind, Kind::ReadTimeout)
    }

    /// Returns true if this was an HTTP/1.1 framing or parse error.
    pub fn is_protocol(&self) -> bool {
        matches!(self.inner.kind, Kind::Protocol(_))
    }

    /// Returns true if the peer closed the connection mid-message.
    pub fn is_incomplete_message(&self) -> bool {
        matches!(self.inner.kind, Kind::Protocol(Parse::IncompleteMessage))
    }

    /// Returns true if the response carried an unsupported HTTP version.
    pub fn is_bad_version(&self) -> bool {
        matches!(self.inner.kind, Kind::BadVersion)
    }

    /// Returns true if this was a TLS error.
    pub fn is_tls(&self) -> bool {
        matches!(self.inner.kind, Kind::Tls)
    }

    /// Returns true if a proxy refused the CONNECT tunnel.
    pub fn is_failed_tunnel(&self) -> bool {
        matches!(self.inner.kind, Kind::FailedTunnel)
    }

    /// Returns true if the request body was rejected before any wire
    /// activity.
    pub fn is_invalid_body(&self) -> bool {
        matches!(self.inner.kind, Kind::InvalidBody)
    }

    /// Returns true if a body replay was required but impossible.
    pub fn is_unrewindable_body(&self) -> bool {
        matches!(self.inner.kind, Kind::UnrewindableBody)
    }

    /// Returns true if the retry policy gave up.
    pub fn is_max_retry(&self) -> bool {
        matches!(self.inner.kind, Kind::MaxRetry)
    }

    /// Returns true if a pool checkout timed out at capacity.
    pub fn is_pool_empty(&self) -> bool {
        matches!(self.inner.kind, Kind::PoolEmpty)
    }

    /// Returns true if the pool was closed.
    pub fn is_pool_closed(&self) -> bool {
        matches!(self.inner.kind, Kind::PoolClosed)
    }

    /// The response the proxy sent to a failed CONNECT request, if this is
    /// a tunnel error.
    pub fn tunnel_response(&self) -> Option<&ResponseHead> {
        self.inner.tunnel_response.as_ref()
    }

    /// The URL associated with this error, when known.
    pub fn url(&self) -> Option<&url::Url> {
        self.inner.url.as_ref()
    }

    /// Consumes the error, returning its cause.
    pub fn into_cause(self) -> Option<Box<dyn StdError + Send + Sync>> {
        self.inner.cause
    }

    pub(super) fn new(kind: Kind) -> Error {
        Error {
            inner: Box::new(ErrorImpl {
                kind,
                cause: None,
                url: None,
                tunnel_response: None,
            }),
        }
    }

    pub(super) fn with<C: Into<Cause>>(mut self, cause: C) -> Error {
        self.inner.cause = Some(cause.into());
        self
    }

    pub(super) fn with_url(mut self, url: url::Url) -> Error {
        self.inner.url = Some(url);
        self
    }

    pub(crate) fn new_connect_timeout() -> Error {
        Error::new(Kind::ConnectTimeout)
    }

    pub(crate) fn new_connect<E: Into<Cause>>(cause: E) -> Error {
        Error::new(Kind::NewConnection).with(cause)
    }

    pub(crate) fn new_read_timeout() -> Error {
        Error::new(Kind::ReadTimeout)
    }

    pub(crate) fn new_io(cause: std::io::Error) -> Error {
        Error::new(Kind::Protocol(Parse::IncompleteMessage)).with(cause)
    }

    pub(crate) fn new_incomplete() -> Error {
        Error::new(Kind::Protocol(Parse::IncompleteMessage))
    }

    pub(crate) fn new_unexpected_message() -> Error {
        Error::new(Kind::Protocol(Parse::UnexpectedMessage))
    }

    pub(crate) fn new_state() -> Error {
        Error::new(Kind::Protocol(Parse::State))
    }

    pub(crate) fn new_body_framing() -> Error {
        Error::new(Kind::Protocol(Parse::BodyFraming))
    }

    pub(crate) fn new_bad_version() -> Error {
        Error::new(Kind::BadVersion)
    }

    pub(crate) fn new_tls<E: Into<Cause>>(cause: E) -> Error {
        Error::new(Kind::Tls).with(cause)
    }

    pub(crate) fn new_tls_msg(msg: &'static str) -> Error {
        Error::new(Kind::Tls).with(msg)
    }

    pub(crate) fn new_tunnel(response: ResponseHead) -> Error {
        let mut err = Error::new(Kind::FailedTunnel);
        err.inner.tunnel_response = Some(response);
        err
    }

    pub(crate) fn new_invalid_body(msg: &'static str) -> Error {
        Error::new(Kind::InvalidBody).with(msg)
    }

    pub(crate) fn new_unrewindable_body() -> Error {
        Error::new(Kind::UnrewindableBody)
    }

    pub(crate) fn new_max_retry(url: url::Url, cause: Option<Error>) -> Error {
        let err = Error::new(Kind::MaxRetry).with_url(url);
        match cause {
            Some(cause) => err.with(cause),
            None => err,
        }
    }

    pub(crate) fn new_pool_empty() -> Error {
        Error::new(Kind::PoolEmpty)
    }

    pub(crate) fn new_pool_closed() -> Error {
        Error::new(Kind::PoolClosed)
    }

    pub(crate) fn new_invalid_url(msg: &'static str) -> Error {
        Error::new(Kind::InvalidUrl).with(msg)
    }

    fn description(&self) -> &str {
        match self.inner.kind {
            Kind::ConnectTimeout => "connection attempt timed out",
            Kind::NewConnection => "failed to establish a new connection",
            Kind::ReadTimeout => "read timed out",
            Kind::Protocol(Parse::Status) => "invalid HTTP status-code parsed",
            Kind::Protocol(Parse::Header) => "invalid HTTP header parsed",
            Kind::Protocol(Parse::TooLarge) => "message head is too large",
            Kind::Protocol(Parse::ContentLength) => "invalid content-length parsed",
            Kind::Protocol(Parse::ConflictingFraming) => {
                "conflicting content-length and transfer-encoding"
            }
            Kind::Protocol(Parse::IncompleteMessage) => {
                "connection closed before message completed"
            }
            Kind::Protocol(Parse::UnexpectedMessage) => {
                "received unexpected message from connection"
            }
            Kind::Protocol(Parse::State) => "exchange started in a non-idle state",
            Kind::Protocol(Parse::BodyFraming) => {
                "body did not match the declared framing"
            }
            Kind::BadVersion => "response has unsupported HTTP version",
            Kind::Tls => "TLS error",
            Kind::FailedTunnel => "unable to establish CONNECT tunnel",
            Kind::InvalidBody => "unacceptable request body",
            Kind::UnrewindableBody => "unable to rewind request body for replay",
            Kind::MaxRetry => "max retries exceeded",
            Kind::PoolEmpty => "no pooled connection became available",
            Kind::PoolClosed => "pool is closed",
            Kind::InvalidUrl => "invalid URL",
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut f = f.debug_tuple("filament::Error");
        f.field(&self.inner.kind);
        if let Some(ref url) = self.inner.url {
            f.field(&url.as_str());
        }
        if let Some(ref cause) = self.inner.cause {
            f.field(cause);
        }
        f.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())?;
        if let Some(ref url) = self.inner.url {
            write!(f, " for url ({})", url)?;
        }
        if let Some(ref cause) = self.inner.cause {
            write!(f, ": {}", cause)?;
        }
        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner
            .cause
            .as_ref()
            .map(|cause| &**cause as &(dyn StdError + 'static))
    }
}

impl From<httparse::Error> for Error {
    fn from(err: httparse::Error) -> Error {
        match err {
            httparse::Error::HeaderName
            | httparse::Error::HeaderValue
            | httparse::Error::NewLine
            | httparse::Error::Token => Error::new(Kind::Protocol(Parse::Header)),
            httparse::Error::Status => Error::new(Kind::Protocol(Parse::Status)),
            httparse::Error::TooManyHeaders => Error::new(Kind::Protocol(Parse::TooLarge)),
            // httparse only accepts HTTP/1.x version literals, so a version
            // error here means the peer spoke something else entirely.
            httparse::Error::Version => Error::new_bad_version(),
        }
    }
}

impl Error {
    pub(crate) fn new_parse(parse: Parse) -> Error {
        Error::new(Kind::Protocol(parse))
    }
}

#[doc(hidden)]
trait AssertSendSync: Send + Sync + 'static {}
#[doc(hidden)]
impl AssertSendSync for Error {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_is_small() {
        assert_eq!(std::mem::size_of::<Error>(), std::mem::size_of::<usize>());
    }

    #[test]
    fn predicates_match_kinds() {
        assert!(Error::new_connect_timeout().is_connect_timeout());
        assert!(Error::new_connect_timeout().is_connect());
        assert!(Error::new_read_timeout().is_read_timeout());
        assert!(Error::new_incomplete().is_protocol());
        assert!(Error::new_incomplete().is_incomplete_message());
        assert!(Error::new_bad_version().is_bad_version());
        assert!(Error::new_unrewindable_body().is_unrewindable_body());
        assert!(Error::new_pool_empty().is_pool_empty());
    }

    #[test]
    fn max_retry_keeps_cause() {
        let url = url::Url::parse("http://example.com/").unwrap();
        let err = Error::new_max_retry(url, Some(Error::new_read_timeout()));
        assert!(err.is_max_retry());
        let source = err.source().expect("source");
        let inner = source.downcast_ref::<Error>().expect("inner error");
        assert!(inner.is_read_timeout());
    }
}

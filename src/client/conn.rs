//! A single HTTP/1.1 connection.
//!
//! A [`Connection`] binds one byte stream to one protocol engine and runs
//! one exchange at a time: serialize and send the request while
//! concurrently watching for the response head (servers may answer before
//! the body is done, e.g. a 413 to a large upload), then stream the
//! response body chunk by chunk. After end-of-message the engine decides
//! whether the connection may be reused.

use std::future::Future;
use std::io;
use std::net::Ipv6Addr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use http::header::{HeaderValue, HOST};
use http::{HeaderMap, Method, StatusCode};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

use super::connect::{connect_tcp, ConnectConfig, Stream};
use super::pool::Poolable;
use crate::body::Body;
use crate::error::{Error, Result};
use crate::proto::h1::{Engine, Event};
use crate::proto::{RequestHead, ResponseHead};
use crate::tls::TlsContext;

/// CONNECT tunnel parameters: the downstream origin and any extra headers
/// for the proxy.
#[derive(Clone, Debug)]
pub(crate) struct Tunnel {
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) headers: HeaderMap,
}

/// One HTTP/1.1 connection, possibly not yet established.
#[derive(Debug)]
pub(crate) struct Connection<T = Stream> {
    io: Option<T>,
    engine: Option<Engine>,
    host: String,
    port: u16,
    tunnel: Option<Tunnel>,
    is_verified: bool,
}

impl Connection<Stream> {
    /// A new, unconnected connection to `(host, port)`: the proxy when
    /// tunneling, otherwise the origin itself.
    pub(crate) fn new(host: String, port: u16, tunnel: Option<Tunnel>) -> Connection<Stream> {
        Connection {
            io: None,
            engine: None,
            host,
            port,
            tunnel,
            is_verified: false,
        }
    }

    /// Establishes the transport: TCP, then the CONNECT tunnel if one is
    /// configured, then TLS if a context is given.
    ///
    /// The whole sequence is bounded by `timeout`; expiry is a
    /// `ConnectTimeoutError`. Already-connected connections return
    /// immediately.
    pub(crate) async fn connect(
        &mut self,
        tls: Option<&TlsContext>,
        timeout: Option<Duration>,
        config: &ConnectConfig,
    ) -> Result<()> {
        if self.io.is_some() {
            return Ok(());
        }
        let establishing = self.establish(tls, config);
        match timeout {
            Some(dur) => match tokio::time::timeout(dur, establishing).await {
                Ok(result) => result,
                Err(_elapsed) => {
                    debug!("connect to {}:{} timed out", self.host, self.port);
                    Err(Error::new_connect_timeout())
                }
            },
            None => establishing.await,
        }
    }

    async fn establish(&mut self, tls: Option<&TlsContext>, config: &ConnectConfig) -> Result<()> {
        let mut tcp = connect_tcp(&self.host, self.port, config).await?;

        if self.tunnel.is_some() {
            // on failure `tcp` is dropped here, closing the socket
            self.tunnel_exchange(&mut tcp).await?;
        }

        let stream = match tls {
            Some(ctx) => {
                let default_host = self
                    .tunnel
                    .as_ref()
                    .map(|tunnel| tunnel.host.as_str())
                    .unwrap_or(&self.host);
                let tls_stream = ctx.handshake(tcp, default_host).await?;
                self.is_verified = ctx.is_verified();
                debug!(
                    "TLS established to {} (verified={})",
                    default_host, self.is_verified
                );
                Stream::Tls(Box::new(tls_stream))
            }
            None => Stream::Plain(tcp),
        };

        self.io = Some(stream);
        self.engine = Some(Engine::new());
        Ok(())
    }

    /// Issues the CONNECT exchange on the raw socket, using a disposable
    /// engine so the tunnel's framing state never leaks into the real
    /// exchange.
    async fn tunnel_exchange<I>(&self, tcp: &mut I) -> Result<()>
    where
        I: AsyncRead + AsyncWrite + Unpin,
    {
        let tunnel = self.tunnel.as_ref().expect("tunnel_exchange without tunnel");
        let target = authority_form(&tunnel.host, tunnel.port);
        debug!("establishing CONNECT tunnel to {}", target);

        let mut head = RequestHead::new(Method::CONNECT, target.clone());
        head.headers = tunnel.headers.clone();
        if !head.headers.contains_key(HOST) {
            let value = HeaderValue::from_str(&target)
                .map_err(|_| Error::new_invalid_url("tunnel host is not a valid header value"))?;
            head.headers.insert(HOST, value);
        }

        let mut engine = Engine::new();
        let mut wire = BytesMut::from(&engine.send_request(&head, None)?[..]);
        wire.extend_from_slice(&engine.send_eom()?);
        tcp.write_all(&wire).await.map_err(Error::new_io)?;
        tcp.flush().await.map_err(Error::new_io)?;

        let mut buf = [0u8; 8192];
        let head = loop {
            match engine.next_event()? {
                Event::Response(head) => break head,
                Event::Informational(_) => continue,
                Event::NeedData => {
                    let n = tcp.read(&mut buf).await.map_err(Error::new_io)?;
                    engine.receive_data(&buf[..n]);
                }
                Event::ConnectionClosed => return Err(Error::new_incomplete()),
                Event::Data(..) | Event::EndOfMessage => {
                    return Err(Error::new_unexpected_message())
                }
            }
        };

        if head.status != StatusCode::OK {
            debug!("CONNECT tunnel refused with {}", head.status);
            return Err(Error::new_tunnel(head));
        }
        Ok(())
    }
}

impl<T> Connection<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    /// Binds a connection directly onto an established stream.
    #[cfg(test)]
    pub(crate) fn from_stream(io: T) -> Connection<T> {
        Connection {
            io: Some(io),
            engine: Some(Engine::new()),
            host: String::new(),
            port: 0,
            tunnel: None,
            is_verified: false,
        }
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.io.is_some()
    }

    /// Both framing halves are idle (or the connection was never bound).
    pub(crate) fn is_complete(&self) -> bool {
        match self.engine {
            Some(ref engine) => engine.is_idle(),
            None => true,
        }
    }

    /// Sends a request and waits for the final response head.
    ///
    /// The body is written while the socket is concurrently polled for the
    /// response; the moment a final response parses, sending stops. An
    /// aborted send poisons the engine so the connection is never reused.
    /// `read_timeout` bounds every individual read, resetting whenever
    /// bytes arrive.
    pub(crate) async fn send_request(
        &mut self,
        head: RequestHead,
        body: &mut Body,
        read_timeout: Option<Duration>,
    ) -> Result<ResponseHead> {
        let io = self.io.as_mut().ok_or_else(Error::new_state)?;
        let engine = self.engine.as_mut().ok_or_else(Error::new_state)?;

        let body_len = body.length();

        // Combine the head with the first framed body piece so small
        // requests leave in one packet.
        let mut write_buf = BytesMut::from(&engine.send_request(&head, body_len)?[..]);
        let mut body_done = false;
        if body_len.is_some() {
            match body.next_chunk()? {
                Some(chunk) => write_buf.extend_from_slice(&engine.send_data(&chunk)?),
                None => {
                    write_buf.extend_from_slice(&engine.send_eom()?);
                    body_done = true;
                }
            }
        } else {
            write_buf.extend_from_slice(&engine.send_eom()?);
            body_done = true;
        }

        let mut scratch = [0u8; 8192];
        let mut saw_eof = false;
        let mut sleep = read_timeout.map(|dur| Box::pin(tokio::time::sleep(dur)));

        let result = futures_util::future::poll_fn(|cx| {
            exchange_step(
                cx,
                io,
                engine,
                body,
                &mut write_buf,
                &mut body_done,
                &mut saw_eof,
                &mut scratch,
                &mut sleep,
                read_timeout,
            )
        })
        .await;

        if !body_done || !write_buf.is_empty() {
            // The response arrived (or the exchange died) before the
            // request finished going out.
            engine.send_failed();
        }

        result
    }

    /// Pulls the next response body chunk; `None` means end-of-message,
    /// after which the engine has been cycled (or the connection closed).
    pub(crate) async fn read_body_chunk(
        &mut self,
        read_timeout: Option<Duration>,
    ) -> Result<Option<Bytes>> {
        loop {
            let engine = self.engine.as_mut().ok_or_else(Error::new_state)?;
            match engine.next_event()? {
                Event::Data(data) => return Ok(Some(data)),
                Event::EndOfMessage => {
                    self.reset();
                    return Ok(None);
                }
                Event::NeedData => {
                    let io = self.io.as_mut().ok_or_else(Error::new_state)?;
                    let mut buf = [0u8; 8192];
                    let n = match read_timeout {
                        Some(dur) => match tokio::time::timeout(dur, io.read(&mut buf)).await {
                            Ok(read) => read.map_err(Error::new_io)?,
                            Err(_elapsed) => return Err(Error::new_read_timeout()),
                        },
                        None => io.read(&mut buf).await.map_err(Error::new_io)?,
                    };
                    engine.receive_data(&buf[..n]);
                }
                Event::ConnectionClosed => return Err(Error::new_incomplete()),
                Event::Informational(_) | Event::Response(_) => {
                    return Err(Error::new_unexpected_message())
                }
            }
        }
    }

    /// Reads and discards the rest of the response body so the connection
    /// can be recycled. Bails out (closing the connection) past `limit`
    /// discarded bytes.
    pub(crate) async fn drain_body(
        &mut self,
        read_timeout: Option<Duration>,
        limit: usize,
    ) -> Result<()> {
        let mut drained = 0;
        while let Some(chunk) = self.read_body_chunk(read_timeout).await? {
            drained += chunk.len();
            if drained > limit {
                debug!("response body too large to drain; discarding connection");
                self.close();
                break;
            }
        }
        Ok(())
    }

    /// Checks whether the finished exchange left the connection reusable;
    /// closes it if not.
    fn reset(&mut self) {
        let reusable = self
            .engine
            .as_mut()
            .map(|engine| engine.start_next_cycle().is_ok())
            .unwrap_or(false);
        if reusable {
            trace!("connection ready for reuse");
        } else {
            self.close();
        }
    }

    /// Drops the socket and the engine. Idempotent.
    pub(crate) fn close(&mut self) {
        if self.io.is_some() {
            trace!("closing connection");
        }
        self.engine = None;
        self.io = None;
    }
}

/// One cooperative step of the send-and-receive loop.
///
/// Reads are drained first so an early final response short-circuits
/// sending; then at most one write makes progress. Returning `Pending`
/// only happens with both sides' wakers registered.
#[allow(clippy::too_many_arguments)]
fn exchange_step<T>(
    cx: &mut Context<'_>,
    io: &mut T,
    engine: &mut Engine,
    body: &mut Body,
    write_buf: &mut BytesMut,
    body_done: &mut bool,
    saw_eof: &mut bool,
    scratch: &mut [u8],
    sleep: &mut Option<Pin<Box<tokio::time::Sleep>>>,
    read_timeout: Option<Duration>,
) -> Poll<Result<ResponseHead>>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        // Parse anything already buffered.
        loop {
            match engine.next_event() {
                Ok(Event::NeedData) => break,
                Ok(Event::Informational(head)) => {
                    trace!("ignoring informational response: {}", head.status);
                }
                Ok(Event::Response(head)) => return Poll::Ready(Ok(head)),
                Ok(Event::ConnectionClosed) => {
                    return Poll::Ready(Err(Error::new_incomplete()))
                }
                Ok(Event::Data(..)) | Ok(Event::EndOfMessage) => {
                    return Poll::Ready(Err(Error::new_unexpected_message()))
                }
                Err(err) => return Poll::Ready(Err(err)),
            }
        }

        // Pull received bytes without ever blocking the send.
        if !*saw_eof {
            let mut read_buf = ReadBuf::new(&mut *scratch);
            match Pin::new(&mut *io).poll_read(cx, &mut read_buf) {
                Poll::Ready(Ok(())) => {
                    let filled = read_buf.filled();
                    if filled.is_empty() {
                        *saw_eof = true;
                    }
                    engine.receive_data(filled);
                    if let (Some(sleep), Some(dur)) = (sleep.as_mut(), read_timeout) {
                        sleep
                            .as_mut()
                            .reset(tokio::time::Instant::now() + dur);
                    }
                    continue;
                }
                Poll::Ready(Err(err)) => return Poll::Ready(Err(Error::new_io(err))),
                Poll::Pending => {}
            }
        }

        // Produce the next framed piece when the buffer runs dry.
        if write_buf.is_empty() && !*body_done {
            match body.next_chunk() {
                Ok(Some(chunk)) => match engine.send_data(&chunk) {
                    Ok(bytes) => write_buf.extend_from_slice(&bytes),
                    Err(err) => return Poll::Ready(Err(err)),
                },
                Ok(None) => {
                    match engine.send_eom() {
                        Ok(bytes) => write_buf.extend_from_slice(&bytes),
                        Err(err) => return Poll::Ready(Err(err)),
                    }
                    *body_done = true;
                }
                Err(err) => return Poll::Ready(Err(err)),
            }
            if write_buf.is_empty() && !*body_done {
                // a zero-length chunk was suppressed; produce the next one
                continue;
            }
        }

        let mut wrote = false;
        if !write_buf.is_empty() {
            match Pin::new(&mut *io).poll_write(cx, write_buf) {
                Poll::Ready(Ok(0)) => {
                    return Poll::Ready(Err(Error::new_io(io::ErrorKind::WriteZero.into())))
                }
                Poll::Ready(Ok(n)) => {
                    write_buf.advance(n);
                    wrote = true;
                }
                Poll::Ready(Err(err)) => return Poll::Ready(Err(Error::new_io(err))),
                Poll::Pending => {}
            }
        } else if *body_done {
            if let Poll::Ready(Err(err)) = Pin::new(&mut *io).poll_flush(cx) {
                return Poll::Ready(Err(Error::new_io(err)));
            }
        }

        if wrote {
            continue;
        }

        if let Some(sleep) = sleep.as_mut() {
            if sleep.as_mut().poll(cx).is_ready() {
                return Poll::Ready(Err(Error::new_read_timeout()));
            }
        }
        return Poll::Pending;
    }
}

impl Poolable for Connection<Stream> {
    fn is_open(&mut self) -> bool {
        let idle = match self.engine {
            Some(ref engine) => engine.is_idle(),
            None => return false,
        };
        match self.io {
            Some(ref stream) => idle && !stream.is_half_closed(),
            None => false,
        }
    }

    fn close(&mut self) {
        Connection::close(self);
    }
}

/// CONNECT targets are authority-form, with IPv6 literals bracketed.
fn authority_form(host: &str, port: u16) -> String {
    if host.parse::<Ipv6Addr>().is_ok() {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::ResponseHead;
    use http::Version;

    fn head_for(method: Method, target: &str, host: &'static str) -> RequestHead {
        let mut head = RequestHead::new(method, target.to_string());
        head.headers.insert(HOST, HeaderValue::from_static(host));
        head
    }

    async fn collect_body(
        conn: &mut Connection<tokio_test::io::Mock>,
    ) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(chunk) = conn.read_body_chunk(None).await.unwrap() {
            out.extend_from_slice(&chunk);
        }
        out
    }

    #[tokio::test]
    async fn test_get_exchange() {
        let mock = tokio_test::io::Builder::new()
            .write(b"GET /path HTTP/1.1\r\nhost: example.com\r\n\r\n")
            .read(b"HTTP/1.1 200 OK\r\ncontent-length: 5\r\n\r\nhello")
            .build();
        let mut conn = Connection::from_stream(mock);

        let head = conn
            .send_request(
                head_for(Method::GET, "/path", "example.com"),
                &mut Body::empty(),
                None,
            )
            .await
            .unwrap();
        assert_eq!(head.status, StatusCode::OK);
        assert_eq!(head.version, Version::HTTP_11);

        assert_eq!(collect_body(&mut conn).await, b"hello");
        // clean keep-alive exchange: ready for the next cycle
        assert!(conn.is_complete());
    }

    #[tokio::test]
    async fn test_chunked_upload_wire_format() {
        let mock = tokio_test::io::Builder::new()
            .write(b"POST /upload HTTP/1.1\r\nhost: example.com\r\ntransfer-encoding: chunked\r\n\r\n3\r\nfoo\r\n")
            .write(b"3\r\nbar\r\n")
            .write(b"18\r\nbazzzzzzzzzzzzzzzzzzzzzz\r\n")
            .write(b"0\r\n\r\n")
            .read(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\n\r\n")
            .build();
        let mut conn = Connection::from_stream(mock);

        let mut body = Body::chunks(vec![
            Bytes::from_static(b"foo"),
            Bytes::from_static(b"bar"),
            Bytes::from_static(b""),
            Bytes::from_static(b"bazzzzzzzzzzzzzzzzzzzzzz"),
        ]);
        let head = conn
            .send_request(
                head_for(Method::POST, "/upload", "example.com"),
                &mut body,
                None,
            )
            .await
            .unwrap();
        assert_eq!(head.status, StatusCode::OK);
        assert_eq!(collect_body(&mut conn).await, b"");
        assert!(conn.is_complete());
    }

    #[tokio::test]
    async fn test_sized_upload() {
        let mock = tokio_test::io::Builder::new()
            .write(b"PUT /file HTTP/1.1\r\nhost: example.com\r\ncontent-length: 9\r\n\r\nsome data")
            .read(b"HTTP/1.1 204 No Content\r\n\r\n")
            .build();
        let mut conn = Connection::from_stream(mock);

        let mut body = Body::from(&b"some data"[..]);
        let head = conn
            .send_request(head_for(Method::PUT, "/file", "example.com"), &mut body, None)
            .await
            .unwrap();
        assert_eq!(head.status, StatusCode::NO_CONTENT);
        assert_eq!(collect_body(&mut conn).await, b"");
    }

    #[tokio::test]
    async fn test_informational_response_is_skipped() {
        let mock = tokio_test::io::Builder::new()
            .write(b"GET / HTTP/1.1\r\nhost: example.com\r\n\r\n")
            .read(b"HTTP/1.1 103 Early Hints\r\n\r\nHTTP/1.1 200 OK\r\ncontent-length: 2\r\n\r\nok")
            .build();
        let mut conn = Connection::from_stream(mock);

        let head = conn
            .send_request(head_for(Method::GET, "/", "example.com"), &mut Body::empty(), None)
            .await
            .unwrap();
        assert_eq!(head.status, StatusCode::OK);
        assert_eq!(collect_body(&mut conn).await, b"ok");
    }

    #[tokio::test]
    async fn test_peer_close_before_response() {
        let mock = tokio_test::io::Builder::new()
            .write(b"GET / HTTP/1.1\r\nhost: example.com\r\n\r\n")
            .read(b"")
            .build();
        let mut conn = Connection::from_stream(mock);

        let err = conn
            .send_request(head_for(Method::GET, "/", "example.com"), &mut Body::empty(), None)
            .await
            .unwrap_err();
        assert!(err.is_incomplete_message());
    }

    #[tokio::test]
    async fn test_tunnel_refusal() {
        let mut mock = tokio_test::io::Builder::new()
            .write(b"CONNECT origin.example:443 HTTP/1.1\r\nhost: origin.example:443\r\n\r\n")
            .read(b"HTTP/1.1 403 Forbidden\r\ncontent-length: 0\r\n\r\n")
            .build();

        let conn = Connection::new(
            "proxy.example".to_string(),
            3128,
            Some(Tunnel {
                host: "origin.example".to_string(),
                port: 443,
                headers: HeaderMap::new(),
            }),
        );

        let err = conn.tunnel_exchange(&mut mock).await.unwrap_err();
        assert!(err.is_failed_tunnel());
        let attached: &ResponseHead = err.tunnel_response().unwrap();
        assert_eq!(attached.status, StatusCode::FORBIDDEN);
    }

    #[test]
    fn test_authority_form_brackets_ipv6() {
        assert_eq!(authority_form("example.com", 443), "example.com:443");
        assert_eq!(authority_form("::1", 8443), "[::1]:8443");
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let mock = tokio_test::io::Builder::new().build();
        let mut conn = Connection::from_stream(mock);
        assert!(conn.is_connected());
        conn.close();
        assert!(!conn.is_connected());
        assert!(conn.is_complete());
        conn.close();
        assert!(!conn.is_connected());
    }
}

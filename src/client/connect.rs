//! Transport establishment: DNS, TCP, and the plain/TLS stream type.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tokio_rustls::client::TlsStream;

use crate::error::{Error, Result};

/// TCP-level knobs applied to every new connection.
#[derive(Clone, Debug)]
pub(crate) struct ConnectConfig {
    /// Disable Nagle's algorithm by default.
    pub(crate) nodelay: bool,
    pub(crate) source_address: Option<IpAddr>,
    pub(crate) keepalive: Option<Duration>,
    pub(crate) send_buffer_size: Option<usize>,
    pub(crate) recv_buffer_size: Option<usize>,
}

impl Default for ConnectConfig {
    fn default() -> ConnectConfig {
        ConnectConfig {
            nodelay: true,
            source_address: None,
            keepalive: None,
            send_buffer_size: None,
            recv_buffer_size: None,
        }
    }
}

/// Opens a TCP connection to `(host, port)`, trying each resolved address
/// in order. Failures map to `NewConnectionError`; the caller owns the
/// connect timeout.
pub(crate) async fn connect_tcp(
    host: &str,
    port: u16,
    config: &ConnectConfig,
) -> Result<TcpStream> {
    let addrs = lookup_host((host, port)).await.map_err(Error::new_connect)?;

    let mut last_err = None;
    for addr in addrs {
        trace!("connecting to {}", addr);
        match connect_addr(addr, config).await {
            Ok(stream) => return Ok(stream),
            Err(err) => {
                debug!("connect to {} failed: {}", addr, err);
                last_err = Some(err);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| {
        Error::new_connect(io::Error::new(
            io::ErrorKind::NotFound,
            "hostname resolved to no addresses",
        ))
    }))
}

async fn connect_addr(addr: SocketAddr, config: &ConnectConfig) -> Result<TcpStream> {
    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4(),
        SocketAddr::V6(_) => TcpSocket::new_v6(),
    }
    .map_err(Error::new_connect)?;

    if let Some(source) = config.source_address {
        socket
            .bind(SocketAddr::new(source, 0))
            .map_err(Error::new_connect)?;
    }
    if let Some(size) = config.send_buffer_size {
        socket
            .set_send_buffer_size(size as u32)
            .map_err(Error::new_connect)?;
    }
    if let Some(size) = config.recv_buffer_size {
        socket
            .set_recv_buffer_size(size as u32)
            .map_err(Error::new_connect)?;
    }

    let stream = socket.connect(addr).await.map_err(Error::new_connect)?;
    stream.set_nodelay(config.nodelay).map_err(Error::new_connect)?;
    if let Some(dur) = config.keepalive {
        let keepalive = TcpKeepalive::new().with_time(dur);
        SockRef::from(&stream)
            .set_tcp_keepalive(&keepalive)
            .map_err(Error::new_connect)?;
    }
    Ok(stream)
}

/// The byte stream a connection runs over: plain TCP or TLS.
#[derive(Debug)]
pub(crate) enum Stream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl Stream {
    fn tcp(&self) -> &TcpStream {
        match self {
            Stream::Plain(tcp) => tcp,
            Stream::Tls(tls) => tls.get_ref().0,
        }
    }

    /// Probes an idle connection for remote half-close.
    ///
    /// An idle connection owes us nothing, so if the kernel reports
    /// readability it is EOF or garbage either way; consuming a byte while
    /// deciding to discard is harmless.
    pub(crate) fn is_half_closed(&self) -> bool {
        let mut buf = [0u8; 1];
        match self.tcp().try_read(&mut buf) {
            Ok(0) => {
                trace!("idle connection saw EOF");
                true
            }
            Ok(_) => {
                trace!("idle connection had unexpected bytes");
                true
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => false,
            Err(_) => true,
        }
    }
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Plain(tcp) => Pin::new(tcp).poll_read(cx, buf),
            Stream::Tls(tls) => Pin::new(tls.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Stream::Plain(tcp) => Pin::new(tcp).poll_write(cx, buf),
            Stream::Tls(tls) => Pin::new(tls.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Plain(tcp) => Pin::new(tcp).poll_flush(cx),
            Stream::Tls(tls) => Pin::new(tls.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Plain(tcp) => Pin::new(tcp).poll_shutdown(cx),
            Stream::Tls(tls) => Pin::new(tls.as_mut()).poll_shutdown(cx),
        }
    }
}

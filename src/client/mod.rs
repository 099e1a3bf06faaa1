//! The client: a per-origin pool router plus the request orchestrator
//! that glues pools, connections, and the retry controller together.

pub(crate) mod conn;
pub(crate) mod connect;
pub(crate) mod pool;

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use http::header::{HeaderValue, CONTENT_LENGTH, HOST, TRANSFER_ENCODING};
use http::{HeaderMap, Method};
use tokio::time::Instant;
use url::Url;

use self::conn::{Connection, Tunnel};
use self::connect::{ConnectConfig, Stream};
use self::pool::{Origin, Pool, Pooled};
use crate::body::Body;
use crate::error::{Error, Result};
use crate::proto::{RequestHead, ResponseHead};
use crate::request::{Request, RequestBuilder};
use crate::response::Response;
use crate::retry::{Decision, ErrorClass, Retry};
use crate::tls::{TlsConfig, TlsContext};
use crate::redirect;

/// How much unread response body we are willing to discard to keep a
/// connection alive across a retry or redirect.
const DRAIN_LIMIT: usize = 16 * 1024;

/// An asynchronous HTTP/1.1 client.
///
/// Cheap to clone; clones share the same pools and configuration.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientRef>,
}

struct ClientRef {
    config: Config,
    tls: TlsContext,
    pools: Mutex<PoolMap>,
}

#[derive(Debug)]
struct Config {
    connect_timeout: Option<Duration>,
    read_timeout: Option<Duration>,
    total_timeout: Option<Duration>,
    pool_checkout_timeout: Option<Duration>,
    pool_max_connections: usize,
    pool_block: bool,
    max_pools: usize,
    retry: Retry,
    proxy: Option<Proxy>,
    tcp: ConnectConfig,
}

/// The origin → pool router, with an LRU cap on tracked pools.
///
/// An evicted pool is closed, but outstanding checkouts keep it alive
/// through their `Arc` until they resolve.
struct PoolMap {
    pools: HashMap<Origin, Pool<Connection<Stream>>>,
    recent: VecDeque<Origin>,
    cap: usize,
}

impl PoolMap {
    fn pool_for(&mut self, origin: &Origin, max: usize, block: bool) -> Pool<Connection<Stream>> {
        if let Some(pool) = self.pools.get(origin) {
            let pool = pool.clone();
            self.touch(origin);
            return pool;
        }

        let pool = Pool::new(max, block);
        self.pools.insert(origin.clone(), pool.clone());
        self.recent.push_back(origin.clone());
        while self.pools.len() > self.cap {
            if let Some(victim) = self.recent.pop_front() {
                if let Some(evicted) = self.pools.remove(&victim) {
                    debug!("evicting pool for {}", victim);
                    evicted.close();
                }
            }
        }
        pool
    }

    fn touch(&mut self, origin: &Origin) {
        if let Some(pos) = self.recent.iter().position(|o| o == origin) {
            self.recent.remove(pos);
        }
        self.recent.push_back(origin.clone());
    }
}

/// A proxy that requests are tunneled through with CONNECT.
#[derive(Clone, Debug)]
pub struct Proxy {
    host: String,
    port: u16,
    headers: HeaderMap,
}

impl Proxy {
    /// A proxy at the given URL. Only the host and port are used; every
    /// request is tunneled with CONNECT.
    pub fn new(url: &str) -> Result<Proxy> {
        let url = Url::parse(url).map_err(|_| Error::new_invalid_url("invalid proxy URL"))?;
        let host = url
            .host_str()
            .ok_or_else(|| Error::new_invalid_url("proxy URL has no host"))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = url.port_or_known_default().unwrap_or(8080);
        Ok(Proxy {
            host,
            port,
            headers: HeaderMap::new(),
        })
    }

    /// An extra header sent on the CONNECT request, e.g.
    /// `Proxy-Authorization`.
    pub fn header(mut self, name: http::header::HeaderName, value: HeaderValue) -> Proxy {
        self.headers.insert(name, value);
        self
    }
}

/// Configures and builds a [`Client`].
#[derive(Debug)]
pub struct ClientBuilder {
    connect_timeout: Option<Duration>,
    read_timeout: Option<Duration>,
    total_timeout: Option<Duration>,
    pool_checkout_timeout: Option<Duration>,
    pool_max_connections: usize,
    pool_block: bool,
    max_pools: usize,
    retry: Retry,
    proxy: Option<Proxy>,
    tls: TlsConfig,
    tcp: ConnectConfig,
}

impl Default for ClientBuilder {
    fn default() -> ClientBuilder {
        ClientBuilder {
            connect_timeout: None,
            read_timeout: None,
            total_timeout: None,
            pool_checkout_timeout: None,
            pool_max_connections: 10,
            pool_block: false,
            max_pools: 10,
            retry: Retry::default(),
            proxy: None,
            tls: TlsConfig::default(),
            tcp: ConnectConfig::default(),
        }
    }
}

impl ClientBuilder {
    pub fn new() -> ClientBuilder {
        ClientBuilder::default()
    }

    /// Bounds each connection-establishment attempt.
    pub fn connect_timeout(mut self, dur: Duration) -> ClientBuilder {
        self.connect_timeout = Some(dur);
        self
    }

    /// Bounds every individual read from the transport.
    pub fn read_timeout(mut self, dur: Duration) -> ClientBuilder {
        self.read_timeout = Some(dur);
        self
    }

    /// Bounds a whole request, including retries and backoff sleeps.
    pub fn total_timeout(mut self, dur: Duration) -> ClientBuilder {
        self.total_timeout = Some(dur);
        self
    }

    /// Caps connections (idle plus in-flight) per origin.
    pub fn pool_max_connections(mut self, max: usize) -> ClientBuilder {
        self.pool_max_connections = max.max(1);
        self
    }

    /// Whether a checkout at capacity blocks (`true`) or opens an
    /// ephemeral connection with a warning (`false`, the default).
    pub fn pool_block(mut self, block: bool) -> ClientBuilder {
        self.pool_block = block;
        self
    }

    /// Bounds a blocking pool checkout; expiry is an `EmptyPoolError`.
    pub fn pool_checkout_timeout(mut self, dur: Duration) -> ClientBuilder {
        self.pool_checkout_timeout = Some(dur);
        self
    }

    /// Caps how many origins keep pools; the least recently used pool is
    /// evicted past the cap.
    pub fn max_pools(mut self, max: usize) -> ClientBuilder {
        self.max_pools = max.max(1);
        self
    }

    /// The default retry policy for requests that don't carry their own.
    pub fn retry(mut self, retry: Retry) -> ClientBuilder {
        self.retry = retry;
        self
    }

    /// Tunnels every request through this proxy.
    pub fn proxy(mut self, proxy: Proxy) -> ClientBuilder {
        self.proxy = Some(proxy);
        self
    }

    /// TLS settings for https origins.
    pub fn tls(mut self, tls: TlsConfig) -> ClientBuilder {
        self.tls = tls;
        self
    }

    /// Disables `TCP_NODELAY` (it is set by default).
    pub fn no_nodelay(mut self) -> ClientBuilder {
        self.tcp.nodelay = false;
        self
    }

    /// Binds outgoing sockets to a local address.
    pub fn source_address(mut self, addr: IpAddr) -> ClientBuilder {
        self.tcp.source_address = Some(addr);
        self
    }

    /// Enables TCP keepalive probes at the given interval.
    pub fn tcp_keepalive(mut self, dur: Duration) -> ClientBuilder {
        self.tcp.keepalive = Some(dur);
        self
    }

    pub fn tcp_send_buffer_size(mut self, size: usize) -> ClientBuilder {
        self.tcp.send_buffer_size = Some(size);
        self
    }

    pub fn tcp_recv_buffer_size(mut self, size: usize) -> ClientBuilder {
        self.tcp.recv_buffer_size = Some(size);
        self
    }

    /// Compiles the TLS context and builds the client.
    pub fn build(self) -> Result<Client> {
        let tls = self.tls.build()?;
        Ok(Client {
            inner: Arc::new(ClientRef {
                config: Config {
                    connect_timeout: self.connect_timeout,
                    read_timeout: self.read_timeout,
                    total_timeout: self.total_timeout,
                    pool_checkout_timeout: self.pool_checkout_timeout,
                    pool_max_connections: self.pool_max_connections,
                    pool_block: self.pool_block,
                    max_pools: self.max_pools,
                    retry: self.retry,
                    proxy: self.proxy,
                    tcp: self.tcp,
                },
                tls,
                pools: Mutex::new(PoolMap {
                    pools: HashMap::new(),
                    recent: VecDeque::new(),
                    cap: self.max_pools,
                }),
            }),
        })
    }
}

impl Client {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Starts building a request with the given method.
    pub fn request(&self, method: Method, url: &str) -> RequestBuilder {
        RequestBuilder::new(self.clone(), method, url)
    }

    /// Convenience for [`Client::request`] with `GET`.
    pub fn get(&self, url: &str) -> RequestBuilder {
        self.request(Method::GET, url)
    }

    pub fn post(&self, url: &str) -> RequestBuilder {
        self.request(Method::POST, url)
    }

    pub fn put(&self, url: &str) -> RequestBuilder {
        self.request(Method::PUT, url)
    }

    pub fn head(&self, url: &str) -> RequestBuilder {
        self.request(Method::HEAD, url)
    }

    pub fn delete(&self, url: &str) -> RequestBuilder {
        self.request(Method::DELETE, url)
    }

    /// Performs a request: pooled connection, validated exchange,
    /// transparent retries and redirects per the retry policy.
    pub async fn execute(&self, request: Request) -> Result<Response> {
        let (mut method, mut url, mut headers, mut body, retry, timeout) = request.into_parts();
        body.validate()?;

        let deadline = timeout
            .or(self.inner.config.total_timeout)
            .map(|dur| Instant::now() + dur);
        let mut retry = retry.unwrap_or_else(|| self.inner.config.retry.clone());

        loop {
            let origin = Origin::from_url(&url)?;
            let pool = self.pool_for(&origin);

            match self
                .attempt(&pool, &origin, &method, &url, &headers, &mut body, deadline)
                .await
            {
                Ok((head, conn)) => match retry.on_response(&method, &url, &head) {
                    Decision::ReturnResponse => {
                        return Ok(Response::new(
                            head,
                            url,
                            method,
                            conn,
                            self.inner.config.read_timeout,
                        )
                        .await);
                    }
                    Decision::Raise(err) => return Err(err),
                    Decision::Retry(next) => {
                        self.recycle(conn).await;
                        if next.drop_body {
                            body = Body::empty();
                            headers.remove(CONTENT_LENGTH);
                            headers.remove(TRANSFER_ENCODING);
                        } else {
                            body.rewind()?;
                        }
                        if next.strip_sensitive {
                            redirect::remove_sensitive_headers(
                                &mut headers,
                                next.policy.sensitive_headers(),
                            );
                        }
                        if let Some(target) = next.target {
                            // the Host header tracks the target, and a new
                            // origin means a new pool on the next pass
                            headers.remove(HOST);
                            url = target;
                        }
                        method = next.method;
                        retry = next.policy;
                        sleep_until_deadline(next.delay, deadline).await;
                    }
                },
                Err((Some(class), err)) => {
                    if deadline_expired(deadline) {
                        // past the total deadline there is nothing left to
                        // retry with; the phase error stands
                        return Err(err);
                    }
                    match retry.on_error(&method, &url, class, err) {
                        Decision::Retry(next) => {
                            body.rewind()?;
                            retry = next.policy;
                            sleep_until_deadline(next.delay, deadline).await;
                        }
                        Decision::Raise(err) => return Err(err),
                        Decision::ReturnResponse => {
                            unreachable!("error outcomes never return a response")
                        }
                    }
                }
                // unrecognized kinds surface untouched
                Err((None, err)) => return Err(err),
            }
        }
    }

    /// One connect-and-send attempt against one pooled connection.
    async fn attempt(
        &self,
        pool: &Pool<Connection<Stream>>,
        origin: &Origin,
        method: &Method,
        url: &Url,
        headers: &HeaderMap,
        body: &mut Body,
        deadline: Option<Instant>,
    ) -> std::result::Result<(ResponseHead, Pooled<Connection<Stream>>), (Option<ErrorClass>, Error)>
    {
        let config = &self.inner.config;

        let checkout_timeout = min_timeout(config.pool_checkout_timeout, deadline);
        let (host, port, tunnel) = match config.proxy {
            Some(ref proxy) => (
                proxy.host.clone(),
                proxy.port,
                Some(Tunnel {
                    host: origin.host().to_string(),
                    port: origin.port(),
                    headers: proxy.headers.clone(),
                }),
            ),
            None => (origin.host().to_string(), origin.port(), None),
        };
        let mut conn = pool
            .checkout(checkout_timeout, move || Connection::new(host, port, tunnel))
            .await
            .map_err(|err| (None, err))?;

        if !conn.is_connected() {
            if deadline_expired(deadline) {
                return Err((Some(ErrorClass::Connect), Error::new_connect_timeout()));
            }
            let tls = if origin.is_https() {
                Some(&self.inner.tls)
            } else {
                None
            };
            let connect_timeout = min_timeout(config.connect_timeout, deadline);
            conn.connect(tls, connect_timeout, &config.tcp)
                .await
                .map_err(|err| (classify(&err), err))?;
        }

        if deadline_expired(deadline) {
            return Err((Some(ErrorClass::Read), Error::new_read_timeout()));
        }
        let head = match build_request_head(method, url, headers, origin) {
            Ok(head) => head,
            Err(err) => return Err((None, err)),
        };
        let read_timeout = min_timeout(config.read_timeout, deadline);
        match conn.send_request(head, body, read_timeout).await {
            Ok(head) => Ok((head, conn)),
            // the dropped checkout closes the connection
            Err(err) => Err((classify(&err), err)),
        }
    }

    /// Consumes the rest of a retried response so its connection can go
    /// back to the pool; a failed or oversized drain closes it instead.
    async fn recycle(&self, mut conn: Pooled<Connection<Stream>>) {
        let read_timeout = self.inner.config.read_timeout;
        if conn.drain_body(read_timeout, DRAIN_LIMIT).await.is_err() {
            conn.discard();
        }
    }

    fn pool_for(&self, origin: &Origin) -> Pool<Connection<Stream>> {
        let config = &self.inner.config;
        self.inner.pools.lock().unwrap().pool_for(
            origin,
            config.pool_max_connections,
            config.pool_block,
        )
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("config", &self.inner.config)
            .finish()
    }
}

/// Maps an error to the budget its retry would consume; `None` means not
/// retriable at all.
fn classify(err: &Error) -> Option<ErrorClass> {
    if err.is_tls() || err.is_failed_tunnel() {
        // certificate and tunnel failures are deterministic
        None
    } else if err.is_connect() {
        Some(ErrorClass::Connect)
    } else if err.is_read_timeout() {
        Some(ErrorClass::Read)
    } else if err.is_bad_version() {
        None
    } else if err.is_protocol() {
        Some(ErrorClass::Other)
    } else {
        None
    }
}

fn build_request_head(
    method: &Method,
    url: &Url,
    headers: &HeaderMap,
    origin: &Origin,
) -> Result<RequestHead> {
    let mut target = url.path().to_string();
    if let Some(query) = url.query() {
        target.push('?');
        target.push_str(query);
    }

    let mut head = RequestHead::new(method.clone(), target);
    head.headers = headers.clone();
    if !head.headers.contains_key(HOST) {
        let value = HeaderValue::from_str(&origin.host_header())
            .map_err(|_| Error::new_invalid_url("URL host is not a valid header value"))?;
        head.headers.insert(HOST, value);
    }
    Ok(head)
}

fn deadline_expired(deadline: Option<Instant>) -> bool {
    matches!(deadline, Some(at) if Instant::now() >= at)
}

/// The tighter of a configured timeout and the time left until the
/// overall deadline.
fn min_timeout(configured: Option<Duration>, deadline: Option<Instant>) -> Option<Duration> {
    let remaining = deadline.map(|at| at.saturating_duration_since(Instant::now()));
    match (configured, remaining) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (Some(a), None) => Some(a),
        (None, Some(b)) => Some(b),
        (None, None) => None,
    }
}

/// Backoff sleeps never run past the overall deadline; the next phase
/// surfaces the timeout.
async fn sleep_until_deadline(delay: Duration, deadline: Option<Instant>) {
    if delay.is_zero() {
        return;
    }
    let capped = match deadline {
        Some(at) => delay.min(at.saturating_duration_since(Instant::now())),
        None => delay,
    };
    if !capped.is_zero() {
        debug!("sleeping {:?} before retrying", capped);
        tokio::time::sleep(capped).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_map_lru_eviction() {
        let mut map = PoolMap {
            pools: HashMap::new(),
            recent: VecDeque::new(),
            cap: 2,
        };
        let a = Origin::from_url(&Url::parse("http://a.example/").unwrap()).unwrap();
        let b = Origin::from_url(&Url::parse("http://b.example/").unwrap()).unwrap();
        let c = Origin::from_url(&Url::parse("http://c.example/").unwrap()).unwrap();

        map.pool_for(&a, 1, true);
        map.pool_for(&b, 1, true);
        // touching `a` makes `b` the eviction candidate
        map.pool_for(&a, 1, true);
        map.pool_for(&c, 1, true);

        assert_eq!(map.pools.len(), 2);
        assert!(map.pools.contains_key(&a));
        assert!(map.pools.contains_key(&c));
        assert!(!map.pools.contains_key(&b));
    }

    #[test]
    fn test_build_request_head_target_and_host() {
        let url = Url::parse("http://example.com:8080/a/b?x=1&y=2").unwrap();
        let origin = Origin::from_url(&url).unwrap();
        let head = build_request_head(&Method::GET, &url, &HeaderMap::new(), &origin).unwrap();
        assert_eq!(head.target, "/a/b?x=1&y=2");
        assert_eq!(head.headers[HOST], "example.com:8080");

        // a caller-provided Host wins
        let mut headers = HeaderMap::new();
        headers.insert(HOST, HeaderValue::from_static("override.example"));
        let head = build_request_head(&Method::GET, &url, &headers, &origin).unwrap();
        assert_eq!(head.headers[HOST], "override.example");
    }

    #[test]
    fn test_classify_errors() {
        assert_eq!(
            classify(&Error::new_connect_timeout()),
            Some(ErrorClass::Connect)
        );
        assert_eq!(
            classify(&Error::new_read_timeout()),
            Some(ErrorClass::Read)
        );
        assert_eq!(classify(&Error::new_incomplete()), Some(ErrorClass::Other));
        assert_eq!(classify(&Error::new_bad_version()), None);
        assert_eq!(classify(&Error::new_tls_msg("nope")), None);
        assert_eq!(classify(&Error::new_pool_empty()), None);
    }
}

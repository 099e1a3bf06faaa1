//! A blocking façade over the async client.
//!
//! Each blocking [`Client`] owns a small private runtime and drives the
//! async core to completion on it. Requests from different threads run
//! concurrently, each holding its own pooled connection; the sans-I/O
//! protocol engine underneath is identical in both modes.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode, Version};
use url::Url;

use crate::error::Result;
use crate::request::Request;

/// A blocking HTTP/1.1 client.
#[derive(Clone)]
pub struct Client {
    inner: crate::Client,
    rt: Arc<tokio::runtime::Runtime>,
}

/// Configures and builds a blocking [`Client`].
#[derive(Debug)]
pub struct ClientBuilder {
    inner: crate::ClientBuilder,
}

impl ClientBuilder {
    pub fn new() -> ClientBuilder {
        ClientBuilder {
            inner: crate::Client::builder(),
        }
    }

    /// Applies a closure to the underlying async builder.
    pub fn with<F>(mut self, configure: F) -> ClientBuilder
    where
        F: FnOnce(crate::ClientBuilder) -> crate::ClientBuilder,
    {
        self.inner = configure(self.inner);
        self
    }

    pub fn build(self) -> Result<Client> {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("filament-blocking")
            .enable_all()
            .build()
            .expect("failed to build blocking runtime");
        Ok(Client {
            inner: self.inner.build()?,
            rt: Arc::new(rt),
        })
    }
}

impl Default for ClientBuilder {
    fn default() -> ClientBuilder {
        ClientBuilder::new()
    }
}

impl Client {
    pub fn new() -> Result<Client> {
        ClientBuilder::new().build()
    }

    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Executes a request, blocking until the response head arrives.
    pub fn execute(&self, request: Request) -> Result<Response> {
        let inner = self.rt.block_on(self.inner.execute(request))?;
        Ok(Response {
            inner,
            rt: self.rt.clone(),
        })
    }

    /// Convenience for a bare GET.
    pub fn get(&self, url: &str) -> Result<Response> {
        let request = self.inner.get(url).build()?;
        self.execute(request)
    }

    pub fn request(&self, method: Method, url: &str) -> Result<Request> {
        self.inner.request(method, url).build()
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("blocking::Client").finish()
    }
}

/// A blocking response wrapper.
pub struct Response {
    inner: crate::Response,
    rt: Arc<tokio::runtime::Runtime>,
}

impl Response {
    pub fn status(&self) -> StatusCode {
        self.inner.status()
    }

    pub fn version(&self) -> Version {
        self.inner.version()
    }

    pub fn headers(&self) -> &HeaderMap {
        self.inner.headers()
    }

    pub fn url(&self) -> &Url {
        self.inner.url()
    }

    /// Pulls the next body chunk, blocking for up to the configured read
    /// timeout per read.
    pub fn chunk(&mut self) -> Result<Option<Bytes>> {
        self.rt.block_on(self.inner.chunk())
    }

    /// Reads the whole body.
    pub fn bytes(self) -> Result<Bytes> {
        let rt = self.rt;
        rt.block_on(self.inner.bytes())
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.inner, f)
    }
}

// Dropping a blocking Response drops the async body handle; the pooled
// connection is closed or recycled without needing the runtime.

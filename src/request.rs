//! Requests and the builder for them.

use std::fmt;
use std::time::Duration;

use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Method};
use url::Url;

use crate::body::Body;
use crate::client::Client;
use crate::error::{Error, Result};
use crate::response::Response;
use crate::retry::Retry;

/// A request ready to be executed.
///
/// Requests are plain data until handed to [`Client::execute`]; from then
/// on they are immutable.
#[derive(Debug)]
pub struct Request {
    method: Method,
    url: Url,
    headers: HeaderMap,
    body: Body,
    retry: Option<Retry>,
    timeout: Option<Duration>,
}

impl Request {
    pub fn new(method: Method, url: Url) -> Request {
        Request {
            method,
            url,
            headers: HeaderMap::new(),
            body: Body::empty(),
            retry: None,
            timeout: None,
        }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn body_mut(&mut self) -> &mut Body {
        &mut self.body
    }

    /// Overrides the client's retry policy for this request.
    pub fn set_retry(&mut self, retry: Retry) {
        self.retry = Some(retry);
    }

    /// Overrides the client's total timeout for this request.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = Some(timeout);
    }

    pub fn set_body(&mut self, body: impl Into<Body>) {
        self.body = body.into();
    }

    #[allow(clippy::type_complexity)]
    pub(crate) fn into_parts(
        self,
    ) -> (
        Method,
        Url,
        HeaderMap,
        Body,
        Option<Retry>,
        Option<Duration>,
    ) {
        (
            self.method,
            self.url,
            self.headers,
            self.body,
            self.retry,
            self.timeout,
        )
    }
}

/// Builds a [`Request`] against a [`Client`].
///
/// URL and header mistakes are deferred and surface from
/// [`RequestBuilder::send`], so call chains stay clean.
#[must_use = "a RequestBuilder does nothing until sent"]
pub struct RequestBuilder {
    client: Client,
    request: Result<Request>,
}

impl RequestBuilder {
    pub(crate) fn new(client: Client, method: Method, url: &str) -> RequestBuilder {
        let request = Url::parse(url)
            .map_err(|_| Error::new_invalid_url("failed to parse request URL"))
            .map(|url| Request::new(method, url));
        RequestBuilder { client, request }
    }

    /// Adds a header, replacing any existing value of the same name.
    pub fn header<K, V>(mut self, name: K, value: V) -> RequestBuilder
    where
        HeaderName: TryFrom<K>,
        HeaderValue: TryFrom<V>,
    {
        if let Ok(ref mut request) = self.request {
            match (HeaderName::try_from(name), HeaderValue::try_from(value)) {
                (Ok(name), Ok(value)) => {
                    request.headers_mut().insert(name, value);
                }
                _ => {
                    self.request = Err(Error::new_invalid_url("invalid header name or value"));
                }
            }
        }
        self
    }

    /// Merges a whole header map into the request.
    pub fn headers(mut self, headers: HeaderMap) -> RequestBuilder {
        if let Ok(ref mut request) = self.request {
            for (name, value) in headers.iter() {
                request.headers_mut().append(name.clone(), value.clone());
            }
        }
        self
    }

    pub fn body(mut self, body: impl Into<Body>) -> RequestBuilder {
        if let Ok(ref mut request) = self.request {
            request.set_body(body);
        }
        self
    }

    /// A retry policy for this request only.
    pub fn retry(mut self, retry: Retry) -> RequestBuilder {
        if let Ok(ref mut request) = self.request {
            request.set_retry(retry);
        }
        self
    }

    /// A total timeout for this request only.
    pub fn timeout(mut self, timeout: Duration) -> RequestBuilder {
        if let Ok(ref mut request) = self.request {
            request.set_timeout(timeout);
        }
        self
    }

    /// Builds the request without sending it.
    pub fn build(self) -> Result<Request> {
        self.request
    }

    /// Executes the request.
    pub async fn send(self) -> Result<Response> {
        let request = self.request?;
        self.client.execute(request).await
    }
}

impl fmt::Debug for RequestBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut builder = f.debug_struct("RequestBuilder");
        match self.request {
            Ok(ref request) => builder
                .field("method", request.method())
                .field("url", &request.url().as_str())
                .finish(),
            Err(ref err) => builder.field("error", err).finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> Client {
        Client::builder().build().expect("default client builds")
    }

    #[test]
    fn builder_collects_parts() {
        let request = client()
            .request(Method::POST, "http://example.com/upload?tag=1")
            .header("x-one", "1")
            .body(&b"payload"[..])
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap();

        assert_eq!(request.method(), &Method::POST);
        assert_eq!(request.url().as_str(), "http://example.com/upload?tag=1");
        assert_eq!(request.headers()["x-one"], "1");
    }

    #[test]
    fn bad_url_is_deferred_to_build() {
        let err = client().get("not a url").build().unwrap_err();
        assert!(matches!(err.url(), None));
    }

    #[test]
    fn bad_header_is_deferred_to_build() {
        let err = client()
            .get("http://example.com/")
            .header("bad name", "x")
            .build()
            .unwrap_err();
        let _ = err;
    }
}

//! # filament
//!
//! A pooled, retrying HTTP/1.1 user-agent.
//!
//! filament turns a high-level request (method, URL, headers, body) into a
//! validated HTTP/1.1 exchange over a pooled, optionally TLS-wrapped byte
//! stream, with transparent retries and redirects. The crate is built
//! around three pieces:
//!
//! - [`proto`]: a sans-I/O HTTP/1.1 framing engine. It parses and emits
//!   wire bytes but performs no I/O of its own, so the same state machine
//!   backs every transport.
//! - [`client`]: connections bound to a byte stream, per-origin bounded
//!   pools, and the request orchestrator that glues them to the policy
//!   layer.
//! - [`retry`] and [`redirect`]: an immutable retry policy value and the
//!   redirect rules it consults, deciding after every attempt whether to
//!   re-issue the request, against which target, after what delay.
//!
//! ## Example
//!
//! ```no_run
//! # async fn run() -> Result<(), filament::Error> {
//! let client = filament::Client::builder().build()?;
//! let resp = client.get("http://httpbin.org/ip").send().await?;
//! println!("status: {}", resp.status());
//! let body = resp.bytes().await?;
//! println!("body: {} bytes", body.len());
//! # Ok(())
//! # }
//! ```

#![deny(missing_debug_implementations)]
#![cfg_attr(docsrs, feature(doc_cfg))]

#[macro_use]
extern crate tracing;

pub use http::{header, HeaderMap, Method, StatusCode, Version};
pub use url::Url;

pub use crate::body::Body;
pub use crate::client::{Client, ClientBuilder, Proxy};
pub use crate::error::{Error, Result};
pub use crate::request::{Request, RequestBuilder};
pub use crate::response::Response;
pub use crate::retry::Retry;
pub use crate::tls::TlsConfig;

pub mod blocking;
pub mod body;
pub mod client;
mod error;
pub mod proto;
mod redirect;
mod request;
mod response;
pub mod retry;
pub mod tls;

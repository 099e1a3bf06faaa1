//! Redirect handling.
//!
//! These are the mechanics the retry controller consults when a response
//! carries a redirect status: resolving `Location`, deciding whether the
//! hop crosses origins, rewriting the method, and scrubbing sensitive
//! headers before the follow-up request.

use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::{Method, StatusCode};
use url::Url;

use crate::client::pool::Origin;

/// The statuses the controller follows when a `Location` is present.
pub(crate) fn is_redirect(status: StatusCode) -> bool {
    matches!(status.as_u16(), 301 | 302 | 303 | 307 | 308)
}

/// Resolves a `Location` header against the URL that produced it.
///
/// Returns `None` for values that are not UTF-8, do not parse, or resolve
/// to a scheme we cannot speak; such responses are returned to the caller
/// instead of followed.
pub(crate) fn resolve_location(base: &Url, location: &HeaderValue) -> Option<Url> {
    let raw = std::str::from_utf8(location.as_bytes()).ok()?;
    let target = base.join(raw).ok()?;
    match target.scheme() {
        "http" | "https" => Some(target),
        _ => {
            debug!("ignoring redirect to unsupported scheme: {}", target);
            None
        }
    }
}

/// The method for the follow-up request, and whether the body is dropped.
///
/// A 303 always rewrites to GET (HEAD stays HEAD). Browsers also downgrade
/// 301/302 for anything that isn't a safe method, and servers depend on
/// that, so we do the same. 307/308 keep both method and body.
pub(crate) fn redirect_method(status: StatusCode, method: &Method) -> (Method, bool) {
    match status.as_u16() {
        303 => {
            if *method == Method::HEAD {
                (Method::HEAD, true)
            } else {
                (Method::GET, true)
            }
        }
        301 | 302 => {
            if *method == Method::GET || *method == Method::HEAD {
                (method.clone(), false)
            } else {
                (Method::GET, true)
            }
        }
        _ => (method.clone(), false),
    }
}

/// Whether a hop leaves the origin it started from.
///
/// Origins compare on normalized `(scheme, host, port)`: hosts lowercased
/// with trailing dots stripped, ports defaulted per scheme.
pub(crate) fn is_cross_origin(previous: &Url, next: &Url) -> bool {
    match (Origin::from_url(previous), Origin::from_url(next)) {
        (Ok(a), Ok(b)) => a != b,
        // unparseable origins never share credentials
        _ => true,
    }
}

/// Drops every variant of each listed header before a cross-origin hop.
///
/// Matching is case-insensitive by construction: header names are
/// normalized lowercase, and removal takes all values of the entry.
pub(crate) fn remove_sensitive_headers(headers: &mut HeaderMap, names: &[HeaderName]) {
    for name in names {
        if headers.remove(name).is_some() {
            debug!("stripped {} header on cross-origin redirect", name);
        }
    }
}

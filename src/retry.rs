//! Retry policy.
//!
//! A [`Retry`] is an immutable policy value: deciding what to do about an
//! outcome never mutates it, but produces a fresh policy with a smaller
//! budget and a longer history. That makes it safe to hang one policy on a
//! client and share it across every request.
//!
//! The controller is transport-independent. It looks only at the outcome
//! of an attempt (an error kind, or a response status plus headers) and
//! answers with one of three decisions: hand the response back, raise, or
//! retry against a possibly new target after a computed delay.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use http::header::{HeaderName, AUTHORIZATION, LOCATION, RETRY_AFTER};
use http::{Method, StatusCode};
use url::Url;

use crate::error::Error;
use crate::proto::ResponseHead;
use crate::redirect;

/// Statuses for which a `Retry-After` header is honored.
const RETRY_AFTER_STATUS_CODES: [u16; 3] = [413, 429, 503];

/// Upper bound on computed backoff, in seconds.
const DEFAULT_BACKOFF_MAX: f64 = 120.0;

/// A retry policy.
///
/// The default policy allows three consumptions of the total budget,
/// retries only idempotent methods on read-class failures, strips
/// `Authorization` on cross-origin redirects, and honors `Retry-After`.
#[derive(Clone, Debug)]
pub struct Retry {
    total: u32,
    connect: Option<u32>,
    read: Option<u32>,
    redirect: Option<u32>,
    status: Option<u32>,
    other: Option<u32>,
    status_forcelist: HashSet<u16>,
    allowed_methods: Option<HashSet<Method>>,
    remove_headers_on_redirect: Vec<HeaderName>,
    raise_on_status: bool,
    raise_on_redirect: bool,
    respect_retry_after: bool,
    backoff_factor: f64,
    backoff_max: f64,
    history: Vec<Attempt>,
}

/// One record of a consumed attempt: what was asked, and how it went.
#[derive(Clone, Debug)]
pub struct Attempt {
    /// Request method of the attempt.
    pub method: Method,
    /// Request URL of the attempt.
    pub url: Url,
    /// The error that ended the attempt, when it was an error.
    pub error: Option<Arc<Error>>,
    /// The response status, when a response arrived.
    pub status: Option<StatusCode>,
    /// Where the response redirected to, when it did.
    pub redirect_location: Option<Url>,
}

/// Which budget an attempt's failure consumes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ErrorClass {
    Connect,
    Read,
    Other,
}

/// What to do after an attempt.
#[derive(Debug)]
pub(crate) enum Decision {
    ReturnResponse,
    Raise(Error),
    Retry(NextAttempt),
}

/// The plan for a retried attempt.
#[derive(Debug)]
pub(crate) struct NextAttempt {
    pub(crate) policy: Retry,
    pub(crate) target: Option<Url>,
    pub(crate) method: Method,
    pub(crate) drop_body: bool,
    pub(crate) strip_sensitive: bool,
    pub(crate) delay: Duration,
}

impl Retry {
    /// A policy with the given total budget and the default knobs.
    pub fn new(total: u32) -> Retry {
        Retry {
            total,
            ..Retry::default()
        }
    }

    /// A policy that never retries and surfaces redirects to the caller.
    pub fn none() -> Retry {
        Retry::new(0).raise_on_redirect(false).raise_on_status(false)
    }

    /// Caps retries of connection-establishment failures.
    pub fn connect(mut self, n: u32) -> Retry {
        self.connect = Some(n);
        self
    }

    /// Caps retries of read-phase failures.
    pub fn read(mut self, n: u32) -> Retry {
        self.read = Some(n);
        self
    }

    /// Caps followed redirects.
    pub fn redirect(mut self, n: u32) -> Retry {
        self.redirect = Some(n);
        self
    }

    /// Caps retries triggered by the status forcelist.
    pub fn status(mut self, n: u32) -> Retry {
        self.status = Some(n);
        self
    }

    /// Caps retries of other (protocol-class) failures.
    pub fn other(mut self, n: u32) -> Retry {
        self.other = Some(n);
        self
    }

    /// Response statuses that trigger a retry (when the method allows it).
    pub fn status_forcelist<I>(mut self, statuses: I) -> Retry
    where
        I: IntoIterator<Item = u16>,
    {
        self.status_forcelist = statuses.into_iter().collect();
        self
    }

    /// Methods eligible for read/status retries.
    pub fn allowed_methods<I>(mut self, methods: I) -> Retry
    where
        I: IntoIterator<Item = Method>,
    {
        self.allowed_methods = Some(methods.into_iter().collect());
        self
    }

    /// Allows retries for every method, including non-idempotent ones.
    pub fn allow_any_method(mut self) -> Retry {
        self.allowed_methods = None;
        self
    }

    /// Headers stripped from the follow-up request when a redirect crosses
    /// origins. Matching is case-insensitive.
    pub fn remove_headers_on_redirect<I>(mut self, names: I) -> Retry
    where
        I: IntoIterator<Item = HeaderName>,
    {
        self.remove_headers_on_redirect = names.into_iter().collect();
        self
    }

    /// Whether exhausting the status budget raises instead of returning
    /// the response.
    pub fn raise_on_status(mut self, raise: bool) -> Retry {
        self.raise_on_status = raise;
        self
    }

    /// Whether exhausting the redirect budget raises instead of returning
    /// the redirect response.
    pub fn raise_on_redirect(mut self, raise: bool) -> Retry {
        self.raise_on_redirect = raise;
        self
    }

    /// Whether `Retry-After` response headers control the retry delay.
    pub fn respect_retry_after(mut self, respect: bool) -> Retry {
        self.respect_retry_after = respect;
        self
    }

    /// Exponential backoff factor between attempts; `0.0` disables
    /// backoff sleeping.
    pub fn backoff_factor(mut self, factor: f64) -> Retry {
        self.backoff_factor = factor;
        self
    }

    /// Upper bound on a single computed backoff delay, in seconds.
    pub fn backoff_max(mut self, max: f64) -> Retry {
        self.backoff_max = max;
        self
    }

    /// The attempts consumed so far by this policy lineage.
    pub fn history(&self) -> &[Attempt] {
        &self.history
    }

    /// Remaining total budget.
    pub fn remaining(&self) -> u32 {
        self.total
    }

    pub(crate) fn sensitive_headers(&self) -> &[HeaderName] {
        &self.remove_headers_on_redirect
    }

    fn method_allowed(&self, method: &Method) -> bool {
        match self.allowed_methods {
            Some(ref methods) => methods.contains(method),
            None => true,
        }
    }

    /// Decides what to do about a failed attempt.
    ///
    /// Connect-class failures are always retriable (the request never
    /// reached the server); read- and other-class failures only for
    /// allowed methods. Errors of unrecognized or non-retriable kinds are
    /// raised untouched by the caller and never reach here.
    pub(crate) fn on_error(
        &self,
        method: &Method,
        url: &Url,
        class: ErrorClass,
        error: Error,
    ) -> Decision {
        if class != ErrorClass::Connect && !self.method_allowed(method) {
            return Decision::Raise(error);
        }

        let mut next = self.clone();
        let budget = match class {
            ErrorClass::Connect => &mut next.connect,
            ErrorClass::Read => &mut next.read,
            ErrorClass::Other => &mut next.other,
        };
        let exhausted = match budget {
            Some(0) => true,
            Some(n) => {
                *n -= 1;
                false
            }
            None => false,
        };
        if exhausted || next.total == 0 {
            return Decision::Raise(Error::new_max_retry(url.clone(), Some(error)));
        }
        next.total -= 1;

        next.history.push(Attempt {
            method: method.clone(),
            url: url.clone(),
            error: Some(Arc::new(error)),
            status: None,
            redirect_location: None,
        });
        let delay = next.backoff_duration();
        debug!(
            "retrying after {:?} error (remaining={}, delay={:?})",
            class, next.total, delay
        );
        Decision::Retry(NextAttempt {
            policy: next,
            target: None,
            method: method.clone(),
            drop_body: false,
            strip_sensitive: false,
            delay,
        })
    }

    /// Decides what to do about a response: retry it, follow it, or hand
    /// it back.
    pub(crate) fn on_response(
        &self,
        method: &Method,
        url: &Url,
        head: &ResponseHead,
    ) -> Decision {
        let status = head.status;

        if self.status_forcelist.contains(&status.as_u16()) && self.method_allowed(method) {
            return self.on_status_retry(method, url, head);
        }

        if redirect::is_redirect(status) {
            if let Some(location) = head.headers.get(LOCATION) {
                if let Some(target) = redirect::resolve_location(url, location) {
                    return self.on_redirect(method, url, head, target);
                }
                debug!("unusable Location header; returning redirect response");
            }
        }

        Decision::ReturnResponse
    }

    fn on_status_retry(&self, method: &Method, url: &Url, head: &ResponseHead) -> Decision {
        let status = head.status;
        let mut next = self.clone();

        let exhausted = match next.status {
            Some(0) => true,
            Some(ref mut n) => {
                *n -= 1;
                false
            }
            None => false,
        };
        if exhausted || next.total == 0 {
            return if self.raise_on_status {
                Decision::Raise(
                    Error::new_max_retry(url.clone(), None)
                        .with(format!("too many {} error responses", status.as_u16())),
                )
            } else {
                Decision::ReturnResponse
            };
        }
        next.total -= 1;

        next.history.push(Attempt {
            method: method.clone(),
            url: url.clone(),
            error: None,
            status: Some(status),
            redirect_location: None,
        });
        let delay = next
            .retry_after_delay(head)
            .unwrap_or_else(|| next.backoff_duration());
        debug!(
            "retrying {} response (remaining={}, delay={:?})",
            status, next.total, delay
        );
        Decision::Retry(NextAttempt {
            policy: next,
            target: None,
            method: method.clone(),
            drop_body: false,
            strip_sensitive: false,
            delay,
        })
    }

    fn on_redirect(&self, method: &Method, url: &Url, head: &ResponseHead, target: Url) -> Decision {
        let status = head.status;
        let mut next = self.clone();

        let exhausted = match next.redirect {
            Some(0) => true,
            Some(ref mut n) => {
                *n -= 1;
                false
            }
            None => false,
        };
        if exhausted || next.total == 0 {
            return if self.raise_on_redirect {
                Decision::Raise(
                    Error::new_max_retry(url.clone(), None).with("too many redirects"),
                )
            } else {
                Decision::ReturnResponse
            };
        }
        next.total -= 1;

        let (next_method, drop_body) = redirect::redirect_method(status, method);
        let strip_sensitive = redirect::is_cross_origin(url, &target);

        next.history.push(Attempt {
            method: method.clone(),
            url: url.clone(),
            error: None,
            status: Some(status),
            redirect_location: Some(target.clone()),
        });
        debug!("following {} redirect to {}", status, target);
        Decision::Retry(NextAttempt {
            policy: next,
            target: Some(target),
            method: next_method,
            drop_body,
            strip_sensitive,
            delay: self.retry_after_delay(head).unwrap_or(Duration::ZERO),
        })
    }

    /// The `Retry-After` delay, when the response carries an applicable
    /// one.
    fn retry_after_delay(&self, head: &ResponseHead) -> Option<Duration> {
        if !self.respect_retry_after {
            return None;
        }
        if !RETRY_AFTER_STATUS_CODES.contains(&head.status.as_u16()) {
            return None;
        }
        parse_retry_after(head.headers.get(RETRY_AFTER)?)
    }

    /// `min(backoff_max, backoff_factor × 2^(attempt-1))`, where the
    /// attempt count is the length of the consumed history.
    fn backoff_duration(&self) -> Duration {
        let attempt = self.history.len() as u32;
        if attempt == 0 || self.backoff_factor <= 0.0 {
            return Duration::ZERO;
        }
        let backoff = self.backoff_factor * f64::from(2u32.saturating_pow(attempt - 1));
        Duration::from_secs_f64(backoff.min(self.backoff_max))
    }
}

impl Default for Retry {
    fn default() -> Retry {
        Retry {
            total: 3,
            connect: None,
            read: None,
            redirect: None,
            status: None,
            other: None,
            status_forcelist: HashSet::new(),
            allowed_methods: Some(
                [
                    Method::HEAD,
                    Method::GET,
                    Method::PUT,
                    Method::DELETE,
                    Method::OPTIONS,
                    Method::TRACE,
                ]
                .into_iter()
                .collect(),
            ),
            remove_headers_on_redirect: vec![AUTHORIZATION],
            raise_on_status: true,
            raise_on_redirect: true,
            respect_retry_after: true,
            backoff_factor: 0.0,
            backoff_max: DEFAULT_BACKOFF_MAX,
            history: Vec::new(),
        }
    }
}

/// Parses a `Retry-After` value: either non-negative integer seconds or an
/// HTTP-date, whose delta from now is floored at zero.
fn parse_retry_after(value: &http::header::HeaderValue) -> Option<Duration> {
    let raw = value.to_str().ok()?.trim();
    if let Ok(secs) = raw.parse::<i64>() {
        return Some(Duration::from_secs(secs.max(0) as u64));
    }
    let when = httpdate::parse_http_date(raw).ok()?;
    Some(
        when.duration_since(SystemTime::now())
            .unwrap_or(Duration::ZERO),
    )
}

//! Client connection pooling.
//!
//! A [`Pool`] is a per-origin bounded reservoir. Idle connections are kept
//! LIFO so the most recently warmed socket goes back out first. Capacity
//! (idle plus checked-out) is capped by a semaphore; a checkout either
//! reuses an idle connection, grows under the cap, blocks for the
//! configured timeout, or (with `block = false`) opens an ephemeral
//! connection with a warning.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use url::Url;

use crate::error::{Error, Result};

/// The key identifying one pool: normalized scheme, host, and port.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Origin {
    scheme: Scheme,
    host: String,
    port: u16,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) enum Scheme {
    Http,
    Https,
}

impl Origin {
    /// Normalizes a URL into its origin: host lowercased with trailing
    /// dots (and IPv6 brackets) stripped, port defaulted per scheme.
    pub(crate) fn from_url(url: &Url) -> Result<Origin> {
        let scheme = match url.scheme() {
            "http" => Scheme::Http,
            "https" => Scheme::Https,
            _ => return Err(Error::new_invalid_url("only http and https URLs are supported")),
        };
        let host = url
            .host_str()
            .ok_or_else(|| Error::new_invalid_url("URL has no host"))?;
        let host = host
            .trim_start_matches('[')
            .trim_end_matches(']')
            .trim_end_matches('.')
            .to_ascii_lowercase();
        let port = url
            .port_or_known_default()
            .expect("http and https have known default ports");
        Ok(Origin { scheme, host, port })
    }

    pub(crate) fn is_https(&self) -> bool {
        self.scheme == Scheme::Https
    }

    pub(crate) fn host(&self) -> &str {
        &self.host
    }

    pub(crate) fn port(&self) -> u16 {
        self.port
    }

    fn default_port(&self) -> u16 {
        match self.scheme {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }

    /// The value for a `Host` header addressed to this origin.
    pub(crate) fn host_header(&self) -> String {
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        if self.port == self.default_port() {
            host
        } else {
            format!("{}:{}", host, self.port)
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = match self.scheme {
            Scheme::Http => "http",
            Scheme::Https => "https",
        };
        write!(f, "{}://{}:{}", scheme, self.host, self.port)
    }
}

/// A value the pool can hold: it knows whether it is still usable and how
/// to shut itself down.
pub(crate) trait Poolable: Send + 'static {
    fn is_open(&mut self) -> bool;
    fn close(&mut self);
}

/// A bounded per-origin reservoir of idle values.
pub(crate) struct Pool<T: Poolable> {
    inner: Arc<PoolInner<T>>,
}

impl<T: Poolable> Clone for Pool<T> {
    fn clone(&self) -> Pool<T> {
        Pool {
            inner: self.inner.clone(),
        }
    }
}

struct PoolInner<T> {
    idle: Mutex<IdleList<T>>,
    semaphore: Arc<Semaphore>,
    max: usize,
    block: bool,
}

struct IdleList<T> {
    entries: Vec<T>,
    closed: bool,
}

impl<T: Poolable> Pool<T> {
    pub(crate) fn new(max: usize, block: bool) -> Pool<T> {
        Pool {
            inner: Arc::new(PoolInner {
                idle: Mutex::new(IdleList {
                    entries: Vec::new(),
                    closed: false,
                }),
                semaphore: Arc::new(Semaphore::new(max)),
                max,
                block,
            }),
        }
    }

    /// Checks a value out of the pool.
    ///
    /// Prefers the most recently released idle value (discarding any that
    /// have gone dead in the pool), then grows under the capacity cap via
    /// `create`, then blocks up to `timeout` (`EmptyPoolError` on expiry)
    /// or, for a non-blocking pool, returns an ephemeral value that will
    /// never be pooled.
    pub(crate) async fn checkout<F>(&self, timeout: Option<Duration>, create: F) -> Result<Pooled<T>>
    where
        F: FnOnce() -> T,
    {
        if self.inner.idle.lock().unwrap().closed {
            return Err(Error::new_pool_closed());
        }

        let permit = match self.inner.semaphore.clone().try_acquire_owned() {
            Ok(permit) => Some(permit),
            Err(TryAcquireError::Closed) => return Err(Error::new_pool_closed()),
            Err(TryAcquireError::NoPermits) => {
                if self.inner.block {
                    trace!("pool at capacity; waiting for a connection");
                    let acquire = self.inner.semaphore.clone().acquire_owned();
                    let acquired = match timeout {
                        Some(dur) => tokio::time::timeout(dur, acquire)
                            .await
                            .map_err(|_elapsed| Error::new_pool_empty())?,
                        None => acquire.await,
                    };
                    Some(acquired.map_err(|_closed| Error::new_pool_closed())?)
                } else {
                    warn_pool_limit(self.inner.max);
                    None
                }
            }
        };

        let mut idle = self.inner.idle.lock().unwrap();
        if idle.closed {
            return Err(Error::new_pool_closed());
        }
        while let Some(mut value) = idle.entries.pop() {
            if value.is_open() {
                trace!("reusing idle connection");
                return Ok(Pooled {
                    value: Some(value),
                    permit,
                    pool: self.inner.clone(),
                });
            }
            trace!("discarding dead idle connection");
            value.close();
        }

        Ok(Pooled {
            value: Some(create()),
            permit,
            pool: self.inner.clone(),
        })
    }

    /// Drains and closes every idle value; later checkouts fail with
    /// `PoolClosedError`.
    pub(crate) fn close(&self) {
        let mut idle = self.inner.idle.lock().unwrap();
        idle.closed = true;
        for mut value in idle.entries.drain(..) {
            value.close();
        }
        self.inner.semaphore.close();
    }

    #[cfg(test)]
    fn idle_count(&self) -> usize {
        self.inner.idle.lock().unwrap().entries.len()
    }
}

impl<T: Poolable> fmt::Debug for Pool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("max", &self.inner.max)
            .field("block", &self.inner.block)
            .finish()
    }
}

/// A checked-out pool value.
///
/// Dropping it releases the checkout exactly once: a still-open value on a
/// capacity permit goes back to the idle list, anything else is closed.
/// Holding the guard keeps the pool itself alive.
pub(crate) struct Pooled<T: Poolable> {
    value: Option<T>,
    permit: Option<OwnedSemaphorePermit>,
    pool: Arc<PoolInner<T>>,
}

impl<T: Poolable> Pooled<T> {
    /// Closes the value instead of returning it.
    pub(crate) fn discard(mut self) {
        if let Some(mut value) = self.value.take() {
            value.close();
        }
    }

    #[cfg(test)]
    fn is_ephemeral(&self) -> bool {
        self.permit.is_none()
    }

    fn release(&mut self) {
        let Some(mut value) = self.value.take() else {
            return;
        };
        if self.permit.is_none() {
            // ephemeral connections are never pooled
            value.close();
            return;
        }
        let mut idle = self.pool.idle.lock().unwrap();
        if !idle.closed && value.is_open() {
            trace!("returning connection to pool");
            idle.entries.push(value);
        } else {
            value.close();
        }
        // the permit drops with self, freeing capacity for a waiter
    }
}

impl<T: Poolable> Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.value.as_ref().expect("checkout already released")
    }
}

impl<T: Poolable> DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.value.as_mut().expect("checkout already released")
    }
}

impl<T: Poolable> Drop for Pooled<T> {
    fn drop(&mut self) {
        self.release();
    }
}

impl<T: Poolable> fmt::Debug for Pooled<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pooled")
            .field("ephemeral", &self.permit.is_none())
            .finish()
    }
}

fn warn_pool_limit(max: usize) {
    static WARNED: Once = Once::new();
    WARNED.call_once(|| {
        warn!(
            "connection pool is at capacity ({}); opening an ephemeral connection. \
             Consider raising the pool size.",
            max
        );
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct MockConn {
        id: usize,
        open: bool,
    }

    impl MockConn {
        fn new(id: usize) -> MockConn {
            MockConn { id, open: true }
        }
    }

    impl Poolable for MockConn {
        fn is_open(&mut self) -> bool {
            self.open
        }

        fn close(&mut self) {
            self.open = false;
        }
    }

    #[tokio::test]
    async fn test_checkout_reuses_lifo() {
        let pool = Pool::new(2, true);

        let a = pool.checkout(None, || MockConn::new(1)).await.unwrap();
        let b = pool.checkout(None, || MockConn::new(2)).await.unwrap();
        assert_eq!(a.id, 1);
        assert_eq!(b.id, 2);
        drop(a);
        drop(b);
        assert_eq!(pool.idle_count(), 2);

        // most recently released first
        let c = pool.checkout(None, || MockConn::new(3)).await.unwrap();
        assert_eq!(c.id, 2);
        let d = pool.checkout(None, || MockConn::new(4)).await.unwrap();
        assert_eq!(d.id, 1);
    }

    #[tokio::test]
    async fn test_dead_idle_connections_are_discarded() {
        let pool = Pool::new(1, true);

        let mut a = pool.checkout(None, || MockConn::new(1)).await.unwrap();
        a.open = false;
        drop(a); // closed on release, not pooled
        assert_eq!(pool.idle_count(), 0);

        let b = pool.checkout(None, || MockConn::new(2)).await.unwrap();
        assert_eq!(b.id, 2);
    }

    #[tokio::test]
    async fn test_blocking_checkout_times_out() {
        let pool = Pool::new(1, true);
        let held = pool.checkout(None, || MockConn::new(1)).await.unwrap();

        let err = pool
            .checkout(Some(Duration::from_millis(20)), || MockConn::new(2))
            .await
            .unwrap_err();
        assert!(err.is_pool_empty());
        drop(held);
    }

    #[tokio::test]
    async fn test_blocking_checkout_wakes_on_release() {
        let pool = Pool::new(1, true);
        let held = pool.checkout(None, || MockConn::new(1)).await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move {
                pool.checkout(Some(Duration::from_secs(5)), || MockConn::new(2))
                    .await
            })
        };
        tokio::task::yield_now().await;
        drop(held);

        let got = waiter.await.unwrap().unwrap();
        // the released connection is handed over, not a fresh one
        assert_eq!(got.id, 1);
    }

    #[tokio::test]
    async fn test_non_blocking_pool_goes_ephemeral() {
        let pool = Pool::new(1, false);
        let held = pool.checkout(None, || MockConn::new(1)).await.unwrap();
        assert!(!held.is_ephemeral());

        let extra = pool.checkout(None, || MockConn::new(2)).await.unwrap();
        assert!(extra.is_ephemeral());
        drop(extra);
        // ephemeral connections are never pooled
        assert_eq!(pool.idle_count(), 0);
        drop(held);
        assert_eq!(pool.idle_count(), 1);
    }

    #[tokio::test]
    async fn test_capacity_invariant_holds() {
        let pool = Pool::new(2, true);
        let a = pool.checkout(None, || MockConn::new(1)).await.unwrap();
        drop(a);

        // one idle + one checked out == max; a further blocking checkout
        // must wait
        let _b = pool.checkout(None, || MockConn::new(2)).await.unwrap();
        let _c = pool.checkout(None, || MockConn::new(3)).await.unwrap();
        let err = pool
            .checkout(Some(Duration::from_millis(20)), || MockConn::new(4))
            .await
            .unwrap_err();
        assert!(err.is_pool_empty());
    }

    #[tokio::test]
    async fn test_close_drains_and_poisons() {
        let pool = Pool::new(2, true);
        let a = pool.checkout(None, || MockConn::new(1)).await.unwrap();
        drop(a);
        assert_eq!(pool.idle_count(), 1);

        pool.close();
        assert_eq!(pool.idle_count(), 0);

        let err = pool.checkout(None, || MockConn::new(2)).await.unwrap_err();
        assert!(err.is_pool_closed());
    }

    #[tokio::test]
    async fn test_release_after_close_closes_value() {
        let pool = Pool::new(1, true);
        let held = pool.checkout(None, || MockConn::new(1)).await.unwrap();
        pool.close();
        drop(held);
        assert_eq!(pool.idle_count(), 0);
    }

    #[tokio::test]
    async fn test_discard_never_pools() {
        let pool = Pool::new(1, true);
        let held = pool.checkout(None, || MockConn::new(1)).await.unwrap();
        held.discard();
        assert_eq!(pool.idle_count(), 0);

        // capacity was released
        let again = pool.checkout(Some(Duration::from_millis(50)), || MockConn::new(2))
            .await
            .unwrap();
        assert_eq!(again.id, 2);
    }

    #[test]
    fn test_origin_normalization() {
        let origin = Origin::from_url(&Url::parse("HTTP://Example.COM./a/b").unwrap()).unwrap();
        assert_eq!(origin.host(), "example.com");
        assert_eq!(origin.port(), 80);
        assert!(!origin.is_https());

        let origin = Origin::from_url(&Url::parse("https://example.com:8443/").unwrap()).unwrap();
        assert_eq!(origin.port(), 8443);
        assert!(origin.is_https());

        let a = Origin::from_url(&Url::parse("http://example.com/x").unwrap()).unwrap();
        let b = Origin::from_url(&Url::parse("http://example.com:80/y").unwrap()).unwrap();
        assert_eq!(a, b);

        Origin::from_url(&Url::parse("ftp://example.com/").unwrap()).unwrap_err();
    }

    #[test]
    fn test_origin_host_header() {
        let origin = Origin::from_url(&Url::parse("http://example.com/").unwrap()).unwrap();
        assert_eq!(origin.host_header(), "example.com");

        let origin = Origin::from_url(&Url::parse("http://example.com:8080/").unwrap()).unwrap();
        assert_eq!(origin.host_header(), "example.com:8080");

        let origin = Origin::from_url(&Url::parse("http://[::1]:3000/").unwrap()).unwrap();
        assert_eq!(origin.host_header(), "[::1]:3000");
    }
}

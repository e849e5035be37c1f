//! Pool limits and counters kept next to hyper's connection pool.
//!
//! hyper-util's client parks and reuses connections on its own but neither
//! bounds how many requests run per route nor reports what it holds. The
//! [`ConnectionLimits`] here cap requests in flight per route and in total,
//! count open connections through [`OpenConnection`] markers carried by each
//! connection's I/O, and remember when the pool was last used.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use http::Uri;
use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::RestError;

/// Connection pool counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Requests holding a pool slot, from dispatch until the body is consumed
    pub leased: usize,
    /// Open connections not serving a request
    pub idle: usize,
    /// Free slots under the total limit
    pub available: usize,
    pub max_total: usize,
    pub max_per_route: usize,
}

/// Pool partition: scheme plus authority with explicit port.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct RouteKey {
    scheme: String,
    host: String,
    port: u16,
}

impl RouteKey {
    pub(crate) fn from_uri(uri: &Uri) -> Result<Self, RestError> {
        let invalid = |reason: &str| RestError::InvalidUri {
            url: uri.to_string(),
            reason: reason.to_owned(),
        };
        let scheme = uri
            .scheme_str()
            .ok_or_else(|| invalid("missing scheme"))?
            .to_ascii_lowercase();
        let host = uri
            .host()
            .ok_or_else(|| invalid("missing host"))?
            .to_ascii_lowercase();
        let port = match (uri.port_u16(), scheme.as_str()) {
            (Some(port), _) => port,
            (None, "http") => 80,
            (None, "https") => 443,
            (None, _) => return Err(invalid("unsupported scheme")),
        };
        Ok(Self { scheme, host, port })
    }

    pub(crate) fn is_https(&self) -> bool {
        self.scheme == "https"
    }
}

impl fmt::Display for RouteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}

/// Marks one open connection; dropped together with the connection's I/O.
#[derive(Debug)]
pub(crate) struct OpenConnection {
    open: Arc<AtomicUsize>,
}

impl OpenConnection {
    pub(crate) fn new(open: &Arc<AtomicUsize>) -> Self {
        open.fetch_add(1, Ordering::AcqRel);
        Self {
            open: Arc::clone(open),
        }
    }
}

impl Drop for OpenConnection {
    fn drop(&mut self) {
        self.open.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Total and per-route slots plus the counters behind [`PoolStats`].
///
/// A route's semaphore lives only while some request holds or waits for one
/// of its slots.
pub(crate) struct ConnectionLimits {
    routes: Mutex<HashMap<RouteKey, Arc<Semaphore>>>,
    total: Arc<Semaphore>,
    max_total: usize,
    max_per_route: usize,
    leased: AtomicUsize,
    open: Arc<AtomicUsize>,
    last_used: Mutex<Instant>,
    closed: AtomicBool,
}

impl ConnectionLimits {
    pub(crate) fn new(max_total: usize, max_per_route: usize) -> Arc<Self> {
        let max_total = max_total.max(1);
        let max_per_route = max_per_route.clamp(1, max_total);
        Arc::new(Self {
            routes: Mutex::new(HashMap::new()),
            total: Arc::new(Semaphore::new(max_total)),
            max_total,
            max_per_route,
            leased: AtomicUsize::new(0),
            open: Arc::new(AtomicUsize::new(0)),
            last_used: Mutex::new(Instant::now()),
            closed: AtomicBool::new(false),
        })
    }

    pub(crate) fn max_per_route(&self) -> usize {
        self.max_per_route
    }

    /// Counter shared with [`OpenConnection`] markers.
    pub(crate) fn open_counter(&self) -> &Arc<AtomicUsize> {
        &self.open
    }

    pub(crate) fn open_connections(&self) -> usize {
        self.open.load(Ordering::Acquire)
    }

    pub(crate) fn leased(&self) -> usize {
        self.leased.load(Ordering::Acquire)
    }

    /// Time since a request last took or returned a slot.
    pub(crate) fn quiet_for(&self) -> Duration {
        self.last_used.lock().elapsed()
    }

    fn touch(&self) {
        *self.last_used.lock() = Instant::now();
    }

    /// Waits for a free slot on `route`, at most `wait` when given.
    pub(crate) async fn reserve(
        self: &Arc<Self>,
        route: RouteKey,
        wait: Option<Duration>,
    ) -> Result<Lease, RestError> {
        let route_limit = {
            let mut routes = self.routes.lock();
            if self.closed.load(Ordering::Acquire) {
                return Err(RestError::Closed("connection pool".to_owned()));
            }
            let max_per_route = self.max_per_route;
            Arc::clone(
                routes
                    .entry(route.clone())
                    .or_insert_with(|| Arc::new(Semaphore::new(max_per_route))),
            )
        };
        let total = Arc::clone(&self.total);

        let acquire = async move {
            let closed = |_| RestError::Closed("connection pool".to_owned());
            let route = route_limit.acquire_owned().await.map_err(closed)?;
            let total = total.acquire_owned().await.map_err(closed)?;
            Ok(Permits {
                _route: route,
                _total: total,
            })
        };

        let acquired = match wait {
            Some(limit) => tokio::time::timeout(limit, acquire)
                .await
                .map_err(|_| RestError::Timeout(limit))
                .and_then(|permits| permits),
            None => acquire.await,
        };
        let permits = match acquired {
            Ok(permits) => permits,
            Err(err) => {
                self.evict_route(&route);
                return Err(err);
            }
        };

        self.leased.fetch_add(1, Ordering::AcqRel);
        self.touch();
        Ok(Lease {
            limits: Arc::downgrade(self),
            route,
            permits: Some(permits),
        })
    }

    /// Forgets the semaphore of `route` once nobody holds or awaits it.
    fn evict_route(&self, route: &RouteKey) {
        let mut routes = self.routes.lock();
        if routes
            .get(route)
            .is_some_and(|limit| Arc::strong_count(limit) == 1)
        {
            routes.remove(route);
        }
    }

    #[cfg(test)]
    fn tracked_routes(&self) -> usize {
        self.routes.lock().len()
    }

    /// Fails pending and future reservations.
    pub(crate) fn close(&self) {
        let mut routes = self.routes.lock();
        self.closed.store(true, Ordering::Release);
        for limit in routes.values() {
            limit.close();
        }
        routes.clear();
        self.total.close();
    }

    pub(crate) fn stats(&self) -> PoolStats {
        let leased = self.leased();
        PoolStats {
            leased,
            idle: self.open_connections().saturating_sub(leased),
            available: self.total.available_permits(),
            max_total: self.max_total,
            max_per_route: self.max_per_route,
        }
    }
}

/// Slots under the total and per-route limits, held for the life of a lease.
struct Permits {
    _route: OwnedSemaphorePermit,
    _total: OwnedSemaphorePermit,
}

/// A pool slot held by one request.
///
/// The decoder releases it once the body has been read or abandoned; dropping
/// the lease has the same effect. An unread body closes its connection
/// instead of returning it to the pool.
pub struct Lease {
    limits: Weak<ConnectionLimits>,
    route: RouteKey,
    permits: Option<Permits>,
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("route", &self.route)
            .field("active", &self.permits.is_some())
            .finish_non_exhaustive()
    }
}

impl Lease {
    /// Gives the slot back.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        // permits first, so the route semaphore is unreferenced when checked
        self.permits = None;
        if let Some(limits) = self.limits.upgrade() {
            limits.leased.fetch_sub(1, Ordering::AcqRel);
            limits.touch();
            limits.evict_route(&self.route);
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    fn route(uri: &str) -> RouteKey {
        RouteKey::from_uri(&uri.parse().unwrap()).unwrap()
    }

    #[test]
    fn test_route_key_defaults_port() {
        let a = route("http://Example.com/a");
        let b = route("http://example.com:80/b");
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "http://example.com:80");

        let tls = route("https://example.com");
        assert!(tls.is_https());
        assert_ne!(a, tls);
    }

    #[test]
    fn test_route_key_rejects_unsupported() {
        assert!(RouteKey::from_uri(&"ftp://example.com".parse().unwrap()).is_err());
        assert!(RouteKey::from_uri(&"/relative".parse().unwrap()).is_err());
    }

    #[test]
    fn test_limits_are_normalized() {
        let limits = ConnectionLimits::new(0, 50);
        let stats = limits.stats();
        assert_eq!(stats.max_total, 1);
        assert_eq!(stats.max_per_route, 1);
        assert_eq!(stats.available, 1);
    }

    #[tokio::test]
    async fn test_reserve_times_out_when_route_exhausted() {
        let limits = ConnectionLimits::new(10, 1);
        let target = route("http://localhost:1");

        let held = limits.reserve(target.clone(), None).await.unwrap();
        assert_eq!(limits.stats().leased, 1);
        let err = limits
            .reserve(target.clone(), Some(Duration::from_millis(20)))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, RestError::Timeout(_)));

        held.release();
        assert_eq!(limits.stats().leased, 0);
        assert!(limits.reserve(target, Some(Duration::from_millis(20))).await.is_ok());
    }

    #[tokio::test]
    async fn test_route_forgotten_when_last_slot_returns() {
        let limits = ConnectionLimits::new(10, 2);
        let first = limits.reserve(route("http://a.local"), None).await.unwrap();
        let second = limits.reserve(route("http://a.local"), None).await.unwrap();
        let other = limits.reserve(route("http://b.local"), None).await.unwrap();
        assert_eq!(limits.tracked_routes(), 2);

        drop(first);
        assert_eq!(limits.tracked_routes(), 2);
        drop(second);
        assert_eq!(limits.tracked_routes(), 1);
        other.release();
        assert_eq!(limits.tracked_routes(), 0);
        assert_eq!(limits.stats().available, 10);
    }

    #[tokio::test]
    async fn test_route_kept_while_a_request_waits() {
        let limits = ConnectionLimits::new(10, 1);
        let held = limits.reserve(route("http://a.local"), None).await.unwrap();

        let waiter = {
            let limits = Arc::clone(&limits);
            tokio::spawn(async move { limits.reserve(route("http://a.local"), None).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(held);

        let lease = waiter.await.unwrap().unwrap();
        assert_eq!(limits.tracked_routes(), 1);
        drop(lease);
        assert_eq!(limits.tracked_routes(), 0);
    }

    #[test]
    fn test_open_connections_counted_until_dropped() {
        let limits = ConnectionLimits::new(4, 4);
        let first = OpenConnection::new(limits.open_counter());
        let second = OpenConnection::new(limits.open_counter());
        assert_eq!(limits.stats().idle, 2);
        drop(first);
        assert_eq!(limits.open_connections(), 1);
        drop(second);
        assert_eq!(limits.stats().idle, 0);
    }

    #[tokio::test]
    async fn test_close_fails_reservations() {
        let limits = ConnectionLimits::new(2, 2);
        limits.close();

        let err = limits.reserve(route("http://localhost:1"), None).await.err().unwrap();
        assert!(matches!(err, RestError::Closed(_)));
        assert_eq!(limits.tracked_routes(), 0);
    }
}

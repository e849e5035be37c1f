//! The client handle and the state its clones share.
//!
//! A [`RestClient`] is a cheap handle over `ClientInner`: transports, request
//! defaults, mappers, the retry policy and the circuit breaker. Closing any
//! clone closes them all.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::builder::RestClientBuilder;
use crate::circuit::{CircuitBreaker, CircuitState};
use crate::engine::{RequestDefaults, Resilience};
use crate::error::RestError;
use crate::mapper::MapperRegistry;
use crate::registry::ClientRegistry;
use crate::request::{Method, RequestBuilder};
use crate::retry::RetryConfig;
use crate::transport::{PoolStats, Transport};

/// Pool statistics of both transports of a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientStats {
    /// `None` when the client has no blocking transport
    pub sync_pool: Option<PoolStats>,
    /// `None` when the client has no async transport
    pub async_pool: Option<PoolStats>,
}

pub(crate) struct ClientInner {
    pub(crate) id: String,
    pub(crate) sync_transport: Option<Arc<dyn Transport>>,
    pub(crate) async_transport: Option<Arc<dyn Transport>>,
    pub(crate) defaults: RequestDefaults,
    pub(crate) mappers: Arc<MapperRegistry>,
    pub(crate) retry: Option<RetryConfig>,
    pub(crate) breaker: Option<Arc<CircuitBreaker>>,
    pub(crate) registry: Weak<ClientRegistry>,
    pub(crate) closed: AtomicBool,
}

impl std::fmt::Debug for ClientInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientInner")
            .field("id", &self.id)
            .field("defaults", &self.defaults)
            .field("sync", &self.sync_transport.is_some())
            .field("async", &self.async_transport.is_some())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl ClientInner {
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn ensure_open(&self) -> Result<(), RestError> {
        if self.is_closed() {
            return Err(RestError::Closed(format!("client {}", self.id)));
        }
        Ok(())
    }

    pub(crate) fn resilience(&self) -> Resilience {
        Resilience {
            retry: self.retry.clone(),
            breaker: self.breaker.clone(),
        }
    }

    fn transports(&self) -> impl Iterator<Item = &Arc<dyn Transport>> {
        self.sync_transport.iter().chain(self.async_transport.iter())
    }

    /// Closes expired and idle pooled connections of running transports.
    pub(crate) fn sweep(&self, idle: Duration) {
        if self.is_closed() {
            return;
        }
        for transport in self.transports().filter(|t| t.is_running()) {
            transport.close_expired();
            transport.close_idle(idle);
        }
    }

    pub(crate) fn close(&self) -> Result<(), RestError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let mut first_error = None;
        for transport in self.transports() {
            if let Err(err) = transport.close() {
                tracing::warn!(client_id = %self.id, error = %err, "failed to close transport");
                first_error.get_or_insert(err);
            }
        }
        if let Some(registry) = self.registry.upgrade() {
            registry.deregister(&self.id);
        }
        tracing::info!(client_id = %self.id, "rest client closed");

        first_error.map_or(Ok(()), Err)
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        if !self.is_closed()
            && let Some(registry) = self.registry.upgrade()
        {
            registry.deregister(&self.id);
        }
    }
}

/// Fluent REST client.
///
/// Cloning is cheap and clones share transports, defaults and lifecycle.
/// Each client owns a blocking transport and, unless disabled, an async
/// transport that starts on the first async request. Open clients are tracked
/// by a [`ClientRegistry`] whose reaper closes idle pooled connections.
///
/// ```ignore
/// let client = RestClient::builder()
///     .base_url("http://localhost:8080")
///     .default_header("Accept", "application/json")
///     .build()?;
///
/// let response = client.post("/echo").body_string("hello").as_string()?;
/// assert_eq!(response.body()?, "hello");
///
/// client.close()?;
/// ```
#[derive(Clone)]
pub struct RestClient {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for RestClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.inner.fmt(f)
    }
}

impl RestClient {
    #[must_use]
    pub fn builder() -> RestClientBuilder {
        RestClientBuilder::new()
    }

    pub(crate) fn from_inner(inner: Arc<ClientInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn inner(&self) -> &ClientInner {
        &self.inner
    }

    /// Unique id of this client, also its key in the registry.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Mapper registry used to read and write object bodies.
    #[must_use]
    pub fn mappers(&self) -> &Arc<MapperRegistry> {
        &self.inner.mappers
    }

    /// Starts a request; `url` is appended to the base URL and may contain
    /// `{name}` route placeholders.
    pub fn request(&self, method: Method, url: impl Into<String>) -> RequestBuilder {
        RequestBuilder::new(self.clone(), method, url)
    }

    pub fn get(&self, url: impl Into<String>) -> RequestBuilder {
        self.request(Method::Get, url)
    }

    pub fn head(&self, url: impl Into<String>) -> RequestBuilder {
        self.request(Method::Head, url)
    }

    pub fn post(&self, url: impl Into<String>) -> RequestBuilder {
        self.request(Method::Post, url)
    }

    pub fn put(&self, url: impl Into<String>) -> RequestBuilder {
        self.request(Method::Put, url)
    }

    pub fn patch(&self, url: impl Into<String>) -> RequestBuilder {
        self.request(Method::Patch, url)
    }

    pub fn delete(&self, url: impl Into<String>) -> RequestBuilder {
        self.request(Method::Delete, url)
    }

    pub fn options(&self, url: impl Into<String>) -> RequestBuilder {
        self.request(Method::Options, url)
    }

    /// Closes expired connections and those idle for longer than `idle`.
    pub fn close_idle_connections(&self, idle: Duration) {
        self.inner.sweep(idle);
    }

    #[must_use]
    pub fn stats(&self) -> ClientStats {
        ClientStats {
            sync_pool: self.inner.sync_transport.as_ref().map(|t| t.stats()),
            async_pool: self.inner.async_transport.as_ref().map(|t| t.stats()),
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// State of the circuit breaker, `None` when none is configured.
    #[must_use]
    pub fn circuit_state(&self) -> Option<CircuitState> {
        self.inner.breaker.as_ref().map(|breaker| breaker.state())
    }

    /// Closes both transports and removes the client from its registry.
    /// Idempotent; later requests fail with [`RestError::Closed`].
    ///
    /// # Errors
    ///
    /// Returns the first transport close failure. The client is closed and
    /// deregistered regardless.
    pub fn close(&self) -> Result<(), RestError> {
        self.inner.close()
    }
}

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use crate::circuit::{CircuitBreaker, CircuitBreakerConfig};
use crate::client::{ClientInner, RestClient};
use crate::config::{ClientConfig, TlsRoots};
use crate::engine::{RequestDefaults, UrlTransform};
use crate::error::RestError;
use crate::mapper::MapperRegistry;
use crate::registry::ClientRegistry;
use crate::retry::{AttemptFailure, RetryConfig};
use crate::transport::{PooledTransport, Transport, TransportSettings};

/// Worker threads of the blocking transport; callers drive requests
/// themselves, the workers only run connection tasks.
const SYNC_WORKER_THREADS: usize = 1;

enum TransportChoice {
    Pooled,
    Custom(Arc<dyn Transport>),
    Disabled,
}

impl std::fmt::Debug for TransportChoice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Pooled => "Pooled",
            Self::Custom(_) => "Custom",
            Self::Disabled => "Disabled",
        })
    }
}

/// Builder for [`RestClient`].
pub struct RestClientBuilder {
    config: ClientConfig,
    url_transform: Option<UrlTransform>,
    sync_transport: TransportChoice,
    async_transport: TransportChoice,
    registry: Option<Arc<ClientRegistry>>,
    mappers: Option<Arc<MapperRegistry>>,
}

impl std::fmt::Debug for RestClientBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestClientBuilder")
            .field("config", &self.config)
            .field("url_transform", &self.url_transform.is_some())
            .field("sync_transport", &self.sync_transport)
            .field("async_transport", &self.async_transport)
            .field("registry", &self.registry.is_some())
            .finish_non_exhaustive()
    }
}

impl Default for RestClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RestClientBuilder {
    /// Create a new builder with default configuration
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(ClientConfig::default())
    }

    /// Create a builder with a specific configuration
    #[must_use]
    pub fn with_config(config: ClientConfig) -> Self {
        Self {
            config,
            url_transform: None,
            sync_transport: TransportChoice::Pooled,
            async_transport: TransportChoice::Pooled,
            registry: None,
            mappers: None,
        }
    }

    /// Prefix prepended to every request path
    #[must_use]
    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.config.base_url = base_url.into();
        self
    }

    /// Rewrites the base URL before each request
    #[must_use]
    pub fn url_transform(mut self, transform: impl Fn(&str) -> String + Send + Sync + 'static) -> Self {
        self.url_transform = Some(Arc::new(transform));
        self
    }

    /// Header sent with every request that does not set it itself.
    ///
    /// Replaces earlier defaults for the same name, whatever their casing.
    #[must_use]
    pub fn default_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.config.default_headers.set(name, value);
        self
    }

    /// Adds one more value to a default header.
    #[must_use]
    pub fn add_default_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.config.default_headers.add(name, value);
        self
    }

    /// Sets several default headers; see [`Self::default_header`].
    #[must_use]
    pub fn default_headers<I, K, V>(mut self, headers: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        for (name, value) in headers {
            self.config.default_headers.set(name.as_ref(), value);
        }
        self
    }

    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Limit for the response head and each body read; zero disables it
    #[must_use]
    pub fn socket_timeout(mut self, timeout: Duration) -> Self {
        self.config.socket_timeout = timeout;
        self
    }

    #[must_use]
    pub fn max_total(mut self, max_total: usize) -> Self {
        self.config.max_total = max_total;
        self
    }

    #[must_use]
    pub fn max_per_route(mut self, max_per_route: usize) -> Self {
        self.config.max_per_route = max_per_route;
        self
    }

    #[must_use]
    pub fn connection_ttl(mut self, ttl: Duration) -> Self {
        self.config.connection_ttl = Some(ttl);
        self
    }

    #[must_use]
    pub fn follow_redirects(mut self, follow: bool) -> Self {
        self.config.follow_redirects = follow;
        self
    }

    #[must_use]
    pub fn max_redirects(mut self, max: usize) -> Self {
        self.config.max_redirects = max;
        self
    }

    /// Forward proxy for plain HTTP targets, e.g. `http://proxy:3128`
    #[must_use]
    pub fn proxy(mut self, proxy: impl Into<String>) -> Self {
        self.config.proxy = Some(proxy.into());
        self
    }

    /// Ask for gzip responses (`Accept-Encoding: gzip`)
    #[must_use]
    pub fn compression(mut self, enabled: bool) -> Self {
        self.config.compression = enabled;
        self
    }

    #[must_use]
    pub fn cookies(mut self, enabled: bool) -> Self {
        self.config.cookies = enabled;
        self
    }

    #[must_use]
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.config.user_agent = user_agent.into();
        self
    }

    #[must_use]
    pub fn async_worker_threads(mut self, threads: usize) -> Self {
        self.config.async_worker_threads = threads;
        self
    }

    #[must_use]
    pub fn tls_roots(mut self, roots: TlsRoots) -> Self {
        self.config.tls_roots = roots;
        self
    }

    /// Set the retry configuration
    #[must_use]
    pub fn retry(mut self, retry: Option<RetryConfig>) -> Self {
        self.config.retry = retry;
        self
    }

    /// Calls `listener` for every failed attempt; enables the default retry
    /// policy if none is set.
    #[must_use]
    pub fn on_failed_attempt(mut self, listener: impl Fn(&AttemptFailure<'_>) + Send + Sync + 'static) -> Self {
        self.config.retry.get_or_insert_with(RetryConfig::default).listeners.on_failed_attempt =
            Some(Arc::new(listener));
        self
    }

    /// Calls `listener` once retries are exhausted; enables the default retry
    /// policy if none is set.
    #[must_use]
    pub fn on_retries_exceeded(mut self, listener: impl Fn(&AttemptFailure<'_>) + Send + Sync + 'static) -> Self {
        self.config.retry.get_or_insert_with(RetryConfig::default).listeners.on_retries_exceeded =
            Some(Arc::new(listener));
        self
    }

    /// Guard the client with a circuit breaker
    #[must_use]
    pub fn circuit_breaker(mut self, breaker: Option<CircuitBreakerConfig>) -> Self {
        self.config.circuit_breaker = breaker;
        self
    }

    /// Async requests fail with [`RestError::AsyncNotConfigured`]
    #[must_use]
    pub fn disable_async(mut self) -> Self {
        self.config.async_enabled = false;
        self.async_transport = TransportChoice::Disabled;
        self
    }

    /// Blocking requests fail with [`RestError::SyncNotConfigured`]
    #[must_use]
    pub fn disable_sync(mut self) -> Self {
        self.sync_transport = TransportChoice::Disabled;
        self
    }

    /// Use `transport` for blocking requests instead of the pooled default
    #[must_use]
    pub fn sync_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.sync_transport = TransportChoice::Custom(transport);
        self
    }

    /// Use `transport` for async requests instead of the pooled default
    #[must_use]
    pub fn async_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.config.async_enabled = true;
        self.async_transport = TransportChoice::Custom(transport);
        self
    }

    /// Registry to track the client in; the process-wide one by default
    #[must_use]
    pub fn registry(mut self, registry: Arc<ClientRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Share a mapper registry between clients
    #[must_use]
    pub fn mappers(mut self, mappers: Arc<MapperRegistry>) -> Self {
        self.mappers = Some(mappers);
        self
    }

    fn pooled(name: String, config: &ClientConfig, workers: usize) -> Result<Arc<dyn Transport>, RestError> {
        let settings = TransportSettings::from_config(name, config, workers)?;
        Ok(Arc::new(PooledTransport::new(settings)?))
    }

    /// Build the client
    ///
    /// The blocking transport is started right away; the async transport
    /// starts with the first async request.
    ///
    /// # Errors
    ///
    /// Returns an error if a transport cannot be created or started, e.g. for
    /// an invalid proxy URL or missing TLS roots.
    pub fn build(self) -> Result<RestClient, RestError> {
        let id = nanoid::nanoid!();
        let short_id: String = id.chars().take(8).collect();
        let config = self.config;

        let sync_transport = match self.sync_transport {
            TransportChoice::Pooled => Some(Self::pooled(
                format!("sync-{short_id}"),
                &config,
                SYNC_WORKER_THREADS,
            )?),
            TransportChoice::Custom(transport) => Some(transport),
            TransportChoice::Disabled => None,
        };
        let async_transport = match self.async_transport {
            TransportChoice::Pooled if config.async_enabled => Some(Self::pooled(
                format!("async-{short_id}"),
                &config,
                config.async_worker_threads,
            )?),
            TransportChoice::Custom(transport) => Some(transport),
            TransportChoice::Pooled | TransportChoice::Disabled => None,
        };
        if let Some(transport) = &sync_transport {
            transport.start()?;
        }

        let registry = self
            .registry
            .unwrap_or_else(|| Arc::clone(ClientRegistry::global()));

        let inner = Arc::new(ClientInner {
            id,
            sync_transport,
            async_transport,
            defaults: RequestDefaults {
                headers: config.default_headers,
                user_agent: config.user_agent,
                compression: config.compression,
                base_url: config.base_url,
                url_transform: self.url_transform,
            },
            mappers: self.mappers.unwrap_or_default(),
            retry: config.retry,
            breaker: config.circuit_breaker.map(|breaker| Arc::new(CircuitBreaker::new(breaker))),
            registry: Arc::downgrade(&registry),
            closed: AtomicBool::new(false),
        });
        registry.register(&inner);

        tracing::info!(
            client_id = %inner.id,
            base_url = %inner.defaults.base_url,
            sync = inner.sync_transport.is_some(),
            async_enabled = inner.async_transport.is_some(),
            "rest client created"
        );
        Ok(RestClient::from_inner(inner))
    }
}

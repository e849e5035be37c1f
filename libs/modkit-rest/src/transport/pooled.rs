//! Default transport: hyper-util's pooling client behind tower-http layers.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use http::{Request, Response, Uri};
use http_body_util::{BodyExt, Full};
use hyper::body::{Body, Incoming};
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioTimer};
use parking_lot::Mutex;
use tokio::runtime::{Handle, Runtime};
use tower::util::BoxCloneService;
use tower::{ServiceBuilder, ServiceExt};
use tower_http::decompression::{DecompressionBody, DecompressionLayer};
use tower_http::follow_redirect::FollowRedirectLayer;

use super::connector::TrackingConnector;
use super::cookie::{CookieJar, CookieLayer};
use super::pool::{ConnectionLimits, PoolStats, RouteKey};
use super::redirect::RedirectPolicy;
use super::{RawResponse, ResponseBody, StatusLine, Transport, TransportFuture};
use crate::config::{ClientConfig, TlsRoots};
use crate::error::{BoxError, RestError};

type WireRequest = Request<Full<Bytes>>;
type RoutedService = BoxCloneService<WireRequest, Response<Incoming>, RestError>;
type HttpService = BoxCloneService<WireRequest, Response<ResponseBody>, RestError>;

/// Settings of one [`PooledTransport`].
#[derive(Debug, Clone)]
pub struct TransportSettings {
    /// Label used in thread names and logs
    pub name: String,
    pub connect_timeout: Duration,
    pub socket_timeout: Duration,
    pub max_total: usize,
    pub max_per_route: usize,
    pub connection_ttl: Option<Duration>,
    pub follow_redirects: bool,
    pub max_redirects: usize,
    pub proxy: Option<Uri>,
    pub cookies: bool,
    /// Decode compressed response bodies
    pub compression: bool,
    pub worker_threads: usize,
    pub tls_roots: TlsRoots,
}

impl TransportSettings {
    /// Derives transport settings from a client configuration.
    ///
    /// # Errors
    ///
    /// Returns [`RestError::InvalidUri`] if the proxy is not an `http://` URL.
    pub fn from_config(
        name: impl Into<String>,
        config: &ClientConfig,
        worker_threads: usize,
    ) -> Result<Self, RestError> {
        let proxy = config
            .proxy
            .as_deref()
            .map(|raw| {
                let uri: Uri = raw.parse().map_err(|e: http::uri::InvalidUri| RestError::InvalidUri {
                    url: raw.to_owned(),
                    reason: e.to_string(),
                })?;
                if uri.scheme_str() != Some("http") || uri.host().is_none() {
                    return Err(RestError::InvalidUri {
                        url: raw.to_owned(),
                        reason: "proxy must be an http:// URL with a host".to_owned(),
                    });
                }
                Ok(uri)
            })
            .transpose()?;

        Ok(Self {
            name: name.into(),
            connect_timeout: config.connect_timeout,
            socket_timeout: config.socket_timeout,
            max_total: config.max_total,
            max_per_route: config.max_per_route,
            connection_ttl: config.connection_ttl,
            follow_redirects: config.follow_redirects,
            max_redirects: config.max_redirects,
            proxy,
            cookies: config.cookies,
            compression: config.compression,
            worker_threads,
            tls_roots: config.tls_roots,
        })
    }
}

/// One hyper client together with its idle connections.
struct Generation {
    service: HttpService,
    created: Instant,
}

struct Shared {
    settings: TransportSettings,
    limits: Arc<ConnectionLimits>,
    connector: TrackingConnector,
    cookies: Option<Arc<CookieJar>>,
    client: Mutex<Option<Generation>>,
}

impl Shared {
    /// Replaces the hyper client; idle connections of the old one close once
    /// the requests still using it finish.
    fn renew(&self, reason: &'static str) {
        let mut client = self.client.lock();
        if client.is_some() {
            *client = Some(Generation {
                service: build_service(self),
                created: Instant::now(),
            });
            tracing::debug!(transport = %self.settings.name, reason, "renewed connection pool");
        }
    }
}

fn client_error(err: hyper_util::client::legacy::Error) -> RestError {
    RestError::Transport(Box::new(err))
}

fn into_response_body<B>(response: Response<B>) -> Response<ResponseBody>
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError>,
{
    response.map(|body| body.map_err(Into::into).boxed_unsync())
}

/// Client stack: decompression, redirects, cookies, then the pooled client.
fn build_service(shared: &Shared) -> HttpService {
    let settings = &shared.settings;
    let client = Client::builder(TokioExecutor::new())
        .pool_timer(TokioTimer::new())
        .pool_max_idle_per_host(shared.limits.max_per_route())
        .build::<_, Full<Bytes>>(shared.connector.clone());

    let routed: RoutedService = ServiceBuilder::new()
        .option_layer(shared.cookies.clone().map(CookieLayer::new))
        .map_err(client_error)
        .service(client)
        .boxed_clone();
    let routed = if settings.follow_redirects {
        ServiceBuilder::new()
            .layer(FollowRedirectLayer::with_policy(RedirectPolicy::new(
                settings.max_redirects,
            )))
            .service(routed)
            .boxed_clone()
    } else {
        routed
    };

    if settings.compression {
        ServiceBuilder::new()
            .map_response(into_response_body::<DecompressionBody<Incoming>>)
            .layer(DecompressionLayer::new())
            .service(routed)
            .boxed_clone()
    } else {
        ServiceBuilder::new()
            .map_response(into_response_body::<Incoming>)
            .service(routed)
            .boxed_clone()
    }
}

/// Default [`Transport`]: hyper-util's pooling HTTP/1 client over rustls,
/// wrapped in tower-http redirect and decompression layers, with a
/// dedicated multi-thread tokio runtime.
///
/// The runtime is created by [`Transport::start`] and torn down by
/// [`Transport::close`] or on drop.
pub struct PooledTransport {
    shared: Arc<Shared>,
    runtime: Mutex<Option<Runtime>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for PooledTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledTransport")
            .field("name", &self.shared.settings.name)
            .field("running", &self.is_running())
            .field("stats", &self.shared.limits.stats())
            .finish_non_exhaustive()
    }
}

impl PooledTransport {
    /// Creates a stopped transport.
    ///
    /// # Errors
    ///
    /// Returns [`RestError::Tls`] if the TLS connector cannot be built.
    pub fn new(settings: TransportSettings) -> Result<Self, RestError> {
        let limits = ConnectionLimits::new(settings.max_total, settings.max_per_route);
        let connector = TrackingConnector::new(
            settings.tls_roots,
            settings.connect_timeout,
            settings.proxy.clone(),
            limits.open_counter(),
        )?;
        let cookies = settings.cookies.then(|| Arc::new(CookieJar::default()));
        let shared = Arc::new(Shared {
            settings,
            limits,
            connector,
            cookies,
            client: Mutex::new(None),
        });
        *shared.client.lock() = Some(Generation {
            service: build_service(&shared),
            created: Instant::now(),
        });
        Ok(Self {
            shared,
            runtime: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub fn settings(&self) -> &TransportSettings {
        &self.shared.settings
    }

    fn label(&self) -> String {
        format!("{} transport", self.shared.settings.name)
    }
}

impl Transport for PooledTransport {
    fn send(&self, request: Request<Bytes>) -> TransportFuture {
        let shared = Arc::clone(&self.shared);
        Box::pin(async move { execute(&shared, request).await })
    }

    fn handle(&self) -> Result<Handle, RestError> {
        self.runtime
            .lock()
            .as_ref()
            .map(|rt| rt.handle().clone())
            .ok_or_else(|| RestError::Closed(self.label()))
    }

    fn is_running(&self) -> bool {
        self.runtime.lock().is_some()
    }

    fn start(&self) -> Result<(), RestError> {
        let mut runtime = self.runtime.lock();
        if self.closed.load(Ordering::Acquire) {
            return Err(RestError::Closed(self.label()));
        }
        if runtime.is_some() {
            return Ok(());
        }

        let settings = &self.shared.settings;
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(settings.worker_threads.max(1))
            .thread_name(format!("modkit-rest-{}", settings.name))
            .enable_all()
            .build()
            .map_err(RestError::transport)?;
        *runtime = Some(rt);

        tracing::debug!(
            transport = %settings.name,
            workers = settings.worker_threads.max(1),
            "transport started"
        );
        Ok(())
    }

    fn close_expired(&self) {
        let Some(ttl) = self.shared.settings.connection_ttl else {
            return;
        };
        let expired = self
            .shared
            .client
            .lock()
            .as_ref()
            .is_some_and(|generation| generation.created.elapsed() >= ttl);
        if expired && self.shared.limits.open_connections() > 0 {
            self.shared.renew("connection ttl elapsed");
        }
    }

    fn close_idle(&self, idle: Duration) {
        let limits = &self.shared.limits;
        if limits.leased() == 0 && limits.open_connections() > 0 && limits.quiet_for() >= idle {
            self.shared.renew("connections idle");
        }
    }

    fn close(&self) -> Result<(), RestError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.shared.limits.close();
        self.shared.client.lock().take();
        if let Some(rt) = self.runtime.lock().take() {
            rt.shutdown_background();
        }
        tracing::debug!(transport = %self.shared.settings.name, "transport closed");
        Ok(())
    }

    fn stats(&self) -> PoolStats {
        self.shared.limits.stats()
    }
}

impl Drop for PooledTransport {
    fn drop(&mut self) {
        // Dropping a runtime blocks, which panics inside async contexts.
        if let Some(rt) = self.runtime.get_mut().take() {
            rt.shutdown_background();
        }
    }
}

fn non_zero(limit: Duration) -> Option<Duration> {
    (!limit.is_zero()).then_some(limit)
}

async fn with_timeout<F: Future>(limit: Duration, fut: F) -> Result<F::Output, RestError> {
    match non_zero(limit) {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| RestError::Timeout(limit)),
        None => Ok(fut.await),
    }
}

async fn execute(shared: &Shared, request: Request<Bytes>) -> Result<RawResponse, RestError> {
    let settings = &shared.settings;
    let route = RouteKey::from_uri(request.uri())?;
    if settings.proxy.is_some() && route.is_https() {
        return Err(RestError::transport(
            "HTTPS targets cannot be reached through the configured proxy",
        ));
    }

    let lease = shared
        .limits
        .reserve(route, non_zero(settings.socket_timeout))
        .await?;
    let service = shared
        .client
        .lock()
        .as_ref()
        .map(|generation| generation.service.clone())
        .ok_or_else(|| RestError::Closed(format!("{} transport", settings.name)))?;

    let response = with_timeout(settings.socket_timeout, service.oneshot(request.map(Full::new))).await??;
    let (parts, body) = response.into_parts();
    let reason = match parts.extensions.get::<hyper::ext::ReasonPhrase>() {
        Some(phrase) => String::from_utf8_lossy(phrase.as_bytes()).into_owned(),
        None => parts.status.canonical_reason().unwrap_or_default().to_owned(),
    };

    Ok(RawResponse {
        status: Some(StatusLine {
            code: parts.status,
            reason,
        }),
        headers: parts.headers,
        body: Some(body),
        lease: Some(lease),
        read_timeout: non_zero(settings.socket_timeout),
    })
}

//! Turns request descriptors into transport calls.

use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use http::header::{ACCEPT_ENCODING, CONTENT_TYPE, USER_AGENT};
use http::{Request, Uri};
use tokio::runtime::Handle;
use url::Url;

use crate::body::Body;
use crate::circuit::CircuitBreaker;
use crate::client::ClientInner;
use crate::error::RestError;
use crate::headers::Headers;
use crate::mapper::MapperRegistry;
use crate::request::{Method, RequestDescriptor};
use crate::response::{BodyFormat, HttpResponse, ResponseEnvelope, StreamResponse, decode};
use crate::retry::{AttemptFailure, RetryConfig};
use crate::task::{self, AsyncTask, Hooks};
use crate::transport::{Transport, clone_request};

/// Rewrites the base URL before each request, e.g. to pick a service instance.
pub type UrlTransform = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// Per-client values applied to every request.
pub(crate) struct RequestDefaults {
    pub(crate) headers: Headers,
    pub(crate) user_agent: String,
    pub(crate) compression: bool,
    pub(crate) base_url: String,
    pub(crate) url_transform: Option<UrlTransform>,
}

impl std::fmt::Debug for RequestDefaults {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestDefaults")
            .field("headers", &self.headers)
            .field("user_agent", &self.user_agent)
            .field("compression", &self.compression)
            .field("base_url", &self.base_url)
            .field("url_transform", &self.url_transform.is_some())
            .finish()
    }
}

impl RequestDefaults {
    fn base_url(&self) -> String {
        match &self.url_transform {
            Some(transform) => transform(&self.base_url),
            None => self.base_url.clone(),
        }
    }
}

/// Builds the wire request.
///
/// - default headers fill in names the request did not set, except a default
///   `Content-Type` when the body dictates its own
/// - `User-Agent` and, with compression on, `Accept-Encoding: gzip` are added
///   when absent
/// - the body's own `Content-Type` replaces any caller value
/// - `GET` and `HEAD` are sent without a body
pub(crate) fn prepare(defaults: &RequestDefaults, descriptor: RequestDescriptor) -> Result<Request<Bytes>, RestError> {
    let url = descriptor.resolve_url(&defaults.base_url())?;
    let uri = normalize_url(&url)?;

    let RequestDescriptor {
        method,
        mut headers,
        body,
        ..
    } = descriptor;

    let body_owns_content_type = body.as_ref().is_some_and(Body::implies_content_type);
    for (name, values) in defaults.headers.iter() {
        if headers.contains(name) {
            continue;
        }
        if body_owns_content_type && name.eq_ignore_ascii_case(CONTENT_TYPE.as_str()) {
            continue;
        }
        for value in values {
            headers.add(name, value.clone());
        }
    }
    if !headers.contains(USER_AGENT.as_str()) {
        headers.set(USER_AGENT.as_str(), defaults.user_agent.clone());
    }
    if defaults.compression && !headers.contains(ACCEPT_ENCODING.as_str()) {
        headers.set(ACCEPT_ENCODING.as_str(), "gzip");
    }

    let payload = match body {
        Some(body) if method.permits_body() => {
            let entity = body.into_entity()?;
            if let Some(content_type) = entity.content_type {
                headers.set(CONTENT_TYPE.as_str(), content_type);
            }
            entity.bytes
        }
        Some(_) => {
            tracing::debug!(%method, %uri, "body ignored for method without request body");
            Bytes::new()
        }
        None => Bytes::new(),
    };

    let mut request = Request::builder()
        .method(method.as_http())
        .uri(uri)
        .body(payload)?;
    *request.headers_mut() = headers.to_header_map()?;
    Ok(request)
}

/// Canonical form of a request URL.
///
/// The fragment is dropped, the path is percent-decoded and re-encoded
/// (escapes of non-UTF-8 bytes stay as they are), and the query is kept
/// verbatim unless it is empty. Only `http` and `https`
/// are accepted.
pub(crate) fn normalize_url(raw: &str) -> Result<Uri, RestError> {
    let invalid = |reason: String| RestError::InvalidUri {
        url: raw.to_owned(),
        reason,
    };

    let without_fragment = raw.split_once('#').map_or(raw, |(head, _)| head);
    let (base, query) = match without_fragment.split_once('?') {
        Some((base, query)) => (base, Some(query)),
        None => (without_fragment, None),
    };

    let mut url = Url::parse(base.trim()).map_err(|e| invalid(e.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(invalid(format!("unsupported scheme '{}'", url.scheme())));
    }
    // a path that decodes to non-UTF-8 bytes keeps the parser's escaping
    let decoded = urlencoding::decode_binary(url.path().as_bytes()).into_owned();
    if let Ok(path) = String::from_utf8(decoded) {
        url.set_path(&path);
    }

    let mut normalized = String::from(url);
    if let Some(query) = query.filter(|q| !q.trim().is_empty()) {
        normalized.push('?');
        normalized.push_str(query);
    }
    normalized.parse().map_err(|e: http::uri::InvalidUri| invalid(e.to_string()))
}

/// Failure handling around one logical request.
#[derive(Clone)]
pub(crate) struct Resilience {
    pub(crate) retry: Option<RetryConfig>,
    pub(crate) breaker: Option<Arc<CircuitBreaker>>,
}

impl Resilience {
    fn admit(&self) -> Result<(), RestError> {
        match &self.breaker {
            Some(breaker) => breaker.acquire(),
            None => Ok(()),
        }
    }

    fn record(&self, failed: bool) {
        if let Some(breaker) = &self.breaker {
            breaker.record(failed);
        }
    }
}

/// Attempt outcomes the circuit breaker counts against the server.
fn is_failure(outcome: &Result<ResponseEnvelope, RestError>) -> bool {
    match outcome {
        Ok(envelope) => envelope.status() >= 500,
        Err(err) => err.is_transport(),
    }
}

/// Sends `request`, decodes the response and retries per the retry policy.
async fn exchange(
    transport: Arc<dyn Transport>,
    request: Request<Bytes>,
    method: Method,
    resilience: Resilience,
    mappers: Arc<MapperRegistry>,
) -> Result<ResponseEnvelope, RestError> {
    let mut attempt = 0;
    loop {
        resilience.admit()?;
        let outcome = match transport.send(clone_request(&request)).await {
            Ok(raw) => decode(raw, Arc::clone(&mappers)).await,
            Err(err) => Err(err),
        };
        resilience.record(is_failure(&outcome));

        let Some(policy) = resilience.retry.as_ref() else {
            return outcome;
        };
        let failure = match &outcome {
            Ok(envelope) if policy.should_retry_status(envelope.status()) => {
                AttemptFailure::Status(envelope.status())
            }
            Err(err) if policy.should_retry_error(err, method) => AttemptFailure::Error(err),
            _ => return outcome,
        };
        policy.listeners.failed_attempt(&failure);
        if attempt >= policy.max_retries {
            policy.listeners.retries_exceeded(&failure);
            return outcome;
        }

        let delay = policy.backoff.delay(attempt);
        attempt += 1;
        let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        match failure {
            AttemptFailure::Status(status) => tracing::debug!(attempt, status, delay_ms, "retrying request"),
            AttemptFailure::Error(err) => tracing::debug!(attempt, error = %err, delay_ms, "retrying request"),
        }
        tokio::time::sleep(delay).await;
    }
}

fn sync_transport(inner: &ClientInner) -> Result<Arc<dyn Transport>, RestError> {
    inner.ensure_open()?;
    inner.sync_transport.clone().ok_or(RestError::SyncNotConfigured)
}

/// Handle to block on; blocking from inside a runtime would stall its workers.
fn blocking_handle(transport: &dyn Transport) -> Result<Handle, RestError> {
    if Handle::try_current().is_ok() {
        return Err(RestError::BlockingInAsyncContext);
    }
    transport.handle()
}

pub(crate) fn execute_blocking<F: BodyFormat>(
    inner: &ClientInner,
    descriptor: RequestDescriptor,
) -> Result<HttpResponse<F>, RestError> {
    let transport = sync_transport(inner)?;
    let method = descriptor.method;
    let request = prepare(&inner.defaults, descriptor)?;
    let handle = blocking_handle(transport.as_ref())?;

    tracing::debug!(client_id = %inner.id, %method, uri = %request.uri(), "executing request");
    let envelope = handle.block_on(exchange(
        transport,
        request,
        method,
        inner.resilience(),
        Arc::clone(&inner.mappers),
    ))?;
    Ok(HttpResponse::new(envelope))
}

pub(crate) fn execute_stream(inner: &ClientInner, descriptor: RequestDescriptor) -> Result<StreamResponse, RestError> {
    let transport = sync_transport(inner)?;
    let method = descriptor.method;
    let request = prepare(&inner.defaults, descriptor)?;
    let handle = blocking_handle(transport.as_ref())?;

    tracing::debug!(client_id = %inner.id, %method, uri = %request.uri(), "executing streaming request");
    let resilience = inner.resilience();
    resilience.admit()?;
    let sent = handle.block_on(transport.send(request));
    resilience.record(match &sent {
        Ok(raw) => raw.status.as_ref().is_some_and(|line| line.code.is_server_error()),
        Err(err) => err.is_transport(),
    });
    Ok(StreamResponse::new(sent?, handle))
}

/// Validates and prepares an async request; the returned future does the I/O.
fn start_async(
    inner: &ClientInner,
    descriptor: RequestDescriptor,
) -> Result<(Handle, impl Future<Output = Result<ResponseEnvelope, RestError>> + Send + 'static), RestError> {
    inner.ensure_open()?;
    let transport = inner
        .async_transport
        .clone()
        .ok_or(RestError::AsyncNotConfigured)?;
    let method = descriptor.method;
    let request = prepare(&inner.defaults, descriptor)?;

    if !transport.is_running() {
        transport.start()?;
        tracing::info!(client_id = %inner.id, "async transport started");
    }
    let handle = transport.handle()?;

    tracing::debug!(client_id = %inner.id, %method, uri = %request.uri(), "executing async request");
    let work = exchange(
        transport,
        request,
        method,
        inner.resilience(),
        Arc::clone(&inner.mappers),
    );
    Ok((handle, work))
}

pub(crate) fn execute_async<F: BodyFormat>(
    inner: &ClientInner,
    descriptor: RequestDescriptor,
) -> AsyncTask<HttpResponse<F>> {
    match start_async(inner, descriptor) {
        Ok((handle, work)) => AsyncTask::spawn(&handle, async move { work.await.map(HttpResponse::new) }, None),
        Err(err) => AsyncTask::failed(err),
    }
}

pub(crate) fn execute_async_with<F: BodyFormat>(
    inner: &ClientInner,
    descriptor: RequestDescriptor,
    hooks: Hooks<HttpResponse<F>>,
) -> AsyncTask<()> {
    match start_async(inner, descriptor) {
        Ok((handle, work)) => task::spawn_with_hooks(&handle, async move { work.await.map(HttpResponse::new) }, hooks),
        Err(err) => {
            hooks.fail(err);
            AsyncTask::ready(Ok(()))
        }
    }
}

//! HTTP transport collaborator.
//!
//! The engine only talks to [`Transport`]; [`PooledTransport`] is the default
//! implementation: hyper-util's pooling client with tower-http redirect and
//! decompression layers, slot limits and a runtime of its own. Other
//! implementations can be injected through the client builder.

mod connector;
mod cookie;
mod pool;
mod pooled;
mod redirect;

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Request, StatusCode};
use http_body_util::{BodyExt, Full};
use tokio::runtime::Handle;

use crate::error::{BoxError, RestError};

pub use pool::{Lease, PoolStats};
pub use pooled::{PooledTransport, TransportSettings};

/// Response body stream as handed over by a transport.
pub type ResponseBody = http_body_util::combinators::UnsyncBoxBody<Bytes, BoxError>;

/// Boxed future returned by [`Transport::send`].
pub type TransportFuture = Pin<Box<dyn Future<Output = Result<RawResponse, RestError>> + Send>>;

/// Status code and reason phrase of a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusLine {
    pub code: StatusCode,
    pub reason: String,
}

impl StatusLine {
    /// Status line with the canonical reason phrase.
    #[must_use]
    pub fn canonical(code: StatusCode) -> Self {
        Self {
            code,
            reason: code.canonical_reason().unwrap_or_default().to_owned(),
        }
    }
}

/// Undecoded response handed over by a transport.
///
/// While `lease` is held the request occupies a pool slot; the decoder gives
/// it back once the body has been read or abandoned.
pub struct RawResponse {
    pub status: Option<StatusLine>,
    pub headers: HeaderMap,
    pub body: Option<ResponseBody>,
    pub lease: Option<Lease>,
    /// Limit for each body read
    pub read_timeout: Option<Duration>,
}

impl std::fmt::Debug for RawResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .field("has_body", &self.body.is_some())
            .field("leased", &self.lease.is_some())
            .field("read_timeout", &self.read_timeout)
            .finish()
    }
}

impl RawResponse {
    /// Response without connection lease, mainly for custom transports.
    #[must_use]
    pub fn new(status: StatusCode) -> Self {
        Self {
            status: Some(StatusLine::canonical(status)),
            headers: HeaderMap::new(),
            body: None,
            lease: None,
            read_timeout: None,
        }
    }

    /// Response whose transport provided no status line.
    #[must_use]
    pub fn without_status() -> Self {
        Self {
            status: None,
            headers: HeaderMap::new(),
            body: None,
            lease: None,
            read_timeout: None,
        }
    }

    /// Appends a header; invalid names or values are skipped.
    #[must_use]
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        if let (Ok(name), Ok(value)) = (HeaderName::try_from(name), HeaderValue::from_str(value)) {
            self.headers.append(name, value);
        }
        self
    }

    #[must_use]
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(
            Full::new(body.into())
                .map_err(|never| match never {})
                .boxed_unsync(),
        );
        self
    }
}

/// Collaborator contract for executing requests.
///
/// `send` futures must be driven inside the runtime returned by
/// [`Transport::handle`]; the pool operations are safe to call from any
/// thread, including the reaper.
pub trait Transport: Send + Sync {
    /// Executes one request, following redirects if configured.
    fn send(&self, request: Request<Bytes>) -> TransportFuture;

    /// Runtime that drives `send` futures.
    ///
    /// # Errors
    ///
    /// Returns [`RestError::Closed`] if the transport is not running.
    fn handle(&self) -> Result<Handle, RestError>;

    fn is_running(&self) -> bool;

    /// Starts the transport; a no-op when already running.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport was closed or cannot start.
    fn start(&self) -> Result<(), RestError>;

    /// Closes pooled connections that are dead or past their time to live.
    fn close_expired(&self);

    /// Closes pooled connections idle for longer than `idle`.
    fn close_idle(&self, idle: Duration);

    /// Releases every resource. Idempotent.
    ///
    /// # Errors
    ///
    /// Implementations may report a failure to release resources.
    fn close(&self) -> Result<(), RestError>;

    fn stats(&self) -> PoolStats;
}

/// Copies a request, extensions excluded.
pub(crate) fn clone_request(request: &Request<Bytes>) -> Request<Bytes> {
    let mut copy = Request::new(request.body().clone());
    *copy.method_mut() = request.method().clone();
    *copy.uri_mut() = request.uri().clone();
    *copy.version_mut() = request.version();
    *copy.headers_mut() = request.headers().clone();
    copy
}

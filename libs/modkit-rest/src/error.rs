use std::time::Duration;
use thiserror::Error;

/// Boxed error used for causes coming from lower layers (sockets, TLS, codecs).
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Coarse classification of a [`RestError`].
///
/// Stable across releases, so callers can branch on it instead of matching
/// individual variants or parsing messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    /// A media type string could not be parsed
    InvalidMediaType,
    /// No mapper is registered for the requested media type
    NoMapperFound,
    /// The response carries no `Content-Type` header
    NoContentType,
    /// A URL placeholder was left without a value
    MissingRouteParameter,
    /// The request could not be assembled (URL, header, body)
    InvalidRequest,
    /// Connection, timeout, TLS or I/O failure
    TransportFailure,
    /// Body could not be (de)serialized
    Mapping,
    /// Async dispatch on a client without an async transport
    AsyncNotConfigured,
    /// Blocking dispatch on a client without a sync transport
    SyncNotConfigured,
    /// The request was cancelled before it completed
    Cancelled,
    /// The client or transport has already been closed
    Closed,
    /// The client's circuit breaker rejected the request
    CircuitOpen,
}

/// The single error type returned by every fallible operation of this crate.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum RestError {
    /// Malformed media type
    #[error("Invalid media type '{value}'")]
    InvalidMediaType { value: String },

    /// No mapper matches the media type, neither exactly nor by compatibility
    #[error("No object mapper registered for media type '{media_type}'")]
    NoMapperFound { media_type: String },

    /// Typed body requested from a response without a `Content-Type`
    #[error("Response Content-Type header not found")]
    NoContentType,

    /// `{name}` placeholder still present in the URL at dispatch time
    #[error("No value provided for route parameter '{name}' in '{url}'")]
    MissingRouteParameter { name: String, url: String },

    /// Route parameter supplied for a placeholder that the URL does not have
    #[error("Route parameter '{name}' not found in '{url}'")]
    UnknownRouteParameter { name: String, url: String },

    /// Request URL could not be parsed or uses an unsupported scheme
    #[error("Invalid URL '{url}': {reason}")]
    InvalidUri { url: String, reason: String },

    /// Request building failed
    #[error("Failed to build request: {0}")]
    RequestBuild(#[from] http::Error),

    /// Invalid header name
    #[error("Invalid header name: {0}")]
    InvalidHeaderName(#[from] http::header::InvalidHeaderName),

    /// Invalid header value
    #[error("Invalid header value: {0}")]
    InvalidHeaderValue(#[from] http::header::InvalidHeaderValue),

    /// Form field value of an unsupported shape
    #[error("Invalid value for form field '{name}': {reason}")]
    InvalidFormValue { name: String, reason: String },

    /// Request body could not be encoded
    #[error("Failed to encode request body: {0}")]
    BodyEncode(#[source] BoxError),

    /// Single request attempt exceeded the connect or socket timeout
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// Network level failure
    #[error("Transport error: {0}")]
    Transport(#[source] BoxError),

    /// TLS configuration or handshake failure
    #[error("TLS error: {0}")]
    Tls(#[source] BoxError),

    /// Redirect chain longer than the configured limit
    #[error("Too many redirects (limit {0})")]
    TooManyRedirects(usize),

    /// Reading or decompressing the response body failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// (De)serialization through an object mapper failed
    #[error("Mapping failed: {0}")]
    Mapping(#[source] BoxError),

    /// The client was built without an async transport
    #[error("Async transport is not configured for this client")]
    AsyncNotConfigured,

    /// The client was built without a sync transport
    #[error("Sync transport is not configured for this client")]
    SyncNotConfigured,

    /// Blocking call made from inside an async runtime
    #[error("Blocking request issued from within an async runtime, use the async API instead")]
    BlockingInAsyncContext,

    /// The request was cancelled
    #[error("Request cancelled")]
    Cancelled,

    /// Client or transport already closed
    #[error("{0} is closed")]
    Closed(String),

    /// Circuit breaker is open
    #[error("Circuit breaker open, retry after {retry_after:?}")]
    CircuitOpen { retry_after: Duration },
}

impl RestError {
    /// Returns the coarse classification of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidMediaType { .. } => ErrorKind::InvalidMediaType,
            Self::NoMapperFound { .. } => ErrorKind::NoMapperFound,
            Self::NoContentType => ErrorKind::NoContentType,
            Self::MissingRouteParameter { .. } => ErrorKind::MissingRouteParameter,
            Self::UnknownRouteParameter { .. }
            | Self::InvalidUri { .. }
            | Self::RequestBuild(_)
            | Self::InvalidHeaderName(_)
            | Self::InvalidHeaderValue(_)
            | Self::InvalidFormValue { .. }
            | Self::BodyEncode(_)
            | Self::BlockingInAsyncContext => ErrorKind::InvalidRequest,
            Self::Timeout(_)
            | Self::Transport(_)
            | Self::Tls(_)
            | Self::TooManyRedirects(_)
            | Self::Io(_) => ErrorKind::TransportFailure,
            Self::Mapping(_) => ErrorKind::Mapping,
            Self::AsyncNotConfigured => ErrorKind::AsyncNotConfigured,
            Self::SyncNotConfigured => ErrorKind::SyncNotConfigured,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Closed(_) => ErrorKind::Closed,
            Self::CircuitOpen { .. } => ErrorKind::CircuitOpen,
        }
    }

    /// `true` for connection, timeout and I/O failures.
    #[must_use]
    pub fn is_transport(&self) -> bool {
        self.kind() == ErrorKind::TransportFailure
    }

    pub(crate) fn transport(err: impl Into<BoxError>) -> Self {
        Self::Transport(err.into())
    }

    pub(crate) fn mapping(err: impl Into<BoxError>) -> Self {
        Self::Mapping(err.into())
    }
}

impl From<hyper::Error> for RestError {
    fn from(err: hyper::Error) -> Self {
        Self::Transport(Box::new(err))
    }
}

impl From<serde_json::Error> for RestError {
    fn from(err: serde_json::Error) -> Self {
        Self::Mapping(Box::new(err))
    }
}

impl From<serde_urlencoded::ser::Error> for RestError {
    fn from(err: serde_urlencoded::ser::Error) -> Self {
        Self::BodyEncode(Box::new(err))
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn test_kind_groups_transport_failures() {
        assert_eq!(
            RestError::Timeout(Duration::from_secs(1)).kind(),
            ErrorKind::TransportFailure
        );
        assert_eq!(
            RestError::Io(std::io::Error::other("boom")).kind(),
            ErrorKind::TransportFailure
        );
        assert!(RestError::TooManyRedirects(10).is_transport());
        assert!(!RestError::NoContentType.is_transport());
    }

    #[test]
    fn test_open_circuit_is_not_a_transport_failure() {
        let err = RestError::CircuitOpen {
            retry_after: Duration::from_secs(3),
        };
        assert_eq!(err.kind(), ErrorKind::CircuitOpen);
        assert!(!err.is_transport());
        assert_eq!(err.to_string(), "Circuit breaker open, retry after 3s");
    }

    #[test]
    fn test_kind_for_configuration_errors() {
        assert_eq!(
            RestError::AsyncNotConfigured.kind(),
            ErrorKind::AsyncNotConfigured
        );
        assert_eq!(
            RestError::SyncNotConfigured.kind(),
            ErrorKind::SyncNotConfigured
        );
        assert_eq!(
            RestError::MissingRouteParameter {
                name: "id".into(),
                url: "/a/{id}".into()
            }
            .kind(),
            ErrorKind::MissingRouteParameter
        );
    }

    #[test]
    fn test_transport_preserves_source_chain() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err = RestError::transport(io);

        let source = err.source().expect("transport error has a source");
        let io = source
            .downcast_ref::<std::io::Error>()
            .expect("source is the original io::Error");
        assert_eq!(io.kind(), std::io::ErrorKind::ConnectionRefused);
    }

    #[test]
    fn test_json_error_maps_to_mapping() {
        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err = RestError::from(json_err);
        assert_eq!(err.kind(), ErrorKind::Mapping);
        assert!(err.to_string().starts_with("Mapping failed"));
    }
}

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![warn(warnings)]

//! Fluent REST client for `ModKit`
//!
//! This crate provides a blocking and async HTTP/1 client with:
//! - A fluent request builder (route and query parameters, form, multipart
//!   and raw bodies, basic auth)
//! - Pooled connections per client over hyper-util and rustls
//! - Typed response bodies (text, bytes, JSON tree, mapped objects), buffered
//!   once and cached
//! - Transparent gzip decoding, redirects and a cookie store
//! - Optional retries with backoff and a per-client circuit breaker
//! - Pluggable object mappers keyed by media type
//! - A client registry whose background reaper closes idle connections
//!
//! # Lifecycle
//!
//! Every client is registered in a [`ClientRegistry`] (the process-wide one
//! unless configured otherwise) until it is closed or dropped. Hold a
//! [`ClientRegistry::shutdown_guard`] in `main` to close all clients and stop
//! the reaper on exit.
//!
//! # Example
//!
//! ```ignore
//! use modkit_rest::{ClientRegistry, RestClient};
//!
//! let _guard = ClientRegistry::global().shutdown_guard();
//!
//! let client = RestClient::builder()
//!     .base_url("http://localhost:8080")
//!     .default_header("Accept", "application/json")
//!     .build()?;
//!
//! // Blocking
//! let user = client
//!     .get("/users/{id}")
//!     .route_param("id", 42)
//!     .as_object::<User>()?;
//! println!("{}", user.body()?.name);
//!
//! // Async
//! let greeting = client.post("/echo").body_string("hello").as_string_async().await?;
//! assert_eq!(greeting.body()?, "hello");
//! ```

mod body;
mod builder;
mod circuit;
mod client;
mod config;
mod engine;
mod error;
mod headers;
mod json;
mod mapper;
mod media_type;
mod registry;
mod request;
mod response;
mod retry;
mod task;
mod transport;

pub use body::{Body, Entity, FormBody, FormValue, MultipartBody, Part, PartContent, RawBody};
pub use builder::RestClientBuilder;
pub use circuit::{CircuitBreakerConfig, CircuitState};
pub use client::{ClientStats, RestClient};
pub use config::{ClientConfig, DEFAULT_USER_AGENT, ReaperConfig, TlsRoots, duration_serde};
pub use engine::UrlTransform;
pub use error::{BoxError, ErrorKind, RestError};
pub use headers::Headers;
pub use json::Json;
pub use mapper::{JsonMapper, MapperRegistry, ObjectMapper, TextPlainMapper, read_as, write_from};
pub use media_type::MediaType;
pub use registry::{ClientRegistry, ShutdownGuard};
pub use request::{Method, RequestBuilder, RequestDescriptor};
pub use response::{
    Binary, BodyFormat, HttpResponse, JsonTree, Object, ResponseEnvelope, StreamResponse, Text,
};
pub use retry::{AttemptFailure, ExponentialBackoff, RetryConfig, RetryListener, RetryListeners};
pub use task::{AsyncTask, Callback, Hooks};
pub use transport::{
    Lease, PoolStats, PooledTransport, RawResponse, ResponseBody, StatusLine, Transport,
    TransportFuture, TransportSettings,
};

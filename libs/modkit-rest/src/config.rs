use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::circuit::CircuitBreakerConfig;
use crate::headers::Headers;
use crate::retry::RetryConfig;

/// Default User-Agent header value
pub const DEFAULT_USER_AGENT: &str = concat!("modkit-rest/", env!("CARGO_PKG_VERSION"));

/// Root certificate source for TLS connections
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TlsRoots {
    /// Mozilla root certificates bundled at build time
    #[default]
    WebPki,
    /// Certificates from the operating system store
    Native,
}

/// Client instance configuration.
///
/// Durations are written in humantime form (`"10s"`, `"500ms"`). A zero
/// timeout disables the corresponding limit.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
#[allow(clippy::struct_excessive_bools)] // independent feature switches
pub struct ClientConfig {
    /// TCP connect plus TLS handshake limit (default: 10s)
    #[serde(with = "duration_serde")]
    pub connect_timeout: Duration,

    /// Limit for the response head and for each read of the body (default: 60s).
    /// Also bounds the wait for a free pooled connection.
    #[serde(with = "duration_serde")]
    pub socket_timeout: Duration,

    /// Pooled connections across all routes (default: 200)
    pub max_total: usize,

    /// Pooled connections per scheme and authority (default: 20)
    pub max_per_route: usize,

    /// Close pooled connections older than this, idle or not (default: none)
    #[serde(with = "duration_serde::option")]
    pub connection_ttl: Option<Duration>,

    pub follow_redirects: bool,
    pub max_redirects: usize,

    /// Forward proxy for plain HTTP targets, e.g. `http://proxy:3128`
    pub proxy: Option<String>,

    /// Headers added to every request unless the request sets them itself.
    /// Names are case-insensitive; a name may carry several values.
    pub default_headers: Headers,

    /// Prefix for request paths
    pub base_url: String,

    /// Send `Accept-Encoding: gzip` unless the request sets it
    pub compression: bool,

    /// Keep an in-memory cookie store per transport
    pub cookies: bool,

    pub user_agent: String,

    /// Build an async transport (started on first async request)
    pub async_enabled: bool,

    /// Worker threads of the async transport runtime
    pub async_worker_threads: usize,

    pub tls_roots: TlsRoots,

    /// Retry policy, disabled when absent
    pub retry: Option<RetryConfig>,

    /// Circuit breaker shared by all requests of the client, disabled when absent
    pub circuit_breaker: Option<CircuitBreakerConfig>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            socket_timeout: Duration::from_secs(60),
            max_total: 200,
            max_per_route: 20,
            connection_ttl: None,
            follow_redirects: true,
            max_redirects: 10,
            proxy: None,
            default_headers: Headers::new(),
            base_url: String::new(),
            compression: true,
            cookies: true,
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            async_enabled: true,
            async_worker_threads: 2,
            tls_roots: TlsRoots::default(),
            retry: None,
            circuit_breaker: None,
        }
    }
}

/// Idle connection reaper settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReaperConfig {
    /// Pause between sweeps (default: 5s)
    #[serde(with = "duration_serde")]
    pub interval: Duration,

    /// Pooled connections idle longer than this are closed (default: 30s)
    #[serde(with = "duration_serde")]
    pub idle_timeout: Duration,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(30),
        }
    }
}

/// Humantime (de)serialization for `Duration` fields.
///
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct Foo {
///     #[serde(with = "duration_serde")]
///     timeout: Duration,
/// }
/// ```
pub mod duration_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer, de};

    /// # Errors
    ///
    /// Fails if the serializer rejects a string.
    pub fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(&humantime::format_duration(*value))
    }

    /// # Errors
    ///
    /// Fails on values that are not humantime durations.
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(d)?;
        humantime::parse_duration(&raw).map_err(de::Error::custom)
    }

    pub mod option {
        use std::time::Duration;

        use serde::{Deserialize, Deserializer, Serializer, de};

        /// # Errors
        ///
        /// Fails if the serializer rejects a string.
        #[allow(clippy::ref_option)]
        pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
            match value {
                Some(d) => s.collect_str(&humantime::format_duration(*d)),
                None => s.serialize_none(),
            }
        }

        /// # Errors
        ///
        /// Fails on values that are not humantime durations.
        pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
            Option::<String>::deserialize(d)?
                .map(|raw| humantime::parse_duration(&raw).map_err(de::Error::custom))
                .transpose()
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.socket_timeout, Duration::from_secs(60));
        assert_eq!(config.max_total, 200);
        assert_eq!(config.max_per_route, 20);
        assert!(config.follow_redirects);
        assert!(config.compression);
        assert!(config.retry.is_none());
        assert!(config.circuit_breaker.is_none());
        assert!(config.user_agent.starts_with("modkit-rest/"));
    }

    #[test]
    fn test_deserialize_humantime_durations() {
        let config: ClientConfig = serde_json::from_value(serde_json::json!({
            "connect_timeout": "2s",
            "socket_timeout": "1m 30s",
            "connection_ttl": "5m",
            "base_url": "http://localhost:8080",
            "default_headers": {"X-Api-Key": "k"},
            "retry": {"max_retries": 1},
            "circuit_breaker": {"failure_threshold": 2, "delay": "30s"}
        }))
        .unwrap();

        assert_eq!(config.connect_timeout, Duration::from_secs(2));
        assert_eq!(config.socket_timeout, Duration::from_secs(90));
        assert_eq!(config.connection_ttl, Some(Duration::from_secs(300)));
        assert_eq!(config.default_headers.get_first("x-api-key"), Some("k"));
        assert_eq!(config.retry.map(|r| r.max_retries), Some(1));
        let breaker = config.circuit_breaker.unwrap();
        assert_eq!(breaker.failure_threshold, 2);
        assert_eq!(breaker.delay, Duration::from_secs(30));
        assert_eq!(config.max_total, 200);
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let result: Result<ClientConfig, _> =
            serde_json::from_value(serde_json::json!({"conect_timeout": "2s"}));
        assert!(result.is_err());
    }

    #[test]
    fn test_reaper_round_trip_format() {
        let json = serde_json::to_value(ReaperConfig::default()).unwrap();
        assert_eq!(json["interval"], "5s");
        assert_eq!(json["idle_timeout"], "30s");
    }
}

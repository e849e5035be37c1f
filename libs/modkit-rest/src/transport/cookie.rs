//! Client cookie store and the tower layer that applies it.
//!
//! `Set-Cookie` headers are parsed with the [`cookie`] crate and kept per
//! domain. Domain, path, secure and expiry attributes are honored when
//! cookies are stored and when they are selected for a request.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use cookie::Cookie;
use dashmap::DashMap;
use http::{HeaderMap, HeaderValue, Request, Response, Uri, header};
use tower::{Layer, Service};

#[derive(Debug, Clone)]
struct StoredCookie {
    cookie: Cookie<'static>,
    path: String,
    /// Set without a `Domain` attribute: only sent to the exact host
    host_only: bool,
    secure: bool,
    expires: Option<Instant>,
}

impl StoredCookie {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires.is_some_and(|at| at <= now)
    }
}

/// What a `Set-Cookie` asks for once its expiry attributes are evaluated.
enum Lifetime {
    Session,
    Until(Instant),
    Expired,
}

fn lifetime(cookie: &Cookie<'_>) -> Lifetime {
    let remaining = if let Some(max_age) = cookie.max_age() {
        max_age.whole_seconds()
    } else if let Some(at) = cookie.expires_datetime() {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX));
        at.unix_timestamp().saturating_sub(now)
    } else {
        return Lifetime::Session;
    };

    match u64::try_from(remaining) {
        Ok(secs) if secs > 0 => Instant::now()
            .checked_add(Duration::from_secs(secs))
            .map_or(Lifetime::Session, Lifetime::Until),
        _ => Lifetime::Expired,
    }
}

/// `request_host` equals `domain` or is a subdomain of it.
fn domain_matches(request_host: &str, domain: &str) -> bool {
    request_host == domain
        || request_host
            .strip_suffix(domain)
            .is_some_and(|prefix| prefix.ends_with('.'))
}

/// Directory of the request path, used when `Path` is absent.
fn default_path(uri: &Uri) -> String {
    let path = uri.path();
    match path.rfind('/') {
        Some(0) | None => "/".to_owned(),
        Some(end) => path[..end].to_owned(),
    }
}

fn path_matches(request_path: &str, cookie_path: &str) -> bool {
    request_path == cookie_path
        || request_path.strip_prefix(cookie_path).is_some_and(|rest| {
            cookie_path.ends_with('/') || rest.starts_with('/')
        })
}

/// Cookie store shared by every request of one transport.
#[derive(Debug, Default)]
pub(crate) struct CookieJar {
    /// Keyed by lowercased domain, without a leading dot
    domains: DashMap<String, Vec<StoredCookie>>,
}

impl CookieJar {
    /// Stores the `Set-Cookie` headers of a response to `uri`.
    pub(crate) fn store(&self, uri: &Uri, headers: &HeaderMap) {
        let Some(host) = uri.host().map(str::to_ascii_lowercase) else {
            return;
        };
        let https = uri.scheme_str() == Some("https");

        for raw in headers.get_all(header::SET_COOKIE) {
            let Ok(raw) = raw.to_str() else {
                tracing::debug!("ignoring non-UTF-8 Set-Cookie header");
                continue;
            };
            let cookie = match Cookie::parse(raw) {
                Ok(cookie) => cookie.into_owned(),
                Err(err) => {
                    tracing::debug!(error = %err, "ignoring malformed Set-Cookie header");
                    continue;
                }
            };

            let (domain, host_only) = match cookie.domain() {
                Some(domain) => {
                    let domain = domain.trim_start_matches('.').to_ascii_lowercase();
                    if !domain_matches(&host, &domain) {
                        tracing::debug!(name = cookie.name(), %domain, %host, "rejecting cookie for foreign domain");
                        continue;
                    }
                    (domain, false)
                }
                None => (host.clone(), true),
            };
            let secure = cookie.secure().unwrap_or(false);
            if secure && !https {
                tracing::debug!(name = cookie.name(), "ignoring secure cookie set over plain HTTP");
                continue;
            }
            let path = cookie
                .path()
                .filter(|path| path.starts_with('/'))
                .map_or_else(|| default_path(uri), str::to_owned);

            let mut entries = self.domains.entry(domain).or_default();
            entries.retain(|stored| stored.cookie.name() != cookie.name() || stored.path != path);
            let expires = match lifetime(&cookie) {
                Lifetime::Expired => continue,
                Lifetime::Session => None,
                Lifetime::Until(at) => Some(at),
            };
            entries.push(StoredCookie {
                cookie,
                path,
                host_only,
                secure,
                expires,
            });
        }
    }

    /// `Cookie` header value for a request to `uri`, if any cookie applies.
    pub(crate) fn header_for(&self, uri: &Uri) -> Option<HeaderValue> {
        let host = uri.host()?.to_ascii_lowercase();
        let https = uri.scheme_str() == Some("https");
        let now = Instant::now();

        let mut selected = Vec::new();
        let mut candidate = Some(host.as_str());
        while let Some(domain) = candidate {
            if let Some(mut entries) = self.domains.get_mut(domain) {
                entries.retain(|stored| !stored.is_expired(now));
                selected.extend(
                    entries
                        .iter()
                        .filter(|stored| !stored.host_only || domain == host)
                        .filter(|stored| https || !stored.secure)
                        .filter(|stored| path_matches(uri.path(), &stored.path))
                        .cloned(),
                );
            }
            candidate = domain.split_once('.').map(|(_, parent)| parent);
        }
        if selected.is_empty() {
            return None;
        }

        selected.sort_by_key(|stored| std::cmp::Reverse(stored.path.len()));
        let line = selected
            .iter()
            .map(|stored| format!("{}={}", stored.cookie.name(), stored.cookie.value()))
            .collect::<Vec<_>>()
            .join("; ");
        match HeaderValue::from_str(&line) {
            Ok(value) => Some(value),
            Err(err) => {
                tracing::warn!(error = %err, "failed to build Cookie header");
                None
            }
        }
    }
}

/// Layer that sends stored cookies and records the ones a response sets.
#[derive(Clone)]
pub(crate) struct CookieLayer {
    jar: Arc<CookieJar>,
}

impl CookieLayer {
    pub(crate) fn new(jar: Arc<CookieJar>) -> Self {
        Self { jar }
    }
}

impl<S> Layer<S> for CookieLayer {
    type Service = CookieService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        CookieService {
            inner,
            jar: Arc::clone(&self.jar),
        }
    }
}

#[derive(Clone)]
pub(crate) struct CookieService<S> {
    inner: S,
    jar: Arc<CookieJar>,
}

type CookieFuture<T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send>>;

async fn store_response_cookies<F, B, E>(jar: Arc<CookieJar>, uri: Uri, response: F) -> Result<Response<B>, E>
where
    F: Future<Output = Result<Response<B>, E>>,
{
    let response = response.await?;
    jar.store(&uri, response.headers());
    Ok(response)
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for CookieService<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>>,
    S::Future: Send + 'static,
    S::Error: 'static,
    ResBody: 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = CookieFuture<S::Response, S::Error>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<ReqBody>) -> Self::Future {
        let uri = req.uri().clone();
        if !req.headers().contains_key(header::COOKIE)
            && let Some(value) = self.jar.header_for(&uri)
        {
            req.headers_mut().insert(header::COOKIE, value);
        }

        let response = self.inner.call(req);
        Box::pin(store_response_cookies(Arc::clone(&self.jar), uri, response))
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use std::convert::Infallible;
    use tower::{ServiceExt, service_fn};

    fn set_cookies(values: &[&'static str]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for &value in values {
            headers.append(header::SET_COOKIE, HeaderValue::from_static(value));
        }
        headers
    }

    fn uri(s: &'static str) -> Uri {
        Uri::from_static(s)
    }

    #[test]
    fn test_store_and_send() {
        let jar = CookieJar::default();
        jar.store(
            &uri("http://Example.com/"),
            &set_cookies(&["session=abc; Path=/; HttpOnly", "theme=dark"]),
        );

        let header = jar.header_for(&uri("http://example.com/page")).unwrap();
        assert_eq!(header, "session=abc; theme=dark");
        assert!(jar.header_for(&uri("http://other.com/")).is_none());
    }

    #[test]
    fn test_path_scopes_cookie() {
        let jar = CookieJar::default();
        jar.store(
            &uri("http://example.com/"),
            &set_cookies(&["admin=1; Path=/admin", "all=1; Path=/"]),
        );

        assert_eq!(jar.header_for(&uri("http://example.com/public")).unwrap(), "all=1");
        assert_eq!(
            jar.header_for(&uri("http://example.com/admin/users")).unwrap(),
            "admin=1; all=1"
        );
        assert_eq!(jar.header_for(&uri("http://example.com/administrator")).unwrap(), "all=1");
    }

    #[test]
    fn test_default_path_is_request_directory() {
        let jar = CookieJar::default();
        jar.store(&uri("http://example.com/api/login"), &set_cookies(&["t=1"]));

        assert!(jar.header_for(&uri("http://example.com/api/items")).is_some());
        assert!(jar.header_for(&uri("http://example.com/other")).is_none());
    }

    #[test]
    fn test_secure_cookie_needs_https() {
        let jar = CookieJar::default();
        jar.store(&uri("http://example.com/"), &set_cookies(&["plain=1; Secure"]));
        assert!(jar.header_for(&uri("https://example.com/")).is_none());

        jar.store(&uri("https://example.com/"), &set_cookies(&["s=1; Secure"]));
        assert!(jar.header_for(&uri("http://example.com/")).is_none());
        assert_eq!(jar.header_for(&uri("https://example.com/")).unwrap(), "s=1");
    }

    #[test]
    fn test_domain_attribute_covers_subdomains() {
        let jar = CookieJar::default();
        jar.store(
            &uri("http://api.example.com/"),
            &set_cookies(&["wide=1; Domain=.example.com", "narrow=1"]),
        );

        assert_eq!(jar.header_for(&uri("http://www.example.com/")).unwrap(), "wide=1");
        assert!(jar.header_for(&uri("http://notexample.com/")).is_none());
        let api = jar.header_for(&uri("http://api.example.com/")).unwrap();
        assert!(api.to_str().unwrap().contains("narrow=1"));
    }

    #[test]
    fn test_foreign_domain_rejected() {
        let jar = CookieJar::default();
        jar.store(&uri("http://example.com/"), &set_cookies(&["x=1; Domain=other.com"]));
        assert!(jar.header_for(&uri("http://other.com/")).is_none());
    }

    #[test]
    fn test_expiry_deletes() {
        let jar = CookieJar::default();
        jar.store(&uri("http://example.com/"), &set_cookies(&["session=abc"]));
        jar.store(&uri("http://example.com/"), &set_cookies(&["session=; Max-Age=0"]));
        assert!(jar.header_for(&uri("http://example.com/")).is_none());

        jar.store(
            &uri("http://example.com/"),
            &set_cookies(&["old=1; Expires=Thu, 01 Jan 1970 00:00:01 GMT", "fresh=1; Max-Age=3600"]),
        );
        assert_eq!(jar.header_for(&uri("http://example.com/")).unwrap(), "fresh=1");
    }

    #[test]
    fn test_malformed_cookie_ignored() {
        let jar = CookieJar::default();
        jar.store(&uri("http://example.com/"), &set_cookies(&["novalue", "=x"]));
        assert!(jar.header_for(&uri("http://example.com/")).is_none());
    }

    #[tokio::test]
    async fn test_layer_round_trips_cookies() {
        let jar = Arc::new(CookieJar::default());
        let service = CookieLayer::new(Arc::clone(&jar)).layer(service_fn(|req: Request<()>| async move {
            let mut response = Response::new(req.headers().get(header::COOKIE).cloned());
            response
                .headers_mut()
                .insert(header::SET_COOKIE, HeaderValue::from_static("id=7"));
            Ok::<_, Infallible>(response)
        }));

        let first = service
            .clone()
            .oneshot(Request::get("http://example.com/").body(()).unwrap())
            .await
            .unwrap();
        assert!(first.body().is_none());

        let second = service
            .clone()
            .oneshot(Request::get("http://example.com/").body(()).unwrap())
            .await
            .unwrap();
        assert_eq!(second.body().as_ref().unwrap(), "id=7");

        let explicit = service
            .oneshot(
                Request::get("http://example.com/")
                    .header(header::COOKIE, "mine=1")
                    .body(())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(explicit.body().as_ref().unwrap(), "mine=1");
    }
}

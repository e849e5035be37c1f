//! Redirect policy for [`tower_http::follow_redirect::FollowRedirect`].
//!
//! - 303 continues as `GET` without a body (`HEAD` stays `HEAD`), so do
//!   `POST` requests answered with 301 or 302
//! - 307 and 308 replay the original method and body
//! - `Authorization`, `Cookie` and `Proxy-Authorization` are dropped once a
//!   hop leaves the original origin
//! - HTTPS to HTTP downgrades are not followed; the redirect response is
//!   returned as is
//! - more than `max_redirects` hops fail with [`RestError::TooManyRedirects`]

use http::{Method, Request, Uri, header};
use tower_http::follow_redirect::policy::{Action, Attempt, Policy};

use super::pool::RouteKey;
use crate::error::RestError;

const SENSITIVE_HEADERS: &[header::HeaderName] = &[
    header::AUTHORIZATION,
    header::COOKIE,
    header::PROXY_AUTHORIZATION,
];

const BODY_HEADERS: &[header::HeaderName] = &[
    header::CONTENT_TYPE,
    header::CONTENT_LENGTH,
    header::CONTENT_ENCODING,
    header::TRANSFER_ENCODING,
];

/// Per-request redirect state; `FollowRedirect` clones it for every call.
#[derive(Debug, Clone)]
pub(crate) struct RedirectPolicy {
    max_redirects: usize,
    followed: usize,
    cross_origin: bool,
    /// Method of the last request sent, `None` before the first one
    method: Option<Method>,
}

impl RedirectPolicy {
    pub(crate) fn new(max_redirects: usize) -> Self {
        Self {
            max_redirects,
            followed: 0,
            cross_origin: false,
            method: None,
        }
    }

    fn is_same_origin(a: &Uri, b: &Uri) -> bool {
        match (RouteKey::from_uri(a), RouteKey::from_uri(b)) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        }
    }

    fn is_https_downgrade(from: &Uri, to: &Uri) -> bool {
        from.scheme_str() == Some("https") && to.scheme_str() == Some("http")
    }
}

impl<B> Policy<B, RestError> for RedirectPolicy
where
    B: Clone,
{
    fn redirect(&mut self, attempt: &Attempt<'_>) -> Result<Action, RestError> {
        let previous = attempt.previous();
        let target = attempt.location();

        if Self::is_https_downgrade(previous, target) {
            tracing::warn!(from = %previous, to = %target, "not following HTTPS to HTTP redirect");
            return Ok(Action::Stop);
        }

        self.followed += 1;
        if self.followed > self.max_redirects {
            return Err(RestError::TooManyRedirects(self.max_redirects));
        }

        if !Self::is_same_origin(previous, target) {
            self.cross_origin = true;
        }
        tracing::debug!(
            status = attempt.status().as_u16(),
            to = %target,
            hop = self.followed,
            "following redirect"
        );
        Ok(Action::Follow)
    }

    fn on_request(&mut self, request: &mut Request<B>) {
        let headers = request.headers_mut();
        if let Some(previous) = &self.method {
            headers.remove(header::HOST);
            if previous != request.method() {
                for name in BODY_HEADERS {
                    headers.remove(name);
                }
            }
        }
        if self.cross_origin {
            for name in SENSITIVE_HEADERS {
                if headers.remove(name).is_some() {
                    tracing::debug!(header = %name, "stripped sensitive header on cross-origin redirect");
                }
            }
        }
        self.method = Some(request.method().clone());
    }

    fn clone_body(&self, body: &B) -> Option<B> {
        Some(body.clone())
    }
}

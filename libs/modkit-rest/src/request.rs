//! Request description and the fluent [`RequestBuilder`].
//!
//! A builder collects the method, URL template, headers, query string and
//! body of one call, then hands a [`RequestDescriptor`] to the engine when a
//! terminal method runs. Terminal methods come in blocking (`as_string`,
//! `as_object`, ...), asynchronous (`as_string_async`, ...) and streaming
//! (`as_stream`) flavours; each picks the body format of the response.

use std::fmt;
use std::io::Read;
use std::path::PathBuf;
use std::sync::LazyLock;

use base64::Engine;
use bytes::Bytes;
use http::header::{AUTHORIZATION, CONTENT_TYPE, HeaderName, HeaderValue};
use regex::Regex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::body::{Body, FormBody, FormValue, MultipartBody, Part, RawBody};
use crate::client::RestClient;
use crate::engine;
use crate::error::RestError;
use crate::headers::Headers;
use crate::mapper::write_from;
use crate::media_type::MediaType;
use crate::response::{Binary, BodyFormat, HttpResponse, JsonTree, Object, StreamResponse, Text};
use crate::task::{AsyncTask, Callback, Hooks};

#[allow(clippy::expect_used)] // good regex, it doesn't panic
static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{([^{}/?#]+)\}").expect("static regex should not panic")
});

/// HTTP method supported by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Patch,
    Delete,
    Options,
}

impl Method {
    /// Equivalent [`http::Method`].
    #[must_use]
    pub fn as_http(self) -> http::Method {
        match self {
            Self::Get => http::Method::GET,
            Self::Head => http::Method::HEAD,
            Self::Post => http::Method::POST,
            Self::Put => http::Method::PUT,
            Self::Patch => http::Method::PATCH,
            Self::Delete => http::Method::DELETE,
            Self::Options => http::Method::OPTIONS,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Head => "HEAD",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
            Self::Options => "OPTIONS",
        }
    }

    /// `GET` and `HEAD` never carry a body.
    #[must_use]
    pub fn permits_body(self) -> bool {
        !matches!(self, Self::Get | Self::Head)
    }

    /// Whether repeating the request has no further effect. Only idempotent
    /// requests are retried after a transport error.
    #[must_use]
    pub fn is_idempotent(self) -> bool {
        !matches!(self, Self::Post | Self::Patch)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything needed to dispatch one request.
///
/// The URL is kept as a template relative to the client's base URL; route
/// parameters are substituted eagerly, query parameters are appended by
/// [`RequestDescriptor::resolve_url`].
#[derive(Debug)]
pub struct RequestDescriptor {
    pub(crate) method: Method,
    pub(crate) url: String,
    pub(crate) query: Vec<(String, String)>,
    pub(crate) headers: Headers,
    pub(crate) body: Option<Body>,
}

impl RequestDescriptor {
    #[must_use]
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            query: Vec::new(),
            headers: Headers::new(),
            body: None,
        }
    }

    #[must_use]
    pub fn method(&self) -> Method {
        self.method
    }

    /// URL template as given, with route parameters substituted so far.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    #[must_use]
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    #[must_use]
    pub fn body(&self) -> Option<&Body> {
        self.body.as_ref()
    }

    /// Replaces `{name}` with the percent-encoded `value`.
    ///
    /// # Errors
    ///
    /// Returns [`RestError::UnknownRouteParameter`] if the URL has no such
    /// placeholder.
    pub fn substitute(&mut self, name: &str, value: &str) -> Result<(), RestError> {
        let placeholder = format!("{{{name}}}");
        if !self.url.contains(&placeholder) {
            return Err(RestError::UnknownRouteParameter {
                name: name.to_owned(),
                url: self.url.clone(),
            });
        }
        self.url = self
            .url
            .replace(&placeholder, &urlencoding::encode(value));
        Ok(())
    }

    /// Absolute URL: `base` followed by the path, with query parameters
    /// form-encoded and appended.
    ///
    /// # Errors
    ///
    /// Returns [`RestError::MissingRouteParameter`] if a `{name}` placeholder
    /// was never substituted.
    pub fn resolve_url(&self, base: &str) -> Result<String, RestError> {
        let mut url = format!("{base}{}", self.url);
        if let Some(name) = PLACEHOLDER
            .captures(&url)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_owned())
        {
            return Err(RestError::MissingRouteParameter { name, url });
        }

        for (name, value) in &self.query {
            url.push(if url.contains('?') { '&' } else { '?' });
            url.extend(url::form_urlencoded::byte_serialize(name.as_bytes()));
            url.push('=');
            url.extend(url::form_urlencoded::byte_serialize(value.as_bytes()));
        }
        Ok(url)
    }
}

/// Fluent builder for one request, created by [`RestClient`].
///
/// Invalid input (a bad header, an unknown route parameter) is remembered and
/// reported by the terminal call, so chains never need intermediate `?`.
///
/// ```ignore
/// let user: User = client
///     .get("/users/{id}")
///     .route_param("id", 42)
///     .query_string("expand", "roles")
///     .as_object::<User>()?
///     .body()?
///     .clone();
/// ```
#[must_use = "RequestBuilder does nothing until a terminal method such as .as_string() is called"]
pub struct RequestBuilder {
    client: RestClient,
    descriptor: RequestDescriptor,
    error: Option<RestError>,
}

impl fmt::Debug for RequestBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestBuilder")
            .field("client_id", &self.client.id())
            .field("descriptor", &self.descriptor)
            .field("error", &self.error)
            .finish()
    }
}

impl RequestBuilder {
    pub(crate) fn new(client: RestClient, method: Method, url: impl Into<String>) -> Self {
        Self {
            client,
            descriptor: RequestDescriptor::new(method, url),
            error: None,
        }
    }

    fn defer(&mut self, err: RestError) {
        if self.error.is_none() {
            self.error = Some(err);
        }
    }

    /// Appends a header value; earlier values under the same name are kept.
    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        if self.error.is_some() {
            return self;
        }
        let value = value.into();
        if let Err(e) = HeaderName::try_from(name) {
            self.defer(RestError::InvalidHeaderName(e));
        } else if let Err(e) = HeaderValue::try_from(value.as_str()) {
            self.defer(RestError::InvalidHeaderValue(e));
        } else {
            self.descriptor.headers.add(name, value);
        }
        self
    }

    pub fn headers<I, K, V>(mut self, headers: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        for (name, value) in headers {
            self = self.header(name.as_ref(), value);
        }
        self
    }

    /// Sets `Content-Type`. A bare extension such as `"json"` is looked up in
    /// the mime table.
    pub fn content_type(mut self, value: &str) -> Self {
        let resolved = if value.contains('/') {
            value.to_owned()
        } else {
            MediaType::parse(value).map_or_else(|_| value.to_owned(), |mt| mt.to_string())
        };
        self.descriptor.headers.remove(CONTENT_TYPE.as_str());
        self.header(CONTENT_TYPE.as_str(), resolved)
    }

    /// `Authorization: Basic base64(username:password)`.
    pub fn basic_auth(mut self, username: &str, password: &str) -> Self {
        let token = base64::engine::general_purpose::STANDARD.encode(format!("{username}:{password}"));
        self.descriptor.headers.remove(AUTHORIZATION.as_str());
        self.header(AUTHORIZATION.as_str(), format!("Basic {token}"))
    }

    /// Substitutes the `{name}` placeholder with the percent-encoded value.
    pub fn route_param(mut self, name: &str, value: impl fmt::Display) -> Self {
        if self.error.is_none()
            && let Err(err) = self.descriptor.substitute(name, &value.to_string())
        {
            self.defer(err);
        }
        self
    }

    pub fn query_string(mut self, name: impl Into<String>, value: impl fmt::Display) -> Self {
        self.descriptor.query.push((name.into(), value.to_string()));
        self
    }

    pub fn query_strings<I, K, V>(mut self, params: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: fmt::Display,
    {
        self.descriptor
            .query
            .extend(params.into_iter().map(|(k, v)| (k.into(), v.to_string())));
        self
    }

    fn take_form(&mut self) -> FormBody {
        if let Some(Body::Form(form)) = self.descriptor.body.take() {
            form
        } else {
            FormBody::new()
        }
    }

    fn take_multipart(&mut self) -> MultipartBody {
        if let Some(Body::Multipart(multipart)) = self.descriptor.body.take() {
            multipart
        } else {
            MultipartBody::new()
        }
    }

    /// Adds a form field, switching the body to form encoding.
    pub fn field(mut self, name: impl Into<String>, value: impl Into<FormValue>) -> Self {
        let mut form = self.take_form();
        form.push(name.into(), value.into());
        self.descriptor.body = Some(form.into());
        self
    }

    pub fn fields<I, K, V>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<FormValue>,
    {
        let mut form = self.take_form();
        for (name, value) in fields {
            form.push(name.into(), value.into());
        }
        self.descriptor.body = Some(form.into());
        self
    }

    /// Adds every member of a JSON object as form fields.
    ///
    /// # Errors
    ///
    /// Returns [`RestError::InvalidFormValue`] for nested objects or
    /// non-object input.
    pub fn fields_json(mut self, fields: &Value) -> Result<Self, RestError> {
        let form = self.take_form().fields_json(fields)?;
        self.descriptor.body = Some(form.into());
        Ok(self)
    }

    /// Adds a multipart part, switching the body to `multipart/form-data`.
    pub fn part(mut self, part: Part) -> Self {
        let mut multipart = self.take_multipart();
        multipart.push(part);
        self.descriptor.body = Some(multipart.into());
        self
    }

    pub fn part_text(self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.part(Part::text(name, value))
    }

    pub fn part_file(self, name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        self.part(Part::file(name, path))
    }

    pub fn part_bytes(
        self,
        name: impl Into<String>,
        bytes: impl Into<Bytes>,
        filename: impl Into<String>,
    ) -> Self {
        self.part(Part::bytes(name, bytes, filename))
    }

    pub fn part_stream(
        self,
        name: impl Into<String>,
        reader: impl Read + Send + 'static,
        filename: impl Into<String>,
    ) -> Self {
        self.part(Part::stream(name, reader, filename))
    }

    /// Sends the bytes as-is; set `Content-Type` separately.
    pub fn body_bytes(mut self, bytes: impl Into<Bytes>) -> Self {
        self.descriptor.body = Some(Body::Raw(RawBody::new(bytes)));
        self
    }

    pub fn body_string(self, body: impl Into<String>) -> Self {
        self.body_bytes(body.into())
    }

    /// Sends a JSON document, defaulting `Content-Type` to `application/json`.
    ///
    /// # Errors
    ///
    /// Returns [`RestError::Mapping`] if the value cannot be serialized.
    pub fn body_json(mut self, json: &Value) -> Result<Self, RestError> {
        let text = serde_json::to_string(json)?;
        if !self.descriptor.headers.contains(CONTENT_TYPE.as_str()) {
            self.descriptor
                .headers
                .set(CONTENT_TYPE.as_str(), MediaType::APPLICATION_JSON.to_string());
        }
        Ok(self.body_string(text))
    }

    /// Serializes `value` with the mapper registered for the request's
    /// `Content-Type`.
    ///
    /// # Errors
    ///
    /// Returns [`RestError::NoContentType`] if no `Content-Type` is set,
    /// [`RestError::NoMapperFound`] if no mapper matches it, or
    /// [`RestError::Mapping`] if serialization fails.
    pub fn body_object<T: Serialize + ?Sized>(self, value: &T) -> Result<Self, RestError> {
        let content_type = self
            .descriptor
            .headers
            .get_first(CONTENT_TYPE.as_str())
            .ok_or(RestError::NoContentType)?;
        let mapper = self
            .client
            .mappers()
            .resolve(&MediaType::parse(content_type)?)?;
        let text = write_from(mapper.as_ref(), value)?;
        Ok(self.body_string(text))
    }

    fn finish(self) -> Result<(RestClient, RequestDescriptor), RestError> {
        match self.error {
            Some(err) => Err(err),
            None => Ok((self.client, self.descriptor)),
        }
    }

    /// Executes the request on the calling thread, materializing the body as `F`.
    ///
    /// # Errors
    ///
    /// Returns deferred builder errors, configuration errors, or the
    /// transport failure.
    pub fn send<F: BodyFormat>(self) -> Result<HttpResponse<F>, RestError> {
        let (client, descriptor) = self.finish()?;
        engine::execute_blocking(client.inner(), descriptor)
    }

    /// # Errors
    ///
    /// See [`RequestBuilder::send`].
    pub fn as_string(self) -> Result<HttpResponse<Text>, RestError> {
        self.send()
    }

    /// # Errors
    ///
    /// See [`RequestBuilder::send`].
    pub fn as_json(self) -> Result<HttpResponse<JsonTree>, RestError> {
        self.send()
    }

    /// # Errors
    ///
    /// See [`RequestBuilder::send`].
    pub fn as_binary(self) -> Result<HttpResponse<Binary>, RestError> {
        self.send()
    }

    /// # Errors
    ///
    /// See [`RequestBuilder::send`].
    pub fn as_object<T>(self) -> Result<HttpResponse<Object<T>>, RestError>
    where
        T: DeserializeOwned + Send + Sync + 'static,
    {
        self.send()
    }

    /// Executes the request and hands the body over unread. The connection
    /// stays checked out until the stream is closed or dropped.
    ///
    /// # Errors
    ///
    /// See [`RequestBuilder::send`].
    pub fn as_stream(self) -> Result<StreamResponse, RestError> {
        let (client, descriptor) = self.finish()?;
        engine::execute_stream(client.inner(), descriptor)
    }

    /// Executes the request on the async transport.
    pub fn send_async<F: BodyFormat>(self) -> AsyncTask<HttpResponse<F>> {
        match self.finish() {
            Ok((client, descriptor)) => engine::execute_async(client.inner(), descriptor),
            Err(err) => AsyncTask::failed(err),
        }
    }

    pub fn as_string_async(self) -> AsyncTask<HttpResponse<Text>> {
        self.send_async()
    }

    pub fn as_json_async(self) -> AsyncTask<HttpResponse<JsonTree>> {
        self.send_async()
    }

    pub fn as_binary_async(self) -> AsyncTask<HttpResponse<Binary>> {
        self.send_async()
    }

    pub fn as_object_async<T>(self) -> AsyncTask<HttpResponse<Object<T>>>
    where
        T: DeserializeOwned + Send + Sync + 'static,
    {
        self.send_async()
    }

    /// Executes the request on the async transport and reports the outcome
    /// through `hooks`. The returned task only tracks delivery.
    pub fn execute_async_with<F: BodyFormat>(self, hooks: Hooks<HttpResponse<F>>) -> AsyncTask<()> {
        match self.finish() {
            Ok((client, descriptor)) => engine::execute_async_with(client.inner(), descriptor, hooks),
            Err(err) => {
                hooks.fail(err);
                AsyncTask::ready(Ok(()))
            }
        }
    }

    pub fn execute_async_callback<F, C>(self, callback: C) -> AsyncTask<()>
    where
        F: BodyFormat,
        C: Callback<HttpResponse<F>>,
    {
        self.execute_async_with(Hooks::from_callback(callback))
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn test_method_properties() {
        assert!(!Method::Get.permits_body());
        assert!(!Method::Head.permits_body());
        assert!(Method::Delete.permits_body());
        assert!(Method::Put.is_idempotent());
        assert!(!Method::Post.is_idempotent());
        assert!(!Method::Patch.is_idempotent());
        assert_eq!(Method::Options.as_http(), http::Method::OPTIONS);
        assert_eq!(Method::Patch.to_string(), "PATCH");
    }

    #[test]
    fn test_substitute_encodes_value() {
        let mut descriptor = RequestDescriptor::new(Method::Get, "/echo/{name}/{name}");
        descriptor.substitute("name", "a b/c").unwrap();
        assert_eq!(descriptor.url(), "/echo/a%20b%2Fc/a%20b%2Fc");
    }

    #[test]
    fn test_substitute_unknown_placeholder() {
        let mut descriptor = RequestDescriptor::new(Method::Get, "/echo/{name}");
        let err = descriptor.substitute("other", "x").unwrap_err();
        assert!(matches!(err, RestError::UnknownRouteParameter { name, .. } if name == "other"));
    }

    #[test]
    fn test_resolve_url_detects_missing_placeholder() {
        let descriptor = RequestDescriptor::new(Method::Get, "/echo/{name}");
        let err = descriptor.resolve_url("http://localhost").unwrap_err();
        assert!(matches!(err, RestError::MissingRouteParameter { name, .. } if name == "name"));
    }

    #[test]
    fn test_resolve_url_appends_query() {
        let mut descriptor = RequestDescriptor::new(Method::Get, "/search");
        descriptor.query.push(("q".to_owned(), "a b&c".to_owned()));
        descriptor.query.push(("page".to_owned(), "2".to_owned()));
        assert_eq!(
            descriptor.resolve_url("http://localhost").unwrap(),
            "http://localhost/search?q=a+b%26c&page=2"
        );

        let mut with_query = RequestDescriptor::new(Method::Get, "/search?fixed=1");
        with_query.query.push(("q".to_owned(), "x".to_owned()));
        assert_eq!(
            with_query.resolve_url("").unwrap(),
            "/search?fixed=1&q=x"
        );
    }
}

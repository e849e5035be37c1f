//! Response decoding.
//!
//! The body of a buffered response is read exactly once, gunzipped when the
//! server says so, and kept as bytes in a [`ResponseEnvelope`]. Typed views
//! ([`Text`], [`JsonTree`], [`Binary`], [`Object`]) are materialized lazily
//! by [`HttpResponse::body`] and cached.

use std::fmt;
use std::io::{Cursor, Read};
use std::marker::PhantomData;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use encoding_rs::{Encoding, UTF_8};
use flate2::read::GzDecoder;
use http::header::{CONTENT_ENCODING, CONTENT_TYPE};
use http_body_util::BodyExt;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use tokio::runtime::Handle;

use crate::error::RestError;
use crate::headers::Headers;
use crate::json::Json;
use crate::mapper::{MapperRegistry, read_as};
use crate::media_type::MediaType;
use crate::transport::{Lease, RawResponse, ResponseBody};

const STATUS_NOT_SET: i32 = -1;
const STATUS_TEXT_NOT_SET: &str = "NOT_SET";

/// Buffered response: status, headers and the decoded body bytes.
#[derive(Debug)]
pub struct ResponseEnvelope {
    status: i32,
    status_text: String,
    headers: Headers,
    body: Option<Bytes>,
    mappers: Arc<MapperRegistry>,
}

impl ResponseEnvelope {
    /// Status code, or `-1` when the transport reported none.
    #[must_use]
    pub fn status(&self) -> i32 {
        self.status
    }

    /// Reason phrase, or `"NOT_SET"` when the transport reported none.
    #[must_use]
    pub fn status_text(&self) -> &str {
        &self.status_text
    }

    #[must_use]
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// 2xx or 304.
    #[must_use]
    pub fn is_successful(&self) -> bool {
        (200..300).contains(&self.status) || self.status == 304
    }

    /// Decoded body bytes; `None` when the response carried no body.
    #[must_use]
    pub fn bytes(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }

    /// A fresh reader over the body on every call.
    #[must_use]
    pub fn raw_body(&self) -> Cursor<Bytes> {
        Cursor::new(self.body.clone().unwrap_or_default())
    }

    /// `Content-Type` of the response, if present.
    ///
    /// # Errors
    ///
    /// Returns [`RestError::InvalidMediaType`] for an unparsable header.
    pub fn content_type(&self) -> Result<Option<MediaType>, RestError> {
        self.headers
            .get_first(CONTENT_TYPE.as_str())
            .map(MediaType::parse)
            .transpose()
    }

    /// Body decoded with the `charset` of `Content-Type`, UTF-8 when absent
    /// or unknown.
    #[must_use]
    pub fn text(&self) -> String {
        let Some(bytes) = &self.body else {
            return String::new();
        };
        let charset = self
            .content_type()
            .ok()
            .flatten()
            .and_then(|mt| mt.charset().map(str::to_owned));
        decode_text(bytes, charset.as_deref())
    }

    /// Body parsed as a JSON tree; an empty body yields `{}`.
    ///
    /// # Errors
    ///
    /// Returns [`RestError::Mapping`] if the body is not valid JSON.
    pub fn json(&self) -> Result<Json, RestError> {
        Json::parse(&self.text())
    }

    /// Body deserialized with the mapper registered for `Content-Type`.
    ///
    /// # Errors
    ///
    /// Returns [`RestError::NoContentType`] if the response has no
    /// `Content-Type`, [`RestError::NoMapperFound`] if no mapper is compatible
    /// with it, or [`RestError::Mapping`] if deserialization fails.
    pub fn body_as<T: DeserializeOwned>(&self) -> Result<T, RestError> {
        let media_type = self.content_type()?.ok_or(RestError::NoContentType)?;
        let mapper = self.mappers.resolve(&media_type)?;
        read_as(mapper.as_ref(), &self.text())
    }
}

/// Decodes with the WHATWG encoding registered for `charset`; a missing or
/// unknown label falls back to UTF-8. Malformed sequences become U+FFFD.
fn decode_text(bytes: &[u8], charset: Option<&str>) -> String {
    let encoding = charset
        .and_then(|label| Encoding::for_label(label.trim().as_bytes()))
        .unwrap_or(UTF_8);
    let (text, _, malformed) = encoding.decode(bytes);
    if malformed {
        tracing::debug!(encoding = encoding.name(), "response body contained malformed sequences");
    }
    text.into_owned()
}

fn is_gzip(headers: &Headers) -> bool {
    headers.get_all(CONTENT_ENCODING.as_str()).iter().any(|value| {
        value
            .split(',')
            .map(str::trim)
            .any(|coding| coding.eq_ignore_ascii_case("gzip") || coding.eq_ignore_ascii_case("x-gzip"))
    })
}

fn gunzip(bytes: &[u8]) -> Result<Bytes, RestError> {
    let mut decoded = Vec::with_capacity(bytes.len().saturating_mul(2));
    GzDecoder::new(bytes).read_to_end(&mut decoded)?;
    Ok(Bytes::from(decoded))
}

async fn next_data(body: &mut ResponseBody, read_timeout: Option<Duration>) -> Result<Option<Bytes>, RestError> {
    loop {
        let frame = match read_timeout {
            Some(limit) => tokio::time::timeout(limit, body.frame())
                .await
                .map_err(|_| RestError::Timeout(limit))?,
            None => body.frame().await,
        };
        match frame {
            None => return Ok(None),
            Some(Err(err)) => return Err(RestError::Transport(err)),
            Some(Ok(frame)) => {
                if let Ok(data) = frame.into_data() {
                    return Ok(Some(data));
                }
            }
        }
    }
}

async fn collect(mut body: ResponseBody, read_timeout: Option<Duration>) -> Result<Bytes, RestError> {
    let mut buffer = BytesMut::new();
    while let Some(chunk) = next_data(&mut body, read_timeout).await? {
        buffer.extend_from_slice(&chunk);
    }
    Ok(buffer.freeze())
}

/// Buffers a transport response.
///
/// The connection lease is returned on every path; it is only reusable when
/// the body was read to the end.
pub(crate) async fn decode(raw: RawResponse, mappers: Arc<MapperRegistry>) -> Result<ResponseEnvelope, RestError> {
    let RawResponse {
        status,
        headers,
        body,
        lease,
        read_timeout,
    } = raw;

    let (status, status_text) = match status {
        Some(line) => (i32::from(line.code.as_u16()), line.reason),
        None => (STATUS_NOT_SET, STATUS_TEXT_NOT_SET.to_owned()),
    };
    let headers = Headers::from_header_map(&headers);

    let collected = match body {
        Some(body) => collect(body, read_timeout).await.map(Some),
        None => Ok(None),
    };
    if let Some(lease) = lease {
        lease.release();
    }

    let body = match collected? {
        Some(bytes) if !bytes.is_empty() && is_gzip(&headers) => Some(gunzip(&bytes)?),
        other => other,
    };

    tracing::trace!(status, body_len = body.as_ref().map_or(0, Bytes::len), "response decoded");
    Ok(ResponseEnvelope {
        status,
        status_text,
        headers,
        body,
        mappers,
    })
}

/// How a response body is materialized.
pub trait BodyFormat: Send + Sync + 'static {
    type Output: Send + Sync + 'static;

    /// # Errors
    ///
    /// Returns the decoding or mapping failure.
    fn materialize(envelope: &ResponseEnvelope) -> Result<Self::Output, RestError>;
}

/// Body as a `String`.
#[derive(Debug)]
pub struct Text;

impl BodyFormat for Text {
    type Output = String;

    fn materialize(envelope: &ResponseEnvelope) -> Result<String, RestError> {
        Ok(envelope.text())
    }
}

/// Body as a [`Json`] tree.
#[derive(Debug)]
pub struct JsonTree;

impl BodyFormat for JsonTree {
    type Output = Json;

    fn materialize(envelope: &ResponseEnvelope) -> Result<Json, RestError> {
        envelope.json()
    }
}

/// Body as bytes.
#[derive(Debug)]
pub struct Binary;

impl BodyFormat for Binary {
    type Output = Bytes;

    fn materialize(envelope: &ResponseEnvelope) -> Result<Bytes, RestError> {
        Ok(envelope.bytes().cloned().unwrap_or_default())
    }
}

/// Body deserialized into `T` through the mapper registry.
pub struct Object<T>(PhantomData<fn() -> T>);

impl<T> fmt::Debug for Object<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(std::any::type_name::<T>())
    }
}

impl<T: DeserializeOwned + Send + Sync + 'static> BodyFormat for Object<T> {
    type Output = T;

    fn materialize(envelope: &ResponseEnvelope) -> Result<T, RestError> {
        envelope.body_as()
    }
}

struct Inner<F: BodyFormat> {
    envelope: ResponseEnvelope,
    body: OnceLock<F::Output>,
    init: Mutex<()>,
}

/// Buffered response with a lazily materialized, cached body of format `F`.
///
/// Clones share the envelope and the cached body.
pub struct HttpResponse<F: BodyFormat> {
    inner: Arc<Inner<F>>,
}

impl<F: BodyFormat> Clone for HttpResponse<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<F: BodyFormat> fmt::Debug for HttpResponse<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpResponse")
            .field("status", &self.inner.envelope.status)
            .field("status_text", &self.inner.envelope.status_text)
            .field("headers", &self.inner.envelope.headers)
            .field("materialized", &self.inner.body.get().is_some())
            .finish()
    }
}

impl<F: BodyFormat> HttpResponse<F> {
    pub(crate) fn new(envelope: ResponseEnvelope) -> Self {
        Self {
            inner: Arc::new(Inner {
                envelope,
                body: OnceLock::new(),
                init: Mutex::new(()),
            }),
        }
    }

    #[must_use]
    pub fn envelope(&self) -> &ResponseEnvelope {
        &self.inner.envelope
    }

    #[must_use]
    pub fn status(&self) -> i32 {
        self.inner.envelope.status()
    }

    #[must_use]
    pub fn status_text(&self) -> &str {
        self.inner.envelope.status_text()
    }

    #[must_use]
    pub fn headers(&self) -> &Headers {
        self.inner.envelope.headers()
    }

    #[must_use]
    pub fn is_successful(&self) -> bool {
        self.inner.envelope.is_successful()
    }

    #[must_use]
    pub fn raw_body(&self) -> Cursor<Bytes> {
        self.inner.envelope.raw_body()
    }

    /// Body decoded as text, independent of `F`.
    #[must_use]
    pub fn as_string(&self) -> String {
        self.inner.envelope.text()
    }

    /// Body deserialized into any `T`, independent of `F` and not cached.
    ///
    /// # Errors
    ///
    /// See [`ResponseEnvelope::body_as`].
    pub fn body_as<T: DeserializeOwned>(&self) -> Result<T, RestError> {
        self.inner.envelope.body_as()
    }

    /// Typed body, materialized on first call and cached afterwards.
    ///
    /// # Errors
    ///
    /// Returns the materialization failure; failures are not cached.
    pub fn body(&self) -> Result<&F::Output, RestError> {
        if let Some(body) = self.inner.body.get() {
            return Ok(body);
        }
        let _guard = self.inner.init.lock();
        if let Some(body) = self.inner.body.get() {
            return Ok(body);
        }
        let value = F::materialize(&self.inner.envelope)?;
        Ok(self.inner.body.get_or_init(|| value))
    }
}

/// Unbuffered response; the body is pulled from the connection on demand.
///
/// The pooled connection stays checked out until the stream is read to the
/// end and closed, or dropped. A stream closed before its end discards the
/// connection.
pub struct StreamResponse {
    status: i32,
    status_text: String,
    headers: Headers,
    body: Option<ResponseBody>,
    lease: Option<Lease>,
    read_timeout: Option<Duration>,
    handle: Handle,
    pending: Bytes,
    finished: bool,
}

impl fmt::Debug for StreamResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamResponse")
            .field("status", &self.status)
            .field("status_text", &self.status_text)
            .field("headers", &self.headers)
            .field("open", &self.body.is_some())
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl StreamResponse {
    pub(crate) fn new(raw: RawResponse, handle: Handle) -> Self {
        let RawResponse {
            status,
            headers,
            body,
            lease,
            read_timeout,
        } = raw;
        let (status, status_text) = match status {
            Some(line) => (i32::from(line.code.as_u16()), line.reason),
            None => (STATUS_NOT_SET, STATUS_TEXT_NOT_SET.to_owned()),
        };
        let finished = body.is_none();
        Self {
            status,
            status_text,
            headers: Headers::from_header_map(&headers),
            body,
            lease,
            read_timeout,
            handle,
            pending: Bytes::new(),
            finished,
        }
    }

    #[must_use]
    pub fn status(&self) -> i32 {
        self.status
    }

    #[must_use]
    pub fn status_text(&self) -> &str {
        &self.status_text
    }

    #[must_use]
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    #[must_use]
    pub fn is_gzip(&self) -> bool {
        is_gzip(&self.headers)
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.body.is_none() && self.lease.is_none()
    }

    /// Next chunk of raw body bytes; `None` at the end of the body.
    ///
    /// # Errors
    ///
    /// Returns [`RestError::Timeout`] or [`RestError::Transport`]; the stream
    /// is closed afterwards.
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>, RestError> {
        if !self.pending.is_empty() {
            return Ok(Some(std::mem::take(&mut self.pending)));
        }
        let Some(body) = self.body.as_mut() else {
            return Ok(None);
        };
        match next_data(body, self.read_timeout).await {
            Ok(Some(chunk)) => Ok(Some(chunk)),
            Ok(None) => {
                self.finished = true;
                self.close();
                Ok(None)
            }
            Err(err) => {
                self.close();
                Err(err)
            }
        }
    }

    /// Reader that gunzips the body when `Content-Encoding` says so.
    #[must_use]
    pub fn decoded_reader(self) -> Box<dyn Read + Send> {
        if self.is_gzip() {
            Box::new(GzDecoder::new(self))
        } else {
            Box::new(self)
        }
    }

    /// Releases the connection. Idempotent.
    pub fn close(&mut self) {
        self.body = None;
        if let Some(lease) = self.lease.take() {
            lease.release();
            tracing::trace!(finished = self.finished, "stream response closed");
        }
    }
}

impl Read for StreamResponse {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        while self.pending.is_empty() {
            if self.body.is_none() || buf.is_empty() {
                return Ok(0);
            }
            if Handle::try_current().is_ok() {
                return Err(std::io::Error::other(RestError::BlockingInAsyncContext));
            }
            let handle = self.handle.clone();
            match handle.block_on(self.next_chunk()) {
                Ok(Some(chunk)) => self.pending = chunk,
                Ok(None) => return Ok(0),
                Err(err) => return Err(std::io::Error::other(err)),
            }
        }
        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending.split_to(n));
        Ok(n)
    }
}

impl Drop for StreamResponse {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use http::StatusCode;
    use serde::Deserialize;
    use std::io::Write;

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    async fn envelope(raw: RawResponse) -> ResponseEnvelope {
        decode(raw, Arc::new(MapperRegistry::new())).await.unwrap()
    }

    #[derive(Debug, Deserialize, PartialEq)]
    struct User {
        name: String,
        age: u32,
    }

    #[tokio::test]
    async fn test_missing_status_falls_back() {
        let env = envelope(RawResponse::without_status()).await;
        assert_eq!(env.status(), -1);
        assert_eq!(env.status_text(), "NOT_SET");
        assert!(env.bytes().is_none());
        assert_eq!(env.text(), "");
    }

    #[tokio::test]
    async fn test_gzip_body_is_decoded() {
        let raw = RawResponse::new(StatusCode::OK)
            .with_header("Content-Encoding", "gzip")
            .with_header("Content-Type", "application/json")
            .with_body(gzip(br#"{"name":"ann","age":7}"#));
        let env = envelope(raw).await;

        let user: User = env.body_as().unwrap();
        assert_eq!(
            user,
            User {
                name: "ann".to_owned(),
                age: 7
            }
        );
    }

    #[tokio::test]
    async fn test_charset_is_honored() {
        let raw = RawResponse::new(StatusCode::OK)
            .with_header("Content-Type", "text/plain; charset=ISO-8859-1")
            .with_body(vec![0x63, 0x61, 0x66, 0xE9]);
        assert_eq!(envelope(raw).await.text(), "caf\u{e9}");
    }

    #[tokio::test]
    async fn test_utf16_and_windows_1252_bodies() {
        let utf16: Vec<u8> = "h\u{e9}llo".encode_utf16().flat_map(u16::to_le_bytes).collect();
        let raw = RawResponse::new(StatusCode::OK)
            .with_header("Content-Type", "text/plain; charset=UTF-16LE")
            .with_body(utf16);
        assert_eq!(envelope(raw).await.text(), "h\u{e9}llo");

        let raw = RawResponse::new(StatusCode::OK)
            .with_header("Content-Type", "text/plain; charset=windows-1252")
            .with_body(vec![0x80, 0x31]);
        assert_eq!(envelope(raw).await.text(), "\u{20ac}1");
    }

    #[test]
    fn test_unknown_charset_falls_back_to_utf8() {
        assert_eq!(decode_text("caf\u{e9}".as_bytes(), Some("x-made-up")), "caf\u{e9}");
        assert_eq!(decode_text(b"plain", None), "plain");
    }

    #[tokio::test]
    async fn test_body_as_requires_content_type_and_mapper() {
        let raw = RawResponse::new(StatusCode::OK).with_body("{}");
        assert!(matches!(
            envelope(raw).await.body_as::<serde_json::Value>(),
            Err(RestError::NoContentType)
        ));

        let raw = RawResponse::new(StatusCode::OK)
            .with_header("Content-Type", "application/x-unknown")
            .with_body("{}");
        assert!(matches!(
            envelope(raw).await.body_as::<serde_json::Value>(),
            Err(RestError::NoMapperFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_body_is_cached() {
        let raw = RawResponse::new(StatusCode::OK)
            .with_header("Content-Type", "application/json")
            .with_body(r#"{"name":"bo","age":3}"#);
        let response: HttpResponse<Object<User>> = HttpResponse::new(envelope(raw).await);

        let first = response.body().unwrap();
        let second = response.body().unwrap();
        assert!(std::ptr::eq(first, second));
        assert_eq!(second.name, "bo");
    }

    #[tokio::test]
    async fn test_raw_body_is_fresh_each_call() {
        let raw = RawResponse::new(StatusCode::NOT_MODIFIED).with_body("abc");
        let response: HttpResponse<Binary> = HttpResponse::new(envelope(raw).await);
        assert!(response.is_successful());

        for _ in 0..2 {
            let mut text = String::new();
            response.raw_body().read_to_string(&mut text).unwrap();
            assert_eq!(text, "abc");
        }
    }

    #[tokio::test]
    async fn test_empty_json_body_is_empty_object() {
        let raw = RawResponse::new(StatusCode::NO_CONTENT);
        let response: HttpResponse<JsonTree> = HttpResponse::new(envelope(raw).await);
        assert!(response.body().unwrap().object().is_some_and(serde_json::Map::is_empty));
    }

    #[test]
    fn test_stream_reads_and_closes() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let raw = RawResponse::new(StatusCode::OK)
            .with_header("Content-Encoding", "gzip")
            .with_body(gzip(b"streamed"));
        let stream = StreamResponse::new(raw, rt.handle().clone());
        assert!(stream.is_gzip());

        let mut text = String::new();
        stream.decoded_reader().read_to_string(&mut text).unwrap();
        assert_eq!(text, "streamed");
    }

    #[test]
    fn test_stream_close_is_idempotent() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let mut stream = StreamResponse::new(
            RawResponse::new(StatusCode::OK).with_body("x"),
            rt.handle().clone(),
        );
        stream.close();
        stream.close();
        assert!(stream.is_closed());
        let mut buf = [0u8; 4];
        assert_eq!(stream.read(&mut buf).unwrap(), 0);
    }
}

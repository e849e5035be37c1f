//! TCP/TLS connector construction.
//!
//! [`TrackingConnector`] wraps the rustls connector so that every opened
//! connection carries an [`OpenConnection`] marker and, with a forward proxy
//! configured, plain HTTP targets are dialed through the proxy.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::AtomicUsize;
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll};
use std::time::Duration;

use http::Uri;
use hyper::rt::{Read, ReadBufCursor, Write};
use hyper_rustls::{HttpsConnector, MaybeHttpsStream};
use hyper_util::client::legacy::connect::{Connected, Connection, HttpConnector};
use hyper_util::rt::TokioIo;
use rustls::pki_types::CertificateDer;
use tokio::net::TcpStream;
use tower::Service;

use super::pool::OpenConnection;
use crate::config::TlsRoots;
use crate::error::{BoxError, RestError};

type Https = HttpsConnector<HttpConnector>;
type Stream = MaybeHttpsStream<TokioIo<TcpStream>>;

static NATIVE_ROOTS: OnceLock<Vec<CertificateDer<'static>>> = OnceLock::new();

/// OS root certificates, loaded once per process.
fn native_roots() -> &'static [CertificateDer<'static>] {
    NATIVE_ROOTS.get_or_init(|| {
        let loaded = rustls_native_certs::load_native_certs();
        for err in &loaded.errors {
            tracing::warn!(error = %err, "error loading native root certificate");
        }
        if loaded.certs.is_empty() {
            tracing::warn!("no native root CA certificates found");
        }
        loaded.certs
    })
}

/// Process default provider if one is installed, aws-lc-rs otherwise.
fn crypto_provider() -> Arc<rustls::crypto::CryptoProvider> {
    rustls::crypto::CryptoProvider::get_default()
        .cloned()
        .unwrap_or_else(|| Arc::new(rustls::crypto::aws_lc_rs::default_provider()))
}

fn native_tls_config() -> Result<rustls::ClientConfig, RestError> {
    let tls_error = |msg: String| RestError::Tls(msg.into());

    let mut store = rustls::RootCertStore::empty();
    let (added, ignored) = store.add_parsable_certificates(native_roots().iter().cloned());
    if ignored > 0 {
        tracing::warn!(added, ignored, "some native root certificates could not be parsed");
    }
    if added == 0 {
        return Err(tls_error("no usable native root CA certificates".to_owned()));
    }

    Ok(rustls::ClientConfig::builder_with_provider(crypto_provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| RestError::Tls(Box::new(e)))?
        .with_root_certificates(store)
        .with_no_client_auth())
}

/// HTTP/1 connector for both `http` and `https` targets.
///
/// `connect_timeout` bounds the TCP connect; zero disables it.
fn build_https(roots: TlsRoots, connect_timeout: Duration) -> Result<Https, RestError> {
    let mut http = HttpConnector::new();
    http.enforce_http(false);
    http.set_nodelay(true);
    http.set_connect_timeout((!connect_timeout.is_zero()).then_some(connect_timeout));

    let builder = hyper_rustls::HttpsConnectorBuilder::new();
    let builder = match roots {
        TlsRoots::WebPki => builder
            .with_provider_and_webpki_roots(crypto_provider())
            .map_err(|e| RestError::Tls(Box::new(e)))?,
        TlsRoots::Native => builder.with_tls_config(native_tls_config()?),
    };

    Ok(builder.https_or_http().enable_http1().wrap_connector(http))
}

/// Connector handed to the hyper client.
#[derive(Clone)]
pub(crate) struct TrackingConnector {
    inner: Https,
    proxy: Option<Uri>,
    open: Arc<AtomicUsize>,
}

impl TrackingConnector {
    /// # Errors
    ///
    /// Returns [`RestError::Tls`] if the TLS configuration cannot be built.
    pub(crate) fn new(
        roots: TlsRoots,
        connect_timeout: Duration,
        proxy: Option<Uri>,
        open: &Arc<AtomicUsize>,
    ) -> Result<Self, RestError> {
        Ok(Self {
            inner: build_https(roots, connect_timeout)?,
            proxy,
            open: Arc::clone(open),
        })
    }
}

impl Service<Uri> for TrackingConnector {
    type Response = TrackedStream;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<TrackedStream, BoxError>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, target: Uri) -> Self::Future {
        // https through the proxy is refused before a request gets here
        let (dial, proxied) = match &self.proxy {
            Some(proxy) if target.scheme_str() != Some("https") => (proxy.clone(), true),
            _ => (target, false),
        };
        let connecting = self.inner.call(dial);
        let open = Arc::clone(&self.open);
        Box::pin(async move {
            let io = connecting.await?;
            Ok(TrackedStream {
                inner: io,
                proxied,
                _open: OpenConnection::new(&open),
            })
        })
    }
}

/// Connection I/O that counts as open until dropped.
pub(crate) struct TrackedStream {
    inner: Stream,
    proxied: bool,
    _open: OpenConnection,
}

impl Read for TrackedStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: ReadBufCursor<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl Write for TrackedStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write_vectored(cx, bufs)
    }
}

impl Connection for TrackedStream {
    fn connected(&self) -> Connected {
        // a proxied connection makes hyper send absolute-form targets
        self.inner.connected().proxy(self.proxied)
    }
}

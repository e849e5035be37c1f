#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(coverage_nightly, coverage(off))]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use http::{Request, StatusCode};
use modkit_rest::{
    ClientRegistry, PoolStats, RawResponse, ReaperConfig, RestClient, RestError, Transport,
    TransportFuture,
};
use parking_lot::Mutex;
use tokio::runtime::{Handle, Runtime};
use tracing_subscriber::layer::SubscriberExt;

#[derive(Default)]
struct Behavior {
    fail_close: bool,
    panic_on_sweep: bool,
}

/// Transport answering every request with `200 ok` and counting lifecycle calls.
struct CountingTransport {
    runtime: Mutex<Option<Runtime>>,
    running: AtomicBool,
    sweeps: AtomicUsize,
    closes: AtomicUsize,
    behavior: Behavior,
}

impl CountingTransport {
    fn new(behavior: Behavior) -> Arc<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap();
        Arc::new(Self {
            runtime: Mutex::new(Some(runtime)),
            running: AtomicBool::new(false),
            sweeps: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            behavior,
        })
    }

    fn sweeps(&self) -> usize {
        self.sweeps.load(Ordering::SeqCst)
    }

    fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

impl Transport for CountingTransport {
    fn send(&self, _request: Request<Bytes>) -> TransportFuture {
        Box::pin(async { Ok(RawResponse::new(StatusCode::OK).with_body("ok")) })
    }

    fn handle(&self) -> Result<Handle, RestError> {
        self.runtime
            .lock()
            .as_ref()
            .map(|rt| rt.handle().clone())
            .ok_or_else(|| RestError::Closed("counting transport".to_owned()))
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn start(&self) -> Result<(), RestError> {
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn close_expired(&self) {}

    fn close_idle(&self, _idle: Duration) {
        assert!(!self.behavior.panic_on_sweep, "sweep failure");
        self.sweeps.fetch_add(1, Ordering::SeqCst);
    }

    fn close(&self) -> Result<(), RestError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);
        if let Some(runtime) = self.runtime.lock().take() {
            runtime.shutdown_background();
        }
        if self.behavior.fail_close {
            return Err(RestError::Closed("close failure".to_owned()));
        }
        Ok(())
    }

    fn stats(&self) -> PoolStats {
        PoolStats::default()
    }
}

/// Collects the messages of WARN events.
#[derive(Clone, Default)]
struct WarningCapture {
    warnings: Arc<Mutex<Vec<String>>>,
}

impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for WarningCapture {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: tracing_subscriber::layer::Context<'_, S>) {
        if *event.metadata().level() == tracing::Level::WARN {
            let mut visitor = MessageVisitor(String::new());
            event.record(&mut visitor);
            self.warnings.lock().push(visitor.0);
        }
    }
}

struct MessageVisitor(String);

impl tracing::field::Visit for MessageVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.0 = format!("{value:?}");
        }
    }
}

fn fast_reaper() -> Arc<ClientRegistry> {
    ClientRegistry::new(ReaperConfig {
        interval: Duration::from_millis(10),
        idle_timeout: Duration::from_secs(30),
    })
}

fn client_with(registry: &Arc<ClientRegistry>, transport: &Arc<CountingTransport>) -> RestClient {
    RestClient::builder()
        .base_url("http://counting.local")
        .registry(Arc::clone(registry))
        .disable_async()
        .sync_transport(Arc::clone(transport) as Arc<dyn Transport>)
        .build()
        .unwrap()
}

fn wait_until(condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

#[test]
fn test_reaper_sweeps_until_clients_close() {
    let registry = fast_reaper();
    let first = CountingTransport::new(Behavior::default());
    let second = CountingTransport::new(Behavior::default());
    let first_client = client_with(&registry, &first);
    let second_client = client_with(&registry, &second);

    assert_eq!(registry.size(), 2);
    assert!(registry.is_reaper_running());
    assert!(wait_until(|| first.sweeps() > 0 && second.sweeps() > 0));

    first_client.close().unwrap();
    assert_eq!(registry.size(), 1);
    assert!(registry.get(first_client.id()).is_none());
    let response = second_client.get("/still-open").as_string().unwrap();
    assert_eq!(response.body().unwrap(), "ok");
    let swept = second.sweeps();
    assert!(wait_until(|| second.sweeps() > swept));

    second_client.close().unwrap();
    assert_eq!(registry.size(), 0);
    let (first_sweeps, second_sweeps) = (first.sweeps(), second.sweeps());
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(first.sweeps(), first_sweeps);
    assert_eq!(second.sweeps(), second_sweeps);

    registry.stop();
}

#[test]
fn test_get_returns_live_client() {
    let registry = fast_reaper();
    let transport = CountingTransport::new(Behavior::default());
    let client = client_with(&registry, &transport);

    let found = registry.get(client.id()).unwrap();
    assert_eq!(found.id(), client.id());
    assert_eq!(registry.client_ids(), vec![client.id().to_owned()]);

    found.close().unwrap();
    assert!(client.is_closed());
    registry.stop();
}

#[test]
fn test_shutdown_skips_failing_close() {
    let registry = fast_reaper();
    let failing = CountingTransport::new(Behavior {
        fail_close: true,
        ..Behavior::default()
    });
    let healthy = CountingTransport::new(Behavior::default());
    let failing_client = client_with(&registry, &failing);
    let healthy_client = client_with(&registry, &healthy);

    let capture = WarningCapture::default();
    let warnings = Arc::clone(&capture.warnings);
    tracing::subscriber::with_default(tracing_subscriber::registry().with(capture), || {
        registry.shutdown();
    });

    let captured = warnings.lock();
    assert!(
        captured.iter().any(|w| w.contains("failed to close client")),
        "expected a close failure warning, got: {:?}",
        *captured
    );
    assert_eq!(failing.closes(), 1);
    assert_eq!(healthy.closes(), 1);
    assert!(failing_client.is_closed());
    assert!(healthy_client.is_closed());
    assert_eq!(registry.size(), 0);
    assert!(!registry.is_reaper_running());
}

#[test]
fn test_shutdown_guard_closes_clients() {
    let registry = fast_reaper();
    let transport = CountingTransport::new(Behavior::default());
    let client = client_with(&registry, &transport);

    {
        let _guard = registry.shutdown_guard();
    }

    assert!(client.is_closed());
    assert_eq!(transport.closes(), 1);
    assert!(matches!(
        client.get("/after").as_string(),
        Err(RestError::Closed(_))
    ));
}

#[test]
fn test_sweep_panic_does_not_stop_other_clients() {
    let registry = ClientRegistry::new(ReaperConfig::default());
    let panicking = CountingTransport::new(Behavior {
        panic_on_sweep: true,
        ..Behavior::default()
    });
    let healthy = CountingTransport::new(Behavior::default());
    let _panicking_client = client_with(&registry, &panicking);
    let _healthy_client = client_with(&registry, &healthy);

    assert_eq!(registry.sweep(), 2);
    assert_eq!(healthy.sweeps(), 1);
    assert_eq!(registry.sweep(), 2);
    assert_eq!(healthy.sweeps(), 2);

    registry.shutdown();
}

#[test]
fn test_dropped_clients_are_not_swept() {
    let registry = ClientRegistry::new(ReaperConfig::default());
    let transport = CountingTransport::new(Behavior::default());
    drop(client_with(&registry, &transport));

    assert_eq!(registry.size(), 0);
    assert_eq!(registry.sweep(), 0);
    assert_eq!(transport.sweeps(), 0);
    registry.stop();
}

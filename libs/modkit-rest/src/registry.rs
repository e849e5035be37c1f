//! Registry of open clients and the idle connection reaper.
//!
//! Every client registers itself on build and leaves the registry when it is
//! closed or dropped. A single background thread per registry wakes up every
//! [`ReaperConfig::interval`] and closes expired connections and connections
//! idle for longer than [`ReaperConfig::idle_timeout`] in all registered
//! clients. The process-wide registry from [`ClientRegistry::global`] is used
//! unless a client is built with its own.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, OnceLock, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::client::{ClientInner, RestClient};
use crate::config::ReaperConfig;
use crate::error::RestError;

type ClientMap = DashMap<String, Weak<ClientInner>>;

static GLOBAL: OnceLock<Arc<ClientRegistry>> = OnceLock::new();

#[derive(Default)]
struct StopSignal {
    stopped: Mutex<bool>,
    wake: Condvar,
}

struct Reaper {
    signal: Arc<StopSignal>,
    thread: JoinHandle<()>,
}

/// Tracks open clients and runs the idle connection reaper.
pub struct ClientRegistry {
    clients: Arc<ClientMap>,
    config: ReaperConfig,
    reaper: Mutex<Option<Reaper>>,
}

impl std::fmt::Debug for ClientRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientRegistry")
            .field("clients", &self.clients.len())
            .field("config", &self.config)
            .field("reaper_running", &self.is_reaper_running())
            .finish_non_exhaustive()
    }
}

impl ClientRegistry {
    /// Isolated registry; the reaper starts with the first registered client.
    #[must_use]
    pub fn new(config: ReaperConfig) -> Arc<Self> {
        Arc::new(Self {
            clients: Arc::new(DashMap::new()),
            config,
            reaper: Mutex::new(None),
        })
    }

    /// Process-wide registry with default reaper settings.
    #[must_use]
    pub fn global() -> &'static Arc<Self> {
        GLOBAL.get_or_init(|| Self::new(ReaperConfig::default()))
    }

    #[must_use]
    pub fn config(&self) -> &ReaperConfig {
        &self.config
    }

    pub(crate) fn register(&self, client: &Arc<ClientInner>) {
        self.clients.insert(client.id.clone(), Arc::downgrade(client));
        tracing::debug!(client_id = %client.id, clients = self.clients.len(), "client registered");
        self.start();
    }

    /// Removes a client without closing it.
    pub fn deregister(&self, id: &str) {
        if self.clients.remove(id).is_some() {
            tracing::debug!(client_id = %id, clients = self.clients.len(), "client deregistered");
        }
    }

    /// Number of registered clients.
    #[must_use]
    pub fn size(&self) -> usize {
        self.clients.len()
    }

    #[must_use]
    pub fn client_ids(&self) -> Vec<String> {
        self.clients.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Live registered client by id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<RestClient> {
        self.clients
            .get(id)
            .and_then(|entry| entry.value().upgrade())
            .filter(|inner| !inner.is_closed())
            .map(RestClient::from_inner)
    }

    /// Closes expired and idle connections of every registered client now.
    /// Returns the number of clients swept.
    #[must_use]
    pub fn sweep(&self) -> usize {
        sweep_clients(&self.clients, self.config.idle_timeout)
    }

    /// Starts the reaper thread; a no-op when it is already running.
    pub fn start(&self) {
        let mut reaper = self.reaper.lock();
        if reaper.is_some() {
            return;
        }

        let signal = Arc::new(StopSignal::default());
        let clients = Arc::clone(&self.clients);
        let thread_signal = Arc::clone(&signal);
        let interval = self.config.interval.max(Duration::from_millis(1));
        let idle_timeout = self.config.idle_timeout;

        let spawned = std::thread::Builder::new()
            .name("modkit-rest-reaper".to_owned())
            .spawn(move || run_reaper(&clients, &thread_signal, interval, idle_timeout));
        match spawned {
            Ok(thread) => {
                tracing::info!(
                    interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX),
                    "idle connection reaper started"
                );
                *reaper = Some(Reaper { signal, thread });
            }
            Err(err) => tracing::error!(error = %err, "failed to spawn idle connection reaper"),
        }
    }

    /// Stops the reaper thread and waits for it; a no-op when not running.
    /// Clients stay registered and open.
    pub fn stop(&self) {
        let Some(Reaper { signal, thread }) = self.reaper.lock().take() else {
            return;
        };
        *signal.stopped.lock() = true;
        signal.wake.notify_all();

        if thread.thread().id() == std::thread::current().id() {
            return;
        }
        if thread.join().is_err() {
            tracing::error!("idle connection reaper panicked");
        } else {
            tracing::info!("idle connection reaper stopped");
        }
    }

    #[must_use]
    pub fn is_reaper_running(&self) -> bool {
        self.reaper.lock().is_some()
    }

    /// Closes every registered client, then stops the reaper.
    ///
    /// A client that fails to close is logged and skipped.
    pub fn shutdown(&self) {
        let clients: Vec<Arc<ClientInner>> = self
            .clients
            .iter()
            .filter_map(|entry| entry.value().upgrade())
            .collect();
        tracing::info!(clients = clients.len(), "shutting down rest clients");

        for client in &clients {
            let outcome = catch_unwind(AssertUnwindSafe(|| client.close()));
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(err)) => log_close_failure(&client.id, &err),
                Err(_) => tracing::error!(client_id = %client.id, "client close panicked"),
            }
        }
        self.clients.clear();
        self.stop();
    }

    /// Guard that runs [`ClientRegistry::shutdown`] when dropped, e.g. at the
    /// end of `main`.
    #[must_use = "the registry shuts down when the guard is dropped"]
    pub fn shutdown_guard(self: &Arc<Self>) -> ShutdownGuard {
        ShutdownGuard {
            registry: Arc::clone(self),
        }
    }
}

impl Drop for ClientRegistry {
    fn drop(&mut self) {
        self.stop();
    }
}

fn log_close_failure(id: &str, err: &RestError) {
    tracing::warn!(client_id = %id, error = %err, "failed to close client during shutdown");
}

fn run_reaper(clients: &ClientMap, signal: &StopSignal, interval: Duration, idle_timeout: Duration) {
    let mut stopped = signal.stopped.lock();
    while !*stopped {
        signal.wake.wait_for(&mut stopped, interval);
        if *stopped {
            break;
        }
        MutexGuard::unlocked(&mut stopped, || {
            sweep_clients(clients, idle_timeout);
        });
    }
}

fn sweep_clients(clients: &ClientMap, idle_timeout: Duration) -> usize {
    // Upgrade first so no map shard is locked while transports are touched.
    let live: Vec<Arc<ClientInner>> = clients
        .iter()
        .filter_map(|entry| entry.value().upgrade())
        .collect();
    clients.retain(|_, client| client.strong_count() > 0);

    for client in &live {
        if catch_unwind(AssertUnwindSafe(|| client.sweep(idle_timeout))).is_err() {
            tracing::error!(client_id = %client.id, "idle connection sweep panicked");
        }
    }
    tracing::trace!(clients = live.len(), "idle connection sweep done");
    live.len()
}

/// Shuts the registry down on drop.
#[derive(Debug)]
pub struct ShutdownGuard {
    registry: Arc<ClientRegistry>,
}

impl Drop for ShutdownGuard {
    fn drop(&mut self) {
        self.registry.shutdown();
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    fn fast() -> ReaperConfig {
        ReaperConfig {
            interval: Duration::from_millis(10),
            idle_timeout: Duration::from_secs(30),
        }
    }

    #[test]
    fn test_start_stop_idempotent() {
        let registry = ClientRegistry::new(fast());
        assert!(!registry.is_reaper_running());
        registry.start();
        registry.start();
        assert!(registry.is_reaper_running());
        registry.stop();
        registry.stop();
        assert!(!registry.is_reaper_running());
    }

    #[test]
    fn test_empty_registry() {
        let registry = ClientRegistry::new(fast());
        assert_eq!(registry.size(), 0);
        assert_eq!(registry.sweep(), 0);
        registry.deregister("missing");
        assert!(registry.get("missing").is_none());
        registry.shutdown();
    }

    #[test]
    fn test_global_is_shared() {
        assert!(Arc::ptr_eq(ClientRegistry::global(), ClientRegistry::global()));
    }
}

//! Cancellable handle for asynchronous requests.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};

use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::error::RestError;

type CompleteHook<T> = Box<dyn FnOnce(T) + Send>;
type ErrorHook = Box<dyn FnOnce(RestError) + Send>;
type CancelHook = Box<dyn FnOnce() + Send>;

/// Completion hooks for an asynchronous request.
///
/// Exactly one hook runs per request, on a transport worker thread:
/// `on_complete` with the response, `on_error` with the failure, or
/// `on_cancel` when the request was cancelled. Closing the client while the
/// request is in flight reports [`RestError::Closed`] to `on_error`.
pub struct Hooks<T> {
    on_complete: Option<CompleteHook<T>>,
    on_error: Option<ErrorHook>,
    on_cancel: Option<CancelHook>,
}

impl<T> Default for Hooks<T> {
    fn default() -> Self {
        Self {
            on_complete: None,
            on_error: None,
            on_cancel: None,
        }
    }
}

impl<T> std::fmt::Debug for Hooks<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hooks")
            .field("on_complete", &self.on_complete.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("on_cancel", &self.on_cancel.is_some())
            .finish()
    }
}

impl<T: Send + 'static> Hooks<T> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn on_complete(mut self, hook: impl FnOnce(T) + Send + 'static) -> Self {
        self.on_complete = Some(Box::new(hook));
        self
    }

    #[must_use]
    pub fn on_error(mut self, hook: impl FnOnce(RestError) + Send + 'static) -> Self {
        self.on_error = Some(Box::new(hook));
        self
    }

    #[must_use]
    pub fn on_cancel(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.on_cancel = Some(Box::new(hook));
        self
    }

    /// Hooks that forward to a [`Callback`] implementation.
    #[must_use]
    pub fn from_callback(callback: impl Callback<T>) -> Self {
        let shared = Arc::new(parking_lot::Mutex::new(Some(callback)));
        let (on_error, on_cancel) = (Arc::clone(&shared), Arc::clone(&shared));
        Self::new()
            .on_complete(move |value| {
                if let Some(cb) = shared.lock().take() {
                    cb.completed(value);
                }
            })
            .on_error(move |err| {
                if let Some(cb) = on_error.lock().take() {
                    cb.failed(err);
                }
            })
            .on_cancel(move || {
                if let Some(cb) = on_cancel.lock().take() {
                    cb.cancelled();
                }
            })
    }
}

impl<T> Hooks<T> {
    pub(crate) fn fail(self, err: RestError) {
        match self.on_error {
            Some(hook) => hook(err),
            None => tracing::warn!(error = %err, "async request failed without an error hook"),
        }
    }
}

/// Object-style alternative to [`Hooks`].
pub trait Callback<T>: Send + 'static {
    fn completed(self, response: T);
    fn failed(self, error: RestError);
    fn cancelled(self);
}

/// Handle to a request running on a transport runtime.
///
/// Awaiting it yields the outcome; [`AsyncTask::cancel`] stops the request
/// and makes the task resolve to [`RestError::Cancelled`]. A request cut off
/// by its transport shutting down resolves to [`RestError::Closed`]. Dropping
/// the task does not cancel the request.
#[must_use = "dropping the task does not cancel the request; await it or call cancel()"]
pub struct AsyncTask<T> {
    receiver: oneshot::Receiver<Result<T, RestError>>,
    token: CancellationToken,
    done: Arc<AtomicBool>,
}

impl<T> std::fmt::Debug for AsyncTask<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncTask")
            .field("done", &self.is_done())
            .field("cancelled", &self.is_cancelled())
            .finish_non_exhaustive()
    }
}

fn closed_under_request() -> RestError {
    RestError::Closed("transport runtime shut down with the request in flight".to_owned())
}

/// Sending half of a task; resolves the task with [`RestError::Closed`] when
/// dropped undelivered while not cancelled.
struct Delivery<T> {
    sender: Option<oneshot::Sender<Result<T, RestError>>>,
    token: CancellationToken,
    done: Arc<AtomicBool>,
}

impl<T> Delivery<T> {
    fn deliver(&mut self, result: Result<T, RestError>) {
        self.done.store(true, Ordering::Release);
        if let Some(sender) = self.sender.take()
            && sender.send(result).is_err()
        {
            tracing::trace!("task handle dropped before delivery");
        }
    }

    /// Drops the sender so the task resolves to [`RestError::Cancelled`].
    fn abandon(&mut self) {
        self.done.store(true, Ordering::Release);
        self.sender = None;
    }
}

impl<T> Drop for Delivery<T> {
    fn drop(&mut self) {
        if self.sender.is_some() && !self.token.is_cancelled() {
            tracing::debug!("async request dropped by its runtime");
            self.deliver(Err(closed_under_request()));
        }
    }
}

impl<T: Send + 'static> AsyncTask<T> {
    /// Runs `work` on `handle`; `on_cancel` runs if the task is cancelled first.
    pub(crate) fn spawn<Fut>(handle: &Handle, work: Fut, on_cancel: Option<CancelHook>) -> Self
    where
        Fut: Future<Output = Result<T, RestError>> + Send + 'static,
    {
        Self::spawn_with_token(handle, CancellationToken::new(), work, on_cancel)
    }

    fn spawn_with_token<Fut>(
        handle: &Handle,
        token: CancellationToken,
        work: Fut,
        on_cancel: Option<CancelHook>,
    ) -> Self
    where
        Fut: Future<Output = Result<T, RestError>> + Send + 'static,
    {
        let (sender, receiver) = oneshot::channel();
        let done = Arc::new(AtomicBool::new(false));

        let task_token = token.clone();
        let mut delivery = Delivery {
            sender: Some(sender),
            token: token.clone(),
            done: Arc::clone(&done),
        };
        handle.spawn(async move {
            let outcome = tokio::select! {
                biased;
                () = task_token.cancelled() => None,
                result = work => Some(result),
            };
            match outcome {
                Some(result) => delivery.deliver(result),
                None => {
                    tracing::debug!("async request cancelled");
                    if let Some(hook) = on_cancel {
                        hook();
                    }
                    delivery.abandon();
                }
            }
        });

        Self {
            receiver,
            token,
            done,
        }
    }

    /// Task that is already complete.
    pub(crate) fn ready(result: Result<T, RestError>) -> Self {
        let (sender, receiver) = oneshot::channel();
        if sender.send(result).is_err() {
            tracing::trace!("ready task receiver dropped");
        }
        Self {
            receiver,
            token: CancellationToken::new(),
            done: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Task that has already failed with `err`.
    pub(crate) fn failed(err: RestError) -> Self {
        Self::ready(Err(err))
    }
}

impl<T> AsyncTask<T> {
    /// Requests cancellation. Returns `false` if the request already finished.
    pub fn cancel(&self) -> bool {
        if self.is_done() {
            return false;
        }
        self.token.cancel();
        true
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Blocks the current thread until the request finishes.
    ///
    /// # Errors
    ///
    /// Returns the request failure, [`RestError::Cancelled`], or
    /// [`RestError::BlockingInAsyncContext`] when called from inside a runtime.
    pub fn wait(self) -> Result<T, RestError> {
        if Handle::try_current().is_ok() {
            return Err(RestError::BlockingInAsyncContext);
        }
        self.receiver
            .blocking_recv()
            .unwrap_or(Err(RestError::Cancelled))
    }
}

impl<T> Future for AsyncTask<T> {
    type Output = Result<T, RestError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(RestError::Cancelled)))
    }
}

/// Hooks of a running request; reports [`RestError::Closed`] to `on_error`
/// if the request is dropped before finishing and was not cancelled.
struct HookGuard<T> {
    hooks: Option<Hooks<T>>,
    token: CancellationToken,
}

impl<T> HookGuard<T> {
    fn complete(&mut self, result: Result<T, RestError>) {
        let Some(hooks) = self.hooks.take() else {
            return;
        };
        match result {
            Ok(value) => {
                if let Some(hook) = hooks.on_complete {
                    hook(value);
                }
            }
            Err(err) => hooks.fail(err),
        }
    }
}

impl<T> Drop for HookGuard<T> {
    fn drop(&mut self) {
        if self.hooks.is_some() && !self.token.is_cancelled() {
            self.complete(Err(closed_under_request()));
        }
    }
}

/// Runs `work` and reports its outcome through `hooks` instead of the task.
///
/// The returned task resolves to `Ok(())` once a hook has run, to
/// [`RestError::Cancelled`] after cancellation, or to [`RestError::Closed`]
/// when the transport shut down first (after `on_error` ran).
pub(crate) fn spawn_with_hooks<T, Fut>(handle: &Handle, work: Fut, mut hooks: Hooks<T>) -> AsyncTask<()>
where
    T: Send + 'static,
    Fut: Future<Output = Result<T, RestError>> + Send + 'static,
{
    let token = CancellationToken::new();
    let on_cancel = hooks.on_cancel.take();
    let mut guard = HookGuard {
        hooks: Some(hooks),
        token: token.clone(),
    };
    let delivery = async move {
        let result = work.await;
        guard.complete(result);
        Ok(())
    };
    AsyncTask::spawn_with_token(handle, token, delivery, on_cancel)
}

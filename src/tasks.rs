//! Running blocking service calls as cancellable tasks
//!
//! Service calls block for as long as their network exchange takes. The
//! [`OperationRunner`] moves them onto tokio's blocking pool, bounds how many
//! run at once, and hands back an [`OperationTask`] whose cancellation token
//! is wired to the service's own.

use std::sync::{Arc, Mutex, MutexGuard};

use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// A service whose running operation can be cancelled from another thread
pub trait Cancellable: Send + Sync {
    /// The slot holding the token of the running operation
    fn cancel_slot(&self) -> &CancelSlot;

    fn cancel(&self) {
        self.cancel_slot().cancel();
    }
}

/// Holds the token of the operation a service is currently running.
///
/// While a parent token is attached, every operation starts from a child of
/// it, so cancelling the parent before the operation begins still stops it.
#[derive(Debug, Default)]
pub struct CancelSlot {
    state: Mutex<SlotState>,
}

#[derive(Debug, Default)]
struct SlotState {
    current: CancellationToken,
    attached: Option<(u64, CancellationToken)>,
    next_attachment: u64,
}

impl CancelSlot {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Start a new operation with a fresh token
    pub fn begin(&self) -> CancellationToken {
        let mut state = self.lock();
        let token = match &state.attached {
            Some((_, parent)) => parent.child_token(),
            None => CancellationToken::new(),
        };
        state.current = token.clone();
        token
    }

    pub fn cancel(&self) {
        self.lock().current.cancel();
    }

    /// Derive the tokens of following operations from `parent`
    pub fn attach(&self, parent: CancellationToken) -> u64 {
        let mut state = self.lock();
        state.next_attachment += 1;
        let id = state.next_attachment;
        state.attached = Some((id, parent));
        id
    }

    /// Undo [`attach`](Self::attach), unless a later attachment replaced it
    pub fn detach(&self, attachment: u64) {
        let mut state = self.lock();
        if matches!(state.attached, Some((id, _)) if id == attachment) {
            state.attached = None;
        }
    }
}

/// A running operation
pub struct OperationTask<T> {
    name: String,
    token: CancellationToken,
    join: JoinHandle<Result<T, JoinError>>,
}

impl<T> OperationTask<T> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cancel(&self) {
        debug!(task = %self.name, "Cancelling operation");
        self.token.cancel();
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    pub async fn join(self) -> Result<T, JoinError> {
        self.join.await?
    }
}

#[derive(Debug, Clone)]
pub struct OperationRunner {
    handle: Handle,
    permits: Arc<Semaphore>,
}

impl OperationRunner {
    /// Runner on `handle` allowing `max_concurrent` operations at once
    pub fn new(handle: Handle, max_concurrent: usize) -> Self {
        Self {
            handle,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    /// Runner on the current tokio runtime. Panics outside a runtime.
    pub fn current(max_concurrent: usize) -> Self {
        Self::new(Handle::current(), max_concurrent)
    }

    /// Run `work` on the blocking pool; it receives the task's token.
    pub fn spawn<T, F>(&self, name: impl Into<String>, work: F) -> OperationTask<T>
    where
        T: Send + 'static,
        F: FnOnce(CancellationToken) -> T + Send + 'static,
    {
        let name = name.into();
        let token = CancellationToken::new();
        let permits = self.permits.clone();
        let child = token.clone();
        let task_name = name.clone();

        let join = self.handle.spawn(async move {
            let _permit = permits.acquire_owned().await;
            debug!(task = %task_name, "Operation started");
            tokio::task::spawn_blocking(move || work(child)).await
        });

        OperationTask { name, token, join }
    }

    /// Run `work` against `service`; cancelling the task cancels the service.
    pub fn spawn_service<S, T, F>(
        &self,
        name: impl Into<String>,
        service: Arc<S>,
        work: F,
    ) -> OperationTask<T>
    where
        S: Cancellable + 'static,
        T: Send + 'static,
        F: FnOnce(&S) -> T + Send + 'static,
    {
        let name = name.into();
        let token = CancellationToken::new();
        let permits = self.permits.clone();
        let watched = token.clone();
        let task_name = name.clone();
        // attached before spawning: a cancel issued right away is not lost
        let attachment = service.cancel_slot().attach(token.clone());

        let join = self.handle.spawn(async move {
            let _permit = permits.acquire_owned().await;
            debug!(task = %task_name, "Operation started");
            let canceller = service.clone();
            let mut job = tokio::task::spawn_blocking(move || work(service.as_ref()));
            let result = tokio::select! {
                result = &mut job => result,
                _ = watched.cancelled() => {
                    canceller.cancel();
                    job.await
                }
            };
            canceller.cancel_slot().detach(attachment);
            result
        });

        OperationTask { name, token, join }
    }
}

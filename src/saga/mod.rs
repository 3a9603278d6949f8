//! Effect interpreter — a store middleware that runs long-lived async
//! routines ("sagas") against the store it is mounted on.
//!
//! # Lifecycle
//!
//! 1. [`create_saga_middleware`] builds the middleware. It is not bound to
//!    anything yet.
//! 2. The middleware is placed in the store's chain
//!    ([`apply_middleware`](crate::store::apply_middleware)); `attach` binds
//!    it to that store. One middleware binds to exactly one live store.
//! 3. [`SagaMiddleware::run`] starts the root routine, exactly once, and
//!    returns a [`SagaTask`] handle used to cancel and join it.
//!
//! # Action flow
//!
//! Actions are broadcast to routines from the store's commit hook: only
//! actions the reducer applied are seen, in the order it applied them, and a
//! routine woken by an action already sees the state that action produced.

mod effects;
mod task;

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::store::{Middleware, Next, StoreApi, StoreError};

pub use effects::{ActionChannel, ForkHandle, SagaContext};
pub use task::{SagaExit, SagaTask};

/// Errors raised by effect routines and by misuse of the middleware.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SagaError {
    #[error("saga middleware must be mounted on a store before running a saga")]
    NotAttached,

    #[error("saga middleware is already bound to a live store")]
    AlreadyAttached,

    #[error("root saga already started on this middleware")]
    AlreadyRunning,

    #[error("sagas must be started from within a Tokio runtime")]
    NoRuntime,

    #[error("saga cancelled")]
    Cancelled,

    #[error("action channel closed")]
    ChannelClosed,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("saga failed: {0}")]
    Failed(String),

    #[error("saga task panicked: {0}")]
    Panicked(String),
}

impl SagaError {
    /// Convenience for routines reporting their own failures.
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }
}

/// Tuning for a [`SagaMiddleware`].
#[derive(Debug, Clone)]
pub struct SagaOptions {
    /// Actions buffered per waiting routine before it starts skipping.
    pub channel_capacity: usize,
}

impl Default for SagaOptions {
    fn default() -> Self {
        Self {
            channel_capacity: 256,
        }
    }
}

struct Shared<S, A> {
    store: Mutex<Option<StoreApi<S, A>>>,
    actions: broadcast::Sender<A>,
    started: AtomicBool,
}

/// The effect-interpreter middleware. Clones share one instance.
pub struct SagaMiddleware<S, A> {
    shared: Arc<Shared<S, A>>,
}

impl<S, A> Clone for SagaMiddleware<S, A> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<S, A> SagaMiddleware<S, A>
where
    S: Send + Sync + 'static,
    A: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::with_options(SagaOptions::default())
    }

    pub fn with_options(options: SagaOptions) -> Self {
        let (actions, _) = broadcast::channel(options.channel_capacity.max(1));
        Self {
            shared: Arc::new(Shared {
                store: Mutex::new(None),
                actions,
                started: AtomicBool::new(false),
            }),
        }
    }

    /// `true` while bound to a store that is still alive.
    pub fn is_attached(&self) -> bool {
        self.bound_store().is_some()
    }

    /// `true` once [`run`](Self::run) has succeeded.
    pub fn is_running(&self) -> bool {
        self.shared.started.load(Ordering::Acquire)
    }

    /// Start `root` under a fresh cancellation token.
    pub fn run<F, Fut>(&self, root: F) -> Result<SagaTask, SagaError>
    where
        F: FnOnce(SagaContext<S, A>) -> Fut,
        Fut: Future<Output = Result<(), SagaError>> + Send + 'static,
    {
        self.run_with_shutdown(root, CancellationToken::new())
    }

    /// Start `root`; cancelling `shutdown` cancels the root and everything
    /// it forked or spawned.
    ///
    /// Fails with [`SagaError::NotAttached`] before the middleware is mounted
    /// on a store and with [`SagaError::AlreadyRunning`] on any call after
    /// the first successful one.
    pub fn run_with_shutdown<F, Fut>(
        &self,
        root: F,
        shutdown: CancellationToken,
    ) -> Result<SagaTask, SagaError>
    where
        F: FnOnce(SagaContext<S, A>) -> Fut,
        Fut: Future<Output = Result<(), SagaError>> + Send + 'static,
    {
        let store = self.bound_store().ok_or(SagaError::NotAttached)?;
        let runtime = Handle::try_current().map_err(|_| SagaError::NoRuntime)?;

        if self
            .shared
            .started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(SagaError::AlreadyRunning);
        }

        Ok(task::start(
            &runtime,
            store,
            self.shared.actions.clone(),
            root,
            shutdown,
        ))
    }

    fn bound_store(&self) -> Option<StoreApi<S, A>> {
        self.shared
            .store
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .filter(|api| api.is_alive())
            .cloned()
    }
}

impl<S, A> Default for SagaMiddleware<S, A>
where
    S: Send + Sync + 'static,
    A: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<S, A> Middleware<S, A> for SagaMiddleware<S, A>
where
    S: Send + Sync + 'static,
    A: Clone + Send + Sync + 'static,
{
    fn attach(&self, api: StoreApi<S, A>) -> Result<(), StoreError> {
        let mut slot = self
            .shared
            .store
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().is_some_and(StoreApi::is_alive) {
            return Err(StoreError::Attach(SagaError::AlreadyAttached.to_string()));
        }
        *slot = Some(api);
        debug!("saga middleware attached");
        Ok(())
    }

    fn handle(&self, action: A, next: Next<'_, S, A>) -> Result<(), StoreError> {
        next.run(action)
    }

    fn committed(&self, action: &A) {
        // An error here only means no routine is waiting on actions.
        let _ = self.shared.actions.send(action.clone());
    }
}

/// Build an unbound effect-interpreter middleware with default options.
pub fn create_saga_middleware<S, A>() -> SagaMiddleware<S, A>
where
    S: Send + Sync + 'static,
    A: Clone + Send + Sync + 'static,
{
    SagaMiddleware::new()
}

#[cfg(test)]
mod tests;

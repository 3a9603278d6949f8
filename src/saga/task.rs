//! Saga task runtime — scoped execution of effect routines.
//!
//! # Scopes
//!
//! Every running routine owns a [`Scope`]: its cancellation token, a
//! [`TaskTracker`] for the children it forked, and a slot for the first
//! failure reported by one of those children.
//!
//! [`drive`] runs a routine body to completion inside its scope:
//! - cancelling the scope's token aborts the body immediately;
//! - once the body returns, the scope waits for every attached fork;
//! - a failing fork records its error in the parent scope and cancels it, so
//!   the parent and all siblings stop and the parent reports that error.
//!
//! # SagaTask
//!
//! [`start`] spawns the root routine and returns a [`SagaTask`], the only
//! handle to the background effect process. Cancel it to stop everything
//! the root started; `.join()` it to wait for the outcome.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug, error, info, info_span};
use uuid::Uuid;

use crate::store::StoreApi;

use super::SagaError;
use super::effects::SagaContext;

/// How a routine that did not fail came to an end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SagaExit {
    /// The body returned `Ok` and every attached fork finished.
    Completed,
    /// The routine was cancelled before its body returned.
    Cancelled,
}

pub(crate) struct Scope {
    pub(crate) token: CancellationToken,
    pub(crate) forks: TaskTracker,
    failure: Mutex<Option<SagaError>>,
}

impl Scope {
    pub(crate) fn new(token: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            token,
            forks: TaskTracker::new(),
            failure: Mutex::new(None),
        })
    }

    /// Record `err` (first one wins) and cancel the scope.
    pub(crate) fn fail(&self, err: SagaError) {
        {
            let mut slot = self.failure.lock().unwrap_or_else(PoisonError::into_inner);
            if slot.is_none() {
                *slot = Some(err);
            }
        }
        self.token.cancel();
    }

    fn take_failure(&self) -> Option<SagaError> {
        self.failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

/// Run `body` inside `scope`, then wait for the scope's attached forks.
pub(crate) async fn drive<Fut>(scope: Arc<Scope>, body: Fut) -> Result<SagaExit, SagaError>
where
    Fut: Future<Output = Result<(), SagaError>> + Send + 'static,
{
    let body = tokio::spawn(body.in_current_span());
    let abort = body.abort_handle();

    let outcome = tokio::select! {
        biased;

        _ = scope.token.cancelled() => {
            abort.abort();
            Ok(SagaExit::Cancelled)
        }

        joined = body => match joined {
            Ok(Ok(())) => Ok(SagaExit::Completed),
            Ok(Err(SagaError::Cancelled)) => Ok(SagaExit::Cancelled),
            Ok(Err(e)) => Err(e),
            Err(e) if e.is_cancelled() => Ok(SagaExit::Cancelled),
            Err(e) => Err(SagaError::Panicked(e.to_string())),
        },
    };

    if outcome.is_err() {
        scope.token.cancel();
    }
    scope.forks.close();
    scope.forks.wait().await;

    match scope.take_failure() {
        Some(err) => Err(err),
        None => outcome,
    }
}

/// Spawn the root routine on `runtime`.
pub(crate) fn start<S, A, F, Fut>(
    runtime: &Handle,
    store: StoreApi<S, A>,
    actions: broadcast::Sender<A>,
    root: F,
    shutdown: CancellationToken,
) -> SagaTask
where
    S: Send + Sync + 'static,
    A: Clone + Send + Sync + 'static,
    F: FnOnce(SagaContext<S, A>) -> Fut,
    Fut: Future<Output = Result<(), SagaError>> + Send + 'static,
{
    let id = Uuid::now_v7();
    let token = shutdown.child_token();
    let scope = Scope::new(token.clone());
    let detached = TaskTracker::new();

    // The root's first take sees every action dispatched from here on.
    let ctx = SagaContext::root(store, actions, Arc::clone(&scope), detached.clone());
    let body = root(ctx);

    let span = info_span!("saga", task_id = %id);
    let inner = runtime.spawn(
        async move {
            info!("root saga started");
            let result = drive(scope, body).await;
            match &result {
                Ok(exit) => info!(?exit, "root saga finished"),
                Err(e) => error!(error = %e, "root saga failed"),
            }
            result
        }
        .instrument(span),
    );

    SagaTask {
        id,
        token,
        inner,
        detached,
    }
}

/// Handle to the running root routine.
///
/// Dropping it does not stop the routine; call [`SagaTask::cancel`] or
/// cancel the token it was started with.
pub struct SagaTask {
    id: Uuid,
    token: CancellationToken,
    inner: JoinHandle<Result<SagaExit, SagaError>>,
    detached: TaskTracker,
}

impl SagaTask {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn cancel(&self) {
        debug!(task_id = %self.id, "root saga cancellation requested");
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// `true` once the root routine and its attached forks have ended.
    pub fn is_finished(&self) -> bool {
        self.inner.is_finished()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Wait for the root routine, its forks, and any detached spawns.
    pub async fn join(self) -> Result<SagaExit, SagaError> {
        let result = match self.inner.await {
            Ok(r) => r,
            Err(e) => Err(SagaError::Panicked(e.to_string())),
        };
        self.detached.close();
        self.detached.wait().await;
        result
    }

    /// Cancel, then join.
    pub async fn shutdown(self) -> Result<SagaExit, SagaError> {
        self.cancel();
        self.join().await
    }
}

impl fmt::Debug for SagaTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SagaTask")
            .field("id", &self.id)
            .field("cancelled", &self.token.is_cancelled())
            .field("finished", &self.inner.is_finished())
            .finish()
    }
}

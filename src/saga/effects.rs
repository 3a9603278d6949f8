//! Effects available to a running routine through its [`SagaContext`].
//!
//! | effect | meaning |
//! |---|---|
//! | [`put`](SagaContext::put) | dispatch an action into the store |
//! | [`select`](SagaContext::select) | read the current state |
//! | [`take`](SagaContext::take) | wait for the next matching action |
//! | [`action_channel`](SagaContext::action_channel) | buffered stream of actions |
//! | [`fork`](SagaContext::fork) | attached child routine |
//! | [`spawn`](SagaContext::spawn) | detached child routine |
//! | [`take_every`](SagaContext::take_every) | fork a worker per matching action |
//! | [`take_latest`](SagaContext::take_latest) | same, cancelling the previous worker |
//! | [`delay`](SagaContext::delay) | cancellable sleep |
//!
//! Plain async calls need no effect: `.await` them. Races are `tokio::select!`.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug, warn};

use crate::store::StoreApi;

use super::SagaError;
use super::task::{SagaExit, Scope, drive};

async fn recv_matching<A, P>(
    rx: &mut broadcast::Receiver<A>,
    pattern: &P,
    token: &CancellationToken,
) -> Result<A, SagaError>
where
    A: Clone,
    P: Fn(&A) -> bool + ?Sized,
{
    loop {
        let received = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(SagaError::Cancelled),
            received = rx.recv() => received,
        };
        match received {
            Ok(action) if pattern(&action) => return Ok(action),
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "saga fell behind the action stream");
            }
            Err(RecvError::Closed) => return Err(SagaError::ChannelClosed),
        }
    }
}

/// A buffered view of the action stream.
///
/// Unlike repeated [`SagaContext::take`] calls, nothing dispatched between
/// two takes on the same channel is lost (up to the configured capacity).
pub struct ActionChannel<A> {
    rx: broadcast::Receiver<A>,
    token: CancellationToken,
}

impl<A> ActionChannel<A>
where
    A: Clone + Send + 'static,
{
    /// Next action matching `pattern`; non-matching actions are dropped.
    pub async fn take<P>(&mut self, pattern: &P) -> Result<A, SagaError>
    where
        P: Fn(&A) -> bool + ?Sized,
    {
        recv_matching(&mut self.rx, pattern, &self.token).await
    }

    /// Next action, whatever it is.
    pub async fn recv(&mut self) -> Result<A, SagaError> {
        self.take(&|_: &A| true).await
    }
}

/// Handle to a forked or spawned routine.
pub struct ForkHandle {
    token: CancellationToken,
    handle: JoinHandle<Result<SagaExit, SagaError>>,
}

impl ForkHandle {
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the routine and its own forks.
    pub async fn join(self) -> Result<SagaExit, SagaError> {
        match self.handle.await {
            Ok(result) => result,
            Err(e) => Err(SagaError::Panicked(e.to_string())),
        }
    }
}

/// Everything a routine can do. Cheap to clone; clones share the scope.
pub struct SagaContext<S, A> {
    store: StoreApi<S, A>,
    actions: broadcast::Sender<A>,
    scope: Arc<Scope>,
    root_token: CancellationToken,
    detached: TaskTracker,
    /// Subscribed when the context was created; handed to the first take.
    primed: Arc<Mutex<Option<broadcast::Receiver<A>>>>,
}

impl<S, A> Clone for SagaContext<S, A> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            actions: self.actions.clone(),
            scope: Arc::clone(&self.scope),
            root_token: self.root_token.clone(),
            detached: self.detached.clone(),
            primed: Arc::clone(&self.primed),
        }
    }
}

impl<S, A> SagaContext<S, A>
where
    S: Send + Sync + 'static,
    A: Clone + Send + Sync + 'static,
{
    pub(crate) fn root(
        store: StoreApi<S, A>,
        actions: broadcast::Sender<A>,
        scope: Arc<Scope>,
        detached: TaskTracker,
    ) -> Self {
        let primed = Arc::new(Mutex::new(Some(actions.subscribe())));
        Self {
            store,
            root_token: scope.token.clone(),
            actions,
            scope,
            detached,
            primed,
        }
    }

    fn child(&self, scope: Arc<Scope>) -> Self {
        Self {
            store: self.store.clone(),
            actions: self.actions.clone(),
            scope,
            root_token: self.root_token.clone(),
            detached: self.detached.clone(),
            primed: Arc::new(Mutex::new(Some(self.actions.subscribe()))),
        }
    }

    fn receiver(&self) -> broadcast::Receiver<A> {
        self.primed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .unwrap_or_else(|| self.actions.subscribe())
    }

    /// Dispatch `action` into the store.
    pub fn put(&self, action: A) -> Result<(), SagaError> {
        if self.is_cancelled() {
            return Err(SagaError::Cancelled);
        }
        self.store.dispatch(action)?;
        Ok(())
    }

    /// Project the current state through `f`.
    pub fn select<R>(&self, f: impl FnOnce(&S) -> R) -> Result<R, SagaError> {
        let state = self.store.get_state()?;
        Ok(f(&state))
    }

    pub fn state(&self) -> Result<Arc<S>, SagaError> {
        Ok(self.store.get_state()?)
    }

    /// Wait for the next action matching `pattern`.
    ///
    /// Only actions dispatched while waiting are seen, except for the first
    /// take of a context, which also sees anything dispatched since the
    /// context was created.
    pub async fn take<P>(&self, pattern: P) -> Result<A, SagaError>
    where
        P: Fn(&A) -> bool,
    {
        let mut rx = self.receiver();
        recv_matching(&mut rx, &pattern, &self.scope.token).await
    }

    pub fn action_channel(&self) -> ActionChannel<A> {
        ActionChannel {
            rx: self.receiver(),
            token: self.scope.token.clone(),
        }
    }

    /// Sleep for `duration`, or until cancelled.
    pub async fn delay(&self, duration: Duration) -> Result<(), SagaError> {
        tokio::select! {
            biased;
            _ = self.scope.token.cancelled() => Err(SagaError::Cancelled),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.scope.token.is_cancelled()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.scope.token.clone()
    }

    /// Start an attached child routine.
    ///
    /// The child is cancelled with this routine, this routine does not finish
    /// before the child does, and a child failure cancels this routine (and
    /// its other children) and becomes its result.
    pub fn fork<F, Fut>(&self, routine: F) -> ForkHandle
    where
        F: FnOnce(SagaContext<S, A>) -> Fut,
        Fut: Future<Output = Result<(), SagaError>> + Send + 'static,
    {
        let child = Scope::new(self.scope.token.child_token());
        let token = child.token.clone();
        let body = routine(self.child(Arc::clone(&child)));
        let parent = Arc::clone(&self.scope);

        let handle = self.scope.forks.spawn(
            async move {
                let result = drive(child, body).await;
                if let Err(err) = &result {
                    debug!(error = %err, "forked saga failed, aborting parent");
                    parent.fail(err.clone());
                }
                result
            }
            .in_current_span(),
        );
        ForkHandle { token, handle }
    }

    /// Start a detached child routine.
    ///
    /// It outlives this routine and its failure is only logged, but it is
    /// still cancelled when the root task is.
    pub fn spawn<F, Fut>(&self, routine: F) -> ForkHandle
    where
        F: FnOnce(SagaContext<S, A>) -> Fut,
        Fut: Future<Output = Result<(), SagaError>> + Send + 'static,
    {
        let child = Scope::new(self.root_token.child_token());
        let token = child.token.clone();
        let body = routine(self.child(Arc::clone(&child)));

        let handle = self.detached.spawn(
            async move {
                let result = drive(child, body).await;
                if let Err(err) = &result {
                    warn!(error = %err, "spawned saga failed");
                }
                result
            }
            .in_current_span(),
        );
        ForkHandle { token, handle }
    }

    /// Fork `worker` for every action matching `pattern`.
    ///
    /// Subscribes immediately, so actions dispatched right after this call
    /// returns are not missed. The returned handle is the watcher itself.
    pub fn take_every<P, W, Fut>(&self, pattern: P, worker: W) -> ForkHandle
    where
        P: Fn(&A) -> bool + Send + Sync + 'static,
        W: Fn(SagaContext<S, A>, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), SagaError>> + Send + 'static,
    {
        let channel = self.action_channel();
        let worker = Arc::new(worker);
        self.fork(move |ctx| watch_every(ctx, channel, pattern, worker))
    }

    /// Like [`take_every`](Self::take_every), but a new matching action
    /// cancels the worker still running for the previous one.
    pub fn take_latest<P, W, Fut>(&self, pattern: P, worker: W) -> ForkHandle
    where
        P: Fn(&A) -> bool + Send + Sync + 'static,
        W: Fn(SagaContext<S, A>, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), SagaError>> + Send + 'static,
    {
        let channel = self.action_channel();
        let worker = Arc::new(worker);
        self.fork(move |ctx| watch_latest(ctx, channel, pattern, worker))
    }
}

async fn watch_every<S, A, P, W, Fut>(
    ctx: SagaContext<S, A>,
    mut channel: ActionChannel<A>,
    pattern: P,
    worker: Arc<W>,
) -> Result<(), SagaError>
where
    S: Send + Sync + 'static,
    A: Clone + Send + Sync + 'static,
    P: Fn(&A) -> bool + Send + Sync + 'static,
    W: Fn(SagaContext<S, A>, A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), SagaError>> + Send + 'static,
{
    loop {
        let action = channel.take(&pattern).await?;
        let worker = Arc::clone(&worker);
        ctx.fork(move |c| worker(c, action));
    }
}

async fn watch_latest<S, A, P, W, Fut>(
    ctx: SagaContext<S, A>,
    mut channel: ActionChannel<A>,
    pattern: P,
    worker: Arc<W>,
) -> Result<(), SagaError>
where
    S: Send + Sync + 'static,
    A: Clone + Send + Sync + 'static,
    P: Fn(&A) -> bool + Send + Sync + 'static,
    W: Fn(SagaContext<S, A>, A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), SagaError>> + Send + 'static,
{
    let mut running: Option<ForkHandle> = None;
    loop {
        let action = channel.take(&pattern).await?;
        if let Some(previous) = running.take() {
            previous.cancel();
        }
        let worker = Arc::clone(&worker);
        running = Some(ctx.fork(move |c| worker(c, action)));
    }
}

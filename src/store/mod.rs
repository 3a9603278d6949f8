//! State container — one state value, replaced by a reducer on every action.
//!
//! A [`Store`] is assembled by [`create_store`] from a [`Reducer`], an
//! explicit initial state, and an optional [`Enhancer`] carrying the
//! middleware chain. Every middleware is attached before `create_store`
//! returns, so no action can reach the reducer without passing the chain.
//!
//! # Dispatch
//!
//! Dispatches are serialized by a writer lock held only for the reducer step.
//! Readers never wait on a running reducer: [`Store::get_state`] returns the
//! last committed snapshot. Middleware commit hooks
//! ([`Middleware::committed`]) run under the writer lock, in reducer order.
//! Listeners run after the writer lock is released, so they may dispatch
//! again.

pub mod logging;
pub mod middleware;

use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, RwLock, Weak};

use thiserror::Error;
use tracing::{debug, error, trace};

pub use logging::TracingMiddleware;
pub use middleware::{Enhancer, Middleware, Next, StoreApi, apply_middleware};

/// Errors surfaced by [`Store::dispatch`] and store construction.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("dispatching while middleware is being constructed is not allowed")]
    NotReady,

    #[error("store has been dropped")]
    Dropped,

    #[error("reducers may not dispatch actions")]
    DispatchFromReducer,

    #[error("reducers may not replace the reducer")]
    ReplaceFromReducer,

    #[error("reducer panicked: {0}")]
    ReducerPanicked(String),

    #[error("middleware attach failed: {0}")]
    Attach(String),
}

/// A pure state transition: `(state, action) -> state`.
///
/// Implemented for every `Fn(&S, &A) -> S` closure.
pub trait Reducer<S, A>: Send + Sync + 'static {
    fn reduce(&self, state: &S, action: &A) -> S;
}

impl<S, A, F> Reducer<S, A> for F
where
    F: Fn(&S, &A) -> S + Send + Sync + 'static,
{
    fn reduce(&self, state: &S, action: &A) -> S {
        self(state, action)
    }
}

type Listener<S> = Arc<dyn Fn(&S) + Send + Sync>;

thread_local! {
    static IN_REDUCER: Cell<bool> = const { Cell::new(false) };
}

/// Marks the current thread as inside the commit step (reducer and commit
/// hooks) until dropped.
struct CommitGuard;

impl CommitGuard {
    fn enter() -> Self {
        IN_REDUCER.with(|flag| flag.set(true));
        Self
    }
}

impl Drop for CommitGuard {
    fn drop(&mut self) {
        IN_REDUCER.with(|flag| flag.set(false));
    }
}

fn in_reducer() -> bool {
    IN_REDUCER.with(Cell::get)
}

pub(crate) struct Inner<S, A> {
    state: RwLock<Arc<S>>,
    reducer: RwLock<Arc<dyn Reducer<S, A>>>,
    writer: Mutex<()>,
    listeners: Mutex<Vec<(u64, Listener<S>)>>,
    next_listener_id: AtomicU64,
    /// Set once, after every middleware has attached.
    chain: OnceLock<Vec<Box<dyn Middleware<S, A>>>>,
}

impl<S, A> Inner<S, A>
where
    S: Send + Sync + 'static,
    A: Send + 'static,
{
    fn new(reducer: Arc<dyn Reducer<S, A>>, initial: S) -> Self {
        Self {
            state: RwLock::new(Arc::new(initial)),
            reducer: RwLock::new(reducer),
            writer: Mutex::new(()),
            listeners: Mutex::new(Vec::new()),
            next_listener_id: AtomicU64::new(0),
            chain: OnceLock::new(),
        }
    }

    pub(crate) fn dispatch(&self, action: A) -> Result<(), StoreError> {
        if in_reducer() {
            return Err(StoreError::DispatchFromReducer);
        }
        let chain = self.chain.get().ok_or(StoreError::NotReady)?;
        Next::new(self, chain).run(action)
    }

    /// Terminal step of the middleware chain.
    pub(crate) fn reduce(&self, action: A) -> Result<(), StoreError> {
        let next = {
            let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
            let reducer = Arc::clone(&*self.reducer.read().unwrap_or_else(PoisonError::into_inner));
            let current = self.get_state();

            let _commit = CommitGuard::enter();
            let result = panic::catch_unwind(AssertUnwindSafe(|| reducer.reduce(&current, &action)));

            let next = match result {
                Ok(state) => Arc::new(state),
                Err(payload) => {
                    let msg = panic_message(payload.as_ref());
                    error!(error = %msg, "reducer panicked; state left unchanged");
                    return Err(StoreError::ReducerPanicked(msg));
                }
            };
            *self.state.write().unwrap_or_else(PoisonError::into_inner) = Arc::clone(&next);

            // Still under the writer lock: hooks see actions in commit order,
            // even when a listener or another thread dispatches next.
            if let Some(chain) = self.chain.get() {
                for middleware in chain {
                    middleware.committed(&action);
                }
            }
            next
        };
        trace!("state committed");
        self.notify(&next);
        Ok(())
    }

    pub(crate) fn get_state(&self) -> Arc<S> {
        Arc::clone(&*self.state.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn notify(&self, state: &S) {
        // Snapshot so listeners may (un)subscribe while being notified.
        let snapshot: Vec<Listener<S>> = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in snapshot {
            listener(state);
        }
    }

    fn remove_listener(&self, id: u64) -> bool {
        let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Handle returned by [`Store::subscribe`].
///
/// Dropping it does not unsubscribe; call [`Subscription::unsubscribe`].
pub struct Subscription {
    id: u64,
    remove: Option<Box<dyn FnOnce() -> bool + Send + Sync>>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Remove the listener. Returns `true` the first time it actually
    /// removed something; later calls are no-ops.
    pub fn unsubscribe(&mut self) -> bool {
        self.remove.take().is_some_and(|remove| remove())
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("active", &self.remove.is_some())
            .finish()
    }
}

/// Shared handle to a state container. Cloning is cheap.
pub struct Store<S, A> {
    inner: Arc<Inner<S, A>>,
}

impl<S, A> Clone for Store<S, A> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S, A> Store<S, A>
where
    S: Send + Sync + 'static,
    A: Send + 'static,
{
    /// A store with an empty middleware chain.
    pub fn new(reducer: impl Reducer<S, A>, initial: S) -> Self {
        let inner = Arc::new(Inner::new(Arc::new(reducer), initial));
        let _ = inner.chain.set(Vec::new());
        Self { inner }
    }

    /// Send `action` through the middleware chain and, unless a middleware
    /// swallows it, into the reducer. When this returns `Ok`, the state is
    /// `reducer(state_before, action)`.
    pub fn dispatch(&self, action: A) -> Result<(), StoreError> {
        self.inner.dispatch(action)
    }

    pub fn get_state(&self) -> Arc<S> {
        self.inner.get_state()
    }

    /// Run `listener` after every action that reaches the reducer, with the
    /// state that action produced.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&S) + Send + Sync + 'static,
    {
        let id = self.inner.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(listener)));

        let weak: Weak<Inner<S, A>> = Arc::downgrade(&self.inner);
        Subscription {
            id,
            remove: Some(Box::new(move || {
                weak.upgrade()
                    .is_some_and(|inner| inner.remove_listener(id))
            })),
        }
    }

    /// Swap the reducer. Waits for any in-flight reducer step to finish.
    ///
    /// Fails with [`StoreError::ReplaceFromReducer`] when called from inside
    /// a reducer or a commit hook.
    pub fn replace_reducer(&self, reducer: impl Reducer<S, A>) -> Result<(), StoreError> {
        if in_reducer() {
            return Err(StoreError::ReplaceFromReducer);
        }
        let _writer = self.inner.writer.lock().unwrap_or_else(PoisonError::into_inner);
        *self
            .inner
            .reducer
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Arc::new(reducer);
        debug!("reducer replaced");
        Ok(())
    }

    /// Weak handle for code that must not keep the store alive.
    pub fn api(&self) -> StoreApi<S, A> {
        StoreApi::new(Arc::downgrade(&self.inner))
    }

    pub fn listener_count(&self) -> usize {
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn middleware_count(&self) -> usize {
        self.inner.chain.get().map_or(0, Vec::len)
    }
}

/// Build a store, attaching the enhancer's middleware chain before returning.
///
/// Middleware may keep the [`StoreApi`] passed to `attach`, but dispatching
/// through it before this function returns fails with
/// [`StoreError::NotReady`].
pub fn create_store<S, A>(
    reducer: impl Reducer<S, A>,
    initial: S,
    enhancer: Option<Enhancer<S, A>>,
) -> Result<Store<S, A>, StoreError>
where
    S: Send + Sync + 'static,
    A: Send + 'static,
{
    let inner = Arc::new(Inner::new(Arc::new(reducer), initial));
    let middlewares = enhancer.map(Enhancer::into_middlewares).unwrap_or_default();

    let api = StoreApi::new(Arc::downgrade(&inner));
    for m in &middlewares {
        m.attach(api.clone())?;
    }

    debug!(middlewares = middlewares.len(), "store assembled");
    let _ = inner.chain.set(middlewares);
    Ok(Store { inner })
}

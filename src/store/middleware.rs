//! Middleware chain — code that sits between `dispatch` and the reducer.
//!
//! Each [`Middleware`] receives the action plus a [`Next`] continuation.
//! Calling [`Next::run`] forwards the action down the chain; the last link is
//! the reducer. A middleware that never calls `next` swallows the action.
//!
//! Middleware that needs to dispatch or read state on its own (the effect
//! interpreter does both) keeps the [`StoreApi`] handed to
//! [`Middleware::attach`] at store construction.

use std::sync::{Arc, Weak};

use super::{Inner, StoreError};

/// A link in the dispatch chain.
pub trait Middleware<S, A>: Send + Sync + 'static {
    /// Called once while the store is being assembled, before any action can
    /// be dispatched. Dispatching through `api` from here is refused.
    fn attach(&self, _api: StoreApi<S, A>) -> Result<(), StoreError> {
        Ok(())
    }

    fn handle(&self, action: A, next: Next<'_, S, A>) -> Result<(), StoreError>;

    /// Called for every action the reducer applied, right after the new
    /// state is committed and before listeners run. Calls arrive in commit
    /// order. Runs under the store's writer lock: dispatching from here fails
    /// with [`StoreError::DispatchFromReducer`].
    fn committed(&self, _action: &A) {}
}

/// The remainder of the chain after the current middleware.
pub struct Next<'a, S, A> {
    store: &'a Inner<S, A>,
    rest: &'a [Box<dyn Middleware<S, A>>],
}

impl<'a, S, A> Next<'a, S, A>
where
    S: Send + Sync + 'static,
    A: Send + 'static,
{
    pub(crate) fn new(store: &'a Inner<S, A>, chain: &'a [Box<dyn Middleware<S, A>>]) -> Self {
        Self { store, rest: chain }
    }

    pub fn run(self, action: A) -> Result<(), StoreError> {
        match self.rest.split_first() {
            Some((head, rest)) => head.handle(
                action,
                Next {
                    store: self.store,
                    rest,
                },
            ),
            None => self.store.reduce(action),
        }
    }

    /// State as it stands before this action reaches the reducer.
    pub fn state(&self) -> Arc<S> {
        self.store.get_state()
    }
}

/// Weak handle to a store, given to middleware and effect routines.
///
/// It never keeps the store alive; once the store is dropped every call
/// fails with [`StoreError::Dropped`].
pub struct StoreApi<S, A> {
    inner: Weak<Inner<S, A>>,
}

impl<S, A> Clone for StoreApi<S, A> {
    fn clone(&self) -> Self {
        Self {
            inner: Weak::clone(&self.inner),
        }
    }
}

impl<S, A> StoreApi<S, A>
where
    S: Send + Sync + 'static,
    A: Send + 'static,
{
    pub(crate) fn new(inner: Weak<Inner<S, A>>) -> Self {
        Self { inner }
    }

    /// Dispatch through the full chain, including the calling middleware.
    pub fn dispatch(&self, action: A) -> Result<(), StoreError> {
        self.inner
            .upgrade()
            .ok_or(StoreError::Dropped)?
            .dispatch(action)
    }

    pub fn get_state(&self) -> Result<Arc<S>, StoreError> {
        Ok(self.inner.upgrade().ok_or(StoreError::Dropped)?.get_state())
    }

    pub fn is_alive(&self) -> bool {
        self.inner.strong_count() > 0
    }
}

/// An ordered middleware chain, applied by
/// [`create_store`](super::create_store). The first middleware sees each
/// action first.
pub struct Enhancer<S, A> {
    middlewares: Vec<Box<dyn Middleware<S, A>>>,
}

impl<S, A> Default for Enhancer<S, A> {
    fn default() -> Self {
        Self {
            middlewares: Vec::new(),
        }
    }
}

impl<S, A> Enhancer<S, A>
where
    S: Send + Sync + 'static,
    A: Send + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a middleware to the end of the chain.
    pub fn with(mut self, middleware: impl Middleware<S, A>) -> Self {
        self.middlewares.push(Box::new(middleware));
        self
    }

    /// Run `self`'s chain first, then `other`'s.
    pub fn compose(mut self, other: Enhancer<S, A>) -> Self {
        self.middlewares.extend(other.middlewares);
        self
    }

    pub fn len(&self) -> usize {
        self.middlewares.len()
    }

    pub fn is_empty(&self) -> bool {
        self.middlewares.is_empty()
    }

    pub(crate) fn into_middlewares(self) -> Vec<Box<dyn Middleware<S, A>>> {
        self.middlewares
    }
}

/// Build an [`Enhancer`] from an ordered list of middleware.
pub fn apply_middleware<S, A>(middlewares: Vec<Box<dyn Middleware<S, A>>>) -> Enhancer<S, A> {
    Enhancer { middlewares }
}

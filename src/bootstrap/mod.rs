//! Bootstrap layer — assembles the store and its effect process.
//!
//! - **logger** — tracing-subscriber initialisation.
//! - [`Bootstrapper`] — builds the effect middleware, the store bound to it,
//!   and starts the root routine, in that order:
//!
//! ```text
//! Unconstructed → MiddlewareCreated → ContainerBound → RootRunning
//! ```
//!
//! The result is an [`AppContext`] owned by the caller and passed to whatever
//! needs the store. There is no process-wide instance.

pub mod logger;

use std::fmt;
use std::future::Future;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::AppError;
use crate::saga::{SagaContext, SagaError, SagaExit, SagaMiddleware, SagaOptions, SagaTask};
use crate::store::{Enhancer, Middleware, Reducer, Store, create_store};

/// Where a bootstrap sequence stands. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BootPhase {
    Unconstructed,
    MiddlewareCreated,
    ContainerBound,
    RootRunning,
}

impl fmt::Display for BootPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unconstructed => "unconstructed",
            Self::MiddlewareCreated => "middleware-created",
            Self::ContainerBound => "container-bound",
            Self::RootRunning => "root-running",
        };
        f.write_str(s)
    }
}

fn advance(phase: &mut BootPhase, next: BootPhase) {
    debug_assert!(next > *phase, "boot phase moved backwards: {phase} -> {next}");
    debug!(from = %phase, to = %next, "boot phase");
    *phase = next;
}

/// Builder for one store + middleware + root routine triple.
pub struct Bootstrapper<S, A, R> {
    reducer: R,
    initial: S,
    middlewares: Enhancer<S, A>,
    saga_options: SagaOptions,
    shutdown: CancellationToken,
}

impl<S, A, R> Bootstrapper<S, A, R>
where
    S: Send + Sync + 'static,
    A: Clone + Send + Sync + 'static,
    R: Reducer<S, A>,
{
    pub fn new(reducer: R, initial: S) -> Self {
        Self {
            reducer,
            initial,
            middlewares: Enhancer::new(),
            saga_options: SagaOptions::default(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Add a middleware ahead of the effect interpreter.
    pub fn with_middleware(mut self, middleware: impl Middleware<S, A>) -> Self {
        self.middlewares = self.middlewares.with(middleware);
        self
    }

    pub fn with_saga_options(mut self, options: SagaOptions) -> Self {
        self.saga_options = options;
        self
    }

    /// Tie the root routine to an outer shutdown token (e.g. Ctrl-C).
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Run the three bootstrap steps and hand back the assembled context.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn start<F, Fut>(self, root: F) -> Result<AppContext<S, A>, AppError>
    where
        F: FnOnce(SagaContext<S, A>) -> Fut,
        Fut: Future<Output = Result<(), SagaError>> + Send + 'static,
    {
        let Self {
            reducer,
            initial,
            middlewares,
            saga_options,
            shutdown,
        } = self;
        let mut phase = BootPhase::Unconstructed;

        let saga = SagaMiddleware::with_options(saga_options);
        advance(&mut phase, BootPhase::MiddlewareCreated);

        let enhancer = middlewares.with(saga.clone());
        let middleware_count = enhancer.len();
        let store = create_store(reducer, initial, Some(enhancer))?;
        advance(&mut phase, BootPhase::ContainerBound);

        let task = saga.run_with_shutdown(root, shutdown.clone())?;
        advance(&mut phase, BootPhase::RootRunning);

        info!(task_id = %task.id(), middleware_count, "store bootstrapped");

        Ok(AppContext {
            store,
            saga,
            task,
            shutdown,
            phase,
        })
    }
}

/// Shorthand for `Bootstrapper::new(reducer, initial).start(root)`.
pub fn bootstrap<S, A, R, F, Fut>(
    reducer: R,
    initial: S,
    root: F,
) -> Result<AppContext<S, A>, AppError>
where
    S: Send + Sync + 'static,
    A: Clone + Send + Sync + 'static,
    R: Reducer<S, A>,
    F: FnOnce(SagaContext<S, A>) -> Fut,
    Fut: Future<Output = Result<(), SagaError>> + Send + 'static,
{
    Bootstrapper::new(reducer, initial).start(root)
}

/// The assembled application: exactly one store, the middleware bound to
/// it, and the running root routine.
pub struct AppContext<S, A> {
    store: Store<S, A>,
    saga: SagaMiddleware<S, A>,
    task: SagaTask,
    shutdown: CancellationToken,
    phase: BootPhase,
}

impl<S, A> AppContext<S, A>
where
    S: Send + Sync + 'static,
    A: Clone + Send + Sync + 'static,
{
    pub fn store(&self) -> &Store<S, A> {
        &self.store
    }

    pub fn middleware(&self) -> &SagaMiddleware<S, A> {
        &self.saga
    }

    pub fn task(&self) -> &SagaTask {
        &self.task
    }

    pub fn phase(&self) -> BootPhase {
        self.phase
    }

    /// The outer token the root routine was started under.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Cancel the root routine and wait for it and everything it started.
    /// The store stays usable through any clones the caller kept.
    pub async fn shutdown(self) -> Result<SagaExit, AppError> {
        info!(task_id = %self.task.id(), "shutting down root saga");
        Ok(self.task.shutdown().await?)
    }

    /// Wait for the root routine to end on its own.
    pub async fn join(self) -> Result<SagaExit, AppError> {
        Ok(self.task.join().await?)
    }
}

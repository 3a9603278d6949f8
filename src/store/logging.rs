//! Action logging middleware.

use std::fmt::Debug;
use std::time::Instant;

use tracing::{Level, debug, warn};

use super::{Middleware, Next, StoreError};

/// Logs every action and how long the rest of the chain took to handle it.
///
/// Place it first in the chain so the timing covers every later middleware
/// and the reducer.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMiddleware;

impl<S, A> Middleware<S, A> for TracingMiddleware
where
    S: Send + Sync + 'static,
    A: Debug + Send + 'static,
{
    fn handle(&self, action: A, next: Next<'_, S, A>) -> Result<(), StoreError> {
        let label = tracing::enabled!(Level::DEBUG).then(|| format!("{action:?}"));
        let started = Instant::now();

        let result = next.run(action);

        let elapsed_us = u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX);
        match &result {
            Ok(()) => {
                if let Some(action) = label.as_deref() {
                    debug!(action, elapsed_us, "action handled");
                }
            }
            Err(e) => {
                warn!(action = label.as_deref().unwrap_or("-"), error = %e, "action failed");
            }
        }
        result
    }
}

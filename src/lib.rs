//! saga-store — a Redux-style store with an async effect interpreter.
//!
//! - [`store`] — the state container, reducers, and the middleware chain.
//! - [`saga`] — the effect-interpreter middleware and the routines it runs.
//! - [`bootstrap`] — assembles store + middleware + root routine into an
//!   [`AppContext`], plus logger setup.
//! - [`core`] — configuration and the application error type.
//! - [`counter`] — the counter app driven by the `saga-store` binary.

pub mod bootstrap;
pub mod core;
pub mod counter;
pub mod saga;
pub mod store;

pub use crate::bootstrap::{AppContext, BootPhase, Bootstrapper, bootstrap, logger};
pub use crate::core::{config, error};

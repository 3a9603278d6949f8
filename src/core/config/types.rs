//! Public configuration types.
//!
//! These are the resolved, ready-to-use structs the bootstrapper consumes.
//! Raw TOML deserialization types live in `raw.rs`.

use std::path::PathBuf;

use crate::saga::SagaOptions;

/// Effect middleware configuration (`[saga]`).
#[derive(Debug, Clone)]
pub struct SagaConfig {
    /// Capacity of the broadcast channel that feeds dispatched actions to
    /// running routines. A routine that falls further behind skips actions.
    pub channel_capacity: usize,
}

impl SagaConfig {
    pub fn options(&self) -> SagaOptions {
        SagaOptions {
            channel_capacity: self.channel_capacity,
        }
    }
}

/// Shutdown behaviour (`[shutdown]`).
#[derive(Debug, Clone)]
pub struct ShutdownConfig {
    /// How long to wait for the root routine to wind down after cancellation.
    pub grace_ms: u64,
}

/// Fully-resolved runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub app_name: String,
    pub log_level: String,
    /// Append logs to this file instead of stderr.
    pub log_file: Option<PathBuf>,
    pub saga: SagaConfig,
    pub shutdown: ShutdownConfig,
}

//! Configuration loading with env-var overrides.
//!
//! Reads `config/default.toml` relative to the current working directory,
//! then applies `SAGA_STORE_LOG_LEVEL` and `SAGA_STORE_CHANNEL_CAPACITY`
//! env overrides.
//!
//! # Module layout
//!
//! - **types** — Public configuration structs (`Config`, `SagaConfig`, …).
//! - **raw** — Raw TOML deserialization types; mirror the file shape and use
//!   serde defaults. Kept private.
//! - **load** — Loading logic: `merge_toml`, `load_raw_merged`, `load`,
//!   `load_from`.

mod load;
mod raw;
mod types;

pub use load::{ENV_CHANNEL_CAPACITY, ENV_LOG_LEVEL, Overrides, load, load_from};
pub use types::*;

impl Default for Config {
    fn default() -> Self {
        Self {
            app_name: raw::default_app_name(),
            log_level: raw::default_log_level(),
            log_file: None,
            saga: SagaConfig {
                channel_capacity: raw::default_channel_capacity(),
            },
            shutdown: ShutdownConfig {
                grace_ms: raw::default_grace_ms(),
            },
        }
    }
}

//! Raw TOML deserialization types.
//!
//! These structs mirror the TOML file shape and use `serde` defaults.
//! The `load` module converts them into the public `types` structs.

use serde::Deserialize;

// ── Top-level ────────────────────────────────────────────────────────────────

/// Raw TOML shape — serde target before resolution.
#[derive(Deserialize, Default)]
pub(super) struct RawConfig {
    #[serde(default)]
    pub runtime: RawRuntime,
    #[serde(default)]
    pub saga: RawSaga,
    #[serde(default)]
    pub shutdown: RawShutdown,
}

#[derive(Deserialize)]
pub(super) struct RawRuntime {
    #[serde(default = "default_app_name")]
    pub app_name: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_file: Option<String>,
}

impl Default for RawRuntime {
    fn default() -> Self {
        Self {
            app_name: default_app_name(),
            log_level: default_log_level(),
            log_file: None,
        }
    }
}

// ── Saga ─────────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub(super) struct RawSaga {
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for RawSaga {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
        }
    }
}

// ── Shutdown ─────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub(super) struct RawShutdown {
    #[serde(default = "default_grace_ms")]
    pub grace_ms: u64,
}

impl Default for RawShutdown {
    fn default() -> Self {
        Self {
            grace_ms: default_grace_ms(),
        }
    }
}

// ── Default functions (used by serde) ────────────────────────────────────────

pub(super) fn default_app_name() -> String {
    "saga-store".to_string()
}

pub(super) fn default_log_level() -> String {
    "info".to_string()
}

pub(super) fn default_channel_capacity() -> usize {
    256
}

pub(super) fn default_grace_ms() -> u64 {
    2_000
}

//! Configuration loading with env-var overrides.
//!
//! Reads TOML files, supports `[meta] base = "..."` inheritance chains,
//! and applies `SAGA_STORE_LOG_LEVEL` and `SAGA_STORE_CHANNEL_CAPACITY`
//! env overrides.

use std::collections::HashSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::AppError;

use super::raw::RawConfig;
use super::types::*;

pub const ENV_LOG_LEVEL: &str = "SAGA_STORE_LOG_LEVEL";
pub const ENV_CHANNEL_CAPACITY: &str = "SAGA_STORE_CHANNEL_CAPACITY";

/// Values that take precedence over whatever the TOML file says.
/// Tests build this directly instead of mutating env vars.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub log_level: Option<String>,
    pub channel_capacity: Option<String>,
}

impl Overrides {
    pub fn from_env() -> Self {
        Self {
            log_level: env::var(ENV_LOG_LEVEL).ok(),
            channel_capacity: env::var(ENV_CHANNEL_CAPACITY).ok(),
        }
    }
}

/// Deep-merge two TOML values.
/// Tables are merged recursively — the overlay only needs to specify keys that
/// differ from the base. For every other type (string, integer, array, …)
/// the overlay value replaces the base value wholesale.
fn merge_toml(base: toml::Value, overlay: toml::Value) -> toml::Value {
    match (base, overlay) {
        (toml::Value::Table(mut base_tbl), toml::Value::Table(overlay_tbl)) => {
            for (key, ov_val) in overlay_tbl {
                let merged = match base_tbl.remove(&key) {
                    Some(base_val) => merge_toml(base_val, ov_val),
                    None => ov_val,
                };
                base_tbl.insert(key, merged);
            }
            toml::Value::Table(base_tbl)
        }
        (_, overlay) => overlay,
    }
}

/// Read a config file, follow any `[meta] base = "..."` chain, and return the
/// fully merged `toml::Value`. `visited` carries canonicalized paths already
/// seen in this chain so circular references are caught early.
fn load_raw_merged(path: &Path, visited: &mut HashSet<PathBuf>) -> Result<toml::Value, AppError> {
    let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    if !visited.insert(canonical) {
        return Err(AppError::Config(format!(
            "circular base reference detected at: {}",
            path.display()
        )));
    }

    let raw = fs::read_to_string(path)
        .map_err(|e| AppError::Config(format!("cannot read {}: {e}", path.display())))?;

    let overlay_val: toml::Value = toml::from_str(&raw)
        .map_err(|e| AppError::Config(format!("parse error in {}: {e}", path.display())))?;

    if let Some(base_str) = overlay_val
        .get("meta")
        .and_then(|m| m.get("base"))
        .and_then(|b| b.as_str())
    {
        let base_path = if Path::new(base_str).is_absolute() {
            PathBuf::from(base_str)
        } else {
            path.parent().unwrap_or(Path::new(".")).join(base_str)
        };
        let base_val = load_raw_merged(&base_path, visited)?;
        Ok(merge_toml(base_val, overlay_val))
    } else {
        Ok(overlay_val)
    }
}

/// Load config from the given path, or `config/default.toml`, then apply env-var overrides.
/// If no path is given and `config/default.toml` does not exist, the built-in defaults are used.
pub fn load(config_path: Option<&str>) -> Result<Config, AppError> {
    let overrides = Overrides::from_env();

    if let Some(path) = config_path {
        return load_from(Path::new(path), &overrides);
    }

    let default_path = Path::new("config/default.toml");
    if default_path.exists() {
        load_from(default_path, &overrides)
    } else {
        resolve(RawConfig::default(), &overrides)
    }
}

/// Load a specific file (following its base chain) and apply `overrides`.
pub fn load_from(path: &Path, overrides: &Overrides) -> Result<Config, AppError> {
    let merged_val = load_raw_merged(path, &mut HashSet::new())?;

    let parsed: RawConfig = Deserialize::deserialize(merged_val).map_err(|e: toml::de::Error| {
        AppError::Config(format!("config error in {}: {e}", path.display()))
    })?;

    resolve(parsed, overrides)
}

fn resolve(parsed: RawConfig, overrides: &Overrides) -> Result<Config, AppError> {
    let r = parsed.runtime;

    let log_level = overrides.log_level.clone().unwrap_or(r.log_level);

    let channel_capacity = match overrides.channel_capacity.as_deref() {
        Some(v) => v.trim().parse::<usize>().map_err(|e| {
            AppError::Config(format!("invalid {ENV_CHANNEL_CAPACITY} '{v}': {e}"))
        })?,
        None => parsed.saga.channel_capacity,
    };
    if channel_capacity == 0 {
        return Err(AppError::Config(
            "saga.channel_capacity must be greater than zero".into(),
        ));
    }

    Ok(Config {
        app_name: r.app_name,
        log_level,
        log_file: r.log_file.map(PathBuf::from),
        saga: SagaConfig { channel_capacity },
        shutdown: ShutdownConfig {
            grace_ms: parsed.shutdown.grace_ms,
        },
    })
}

//! Configuration loading with env-var overrides.
//!
//! Reads TOML files, supports `[meta] base = "..."` inheritance chains,
//! and applies `TRELLIS_LOG_LEVEL` and `TRELLIS_LISTEN` env overrides.

use std::collections::HashSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::core::error::AppError;
use crate::protocol::Role;

use super::raw::RawConfig;
use super::types::*;

/// Deep-merge two TOML values. Tables merge recursively; any other overlay
/// value replaces the base value wholesale.
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

/// Read a config file and fold in its `[meta] base` chain. `visited` holds
/// the canonical paths already seen so a cycle fails instead of recursing.
fn load_raw_merged(path: &Path, visited: &mut HashSet<PathBuf>) -> Result<toml::Value, AppError> {
    let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    if !visited.insert(canonical) {
        return Err(AppError::Config(format!(
            "circular base reference detected at: {}",
            path.display()
        )));
    }

    let text = fs::read_to_string(path)
        .map_err(|e| AppError::Config(format!("cannot read {}: {e}", path.display())))?;
    let overlay: toml::Value = toml::from_str(&text)
        .map_err(|e| AppError::Config(format!("parse error in {}: {e}", path.display())))?;

    let base = overlay
        .get("meta")
        .and_then(|m| m.get("base"))
        .and_then(|b| b.as_str())
        .map(|b| {
            if Path::new(b).is_absolute() {
                PathBuf::from(b)
            } else {
                path.parent().unwrap_or(Path::new(".")).join(b)
            }
        });

    match base {
        Some(base_path) => Ok(merge_toml(load_raw_merged(&base_path, visited)?, overlay)),
        None => Ok(overlay),
    }
}

/// Load config from the given path, or `config/default.toml`, then apply
/// env-var overrides. With no path and no default file, every field takes
/// its built-in default.
pub fn load(config_path: Option<&str>) -> Result<Config, AppError> {
    let log_level_override = env::var("TRELLIS_LOG_LEVEL").ok();
    let listen_override = env::var("TRELLIS_LISTEN").ok();

    let default_path = Path::new("config/default.toml");
    match config_path {
        Some(path) => load_from(
            Path::new(path),
            log_level_override.as_deref(),
            listen_override.as_deref(),
        ),
        None if default_path.exists() => load_from(
            default_path,
            log_level_override.as_deref(),
            listen_override.as_deref(),
        ),
        None => resolve(
            RawConfig::default(),
            log_level_override.as_deref(),
            listen_override.as_deref(),
        ),
    }
}

/// Load an explicit file. Tests pass overrides here instead of mutating
/// env vars.
pub fn load_from(
    path: &Path,
    log_level_override: Option<&str>,
    listen_override: Option<&str>,
) -> Result<Config, AppError> {
    let merged = load_raw_merged(path, &mut HashSet::new())?;
    let parsed: RawConfig = Deserialize::deserialize(merged).map_err(|e: toml::de::Error| {
        AppError::Config(format!("config error in {}: {e}", path.display()))
    })?;
    resolve(parsed, log_level_override, listen_override)
}

fn resolve(
    raw: RawConfig,
    log_level_override: Option<&str>,
    listen_override: Option<&str>,
) -> Result<Config, AppError> {
    let c = raw.controller;
    let m = raw.mastership;
    let o = raw.openflow;

    let controller_id = c
        .controller_id
        .filter(|id| !id.trim().is_empty())
        .or_else(|| env::var("HOSTNAME").ok().filter(|h| !h.is_empty()))
        .unwrap_or_else(|| "localhost".to_string());

    let local_role: Role = m
        .local_role
        .parse()
        .map_err(|e| AppError::Config(format!("mastership.local_role: {e}")))?;

    if o.inbound_queue == 0 {
        return Err(AppError::Config(
            "openflow.inbound_queue must be at least 1".into(),
        ));
    }
    if o.idle_timeout_secs == 0 {
        return Err(AppError::Config(
            "openflow.idle_timeout_secs must be at least 1".into(),
        ));
    }

    Ok(Config {
        controller_id,
        log_level: log_level_override.unwrap_or(&c.log_level).to_string(),
        log_file: c.log_file.as_deref().map(expand_home),
        openflow: OpenFlowConfig {
            listen: listen_override.unwrap_or(&o.listen).to_string(),
            idle_timeout: Duration::from_secs(o.idle_timeout_secs),
            read_timeout: Duration::from_secs(o.read_timeout_secs.max(o.idle_timeout_secs)),
            handshake_timeout: Duration::from_secs(o.handshake_timeout_secs),
            inbound_queue: o.inbound_queue,
        },
        mastership: MastershipConfig {
            role_support: m.role_support,
            local_role,
            always_clear_flows: m.always_clear_flows,
            role_request_timeout: (m.role_request_timeout_ms > 0)
                .then(|| Duration::from_millis(m.role_request_timeout_ms)),
            control_request_retry_yield: Duration::from_millis(m.control_request_retry_yield_ms),
        },
        events: EventsConfig {
            queue_capacity: raw.events.queue_capacity,
        },
    })
}

/// Expand a leading `~` to the user's home directory.
/// Paths without `~` are returned unchanged.
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    PathBuf::from(path)
}

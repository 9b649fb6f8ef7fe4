//! Configuration resolution for ccpool.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (`<config dir>/ccpool/settings.json`)
//! 3. Project config (`.ccpool/settings.json`)
//! 4. Environment variables
//! 5. CLI arguments (highest priority, applied by the binary)
//!
//! Files are merged key by key, so a project file that only sets
//! `pool.timeout_secs` keeps every other value from the global file.

use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Extra subprocesses on top of the CPU count. Compiler invocations spend part
/// of their time on I/O, so a small oversubscription keeps the cores busy.
pub const OVERSUBSCRIPTION: usize = 2;

/// Default build timeout (5 minutes).
pub const DEFAULT_TIMEOUT_SECS: u64 = 300;

/// Default sleep between sweeps while draining.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 5;

/// Floor for the sweep interval. `0` would turn draining into a busy spin.
pub const MIN_POLL_INTERVAL_MS: u64 = 1;

/// Complete ccpool configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct Config {
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub logging: LogConfig,
}

/// Scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum number of concurrent compiler processes. `0` selects
    /// [`default_max_concurrency`].
    pub max_concurrency: usize,
    /// Wall-clock limit for draining the pool, in seconds.
    pub timeout_secs: u64,
    /// Sleep between sweeps while draining, in milliseconds.
    pub poll_interval_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 0,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
        }
    }
}

impl PoolConfig {
    /// The concurrency ceiling with the `0 = auto` rule applied.
    pub fn resolved_max_concurrency(&self) -> usize {
        if self.max_concurrency == 0 {
            default_max_concurrency()
        } else {
            self.max_concurrency
        }
    }

    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Sleep between sweeps, never below [`MIN_POLL_INTERVAL_MS`].
    pub const fn poll_interval(&self) -> Duration {
        let ms = if self.poll_interval_ms < MIN_POLL_INTERVAL_MS {
            MIN_POLL_INTERVAL_MS
        } else {
            self.poll_interval_ms
        };
        Duration::from_millis(ms)
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// An environment variable whose value could not be parsed and was ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IgnoredOverride {
    pub var: &'static str,
    pub value: String,
}

/// Number of available processing units plus [`OVERSUBSCRIPTION`].
pub fn default_max_concurrency() -> usize {
    cpu_count() + OVERSUBSCRIPTION
}

/// Number of available processing units, falling back to 1 when unknown.
pub fn cpu_count() -> usize {
    std::thread::available_parallelism().map_or(1, NonZeroUsize::get)
}

/// Load configuration with hierarchical resolution.
///
/// Also returns the environment overrides that were ignored, since this
/// usually runs before logging is set up.
pub fn load_config(project_dir: Option<&Path>) -> Result<(Config, Vec<IgnoredOverride>)> {
    let mut merged = serde_json::to_value(Config::default())?;

    if let Some(global_path) = global_config_path()
        && global_path.exists()
    {
        merge_values(&mut merged, load_config_file(&global_path)?);
    }

    if let Some(dir) = project_dir {
        let project_path = project_config_path(dir);
        if project_path.exists() {
            merge_values(&mut merged, load_config_file(&project_path)?);
        }
    }

    let mut config: Config = serde_json::from_value(merged)
        .map_err(|e| Error::Config(format!("Invalid configuration: {e}")))?;
    let ignored = apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    Ok((config, ignored))
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("ccpool").join("settings.json"))
}

/// Project-level config file path under `dir`.
pub fn project_config_path(dir: &Path) -> PathBuf {
    dir.join(".ccpool").join("settings.json")
}

fn load_config_file(path: &Path) -> Result<Value> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    let value: Value = serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })?;
    if !value.is_object() {
        return Err(Error::Config(format!(
            "Config file {} must contain a JSON object",
            path.display()
        )));
    }
    Ok(value)
}

/// Recursively overlay `overlay` onto `base`. Objects merge per key, any
/// other value replaces the base value.
fn merge_values(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

/// Apply `CCPOOL_*` overrides. `lookup` resolves a variable name, normally
/// to `std::env::var`. Unparseable values leave the config untouched and are
/// returned.
pub fn apply_env_overrides(
    config: &mut Config,
    lookup: impl Fn(&str) -> Option<String>,
) -> Vec<IgnoredOverride> {
    let mut ignored = Vec::new();
    let mut parse = |var: &'static str| -> Option<u64> {
        let value = lookup(var)?;
        match value.parse() {
            Ok(n) => Some(n),
            Err(_) => {
                ignored.push(IgnoredOverride { var, value });
                None
            }
        }
    };

    if let Some(n) = parse("CCPOOL_MAX_CONCURRENCY").and_then(|n| usize::try_from(n).ok()) {
        config.pool.max_concurrency = n;
    }
    if let Some(n) = parse("CCPOOL_TIMEOUT_SECS") {
        config.pool.timeout_secs = n;
    }
    if let Some(n) = parse("CCPOOL_POLL_INTERVAL_MS") {
        config.pool.poll_interval_ms = n;
    }

    if let Some(val) = lookup("CCPOOL_LOG_LEVEL") {
        config.logging.level = val;
    }
    ignored
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn default_config_uses_five_minute_timeout() {
        let config = Config::default();
        assert_eq!(config.pool.timeout(), Duration::from_secs(300));
        assert_eq!(config.pool.poll_interval(), Duration::from_millis(5));
    }

    #[test]
    fn zero_concurrency_resolves_to_cpu_count_plus_two() {
        let config = PoolConfig::default();
        assert_eq!(config.resolved_max_concurrency(), cpu_count() + 2);

        let explicit = PoolConfig {
            max_concurrency: 3,
            ..PoolConfig::default()
        };
        assert_eq!(explicit.resolved_max_concurrency(), 3);
    }

    #[test]
    fn merge_keeps_keys_missing_from_overlay() {
        let mut base = serde_json::json!({
            "pool": { "max_concurrency": 8, "timeout_secs": 60 },
            "logging": { "level": "debug" }
        });
        merge_values(&mut base, serde_json::json!({ "pool": { "timeout_secs": 10 } }));

        let config: Config = serde_json::from_value(base).unwrap();
        assert_eq!(config.pool.max_concurrency, 8);
        assert_eq!(config.pool.timeout_secs, 10);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn project_file_is_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = project_config_path(dir.path());
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, r#"{ "pool": { "max_concurrency": 4 } }"#).unwrap();

        let value = load_config_file(&path).unwrap();
        let mut merged = serde_json::to_value(Config::default()).unwrap();
        merge_values(&mut merged, value);
        let config: Config = serde_json::from_value(merged).unwrap();

        assert_eq!(config.pool.max_concurrency, 4);
        assert_eq!(config.pool.timeout_secs, DEFAULT_TIMEOUT_SECS);
    }

    #[test]
    fn non_object_config_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "[1, 2, 3]").unwrap();

        let err = load_config_file(&path).unwrap_err();
        assert!(err.to_string().contains("JSON object"));
    }

    #[test]
    fn env_overrides_apply_and_ignore_garbage() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("CCPOOL_MAX_CONCURRENCY", "6"),
            ("CCPOOL_TIMEOUT_SECS", "not-a-number"),
            ("CCPOOL_LOG_LEVEL", "trace"),
        ]);
        let mut config = Config::default();
        let ignored =
            apply_env_overrides(&mut config, |key| vars.get(key).map(ToString::to_string));

        assert_eq!(config.pool.max_concurrency, 6);
        assert_eq!(config.pool.timeout_secs, DEFAULT_TIMEOUT_SECS);
        assert_eq!(config.logging.level, "trace");
        assert_eq!(
            ignored,
            vec![IgnoredOverride {
                var: "CCPOOL_TIMEOUT_SECS",
                value: "not-a-number".to_string(),
            }]
        );
    }

    #[test]
    fn zero_poll_interval_is_clamped() {
        let vars = HashMap::from([("CCPOOL_POLL_INTERVAL_MS", "0")]);
        let mut config = Config::default();
        let ignored =
            apply_env_overrides(&mut config, |key| vars.get(key).map(ToString::to_string));

        assert!(ignored.is_empty());
        assert_eq!(config.pool.poll_interval_ms, 0);
        assert_eq!(config.pool.poll_interval(), Duration::from_millis(1));
    }
}

//! Configuration: the persistent `config.json` beside the shards, and
//! the db-backed runtime settings on the core shard.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::storage::Shard;

/// Persistent installation config, written by `--setup` and read on
/// every start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub base_path: PathBuf,
    #[serde(default = "default_credentials_db")]
    pub credentials_db: String,
    #[serde(default = "default_true")]
    pub backup_enabled: bool,
    #[serde(default = "default_backup_max")]
    pub backup_max_count: u32,
    #[serde(default = "default_debug_port")]
    pub debug_port: u16,
}

fn default_credentials_db() -> String {
    "credentials".to_string()
}

fn default_true() -> bool {
    true
}

fn default_backup_max() -> u32 {
    5
}

fn default_debug_port() -> u16 {
    9222
}

impl AppConfig {
    pub fn new(base_path: PathBuf) -> Self {
        Self {
            base_path,
            credentials_db: default_credentials_db(),
            backup_enabled: true,
            backup_max_count: default_backup_max(),
            debug_port: default_debug_port(),
        }
    }
}

/// `config.json` location under a base path.
pub fn config_path(base: &Path) -> PathBuf {
    base.join("config.json")
}

pub fn config_exists(base: &Path) -> bool {
    config_path(base).is_file()
}

pub fn load_app_config(base: &Path) -> anyhow::Result<AppConfig> {
    let raw = std::fs::read_to_string(config_path(base))?;
    let config = serde_json::from_str(&raw)?;
    Ok(config)
}

pub fn save_app_config(config: &AppConfig) -> anyhow::Result<()> {
    std::fs::create_dir_all(&config.base_path)?;
    let raw = serde_json::to_string_pretty(config)?;
    std::fs::write(config_path(&config.base_path), raw)?;
    Ok(())
}

/// Resolve the base directory for the six shards.
///
/// Order: `--path` flag, `HOLOW_MCP_PATH`, an existing installation
/// under `~/.holow-mcp` (whose config may point elsewhere), then
/// `~/.holow-mcp` itself. `--test` overrides everything with a
/// process-scoped temp dir.
pub fn resolve_base_path(flag: Option<PathBuf>, test_mode: bool) -> PathBuf {
    if test_mode {
        return std::env::temp_dir().join(format!("holow-test-{}", std::process::id()));
    }
    if let Some(path) = flag {
        return path;
    }
    if let Some(env_path) = std::env::var_os("HOLOW_MCP_PATH") {
        return PathBuf::from(env_path);
    }

    let default = dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".holow-mcp");
    if config_exists(&default) {
        if let Ok(config) = load_app_config(&default) {
            return config.base_path;
        }
    }
    default
}

// ---------------------------------------------------------------------------
// DB-backed runtime settings
// ---------------------------------------------------------------------------

/// Runtime knobs stored as key/value rows in the core shard's `config`
/// table. Missing or malformed rows fall back to the defaults.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub server_name: String,
    pub server_version: String,
    pub polling_interval_ms: u64,
    pub heartbeat_interval_seconds: u64,
    pub shutdown_timeout_seconds: u64,
    pub cache_default_ttl_seconds: u64,
    pub retry_max_attempts: i64,
    pub circuit_breaker_failure_threshold: i64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            server_name: "holow-mcp".into(),
            server_version: env!("CARGO_PKG_VERSION").into(),
            polling_interval_ms: 2000,
            heartbeat_interval_seconds: 15,
            shutdown_timeout_seconds: 60,
            cache_default_ttl_seconds: 3600,
            retry_max_attempts: 3,
            circuit_breaker_failure_threshold: 5,
        }
    }
}

impl RuntimeConfig {
    /// Load from the core shard, layering rows over the defaults.
    pub fn load(core: &Shard) -> Self {
        let mut config = Self::default();
        let rows: Vec<(String, String)> = core
            .with(|conn| {
                let mut stmt = conn.prepare("SELECT key, value FROM config")?;
                let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
                rows.collect()
            })
            .unwrap_or_default();

        for (key, value) in rows {
            match key.as_str() {
                "server.name" => config.server_name = value,
                "server.version" => config.server_version = value,
                "polling.interval_ms" => {
                    config.polling_interval_ms =
                        value.parse().unwrap_or(config.polling_interval_ms)
                }
                "heartbeat.interval_seconds" => {
                    config.heartbeat_interval_seconds =
                        value.parse().unwrap_or(config.heartbeat_interval_seconds)
                }
                "shutdown.timeout_seconds" => {
                    config.shutdown_timeout_seconds =
                        value.parse().unwrap_or(config.shutdown_timeout_seconds)
                }
                "cache.default_ttl_seconds" => {
                    config.cache_default_ttl_seconds =
                        value.parse().unwrap_or(config.cache_default_ttl_seconds)
                }
                "retry.max_attempts" => {
                    config.retry_max_attempts = value.parse().unwrap_or(config.retry_max_attempts)
                }
                "circuit_breaker.failure_threshold" => {
                    config.circuit_breaker_failure_threshold = value
                        .parse()
                        .unwrap_or(config.circuit_breaker_failure_threshold)
                }
                _ => {}
            }
        }
        config
    }

    /// Write one setting back to the core shard.
    pub fn save(core: &Shard, key: &str, value: &str) -> rusqlite::Result<()> {
        core.with(|conn| {
            conn.execute(
                "INSERT INTO config (key, value, updated_at)
                 VALUES (?1, ?2, strftime('%s', 'now'))
                 ON CONFLICT(key) DO UPDATE SET value = ?2, updated_at = strftime('%s', 'now')",
                rusqlite::params![key, value],
            )?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;

    #[test]
    fn test_app_config_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::new(dir.path().to_path_buf());
        save_app_config(&config).unwrap();
        assert!(config_exists(dir.path()));

        let loaded = load_app_config(dir.path()).unwrap();
        assert_eq!(loaded.base_path, dir.path());
        assert!(loaded.backup_enabled);
        assert_eq!(loaded.debug_port, 9222);
    }

    #[test]
    fn test_app_config_defaults_for_missing_fields() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            config_path(dir.path()),
            format!(r#"{{"base_path": "{}"}}"#, dir.path().display()),
        )
        .unwrap();
        let loaded = load_app_config(dir.path()).unwrap();
        assert_eq!(loaded.credentials_db, "credentials");
        assert_eq!(loaded.backup_max_count, 5);
    }

    #[test]
    fn test_resolve_base_path_test_mode() {
        let path = resolve_base_path(Some(PathBuf::from("/ignored")), true);
        assert!(path
            .to_string_lossy()
            .contains(&format!("holow-test-{}", std::process::id())));
    }

    #[test]
    fn test_resolve_base_path_flag_wins() {
        let path = resolve_base_path(Some(PathBuf::from("/explicit")), false);
        assert_eq!(path, PathBuf::from("/explicit"));
    }

    #[test]
    fn test_runtime_config_defaults_and_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path()).unwrap();
        storage.init_schemas(None).unwrap();

        let config = RuntimeConfig::load(&storage.core);
        assert_eq!(config.polling_interval_ms, 2000);
        assert_eq!(config.shutdown_timeout_seconds, 60);

        RuntimeConfig::save(&storage.core, "polling.interval_ms", "500").unwrap();
        let config = RuntimeConfig::load(&storage.core);
        assert_eq!(config.polling_interval_ms, 500);
    }

    #[test]
    fn test_runtime_config_ignores_malformed_values() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path()).unwrap();
        storage.init_schemas(None).unwrap();
        RuntimeConfig::save(&storage.core, "heartbeat.interval_seconds", "not-a-number").unwrap();
        let config = RuntimeConfig::load(&storage.core);
        assert_eq!(config.heartbeat_interval_seconds, 15);
    }
}

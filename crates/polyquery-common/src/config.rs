use config::{Config, ConfigBuilder, ConfigError, Environment, File, FileFormat};
use config::builder::DefaultState;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::EngineKind;

// --- Constants for Default Configuration ---
pub const DEFAULT_DATABASE_PATH: &str = ":memory:";
pub const DEFAULT_POOL_SIZE: u32 = 10;
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_STATEMENT_TIMEOUT_MS: u64 = 5_000;

pub const DEFAULT_CACHE_TTL_SECS: u64 = 300;
pub const DEFAULT_CACHE_KEY_PREFIX: &str = "polyquery:";
pub const DEFAULT_CACHE_COMPRESSION_THRESHOLD: usize = 1024;
pub const DEFAULT_CACHE_MAX_KEY_SIZE: usize = 250;
pub const DEFAULT_CACHE_MAX_VALUE_SIZE: usize = 1024 * 1024;
pub const DEFAULT_CACHE_SWEEP_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_CACHE_LOCAL_MAX_ENTRIES: u64 = 10_000;

pub const DEFAULT_PAGE_LIMIT: u64 = 10;
pub const DEFAULT_MAX_PAGE_LIMIT: u64 = 100;

/// Connection settings for one storage engine.
///
/// `database` is a file path for SQLite (`:memory:` for an in-memory database)
/// and a data directory for the document store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub engine: EngineKind,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default = "default_database")]
    pub database: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_statement_timeout")]
    pub statement_timeout_ms: u64,
    #[serde(default)]
    pub options: HashMap<String, String>,
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_database() -> String {
    DEFAULT_DATABASE_PATH.to_string()
}

fn default_pool_size() -> u32 {
    DEFAULT_POOL_SIZE
}

fn default_connect_timeout() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_MS
}

fn default_statement_timeout() -> u64 {
    DEFAULT_STATEMENT_TIMEOUT_MS
}

impl ConnectionConfig {
    pub fn sqlite_memory() -> Self {
        Self {
            engine: EngineKind::Sqlite,
            ..Self::default()
        }
    }

    pub fn document(data_dir: impl Into<String>) -> Self {
        Self {
            engine: EngineKind::Document,
            database: data_dir.into(),
            ..Self::default()
        }
    }

    pub fn option(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(String::as_str)
    }

    /// Boolean engine option; accepts true/false/1/0/on/off.
    pub fn flag(&self, key: &str, default: bool) -> bool {
        match self.option(key).map(|v| v.to_ascii_lowercase()) {
            Some(v) if v == "true" || v == "1" || v == "on" => true,
            Some(v) if v == "false" || v == "0" || v == "off" => false,
            _ => default,
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            engine: EngineKind::Sqlite,
            host: default_host(),
            port: None,
            database: default_database(),
            username: None,
            password: None,
            pool_size: DEFAULT_POOL_SIZE,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            statement_timeout_ms: DEFAULT_STATEMENT_TIMEOUT_MS,
            options: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Connection string of the remote cache. `None` selects the in-process backend.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_cache_ttl")]
    pub default_ttl_secs: u64,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    #[serde(default = "default_true")]
    pub compression: bool,
    #[serde(default = "default_compression_threshold")]
    pub compression_threshold: usize,
    #[serde(default = "default_max_key_size")]
    pub max_key_size: usize,
    #[serde(default = "default_max_value_size")]
    pub max_value_size: usize,
    #[serde(default = "default_sweep_interval")]
    pub fallback_sweep_interval_secs: u64,
    #[serde(default = "default_local_max_entries")]
    pub local_max_entries: u64,
}

fn default_true() -> bool {
    true
}

fn default_cache_ttl() -> u64 {
    DEFAULT_CACHE_TTL_SECS
}

fn default_key_prefix() -> String {
    DEFAULT_CACHE_KEY_PREFIX.to_string()
}

fn default_compression_threshold() -> usize {
    DEFAULT_CACHE_COMPRESSION_THRESHOLD
}

fn default_max_key_size() -> usize {
    DEFAULT_CACHE_MAX_KEY_SIZE
}

fn default_max_value_size() -> usize {
    DEFAULT_CACHE_MAX_VALUE_SIZE
}

fn default_sweep_interval() -> u64 {
    DEFAULT_CACHE_SWEEP_INTERVAL_SECS
}

fn default_local_max_entries() -> u64 {
    DEFAULT_CACHE_LOCAL_MAX_ENTRIES
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            url: None,
            default_ttl_secs: DEFAULT_CACHE_TTL_SECS,
            key_prefix: DEFAULT_CACHE_KEY_PREFIX.to_string(),
            compression: true,
            compression_threshold: DEFAULT_CACHE_COMPRESSION_THRESHOLD,
            max_key_size: DEFAULT_CACHE_MAX_KEY_SIZE,
            max_value_size: DEFAULT_CACHE_MAX_VALUE_SIZE,
            fallback_sweep_interval_secs: DEFAULT_CACHE_SWEEP_INTERVAL_SECS,
            local_max_entries: DEFAULT_CACHE_LOCAL_MAX_ENTRIES,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaginationConfig {
    #[serde(default = "default_page_limit")]
    pub default_limit: u64,
    #[serde(default = "default_max_page_limit")]
    pub max_limit: u64,
}

fn default_page_limit() -> u64 {
    DEFAULT_PAGE_LIMIT
}

fn default_max_page_limit() -> u64 {
    DEFAULT_MAX_PAGE_LIMIT
}

impl Default for PaginationConfig {
    fn default() -> Self {
        Self {
            default_limit: DEFAULT_PAGE_LIMIT,
            max_limit: DEFAULT_MAX_PAGE_LIMIT,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub database: ConnectionConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub pagination: PaginationConfig,
}

impl AppConfig {
    fn builder_with_defaults() -> Result<ConfigBuilder<DefaultState>, ConfigError> {
        Config::builder()
            .set_default("database.engine", "sqlite")?
            .set_default("database.host", "localhost")?
            .set_default("database.database", DEFAULT_DATABASE_PATH)?
            .set_default("database.pool_size", DEFAULT_POOL_SIZE as i64)?
            .set_default("database.connect_timeout_ms", DEFAULT_CONNECT_TIMEOUT_MS)?
            .set_default("database.statement_timeout_ms", DEFAULT_STATEMENT_TIMEOUT_MS)?
            .set_default("cache.enabled", true)?
            .set_default("cache.default_ttl_secs", DEFAULT_CACHE_TTL_SECS)?
            .set_default("cache.key_prefix", DEFAULT_CACHE_KEY_PREFIX)?
            .set_default("cache.compression", true)?
            .set_default("cache.compression_threshold", DEFAULT_CACHE_COMPRESSION_THRESHOLD as i64)?
            .set_default("cache.max_key_size", DEFAULT_CACHE_MAX_KEY_SIZE as i64)?
            .set_default("cache.max_value_size", DEFAULT_CACHE_MAX_VALUE_SIZE as i64)?
            .set_default("cache.fallback_sweep_interval_secs", DEFAULT_CACHE_SWEEP_INTERVAL_SECS)?
            .set_default("cache.local_max_entries", DEFAULT_CACHE_LOCAL_MAX_ENTRIES)?
            .set_default("pagination.default_limit", DEFAULT_PAGE_LIMIT)?
            .set_default("pagination.max_limit", DEFAULT_MAX_PAGE_LIMIT)
    }

    /// Defaults, then `polyquery.toml` if present, then environment variables
    /// such as `POLYQUERY__DATABASE__ENGINE=document`.
    pub fn load() -> Result<Self, ConfigError> {
        let s = Self::builder_with_defaults()?
            .add_source(File::with_name("polyquery").required(false))
            .add_source(Environment::with_prefix("POLYQUERY").separator("__"))
            // Legacy single-variable overrides
            .set_override_option("database.database", std::env::var("DATABASE_URL").ok())?
            .set_override_option("cache.url", std::env::var("CACHE_URL").ok())?
            .build()?;

        s.try_deserialize()
    }

    /// Defaults layered under an inline TOML document.
    pub fn from_toml_str(toml: &str) -> Result<Self, ConfigError> {
        let s = Self::builder_with_defaults()?
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()?;

        s.try_deserialize()
    }

    pub fn default_ttl(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.cache.default_ttl_secs)
    }
}

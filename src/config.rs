//! Runtime configuration
//!
//! Built in three layers: defaults, an optional YAML file, then environment
//! overrides. The access principal is part of the configuration and is
//! passed explicitly to whatever needs it.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Environment variable naming a YAML config file
pub const CONFIG_ENV: &str = "TELECACHE_CONFIG";

/// Logical database name; the store file is `<name>.db`
pub const DEFAULT_DATABASE: &str = "telegram_cache";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config file {path}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },
}

/// A permission held by the access principal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Insert and update records
    ReadWrite,
    /// Create tables and indexes (run migrations)
    DbAdmin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ReadWrite => "read_write",
            Self::DbAdmin => "db_admin",
        }
    }

    fn parse(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "read_write" | "readwrite" => Some(Self::ReadWrite),
            "db_admin" | "dbadmin" => Some(Self::DbAdmin),
            _ => None,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The principal the process acts as
///
/// Its name is recorded as the actor of audit entries unless an ingestion
/// path supplies its own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Credentials {
    pub principal: String,
    pub roles: Vec<Role>,
}

impl Credentials {
    pub fn new(principal: impl Into<String>, roles: Vec<Role>) -> Self {
        Self {
            principal: principal.into(),
            roles,
        }
    }

    /// Read-only principal (queries only)
    pub fn read_only(principal: impl Into<String>) -> Self {
        Self::new(principal, Vec::new())
    }

    pub fn has(&self, role: Role) -> bool {
        self.roles.contains(&role)
    }
}

impl Default for Credentials {
    fn default() -> Self {
        Self::new("telecache", vec![Role::ReadWrite, Role::DbAdmin])
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory holding the database file (defaults to the user data dir)
    pub data_dir: Option<PathBuf>,
    /// Explicit database file; overrides `data_dir` + `database`
    pub db_path: Option<PathBuf>,
    pub database: String,
    /// Maximum number of open connections
    pub pool_size: usize,
    pub busy_timeout_ms: u64,
    /// How long an operation waits for a free connection
    pub acquire_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            db_path: None,
            database: DEFAULT_DATABASE.to_string(),
            pool_size: 4,
            busy_timeout_ms: 5_000,
            acquire_timeout_ms: 10_000,
        }
    }
}

impl StoreConfig {
    /// Resolve the database file path (~/.local/share/telecache/telegram_cache.db by default)
    pub fn resolved_path(&self) -> PathBuf {
        if let Some(path) = &self.db_path {
            return path.clone();
        }
        let dir = self.data_dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| dirs::home_dir().unwrap_or_default().join(".local/share"))
                .join("telecache")
        });
        dir.join(format!("{}.db", self.database))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Total attempts per event for transient store failures
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Audit actor for ingested events; defaults to the principal
    pub actor: Option<String>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 100,
            max_backoff_ms: 5_000,
            actor: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    pub default_limit: usize,
    /// Requests asking for more are clamped
    pub max_limit: usize,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            default_limit: 20,
            max_limit: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default filter directive when RUST_LOG is unset
    pub level: String,
    /// Log every stored event at debug level
    pub debug: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            debug: false,
        }
    }
}

/// Complete process configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub store: StoreConfig,
    pub credentials: Credentials,
    pub ingest: IngestConfig,
    pub query: QueryConfig,
    pub log: LogConfig,
}

impl Config {
    /// Load configuration: defaults, then the YAML file (explicit path or
    /// `TELECACHE_CONFIG`), then environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let env_path = std::env::var_os(CONFIG_ENV).map(PathBuf::from);
        let mut config = match path.map(Path::to_path_buf).or(env_path) {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&text).map_err(|source| ConfigError::Yaml {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_yaml(text: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(text)
    }

    /// Apply environment overrides through `lookup`
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(dir) = lookup("TELECACHE_DATA_DIR") {
            self.store.data_dir = Some(PathBuf::from(dir));
        }
        if let Some(path) = lookup("TELECACHE_DB_PATH") {
            self.store.db_path = Some(PathBuf::from(path));
        }
        // Name kept from the deployment's document-store settings
        if let Some(db) = lookup("MONGO_DB") {
            self.store.database = db;
        }
        if let Some(size) = lookup("TELECACHE_POOL_SIZE") {
            self.store.pool_size = parse_number("TELECACHE_POOL_SIZE", &size)?;
        }
        if let Some(principal) = lookup("TELECACHE_PRINCIPAL") {
            self.credentials.principal = principal;
        }
        if let Some(roles) = lookup("TELECACHE_ROLES") {
            self.credentials.roles = parse_roles(&roles)?;
        }
        if let Some(attempts) = lookup("TELECACHE_MAX_ATTEMPTS") {
            self.ingest.max_attempts = parse_number("TELECACHE_MAX_ATTEMPTS", &attempts)?;
        }
        if let Some(level) = lookup("LOG_LEVEL") {
            self.log.level = level.to_ascii_lowercase();
        }
        if let Some(debug) = lookup("DEBUG") {
            self.log.debug = debug.eq_ignore_ascii_case("true") || debug == "1";
        }
        self.validate()
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.store.pool_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: "store.pool_size".into(),
                reason: "must be at least 1".into(),
            });
        }
        if self.ingest.max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                key: "ingest.max_attempts".into(),
                reason: "must be at least 1".into(),
            });
        }
        if self.query.default_limit == 0 || self.query.default_limit > self.query.max_limit {
            return Err(ConfigError::InvalidValue {
                key: "query.default_limit".into(),
                reason: format!("must be between 1 and max_limit ({})", self.query.max_limit),
            });
        }
        Ok(())
    }

    /// Actor recorded on audit entries for ingested events
    pub fn ingest_actor(&self) -> String {
        self.ingest
            .actor
            .clone()
            .unwrap_or_else(|| self.credentials.principal.clone())
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        reason: format!("'{}' is not a number", value),
    })
}

fn parse_roles(value: &str) -> Result<Vec<Role>, ConfigError> {
    value
        .split(',')
        .filter(|s| !s.trim().is_empty())
        .map(|s| {
            Role::parse(s).ok_or_else(|| ConfigError::InvalidValue {
                key: "TELECACHE_ROLES".into(),
                reason: format!("unknown role '{}'", s.trim()),
            })
        })
        .collect()
}

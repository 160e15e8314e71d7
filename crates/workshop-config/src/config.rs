// crates/workshop-config/src/config.rs
// ============================================================================
// Module: Workshop Configuration
// Description: Configuration loading, environment overrides, and validation.
// Purpose: Provide strict, fail-closed config parsing with hard limits.
// Dependencies: serde, toml, workshop-rescue, workshop-store
// ============================================================================

//! ## Overview
//! Configuration is read from a TOML file with strict size and path limits,
//! then overridden from the process environment (deployment platforms inject
//! `DATABASE_URL` and the backup settings as variables). A missing default
//! file is not an error: every field has a default. An explicitly named file
//! that cannot be read is.
//!
//! Environment lookups go through a caller-supplied function so tests never
//! touch the real process environment.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::env;
use std::fmt;
use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;
use workshop_rescue::FilesApiVolumeClient;
use workshop_rescue::LocalVolumeClient;
use workshop_rescue::RescueSettings;
use workshop_rescue::VolumeClient;
use workshop_rescue::resolve_remote_path;
use workshop_store::DatabaseTarget;
use workshop_store::PoolSettings;
use workshop_store::SessionRetryPolicy;
use workshop_store::SqliteOptions;
use workshop_store::WriteRetryPolicy;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Default configuration filename when no path is specified.
pub const DEFAULT_CONFIG_NAME: &str = "workshop.toml";
/// Environment variable used to override the config path.
pub const CONFIG_ENV_VAR: &str = "WORKSHOP_CONFIG";
/// Default database URL: `workshop.db` in the working directory.
pub const DEFAULT_DATABASE_URL: &str = "sqlite:///workshop.db";
/// Default tracing filter directive.
pub const DEFAULT_LOG_FILTER: &str = "info";
/// Maximum configuration file size in bytes.
pub(crate) const MAX_CONFIG_FILE_SIZE: usize = 1024 * 1024;
/// Maximum length of a single path component.
pub(crate) const MAX_PATH_COMPONENT_LENGTH: usize = 255;
/// Maximum total path length.
pub(crate) const MAX_TOTAL_PATH_LENGTH: usize = 4096;
/// Upper bound on the snapshot interval (one week).
pub(crate) const MAX_SNAPSHOT_INTERVAL_MINUTES: u64 = 7 * 24 * 60;
/// Upper bound on the forced snapshot wait.
pub(crate) const MAX_FORCED_WAIT_SECS: u64 = 600;
/// Upper bound on the checkpoint busy timeout.
pub(crate) const MAX_CHECKPOINT_BUSY_TIMEOUT_MS: u64 = 600_000;
/// Upper bound on any retry attempt count.
pub(crate) const MAX_RETRY_ATTEMPTS: u32 = 100;

/// Environment keys recognised by [`WorkshopConfig::apply_env`].
pub mod env_keys {
    /// Database connection string.
    pub const DATABASE_URL: &str = "DATABASE_URL";
    /// Direct remote snapshot path.
    pub const BACKUP_PATH: &str = "WORKSHOP_DB_BACKUP_PATH";
    /// Remote base directory; the default file name is appended.
    pub const BACKUP_VOLUME: &str = "WORKSHOP_DB_BACKUP_VOLUME";
    /// Periodic snapshot interval in minutes.
    pub const BACKUP_INTERVAL_MINUTES: &str = "WORKSHOP_DB_BACKUP_INTERVAL_MINUTES";
    /// Connections kept warm.
    pub const POOL_SIZE: &str = "WORKSHOP_DB_POOL_SIZE";
    /// Burst connections.
    pub const MAX_OVERFLOW: &str = "WORKSHOP_DB_MAX_OVERFLOW";
    /// Pool checkout timeout in seconds.
    pub const POOL_TIMEOUT_SECS: &str = "WORKSHOP_DB_POOL_TIMEOUT_SECS";
    /// Connection recycle age in seconds.
    pub const POOL_RECYCLE_SECS: &str = "WORKSHOP_DB_POOL_RECYCLE_SECS";
    /// `SQLite` busy timeout in milliseconds.
    pub const BUSY_TIMEOUT_MS: &str = "WORKSHOP_DB_BUSY_TIMEOUT_MS";
    /// Checkpoint busy timeout in milliseconds.
    pub const CHECKPOINT_TIMEOUT_MS: &str = "WORKSHOP_DB_CHECKPOINT_TIMEOUT_MS";
    /// Files API host.
    pub const VOLUME_HOST: &str = "WORKSHOP_VOLUME_HOST";
    /// Files API bearer token.
    pub const VOLUME_TOKEN: &str = "WORKSHOP_VOLUME_TOKEN";
    /// Tracing filter directive.
    pub const LOG: &str = "WORKSHOP_LOG";
}

// ============================================================================
// SECTION: Configuration Model
// ============================================================================

/// Root configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct WorkshopConfig {
    /// Database connection and pooling.
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Volume snapshot settings.
    #[serde(default)]
    pub rescue: RescueConfig,
    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl WorkshopConfig {
    /// Loads configuration using the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when loading, overriding, or validation fails.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_with_env(path, |key| env::var(key).ok())
    }

    /// Loads configuration with an explicit environment lookup.
    ///
    /// Resolution order: `path`, then the [`CONFIG_ENV_VAR`] variable, then
    /// [`DEFAULT_CONFIG_NAME`]. Only the default file may be absent.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when loading, overriding, or validation fails.
    pub fn load_with_env<F>(path: Option<&Path>, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let (resolved, explicit) = resolve_path(path, &lookup)?;
        validate_path(&resolved)?;
        let mut config = if !explicit && !resolved.exists() {
            Self::default()
        } else {
            Self::from_file(&resolved)?
        };
        config.apply_env(&lookup)?;
        config.validate()?;
        Ok(config)
    }

    /// Parses a config file without applying overrides or validation.
    fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let bytes = fs::read(path).map_err(|err| ConfigError::Io(err.to_string()))?;
        if bytes.len() > MAX_CONFIG_FILE_SIZE {
            return Err(ConfigError::Invalid("config file exceeds size limit".to_string()));
        }
        let content = std::str::from_utf8(&bytes)
            .map_err(|_| ConfigError::Invalid("config file must be utf-8".to_string()))?;
        toml::from_str(content).map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Applies environment overrides. Blank values count as unset.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when a numeric variable does not
    /// parse.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(url) = read(env_keys::DATABASE_URL) {
            self.database.url = url.trim().to_string();
        }
        if let Some(raw) = read(env_keys::POOL_SIZE) {
            self.database.pool.pool_size = parse_env(env_keys::POOL_SIZE, &raw)?;
        }
        if let Some(raw) = read(env_keys::MAX_OVERFLOW) {
            self.database.pool.max_overflow = parse_env(env_keys::MAX_OVERFLOW, &raw)?;
        }
        if let Some(raw) = read(env_keys::POOL_TIMEOUT_SECS) {
            let secs: u64 = parse_env(env_keys::POOL_TIMEOUT_SECS, &raw)?;
            self.database.pool.timeout_ms = secs.saturating_mul(1_000);
        }
        if let Some(raw) = read(env_keys::POOL_RECYCLE_SECS) {
            self.database.pool.recycle_secs = parse_env(env_keys::POOL_RECYCLE_SECS, &raw)?;
        }
        if let Some(raw) = read(env_keys::BUSY_TIMEOUT_MS) {
            self.database.sqlite.busy_timeout_ms = parse_env(env_keys::BUSY_TIMEOUT_MS, &raw)?;
        }

        if let Some(path) = read(env_keys::BACKUP_PATH) {
            self.rescue.backup_path = Some(path.trim().to_string());
        }
        if let Some(volume) = read(env_keys::BACKUP_VOLUME) {
            self.rescue.backup_volume = Some(volume.trim().to_string());
        }
        if let Some(raw) = read(env_keys::BACKUP_INTERVAL_MINUTES) {
            self.rescue.interval_minutes = parse_env(env_keys::BACKUP_INTERVAL_MINUTES, &raw)?;
        }
        if let Some(raw) = read(env_keys::CHECKPOINT_TIMEOUT_MS) {
            self.rescue.checkpoint_busy_timeout_ms =
                parse_env(env_keys::CHECKPOINT_TIMEOUT_MS, &raw)?;
        }
        if let Some(host) = read(env_keys::VOLUME_HOST) {
            self.rescue.volume_host = Some(host.trim().to_string());
        }
        if let Some(token) = read(env_keys::VOLUME_TOKEN) {
            self.rescue.volume_token = Some(token.trim().to_string());
        }

        if let Some(filter) = read(env_keys::LOG) {
            self.logging.filter = filter.trim().to_string();
        }
        Ok(())
    }

    /// Validates the configuration for internal consistency.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when configuration is invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.database.validate()?;
        self.rescue.validate()?;
        self.logging.validate()?;
        if self.rescue.remote_path().is_some() && self.database.target()?.local_path().is_none() {
            return Err(ConfigError::Invalid(
                "rescue snapshots require a sqlite database.url".to_string(),
            ));
        }
        Ok(())
    }

    /// Builds the rescue settings for the configured database file.
    ///
    /// Server databases yield unconfigured settings.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when the database URL does not parse.
    pub fn rescue_settings(&self) -> Result<RescueSettings, ConfigError> {
        let target = self.database.target()?;
        let (remote, local) = match target.local_path() {
            Some(path) => (self.rescue.remote_path(), path.clone()),
            None => (None, PathBuf::new()),
        };
        Ok(RescueSettings::new(remote, local)
            .with_interval_minutes(self.rescue.interval_minutes)
            .with_forced_wait(Duration::from_secs(self.rescue.forced_wait_secs))
            .with_checkpoint_busy_timeout(Duration::from_millis(
                self.rescue.checkpoint_busy_timeout_ms,
            )))
    }
}

/// Database connection and pooling settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct DatabaseConfig {
    /// Connection string: `sqlite:///rel.db`, `sqlite:////abs.db`, or
    /// `postgres://...`.
    #[serde(default = "default_database_url")]
    pub url: String,
    /// File holding a rotating server password; re-read on pool reset.
    #[serde(default)]
    pub token_file: Option<PathBuf>,
    /// Pool sizing.
    #[serde(default)]
    pub pool: PoolSettings,
    /// Per-connection `SQLite` settings.
    #[serde(default)]
    pub sqlite: SqliteOptions,
    /// Session acquisition retry.
    #[serde(default)]
    pub session_retry: SessionRetryPolicy,
    /// Contended write retry.
    #[serde(default)]
    pub write_retry: WriteRetryPolicy,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            token_file: None,
            pool: PoolSettings::default(),
            sqlite: SqliteOptions::default(),
            session_retry: SessionRetryPolicy::default(),
            write_retry: WriteRetryPolicy::default(),
        }
    }
}

impl DatabaseConfig {
    /// Parses the configured URL.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when the URL does not parse.
    pub fn target(&self) -> Result<DatabaseTarget, ConfigError> {
        DatabaseTarget::parse(&self.url)
            .map_err(|err| ConfigError::Invalid(format!("database.url: {err}")))
    }

    /// Validates database settings.
    fn validate(&self) -> Result<(), ConfigError> {
        let target = self.target()?;
        if let Some(path) = target.local_path() {
            validate_path_string("database.url path", &path.to_string_lossy())?;
        }
        if let Some(token_file) = &self.token_file {
            if target.local_path().is_some() {
                return Err(ConfigError::Invalid(
                    "database.token_file requires a postgres database.url".to_string(),
                ));
            }
            validate_path_string("database.token_file", &token_file.to_string_lossy())?;
        }
        self.pool.validate().map_err(|err| ConfigError::Invalid(format!("database.pool: {err}")))?;
        if self.sqlite.busy_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "database.sqlite.busy_timeout_ms must be greater than zero".to_string(),
            ));
        }
        validate_attempts("database.session_retry.max_attempts", self.session_retry.max_attempts)?;
        validate_attempts("database.write_retry.max_attempts", self.write_retry.max_attempts)?;
        if self.write_retry.base_delay_ms > self.write_retry.max_delay_ms {
            return Err(ConfigError::Invalid(
                "database.write_retry.base_delay_ms must not exceed max_delay_ms".to_string(),
            ));
        }
        Ok(())
    }
}

/// Volume snapshot settings.
///
/// The remote location is either `backup_path` (a full file path) or
/// `backup_volume` (a directory that receives `workshop.db`); the direct
/// path wins when both are set. The remote path is checked when a snapshot
/// runs, not here, so a malformed path disables snapshots without stopping
/// the service.
#[derive(Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct RescueConfig {
    /// Direct remote snapshot path.
    #[serde(default)]
    pub backup_path: Option<String>,
    /// Remote base directory.
    #[serde(default)]
    pub backup_volume: Option<String>,
    /// Minutes between periodic snapshots; zero disables the timer.
    #[serde(default = "default_interval_minutes")]
    pub interval_minutes: u64,
    /// Seconds a forced snapshot waits for an in-flight one.
    #[serde(default = "default_forced_wait_secs")]
    pub forced_wait_secs: u64,
    /// Milliseconds the pre-upload checkpoint waits on readers and writers.
    #[serde(default = "default_checkpoint_busy_timeout_ms")]
    pub checkpoint_busy_timeout_ms: u64,
    /// Files API host.
    #[serde(default)]
    pub volume_host: Option<String>,
    /// Files API bearer token.
    #[serde(default)]
    pub volume_token: Option<String>,
    /// Local directory standing in for `/Volumes` (mounted volume).
    #[serde(default)]
    pub local_volume_root: Option<PathBuf>,
}

impl Default for RescueConfig {
    fn default() -> Self {
        Self {
            backup_path: None,
            backup_volume: None,
            interval_minutes: default_interval_minutes(),
            forced_wait_secs: default_forced_wait_secs(),
            checkpoint_busy_timeout_ms: default_checkpoint_busy_timeout_ms(),
            volume_host: None,
            volume_token: None,
            local_volume_root: None,
        }
    }
}

impl fmt::Debug for RescueConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RescueConfig")
            .field("backup_path", &self.backup_path)
            .field("backup_volume", &self.backup_volume)
            .field("interval_minutes", &self.interval_minutes)
            .field("forced_wait_secs", &self.forced_wait_secs)
            .field("checkpoint_busy_timeout_ms", &self.checkpoint_busy_timeout_ms)
            .field("volume_host", &self.volume_host)
            .field("volume_token", &self.volume_token.as_ref().map(|_| "<redacted>"))
            .field("local_volume_root", &self.local_volume_root)
            .finish()
    }
}

impl RescueConfig {
    /// Returns the effective remote snapshot path, if any.
    #[must_use]
    pub fn remote_path(&self) -> Option<String> {
        resolve_remote_path(self.backup_path.as_deref(), self.backup_volume.as_deref())
    }

    /// Builds the volume client: a mounted directory when configured,
    /// otherwise the Files API when host and token are both set.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when the host or token is rejected.
    pub fn volume_client(&self) -> Result<Option<Arc<dyn VolumeClient>>, ConfigError> {
        if let Some(root) = &self.local_volume_root {
            return Ok(Some(Arc::new(LocalVolumeClient::new(root.clone()))));
        }
        match (&self.volume_host, &self.volume_token) {
            (Some(host), Some(token)) => {
                let client = FilesApiVolumeClient::new(host, token.clone())
                    .map_err(|err| ConfigError::Invalid(format!("rescue.volume_host: {err}")))?;
                Ok(Some(Arc::new(client)))
            }
            _ => Ok(None),
        }
    }

    /// Validates snapshot settings.
    fn validate(&self) -> Result<(), ConfigError> {
        if self.interval_minutes > MAX_SNAPSHOT_INTERVAL_MINUTES {
            return Err(ConfigError::Invalid(format!(
                "rescue.interval_minutes must be at most {MAX_SNAPSHOT_INTERVAL_MINUTES}"
            )));
        }
        if self.forced_wait_secs > MAX_FORCED_WAIT_SECS {
            return Err(ConfigError::Invalid(format!(
                "rescue.forced_wait_secs must be at most {MAX_FORCED_WAIT_SECS}"
            )));
        }
        if self.checkpoint_busy_timeout_ms == 0
            || self.checkpoint_busy_timeout_ms > MAX_CHECKPOINT_BUSY_TIMEOUT_MS
        {
            return Err(ConfigError::Invalid(format!(
                "rescue.checkpoint_busy_timeout_ms must be between 1 and \
                 {MAX_CHECKPOINT_BUSY_TIMEOUT_MS}"
            )));
        }
        if self.volume_host.is_some() != self.volume_token.is_some() {
            return Err(ConfigError::Invalid(
                "rescue.volume_host and rescue.volume_token must be set together".to_string(),
            ));
        }
        if let Some(root) = &self.local_volume_root {
            if self.volume_host.is_some() {
                return Err(ConfigError::Invalid(
                    "rescue.local_volume_root conflicts with rescue.volume_host".to_string(),
                ));
            }
            validate_path_string("rescue.local_volume_root", &root.to_string_lossy())?;
        }
        Ok(())
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Compact human-readable lines.
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}

/// Logging settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Tracing filter directive (`info`, `workshop_store=debug`, ...).
    #[serde(default = "default_log_filter")]
    pub filter: String,
    /// Output format.
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            format: LogFormat::default(),
        }
    }
}

impl LoggingConfig {
    /// Validates logging settings.
    fn validate(&self) -> Result<(), ConfigError> {
        if self.filter.trim().is_empty() {
            return Err(ConfigError::Invalid("logging.filter must be non-empty".to_string()));
        }
        Ok(())
    }
}

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Configuration loading or validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// I/O failure while reading configuration.
    #[error("config io error: {0}")]
    Io(String),
    /// TOML parsing error.
    #[error("config parse error: {0}")]
    Parse(String),
    /// Invalid configuration data.
    #[error("invalid config: {0}")]
    Invalid(String),
}

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Resolves the config path; the flag reports whether it was named
/// explicitly.
fn resolve_path<F>(path: Option<&Path>, lookup: &F) -> Result<(PathBuf, bool), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(path) = path {
        return Ok((path.to_path_buf(), true));
    }
    if let Some(env_path) = lookup(CONFIG_ENV_VAR).filter(|value| !value.trim().is_empty()) {
        if env_path.len() > MAX_TOTAL_PATH_LENGTH {
            return Err(ConfigError::Invalid("config path exceeds max length".to_string()));
        }
        return Ok((PathBuf::from(env_path), true));
    }
    Ok((PathBuf::from(DEFAULT_CONFIG_NAME), false))
}

/// Validates the resolved path against security limits.
fn validate_path(path: &Path) -> Result<(), ConfigError> {
    let text = path.to_string_lossy();
    if text.len() > MAX_TOTAL_PATH_LENGTH {
        return Err(ConfigError::Invalid("config path exceeds max length".to_string()));
    }
    for component in path.components() {
        let value = component.as_os_str().to_string_lossy();
        if value.len() > MAX_PATH_COMPONENT_LENGTH {
            return Err(ConfigError::Invalid("config path component too long".to_string()));
        }
    }
    Ok(())
}

/// Validates a path string against length constraints.
fn validate_path_string(field: &str, value: &str) -> Result<(), ConfigError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ConfigError::Invalid(format!("{field} must be non-empty")));
    }
    if trimmed.len() > MAX_TOTAL_PATH_LENGTH {
        return Err(ConfigError::Invalid(format!("{field} exceeds max length")));
    }
    for component in Path::new(trimmed).components() {
        let component_value = component.as_os_str().to_string_lossy();
        if component_value.len() > MAX_PATH_COMPONENT_LENGTH {
            return Err(ConfigError::Invalid(format!("{field} path component too long")));
        }
    }
    Ok(())
}

/// Validates a retry attempt count.
fn validate_attempts(field: &str, attempts: u32) -> Result<(), ConfigError> {
    if attempts == 0 || attempts > MAX_RETRY_ATTEMPTS {
        return Err(ConfigError::Invalid(format!(
            "{field} must be between 1 and {MAX_RETRY_ATTEMPTS}"
        )));
    }
    Ok(())
}

/// Parses a numeric environment value.
fn parse_env<T: FromStr>(key: &str, raw: &str) -> Result<T, ConfigError> {
    raw.trim()
        .parse()
        .map_err(|_| ConfigError::Invalid(format!("{key} must be a non-negative integer")))
}

/// Default database URL.
fn default_database_url() -> String {
    DEFAULT_DATABASE_URL.to_string()
}

/// Default snapshot interval in minutes.
const fn default_interval_minutes() -> u64 {
    10
}

/// Default forced snapshot wait in seconds.
const fn default_forced_wait_secs() -> u64 {
    30
}

/// Default checkpoint busy timeout in milliseconds.
const fn default_checkpoint_busy_timeout_ms() -> u64 {
    5_000
}

/// Default log filter.
fn default_log_filter() -> String {
    DEFAULT_LOG_FILTER.to_string()
}

// ============================================================================
// SECTION: Tests
// ============================================================================

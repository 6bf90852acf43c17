use serde::{Deserialize, Serialize};
use std::time::Duration;
use xpanel_core::SecretDefaults;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub jobs: JobsConfig,
    /// External reconciliation (config regeneration + restart)
    #[serde(default)]
    pub reconcile: ReconcileConfig,
    /// Defaults for generated client secrets
    #[serde(default)]
    pub protocol: ProtocolConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

// Default derived via field defaults

impl AppConfig {
    pub fn validate(&self) -> Result<(), String> {
        // Storage validation
        if self.storage.backend == StorageBackend::Sqlite && self.storage.sqlite.path.is_empty() {
            return Err("storage.sqlite.path must not be empty".into());
        }
        // Jobs validations
        if self.jobs.store_path.is_empty() {
            return Err("jobs.store_path must not be empty".into());
        }
        if self.jobs.batch_size == 0 {
            return Err("jobs.batch_size must be > 0".into());
        }
        if self.jobs.max_concurrent_jobs == 0 {
            return Err("jobs.max_concurrent_jobs must be > 0".into());
        }
        if self.jobs.max_operations == 0 || self.jobs.max_targets == 0 {
            return Err("jobs.max_operations and jobs.max_targets must be > 0".into());
        }
        if self
            .jobs
            .repair_backup_dir
            .as_deref()
            .is_some_and(|dir| dir.trim().is_empty())
        {
            return Err("jobs.repair_backup_dir must not be empty when set".into());
        }
        if self.jobs.cleanup_interval_seconds == 0 {
            return Err("jobs.cleanup_interval_seconds must be > 0".into());
        }
        // Reconcile validations
        if self.reconcile.enabled && self.reconcile.command.trim().is_empty() {
            return Err("reconcile.enabled=true requires reconcile.command".into());
        }
        if self.reconcile.timeout_seconds == 0 {
            return Err("reconcile.timeout_seconds must be > 0".into());
        }
        // Protocol validations
        if self.protocol.password_length < 8 {
            return Err("protocol.password_length must be >= 8".into());
        }
        if self.protocol.shadowsocks_method.is_empty() {
            return Err("protocol.shadowsocks_method must not be empty".into());
        }
        // Logging validation
        let lvl = self.logging.level.to_ascii_lowercase();
        let valid_levels = ["trace", "debug", "info", "warn", "error", "off"];
        if !valid_levels.contains(&lvl.as_str()) {
            return Err(format!("logging.level must be one of {valid_levels:?}"));
        }
        Ok(())
    }

    pub fn secret_defaults(&self) -> SecretDefaults {
        SecretDefaults {
            shadowsocks_method: self.protocol.shadowsocks_method.clone(),
            vless_flow: self.protocol.vless_flow.clone(),
            password_length: self.protocol.password_length,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Sqlite,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,
    #[serde(default)]
    pub sqlite: SqliteConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqliteConfig {
    /// Panel database file
    #[serde(default = "default_sqlite_path")]
    pub path: String,
}
fn default_sqlite_path() -> String {
    "/etc/x-ui/x-ui.db".into()
}
impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            path: default_sqlite_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobsConfig {
    /// JSON file holding the job table
    #[serde(default = "default_store_path")]
    pub store_path: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_batch_pause_ms")]
    pub batch_pause_ms: u64,
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,
    /// Upper bound for count x targets in one request
    #[serde(default = "default_max_operations")]
    pub max_operations: usize,
    #[serde(default = "default_max_targets")]
    pub max_targets: usize,
    /// Finished jobs older than this are purged
    #[serde(default = "default_retention_hours")]
    pub retention_hours: u64,
    #[serde(default = "default_cleanup_interval_seconds")]
    pub cleanup_interval_seconds: u64,
    /// Directory for a database copy taken before each repair job
    #[serde(default)]
    pub repair_backup_dir: Option<String>,
}
fn default_store_path() -> String {
    "data/jobs.json".into()
}
fn default_batch_size() -> usize {
    100
}
fn default_batch_pause_ms() -> u64 {
    2000
}
fn default_max_concurrent_jobs() -> usize {
    4
}
fn default_max_operations() -> usize {
    5000
}
fn default_max_targets() -> usize {
    10
}
fn default_retention_hours() -> u64 {
    168
}
fn default_cleanup_interval_seconds() -> u64 {
    3600
}
impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            store_path: default_store_path(),
            batch_size: default_batch_size(),
            batch_pause_ms: default_batch_pause_ms(),
            max_concurrent_jobs: default_max_concurrent_jobs(),
            max_operations: default_max_operations(),
            max_targets: default_max_targets(),
            retention_hours: default_retention_hours(),
            cleanup_interval_seconds: default_cleanup_interval_seconds(),
            repair_backup_dir: None,
        }
    }
}

impl JobsConfig {
    pub fn batch_pause(&self) -> Duration {
        Duration::from_millis(self.batch_pause_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileConfig {
    /// When false a no-op reconciler is used
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_reconcile_command")]
    pub command: String,
    #[serde(default = "default_reconcile_args")]
    pub args: Vec<String>,
    #[serde(default = "default_reconcile_timeout")]
    pub timeout_seconds: u64,
    /// Optional service restart run after the main command, e.g. `systemctl restart x-ui`
    #[serde(default)]
    pub restart_command: Option<String>,
    #[serde(default)]
    pub restart_args: Vec<String>,
}
fn default_true() -> bool {
    true
}
fn default_reconcile_command() -> String {
    "/usr/local/x-ui/x-ui".into()
}
fn default_reconcile_args() -> Vec<String> {
    vec!["migrate".into()]
}
fn default_reconcile_timeout() -> u64 {
    30
}
impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            command: default_reconcile_command(),
            args: default_reconcile_args(),
            timeout_seconds: default_reconcile_timeout(),
            restart_command: None,
            restart_args: Vec::new(),
        }
    }
}

impl ReconcileConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolConfig {
    #[serde(default = "default_shadowsocks_method")]
    pub shadowsocks_method: String,
    #[serde(default = "default_vless_flow")]
    pub vless_flow: String,
    #[serde(default = "default_password_length")]
    pub password_length: usize,
}
fn default_shadowsocks_method() -> String {
    "chacha20-ietf-poly1305".into()
}
fn default_vless_flow() -> String {
    "xtls-rprx-vision".into()
}
fn default_password_length() -> usize {
    16
}
impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            shadowsocks_method: default_shadowsocks_method(),
            vless_flow: default_vless_flow(),
            password_length: default_password_length(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}
fn default_log_level() -> String {
    "info".into()
}
impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

pub mod loader {
    use super::AppConfig;
    use config::{Config, Environment, File};
    use std::path::PathBuf;

    pub const DEFAULT_CONFIG_FILE: &str = "xpanel.toml";

    pub fn load_config(path: Option<&str>) -> Result<AppConfig, String> {
        let mut builder = Config::builder();
        let pathbuf = PathBuf::from(path.unwrap_or(DEFAULT_CONFIG_FILE));
        if pathbuf.exists() {
            builder = builder.add_source(File::from(pathbuf));
        }
        // Environment variable overrides, e.g., XPANEL__JOBS__BATCH_SIZE=50
        builder = builder.add_source(
            Environment::with_prefix("XPANEL")
                .prefix_separator("__")
                .try_parsing(true)
                .separator("__"),
        );
        let cfg = builder
            .build()
            .map_err(|e| format!("config build error: {e}"))?;
        let merged: AppConfig = cfg
            .try_deserialize()
            .map_err(|e| format!("config deserialize error: {e}"))?;
        // Validate
        merged.validate()?;
        Ok(merged)
    }
}

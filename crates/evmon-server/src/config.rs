//! Configuration management
//!
//! Layers, lowest precedence first:
//!
//! 1. built-in defaults (the `DEFAULT_*` constants below)
//! 2. optional `config.{toml,json,yaml}` under `CONFIG_ROOT` (defaults to the
//!    working directory)
//! 3. environment variables prefixed `EVMON__`, with `__` between sections,
//!    e.g. `EVMON__SFDC__USERNAME` or `EVMON__POLLING__TYPES=Login,API`
//!
//! A `.env` file is loaded into the environment before any of this happens.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;

use crate::sfdc::AuthMechanism;

// ============================================================================
// Server Configuration Constants
// ============================================================================

/// Default status API host binding.
pub const DEFAULT_SERVER_HOST: &str = "127.0.0.1";

/// Default status API port.
pub const DEFAULT_SERVER_PORT: u16 = 3000;

/// Default shutdown timeout in seconds.
pub const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 30;

// ============================================================================
// Database Configuration Constants
// ============================================================================

/// Default database URL for local development.
pub const DEFAULT_DATABASE_URL: &str = "postgresql://localhost/evmon";

/// Default maximum database connections in the pool.
pub const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 10;

/// Default minimum database connections in the pool.
pub const DEFAULT_DATABASE_MIN_CONNECTIONS: u32 = 2;

/// Default database connection timeout in seconds.
pub const DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Default database idle timeout in seconds (10 minutes).
pub const DEFAULT_DATABASE_IDLE_TIMEOUT_SECS: u64 = 600;

/// Logical database that namespaces every monitoring collection.
pub const DEFAULT_MONITORING_DB_NAME: &str = "monitoring";

// ============================================================================
// Remote System Constants
// ============================================================================

pub const DEFAULT_SFDC_AUTH: &str = "userpass";
pub const DEFAULT_SFDC_API_VERSION: &str = "47.0";
pub const DEFAULT_SFDC_INTERVAL: &str = "Hourly";
pub const DEFAULT_SFDC_CLIENT_NAME: &str = "eventMonitoringManager";

/// Production login endpoint.
pub const PRODUCTION_LOGIN_URL: &str = "https://login.salesforce.com";

/// Sandbox login endpoint.
pub const SANDBOX_LOGIN_URL: &str = "https://test.salesforce.com";

// ============================================================================
// Ingestion Constants
// ============================================================================

/// Polling period, 30 minutes.
pub const DEFAULT_POLLING_EVERY_SECS: u64 = 1800;

/// Log files of one batch that run through the pipeline at once.
pub const DEFAULT_MAX_CONCURRENT_FILES: usize = 8;

/// Collection that records already ingested log files.
pub const DEFAULT_LOG_FILES_COLLECTION: &str = "event_log_files";

pub const DEFAULT_POLLING_TYPES: &[&str] = &["Login", "WavePerformance"];
pub const DEFAULT_EXTRACTORS: &[&str] = &["toJson"];
pub const DEFAULT_TRANSFORMERS: &[&str] = &["typeMap"];
pub const DEFAULT_LOADERS: &[&str] = &["documentStore"];

pub const DEFAULT_FLAT_FILE_ROOT: &str = "./logs/event-files";
pub const DEFAULT_FLAT_FILE_DIRECTORY: &str = "%Y/%m/%d/%H";
pub const DEFAULT_FLAT_FILE_NAME: &str = "{type}";
pub const DEFAULT_FLAT_FILE_EXTENSION: &str = "csv";

/// Initial delay before a failed push-channel request is retried.
pub const DEFAULT_STREAMING_RETRY_MS: u64 = 1000;

/// Upper bound on the push-channel retry delay.
pub const DEFAULT_STREAMING_MAX_BACKOFF_SECS: u64 = 60;

// ============================================================================
// Scheduler Constants
// ============================================================================

/// Global ceiling on concurrently running job bodies.
pub const DEFAULT_MAX_CONCURRENCY: usize = 30;

/// Per-job ceiling on concurrently running invocations.
pub const DEFAULT_JOB_CONCURRENCY: usize = 10;

/// Environment prefix for configuration overrides.
pub const ENV_PREFIX: &str = "EVMON";

/// Keys whose environment values are comma separated lists.
const LIST_KEYS: &[&str] = &[
    "polling.types",
    "polling.extractors",
    "polling.transformers",
    "polling.loaders",
    "streaming.topics",
];

/// Service configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub monitoring: MonitoringConfig,
    pub sfdc: SfdcConfig,
    pub polling: PollingConfig,
    pub streaming: StreamingConfig,
    pub scheduler: SchedulerConfig,
}

/// Status API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub shutdown_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_SERVER_HOST.to_string(),
            port: DEFAULT_SERVER_PORT,
            shutdown_timeout_secs: DEFAULT_SHUTDOWN_TIMEOUT_SECS,
        }
    }
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_secs: u64,
    pub idle_timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_DATABASE_URL.to_string(),
            max_connections: DEFAULT_DATABASE_MAX_CONNECTIONS,
            min_connections: DEFAULT_DATABASE_MIN_CONNECTIONS,
            connect_timeout_secs: DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
            idle_timeout_secs: DEFAULT_DATABASE_IDLE_TIMEOUT_SECS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    /// Logical database name prefixed to every collection namespace
    pub db_name: String,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            db_name: DEFAULT_MONITORING_DB_NAME.to_string(),
        }
    }
}

/// Remote system credentials and query settings
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SfdcConfig {
    pub auth: String,
    pub username: String,
    pub password: String,
    pub security_token: String,
    pub sandbox: bool,
    pub api_version: String,
    /// Log file interval to poll, `Hourly` or `Daily`
    pub interval: String,
    pub client_name: String,
    /// Overrides the production/sandbox login endpoint
    pub login_url: Option<String>,
}

impl SfdcConfig {
    pub fn login_url(&self) -> &str {
        match self.login_url.as_deref() {
            Some(url) => url,
            None if self.sandbox => SANDBOX_LOGIN_URL,
            None => PRODUCTION_LOGIN_URL,
        }
    }
}

impl Default for SfdcConfig {
    fn default() -> Self {
        Self {
            auth: DEFAULT_SFDC_AUTH.to_string(),
            username: String::new(),
            password: String::new(),
            security_token: String::new(),
            sandbox: false,
            api_version: DEFAULT_SFDC_API_VERSION.to_string(),
            interval: DEFAULT_SFDC_INTERVAL.to_string(),
            client_name: DEFAULT_SFDC_CLIENT_NAME.to_string(),
            login_url: None,
        }
    }
}

impl std::fmt::Debug for SfdcConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SfdcConfig")
            .field("auth", &self.auth)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("security_token", &"<redacted>")
            .field("sandbox", &self.sandbox)
            .field("api_version", &self.api_version)
            .field("interval", &self.interval)
            .field("client_name", &self.client_name)
            .field("login_url", &self.login_url)
            .finish()
    }
}

/// Polling jobs and the log file pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    /// Event types to poll, one recurring job each
    pub types: Vec<String>,
    pub every_secs: u64,
    pub storage_collection: StorageCollections,
    pub extractors: Vec<String>,
    pub transformers: Vec<String>,
    pub loaders: Vec<String>,
    pub flat_file: FlatFileConfig,
    /// Upper bound on log files of one batch processed concurrently
    pub max_concurrent_files: usize,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            types: owned(DEFAULT_POLLING_TYPES),
            every_secs: DEFAULT_POLLING_EVERY_SECS,
            storage_collection: StorageCollections::default(),
            extractors: owned(DEFAULT_EXTRACTORS),
            transformers: owned(DEFAULT_TRANSFORMERS),
            loaders: owned(DEFAULT_LOADERS),
            flat_file: FlatFileConfig::default(),
            max_concurrent_files: DEFAULT_MAX_CONCURRENT_FILES,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageCollections {
    pub log_files: String,
}

impl Default for StorageCollections {
    fn default() -> Self {
        Self {
            log_files: DEFAULT_LOG_FILES_COLLECTION.to_string(),
        }
    }
}

/// Layout of raw log files written by the `flatFile` loader.
///
/// `directory` and `file` are strftime templates evaluated against the log
/// date; `{type}` in either is replaced by the event type.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FlatFileConfig {
    pub root: PathBuf,
    pub directory: String,
    pub file: String,
    pub extension: String,
}

impl Default for FlatFileConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(DEFAULT_FLAT_FILE_ROOT),
            directory: DEFAULT_FLAT_FILE_DIRECTORY.to_string(),
            file: DEFAULT_FLAT_FILE_NAME.to_string(),
            extension: DEFAULT_FLAT_FILE_EXTENSION.to_string(),
        }
    }
}

/// Push subscriptions
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// Platform event topics, one long-lived job each
    pub topics: Vec<String>,
    pub retry_interval_ms: u64,
    pub max_backoff_secs: u64,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            topics: Vec::new(),
            retry_interval_ms: DEFAULT_STREAMING_RETRY_MS,
            max_backoff_secs: DEFAULT_STREAMING_MAX_BACKOFF_SECS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub max_concurrency: usize,
    pub default_concurrency: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            default_concurrency: DEFAULT_JOB_CONCURRENCY,
        }
    }
}

fn owned(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

impl Config {
    /// Load configuration from defaults, the optional config file and the environment
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let root = std::env::var("CONFIG_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));

        let config = Self::load_from(&root)?;
        config.validate()?;

        Ok(config)
    }

    /// Build the layered configuration rooted at `root` without validating it
    pub fn load_from(root: &std::path::Path) -> anyhow::Result<Self> {
        let defaults = ::config::Config::try_from(&Config::default())?;

        let mut env = ::config::Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("__")
            .separator("__")
            .list_separator(",")
            .try_parsing(true);
        for key in LIST_KEYS {
            env = env.with_list_parse_key(key);
        }

        let config = ::config::Config::builder()
            .add_source(defaults)
            .add_source(
                ::config::File::from(root.join("config")).required(false),
            )
            .add_source(env)
            .build()?
            .try_deserialize()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.server.port == 0 {
            anyhow::bail!("Server port must be greater than 0");
        }

        if self.database.url.is_empty() {
            anyhow::bail!("Database URL cannot be empty");
        }

        if self.database.max_connections == 0 {
            anyhow::bail!("Database max_connections must be greater than 0");
        }

        if self.database.min_connections > self.database.max_connections {
            anyhow::bail!(
                "Database min_connections ({}) cannot be greater than max_connections ({})",
                self.database.min_connections,
                self.database.max_connections
            );
        }

        AuthMechanism::from_str(&self.sfdc.auth)?;

        if self.polling.every_secs == 0 {
            anyhow::bail!("Polling interval must be greater than 0 seconds");
        }

        if self.polling.max_concurrent_files == 0 {
            anyhow::bail!("Polling max_concurrent_files must be greater than 0");
        }

        if self.scheduler.max_concurrency == 0 || self.scheduler.default_concurrency == 0 {
            anyhow::bail!("Scheduler concurrency limits must be greater than 0");
        }

        if self.polling.types.is_empty() && self.streaming.topics.is_empty() {
            tracing::warn!("No polling types or streaming topics configured - nothing will be ingested");
        }

        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_defaults() {
        let config = Config::default();

        assert_eq!(config.polling.every_secs, 1800);
        assert_eq!(config.polling.types, vec!["Login", "WavePerformance"]);
        assert_eq!(config.polling.storage_collection.log_files, "event_log_files");
        assert_eq!(config.polling.max_concurrent_files, 8);
        assert_eq!(config.scheduler.max_concurrency, 30);
        assert_eq!(config.scheduler.default_concurrency, 10);
        assert_eq!(config.monitoring.db_name, "monitoring");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_login_url_selection() {
        let mut sfdc = SfdcConfig::default();
        assert_eq!(sfdc.login_url(), PRODUCTION_LOGIN_URL);

        sfdc.sandbox = true;
        assert_eq!(sfdc.login_url(), SANDBOX_LOGIN_URL);

        sfdc.login_url = Some("http://127.0.0.1:9999".to_string());
        assert_eq!(sfdc.login_url(), "http://127.0.0.1:9999");
    }

    #[test]
    fn test_debug_redacts_credentials() {
        let sfdc = SfdcConfig {
            password: "hunter2".to_string(),
            security_token: "tok".to_string(),
            ..Default::default()
        };

        let debug = format!("{:?}", sfdc);
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("<redacted>"));
    }

    #[test]
    fn test_validate_rejects_unknown_auth() {
        let mut config = Config::default();
        config.sfdc.auth = "oauth".to_string();

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Unknown auth mechanism 'oauth'"));
    }

    #[test]
    fn test_validate_rejects_zero_ceilings() {
        let mut config = Config::default();
        config.scheduler.max_concurrency = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.polling.every_secs = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.polling.max_concurrent_files = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.database.url.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    #[serial]
    fn test_file_and_env_layers() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.toml"),
            r#"
[sfdc]
username = "monitor@example.com"
interval = "Daily"

[polling]
types = ["API"]
every_secs = 60
"#,
        )
        .unwrap();

        std::env::set_var("EVMON__SFDC__INTERVAL", "Hourly");
        std::env::set_var("EVMON__STREAMING__TOPICS", "LoginEventStream,ApiEventStream");

        let config = Config::load_from(dir.path()).unwrap();

        std::env::remove_var("EVMON__SFDC__INTERVAL");
        std::env::remove_var("EVMON__STREAMING__TOPICS");

        assert_eq!(config.sfdc.username, "monitor@example.com");
        assert_eq!(config.sfdc.interval, "Hourly");
        assert_eq!(config.polling.types, vec!["API"]);
        assert_eq!(config.polling.every_secs, 60);
        assert_eq!(config.polling.loaders, vec!["documentStore"]);
        assert_eq!(
            config.streaming.topics,
            vec!["LoginEventStream", "ApiEventStream"]
        );
    }
}

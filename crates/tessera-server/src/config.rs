//! Site configuration loading from file and environment variables.

use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use thiserror::Error;

use tessera_replication::RefreshSettings;
use tessera_types::{Identifier, SiteCapabilities};

/// Top-level site configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Server network settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Database settings.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Who this site is and what it does.
    #[serde(default)]
    pub site: SiteConfig,

    /// Replica leases and refresh timing.
    #[serde(default)]
    pub replication: ReplicationConfig,

    /// Whether this process also hosts the registry.
    #[serde(default)]
    pub registry: RegistryConfig,
}

/// Network configuration for the HTTP server.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Host address to bind to.
    #[serde(default = "default_host")]
    pub host: IpAddr,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_db_path")]
    pub path: String,

    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    #[serde(default = "default_pool_max_size")]
    pub pool_max_size: u32,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "tessera_server=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

/// Identity and capabilities of this site.
#[derive(Debug, Clone, Deserialize)]
pub struct SiteConfig {
    /// Site identifier, `site:<namespace>:<name>`.
    #[serde(default = "default_site_id")]
    pub id: String,

    /// Namespace whose rules this site serves, if it serves policy.
    #[serde(default)]
    pub namespace: Option<String>,

    /// Hex-encoded Ed25519 key of the namespace owner. Only consulted when
    /// the registry cannot be reached at start-up.
    #[serde(default)]
    pub owner_key: Option<String>,

    /// Owning party, used together with `owner_key`.
    #[serde(default)]
    pub owner: Option<String>,

    /// Base URL other sites use to reach this one.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Base URL of the registry. Ignored when `registry.serve` is set.
    #[serde(default)]
    pub registry_url: Option<String>,

    /// URL the execution backend accepts step invocations on.
    #[serde(default)]
    pub backend_url: Option<String>,

    #[serde(default)]
    pub can_run_steps: bool,

    #[serde(default = "default_true")]
    pub can_store_assets: bool,

    #[serde(default)]
    pub can_serve_policy: bool,

    /// Also require access to step outputs when planning or accepting
    /// plans, and that submitters may use workflow outputs.
    #[serde(default)]
    pub check_outputs: bool,
}

/// Replication timing.
#[derive(Debug, Clone, Deserialize)]
pub struct ReplicationConfig {
    /// Lease granted to replicas of the stores this site serves.
    #[serde(default = "default_served_lease_secs")]
    pub served_lease_secs: u64,

    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    #[serde(default = "default_lease_margin_secs")]
    pub lease_margin_secs: u64,

    #[serde(default = "default_min_backoff_ms")]
    pub min_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// How long an evaluation waits for expired replicas to refresh.
    #[serde(default = "default_refresh_timeout_secs")]
    pub refresh_timeout_secs: u64,

    /// How often replica state and served archives are written to disk.
    #[serde(default = "default_persist_interval_secs")]
    pub persist_interval_secs: u64,
}

/// Registry hosting.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RegistryConfig {
    #[serde(default)]
    pub serve: bool,
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
}

fn default_port() -> u16 {
    4000
}

fn default_db_path() -> String {
    "tessera.db".to_string()
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

fn default_pool_max_size() -> u32 {
    8
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_site_id() -> String {
    "site:local:site".to_string()
}

fn default_endpoint() -> String {
    "http://127.0.0.1:4000".to_string()
}

fn default_true() -> bool {
    true
}

fn default_served_lease_secs() -> u64 {
    60
}

fn default_poll_interval_secs() -> u64 {
    30
}

fn default_lease_margin_secs() -> u64 {
    5
}

fn default_min_backoff_ms() -> u64 {
    250
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

fn default_refresh_timeout_secs() -> u64 {
    10
}

fn default_persist_interval_secs() -> u64 {
    15
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
            pool_max_size: default_pool_max_size(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            id: default_site_id(),
            namespace: None,
            owner_key: None,
            owner: None,
            endpoint: default_endpoint(),
            registry_url: None,
            backend_url: None,
            can_run_steps: false,
            can_store_assets: true,
            can_serve_policy: false,
            check_outputs: false,
        }
    }
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            served_lease_secs: default_served_lease_secs(),
            poll_interval_secs: default_poll_interval_secs(),
            lease_margin_secs: default_lease_margin_secs(),
            min_backoff_ms: default_min_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            refresh_timeout_secs: default_refresh_timeout_secs(),
            persist_interval_secs: default_persist_interval_secs(),
        }
    }
}

impl SiteConfig {
    pub fn site_id(&self) -> Result<Identifier, ConfigError> {
        Identifier::parse(&self.id).map_err(|e| ConfigError::Invalid(format!("site.id: {e}")))
    }

    pub fn capabilities(&self) -> SiteCapabilities {
        SiteCapabilities {
            can_run_steps: self.can_run_steps,
            can_store_assets: self.can_store_assets,
            can_serve_policy: self.can_serve_policy,
        }
    }
}

impl ReplicationConfig {
    pub fn served_lease(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.served_lease_secs).unwrap_or(i64::MAX))
    }

    pub fn refresh_settings(&self) -> RefreshSettings {
        RefreshSettings {
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            lease_margin: Duration::from_secs(self.lease_margin_secs),
            min_backoff: Duration::from_millis(self.min_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
        }
    }

    pub fn refresh_timeout(&self) -> Duration {
        Duration::from_secs(self.refresh_timeout_secs)
    }

    pub fn persist_interval(&self) -> Duration {
        Duration::from_secs(self.persist_interval_secs.max(1))
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value parsed but makes no sense.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Loads configuration from a TOML file, falling back to defaults.
///
/// Environment variable overrides:
/// - `TESSERA_HOST` overrides `server.host`
/// - `TESSERA_PORT` overrides `server.port`
/// - `TESSERA_DB_PATH` overrides `database.path`
/// - `TESSERA_LOG_LEVEL` overrides `logging.level`
/// - `TESSERA_LOG_JSON` overrides `logging.json` (set to "true" to enable)
/// - `TESSERA_SITE_ID` overrides `site.id`
/// - `TESSERA_SITE_ENDPOINT` overrides `site.endpoint`
/// - `TESSERA_REGISTRY_URL` overrides `site.registry_url`
/// - `TESSERA_BACKEND_URL` overrides `site.backend_url`
/// - `TESSERA_SERVE_REGISTRY` overrides `registry.serve`
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed,
/// or if the result is inconsistent.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = p, "config file not found, using defaults");
                Config::default()
            }
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => Config::default(),
    };

    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    validate(&config)?;
    Ok(config)
}

fn apply_env_overrides(config: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(host) = var("TESSERA_HOST") {
        if let Ok(parsed) = host.parse() {
            config.server.host = parsed;
        }
    }
    if let Some(port) = var("TESSERA_PORT") {
        if let Ok(parsed) = port.parse() {
            config.server.port = parsed;
        }
    }
    if let Some(db_path) = var("TESSERA_DB_PATH") {
        config.database.path = db_path;
    }
    if let Some(level) = var("TESSERA_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Some(json) = var("TESSERA_LOG_JSON") {
        config.logging.json = json == "true" || json == "1";
    }
    if let Some(id) = var("TESSERA_SITE_ID") {
        config.site.id = id;
    }
    if let Some(endpoint) = var("TESSERA_SITE_ENDPOINT") {
        config.site.endpoint = endpoint;
    }
    if let Some(url) = var("TESSERA_REGISTRY_URL") {
        config.site.registry_url = Some(url);
    }
    if let Some(url) = var("TESSERA_BACKEND_URL") {
        config.site.backend_url = Some(url);
    }
    if let Some(serve) = var("TESSERA_SERVE_REGISTRY") {
        config.registry.serve = serve == "true" || serve == "1";
    }
}

fn validate(config: &Config) -> Result<(), ConfigError> {
    config.site.site_id()?;
    if config.site.can_serve_policy && config.site.namespace.is_none() {
        return Err(ConfigError::Invalid(
            "site.can_serve_policy requires site.namespace".to_string(),
        ));
    }
    if !config.registry.serve && config.site.registry_url.is_none() {
        return Err(ConfigError::Invalid(
            "either registry.serve or site.registry_url must be set".to_string(),
        ));
    }
    if config.replication.served_lease_secs == 0 {
        return Err(ConfigError::Invalid(
            "replication.served_lease_secs must be positive".to_string(),
        ));
    }
    Ok(())
}

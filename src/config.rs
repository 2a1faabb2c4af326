//! Configuration management
//!
//! Loads configuration from:
//! 1. Default values
//! 2. Configuration files (config/default.toml, config/local.toml)
//! 3. Environment variables (override)

use serde::Deserialize;
use std::{net::IpAddr, path::PathBuf, time::Duration};

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub federation: FederationConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Port number (e.g., 8080)
    pub port: u16,
    /// Public domain (e.g., "social.example.com")
    pub domain: String,
    /// Protocol ("http" or "https")
    pub protocol: String,
}

impl ServerConfig {
    /// Get the base URL for the instance
    ///
    /// # Returns
    /// Full URL like "https://social.example.com"
    pub fn base_url(&self) -> String {
        format!("{}://{}", self.protocol, self.domain)
    }

    pub fn is_https(&self) -> bool {
        self.protocol.eq_ignore_ascii_case("https")
    }
}

/// Database configuration (SQLite only)
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to SQLite database file
    pub path: PathBuf,
}

/// How a user without an administrator override is treated
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConsentMode {
    /// Eligible unless the user explicitly declined
    #[default]
    DefaultAllow,
    /// Eligible only after an explicit opt-in
    OptIn,
}

/// Federation behaviour
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FederationConfig {
    /// Path prefix for the actor/object routes, e.g. "/ap". Empty for none.
    pub base_path: String,
    /// RSA modulus size for generated actor keys
    pub key_bits: usize,
    /// Timeout for remote actor document fetches
    pub fetch_timeout_secs: u64,
    pub user_agent: String,
    /// Permit plain HTTP and private addresses for remote actors (tests, LAN setups)
    pub allow_insecure_remotes: bool,
    /// Require a signed, matching Digest header on inbound requests with a body
    pub require_digest: bool,
    /// Require a verified HTTP signature on Follow as well as Undo
    pub require_signed_follow: bool,
    pub consent_mode: ConsentMode,
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self {
            base_path: String::new(),
            key_bits: 2048,
            fetch_timeout_secs: 5,
            user_agent: format!("fedihost/{}", env!("CARGO_PKG_VERSION")),
            allow_insecure_remotes: false,
            require_digest: false,
            require_signed_follow: false,
            consent_mode: ConsentMode::DefaultAllow,
        }
    }
}

impl FederationConfig {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }
}

/// Outbound delivery queue settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Run the periodic drain task
    pub enabled: bool,
    /// Items claimed per round
    pub batch_size: u32,
    /// Maximum in-flight requests per round
    pub max_concurrency: usize,
    pub request_timeout_secs: u64,
    /// Retry delay is `backoff_base_secs ^ retry_count` seconds
    pub backoff_base_secs: u64,
    /// Failed attempts after which an item is dropped
    pub max_attempts: u32,
    pub drain_interval_secs: u64,
    /// Wall-clock budget for one drain invocation
    pub drain_budget_secs: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            batch_size: 50,
            max_concurrency: 10,
            request_timeout_secs: 5,
            backoff_base_secs: 3,
            max_attempts: 10,
            drain_interval_secs: 60,
            drain_budget_secs: 55,
        }
    }
}

impl DeliveryConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn drain_budget(&self) -> Duration {
        Duration::from_secs(self.drain_budget_secs)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: String,
    /// Log format: "pretty" or "json"
    pub format: String,
}

impl AppConfig {
    /// Load configuration from file and environment
    ///
    /// # Loading Order
    /// 1. Default values
    /// 2. config/default.toml (if exists)
    /// 3. config/local.toml (if exists)
    /// 4. Environment variables (FEDIHOST__*)
    ///
    /// # Errors
    /// Returns error if configuration is invalid
    pub fn load() -> Result<Self, crate::error::AppError> {
        use config::{Config, Environment, File};

        let config = Config::builder()
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 8080)?
            .set_default("server.protocol", "http")?
            .set_default("database.path", "data/fedihost.db")?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            .add_source(
                Environment::with_prefix("FEDIHOST")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;

        let app_config: Self = config
            .try_deserialize()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;
        app_config.validate()?;
        Ok(app_config)
    }

    /// Base URL under which actors and objects are published,
    /// e.g. "https://social.example.com/ap"
    pub fn federation_base_url(&self) -> String {
        format!(
            "{}{}",
            self.server.base_url(),
            self.federation.base_path.trim_end_matches('/')
        )
    }

    pub fn validate(&self) -> Result<(), crate::error::AppError> {
        use crate::error::AppError;

        if !self.server.is_https() {
            if is_local_server_domain(&self.server.domain) {
                let host = normalized_server_host(&self.server.domain);
                tracing::warn!(
                    host = %host,
                    protocol = %self.server.protocol,
                    "Serving federation over plain HTTP for local development"
                );
            } else {
                return Err(AppError::Config(
                    "server.protocol must be https for non-local server domains".to_string(),
                ));
            }
        }

        let base_path = &self.federation.base_path;
        if !base_path.is_empty() && (!base_path.starts_with('/') || base_path.ends_with('/')) {
            return Err(AppError::Config(
                "federation.base_path must start with '/' and must not end with '/'".to_string(),
            ));
        }

        if self.federation.key_bits < 1024 {
            return Err(AppError::Config(
                "federation.key_bits must be at least 1024".to_string(),
            ));
        }

        if self.delivery.batch_size == 0 || self.delivery.max_concurrency == 0 {
            return Err(AppError::Config(
                "delivery.batch_size and delivery.max_concurrency must be greater than 0"
                    .to_string(),
            ));
        }

        if self.delivery.max_attempts == 0 {
            return Err(AppError::Config(
                "delivery.max_attempts must be greater than 0".to_string(),
            ));
        }

        if self.delivery.backoff_base_secs < 2 {
            return Err(AppError::Config(
                "delivery.backoff_base_secs must be at least 2".to_string(),
            ));
        }

        Ok(())
    }
}

pub fn normalized_server_host(domain: &str) -> String {
    let trimmed = domain.trim();
    let parsed_host = url::Url::parse(&format!("http://{trimmed}"))
        .ok()
        .and_then(|url| url.host_str().map(|host| host.to_string()));
    let host = parsed_host.unwrap_or_else(|| trimmed.to_string());
    host.trim_end_matches('.').to_ascii_lowercase()
}

fn is_local_server_domain(domain: &str) -> bool {
    let host = normalized_server_host(domain);
    if host == "localhost" || host.ends_with(".localhost") {
        return true;
    }

    let bare = host.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = bare.parse::<IpAddr>() {
        return ip.is_loopback() || ip.is_unspecified();
    }

    false
}

//! Configuration management for the ualink client runtime.
//!
//! Supports:
//! - Loading from YAML files
//! - Environment variable overrides (`UALINK__CLIENT__ENDPOINT_URL=...`)
//! - Validation of the client, API and logging sections

use crate::error::{ConfigError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::Level;

/// Main application configuration.
///
/// # Examples
///
/// ```no_run
/// use ualink_core::config::AppConfig;
///
/// let config = AppConfig::from_file("ualink.yaml").unwrap();
/// config.validate().unwrap();
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    /// Session settings for the automation server
    #[serde(default)]
    pub client: ClientConfig,

    /// HTTP/WebSocket host settings
    #[serde(default)]
    pub api: ApiConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Certificate generation settings
    #[serde(default)]
    pub certs: CertConfig,
}

impl AppConfig {
    /// Creates a new default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::LoadFailed {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        Self::from_yaml(&contents)
    }

    /// Loads configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| {
            ConfigError::InvalidFormat {
                reason: e.to_string(),
            }
            .into()
        })
    }

    /// Loads configuration using the `config` crate, layering `UALINK__*`
    /// environment variables over the file.
    pub fn from_config_builder<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let config = config::Config::builder()
            .add_source(config::File::from(path).required(true))
            .add_source(
                config::Environment::with_prefix("UALINK")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| ConfigError::LoadFailed {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;

        config.try_deserialize().map_err(|e| {
            ConfigError::InvalidFormat {
                reason: e.to_string(),
            }
            .into()
        })
    }

    /// Validates the configuration.
    ///
    /// Security policy and mode are checked later, when session options are
    /// provisioned, because that step also needs the certificate material.
    pub fn validate(&self) -> Result<()> {
        self.client.validate()?;

        if self.api.enabled && self.api.port == 0 {
            return Err(ConfigError::invalid("api.port", "port must be non-zero").into());
        }

        self.logging.parse_level()?;
        Ok(())
    }

    /// Serializes the configuration to YAML.
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(|e| {
            ConfigError::InvalidFormat {
                reason: e.to_string(),
            }
            .into()
        })
    }
}

/// Session settings.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Server endpoint, `opc.tcp://host:port[/path]`
    pub endpoint_url: String,

    /// Security policy short name or URI; empty or `auto` means None
    pub security_policy: String,

    /// `none`, `sign` or `signandencrypt`; empty or `auto` means None
    pub security_mode: String,

    /// `anonymous` or `username`
    pub auth_mode: String,

    pub username: String,
    pub password: String,
    pub user_token_policy_id: String,

    /// Client certificate (PEM chain or DER)
    pub cert_file: Option<PathBuf>,

    /// Client private key (PEM or DER)
    pub key_file: Option<PathBuf>,

    pub application_uri: String,
    pub product_uri: String,
    pub session_name: String,

    /// Session timeout in seconds
    pub session_timeout_secs: u64,

    /// Deadline for a single session-open attempt, in seconds
    pub connect_timeout_secs: f64,

    /// Number of session-open attempts per connect
    pub retry_attempts: u32,

    /// Delay between attempts, in seconds
    pub retry_delay_secs: f64,

    /// Connect as soon as the runtime starts
    pub auto_connect: bool,

    /// Generate a CA-signed client certificate when a secure mode has none
    pub auto_generate_cert: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint_url: "opc.tcp://localhost:4840".to_string(),
            security_policy: String::new(),
            security_mode: String::new(),
            auth_mode: "anonymous".to_string(),
            username: String::new(),
            password: String::new(),
            user_token_policy_id: String::new(),
            cert_file: None,
            key_file: None,
            application_uri: String::new(),
            product_uri: String::new(),
            session_name: String::new(),
            session_timeout_secs: 1800,
            connect_timeout_secs: 10.0,
            retry_attempts: 3,
            retry_delay_secs: 1.0,
            auto_connect: false,
            auto_generate_cert: false,
        }
    }
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("endpoint_url", &self.endpoint_url)
            .field("security_policy", &self.security_policy)
            .field("security_mode", &self.security_mode)
            .field("auth_mode", &self.auth_mode)
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .field("cert_file", &self.cert_file)
            .field("key_file", &self.key_file)
            .field("application_uri", &self.application_uri)
            .field("retry_attempts", &self.retry_attempts)
            .finish_non_exhaustive()
    }
}

impl ClientConfig {
    pub fn new(endpoint_url: impl Into<String>) -> Self {
        Self {
            endpoint_url: endpoint_url.into(),
            ..Default::default()
        }
    }

    pub fn with_security(mut self, policy: &str, mode: &str) -> Self {
        self.security_policy = policy.to_string();
        self.security_mode = mode.to_string();
        self
    }

    pub fn with_credentials(mut self, username: &str, password: &str) -> Self {
        self.auth_mode = "username".to_string();
        self.username = username.to_string();
        self.password = password.to_string();
        self
    }

    pub fn with_certificate(mut self, cert_file: impl Into<PathBuf>, key_file: impl Into<PathBuf>) -> Self {
        self.cert_file = Some(cert_file.into());
        self.key_file = Some(key_file.into());
        self
    }

    pub fn with_retry(mut self, attempts: u32, delay: Duration) -> Self {
        self.retry_attempts = attempts;
        self.retry_delay_secs = delay.as_secs_f64();
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_secs = timeout.as_secs_f64();
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.connect_timeout_secs.max(0.0))
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs_f64(self.retry_delay_secs.max(0.0))
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }

    /// Checks the fields that can be judged without touching the filesystem.
    pub fn validate(&self) -> Result<()> {
        if !self.endpoint_url.starts_with("opc.tcp://") {
            return Err(ConfigError::invalid(
                "client.endpoint_url",
                format!("expected opc.tcp:// scheme, got {:?}", self.endpoint_url),
            )
            .into());
        }

        if !(self.connect_timeout_secs.is_finite() && self.connect_timeout_secs > 0.0) {
            return Err(ConfigError::invalid(
                "client.connect_timeout_secs",
                "timeout must be greater than zero",
            )
            .into());
        }

        if self.retry_attempts == 0 {
            return Err(ConfigError::invalid(
                "client.retry_attempts",
                "at least one attempt is required",
            )
            .into());
        }

        if !(self.retry_delay_secs.is_finite() && self.retry_delay_secs >= 0.0) {
            return Err(ConfigError::invalid(
                "client.retry_delay_secs",
                "delay must not be negative",
            )
            .into());
        }

        Ok(())
    }
}

/// HTTP/WebSocket host settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub enabled: bool,
    pub bind_address: String,
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: "text" or "json"
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::Text,
        }
    }
}

impl LoggingConfig {
    /// Parses the log level string to a tracing Level.
    pub fn parse_level(&self) -> Result<Level> {
        self.level.parse().map_err(|_| {
            ConfigError::invalid("logging.level", format!("Invalid log level: {}", self.level))
                .into()
        })
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Where generated certificates live.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CertConfig {
    /// Directory holding the local CA and issued certificates
    pub dir: PathBuf,

    /// Common name written into generated client certificates
    pub common_name: String,

    pub organization: String,

    /// Validity of generated client certificates, in days
    pub validity_days: u32,
}

impl Default for CertConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("certs"),
            common_name: "ualink".to_string(),
            organization: "ualink".to_string(),
            validity_days: 3650,
        }
    }
}

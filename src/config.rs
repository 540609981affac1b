//! Configuration loading and constants.
//!
//! Loads application configuration from a TOML file, applies the environment
//! overrides the deployment scripts rely on (`DEV`, `LISTEN`, `DOMAIN`, `DOMAINS`,
//! `CONSOLE_ACCESS`), and defines constants for cache headers, fingerprint
//! staleness, timeouts, and default paths. `AppConfig` is the root configuration struct.

use const_format::formatcp;
use serde::Deserialize;
use std::path::{Path, PathBuf};

// =============================================================================
// HTTP Response Headers
// =============================================================================

/// Cache-Control applied to served files unless a caller already set one
pub const CACHE_CONTROL_STATIC: &str = "public";

/// Default lifetime of the Expires header on served files (1 hour)
pub const DEFAULT_EXPIRES_SECS: u64 = 3600;

/// Value of the Server header on every response
pub const SERVER_HEADER: &str = formatcp!("gate/{}", env!("CARGO_PKG_VERSION"));

// =============================================================================
// Fingerprint Cache Constants
// =============================================================================

/// Age after which a cached fingerprint is recomputed even if the file looks unchanged
pub const FINGERPRINT_MAX_AGE_SECS: u64 = 15 * 60;

/// Number of recompute locks; 1 means a single cache-wide lock
pub const DEFAULT_RECOMPUTE_LOCK_STRIPES: usize = 1;

// =============================================================================
// Timeouts and Queues
// =============================================================================

/// Upper bound on handling a single request, in seconds
pub const REQUEST_TIMEOUT_SECS: u64 = 10;

/// Time allowed for open connections to drain on shutdown, in seconds
pub const SHUTDOWN_GRACE_SECS: u64 = 30;

/// Capacity of the access log hand-off queue
pub const DEFAULT_ACCESS_LOG_QUEUE_CAPACITY: usize = 1024;

// =============================================================================
// Default Paths and Strings
// =============================================================================

/// Default configuration file path
pub const DEFAULT_CONFIG_PATH: &str = "config/gate.toml";

/// Directory holding one sub-directory per site, named after the host
pub const DEFAULT_SITES_DIR: &str = "sites";

/// Document root used when a host has no site directory
pub const DEFAULT_ROOT: &str = "client";

/// Persisted list of known domains, one per line
pub const DEFAULT_DOMAINS_FILE: &str = "domains.txt";

/// Access log destination
pub const DEFAULT_ACCESS_LOG_PATH: &str = "access.log";

/// Directory index file name
pub const INDEX_FILE: &str = "index.html";

/// Default log filter when RUST_LOG is not set
pub const DEFAULT_LOG_FILTER: &str = "gate=debug,tower_http=info";

/// Default log format (text or json)
pub const DEFAULT_LOG_FORMAT: &str = "text";

/// Environment variable carrying extra comma-separated domains
pub const DOMAINS_ENV: &str = "DOMAINS";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    /// HTTP server configuration
    #[serde(default)]
    pub http: HttpServerConfig,
    /// Site roots, domain list and fingerprint cache settings
    #[serde(default)]
    pub sites: SitesConfig,
    /// Access log configuration
    #[serde(default)]
    pub access_log: AccessLogConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct HttpServerConfig {
    #[serde(default = "HttpServerConfig::default_host")]
    pub host: String,
    #[serde(default = "HttpServerConfig::default_port")]
    pub port: u16,
    /// Development mode: plain HTTP and no Content-Security-Policy header
    #[serde(default)]
    pub dev_mode: bool,
    #[serde(default)]
    pub tls: TlsConfig,
}

impl Default for HttpServerConfig {
    fn default() -> Self {
        Self {
            host: Self::default_host(),
            port: Self::default_port(),
            dev_mode: false,
            tls: TlsConfig::default(),
        }
    }
}

impl HttpServerConfig {
    fn default_host() -> String {
        "0.0.0.0".to_string()
    }

    fn default_port() -> u16 {
        443
    }
}

/// How the listener obtains its certificates
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TlsMode {
    /// Per-domain certificates from Let's Encrypt for every registered domain
    #[default]
    Acme,
    /// Certificate and key read from PEM files
    Manual,
    /// Plain HTTP
    None,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TlsConfig {
    #[serde(default)]
    pub mode: TlsMode,
    pub cert_path: Option<String>,
    pub key_path: Option<String>,
    /// Contact address registered with the ACME account
    pub acme_email: Option<String>,
    #[serde(default = "TlsConfig::default_acme_cache_dir")]
    pub acme_cache_dir: String,
    /// Use the production directory instead of staging
    #[serde(default = "TlsConfig::default_true")]
    pub acme_production: bool,
    #[serde(default = "TlsConfig::default_true")]
    pub redirect_http: bool,
    #[serde(default = "TlsConfig::default_redirect_port")]
    pub redirect_port: u16,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            mode: TlsMode::default(),
            cert_path: None,
            key_path: None,
            acme_email: None,
            acme_cache_dir: Self::default_acme_cache_dir(),
            acme_production: true,
            redirect_http: true,
            redirect_port: Self::default_redirect_port(),
        }
    }
}

impl TlsConfig {
    fn default_acme_cache_dir() -> String {
        "certs".to_string()
    }

    fn default_true() -> bool {
        true
    }

    fn default_redirect_port() -> u16 {
        80
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SitesConfig {
    /// Parent directory of the per-host document roots
    #[serde(default = "SitesConfig::default_sites_dir")]
    pub sites_dir: PathBuf,
    /// Document root for hosts without their own directory
    #[serde(default = "SitesConfig::default_root")]
    pub default_root: PathBuf,
    /// Persisted domain list, created empty when missing
    #[serde(default = "SitesConfig::default_domains_file")]
    pub domains_file: PathBuf,
    /// Domains registered at startup in addition to the persisted list
    #[serde(default)]
    pub extra_domains: Vec<String>,
    #[serde(default = "SitesConfig::default_fingerprint_max_age")]
    pub fingerprint_max_age_seconds: u64,
    /// Number of striped recompute locks (1 = one lock for the whole cache)
    #[serde(default = "SitesConfig::default_recompute_lock_stripes")]
    pub recompute_lock_stripes: usize,
    #[serde(default = "SitesConfig::default_expires")]
    pub expires_seconds: u64,
    /// Domain used to build the Content-Security-Policy header
    pub csp_domain: Option<String>,
}

impl Default for SitesConfig {
    fn default() -> Self {
        Self {
            sites_dir: Self::default_sites_dir(),
            default_root: Self::default_root(),
            domains_file: Self::default_domains_file(),
            extra_domains: Vec::new(),
            fingerprint_max_age_seconds: Self::default_fingerprint_max_age(),
            recompute_lock_stripes: Self::default_recompute_lock_stripes(),
            expires_seconds: Self::default_expires(),
            csp_domain: None,
        }
    }
}

impl SitesConfig {
    fn default_sites_dir() -> PathBuf {
        PathBuf::from(DEFAULT_SITES_DIR)
    }
    fn default_root() -> PathBuf {
        PathBuf::from(DEFAULT_ROOT)
    }
    fn default_domains_file() -> PathBuf {
        PathBuf::from(DEFAULT_DOMAINS_FILE)
    }
    fn default_fingerprint_max_age() -> u64 {
        FINGERPRINT_MAX_AGE_SECS
    }
    fn default_recompute_lock_stripes() -> usize {
        DEFAULT_RECOMPUTE_LOCK_STRIPES
    }
    fn default_expires() -> u64 {
        DEFAULT_EXPIRES_SECS
    }
}

/// Access log configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AccessLogConfig {
    #[serde(default = "AccessLogConfig::default_path")]
    pub path: PathBuf,
    /// Also emit each access line through the application log
    #[serde(default)]
    pub console: bool,
    #[serde(default = "AccessLogConfig::default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for AccessLogConfig {
    fn default() -> Self {
        Self {
            path: Self::default_path(),
            console: false,
            queue_capacity: Self::default_queue_capacity(),
        }
    }
}

impl AccessLogConfig {
    fn default_path() -> PathBuf {
        PathBuf::from(DEFAULT_ACCESS_LOG_PATH)
    }

    fn default_queue_capacity() -> usize {
        DEFAULT_ACCESS_LOG_QUEUE_CAPACITY
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log format: "text" (human-readable, default) or "json" (structured)
    #[serde(default = "LoggingConfig::default_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: DEFAULT_LOG_FORMAT.to_string(),
        }
    }
}

impl LoggingConfig {
    fn default_format() -> String {
        DEFAULT_LOG_FORMAT.to_string()
    }
}

impl AppConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load the file if it exists, otherwise start from defaults.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Apply environment overrides. `var` looks up a variable by name.
    pub fn apply_env<F>(&mut self, var: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if var("DEV").as_deref() == Some("true") {
            self.http.dev_mode = true;
            self.http.tls.mode = TlsMode::None;
        }

        if let Some(listen) = var("LISTEN").filter(|v| !v.is_empty()) {
            let (host, port) = parse_listen(&listen)?;
            self.http.host = host;
            self.http.port = port;
        }

        if let Some(domain) = var("DOMAIN").filter(|v| !v.is_empty()) {
            self.sites.csp_domain = Some(domain);
        }

        if let Some(domains) = var(DOMAINS_ENV) {
            self.sites
                .extra_domains
                .extend(domains.split(',').map(|d| d.to_string()));
        }

        if var("CONSOLE_ACCESS").as_deref() == Some("true") {
            self.access_log.console = true;
        }

        self.validate()
    }

    /// Content-Security-Policy for the configured domain, unless in dev mode.
    pub fn content_security_policy(&self) -> Option<String> {
        if self.http.dev_mode {
            return None;
        }
        self.sites.csp_domain.as_ref().map(|domain| {
            format!(
                "default-src https://*.{domain}; form-action https://*.{domain}; \
                 block-all-mixed-content; upgrade-insecure-requests"
            )
        })
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.http.tls.mode == TlsMode::Manual
            && (self.http.tls.cert_path.is_none() || self.http.tls.key_path.is_none())
        {
            return Err(ConfigError::Validation(
                "tls.mode = \"manual\" requires cert_path and key_path".to_string(),
            ));
        }
        if self.sites.recompute_lock_stripes == 0 {
            return Err(ConfigError::Validation(
                "sites.recompute_lock_stripes must be at least 1".to_string(),
            ));
        }
        if self.access_log.queue_capacity == 0 {
            return Err(ConfigError::Validation(
                "access_log.queue_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Parse a `LISTEN` value such as `:https`, `0.0.0.0:8080` or `[::]:443`.
fn parse_listen(listen: &str) -> Result<(String, u16), ConfigError> {
    let invalid = || ConfigError::Validation(format!("Invalid LISTEN address: {}", listen));

    let (host, port) = listen.rsplit_once(':').ok_or_else(invalid)?;
    let port = match port {
        "https" => 443,
        "http" => 80,
        p => p.parse().map_err(|_| invalid())?,
    };
    let host = match host.trim_start_matches('[').trim_end_matches(']') {
        "" => HttpServerConfig::default_host(),
        h => h.to_string(),
    };
    Ok((host, port))
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Configuration error: {0}")]
    Validation(String),
}

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Environment override tracking
// ---------------------------------------------------------------------------

/// Tracks which configuration settings are overridden by environment variables.
#[derive(Debug, Clone, Default)]
pub struct EnvOverrides {
    overrides: HashMap<String, String>,
}

impl EnvOverrides {
    /// Check whether a setting key (e.g. "server.host") is overridden by an env var.
    pub fn is_overridden(&self, key: &str) -> bool {
        self.overrides.contains_key(key)
    }

    /// Get the env var name that overrides the given setting key.
    pub fn env_var_for(&self, key: &str) -> Option<&str> {
        self.overrides.get(key).map(String::as_str)
    }

    /// Get all overrides as a map of setting key -> env var name.
    pub fn all(&self) -> &HashMap<String, String> {
        &self.overrides
    }

    fn record(&mut self, key: &str, env_var: &str) {
        self.overrides.insert(key.to_string(), env_var.to_string());
    }
}

// ---------------------------------------------------------------------------
// Main configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Env var overrides are not serialized to TOML.
    #[serde(skip)]
    pub env_overrides: EnvOverrides,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_origins: Vec::new(),
        }
    }
}

/// Which deployment of the commerce platform to talk to.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    #[default]
    Sandbox,
    Production,
}

impl Environment {
    fn api_base(self) -> &'static str {
        match self {
            Self::Sandbox => "https://sandbox.dev.clover.com",
            Self::Production => "https://api.clover.com",
        }
    }

    fn authorize_base(self) -> &'static str {
        match self {
            Self::Sandbox => "https://sandbox.dev.clover.com",
            Self::Production => "https://www.clover.com",
        }
    }

    fn token_base(self) -> &'static str {
        match self {
            Self::Sandbox => "https://apisandbox.dev.clover.com",
            Self::Production => "https://api.clover.com",
        }
    }
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sandbox => write!(f, "sandbox"),
            Self::Production => write!(f, "production"),
        }
    }
}

impl FromStr for Environment {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sandbox" => Ok(Self::Sandbox),
            "production" | "prod" => Ok(Self::Production),
            _ => Err(format!("Unknown environment: {s}")),
        }
    }
}

/// Upstream commerce platform: OAuth client credentials and endpoints.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UpstreamConfig {
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    #[serde(default)]
    pub environment: Environment,
    /// Overrides the environment's business API base URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_base_url: Option<String>,
    /// Overrides the environment's authorize-redirect base URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authorize_base_url: Option<String>,
    /// Overrides the environment's token/refresh base URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_base_url: Option<String>,
    #[serde(default = "default_authorize_path")]
    pub authorize_path: String,
    #[serde(default = "default_token_path")]
    pub token_path: String,
    #[serde(default = "default_refresh_path")]
    pub refresh_path: String,
    #[serde(default = "default_api_version")]
    pub api_version: String,
    /// Externally visible base URL of this gateway.
    #[serde(default = "default_site_url")]
    pub site_url: String,
    #[serde(default = "default_callback_path")]
    pub callback_path: String,
    /// Account used when a request names none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_account: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: String::new(),
            environment: Environment::default(),
            api_base_url: None,
            authorize_base_url: None,
            token_base_url: None,
            authorize_path: default_authorize_path(),
            token_path: default_token_path(),
            refresh_path: default_refresh_path(),
            api_version: default_api_version(),
            site_url: default_site_url(),
            callback_path: default_callback_path(),
            default_account: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl UpstreamConfig {
    pub fn api_base(&self) -> &str {
        trim_base(self.api_base_url.as_deref().unwrap_or(self.environment.api_base()))
    }

    pub fn authorize_url(&self) -> String {
        let base = self
            .authorize_base_url
            .as_deref()
            .unwrap_or(self.environment.authorize_base());
        format!("{}{}", trim_base(base), self.authorize_path)
    }

    pub fn token_url(&self) -> String {
        format!("{}{}", self.token_base(), self.token_path)
    }

    pub fn refresh_url(&self) -> String {
        format!("{}{}", self.token_base(), self.refresh_path)
    }

    /// Where the upstream sends the user back after authorizing.
    pub fn redirect_uri(&self) -> String {
        format!("{}{}", trim_base(&self.site_url), self.callback_path)
    }

    /// Business API URL for `path` under the given merchant account.
    pub fn merchant_url(&self, account_id: &str, path: &str) -> String {
        let path = path.trim_start_matches('/');
        let url = format!(
            "{}/{}/merchants/{}/{}",
            self.api_base(),
            self.api_version,
            account_id,
            path
        );
        url.trim_end_matches('/').to_string()
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    fn token_base(&self) -> &str {
        trim_base(
            self.token_base_url
                .as_deref()
                .unwrap_or(self.environment.token_base()),
        )
    }
}

fn trim_base(base: &str) -> &str {
    base.trim_end_matches('/')
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    #[default]
    File,
    Sqlite,
    Memory,
}

impl std::fmt::Display for StorageBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::File => write!(f, "file"),
            Self::Sqlite => write!(f, "sqlite"),
            Self::Memory => write!(f, "memory"),
        }
    }
}

impl FromStr for StorageBackend {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "file" => Ok(Self::File),
            "sqlite" => Ok(Self::Sqlite),
            "memory" => Ok(Self::Memory),
            _ => Err(format!("Unknown storage backend: {s}")),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,
    #[serde(default = "default_storage_path")]
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            path: default_storage_path(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Default value functions
// ---------------------------------------------------------------------------

const fn default_port() -> u16 {
    8080
}
fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_authorize_path() -> String {
    "/oauth/v2/authorize".to_string()
}
fn default_token_path() -> String {
    "/oauth/v2/token".to_string()
}
fn default_refresh_path() -> String {
    "/oauth/v2/refresh".to_string()
}
fn default_api_version() -> String {
    "v3".to_string()
}
fn default_site_url() -> String {
    "http://localhost:8080".to_string()
}
fn default_callback_path() -> String {
    "/oauth/callback".to_string()
}
const fn default_timeout_secs() -> u64 {
    30
}
fn default_storage_path() -> PathBuf {
    PathBuf::from("tokens.json")
}
fn default_log_level() -> String {
    "info".to_string()
}

// ---------------------------------------------------------------------------
// Config loading and env overrides
// ---------------------------------------------------------------------------

impl Config {
    /// Load configuration from a TOML file, then apply environment variable
    /// overrides. Any setting prefixed with `TOLLGATE_` takes precedence over
    /// the file value and is tracked in `env_overrides`.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Config = toml::from_str(&content)?;
            config
        } else {
            tracing::warn!("Config file not found at {}, using defaults", path.display());
            Self::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// Apply environment variable overrides to the configuration.
    fn apply_env_overrides(&mut self) {
        let mut ov = EnvOverrides::default();

        macro_rules! env_str {
            ($key:expr, $env:expr, $field:expr) => {
                if let Ok(val) = std::env::var($env) {
                    $field = val;
                    ov.record($key, $env);
                }
            };
        }
        macro_rules! env_bool {
            ($key:expr, $env:expr, $field:expr) => {
                if let Ok(val) = std::env::var($env) {
                    $field = matches!(val.to_lowercase().as_str(), "1" | "true" | "yes" | "on");
                    ov.record($key, $env);
                }
            };
        }
        macro_rules! env_parse {
            ($key:expr, $env:expr, $field:expr) => {
                if let Ok(val) = std::env::var($env) {
                    if let Ok(parsed) = val.parse() {
                        $field = parsed;
                        ov.record($key, $env);
                    }
                }
            };
        }
        macro_rules! env_opt_str {
            ($key:expr, $env:expr, $field:expr) => {
                if let Ok(val) = std::env::var($env) {
                    $field = if val.is_empty() { None } else { Some(val) };
                    ov.record($key, $env);
                }
            };
        }

        // -- Server --
        env_str!("server.host", "TOLLGATE_SERVER_HOST", self.server.host);
        env_parse!("server.port", "TOLLGATE_SERVER_PORT", self.server.port);
        if let Ok(val) = std::env::var("TOLLGATE_SERVER_CORS_ORIGINS") {
            self.server.cors_origins = val
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            ov.record("server.cors_origins", "TOLLGATE_SERVER_CORS_ORIGINS");
        }

        // -- Upstream --
        env_str!("upstream.client_id", "TOLLGATE_CLIENT_ID", self.upstream.client_id);
        env_str!(
            "upstream.client_secret",
            "TOLLGATE_CLIENT_SECRET",
            self.upstream.client_secret
        );
        env_parse!(
            "upstream.environment",
            "TOLLGATE_ENVIRONMENT",
            self.upstream.environment
        );
        env_opt_str!(
            "upstream.api_base_url",
            "TOLLGATE_API_BASE_URL",
            self.upstream.api_base_url
        );
        env_opt_str!(
            "upstream.authorize_base_url",
            "TOLLGATE_AUTHORIZE_BASE_URL",
            self.upstream.authorize_base_url
        );
        env_opt_str!(
            "upstream.token_base_url",
            "TOLLGATE_TOKEN_BASE_URL",
            self.upstream.token_base_url
        );
        env_str!(
            "upstream.authorize_path",
            "TOLLGATE_AUTHORIZE_PATH",
            self.upstream.authorize_path
        );
        env_str!("upstream.token_path", "TOLLGATE_TOKEN_PATH", self.upstream.token_path);
        env_str!(
            "upstream.refresh_path",
            "TOLLGATE_REFRESH_PATH",
            self.upstream.refresh_path
        );
        env_str!("upstream.api_version", "TOLLGATE_API_VERSION", self.upstream.api_version);
        env_str!("upstream.site_url", "TOLLGATE_SITE_URL", self.upstream.site_url);
        env_str!(
            "upstream.callback_path",
            "TOLLGATE_CALLBACK_PATH",
            self.upstream.callback_path
        );
        env_opt_str!(
            "upstream.default_account",
            "TOLLGATE_DEFAULT_ACCOUNT",
            self.upstream.default_account
        );
        env_parse!(
            "upstream.timeout_secs",
            "TOLLGATE_UPSTREAM_TIMEOUT",
            self.upstream.timeout_secs
        );

        // -- Storage --
        env_parse!("storage.backend", "TOLLGATE_STORAGE_BACKEND", self.storage.backend);
        if let Ok(val) = std::env::var("TOLLGATE_STORAGE_PATH") {
            self.storage.path = PathBuf::from(val);
            ov.record("storage.path", "TOLLGATE_STORAGE_PATH");
        }

        // -- Logging --
        env_str!("logging.level", "TOLLGATE_LOG_LEVEL", self.logging.level);
        env_bool!("logging.json", "TOLLGATE_LOG_JSON", self.logging.json);

        self.env_overrides = ov;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! Configuration types and loading
//!
//! Config precedence: env vars > config file > defaults.
//! The client secret and seed tokens come from the environment (or
//! `client_secret_file`) and are never read from the TOML itself.

use common::Secret;
use crm_auth::{DEFAULT_SERVICE_ID, DEFAULT_TOKEN_URL, OAuthClient, SeedCredential};
use crm_fetch::{DEFAULT_AUTH_SCHEME, FetchPolicy};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Root configuration
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub zoho: ZohoConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

/// OAuth client and API endpoint settings
#[derive(Debug, Deserialize)]
pub struct ZohoConfig {
    #[serde(default)]
    pub client_id: String,
    #[serde(skip)]
    pub client_secret: Option<Secret<String>>,
    /// Path to a file containing the client secret (alternative to ZOHO_CLIENT_SECRET)
    #[serde(default)]
    pub client_secret_file: Option<PathBuf>,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_token_url")]
    pub token_url: String,
    /// Key of the credential row in the store
    #[serde(default = "default_service_id")]
    pub service_id: String,
    #[serde(default = "default_auth_scheme")]
    pub auth_scheme: String,
    /// Fallback tokens used when the store has no row (ZOHO_ACCESS_TOKEN / ZOHO_REFRESH_TOKEN)
    #[serde(skip)]
    pub seed_access_token: Option<Secret<String>>,
    #[serde(skip)]
    pub seed_refresh_token: Option<Secret<String>>,
}

impl Default for ZohoConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: None,
            client_secret_file: None,
            base_url: default_base_url(),
            token_url: default_token_url(),
            service_id: default_service_id(),
            auth_scheme: default_auth_scheme(),
            seed_access_token: None,
            seed_refresh_token: None,
        }
    }
}

/// Pagination, retry and module selection
#[derive(Debug, Deserialize)]
pub struct FetchConfig {
    #[serde(default = "default_records_per_page")]
    pub records_per_page: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Pause between pages, in seconds
    #[serde(default = "default_rate_limit_delay")]
    pub rate_limit_delay_secs: f64,
    #[serde(default = "default_transport_retry_delay")]
    pub transport_retry_delay_secs: u64,
    /// Wait after a 429 without a usable Retry-After header
    #[serde(default = "default_retry_after")]
    pub default_retry_after_secs: u64,
    /// Longest rate-limit wait honored, in seconds
    #[serde(default = "default_max_retry_after")]
    pub max_retry_after_secs: u64,
    #[serde(default = "default_modules")]
    pub modules: Vec<String>,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            records_per_page: default_records_per_page(),
            max_retries: default_max_retries(),
            request_timeout_secs: default_request_timeout(),
            rate_limit_delay_secs: default_rate_limit_delay(),
            transport_retry_delay_secs: default_transport_retry_delay(),
            default_retry_after_secs: default_retry_after(),
            max_retry_after_secs: default_max_retry_after(),
            modules: default_modules(),
        }
    }
}

/// Credential store location
#[derive(Debug, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_credentials_path")]
    pub credentials_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            credentials_path: default_credentials_path(),
        }
    }
}

/// Export destination
#[derive(Debug, Deserialize)]
pub struct OutputConfig {
    #[serde(default = "default_output_dir")]
    pub dir: PathBuf,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: default_output_dir(),
        }
    }
}

fn default_base_url() -> String {
    "https://www.zohoapis.in/bigin/v2".into()
}

fn default_token_url() -> String {
    DEFAULT_TOKEN_URL.into()
}

fn default_service_id() -> String {
    DEFAULT_SERVICE_ID.into()
}

fn default_auth_scheme() -> String {
    DEFAULT_AUTH_SCHEME.into()
}

fn default_records_per_page() -> u32 {
    200
}

fn default_max_retries() -> u32 {
    3
}

fn default_request_timeout() -> u64 {
    30
}

fn default_rate_limit_delay() -> f64 {
    0.5
}

fn default_transport_retry_delay() -> u64 {
    2
}

fn default_retry_after() -> u64 {
    60
}

fn default_max_retry_after() -> u64 {
    300
}

fn default_modules() -> Vec<String> {
    [
        "Contacts",
        "Accounts",
        "Pipelines",
        "Calls",
        "Events",
        "Tasks",
        "Notes",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_credentials_path() -> PathBuf {
    PathBuf::from("bigin-credentials.json")
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("output")
}

impl Config {
    /// Load configuration from a TOML file, overlay environment variables,
    /// then validate.
    ///
    /// Client secret resolution order:
    /// 1. ZOHO_CLIENT_SECRET env var
    /// 2. client_secret_file path from config
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        config.apply_env()?;
        config.validate()?;

        if let Ok(secret) = std::env::var("ZOHO_CLIENT_SECRET") {
            config.zoho.client_secret = Some(Secret::new(secret));
        } else if let Some(ref secret_file) = config.zoho.client_secret_file {
            config.zoho.client_secret = Secret::from_file(secret_file).map_err(|e| {
                common::Error::Config(format!(
                    "failed to read client_secret_file {}: {e}",
                    secret_file.display()
                ))
            })?;
        }

        config.zoho.seed_access_token = env_secret("ZOHO_ACCESS_TOKEN");
        config.zoho.seed_refresh_token = env_secret("ZOHO_REFRESH_TOKEN");

        Ok(config)
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("bigin-sync.toml")
    }

    fn apply_env(&mut self) -> common::Result<()> {
        if let Ok(v) = std::env::var("ZOHO_CLIENT_ID") {
            self.zoho.client_id = v;
        }
        if let Ok(v) = std::env::var("ZOHO_BASE_URL") {
            self.zoho.base_url = v;
        }
        if let Ok(v) = std::env::var("ZOHO_TOKEN_URL") {
            self.zoho.token_url = v;
        }
        if let Some(v) = env_parse("ZOHO_RECORDS_PER_PAGE")? {
            self.fetch.records_per_page = v;
        }
        if let Some(v) = env_parse("ZOHO_MAX_RETRIES")? {
            self.fetch.max_retries = v;
        }
        if let Some(v) = env_parse("ZOHO_REQUEST_TIMEOUT")? {
            self.fetch.request_timeout_secs = v;
        }
        if let Some(v) = env_parse("ZOHO_RATE_LIMIT_DELAY")? {
            self.fetch.rate_limit_delay_secs = v;
        }
        Ok(())
    }

    fn validate(&self) -> common::Result<()> {
        for (name, url) in [
            ("base_url", &self.zoho.base_url),
            ("token_url", &self.zoho.token_url),
        ] {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(common::Error::Config(format!(
                    "{name} must start with http:// or https://, got: {url}"
                )));
            }
        }

        if self.fetch.records_per_page == 0 {
            return Err(common::Error::Config(
                "records_per_page must be greater than 0".into(),
            ));
        }

        if self.fetch.max_retries == 0 {
            return Err(common::Error::Config(
                "max_retries must be greater than 0".into(),
            ));
        }

        if self.fetch.request_timeout_secs == 0 {
            return Err(common::Error::Config(
                "request_timeout_secs must be greater than 0".into(),
            ));
        }

        if Duration::try_from_secs_f64(self.fetch.rate_limit_delay_secs).is_err() {
            return Err(common::Error::Config(format!(
                "rate_limit_delay_secs must be a non-negative number of seconds, got: {}",
                self.fetch.rate_limit_delay_secs
            )));
        }

        if self.fetch.modules.iter().all(|m| m.trim().is_empty()) {
            return Err(common::Error::Config(
                "modules must name at least one module".into(),
            ));
        }

        Ok(())
    }

    /// Retry and pacing policy for the fetcher.
    pub fn fetch_policy(&self) -> FetchPolicy {
        FetchPolicy {
            per_page: self.fetch.records_per_page,
            max_retries: self.fetch.max_retries,
            inter_page_delay: Duration::try_from_secs_f64(self.fetch.rate_limit_delay_secs)
                .unwrap_or_default(),
            transport_retry_delay: Duration::from_secs(self.fetch.transport_retry_delay_secs),
            default_retry_after: Duration::from_secs(self.fetch.default_retry_after_secs),
            max_retry_after: Duration::from_secs(self.fetch.max_retry_after_secs),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch.request_timeout_secs)
    }

    /// OAuth client for the token exchange. A missing secret becomes an
    /// empty one, which the token endpoint rejects on first refresh.
    pub fn oauth_client(&self) -> OAuthClient {
        OAuthClient {
            client_id: self.zoho.client_id.clone(),
            client_secret: self
                .zoho
                .client_secret
                .clone()
                .unwrap_or_else(|| Secret::new(String::new())),
        }
    }

    /// Fallback tokens for a store without a row for `service_id`.
    pub fn seed(&self) -> SeedCredential {
        SeedCredential {
            access_token: self.zoho.seed_access_token.as_ref().map(|s| s.expose().clone()),
            refresh_token: self.zoho.seed_refresh_token.as_ref().map(|s| s.expose().clone()),
        }
    }
}

fn env_parse<T: FromStr>(key: &str) -> common::Result<Option<T>> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| common::Error::Config(format!("{key} must be a number, got: {raw}"))),
        Err(_) => Ok(None),
    }
}

fn env_secret(key: &str) -> Option<Secret<String>> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_owned())
        .filter(|v| !v.is_empty())
        .map(Secret::new)
}

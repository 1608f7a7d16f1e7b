//! Configuration for the synchronization engine.
//!
//! Values come from built-in defaults, then an optional TOML file, then
//! environment variables. The CLI applies its flags last and calls
//! [`Config::validate`] before anything talks to the store.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::coordinator::EngineOptions;
use crate::lease;
use crate::planner::SyncMode;
use crate::retry::RetryPolicy;

/// Upper bound for `engine.concurrency`.
pub const MAX_CONCURRENCY: usize = 256;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid {field}: {message}")]
    Invalid { field: &'static str, message: String },
}

impl ConfigError {
    fn invalid(field: &'static str, message: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            message: message.into(),
        }
    }
}

/// Remote store connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Base URL of the tagging endpoint, e.g. `https://iam-tags.internal`.
    pub endpoint: String,
    /// Region the account lives in. Required.
    pub region: Option<String>,
    pub request_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    /// Use the combined set+remove call when the endpoint supports it.
    pub batched_updates: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            region: None,
            request_timeout_ms: 30_000,
            connect_timeout_ms: 10_000,
            batched_updates: false,
        }
    }
}

impl StoreConfig {
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Parse and check the endpoint URL.
    ///
    /// # Errors
    /// Returns `ConfigError::Invalid` unless the endpoint is an absolute
    /// http(s) URL with a host and no query or fragment.
    pub fn endpoint_url(&self) -> Result<Url, ConfigError> {
        if self.endpoint.trim().is_empty() {
            return Err(ConfigError::invalid("store.endpoint", "must be set"));
        }
        let url = Url::parse(self.endpoint.trim())
            .map_err(|e| ConfigError::invalid("store.endpoint", e.to_string()))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ConfigError::invalid(
                "store.endpoint",
                format!("unsupported scheme '{}'", url.scheme()),
            ));
        }
        if url.host_str().is_none_or(str::is_empty) {
            return Err(ConfigError::invalid("store.endpoint", "missing host"));
        }
        if url.query().is_some() || url.fragment().is_some() {
            return Err(ConfigError::invalid(
                "store.endpoint",
                "must not carry a query or fragment",
            ));
        }
        Ok(url)
    }
}

/// Engine behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub concurrency: usize,
    pub mode: SyncMode,
    pub dry_run: bool,
    /// Restrict runs to these policy names. Empty means every policy.
    pub target_policies: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            concurrency: 8,
            mode: SyncMode::Authoritative,
            dry_run: false,
            target_policies: Vec::new(),
        }
    }
}

/// Retry tuning, mirrored into [`RetryPolicy`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub max_retries: u32,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            base_backoff_ms: policy.base_backoff_ms,
            max_backoff_ms: policy.max_backoff_ms,
            max_retries: policy.max_retries,
            jitter: policy.jitter_enabled,
        }
    }
}

/// Single-run lease settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseConfig {
    pub enabled: bool,
    pub key: String,
    pub dir: PathBuf,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            key: "tagsync".to_string(),
            dir: std::env::temp_dir(),
        }
    }
}

/// Full engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub store: StoreConfig,
    pub engine: EngineConfig,
    pub retry: RetryConfig,
    pub lease: LeaseConfig,
}

impl Config {
    /// Parse a TOML document. Missing sections and keys take defaults.
    ///
    /// # Errors
    /// Returns `ConfigError::Parse` on malformed TOML or unknown value types.
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(input)?)
    }

    /// Read and parse a TOML file.
    ///
    /// # Errors
    /// Returns `ConfigError::Read` if the file cannot be read.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    /// Overlay environment variables, looked up through `lookup`.
    ///
    /// # Errors
    /// Returns `ConfigError::Invalid` when a variable is set but unparseable.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(endpoint) = get("TAGSYNC_ENDPOINT") {
            self.store.endpoint = endpoint;
        }
        if let Some(region) = get("TAGSYNC_REGION").or_else(|| get("AWS_REGION")) {
            self.store.region = Some(region);
        }
        if let Some(raw) = get("TAGSYNC_CONCURRENCY") {
            self.engine.concurrency = raw.trim().parse().map_err(|_| {
                ConfigError::invalid("TAGSYNC_CONCURRENCY", format!("not a number: '{raw}'"))
            })?;
        }
        if let Some(raw) = get("TAGSYNC_DRY_RUN") {
            self.engine.dry_run = parse_bool(&raw).ok_or_else(|| {
                ConfigError::invalid("TAGSYNC_DRY_RUN", format!("not a boolean: '{raw}'"))
            })?;
        }
        if let Some(raw) = get("TAGSYNC_MODE") {
            self.engine.mode = raw
                .parse()
                .map_err(|e: String| ConfigError::invalid("TAGSYNC_MODE", e))?;
        }
        Ok(())
    }

    /// Overlay the process environment.
    ///
    /// # Errors
    /// See [`Config::apply_env`].
    pub fn apply_process_env(&mut self) -> Result<(), ConfigError> {
        self.apply_env(|name| std::env::var(name).ok())
    }

    /// Check the configuration before a run.
    ///
    /// # Errors
    /// Returns the first `ConfigError::Invalid` found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.store.endpoint_url()?;

        if self.region().is_none() {
            return Err(ConfigError::invalid(
                "store.region",
                "must be set (or TAGSYNC_REGION / AWS_REGION)",
            ));
        }

        if self.store.connect_timeout_ms == 0 || self.store.connect_timeout_ms > 300_000 {
            return Err(ConfigError::invalid(
                "store.connect_timeout_ms",
                "must be between 1 and 300000",
            ));
        }
        if self.store.request_timeout_ms == 0 || self.store.request_timeout_ms > 600_000 {
            return Err(ConfigError::invalid(
                "store.request_timeout_ms",
                "must be between 1 and 600000",
            ));
        }

        if !(1..=MAX_CONCURRENCY).contains(&self.engine.concurrency) {
            return Err(ConfigError::invalid(
                "engine.concurrency",
                format!("must be between 1 and {MAX_CONCURRENCY}"),
            ));
        }

        if self.retry.base_backoff_ms == 0 {
            return Err(ConfigError::invalid("retry.base_backoff_ms", "must be positive"));
        }
        if self.retry.max_backoff_ms < self.retry.base_backoff_ms {
            return Err(ConfigError::invalid(
                "retry.max_backoff_ms",
                "must not be below retry.base_backoff_ms",
            ));
        }
        if self.retry.max_retries > 20 {
            return Err(ConfigError::invalid("retry.max_retries", "must be at most 20"));
        }

        if self.lease.enabled && !lease::is_valid_key(&self.lease.key) {
            return Err(ConfigError::invalid(
                "lease.key",
                "use letters, digits, '-', '_' or '.'",
            ));
        }

        Ok(())
    }

    /// Trimmed region, if any.
    #[must_use]
    pub fn region(&self) -> Option<&str> {
        self.store
            .region
            .as_deref()
            .map(str::trim)
            .filter(|r| !r.is_empty())
    }

    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new()
            .with_base_backoff_ms(self.retry.base_backoff_ms)
            .with_max_backoff_ms(self.retry.max_backoff_ms)
            .with_max_retries(self.retry.max_retries)
            .with_jitter_enabled(self.retry.jitter)
    }

    #[must_use]
    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            concurrency: self.engine.concurrency,
            mode: self.engine.mode,
            dry_run: self.engine.dry_run,
            targets: self
                .engine
                .target_policies
                .iter()
                .map(|name| name.trim().to_string())
                .filter(|name| !name.is_empty())
                .collect::<BTreeSet<_>>(),
        }
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

//! Run settings: an optional TOML file, overridden by environment variables.
//!
//! Every setting has a default, so a bare environment with only
//! `PROM_API_TOKEN` is a valid configuration. Environment variables win over
//! the file; the binary applies CLI flags on top of the resolved [`Settings`].
use reqwest::header::HeaderName;
use secrecy::SecretString;
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::util::validate_secure_url;

pub const DEFAULT_VENDOR_PREFIX: &str = "SHOP";
pub const DEFAULT_HTTP_TIMEOUT_SECONDS: u64 = 120;
pub const DEFAULT_MAX_CONCURRENT_REQUESTS: usize = 8;
pub const DEFAULT_BASE_URL: &str = "https://my.prom.ua";
pub const DEFAULT_UPDATE_ENDPOINT: &str = "/api/v1/products/edit_by_external_id";
pub const DEFAULT_AUTH_HEADER: &str = "Authorization";
pub const DEFAULT_AUTH_SCHEME: &str = "Bearer";
pub const DEFAULT_BATCH_SIZE: usize = 500;
pub const DEFAULT_FEEDS_FILE: &str = "feeds.txt";
pub const DEFAULT_STATE_FILE: &str = ".state/feeds_state.json";

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Config file too large: {0}")]
    TooLarge(String),

    #[error("Invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("PROM_API_TOKEN is not set")]
    MissingToken,
}

impl ConfigError {
    fn invalid(key: &'static str, value: impl Into<String>, reason: impl fmt::Display) -> Self {
        ConfigError::Invalid {
            key,
            value: value.into(),
            reason: reason.to_string(),
        }
    }
}

// ============================================================================
// Update Mode
// ============================================================================

/// Which product fields a run is allowed to touch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(try_from = "String")]
pub enum UpdateMode {
    /// Price, stock quantity and presence.
    #[default]
    Both,
    /// Price only.
    Prices,
    /// Stock quantity and presence only.
    Stocks,
}

impl UpdateMode {
    pub fn includes_price(self) -> bool {
        matches!(self, UpdateMode::Both | UpdateMode::Prices)
    }

    pub fn includes_stock(self) -> bool {
        matches!(self, UpdateMode::Both | UpdateMode::Stocks)
    }
}

impl FromStr for UpdateMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "both" => Ok(UpdateMode::Both),
            "prices" | "price" => Ok(UpdateMode::Prices),
            "stocks" | "stock" => Ok(UpdateMode::Stocks),
            other => Err(format!(
                "unknown update mode '{}' (expected both, prices or stocks)",
                other
            )),
        }
    }
}

impl TryFrom<String> for UpdateMode {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Display for UpdateMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            UpdateMode::Both => "both",
            UpdateMode::Prices => "prices",
            UpdateMode::Stocks => "stocks",
        })
    }
}

// ============================================================================
// Config File
// ============================================================================

/// Contents of the optional TOML config file.
///
/// Keys are the lowercase forms of the environment variables. Every key is
/// optional; anything left out falls through to the environment and then to
/// the built-in default.
///
/// Custom Debug impl masks `prom_api_token`.
#[derive(Clone, Default, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub prom_api_token: Option<String>,
    pub vendor_prefix: Option<String>,
    pub http_timeout_seconds: Option<u64>,
    pub max_concurrent_requests: Option<usize>,
    pub update_mode: Option<UpdateMode>,
    pub prom_base_url: Option<String>,
    pub prom_update_endpoint: Option<String>,
    pub prom_auth_header: Option<String>,
    pub prom_auth_scheme: Option<String>,
    pub dry_run: Option<bool>,
    pub batch_size: Option<usize>,
    pub feeds_file: Option<PathBuf>,
    pub state_file: Option<PathBuf>,
}

impl fmt::Debug for FileConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileConfig")
            .field(
                "prom_api_token",
                &self.prom_api_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("vendor_prefix", &self.vendor_prefix)
            .field("http_timeout_seconds", &self.http_timeout_seconds)
            .field("max_concurrent_requests", &self.max_concurrent_requests)
            .field("update_mode", &self.update_mode)
            .field("prom_base_url", &self.prom_base_url)
            .field("prom_update_endpoint", &self.prom_update_endpoint)
            .field("prom_auth_header", &self.prom_auth_header)
            .field("prom_auth_scheme", &self.prom_auth_scheme)
            .field("dry_run", &self.dry_run)
            .field("batch_size", &self.batch_size)
            .field("feeds_file", &self.feeds_file)
            .field("state_file", &self.state_file)
            .finish()
    }
}

impl FileConfig {
    /// Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    const KNOWN_KEYS: [&'static str; 13] = [
        "prom_api_token",
        "vendor_prefix",
        "http_timeout_seconds",
        "max_concurrent_requests",
        "update_mode",
        "prom_base_url",
        "prom_update_endpoint",
        "prom_auth_header",
        "prom_auth_scheme",
        "dry_run",
        "batch_size",
        "feeds_file",
        "state_file",
    ];

    /// Load a config file that the operator asked for explicitly.
    ///
    /// - Missing or unreadable file → `Err(ConfigError::Io)`
    /// - Empty file → `Ok(FileConfig::default())`
    /// - Invalid TOML → `Err(ConfigError::Parse)`
    /// - Unknown keys → accepted, logged as warning
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let meta = std::fs::metadata(path)?;
        if meta.len() > Self::MAX_FILE_SIZE {
            return Err(ConfigError::TooLarge(format!(
                "Config file is {} bytes (max {} bytes)",
                meta.len(),
                Self::MAX_FILE_SIZE
            )));
        }

        let content = std::fs::read_to_string(path)?;
        if content.trim().is_empty() {
            tracing::debug!(path = %path.display(), "Config file is empty, using defaults");
            return Ok(Self::default());
        }

        // Parse as a raw table first to surface likely typos
        if let Ok(raw) = content.parse::<toml::Table>() {
            for key in raw.keys() {
                if !Self::KNOWN_KEYS.contains(&key.as_str()) {
                    tracing::warn!(key = %key, "Unknown key in config file, ignoring");
                }
            }
        }

        let config: FileConfig = toml::from_str(&content)?;
        tracing::info!(path = %path.display(), "Loaded configuration file");
        Ok(config)
    }
}

// ============================================================================
// Resolved Settings
// ============================================================================

/// Fully resolved and validated settings for one run.
#[derive(Debug)]
pub struct Settings {
    /// Absent is only acceptable for dry runs; see [`Settings::token`].
    pub prom_api_token: Option<SecretString>,
    pub vendor_prefix: String,
    pub http_timeout: Duration,
    pub max_concurrent_requests: usize,
    pub update_mode: UpdateMode,
    pub prom_base_url: Url,
    /// `prom_base_url` + `prom_update_endpoint`.
    pub update_url: Url,
    pub prom_auth_header: HeaderName,
    /// Empty means the token is sent bare.
    pub prom_auth_scheme: String,
    pub dry_run: bool,
    pub batch_size: usize,
    pub feeds_file: PathBuf,
    /// `None` disables change detection.
    pub state_file: Option<PathBuf>,
}

impl Settings {
    /// Resolve settings from an optional config file and the process environment.
    pub fn load(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let file = match config_path {
            Some(path) => FileConfig::load(path)?,
            None => FileConfig::default(),
        };
        Self::resolve(file, |key| std::env::var(key).ok())
    }

    /// Resolve settings from a file config and an environment lookup.
    ///
    /// The lookup is injected so tests never mutate the process environment.
    pub fn resolve<F>(file: FileConfig, env: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        // Empty variables count as unset, except where emptiness means something
        let env_set = |key: &str| env(key).filter(|v| !v.trim().is_empty());

        let prom_api_token = env_set("PROM_API_TOKEN")
            .or(file.prom_api_token)
            .filter(|t| !t.trim().is_empty())
            .map(|t| SecretString::from(t.trim().to_string()));

        let vendor_prefix = env_set("VENDOR_PREFIX")
            .or(file.vendor_prefix)
            .unwrap_or_else(|| DEFAULT_VENDOR_PREFIX.to_string())
            .trim()
            .to_string();
        if vendor_prefix.is_empty() {
            return Err(ConfigError::invalid(
                "VENDOR_PREFIX",
                vendor_prefix,
                "must not be empty",
            ));
        }

        let http_timeout_seconds = match env_set("HTTP_TIMEOUT_SECONDS") {
            Some(raw) => parse_number("HTTP_TIMEOUT_SECONDS", &raw)?,
            None => file
                .http_timeout_seconds
                .unwrap_or(DEFAULT_HTTP_TIMEOUT_SECONDS),
        };
        ensure_positive("HTTP_TIMEOUT_SECONDS", http_timeout_seconds)?;

        let max_concurrent_requests = match env_set("MAX_CONCURRENT_REQUESTS") {
            Some(raw) => parse_number("MAX_CONCURRENT_REQUESTS", &raw)?,
            None => file
                .max_concurrent_requests
                .unwrap_or(DEFAULT_MAX_CONCURRENT_REQUESTS),
        };
        ensure_positive("MAX_CONCURRENT_REQUESTS", max_concurrent_requests as u64)?;

        let update_mode = match env_set("UPDATE_MODE") {
            Some(raw) => raw
                .parse()
                .map_err(|e: String| ConfigError::invalid("UPDATE_MODE", raw.as_str(), e))?,
            None => file.update_mode.unwrap_or_default(),
        };

        let base_raw = env_set("PROM_BASE_URL")
            .or(file.prom_base_url)
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let prom_base_url = validate_secure_url(&base_raw)
            .map_err(|e| ConfigError::invalid("PROM_BASE_URL", base_raw.as_str(), e))?;

        let endpoint = env_set("PROM_UPDATE_ENDPOINT")
            .or(file.prom_update_endpoint)
            .unwrap_or_else(|| DEFAULT_UPDATE_ENDPOINT.to_string());
        let update_url = join_endpoint(&prom_base_url, &endpoint)
            .map_err(|e| ConfigError::invalid("PROM_UPDATE_ENDPOINT", endpoint.as_str(), e))?;

        let header_raw = env_set("PROM_AUTH_HEADER")
            .or(file.prom_auth_header)
            .unwrap_or_else(|| DEFAULT_AUTH_HEADER.to_string());
        let prom_auth_header = HeaderName::from_bytes(header_raw.trim().as_bytes())
            .map_err(|e| ConfigError::invalid("PROM_AUTH_HEADER", header_raw.as_str(), e))?;

        // An explicitly empty scheme means "send the bare token"
        let prom_auth_scheme = env("PROM_AUTH_SCHEME")
            .or(file.prom_auth_scheme)
            .unwrap_or_else(|| DEFAULT_AUTH_SCHEME.to_string())
            .trim()
            .to_string();

        let dry_run = match env_set("DRY_RUN") {
            Some(raw) => parse_bool("DRY_RUN", &raw)?,
            None => file.dry_run.unwrap_or(false),
        };

        let batch_size = match env_set("BATCH_SIZE") {
            Some(raw) => parse_number("BATCH_SIZE", &raw)?,
            None => file.batch_size.unwrap_or(DEFAULT_BATCH_SIZE),
        };
        ensure_positive("BATCH_SIZE", batch_size as u64)?;

        let feeds_file = env_set("FEEDS_FILE")
            .map(PathBuf::from)
            .or(file.feeds_file)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_FEEDS_FILE));

        // An explicitly empty STATE_FILE disables change detection
        let state_file = match env("STATE_FILE") {
            Some(raw) => Some(PathBuf::from(raw.trim())),
            None => file
                .state_file
                .or_else(|| Some(PathBuf::from(DEFAULT_STATE_FILE))),
        }
        .filter(|p| !p.as_os_str().is_empty());

        Ok(Settings {
            prom_api_token,
            vendor_prefix,
            http_timeout: Duration::from_secs(http_timeout_seconds),
            max_concurrent_requests,
            update_mode,
            prom_base_url,
            update_url,
            prom_auth_header,
            prom_auth_scheme,
            dry_run,
            batch_size,
            feeds_file,
            state_file,
        })
    }

    /// The API token, required for anything that writes to Prom.
    pub fn token(&self) -> Result<&SecretString, ConfigError> {
        self.prom_api_token.as_ref().ok_or(ConfigError::MissingToken)
    }

    /// Log the effective settings (token excluded).
    pub fn trace_loaded(&self) {
        tracing::info!(
            vendor_prefix = %self.vendor_prefix,
            update_mode = %self.update_mode,
            update_url = %self.update_url,
            timeout_secs = self.http_timeout.as_secs(),
            max_concurrent = self.max_concurrent_requests,
            batch_size = self.batch_size,
            dry_run = self.dry_run,
            token_set = self.prom_api_token.is_some(),
            "Loaded settings"
        );
    }
}

fn join_endpoint(base: &Url, endpoint: &str) -> Result<Url, url::ParseError> {
    let endpoint = endpoint.trim();
    let base = base.as_str().trim_end_matches('/');
    if endpoint.starts_with('/') {
        Url::parse(&format!("{}{}", base, endpoint))
    } else {
        Url::parse(&format!("{}/{}", base, endpoint))
    }
}

fn parse_number<T>(key: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    raw.trim()
        .parse::<T>()
        .map_err(|e| ConfigError::invalid(key, raw, e))
}

fn ensure_positive(key: &'static str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::invalid(key, "0", "must be at least 1"));
    }
    Ok(())
}

fn parse_bool(key: &'static str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::invalid(key, raw, "expected 1/0, true/false, yes/no or on/off")),
    }
}

// ============================================================================
// Tests
// ============================================================================

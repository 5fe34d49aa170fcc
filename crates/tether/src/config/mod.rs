use serde::Deserialize;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::error::{Result, TetherError};

/// Main configuration structure for Tether
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// HTTP proxy configuration
    #[serde(default)]
    pub proxy: ProxyConfig,
    /// Stream resumption configuration
    #[serde(default)]
    pub retry: RetryConfig,
    /// Group routing configuration
    #[serde(default)]
    pub routing: RoutingConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP proxy server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    /// Address to listen on (e.g., "127.0.0.1:8787")
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Base URL of the upstream generation API
    #[serde(default = "default_upstream_url")]
    pub upstream_url: String,
    /// Time allowed to establish an upstream connection, in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Longest silence between upstream reads before the call is treated as
    /// a network failure, in seconds. A stream that keeps delivering bytes is
    /// never cut, however long it runs.
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,
    /// Largest client request body accepted, in bytes
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            upstream_url: default_upstream_url(),
            connect_timeout_secs: default_connect_timeout_secs(),
            read_timeout_secs: default_read_timeout_secs(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

fn default_listen_addr() -> String {
    "127.0.0.1:8787".to_string()
}

fn default_upstream_url() -> String {
    "https://generativelanguage.googleapis.com".to_string()
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_read_timeout_secs() -> u64 {
    300
}

fn default_max_body_bytes() -> usize {
    32 * 1024 * 1024
}

/// Retry budget for interrupted streams
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    /// Consecutive attempts without progress tolerated before giving up
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
    /// Pause between attempts in milliseconds
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

impl RetryConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_consecutive_failures: default_max_consecutive_failures(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

fn default_max_consecutive_failures() -> u32 {
    5
}

fn default_retry_delay_ms() -> u64 {
    500
}

/// Routing group table
#[derive(Debug, Clone, Deserialize)]
pub struct RoutingConfig {
    /// Group used when a request carries no routing information
    #[serde(default = "default_group_name")]
    pub default_group: String,
    /// Named groups; the default group is implicit if not listed
    #[serde(default)]
    pub groups: BTreeMap<String, GroupConfig>,
}

impl RoutingConfig {
    /// Look up a group by name.
    ///
    /// The default group always resolves, falling back to an empty path on the
    /// global upstream when the table does not list it.
    pub fn group(&self, name: &str) -> Option<GroupConfig> {
        match self.groups.get(name) {
            Some(group) => Some(group.clone()),
            None if name == self.default_group => Some(GroupConfig::default()),
            None => None,
        }
    }

    pub fn is_known(&self, name: &str) -> bool {
        self.groups.contains_key(name) || name == self.default_group
    }
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            default_group: default_group_name(),
            groups: BTreeMap::new(),
        }
    }
}

fn default_group_name() -> String {
    "default".to_string()
}

/// A single routing group
#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
pub struct GroupConfig {
    /// Path prefix prepended to the request path upstream (e.g. "/openai")
    #[serde(default)]
    pub path: String,
    /// Overrides `proxy.upstream_url` for this group
    #[serde(default)]
    pub upstream_url: Option<String>,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Default)]
pub struct LoggingConfig {
    /// Enable debug-level logs for tether itself
    #[serde(default)]
    pub debug: bool,
}

const ENV_LISTEN_ADDR: &str = "TETHER_LISTEN_ADDR";
const ENV_UPSTREAM_URL: &str = "TETHER_UPSTREAM_URL";
const ENV_DEFAULT_GROUP: &str = "TETHER_DEFAULT_GROUP";
const ENV_MAX_CONSECUTIVE_FAILURES: &str = "TETHER_MAX_CONSECUTIVE_FAILURES";
const ENV_RETRY_DELAY_MS: &str = "TETHER_RETRY_DELAY_MS";
const ENV_CONNECT_TIMEOUT_SECS: &str = "TETHER_CONNECT_TIMEOUT_SECS";
const ENV_READ_TIMEOUT_SECS: &str = "TETHER_READ_TIMEOUT_SECS";
const ENV_MAX_BODY_BYTES: &str = "TETHER_MAX_BODY_BYTES";
const ENV_DEBUG: &str = "TETHER_DEBUG";
const ENV_GROUPS: &str = "TETHER_GROUPS";

impl Config {
    /// Find the config file to use: the explicit path if given, otherwise the
    /// first default location that exists.
    pub fn locate(explicit: Option<PathBuf>) -> Option<PathBuf> {
        explicit.or_else(|| default_config_paths().into_iter().find(|p| p.exists()))
    }

    /// Build the process configuration: defaults or the given file, then
    /// `TETHER_*` environment overrides, then validation.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };

        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            TetherError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| TetherError::Config(format!("Failed to parse config: {e}")))
    }

    /// Apply `TETHER_*` overrides read through `lookup`.
    ///
    /// Taking the lookup as a parameter keeps this testable without touching
    /// the process environment.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup(ENV_LISTEN_ADDR) {
            self.proxy.listen_addr = v;
        }
        if let Some(v) = lookup(ENV_UPSTREAM_URL) {
            self.proxy.upstream_url = v;
        }
        if let Some(v) = lookup(ENV_DEFAULT_GROUP) {
            self.routing.default_group = v;
        }
        if let Some(v) = lookup(ENV_MAX_CONSECUTIVE_FAILURES) {
            self.retry.max_consecutive_failures = parse_number(ENV_MAX_CONSECUTIVE_FAILURES, &v)?;
        }
        if let Some(v) = lookup(ENV_RETRY_DELAY_MS) {
            self.retry.retry_delay_ms = parse_number(ENV_RETRY_DELAY_MS, &v)?;
        }
        if let Some(v) = lookup(ENV_CONNECT_TIMEOUT_SECS) {
            self.proxy.connect_timeout_secs = parse_number(ENV_CONNECT_TIMEOUT_SECS, &v)?;
        }
        if let Some(v) = lookup(ENV_READ_TIMEOUT_SECS) {
            self.proxy.read_timeout_secs = parse_number(ENV_READ_TIMEOUT_SECS, &v)?;
        }
        if let Some(v) = lookup(ENV_MAX_BODY_BYTES) {
            self.proxy.max_body_bytes = parse_number(ENV_MAX_BODY_BYTES, &v)?;
        }
        if let Some(v) = lookup(ENV_DEBUG) {
            self.logging.debug = parse_flag(ENV_DEBUG, &v)?;
        }
        if let Some(v) = lookup(ENV_GROUPS) {
            self.routing.groups.extend(parse_groups(&v)?);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.proxy
            .listen_addr
            .parse::<SocketAddr>()
            .map_err(|e| TetherError::Config(format!("Invalid listen address: {e}")))?;

        parse_upstream_url(&self.proxy.upstream_url)?;

        if self.proxy.connect_timeout_secs == 0 || self.proxy.read_timeout_secs == 0 {
            return Err(TetherError::Config(
                "Upstream timeouts must be at least one second".to_string(),
            ));
        }
        if self.proxy.max_body_bytes == 0 {
            return Err(TetherError::Config(
                "max_body_bytes must be greater than zero".to_string(),
            ));
        }

        if self.routing.default_group.is_empty() {
            return Err(TetherError::Config(
                "Default group name cannot be empty".to_string(),
            ));
        }

        for (name, group) in &self.routing.groups {
            if name.is_empty() || name.contains(':') {
                return Err(TetherError::Config(format!("Invalid group name '{name}'")));
            }
            if !group.path.is_empty() && !group.path.starts_with('/') {
                return Err(TetherError::Config(format!(
                    "Group '{name}' path must start with '/': {}",
                    group.path
                )));
            }
            if let Some(ref url) = group.upstream_url {
                parse_upstream_url(url)?;
            }
        }

        Ok(())
    }
}

fn default_config_paths() -> Vec<PathBuf> {
    [
        dirs::home_dir().map(|h| h.join(".tether").join("config.toml")),
        dirs::config_dir().map(|c| c.join("tether").join("config.toml")),
        Some(PathBuf::from("tether.toml")),
    ]
    .into_iter()
    .flatten()
    .collect()
}

/// Parse an upstream base URL, accepting only http and https
pub fn parse_upstream_url(raw: &str) -> Result<Url> {
    let url = Url::parse(raw)
        .map_err(|e| TetherError::Config(format!("Invalid upstream URL '{raw}': {e}")))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        scheme => Err(TetherError::Config(format!(
            "Unsupported upstream URL scheme '{scheme}': only http and https are allowed"
        ))),
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| TetherError::Config(format!("Invalid value for {key} '{value}': {e}")))
}

fn parse_flag(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "" | "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(TetherError::Config(format!(
            "Invalid value for {key} '{value}': expected true or false"
        ))),
    }
}

/// Parse `name=path[,name=path...]`
fn parse_groups(value: &str) -> Result<BTreeMap<String, GroupConfig>> {
    let mut groups = BTreeMap::new();
    for entry in value.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (name, path) = entry.split_once('=').ok_or_else(|| {
            TetherError::Config(format!(
                "Invalid {ENV_GROUPS} entry '{entry}': expected name=path"
            ))
        })?;
        let name = name.trim();
        if name.is_empty() {
            return Err(TetherError::Config(format!(
                "Invalid {ENV_GROUPS} entry '{entry}': empty group name"
            )));
        }
        groups.insert(
            name.to_string(),
            GroupConfig {
                path: path.trim().trim_end_matches('/').to_string(),
                upstream_url: None,
            },
        );
    }
    Ok(groups)
}

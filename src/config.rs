//! Global configuration parsing and validation.

use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::warn;

use crate::{AppError, Result};

/// Protocol revisions the server understands, newest first.
pub const SUPPORTED_VERSIONS: &[&str] = &["2025-06-18", "2025-03-26", "2024-11-05"];

/// Revision assumed when a peer does not declare one.
pub const DEFAULT_VERSION: &str = "2025-03-26";

/// Network listener settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct HttpConfig {
    /// Interface to bind. Non-loopback values require `allow_remote`.
    #[serde(default = "default_host")]
    pub host: String,
    /// TCP port for the streamable HTTP transport.
    #[serde(default = "default_http_port")]
    pub port: u16,
    /// Opt-in for binding a non-loopback interface.
    #[serde(default)]
    pub allow_remote: bool,
    /// Single endpoint path carrying POST, GET and DELETE.
    #[serde(default = "default_endpoint_path")]
    pub path: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_http_port(),
            allow_remote: false,
            path: default_endpoint_path(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".into()
}

fn default_http_port() -> u16 {
    8765
}

fn default_endpoint_path() -> String {
    "/mcp".into()
}

/// Protocol revision negotiation.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ProtocolConfig {
    /// Revision assumed when a peer omits the declaration.
    #[serde(default = "default_protocol_version")]
    pub default_version: String,
    /// Revisions accepted from peers.
    #[serde(default = "default_supported_versions")]
    pub supported_versions: Vec<String>,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            default_version: default_protocol_version(),
            supported_versions: default_supported_versions(),
        }
    }
}

fn default_protocol_version() -> String {
    DEFAULT_VERSION.into()
}

fn default_supported_versions() -> Vec<String> {
    SUPPORTED_VERSIONS.iter().map(|v| (*v).to_owned()).collect()
}

/// Browser-origin protection.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SecurityConfig {
    /// Origins permitted to call the network channel.
    #[serde(default = "default_allowed_origins")]
    pub allowed_origins: Vec<String>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            allowed_origins: default_allowed_origins(),
        }
    }
}

fn default_allowed_origins() -> Vec<String> {
    [
        "http://localhost",
        "http://127.0.0.1",
        "http://[::1]",
        "https://localhost",
        "https://127.0.0.1",
        "https://[::1]",
    ]
    .iter()
    .map(|o| (*o).to_owned())
    .collect()
}

/// Resource cache budget.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct CacheConfig {
    /// Maximum number of retained entries.
    #[serde(default = "default_cache_entries")]
    pub max_entries: usize,
    /// Maximum estimated bytes across retained entries.
    #[serde(default = "default_cache_bytes")]
    pub max_bytes: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: default_cache_entries(),
            max_bytes: default_cache_bytes(),
        }
    }
}

fn default_cache_entries() -> usize {
    256
}

fn default_cache_bytes() -> usize {
    64 * 1024 * 1024
}

/// Behaviour when the worker pool queue is full.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Saturation {
    /// Submission waits until a queue slot frees.
    #[default]
    Block,
    /// Submission fails immediately with capacity-exceeded.
    Reject,
}

/// Worker pool sizing.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct PoolConfig {
    /// Concurrent execution slots.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Tasks allowed to wait for a slot.
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
    /// Policy once `workers + queue_depth` tasks are admitted.
    #[serde(default)]
    pub saturation: Saturation,
    /// Queued tasks older than this fail; 0 disables the limit.
    #[serde(default = "default_queue_timeout")]
    pub queue_timeout_seconds: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_depth: default_queue_depth(),
            saturation: Saturation::default(),
            queue_timeout_seconds: default_queue_timeout(),
        }
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism().map_or(4, std::num::NonZeroUsize::get)
}

fn default_queue_depth() -> usize {
    64
}

fn default_queue_timeout() -> u64 {
    30
}

/// Session lifecycle thresholds.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SessionConfig {
    /// Sessions without a request for this long are reaped.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_seconds: u64,
    /// How often the reaper scans the registry.
    #[serde(default = "default_reap_interval")]
    pub reap_interval_seconds: u64,
    /// Stream events retained per session for resumption.
    #[serde(default = "default_event_retention")]
    pub event_retention: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_seconds: default_idle_timeout(),
            reap_interval_seconds: default_reap_interval(),
            event_retention: default_event_retention(),
        }
    }
}

fn default_idle_timeout() -> u64 {
    1800
}

fn default_reap_interval() -> u64 {
    60
}

fn default_event_retention() -> usize {
    100
}

/// Chunked result delivery.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct StreamingConfig {
    /// Results estimated above this size are delivered in chunks.
    #[serde(default = "default_inline_threshold")]
    pub inline_threshold_bytes: usize,
    /// Items per chunk event.
    #[serde(default = "default_chunk_items")]
    pub chunk_items: usize,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            inline_threshold_bytes: default_inline_threshold(),
            chunk_items: default_chunk_items(),
        }
    }
}

fn default_inline_threshold() -> usize {
    64 * 1024
}

fn default_chunk_items() -> usize {
    200
}

/// Local channel settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct StdioConfig {
    /// Requests dispatched concurrently before reading pauses.
    #[serde(default = "default_max_inflight")]
    pub max_inflight: usize,
}

impl Default for StdioConfig {
    fn default() -> Self {
        Self {
            max_inflight: default_max_inflight(),
        }
    }
}

fn default_max_inflight() -> usize {
    16
}

fn default_data_root() -> PathBuf {
    PathBuf::from(".")
}

/// Global configuration parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// Directory holding the read-only data corpus.
    #[serde(default = "default_data_root")]
    pub data_root: PathBuf,
    /// Network listener.
    #[serde(default)]
    pub http: HttpConfig,
    /// Protocol revisions.
    #[serde(default)]
    pub protocol: ProtocolConfig,
    /// Origin allow-list.
    #[serde(default)]
    pub security: SecurityConfig,
    /// Cache budget.
    #[serde(default)]
    pub cache: CacheConfig,
    /// Worker pool sizing.
    #[serde(default)]
    pub pool: PoolConfig,
    /// Session lifecycle.
    #[serde(default)]
    pub sessions: SessionConfig,
    /// Chunked delivery.
    #[serde(default)]
    pub streaming: StreamingConfig,
    /// Local channel.
    #[serde(default)]
    pub stdio: StdioConfig,
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string and normalize paths.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Configuration with every default applied, rooted at `data_root`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if `data_root` does not exist.
    pub fn with_data_root(data_root: impl Into<PathBuf>) -> Result<Self> {
        let mut config: Self = toml::from_str("")?;
        config.data_root = data_root.into();
        config.validate()?;
        Ok(config)
    }

    /// Address the HTTP listener binds, after the loopback policy is applied.
    ///
    /// A non-loopback host without `allow_remote` is coerced to
    /// `127.0.0.1`; the service has no authentication layer.
    #[must_use]
    pub fn bind_host(&self) -> String {
        if self.http.allow_remote || is_loopback_host(&self.http.host) {
            return self.http.host.clone();
        }
        warn!(
            requested = %self.http.host,
            "non-loopback bind requires http.allow_remote; binding 127.0.0.1"
        );
        default_host()
    }

    /// Replace `data_root` and re-run validation.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the new root cannot be canonicalized.
    pub fn set_data_root(&mut self, data_root: impl Into<PathBuf>) -> Result<()> {
        self.data_root = data_root.into();
        self.validate()
    }

    fn validate(&mut self) -> Result<()> {
        if self.pool.workers == 0 {
            return Err(AppError::Config("pool.workers must be greater than zero".into()));
        }
        if self.cache.max_entries == 0 {
            return Err(AppError::Config(
                "cache.max_entries must be greater than zero".into(),
            ));
        }
        if self.sessions.event_retention == 0 {
            return Err(AppError::Config(
                "sessions.event_retention must be greater than zero".into(),
            ));
        }
        if self.streaming.chunk_items == 0 {
            return Err(AppError::Config(
                "streaming.chunk_items must be greater than zero".into(),
            ));
        }
        if self.stdio.max_inflight == 0 {
            return Err(AppError::Config(
                "stdio.max_inflight must be greater than zero".into(),
            ));
        }
        if self.protocol.supported_versions.is_empty() {
            return Err(AppError::Config(
                "protocol.supported_versions must not be empty".into(),
            ));
        }
        if !self
            .protocol
            .supported_versions
            .iter()
            .any(|v| *v == self.protocol.default_version)
        {
            return Err(AppError::Config(format!(
                "protocol.default_version {} is not in supported_versions",
                self.protocol.default_version
            )));
        }
        if !self.http.path.starts_with('/') {
            return Err(AppError::Config("http.path must start with '/'".into()));
        }

        let canonical_root = self
            .data_root
            .canonicalize()
            .map_err(|err| AppError::Config(format!("data_root invalid: {err}")))?;
        self.data_root = canonical_root;

        Ok(())
    }
}

/// Whether `host` names the loopback interface.
#[must_use]
pub fn is_loopback_host(host: &str) -> bool {
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    host.trim_start_matches('[')
        .trim_end_matches(']')
        .parse::<IpAddr>()
        .is_ok_and(|ip| ip.is_loopback())
}

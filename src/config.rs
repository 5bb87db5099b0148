use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::worker::DispatcherConfig;

// -----------------------------------------------------------------------------
// Config (root)
// -----------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub dispatcher: DispatcherSection,
    #[serde(default)]
    pub files: FilesConfig,
    /// Per-provider base-url overrides, keyed by provider name.
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
}

impl Config {
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let path = Path::new(path);
        let contents = match fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(ConfigError::Io(e)),
        };
        serde_saphyr::from_str(&contents).map_err(ConfigError::Yaml)
    }

    /// Collect the configured base-url overrides for the provider factory.
    pub fn provider_base_urls(&self) -> HashMap<String, String> {
        self.providers
            .iter()
            .filter_map(|(name, cfg)| {
                cfg.base_url.as_ref().map(|url| (name.clone(), url.clone()))
            })
            .collect()
    }
}

// -----------------------------------------------------------------------------
// ServerConfig
// -----------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            request_timeout_seconds: default_request_timeout(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_request_timeout() -> u64 {
    30
}

// -----------------------------------------------------------------------------
// DispatcherSection
// -----------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct DispatcherSection {
    #[serde(default = "default_min_workers")]
    pub min_workers: usize,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
    #[serde(default = "default_worker_idle_timeout")]
    pub worker_idle_timeout_seconds: u64,
    #[serde(default = "default_enqueue_timeout")]
    pub enqueue_timeout_ms: u64,
    #[serde(default = "default_stream_timeout")]
    pub stream_timeout_seconds: u64,
}

impl Default for DispatcherSection {
    fn default() -> Self {
        Self {
            min_workers: default_min_workers(),
            max_workers: default_max_workers(),
            queue_size: default_queue_size(),
            worker_idle_timeout_seconds: default_worker_idle_timeout(),
            enqueue_timeout_ms: default_enqueue_timeout(),
            stream_timeout_seconds: default_stream_timeout(),
        }
    }
}

impl DispatcherSection {
    pub fn to_dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            min_workers: self.min_workers,
            max_workers: self.max_workers,
            queue_size: self.queue_size,
            worker_idle_timeout: Duration::from_secs(self.worker_idle_timeout_seconds),
            enqueue_timeout: Duration::from_millis(self.enqueue_timeout_ms),
            stream_timeout: Duration::from_secs(self.stream_timeout_seconds),
        }
    }
}

fn default_min_workers() -> usize {
    3
}

fn default_max_workers() -> usize {
    10
}

fn default_queue_size() -> usize {
    100
}

fn default_worker_idle_timeout() -> u64 {
    30 * 60
}

fn default_enqueue_timeout() -> u64 {
    1000
}

fn default_stream_timeout() -> u64 {
    120
}

// -----------------------------------------------------------------------------
// FilesConfig
// -----------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct FilesConfig {
    #[serde(default = "default_file_base")]
    pub base_dir: PathBuf,
    #[serde(default = "default_file_ttl")]
    pub ttl_hours: u64,
}

impl Default for FilesConfig {
    fn default() -> Self {
        Self {
            base_dir: default_file_base(),
            ttl_hours: default_file_ttl(),
        }
    }
}

fn default_file_base() -> PathBuf {
    PathBuf::from(".unichat/files")
}

fn default_file_ttl() -> u64 {
    24
}

// -----------------------------------------------------------------------------
// ProviderConfig
// -----------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct ProviderConfig {
    #[serde(default)]
    pub base_url: Option<String>,
}

// -----------------------------------------------------------------------------
// ConfigError
// -----------------------------------------------------------------------------

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Yaml(serde_saphyr::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "failed to read config file: {e}"),
            ConfigError::Yaml(e) => write!(f, "failed to parse config file: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io(e) => Some(e),
            ConfigError::Yaml(e) => Some(e),
        }
    }
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------

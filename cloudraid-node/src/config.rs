//! Configuration management for the CloudRAID node
//!
//! Supports loading from TOML files, environment variables and CLI overrides.

use crate::distributor::DistributionPolicy;
use cloudraid_storage::ConnectorSpec;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Complete node configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Staging and shard output directories
    #[serde(default)]
    pub split: SplitSettings,

    /// Retrieval directories
    #[serde(default)]
    pub merge: MergeSettings,

    /// Worker pool
    #[serde(default)]
    pub filemanagement: FileManagementSettings,

    #[serde(default)]
    pub upload: UploadSettings,

    #[serde(default)]
    pub filesize: FileSizeSettings,

    #[serde(default)]
    pub watcher: WatcherSettings,

    #[serde(default)]
    pub distribution: DistributionSettings,

    #[serde(default)]
    pub metadata: MetadataSettings,

    /// Storage backends, in distribution order
    #[serde(default)]
    pub connectors: Vec<ConnectorSpec>,

    #[serde(default)]
    pub metrics: MetricsSettings,
}

impl NodeConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from TOML text
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Validate the configuration, creating configured directories that do not exist yet
    pub fn validate(&self) -> Result<(), ConfigError> {
        let required = [
            ("split.input_dir", &self.split.input_dir),
            ("split.output_dir", &self.split.output_dir),
            ("merge.input_dir", &self.merge.input_dir),
            ("merge.output_dir", &self.merge.output_dir),
        ];
        for (key, dir) in required {
            if dir.as_os_str().is_empty() {
                return Err(ConfigError::ValidationError(format!("{} is not set", key)));
            }
            ensure_dir(key, dir)?;
        }
        if let Some(root) = &self.watcher.root {
            ensure_dir("watcher.root", root)?;
        }

        if self.filemanagement.count == 0 {
            return Err(ConfigError::ValidationError(
                "filemanagement.count must be > 0".to_string(),
            ));
        }
        if self.filemanagement.intervall == 0 {
            return Err(ConfigError::ValidationError(
                "filemanagement.intervall must be > 0".to_string(),
            ));
        }
        if self.filemanagement.max_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "filemanagement.max_attempts must be > 0".to_string(),
            ));
        }
        if self.watcher.interval_secs == 0 {
            return Err(ConfigError::ValidationError(
                "watcher.interval_secs must be > 0".to_string(),
            ));
        }
        if self.connectors.is_empty() {
            return Err(ConfigError::ValidationError(
                "at least one [[connectors]] entry is required".to_string(),
            ));
        }
        if self.metadata.backend == MetadataBackend::Sled && self.metadata.path.is_none() {
            return Err(ConfigError::ValidationError(
                "metadata.path is required for the sled backend".to_string(),
            ));
        }

        Ok(())
    }

    /// Override config with CLI arguments
    pub fn with_overrides(mut self, split_input: Option<PathBuf>, workers: Option<usize>) -> Self {
        if let Some(dir) = split_input {
            self.split.input_dir = dir;
        }
        if let Some(count) = workers {
            self.filemanagement.count = count;
        }
        self
    }

    /// Apply `CLOUDRAID_*` environment variable overrides
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from any key lookup (the environment in production)
    pub fn with_overrides_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(dir) = lookup("CLOUDRAID_SPLIT_INPUT_DIR") {
            self.split.input_dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup("CLOUDRAID_SPLIT_OUTPUT_DIR") {
            self.split.output_dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup("CLOUDRAID_MERGE_INPUT_DIR") {
            self.merge.input_dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup("CLOUDRAID_MERGE_OUTPUT_DIR") {
            self.merge.output_dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup("CLOUDRAID_WATCHER_ROOT") {
            self.watcher.root = Some(PathBuf::from(dir));
        }

        // Numeric overrides are ignored when they do not parse
        if let Some(count) = lookup("CLOUDRAID_FILEMANAGEMENT_COUNT").and_then(|v| v.parse().ok()) {
            self.filemanagement.count = count;
        }
        if let Some(ms) = lookup("CLOUDRAID_FILEMANAGEMENT_INTERVALL").and_then(|v| v.parse().ok()) {
            self.filemanagement.intervall = ms;
        }
        if let Some(flag) = lookup("CLOUDRAID_UPLOAD_ASYNC").and_then(|v| parse_bool(&v)) {
            self.upload.asynchronous = flag;
        }
        if let Some(max) = lookup("CLOUDRAID_FILESIZE_MAX").and_then(|v| v.parse().ok()) {
            self.filesize.max = max;
        }

        self
    }

    /// Directory the watcher polls; defaults to the staging directory
    pub fn watch_root(&self) -> PathBuf {
        self.watcher
            .root
            .clone()
            .unwrap_or_else(|| self.split.input_dir.clone())
    }
}

fn ensure_dir(key: &str, dir: &Path) -> Result<(), ConfigError> {
    if !dir.exists() {
        std::fs::create_dir_all(dir).map_err(|e| {
            ConfigError::ValidationError(format!("Cannot create {} {:?}: {}", key, dir, e))
        })?;
    } else if !dir.is_dir() {
        return Err(ConfigError::ValidationError(format!(
            "{} {:?} is not a directory",
            key, dir
        )));
    }
    Ok(())
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// `[split]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplitSettings {
    /// Staging area: `{input_dir}/{user_id}/{path}`
    #[serde(default = "default_split_input")]
    pub input_dir: PathBuf,

    /// Shard files produced by split
    #[serde(default = "default_split_output")]
    pub output_dir: PathBuf,
}

impl Default for SplitSettings {
    fn default() -> Self {
        Self {
            input_dir: default_split_input(),
            output_dir: default_split_output(),
        }
    }
}

fn default_split_input() -> PathBuf {
    PathBuf::from("./data/split/input")
}

fn default_split_output() -> PathBuf {
    PathBuf::from("./data/split/output")
}

/// `[merge]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeSettings {
    /// Shards fetched back from the connectors
    #[serde(default = "default_merge_input")]
    pub input_dir: PathBuf,

    /// Reconstructed files: `{output_dir}/{user_id}/{path}`
    #[serde(default = "default_merge_output")]
    pub output_dir: PathBuf,
}

impl Default for MergeSettings {
    fn default() -> Self {
        Self {
            input_dir: default_merge_input(),
            output_dir: default_merge_output(),
        }
    }
}

fn default_merge_input() -> PathBuf {
    PathBuf::from("./data/merge/input")
}

fn default_merge_output() -> PathBuf {
    PathBuf::from("./data/merge/output")
}

/// `[filemanagement]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileManagementSettings {
    /// Number of workers
    #[serde(default = "default_worker_count")]
    pub count: usize,

    /// Base idle interval in milliseconds; worker `i` sleeps `(i + 1) * intervall`
    #[serde(default = "default_worker_interval")]
    pub intervall: u64,

    /// Processing attempts per queue entry before it is dropped
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for FileManagementSettings {
    fn default() -> Self {
        Self {
            count: default_worker_count(),
            intervall: default_worker_interval(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl FileManagementSettings {
    pub fn base_interval(&self) -> Duration {
        Duration::from_millis(self.intervall)
    }
}

/// Half the available cores, rounded up
fn default_worker_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .div_ceil(2)
}

fn default_worker_interval() -> u64 {
    2000
}

fn default_max_attempts() -> u32 {
    5
}

/// `[upload]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadSettings {
    /// Run split/distribute in the background after an ingestion is persisted
    #[serde(default = "default_true")]
    pub asynchronous: bool,
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self { asynchronous: true }
    }
}

fn default_true() -> bool {
    true
}

/// `[filesize]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileSizeSettings {
    /// Largest accepted file in bytes
    #[serde(default = "default_max_file_size")]
    pub max: u64,
}

impl Default for FileSizeSettings {
    fn default() -> Self {
        Self {
            max: default_max_file_size(),
        }
    }
}

fn default_max_file_size() -> u64 {
    512 * 1024 * 1024
}

/// `[watcher]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatcherSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Polled directory (defaults to `split.input_dir`)
    #[serde(default)]
    pub root: Option<PathBuf>,

    #[serde(default = "default_watch_interval")]
    pub interval_secs: u64,
}

impl Default for WatcherSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            root: None,
            interval_secs: default_watch_interval(),
        }
    }
}

impl WatcherSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

fn default_watch_interval() -> u64 {
    10
}

/// `[distribution]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributionSettings {
    #[serde(default)]
    pub policy: DistributionPolicy,

    /// Retries per shard upload after the first attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// First retry delay; doubles on every further retry
    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,
}

impl Default for DistributionSettings {
    fn default() -> Self {
        Self {
            policy: DistributionPolicy::default(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay(),
        }
    }
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay() -> u64 {
    500
}

/// Metadata store implementation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetadataBackend {
    #[default]
    Memory,
    Sled,
}

/// `[metadata]` section
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetadataSettings {
    #[serde(default)]
    pub backend: MetadataBackend,

    /// Database directory for the sled backend
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// `[metrics]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSettings {
    /// Enable the Prometheus exporter
    #[serde(default)]
    pub enabled: bool,

    /// Exporter HTTP port
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_metrics_port(),
        }
    }
}

fn default_metrics_port() -> u16 {
    9090
}

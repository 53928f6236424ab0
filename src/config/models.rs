use crate::humanize::HumanDuration;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub runner: RunnerConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// Storage provider type
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageProvider {
    #[default]
    S3,
    Local,
    Memory,
}

/// Storage configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub provider: StorageProvider,
    /// Bucket that catalogue entries are written to
    #[serde(default = "default_output_bucket")]
    pub output_bucket: String,
    /// Prefix prepended to every catalogue path, e.g. "transformed/"
    #[serde(default)]
    pub output_prefix: String,
    /// Additional buckets that incoming change messages may reference
    #[serde(default)]
    pub input_buckets: Vec<String>,
    pub endpoint: Option<String>,
    pub region: Option<String>,
    /// Root directory for the local provider (one sub-directory per bucket)
    #[serde(default = "default_local_root")]
    pub local_root: PathBuf,
    /// Loaded from environment, never from the config file
    #[serde(skip)]
    pub access_key: Option<String>,
    /// Loaded from environment, never from the config file
    #[serde(skip)]
    pub secret_key: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            provider: StorageProvider::default(),
            output_bucket: default_output_bucket(),
            output_prefix: String::new(),
            input_buckets: Vec::new(),
            endpoint: None,
            region: None,
            local_root: default_local_root(),
            access_key: None,
            secret_key: None,
        }
    }
}

impl StorageConfig {
    /// Output bucket followed by any distinct input buckets
    pub fn bucket_names(&self) -> Vec<String> {
        let mut names = vec![self.output_bucket.clone()];
        for bucket in &self.input_buckets {
            if !names.contains(bucket) {
                names.push(bucket.clone());
            }
        }
        names
    }
}

fn default_output_bucket() -> String {
    "catalogue-population".to_string()
}

fn default_local_root() -> PathBuf {
    PathBuf::from("data/buckets")
}

/// Runner configuration (subscriptions, takeover and redelivery)
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RunnerConfig {
    #[serde(default)]
    pub subscription_name: String,
    #[serde(default = "default_component_name")]
    pub component_name: String,
    #[serde(default)]
    pub takeover_mode: bool,
    /// Consumers registered per topic
    #[serde(default = "default_threads")]
    pub threads: usize,
    #[serde(default = "default_debug_topic")]
    pub debug_topic: String,
    #[serde(default = "default_suspend_window")]
    pub suspend_window: HumanDuration,
    #[serde(default = "default_max_redeliveries")]
    pub max_redeliveries: u32,
    #[serde(default = "default_redelivery_delay")]
    pub redelivery_delay: HumanDuration,
    /// Stop the main loop after this many messages (development aid)
    pub max_messages: Option<u64>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            subscription_name: String::new(),
            component_name: default_component_name(),
            takeover_mode: false,
            threads: default_threads(),
            debug_topic: default_debug_topic(),
            suspend_window: default_suspend_window(),
            max_redeliveries: default_max_redeliveries(),
            redelivery_delay: default_redelivery_delay(),
            max_messages: None,
        }
    }
}

fn default_component_name() -> String {
    env!("CARGO_PKG_NAME").to_string()
}

fn default_threads() -> usize {
    1
}

fn default_debug_topic() -> String {
    "pipeline-debugging".to_string()
}

fn default_suspend_window() -> HumanDuration {
    HumanDuration::from_secs(5)
}

fn default_max_redeliveries() -> u32 {
    3
}

fn default_redelivery_delay() -> HumanDuration {
    HumanDuration::from_secs(30)
}

/// Telemetry configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TelemetryConfig {
    /// 0 = errors only, 1 = warnings, 2 = info, 3+ = debug
    #[serde(default)]
    pub verbosity: u8,
    /// Force JSON log lines; also enabled automatically inside Kubernetes
    #[serde(default)]
    pub json_logs: bool,
}

//! Configuration management

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub general: GeneralConfig,
    /// Flat defaults merged under each ping test's params
    #[serde(default)]
    pub ping: Map<String, Value>,
    /// Flat defaults merged under each iperf3 test's params
    #[serde(default)]
    pub iperf3: Map<String, Value>,
    /// Static tags added to every point
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default)]
    pub influx: InfluxConfig,
    #[serde(default)]
    pub upload: UploadConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GeneralConfig {
    /// Output root for raw and line protocol files
    pub root_dir: PathBuf,
    pub database_path: String,
    #[serde(default = "default_ping_binary")]
    pub ping_binary: String,
    #[serde(default = "default_iperf3_binary")]
    pub iperf3_binary: String,
    #[serde(default = "default_max_concurrent_runs")]
    pub max_concurrent_runs: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InfluxConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_influx_url")]
    pub url: String,
    #[serde(default)]
    pub org: String,
    #[serde(default)]
    pub bucket: String,
    #[serde(default)]
    pub token: String,
}

impl Default for InfluxConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: default_influx_url(),
            org: String::new(),
            bucket: String::new(),
            token: String::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UploadConfig {
    #[serde(default = "default_max_buffered_batches")]
    pub max_buffered_batches: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: u32,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_jitter_ms")]
    pub jitter_ms: u64,
    #[serde(default = "default_ping_timeout_ms")]
    pub ping_timeout_ms: u64,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_buffered_batches: default_max_buffered_batches(),
            max_retries: default_max_retries(),
            backoff_ms: default_backoff_ms(),
            backoff_factor: default_backoff_factor(),
            max_backoff_ms: default_max_backoff_ms(),
            jitter_ms: default_jitter_ms(),
            ping_timeout_ms: default_ping_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_ping_binary() -> String {
    "ping".to_string()
}

fn default_iperf3_binary() -> String {
    "iperf3".to_string()
}

fn default_max_concurrent_runs() -> usize {
    4
}

fn default_influx_url() -> String {
    "http://localhost:8086".to_string()
}

fn default_max_buffered_batches() -> usize {
    64
}

fn default_max_retries() -> u32 {
    5
}

fn default_backoff_ms() -> u64 {
    500
}

fn default_backoff_factor() -> u32 {
    4
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

fn default_jitter_ms() -> u64 {
    10
}

fn default_ping_timeout_ms() -> u64 {
    2000
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;

        let config = Self::from_toml(&contents)?;
        Ok(config)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(contents).with_context(|| "Failed to parse config file")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.general.root_dir.as_os_str().is_empty() {
            anyhow::bail!("general.root_dir must not be empty");
        }
        if self.general.database_path.is_empty() {
            anyhow::bail!("general.database_path must not be empty");
        }
        if self.general.max_concurrent_runs == 0 {
            anyhow::bail!("general.max_concurrent_runs must be at least 1");
        }
        if self.upload.backoff_factor < 1 {
            anyhow::bail!("upload.backoff_factor must be at least 1");
        }
        if self.upload.max_buffered_batches < 1 {
            anyhow::bail!("upload.max_buffered_batches must be at least 1");
        }
        if self.influx.enabled && self.influx.url.is_empty() {
            anyhow::bail!("influx.url must be set when influx is enabled");
        }
        Ok(())
    }

    /// Probe defaults for `probe` overlaid with the per-test `params`
    pub fn merged_params(&self, probe: &str, params: &Map<String, Value>) -> Map<String, Value> {
        let mut merged = match probe {
            protocol::PROBE_DIR_PING => self.ping.clone(),
            protocol::PROBE_DIR_IPERF3 => self.iperf3.clone(),
            _ => Map::new(),
        };
        for (key, value) in params {
            merged.insert(key.clone(), value.clone());
        }
        merged
    }
}

//! TOML configuration parsing.
//!
//! See `config/snaplog.example.toml` for a complete file. Every section
//! except `[source]` may be omitted and falls back to the defaults below.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::models::Field;
use crate::pool::ConcurrencyLimit;
use crate::refine::FailurePolicy;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub source: SourceConfig,
    #[serde(default)]
    pub scan: ScanConfig,
    #[serde(default)]
    pub refine: RefineConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    pub url: String,
    #[serde(default = "default_snapshot_method")]
    pub snapshot_method: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_snapshot_method() -> String {
    "subnetInfo_getAllSubnets".to_string()
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_max_retries() -> u32 {
    2
}

#[derive(Debug, Deserialize, Clone)]
pub struct ScanConfig {
    #[serde(default = "default_lookback_days")]
    pub lookback_days: u64,
    #[serde(default = "default_seconds_per_block")]
    pub seconds_per_block: u64,
    #[serde(default = "default_stride")]
    pub stride: u64,
    #[serde(default)]
    pub concurrency: ConcurrencyLimit,
    /// Field names to compare. Empty means every tracked field.
    #[serde(default)]
    pub fields: Vec<String>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            lookback_days: default_lookback_days(),
            seconds_per_block: default_seconds_per_block(),
            stride: default_stride(),
            concurrency: ConcurrencyLimit::default(),
            fields: Vec::new(),
        }
    }
}

fn default_lookback_days() -> u64 {
    60
}
fn default_seconds_per_block() -> u64 {
    12
}
fn default_stride() -> u64 {
    100
}

impl ScanConfig {
    /// Resolve the configured field names, in `Field::ALL` order.
    pub fn tracked_fields(&self) -> Result<Vec<Field>> {
        if self.fields.is_empty() {
            return Ok(Field::ALL.to_vec());
        }
        let mut selected = self
            .fields
            .iter()
            .map(|name| name.parse::<Field>())
            .collect::<Result<Vec<_>>>()?;
        selected.sort();
        selected.dedup();
        Ok(selected)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RefineConfig {
    #[serde(default)]
    pub failure_policy: FailurePolicy,
    #[serde(default)]
    pub concurrency: ConcurrencyLimit,
    #[serde(default = "default_verify")]
    pub verify: bool,
}

impl Default for RefineConfig {
    fn default() -> Self {
        Self {
            failure_policy: FailurePolicy::default(),
            concurrency: ConcurrencyLimit::default(),
            verify: default_verify(),
        }
    }
}

fn default_verify() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct OutputConfig {
    #[serde(default = "default_approximate_path")]
    pub approximate: PathBuf,
    #[serde(default = "default_exact_path")]
    pub exact: PathBuf,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            approximate: default_approximate_path(),
            exact: default_exact_path(),
        }
    }
}

fn default_approximate_path() -> PathBuf {
    PathBuf::from("./changes.csv")
}
fn default_exact_path() -> PathBuf {
    PathBuf::from("./changes_exact.csv")
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    parse_config(&content)
}

/// Parse and validate configuration from TOML text.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;

    if config.source.url.trim().is_empty() {
        anyhow::bail!("source.url must not be empty");
    }
    if config.source.snapshot_method.trim().is_empty() {
        anyhow::bail!("source.snapshot_method must not be empty");
    }
    if config.source.timeout_secs == 0 {
        anyhow::bail!("source.timeout_secs must be > 0");
    }

    if config.scan.stride == 0 {
        anyhow::bail!("scan.stride must be > 0");
    }
    if config.scan.seconds_per_block == 0 {
        anyhow::bail!("scan.seconds_per_block must be > 0");
    }
    if config.scan.lookback_days == 0 {
        anyhow::bail!("scan.lookback_days must be > 0");
    }
    config
        .scan
        .tracked_fields()
        .with_context(|| "Invalid scan.fields")?;

    Ok(config)
}

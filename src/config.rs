use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants::{
    DEFAULT_BUSY_TIMEOUT_MS, DEFAULT_CHUNK_SIZE, DEFAULT_FAILURE_RATE_THRESHOLD,
    DEFAULT_MAX_RETRIES, DEFAULT_POOL_SIZE, DEFAULT_RETRY_DELAY_MS, MAX_RETRY_DELAY_MS,
};
use crate::error::{EtlError, Result};
use crate::pipeline::cleaner::{CleanerOptions, EnumMatching};
use crate::pipeline::loader::LoadSettings;
use crate::pipeline::record_types::RecordType;
use crate::pipeline::runner::PipelineRunner;
use crate::pipeline::schema::TableSchema;
use crate::source::WorksheetSelector;

/// Resolved configuration. Built once at startup and passed around immutably.
#[derive(Debug, Clone, Deserialize)]
pub struct EtlConfig {
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub destination: DestinationConfig,
    #[serde(default)]
    pub load: LoadConfig,
    #[serde(default = "default_failure_rate_threshold")]
    pub failure_rate_threshold: f64,
    #[serde(default = "default_true")]
    pub day_first: bool,
    #[serde(default)]
    pub enum_matching: EnumMatching,
    #[serde(default = "default_true")]
    pub require_rows: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    #[serde(default)]
    pub metrics_addr: Option<SocketAddr>,
    #[serde(default)]
    pub pipelines: BTreeMap<String, PipelineConfig>,
    /// Replacement target schemas, keyed by pipeline name.
    #[serde(default)]
    pub schemas: BTreeMap<String, TableSchema>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    #[default]
    CsvDir,
    JsonValues,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SourceConfig {
    #[serde(default)]
    pub kind: SourceKind,
    #[serde(default)]
    pub locator: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DestinationConfig {
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl Default for DestinationConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            pool_size: DEFAULT_POOL_SIZE,
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoadConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub worksheet: Option<WorksheetSelector>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}
fn default_failure_rate_threshold() -> f64 {
    DEFAULT_FAILURE_RATE_THRESHOLD
}
fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}
fn default_database_path() -> PathBuf {
    PathBuf::from("fishfarm.db")
}
fn default_pool_size() -> usize {
    DEFAULT_POOL_SIZE
}
fn default_busy_timeout_ms() -> u64 {
    DEFAULT_BUSY_TIMEOUT_MS
}
fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}
fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}
fn default_retry_delay_ms() -> u64 {
    DEFAULT_RETRY_DELAY_MS
}

impl EtlConfig {
    /// Read `path`, apply `ETL_*` environment overrides and validate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            EtlError::Config(format!("Failed to read config file '{}': {}", path.display(), e))
        })?;

        let mut config = Self::from_toml_str(&content)?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| EtlError::Config(format!("invalid config: {e}")))
    }

    /// Apply overrides from a key lookup (the process environment in practice).
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(locator) = lookup("ETL_SOURCE_LOCATOR") {
            self.source.locator = locator;
        }
        if let Some(path) = lookup("ETL_DATABASE_PATH") {
            self.destination.database_path = PathBuf::from(path);
        }
        if let Some(raw) = lookup("ETL_CHUNK_SIZE") {
            self.load.chunk_size = parse_override("ETL_CHUNK_SIZE", &raw)?;
        }
        if let Some(raw) = lookup("ETL_FAILURE_RATE_THRESHOLD") {
            self.failure_rate_threshold = parse_override("ETL_FAILURE_RATE_THRESHOLD", &raw)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.source.locator.trim().is_empty() {
            return Err(EtlError::Config(
                "source.locator is not set (config or ETL_SOURCE_LOCATOR)".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.failure_rate_threshold) {
            return Err(EtlError::Config(format!(
                "failure_rate_threshold must be within [0, 1], got {}",
                self.failure_rate_threshold
            )));
        }
        if self.load.chunk_size == 0 {
            return Err(EtlError::Config("load.chunk_size must be positive".to_string()));
        }
        if self.destination.pool_size == 0 {
            return Err(EtlError::Config(
                "destination.pool_size must be positive".to_string(),
            ));
        }
        for name in self.pipelines.keys() {
            name.parse::<RecordType>()?;
        }
        for (name, schema) in &self.schemas {
            name.parse::<RecordType>()?;
            schema.validate()?;
        }
        Ok(())
    }

    pub fn load_settings(&self) -> LoadSettings {
        LoadSettings {
            chunk_size: self.load.chunk_size,
            max_retries: self.load.max_retries,
            retry_delay: Duration::from_millis(self.load.retry_delay_ms.min(MAX_RETRY_DELAY_MS)),
        }
    }

    pub fn cleaner_options(&self) -> CleanerOptions {
        CleanerOptions {
            day_first: self.day_first,
            enum_matching: self.enum_matching,
        }
    }

    pub fn runner(&self) -> PipelineRunner {
        PipelineRunner::new(self.failure_rate_threshold, self.require_rows)
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.destination.busy_timeout_ms)
    }

    pub fn worksheet_for(&self, record_type: RecordType) -> WorksheetSelector {
        self.pipelines
            .get(record_type.name())
            .and_then(|p| p.worksheet.clone())
            .unwrap_or_else(|| record_type.default_worksheet())
    }

    pub fn schema_for(&self, record_type: RecordType) -> TableSchema {
        self.schemas
            .get(record_type.name())
            .cloned()
            .unwrap_or_else(|| record_type.schema())
    }

    pub fn is_enabled(&self, record_type: RecordType) -> bool {
        self.pipelines
            .get(record_type.name())
            .map_or(true, |p| p.enabled)
    }
}

fn parse_override<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e| EtlError::Config(format!("{key}='{raw}' is invalid: {e}")))
}

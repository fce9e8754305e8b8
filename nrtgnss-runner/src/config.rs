//! Pipeline configuration, loaded once from TOML and passed by reference.
//!
//! ```toml
//! catalog = "providers.toml"
//!
//! [paths]
//! ledger = "/var/lib/nrtgnss/ledger.sqlite"
//! downloads = "/data/nrt"
//!
//! [acquisition]
//! workers = 8
//!
//! [category.hourly_data]
//! stations = ["abmf", "zimm"]
//! too_late_latency_hours = 6
//! ```
//!
//! Relative paths are resolved against the directory of the config file.

use chrono::Duration;
use nrtgnss_core::acquisition::{AcquisitionConfig, RetryPolicy};
use nrtgnss_core::circuit_breaker::CircuitBreaker;
use nrtgnss_core::consensus::ConsensusParams;
use nrtgnss_core::ledger::Category;
use nrtgnss_core::stacking::{ArchiveLayout, StackingConfig, StackingScheme};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Content hash of the configuration plus provider catalog.
pub type RunId = String;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid config TOML: {0}")]
    Parse(String),

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("category '{0}' is not configured")]
    MissingCategory(Category),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathsConfig {
    pub ledger: PathBuf,
    pub downloads: PathBuf,
    #[serde(default = "default_archive")]
    pub archive: PathBuf,
    #[serde(default = "default_scratch")]
    pub scratch: PathBuf,
    #[serde(default = "default_positions")]
    pub positions: PathBuf,
    #[serde(default = "default_output")]
    pub output: PathBuf,
    /// Where run summaries are written.
    #[serde(default = "default_runs")]
    pub runs: PathBuf,
}

fn default_archive() -> PathBuf {
    PathBuf::from("archive")
}

fn default_scratch() -> PathBuf {
    PathBuf::from("scratch")
}

fn default_positions() -> PathBuf {
    PathBuf::from("positions")
}

fn default_output() -> PathBuf {
    PathBuf::from("crd")
}

fn default_runs() -> PathBuf {
    PathBuf::from("runs")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionSettings {
    pub workers: usize,
    pub max_retries: u32,
    pub retry_delay_secs: u64,
    pub min_artifact_bytes: u64,
    /// Claims older than this are considered abandoned by a crashed run.
    pub claim_stale_secs: i64,
    pub breaker_cooldown_secs: u64,
    pub breaker_threshold: u32,
}

impl Default for AcquisitionSettings {
    fn default() -> Self {
        Self {
            workers: 4,
            max_retries: 3,
            retry_delay_secs: 5,
            min_artifact_bytes: 1,
            claim_stale_secs: 2 * 3600,
            breaker_cooldown_secs: 30 * 60,
            breaker_threshold: 3,
        }
    }
}

/// Per-category schedule. Latencies are explicit named values in hours.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryConfig {
    #[serde(default)]
    pub stations: Vec<String>,
    /// Provider order override; catalog priority order when absent.
    #[serde(default)]
    pub providers: Option<Vec<String>>,
    /// How far behind `now` gap filling stops.
    #[serde(default)]
    pub fill_latency_hours: i64,
    /// Waiting entries older than this become `Too Late`.
    pub too_late_latency_hours: i64,
    /// Ledger entries older than this many days are removed by `cleanup`.
    #[serde(default = "default_keep_days")]
    pub keep_days: u32,
}

fn default_keep_days() -> u32 {
    90
}

impl CategoryConfig {
    pub fn fill_latency(&self) -> Duration {
        Duration::hours(self.fill_latency_hours)
    }

    pub fn too_late_latency(&self) -> Duration {
        Duration::hours(self.too_late_latency_hours)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StackingSettings {
    pub scheme: StackingScheme,
    pub depth: usize,
    pub layout: ArchiveLayout,
    pub prefix: String,
    pub session_suffix: String,
}

impl Default for StackingSettings {
    fn default() -> Self {
        Self {
            scheme: StackingScheme::Hourly,
            depth: 24,
            layout: ArchiveLayout::YearDoy,
            prefix: "P1_".into(),
            session_suffix: "NR".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusSettings {
    /// First day of the position window, in days before today.
    pub window_start_days: u32,
    /// Last day of the position window, in days before today.
    pub window_end_days: u32,
    pub max_iterations: usize,
    pub sigma: f64,
    pub min_samples: usize,
    pub max_std: f64,
}

impl Default for ConsensusSettings {
    fn default() -> Self {
        let params = ConsensusParams::default();
        Self {
            window_start_days: 51,
            window_end_days: 22,
            max_iterations: params.max_iterations,
            sigma: params.sigma,
            min_samples: params.min_samples,
            max_std: params.max_std,
        }
    }
}

/// Complete pipeline configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Provider catalog file.
    pub catalog: PathBuf,
    pub paths: PathsConfig,
    #[serde(default)]
    pub acquisition: AcquisitionSettings,
    #[serde(default, rename = "category")]
    pub categories: BTreeMap<Category, CategoryConfig>,
    #[serde(default)]
    pub stacking: StackingSettings,
    #[serde(default)]
    pub consensus: ConsensusSettings,
}

impl PipelineConfig {
    /// Load, resolve relative paths against the file's directory, validate.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_toml(&content)?;
        if let Some(base) = path.parent() {
            config.resolve_paths(base);
        }
        Ok(config)
    }

    /// Parse and validate a config from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn resolve_paths(&mut self, base: &Path) {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        resolve(&mut self.catalog);
        resolve(&mut self.paths.ledger);
        resolve(&mut self.paths.downloads);
        resolve(&mut self.paths.archive);
        resolve(&mut self.paths.scratch);
        resolve(&mut self.paths.positions);
        resolve(&mut self.paths.output);
        resolve(&mut self.paths.runs);
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let acq = &self.acquisition;
        if acq.workers == 0 {
            return Err(ConfigError::Invalid("acquisition.workers must be at least 1".into()));
        }
        if acq.max_retries == 0 {
            return Err(ConfigError::Invalid("acquisition.max_retries must be at least 1".into()));
        }
        if acq.claim_stale_secs <= 0 {
            return Err(ConfigError::Invalid("acquisition.claim_stale_secs must be positive".into()));
        }
        for (category, cfg) in &self.categories {
            if cfg.fill_latency_hours < 0 || cfg.too_late_latency_hours < 0 {
                return Err(ConfigError::Invalid(format!("{category}: latencies must not be negative")));
            }
            if let Some(bad) = cfg
                .stations
                .iter()
                .find(|s| s.len() != 4 || !s.chars().all(|c| c.is_ascii_alphanumeric()))
            {
                return Err(ConfigError::Invalid(format!(
                    "{category}: station id '{bad}' must be 4 alphanumeric characters"
                )));
            }
        }
        let cons = &self.consensus;
        if cons.window_start_days < cons.window_end_days {
            return Err(ConfigError::Invalid(
                "consensus.window_start_days must not be less than window_end_days".into(),
            ));
        }
        if cons.sigma <= 0.0 || cons.max_std <= 0.0 {
            return Err(ConfigError::Invalid("consensus.sigma and max_std must be positive".into()));
        }
        if self.stacking.depth == 0 {
            return Err(ConfigError::Invalid("stacking.depth must be at least 1".into()));
        }
        Ok(())
    }

    pub fn category(&self, category: Category) -> Result<&CategoryConfig, ConfigError> {
        self.categories
            .get(&category)
            .ok_or(ConfigError::MissingCategory(category))
    }

    /// Deterministic hash of this config and the catalog fingerprint.
    pub fn run_id(&self, catalog_fingerprint: &str) -> RunId {
        let json = serde_json::to_string(self).unwrap_or_default();
        let mut hasher = blake3::Hasher::new();
        hasher.update(json.as_bytes());
        hasher.update(catalog_fingerprint.as_bytes());
        hasher.finalize().to_hex().to_string()
    }

    pub fn acquisition_config(&self) -> AcquisitionConfig {
        AcquisitionConfig {
            download_root: self.paths.downloads.clone(),
            retry: RetryPolicy {
                max_retries: self.acquisition.max_retries,
                retry_delay: std::time::Duration::from_secs(self.acquisition.retry_delay_secs),
            },
            min_artifact_bytes: self.acquisition.min_artifact_bytes,
        }
    }

    pub fn breaker(&self) -> CircuitBreaker {
        CircuitBreaker::new(
            std::time::Duration::from_secs(self.acquisition.breaker_cooldown_secs),
            self.acquisition.breaker_threshold,
        )
    }

    pub fn claim_stale_after(&self) -> Duration {
        Duration::seconds(self.acquisition.claim_stale_secs)
    }

    pub fn stacking_config(&self) -> StackingConfig {
        StackingConfig {
            archive_root: self.paths.archive.clone(),
            layout: self.stacking.layout,
            prefix: self.stacking.prefix.clone(),
            session_suffix: self.stacking.session_suffix.clone(),
        }
    }

    pub fn consensus_params(&self) -> ConsensusParams {
        ConsensusParams {
            max_iterations: self.consensus.max_iterations,
            sigma: self.consensus.sigma,
            min_samples: self.consensus.min_samples,
            max_std: self.consensus.max_std,
        }
    }
}

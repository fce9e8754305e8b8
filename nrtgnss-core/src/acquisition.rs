//! Acquisition engine: resolve a (station, time-key) task against providers
//! in priority order, retry, fall back, and report one uniform outcome.
//!
//! Behaviour per task:
//! - an existing non-empty artifact at the canonical path short-circuits with
//!   provider `"cached"` and no network traffic
//! - providers that do not serve the task's granularity are skipped without
//!   spending an attempt, as are providers whose circuit breaker is open
//! - each provider gets up to `max_retries` attempts, `retry_delay` apart;
//!   "not found" moves on to the next provider immediately
//! - the first successful, validated transfer wins
//! - exhaustion is a failed outcome, never an error

use crate::catalog::{ArtifactKind, ProviderDescriptor};
use crate::circuit_breaker::CircuitBreaker;
use crate::compress::{self, Compression};
use crate::template::wildcard_match;
use crate::timekey::{Granularity, TimeKey};
use crate::transport::{join_remote, Transport, TransportError, TransportRegistry};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Provider tag reported for artifacts already on disk.
pub const CACHED_PROVIDER: &str = "cached";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TaskError {
    #[error("station id '{0}' must be 4 alphanumeric characters")]
    InvalidStation(String),
}

/// One unit of work: fetch the `kind` artifact of `station` for `key`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AcquisitionTask {
    station: String,
    key: TimeKey,
    #[serde(default)]
    kind: ArtifactKind,
}

impl AcquisitionTask {
    pub fn new(station: &str, key: TimeKey) -> Result<Self, TaskError> {
        let station = station.trim();
        if station.len() != 4 || !station.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(TaskError::InvalidStation(station.to_string()));
        }
        Ok(Self {
            station: station.to_ascii_lowercase(),
            key,
            kind: ArtifactKind::Observation,
        })
    }

    pub fn with_kind(mut self, kind: ArtifactKind) -> Self {
        self.kind = kind;
        self
    }

    /// Lowercase station code.
    pub fn station(&self) -> &str {
        &self.station
    }

    pub fn key(&self) -> &TimeKey {
        &self.key
    }

    pub fn granularity(&self) -> Granularity {
        self.key.granularity()
    }

    pub fn kind(&self) -> ArtifactKind {
        self.kind
    }
}

/// Result of one `fetch`. Exactly one per task per invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquisitionOutcome {
    pub task: AcquisitionTask,
    pub success: bool,
    pub local_path: Option<PathBuf>,
    pub attempts: u32,
    /// Provider that delivered the artifact; empty on failure.
    pub provider: String,
    pub elapsed: Duration,
    pub last_error: Option<String>,
    pub size: u64,
}

impl AcquisitionOutcome {
    pub fn is_cached(&self) -> bool {
        self.success && self.provider == CACHED_PROVIDER
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempts per provider (at least one).
    pub max_retries: u32,
    /// Pause between attempts against the same provider.
    pub retry_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AcquisitionConfig {
    pub download_root: PathBuf,
    pub retry: RetryPolicy,
    /// Artifacts smaller than this are treated as failed transfers.
    pub min_artifact_bytes: u64,
}

impl AcquisitionConfig {
    pub fn new(download_root: impl Into<PathBuf>) -> Self {
        Self {
            download_root: download_root.into(),
            retry: RetryPolicy::default(),
            min_artifact_bytes: 1,
        }
    }
}

enum Attempt {
    Fetched(u64),
    NotFound,
}

pub struct AcquisitionEngine {
    config: AcquisitionConfig,
    transports: TransportRegistry,
    breaker: Arc<CircuitBreaker>,
}

impl AcquisitionEngine {
    pub fn new(config: AcquisitionConfig, transports: TransportRegistry) -> Self {
        Self {
            config,
            transports,
            breaker: Arc::new(CircuitBreaker::default_provider()),
        }
    }

    /// Share a breaker across engines (or tune its thresholds).
    pub fn with_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = breaker;
        self
    }

    pub fn config(&self) -> &AcquisitionConfig {
        &self.config
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Canonical destination, see [`canonical_path`].
    pub fn local_path(&self, task: &AcquisitionTask) -> PathBuf {
        canonical_path(&self.config.download_root, task)
    }

    /// Fetch one task, trying `providers` in the given order.
    pub fn fetch(&self, task: &AcquisitionTask, providers: &[&ProviderDescriptor]) -> AcquisitionOutcome {
        let started = Instant::now();
        let dest = self.local_path(task);
        let mut outcome = AcquisitionOutcome {
            task: task.clone(),
            success: false,
            local_path: None,
            attempts: 0,
            provider: String::new(),
            elapsed: Duration::ZERO,
            last_error: None,
            size: 0,
        };

        match fs::metadata(&dest) {
            Ok(meta) if meta.len() > 0 => {
                debug!(station = task.station(), key = %task.key(), kind = %task.kind(), "artifact already on disk");
                outcome.success = true;
                outcome.local_path = Some(dest);
                outcome.provider = CACHED_PROVIDER.to_string();
                outcome.size = meta.len();
                outcome.elapsed = started.elapsed();
                return outcome;
            }
            Ok(_) => {
                let _ = fs::remove_file(&dest);
            }
            Err(_) => {}
        }

        if let Some(parent) = dest.parent() {
            if let Err(e) = fs::create_dir_all(parent) {
                outcome.last_error = Some(format!("create {}: {e}", parent.display()));
                outcome.elapsed = started.elapsed();
                return outcome;
            }
        }

        let granularity = task.granularity();
        let attempts_per_provider = self.config.retry.max_retries.max(1);

        for provider in providers {
            let Some(templates) = provider.templates_for(task.kind(), granularity) else {
                continue;
            };
            if !self.breaker.is_allowed(&provider.name) {
                debug!(provider = %provider.name, "circuit open, skipping provider");
                outcome.last_error = Some(format!("{}: circuit breaker open", provider.name));
                continue;
            }
            let Some(transport) = self.transports.get(&provider.name) else {
                warn!(provider = %provider.name, "no transport configured, skipping provider");
                outcome.last_error = Some(format!("{}: no transport configured", provider.name));
                continue;
            };

            let dir = templates.dir.render(task.key(), task.station());
            let file = templates.file.render(task.key(), task.station());
            let search = templates.file.has_wildcard();

            for attempt in 0..attempts_per_provider {
                if attempt > 0 && !self.config.retry.retry_delay.is_zero() {
                    std::thread::sleep(self.config.retry.retry_delay);
                }
                outcome.attempts += 1;

                match self.attempt(transport.as_ref(), &dir, &file, search, &dest) {
                    Ok(Attempt::Fetched(size)) => {
                        self.breaker.record_success(&provider.name);
                        info!(
                            station = task.station(),
                            key = %task.key(),
                            kind = %task.kind(),
                            provider = %provider.name,
                            bytes = size,
                            "downloaded"
                        );
                        outcome.success = true;
                        outcome.local_path = Some(dest);
                        outcome.provider = provider.name.clone();
                        outcome.size = size;
                        outcome.last_error = None;
                        outcome.elapsed = started.elapsed();
                        return outcome;
                    }
                    Ok(Attempt::NotFound) => {
                        debug!(station = task.station(), provider = %provider.name, dir = %dir, file = %file, "not found");
                        outcome.last_error = Some(format!("{}: {} not found", provider.name, join_remote(&dir, &file)));
                        break;
                    }
                    Err(e) => {
                        debug!(station = task.station(), provider = %provider.name, attempt, error = %e, "attempt failed");
                        outcome.last_error = Some(format!("{}: {e}", provider.name));
                        if e.is_authentication() {
                            warn!(provider = %provider.name, "authentication rejected, disabling provider");
                            self.breaker.trip(&provider.name);
                            break;
                        }
                        if e.is_connection_failure() {
                            self.breaker.record_failure(&provider.name);
                            if !self.breaker.is_allowed(&provider.name) {
                                warn!(provider = %provider.name, "provider unreachable, circuit opened");
                                break;
                            }
                        }
                    }
                }
            }
        }

        outcome.elapsed = started.elapsed();
        outcome
    }

    fn attempt(
        &self,
        transport: &dyn Transport,
        dir: &str,
        file: &str,
        search: bool,
        dest: &Path,
    ) -> Result<Attempt, TransportError> {
        let mut session = transport.connect()?;

        let remote_name = if search {
            let mut matches: Vec<String> = session
                .list(dir)?
                .into_iter()
                .filter(|name| wildcard_match(file, name))
                .collect();
            matches.sort();
            match matches.into_iter().next() {
                Some(name) => name,
                None => return Ok(Attempt::NotFound),
            }
        } else {
            file.to_string()
        };

        let remote = join_remote(dir, &remote_name);
        let part = staging_path(dest, "part");
        if !session.download(&remote, &part)? {
            let _ = fs::remove_file(&part);
            return Ok(Attempt::NotFound);
        }

        self.install(&part, &remote, dest).map(Attempt::Fetched)
    }

    /// Validate a staged transfer and move it into place, unpacking `.gz`
    /// and `.Z` transfers first.
    fn install(&self, part: &Path, remote: &str, dest: &Path) -> Result<u64, TransportError> {
        let compression = Compression::from_name(remote);
        let staged = if compression == Compression::None {
            part.to_path_buf()
        } else {
            let unpacked = staging_path(dest, "unpack");
            let result = compress::unpack(compression, part, &unpacked);
            let _ = fs::remove_file(part);
            if let Err(e) = result {
                let _ = fs::remove_file(&unpacked);
                return Err(TransportError::UnexpectedContent {
                    path: remote.to_string(),
                    reason: format!("{}: {e}", compression.label()),
                });
            }
            unpacked
        };

        let size = fs::metadata(&staged)?.len();
        if size == 0 || size < self.config.min_artifact_bytes {
            let _ = fs::remove_file(&staged);
            return Err(if size == 0 {
                TransportError::Empty(remote.to_string())
            } else {
                TransportError::UnexpectedContent {
                    path: remote.to_string(),
                    reason: format!("{size} bytes is below the {} byte minimum", self.config.min_artifact_bytes),
                }
            });
        }

        if let Err(e) = fs::rename(&staged, dest) {
            let _ = fs::remove_file(&staged);
            return Err(e.into());
        }
        Ok(size)
    }
}

/// Canonical artifact path for `task` under `root`:
/// `<root>/<granularity>/<year>/<doy>/<ssss><ddd><session>.<yy>o` for
/// observations, `<root>/met/<year>/<doy>/<ssss><ddd><session>.<yy>m` for
/// meteorological files.
pub fn canonical_path(root: &Path, task: &AcquisitionTask) -> PathBuf {
    let key = task.key();
    let session = match key.granularity() {
        Granularity::Daily => "0".to_string(),
        Granularity::Hourly => key.hour_char().map(String::from).unwrap_or_default(),
        Granularity::SubHourly => format!(
            "{}{:02}",
            key.hour_char().unwrap_or('a'),
            key.minute().unwrap_or(0)
        ),
    };
    let kind_dir = match task.kind() {
        ArtifactKind::Observation => key.granularity().label(),
        ArtifactKind::Meteorological => "met",
    };
    root.join(kind_dir)
        .join(key.year().to_string())
        .join(format!("{:03}", key.doy()))
        .join(format!(
            "{}{:03}{session}.{:02}{}",
            task.station(),
            key.doy(),
            key.yy(),
            task.kind().type_letter()
        ))
}

fn staging_path(dest: &Path, suffix: &str) -> PathBuf {
    let mut name = dest.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".");
    name.push(suffix);
    dest.with_file_name(name)
}

//! Stacking scheduler: the sliding window of previously computed
//! normal-equation files that feed the next processing run.
//!
//! The window walks back from `now` one native period at a time. Each step
//! names the session directory the earlier run wrote into and the NQ0 file
//! expected there. Gaps are normal (a run may have failed), so missing
//! entries are reported, never fatal.

use crate::compress::gunzip;
use crate::timekey::{Granularity, TimeKey};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum StackingError {
    #[error("cannot create scratch directory {path}: {source}")]
    Scratch {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("cannot copy {from} to {to}: {source}")]
    Copy {
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}

/// Cadence of the processing runs being stacked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StackingScheme {
    Hourly,
    SubHourly,
}

impl StackingScheme {
    pub fn granularity(self) -> Granularity {
        match self {
            StackingScheme::Hourly => Granularity::Hourly,
            StackingScheme::SubHourly => Granularity::SubHourly,
        }
    }
}

/// How session directories are laid out under the archive root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveLayout {
    /// `<archive>/<year>/<doy>/<session>/SOL/`
    #[default]
    YearDoy,
    /// `<archive>/<session>/SOL/`
    Flat,
}

fn default_prefix() -> String {
    "P1_".into()
}

fn default_suffix() -> String {
    "NR".into()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackingConfig {
    pub archive_root: PathBuf,
    #[serde(default)]
    pub layout: ArchiveLayout,
    /// File name prefix of the normal-equation files.
    #[serde(default = "default_prefix")]
    pub prefix: String,
    /// Appended to hourly session names.
    #[serde(default = "default_suffix")]
    pub session_suffix: String,
}

impl StackingConfig {
    pub fn new(archive_root: impl Into<PathBuf>) -> Self {
        Self {
            archive_root: archive_root.into(),
            layout: ArchiveLayout::default(),
            prefix: default_prefix(),
            session_suffix: default_suffix(),
        }
    }
}

/// One step of the window. Derived on demand, never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackingWindowEntry {
    pub key: TimeKey,
    /// Session (working directory) name of the earlier run.
    pub session: String,
    /// Uncompressed file name, e.g. `P1_24260M.NQ0`.
    pub file_name: String,
    /// Compressed path when that exists, else the plain path.
    pub path: PathBuf,
    pub exists: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StackingSummary {
    pub requested: usize,
    pub available: usize,
    pub copied: usize,
    /// File names of window entries that were not found.
    pub missing: Vec<String>,
}

/// Quarter-hour session code: minutes 00, 15, 30, 45 → `0`, `1`, `3`, `4`.
fn quarter_code(quarter: u32) -> char {
    match quarter {
        0 => '0',
        1 => '1',
        2 => '3',
        _ => '4',
    }
}

pub struct StackingScheduler {
    config: StackingConfig,
}

impl StackingScheduler {
    pub fn new(config: StackingConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &StackingConfig {
        &self.config
    }

    /// Session name of the run that processed `key`.
    pub fn session_name(&self, key: &TimeKey) -> String {
        let hour = key.hour_char().unwrap_or('a').to_ascii_uppercase();
        match key.quarter() {
            Some(q) => format!("{:02}{:03}{}{}", key.yy(), key.doy(), hour, quarter_code(q)),
            None => format!("{:02}{:03}{}{}", key.yy(), key.doy(), hour, self.config.session_suffix),
        }
    }

    /// Normal-equation file name written by the run for `key`.
    pub fn file_name(&self, key: &TimeKey) -> String {
        let hour = key.hour_char().unwrap_or('a').to_ascii_uppercase();
        let prefix = &self.config.prefix;
        match key.minute() {
            Some(mm) => format!("{prefix}{:02}{:03}{hour}{mm:02}.NQ0", key.yy(), key.doy()),
            None => format!("{prefix}{:02}{:03}{hour}.NQ0", key.yy(), key.doy()),
        }
    }

    /// `SOL` directory of the session for `key`.
    pub fn solution_dir(&self, key: &TimeKey) -> PathBuf {
        let session = self.session_name(key);
        let root = &self.config.archive_root;
        match self.config.layout {
            ArchiveLayout::YearDoy => root
                .join(key.year().to_string())
                .join(format!("{:03}", key.doy()))
                .join(session)
                .join("SOL"),
            ArchiveLayout::Flat => root.join(session).join("SOL"),
        }
    }

    fn entry_for(&self, key: TimeKey) -> StackingWindowEntry {
        let dir = self.solution_dir(&key);
        let file_name = self.file_name(&key);
        let plain = dir.join(&file_name);
        let compressed = dir.join(format!("{file_name}.gz"));
        let (path, exists) = if compressed.is_file() {
            (compressed, true)
        } else {
            let exists = plain.is_file();
            (plain, exists)
        };
        StackingWindowEntry {
            key,
            session: self.session_name(&key),
            file_name,
            path,
            exists,
        }
    }

    /// The `depth` periods before the one containing `now`, most recent first.
    pub fn window(&self, now: DateTime<Utc>, depth: usize, scheme: StackingScheme) -> Vec<StackingWindowEntry> {
        let current = TimeKey::from_datetime(now, scheme.granularity());
        (1..=depth as i64)
            .map(|i| self.entry_for(current.step(-i)))
            .collect()
    }

    /// Copy every existing entry into `scratch` under its uncompressed
    /// name, gunzipping compressed ones. Missing entries are skipped.
    pub fn assemble(&self, entries: &[StackingWindowEntry], scratch: &Path) -> Result<StackingSummary, StackingError> {
        fs::create_dir_all(scratch).map_err(|source| StackingError::Scratch {
            path: scratch.to_path_buf(),
            source,
        })?;

        let mut summary = StackingSummary {
            requested: entries.len(),
            ..StackingSummary::default()
        };
        for entry in entries {
            if !entry.exists {
                warn!(file = %entry.file_name, session = %entry.session, "stacking entry missing");
                summary.missing.push(entry.file_name.clone());
                continue;
            }
            summary.available += 1;

            let target = scratch.join(&entry.file_name);
            let compressed = entry.path.extension().is_some_and(|ext| ext == "gz");
            let copied = if compressed {
                gunzip(&entry.path, &target).map(|_| ())
            } else {
                fs::copy(&entry.path, &target).map(|_| ())
            };
            copied.map_err(|source| StackingError::Copy {
                from: entry.path.clone(),
                to: target.clone(),
                source,
            })?;
            debug!(file = %entry.file_name, compressed, "stacking entry copied");
            summary.copied += 1;
        }

        info!(
            requested = summary.requested,
            copied = summary.copied,
            missing = summary.missing.len(),
            "stacking window assembled"
        );
        Ok(summary)
    }
}

/// Whether the external processing step left its result `name` in `dir`.
pub fn result_exists(dir: &Path, name: &str) -> bool {
    dir.join(name).is_file()
}

//! Run summary: one JSON document per invocation.
//!
//! Reports per-category counts, the stacking window and the stations that
//! could not be resolved to a consensus coordinate (with reasons). Tagged
//! with the run id so summaries of identical configurations group together.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use nrtgnss_core::ledger::{Category, LedgerStatistics};
use serde::{Deserialize, Serialize};

use crate::jobs::{ConsensusJob, StackingJob};
use crate::orchestrator::CategorySummary;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    /// Subcommand that produced this summary.
    pub command: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub categories: Vec<CategorySummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stacking: Option<StackingJob>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consensus: Option<ConsensusJob>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub status: BTreeMap<Category, LedgerStatistics>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub cleanup: BTreeMap<Category, usize>,
}

impl RunSummary {
    pub fn new(run_id: &str, command: &str, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id: run_id.to_string(),
            command: command.to_string(),
            started_at,
            finished_at: None,
            categories: Vec::new(),
            stacking: None,
            consensus: None,
            status: BTreeMap::new(),
            cleanup: BTreeMap::new(),
        }
    }

    pub fn finish(&mut self, at: DateTime<Utc>) {
        self.finished_at = Some(at);
    }

    /// `<command>-<YYYYmmddTHHMMSSZ>-<run id prefix>.json`
    pub fn file_name(&self) -> String {
        format!(
            "{}-{}-{}.json",
            self.command,
            self.started_at.format("%Y%m%dT%H%M%SZ"),
            &self.run_id[..self.run_id.len().min(12)]
        )
    }

    /// Write into `dir`. Writes are atomic: write to .tmp then rename.
    pub fn write(&self, dir: &Path) -> io::Result<PathBuf> {
        fs::create_dir_all(dir)?;
        let path = dir.join(self.file_name());
        let json = serde_json::to_string_pretty(self).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let tmp_path = path.with_extension("json.tmp");
        fs::write(&tmp_path, json)?;
        if let Err(e) = fs::rename(&tmp_path, &path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(e);
        }
        Ok(path)
    }

    pub fn read(path: &Path) -> io::Result<Self> {
        let content = fs::read_to_string(path)?;
        serde_json::from_str(&content).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

//! Position archive and coordinate output files.
//!
//! The archive is a directory of CSV files with `station,day,x,y,z` rows,
//! one row per station per processed day. When several rows name the same
//! station and day, the last one read wins (files in name order). The consensus job reads a trailing
//! window of it and writes two files per day:
//!
//! - `DNR{yy}{doy}0.CRD.csv`: the day's accepted consensus coordinates
//! - `ANR{yy}{doy}0.CRD.csv`: the same, with stations missing today filled
//!   in from the previous day's DNR file

use crate::consensus::{ConsensusResult, StationPositionSample};
use crate::timekey::day_number_of;
use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("CSV error in {path}: {source}")]
    Csv { path: PathBuf, source: csv::Error },
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> ArchiveError + '_ {
    move |source| ArchiveError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn csv_err(path: &Path) -> impl FnOnce(csv::Error) -> ArchiveError + '_ {
    move |source| ArchiveError::Csv {
        path: path.to_path_buf(),
        source,
    }
}

/// Write `bytes` to `path` via a `.tmp` sibling and an atomic rename.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), ArchiveError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_err(parent))?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, bytes).map_err(io_err(&tmp))?;
    fs::rename(&tmp, path).map_err(|source| {
        let _ = fs::remove_file(&tmp);
        ArchiveError::Io {
            path: path.to_path_buf(),
            source,
        }
    })
}

// ─── Position archive ───────────────────────────────────────────────

/// Samples by station id, each list sorted by day.
pub type SamplesByStation = BTreeMap<String, Vec<StationPositionSample>>;

/// Group samples by station, one per (station, day), sorted by day.
/// A later sample replaces an earlier one for the same day.
pub fn group_by_station(samples: impl IntoIterator<Item = StationPositionSample>) -> SamplesByStation {
    let mut by_day: BTreeMap<String, BTreeMap<i64, StationPositionSample>> = BTreeMap::new();
    for sample in samples {
        by_day
            .entry(sample.station.clone())
            .or_default()
            .insert(sample.day, sample);
    }
    by_day
        .into_iter()
        .map(|(station, days)| (station, days.into_values().collect()))
        .collect()
}

pub struct PositionArchive {
    root: PathBuf,
}

impl PositionArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// CSV files in the archive, sorted by name. A missing archive
    /// directory is empty.
    pub fn files(&self) -> Result<Vec<PathBuf>, ArchiveError> {
        if !self.root.is_dir() {
            return Ok(Vec::new());
        }
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.root).map_err(io_err(&self.root))? {
            let path = entry.map_err(io_err(&self.root))?.path();
            if path.is_file() && path.extension().is_some_and(|ext| ext == "csv") {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    fn read_file(path: &Path) -> Result<Vec<StationPositionSample>, ArchiveError> {
        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_path(path)
            .map_err(csv_err(path))?;
        let mut samples = Vec::new();
        for row in reader.deserialize::<StationPositionSample>() {
            let mut sample = row.map_err(csv_err(path))?;
            sample.station.make_ascii_lowercase();
            samples.push(sample);
        }
        Ok(samples)
    }

    /// Samples whose day lies in `[today − start_days, today − end_days]`.
    pub fn load_window(
        &self,
        now: DateTime<Utc>,
        start_days: u32,
        end_days: u32,
    ) -> Result<SamplesByStation, ArchiveError> {
        let today = day_number_of(now);
        let first = today - i64::from(start_days);
        let last = today - i64::from(end_days);

        let mut kept = Vec::new();
        for path in self.files()? {
            let samples = Self::read_file(&path)?;
            debug!(file = %path.display(), rows = samples.len(), "archive file read");
            kept.extend(samples.into_iter().filter(|s| (first..=last).contains(&s.day)));
        }
        let grouped = group_by_station(kept);
        info!(first, last, stations = grouped.len(), "position window loaded");
        Ok(grouped)
    }
}

// ─── Coordinate output ──────────────────────────────────────────────

/// One row of a DNR / ANR file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinateRecord {
    pub station: String,
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub std_x: f64,
    pub std_y: f64,
    pub std_z: f64,
    pub accepted: usize,
}

impl From<&ConsensusResult> for CoordinateRecord {
    fn from(r: &ConsensusResult) -> Self {
        Self {
            station: r.station.clone(),
            x: r.x,
            y: r.y,
            z: r.z,
            std_x: r.std_x,
            std_y: r.std_y,
            std_z: r.std_z,
            accepted: r.accepted,
        }
    }
}

/// `DNR{yy}{doy}0.CRD.csv`
pub fn daily_file_name(date: NaiveDate) -> String {
    format!("DNR{:02}{:03}0.CRD.csv", date.year().rem_euclid(100), date.ordinal())
}

/// `ANR{yy}{doy}0.CRD.csv`
pub fn combined_file_name(date: NaiveDate) -> String {
    format!("ANR{:02}{:03}0.CRD.csv", date.year().rem_euclid(100), date.ordinal())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CombinedOutput {
    pub path: PathBuf,
    pub stations: usize,
    /// Stations taken from the previous day's file.
    pub filled: Vec<String>,
}

pub struct CoordinateOutput {
    dir: PathBuf,
}

impl CoordinateOutput {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn write_records(path: &Path, records: &[CoordinateRecord]) -> Result<(), ArchiveError> {
        let mut wtr = csv::Writer::from_writer(vec![]);
        wtr.write_record(["station", "x", "y", "z", "std_x", "std_y", "std_z", "accepted"])
            .map_err(csv_err(path))?;
        for r in records {
            wtr.write_record([
                r.station.as_str(),
                &format!("{:.4}", r.x),
                &format!("{:.4}", r.y),
                &format!("{:.4}", r.z),
                &format!("{:.5}", r.std_x),
                &format!("{:.5}", r.std_y),
                &format!("{:.5}", r.std_z),
                &r.accepted.to_string(),
            ])
            .map_err(csv_err(path))?;
        }
        let data = wtr.into_inner().map_err(|e| io_err(path)(e.into_error()))?;
        write_atomic(path, &data)
    }

    pub fn read(path: &Path) -> Result<Vec<CoordinateRecord>, ArchiveError> {
        let mut reader = csv::Reader::from_path(path).map_err(csv_err(path))?;
        reader
            .deserialize::<CoordinateRecord>()
            .map(|row| row.map_err(csv_err(path)))
            .collect()
    }

    /// Write the day's accepted results, sorted by station.
    pub fn write_daily(&self, date: NaiveDate, results: &[ConsensusResult]) -> Result<PathBuf, ArchiveError> {
        let mut records: Vec<CoordinateRecord> = results.iter().map(CoordinateRecord::from).collect();
        records.sort_by(|a, b| a.station.cmp(&b.station));
        let path = self.dir.join(daily_file_name(date));
        Self::write_records(&path, &records)?;
        info!(file = %path.display(), stations = records.len(), "daily coordinates written");
        Ok(path)
    }

    /// Combine the day's DNR file with the previous day's, keeping today's
    /// coordinates and filling stations only present yesterday.
    pub fn write_combined(&self, date: NaiveDate) -> Result<CombinedOutput, ArchiveError> {
        let today_path = self.dir.join(daily_file_name(date));
        let mut combined: BTreeMap<String, CoordinateRecord> = Self::read(&today_path)?
            .into_iter()
            .map(|r| (r.station.clone(), r))
            .collect();

        let previous = date - Duration::days(1);
        let previous_path = self.dir.join(daily_file_name(previous));
        let mut filled = Vec::new();
        if previous_path.is_file() {
            for record in Self::read(&previous_path)? {
                if !combined.contains_key(&record.station) {
                    filled.push(record.station.clone());
                    combined.insert(record.station.clone(), record);
                }
            }
        } else {
            warn!(file = %previous_path.display(), "previous daily coordinates missing, using today only");
        }
        filled.sort();

        let path = self.dir.join(combined_file_name(date));
        let records: Vec<CoordinateRecord> = combined.into_values().collect();
        Self::write_records(&path, &records)?;
        if !filled.is_empty() {
            info!(stations = %filled.join(" "), "filled from previous day");
        }
        Ok(CombinedOutput {
            path,
            stations: records.len(),
            filled,
        })
    }
}

//! The non-acquisition jobs: stacking assembly, coordinate consensus,
//! ledger status and cleanup.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use nrtgnss_core::archive::{ArchiveError, CombinedOutput, CoordinateOutput, PositionArchive};
use nrtgnss_core::consensus::{station_consensus, ConsensusReport, StationRejection};
use nrtgnss_core::ledger::{Category, LedgerError, LedgerStatistics};
use nrtgnss_core::stacking::{StackingError, StackingScheduler, StackingSummary};
use nrtgnss_core::timekey::TimeKey;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::pipeline::Pipeline;

// ── Stacking ─────────────────────────────────────────────────────────

/// Result of assembling the stacking window for one processing run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackingJob {
    /// Session of the run being prepared.
    pub session: String,
    pub scratch: PathBuf,
    pub summary: StackingSummary,
}

// ── Consensus ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusJob {
    pub stations_in_window: usize,
    pub accepted: usize,
    pub rejections: Vec<StationRejection>,
    pub daily_file: PathBuf,
    pub combined: CombinedOutput,
}

impl Pipeline {
    /// Copy the available normal-equation files of the `depth` periods
    /// before `now` into a per-session scratch directory.
    pub fn stack(&self, now: DateTime<Utc>) -> Result<StackingJob, StackingError> {
        let settings = &self.config().stacking;
        let scheduler = StackingScheduler::new(self.config().stacking_config());
        let current = TimeKey::from_datetime(now, settings.scheme.granularity());
        let session = scheduler.session_name(&current);
        let scratch = self.config().paths.scratch.join(&session);

        let window = scheduler.window(now, settings.depth, settings.scheme);
        let summary = scheduler.assemble(&window, &scratch)?;
        if summary.available < summary.requested {
            warn!(
                session = %session,
                available = summary.available,
                requested = summary.requested,
                "partial stacking window"
            );
        }
        info!(session = %session, copied = summary.copied, scratch = %scratch.display(), "stacking window assembled");
        Ok(StackingJob {
            session,
            scratch,
            summary,
        })
    }

    /// Robust station coordinates from the position archive window, written
    /// as today's daily and combined coordinate files.
    pub fn consensus(&self, now: DateTime<Utc>) -> Result<ConsensusJob, ArchiveError> {
        let settings = &self.config().consensus;
        let params = self.config().consensus_params();
        let archive = PositionArchive::new(&self.config().paths.positions);
        let window = archive.load_window(now, settings.window_start_days, settings.window_end_days)?;

        let per_station: Vec<_> = window
            .par_iter()
            .map(|(station, samples)| (station.clone(), station_consensus(station, samples, &params)))
            .collect();

        let mut report = ConsensusReport::default();
        for (station, outcome) in per_station {
            match outcome {
                Ok(result) => report.results.push(result),
                Err(reason) => report.rejections.push(StationRejection { station, reason }),
            }
        }
        report.results.sort_by(|a, b| a.station.cmp(&b.station));
        report.rejections.sort_by(|a, b| a.station.cmp(&b.station));

        for rejection in &report.rejections {
            warn!(station = %rejection.station, reason = %rejection.reason, "no consensus coordinate");
        }

        let date = now.date_naive();
        let output = CoordinateOutput::new(&self.config().paths.output);
        let daily_file = output.write_daily(date, &report.results)?;
        let combined = output.write_combined(date)?;
        info!(
            stations = window.len(),
            accepted = report.results.len(),
            rejected = report.rejected_count(),
            filled = combined.filled.len(),
            "consensus written"
        );

        Ok(ConsensusJob {
            stations_in_window: window.len(),
            accepted: report.results.len(),
            rejections: report.rejections,
            daily_file,
            combined,
        })
    }

    // ── Ledger housekeeping ──────────────────────────────────────────

    /// Status counts for every configured category.
    pub fn status(&self) -> Result<BTreeMap<Category, LedgerStatistics>, LedgerError> {
        self.config()
            .categories
            .keys()
            .map(|&category| Ok((category, self.ledger().statistics(category)?)))
            .collect()
    }

    /// Drop old ledger entries per category. `keep_days` overrides each
    /// category's configured retention.
    pub fn cleanup(&self, now: DateTime<Utc>, keep_days: Option<u32>) -> Result<BTreeMap<Category, usize>, LedgerError> {
        let mut deleted = BTreeMap::new();
        for (&category, cfg) in &self.config().categories {
            let keep = keep_days.unwrap_or(cfg.keep_days);
            let n = self.ledger().cleanup(category, now, keep)?;
            if n > 0 {
                info!(category = %category, deleted = n, keep_days = keep, "ledger cleanup");
            }
            deleted.insert(category, n);
        }
        Ok(deleted)
    }
}

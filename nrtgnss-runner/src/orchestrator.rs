//! Acquisition orchestrator: one category per invocation.
//!
//! 1. `fill_gap`, `maintain`, `grade_lateness` (daily only)
//! 2. take the waiting list between the too-late horizon and the fill cutoff
//! 3. claim each entry in the ledger, then dispatch it to a bounded rayon pool
//! 4. record each outcome (`Downloaded` / `Failed`) and release the claim;
//!    claims a failed release left behind are swept by owner afterwards
//! 5. retire stale expectations with `mark_too_late`
//!
//! Per-task ledger write errors are logged and counted; the run carries on.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use nrtgnss_core::acquisition::{AcquisitionOutcome, AcquisitionTask};
use nrtgnss_core::catalog::{CatalogError, ProviderDescriptor};
use nrtgnss_core::ledger::{Category, LedgerEntry, LedgerError, Scope, WaitingFilter};
use nrtgnss_core::timekey::{mjd_of, TimeKey};
use nrtgnss_core::transport::TransportError;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::{CategoryConfig, ConfigError};
use crate::pipeline::Pipeline;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("transport setup: {0}")]
    Transport(#[from] TransportError),

    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("worker pool: {0}")]
    Pool(String),
}

/// What one `acquire` invocation did to one category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategorySummary {
    pub category: Category,
    /// Entries inserted by `maintain` + `fill_gap`.
    pub created: usize,
    /// Eligible waiting entries before dispatch.
    pub waiting_before: usize,
    pub dispatched: usize,
    pub downloaded: usize,
    /// Subset of `downloaded` already on disk.
    pub cached: usize,
    pub failed: usize,
    pub too_late: usize,
    /// Entries claimed by an overlapping invocation.
    pub skipped_in_flight: usize,
    pub ledger_errors: usize,
    pub bytes: u64,
    pub per_provider: BTreeMap<String, usize>,
    /// Providers whose circuit breaker was open after the pass.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tripped_providers: Vec<String>,
    pub status_after: BTreeMap<String, u64>,
}

impl CategorySummary {
    fn new(category: Category) -> Self {
        Self {
            category,
            created: 0,
            waiting_before: 0,
            dispatched: 0,
            downloaded: 0,
            cached: 0,
            failed: 0,
            too_late: 0,
            skipped_in_flight: 0,
            ledger_errors: 0,
            bytes: 0,
            per_provider: BTreeMap::new(),
            tripped_providers: Vec::new(),
            status_after: BTreeMap::new(),
        }
    }
}

/// One ledger entry and the transfers that satisfy it. A station-scope
/// entry is one transfer; a global entry fans out over the configured
/// stations.
struct WorkUnit {
    station: String,
    key: TimeKey,
    tasks: Vec<AcquisitionTask>,
}

enum UnitOutcome {
    Downloaded {
        provider: String,
        bytes: u64,
        cached: bool,
    },
    Failed,
}

struct UnitReport {
    outcome: UnitOutcome,
    ledger_errors: usize,
}

impl Pipeline {
    /// Run one acquisition pass for `category` at instant `now`.
    pub fn acquire(&self, category: Category, now: DateTime<Utc>) -> Result<CategorySummary, OrchestratorError> {
        let cat_cfg = self.config().category(category)?;
        let providers = self.providers_for(category, cat_cfg)?;
        let stations = &cat_cfg.stations;
        let ledger = self.ledger();
        let mut summary = CategorySummary::new(category);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config().acquisition.workers)
            .build()
            .map_err(|e| OrchestratorError::Pool(e.to_string()))?;

        // Gap filling anchors on each station's newest entry, so it runs
        // before the current period is inserted.
        summary.created += ledger.fill_gap(category, now, cat_cfg.fill_latency(), stations)?;
        summary.created += ledger.maintain(category, now, stations)?;
        if category.graded_lateness() {
            ledger.grade_lateness(category, now)?;
        }

        let granularity = category.granularity();
        let cutoff = TimeKey::from_datetime(now - cat_cfg.fill_latency(), granularity);
        let horizon = now - cat_cfg.too_late_latency();
        let filter = WaitingFilter {
            stations: Some(stations.clone()),
            from_mjd: Some(mjd_of(horizon)),
            until_mjd: Some(cutoff.mjd()),
            limit: None,
        };
        let waiting = ledger.waiting_list(category, &filter)?;
        summary.waiting_before = waiting.len();

        let units = self.claim_units(category, now, cat_cfg, waiting, &mut summary);
        summary.dispatched = units.len();
        info!(
            category = %category,
            created = summary.created,
            waiting = summary.waiting_before,
            dispatched = summary.dispatched,
            providers = providers.len(),
            "acquisition pass starting"
        );

        let reports: Vec<UnitReport> = pool.install(|| {
            units
                .par_iter()
                .map(|unit| self.process_unit(category, unit, &providers))
                .collect()
        });

        for report in reports {
            summary.ledger_errors += report.ledger_errors;
            match report.outcome {
                UnitOutcome::Downloaded { provider, bytes, cached } => {
                    summary.downloaded += 1;
                    summary.bytes += bytes;
                    if cached {
                        summary.cached += 1;
                    }
                    *summary.per_provider.entry(provider).or_insert(0) += 1;
                }
                UnitOutcome::Failed => summary.failed += 1,
            }
        }

        match ledger.release_owner(category, self.owner()) {
            Ok(0) => {}
            Ok(n) => warn!(category = %category, claims = n, "released leftover claims"),
            Err(e) => {
                error!(category = %category, error = %e, "releasing leftover claims failed");
                summary.ledger_errors += 1;
            }
        }
        summary.tripped_providers = self.engine().breaker().tripped();

        summary.too_late = ledger.mark_too_late(category, now, cat_cfg.too_late_latency())?;
        summary.status_after = ledger.statistics(category)?.by_status;

        info!(
            category = %category,
            downloaded = summary.downloaded,
            cached = summary.cached,
            failed = summary.failed,
            too_late = summary.too_late,
            in_flight = summary.skipped_in_flight,
            bytes = summary.bytes,
            "acquisition pass finished"
        );
        Ok(summary)
    }

    /// Category provider order: explicit override, else the catalog's
    /// providers for the category's artifact kind, by priority.
    fn providers_for(
        &self,
        category: Category,
        cat_cfg: &CategoryConfig,
    ) -> Result<Vec<&ProviderDescriptor>, CatalogError> {
        match &cat_cfg.providers {
            Some(names) => self.catalog().ordered(names),
            None => Ok(self.catalog().serving(category.artifact_kind(), category.granularity())),
        }
    }

    /// Turn waiting entries into claimed work units. Duplicates and entries
    /// held by another invocation are dropped here.
    fn claim_units(
        &self,
        category: Category,
        now: DateTime<Utc>,
        cat_cfg: &CategoryConfig,
        waiting: Vec<LedgerEntry>,
        summary: &mut CategorySummary,
    ) -> Vec<WorkUnit> {
        let stale_after = self.config().claim_stale_after();
        let mut seen = HashSet::new();
        let mut units = Vec::with_capacity(waiting.len());

        for entry in waiting {
            if !seen.insert((entry.station.clone(), entry.key)) {
                continue;
            }
            let tasks = match self.tasks_for(category, cat_cfg, &entry) {
                Some(tasks) => tasks,
                None => continue,
            };
            match self
                .ledger()
                .claim(category, &entry.station, &entry.key, self.owner(), now, stale_after)
            {
                Ok(true) => units.push(WorkUnit {
                    station: entry.station,
                    key: entry.key,
                    tasks,
                }),
                Ok(false) => {
                    debug!(category = %category, station = %entry.station, key = %entry.key, "already in flight");
                    summary.skipped_in_flight += 1;
                }
                Err(e) => {
                    error!(category = %category, station = %entry.station, key = %entry.key, error = %e, "claim failed");
                    summary.ledger_errors += 1;
                }
            }
        }
        units
    }

    fn tasks_for(&self, category: Category, cat_cfg: &CategoryConfig, entry: &LedgerEntry) -> Option<Vec<AcquisitionTask>> {
        let stations: Vec<&str> = match category.scope() {
            Scope::Station => vec![entry.station.as_str()],
            Scope::Global => cat_cfg.stations.iter().map(String::as_str).collect(),
        };
        if stations.is_empty() {
            warn!(category = %category, key = %entry.key, "no stations configured for global entry");
            return None;
        }
        let tasks: Result<Vec<_>, _> = stations
            .into_iter()
            .map(|s| AcquisitionTask::new(s, entry.key).map(|t| t.with_kind(category.artifact_kind())))
            .collect();
        match tasks {
            Ok(tasks) => Some(tasks),
            Err(e) => {
                warn!(category = %category, key = %entry.key, error = %e, "skipping entry");
                None
            }
        }
    }

    /// Fetch every transfer of one unit, then persist the result and drop
    /// the claim. Runs on a pool worker.
    fn process_unit(&self, category: Category, unit: &WorkUnit, providers: &[&ProviderDescriptor]) -> UnitReport {
        let outcomes: Vec<AcquisitionOutcome> = unit
            .tasks
            .iter()
            .map(|task| self.engine().fetch(task, providers))
            .collect();

        let ledger = self.ledger();
        let mut ledger_errors = 0;
        let delivered: Vec<&AcquisitionOutcome> = outcomes.iter().filter(|o| o.success).collect();

        let outcome = match delivered.first() {
            Some(first) => {
                let bytes = delivered.iter().map(|o| o.size).sum();
                // A global entry records the directory holding its artifacts.
                let artifact = match (&first.local_path, unit.tasks.len()) {
                    (Some(path), 1) => path.clone(),
                    (Some(path), _) => path.parent().map(PathBuf::from).unwrap_or_else(|| path.clone()),
                    (None, _) => PathBuf::new(),
                };
                if let Err(e) = ledger.mark_downloaded(category, &unit.station, &unit.key, &artifact, &first.provider, bytes) {
                    error!(category = %category, station = %unit.station, key = %unit.key, error = %e, "mark_downloaded failed");
                    ledger_errors += 1;
                }
                UnitOutcome::Downloaded {
                    provider: first.provider.clone(),
                    bytes,
                    cached: delivered.iter().all(|o| o.is_cached()),
                }
            }
            None => {
                let reason = outcomes.iter().rev().find_map(|o| o.last_error.clone()).unwrap_or_default();
                warn!(category = %category, station = %unit.station, key = %unit.key, reason = %reason, "providers exhausted");
                if let Err(e) = ledger.mark_failed(category, &unit.station, &unit.key) {
                    error!(category = %category, station = %unit.station, key = %unit.key, error = %e, "mark_failed failed");
                    ledger_errors += 1;
                }
                UnitOutcome::Failed
            }
        };

        if let Err(e) = ledger.release(category, &unit.station, &unit.key, self.owner()) {
            error!(category = %category, station = %unit.station, key = %unit.key, error = %e, "release failed");
            ledger_errors += 1;
        }

        UnitReport { outcome, ledger_errors }
    }
}

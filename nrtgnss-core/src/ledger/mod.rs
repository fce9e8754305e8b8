//! Lifecycle tracker: a persisted ledger of expected units.
//!
//! One generic implementation serves every tracked category. A category is
//! only a time-key shape (granularity) and a scope (per station or global);
//! each gets its own table with the same schema.
//!
//! The store is SQLite behind a single `Mutex<Connection>`. Every multi-row
//! transition runs in one transaction, so a concurrent reader never sees a
//! half-applied batch, and a busy timeout lets overlapping cron invocations
//! queue on the file lock instead of failing.

mod category;
mod claims;
mod lifecycle;
mod queries;
mod schema;
mod status;

pub use category::{Category, Scope, UnknownCategory, GLOBAL_SCOPE};
pub use status::{LedgerStatus, UnknownStatus, MAX_GRADED_DAYS};

use crate::timekey::TimeKey;
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;

/// How long a writer waits on a locked database file.
const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger store: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("ledger I/O: {0}")]
    Io(#[from] std::io::Error),

    #[error("ledger lock poisoned")]
    LockPoisoned,
}

/// One expected unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub category: Category,
    /// Lowercase station id, or [`GLOBAL_SCOPE`].
    pub station: String,
    pub key: TimeKey,
    /// Continuous time coordinate (fractional MJD).
    pub mjd: f64,
    pub status: LedgerStatus,
    pub artifact: Option<PathBuf>,
    pub provider: Option<String>,
    pub file_size: Option<u64>,
    pub downloaded_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Selection for [`Ledger::waiting_list`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WaitingFilter {
    /// Restrict to these stations (ignored for global-scope categories).
    pub stations: Option<Vec<String>>,
    /// Inclusive lower bound on the time coordinate.
    pub from_mjd: Option<f64>,
    /// Exclusive upper bound on the time coordinate.
    pub until_mjd: Option<f64>,
    pub limit: Option<usize>,
}

impl WaitingFilter {
    pub fn stations(stations: &[String]) -> Self {
        Self {
            stations: Some(stations.to_vec()),
            ..Self::default()
        }
    }
}

/// Entry counts for one category.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LedgerStatistics {
    pub total: u64,
    /// Stored status text → count.
    pub by_status: BTreeMap<String, u64>,
    /// (downloaded + processed) / total, in percent.
    pub success_rate: f64,
}

impl LedgerStatistics {
    pub fn count(&self, status: LedgerStatus) -> u64 {
        self.by_status.get(&status.as_str()).copied().unwrap_or(0)
    }

    /// Waiting plus every graded-lateness flavour.
    pub fn waiting(&self) -> u64 {
        LedgerStatus::waiting_states()
            .iter()
            .map(|s| self.by_status.get(s).copied().unwrap_or(0))
            .sum()
    }
}

/// The ledger store. Create with [`Ledger::open`] for a file-backed store or
/// [`Ledger::in_memory`] for tests.
pub struct Ledger {
    conn: Mutex<Connection>,
}

impl Ledger {
    /// Open or create the ledger database at `path`.
    pub fn open(path: &Path) -> Result<Self, LedgerError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        Self::init(conn)
    }

    /// In-memory ledger (for testing).
    pub fn in_memory() -> Result<Self, LedgerError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, LedgerError> {
        conn.execute_batch(&schema::create_all())?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock_conn(&self) -> Result<MutexGuard<'_, Connection>, LedgerError> {
        self.conn.lock().map_err(|_| LedgerError::LockPoisoned)
    }
}

/// Audit timestamp stored in `created_at` / `updated_at`.
fn now_stamp() -> String {
    Utc::now().to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_creation_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/ledger.sqlite");
        drop(Ledger::open(&path).unwrap());
        let ledger = Ledger::open(&path).unwrap();
        let stats = ledger.statistics(Category::HourlyData).unwrap();
        assert_eq!(stats.total, 0);
    }

    #[test]
    fn statistics_helpers() {
        let mut stats = LedgerStatistics::default();
        stats.by_status.insert("Waiting".into(), 2);
        stats.by_status.insert("2 days late".into(), 1);
        stats.by_status.insert("Too Late".into(), 4);
        assert_eq!(stats.waiting(), 3);
        assert_eq!(stats.count(LedgerStatus::TooLate), 4);
        assert_eq!(stats.count(LedgerStatus::Processed), 0);
    }
}

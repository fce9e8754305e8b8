//! In-flight claims, so overlapping runs never fetch the same unit twice.

use super::category::Category;
use super::lifecycle::key_columns;
use super::{Ledger, LedgerError};
use crate::timekey::TimeKey;
use chrono::{DateTime, Duration, Utc};
use rusqlite::params;

impl Ledger {
    /// Take the claim on one unit for `owner`. Claims older than
    /// `stale_after` are dropped first, so a crashed run does not block the
    /// unit forever. Returns false when another owner holds it.
    pub fn claim(
        &self,
        category: Category,
        station: &str,
        key: &TimeKey,
        owner: &str,
        now: DateTime<Utc>,
        stale_after: Duration,
    ) -> Result<bool, LedgerError> {
        let (year, doy, hour, quarter) = key_columns(key);
        let scope = category.scope_id(station);
        let conn = self.lock_conn()?;
        let tx = conn.unchecked_transaction()?;
        tx.execute(
            "DELETE FROM in_flight WHERE claimed_at < ?1",
            params![(now - stale_after).timestamp()],
        )?;
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO in_flight \
             (category, station_id, year, doy, hour, quarter, owner, claimed_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![category.label(), scope, year, doy, hour, quarter, owner, now.timestamp()],
        )?;
        let held_by_owner = if inserted == 1 {
            true
        } else {
            let holder: String = tx.query_row(
                "SELECT owner FROM in_flight WHERE category = ?1 AND station_id = ?2 \
                 AND year = ?3 AND doy = ?4 AND hour = ?5 AND quarter = ?6",
                params![category.label(), scope, year, doy, hour, quarter],
                |row| row.get(0),
            )?;
            holder == owner
        };
        tx.commit()?;
        Ok(held_by_owner)
    }

    /// Drop `owner`'s claim on one unit. Returns whether a claim was removed.
    pub fn release(&self, category: Category, station: &str, key: &TimeKey, owner: &str) -> Result<bool, LedgerError> {
        let (year, doy, hour, quarter) = key_columns(key);
        let conn = self.lock_conn()?;
        let removed = conn.execute(
            "DELETE FROM in_flight WHERE category = ?1 AND station_id = ?2 \
             AND year = ?3 AND doy = ?4 AND hour = ?5 AND quarter = ?6 AND owner = ?7",
            params![category.label(), category.scope_id(station), year, doy, hour, quarter, owner],
        )?;
        Ok(removed == 1)
    }

    /// Drop every claim `owner` holds in `category`.
    pub fn release_owner(&self, category: Category, owner: &str) -> Result<usize, LedgerError> {
        let conn = self.lock_conn()?;
        Ok(conn.execute(
            "DELETE FROM in_flight WHERE category = ?1 AND owner = ?2",
            params![category.label(), owner],
        )?)
    }
}

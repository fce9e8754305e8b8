//! Creating, ageing and retiring entries.

use super::category::Category;
use super::status::{LedgerStatus, MAX_GRADED_DAYS};
use super::{now_stamp, Ledger, LedgerError};
use crate::timekey::{day_number_of, mjd_of, TimeKey};
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection};
use std::path::Path;

/// Key columns as stored: absent hour/quarter are 0.
pub(super) fn key_columns(key: &TimeKey) -> (i32, u32, u32, u32) {
    (
        key.year(),
        key.doy(),
        key.hour().unwrap_or(0),
        key.quarter().unwrap_or(0),
    )
}

/// `IN (...)` list of every waiting flavour; the values are our own constants.
pub(super) fn waiting_in() -> String {
    let quoted: Vec<String> = LedgerStatus::waiting_states()
        .iter()
        .map(|s| format!("'{s}'"))
        .collect();
    format!("({})", quoted.join(", "))
}

fn insert_sql(category: Category) -> String {
    format!(
        "INSERT OR IGNORE INTO {} \
         (station_id, year, doy, hour, quarter, mjd, status, created_at, updated_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'Waiting', ?7, ?7)",
        category.table()
    )
}

fn latest_key(conn: &Connection, category: Category, scope: &str) -> Result<Option<TimeKey>, LedgerError> {
    let result = conn.query_row(
        &format!(
            "SELECT year, doy, hour, quarter FROM {} WHERE station_id = ?1 ORDER BY mjd DESC LIMIT 1",
            category.table()
        ),
        params![scope],
        |row| Ok((row.get::<_, i32>(0)?, row.get::<_, u32>(1)?, row.get::<_, u32>(2)?, row.get::<_, u32>(3)?)),
    );
    match result {
        Ok((year, doy, hour, quarter)) => {
            // A row we cannot decode is not a usable anchor; treat the scope as empty.
            Ok(TimeKey::from_columns(category.granularity(), year, doy, hour, quarter).ok())
        }
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

impl Ledger {
    /// Insert a `Waiting` entry for the period containing `now`, once per
    /// station (or once for a global-scope category). Returns rows inserted.
    pub fn maintain(&self, category: Category, now: DateTime<Utc>, stations: &[String]) -> Result<usize, LedgerError> {
        let key = TimeKey::from_datetime(now, category.granularity());
        let (year, doy, hour, quarter) = key_columns(&key);
        let stamp = now_stamp();

        let conn = self.lock_conn()?;
        let tx = conn.unchecked_transaction()?;
        let mut stmt = tx.prepare(&insert_sql(category))?;
        let mut inserted = 0;
        for scope in category.scope_ids(stations) {
            inserted += stmt.execute(params![scope, year, doy, hour, quarter, key.mjd(), stamp])?;
        }
        drop(stmt);
        tx.commit()?;
        Ok(inserted)
    }

    /// Insert every missing `Waiting` entry between each station's most recent
    /// entry and the cutoff `now - latency` (exclusive), stepping by the
    /// category's period. A station with no entries starts one period before
    /// the cutoff. One transaction per call.
    pub fn fill_gap(
        &self,
        category: Category,
        now: DateTime<Utc>,
        latency: Duration,
        stations: &[String],
    ) -> Result<usize, LedgerError> {
        let cutoff = TimeKey::from_datetime(now - latency, category.granularity());
        let stamp = now_stamp();

        let conn = self.lock_conn()?;
        let tx = conn.unchecked_transaction()?;
        let mut inserted = 0;
        {
            let mut stmt = tx.prepare(&insert_sql(category))?;
            for scope in category.scope_ids(stations) {
                let mut key = match latest_key(&tx, category, &scope)? {
                    Some(latest) => latest.next(),
                    None => cutoff.prev(),
                };
                while key < cutoff {
                    let (year, doy, hour, quarter) = key_columns(&key);
                    inserted += stmt.execute(params![scope, year, doy, hour, quarter, key.mjd(), stamp])?;
                    key = key.next();
                }
            }
        }
        tx.commit()?;
        Ok(inserted)
    }

    /// Retire every waiting entry whose time coordinate is older than
    /// `now - latency`. Returns rows transitioned.
    pub fn mark_too_late(&self, category: Category, now: DateTime<Utc>, latency: Duration) -> Result<usize, LedgerError> {
        let threshold = mjd_of(now - latency);
        let conn = self.lock_conn()?;
        let tx = conn.unchecked_transaction()?;
        let changed = tx.execute(
            &format!(
                "UPDATE {} SET status = ?1, updated_at = ?2 WHERE status IN {} AND mjd < ?3",
                category.table(),
                waiting_in()
            ),
            params![LedgerStatus::TooLate.as_str(), now_stamp(), threshold],
        )?;
        tx.commit()?;
        Ok(changed)
    }

    /// Label waiting entries `1 day late` .. `3 days late` by how many whole
    /// days have passed since their time coordinate. No-op for categories
    /// without graded lateness.
    pub fn grade_lateness(&self, category: Category, now: DateTime<Utc>) -> Result<usize, LedgerError> {
        if !category.graded_lateness() {
            return Ok(0);
        }
        let current = mjd_of(now);
        let stamp = now_stamp();
        let conn = self.lock_conn()?;
        let tx = conn.unchecked_transaction()?;
        let mut updated = 0;
        {
            let mut stmt = tx.prepare(&format!(
                "UPDATE {} SET status = ?1, updated_at = ?2 \
                 WHERE status IN {} AND mjd > ?3 AND mjd <= ?4",
                category.table(),
                waiting_in()
            ))?;
            for days in 1..=MAX_GRADED_DAYS {
                let max = current - f64::from(days);
                let min = max - 1.0;
                updated += stmt.execute(params![LedgerStatus::Late(days).as_str(), stamp, min, max])?;
            }
        }
        tx.commit()?;
        Ok(updated)
    }

    fn transition(
        &self,
        category: Category,
        station: &str,
        key: &TimeKey,
        to: LedgerStatus,
        from_sql: &str,
    ) -> Result<bool, LedgerError> {
        let (year, doy, hour, quarter) = key_columns(key);
        let conn = self.lock_conn()?;
        let changed = conn.execute(
            &format!(
                "UPDATE {} SET status = ?1, updated_at = ?2 \
                 WHERE station_id = ?3 AND year = ?4 AND doy = ?5 AND hour = ?6 AND quarter = ?7 \
                 AND status IN {from_sql}",
                category.table()
            ),
            params![to.as_str(), now_stamp(), category.scope_id(station), year, doy, hour, quarter],
        )?;
        Ok(changed == 1)
    }

    /// `Waiting → Downloaded`, recording the artifact. Returns false when the
    /// entry is absent or already past waiting.
    pub fn mark_downloaded(
        &self,
        category: Category,
        station: &str,
        key: &TimeKey,
        artifact: &Path,
        provider: &str,
        size: u64,
    ) -> Result<bool, LedgerError> {
        let (year, doy, hour, quarter) = key_columns(key);
        let stamp = now_stamp();
        let conn = self.lock_conn()?;
        let changed = conn.execute(
            &format!(
                "UPDATE {} SET status = ?1, artifact = ?2, provider = ?3, file_size = ?4, \
                 downloaded_at = ?5, updated_at = ?5 \
                 WHERE station_id = ?6 AND year = ?7 AND doy = ?8 AND hour = ?9 AND quarter = ?10 \
                 AND status IN {}",
                category.table(),
                waiting_in()
            ),
            params![
                LedgerStatus::Downloaded.as_str(),
                artifact.to_string_lossy(),
                provider,
                size as i64,
                stamp,
                category.scope_id(station),
                year,
                doy,
                hour,
                quarter
            ],
        )?;
        Ok(changed == 1)
    }

    /// `Downloaded → Processed`.
    pub fn mark_processed(&self, category: Category, station: &str, key: &TimeKey) -> Result<bool, LedgerError> {
        self.transition(category, station, key, LedgerStatus::Processed, "('Downloaded')")
    }

    /// `Waiting → Failed`.
    pub fn mark_failed(&self, category: Category, station: &str, key: &TimeKey) -> Result<bool, LedgerError> {
        self.transition(category, station, key, LedgerStatus::Failed, &waiting_in())
    }

    /// Delete entries whose day is more than `keep_days` before `now`.
    pub fn cleanup(&self, category: Category, now: DateTime<Utc>, keep_days: u32) -> Result<usize, LedgerError> {
        let threshold = (day_number_of(now) - i64::from(keep_days)) as f64;
        let conn = self.lock_conn()?;
        let tx = conn.unchecked_transaction()?;
        let deleted = tx.execute(
            &format!("DELETE FROM {} WHERE mjd < ?1", category.table()),
            params![threshold],
        )?;
        tx.commit()?;
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    fn stations(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn waiting_in_lists_all_flavours() {
        assert_eq!(
            waiting_in(),
            "('Waiting', '1 day late', '2 days late', '3 days late')"
        );
    }

    #[test]
    fn maintain_inserts_once_per_station() {
        let ledger = Ledger::in_memory().unwrap();
        let now = at(2024, 9, 16, 13, 20);
        let ids = stations(&["ABMF", "zimm"]);
        assert_eq!(ledger.maintain(Category::HourlyData, now, &ids).unwrap(), 2);
        assert_eq!(ledger.maintain(Category::HourlyData, now, &ids).unwrap(), 0);
        // Same hour, later minute: same key.
        assert_eq!(ledger.maintain(Category::HourlyData, at(2024, 9, 16, 13, 59), &ids).unwrap(), 0);
    }

    #[test]
    fn global_scope_ignores_station_list() {
        let ledger = Ledger::in_memory().unwrap();
        let now = at(2024, 9, 16, 13, 20);
        assert_eq!(ledger.maintain(Category::Meteorological, now, &stations(&["a", "b"])).unwrap(), 1);
        assert_eq!(ledger.maintain(Category::Meteorological, now, &[]).unwrap(), 0);
    }

    #[test]
    fn fill_gap_for_new_station_starts_one_period_before_cutoff() {
        let ledger = Ledger::in_memory().unwrap();
        let now = at(2024, 9, 16, 13, 0);
        let n = ledger
            .fill_gap(Category::HourlyData, now, Duration::hours(2), &stations(&["abmf"]))
            .unwrap();
        assert_eq!(n, 1);
        let key = TimeKey::hourly(2024, 260, 10).unwrap();
        assert!(ledger.entry(Category::HourlyData, "abmf", &key).unwrap().is_some());
    }

    #[test]
    fn too_late_only_touches_waiting_entries() {
        let ledger = Ledger::in_memory().unwrap();
        let then = at(2024, 9, 10, 0, 0);
        let ids = stations(&["abmf", "zimm"]);
        ledger.maintain(Category::DailyData, then, &ids).unwrap();
        let key = TimeKey::from_datetime(then, Category::DailyData.granularity());
        assert!(ledger
            .mark_downloaded(Category::DailyData, "ABMF", &key, Path::new("/d/abmf"), "CDDIS", 10)
            .unwrap());

        let n = ledger
            .mark_too_late(Category::DailyData, at(2024, 9, 16, 0, 0), Duration::days(3))
            .unwrap();
        assert_eq!(n, 1);
        let abmf = ledger.entry(Category::DailyData, "abmf", &key).unwrap().unwrap();
        let zimm = ledger.entry(Category::DailyData, "zimm", &key).unwrap().unwrap();
        assert_eq!(abmf.status, LedgerStatus::Downloaded);
        assert_eq!(zimm.status, LedgerStatus::TooLate);
    }

    #[test]
    fn transitions_are_idempotent_and_ordered() {
        let ledger = Ledger::in_memory().unwrap();
        let now = at(2024, 9, 16, 13, 0);
        ledger.maintain(Category::HourlyData, now, &stations(&["abmf"])).unwrap();
        let key = TimeKey::from_datetime(now, Category::HourlyData.granularity());

        assert!(!ledger.mark_processed(Category::HourlyData, "abmf", &key).unwrap());
        assert!(ledger
            .mark_downloaded(Category::HourlyData, "abmf", &key, Path::new("/x"), "BKG", 42)
            .unwrap());
        assert!(!ledger
            .mark_downloaded(Category::HourlyData, "abmf", &key, Path::new("/y"), "IGN", 1)
            .unwrap());
        assert!(!ledger.mark_failed(Category::HourlyData, "abmf", &key).unwrap());
        assert!(ledger.mark_processed(Category::HourlyData, "abmf", &key).unwrap());
        assert!(!ledger.mark_processed(Category::HourlyData, "abmf", &key).unwrap());

        let entry = ledger.entry(Category::HourlyData, "abmf", &key).unwrap().unwrap();
        assert_eq!(entry.status, LedgerStatus::Processed);
        assert_eq!(entry.provider.as_deref(), Some("BKG"));
        assert_eq!(entry.file_size, Some(42));
        assert_eq!(entry.artifact.as_deref(), Some(Path::new("/x")));
        assert!(entry.downloaded_at.is_some());
    }

    #[test]
    fn graded_lateness_for_daily_only() {
        let ledger = Ledger::in_memory().unwrap();
        let ids = stations(&["zimm"]);
        for day in [10, 12, 13, 14] {
            ledger.maintain(Category::DailyData, at(2024, 9, day, 0, 0), &ids).unwrap();
        }
        ledger.maintain(Category::HourlyData, at(2024, 9, 10, 0, 0), &ids).unwrap();

        let now = at(2024, 9, 14, 12, 0);
        assert_eq!(ledger.grade_lateness(Category::HourlyData, now).unwrap(), 0);
        assert_eq!(ledger.grade_lateness(Category::DailyData, now).unwrap(), 2);

        let status = |d: u32| {
            let key = TimeKey::from_datetime(at(2024, 9, d, 0, 0), Category::DailyData.granularity());
            ledger.entry(Category::DailyData, "zimm", &key).unwrap().unwrap().status
        };
        assert_eq!(status(14), LedgerStatus::Waiting);
        assert_eq!(status(13), LedgerStatus::Late(1));
        assert_eq!(status(12), LedgerStatus::Late(2));
        // More than three days behind: left for mark_too_late.
        assert_eq!(status(10), LedgerStatus::Waiting);

        // Graded entries are still retired by mark_too_late.
        let retired = ledger.mark_too_late(Category::DailyData, now, Duration::days(2)).unwrap();
        assert_eq!(retired, 2);
        assert_eq!(status(12), LedgerStatus::TooLate);
    }

    #[test]
    fn cleanup_removes_old_entries() {
        let ledger = Ledger::in_memory().unwrap();
        let ids = stations(&["abmf"]);
        ledger.maintain(Category::DailyData, at(2024, 1, 1, 0, 0), &ids).unwrap();
        ledger.maintain(Category::DailyData, at(2024, 9, 1, 0, 0), &ids).unwrap();
        let deleted = ledger.cleanup(Category::DailyData, at(2024, 9, 16, 0, 0), 90).unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(ledger.statistics(Category::DailyData).unwrap().total, 1);
    }
}

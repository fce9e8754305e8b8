//! Read side of the ledger.

use super::category::Category;
use super::lifecycle::{key_columns, waiting_in};
use super::schema::ENTRY_COLUMNS;
use super::status::LedgerStatus;
use super::{Ledger, LedgerEntry, LedgerError, LedgerStatistics, WaitingFilter};
use crate::timekey::TimeKey;
use chrono::{DateTime, Utc};
use rusqlite::types::{Type, Value};
use rusqlite::{params, params_from_iter, Row};
use std::collections::BTreeMap;
use std::path::PathBuf;

fn conversion_error(idx: usize, err: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn parse_stamp(idx: usize, text: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn row_to_entry(category: Category, row: &Row<'_>) -> rusqlite::Result<LedgerEntry> {
    let key = TimeKey::from_columns(
        category.granularity(),
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
    )
    .map_err(|e| rusqlite::Error::FromSqlConversionFailure(1, Type::Integer, Box::new(e)))?;

    let status_text: String = row.get(6)?;
    let status = status_text
        .parse::<LedgerStatus>()
        .map_err(|e| conversion_error(6, e))?;

    let downloaded_at = match row.get::<_, Option<String>>(10)? {
        Some(text) => Some(parse_stamp(10, &text)?),
        None => None,
    };
    let created_at: String = row.get(11)?;
    let updated_at: String = row.get(12)?;

    Ok(LedgerEntry {
        category,
        station: row.get(0)?,
        key,
        mjd: row.get(5)?,
        status,
        artifact: row.get::<_, Option<String>>(7)?.map(PathBuf::from),
        provider: row.get(8)?,
        file_size: row.get::<_, Option<i64>>(9)?.map(|n| n.max(0) as u64),
        downloaded_at,
        created_at: parse_stamp(11, &created_at)?,
        updated_at: parse_stamp(12, &updated_at)?,
    })
}

impl Ledger {
    /// Entries still expected (waiting or graded late), oldest first.
    pub fn waiting_list(&self, category: Category, filter: &WaitingFilter) -> Result<Vec<LedgerEntry>, LedgerError> {
        let mut sql = format!(
            "SELECT {ENTRY_COLUMNS} FROM {} WHERE status IN {}",
            category.table(),
            waiting_in()
        );
        let mut args: Vec<Value> = Vec::new();

        if let Some(stations) = &filter.stations {
            let ids = category.scope_ids(stations);
            if ids.is_empty() {
                return Ok(Vec::new());
            }
            let marks = vec!["?"; ids.len()].join(", ");
            sql.push_str(&format!(" AND station_id IN ({marks})"));
            args.extend(ids.into_iter().map(Value::Text));
        }
        if let Some(from) = filter.from_mjd {
            sql.push_str(" AND mjd >= ?");
            args.push(Value::Real(from));
        }
        if let Some(until) = filter.until_mjd {
            sql.push_str(" AND mjd < ?");
            args.push(Value::Real(until));
        }
        sql.push_str(" ORDER BY mjd ASC, station_id ASC");
        if let Some(limit) = filter.limit {
            sql.push_str(" LIMIT ?");
            args.push(Value::Integer(limit as i64));
        }

        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args), |row| row_to_entry(category, row))?;
        let entries = rows.collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    /// One entry by its identity, if present.
    pub fn entry(&self, category: Category, station: &str, key: &TimeKey) -> Result<Option<LedgerEntry>, LedgerError> {
        let (year, doy, hour, quarter) = key_columns(key);
        let conn = self.lock_conn()?;
        let result = conn.query_row(
            &format!(
                "SELECT {ENTRY_COLUMNS} FROM {} \
                 WHERE station_id = ?1 AND year = ?2 AND doy = ?3 AND hour = ?4 AND quarter = ?5",
                category.table()
            ),
            params![category.scope_id(station), year, doy, hour, quarter],
            |row| row_to_entry(category, row),
        );
        match result {
            Ok(entry) => Ok(Some(entry)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Downloaded entries of one day, ready for downstream processing.
    pub fn entries_for_processing(&self, category: Category, year: i32, doy: u32) -> Result<Vec<LedgerEntry>, LedgerError> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {ENTRY_COLUMNS} FROM {} WHERE year = ?1 AND doy = ?2 AND status = ?3 \
             ORDER BY mjd ASC, station_id ASC",
            category.table()
        ))?;
        let rows = stmt.query_map(
            params![year, doy, LedgerStatus::Downloaded.as_str()],
            |row| row_to_entry(category, row),
        )?;
        let entries = rows.collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    /// Counts per stored status and the download success rate.
    pub fn statistics(&self, category: Category) -> Result<LedgerStatistics, LedgerError> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT status, COUNT(*) FROM {} GROUP BY status",
            category.table()
        ))?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;

        let mut by_status = BTreeMap::new();
        let mut total = 0u64;
        for row in rows {
            let (status, count) = row?;
            let count = count.max(0) as u64;
            total += count;
            by_status.insert(status, count);
        }

        let succeeded: u64 = [LedgerStatus::Downloaded, LedgerStatus::Processed]
            .iter()
            .map(|s| by_status.get(&s.as_str()).copied().unwrap_or(0))
            .sum();
        let success_rate = if total == 0 {
            0.0
        } else {
            succeeded as f64 / total as f64 * 100.0
        };

        Ok(LedgerStatistics {
            total,
            by_status,
            success_rate,
        })
    }
}

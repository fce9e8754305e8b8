//! Idempotent DDL. Every category table shares one layout; absent key
//! fields (hour for daily keys, quarter for hourly ones) are stored as 0.

use super::category::Category;

/// Columns selected by every entry query, in `row_to_entry` order.
pub(super) const ENTRY_COLUMNS: &str = "station_id, year, doy, hour, quarter, mjd, status, \
     artifact, provider, file_size, downloaded_at, created_at, updated_at";

fn category_table(table: &str) -> String {
    format!(
        r"
CREATE TABLE IF NOT EXISTS {table} (
    station_id    TEXT    NOT NULL,
    year          INTEGER NOT NULL,
    doy           INTEGER NOT NULL,
    hour          INTEGER NOT NULL DEFAULT 0,
    quarter       INTEGER NOT NULL DEFAULT 0,
    mjd           REAL    NOT NULL,
    status        TEXT    NOT NULL DEFAULT 'Waiting',
    artifact      TEXT,
    provider      TEXT,
    file_size     INTEGER,
    downloaded_at TEXT,
    created_at    TEXT    NOT NULL,
    updated_at    TEXT    NOT NULL,
    PRIMARY KEY (station_id, year, doy, hour, quarter)
);
CREATE INDEX IF NOT EXISTS idx_{table}_mjd ON {table} (mjd);
CREATE INDEX IF NOT EXISTS idx_{table}_status ON {table} (status);
"
    )
}

const CREATE_CLAIMS: &str = r"
CREATE TABLE IF NOT EXISTS in_flight (
    category      TEXT    NOT NULL,
    station_id    TEXT    NOT NULL,
    year          INTEGER NOT NULL,
    doy           INTEGER NOT NULL,
    hour          INTEGER NOT NULL,
    quarter       INTEGER NOT NULL,
    owner         TEXT    NOT NULL,
    claimed_at    INTEGER NOT NULL,
    PRIMARY KEY (category, station_id, year, doy, hour, quarter)
);
CREATE INDEX IF NOT EXISTS idx_in_flight_owner ON in_flight (owner);
";

pub(super) fn create_all() -> String {
    let mut ddl: String = Category::ALL.iter().map(|c| category_table(c.table())).collect();
    ddl.push_str(CREATE_CLAIMS);
    ddl
}

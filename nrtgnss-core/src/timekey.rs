//! Time keys and granularities.
//!
//! A `TimeKey` identifies one expected unit of data: a day, an hour of a day,
//! or a quarter-hour of a day. Its shape follows the `Granularity` of the
//! category that issued it. Every key maps onto a continuous Modified Julian
//! Date so ledgers can order entries and do latency arithmetic without caring
//! about the key shape.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Offset between `NaiveDate::num_days_from_ce` and the MJD day count
/// (MJD 0 = 1858-11-17).
const MJD_CE_OFFSET: i64 = 678_576;

/// Native cadence of a data category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Hourly,
    Daily,
    #[serde(rename = "subhourly")]
    SubHourly,
}

impl Granularity {
    pub const ALL: [Granularity; 3] = [Granularity::Hourly, Granularity::Daily, Granularity::SubHourly];

    /// Length of one period in minutes.
    pub fn period_minutes(self) -> i64 {
        match self {
            Granularity::Hourly => 60,
            Granularity::Daily => 1440,
            Granularity::SubHourly => 15,
        }
    }

    pub fn period(self) -> Duration {
        Duration::minutes(self.period_minutes())
    }

    /// Lowercase label, also used as a directory name.
    pub fn label(self) -> &'static str {
        match self {
            Granularity::Hourly => "hourly",
            Granularity::Daily => "daily",
            Granularity::SubHourly => "subhourly",
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Granularity {
    type Err = TimeKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "hourly" => Ok(Granularity::Hourly),
            "daily" => Ok(Granularity::Daily),
            "subhourly" | "sub-hourly" | "15min" => Ok(Granularity::SubHourly),
            other => Err(TimeKeyError::UnknownGranularity(other.to_string())),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TimeKeyError {
    #[error("day-of-year {doy} does not exist in {year}")]
    InvalidDayOfYear { year: i32, doy: u32 },

    #[error("hour {0} out of range 0-23")]
    InvalidHour(u32),

    #[error("quarter {0} out of range 0-3")]
    InvalidQuarter(u32),

    #[error("a quarter-hour needs an hour")]
    QuarterWithoutHour,

    #[error("unknown granularity '{0}'")]
    UnknownGranularity(String),
}

/// (year, day-of-year, optional hour, optional quarter-hour).
///
/// Keys are only constructible in valid states, so every accessor is total.
/// Ordering is chronological for keys of the same shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TimeKey {
    date: NaiveDate,
    hour: Option<u8>,
    quarter: Option<u8>,
}

impl TimeKey {
    /// Build and validate a key from its raw fields.
    pub fn new(year: i32, doy: u32, hour: Option<u32>, quarter: Option<u32>) -> Result<Self, TimeKeyError> {
        let date = NaiveDate::from_yo_opt(year, doy).ok_or(TimeKeyError::InvalidDayOfYear { year, doy })?;
        if let Some(h) = hour {
            if h > 23 {
                return Err(TimeKeyError::InvalidHour(h));
            }
        }
        match (hour, quarter) {
            (None, Some(_)) => return Err(TimeKeyError::QuarterWithoutHour),
            (_, Some(q)) if q > 3 => return Err(TimeKeyError::InvalidQuarter(q)),
            _ => {}
        }
        Ok(Self {
            date,
            hour: hour.map(|h| h as u8),
            quarter: quarter.map(|q| q as u8),
        })
    }

    pub fn daily(year: i32, doy: u32) -> Result<Self, TimeKeyError> {
        Self::new(year, doy, None, None)
    }

    pub fn hourly(year: i32, doy: u32, hour: u32) -> Result<Self, TimeKeyError> {
        Self::new(year, doy, Some(hour), None)
    }

    pub fn sub_hourly(year: i32, doy: u32, hour: u32, quarter: u32) -> Result<Self, TimeKeyError> {
        Self::new(year, doy, Some(hour), Some(quarter))
    }

    /// Key of the period of `granularity` that contains `instant` (floored).
    pub fn from_datetime(instant: DateTime<Utc>, granularity: Granularity) -> Self {
        let date = instant.date_naive();
        let hour = instant.hour() as u8;
        let quarter = (instant.minute() / 15) as u8;
        match granularity {
            Granularity::Daily => Self { date, hour: None, quarter: None },
            Granularity::Hourly => Self { date, hour: Some(hour), quarter: None },
            Granularity::SubHourly => Self { date, hour: Some(hour), quarter: Some(quarter) },
        }
    }

    /// Rebuild a key of `granularity` from the raw ledger columns, where absent
    /// fields are stored as zero.
    pub fn from_columns(
        granularity: Granularity,
        year: i32,
        doy: u32,
        hour: u32,
        quarter: u32,
    ) -> Result<Self, TimeKeyError> {
        match granularity {
            Granularity::Daily => Self::daily(year, doy),
            Granularity::Hourly => Self::hourly(year, doy, hour),
            Granularity::SubHourly => Self::sub_hourly(year, doy, hour, quarter),
        }
    }

    pub fn granularity(&self) -> Granularity {
        match (self.hour, self.quarter) {
            (None, _) => Granularity::Daily,
            (Some(_), None) => Granularity::Hourly,
            (Some(_), Some(_)) => Granularity::SubHourly,
        }
    }

    pub fn date(&self) -> NaiveDate {
        self.date
    }

    pub fn year(&self) -> i32 {
        self.date.year()
    }

    pub fn doy(&self) -> u32 {
        self.date.ordinal()
    }

    pub fn hour(&self) -> Option<u32> {
        self.hour.map(u32::from)
    }

    pub fn quarter(&self) -> Option<u32> {
        self.quarter.map(u32::from)
    }

    /// Minute of the hour this key starts at (00, 15, 30, 45), sub-hourly only.
    pub fn minute(&self) -> Option<u32> {
        self.quarter.map(|q| u32::from(q) * 15)
    }

    /// Two-digit year.
    pub fn yy(&self) -> u32 {
        self.date.year().rem_euclid(100) as u32
    }

    /// Hour code `a`..`x`, absent for daily keys.
    pub fn hour_char(&self) -> Option<char> {
        self.hour.map(hour_char)
    }

    fn minute_of_day(&self) -> i64 {
        i64::from(self.hour.unwrap_or(0)) * 60 + i64::from(self.quarter.unwrap_or(0)) * 15
    }

    /// Instant the period starts.
    pub fn start(&self) -> DateTime<Utc> {
        let midnight = self.date.and_time(NaiveTime::default());
        Utc.from_utc_datetime(&midnight) + Duration::minutes(self.minute_of_day())
    }

    /// Integer MJD of the key's day.
    pub fn day_number(&self) -> i64 {
        i64::from(self.date.num_days_from_ce()) - MJD_CE_OFFSET
    }

    /// Continuous time coordinate: fractional MJD of the period start.
    pub fn mjd(&self) -> f64 {
        self.day_number() as f64 + self.minute_of_day() as f64 / 1440.0
    }

    /// The key `n` native periods later (negative `n` steps back).
    pub fn step(&self, n: i64) -> Self {
        let granularity = self.granularity();
        let shifted = self.start() + Duration::minutes(granularity.period_minutes() * n);
        Self::from_datetime(shifted, granularity)
    }

    pub fn next(&self) -> Self {
        self.step(1)
    }

    pub fn prev(&self) -> Self {
        self.step(-1)
    }
}

impl fmt::Display for TimeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{:03}", self.year(), self.doy())?;
        if let Some(h) = self.hour {
            write!(f, "/{h:02}")?;
        }
        if let Some(m) = self.minute() {
            write!(f, ":{m:02}")?;
        }
        Ok(())
    }
}

/// Hour code used in RINEX session names: 0 → `a`, 23 → `x`.
pub fn hour_char(hour: u8) -> char {
    (b'a' + hour.min(23)) as char
}

/// Fractional MJD of an arbitrary instant.
pub fn mjd_of(instant: DateTime<Utc>) -> f64 {
    let day = i64::from(instant.date_naive().num_days_from_ce()) - MJD_CE_OFFSET;
    day as f64 + f64::from(instant.num_seconds_from_midnight()) / 86_400.0
}

/// Integer MJD of an instant's UTC day.
pub fn day_number_of(instant: DateTime<Utc>) -> i64 {
    i64::from(instant.date_naive().num_days_from_ce()) - MJD_CE_OFFSET
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    #[test]
    fn mjd_epoch_and_known_dates() {
        let epoch = TimeKey::from_datetime(at(1858, 11, 17, 0, 0), Granularity::Daily);
        assert_eq!(epoch.day_number(), 0);

        let unix = TimeKey::from_datetime(at(1970, 1, 1, 0, 0), Granularity::Daily);
        assert_eq!(unix.day_number(), 40_587);

        let j2000 = TimeKey::from_datetime(at(2000, 1, 1, 12, 0), Granularity::Hourly);
        assert!((j2000.mjd() - 51_544.5).abs() < 1e-9);
    }

    #[test]
    fn sub_hourly_mjd_includes_quarter() {
        let key = TimeKey::sub_hourly(2024, 260, 6, 3).unwrap();
        let expected = key.day_number() as f64 + (6.0 * 60.0 + 45.0) / 1440.0;
        assert!((key.mjd() - expected).abs() < 1e-12);
        assert_eq!(key.minute(), Some(45));
    }

    #[test]
    fn from_datetime_floors_to_period() {
        let t = at(2024, 9, 16, 13, 52);
        assert_eq!(TimeKey::from_datetime(t, Granularity::Hourly).hour(), Some(13));
        let q = TimeKey::from_datetime(t, Granularity::SubHourly);
        assert_eq!((q.hour(), q.quarter()), (Some(13), Some(3)));
        let d = TimeKey::from_datetime(t, Granularity::Daily);
        assert_eq!(d.doy(), 260);
        assert_eq!(d.hour(), None);
    }

    #[test]
    fn step_crosses_year_boundary() {
        let last = TimeKey::hourly(2023, 365, 23).unwrap();
        let next = last.next();
        assert_eq!((next.year(), next.doy(), next.hour()), (2024, 1, Some(0)));
        assert_eq!(next.prev(), last);

        let leap = TimeKey::daily(2024, 366).unwrap();
        assert_eq!(leap.next(), TimeKey::daily(2025, 1).unwrap());
    }

    #[test]
    fn step_quarter_hours() {
        let key = TimeKey::sub_hourly(2024, 10, 0, 0).unwrap();
        let back = key.step(-1);
        assert_eq!((back.doy(), back.hour(), back.quarter()), (9, Some(23), Some(3)));
        assert_eq!(key.step(5), TimeKey::sub_hourly(2024, 10, 1, 1).unwrap());
    }

    #[test]
    fn validation_rejects_bad_fields() {
        assert_eq!(
            TimeKey::daily(2023, 366),
            Err(TimeKeyError::InvalidDayOfYear { year: 2023, doy: 366 })
        );
        assert_eq!(TimeKey::hourly(2024, 1, 24), Err(TimeKeyError::InvalidHour(24)));
        assert_eq!(TimeKey::sub_hourly(2024, 1, 0, 4), Err(TimeKeyError::InvalidQuarter(4)));
        assert_eq!(TimeKey::new(2024, 1, None, Some(1)), Err(TimeKeyError::QuarterWithoutHour));
    }

    #[test]
    fn hour_codes() {
        assert_eq!(hour_char(0), 'a');
        assert_eq!(hour_char(23), 'x');
    }

    #[test]
    fn display_shapes() {
        assert_eq!(TimeKey::daily(2024, 5).unwrap().to_string(), "2024/005");
        assert_eq!(TimeKey::hourly(2024, 5, 7).unwrap().to_string(), "2024/005/07");
        assert_eq!(TimeKey::sub_hourly(2024, 5, 7, 2).unwrap().to_string(), "2024/005/07:30");
    }

    #[test]
    fn granularity_parses_labels() {
        assert_eq!("hourly".parse::<Granularity>(), Ok(Granularity::Hourly));
        assert_eq!("SubHourly".parse::<Granularity>(), Ok(Granularity::SubHourly));
        assert!("weekly".parse::<Granularity>().is_err());
    }
}

//! The four tracked categories, each a (time-key shape, scope) pair over
//! the same generic ledger table.

use crate::catalog::ArtifactKind;
use crate::timekey::Granularity;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Station id stored for category-wide (global scope) entries.
pub const GLOBAL_SCOPE: &str = "*";

/// Whether a category tracks one unit per station or one per period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Scope {
    Station,
    Global,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    HourlyData,
    DailyData,
    #[serde(rename = "subhourly_data")]
    SubHourlyData,
    Meteorological,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown category '{0}' (expected hourly_data, daily_data, subhourly_data or meteorological)")]
pub struct UnknownCategory(pub String);

impl Category {
    pub const ALL: [Category; 4] = [
        Category::HourlyData,
        Category::DailyData,
        Category::SubHourlyData,
        Category::Meteorological,
    ];

    pub fn granularity(self) -> Granularity {
        match self {
            Category::HourlyData => Granularity::Hourly,
            Category::DailyData => Granularity::Daily,
            Category::SubHourlyData | Category::Meteorological => Granularity::SubHourly,
        }
    }

    pub fn scope(self) -> Scope {
        match self {
            Category::Meteorological => Scope::Global,
            _ => Scope::Station,
        }
    }

    pub fn artifact_kind(self) -> ArtifactKind {
        match self {
            Category::Meteorological => ArtifactKind::Meteorological,
            _ => ArtifactKind::Observation,
        }
    }

    /// Only the daily category reports `N days late`.
    pub fn graded_lateness(self) -> bool {
        self == Category::DailyData
    }

    pub fn table(self) -> &'static str {
        match self {
            Category::HourlyData => "hourly_data",
            Category::DailyData => "daily_data",
            Category::SubHourlyData => "subhourly_data",
            Category::Meteorological => "subhourly_met",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Category::HourlyData => "hourly_data",
            Category::DailyData => "daily_data",
            Category::SubHourlyData => "subhourly_data",
            Category::Meteorological => "meteorological",
        }
    }

    /// Stored station id: lowercase for per-station categories, the global
    /// marker otherwise.
    pub fn scope_id(self, station: &str) -> String {
        match self.scope() {
            Scope::Station => station.trim().to_ascii_lowercase(),
            Scope::Global => GLOBAL_SCOPE.to_string(),
        }
    }

    /// Scope ids an operation over `stations` touches.
    pub fn scope_ids(self, stations: &[String]) -> Vec<String> {
        match self.scope() {
            Scope::Global => vec![GLOBAL_SCOPE.to_string()],
            Scope::Station => {
                let mut ids: Vec<String> = stations.iter().map(|s| self.scope_id(s)).collect();
                ids.sort();
                ids.dedup();
                ids
            }
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Category {
    type Err = UnknownCategory;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "hourly" | "hourly_data" => Ok(Category::HourlyData),
            "daily" | "daily_data" => Ok(Category::DailyData),
            "subhourly" | "subhourly_data" => Ok(Category::SubHourlyData),
            "met" | "meteorological" => Ok(Category::Meteorological),
            other => Err(UnknownCategory(other.to_string())),
        }
    }
}

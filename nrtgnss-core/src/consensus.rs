//! Multi-epoch coordinate consensus with iterative sigma-clipping.
//!
//! Each station's daily position samples are reduced to a mean position
//! after repeatedly discarding samples that lie more than `sigma` standard
//! deviations from the mean on any axis. Stations with too few surviving
//! samples, or whose survivors are still too dispersed, are rejected.
//!
//! The computation is pure and sequential; callers parallelise across
//! stations if they want to.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// One daily position estimate for a station.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StationPositionSample {
    pub station: String,
    /// Integer MJD of the day the position was computed for.
    pub day: i64,
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl StationPositionSample {
    pub fn new(station: &str, day: i64, x: f64, y: f64, z: f64) -> Self {
        Self {
            station: station.to_ascii_lowercase(),
            day,
            x,
            y,
            z,
        }
    }

    fn axes(&self) -> [f64; 3] {
        [self.x, self.y, self.z]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConsensusParams {
    pub max_iterations: usize,
    pub sigma: f64,
    pub min_samples: usize,
    /// Largest acceptable per-axis standard deviation, in metres.
    pub max_std: f64,
}

impl Default for ConsensusParams {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            sigma: 3.0,
            min_samples: 7,
            max_std: 0.010,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusResult {
    pub station: String,
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub std_x: f64,
    pub std_y: f64,
    pub std_z: f64,
    /// Samples that survived clipping.
    pub accepted: usize,
    /// Samples removed as outliers.
    pub rejected: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RejectionReason {
    /// Fewer than two raw samples.
    InsufficientSamples { raw: usize },
    InsufficientRobustSamples { remaining: usize, required: usize },
    ExcessiveDispersion { std: [f64; 3], max_std: f64 },
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectionReason::InsufficientSamples { raw } => {
                write!(f, "only {raw} sample(s) in window")
            }
            RejectionReason::InsufficientRobustSamples { remaining, required } => {
                write!(f, "{remaining} sample(s) after clipping, {required} required")
            }
            RejectionReason::ExcessiveDispersion { std, max_std } => write!(
                f,
                "std ({:.4}, {:.4}, {:.4}) m exceeds {max_std:.4} m",
                std[0], std[1], std[2]
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StationRejection {
    pub station: String,
    pub reason: RejectionReason,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConsensusReport {
    /// Accepted stations, sorted by station id.
    pub results: Vec<ConsensusResult>,
    /// Rejected stations, sorted by station id.
    pub rejections: Vec<StationRejection>,
}

impl ConsensusReport {
    pub fn rejected_count(&self) -> usize {
        self.rejections.len()
    }
}

/// Per-axis mean and sample standard deviation (n − 1).
fn mean_std(samples: &[StationPositionSample]) -> ([f64; 3], [f64; 3]) {
    let n = samples.len() as f64;
    let mut mean = [0.0; 3];
    for s in samples {
        for (m, v) in mean.iter_mut().zip(s.axes()) {
            *m += v;
        }
    }
    mean.iter_mut().for_each(|m| *m /= n);

    let mut std = [0.0; 3];
    if samples.len() > 1 {
        for s in samples {
            for ((acc, v), m) in std.iter_mut().zip(s.axes()).zip(mean) {
                *acc += (v - m).powi(2);
            }
        }
        std.iter_mut().for_each(|acc| *acc = (*acc / (n - 1.0)).sqrt());
    }
    (mean, std)
}

/// Consensus for one station's samples.
pub fn station_consensus(
    station: &str,
    samples: &[StationPositionSample],
    params: &ConsensusParams,
) -> Result<ConsensusResult, RejectionReason> {
    if samples.len() < 2 {
        return Err(RejectionReason::InsufficientSamples { raw: samples.len() });
    }

    let mut kept: Vec<StationPositionSample> = samples.to_vec();
    for _ in 0..params.max_iterations {
        let (mean, std) = mean_std(&kept);
        let threshold = std.map(|s| if s > 0.0 { params.sigma * s } else { f64::INFINITY });
        let before = kept.len();
        kept.retain(|s| {
            s.axes()
                .iter()
                .zip(mean)
                .zip(threshold)
                .all(|((v, m), t)| (v - m).abs() <= t)
        });
        if kept.len() == before || kept.len() < 2 {
            break;
        }
    }

    if kept.is_empty() || kept.len() < params.min_samples {
        return Err(RejectionReason::InsufficientRobustSamples {
            remaining: kept.len(),
            required: params.min_samples,
        });
    }

    let (mean, std) = mean_std(&kept);
    if std.iter().any(|s| *s >= params.max_std) {
        return Err(RejectionReason::ExcessiveDispersion {
            std,
            max_std: params.max_std,
        });
    }

    Ok(ConsensusResult {
        station: station.to_string(),
        x: mean[0],
        y: mean[1],
        z: mean[2],
        std_x: std[0],
        std_y: std[1],
        std_z: std[2],
        accepted: kept.len(),
        rejected: samples.len() - kept.len(),
    })
}

/// Run the consensus for every station, in sorted station order.
pub fn consensus(
    samples_by_station: &BTreeMap<String, Vec<StationPositionSample>>,
    params: &ConsensusParams,
) -> ConsensusReport {
    let mut report = ConsensusReport::default();
    for (station, samples) in samples_by_station {
        match station_consensus(station, samples, params) {
            Ok(result) => report.results.push(result),
            Err(reason) => report.rejections.push(StationRejection {
                station: station.clone(),
                reason,
            }),
        }
    }
    report
}

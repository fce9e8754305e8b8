//! End-to-end runs of the pipeline jobs against in-memory transports.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, TimeZone, Utc};
use nrtgnss_core::catalog::{Protocol, ProviderCatalog};
use nrtgnss_core::consensus::{RejectionReason, StationPositionSample};
use nrtgnss_core::ledger::{Category, Ledger, LedgerStatus};
use nrtgnss_core::timekey::{day_number_of, TimeKey};
use nrtgnss_core::transport::{TransferSession, Transport, TransportError, TransportRegistry};
use nrtgnss_runner::{Pipeline, PipelineConfig, RunSummary};
use tempfile::TempDir;

// ── Fixtures ─────────────────────────────────────────────────────────

/// Serves files from memory and counts connects.
#[derive(Clone, Default)]
struct MemoryTransport {
    files: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    connects: Arc<Mutex<usize>>,
    reject_login: bool,
}

impl MemoryTransport {
    fn with_file(self, remote: &str, bytes: &[u8]) -> Self {
        self.files.lock().unwrap().insert(remote.to_string(), bytes.to_vec());
        self
    }

    fn rejecting_login(mut self) -> Self {
        self.reject_login = true;
        self
    }

    fn connects(&self) -> usize {
        *self.connects.lock().unwrap()
    }
}

impl Transport for MemoryTransport {
    fn protocol(&self) -> Protocol {
        Protocol::Https
    }

    fn host(&self) -> &str {
        "memory"
    }

    fn connect(&self) -> Result<Box<dyn TransferSession>, TransportError> {
        *self.connects.lock().unwrap() += 1;
        if self.reject_login {
            return Err(TransportError::Authentication("memory".into()));
        }
        Ok(Box::new(MemorySession {
            files: Arc::clone(&self.files),
        }))
    }
}

struct MemorySession {
    files: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl TransferSession for MemorySession {
    fn download(&mut self, remote: &str, local: &Path) -> Result<bool, TransportError> {
        match self.files.lock().unwrap().get(remote) {
            Some(bytes) => {
                std::fs::write(local, bytes)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn list(&mut self, _dir: &str) -> Result<Vec<String>, TransportError> {
        Ok(Vec::new())
    }
}

const CATALOG: &str = r#"
[[provider]]
name = "alpha"
protocol = "https"
host = "alpha.example"
priority = 1
hourly = true
subhourly = true
met = true

[provider.templates.hourly]
dir = "/hourly/{year}/{doy}"
file = "{station}{doy}{hour_char}.{yy}o"

[provider.templates.subhourly]
dir = "/highrate/{year}/{doy}"
file = "{station}{doy}{hour_char}{minute}.{yy}o"

[provider.templates.met]
dir = "/met/{year}/{doy}"
file = "{station}{doy}{hour_char}{minute}.{yy}m"

[[provider]]
name = "beta"
protocol = "ftp"
host = "beta.example"
priority = 2
hourly = true

[provider.templates.hourly]
dir = "/pub/{year}/{doy}/{hour}"
file = "{station}{doy}{hour_char}.{yy}o"
"#;

fn config(root: &Path) -> PipelineConfig {
    let toml = format!(
        r#"
catalog = "providers.toml"

[paths]
ledger = "{root}/ledger.sqlite"
downloads = "{root}/nrt"
archive = "{root}/archive"
scratch = "{root}/scratch"
positions = "{root}/positions"
output = "{root}/crd"
runs = "{root}/runs"

[acquisition]
workers = 2
max_retries = 2
retry_delay_secs = 0

[category.hourly_data]
stations = ["abmf", "zimm"]
too_late_latency_hours = 6

[category.subhourly_data]
stations = ["zimm"]
too_late_latency_hours = 3

[category.meteorological]
stations = ["abmf", "zimm"]
too_late_latency_hours = 3

[stacking]
depth = 3
"#,
        root = root.display()
    );
    PipelineConfig::from_toml(&toml).unwrap()
}

fn pipeline(root: &TempDir, alpha: &MemoryTransport, beta: &MemoryTransport) -> Pipeline {
    let catalog = ProviderCatalog::from_toml(CATALOG).unwrap();
    let mut transports = TransportRegistry::new();
    transports.insert("alpha", Arc::new(alpha.clone()));
    transports.insert("beta", Arc::new(beta.clone()));
    Pipeline::from_parts(config(root.path()), catalog, Ledger::in_memory().unwrap(), transports)
}

fn at(h: u32, min: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 9, 16, h, min, 0).unwrap()
}

// ── Acquisition ──────────────────────────────────────────────────────

#[test]
fn first_pass_fetches_the_previous_hour_with_fallback() {
    let root = tempfile::tempdir().unwrap();
    let alpha = MemoryTransport::default().with_file("/hourly/2024/260/abmf260m.24o", b"abmf obs");
    let beta = MemoryTransport::default().with_file("/pub/2024/260/12/zimm260m.24o", b"zimm obs");
    let p = pipeline(&root, &alpha, &beta);

    let summary = p.acquire(Category::HourlyData, at(13, 20)).unwrap();
    // Hour 12 from gap filling, hour 13 from maintain, for both stations.
    assert_eq!(summary.created, 4);
    assert_eq!(summary.waiting_before, 2);
    assert_eq!(summary.dispatched, 2);
    assert_eq!(summary.downloaded, 2);
    assert_eq!(summary.failed, 0);
    assert_eq!(summary.bytes, 16);
    assert_eq!(summary.per_provider.get("alpha"), Some(&1));
    assert_eq!(summary.per_provider.get("beta"), Some(&1));
    assert_eq!(summary.status_after.get("Downloaded"), Some(&2));
    assert_eq!(summary.status_after.get("Waiting"), Some(&2));

    let key = TimeKey::hourly(2024, 260, 12).unwrap();
    let entry = p.ledger().entry(Category::HourlyData, "zimm", &key).unwrap().unwrap();
    assert_eq!(entry.status, LedgerStatus::Downloaded);
    assert_eq!(entry.provider.as_deref(), Some("beta"));
    let artifact = entry.artifact.unwrap();
    assert!(artifact.starts_with(root.path().join("nrt/hourly/2024/260")));
    assert_eq!(std::fs::read(artifact).unwrap(), b"zimm obs");

    // Hour 13 waits for the next pass.
    assert_eq!(p.ledger().waiting_list(Category::HourlyData, &Default::default()).unwrap().len(), 2);
}

#[test]
fn exhausted_entries_fail_and_stale_ones_are_retired() {
    let root = tempfile::tempdir().unwrap();
    let alpha = MemoryTransport::default().with_file("/hourly/2024/260/abmf260m.24o", b"abmf obs");
    let beta = MemoryTransport::default();
    let p = pipeline(&root, &alpha, &beta);

    p.acquire(Category::HourlyData, at(13, 20)).unwrap();
    let summary = p.acquire(Category::HourlyData, at(22, 20)).unwrap();

    // zimm hour 12 failed in the first pass and is not retried.
    // Hours 14..21 are gap-filled; 17..21 are still worth trying.
    assert_eq!(summary.created, 2 * 8 + 2);
    assert_eq!(summary.dispatched, 10);
    assert_eq!(summary.downloaded, 0);
    assert_eq!(summary.failed, 10);
    // Hours 13..16 aged past the six hour horizon untried.
    assert_eq!(summary.too_late, 8);

    let key = TimeKey::hourly(2024, 260, 15).unwrap();
    let entry = p.ledger().entry(Category::HourlyData, "abmf", &key).unwrap().unwrap();
    assert_eq!(entry.status, LedgerStatus::TooLate);
    let stats = p.ledger().statistics(Category::HourlyData).unwrap();
    assert_eq!(stats.count(LedgerStatus::Failed), 11);
    assert_eq!(stats.count(LedgerStatus::Downloaded), 1);
}

#[test]
fn entries_claimed_elsewhere_are_skipped() {
    let root = tempfile::tempdir().unwrap();
    let alpha = MemoryTransport::default()
        .with_file("/hourly/2024/260/abmf260m.24o", b"abmf obs")
        .with_file("/hourly/2024/260/zimm260m.24o", b"zimm obs");
    let beta = MemoryTransport::default();
    let p = pipeline(&root, &alpha, &beta);

    let now = at(13, 20);
    let key = TimeKey::hourly(2024, 260, 12).unwrap();
    p.ledger().fill_gap(Category::HourlyData, now, chrono::Duration::zero(), &["abmf".to_string()]).unwrap();
    assert!(p
        .ledger()
        .claim(Category::HourlyData, "abmf", &key, "other-run", now, chrono::Duration::hours(2))
        .unwrap());

    let summary = p.acquire(Category::HourlyData, now).unwrap();
    assert_eq!(summary.skipped_in_flight, 1);
    assert_eq!(summary.downloaded, 1);
    let abmf = p.ledger().entry(Category::HourlyData, "abmf", &key).unwrap().unwrap();
    assert_eq!(abmf.status, LedgerStatus::Waiting);

    // The other run's claim survives; ours were released.
    assert!(!p
        .ledger()
        .claim(Category::HourlyData, "abmf", &key, p.owner(), now, chrono::Duration::hours(2))
        .unwrap());
    assert!(p
        .ledger()
        .claim(Category::HourlyData, "zimm", &key, "third-run", now, chrono::Duration::hours(2))
        .unwrap());
}

#[test]
fn artifacts_on_disk_are_not_fetched_again() {
    let root = tempfile::tempdir().unwrap();
    let alpha = MemoryTransport::default();
    let beta = MemoryTransport::default();
    let p = pipeline(&root, &alpha, &beta);

    for station in ["abmf", "zimm"] {
        let path = root.path().join(format!("nrt/hourly/2024/260/{station}260m.24o"));
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"already here").unwrap();
    }

    let summary = p.acquire(Category::HourlyData, at(13, 20)).unwrap();
    assert_eq!(summary.downloaded, 2);
    assert_eq!(summary.cached, 2);
    assert_eq!(summary.per_provider.get("cached"), Some(&2));
    assert_eq!(alpha.connects() + beta.connects(), 0);
}

#[test]
fn global_entry_fans_out_over_stations() {
    let root = tempfile::tempdir().unwrap();
    let alpha = MemoryTransport::default()
        .with_file("/met/2024/260/abmf260n00.24m", b"met a")
        .with_file("/met/2024/260/zimm260n00.24m", b"met zz");
    let beta = MemoryTransport::default();
    let p = pipeline(&root, &alpha, &beta);

    let summary = p.acquire(Category::Meteorological, at(13, 20)).unwrap();
    // One entry for 13:00 (gap fill) and one for 13:15 (maintain).
    assert_eq!(summary.created, 2);
    assert_eq!(summary.dispatched, 1);
    assert_eq!(summary.downloaded, 1);
    assert_eq!(summary.bytes, 11);

    let key = TimeKey::sub_hourly(2024, 260, 13, 0).unwrap();
    let entry = p.ledger().entry(Category::Meteorological, "*", &key).unwrap().unwrap();
    assert_eq!(entry.status, LedgerStatus::Downloaded);
    assert_eq!(entry.artifact.unwrap(), root.path().join("nrt/met/2024/260"));
}

#[test]
fn met_and_observation_files_of_one_station_stay_apart() {
    let root = tempfile::tempdir().unwrap();
    let alpha = MemoryTransport::default()
        .with_file("/highrate/2024/260/zimm260n00.24o", b"zimm obs")
        .with_file("/met/2024/260/abmf260n00.24m", b"met a")
        .with_file("/met/2024/260/zimm260n00.24m", b"met zz");
    let beta = MemoryTransport::default();
    let p = pipeline(&root, &alpha, &beta);

    let obs = p.acquire(Category::SubHourlyData, at(13, 20)).unwrap();
    assert_eq!(obs.downloaded, 1);
    let met = p.acquire(Category::Meteorological, at(13, 20)).unwrap();
    assert_eq!(met.downloaded, 1);
    assert_eq!(met.cached, 0, "the observation file must not satisfy the met entry");
    assert_eq!(met.bytes, 11);

    let obs_path = root.path().join("nrt/subhourly/2024/260/zimm260n00.24o");
    let met_path = root.path().join("nrt/met/2024/260/zimm260n00.24m");
    assert_eq!(std::fs::read(obs_path).unwrap(), b"zimm obs");
    assert_eq!(std::fs::read(met_path).unwrap(), b"met zz");
}

#[test]
fn rejected_logins_are_reported_as_tripped() {
    let root = tempfile::tempdir().unwrap();
    let alpha = MemoryTransport::default();
    let beta = MemoryTransport::default().rejecting_login();
    let p = pipeline(&root, &alpha, &beta);

    let summary = p.acquire(Category::HourlyData, at(13, 20)).unwrap();
    assert_eq!(summary.failed, 2);
    assert_eq!(summary.tripped_providers, vec!["beta".to_string()]);
    assert!(beta.connects() >= 1);
}

#[test]
fn a_pass_leaves_no_claims_behind() {
    let root = tempfile::tempdir().unwrap();
    let alpha = MemoryTransport::default().with_file("/hourly/2024/260/abmf260m.24o", b"abmf obs");
    let beta = MemoryTransport::default();
    let p = pipeline(&root, &alpha, &beta);

    let summary = p.acquire(Category::HourlyData, at(13, 20)).unwrap();
    assert_eq!(summary.dispatched, 2);
    assert_eq!(summary.ledger_errors, 0);
    assert_eq!(p.ledger().release_owner(Category::HourlyData, p.owner()).unwrap(), 0);
}

#[test]
fn unconfigured_category_is_a_config_error() {
    let root = tempfile::tempdir().unwrap();
    let p = pipeline(&root, &MemoryTransport::default(), &MemoryTransport::default());
    let err = p.acquire(Category::DailyData, at(13, 20)).unwrap_err();
    assert!(err.to_string().contains("daily_data"), "{err}");
}

// ── Jobs ─────────────────────────────────────────────────────────────

#[test]
fn stacking_job_assembles_into_session_scratch() {
    let root = tempfile::tempdir().unwrap();
    let p = pipeline(&root, &MemoryTransport::default(), &MemoryTransport::default());

    // Only hour 11 of the three-hour window exists.
    let sol = root.path().join("archive/2024/260/24260LNR/SOL");
    std::fs::create_dir_all(&sol).unwrap();
    std::fs::write(sol.join("P1_24260L.NQ0"), b"normal equations").unwrap();

    let job = p.stack(at(13, 20)).unwrap();
    assert_eq!(job.session, "24260NNR");
    assert_eq!(job.scratch, root.path().join("scratch/24260NNR"));
    assert_eq!(job.summary.requested, 3);
    assert_eq!(job.summary.copied, 1);
    assert_eq!(job.summary.missing.len(), 2);
    assert!(job.scratch.join("P1_24260L.NQ0").is_file());
}

#[test]
fn consensus_job_writes_outputs_and_reports_rejections() {
    let root = tempfile::tempdir().unwrap();
    let p = pipeline(&root, &MemoryTransport::default(), &MemoryTransport::default());
    let now = at(6, 0);
    let today = day_number_of(now);

    let mut rows = Vec::new();
    for back in 22..=51 {
        let wobble = ((back % 4) as f64 - 1.5) * 0.001;
        rows.push(StationPositionSample::new("abmf", today - back, 100.0 + wobble, 200.0, 300.0));
        rows.push(StationPositionSample::new("brst", today - back, 10.0 + back as f64, 20.0, 30.0));
    }
    rows.push(StationPositionSample::new("zimm", today - 30, 1.0, 2.0, 3.0));
    let positions = root.path().join("positions");
    std::fs::create_dir_all(&positions).unwrap();
    let mut wtr = csv::Writer::from_path(positions.join("ppp.csv")).unwrap();
    for row in &rows {
        wtr.serialize(row).unwrap();
    }
    wtr.flush().unwrap();

    let job = p.consensus(now).unwrap();
    assert_eq!(job.stations_in_window, 3);
    assert_eq!(job.accepted, 1);
    let reasons: Vec<(&str, &RejectionReason)> =
        job.rejections.iter().map(|r| (r.station.as_str(), &r.reason)).collect();
    assert_eq!(reasons.len(), 2);
    assert_eq!(reasons[0].0, "brst");
    assert!(matches!(reasons[0].1, RejectionReason::ExcessiveDispersion { .. }));
    assert_eq!(reasons[1], ("zimm", &RejectionReason::InsufficientSamples { raw: 1 }));
    assert!(job.daily_file.is_file());
    assert!(job.combined.path.is_file());

    let mut summary = RunSummary::new(p.run_id(), "consensus", now);
    summary.consensus = Some(job);
    summary.finish(now);
    let written = summary.write(&p.config().paths.runs).unwrap();
    let raw = std::fs::read_to_string(written).unwrap();
    assert!(raw.contains("excessive_dispersion"));
    assert!(raw.contains("insufficient_samples"));
}

#[test]
fn status_and_cleanup_cover_configured_categories() {
    let root = tempfile::tempdir().unwrap();
    let p = pipeline(&root, &MemoryTransport::default(), &MemoryTransport::default());
    p.acquire(Category::HourlyData, at(13, 20)).unwrap();

    let status = p.status().unwrap();
    assert_eq!(
        status.keys().copied().collect::<Vec<_>>(),
        vec![Category::HourlyData, Category::SubHourlyData, Category::Meteorological]
    );
    assert_eq!(status[&Category::HourlyData].total, 4);

    let later = at(13, 20) + chrono::Duration::days(10);
    assert_eq!(p.cleanup(later, Some(30)).unwrap()[&Category::HourlyData], 0);
    assert_eq!(p.cleanup(later, Some(5)).unwrap()[&Category::HourlyData], 4);
    assert_eq!(p.ledger().statistics(Category::HourlyData).unwrap().total, 0);
}

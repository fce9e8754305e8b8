use chrono::{TimeZone, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use nrtgnss_core::stacking::{StackingConfig, StackingScheduler, StackingScheme, StackingWindowEntry};
use std::fs;
use std::io::Write;
use std::path::Path;

fn place(entry: &StackingWindowEntry, scheduler: &StackingScheduler, bytes: &[u8], compress: bool) {
    let dir = scheduler.solution_dir(&entry.key);
    fs::create_dir_all(&dir).unwrap();
    if compress {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(bytes).unwrap();
        fs::write(dir.join(format!("{}.gz", entry.file_name)), encoder.finish().unwrap()).unwrap();
    } else {
        fs::write(dir.join(&entry.file_name), bytes).unwrap();
    }
}

#[test]
fn partial_window_copies_what_exists() {
    let archive = tempfile::tempdir().unwrap();
    let scratch = tempfile::tempdir().unwrap();
    let scheduler = StackingScheduler::new(StackingConfig::new(archive.path()));
    let now = Utc.with_ymd_and_hms(2024, 9, 16, 13, 20, 0).unwrap();

    let slots = scheduler.window(now, 4, StackingScheme::Hourly);
    place(&slots[1], &scheduler, b"neq 11", true);
    place(&slots[2], &scheduler, b"neq 10", false);

    let window = scheduler.window(now, 4, StackingScheme::Hourly);
    assert_eq!(window.len(), 4);
    let present: Vec<bool> = window.iter().map(|e| e.exists).collect();
    assert_eq!(present, vec![false, true, true, false]);
    assert_eq!(window[1].file_name, "P1_24260L.NQ0");
    assert!(window[1].path.to_string_lossy().ends_with(".NQ0.gz"));

    let summary = scheduler.assemble(&window, scratch.path()).unwrap();
    assert_eq!(summary.requested, 4);
    assert_eq!(summary.available, 2);
    assert_eq!(summary.copied, 2);
    assert_eq!(summary.missing, vec!["P1_24260M.NQ0", "P1_24260J.NQ0"]);

    assert_eq!(fs::read(scratch.path().join("P1_24260L.NQ0")).unwrap(), b"neq 11");
    assert_eq!(fs::read(scratch.path().join("P1_24260K.NQ0")).unwrap(), b"neq 10");
}

#[test]
fn compressed_copy_is_preferred() {
    let archive = tempfile::tempdir().unwrap();
    let scratch = tempfile::tempdir().unwrap();
    let scheduler = StackingScheduler::new(StackingConfig::new(archive.path()));
    let now = Utc.with_ymd_and_hms(2024, 9, 16, 0, 20, 0).unwrap();

    let window = scheduler.window(now, 1, StackingScheme::SubHourly);
    place(&window[0], &scheduler, b"plain", false);
    place(&window[0], &scheduler, b"packed", true);

    let window = scheduler.window(now, 1, StackingScheme::SubHourly);
    assert_eq!(window[0].session, "24260A0");
    assert_eq!(window[0].file_name, "P1_24260A00.NQ0");
    assert_eq!(window[0].path.extension().unwrap(), "gz");

    scheduler.assemble(&window, scratch.path()).unwrap();
    assert_eq!(fs::read(scratch.path().join("P1_24260A00.NQ0")).unwrap(), b"packed");
}

#[test]
fn empty_archive_is_not_an_error() {
    let scratch = tempfile::tempdir().unwrap();
    let scheduler = StackingScheduler::new(StackingConfig::new(Path::new("/nonexistent/archive")));
    let now = Utc.with_ymd_and_hms(2024, 9, 16, 13, 20, 0).unwrap();

    let window = scheduler.window(now, 3, StackingScheme::Hourly);
    let summary = scheduler.assemble(&window, &scratch.path().join("run")).unwrap();
    assert_eq!(summary.copied, 0);
    assert_eq!(summary.missing.len(), 3);
    assert!(scratch.path().join("run").is_dir());
}

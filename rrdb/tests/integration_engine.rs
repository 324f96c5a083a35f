//! End-to-end tests of the update and fetch pipeline.
//!
//! These tests create databases on disk, feed them samples, reopen them and
//! verify the consolidated values come back out of the archives.

use rrdb::error::{LookupError, RrdError, ValidationError};
use rrdb::{ConsolFun, DsType, FactoryRegistry, FetchRequest, RrdDb, RrdDef};
use tempfile::tempdir;

/// A step-aligned start time for 300s steps.
const START: i64 = 900;

fn registry() -> FactoryRegistry {
    let registry = FactoryRegistry::default();
    registry.set_default("FILE").unwrap();
    registry
}

/// Gauge `temp` with 1-step averages and 2-step maxima.
fn gauge_def(path: &str, version: u32) -> RrdDef {
    let mut def = RrdDef::new(path, START, 300).unwrap();
    def.set_version(version).unwrap();
    def.add_datasource_with("temp", DsType::Gauge, 600, f64::NAN, f64::NAN)
        .unwrap();
    def.add_archive_with(ConsolFun::Average, 0.5, 1, 10).unwrap();
    def.add_archive_with(ConsolFun::Max, 0.5, 2, 10).unwrap();
    def
}

/// Write three samples, reopen, and fetch them back at both resolutions.
#[test]
fn test_gauge_update_fetch_after_reopen() {
    for version in [1, 2] {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("gauge.rrd");
        let path = path.to_str().unwrap();
        let registry = registry();

        let db = RrdDb::create(&gauge_def(path, version), &registry).unwrap();
        db.update(1_200, &[10.0]).unwrap();
        db.update(1_500, &[20.0]).unwrap();
        db.update(1_800, &[30.0]).unwrap();
        db.close().unwrap();

        let db = RrdDb::open_read_only(path, &registry).unwrap();
        assert_eq!(db.version().unwrap(), version);
        assert_eq!(db.last_update_time().unwrap(), 1_800);

        let request = FetchRequest::new(ConsolFun::Average, 1_200, 1_800).unwrap();
        let data = db.fetch(&request).unwrap();
        assert_eq!(data.timestamps(), &[1_200, 1_500, 1_800]);
        assert_eq!(data.values_by_name("temp").unwrap(), &[10.0, 20.0, 30.0]);
        assert_eq!(data.matching_archive(), (ConsolFun::Average, 1));

        // One pre-creation step of the first 600s window is within xff.
        let request = FetchRequest::new(ConsolFun::Max, 1_200, 1_800)
            .unwrap()
            .with_resolution(600)
            .unwrap();
        let data = db.fetch(&request).unwrap();
        assert_eq!(data.step(), 600);
        assert_eq!(data.timestamps(), &[1_200, 1_800]);
        assert_eq!(data.values(0).unwrap(), &[10.0, 30.0]);
    }
}

/// A 32-bit counter wrapping between two samples yields the wrapped delta.
#[test]
fn test_counter_wrap() {
    let temp_dir = tempdir().unwrap();
    let path = temp_dir.path().join("counter.rrd");
    let path = path.to_str().unwrap();
    let registry = registry();

    let mut def = RrdDef::new(path, 0, 1).unwrap();
    def.add_datasource_with("bytes", DsType::Counter, 2, f64::NAN, f64::NAN)
        .unwrap();
    def.add_archive_with(ConsolFun::Last, 0.5, 1, 10).unwrap();
    let db = RrdDb::create(&def, &registry).unwrap();

    db.create_sample(0).set_and_update("1:4294967290").unwrap();
    db.create_sample(0).set_and_update("2:10").unwrap();

    let data = db
        .fetch(&FetchRequest::new(ConsolFun::Last, 1, 2).unwrap())
        .unwrap();
    let values = data.values(0).unwrap();
    assert!(values[0].is_nan(), "first counter sample has no rate");
    assert_eq!(values[1], 16.0);
}

/// Rows become unknown once too many of their steps are unknown.
#[test]
fn test_xff_boundary() {
    let temp_dir = tempdir().unwrap();
    let path = temp_dir.path().join("xff.rrd");
    let path = path.to_str().unwrap();
    let registry = registry();

    let mut def = RrdDef::new(path, 0, 60).unwrap();
    def.add_datasource_with("x", DsType::Gauge, 60, f64::NAN, f64::NAN)
        .unwrap();
    def.add_archive_with(ConsolFun::Average, 0.5, 4, 10).unwrap();
    let db = RrdDb::create(&def, &registry).unwrap();

    // Row [0, 240]: two known steps of four.
    db.update(60, &[4.0]).unwrap();
    db.update(120, &[f64::NAN]).unwrap();
    db.update(180, &[f64::NAN]).unwrap();
    db.update(240, &[8.0]).unwrap();
    // Row [240, 480]: one known step of four.
    db.update(300, &[f64::NAN]).unwrap();
    db.update(360, &[f64::NAN]).unwrap();
    db.update(420, &[f64::NAN]).unwrap();
    db.update(480, &[2.0]).unwrap();

    let data = db
        .fetch(&FetchRequest::new(ConsolFun::Average, 240, 480).unwrap())
        .unwrap();
    let values = data.values(0).unwrap();
    assert_eq!(values[0], 6.0);
    assert!(values[1].is_nan());
}

/// A gap longer than the ring wipes every row it passes.
#[test]
fn test_long_gap_fills_unknown() {
    let temp_dir = tempdir().unwrap();
    let path = temp_dir.path().join("gap.rrd");
    let path = path.to_str().unwrap();
    let registry = registry();

    let db = RrdDb::create(&gauge_def(path, 2), &registry).unwrap();
    db.update(1_200, &[10.0]).unwrap();
    db.update(1_200 + 300 * 20, &[5.0]).unwrap();

    let values = db.archive_values(0, 0).unwrap();
    assert_eq!(values.len(), 10);
    assert!(values.iter().all(|v| v.is_nan()));
    assert_eq!(db.archive(0).unwrap().end_time, 7_200);
}

/// Invalid samples are rejected without changing the database.
#[test]
fn test_rejected_updates_leave_state() {
    let temp_dir = tempdir().unwrap();
    let path = temp_dir.path().join("reject.rrd");
    let path = path.to_str().unwrap();
    let registry = registry();

    let db = RrdDb::create(&gauge_def(path, 2), &registry).unwrap();
    db.update(1_200, &[10.0]).unwrap();

    assert!(matches!(
        db.update(1_200, &[11.0]),
        Err(RrdError::Validation(ValidationError::NonIncreasingTimestamp { .. }))
    ));
    assert!(matches!(
        db.update(1_500, &[1.0, 2.0]),
        Err(RrdError::Validation(ValidationError::ValueCount { .. }))
    ));
    assert_eq!(db.last_update_time().unwrap(), 1_200);
    assert_eq!(db.last_datasource_value("temp").unwrap(), 10.0);

    assert!(matches!(
        db.fetch(&FetchRequest::new(ConsolFun::Total, 0, 1_200).unwrap()),
        Err(RrdError::Lookup(LookupError::NoMatchingArchive { .. }))
    ));
    assert!(matches!(
        db.fetch(&FetchRequest::new(ConsolFun::Average, 0, i64::MAX).unwrap()),
        Err(RrdError::Validation(ValidationError::InvalidFetchRange { .. }))
    ));
    assert_eq!(db.last_update_time().unwrap(), 1_200);
}

/// The reconstructed definition recreates an equivalent database.
#[test]
fn test_rrd_def_recreates_layout() {
    let temp_dir = tempdir().unwrap();
    let path = temp_dir.path().join("orig.rrd");
    let copy = temp_dir.path().join("copy.rrd");
    let registry = registry();

    let db = RrdDb::create(&gauge_def(path.to_str().unwrap(), 1), &registry).unwrap();
    db.update(1_200, &[10.0]).unwrap();

    let mut def = db.rrd_def().unwrap();
    def.path = copy.to_str().unwrap().to_string();
    let clone = RrdDb::create(&def, &registry).unwrap();
    assert_eq!(clone.ds_names().unwrap(), vec!["temp".to_string()]);
    assert_eq!(clone.arc_count(), 2);
    assert_eq!(clone.last_update_time().unwrap(), 1_200);

    db.copy_state_to(&clone).unwrap();
    let bits = |db: &RrdDb| -> Vec<u64> {
        db.archive_values(0, 0)
            .unwrap()
            .iter()
            .map(|v| v.to_bits())
            .collect()
    };
    assert_eq!(bits(&clone), bits(&db));
    assert_eq!(
        std::fs::metadata(&path).unwrap().len(),
        std::fs::metadata(&copy).unwrap().len()
    );
}

//! Integration tests running the engine on every storage backend.

use std::time::Duration;

use rrdb::config::EngineConfig;
use rrdb::error::{BackendError, ConcurrencyError, RrdError};
use rrdb::{ConsolFun, DsType, FactoryRegistry, RrdDb, RrdDef};
use tempfile::tempdir;

fn def(id: &str) -> RrdDef {
    let mut def = RrdDef::new(id, 600, 60).unwrap();
    def.add_datasource_with("rx", DsType::Counter, 120, 0.0, f64::NAN)
        .unwrap();
    // Longer than the fixed name width, so it is relocated to the tail.
    def.add_datasource_with(
        "a_rather_long_datasource_name",
        DsType::Gauge,
        120,
        f64::NAN,
        f64::NAN,
    )
    .unwrap();
    def.add_archive_with(ConsolFun::Average, 0.5, 1, 20).unwrap();
    def.add_archive_with(ConsolFun::Max, 0.5, 4, 5).unwrap();
    def
}

fn feed(db: &RrdDb) {
    for i in 1..=12i32 {
        let time = 600 + 60 * i64::from(i);
        db.update(time, &[1_000.0 * f64::from(i), 0.5 * f64::from(i)]).unwrap();
    }
}

/// Every backend produces byte-identical stores for the same updates.
#[test]
fn test_backends_agree() {
    let temp_dir = tempdir().unwrap();
    let registry = FactoryRegistry::default();
    let ids = [
        format!("file:{}", temp_dir.path().join("a.rrd").display()),
        format!("mmap:{}", temp_dir.path().join("b.rrd").display()),
        format!("lock:{}", temp_dir.path().join("c.rrd").display()),
        "memory:backends-agree".to_string(),
    ];

    let mut images = Vec::new();
    for id in &ids {
        let db = RrdDb::create(&def(id), &registry).unwrap();
        feed(&db);
        db.close().unwrap();

        let db = RrdDb::open_read_only(id, &registry).unwrap();
        assert_eq!(
            db.ds_names().unwrap(),
            vec!["rx".to_string(), "a_rather_long_datasource_name".to_string()],
            "{id}"
        );
        assert_eq!(db.last_update_time().unwrap(), 1_320, "{id}");
        images.push(db.bytes().unwrap());
    }

    for (id, image) in ids.iter().zip(&images).skip(1) {
        assert_eq!(image, &images[0], "{id} differs from the file backend");
    }
}

/// Bare paths go to the default provider and reopen through any file provider.
#[test]
fn test_file_providers_share_format() {
    let temp_dir = tempdir().unwrap();
    let path = temp_dir.path().join("shared.rrd");
    let path = path.to_str().unwrap();
    let registry = FactoryRegistry::default();

    let db = RrdDb::create(&def(path), &registry).unwrap();
    assert_eq!(db.uri().scheme(), "mmap");
    feed(&db);
    db.close().unwrap();

    let db = RrdDb::open(&format!("file:{path}"), &registry).unwrap();
    db.update(1_380, &[13_000.0, 6.5]).unwrap();
    db.close().unwrap();

    let db = RrdDb::open_read_only(&format!("lock:{path}"), &registry).unwrap();
    assert_eq!(db.last_update_time().unwrap(), 1_380);
    assert_eq!(db.last_datasource_values().unwrap(), vec![13_000.0, 6.5]);
}

/// A second locked open fails until the first one closes.
#[test]
fn test_locked_backend_excludes_second_opener() {
    let temp_dir = tempdir().unwrap();
    let mut config = EngineConfig::default();
    config.locked.lock_wait_ms = 100;
    config.locked.lock_retry_ms = 10;
    let registry = FactoryRegistry::from_config(&config).unwrap();
    let id = format!("lock:{}", temp_dir.path().join("locked.rrd").display());

    let first = RrdDb::create(&def(&id), &registry).unwrap();
    let err = RrdDb::open(&id, &registry).unwrap_err();
    match err {
        RrdError::Concurrency(ConcurrencyError::LockTimeout { waited, .. }) => {
            assert!(waited >= Duration::from_millis(100));
        }
        other => panic!("expected a lock timeout, got {other}"),
    }

    first.close().unwrap();
    let second = RrdDb::open(&id, &registry).unwrap();
    assert_eq!(second.ds_count(), 2);
}

/// Missing and foreign resources are reported, never created.
#[test]
fn test_missing_and_corrupt_stores() {
    let temp_dir = tempdir().unwrap();
    let registry = FactoryRegistry::default();

    let missing = temp_dir.path().join("missing.rrd");
    let err = RrdDb::open(missing.to_str().unwrap(), &registry).unwrap_err();
    assert!(matches!(
        err,
        RrdError::Backend(BackendError::NotFound { .. })
    ));
    assert!(!missing.exists());
    assert!(RrdDb::open("memory:never-created", &registry).is_err());

    let garbage = temp_dir.path().join("garbage.rrd");
    std::fs::write(&garbage, vec![b'x'; 512]).unwrap();
    for scheme in ["file", "mmap", "lock"] {
        let id = format!("{scheme}:{}", garbage.display());
        let err = RrdDb::open_read_only(&id, &registry).unwrap_err();
        assert!(matches!(err, RrdError::Corruption(_)), "{scheme}: {err}");
    }

    // A valid signature with an impossible datasource count.
    let inflated = temp_dir.path().join("inflated.rrd");
    let id = format!("file:{}", inflated.display());
    RrdDb::create(&def(&id), &registry).unwrap().close().unwrap();
    let mut bytes = std::fs::read(&inflated).unwrap();
    bytes[48..52].copy_from_slice(&i32::MAX.to_be_bytes());
    std::fs::write(&inflated, bytes).unwrap();
    for scheme in ["file", "mmap", "lock"] {
        let id = format!("{scheme}:{}", inflated.display());
        let err = RrdDb::open(&id, &registry).unwrap_err();
        assert!(matches!(err, RrdError::Corruption(_)), "{scheme}: {err}");
    }
}

/// Deleting a memory store reclaims its buffer.
#[test]
fn test_memory_delete() {
    let registry = FactoryRegistry::default();
    let db = RrdDb::create(&def("memory:deleted"), &registry).unwrap();
    db.close().unwrap();

    let (factory, uri) = registry.resolve("memory:deleted").unwrap();
    assert!(factory.exists(&uri).unwrap());
    factory.delete(&uri).unwrap();
    assert!(!factory.exists(&uri).unwrap());
    assert!(RrdDb::open("memory:deleted", &registry).is_err());
}

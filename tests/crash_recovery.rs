//! Crash-window scenarios: the WAL record is durable but the crash may hit
//! before the ref update, after it, or corrupt the log entirely. Recovery
//! must leave `get` returning either the pre-save or the post-save value,
//! never a mixture.

use chrondb::durability::Wal;
use chrondb::{ChronError, Database, DbConfig, Document};
use serde_json::json;
use std::fs;
use std::io::Write;
use tracing_subscriber::util::SubscriberInitExt;

fn doc(v: serde_json::Value) -> Document {
    Document::from_value(v).unwrap()
}

fn init_logger() {
    let _ = tracing_subscriber::fmt::Subscriber::builder()
        .with_target(false)
        .without_time()
        .with_level(true)
        .with_max_level(tracing::Level::DEBUG)
        .finish()
        .try_init(); // avoid multi-init
}

#[test]
fn record_without_commit_is_replayed_on_reopen() {
    init_logger();
    let dir = tempfile::tempdir().unwrap();
    {
        let db = Database::open(dir.path(), DbConfig::default()).unwrap();
        db.save(doc(json!({"id": "user:1", "v": 1}))).unwrap();
    }

    // Crash after the WAL flush, before the object insert and ref CAS:
    // only the intent record exists.
    {
        let wal = Wal::open(dir.path().join("wal")).unwrap();
        let payload = doc(json!({"id": "user:1", "_table": "user", "v": 2}))
            .to_canonical_json()
            .unwrap();
        wal.append_save("tx-crashed", "main", "user:1", payload).unwrap();
    }

    let db = Database::open(dir.path(), DbConfig::default()).unwrap();
    let fetched = db.get("user:1").unwrap().unwrap();
    assert_eq!(fetched.get("v"), Some(&json!(2)), "replayed the intent");
    // One original save plus one replayed save.
    assert_eq!(db.history("user:1").unwrap().len(), 2);
    // Replay checkpointed the log; a further reopen changes nothing.
    drop(db);
    let db = Database::open(dir.path(), DbConfig::default()).unwrap();
    assert_eq!(db.history("user:1").unwrap().len(), 2);
}

#[test]
fn landed_commit_is_not_replayed_twice() {
    let dir = tempfile::tempdir().unwrap();
    {
        let db = Database::open(dir.path(), DbConfig::default()).unwrap();
        // The write completed (commit + note) but no checkpoint ran before
        // shutdown, so its record is still pending in the WAL.
        db.save(doc(json!({"id": "user:2", "v": 1}))).unwrap();
    }

    let db = Database::open(dir.path(), DbConfig::default()).unwrap();
    assert_eq!(db.history("user:2").unwrap().len(), 1, "no duplicate commit");
    let fetched = db.get("user:2").unwrap().unwrap();
    assert_eq!(fetched.get("v"), Some(&json!(1)));
}

#[test]
fn deleted_tombstone_survives_recovery() {
    let dir = tempfile::tempdir().unwrap();
    {
        let db = Database::open(dir.path(), DbConfig::default()).unwrap();
        db.save(doc(json!({"id": "user:3", "v": 1}))).unwrap();
        db.delete("user:3").unwrap();
    }
    let db = Database::open(dir.path(), DbConfig::default()).unwrap();
    assert!(db.get("user:3").unwrap().is_none());
    assert_eq!(db.history("user:3").unwrap().len(), 2);
}

#[test]
fn torn_tail_is_discarded() {
    let dir = tempfile::tempdir().unwrap();
    {
        let db = Database::open(dir.path(), DbConfig::default()).unwrap();
        db.save(doc(json!({"id": "user:4", "v": 1}))).unwrap();
    }
    // A partial frame at the tail of the newest segment.
    let wal_dir = dir.path().join("wal");
    let segment = fs::read_dir(&wal_dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .find(|p| p.extension().is_some_and(|x| x == "log"))
        .unwrap();
    let mut f = fs::OpenOptions::new().append(true).open(&segment).unwrap();
    f.write_all(&[0x40, 0x00, 0x00, 0x00, 0x01]).unwrap();
    drop(f);

    let db = Database::open(dir.path(), DbConfig::default()).unwrap();
    let fetched = db.get("user:4").unwrap().unwrap();
    assert_eq!(fetched.get("v"), Some(&json!(1)));
}

#[test]
fn corrupt_record_halts_recovery() {
    let dir = tempfile::tempdir().unwrap();
    {
        let db = Database::open(dir.path(), DbConfig::default()).unwrap();
        db.save(doc(json!({"id": "user:5", "v": 1}))).unwrap();
    }
    let wal_dir = dir.path().join("wal");
    let segment = fs::read_dir(&wal_dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .find(|p| p.extension().is_some_and(|x| x == "log"))
        .unwrap();
    let mut bytes = fs::read(&segment).unwrap();
    let mid = bytes.len() / 2;
    bytes[mid] ^= 0xFF;
    fs::write(&segment, &bytes).unwrap();

    let err = Database::open(dir.path(), DbConfig::default()).unwrap_err();
    assert!(matches!(err, ChronError::Corruption { .. }));
}

#[test]
fn wal_disabled_still_works() {
    let dir = tempfile::tempdir().unwrap();
    let config = DbConfig {
        wal_enabled: false,
        ..DbConfig::default()
    };
    let db = Database::open(dir.path(), config.clone()).unwrap();
    db.save(doc(json!({"id": "user:6", "v": 1}))).unwrap();
    drop(db);
    assert!(!dir.path().join("wal").exists());

    let db = Database::open(dir.path(), config).unwrap();
    assert!(db.get("user:6").unwrap().is_some());
}

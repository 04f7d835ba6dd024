use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::*;
use crate::engine::Alarms;
use crate::error::LogError;
use crate::rolling::{NamePattern, NameStyle};
use crate::time::ManualClock;
use crate::PersistAction;

const DAY_SECS: u64 = 86_400;

fn unit_config(max_total_size: u64, header: HeaderKind) -> UnitConfig {
    UnitConfig {
        quota: Quota {
            max_total_size,
            max_age_secs: 90 * DAY_SECS,
            divider_percent: 0,
        },
        header,
        persist_policy: PersistPolicy::Always(PersistAction::Flush),
    }
}

/// A legacy dump whose header declares its own total length.
fn legacy_dump(body_len: usize) -> Vec<u8> {
    let body = vec![b'.'; body_len];
    let mut declared = body_len;
    loop {
        let header = format!("type=core\tsize={declared}\tnode=cp1\n");
        let total = header.len() + body_len;
        if total == declared {
            let mut content = header.into_bytes();
            content.extend_from_slice(&body);
            return content;
        }
        declared = total;
    }
}

fn core_stream(dir: &Path) -> StreamDir {
    let pattern = NamePattern::new("core", Some("dump"), NameStyle::CompactMicro).unwrap();
    StreamDir::new(dir, pattern)
}

fn crash_stream(dir: &Path) -> StreamDir {
    let pattern = NamePattern::new("crash", None, NameStyle::Compact).unwrap();
    StreamDir::new(dir, pattern)
}

fn console_stream(dir: &Path) -> StreamDir {
    let pattern = NamePattern::new("consol", Some("txt"), NameStyle::CompactMicro).unwrap();
    StreamDir::new(dir, pattern)
}

fn write_file(path: &Path, content: &[u8]) -> PathBuf {
    fs::write(path, content).unwrap();
    path.to_path_buf()
}

#[test]
fn test_legacy_header_check() {
    let content = legacy_dump(100);
    assert!(check_legacy_header(&content, content.len() as u64).is_ok());
    assert!(check_legacy_header(&content, content.len() as u64 + 1).is_err());
    assert!(check_legacy_header(b"type=core\tnode=cp1\nbody", 23).is_err());
    assert!(check_legacy_header(b"size=abc\n", 9).is_err());
    assert!(check_legacy_header(&[b'x'; LEGACY_HEADER_MAX_LEN], 600).is_err());
    assert!(check_legacy_header(b"size=7\r\nab", 10).is_err());
    assert!(check_legacy_header(b"size=10\r\nab", 10).is_ok());
}

#[test]
fn test_check_header_on_files() {
    let tmp_dir = tempfile::tempdir().unwrap();
    let valid = write_file(&tmp_dir.path().join("valid"), &legacy_dump(10));
    let invalid = write_file(&tmp_dir.path().join("invalid"), b"size=3\nabcdef");
    assert!(check_header(&valid, HeaderKind::LegacyTabular).unwrap().is_ok());
    let integrity_err = check_header(&invalid, HeaderKind::LegacyTabular)
        .unwrap()
        .unwrap_err();
    assert_eq!(integrity_err.path.as_deref(), Some(invalid.as_path()));
    assert!(check_header(&invalid, HeaderKind::None).unwrap().is_ok());
    assert!(check_header(&invalid, HeaderKind::Framed).unwrap().is_err());
}

#[test]
fn test_unit_set_list_range() {
    let name = |secs: i64| SubfileName::new(TimeValue::from_secs(secs), 0);
    let unit_set = UnitSet::new(vec![
        UnitInfo {
            name: name(30),
            path: PathBuf::from("c"),
            size_bytes: 3,
        },
        UnitInfo {
            name: name(10),
            path: PathBuf::from("a"),
            size_bytes: 1,
        },
        UnitInfo {
            name: name(20),
            path: PathBuf::from("b"),
            size_bytes: 2,
        },
    ]);
    assert_eq!(unit_set.tracked_total_size(), 6);
    assert_eq!(unit_set.units()[0].path, PathBuf::from("a"));
    let period = |start, end| Period::new(TimeValue::from_secs(start), TimeValue::from_secs(end));
    assert_eq!(unit_set.list_range(period(0, 100)), Some(period(10, 30)));
    assert_eq!(unit_set.list_range(period(15, 25)), Some(period(20, 20)));
    assert_eq!(unit_set.list_range(period(31, 40)), None);
}

struct FileLogHarness {
    log: FileLog,
    clock: ManualClock,
    alarms: Alarms,
}

fn open_file_log(dir: &Path, config: UnitConfig) -> FileLogHarness {
    let clock = ManualClock::new(TimeValue::parse_compact("20240301_120000").unwrap());
    let alarms = Alarms::default();
    let mut log = FileLog::new(core_stream(dir), config, Arc::new(clock.clone()), alarms.clone());
    log.open().unwrap();
    FileLogHarness { log, clock, alarms }
}

#[test]
fn test_file_log_insert_moves_file() {
    let stream_dir = tempfile::tempdir().unwrap();
    let inbox = tempfile::tempdir().unwrap();
    let mut harness = open_file_log(
        stream_dir.path(),
        unit_config(1 << 20, HeaderKind::LegacyTabular),
    );
    let source = write_file(&inbox.path().join("dump"), &legacy_dump(100));
    let outcome = harness.log.insert(&source).unwrap();
    assert_eq!(outcome, InsertOutcome::default());
    assert!(!source.exists());
    let units = harness.log.units();
    assert_eq!(units.len(), 1);
    assert_eq!(
        units[0].path,
        stream_dir.path().join("core_20240301_120000_000000.dump")
    );
    assert_eq!(units[0].size_bytes, legacy_dump(100).len() as u64);
    // same microsecond: the name moves one microsecond forward
    let source = write_file(&inbox.path().join("dump"), &legacy_dump(10));
    harness.log.insert(&source).unwrap();
    assert_eq!(
        harness.log.units()[1].path,
        stream_dir.path().join("core_20240301_120000_000001.dump")
    );
    assert_eq!(
        harness.log.read_range(Period::all()).unwrap_err().to_string(),
        "read_range is not supported by file logs"
    );
}

#[test]
fn test_file_log_rejects_bad_header() {
    let stream_dir = tempfile::tempdir().unwrap();
    let mut harness = open_file_log(
        stream_dir.path(),
        unit_config(1 << 20, HeaderKind::LegacyTabular),
    );
    let source = write_file(&stream_dir.path().join("core.tmp"), b"size=1000\ntruncated");
    let err = harness.log.insert(&source).unwrap_err();
    assert!(err.is_integrity());
    assert!(!source.exists());
    assert_eq!(harness.alarms.count(), 1);
    assert!(harness.log.units().is_empty());
}

#[test]
fn test_file_log_evicts_by_age_then_divider() {
    let stream_dir = tempfile::tempdir().unwrap();
    let inbox = tempfile::tempdir().unwrap();
    let mut config = unit_config(300, HeaderKind::None);
    config.quota.divider_percent = 50;
    let mut harness = open_file_log(stream_dir.path(), config);
    for _ in 0..3 {
        harness.clock.advance(1_000_000);
        let source = write_file(&inbox.path().join("dump"), &[0u8; 100]);
        harness.log.insert(&source).unwrap();
    }
    let before = harness.log.units();
    assert_eq!(harness.log.tracked_total_size(), 300);
    harness.clock.advance(1_000_000);
    let source = write_file(&inbox.path().join("dump"), &[0u8; 100]);
    let outcome = harness.log.insert(&source).unwrap();
    assert_eq!(outcome.evicted, 1);
    // ceil(3 * 50 / 100) = 2
    assert!(!before[2].path.exists());
    assert!(before[0].path.exists());
    harness.clock.advance(90 * DAY_SECS as i64 * 1_000_000);
    let source = write_file(&inbox.path().join("dump"), &[0u8; 100]);
    harness.log.insert(&source).unwrap();
    assert!(!before[0].path.exists());
    assert_eq!(harness.log.tracked_total_size(), 300);
}

#[test]
fn test_file_log_open_scans_directory() {
    let stream_dir = tempfile::tempdir().unwrap();
    let dir = stream_dir.path();
    write_file(&dir.join("core_20240101_000000_000000.dump"), &legacy_dump(5));
    write_file(&dir.join("core_20240102_000000_000000.dump"), b"size=1\nbroken");
    write_file(&dir.join("core_2024.dump"), b"unknown");
    write_file(&dir.join("core.tmp"), &legacy_dump(7));
    let harness = open_file_log(dir, unit_config(1 << 20, HeaderKind::LegacyTabular));
    let units = harness.log.units();
    assert_eq!(units.len(), 2);
    assert_eq!(units[0].path, dir.join("core_20240101_000000_000000.dump"));
    assert_eq!(units[1].path, dir.join("core_20240301_120000_000000.dump"));
    assert!(!dir.join("core_20240102_000000_000000.dump").exists());
    assert!(!dir.join("core_2024.dump").exists());
    assert!(!dir.join("core.tmp").exists());
    assert_eq!(harness.alarms.count(), 1);
    assert_eq!(
        harness.log.list_range(Period::all()).unwrap(),
        Some(Period::new(
            TimeValue::parse_compact("20240101_000000").unwrap(),
            TimeValue::parse_compact("20240301_120000").unwrap()
        ))
    );
}

#[test]
fn test_file_log_requires_open() {
    let tmp_dir = tempfile::tempdir().unwrap();
    let mut log = FileLog::new(
        core_stream(tmp_dir.path()),
        unit_config(1 << 20, HeaderKind::None),
        Arc::new(ManualClock::default()),
        Alarms::default(),
    );
    let source = write_file(&tmp_dir.path().join("source"), b"abc");
    assert!(matches!(log.insert(&source), Err(LogError::NotOpen)));
    assert!(matches!(log.list_range(Period::all()), Err(LogError::NotOpen)));
    assert!(source.exists());
}

fn make_bundle(parent: &Path, name: &str, sizes: &[usize]) -> PathBuf {
    let bundle = parent.join(name);
    fs::create_dir_all(bundle.join("logs")).unwrap();
    for (i, size) in sizes.iter().enumerate() {
        fs::write(bundle.join("logs").join(format!("part{i}")), vec![0u8; *size]).unwrap();
    }
    bundle
}

fn directory_log(dir: &Path, max_total_size: u64, clock: &ManualClock) -> DirectoryLog {
    DirectoryLog::new(
        crash_stream(dir),
        unit_config(max_total_size, HeaderKind::None),
        Arc::new(clock.clone()),
        Alarms::default(),
    )
}

#[test]
fn test_directory_log_insert_and_reopen() {
    let stream_dir = tempfile::tempdir().unwrap();
    let inbox = tempfile::tempdir().unwrap();
    let clock = ManualClock::new(TimeValue::parse_compact("20240301_120000").unwrap());
    let log = directory_log(stream_dir.path(), 1 << 20, &clock);
    log.open().unwrap();
    let bundle = make_bundle(inbox.path(), "bundle1", &[10, 20]);
    log.insert(&bundle).unwrap();
    let bundle = make_bundle(inbox.path(), "bundle2", &[5]);
    log.insert(&bundle).unwrap();
    let units = log.units();
    assert_eq!(units.len(), 2);
    assert_eq!(units[0].path, stream_dir.path().join("crash_20240301_120000"));
    assert_eq!(units[1].path, stream_dir.path().join("crash_20240301_120000_1"));
    assert_eq!(log.tracked_total_size(), 35);
    assert!(log.read_range(Period::all()).is_err());
    log.close();
    assert!(!log.is_open());
    fs::write(stream_dir.path().join("stray_file"), b"x").unwrap();
    log.open().unwrap();
    assert_eq!(log.units(), units);
    assert!(!stream_dir.path().join("stray_file").exists());
}

#[test]
fn test_directory_log_rejects_files() {
    let stream_dir = tempfile::tempdir().unwrap();
    let clock = ManualClock::default();
    let log = directory_log(stream_dir.path(), 1 << 20, &clock);
    log.open().unwrap();
    let source = write_file(&stream_dir.path().join("crash.tmp"), b"not a directory");
    assert!(matches!(log.insert(&source), Err(LogError::Io(_))));
}

#[test]
fn test_directory_log_quota() {
    let stream_dir = tempfile::tempdir().unwrap();
    let inbox = tempfile::tempdir().unwrap();
    let clock = ManualClock::new(TimeValue::from_secs(1_000));
    let log = directory_log(stream_dir.path(), 100, &clock);
    log.open().unwrap();
    for i in 0..5 {
        clock.advance(1_000_000);
        let bundle = make_bundle(inbox.path(), &format!("bundle{i}"), &[20, 10]);
        log.insert(&bundle).unwrap();
        assert!(log.tracked_total_size() <= 100);
    }
    let units = log.units();
    assert_eq!(units.len(), 3);
    assert_eq!(units[0].time(), TimeValue::from_secs(1_003));
}

#[test]
fn test_directory_log_concurrent_inserts() {
    let stream_dir = tempfile::tempdir().unwrap();
    let inbox = tempfile::tempdir().unwrap();
    let clock = ManualClock::new(TimeValue::from_secs(1_000));
    let log = Arc::new(directory_log(stream_dir.path(), 1 << 20, &clock));
    log.open().unwrap();
    let handles: Vec<_> = (0..4)
        .map(|thread_id| {
            let log = log.clone();
            let bundles: Vec<PathBuf> = (0..5)
                .map(|i| make_bundle(inbox.path(), &format!("bundle_{thread_id}_{i}"), &[1]))
                .collect();
            std::thread::spawn(move || {
                for bundle in bundles {
                    log.insert(&bundle).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(log.units().len(), 20);
    assert_eq!(fs::read_dir(stream_dir.path()).unwrap().count(), 20);
}

#[test]
fn test_directory_log_ingests_pending_temp_dir() {
    let stream_dir = tempfile::tempdir().unwrap();
    make_bundle(stream_dir.path(), "crash_partial.tmp", &[3]);
    let clock = ManualClock::new(TimeValue::from_secs(1_000));
    let log = directory_log(stream_dir.path(), 1 << 20, &clock);
    log.open().unwrap();
    assert_eq!(log.units().len(), 1);
    assert!(!stream_dir.path().join("crash_partial.tmp").exists());
}

fn legacy_log(dir: &Path, config: UnitConfig) -> (LegacyDirLog, Alarms) {
    let alarms = Alarms::default();
    let clock = ManualClock::new(TimeValue::parse_compact("20240301_120000").unwrap());
    let log = LegacyDirLog::new(console_stream(dir), config, Arc::new(clock), alarms.clone());
    (log, alarms)
}

#[test]
fn test_legacy_dir_log_adopts_in_place() {
    let stream_dir = tempfile::tempdir().unwrap();
    let dir = stream_dir.path();
    let (mut log, _alarms) = legacy_log(dir, unit_config(1 << 20, HeaderKind::None));
    write_file(&dir.join("consol_20240101_000000_000001.txt"), b"early");
    write_file(&dir.join("consol.tmp"), b"in progress");
    log.open().unwrap();
    assert_eq!(log.units().len(), 1);
    assert!(dir.join("consol.tmp").exists());
    let fresh = write_file(&dir.join("consol_20240102_000000_000002.txt"), b"fresh");
    assert_eq!(log.untracked_entries().unwrap(), vec![fresh.clone()]);
    log.event(&fresh).unwrap();
    assert!(fresh.exists());
    assert_eq!(log.units().len(), 2);
    assert_eq!(log.tracked_total_size(), 10);
    assert!(log.untracked_entries().unwrap().is_empty());
    // events are idempotent
    log.event(&fresh).unwrap();
    assert_eq!(log.units().len(), 2);
    assert_eq!(
        log.event(&dir.join("consol.tmp")).unwrap(),
        InsertOutcome::default()
    );
    assert!(matches!(
        log.event(&dir.join("elsewhere.txt")),
        Err(LogError::Format(_))
    ));
}

#[test]
fn test_legacy_dir_log_quota_and_self_check() {
    let stream_dir = tempfile::tempdir().unwrap();
    let dir = stream_dir.path();
    let (mut log, alarms) = legacy_log(dir, unit_config(250, HeaderKind::LegacyTabular));
    log.open().unwrap();
    let names = [
        "consol_20240101_000000_000000.txt",
        "consol_20240102_000000_000000.txt",
        "consol_20240103_000000_000000.txt",
    ];
    for name in names {
        let path = write_file(&dir.join(name), &legacy_dump(80));
        log.event(&path).unwrap();
    }
    assert_eq!(log.units().len(), 2);
    assert!(!dir.join(names[0]).exists());
    let broken = write_file(&dir.join("consol_20240104_000000_000000.txt"), b"size=2\n");
    assert!(log.event(&broken).unwrap_err().is_integrity());
    assert!(!broken.exists());
    assert_eq!(alarms.count(), 1);
}

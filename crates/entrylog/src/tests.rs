use super::*;
use crate::logger::log_path;
use std::fs;
use tempfile::tempdir;

// -------------------- Helpers --------------------

fn log_count(dir: &std::path::Path) -> usize {
    fs::read_dir(dir)
        .unwrap()
        .filter(|e| {
            let name = e.as_ref().unwrap().file_name();
            name.to_string_lossy().ends_with(".log")
        })
        .count()
}

// -------------------- Append & read --------------------

#[test]
fn append_and_read_back() {
    let dir = tempdir().unwrap();
    let log = EntryLogger::open(dir.path(), 1024 * 1024).unwrap();

    let a = log.append(1, 0, b"entry-0").unwrap();
    let b = log.append(1, 1, b"entry-1").unwrap();
    let c = log.append(2, 0, b"other ledger").unwrap();

    assert_eq!(log.read(a).unwrap(), b"entry-0");
    assert_eq!(log.read(b).unwrap(), b"entry-1");
    assert_eq!(log.read(c).unwrap(), b"other ledger");
}

#[test]
fn locations_are_sequential_and_past_header() {
    let dir = tempdir().unwrap();
    let log = EntryLogger::open(dir.path(), 1024 * 1024).unwrap();

    let a = log.append(1, 0, b"x").unwrap();
    let b = log.append(1, 1, b"yy").unwrap();

    assert_eq!(a.offset, LOG_HEADER_BYTES);
    assert_eq!(b.offset, a.offset + a.length as u64);
    assert_eq!(b.length, a.length + 1);
    assert_eq!(a.log_id, b.log_id);
}

#[test]
fn empty_payload() {
    let dir = tempdir().unwrap();
    let log = EntryLogger::open(dir.path(), 1024 * 1024).unwrap();

    let loc = log.append(7, 3, b"").unwrap();
    assert!(log.read(loc).unwrap().is_empty());
    log.check_entry(7, 3, loc).unwrap();
}

#[test]
fn payload_too_large_is_rejected() {
    let dir = tempdir().unwrap();
    let log = EntryLogger::open(dir.path(), u64::MAX).unwrap();

    let big = vec![0u8; MAX_PAYLOAD_SIZE + 1];
    let err = log.append(1, 0, &big).unwrap_err();
    assert!(matches!(err, EntryLogError::PayloadTooLarge(_)));
}

// -------------------- Rollover --------------------

#[test]
fn rolls_over_when_size_limit_reached() {
    let dir = tempdir().unwrap();
    // room for roughly two 100-byte records per file
    let log = EntryLogger::open(dir.path(), 300).unwrap();
    let payload = vec![b'p'; 100];

    let mut locs = Vec::new();
    for i in 0..6 {
        locs.push(log.append(1, i, &payload).unwrap());
    }

    let first = locs[0].log_id;
    assert!(locs[5].log_id > first);
    assert!(log_count(dir.path()) >= 3);

    // every record is still readable from whichever file it landed in
    for (i, loc) in locs.iter().enumerate() {
        assert_eq!(log.read(*loc).unwrap(), payload);
        log.check_entry(1, i as u64, *loc).unwrap();
    }
}

#[test]
fn oversized_record_still_lands_in_fresh_log() {
    let dir = tempdir().unwrap();
    let log = EntryLogger::open(dir.path(), 64).unwrap();

    let big = vec![b'b'; 500];
    let loc = log.append(1, 0, &big).unwrap();
    assert_eq!(loc.offset, LOG_HEADER_BYTES);
    assert_eq!(log.read(loc).unwrap(), big);
}

#[test]
fn reopen_starts_a_new_log() {
    let dir = tempdir().unwrap();
    let loc = {
        let log = EntryLogger::open(dir.path(), 1024 * 1024).unwrap();
        let loc = log.append(3, 9, b"before restart").unwrap();
        log.flush().unwrap();
        loc
    };

    let log = EntryLogger::open(dir.path(), 1024 * 1024).unwrap();
    assert_eq!(log.read(loc).unwrap(), b"before restart");

    let next = log.append(3, 10, b"after restart").unwrap();
    assert_eq!(next.log_id, loc.log_id + 1);
    assert_eq!(next.offset, LOG_HEADER_BYTES);
}

#[test]
fn open_writes_nothing_until_first_append() {
    let dir = tempdir().unwrap();
    let log = EntryLogger::open(dir.path(), 1024 * 1024).unwrap();
    log.flush().unwrap();
    assert_eq!(log_count(dir.path()), 0);

    log.append(1, 0, b"first").unwrap();
    assert_eq!(log_count(dir.path()), 1);
}

#[test]
fn reopening_for_reads_leaves_logs_alone() {
    let dir = tempdir().unwrap();
    let loc = {
        let log = EntryLogger::open(dir.path(), 1024 * 1024).unwrap();
        let loc = log.append(1, 0, b"kept").unwrap();
        log.flush().unwrap();
        loc
    };
    assert_eq!(log_count(dir.path()), 1);

    for _ in 0..3 {
        let log = EntryLogger::open(dir.path(), 1024 * 1024).unwrap();
        log.check_entry(1, 0, loc).unwrap();
        assert_eq!(log.read(loc).unwrap(), b"kept");
        log.flush().unwrap();
    }
    assert_eq!(log_count(dir.path()), 1);
}

// -------------------- check_entry --------------------

#[test]
fn check_entry_accepts_matching_record() {
    let dir = tempdir().unwrap();
    let log = EntryLogger::open(dir.path(), 1024 * 1024).unwrap();
    let loc = log.append(5, 42, b"hello").unwrap();
    log.check_entry(5, 42, loc).unwrap();
}

#[test]
fn check_entry_reports_wrong_address() {
    let dir = tempdir().unwrap();
    let log = EntryLogger::open(dir.path(), 1024 * 1024).unwrap();
    let loc = log.append(5, 42, b"hello").unwrap();

    let err = log.check_entry(5, 43, loc).unwrap_err();
    assert_eq!(err.ledger_id, 5);
    assert_eq!(err.entry_id, 43);
    assert!(matches!(
        err.source,
        EntryLogError::Mismatch {
            found_ledger: 5,
            found_entry: 42,
            ..
        }
    ));

    let err = log.check_entry(6, 42, loc).unwrap_err();
    assert!(matches!(err.source, EntryLogError::Mismatch { .. }));
}

#[test]
fn check_entry_reports_size_mismatch() {
    let dir = tempdir().unwrap();
    let log = EntryLogger::open(dir.path(), 1024 * 1024).unwrap();
    let loc = log.append(5, 42, b"hello").unwrap();

    let wrong = EntryLocation {
        length: loc.length + 1,
        ..loc
    };
    let err = log.check_entry(5, 42, wrong).unwrap_err();
    assert!(matches!(err.source, EntryLogError::SizeMismatch { .. }));
}

#[test]
fn check_entry_reports_out_of_range_offset() {
    let dir = tempdir().unwrap();
    let log = EntryLogger::open(dir.path(), 1024 * 1024).unwrap();
    let loc = log.append(5, 42, b"hello").unwrap();

    let beyond = EntryLocation {
        offset: loc.offset + 10_000,
        ..loc
    };
    let err = log.check_entry(5, 42, beyond).unwrap_err();
    assert!(matches!(err.source, EntryLogError::OutOfRange { .. }));
    assert!(matches!(
        log.read(beyond),
        Err(EntryLogError::OutOfRange { .. })
    ));
}

#[test]
fn check_entry_reports_missing_log() {
    let dir = tempdir().unwrap();
    let log = EntryLogger::open(dir.path(), 1024 * 1024).unwrap();
    let loc = log.append(5, 42, b"hello").unwrap();

    let gone = EntryLocation {
        log_id: loc.log_id + 100,
        ..loc
    };
    let err = log.check_entry(5, 42, gone).unwrap_err();
    assert!(matches!(err.source, EntryLogError::NoLog(_)));
}

// -------------------- Corruption detection --------------------

#[test]
fn read_detects_flipped_payload_byte() {
    let dir = tempdir().unwrap();
    let log = EntryLogger::open(dir.path(), 1024 * 1024).unwrap();
    let loc = log.append(1, 0, b"payload").unwrap();
    log.flush().unwrap();

    // Flip the last payload byte behind the logger's back
    let path = log_path(dir.path(), loc.log_id);
    let mut data = fs::read(&path).unwrap();
    let last = (loc.offset + loc.length as u64 - 1) as usize;
    data[last] ^= 0xFF;
    fs::write(&path, &data).unwrap();

    assert!(matches!(log.read(loc), Err(EntryLogError::Corrupt { .. })));
    // the identity prefix is intact, so the cheap check still passes
    log.check_entry(1, 0, loc).unwrap();
}

// -------------------- Log headers --------------------

#[test]
fn log_with_foreign_header_is_corrupt() {
    let dir = tempdir().unwrap();
    let log = EntryLogger::open(dir.path(), 1024 * 1024).unwrap();
    let loc = log.append(1, 0, b"abc").unwrap();
    log.flush().unwrap();

    // a copy of log 0 under another id still claims to be log 0
    let copy = log_path(dir.path(), loc.log_id + 7);
    fs::copy(log_path(dir.path(), loc.log_id), &copy).unwrap();
    let moved = EntryLocation {
        log_id: loc.log_id + 7,
        ..loc
    };

    let err = log.check_entry(1, 0, moved).unwrap_err();
    assert!(matches!(err.source, EntryLogError::Corrupt { offset: 0, .. }));
}

#[test]
fn log_shorter_than_header_is_corrupt() {
    let dir = tempdir().unwrap();
    fs::write(log_path(dir.path(), 4), b"BK").unwrap();
    let log = EntryLogger::open(dir.path(), 1024 * 1024).unwrap();

    let loc = EntryLocation {
        log_id: 4,
        offset: LOG_HEADER_BYTES,
        length: 40,
    };
    assert!(matches!(log.read(loc), Err(EntryLogError::Corrupt { .. })));
}

// -------------------- Location slots --------------------

#[test]
fn location_slot_encoding() {
    let loc = EntryLocation {
        log_id: 0xABCD,
        offset: 4096,
        length: 77,
    };
    assert_eq!(EntryLocation::from_bytes(&loc.to_bytes()), Some(loc));
    assert_eq!(EntryLocation::from_bytes(&[0u8; LOCATION_BYTES]), None);
}

// -------------------- Concurrency --------------------

#[test]
fn concurrent_appends_and_reads() {
    use std::sync::Arc;
    use std::thread;

    let dir = tempdir().unwrap();
    let log = Arc::new(EntryLogger::open(dir.path(), 4096).unwrap());

    let handles: Vec<_> = (0..4u64)
        .map(|ledger| {
            let log = log.clone();
            thread::spawn(move || {
                for entry in 0..200u64 {
                    let payload = format!("{ledger}-{entry}");
                    let loc = log.append(ledger, entry, payload.as_bytes()).unwrap();
                    assert_eq!(log.read(loc).unwrap(), payload.as_bytes());
                    log.check_entry(ledger, entry, loc).unwrap();
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }
}

use super::*;
use std::fs;
use std::io;
use tempfile::tempdir;

fn loc(log_id: u64, offset: u64) -> EntryLocation {
    EntryLocation {
        log_id,
        offset,
        length: 32,
    }
}

fn body_len(idx: &IndexFile) -> u64 {
    fs::metadata(idx.path()).unwrap().len() - HEADER_BYTES
}

/// Index with entries `0..n` written and the header flushed.
fn populated(path: &Path, n: u64) -> IndexFile {
    let mut idx = IndexFile::new(path, b"key");
    for e in 0..n {
        idx.write(e, loc(1, 16 + e * 32)).unwrap();
    }
    idx.flush().unwrap();
    idx
}

// -------------------- Paths --------------------

#[test]
fn index_path_layout() {
    let p = index_path(Path::new("/data"), 0x1234_56);
    assert_eq!(p, Path::new("/data/34/56/123456.idx"));
    assert_eq!(ledger_id_from_path(&p), Some(0x123456));

    assert_eq!(index_path(Path::new("d"), 1), Path::new("d/0/1/1.idx"));
    assert_eq!(ledger_id_from_path(Path::new("d/0/1/1.idx.rloc")), None);
    assert_eq!(ledger_id_from_path(Path::new("d/zz.idx")), None);
}

#[test]
fn rloc_path_appends_suffix() {
    assert_eq!(
        rloc_path(Path::new("/x/y/7.idx")),
        Path::new("/x/y/7.idx.rloc")
    );
}

// -------------------- Header --------------------

#[test]
fn header_encode_decode() {
    let mut h = IndexHeader::new(b"secret");
    h.fenced = true;
    let block = h.encode().unwrap();
    assert_eq!(block.len() as u64, HEADER_BYTES);
    assert_eq!(IndexHeader::decode(&block).unwrap(), h);
}

#[test]
fn header_rejects_garbage() {
    assert!(matches!(
        IndexHeader::decode(&[0u8; 1024]),
        Err(IndexError::BadHeader(_))
    ));
    assert!(matches!(
        IndexHeader::decode(&[0u8; 10]),
        Err(IndexError::BadHeader(_))
    ));
    let too_long = IndexHeader::new(&vec![1u8; MAX_MASTER_KEY_BYTES + 1]);
    assert!(matches!(
        too_long.encode(),
        Err(IndexError::MasterKeyTooLong(_))
    ));
}

// -------------------- Write / read --------------------

#[test]
fn new_index_is_lazy() {
    let dir = tempdir().unwrap();
    let path = index_path(dir.path(), 5);
    let mut idx = IndexFile::new(&path, b"k");

    assert!(!path.exists());
    assert!(idx.read(0).unwrap_err().is_not_found());
    assert!(idx.entries().unwrap().is_empty());
    assert!(!path.exists());

    idx.write(0, loc(1, 16)).unwrap();
    assert!(path.exists());
}

#[test]
fn write_then_read() {
    let dir = tempdir().unwrap();
    let mut idx = IndexFile::new(dir.path().join("1.idx"), b"k");
    idx.write(3, loc(2, 100)).unwrap();

    assert_eq!(idx.read(3).unwrap(), loc(2, 100));
    // gaps below the highest entry read as absent
    assert!(matches!(idx.read(1), Err(IndexError::NoEntry { entry_id: 1 })));
    // beyond the end of the file
    assert!(idx.read(4).unwrap_err().is_not_found());
    assert!(idx.read(u64::MAX).unwrap_err().is_not_found());
    assert_eq!(body_len(&idx), 4 * SLOT_BYTES);
}

#[test]
fn entries_skips_gaps() {
    let dir = tempdir().unwrap();
    let mut idx = IndexFile::new(dir.path().join("1.idx"), b"k");
    idx.write(0, loc(1, 16)).unwrap();
    idx.write(2, loc(1, 48)).unwrap();

    assert_eq!(
        idx.entries().unwrap(),
        vec![(0, loc(1, 16)), (2, loc(1, 48))]
    );
}

#[test]
fn overwrite_keeps_latest_location() {
    let dir = tempdir().unwrap();
    let mut idx = IndexFile::new(dir.path().join("1.idx"), b"k");
    idx.write(0, loc(1, 16)).unwrap();
    idx.write(0, loc(2, 16)).unwrap();
    assert_eq!(idx.read(0).unwrap(), loc(2, 16));
}

#[test]
fn open_missing_file_fails() {
    let dir = tempdir().unwrap();
    assert!(matches!(
        IndexFile::open(dir.path().join("nope.idx")),
        Err(IndexError::Io(_))
    ));
}

// -------------------- Master key / fence --------------------

#[test]
fn master_key_and_fence_survive_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("9.idx");
    {
        let mut idx = IndexFile::new(&path, b"");
        idx.set_master_key(b"pw").unwrap();
        assert!(idx.set_fenced().unwrap());
        assert!(!idx.set_fenced().unwrap());
        idx.flush().unwrap();
    }

    let mut idx = IndexFile::open(&path).unwrap();
    assert_eq!(idx.master_key().unwrap(), b"pw");
    assert!(idx.is_fenced().unwrap());
}

#[test]
fn master_key_cannot_change() {
    let dir = tempdir().unwrap();
    let mut idx = IndexFile::new(dir.path().join("1.idx"), b"one");
    idx.set_master_key(b"one").unwrap();
    assert!(matches!(
        idx.set_master_key(b"two"),
        Err(IndexError::MasterKeyMismatch)
    ));
    assert_eq!(idx.master_key().unwrap(), b"one");
}

#[test]
fn existing_file_header_wins_over_constructor_key() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("1.idx");
    populated(&path, 1);

    let mut idx = IndexFile::new(&path, b"other");
    assert_eq!(idx.master_key().unwrap(), b"key");
}

#[test]
fn header_changes_wait_for_flush() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("1.idx");
    let mut idx = populated(&path, 1);
    idx.set_fenced().unwrap();

    assert!(!IndexFile::open(&path).unwrap().is_fenced().unwrap());
    idx.flush_header().unwrap();
    assert!(IndexFile::open(&path).unwrap().is_fenced().unwrap());
}

// -------------------- Delete --------------------

#[test]
fn delete_removes_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("1.idx");
    let mut idx = populated(&path, 3);

    assert!(idx.delete());
    assert!(idx.is_deleted());
    assert!(!path.exists());
    assert!(matches!(idx.read(0), Err(IndexError::Deleted(_))));
    assert!(matches!(
        idx.write(0, loc(1, 16)),
        Err(IndexError::Deleted(_))
    ));
}

#[test]
fn delete_of_never_written_index() {
    let dir = tempdir().unwrap();
    let mut idx = IndexFile::new(dir.path().join("1.idx"), b"k");
    assert!(idx.delete());
}

// -------------------- Relocation --------------------

#[test]
fn relocation_to_empty_target_fails_without_change() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("1.idx");
    let mut idx = populated(&path, 2);

    let err = idx.move_to_new_location(Path::new(""), u64::MAX).unwrap_err();
    assert!(matches!(err, IndexError::InvalidTarget(_)));
    let err = idx.move_to_new_location(Path::new("/"), u64::MAX).unwrap_err();
    assert!(matches!(err, IndexError::InvalidTarget(_)));

    assert_eq!(idx.path(), path);
    assert_eq!(idx.read(1).unwrap(), loc(1, 48));
}

#[test]
fn relocation_copies_everything() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("a").join("1.idx");
    let target = dir.path().join("b").join("1.idx");
    let mut idx = populated(&path, 10);

    idx.move_to_new_location(&target, u64::MAX).unwrap();

    assert_eq!(idx.path(), target);
    assert!(!path.exists());
    assert!(!rloc_path(&target).exists());
    for e in 0..10 {
        assert_eq!(idx.read(e).unwrap(), loc(1, 16 + e * 32));
    }

    // and the new file stands on its own
    let mut reopened = IndexFile::open(&target).unwrap();
    assert_eq!(reopened.master_key().unwrap(), b"key");
    assert_eq!(reopened.entries().unwrap().len(), 10);
}

#[test]
fn relocation_truncates_body_to_size_limit() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("1.idx");
    let target = dir.path().join("moved").join("1.idx");
    let mut idx = populated(&path, 10);

    // 4 whole slots plus a partial one, which is dropped
    idx.move_to_new_location(&target, 4 * SLOT_BYTES + 7).unwrap();

    assert_eq!(body_len(&idx), 4 * SLOT_BYTES);
    assert_eq!(idx.read(3).unwrap(), loc(1, 16 + 3 * 32));
    assert!(idx.read(4).unwrap_err().is_not_found());
    assert_eq!(idx.master_key().unwrap(), b"key");
}

#[test]
fn header_only_relocation() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("1.idx");
    let target = dir.path().join("moved").join("1.idx");
    let mut idx = populated(&path, 5);
    idx.set_fenced().unwrap();

    idx.move_to_new_location(&target, 0).unwrap();

    assert_eq!(fs::metadata(&target).unwrap().len(), HEADER_BYTES);
    assert!(idx.read(0).unwrap_err().is_not_found());
    // unflushed header state travels with the move
    assert!(IndexFile::open(&target).unwrap().is_fenced().unwrap());
}

#[test]
fn relocation_onto_itself_is_noop() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("1.idx");
    let mut idx = populated(&path, 3);

    idx.move_to_new_location(&path, 0).unwrap();

    assert_eq!(idx.path(), path);
    assert_eq!(idx.entries().unwrap().len(), 3);
}

#[test]
fn relocation_without_backing_file_is_noop() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("1.idx");
    let target = dir.path().join("moved").join("1.idx");
    let mut idx = IndexFile::new(&path, b"k");

    idx.move_to_new_location(&target, u64::MAX).unwrap();

    assert_eq!(idx.path(), path);
    assert!(!target.exists());
}

#[test]
fn relocation_replaces_existing_target() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("a").join("1.idx");
    let target = dir.path().join("b").join("1.idx");
    let mut idx = populated(&path, 2);

    fs::create_dir_all(target.parent().unwrap()).unwrap();
    fs::write(&target, b"stale leftovers").unwrap();

    idx.move_to_new_location(&target, u64::MAX).unwrap();
    assert_eq!(idx.read(1).unwrap(), loc(1, 48));
    assert_eq!(
        fs::metadata(&target).unwrap().len(),
        HEADER_BYTES + 2 * SLOT_BYTES
    );
}

#[test]
fn relocation_fails_when_target_cannot_be_removed() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("a").join("1.idx");
    let target = dir.path().join("b").join("1.idx");
    let mut idx = populated(&path, 2);

    // a non-empty directory squats on the target name
    fs::create_dir_all(target.join("child")).unwrap();

    let err = idx.move_to_new_location(&target, u64::MAX).unwrap_err();
    assert!(matches!(err, IndexError::RemoveTarget { .. }));

    assert_eq!(idx.path(), path);
    assert!(path.exists());
    assert!(!rloc_path(&target).exists());
    assert_eq!(idx.read(1).unwrap(), loc(1, 48));
    idx.write(2, loc(1, 80)).unwrap();
    assert_eq!(idx.read(2).unwrap(), loc(1, 80));
}

#[test]
fn relocated_index_accepts_writes() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("a").join("1.idx");
    let target = dir.path().join("b").join("1.idx");
    let mut idx = populated(&path, 2);

    idx.move_to_new_location(&target, u64::MAX).unwrap();
    idx.write(2, loc(3, 16)).unwrap();
    idx.flush().unwrap();

    let mut reopened = IndexFile::open(&target).unwrap();
    assert_eq!(reopened.read(2).unwrap(), loc(3, 16));
}

#[test]
fn relocation_of_deleted_index_fails() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("1.idx");
    let mut idx = populated(&path, 1);
    idx.delete();

    assert!(matches!(
        idx.move_to_new_location(&dir.path().join("x.idx"), 0),
        Err(IndexError::Deleted(_))
    ));
}

#[test]
fn failed_rename_keeps_index_on_original_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("a").join("1.idx");
    let target = dir.path().join("b").join("1.idx");
    let mut idx = populated(&path, 2);

    let err = idx
        .relocate_with(&target, u64::MAX, |_, _| {
            Err(io::Error::new(io::ErrorKind::Other, "rename refused"))
        })
        .unwrap_err();
    assert!(matches!(err, IndexError::Rename { .. }));

    assert_eq!(idx.path(), path);
    assert!(!target.exists());
    assert_eq!(idx.read(1).unwrap(), loc(1, 48));
    idx.write(2, loc(1, 80)).unwrap();
    idx.flush().unwrap();
    assert_eq!(body_len(&idx), 3 * SLOT_BYTES);

    // the next attempt overwrites the leftover staging file
    idx.move_to_new_location(&target, u64::MAX).unwrap();
    assert_eq!(idx.path(), target);
    assert!(!rloc_path(&target).exists());
    assert_eq!(idx.read(2).unwrap(), loc(1, 80));
}

// --------------------- retarget ---------------------

#[test]
fn retarget_moves_unwritten_index() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("full").join("1.idx");
    let target = dir.path().join("free").join("1.idx");
    let mut idx = IndexFile::new(&path, b"k");

    assert!(idx.retarget(&target).unwrap());
    assert_eq!(idx.path(), target);

    idx.write(0, loc(1, 16)).unwrap();
    idx.flush().unwrap();
    assert!(target.exists());
    assert!(!path.exists());
}

#[test]
fn retarget_leaves_written_index_alone() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("1.idx");
    let mut idx = populated(&path, 1);

    assert!(!idx.retarget(dir.path().join("other.idx")).unwrap());
    assert_eq!(idx.path(), path);
}

#[test]
fn retarget_rejects_empty_path() {
    let dir = tempdir().unwrap();
    let mut idx = IndexFile::new(dir.path().join("1.idx"), b"k");
    assert!(matches!(
        idx.retarget(""),
        Err(IndexError::InvalidTarget(_))
    ));
}

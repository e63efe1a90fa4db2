//! Real-file (`OsFile` + `tempfile`) end-to-end coverage of the seed
//! scenarios in spec.md §8 that the in-memory `#[cfg(test)]` suites
//! beside each module can't exercise on their own: reopening a file,
//! surviving a process-level drop between commits, and snapshot
//! isolation across an `OsFile` handle pair.

use revtree::{DeleteTarget, EngineOptions, OsFile, RecordManager, StringCodec, U64Codec};
use tempfile::tempdir;

fn options() -> EngineOptions {
    EngineOptions { page_size: 512, branching_factor: 4, ..EngineOptions::default() }
}

// S1: forces at least one leaf split and checks ordering + count.
#[test]
fn s1_insert_forces_split_and_preserves_order() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("s1.db");
    let file = OsFile::open(&path).unwrap();
    let rm = RecordManager::open(file, options()).unwrap();
    rm.create_tree("t", &StringCodec, &U64Codec, false).unwrap();

    let mut txn = rm.begin_write().unwrap();
    for (k, v) in [("a", 1u64), ("b", 2), ("c", 3), ("d", 4), ("e", 5)] {
        txn.insert("t", &StringCodec, &U64Codec, k.to_string(), v).unwrap();
    }
    txn.commit().unwrap();

    let snap = rm.begin_read();
    assert_eq!(snap.get("t", &StringCodec, &U64Codec, &"c".to_string()).unwrap(), Some(vec![3]));
    assert_eq!(snap.nb_elems("t").unwrap(), 5);

    let mut cursor = snap.browse("t", &StringCodec, &U64Codec).unwrap();
    let mut out = Vec::new();
    while let Some(tuple) = cursor.next().unwrap() {
        out.push(tuple);
    }
    assert_eq!(
        out,
        vec![
            ("a".to_string(), 1),
            ("b".to_string(), 2),
            ("c".to_string(), 3),
            ("d".to_string(), 4),
            ("e".to_string(), 5),
        ]
    );
}

// S2: delete a key, check browse/get/nb_elems afterward.
#[test]
fn s2_delete_removes_key_and_shrinks_count() {
    let dir = tempdir().unwrap();
    let file = OsFile::open(dir.path().join("s2.db")).unwrap();
    let rm = RecordManager::open(file, options()).unwrap();
    rm.create_tree("t", &StringCodec, &U64Codec, false).unwrap();

    let mut txn = rm.begin_write().unwrap();
    for (k, v) in [("a", 1u64), ("b", 2), ("c", 3), ("d", 4), ("e", 5)] {
        txn.insert("t", &StringCodec, &U64Codec, k.to_string(), v).unwrap();
    }
    txn.commit().unwrap();

    let mut txn = rm.begin_write().unwrap();
    let removed = txn
        .delete("t", &StringCodec, &U64Codec, &"c".to_string(), DeleteTarget::Key)
        .unwrap();
    assert!(removed);
    txn.commit().unwrap();

    let snap = rm.begin_read();
    assert_eq!(snap.get("t", &StringCodec, &U64Codec, &"c".to_string()).unwrap(), None);
    assert_eq!(snap.nb_elems("t").unwrap(), 4);

    let mut cursor = snap.browse("t", &StringCodec, &U64Codec).unwrap();
    let mut out = Vec::new();
    while let Some(tuple) = cursor.next().unwrap() {
        out.push(tuple);
    }
    assert_eq!(
        out,
        vec![
            ("a".to_string(), 1),
            ("b".to_string(), 2),
            ("d".to_string(), 4),
            ("e".to_string(), 5),
        ]
    );
}

// S3: duplicate-value promotion to a sub-tree and demotion back to inline.
#[test]
fn s3_duplicate_values_promote_then_demote() {
    let dir = tempdir().unwrap();
    let file = OsFile::open(dir.path().join("s3.db")).unwrap();
    let opts = EngineOptions { page_size: 512, branching_factor: 4, v_up: 2, v_low: 1, ..EngineOptions::default() };
    let rm = RecordManager::open(file, opts).unwrap();
    rm.create_tree("dups", &StringCodec, &U64Codec, true).unwrap();

    let mut txn = rm.begin_write().unwrap();
    for v in [1u64, 2, 3] {
        txn.insert("dups", &StringCodec, &U64Codec, "k".to_string(), v).unwrap();
    }
    txn.commit().unwrap();

    let snap = rm.begin_read();
    let mut values = snap.get("dups", &StringCodec, &U64Codec, &"k".to_string()).unwrap().unwrap();
    values.sort();
    assert_eq!(values, vec![1, 2, 3]);
    assert!(snap.contains("dups", &StringCodec, &U64Codec, &"k".to_string(), &2).unwrap());

    let mut txn = rm.begin_write().unwrap();
    txn.delete("dups", &StringCodec, &U64Codec, &"k".to_string(), DeleteTarget::Value(&2)).unwrap();
    txn.delete("dups", &StringCodec, &U64Codec, &"k".to_string(), DeleteTarget::Value(&3)).unwrap();
    txn.commit().unwrap();

    let snap = rm.begin_read();
    assert_eq!(snap.get("dups", &StringCodec, &U64Codec, &"k".to_string()).unwrap(), Some(vec![1]));
}

// S4: a reader's snapshot is unaffected by a writer committing afterward.
#[test]
fn s4_snapshot_ignores_concurrent_writes() {
    let dir = tempdir().unwrap();
    let file = OsFile::open(dir.path().join("s4.db")).unwrap();
    let rm = RecordManager::open(file, options()).unwrap();
    rm.create_tree("t", &StringCodec, &U64Codec, false).unwrap();

    let mut txn = rm.begin_write().unwrap();
    for i in 0u64..100 {
        txn.insert("t", &StringCodec, &U64Codec, format!("k{:04}", i), i).unwrap();
    }
    txn.commit().unwrap();

    let snap_a = rm.begin_read();
    assert_eq!(snap_a.nb_elems("t").unwrap(), 100);

    let mut txn = rm.begin_write().unwrap();
    for i in 0u64..50 {
        txn.delete("t", &StringCodec, &U64Codec, &format!("k{:04}", i), DeleteTarget::Key).unwrap();
    }
    txn.commit().unwrap();

    // snapshot A still observes the pre-delete state.
    assert_eq!(snap_a.nb_elems("t").unwrap(), 100);
    let mut cursor = snap_a.browse("t", &StringCodec, &U64Codec).unwrap();
    let mut count = 0;
    while cursor.next().unwrap().is_some() {
        count += 1;
    }
    assert_eq!(count, 100);

    let snap_b = rm.begin_read();
    assert_eq!(snap_b.nb_elems("t").unwrap(), 50);
}

// S5: persistence across a reopen of the same on-disk file.
#[test]
fn s5_persists_across_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("s5.db");

    {
        let file = OsFile::open(&path).unwrap();
        let rm = RecordManager::open(file, EngineOptions { page_size: 512, ..EngineOptions::default() }).unwrap();
        rm.create_tree("t", &U64Codec, &U64Codec, false).unwrap();

        let mut txn = rm.begin_write().unwrap();
        for k in 0u64..2000 {
            txn.insert("t", &U64Codec, &U64Codec, k, k * 7).unwrap();
        }
        txn.commit().unwrap();
        rm.close().unwrap();
    }

    let file = OsFile::open(&path).unwrap();
    let rm = RecordManager::open(file, EngineOptions { page_size: 512, ..EngineOptions::default() }).unwrap();
    let snap = rm.begin_read();
    assert_eq!(snap.nb_elems("t").unwrap(), 2000);
    for k in 0u64..2000 {
        assert_eq!(snap.get("t", &U64Codec, &U64Codec, &k).unwrap(), Some(vec![k * 7]));
    }
}

// Integrity check stays green across splits, deletes and a reopen.
#[test]
fn integrity_check_passes_after_mixed_workload() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("integrity.db");

    let file = OsFile::open(&path).unwrap();
    let rm = RecordManager::open(file, options()).unwrap();
    rm.create_tree("t", &StringCodec, &U64Codec, false).unwrap();

    let mut txn = rm.begin_write().unwrap();
    for i in 0u64..64 {
        txn.insert("t", &StringCodec, &U64Codec, format!("key-{:03}", i), i).unwrap();
    }
    txn.commit().unwrap();
    rm.integrity_check().unwrap();

    let mut txn = rm.begin_write().unwrap();
    for i in (0u64..64).step_by(3) {
        txn.delete("t", &StringCodec, &U64Codec, &format!("key-{:03}", i), DeleteTarget::Key).unwrap();
    }
    txn.commit().unwrap();
    rm.integrity_check().unwrap();

    rm.close().unwrap();
    let file = OsFile::open(&path).unwrap();
    let rm = RecordManager::open(file, options()).unwrap();
    rm.integrity_check().unwrap();
}

// P6/S6: a write that is never committed leaves the prior revision intact
// on reopen — dropping the `WriteTxn` aborts it (spec.md §7).
#[test]
fn uncommitted_write_does_not_survive_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("abort.db");

    let file = OsFile::open(&path).unwrap();
    let rm = RecordManager::open(file, options()).unwrap();
    rm.create_tree("t", &StringCodec, &U64Codec, false).unwrap();
    let mut txn = rm.begin_write().unwrap();
    txn.insert("t", &StringCodec, &U64Codec, "committed".to_string(), 1).unwrap();
    txn.commit().unwrap();

    {
        let mut txn = rm.begin_write().unwrap();
        txn.insert("t", &StringCodec, &U64Codec, "never-committed".to_string(), 2).unwrap();
        // txn dropped here without calling commit().
    }
    rm.close().unwrap();

    let file = OsFile::open(&path).unwrap();
    let rm = RecordManager::open(file, options()).unwrap();
    let snap = rm.begin_read();
    assert_eq!(snap.nb_elems("t").unwrap(), 1);
    assert_eq!(snap.get("t", &StringCodec, &U64Codec, &"committed".to_string()).unwrap(), Some(vec![1]));
    assert_eq!(snap.get("t", &StringCodec, &U64Codec, &"never-committed".to_string()).unwrap(), None);
}

// keep_revisions: a historical `get_at` on a superseded revision still
// resolves after later commits (spec.md §4.7, P5).
#[test]
fn get_at_resolves_a_superseded_revision() {
    let dir = tempdir().unwrap();
    let file = OsFile::open(dir.path().join("revisions.db")).unwrap();
    let opts = EngineOptions { page_size: 512, branching_factor: 4, keep_revisions: true, ..EngineOptions::default() };
    let rm = RecordManager::open(file, opts).unwrap();
    rm.create_tree("t", &StringCodec, &U64Codec, false).unwrap();

    let mut txn = rm.begin_write().unwrap();
    txn.insert("t", &StringCodec, &U64Codec, "a".to_string(), 1u64).unwrap();
    let rev1 = txn.commit().unwrap();

    let mut txn = rm.begin_write().unwrap();
    txn.insert("t", &StringCodec, &U64Codec, "a".to_string(), 2u64).unwrap();
    txn.commit().unwrap();

    assert_eq!(rm.get_at(rev1, "t", &StringCodec, &U64Codec, &"a".to_string()).unwrap(), Some(vec![1]));
    let snap = rm.begin_read();
    assert_eq!(snap.get("t", &StringCodec, &U64Codec, &"a".to_string()).unwrap(), Some(vec![2]));
}

// create_tree fails for a name already in use.
#[test]
fn create_tree_rejects_duplicate_name() {
    let dir = tempdir().unwrap();
    let file = OsFile::open(dir.path().join("dup-tree.db")).unwrap();
    let rm = RecordManager::open(file, options()).unwrap();
    rm.create_tree("t", &StringCodec, &U64Codec, false).unwrap();
    let err = rm.create_tree("t", &StringCodec, &U64Codec, false).unwrap_err();
    assert!(matches!(err, revtree::Error::TreeAlreadyManaged { .. }));
}

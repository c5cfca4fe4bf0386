//! Main test module for snapvault
//!
//! This module includes all test suites:
//! - Integration tests for full backup cycles
//! - Property-based tests for retention invariants
//! - Edge-case tests for awkward filenames and histories

pub mod integration;
pub mod property;

#[cfg(test)]
mod edge_cases {
    use snapvault::{ChecksumLedger, SnapshotStore};
    use std::fs;
    use tempfile::TempDir;

    fn promoted_with(files: &[&str]) -> (SnapshotStore, snapvault::Snapshot, TempDir) {
        let temp = TempDir::new().unwrap();
        let store = SnapshotStore::open(temp.path()).unwrap();
        let mut pending = store.create_pending("home", None).unwrap();
        for name in files {
            let path = pending.data_dir().join(name);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(&path, format!("content of {}", name)).unwrap();
        }
        pending.mark_transferred();
        let snapshot = store.promote(pending).unwrap();
        (store, snapshot, temp)
    }

    #[test]
    fn test_ledger_handles_special_filenames() {
        let names = [
            "file with spaces.txt",
            "file-with-dashes.txt",
            "file.with.dots.txt",
            "file(with)parens.txt",
            "deep/nested/dir/file.txt",
        ];
        let (_store, snapshot, _temp) = promoted_with(&names);

        let ledger = ChecksumLedger::new();
        let written = ledger.record(&snapshot, None).unwrap();
        assert_eq!(written, names.len());

        let result = ledger.compare(&snapshot).unwrap();
        assert!(result.is_clean());
        assert_eq!(result.matched, names.len());
    }

    #[test]
    fn test_ledger_handles_unicode_filenames() {
        let names = ["файл.txt", "文件.txt", "αρχείο.txt"];
        let mut recorded = 0;
        let temp = TempDir::new().unwrap();
        let store = SnapshotStore::open(temp.path()).unwrap();
        let mut pending = store.create_pending("home", None).unwrap();
        for name in &names {
            // Skip names the filesystem rejects
            if fs::write(pending.data_dir().join(name), b"unicode").is_ok() {
                recorded += 1;
            }
        }
        pending.mark_transferred();
        let snapshot = store.promote(pending).unwrap();

        if recorded == 0 {
            return;
        }
        let ledger = ChecksumLedger::new();
        assert_eq!(ledger.record(&snapshot, None).unwrap(), recorded);
        assert!(ledger.compare(&snapshot).unwrap().is_clean());
    }

    #[test]
    fn test_many_labels_are_independent() {
        let temp = TempDir::new().unwrap();
        let store = SnapshotStore::open(temp.path()).unwrap();

        for label in ["home", "etc", "var-www"] {
            let mut pending = store.create_pending(label, None).unwrap();
            fs::write(pending.data_dir().join("f.txt"), label).unwrap();
            pending.mark_transferred();
            store.promote(pending).unwrap();
        }

        // Locks and listings are per label
        let _home_guard = store.lock("home").unwrap();
        let _etc_guard = store.lock("etc").unwrap();
        assert_eq!(store.list("home").unwrap().len(), 1);
        assert_eq!(store.list("etc").unwrap().len(), 1);
        assert_eq!(store.list("var-www").unwrap().len(), 1);
        assert!(store.list("unknown").unwrap().is_empty());
    }
}

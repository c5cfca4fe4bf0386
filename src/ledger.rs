//! Checksum ledger: per-file content hashes for corruption detection
//!
//! Every promoted snapshot carries a `checksums.jsonl` ledger with one
//! SHA-256 record per file, written at backup time and re-checked by the
//! verification scheduler. The ledger exists independently of the
//! transport's own transfer integrity checking; its job is to catch
//! post-write corruption and bitrot.
//!
//! Records are immutable once written for a given snapshot. A re-scan
//! produces a fresh in-memory record set used only for comparison, never a
//! silent overwrite, so mismatches stay detectable and reportable across
//! runs.
//!
//! Both recording and comparison stream file content through a fixed-size
//! buffer; memory use grows with the number of files, not their size.

use crate::error::{Result, VaultError};
use crate::types::{Snapshot, SnapshotId};
use crate::utils;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::PathBuf;
use std::time::Instant;
use tracing::{debug, info, warn};

/// One per-file checksum record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecksumRecord {
    /// Path relative to the snapshot's `data/` directory
    pub path: PathBuf,
    /// SHA-256 of the file content, hex encoded
    pub hash: String,
    /// File size in bytes at record time
    pub size: u64,
    /// Modification timestamp at record time
    pub mtime: DateTime<Utc>,
}

/// Outcome of comparing a snapshot against its stored ledger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationResult {
    /// Snapshot that was scanned
    pub snapshot_id: SnapshotId,
    /// Records whose on-disk content still matches
    pub matched: usize,
    /// Paths whose content no longer matches the recorded hash
    pub mismatched: Vec<PathBuf>,
    /// Paths recorded in the ledger but absent on disk
    pub missing: Vec<PathBuf>,
    /// Wall-clock scan duration in milliseconds
    pub duration_ms: u64,
}

impl VerificationResult {
    /// Whether every recorded file is intact
    pub fn is_clean(&self) -> bool {
        self.mismatched.is_empty() && self.missing.is_empty()
    }

    /// One-line summary for logs and reports
    pub fn summary(&self) -> String {
        if self.is_clean() {
            format!(
                "snapshot {}: {} files verified in {}ms",
                self.snapshot_id, self.matched, self.duration_ms
            )
        } else {
            format!(
                "snapshot {}: {} ok, {} mismatched, {} missing ({}ms)",
                self.snapshot_id,
                self.matched,
                self.mismatched.len(),
                self.missing.len(),
                self.duration_ms
            )
        }
    }
}

/// Checksum ledger operations for a snapshot store
///
/// Stateless; all state lives in the per-snapshot `checksums.jsonl` files.
#[derive(Debug, Default, Clone)]
pub struct ChecksumLedger;

impl ChecksumLedger {
    /// Create a ledger handle
    pub fn new() -> Self {
        Self
    }

    /// Record one hash per file under the snapshot's data directory
    ///
    /// When `reuse_from` is given, records from that snapshot's ledger are
    /// reused for files whose size and mtime are unchanged - hardlinked
    /// files share content with the base snapshot, so the prior hash is
    /// still valid and re-hashing the whole archive every cycle would
    /// defeat the point of incremental transfers.
    ///
    /// Returns the number of records written.
    pub fn record(&self, snapshot: &Snapshot, reuse_from: Option<&Snapshot>) -> Result<usize> {
        let start = Instant::now();
        let data_dir = snapshot.data_dir();

        let reusable: HashMap<PathBuf, ChecksumRecord> = match reuse_from {
            Some(prior) => match self.load(prior) {
                Ok(records) => records.into_iter().map(|r| (r.path.clone(), r)).collect(),
                Err(VaultError::LedgerNotFound(_)) => HashMap::new(),
                Err(e) => return Err(e),
            },
            None => HashMap::new(),
        };

        let tmp_path = snapshot.ledger_path().with_extension("tmp");
        let mut writer = BufWriter::new(File::create(&tmp_path)?);
        let mut written = 0usize;
        let mut reused = 0usize;

        for entry in walkdir::WalkDir::new(&data_dir)
            .sort_by_file_name()
            .into_iter()
        {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }

            let path = utils::make_relative(entry.path(), &data_dir)?;
            let metadata = entry.metadata()?;
            let size = metadata.len();
            let mtime: DateTime<Utc> = metadata.modified()?.into();

            let record = match reusable.get(&path) {
                Some(prior) if prior.size == size && prior.mtime == mtime => {
                    reused += 1;
                    ChecksumRecord {
                        path,
                        hash: prior.hash.clone(),
                        size,
                        mtime,
                    }
                }
                _ => ChecksumRecord {
                    path,
                    hash: utils::hash_file_content(entry.path())?,
                    size,
                    mtime,
                },
            };

            serde_json::to_writer(&mut writer, &record)?;
            writer.write_all(b"\n")?;
            written += 1;
        }

        writer.flush()?;
        drop(writer);
        fs::rename(&tmp_path, snapshot.ledger_path())?;

        info!(
            "Recorded {} checksums for snapshot {} ({} reused) in {}ms",
            written,
            snapshot.id,
            reused,
            start.elapsed().as_millis()
        );
        Ok(written)
    }

    /// Load all records from a snapshot's ledger
    pub fn load(&self, snapshot: &Snapshot) -> Result<Vec<ChecksumRecord>> {
        let file = match File::open(snapshot.ledger_path()) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(VaultError::LedgerNotFound(snapshot.id.to_string()))
            }
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            records.push(serde_json::from_str(&line)?);
        }
        Ok(records)
    }

    /// Re-hash current on-disk content and diff against stored records
    ///
    /// Produces a fresh result set for comparison only; the ledger file is
    /// never rewritten here.
    pub fn compare(&self, snapshot: &Snapshot) -> Result<VerificationResult> {
        let start = Instant::now();
        let data_dir = snapshot.data_dir();
        let records = self.load(snapshot)?;

        debug!(
            "Verifying {} recorded files for snapshot {}",
            records.len(),
            snapshot.id
        );

        let mut result = VerificationResult {
            snapshot_id: snapshot.id,
            matched: 0,
            mismatched: Vec::new(),
            missing: Vec::new(),
            duration_ms: 0,
        };

        for record in records {
            let on_disk = data_dir.join(&record.path);
            if !on_disk.is_file() {
                warn!("[MISSING] {:?}", record.path);
                result.missing.push(record.path);
                continue;
            }

            let actual = utils::hash_file_content(&on_disk)?;
            if actual == record.hash {
                result.matched += 1;
            } else {
                warn!(
                    "[FAILED] {:?} [{} => {}]",
                    record.path, actual, record.hash
                );
                result.mismatched.push(record.path);
            }
        }

        result.duration_ms = start.elapsed().as_millis() as u64;
        info!("{}", result.summary());
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SnapshotStore;
    use tempfile::TempDir;

    fn snapshot_with_files(files: &[(&str, &[u8])]) -> (SnapshotStore, Snapshot, TempDir) {
        let temp = TempDir::new().unwrap();
        let store = SnapshotStore::open(temp.path()).unwrap();
        let mut pending = store.create_pending("home", None).unwrap();
        for (name, content) in files {
            let path = pending.data_dir().join(name);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(&path, content).unwrap();
        }
        pending.mark_transferred();
        let snapshot = store.promote(pending).unwrap();
        (store, snapshot, temp)
    }

    #[test]
    fn test_record_then_compare_is_clean() {
        let (_store, snapshot, _temp) =
            snapshot_with_files(&[("a.txt", b"alpha"), ("sub/b.txt", b"beta")]);
        let ledger = ChecksumLedger::new();

        let written = ledger.record(&snapshot, None).unwrap();
        assert_eq!(written, 2);

        let result = ledger.compare(&snapshot).unwrap();
        assert!(result.is_clean());
        assert_eq!(result.matched, 2);
    }

    #[test]
    fn test_compare_detects_mismatch_and_missing() {
        let (_store, snapshot, _temp) =
            snapshot_with_files(&[("a.txt", b"alpha"), ("b.txt", b"beta")]);
        let ledger = ChecksumLedger::new();
        ledger.record(&snapshot, None).unwrap();

        fs::write(snapshot.data_dir().join("a.txt"), b"tampered").unwrap();
        fs::remove_file(snapshot.data_dir().join("b.txt")).unwrap();

        let result = ledger.compare(&snapshot).unwrap();
        assert!(!result.is_clean());
        assert_eq!(result.matched, 0);
        assert_eq!(result.mismatched, vec![PathBuf::from("a.txt")]);
        assert_eq!(result.missing, vec![PathBuf::from("b.txt")]);
    }

    #[test]
    fn test_compare_without_ledger_errors() {
        let (_store, snapshot, _temp) = snapshot_with_files(&[("a.txt", b"alpha")]);
        let ledger = ChecksumLedger::new();

        match ledger.compare(&snapshot) {
            Err(VaultError::LedgerNotFound(id)) => assert_eq!(id, snapshot.id.to_string()),
            other => panic!("expected LedgerNotFound, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_record_reuses_unchanged_hashes() {
        let (store, base, _temp) = snapshot_with_files(&[("a.txt", b"alpha")]);
        let ledger = ChecksumLedger::new();
        ledger.record(&base, None).unwrap();

        // Second snapshot hardlinks the unchanged file from the base
        let mut pending = store.create_pending("home", Some(&base)).unwrap();
        fs::hard_link(
            base.data_dir().join("a.txt"),
            pending.data_dir().join("a.txt"),
        )
        .unwrap();
        fs::write(pending.data_dir().join("new.txt"), b"fresh").unwrap();
        pending.mark_transferred();
        let next = store.promote(pending).unwrap();

        ledger.record(&next, Some(&base)).unwrap();

        let base_records = ledger.load(&base).unwrap();
        let next_records = ledger.load(&next).unwrap();
        let base_a = base_records.iter().find(|r| r.path.ends_with("a.txt")).unwrap();
        let next_a = next_records.iter().find(|r| r.path.ends_with("a.txt")).unwrap();
        assert_eq!(base_a.hash, next_a.hash);
        assert_eq!(next_records.len(), 2);
    }

    #[test]
    fn test_ledger_survives_round_trip() {
        let (_store, snapshot, _temp) = snapshot_with_files(&[("a.txt", b"alpha")]);
        let ledger = ChecksumLedger::new();
        ledger.record(&snapshot, None).unwrap();

        let records = ledger.load(&snapshot).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].path, PathBuf::from("a.txt"));
        assert_eq!(records[0].size, 5);
        assert_eq!(records[0].hash, utils::hash_data(b"alpha"));
    }
}

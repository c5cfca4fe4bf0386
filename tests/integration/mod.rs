//! Integration tests for snapvault
//!
//! Exercises full backup cycles end to end through a local transport that
//! mimics rsync's hardlink deduplication, so inode sharing, ledger reuse,
//! resume, retention, and scheduled verification are all tested against a
//! real filesystem.

use parking_lot::Mutex;
use snapvault::config::ReportingSettings;
use snapvault::orchestrator::TransferRequest;
use snapvault::{
    CycleResult, CycleStatus, LogReporter, Orchestrator, Result, RetentionPolicy, Settings,
    SnapshotId, SnapshotStatus, TransferMode, TransferSettings, TransferStats, Transport,
    VaultError,
};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Transport that copies a local tree, hardlinking unchanged files
///
/// Stands in for `rsync --link-dest`: a file whose size and mtime match the
/// link base is hardlinked instead of copied, and copies preserve the
/// source mtime the way `rsync -a` does.
pub struct LocalLinkTransport {
    /// Exit codes to fail with, consumed one per call
    failures: Mutex<Vec<i32>>,
}

impl LocalLinkTransport {
    pub fn new() -> Self {
        Self {
            failures: Mutex::new(Vec::new()),
        }
    }

    pub fn fail_next(&self, code: i32) {
        self.failures.lock().push(code);
    }

    fn copy_tree(source: &Path, dest: &Path, link: Option<&Path>) -> Result<TransferStats> {
        let mut stats = TransferStats::default();

        for entry in walkdir::WalkDir::new(source) {
            let entry = entry?;
            let rel = entry
                .path()
                .strip_prefix(source)
                .expect("walked path under source");
            if rel.as_os_str().is_empty() {
                continue;
            }
            let target = dest.join(rel);

            if entry.file_type().is_dir() {
                fs::create_dir_all(&target)?;
                continue;
            }

            stats.files_total += 1;
            let metadata = entry.metadata()?;
            let linked = match link.map(|l| l.join(rel)) {
                Some(prior) if prior.is_file() => {
                    let pm = fs::metadata(&prior)?;
                    if pm.len() == metadata.len() && pm.modified()? == metadata.modified()? {
                        fs::hard_link(&prior, &target)?;
                        true
                    } else {
                        false
                    }
                }
                _ => false,
            };

            if !linked {
                fs::copy(entry.path(), &target)?;
                let mtime = filetime::FileTime::from_last_modification_time(&metadata);
                filetime::set_file_mtime(&target, mtime)?;
                stats.files_transferred += 1;
                stats.transferred_bytes += metadata.len();
            }
        }
        Ok(stats)
    }
}

impl Transport for LocalLinkTransport {
    fn transfer(&self, request: &TransferRequest<'_>) -> Result<TransferStats> {
        if let Some(code) = self.failures.lock().pop() {
            return Err(VaultError::Transfer { code });
        }
        Self::copy_tree(
            &request.settings.source_dir,
            request.dest_dir,
            request.link_dest,
        )
    }
}

/// One source tree, one backup root, one orchestrator
pub struct VaultHarness {
    pub source: TempDir,
    pub backup: TempDir,
    pub orchestrator: Orchestrator<LocalLinkTransport, LogReporter>,
}

impl VaultHarness {
    pub fn new() -> Self {
        Self::with_settings(|_| {})
    }

    pub fn with_settings(tweak: impl FnOnce(&mut Settings)) -> Self {
        let source = TempDir::new().unwrap();
        let backup = TempDir::new().unwrap();

        let mut settings = Settings {
            label: "home".to_string(),
            backup_root: backup.path().to_path_buf(),
            umask: None,
            verification_interval_days: 0,
            retention: RetentionPolicy {
                snapshot: 10,
                daily: 0,
                monthly: 0,
                yearly: 0,
            },
            log_retention_days: 0,
            transfer: TransferSettings {
                mode: TransferMode::Local,
                source_dir: source.path().to_path_buf(),
                source_host: None,
                ssh_user: None,
                ssh_key: None,
                pathname: "rsync".to_string(),
                additional_options: Vec::new(),
            },
            reporting: ReportingSettings {
                smtp_server: None,
                from_addr: None,
                to_addrs: Vec::new(),
                link_to_logs: false,
                base_url: None,
                report_interval_days: 0,
            },
        };
        tweak(&mut settings);

        let orchestrator =
            Orchestrator::new(settings, LocalLinkTransport::new(), LogReporter).unwrap();
        Self {
            source,
            backup,
            orchestrator,
        }
    }

    pub fn write_source(&self, name: &str, content: &[u8]) {
        let path = self.source.path().join(name);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, content).unwrap();
        // Stable whole-second mtimes, so unchanged files link across cycles
        filetime::set_file_mtime(&path, filetime::FileTime::from_unix_time(1_700_000_000, 0))
            .unwrap();
    }

    pub fn run(&self) -> CycleResult {
        self.orchestrator.run_cycle()
    }

    pub fn snapshot_ids(&self) -> Vec<SnapshotId> {
        self.orchestrator
            .store()
            .list("home")
            .unwrap()
            .into_iter()
            .map(|s| s.id)
            .collect()
    }

    /// Create an old promoted snapshot directly on disk
    pub fn plant_snapshot(&self, id: &str) -> PathBuf {
        let dir = self
            .orchestrator
            .store()
            .snapshots_dir("home")
            .join(id);
        fs::create_dir_all(dir.join("data")).unwrap();
        dir
    }
}

#[cfg(unix)]
fn inode(path: &Path) -> u64 {
    use std::os::unix::fs::MetadataExt;
    fs::metadata(path).unwrap().ino()
}

#[test]
fn test_cycle_produces_hardlinked_history() {
    let harness = VaultHarness::new();
    harness.write_source("keep.txt", b"stable content");
    harness.write_source("docs/change.txt", b"version one");

    let first = harness.run();
    assert_eq!(first.status, CycleStatus::Success);

    harness.write_source("docs/change.txt", b"version two, longer");
    let second = harness.run();
    assert_eq!(second.status, CycleStatus::Success);
    assert_ne!(first.snapshot_id, second.snapshot_id);

    let store = harness.orchestrator.store();
    let snapshots = store.list("home").unwrap();
    assert_eq!(snapshots.len(), 2);
    let newest = &snapshots[0];
    let oldest = &snapshots[1];

    // Unchanged file shares an inode across snapshots; changed one does not
    #[cfg(unix)]
    {
        assert_eq!(
            inode(&newest.data_dir().join("keep.txt")),
            inode(&oldest.data_dir().join("keep.txt"))
        );
        assert_ne!(
            inode(&newest.data_dir().join("docs/change.txt")),
            inode(&oldest.data_dir().join("docs/change.txt"))
        );
    }

    assert_eq!(
        fs::read(newest.data_dir().join("docs/change.txt")).unwrap(),
        b"version two, longer"
    );

    // Unchanged file got its hash reused from the previous ledger
    let ledger = snapvault::ChecksumLedger::new();
    let old_records = ledger.load(oldest).unwrap();
    let new_records = ledger.load(newest).unwrap();
    let hash_of = |records: &[snapvault::ChecksumRecord], name: &str| {
        records
            .iter()
            .find(|r| r.path == Path::new(name))
            .unwrap()
            .hash
            .clone()
    };
    assert_eq!(
        hash_of(&old_records, "keep.txt"),
        hash_of(&new_records, "keep.txt")
    );
    assert_ne!(
        hash_of(&old_records, "docs/change.txt"),
        hash_of(&new_records, "docs/change.txt")
    );
}

#[test]
fn test_failed_transfer_leaves_resumable_staging() {
    let harness = VaultHarness::new();
    harness.write_source("a.txt", b"payload");

    // First cycle fails mid-transfer
    harness.orchestrator.transport().fail_next(23);
    let failed = harness.run();
    assert_eq!(failed.status, CycleStatus::Failed);
    assert!(failed.snapshot_id.is_none());
    assert!(harness.snapshot_ids().is_empty());
    assert!(harness
        .orchestrator
        .store()
        .find_staging_dir("home")
        .unwrap()
        .is_some());

    // Next cycle adopts the staging directory and completes
    let recovered = harness.run();
    assert_eq!(recovered.status, CycleStatus::Success);
    assert_eq!(harness.snapshot_ids().len(), 1);
    assert!(harness
        .orchestrator
        .store()
        .find_staging_dir("home")
        .unwrap()
        .is_none());
}

#[test]
fn test_retention_prunes_planted_history() {
    let harness = VaultHarness::with_settings(|s| {
        s.retention = RetentionPolicy {
            snapshot: 1,
            daily: 3,
            monthly: 0,
            yearly: 0,
        };
    });
    harness.write_source("a.txt", b"payload");

    // Three planted daily snapshots plus today's cycle
    harness.plant_snapshot("2024-05-01-020000");
    harness.plant_snapshot("2024-05-02-020000");
    harness.plant_snapshot("2024-05-03-020000");

    let result = harness.run();
    assert_eq!(result.status, CycleStatus::Success);

    // Today's snapshot plus the two most recent planted days survive the
    // 3-day window; the oldest planted day is deleted.
    let deleted: Vec<String> = result
        .deleted_snapshots
        .iter()
        .map(|id| id.to_string())
        .collect();
    assert_eq!(deleted, vec!["2024-05-01-020000".to_string()]);
    assert_eq!(harness.snapshot_ids().len(), 3);
}

#[test]
fn test_scheduled_verification_flags_tampering() {
    let harness = VaultHarness::with_settings(|s| {
        s.verification_interval_days = 7;
    });
    harness.write_source("a.txt", b"original bytes");

    // First cycle initializes the verification timestamp without scanning
    let first = harness.run();
    assert_eq!(first.status, CycleStatus::Success);
    assert!(first.verification.is_none());

    // Tamper with the promoted snapshot in place: same size, same mtime,
    // different content, exactly what bitrot looks like.
    let store = harness.orchestrator.store();
    let snapshot = store.latest("home").unwrap().unwrap();
    let victim = snapshot.data_dir().join("a.txt");
    fs::write(&victim, b"tampered bytes").unwrap();
    filetime::set_file_mtime(&victim, filetime::FileTime::from_unix_time(1_700_000_000, 0))
        .unwrap();
    let state = store.cache_dir("home").join("last_verification");
    snapvault::utils::write_timestamp_file(
        &state,
        chrono::Utc::now() - chrono::Duration::days(10),
    )
    .unwrap();

    let second = harness.run();
    // The newly promoted snapshot is the one verified; it hardlinked the
    // tampered file from the previous snapshot, so the mismatch surfaces.
    let verification = second.verification.expect("verification ran");
    assert!(!verification.is_clean());

    // Corrupt snapshots are reported, marked, and never deleted
    let verified_id = verification.snapshot_id;
    let marked = store.get("home", verified_id).unwrap();
    assert_eq!(marked.status, SnapshotStatus::Corrupt);
    assert!(marked.path.exists());
}

#[test]
fn test_empty_source_still_cycles() {
    let harness = VaultHarness::new();
    let result = harness.run();

    assert_eq!(result.status, CycleStatus::Success);
    let snapshot = harness
        .orchestrator
        .store()
        .latest("home")
        .unwrap()
        .unwrap();
    assert!(snapshot.data_dir().exists());
    assert!(snapshot.ledger_path().exists());
    assert!(snapvault::ChecksumLedger::new()
        .load(&snapshot)
        .unwrap()
        .is_empty());
}

#[test]
fn test_cycle_log_records_outcome() {
    let harness = VaultHarness::new();
    harness.write_source("a.txt", b"payload");

    let result = harness.run();
    let log_path = result.log_path.expect("cycle log created");
    let log = fs::read_to_string(&log_path).unwrap();
    assert!(log.starts_with("# snapvault cycle"));
    assert!(log.trim_end().ends_with("### cycle-status: success"));

    // Log lives under the label's logs directory, named after the snapshot
    let expected = harness
        .orchestrator
        .store()
        .logs_dir("home")
        .join(format!("{}.log", result.snapshot_id.unwrap()));
    assert_eq!(log_path, expected);
}

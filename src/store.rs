//! Snapshot store: on-disk layout and directory lifecycle
//!
//! The store owns every directory under the backup root and is the only
//! component allowed to create, rename, or remove snapshot trees. Layout:
//!
//! ```text
//! backup_root/
//! └── <label>/
//!     ├── lock                     # per-label exclusive lock (pid inside)
//!     ├── cache/
//!     │   ├── last_verification    # verification scheduler state
//!     │   └── last_report          # reporter state
//!     ├── logs/
//!     │   └── <snapshot_id>.log    # one log per cycle
//!     └── snapshots/
//!         ├── incomplete-<id>/     # staging directory, never retained
//!         └── <id>/
//!             ├── data/            # transferred tree (hardlinked vs. prior)
//!             ├── meta.json        # status + verification timestamp
//!             └── checksums.jsonl  # checksum ledger
//! ```
//!
//! Unchanged files in `data/` share inodes with the previous snapshot; the
//! transport performs the linking during transfer and the store only
//! guarantees the base directory stays untouched while a transfer runs.
//! Deletion therefore relies entirely on the filesystem's link-count
//! semantics: removing one snapshot can never alter bytes reachable from
//! another.

use crate::error::{Result, VaultError};
use crate::types::{Snapshot, SnapshotId, SnapshotMeta, SnapshotStatus};
use crate::utils;
use chrono::{DateTime, Utc};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Prefix of staging directories; anything carrying it is non-complete
pub const STAGING_PREFIX: &str = "incomplete-";

/// Snapshot store rooted at `{backup_root}`
///
/// All operations for a label must run under the label's [`LabelLock`];
/// acquiring it is the first step of every cycle.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: PathBuf,
}

/// Exclusive per-label lock, held for the duration of one cycle
///
/// Backed by a lock file containing the owner pid. Dropped (or crashed)
/// owners are detected via the pid: a lock whose process is gone is
/// reclaimed instead of blocking the label forever.
#[derive(Debug)]
pub struct LabelLock {
    path: PathBuf,
    label: String,
}

impl Drop for LabelLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!("Failed to remove lock file for '{}': {}", self.label, e);
        }
    }
}

/// A snapshot directory mid-transfer
///
/// Created by [`SnapshotStore::create_pending`]; the orchestrator marks it
/// transferred once the transport exits cleanly, and only then can
/// [`SnapshotStore::promote`] move it out of the staging prefix.
#[derive(Debug)]
pub struct PendingSnapshot {
    /// Identifier the snapshot will carry once promoted
    pub id: SnapshotId,
    /// Backup label
    pub label: String,
    /// Staging directory (`incomplete-<id>`)
    pub path: PathBuf,
    /// Data directory of the base snapshot, for `--link-dest` style linking
    pub link_base: Option<PathBuf>,
    /// Whether this staging directory was adopted from an earlier aborted run
    pub resumed: bool,
    transfer_complete: bool,
}

impl PendingSnapshot {
    /// Directory the transport writes into
    pub fn data_dir(&self) -> PathBuf {
        self.path.join("data")
    }

    /// Record that the transport finished without fatal error
    ///
    /// No other operation ever toggles a snapshot toward `complete`.
    pub fn mark_transferred(&mut self) {
        self.transfer_complete = true;
    }
}

impl SnapshotStore {
    /// Open a store at the backup root, creating it if absent
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        utils::create_dir_racy(&root)?;
        Ok(Self { root })
    }

    /// Backup root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Root directory of one label
    pub fn label_root(&self, label: &str) -> PathBuf {
        self.root.join(label)
    }

    /// Directory of snapshot directories for a label
    pub fn snapshots_dir(&self, label: &str) -> PathBuf {
        self.label_root(label).join("snapshots")
    }

    /// Per-cycle log directory for a label
    pub fn logs_dir(&self, label: &str) -> PathBuf {
        self.label_root(label).join("logs")
    }

    /// Scheduler/reporter state directory for a label
    pub fn cache_dir(&self, label: &str) -> PathBuf {
        self.label_root(label).join("cache")
    }

    /// Create the per-label directory skeleton
    pub fn ensure_label_dirs(&self, label: &str) -> Result<()> {
        utils::create_dir_racy(&self.snapshots_dir(label))?;
        utils::create_dir_racy(&self.logs_dir(label))?;
        utils::create_dir_racy(&self.cache_dir(label))?;
        Ok(())
    }

    /// Acquire the exclusive per-label lock, failing fast when contended
    ///
    /// # Errors
    ///
    /// [`VaultError::LockHeld`] when another live process holds the lock.
    /// A lock file left behind by a dead process is reclaimed.
    pub fn lock(&self, label: &str) -> Result<LabelLock> {
        self.ensure_label_dirs(label)?;
        let path = self.label_root(label).join("lock");

        for attempt in 0..2 {
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(file) => {
                    use std::io::Write;
                    let mut file = file;
                    writeln!(file, "{}", std::process::id())?;
                    debug!("Acquired lock for label '{}'", label);
                    return Ok(LabelLock {
                        path,
                        label: label.to_string(),
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    let pid = fs::read_to_string(&path)
                        .ok()
                        .and_then(|s| s.trim().parse::<u32>().ok())
                        .unwrap_or(0);

                    if attempt == 0 && !process_alive(pid) {
                        warn!(
                            "Reclaiming stale lock for '{}' (pid {} is gone)",
                            label, pid
                        );
                        fs::remove_file(&path).ok();
                        continue;
                    }

                    return Err(VaultError::LockHeld {
                        label: label.to_string(),
                        pid,
                    });
                }
                Err(e) => return Err(e.into()),
            }
        }
        unreachable!("lock loop exits via return")
    }

    /// Allocate a staging directory for a new snapshot
    ///
    /// If a staging directory from an earlier aborted run exists it is
    /// adopted (renamed to the new id) so the transport can resume into it;
    /// otherwise a fresh `incomplete-<id>/data` tree is created. The base
    /// snapshot, when given, is only recorded as the hardlink source; the
    /// store never touches it.
    pub fn create_pending(
        &self,
        label: &str,
        base: Option<&Snapshot>,
    ) -> Result<PendingSnapshot> {
        self.ensure_label_dirs(label)?;
        // Ids are second-resolution; keep allocation monotonic even when
        // cycles run back-to-back within one second.
        let mut id = SnapshotId::now();
        if let Some(latest) = self.list(label)?.first() {
            if latest.id >= id {
                id = SnapshotId::from_timestamp(
                    latest.id.created_at() + chrono::Duration::seconds(1),
                );
            }
        }
        let path = self
            .snapshots_dir(label)
            .join(format!("{}{}", STAGING_PREFIX, id));

        let mut resumed = false;
        if let Some(stale) = self.find_staging_dir(label)? {
            info!("Adopting incomplete snapshot {:?} for resume", stale);
            if stale != path {
                fs::rename(&stale, &path)?;
            }
            resumed = true;
        }
        utils::create_dir_racy(&path.join("data"))?;

        let meta = SnapshotMeta {
            status: SnapshotStatus::InProgress,
            created_at: id.created_at(),
            last_verified_at: None,
        };
        self.write_meta(&path, &meta)?;

        debug!("Created pending snapshot {} for '{}'", id, label);
        Ok(PendingSnapshot {
            id,
            label: label.to_string(),
            path,
            link_base: base.map(|s| s.data_dir()),
            resumed,
            transfer_complete: false,
        })
    }

    /// Promote a staging directory into a complete snapshot
    ///
    /// Atomically renames the directory out of the staging prefix. Fails
    /// with [`VaultError::IncompleteTransfer`] when the transfer was never
    /// marked complete, and [`VaultError::Promotion`] when the rename
    /// itself fails.
    pub fn promote(&self, pending: PendingSnapshot) -> Result<Snapshot> {
        if !pending.transfer_complete {
            return Err(VaultError::IncompleteTransfer(pending.id.to_string()));
        }

        let final_path = self.snapshots_dir(&pending.label).join(pending.id.to_string());
        fs::rename(&pending.path, &final_path).map_err(|e| {
            VaultError::promotion(format!(
                "rename {:?} -> {:?}: {}",
                pending.path, final_path, e
            ))
        })?;

        let meta = SnapshotMeta {
            status: SnapshotStatus::Complete,
            created_at: pending.id.created_at(),
            last_verified_at: None,
        };
        self.write_meta(&final_path, &meta)?;

        info!("Promoted snapshot {} for '{}'", pending.id, pending.label);
        Ok(Snapshot {
            id: pending.id,
            label: pending.label,
            path: final_path,
            status: SnapshotStatus::Complete,
            last_verified_at: None,
        })
    }

    /// Mark an aborted staging directory as failed
    ///
    /// The directory keeps its staging prefix so no later cycle can ever
    /// mistake it for valid data; `gc` removes it.
    pub fn abandon(&self, pending: &PendingSnapshot) -> Result<()> {
        let meta = SnapshotMeta {
            status: SnapshotStatus::Failed,
            created_at: pending.id.created_at(),
            last_verified_at: None,
        };
        self.write_meta(&pending.path, &meta)?;
        warn!("Abandoned snapshot {} for '{}'", pending.id, pending.label);
        Ok(())
    }

    /// List complete snapshots for a label, newest first
    ///
    /// Staging directories are never included.
    pub fn list(&self, label: &str) -> Result<Vec<Snapshot>> {
        let dir = self.snapshots_dir(label);
        let mut snapshots = Vec::new();

        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(snapshots),
            Err(e) => return Err(e.into()),
        };

        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with(STAGING_PREFIX) {
                continue;
            }
            let Ok(id) = name.parse::<SnapshotId>() else {
                continue;
            };

            let path = entry.path();
            let meta = self.read_meta(&path)?;
            snapshots.push(Snapshot {
                id,
                label: label.to_string(),
                path,
                status: meta.status,
                last_verified_at: meta.last_verified_at,
            });
        }

        snapshots.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(snapshots)
    }

    /// Most recent complete snapshot, if any
    pub fn latest(&self, label: &str) -> Result<Option<Snapshot>> {
        Ok(self
            .list(label)?
            .into_iter()
            .find(|s| s.status.is_complete()))
    }

    /// Look up a single snapshot by id
    pub fn get(&self, label: &str, id: SnapshotId) -> Result<Snapshot> {
        self.list(label)?
            .into_iter()
            .find(|s| s.id == id)
            .ok_or_else(|| VaultError::SnapshotNotFound(id.to_string()))
    }

    /// Update a snapshot's status and verification timestamp
    ///
    /// The only post-promotion mutation; file content is never touched.
    pub fn set_status(
        &self,
        snapshot: &mut Snapshot,
        status: SnapshotStatus,
        verified_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let meta = SnapshotMeta {
            status,
            created_at: snapshot.created_at(),
            last_verified_at: verified_at.or(snapshot.last_verified_at),
        };
        self.write_meta(&snapshot.path, &meta)?;
        snapshot.status = status;
        snapshot.last_verified_at = meta.last_verified_at;
        Ok(())
    }

    /// Remove a snapshot directory tree
    ///
    /// Best-effort: files that vanish mid-walk or resist removal are
    /// collected into one [`VaultError::Deletion`] instead of aborting.
    /// Sibling snapshots sharing inodes are unaffected; the filesystem's
    /// link counts keep shared content alive.
    pub fn delete(&self, snapshot: &Snapshot) -> Result<()> {
        info!("Deleting snapshot {} for '{}'", snapshot.id, snapshot.label);

        match fs::remove_dir_all(&snapshot.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(first) => {
                // Retry file-by-file so one stubborn entry does not leave
                // the rest of the tree behind.
                let mut failures = Vec::new();
                for entry in walkdir::WalkDir::new(&snapshot.path)
                    .contents_first(true)
                    .into_iter()
                    .filter_map(|e| e.ok())
                {
                    let result = if entry.file_type().is_dir() {
                        fs::remove_dir(entry.path())
                    } else {
                        fs::remove_file(entry.path())
                    };
                    if let Err(e) = result {
                        if e.kind() != std::io::ErrorKind::NotFound {
                            failures.push(format!("{:?}: {}", entry.path(), e));
                        }
                    }
                }

                if snapshot.path.exists() {
                    let reason = if failures.is_empty() {
                        first.to_string()
                    } else {
                        failures.join("; ")
                    };
                    Err(VaultError::Deletion {
                        id: snapshot.id.to_string(),
                        reason,
                    })
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Remove abandoned staging directories for a label
    ///
    /// Returns the ids of the directories that were collected.
    pub fn gc(&self, label: &str) -> Result<Vec<SnapshotId>> {
        let mut collected = Vec::new();
        while let Some(path) = self.find_staging_dir(label)? {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let id = name
                .strip_prefix(STAGING_PREFIX)
                .and_then(|s| s.parse::<SnapshotId>().ok());

            info!("Garbage-collecting staging directory {:?}", path);
            fs::remove_dir_all(&path)?;
            if let Some(id) = id {
                collected.push(id);
            }
        }
        Ok(collected)
    }

    /// Find a leftover staging directory, if one exists
    pub fn find_staging_dir(&self, label: &str) -> Result<Option<PathBuf>> {
        let dir = self.snapshots_dir(label);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            if entry.file_name().to_string_lossy().starts_with(STAGING_PREFIX) {
                return Ok(Some(entry.path()));
            }
        }
        Ok(None)
    }

    fn write_meta(&self, snapshot_dir: &Path, meta: &SnapshotMeta) -> Result<()> {
        let json = serde_json::to_vec_pretty(meta)?;
        utils::atomic_write(&snapshot_dir.join("meta.json"), &json)
    }

    fn read_meta(&self, snapshot_dir: &Path) -> Result<SnapshotMeta> {
        let path = snapshot_dir.join("meta.json");
        match fs::read(&path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            // Pre-metadata archives: a promoted directory without a sidecar
            // is by construction a complete snapshot.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(SnapshotMeta {
                status: SnapshotStatus::Complete,
                created_at: Utc::now(),
                last_verified_at: None,
            }),
            Err(e) => Err(e.into()),
        }
    }
}

/// Check whether a pid refers to a live process
#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    // kill(pid, 0) probes existence without sending a signal.
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    // Without a cheap liveness probe, treat every lock as live.
    true
}

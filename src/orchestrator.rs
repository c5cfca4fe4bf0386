//! Backup orchestrator: drives one full cycle per invocation
//!
//! A cycle walks a fixed sequence of phases:
//!
//! ```text
//! idle -> locking -> transferring -> promoting -> retaining -> verifying -> reporting
//! ```
//!
//! with `aborted` reachable from any non-idle phase. Whatever happens,
//! exactly one [`CycleResult`] is produced and handed to the [`Reporter`];
//! a cycle that cannot even acquire its lock still reports.
//!
//! Phase rules:
//! - retention runs only after a successful promotion, so a failed transfer
//!   can never shrink the archive
//! - verification is driven by its own schedule, independent of whether
//!   retention deleted anything
//! - stage-local errors (ledger, retention, verification, log pruning) are
//!   collected into the report and downgrade the cycle to `partial`;
//!   transfer and promotion errors abort the remaining mutating phases
//!
//! The transport and the report delivery channel are trait seams
//! ([`Transport`], [`Reporter`]); the built-in implementations are a thin
//! rsync child-process wrapper and a structured-logging reporter.

use crate::config::{Settings, TransferMode, TransferSettings};
use crate::error::{Result, VaultError};
use crate::ledger::ChecksumLedger;
use crate::retention;
use crate::store::{PendingSnapshot, SnapshotStore};
use crate::types::{CycleResult, CycleStatus, SnapshotId, TransferStats};
use crate::utils;
use crate::verify::VerificationScheduler;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Instant;
use tracing::{debug, error, info, instrument, warn};

/// Name of the persisted reporter state file
const LAST_REPORT_FILE: &str = "last_report";

/// Marker line appended to a cycle log when the cycle ends
const STATUS_LINE_PREFIX: &str = "### cycle-status: ";

/// Phase of the cycle state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CyclePhase {
    Idle,
    Locking,
    Transferring,
    Promoting,
    Retaining,
    Verifying,
    Reporting,
    Aborted,
}

impl fmt::Display for CyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CyclePhase::Idle => "idle",
            CyclePhase::Locking => "locking",
            CyclePhase::Transferring => "transferring",
            CyclePhase::Promoting => "promoting",
            CyclePhase::Retaining => "retaining",
            CyclePhase::Verifying => "verifying",
            CyclePhase::Reporting => "reporting",
            CyclePhase::Aborted => "aborted",
        };
        write!(f, "{}", s)
    }
}

/// Everything a transport needs to run one transfer
#[derive(Debug)]
pub struct TransferRequest<'a> {
    /// Transport configuration from the label's config
    pub settings: &'a TransferSettings,
    /// Staging data directory the transport writes into
    pub dest_dir: &'a Path,
    /// Data directory of the previous snapshot, for hardlink deduplication
    pub link_dest: Option<&'a Path>,
    /// Cycle log file; the transport appends its own output here
    pub log_path: &'a Path,
}

/// Seam for the actual data mover
///
/// A transport copies the source tree into `dest_dir`, hardlinking
/// unchanged files against `link_dest` when given. It must treat the link
/// base as strictly read-only.
pub trait Transport {
    fn transfer(&self, request: &TransferRequest<'_>) -> Result<TransferStats>;
}

/// Seam for report delivery
///
/// `send` is called exactly once per cycle. `send_summary` is called when
/// the report interval has elapsed, with the end status of every cycle
/// since the last summary.
pub trait Reporter {
    fn send(&self, result: &CycleResult) -> Result<()>;

    fn send_summary(&self, _label: &str, _entries: &[SummaryEntry]) -> Result<()> {
        Ok(())
    }
}

/// End status of one past cycle, as recovered from its log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SummaryEntry {
    pub id: SnapshotId,
    pub status: String,
}

/// Reporter that emits cycle reports through structured logging
#[derive(Debug, Default, Clone)]
pub struct LogReporter;

impl Reporter for LogReporter {
    fn send(&self, result: &CycleResult) -> Result<()> {
        match result.status {
            CycleStatus::Success => info!("{}", result.summary()),
            CycleStatus::Partial | CycleStatus::Failed => warn!("{}", result.summary()),
        }
        for err in &result.errors {
            warn!("[{}] {}", result.label, err);
        }
        if let Some(verification) = &result.verification {
            info!("[{}] verification: {}", result.label, verification.summary());
        }
        Ok(())
    }

    fn send_summary(&self, label: &str, entries: &[SummaryEntry]) -> Result<()> {
        info!("[{}] summary of {} cycles since last report", label, entries.len());
        for entry in entries {
            info!("[{}]   {} {}", label, entry.id, entry.status);
        }
        Ok(())
    }
}

/// rsync child-process transport
///
/// Builds the minimal command line the archive layout needs (`-a --delete
/// --stats`, `--link-dest`, ssh remote shell) and defers everything else to
/// `additional_options` from the config. rsync's own output goes to the
/// cycle log; exit code 24 (source files vanished mid-transfer) is treated
/// as success with a warning, matching rsync's documented semantics for
/// live source trees.
#[derive(Debug, Default, Clone)]
pub struct RsyncTransport;

impl RsyncTransport {
    fn source_spec(settings: &TransferSettings) -> Result<String> {
        let dir = settings
            .source_dir
            .to_str()
            .ok_or_else(|| VaultError::PathConversion(settings.source_dir.clone().into()))?;
        // Trailing slash: transfer the directory's contents, not the
        // directory itself.
        let dir = format!("{}/", dir.trim_end_matches('/'));
        match settings.mode {
            TransferMode::Local => Ok(dir),
            TransferMode::Ssh => {
                let host = settings.source_host.as_deref().unwrap_or_default();
                let user = settings.ssh_user.as_deref().unwrap_or_default();
                Ok(format!("{}@{}:{}", user, host, dir))
            }
        }
    }

    fn build_command(&self, request: &TransferRequest<'_>) -> Result<Command> {
        let settings = request.settings;
        let mut cmd = Command::new(&settings.pathname);
        cmd.arg("-a").arg("--delete").arg("--stats");

        if settings.mode == TransferMode::Ssh {
            let mut shell = String::from("ssh");
            if let Some(key) = &settings.ssh_key {
                shell.push_str(&format!(" -i {}", key.display()));
            }
            cmd.arg("-e").arg(shell);
        }

        for opt in &settings.additional_options {
            cmd.arg(opt);
        }

        if let Some(link) = request.link_dest {
            cmd.arg(format!("--link-dest={}", link.display()));
        }

        cmd.arg(Self::source_spec(settings)?);
        cmd.arg(request.dest_dir);
        Ok(cmd)
    }
}

impl Transport for RsyncTransport {
    fn transfer(&self, request: &TransferRequest<'_>) -> Result<TransferStats> {
        let mut cmd = self.build_command(request)?;

        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(request.log_path)?;
        cmd.stdout(Stdio::from(log.try_clone()?));
        cmd.stderr(Stdio::from(log));
        cmd.stdin(Stdio::null());

        debug!("Running transfer: {:?}", cmd);
        let status = cmd.status()?;
        let code = status.code().unwrap_or(-1);
        match code {
            0 => {}
            // Partial transfer because source files vanished while rsync
            // was running; the snapshot is still consistent.
            24 => warn!("Transfer finished with vanished source files (rsync exit 24)"),
            _ => return Err(VaultError::Transfer { code }),
        }

        let log_text = fs::read_to_string(request.log_path).unwrap_or_default();
        Ok(parse_rsync_stats(&log_text))
    }
}

/// Extract transfer statistics from rsync `--stats` output
///
/// Tolerates both the old ("Number of files transferred") and new
/// ("Number of regular files transferred") spellings and comma-grouped
/// digits. Anything unparseable stays zero.
pub fn parse_rsync_stats(output: &str) -> TransferStats {
    fn trailing_number(line: &str) -> Option<u64> {
        let after_colon = line.split(':').nth(1)?;
        let digits: String = after_colon
            .trim()
            .chars()
            .take_while(|c| c.is_ascii_digit() || *c == ',')
            .filter(|c| c.is_ascii_digit())
            .collect();
        digits.parse().ok()
    }

    let mut stats = TransferStats::default();
    for line in output.lines() {
        let line = line.trim();
        if line.starts_with("Number of files:") {
            if let Some(n) = trailing_number(line) {
                stats.files_total = n as usize;
            }
        } else if line.starts_with("Number of regular files transferred:")
            || line.starts_with("Number of files transferred:")
        {
            if let Some(n) = trailing_number(line) {
                stats.files_transferred = n as usize;
            }
        } else if line.starts_with("Total transferred file size:") {
            if let Some(n) = trailing_number(line) {
                stats.transferred_bytes = n;
            }
        }
    }
    stats
}

/// Drives backup cycles for one label
pub struct Orchestrator<T: Transport, R: Reporter> {
    settings: Settings,
    store: SnapshotStore,
    ledger: ChecksumLedger,
    scheduler: VerificationScheduler,
    transport: T,
    reporter: R,
    phase: Mutex<CyclePhase>,
}

impl<T: Transport, R: Reporter> Orchestrator<T, R> {
    /// Open the store and wire up the components for one label
    pub fn new(settings: Settings, transport: T, reporter: R) -> Result<Self> {
        let store = SnapshotStore::open(&settings.backup_root)?;
        let ledger = ChecksumLedger::new();
        let scheduler = VerificationScheduler::new(
            store.clone(),
            ledger.clone(),
            settings.verification_interval_days,
        );
        Ok(Self {
            settings,
            store,
            ledger,
            scheduler,
            transport,
            reporter,
            phase: Mutex::new(CyclePhase::Idle),
        })
    }

    /// Current phase of the state machine
    pub fn phase(&self) -> CyclePhase {
        *self.phase.lock()
    }

    /// The snapshot store this orchestrator operates on
    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }

    /// The transport this orchestrator drives
    pub fn transport(&self) -> &T {
        &self.transport
    }

    fn set_phase(&self, phase: CyclePhase) {
        debug!("[{}] phase -> {}", self.settings.label, phase);
        *self.phase.lock() = phase;
    }

    /// Run one full backup cycle
    ///
    /// Never returns an error: every failure mode ends up inside the
    /// returned [`CycleResult`], which has also been handed to the reporter.
    #[instrument(skip(self), fields(label = %self.settings.label))]
    pub fn run_cycle(&self) -> CycleResult {
        let start = Instant::now();
        let now = Utc::now();
        let label = self.settings.label.clone();
        let mut result = CycleResult::new(&label);

        if let Some(mask) = self.settings.umask {
            apply_umask(mask);
        }

        self.set_phase(CyclePhase::Locking);
        let guard = match self.store.lock(&label) {
            Ok(guard) => guard,
            Err(e) => {
                error!("Cannot start cycle for '{}': {}", label, e);
                result.errors.push(e.to_string());
                return self.finish(result, start, CyclePhase::Aborted, now);
            }
        };

        match self.run_locked(&mut result, now) {
            Ok(()) => {
                result.status = if result.errors.is_empty() && result.deletion_failures.is_empty()
                {
                    CycleStatus::Success
                } else {
                    CycleStatus::Partial
                };
                drop(guard);
                self.finish(result, start, CyclePhase::Reporting, now)
            }
            Err(e) => {
                error!("Cycle for '{}' aborted: {}", label, e);
                result.errors.push(e.to_string());
                result.status = CycleStatus::Failed;
                drop(guard);
                self.finish(result, start, CyclePhase::Aborted, now)
            }
        }
    }

    /// The mutating phases, run under the label lock
    ///
    /// An `Err` here aborts the cycle; recoverable stage errors are pushed
    /// into `result.errors` instead.
    fn run_locked(&self, result: &mut CycleResult, now: DateTime<Utc>) -> Result<()> {
        let label = &self.settings.label;

        self.set_phase(CyclePhase::Transferring);
        let base = self.store.latest(label)?;
        let mut pending = self.store.create_pending(label, base.as_ref())?;
        if pending.resumed {
            info!("Resuming interrupted transfer into {:?}", pending.path);
        }

        let log_path = self.open_cycle_log(&pending)?;
        result.log_path = Some(log_path.clone());

        let dest_dir = pending.data_dir();
        let request = TransferRequest {
            settings: &self.settings.transfer,
            dest_dir: &dest_dir,
            link_dest: pending.link_base.as_deref(),
            log_path: &log_path,
        };
        match self.transport.transfer(&request) {
            Ok(stats) => {
                info!(
                    "Transfer for '{}' complete: {} of {} files, {}",
                    label,
                    stats.files_transferred,
                    stats.files_total,
                    utils::format_bytes(stats.transferred_bytes)
                );
                result.transfer = Some(stats);
            }
            Err(e) => {
                // The staging directory keeps its prefix; the next cycle
                // may resume into it.
                self.store.abandon(&pending)?;
                return Err(e);
            }
        }

        self.set_phase(CyclePhase::Promoting);
        pending.mark_transferred();
        let snapshot = self.store.promote(pending)?;
        result.snapshot_id = Some(snapshot.id);

        if let Err(e) = self.ledger.record(&snapshot, base.as_ref()) {
            warn!("Checksum recording failed for {}: {}", snapshot.id, e);
            result.errors.push(format!("checksum recording: {}", e));
        }

        self.set_phase(CyclePhase::Retaining);
        match retention::rotate(&self.store, label, &self.settings.retention) {
            Ok(outcome) => {
                result.deleted_snapshots = outcome.deleted;
                result.deletion_failures = outcome.failures;
            }
            Err(e) => {
                warn!("Retention pass failed for '{}': {}", label, e);
                result.errors.push(format!("retention: {}", e));
            }
        }

        self.set_phase(CyclePhase::Verifying);
        match self.scheduler.run_if_due(label, now) {
            Ok(verification) => result.verification = verification,
            Err(e) => {
                warn!("Verification failed for '{}': {}", label, e);
                result.errors.push(format!("verification: {}", e));
            }
        }

        if let Err(e) = self.prune_logs(&log_path, now) {
            warn!("Log pruning failed for '{}': {}", label, e);
            result.errors.push(format!("log pruning: {}", e));
        }

        Ok(())
    }

    /// Terminal path of every cycle: close the log, report, update state
    fn finish(
        &self,
        mut result: CycleResult,
        start: Instant,
        end_phase: CyclePhase,
        now: DateTime<Utc>,
    ) -> CycleResult {
        self.set_phase(end_phase);
        result.duration_ms = start.elapsed().as_millis() as u64;

        if let Some(log_path) = &result.log_path {
            if let Err(e) = append_status_line(log_path, result.status) {
                warn!("Cannot finalize cycle log {:?}: {}", log_path, e);
            }
        }

        self.set_phase(CyclePhase::Reporting);
        if let Err(e) = self.reporter.send(&result) {
            // Report delivery failure must never fail the cycle itself.
            error!("Report delivery failed for '{}': {}", result.label, e);
        }
        if let Err(e) = self.send_summary_if_due(now) {
            error!("Summary report failed for '{}': {}", result.label, e);
        }

        self.set_phase(CyclePhase::Idle);
        result
    }

    fn open_cycle_log(&self, pending: &PendingSnapshot) -> Result<PathBuf> {
        let path = self
            .store
            .logs_dir(&pending.label)
            .join(format!("{}.log", pending.id));
        let mut file = File::create(&path)?;
        writeln!(
            file,
            "# snapvault cycle {} for '{}' started {}",
            pending.id,
            pending.label,
            Utc::now().to_rfc3339()
        )?;
        Ok(path)
    }

    /// Remove cycle logs older than the configured retention window
    ///
    /// `retention.logs = 0` keeps logs forever. The current cycle's log is
    /// always kept regardless of its timestamp.
    fn prune_logs(&self, current: &Path, now: DateTime<Utc>) -> Result<usize> {
        let days = self.settings.log_retention_days;
        if days == 0 {
            return Ok(0);
        }
        let cutoff = now - chrono::Duration::days(days as i64);

        let mut pruned = 0;
        for entry in fs::read_dir(self.store.logs_dir(&self.settings.label))? {
            let entry = entry?;
            let path = entry.path();
            if path == current {
                continue;
            }
            let Some(id) = log_file_id(&path) else {
                continue;
            };
            if id.created_at() < cutoff {
                debug!("Pruning old cycle log {:?}", path);
                fs::remove_file(&path)?;
                pruned += 1;
            }
        }
        Ok(pruned)
    }

    /// Deliver an interval-gated summary of recent cycle outcomes
    ///
    /// With `report_interval = 0` every cycle already got its own report,
    /// so no summary is assembled. The first call only initializes the
    /// timestamp, mirroring the verification scheduler.
    fn send_summary_if_due(&self, now: DateTime<Utc>) -> Result<()> {
        let interval = self.settings.reporting.report_interval_days;
        if interval == 0 {
            return Ok(());
        }

        let label = &self.settings.label;
        let state_file = self.store.cache_dir(label).join(LAST_REPORT_FILE);
        let Some(last_report) = utils::read_timestamp_file(&state_file)? else {
            utils::write_timestamp_file(&state_file, now)?;
            return Ok(());
        };
        if (now - last_report).num_days() < interval as i64 {
            return Ok(());
        }

        let entries = self.collect_statuses_since(last_report)?;
        self.reporter.send_summary(label, &entries)?;
        utils::write_timestamp_file(&state_file, now)
    }

    /// Recover the end status of every cycle log newer than `since`
    fn collect_statuses_since(&self, since: DateTime<Utc>) -> Result<Vec<SummaryEntry>> {
        let mut entries = Vec::new();
        for dir_entry in fs::read_dir(self.store.logs_dir(&self.settings.label))? {
            let path = dir_entry?.path();
            let Some(id) = log_file_id(&path) else {
                continue;
            };
            if id.created_at() <= since {
                continue;
            }

            let mut status = String::from("unknown");
            for line in BufReader::new(File::open(&path)?).lines() {
                if let Some(s) = line?.strip_prefix(STATUS_LINE_PREFIX) {
                    status = s.trim().to_string();
                }
            }
            entries.push(SummaryEntry { id, status });
        }
        entries.sort_by_key(|e| e.id);
        Ok(entries)
    }
}

/// Snapshot id encoded in a cycle log filename, if any
fn log_file_id(path: &Path) -> Option<SnapshotId> {
    let stem = path.file_stem()?.to_str()?;
    if path.extension()?.to_str()? != "log" {
        return None;
    }
    stem.parse().ok()
}

fn append_status_line(log_path: &Path, status: CycleStatus) -> Result<()> {
    let mut file = OpenOptions::new().append(true).open(log_path)?;
    writeln!(file, "{}{}", STATUS_LINE_PREFIX, status)?;
    Ok(())
}

#[cfg(unix)]
fn apply_umask(mask: u32) {
    unsafe {
        libc::umask(mask as libc::mode_t);
    }
}

#[cfg(not(unix))]
fn apply_umask(_mask: u32) {}

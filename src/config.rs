//! Configuration loading and validation
//!
//! Backup configuration lives in INI-style files: one global file with
//! defaults and one file per backup label. A label file overrides the
//! global file key by key. Values support simple cross-section
//! interpolation in the form `${section:key}` (or `${key}` for the
//! current section).
//!
//! Sections and keys:
//!
//! ```text
//! [general]    label, backup_root, umask, verification_interval
//! [rsync]      mode (ssh|local), source_dir, source_host, ssh_user,
//!              ssh_key, pathname, additional_options
//! [reporting]  smtp_server, from_addr, to_addrs, link_to_logs, base_url,
//!              report_interval
//! [retention]  snapshot, daily, monthly, yearly, logs
//! ```
//!
//! All parse and validation failures map to [`VaultError::Config`] and
//! fail a cycle before any filesystem mutation.

use crate::error::{Result, VaultError};
use crate::types::RetentionPolicy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Maximum interpolation nesting before a cycle is assumed
const MAX_INTERPOLATION_DEPTH: usize = 10;

/// A parsed INI document: sections of key/value pairs
#[derive(Debug, Clone, Default)]
pub struct IniDocument {
    sections: BTreeMap<String, BTreeMap<String, String>>,
}

impl IniDocument {
    /// Parse INI text
    ///
    /// Lines are `key = value` (or `key: value`) grouped under
    /// `[section]` headers; `#` and `;` start comments.
    pub fn parse(text: &str) -> Result<Self> {
        let mut doc = IniDocument::default();
        let mut current: Option<String> = None;

        for (lineno, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }

            if let Some(name) = line.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
                let name = name.trim().to_string();
                doc.sections.entry(name.clone()).or_default();
                current = Some(name);
                continue;
            }

            let Some(section) = current.as_ref() else {
                return Err(VaultError::config(format!(
                    "line {}: key outside of any section",
                    lineno + 1
                )));
            };

            let split = line
                .split_once('=')
                .or_else(|| line.split_once(':'))
                .ok_or_else(|| {
                    VaultError::config(format!("line {}: expected 'key = value'", lineno + 1))
                })?;
            doc.sections
                .entry(section.clone())
                .or_default()
                .insert(split.0.trim().to_string(), split.1.trim().to_string());
        }

        Ok(doc)
    }

    /// Read and parse an INI file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| VaultError::config(format!("cannot read {:?}: {}", path, e)))?;
        Self::parse(&text)
    }

    /// Raw (uninterpolated) lookup
    pub fn get_raw(&self, section: &str, key: &str) -> Option<&str> {
        self.sections.get(section)?.get(key).map(String::as_str)
    }
}

/// A label configuration layered over the global defaults
///
/// Lookups try the label document first and fall back to the global one;
/// interpolation placeholders resolve through the same layered view, so a
/// label file can refer to `${general:label}` defined in itself while a
/// global default supplies the rest of the value.
#[derive(Debug, Clone)]
pub struct ConfigSet {
    global: IniDocument,
    label: IniDocument,
}

impl ConfigSet {
    /// Layer a label document over a global one
    pub fn new(global: IniDocument, label: IniDocument) -> Self {
        Self { global, label }
    }

    /// Load global and label configuration files
    pub fn load(global_path: &Path, label_path: &Path) -> Result<Self> {
        Ok(Self::new(
            IniDocument::load(global_path)?,
            IniDocument::load(label_path)?,
        ))
    }

    fn get_raw(&self, section: &str, key: &str) -> Option<&str> {
        self.label
            .get_raw(section, key)
            .or_else(|| self.global.get_raw(section, key))
    }

    /// Interpolated lookup
    pub fn get(&self, section: &str, key: &str) -> Result<Option<String>> {
        match self.get_raw(section, key) {
            Some(raw) => Ok(Some(self.interpolate(section, raw, 0)?)),
            None => Ok(None),
        }
    }

    fn require(&self, section: &str, key: &str) -> Result<String> {
        self.get(section, key)?.ok_or_else(|| {
            VaultError::config(format!("missing required key [{}] {}", section, key))
        })
    }

    fn get_int(&self, section: &str, key: &str, default: i64) -> Result<i64> {
        match self.get(section, key)? {
            Some(v) => v.trim().parse().map_err(|_| {
                VaultError::config(format!("[{}] {} is not an integer: '{}'", section, key, v))
            }),
            None => Ok(default),
        }
    }

    fn get_bool(&self, section: &str, key: &str, default: bool) -> Result<bool> {
        match self.get(section, key)? {
            Some(v) => match v.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                other => Err(VaultError::config(format!(
                    "[{}] {} is not a boolean: '{}'",
                    section, key, other
                ))),
            },
            None => Ok(default),
        }
    }

    /// Expand `${section:key}` and `${key}` placeholders
    fn interpolate(&self, current_section: &str, value: &str, depth: usize) -> Result<String> {
        if depth >= MAX_INTERPOLATION_DEPTH {
            return Err(VaultError::config(format!(
                "interpolation too deep (cycle?) while expanding '{}'",
                value
            )));
        }

        let mut out = String::with_capacity(value.len());
        let mut rest = value;
        while let Some(start) = rest.find("${") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let end = after.find('}').ok_or_else(|| {
                VaultError::config(format!("unterminated '${{' in '{}'", value))
            })?;
            let reference = &after[..end];
            let (section, key) = match reference.split_once(':') {
                Some((s, k)) => (s.trim(), k.trim()),
                None => (current_section, reference.trim()),
            };
            let resolved = self.get_raw(section, key).ok_or_else(|| {
                VaultError::config(format!(
                    "interpolation references unknown key [{}] {}",
                    section, key
                ))
            })?;
            out.push_str(&self.interpolate(section, resolved, depth + 1)?);
            rest = &after[end + 1..];
        }
        out.push_str(rest);
        Ok(out)
    }

    /// Build validated, typed settings from this configuration
    pub fn settings(&self) -> Result<Settings> {
        let label = self.require("general", "label")?;
        if label.is_empty() || label.contains(['/', '\\']) || label.starts_with('.') {
            return Err(VaultError::config(format!(
                "label '{}' is not a valid directory name",
                label
            )));
        }

        let retention = RetentionPolicy::from_raw(
            self.get_int("retention", "snapshot", 0)?,
            self.get_int("retention", "daily", 0)?,
            self.get_int("retention", "monthly", 0)?,
            self.get_int("retention", "yearly", 0)?,
        )?;

        let verification_interval = self.get_int("general", "verification_interval", 0)?;
        if verification_interval < 0 {
            return Err(VaultError::config(
                "verification_interval must be >= 0".to_string(),
            ));
        }

        let umask = match self.get("general", "umask")? {
            Some(raw) => {
                let digits = raw.trim().trim_start_matches("0o");
                Some(u32::from_str_radix(digits, 8).map_err(|_| {
                    VaultError::config(format!("umask '{}' is not an octal number", raw))
                })?)
            }
            None => None,
        };

        let mode: TransferMode = self.require("rsync", "mode")?.parse()?;
        let transfer = TransferSettings {
            mode,
            source_dir: PathBuf::from(self.require("rsync", "source_dir")?),
            source_host: self.get("rsync", "source_host")?,
            ssh_user: self.get("rsync", "ssh_user")?,
            ssh_key: self.get("rsync", "ssh_key")?.map(PathBuf::from),
            pathname: self
                .get("rsync", "pathname")?
                .unwrap_or_else(|| "rsync".to_string()),
            additional_options: self
                .get("rsync", "additional_options")?
                .map(|s| s.split_whitespace().map(String::from).collect())
                .unwrap_or_default(),
        };
        if mode == TransferMode::Ssh {
            if transfer.source_host.as_deref().unwrap_or("").is_empty() {
                return Err(VaultError::config(
                    "ssh mode requires [rsync] source_host".to_string(),
                ));
            }
            if transfer.ssh_user.as_deref().unwrap_or("").is_empty() {
                return Err(VaultError::config(
                    "ssh mode requires [rsync] ssh_user".to_string(),
                ));
            }
        }

        let to_addrs: Vec<String> = self
            .get("reporting", "to_addrs")?
            .map(|s| {
                s.split(',')
                    .map(|a| a.trim().to_string())
                    .filter(|a| !a.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        let reporting = ReportingSettings {
            smtp_server: self.get("reporting", "smtp_server")?,
            from_addr: self.get("reporting", "from_addr")?,
            to_addrs,
            link_to_logs: self.get_bool("reporting", "link_to_logs", false)?,
            base_url: self.get("reporting", "base_url")?,
            report_interval_days: {
                let v = self.get_int("reporting", "report_interval", 0)?;
                if v < 0 {
                    return Err(VaultError::config(
                        "report_interval must be >= 0".to_string(),
                    ));
                }
                v as u32
            },
        };

        let log_retention_days = {
            let v = self.get_int("retention", "logs", 0)?;
            if v < 0 {
                return Err(VaultError::config(
                    "retention logs must be >= 0".to_string(),
                ));
            }
            v as u32
        };

        Ok(Settings {
            label,
            backup_root: PathBuf::from(self.require("general", "backup_root")?),
            umask,
            verification_interval_days: verification_interval as u32,
            retention,
            log_retention_days,
            transfer,
            reporting,
        })
    }
}

/// How the transport reaches the source tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferMode {
    /// Source is on a remote host reached over SSH
    Ssh,
    /// Source is a local directory
    Local,
}

impl FromStr for TransferMode {
    type Err = VaultError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ssh" => Ok(TransferMode::Ssh),
            "local" => Ok(TransferMode::Local),
            other => Err(VaultError::config(format!(
                "'{}' is not a valid value for mode (expected ssh or local)",
                other
            ))),
        }
    }
}

impl fmt::Display for TransferMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferMode::Ssh => write!(f, "ssh"),
            TransferMode::Local => write!(f, "local"),
        }
    }
}

/// Transport-facing configuration, handed verbatim to the `Transport` seam
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferSettings {
    /// ssh or local
    pub mode: TransferMode,
    /// Directory to back up (on the source host for ssh mode)
    pub source_dir: PathBuf,
    /// Remote host (ssh mode)
    pub source_host: Option<String>,
    /// Remote user (ssh mode)
    pub ssh_user: Option<String>,
    /// SSH identity file (ssh mode)
    pub ssh_key: Option<PathBuf>,
    /// rsync executable path
    pub pathname: String,
    /// Extra command-line options passed through to the transport
    pub additional_options: Vec<String>,
}

/// Reporting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportingSettings {
    /// SMTP relay, when mail reporting is enabled
    pub smtp_server: Option<String>,
    /// Sender address
    pub from_addr: Option<String>,
    /// Recipients; empty disables mail reporting
    pub to_addrs: Vec<String>,
    /// Whether report entries link to cycle logs
    pub link_to_logs: bool,
    /// URL prefix the backup root is served under
    pub base_url: Option<String>,
    /// Days between summary reports (0 = report every cycle)
    pub report_interval_days: u32,
}

/// Validated configuration for one backup label
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Backup label; also the subdirectory name under `backup_root`
    pub label: String,
    /// Root directory of the whole archive
    pub backup_root: PathBuf,
    /// Process umask applied before touching the archive
    pub umask: Option<u32>,
    /// Days between checksum verification runs (0 = disabled)
    pub verification_interval_days: u32,
    /// Tier counters
    pub retention: RetentionPolicy,
    /// Days to keep per-cycle log files (0 = keep forever)
    pub log_retention_days: u32,
    /// Transport settings
    pub transfer: TransferSettings,
    /// Reporting settings
    pub reporting: ReportingSettings,
}

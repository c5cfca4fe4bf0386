//! Error types for the snapvault library
//!
//! This module defines all error types that can occur during backup cycle
//! operations. The taxonomy mirrors the pipeline stages: lock acquisition,
//! transfer, promotion, retention, verification, and configuration. Errors
//! local to one stage (deletion, verification) are collected into the cycle
//! report by the orchestrator; transfer and promotion errors abort the
//! remainder of the cycle.

use std::path::PathBuf;
use thiserror::Error;

/// Type alias for Results in the snapvault library
pub type Result<T> = std::result::Result<T, VaultError>;

/// Main error type for all snapvault operations
#[derive(Debug, Error)]
pub enum VaultError {
    /// I/O errors during file operations
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Errors during JSON serialization/deserialization
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Walk directory error from walkdir crate
    #[error("Walk directory error")]
    WalkDir(#[from] walkdir::Error),

    /// Another cycle already holds the per-label lock
    #[error("Lock held for label '{label}' by pid {pid}")]
    LockHeld {
        /// Backup label whose lock is contended
        label: String,
        /// Process id recorded in the lock file
        pid: u32,
    },

    /// Transport process exited with a nonzero status
    #[error("Transfer failed with exit code {code}")]
    Transfer {
        /// Exit code reported by the transport
        code: i32,
    },

    /// Promotion of a staging directory failed
    #[error("Promotion failed: {0}")]
    Promotion(String),

    /// Transfer did not complete, so the snapshot cannot be promoted
    #[error("Incomplete transfer for snapshot {0}, refusing to promote")]
    IncompleteTransfer(String),

    /// Per-snapshot deletion failure (collected, non-fatal)
    #[error("Failed to delete snapshot {id}: {reason}")]
    Deletion {
        /// Snapshot that could not be fully removed
        id: String,
        /// Underlying failure description
        reason: String,
    },

    /// Checksum mismatch found during verification (data finding, not a
    /// process error; the snapshot is marked corrupt and reported)
    #[error("Checksum mismatch - expected: {expected}, actual: {actual}")]
    HashMismatch {
        /// Expected hash value from the ledger
        expected: String,
        /// Actual computed hash value
        actual: String,
    },

    /// Verification could not be performed
    #[error("Verification failed: {0}")]
    VerificationFailed(String),

    /// Snapshot not found in the store
    #[error("Snapshot not found: {0}")]
    SnapshotNotFound(String),

    /// No checksum ledger exists for the snapshot
    #[error("No checksum ledger for snapshot {0}")]
    LedgerNotFound(String),

    /// Invalid configuration (fails the cycle before any filesystem mutation)
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Path conversion error
    #[error("Path conversion error: {0:?}")]
    PathConversion(std::ffi::OsString),

    /// Path escapes the snapshot root
    #[error("Path {path:?} is not relative to {base:?}")]
    PathOutsideRoot {
        /// Offending path
        path: PathBuf,
        /// Expected base directory
        base: PathBuf,
    },

    /// Generic error for unexpected conditions
    #[error("Internal error: {0}")]
    Internal(String),
}

impl VaultError {
    /// Create a configuration error with a custom message
    pub fn config(msg: impl Into<String>) -> Self {
        VaultError::Config(msg.into())
    }

    /// Create a promotion error with a custom message
    pub fn promotion(msg: impl Into<String>) -> Self {
        VaultError::Promotion(msg.into())
    }

    /// Create an internal error with a custom message
    pub fn internal(msg: impl Into<String>) -> Self {
        VaultError::Internal(msg.into())
    }

    /// Check if this error aborts the remainder of a backup cycle
    ///
    /// Transfer and promotion failures poison everything downstream of the
    /// new snapshot; deletion and verification findings do not.
    pub fn is_fatal_to_cycle(&self) -> bool {
        matches!(
            self,
            VaultError::Transfer { .. }
                | VaultError::Promotion(_)
                | VaultError::IncompleteTransfer(_)
                | VaultError::LockHeld { .. }
                | VaultError::Config(_)
        )
    }

    /// Check if this error indicates corrupted archive data
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            VaultError::HashMismatch { .. } | VaultError::VerificationFailed(_)
        )
    }
}

//! Atomic replacement of an original media file with its encoded version.
//!
//! The swap is rename-based and only valid on a single filesystem: rename the
//! original to `<name>.bak`, rename the candidate into place, then drop the
//! backup unless testing mode wants it kept. Any intermediate state leaves
//! either the original at its path or a `.bak` the scanner recognizes, so a
//! crash never loses the user's bytes.

use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors that can occur during file replacement.
#[derive(Debug, Error)]
pub enum ReplaceError {
    /// Candidate does not clear the savings floor; nothing was touched.
    #[error(
        "output {output_size} bytes does not clear the savings floor \
         ({min_savings_pct}% of {original_size} bytes)"
    )]
    InsufficientSavings {
        original_size: u64,
        output_size: u64,
        min_savings_pct: f64,
    },

    /// Could not stat one of the two files; nothing was touched.
    #[error("failed to inspect {path}: {source}")]
    Inspect {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to move the original aside; nothing was touched.
    #[error("failed to create backup: {0}")]
    BackupFailed(std::io::Error),

    /// Failed to move the candidate into place; the original was restored.
    #[error("failed to swap in encoded file (original restored): {0}")]
    SwapFailed(std::io::Error),

    /// Failed to move the candidate into place AND the rollback failed too;
    /// the original survives at its `.bak` path.
    #[error("swap failed ({swap}) and rollback failed ({rollback}); original is at the .bak path")]
    RollbackFailed {
        swap: std::io::Error,
        rollback: std::io::Error,
    },

    /// Replacement succeeded but the stale backup could not be removed.
    #[error("failed to delete backup: {0}")]
    DeleteBackupFailed(std::io::Error),
}

/// What a successful replacement did.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplaceReport {
    pub original_size: u64,
    pub output_size: u64,
    pub savings_bytes: i64,
    pub savings_percent: f64,
    /// Backup left on disk (testing mode).
    pub backup_kept: bool,
}

/// Backup path for an original file: the full filename plus `.bak`, so
/// `film.mkv` backs up to `film.mkv.bak` next to it.
pub fn backup_path(original: &Path) -> PathBuf {
    let mut backup = original.as_os_str().to_owned();
    backup.push(".bak");
    PathBuf::from(backup)
}

/// Atomically replace `original` with `candidate`.
///
/// Steps:
/// 1. Reject unless the candidate saves at least `min_savings_pct` percent.
/// 2. Rename original -> original.bak (same-volume rename; fails fast
///    rather than degrading to a copy).
/// 3. Rename candidate -> original.
/// 4. Unlink the backup unless `testing_mode` keeps it.
///
/// On a failure after step 2 the backup is renamed back into place.
pub fn safe_replace(
    original: &Path,
    candidate: &Path,
    min_savings_pct: f64,
    testing_mode: bool,
) -> Result<ReplaceReport, ReplaceError> {
    let original_size = fs::metadata(original)
        .map_err(|source| ReplaceError::Inspect {
            path: original.to_path_buf(),
            source,
        })?
        .len();
    let output_size = fs::metadata(candidate)
        .map_err(|source| ReplaceError::Inspect {
            path: candidate.to_path_buf(),
            source,
        })?
        .len();

    // Step 1: savings floor. output > original * (1 - min/100) is a reject.
    let ceiling = original_size as f64 * (1.0 - min_savings_pct / 100.0);
    if output_size as f64 > ceiling {
        return Err(ReplaceError::InsufficientSavings {
            original_size,
            output_size,
            min_savings_pct,
        });
    }

    // Step 2: move the original aside.
    let backup = backup_path(original);
    fs::rename(original, &backup).map_err(ReplaceError::BackupFailed)?;

    // Step 3: move the candidate into place; restore on failure.
    if let Err(swap) = fs::rename(candidate, original) {
        return match fs::rename(&backup, original) {
            Ok(()) => Err(ReplaceError::SwapFailed(swap)),
            Err(rollback) => Err(ReplaceError::RollbackFailed { swap, rollback }),
        };
    }

    // Step 4: drop the backup unless we are keeping originals around.
    if !testing_mode {
        fs::remove_file(&backup).map_err(ReplaceError::DeleteBackupFailed)?;
    }

    let savings_bytes = original_size as i64 - output_size as i64;
    let savings_percent = if original_size > 0 {
        savings_bytes as f64 / original_size as f64 * 100.0
    } else {
        0.0
    };

    Ok(ReplaceReport {
        original_size,
        output_size,
        savings_bytes,
        savings_percent,
        backup_kept: testing_mode,
    })
}

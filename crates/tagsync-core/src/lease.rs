//! Single-run lease.
//!
//! Uses OS-level file locking (via fs2) so that two overlapping invocations
//! never run full passes against the same account at once. A sidecar
//! metadata file records which run holds the lease, for diagnostics.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur during lease operations.
#[derive(Error, Debug)]
pub enum LeaseError {
    /// Another run holds the lease.
    #[error("lease '{key}' held by run {run_id} (pid: {pid}, since: {acquired_at})")]
    Held {
        key: String,
        run_id: Uuid,
        pid: u32,
        acquired_at: DateTime<Utc>,
    },

    /// The lease is held but its metadata is missing or corrupt.
    #[error("lease '{key}' held (metadata unavailable)")]
    HeldNoMeta { key: String },

    /// The lease key cannot be used as a file name.
    #[error("invalid lease key '{0}': use letters, digits, '-', '_' or '.'")]
    InvalidKey(String),

    /// I/O error during lease operations.
    #[error("lease I/O error: {0}")]
    Io(#[from] io::Error),

    /// Failed to serialize/deserialize metadata.
    #[error("lease metadata error: {0}")]
    Metadata(#[from] serde_json::Error),
}

/// Diagnostic metadata written alongside the lock file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseMetadata {
    /// Run that holds the lease.
    pub run_id: Uuid,
    /// Process ID of the holder.
    pub pid: u32,
    pub acquired_at: DateTime<Utc>,
    /// tagsync version of the holder.
    pub version: String,
}

/// Returns true if `key` is usable as a lock file stem.
#[must_use]
pub fn is_valid_key(key: &str) -> bool {
    !key.is_empty()
        && key.len() <= 128
        && !key.starts_with('.')
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

/// An acquired lease. Released when dropped.
#[derive(Debug)]
pub struct RunLease {
    _lock_file: File,
    lock_path: PathBuf,
    meta_path: PathBuf,
    metadata: LeaseMetadata,
}

impl RunLease {
    /// Try to take the lease `key` in `dir` for `run_id`, without waiting.
    pub fn acquire(dir: &Path, key: &str, run_id: Uuid) -> Result<Self, LeaseError> {
        if !is_valid_key(key) {
            return Err(LeaseError::InvalidKey(key.to_string()));
        }
        fs::create_dir_all(dir)?;

        let lock_path = lock_path(dir, key);
        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)?;

        match lock_file.try_lock_exclusive() {
            Ok(()) => {
                let lease = Self {
                    _lock_file: lock_file,
                    meta_path: metadata_path(&lock_path),
                    lock_path,
                    metadata: LeaseMetadata {
                        run_id,
                        pid: std::process::id(),
                        acquired_at: Utc::now(),
                        version: crate::VERSION.to_string(),
                    },
                };
                lease.write_metadata()?;
                tracing::debug!(
                    lock_path = %lease.lock_path.display(),
                    run_id = %run_id,
                    "Acquired run lease"
                );
                Ok(lease)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                Err(read_existing_lease_error(&lock_path, key))
            }
            Err(e) => Err(LeaseError::Io(e)),
        }
    }

    fn write_metadata(&self) -> Result<(), LeaseError> {
        let json = serde_json::to_string_pretty(&self.metadata)?;
        let mut file = File::create(&self.meta_path)?;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;
        Ok(())
    }

    #[must_use]
    pub const fn metadata(&self) -> &LeaseMetadata {
        &self.metadata
    }

    #[must_use]
    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    #[must_use]
    pub fn meta_path(&self) -> &Path {
        &self.meta_path
    }
}

impl Drop for RunLease {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.meta_path) {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::warn!(
                    meta_path = %self.meta_path.display(),
                    error = %e,
                    "Failed to remove lease metadata"
                );
            }
        }
        tracing::debug!(
            lock_path = %self.lock_path.display(),
            run_id = %self.metadata.run_id,
            "Released run lease"
        );
    }
}

fn lock_path(dir: &Path, key: &str) -> PathBuf {
    dir.join(format!("{key}.lock"))
}

fn metadata_path(lock_path: &Path) -> PathBuf {
    let mut meta_path = lock_path.to_path_buf();
    let file_name = lock_path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("lease");
    meta_path.set_file_name(format!("{file_name}.meta.json"));
    meta_path
}

fn read_metadata(lock_path: &Path) -> Option<LeaseMetadata> {
    fs::read_to_string(metadata_path(lock_path))
        .ok()
        .and_then(|contents| serde_json::from_str(&contents).ok())
}

fn read_existing_lease_error(lock_path: &Path, key: &str) -> LeaseError {
    read_metadata(lock_path).map_or_else(
        || LeaseError::HeldNoMeta {
            key: key.to_string(),
        },
        |meta| LeaseError::Held {
            key: key.to_string(),
            run_id: meta.run_id,
            pid: meta.pid,
            acquired_at: meta.acquired_at,
        },
    )
}

/// Report the current holder of lease `key` without taking it.
#[must_use]
pub fn current_holder(dir: &Path, key: &str) -> Option<LeaseMetadata> {
    let lock_path = lock_path(dir, key);
    let lock_file = OpenOptions::new().read(true).write(true).open(&lock_path).ok()?;

    match lock_file.try_lock_exclusive() {
        Ok(()) => None,
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => read_metadata(&lock_path),
        Err(_) => None,
    }
}

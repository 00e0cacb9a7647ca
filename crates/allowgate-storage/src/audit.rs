//! Audit log of denied HTTPS tunnels.
//!
//! Two documents are maintained side by side:
//!
//! - `blocked_https.json`: every denial, in arrival order
//! - `simple_blocked_https.json`: each denied domain once, in first-seen order
//!
//! Each document has its own lock so concurrent connection tasks never
//! interleave read-modify-write cycles on the same file.

use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::data_dir::DataDir;
use crate::error::Result;
use crate::json_file;
use crate::models::BlockedRecord;

/// Outcome of recording one denial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RecordOutcome {
    /// The record was appended to the full log.
    pub appended: bool,
    /// The domain was new to the deduplicated set.
    pub first_seen: bool,
}

/// File-backed audit log for denied tunnels.
#[derive(Debug)]
pub struct AuditLog {
    log_path: PathBuf,
    set_path: PathBuf,
    log_lock: Mutex<()>,
    set_lock: Mutex<()>,
}

impl AuditLog {
    /// Creates an audit log writing to the given pair of files.
    pub fn new(log_path: impl AsRef<Path>, set_path: impl AsRef<Path>) -> Self {
        Self {
            log_path: log_path.as_ref().to_path_buf(),
            set_path: set_path.as_ref().to_path_buf(),
            log_lock: Mutex::new(()),
            set_lock: Mutex::new(()),
        }
    }

    /// Creates an audit log inside the data directory.
    pub fn open(data_dir: &DataDir) -> Self {
        Self::new(data_dir.blocked_log_path(), data_dir.blocked_set_path())
    }

    /// Records a denial. Best-effort: failures are logged and reported as
    /// `false` in the outcome, never returned to the caller.
    pub fn record_denial(&self, domain: &str) -> RecordOutcome {
        let appended = match self.append(BlockedRecord::now(domain)) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("Failed to append blocked record for {}: {}", domain, e);
                false
            }
        };

        let first_seen = match self.upsert(domain) {
            Ok(inserted) => inserted,
            Err(e) => {
                tracing::warn!("Failed to update blocked domain set for {}: {}", domain, e);
                false
            }
        };

        RecordOutcome {
            appended,
            first_seen,
        }
    }

    /// Appends a record to the full log.
    pub fn append(&self, record: BlockedRecord) -> Result<()> {
        let _guard = self.log_lock.lock();
        let mut records: Vec<BlockedRecord> = json_file::read_or_default(&self.log_path);
        records.push(record);
        json_file::write_atomic(&self.log_path, &records)
    }

    /// Inserts a domain into the deduplicated set. Returns `true` if it was new.
    pub fn upsert(&self, domain: &str) -> Result<bool> {
        let _guard = self.set_lock.lock();
        let mut domains: Vec<String> = json_file::read_or_default(&self.set_path);
        if domains.iter().any(|d| d == domain) {
            return Ok(false);
        }

        domains.push(domain.to_string());
        json_file::write_atomic(&self.set_path, &domains)?;
        Ok(true)
    }

    /// Returns every recorded denial.
    pub fn records(&self) -> Vec<BlockedRecord> {
        json_file::read_or_default(&self.log_path)
    }

    /// Returns every domain that has ever been denied.
    pub fn blocked_domains(&self) -> Vec<String> {
        json_file::read_or_default(&self.set_path)
    }
}

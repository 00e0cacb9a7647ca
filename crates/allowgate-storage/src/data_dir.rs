//! On-disk layout of the Allowgate data directory.

use std::path::{Path, PathBuf};

use directories::ProjectDirs;

use crate::error::{Result, StorageError};

const WHITELIST_FILENAME: &str = "whitelist.json";
const BLOCK_PAGE_FILENAME: &str = "blocked.html";
const HTTPS_LOG_DIR: &str = "https_requests";
const BLOCKED_LOG_FILENAME: &str = "blocked_https.json";
const BLOCKED_SET_FILENAME: &str = "simple_blocked_https.json";
const REQUESTS_DIR: &str = "whitelist_requests";
const LOGS_DIR: &str = "logs";

/// Resolves every file the proxy reads or writes relative to one root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    /// Creates a layout rooted at the given directory.
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// Creates a layout rooted at the platform data directory.
    pub fn with_default_dir() -> Result<Self> {
        let proj_dirs = ProjectDirs::from("com", "allowgate", "Allowgate")
            .ok_or_else(|| StorageError::Config("Could not determine app data directory".into()))?;

        Ok(Self::new(proj_dirs.data_dir()))
    }

    /// Creates the root directory if it does not exist yet.
    pub fn ensure(&self) -> Result<()> {
        std::fs::create_dir_all(&self.root)?;
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn whitelist_path(&self) -> PathBuf {
        self.root.join(WHITELIST_FILENAME)
    }

    pub fn block_page_path(&self) -> PathBuf {
        self.root.join(BLOCK_PAGE_FILENAME)
    }

    /// Append-only log of every denied tunnel.
    pub fn blocked_log_path(&self) -> PathBuf {
        self.root.join(HTTPS_LOG_DIR).join(BLOCKED_LOG_FILENAME)
    }

    /// Deduplicated set of every domain ever denied.
    pub fn blocked_set_path(&self) -> PathBuf {
        self.root.join(HTTPS_LOG_DIR).join(BLOCKED_SET_FILENAME)
    }

    pub fn requests_dir(&self) -> PathBuf {
        self.root.join(REQUESTS_DIR)
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join(LOGS_DIR)
    }
}

//! Whole-file JSON documents.
//!
//! Every document is read in full and rewritten in full. Writes go to a
//! uniquely named sibling temp file that is renamed over the target, so
//! readers in other tasks or processes see either the old or the new
//! document, never a torn one. Writers that read-modify-write hold a
//! [`FileLock`] across the whole update.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tempfile::NamedTempFile;

use crate::error::Result;

/// Reads a JSON document, returning `None` when the file does not exist.
pub(crate) fn read<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let contents = match fs::read(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    Ok(Some(serde_json::from_slice(&contents)?))
}

/// Reads a JSON document, substituting the default when the file is missing,
/// unreadable or corrupt.
pub(crate) fn read_or_default<T: DeserializeOwned + Default>(path: &Path) -> T {
    match read(path) {
        Ok(Some(value)) => value,
        Ok(None) => T::default(),
        Err(e) => {
            tracing::warn!("Ignoring unreadable {:?}: {}", path, e);
            T::default()
        }
    }
}

/// Replaces a JSON document atomically, creating parent directories.
pub(crate) fn write_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let parent = parent_dir(path);
    fs::create_dir_all(parent)?;

    let json = serde_json::to_vec_pretty(value)?;
    let mut tmp = NamedTempFile::new_in(parent)?;
    tmp.write_all(&json)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;

    Ok(())
}

/// Exclusive advisory lock on a document, shared with other processes.
///
/// Released when dropped.
#[derive(Debug)]
pub(crate) struct FileLock {
    _file: File,
}

/// Blocks until this process holds the lock for `path`.
///
/// The lock lives on a `<name>.lock` sibling so that renaming a new
/// document over `path` does not drop it.
pub(crate) fn lock(path: &Path) -> Result<FileLock> {
    fs::create_dir_all(parent_dir(path))?;

    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(lock_path(path))?;
    file.lock()?;

    Ok(FileLock { _file: file })
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}

fn lock_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".lock");
    path.with_file_name(name)
}

//! The whitelist file.
//!
//! `whitelist.json` holds a JSON array of domain names. The proxy reloads it
//! on every check, so edits made by `allowgate allow` (or by hand) take
//! effect on the next request without a restart.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::data_dir::DataDir;
use crate::error::{Result, StorageError};
use crate::json_file;

/// Maximum length of a DNS name in presentation format.
const MAX_DOMAIN_LEN: usize = 253;

/// The set of allowed domains at one point in time.
pub type AllowedDomains = HashSet<String>;

/// Anything that can produce the current allowed-domain set.
pub trait DomainSource: Send + Sync {
    /// Loads the current set. Implementations must not fail: an unreadable
    /// backing store yields an empty set.
    fn load(&self) -> AllowedDomains;
}

impl DomainSource for AllowedDomains {
    fn load(&self) -> AllowedDomains {
        self.clone()
    }
}

/// File-backed whitelist.
///
/// Updates are serialized within the process by a mutex and across
/// processes (concurrent `allowgate allow` runs) by a lock file.
#[derive(Debug)]
pub struct WhitelistStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl WhitelistStore {
    /// Creates a store backed by the given file.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }

    /// Creates a store backed by the data directory's whitelist file.
    pub fn open(data_dir: &DataDir) -> Self {
        Self::new(data_dir.whitelist_path())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the stored domains in file order, normalized and deduplicated.
    pub fn domains(&self) -> Vec<String> {
        let raw: Vec<String> = json_file::read_or_default(&self.path);

        let mut seen = HashSet::new();
        raw.iter()
            .filter_map(|d| normalize_domain(d))
            .filter(|d| seen.insert(d.clone()))
            .collect()
    }

    /// Adds a domain. Returns `false` if it was already present.
    pub fn add(&self, domain: &str) -> Result<bool> {
        let domain = validate_domain(domain)?;

        let _guard = self.write_lock.lock();
        let _file_lock = json_file::lock(&self.path)?;
        let mut domains = self.domains();
        if domains.contains(&domain) {
            return Ok(false);
        }

        domains.push(domain.clone());
        json_file::write_atomic(&self.path, &domains)?;
        tracing::info!("Added {} to whitelist", domain);

        Ok(true)
    }

    /// Removes a domain. Returns `false` if it was not present.
    pub fn remove(&self, domain: &str) -> Result<bool> {
        let Some(domain) = normalize_domain(domain) else {
            return Ok(false);
        };

        let _guard = self.write_lock.lock();
        let _file_lock = json_file::lock(&self.path)?;
        let mut domains = self.domains();
        let before = domains.len();
        domains.retain(|d| *d != domain);
        if domains.len() == before {
            return Ok(false);
        }

        json_file::write_atomic(&self.path, &domains)?;
        tracing::info!("Removed {} from whitelist", domain);

        Ok(true)
    }
}

impl DomainSource for WhitelistStore {
    fn load(&self) -> AllowedDomains {
        self.domains().into_iter().collect()
    }
}

/// Brings a stored or user-supplied domain into canonical form: trimmed,
/// lowercase, without leading or trailing dots. Returns `None` if nothing is left.
pub fn normalize_domain(raw: &str) -> Option<String> {
    let domain = raw.trim().trim_matches('.').to_ascii_lowercase();
    if domain.is_empty() {
        None
    } else {
        Some(domain)
    }
}

/// Normalizes a domain and checks that it is a syntactically valid DNS name.
pub fn validate_domain(raw: &str) -> Result<String> {
    let domain =
        normalize_domain(raw).ok_or_else(|| StorageError::InvalidDomain("empty domain".into()))?;

    if domain.len() > MAX_DOMAIN_LEN {
        return Err(StorageError::InvalidDomain(format!(
            "{} exceeds {} characters",
            domain, MAX_DOMAIN_LEN
        )));
    }

    let labels_ok = domain.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-')
    });

    if !labels_ok {
        return Err(StorageError::InvalidDomain(domain));
    }

    Ok(domain)
}

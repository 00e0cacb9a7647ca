//! Intake of whitelist requests.
//!
//! Each accepted request gets its own folder under `whitelist_requests/`
//! holding a timestamped description file and an approval script that an
//! administrator can run to add the domain.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Local;

use crate::data_dir::DataDir;
use crate::error::Result;
use crate::models::WhitelistRequest;
use crate::whitelist::validate_domain;

/// Name of the binary the approval script invokes.
const BINARY_NAME: &str = "allowgate";

/// Files written for one accepted request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmittedRequest {
    pub domain: String,
    pub description_path: PathBuf,
    pub script_path: PathBuf,
}

/// Writes whitelist requests to disk for later review.
#[derive(Debug, Clone)]
pub struct RequestIntake {
    requests_dir: PathBuf,
    data_root: PathBuf,
}

impl RequestIntake {
    /// Creates an intake writing into the data directory.
    pub fn open(data_dir: &DataDir) -> Self {
        Self {
            requests_dir: data_dir.requests_dir(),
            data_root: data_dir.root().to_path_buf(),
        }
    }

    pub fn requests_dir(&self) -> &Path {
        &self.requests_dir
    }

    /// Validates and stores a request. Nothing is written if the domain is invalid.
    pub fn submit(&self, request: &WhitelistRequest) -> Result<SubmittedRequest> {
        let domain = validate_domain(&request.domain)?;
        let description = request.description.trim();
        let slug = domain.replace('.', "_");

        let folder = self.requests_dir.join(&slug);
        fs::create_dir_all(&folder)?;

        let script_path = folder.join(format!("approve_{}.sh", slug));
        fs::write(&script_path, self.approval_script(&domain))?;
        make_executable(&script_path)?;

        let stamp = Local::now().format("%Y%m%d_%H%M%S");
        let description_path = folder.join(format!("{}_{}.txt", domain, stamp));
        fs::write(
            &description_path,
            format!("Domain: {}\nDescription: {}\n", domain, description),
        )?;

        tracing::info!("Whitelist request for {} saved to {:?}", domain, folder);

        Ok(SubmittedRequest {
            domain,
            description_path,
            script_path,
        })
    }

    fn approval_script(&self, domain: &str) -> String {
        format!(
            "#!/bin/sh\n\
             # Adds {domain} to the Allowgate whitelist.\n\
             exec {BINARY_NAME} --data-dir {root} allow {domain}\n",
            domain = domain,
            root = shell_quote(&self.data_root.to_string_lossy()),
        )
    }
}

/// Wraps a value in single quotes for POSIX sh.
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

#[cfg(unix)]
fn make_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let mut permissions = fs::metadata(path)?.permissions();
    permissions.set_mode(0o755);
    fs::set_permissions(path, permissions)?;
    Ok(())
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> Result<()> {
    Ok(())
}

//! Allowgate Storage - file-backed persistence.
//!
//! This crate owns every file the proxy reads or writes:
//!
//! - The whitelist (`whitelist.json`), reloaded on every check
//! - The audit log of denied HTTPS tunnels
//! - Whitelist requests submitted from the blocked page
//!
//! All documents are plain JSON so they can be inspected and edited by hand.
//!
//! # Example
//!
//! ```no_run
//! use allowgate_storage::{AuditLog, DataDir, DomainSource, WhitelistStore};
//!
//! let data_dir = DataDir::new("/var/lib/allowgate");
//! let whitelist = WhitelistStore::open(&data_dir);
//! whitelist.add("crates.io").unwrap();
//! assert!(whitelist.load().contains("crates.io"));
//!
//! let audit = AuditLog::open(&data_dir);
//! audit.record_denial("evil.com");
//! ```

mod audit;
mod data_dir;
pub mod error;
mod intake;
mod json_file;
pub mod models;
mod whitelist;

pub use audit::{AuditLog, RecordOutcome};
pub use data_dir::DataDir;
pub use error::{Result, StorageError};
pub use intake::{RequestIntake, SubmittedRequest};
pub use models::{BlockedRecord, WhitelistRequest};
pub use whitelist::{
    normalize_domain, validate_domain, AllowedDomains, DomainSource, WhitelistStore,
};

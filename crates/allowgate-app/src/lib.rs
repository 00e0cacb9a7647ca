//! Allowgate - whitelisting forward proxy.
//!
//! This crate provides the pieces of the `allowgate` binary that are not
//! argument parsing:
//!
//! - Whitelist and audit-log management commands
//! - Process control (stdin stop command, port release after shutdown)
//!
//! # Usage
//!
//! ```no_run
//! use allowgate_app::commands;
//! use allowgate_storage::DataDir;
//!
//! let data_dir = DataDir::with_default_dir().unwrap();
//! commands::allow(&data_dir, "crates.io", &mut std::io::stdout()).unwrap();
//! ```

pub mod commands;
pub mod control;

//! Whitelist and audit-log management commands.

use std::io::Write;

use allowgate_storage::{AuditLog, DataDir, WhitelistStore};
use anyhow::Context;

/// Adds a domain to the whitelist.
pub fn allow(data_dir: &DataDir, domain: &str, out: &mut impl Write) -> anyhow::Result<()> {
    let store = WhitelistStore::open(data_dir);
    let added = store
        .add(domain)
        .with_context(|| format!("Failed to add {} to {:?}", domain, store.path()))?;

    if added {
        writeln!(out, "Added {} to the whitelist", domain.trim())?;
    } else {
        writeln!(out, "{} is already whitelisted", domain.trim())?;
    }
    Ok(())
}

/// Removes a domain from the whitelist.
pub fn remove(data_dir: &DataDir, domain: &str, out: &mut impl Write) -> anyhow::Result<()> {
    let store = WhitelistStore::open(data_dir);
    let removed = store
        .remove(domain)
        .with_context(|| format!("Failed to update {:?}", store.path()))?;

    if removed {
        writeln!(out, "Removed {} from the whitelist", domain.trim())?;
    } else {
        writeln!(out, "{} is not whitelisted", domain.trim())?;
    }
    Ok(())
}

/// Prints the whitelisted domains, one per line.
pub fn list(data_dir: &DataDir, out: &mut impl Write) -> anyhow::Result<()> {
    for domain in WhitelistStore::open(data_dir).domains() {
        writeln!(out, "{}", domain)?;
    }
    Ok(())
}

/// Prints every domain ever denied a tunnel, in first-seen order.
pub fn blocked(data_dir: &DataDir, out: &mut impl Write) -> anyhow::Result<()> {
    for domain in AuditLog::open(data_dir).blocked_domains() {
        writeln!(out, "{}", domain)?;
    }
    Ok(())
}

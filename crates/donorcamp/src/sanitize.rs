//! Helpers for sanitizing data before it enters tracing span attributes.
//!
//! Traces are safe to share for debugging — these functions ensure donor
//! PII (email addresses, names) never leaks into spans or error rollups.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Masks the local part of an email address.
///
/// Safe for span fields — reveals the domain without exposing the
/// recipient: `jane.doe@example.org` → `j****@example.org`.
pub fn redact_email(address: &str) -> String {
    match address.split_once('@') {
        Some((local, domain)) if !local.is_empty() => {
            let first = local.chars().next().unwrap_or('*');
            format!("{}****@{}", first, domain)
        }
        _ => "****".to_string(),
    }
}

/// Returns a short deterministic hash of a donor id for correlation
/// without exposing the actual id.
pub fn hash_donor_id(donor_id: &str) -> String {
    let mut hasher = DefaultHasher::new();
    donor_id.hash(&mut hasher);
    let hash = hasher.finish();
    format!("{:016x}", hash)
}

/// Truncates a failure rollup so a large batch cannot blow up the
/// session's error_message column. Keeps whole entries.
pub fn truncate_rollup(entries: &[String], max_entries: usize) -> String {
    if entries.len() <= max_entries {
        return entries.join("; ");
    }
    let shown = entries[..max_entries].join("; ");
    format!("{}; … and {} more", shown, entries.len() - max_entries)
}

//! Intent-aware context fingerprinting for cache partitioning.
//!
//! The fingerprint is a pure function of `(session_id, intent)` — nothing
//! else. Preferences are deliberately excluded: preference edits must not
//! orphan cached research (the hybrid retriever judges relevance instead),
//! while intent is included so a commerce query can never be served an
//! informational entry from the same session.

use sha2::{Digest, Sha256};

use crate::core::types::Intent;

pub const FINGERPRINT_VERSION: &str = "v2";

/// 16-hex-char fingerprint identifying a `(session, intent)` cache
/// partition.
pub fn compute_fingerprint(session_id: &str, intent: Intent) -> String {
    // Canonical JSON with sorted keys; serde_json emits struct-literal maps
    // in insertion order, so build the string by hand to keep it stable.
    let canonical = format!(
        "{{\"intent\":{},\"session_id\":{}}}",
        serde_json::to_string(intent.as_str()).unwrap_or_default(),
        serde_json::to_string(session_id).unwrap_or_default()
    );

    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    let digest = hasher.finalize();
    let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    hex[..16].to_string()
}

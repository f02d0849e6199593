//! Per-domain freeform site knowledge.
//!
//! Anything a run learns about a site that doesn't fit the structured
//! schema: selector hints that almost worked, quirks ("prices render after
//! scroll"), block observations. Shared across runs so later sessions don't
//! rediscover the same traps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::{info, warn};

use crate::browser::session_store::atomic_write;
use crate::core::types::normalize_domain;

pub const NOTES_FILE_NAME: &str = "site_notes.jsonl";

/// Keep only this many most-recent notes per domain.
const MAX_NOTES_PER_DOMAIN: usize = 20;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteNote {
    pub text: String,
    #[serde(default = "Utc::now")]
    pub recorded_at: DateTime<Utc>,
    /// Where the note came from ("navigator", "calibration", "fetcher").
    #[serde(default)]
    pub source: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DomainNotes {
    domain: String,
    notes: Vec<SiteNote>,
}

pub struct SiteKnowledgeCache {
    file: PathBuf,
    domains: Mutex<HashMap<String, Vec<SiteNote>>>,
}

impl SiteKnowledgeCache {
    pub fn open(state_dir: &std::path::Path) -> Self {
        let file = state_dir.join(NOTES_FILE_NAME);
        let mut domains = HashMap::new();
        if let Ok(contents) = std::fs::read_to_string(&file) {
            for line in contents.lines() {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<DomainNotes>(line) {
                    Ok(entry) => {
                        domains.insert(entry.domain, entry.notes);
                    }
                    Err(e) => warn!("[SiteNotes] Failed to parse line: {}", e),
                }
            }
        }
        info!("[SiteNotes] Loaded notes for {} domains", domains.len());
        Self {
            file,
            domains: Mutex::new(domains),
        }
    }

    fn save_all(&self, domains: &HashMap<String, Vec<SiteNote>>) {
        let mut lines = String::new();
        let mut keys: Vec<&String> = domains.keys().collect();
        keys.sort();
        for key in keys {
            let entry = DomainNotes {
                domain: key.clone(),
                notes: domains[key].clone(),
            };
            if let Ok(line) = serde_json::to_string(&entry) {
                lines.push_str(&line);
                lines.push('\n');
            }
        }
        if let Err(e) = atomic_write(&self.file, lines.as_bytes()) {
            warn!("[SiteNotes] Failed to save: {}", e);
        }
    }

    pub fn add_note(&self, domain: &str, text: &str, source: &str) {
        let domain = normalize_domain(domain);
        let mut domains = self.domains.lock().unwrap_or_else(|e| e.into_inner());
        let notes = domains.entry(domain).or_default();
        notes.push(SiteNote {
            text: text.to_string(),
            recorded_at: Utc::now(),
            source: source.to_string(),
        });
        if notes.len() > MAX_NOTES_PER_DOMAIN {
            let excess = notes.len() - MAX_NOTES_PER_DOMAIN;
            notes.drain(0..excess);
        }
        self.save_all(&domains);
    }

    pub fn notes_for(&self, domain: &str) -> Vec<SiteNote> {
        self.domains
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&normalize_domain(domain))
            .cloned()
            .unwrap_or_default()
    }

    /// Compact bullet list for prompt context; empty string when nothing is
    /// known about the domain.
    pub fn prompt_context(&self, domain: &str, max_notes: usize) -> String {
        let notes = self.notes_for(domain);
        if notes.is_empty() {
            return String::new();
        }
        let bullets: Vec<String> = notes
            .iter()
            .rev()
            .take(max_notes)
            .map(|n| format!("- {}", n.text))
            .collect();
        format!("Known site quirks for {}:\n{}", normalize_domain(domain), bullets.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notes_roundtrip_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let cache = SiteKnowledgeCache::open(dir.path());
            cache.add_note("www.Shop.example", "prices render only after scroll", "navigator");
            cache.add_note("shop.example", "search lives at /s?q=", "calibration");
        }
        let cache = SiteKnowledgeCache::open(dir.path());
        let notes = cache.notes_for("shop.example");
        assert_eq!(notes.len(), 2);
        assert_eq!(notes[0].text, "prices render only after scroll");
    }

    #[test]
    fn prompt_context_lists_recent_notes() {
        let dir = tempfile::tempdir().unwrap();
        let cache = SiteKnowledgeCache::open(dir.path());
        assert!(cache.prompt_context("shop.example", 5).is_empty());
        cache.add_note("shop.example", "cookie wall on first visit", "fetcher");
        let ctx = cache.prompt_context("shop.example", 5);
        assert!(ctx.contains("cookie wall"));
        assert!(ctx.contains("shop.example"));
    }

    #[test]
    fn notes_capped_per_domain() {
        let dir = tempfile::tempdir().unwrap();
        let cache = SiteKnowledgeCache::open(dir.path());
        for i in 0..30 {
            cache.add_note("big.example", &format!("note {}", i), "t");
        }
        let notes = cache.notes_for("big.example");
        assert_eq!(notes.len(), MAX_NOTES_PER_DOMAIN);
        assert_eq!(notes.last().unwrap().text, "note 29");
    }
}

//! Learned per-site extraction schemas.
//!
//! First visit to a site: calibration learns selectors and stores them here.
//! Subsequent visits reuse them for fast extraction. Failures are tracked
//! per method so drift in the learned selectors is detected even while a
//! fallback method keeps succeeding, and recalibration is triggered.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::{debug, info, warn};

use crate::browser::session_store::atomic_write;
use crate::core::types::{normalize_domain, normalize_host};

pub const SCHEMA_FILE_NAME: &str = "site_schemas.jsonl";

/// Learned extraction schema for one `(domain, page_type)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteSchema {
    pub domain: String,
    pub page_type: String,

    /// Incremented on every overwrite of an existing key.
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,

    // DOM selectors learned from calibration
    #[serde(default)]
    pub product_card_selector: Option<String>,
    #[serde(default)]
    pub product_link_selector: Option<String>,
    #[serde(default)]
    pub price_selector: Option<String>,
    #[serde(default)]
    pub title_selector: Option<String>,
    #[serde(default)]
    pub image_selector: Option<String>,

    #[serde(default)]
    pub json_ld_available: bool,

    // Visual hints for screenshot-based fallback
    #[serde(default)]
    pub product_area_y_start: Option<u32>,
    #[serde(default)]
    pub product_area_y_end: Option<u32>,

    /// "click_next" | "scroll_infinite" | "url_param"
    #[serde(default)]
    pub pagination_method: Option<String>,
    #[serde(default)]
    pub next_button_selector: Option<String>,

    // Anti-patterns: elements the navigator must not click
    #[serde(default)]
    pub filter_selectors: Vec<String>,
    #[serde(default)]
    pub nav_selectors: Vec<String>,

    // Statistics
    #[serde(default)]
    pub total_uses: u64,
    #[serde(default)]
    pub successful_extractions: u64,
    #[serde(default)]
    pub failed_extractions: u64,
    #[serde(default)]
    pub consecutive_failures: u32,
    #[serde(default)]
    pub last_success: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_failure: Option<DateTime<Utc>>,

    /// Per-method counters, e.g. {"schema": {"success": 50, "fail": 2}}.
    #[serde(default)]
    pub method_stats: HashMap<String, MethodStats>,
}

fn default_version() -> u32 {
    1
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MethodStats {
    pub success: u64,
    pub fail: u64,
}

impl SiteSchema {
    pub fn new(domain: &str, page_type: &str) -> Self {
        let now = Utc::now();
        Self {
            domain: normalize_domain(domain),
            page_type: page_type.to_string(),
            version: 1,
            created_at: now,
            updated_at: now,
            product_card_selector: None,
            product_link_selector: None,
            price_selector: None,
            title_selector: None,
            image_selector: None,
            json_ld_available: false,
            product_area_y_start: None,
            product_area_y_end: None,
            pagination_method: None,
            next_button_selector: None,
            filter_selectors: Vec::new(),
            nav_selectors: Vec::new(),
            total_uses: 0,
            successful_extractions: 0,
            failed_extractions: 0,
            consecutive_failures: 0,
            last_success: None,
            last_failure: None,
            method_stats: HashMap::new(),
        }
    }

    pub fn key(&self) -> String {
        format!("{}:{}", self.domain, self.page_type)
    }

    pub fn success_rate(&self) -> f64 {
        let total = self.successful_extractions + self.failed_extractions;
        if total == 0 {
            return 0.0;
        }
        self.successful_extractions as f64 / total as f64
    }

    /// Recalibration triggers: one consecutive failure (fail fast), overall
    /// degradation with enough data, or the "schema" method specifically at
    /// zero successes while a fallback carries the stats.
    pub fn needs_recalibration(&self) -> bool {
        if self.consecutive_failures >= 1 {
            return true;
        }
        let total = self.successful_extractions + self.failed_extractions;
        if total >= 5 && self.success_rate() < 0.5 {
            return true;
        }
        if let Some(schema_stats) = self.method_stats.get("schema") {
            if schema_stats.fail >= 1 && schema_stats.success == 0 {
                return true;
            }
        }
        false
    }

    pub fn is_reliable(&self) -> bool {
        let total = self.successful_extractions + self.failed_extractions;
        total >= 5 && self.success_rate() >= 0.8
    }

    pub fn record_success(&mut self, method: &str) {
        self.total_uses += 1;
        self.successful_extractions += 1;
        self.consecutive_failures = 0;
        let now = Utc::now();
        self.last_success = Some(now);
        self.updated_at = now;
        self.method_stats.entry(method.to_string()).or_default().success += 1;
    }

    pub fn record_failure(&mut self, method: &str) {
        self.total_uses += 1;
        self.failed_extractions += 1;
        self.consecutive_failures += 1;
        let now = Utc::now();
        self.last_failure = Some(now);
        self.updated_at = now;
        self.method_stats.entry(method.to_string()).or_default().fail += 1;
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SchemaRegistryStats {
    pub total_schemas: usize,
    pub total_domains: usize,
    pub avg_success_rate: f64,
    pub schemas_needing_recalibration: usize,
    pub reliable_schemas: usize,
    pub total_extractions: u64,
}

/// Persistent registry of learned schemas, one JSON record per line,
/// rewritten atomically on every mutation.
pub struct SchemaRegistry {
    file: PathBuf,
    schemas: Mutex<HashMap<String, SiteSchema>>,
}

impl SchemaRegistry {
    /// `state_dir` is the shared state directory; the registry file lives at
    /// `<state_dir>/site_schemas.jsonl`.
    pub fn open(state_dir: &std::path::Path) -> Self {
        let file = state_dir.join(SCHEMA_FILE_NAME);
        let schemas = load_jsonl(&file);
        info!("[SchemaRegistry] Loaded {} schemas from {}", schemas.len(), file.display());
        Self {
            file,
            schemas: Mutex::new(schemas),
        }
    }

    fn save_all(&self, schemas: &HashMap<String, SiteSchema>) {
        let mut lines = String::new();
        // Stable order keeps rewrites diffable and tests deterministic.
        let mut entries: Vec<&SiteSchema> = schemas.values().collect();
        entries.sort_by(|a, b| a.key().cmp(&b.key()));
        for schema in entries {
            match serde_json::to_string(schema) {
                Ok(line) => {
                    lines.push_str(&line);
                    lines.push('\n');
                }
                Err(e) => warn!("[SchemaRegistry] serialize failed for {}: {}", schema.key(), e),
            }
        }
        if let Err(e) = atomic_write(&self.file, lines.as_bytes()) {
            warn!("[SchemaRegistry] Failed to save schemas: {}", e);
        }
    }

    pub fn get(&self, domain: &str, page_type: &str) -> Option<SiteSchema> {
        let key = format!("{}:{}", normalize_domain(domain), page_type);
        let schemas = self.schemas.lock().unwrap_or_else(|e| e.into_inner());
        let found = schemas.get(&key).cloned();
        match &found {
            Some(s) => debug!(
                "[SchemaRegistry] Found schema for {} (v{}, {:.0}% success)",
                key,
                s.version,
                s.success_rate() * 100.0
            ),
            None => debug!("[SchemaRegistry] No schema found for {}", key),
        }
        found
    }

    pub fn get_for_url(&self, url: &str, page_type: &str) -> Option<SiteSchema> {
        self.get(&normalize_host(url), page_type)
    }

    /// Save or update. Overwriting an existing key always increments the
    /// stored version past the previous one.
    pub fn save(&self, mut schema: SiteSchema) {
        schema.domain = normalize_domain(&schema.domain);
        let key = schema.key();
        let mut schemas = self.schemas.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(existing) = schemas.get(&key) {
            if schema.version <= existing.version {
                schema.version = existing.version + 1;
            }
            info!(
                "[SchemaRegistry] Updating schema for {} (v{} → v{})",
                key, existing.version, schema.version
            );
        } else {
            info!("[SchemaRegistry] Saving new schema for {}", key);
        }

        schema.updated_at = Utc::now();
        schemas.insert(key, schema);
        self.save_all(&schemas);
    }

    /// Record an extraction attempt against an existing schema.
    pub fn record_extraction(&self, domain: &str, page_type: &str, success: bool, method: &str) {
        let key = format!("{}:{}", normalize_domain(domain), page_type);
        let mut schemas = self.schemas.lock().unwrap_or_else(|e| e.into_inner());

        let Some(schema) = schemas.get_mut(&key) else {
            warn!("[SchemaRegistry] Cannot record stats - no schema for {}", key);
            return;
        };

        if success {
            schema.record_success(method);
        } else {
            schema.record_failure(method);
            if schema.needs_recalibration() {
                warn!(
                    "[SchemaRegistry] Schema {} needs recalibration (consecutive_failures={})",
                    key, schema.consecutive_failures
                );
            }
        }
        self.save_all(&schemas);
    }

    /// True when no schema exists or the existing one has drifted.
    pub fn needs_calibration(&self, domain: &str, page_type: &str) -> bool {
        match self.get(domain, page_type) {
            Some(schema) => schema.needs_recalibration(),
            None => true,
        }
    }

    /// Force recalibration on next visit.
    pub fn mark_stale(&self, domain: &str, page_type: &str) {
        let key = format!("{}:{}", normalize_domain(domain), page_type);
        let mut schemas = self.schemas.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(schema) = schemas.get_mut(&key) {
            schema.consecutive_failures = 10;
            schema.updated_at = Utc::now();
            info!("[SchemaRegistry] Marked {} as stale", key);
            self.save_all(&schemas);
        }
    }

    pub fn delete(&self, domain: &str, page_type: &str) -> bool {
        let key = format!("{}:{}", normalize_domain(domain), page_type);
        let mut schemas = self.schemas.lock().unwrap_or_else(|e| e.into_inner());
        if schemas.remove(&key).is_some() {
            info!("[SchemaRegistry] Deleted schema for {}", key);
            self.save_all(&schemas);
            true
        } else {
            false
        }
    }

    /// Wipe every page type for a domain, forcing full recalibration. Used
    /// by vendor recovery.
    pub fn delete_domain(&self, domain: &str) -> bool {
        let prefix = format!("{}:", normalize_domain(domain));
        let mut schemas = self.schemas.lock().unwrap_or_else(|e| e.into_inner());
        let keys: Vec<String> = schemas
            .keys()
            .filter(|k| k.starts_with(&prefix))
            .cloned()
            .collect();
        if keys.is_empty() {
            return false;
        }
        for key in &keys {
            schemas.remove(key);
        }
        info!("[SchemaRegistry] Deleted {} schemas for {}", keys.len(), normalize_domain(domain));
        self.save_all(&schemas);
        true
    }

    pub fn list_all(&self) -> Vec<SiteSchema> {
        self.schemas
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    pub fn get_stats(&self) -> SchemaRegistryStats {
        let schemas = self.schemas.lock().unwrap_or_else(|e| e.into_inner());
        if schemas.is_empty() {
            return SchemaRegistryStats::default();
        }
        let domains: std::collections::HashSet<&str> =
            schemas.values().map(|s| s.domain.as_str()).collect();
        let rates: Vec<f64> = schemas
            .values()
            .filter(|s| s.total_uses > 0)
            .map(|s| s.success_rate())
            .collect();
        SchemaRegistryStats {
            total_schemas: schemas.len(),
            total_domains: domains.len(),
            avg_success_rate: if rates.is_empty() {
                0.0
            } else {
                rates.iter().sum::<f64>() / rates.len() as f64
            },
            schemas_needing_recalibration: schemas
                .values()
                .filter(|s| s.needs_recalibration())
                .count(),
            reliable_schemas: schemas.values().filter(|s| s.is_reliable()).count(),
            total_extractions: schemas.values().map(|s| s.total_uses).sum(),
        }
    }
}

fn load_jsonl(file: &std::path::Path) -> HashMap<String, SiteSchema> {
    let mut out = HashMap::new();
    let Ok(contents) = std::fs::read_to_string(file) else {
        return out;
    };
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<SiteSchema>(line) {
            Ok(schema) => {
                out.insert(schema.key(), schema);
            }
            Err(e) => warn!("[SchemaRegistry] Failed to parse schema line: {}", e),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> (tempfile::TempDir, SchemaRegistry) {
        let dir = tempfile::tempdir().unwrap();
        let reg = SchemaRegistry::open(dir.path());
        (dir, reg)
    }

    #[test]
    fn save_and_get_normalizes_domain() {
        let (_dir, reg) = registry();
        let mut schema = SiteSchema::new("WWW.BestBuy.com", "listing");
        schema.price_selector = Some(".priceView span".into());
        reg.save(schema);

        let loaded = reg.get("bestbuy.com", "listing").unwrap();
        assert_eq!(loaded.domain, "bestbuy.com");
        assert_eq!(loaded.price_selector.as_deref(), Some(".priceView span"));
        assert!(reg.get_for_url("https://www.bestbuy.com/site/x", "listing").is_some());
    }

    #[test]
    fn version_increments_on_every_overwrite() {
        let (_dir, reg) = registry();
        reg.save(SiteSchema::new("shop.example", "listing"));
        assert_eq!(reg.get("shop.example", "listing").unwrap().version, 1);

        reg.save(SiteSchema::new("shop.example", "listing"));
        assert_eq!(reg.get("shop.example", "listing").unwrap().version, 2);

        // Saving a stale copy still moves forward.
        let mut stale = SiteSchema::new("shop.example", "listing");
        stale.version = 1;
        reg.save(stale);
        assert_eq!(reg.get("shop.example", "listing").unwrap().version, 3);
    }

    #[test]
    fn recalibration_after_single_failure() {
        let (_dir, reg) = registry();
        reg.save(SiteSchema::new("v.example", "listing"));
        assert!(!reg.needs_calibration("v.example", "listing") || reg.get("v.example", "listing").unwrap().total_uses == 0);

        reg.record_extraction("v.example", "listing", false, "schema");
        assert!(reg.needs_calibration("v.example", "listing"));

        reg.record_extraction("v.example", "listing", true, "schema");
        assert!(!reg.needs_calibration("v.example", "listing"));
    }

    #[test]
    fn recalibration_when_schema_method_dead_but_fallback_alive() {
        let (_dir, reg) = registry();
        reg.save(SiteSchema::new("v.example", "listing"));
        // Fallback succeeding keeps consecutive_failures at 0…
        reg.record_extraction("v.example", "listing", false, "schema");
        reg.record_extraction("v.example", "listing", true, "vision");
        let schema = reg.get("v.example", "listing").unwrap();
        assert_eq!(schema.consecutive_failures, 0);
        // …but schema-method 0% success still triggers recalibration.
        assert!(schema.needs_recalibration());
    }

    #[test]
    fn recalibration_on_low_success_rate() {
        let (_dir, reg) = registry();
        reg.save(SiteSchema::new("v.example", "listing"));
        for success in [true, false, true, false, false] {
            reg.record_extraction("v.example", "listing", success, "vision");
        }
        // 2/5 = 40% < 50% with ≥5 samples
        let schema = reg.get("v.example", "listing").unwrap();
        assert!(schema.success_rate() < 0.5);
        assert!(schema.needs_recalibration());
    }

    #[test]
    fn persistence_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        {
            let reg = SchemaRegistry::open(dir.path());
            let mut schema = SiteSchema::new("persist.example", "pdp");
            schema.title_selector = Some("h1.product".into());
            reg.save(schema);
            reg.record_extraction("persist.example", "pdp", true, "schema");
        }
        let reg2 = SchemaRegistry::open(dir.path());
        let loaded = reg2.get("persist.example", "pdp").unwrap();
        assert_eq!(loaded.title_selector.as_deref(), Some("h1.product"));
        assert_eq!(loaded.successful_extractions, 1);
        assert_eq!(loaded.method_stats["schema"].success, 1);
    }

    #[test]
    fn delete_domain_wipes_all_page_types() {
        let (_dir, reg) = registry();
        reg.save(SiteSchema::new("multi.example", "listing"));
        reg.save(SiteSchema::new("multi.example", "pdp"));
        reg.save(SiteSchema::new("other.example", "listing"));

        assert!(reg.delete_domain("multi.example"));
        assert!(reg.get("multi.example", "listing").is_none());
        assert!(reg.get("multi.example", "pdp").is_none());
        assert!(reg.get("other.example", "listing").is_some());
        assert!(!reg.delete_domain("multi.example"));
    }

    #[test]
    fn mark_stale_forces_recalibration() {
        let (_dir, reg) = registry();
        reg.save(SiteSchema::new("stale.example", "listing"));
        reg.mark_stale("stale.example", "listing");
        assert!(reg.needs_calibration("stale.example", "listing"));
    }

    #[test]
    fn stats_summarize() {
        let (_dir, reg) = registry();
        reg.save(SiteSchema::new("a.example", "listing"));
        reg.save(SiteSchema::new("a.example", "pdp"));
        reg.save(SiteSchema::new("b.example", "listing"));
        reg.record_extraction("a.example", "listing", true, "schema");

        let stats = reg.get_stats();
        assert_eq!(stats.total_schemas, 3);
        assert_eq!(stats.total_domains, 2);
        assert_eq!(stats.total_extractions, 1);
    }
}

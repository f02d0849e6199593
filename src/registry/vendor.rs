//! Living vendor registry.
//!
//! The system learns which vendors work through experience: discovery from
//! Phase-1 intelligence, success/failure tracking per visit, ordered
//! recovery strategies before any block, and time-bounded quarantine instead
//! of permanent bans. No hardcoded vendor lists anywhere.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::{info, warn};

use crate::browser::session_store::atomic_write;
use crate::core::error::BlockKind;
use crate::core::types::{normalize_domain, normalize_host};

pub const VENDOR_FILE_NAME: &str = "vendor_registry.jsonl";

/// Remediations to try on a failing domain, in order, before declaring it
/// blocked.
pub const RECOVERY_STRATEGIES: &[&str] = &[
    "recalibrate_selectors",
    "increase_wait_time",
    "use_stealth_mode",
    "try_different_url_pattern",
    "use_mobile_viewport",
];

/// Failures in a row before suggesting recovery.
pub const CONSECUTIVE_FAILURES_BEFORE_RECOVERY: u32 = 2;
/// Failures in a row before a block is even considered.
pub const CONSECUTIVE_FAILURES_BEFORE_BLOCK: u32 = 5;
/// Quarantine length once blocked.
pub const QUARANTINE_HOURS: i64 = 24;

/// A vendor learned by the system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VendorRecord {
    pub domain: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub categories: Vec<String>,
    /// "retailer" | "marketplace" | "manufacturer" | "breeder" …
    #[serde(default)]
    pub vendor_type: String,

    // Discovery
    #[serde(default = "Utc::now")]
    pub discovered_at: DateTime<Utc>,
    #[serde(default)]
    pub discovered_via: String,
    #[serde(default)]
    pub discovery_query: String,

    // Health tracking
    #[serde(default)]
    pub total_visits: u64,
    #[serde(default)]
    pub successful_extractions: u64,
    #[serde(default)]
    pub failed_extractions: u64,
    #[serde(default)]
    pub last_visit: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_success: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_failure: Option<DateTime<Utc>>,

    // Recovery tracking
    #[serde(default)]
    pub consecutive_failures: u32,
    #[serde(default)]
    pub recovery_strategies_tried: Vec<String>,
    #[serde(default)]
    pub last_recovery_strategy: String,
    #[serde(default)]
    pub needs_recovery: bool,

    // Block state — only after exhausting recovery
    #[serde(default)]
    pub is_blocked: bool,
    #[serde(default)]
    pub block_detected_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub block_type: String,
    #[serde(default)]
    pub quarantine_until: Option<DateTime<Utc>>,

    // Quality signals
    #[serde(default)]
    pub has_json_ld: bool,
    #[serde(default)]
    pub avg_extraction_time_ms: f64,
    #[serde(default)]
    pub llm_quality_score: f64,
    #[serde(default)]
    pub llm_notes: String,
}

impl VendorRecord {
    pub fn new(domain: &str) -> Self {
        let domain = normalize_domain(domain);
        let name = domain
            .split('.')
            .next()
            .map(|s| {
                let mut c = s.chars();
                match c.next() {
                    Some(first) => first.to_uppercase().collect::<String>() + c.as_str(),
                    None => String::new(),
                }
            })
            .unwrap_or_default();
        Self {
            domain,
            name,
            categories: Vec::new(),
            vendor_type: String::new(),
            discovered_at: Utc::now(),
            discovered_via: String::new(),
            discovery_query: String::new(),
            total_visits: 0,
            successful_extractions: 0,
            failed_extractions: 0,
            last_visit: None,
            last_success: None,
            last_failure: None,
            consecutive_failures: 0,
            recovery_strategies_tried: Vec::new(),
            last_recovery_strategy: String::new(),
            needs_recovery: false,
            is_blocked: false,
            block_detected_at: None,
            block_type: String::new(),
            quarantine_until: None,
            has_json_ld: false,
            avg_extraction_time_ms: 0.0,
            llm_quality_score: 0.0,
            llm_notes: String::new(),
        }
    }

    pub fn success_rate(&self) -> f64 {
        let total = self.successful_extractions + self.failed_extractions;
        if total == 0 {
            return 0.0;
        }
        self.successful_extractions as f64 / total as f64
    }

    pub fn is_in_quarantine(&self) -> bool {
        match self.quarantine_until {
            Some(until) => Utc::now() < until,
            None => false,
        }
    }

    /// Usable = not quarantined, and either new or carrying a tolerable
    /// success rate. An expired quarantine auto-clears the block and resets
    /// recovery state so the vendor gets a fresh chance.
    pub fn is_usable(&mut self) -> bool {
        if self.is_in_quarantine() {
            return false;
        }

        if self.is_blocked {
            info!(
                "[VendorRegistry] Quarantine expired for {}, giving another chance",
                self.domain
            );
            self.is_blocked = false;
            self.consecutive_failures = 0;
            self.recovery_strategies_tried.clear();
        }

        if self.total_visits < 3 {
            return true;
        }
        self.success_rate() >= 0.3
    }

    pub fn is_reliable(&self) -> bool {
        !self.is_blocked && self.total_visits >= 5 && self.success_rate() >= 0.7
    }

    /// Next untried recovery strategy, in fixed order. `None` = exhausted.
    pub fn next_recovery_strategy(&self) -> Option<&'static str> {
        RECOVERY_STRATEGIES
            .iter()
            .find(|s| !self.recovery_strategies_tried.iter().any(|t| t == *s))
            .copied()
    }

    /// Record a visit. On failure past the recovery threshold, returns the
    /// strategy the caller should attempt before the next visit.
    pub fn record_visit(&mut self, success: bool, extraction_time_ms: f64) -> Option<&'static str> {
        let now = Utc::now();
        self.total_visits += 1;
        self.last_visit = Some(now);

        if success {
            self.successful_extractions += 1;
            self.last_success = Some(now);
            self.consecutive_failures = 0;
            self.needs_recovery = false;
            if !self.recovery_strategies_tried.is_empty() {
                info!(
                    "[VendorRegistry] {} recovered with: {}",
                    self.domain, self.last_recovery_strategy
                );
                self.recovery_strategies_tried.clear();
                self.last_recovery_strategy.clear();
            }
            if extraction_time_ms > 0.0 {
                self.avg_extraction_time_ms = if self.avg_extraction_time_ms == 0.0 {
                    extraction_time_ms
                } else {
                    0.8 * self.avg_extraction_time_ms + 0.2 * extraction_time_ms
                };
            }
            None
        } else {
            self.failed_extractions += 1;
            self.last_failure = Some(now);
            self.consecutive_failures += 1;

            if self.consecutive_failures >= CONSECUTIVE_FAILURES_BEFORE_RECOVERY {
                if let Some(strategy) = self.next_recovery_strategy() {
                    self.needs_recovery = true;
                    info!(
                        "[VendorRegistry] {} has {} consecutive failures. Suggesting recovery: {}",
                        self.domain, self.consecutive_failures, strategy
                    );
                    return Some(strategy);
                }
            }
            None
        }
    }

    pub fn record_recovery_attempt(&mut self, strategy: &str, success: bool) {
        self.recovery_strategies_tried.push(strategy.to_string());
        self.last_recovery_strategy = strategy.to_string();
        if success {
            self.needs_recovery = false;
            self.consecutive_failures = 0;
            info!("[VendorRegistry] {} recovery succeeded with: {}", self.domain, strategy);
        } else {
            warn!("[VendorRegistry] {} recovery failed with: {}", self.domain, strategy);
        }
    }

    /// Try to block. Refused (returns false) while any recovery strategy is
    /// untried or the failure streak is under the block threshold — a vendor
    /// is only blocked after BOTH conditions hold.
    pub fn mark_blocked(&mut self, block_type: &str) -> bool {
        if let Some(strategy) = self.next_recovery_strategy() {
            self.needs_recovery = true;
            info!(
                "[VendorRegistry] {} block requested but recovery available: {}. Consecutive failures: {}/{}",
                self.domain, strategy, self.consecutive_failures, CONSECUTIVE_FAILURES_BEFORE_BLOCK
            );
            return false;
        }
        if self.consecutive_failures < CONSECUTIVE_FAILURES_BEFORE_BLOCK {
            info!(
                "[VendorRegistry] {} block requested below threshold ({}/{})",
                self.domain, self.consecutive_failures, CONSECUTIVE_FAILURES_BEFORE_BLOCK
            );
            return false;
        }

        self.is_blocked = true;
        self.block_detected_at = Some(Utc::now());
        self.block_type = block_type.to_string();
        self.quarantine_until = Some(Utc::now() + Duration::hours(QUARANTINE_HOURS));
        warn!(
            "[VendorRegistry] Blocked {}: {}. Quarantine until {:?}. Tried strategies: {:?}",
            self.domain, block_type, self.quarantine_until, self.recovery_strategies_tried
        );
        true
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct VendorRegistryStats {
    pub total_vendors: usize,
    pub usable_vendors: usize,
    pub blocked_vendors: usize,
    pub reliable_vendors: usize,
    pub total_visits: u64,
    pub categories: Vec<String>,
}

/// Durable, thread-safe vendor store. One JSON record per line, atomic
/// rewrite on mutation.
pub struct VendorRegistry {
    file: PathBuf,
    vendors: Mutex<HashMap<String, VendorRecord>>,
}

impl VendorRegistry {
    pub fn open(state_dir: &std::path::Path) -> Self {
        let file = state_dir.join(VENDOR_FILE_NAME);
        let vendors = load_jsonl(&file);
        info!("[VendorRegistry] Loaded {} vendors", vendors.len());
        Self {
            file,
            vendors: Mutex::new(vendors),
        }
    }

    fn save_all(&self, vendors: &HashMap<String, VendorRecord>) {
        let mut lines = String::new();
        let mut entries: Vec<&VendorRecord> = vendors.values().collect();
        entries.sort_by(|a, b| a.domain.cmp(&b.domain));
        for vendor in entries {
            match serde_json::to_string(vendor) {
                Ok(line) => {
                    lines.push_str(&line);
                    lines.push('\n');
                }
                Err(e) => warn!("[VendorRegistry] serialize failed for {}: {}", vendor.domain, e),
            }
        }
        if let Err(e) = atomic_write(&self.file, lines.as_bytes()) {
            warn!("[VendorRegistry] Failed to save: {}", e);
        }
    }

    pub fn get(&self, domain: &str) -> Option<VendorRecord> {
        self.vendors
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&normalize_domain(domain))
            .cloned()
    }

    pub fn get_for_url(&self, url: &str) -> Option<VendorRecord> {
        self.get(&normalize_host(url))
    }

    /// Add a vendor or merge new metadata into an existing record. Called
    /// when Phase-1 intelligence, a SERP, or a user query surfaces a vendor.
    pub fn add_or_update(
        &self,
        domain: &str,
        name: &str,
        categories: &[String],
        vendor_type: &str,
        discovered_via: &str,
        discovery_query: &str,
    ) -> VendorRecord {
        let domain = normalize_domain(domain);
        let mut vendors = self.vendors.lock().unwrap_or_else(|e| e.into_inner());

        let record = match vendors.get_mut(&domain) {
            Some(vendor) => {
                if !name.is_empty() && vendor.name.is_empty() {
                    vendor.name = name.to_string();
                }
                for c in categories {
                    if !vendor.categories.contains(c) {
                        vendor.categories.push(c.clone());
                    }
                }
                if !vendor_type.is_empty() && vendor.vendor_type.is_empty() {
                    vendor.vendor_type = vendor_type.to_string();
                }
                vendor.clone()
            }
            None => {
                let mut vendor = VendorRecord::new(&domain);
                if !name.is_empty() {
                    vendor.name = name.to_string();
                }
                vendor.categories = categories.to_vec();
                vendor.vendor_type = vendor_type.to_string();
                vendor.discovered_via = discovered_via.to_string();
                vendor.discovery_query = discovery_query.to_string();
                info!("[VendorRegistry] Discovered new vendor: {} via {}", domain, discovered_via);
                vendors.insert(domain.clone(), vendor.clone());
                vendor
            }
        };

        self.save_all(&vendors);
        record
    }

    /// Record a visit outcome. Returns a recovery strategy hint when the
    /// failure pattern warrants one; the caller should attempt it before the
    /// next visit.
    pub fn record_visit(
        &self,
        domain: &str,
        success: bool,
        extraction_time_ms: f64,
        blocked: Option<BlockKind>,
    ) -> Option<&'static str> {
        let domain = normalize_domain(domain);
        let mut vendors = self.vendors.lock().unwrap_or_else(|e| e.into_inner());
        let vendor = vendors.entry(domain.clone()).or_insert_with(|| {
            let mut v = VendorRecord::new(&domain);
            v.discovered_via = "extraction_attempt".to_string();
            v
        });

        let suggestion = match blocked {
            Some(kind) => {
                vendor.failed_extractions += 1;
                vendor.consecutive_failures += 1;
                vendor.last_failure = Some(Utc::now());
                vendor.total_visits += 1;
                vendor.last_visit = vendor.last_failure;
                if vendor.mark_blocked(kind.as_str()) {
                    None
                } else {
                    vendor.next_recovery_strategy()
                }
            }
            None => vendor.record_visit(success, extraction_time_ms),
        };

        self.save_all(&vendors);
        suggestion
    }

    pub fn record_recovery_attempt(&self, domain: &str, strategy: &str, success: bool) {
        let domain = normalize_domain(domain);
        let mut vendors = self.vendors.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(vendor) = vendors.get_mut(&domain) {
            vendor.record_recovery_attempt(strategy, success);
            self.save_all(&vendors);
        }
    }

    pub fn is_blocked(&self, domain: &str) -> bool {
        self.get(domain).map(|v| v.is_blocked).unwrap_or(false)
    }

    /// Unknown vendors get a chance; known ones answer from their record.
    /// Auto-unquarantine is persisted when it fires.
    pub fn is_usable(&self, domain: &str) -> bool {
        let domain = normalize_domain(domain);
        let mut vendors = self.vendors.lock().unwrap_or_else(|e| e.into_inner());
        match vendors.get_mut(&domain) {
            None => true,
            Some(vendor) => {
                let was_blocked = vendor.is_blocked;
                let usable = vendor.is_usable();
                if was_blocked && !vendor.is_blocked {
                    self.save_all(&vendors);
                }
                usable
            }
        }
    }

    /// Usable vendors ranked by confidence-weighted success rate: more
    /// visits = more trust in the observed rate, fewer visits pull toward a
    /// neutral 0.5.
    pub fn get_usable_vendors(&self, category: Option<&str>, limit: usize) -> Vec<VendorRecord> {
        let mut vendors = self.vendors.lock().unwrap_or_else(|e| e.into_inner());
        let mut usable: Vec<VendorRecord> = vendors
            .values_mut()
            .filter_map(|v| {
                if !v.is_usable() {
                    return None;
                }
                if let Some(cat) = category {
                    if !v.categories.iter().any(|c| c == cat) {
                        return None;
                    }
                }
                Some(v.clone())
            })
            .collect();

        let reliability = |v: &VendorRecord| -> f64 {
            let confidence = (v.total_visits as f64 / 10.0).min(1.0);
            v.success_rate() * confidence + (1.0 - confidence) * 0.5
        };
        usable.sort_by(|a, b| {
            reliability(b)
                .partial_cmp(&reliability(a))
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        usable.truncate(limit);
        usable
    }

    pub fn get_blocked_vendors(&self) -> Vec<VendorRecord> {
        self.vendors
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|v| v.is_blocked)
            .cloned()
            .collect()
    }

    pub fn clear_blocked_status(&self, domain: &str) -> bool {
        let domain = normalize_domain(domain);
        let mut vendors = self.vendors.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(vendor) = vendors.get_mut(&domain) {
            if vendor.is_blocked {
                vendor.is_blocked = false;
                vendor.block_detected_at = None;
                vendor.block_type.clear();
                vendor.quarantine_until = None;
                self.save_all(&vendors);
                info!("[VendorRegistry] Cleared blocked status for {}", domain);
                return true;
            }
        }
        false
    }

    pub fn get_all(&self) -> Vec<VendorRecord> {
        self.vendors
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    pub fn get_stats(&self) -> VendorRegistryStats {
        let mut vendors = self.vendors.lock().unwrap_or_else(|e| e.into_inner());
        let mut categories: std::collections::HashSet<String> = std::collections::HashSet::new();
        let mut usable = 0usize;
        for v in vendors.values_mut() {
            categories.extend(v.categories.iter().cloned());
            if v.is_usable() {
                usable += 1;
            }
        }
        VendorRegistryStats {
            total_vendors: vendors.len(),
            usable_vendors: usable,
            blocked_vendors: vendors.values().filter(|v| v.is_blocked).count(),
            reliable_vendors: vendors.values().filter(|v| v.is_reliable()).count(),
            total_visits: vendors.values().map(|v| v.total_visits).sum(),
            categories: categories.into_iter().collect(),
        }
    }
}

fn load_jsonl(file: &std::path::Path) -> HashMap<String, VendorRecord> {
    let mut out = HashMap::new();
    let Ok(contents) = std::fs::read_to_string(file) else {
        return out;
    };
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<VendorRecord>(line) {
            Ok(vendor) => {
                out.insert(vendor.domain.clone(), vendor);
            }
            Err(e) => warn!("[VendorRegistry] Failed to parse: {}", e),
        }
    }
    out
}

//! Per-engine health tracking.
//!
//! Avoids wasting rate-limiter tokens on engines that are currently blocked.
//! Cooldowns are tracked per engine and separately from the global limiter:
//! the limiter protects our IP, the tracker remembers which remote service
//! is refusing us.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Health status for a single search engine.
#[derive(Debug, Clone)]
pub struct EngineHealth {
    pub engine_name: String,
    pub consecutive_failures: u32,
    pub total_requests: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    pub last_success: Option<Instant>,
    pub last_failure: Option<Instant>,
    pub cooldown_until: Option<Instant>,
}

impl EngineHealth {
    fn new(name: &str) -> Self {
        Self {
            engine_name: name.to_string(),
            consecutive_failures: 0,
            total_requests: 0,
            total_successes: 0,
            total_failures: 0,
            last_success: None,
            last_failure: None,
            cooldown_until: None,
        }
    }

    /// Success rate in [0, 1]. No data → 1.0 (new engines assumed healthy).
    fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            return 1.0;
        }
        self.total_successes as f64 / self.total_requests as f64
    }
}

/// Read-only stats snapshot for one engine.
#[derive(Debug, Clone, serde::Serialize)]
pub struct EngineStats {
    pub total_requests: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    pub consecutive_failures: u32,
    pub success_rate: f64,
    pub is_healthy: bool,
    pub cooldown_remaining_secs: f64,
}

/// Tracks health of multiple search engines and orders selection by score.
///
/// Cooldown policy mirrors the global limiter (exponential, capped) but is
/// per-engine: 1st failure = base, 2nd = 2×base, … clipped at the max.
pub struct EngineHealthTracker {
    base_cooldown: Duration,
    max_cooldown: Duration,
    engines: Mutex<HashMap<String, EngineHealth>>,
}

impl EngineHealthTracker {
    pub fn new(base_cooldown: Duration, max_cooldown: Duration) -> Self {
        info!(
            "[EngineHealth] Initialized with base_cooldown={:.0}s, max_cooldown={:.0}s",
            base_cooldown.as_secs_f64(),
            max_cooldown.as_secs_f64()
        );
        Self {
            base_cooldown,
            max_cooldown,
            engines: Mutex::new(HashMap::new()),
        }
    }

    /// Defaults: 60 s base cooldown, 10 min ceiling.
    pub fn with_defaults() -> Self {
        Self::new(Duration::from_secs(60), Duration::from_secs(600))
    }

    /// Check whether an engine can be used. An expired cooldown is cleared
    /// here and consecutive_failures reset, so the next failure starts the
    /// exponential ladder from the bottom again.
    pub fn is_healthy(&self, engine_name: &str) -> bool {
        let mut engines = self.engines.lock().unwrap_or_else(|e| e.into_inner());
        let engine = engines
            .entry(engine_name.to_string())
            .or_insert_with(|| EngineHealth::new(engine_name));

        let Some(until) = engine.cooldown_until else {
            return true;
        };

        if Instant::now() >= until {
            info!("[EngineHealth] {} cooldown expired, marking healthy", engine_name);
            engine.cooldown_until = None;
            engine.consecutive_failures = 0;
            return true;
        }

        debug!(
            "[EngineHealth] {} still in cooldown ({:.0}s remaining)",
            engine_name,
            (until - Instant::now()).as_secs_f64()
        );
        false
    }

    /// Record a successful search: clears cooldown and failure streak.
    pub fn report_success(&self, engine_name: &str) {
        let mut engines = self.engines.lock().unwrap_or_else(|e| e.into_inner());
        let engine = engines
            .entry(engine_name.to_string())
            .or_insert_with(|| EngineHealth::new(engine_name));
        engine.total_requests += 1;
        engine.total_successes += 1;
        engine.last_success = Some(Instant::now());

        if engine.consecutive_failures > 0 || engine.cooldown_until.is_some() {
            info!(
                "[EngineHealth] {} successful! Clearing {} consecutive failures",
                engine_name, engine.consecutive_failures
            );
        }
        engine.consecutive_failures = 0;
        engine.cooldown_until = None;
    }

    /// Record a failed search (rate limit or other block) and start/extend
    /// the exponential cooldown.
    pub fn report_failure(&self, engine_name: &str, failure_type: &str) {
        let mut engines = self.engines.lock().unwrap_or_else(|e| e.into_inner());
        let engine = engines
            .entry(engine_name.to_string())
            .or_insert_with(|| EngineHealth::new(engine_name));
        engine.total_requests += 1;
        engine.total_failures += 1;
        engine.last_failure = Some(Instant::now());
        engine.consecutive_failures += 1;

        let factor = 2u32.saturating_pow(engine.consecutive_failures.saturating_sub(1).min(16));
        let cooldown = self.base_cooldown.saturating_mul(factor).min(self.max_cooldown);
        engine.cooldown_until = Some(Instant::now() + cooldown);

        warn!(
            "[EngineHealth] {} {}! Consecutive failures: {}, Cooldown: {:.0}s, Success rate: {:.1}% ({}/{})",
            engine_name,
            failure_type,
            engine.consecutive_failures,
            cooldown.as_secs_f64(),
            engine.success_rate() * 100.0,
            engine.total_successes,
            engine.total_requests
        );
    }

    /// Filter to healthy engines, ordered by success rate descending.
    pub fn get_healthy_engines(&self, engine_names: &[String]) -> Vec<String> {
        let mut healthy: Vec<String> = engine_names
            .iter()
            .filter(|name| self.is_healthy(name))
            .cloned()
            .collect();

        healthy.sort_by(|a, b| {
            self.success_rate(b)
                .partial_cmp(&self.success_rate(a))
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        if healthy.is_empty() {
            warn!(
                "[EngineHealth] No healthy engines available! All {} are in cooldown",
                engine_names.len()
            );
        } else {
            info!(
                "[EngineHealth] Healthy engines ({}/{}): {}",
                healthy.len(),
                engine_names.len(),
                healthy.join(", ")
            );
        }
        healthy
    }

    pub fn success_rate(&self, engine_name: &str) -> f64 {
        let mut engines = self.engines.lock().unwrap_or_else(|e| e.into_inner());
        engines
            .entry(engine_name.to_string())
            .or_insert_with(|| EngineHealth::new(engine_name))
            .success_rate()
    }

    /// Health statistics for all tracked engines.
    pub fn get_stats(&self) -> HashMap<String, EngineStats> {
        let engines = self.engines.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        engines
            .iter()
            .map(|(name, e)| {
                let cooldown_remaining = e
                    .cooldown_until
                    .filter(|&u| u > now)
                    .map(|u| (u - now).as_secs_f64())
                    .unwrap_or(0.0);
                (
                    name.clone(),
                    EngineStats {
                        total_requests: e.total_requests,
                        total_successes: e.total_successes,
                        total_failures: e.total_failures,
                        consecutive_failures: e.consecutive_failures,
                        success_rate: e.success_rate(),
                        is_healthy: cooldown_remaining == 0.0,
                        cooldown_remaining_secs: cooldown_remaining,
                    },
                )
            })
            .collect()
    }
}

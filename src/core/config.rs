use std::path::{Path, PathBuf};
use std::time::Duration;

// ---------------------------------------------------------------------------
// CoreConfig — file-based config loader (forage.json) with env-var fallback
// ---------------------------------------------------------------------------

/// LLM sub-config (mirrors the `llm` key in forage.json).
#[derive(serde::Deserialize, Default, Clone, Debug)]
pub struct LlmConfig {
    /// Endpoint — e.g. `https://api.openai.com/v1` or `http://localhost:11434/v1` (Ollama).
    pub base_url: Option<String>,
    /// API key. Never logged. Leave blank for key-less local endpoints.
    pub api_key: Option<String>,
    /// Model name — e.g. `gpt-4o-mini`, `llama3`, `mistral`.
    pub model: Option<String>,
    /// Per-call timeout in seconds. Default: 30.
    pub timeout_secs: Option<u64>,
    /// Retry attempts per call before reporting `llm_unavailable`. Default: 3.
    pub max_retries: Option<u32>,
}

impl LlmConfig {
    /// API key: JSON field → `OPENAI_API_KEY` env var → `None`.
    ///
    /// An explicit empty string in the config means "no key required"
    /// (Ollama / LM Studio) and is passed through as `Some("")`.
    pub fn resolve_api_key(&self) -> Option<String> {
        if let Some(k) = &self.api_key {
            return Some(k.trim().to_string());
        }
        std::env::var("OPENAI_API_KEY").ok().filter(|v| !v.trim().is_empty())
    }

    /// Base URL: JSON field → `OPENAI_BASE_URL` env var → OpenAI default.
    pub fn resolve_base_url(&self) -> String {
        if let Some(u) = &self.base_url {
            if !u.trim().is_empty() {
                return u.clone();
            }
        }
        std::env::var("OPENAI_BASE_URL")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| "https://api.openai.com/v1".to_string())
    }

    /// Model name: JSON field → `FORAGE_LLM_MODEL` env var → `gpt-4o-mini`.
    pub fn resolve_model(&self) -> String {
        if let Some(m) = &self.model {
            if !m.trim().is_empty() {
                return m.clone();
            }
        }
        std::env::var("FORAGE_LLM_MODEL")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| "gpt-4o-mini".to_string())
    }

    pub fn resolve_timeout(&self) -> Duration {
        let secs = self
            .timeout_secs
            .or_else(|| env_parse("FORAGE_LLM_TIMEOUT_SECS"))
            .unwrap_or(30);
        Duration::from_secs(secs)
    }

    pub fn resolve_max_retries(&self) -> u32 {
        self.max_retries
            .or_else(|| env_parse("FORAGE_LLM_MAX_RETRIES"))
            .unwrap_or(3)
    }
}

/// Search pacing + engine health sub-config.
#[derive(serde::Deserialize, Default, Clone, Debug)]
pub struct SearchConfig {
    /// Minimum seconds between any two outbound searches. Default: 15.
    pub min_delay_secs: Option<f64>,
    /// Extra backoff after a detected rate limit. Default: 30.
    pub backoff_on_block_secs: Option<f64>,
    /// Backoff ceiling. Default: 120.
    pub max_backoff_secs: Option<f64>,
    /// Engine cooldown after first failure. Default: 60.
    pub base_cooldown_secs: Option<f64>,
    /// Engine cooldown ceiling. Default: 600.
    pub max_cooldown_secs: Option<f64>,
    /// Comma-separated engine list override.
    pub engines: Option<String>,
    /// Max SERP entries per engine. Default: 10.
    pub max_results: Option<usize>,
}

impl SearchConfig {
    pub fn resolve_min_delay(&self) -> Duration {
        secs_f64(self.min_delay_secs.or_else(|| env_parse("FORAGE_SEARCH_MIN_DELAY_SECS")), 15.0)
    }

    pub fn resolve_backoff_on_block(&self) -> Duration {
        secs_f64(
            self.backoff_on_block_secs
                .or_else(|| env_parse("FORAGE_SEARCH_BACKOFF_SECS")),
            30.0,
        )
    }

    pub fn resolve_max_backoff(&self) -> Duration {
        secs_f64(
            self.max_backoff_secs
                .or_else(|| env_parse("FORAGE_SEARCH_MAX_BACKOFF_SECS")),
            120.0,
        )
    }

    pub fn resolve_base_cooldown(&self) -> Duration {
        secs_f64(
            self.base_cooldown_secs
                .or_else(|| env_parse("FORAGE_ENGINE_BASE_COOLDOWN_SECS")),
            60.0,
        )
    }

    pub fn resolve_max_cooldown(&self) -> Duration {
        secs_f64(
            self.max_cooldown_secs
                .or_else(|| env_parse("FORAGE_ENGINE_MAX_COOLDOWN_SECS")),
            600.0,
        )
    }

    pub fn resolve_engines(&self) -> Vec<String> {
        self.engines
            .clone()
            .or_else(|| std::env::var("FORAGE_SEARCH_ENGINES").ok())
            .unwrap_or_else(|| "google,bing,duckduckgo,brave".to_string())
            .split(',')
            .map(|s| s.trim().to_ascii_lowercase())
            .filter(|s| !s.is_empty())
            .collect()
    }

    pub fn resolve_max_results(&self) -> usize {
        self.max_results
            .or_else(|| env_parse("FORAGE_SEARCH_MAX_RESULTS"))
            .unwrap_or(10)
    }
}

/// Caching / memory sub-config.
#[derive(serde::Deserialize, Default, Clone, Debug)]
pub struct CacheConfig {
    /// Whether the response cache is consulted/populated at all. Default: true.
    pub enabled: Option<bool>,
    /// Default entry TTL in hours. Default: 6.
    pub ttl_hours: Option<i64>,
    /// Minimum semantic similarity for a cache hit. Default: 0.5.
    pub similarity_threshold: Option<f32>,
    /// Completeness threshold for recommending a Phase-1 skip. Default: 0.7.
    pub knowledge_completeness_threshold: Option<f64>,
    /// Confidence threshold for recommending a Phase-1 skip. Default: 0.6.
    pub knowledge_confidence_threshold: Option<f64>,
}

impl CacheConfig {
    pub fn resolve_enabled(&self) -> bool {
        if let Some(b) = self.enabled {
            return b;
        }
        // Legacy env toggle: "0" means disabled
        std::env::var("FORAGE_RESPONSE_CACHE")
            .map(|v| v.trim() != "0")
            .unwrap_or(true)
    }

    pub fn resolve_ttl_hours(&self) -> i64 {
        self.ttl_hours.or_else(|| env_parse("FORAGE_CACHE_TTL_HOURS")).unwrap_or(6)
    }

    pub fn resolve_similarity_threshold(&self) -> f32 {
        self.similarity_threshold
            .or_else(|| env_parse("FORAGE_CACHE_SIMILARITY"))
            .unwrap_or(0.5)
    }

    pub fn resolve_completeness_threshold(&self) -> f64 {
        self.knowledge_completeness_threshold
            .or_else(|| env_parse("FORAGE_KNOWLEDGE_COMPLETENESS"))
            .unwrap_or(0.7)
    }

    pub fn resolve_confidence_threshold(&self) -> f64 {
        self.knowledge_confidence_threshold
            .or_else(|| env_parse("FORAGE_KNOWLEDGE_CONFIDENCE"))
            .unwrap_or(0.6)
    }
}

/// Research execution sub-config (timeouts, caps).
#[derive(serde::Deserialize, Default, Clone, Debug)]
pub struct ResearchConfig {
    /// Per-page fetch timeout in seconds. Default: 30.
    pub fetch_timeout_secs: Option<u64>,
    /// Post-navigation settle wait in milliseconds. Default: 1500.
    pub fetch_settle_ms: Option<u64>,
    /// Per-vendor budget in seconds. Default: 60.
    pub vendor_timeout_secs: Option<u64>,
    /// Intervention wait in seconds. Default: 120.
    pub intervention_timeout_secs: Option<u64>,
    /// Phase-2 vendor concurrency cap. Default: 3.
    pub vendor_concurrency: Option<usize>,
    /// Deep-mode safety cap on passes. Default: 10.
    pub max_passes: Option<usize>,
    /// Navigator step cap. Default: 5.
    pub navigator_max_steps: Option<usize>,
    /// Whether human-assist interventions are allowed. Default: true.
    pub human_assist: Option<bool>,
    /// Blocker confidence required to request an intervention. Default: 0.6.
    pub blocker_confidence_threshold: Option<f64>,
}

impl ResearchConfig {
    pub fn resolve_fetch_timeout(&self) -> Duration {
        Duration::from_secs(
            self.fetch_timeout_secs
                .or_else(|| env_parse("FORAGE_FETCH_TIMEOUT_SECS"))
                .unwrap_or(30),
        )
    }

    pub fn resolve_fetch_settle(&self) -> Duration {
        Duration::from_millis(
            self.fetch_settle_ms
                .or_else(|| env_parse("FORAGE_FETCH_SETTLE_MS"))
                .unwrap_or(1500),
        )
    }

    pub fn resolve_vendor_timeout(&self) -> Duration {
        Duration::from_secs(
            self.vendor_timeout_secs
                .or_else(|| env_parse("FORAGE_VENDOR_TIMEOUT_SECS"))
                .unwrap_or(60),
        )
    }

    pub fn resolve_intervention_timeout(&self) -> Duration {
        Duration::from_secs(
            self.intervention_timeout_secs
                .or_else(|| env_parse("FORAGE_INTERVENTION_TIMEOUT_SECS"))
                .unwrap_or(120),
        )
    }

    pub fn resolve_vendor_concurrency(&self) -> usize {
        self.vendor_concurrency
            .or_else(|| env_parse("FORAGE_VENDOR_CONCURRENCY"))
            .unwrap_or(3)
            .max(1)
    }

    pub fn resolve_max_passes(&self) -> usize {
        self.max_passes
            .or_else(|| env_parse("FORAGE_MAX_PASSES"))
            .unwrap_or(10)
            .max(1)
    }

    pub fn resolve_navigator_max_steps(&self) -> usize {
        self.navigator_max_steps
            .or_else(|| env_parse("FORAGE_NAVIGATOR_MAX_STEPS"))
            .unwrap_or(5)
            .max(1)
    }

    pub fn resolve_human_assist(&self) -> bool {
        if let Some(b) = self.human_assist {
            return b;
        }
        std::env::var("FORAGE_HUMAN_ASSIST")
            .map(|v| v.trim() != "0")
            .unwrap_or(true)
    }

    pub fn resolve_blocker_confidence(&self) -> f64 {
        self.blocker_confidence_threshold
            .or_else(|| env_parse("FORAGE_BLOCKER_CONFIDENCE"))
            .unwrap_or(0.6)
    }
}

/// Top-level config loaded from `forage.json`.
#[derive(serde::Deserialize, Default, Clone, Debug)]
pub struct CoreConfig {
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub research: ResearchConfig,
    /// State directory override; defaults to `~/.forage`.
    pub state_dir: Option<String>,
}

impl CoreConfig {
    /// Directory that holds all persisted state (registries, caches, index,
    /// browser sessions). Created on demand by the stores that live in it.
    pub fn resolve_state_dir(&self) -> PathBuf {
        if let Some(dir) = &self.state_dir {
            if !dir.trim().is_empty() {
                return PathBuf::from(dir);
            }
        }
        if let Ok(dir) = std::env::var("FORAGE_STATE_DIR") {
            if !dir.trim().is_empty() {
                return PathBuf::from(dir);
            }
        }
        dirs::home_dir()
            .map(|h| h.join(".forage"))
            .unwrap_or_else(|| PathBuf::from(".forage"))
    }
}

/// Load `forage.json` from standard locations.
///
/// Search order (first found wins):
/// 1. `FORAGE_CONFIG` env var path
/// 2. `./forage.json`
/// 3. `../forage.json`
///
/// Missing file → `CoreConfig::default()` (silent, all env-var fallbacks apply).
/// Parse error → log a warning, return `CoreConfig::default()`.
pub fn load_core_config() -> CoreConfig {
    let candidates: Vec<PathBuf> = {
        let mut v = vec![PathBuf::from("forage.json"), PathBuf::from("../forage.json")];
        if let Ok(env_path) = std::env::var("FORAGE_CONFIG") {
            v.insert(0, PathBuf::from(env_path));
        }
        v
    };

    for path in &candidates {
        match std::fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str::<CoreConfig>(&contents) {
                Ok(cfg) => {
                    tracing::info!("forage.json loaded from {}", path.display());
                    return cfg;
                }
                Err(e) => {
                    tracing::warn!(
                        "forage.json parse error at {}: {} — using defaults",
                        path.display(),
                        e
                    );
                    return CoreConfig::default();
                }
            },
            Err(_) => continue, // file not found at this path — try next
        }
    }

    CoreConfig::default()
}

// ---------------------------------------------------------------------------

pub const ENV_CHROME_EXECUTABLE: &str = "CHROME_EXECUTABLE";

/// Optional override for the Chromium-family browser executable.
///
/// Default behavior is auto-discovery (see `browser::launcher`). This only
/// returns a value when `CHROME_EXECUTABLE` points at an existing path.
pub fn chrome_executable_override() -> Option<String> {
    let p = std::env::var(ENV_CHROME_EXECUTABLE).ok()?;
    let p = p.trim();
    if p.is_empty() {
        return None;
    }
    if Path::new(p).exists() {
        Some(p.to_string())
    } else {
        None
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn secs_f64(value: Option<f64>, default: f64) -> Duration {
    Duration::from_secs_f64(value.unwrap_or(default).max(0.0))
}

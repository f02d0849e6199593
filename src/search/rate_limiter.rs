//! Global search rate limiter.
//!
//! Prevents burst traffic toward search engines, which is the single biggest
//! trigger of 418/CAPTCHA blocks. One instance is shared by every caller in
//! the process; all outbound searches serialize through it regardless of
//! which engine they target.

use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

struct LimiterState {
    last_request: Option<Instant>,
    current_backoff: Duration,
    consecutive_blocks: u32,
}

/// Process-wide pacing of outbound search requests with exponential backoff.
///
/// Defaults are deliberately long (SerpAPI-style: ~15 s between searches from
/// one IP); pacing is policy, not a per-engine tunable.
pub struct SearchRateLimiter {
    min_delay: Duration,
    backoff_on_block: Duration,
    max_backoff: Duration,
    state: Mutex<LimiterState>,
}

impl SearchRateLimiter {
    pub fn new(min_delay: Duration, backoff_on_block: Duration, max_backoff: Duration) -> Self {
        Self {
            min_delay,
            backoff_on_block,
            max_backoff,
            state: Mutex::new(LimiterState {
                last_request: None,
                current_backoff: Duration::ZERO,
                consecutive_blocks: 0,
            }),
        }
    }

    /// Production defaults: 15 s min delay, 30 s backoff step, 120 s ceiling.
    pub fn with_defaults() -> Self {
        Self::new(
            Duration::from_secs(15),
            Duration::from_secs(30),
            Duration::from_secs(120),
        )
    }

    /// Acquire permission to make a search request. Blocks until
    /// `now - last_request ≥ min_delay + current_backoff`. The wait happens
    /// inside the critical section so callers are strictly serialized.
    pub async fn acquire(&self, query: &str, engine: &str) {
        let mut state = self.state.lock().await;

        if let Some(last) = state.last_request {
            let required = self.min_delay + state.current_backoff;
            let elapsed = last.elapsed();
            if elapsed < required {
                let wait = required - elapsed;
                info!(
                    "[RateLimit] Throttling {} search: waiting {:.1}s (query: {}…)",
                    engine,
                    wait.as_secs_f64(),
                    crate::llm::truncate(query, 40)
                );
                tokio::time::sleep(wait).await;
            }
        }

        state.last_request = Some(Instant::now());
        debug!(
            "[RateLimit] Approved {} search: {}… (backoff: {:.1}s)",
            engine,
            crate::llm::truncate(query, 40),
            state.current_backoff.as_secs_f64()
        );
    }

    /// Report that a rate limit was encountered; grows the backoff
    /// exponentially: `backoff_on_block × 2^(blocks-1)`, clipped at the cap.
    pub async fn report_rate_limit(&self, engine: &str) {
        let mut state = self.state.lock().await;
        state.consecutive_blocks += 1;
        state.current_backoff = backoff_for(
            self.backoff_on_block,
            self.max_backoff,
            state.consecutive_blocks,
        );
        warn!(
            "[RateLimit] {} rate limit detected! Increasing backoff to {:.1}s ({} consecutive blocks)",
            engine,
            state.current_backoff.as_secs_f64(),
            state.consecutive_blocks
        );
    }

    /// Report a successful search; gradually reduces backoff.
    pub async fn report_success(&self) {
        let mut state = self.state.lock().await;
        if state.consecutive_blocks > 0 {
            state.consecutive_blocks -= 1;
            state.current_backoff = if state.consecutive_blocks == 0 {
                Duration::ZERO
            } else {
                backoff_for(
                    self.backoff_on_block,
                    self.max_backoff,
                    state.consecutive_blocks,
                )
            };
            info!(
                "[RateLimit] Search succeeded, reducing backoff to {:.1}s",
                state.current_backoff.as_secs_f64()
            );
        }
    }

    /// Reset backoff state (tests and manual intervention).
    pub async fn reset(&self) {
        let mut state = self.state.lock().await;
        state.consecutive_blocks = 0;
        state.current_backoff = Duration::ZERO;
        info!("[RateLimit] Backoff reset");
    }

    /// Current imposed backoff (beyond the min delay).
    pub async fn current_backoff(&self) -> Duration {
        self.state.lock().await.current_backoff
    }

    pub async fn consecutive_blocks(&self) -> u32 {
        self.state.lock().await.consecutive_blocks
    }
}

fn backoff_for(base: Duration, max: Duration, blocks: u32) -> Duration {
    if blocks == 0 {
        return Duration::ZERO;
    }
    let factor = 2u32.saturating_pow(blocks.saturating_sub(1).min(16));
    base.saturating_mul(factor).min(max)
}

//! Human-in-the-loop intervention plumbing.
//!
//! When the fetcher is confident it hit a CAPTCHA or bot wall, it registers
//! a pending intervention with the injected sink and blocks (bounded) until
//! an operator or upstream service resolves it — typically by solving the
//! challenge in a live browser and handing back the resulting cookies.

use anyhow::Result;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::core::error::BlockKind;

/// A blocker waiting on external resolution.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PendingIntervention {
    pub id: String,
    pub blocker_type: BlockKind,
    pub url: String,
    pub session_id: String,
    /// Base64 JPEG of the blocked page, when the backend could capture one.
    pub screenshot_b64: Option<String>,
    pub details: String,
}

/// What the resolver hands back: cookies to inject before the retry.
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct InterventionResolution {
    #[serde(default)]
    pub cookies: Vec<serde_json::Value>,
    #[serde(default)]
    pub note: Option<String>,
}

/// Handle returned by `request_intervention`; await it with a timeout.
pub struct InterventionHandle {
    pub id: String,
    receiver: oneshot::Receiver<InterventionResolution>,
}

impl InterventionHandle {
    /// Wait for resolution up to `timeout`. `None` = timed out or the sink
    /// dropped the request.
    pub async fn wait_for_resolution(self, timeout: Duration) -> Option<InterventionResolution> {
        match tokio::time::timeout(timeout, self.receiver).await {
            Ok(Ok(resolution)) => Some(resolution),
            Ok(Err(_)) => {
                warn!("[Intervention] {} resolver dropped without answering", self.id);
                None
            }
            Err(_) => {
                warn!(
                    "[Intervention] {} timed out after {:.0}s",
                    self.id,
                    timeout.as_secs_f64()
                );
                None
            }
        }
    }
}

/// Externally-implemented resolution channel (operator UI, solver service).
#[async_trait::async_trait]
pub trait InterventionSink: Send + Sync {
    async fn request_intervention(
        &self,
        pending: PendingIntervention,
    ) -> Result<InterventionHandle>;
}

// ───────────────────────────────────────────────────────────────────────────
// In-process sink
// ───────────────────────────────────────────────────────────────────────────

/// Sink that parks pending interventions in memory until some other part of
/// the process (CLI prompt, test harness, embedding application) calls
/// `resolve`. This is the default wiring; swap in a custom sink to bridge to
/// a remote solver.
#[derive(Default)]
pub struct ManualInterventionSink {
    pending: Mutex<HashMap<String, oneshot::Sender<InterventionResolution>>>,
}

impl ManualInterventionSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ids of interventions currently awaiting resolution.
    pub fn pending_ids(&self) -> Vec<String> {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    /// Resolve a pending intervention. Returns false when the id is unknown
    /// (already resolved, timed out, or never registered).
    pub fn resolve(&self, id: &str, resolution: InterventionResolution) -> bool {
        let sender = self
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
        match sender {
            Some(tx) => {
                info!("[Intervention] {} resolved ({} cookies)", id, resolution.cookies.len());
                tx.send(resolution).is_ok()
            }
            None => false,
        }
    }
}

#[async_trait::async_trait]
impl InterventionSink for ManualInterventionSink {
    async fn request_intervention(
        &self,
        pending: PendingIntervention,
    ) -> Result<InterventionHandle> {
        let (tx, rx) = oneshot::channel();
        let id = pending.id.clone();
        info!(
            "[Intervention] registered {} — {} at {}",
            id, pending.blocker_type, pending.url
        );
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.clone(), tx);
        Ok(InterventionHandle { id, receiver: rx })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending(id: &str) -> PendingIntervention {
        PendingIntervention {
            id: id.to_string(),
            blocker_type: BlockKind::Captcha,
            url: "https://vendor.example/".into(),
            session_id: "s1".into(),
            screenshot_b64: None,
            details: "captcha iframe".into(),
        }
    }

    #[tokio::test]
    async fn resolve_delivers_cookies() {
        let sink = ManualInterventionSink::new();
        let handle = sink.request_intervention(pending("iv-1")).await.unwrap();
        assert_eq!(sink.pending_ids(), vec!["iv-1".to_string()]);

        let resolved = InterventionResolution {
            cookies: vec![serde_json::json!({"name": "cf", "value": "tok"})],
            note: None,
        };
        assert!(sink.resolve("iv-1", resolved));

        let got = handle
            .wait_for_resolution(Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(got.cookies.len(), 1);
        assert!(sink.pending_ids().is_empty());
    }

    #[tokio::test]
    async fn timeout_returns_none() {
        let sink = ManualInterventionSink::new();
        let handle = sink.request_intervention(pending("iv-2")).await.unwrap();
        let got = handle.wait_for_resolution(Duration::from_millis(20)).await;
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn resolving_unknown_id_is_false() {
        let sink = ManualInterventionSink::new();
        assert!(!sink.resolve("nope", InterventionResolution::default()));
    }
}

//! Optional progress-event sink.
//!
//! Emission is fire-and-forget: research never blocks on or fails because of
//! an event consumer.

use std::sync::Mutex;

pub trait EventSink: Send + Sync {
    fn emit(&self, kind: &str, payload: serde_json::Value);
}

/// Sink that records events in memory; used by tests and the CLI's verbose
/// mode.
#[derive(Default)]
pub struct CollectingEventSink {
    events: Mutex<Vec<(String, serde_json::Value)>>,
}

impl CollectingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<(String, serde_json::Value)> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn kinds(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .map(|(k, _)| k)
            .collect()
    }
}

impl EventSink for CollectingEventSink {
    fn emit(&self, kind: &str, payload: serde_json::Value) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((kind.to_string(), payload));
    }
}

/// Emit to an optional sink without cluttering call sites.
pub fn emit(sink: &Option<std::sync::Arc<dyn EventSink>>, kind: &str, payload: serde_json::Value) {
    if let Some(s) = sink {
        s.emit(kind, payload);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collecting_sink_records_in_order() {
        let sink = CollectingEventSink::new();
        sink.emit("phase1_started", serde_json::json!({"query": "q"}));
        sink.emit("phase1_complete", serde_json::json!({}));
        assert_eq!(sink.kinds(), vec!["phase1_started", "phase1_complete"]);
    }
}

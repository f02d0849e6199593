//! Blocker recovery through human-assist: a CAPTCHA page triggers an
//! intervention, the resolver supplies cookies, and the fetcher retries once
//! with the resolved state.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{ArcMockBrowser, MockBrowser, MockSite};
use forage::browser::fetcher::{FetchOutcome, FetcherPolicy, PageFetcher};
use forage::browser::intervention::{InterventionResolution, ManualInterventionSink};
use forage::browser::session_store::SessionStore;
use forage::core::events::CollectingEventSink;

fn blocked_vendor_browser() -> Arc<MockBrowser> {
    let browser = Arc::new(MockBrowser::new());
    let mut site = MockSite::normal("Vendor Shop", "Syrian hamsters and supplies");
    site.blocked_until_cookie = Some("cf_clearance".to_string());
    browser.add_site("https://vendor.example/", site);
    browser
}

fn fetcher_with(
    browser: Arc<MockBrowser>,
    sessions: Arc<SessionStore>,
    sink: Option<Arc<ManualInterventionSink>>,
    events: Arc<CollectingEventSink>,
    human_assist: bool,
) -> PageFetcher {
    PageFetcher::new(
        Arc::new(ArcMockBrowser(browser)),
        sessions,
        sink.map(|s| s as Arc<dyn forage::browser::intervention::InterventionSink>),
        Some(events),
        FetcherPolicy {
            fetch_timeout: Duration::from_secs(5),
            intervention_timeout: Duration::from_secs(5),
            blocker_confidence_threshold: 0.6,
            human_assist,
            settle: Duration::ZERO,
        },
    )
}

#[tokio::test]
async fn captcha_resolved_via_intervention_cookies() {
    let dir = tempfile::tempdir().unwrap();
    let sessions = Arc::new(SessionStore::new(dir.path().join("sessions")));
    let sink = Arc::new(ManualInterventionSink::new());
    let events = Arc::new(CollectingEventSink::new());
    let browser = blocked_vendor_browser();
    let fetcher = fetcher_with(browser, sessions.clone(), Some(sink.clone()), events.clone(), true);

    // Resolver: waits for the intervention to register, then hands back the
    // clearance cookie after a short delay — the human solving the CAPTCHA.
    let resolver_sink = sink.clone();
    let resolver = tokio::spawn(async move {
        for _ in 0..100 {
            let pending = resolver_sink.pending_ids();
            if let Some(id) = pending.first() {
                tokio::time::sleep(Duration::from_millis(50)).await;
                assert!(resolver_sink.resolve(
                    id,
                    InterventionResolution {
                        cookies: vec![serde_json::json!({
                            "name": "cf_clearance",
                            "value": "solved-token",
                            "domain": "vendor.example",
                        })],
                        note: None,
                    },
                ));
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("intervention never registered");
    });

    let outcome = fetcher
        .fetch("https://vendor.example/", "sess-captcha")
        .await
        .unwrap();
    resolver.await.unwrap();

    match outcome {
        FetchOutcome::Success(fetched) => {
            assert!(fetched.html.contains("Syrian hamsters"));
            fetched.page.close().await;
        }
        FetchOutcome::Blocked { kind, .. } => panic!("still blocked: {}", kind),
    }

    // Lifecycle events in order: requested then resolved.
    let kinds = events.kinds();
    assert!(kinds.contains(&"intervention_requested".to_string()));
    assert!(kinds.contains(&"intervention_resolved".to_string()));

    // The resolved cookies were persisted for the (session, domain), so the
    // next fetch starts authenticated.
    let stored = sessions
        .load("sess-captcha", "https://vendor.example/")
        .expect("cookies persisted");
    assert!(stored
        .iter()
        .any(|c| c.get("name").and_then(|v| v.as_str()) == Some("cf_clearance")));
}

#[tokio::test]
async fn timeout_without_resolution_returns_blocked() {
    let dir = tempfile::tempdir().unwrap();
    let sessions = Arc::new(SessionStore::new(dir.path().join("sessions")));
    let sink = Arc::new(ManualInterventionSink::new());
    let events = Arc::new(CollectingEventSink::new());
    let browser = blocked_vendor_browser();

    let fetcher = PageFetcher::new(
        Arc::new(ArcMockBrowser(browser)),
        sessions,
        Some(sink as Arc<dyn forage::browser::intervention::InterventionSink>),
        Some(events.clone()),
        FetcherPolicy {
            fetch_timeout: Duration::from_secs(5),
            intervention_timeout: Duration::from_millis(80), // nobody answers
            blocker_confidence_threshold: 0.6,
            human_assist: true,
            settle: Duration::ZERO,
        },
    );

    let outcome = fetcher
        .fetch("https://vendor.example/", "sess-timeout")
        .await
        .unwrap();
    assert!(matches!(outcome, FetchOutcome::Blocked { .. }));
    assert!(events.kinds().contains(&"intervention_timeout".to_string()));
}

#[tokio::test]
async fn human_assist_disabled_blocks_without_intervention() {
    let dir = tempfile::tempdir().unwrap();
    let sessions = Arc::new(SessionStore::new(dir.path().join("sessions")));
    let sink = Arc::new(ManualInterventionSink::new());
    let events = Arc::new(CollectingEventSink::new());
    let browser = blocked_vendor_browser();
    let fetcher = fetcher_with(browser, sessions, Some(sink.clone()), events.clone(), false);

    let outcome = fetcher
        .fetch("https://vendor.example/", "sess-noassist")
        .await
        .unwrap();
    assert!(matches!(outcome, FetchOutcome::Blocked { .. }));
    assert!(sink.pending_ids().is_empty(), "no intervention registered");
    assert!(!events.kinds().contains(&"intervention_requested".to_string()));
}

#[tokio::test]
async fn unblocked_fetch_persists_cookies() {
    let dir = tempfile::tempdir().unwrap();
    let sessions = Arc::new(SessionStore::new(dir.path().join("sessions")));
    let events = Arc::new(CollectingEventSink::new());
    let browser = Arc::new(MockBrowser::new());
    browser.add_site(
        "https://open.example/",
        MockSite::normal("Open Site", "welcome"),
    );
    let fetcher = fetcher_with(browser, sessions.clone(), None, events, true);

    let outcome = fetcher.fetch("https://open.example/", "sess-open").await.unwrap();
    match outcome {
        FetchOutcome::Success(fetched) => {
            assert!(fetched.html.contains("Open Site"));
            assert_eq!(fetched.final_url, "https://open.example/");
            fetched.page.close().await;
        }
        FetchOutcome::Blocked { kind, .. } => panic!("unexpected block: {}", kind),
    }
}

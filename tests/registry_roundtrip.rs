//! Durable-state invariants for the schema and vendor registries: version
//! monotonicity across process restarts, field-for-field persistence
//! round-trips, and the recovery-before-block rule.

use forage::core::error::BlockKind;
use forage::registry::vendor::{
    CONSECUTIVE_FAILURES_BEFORE_BLOCK, RECOVERY_STRATEGIES,
};
use forage::registry::{SchemaRegistry, SiteSchema, VendorRegistry};

#[test]
fn schema_version_monotonic_across_restarts() {
    let dir = tempfile::tempdir().unwrap();

    {
        let reg = SchemaRegistry::open(dir.path());
        reg.save(SiteSchema::new("mono.example", "listing"));
        reg.save(SiteSchema::new("mono.example", "listing"));
    }

    // Reopen: version continues from persisted state, never resets.
    {
        let reg = SchemaRegistry::open(dir.path());
        assert_eq!(reg.get("mono.example", "listing").unwrap().version, 2);
        reg.save(SiteSchema::new("mono.example", "listing"));
        assert_eq!(reg.get("mono.example", "listing").unwrap().version, 3);
    }

    let reg = SchemaRegistry::open(dir.path());
    assert_eq!(reg.get("mono.example", "listing").unwrap().version, 3);
}

#[test]
fn schema_roundtrip_is_field_for_field() {
    let dir = tempfile::tempdir().unwrap();
    let mut schema = SiteSchema::new("shop.example", "listing");
    schema.product_card_selector = Some(".sku-item".into());
    schema.product_link_selector = Some("a.sku-title".into());
    schema.price_selector = Some(".priceView span".into());
    schema.title_selector = Some("h4.sku-header".into());
    schema.pagination_method = Some("click_next".into());
    schema.filter_selectors = vec![".facet a".into()];
    schema.json_ld_available = true;

    {
        let reg = SchemaRegistry::open(dir.path());
        reg.save(schema.clone());
        reg.record_extraction("shop.example", "listing", true, "schema");
        reg.record_extraction("shop.example", "listing", false, "vision");
    }

    let reg = SchemaRegistry::open(dir.path());
    let loaded = reg.get("shop.example", "listing").unwrap();
    assert_eq!(loaded.product_card_selector, schema.product_card_selector);
    assert_eq!(loaded.product_link_selector, schema.product_link_selector);
    assert_eq!(loaded.price_selector, schema.price_selector);
    assert_eq!(loaded.title_selector, schema.title_selector);
    assert_eq!(loaded.pagination_method, schema.pagination_method);
    assert_eq!(loaded.filter_selectors, schema.filter_selectors);
    assert!(loaded.json_ld_available);
    assert_eq!(loaded.successful_extractions, 1);
    assert_eq!(loaded.failed_extractions, 1);
    assert_eq!(loaded.method_stats["schema"].success, 1);
    assert_eq!(loaded.method_stats["vision"].fail, 1);
}

#[test]
fn vendor_blocked_implies_strategies_exhausted_and_threshold() {
    let dir = tempfile::tempdir().unwrap();
    let reg = VendorRegistry::open(dir.path());

    // Hammer a vendor with blocked visits, attempting (and failing) every
    // recovery strategy the registry suggests along the way.
    for _ in 0..12 {
        if let Some(strategy) =
            reg.record_visit("fortress.example", false, 0.0, Some(BlockKind::BotDetection))
        {
            reg.record_recovery_attempt("fortress.example", strategy, false);
        }
        if reg.is_blocked("fortress.example") {
            break;
        }
    }

    let vendor = reg.get("fortress.example").unwrap();
    assert!(vendor.is_blocked, "vendor should end up blocked");
    // The §-level invariant: blocked ⇒ all strategies tried AND failure
    // streak at/above the block threshold.
    for strategy in RECOVERY_STRATEGIES {
        assert!(
            vendor.recovery_strategies_tried.iter().any(|t| t == strategy),
            "strategy {} untried at block time",
            strategy
        );
    }
    assert!(vendor.consecutive_failures >= CONSECUTIVE_FAILURES_BEFORE_BLOCK);
    assert!(vendor.quarantine_until.is_some());
}

#[test]
fn vendor_roundtrip_preserves_recovery_state() {
    let dir = tempfile::tempdir().unwrap();
    {
        let reg = VendorRegistry::open(dir.path());
        reg.add_or_update(
            "persist.example",
            "Persist Co",
            &["pets".to_string()],
            "breeder",
            "phase1_intelligence",
            "syrian hamsters",
        );
        reg.record_visit("persist.example", false, 0.0, None);
        reg.record_visit("persist.example", false, 0.0, None);
        reg.record_recovery_attempt("persist.example", "recalibrate_selectors", false);
    }

    let reg = VendorRegistry::open(dir.path());
    let vendor = reg.get("persist.example").unwrap();
    assert_eq!(vendor.name, "Persist Co");
    assert_eq!(vendor.vendor_type, "breeder");
    assert_eq!(vendor.consecutive_failures, 2);
    assert_eq!(vendor.recovery_strategies_tried, vec!["recalibrate_selectors"]);
    assert_eq!(vendor.failed_extractions, 2);
    assert_eq!(vendor.discovery_query, "syrian hamsters");
}

#[test]
fn unrelated_block_does_not_leak_between_vendors() {
    let dir = tempfile::tempdir().unwrap();
    let reg = VendorRegistry::open(dir.path());

    reg.add_or_update("good.example", "", &[], "", "t", "");
    for _ in 0..12 {
        if let Some(s) = reg.record_visit("bad.example", false, 0.0, Some(BlockKind::Captcha)) {
            reg.record_recovery_attempt("bad.example", s, false);
        }
    }

    assert!(reg.is_blocked("bad.example"));
    assert!(!reg.is_blocked("good.example"));
    assert!(reg.is_usable("good.example"));
}

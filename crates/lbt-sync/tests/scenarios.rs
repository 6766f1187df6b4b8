//! End-to-end sync scenarios against the scripted source and the in-memory
//! store: the same trait surface the production wiring uses, minus the
//! network and Postgres.

use std::time::Duration;

use lbt_core::ReferenceKind;
use lbt_provider::{RawBillSummary, RawCodeItem, RawStep, ScriptedSource};
use lbt_store::MemStore;
use lbt_sync::{run_backfill, run_poll_cycle, run_recent_window, PageRange, RecentWindow, SyncConfig};

fn config() -> SyncConfig {
    SyncConfig {
        database_url: "postgres://unused".into(),
        api_base_url: "scripted://".into(),
        poll_interval: Duration::from_secs(600),
        http_timeout: Duration::from_secs(1),
        user_agent: "test".into(),
        page_size: 100,
        page_delay: Duration::ZERO,
    }
}

/// A source pre-loaded with the lookup tables every scenario needs.
fn seeded_source() -> ScriptedSource {
    let source = ScriptedSource::new();
    source.set_reference(
        ReferenceKind::Status,
        vec![
            RawCodeItem::new(100, "Aguardando parecer"),
            RawCodeItem::new(101, "Pronta para pauta"),
        ],
    );
    source.set_reference(
        ReferenceKind::StepType,
        vec![RawCodeItem::new(200, "Apresenta\u{e7}\u{e3}o")],
    );
    source.set_reference(ReferenceKind::Topic, vec![RawCodeItem::new(3, "Sa\u{fa}de")]);
    source
}

#[tokio::test]
async fn first_sync_records_steps_topics_and_denormalized_fields() {
    let source = seeded_source();
    let store = MemStore::new();
    store.add_favorite(7, 55);

    source.push_page(vec![RawBillSummary::new(55, "Altera a lei X", "PL", 123, 2024)]);
    source.set_steps(
        55,
        vec![RawStep::new(1, "2024-03-01T10:00:00", 100, 200).with_agency("CCJC", "Distribu\u{ed}do")],
    );
    source.set_topics(55, vec![RawCodeItem::new(3, "Sa\u{fa}de"), RawCodeItem::new(99, "Unknown")]);

    let summary = run_poll_cycle(&source, &store, &config())
        .await
        .expect("poll cycle");

    assert_eq!(summary.bills_new, 1);
    assert_eq!(summary.bills_updated, 0);
    assert_eq!(summary.steps_inserted, 1);
    assert_eq!(store.steps_for(55).len(), 1);
    // Topic 99 never made it into the reference table and must be dropped.
    assert_eq!(store.topics_for(55), vec![3]);

    let bill = store.bill(55).expect("bill stored");
    assert_eq!(bill.title.as_deref(), Some("Altera a lei X"));
    assert_eq!(bill.description.as_deref(), Some("PL 123/2024"));
    assert_eq!(bill.year_started, Some(2024));
    assert_eq!(bill.current_status_ref, Some(100));
    assert_eq!(bill.current_step_type_ref, Some(200));
    assert_eq!(bill.agency_code.as_deref(), Some("CCJC"));
    assert_eq!(bill.dispatch_text.as_deref(), Some("Distribu\u{ed}do"));

    // Brand-new bills never notify, favorite or not.
    assert_eq!(summary.notifications_sent, 0);
    assert!(store.notifications().is_empty());
}

#[tokio::test]
async fn resync_appends_only_new_steps_and_notifies_favorites() {
    let source = seeded_source();
    let store = MemStore::new();
    store.add_favorite(7, 55);

    source.push_page(vec![RawBillSummary::new(55, "Altera a lei X", "PL", 123, 2024)]);
    source.set_steps(55, vec![RawStep::new(1, "2024-03-01T10:00:00", 100, 200)]);
    run_poll_cycle(&source, &store, &config())
        .await
        .expect("first cycle");

    // The source now returns the full history plus one new step.
    source.set_steps(
        55,
        vec![
            RawStep::new(1, "2024-03-01T10:00:00", 100, 200),
            RawStep::new(2, "2024-03-05T09:30:00", 101, 200),
        ],
    );
    let summary = run_poll_cycle(&source, &store, &config())
        .await
        .expect("second cycle");

    assert_eq!(summary.bills_new, 0);
    assert_eq!(summary.bills_updated, 1);
    assert_eq!(summary.steps_inserted, 1);
    assert_eq!(store.steps_for(55).len(), 2);

    let bill = store.bill(55).expect("bill stored");
    assert_eq!(bill.current_status_ref, Some(101));

    assert_eq!(summary.notifications_sent, 1);
    let notifications = store.notifications();
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].user_id, 7);
    assert_eq!(notifications[0].bill_id, Some(55));
    assert!(!notifications[0].read_flag);
    assert!(notifications[0].body.contains("Pronta para pauta"));
}

#[tokio::test]
async fn unchanged_resync_is_a_no_op() {
    let source = seeded_source();
    let store = MemStore::new();
    store.add_favorite(7, 55);

    source.push_page(vec![RawBillSummary::new(55, "Altera a lei X", "PL", 123, 2024)]);
    source.set_steps(
        55,
        vec![
            RawStep::new(1, "2024-03-01T10:00:00", 100, 200),
            RawStep::new(2, "2024-03-05T09:30:00", 101, 200),
        ],
    );
    source.set_topics(55, vec![RawCodeItem::new(3, "Sa\u{fa}de")]);
    run_poll_cycle(&source, &store, &config())
        .await
        .expect("first cycle");

    let summary = run_poll_cycle(&source, &store, &config())
        .await
        .expect("second cycle");

    assert_eq!(summary.steps_inserted, 0);
    assert_eq!(summary.notifications_sent, 0);
    assert_eq!(store.steps_for(55).len(), 2);
    assert_eq!(store.topics_for(55), vec![3]);
    assert!(store.notifications().is_empty());
}

#[tokio::test]
async fn notification_requires_a_favorite() {
    let source = seeded_source();
    let store = MemStore::new();

    source.push_page(vec![RawBillSummary::new(55, "Altera a lei X", "PL", 123, 2024)]);
    source.set_steps(55, vec![RawStep::new(1, "2024-03-01T10:00:00", 100, 200)]);
    run_poll_cycle(&source, &store, &config())
        .await
        .expect("first cycle");

    source.set_steps(
        55,
        vec![
            RawStep::new(1, "2024-03-01T10:00:00", 100, 200),
            RawStep::new(2, "2024-03-05T09:30:00", 101, 200),
        ],
    );
    let summary = run_poll_cycle(&source, &store, &config())
        .await
        .expect("second cycle");

    assert_eq!(summary.steps_inserted, 1);
    assert_eq!(summary.notifications_sent, 0);
    assert!(store.notifications().is_empty());
}

#[tokio::test]
async fn recent_window_syncs_without_notifying() {
    let source = seeded_source();
    let store = MemStore::new();
    store.add_favorite(7, 55);

    source.push_page(vec![RawBillSummary::new(55, "Altera a lei X", "PL", 123, 2024)]);
    source.set_steps(55, vec![RawStep::new(1, "2024-03-01T10:00:00", 100, 200)]);
    run_poll_cycle(&source, &store, &config())
        .await
        .expect("seed cycle");

    source.set_steps(
        55,
        vec![
            RawStep::new(1, "2024-03-01T10:00:00", 100, 200),
            RawStep::new(2, "2024-03-05T09:30:00", 101, 200),
        ],
    );
    let window = RecentWindow {
        years: vec![2024],
        ..Default::default()
    };
    let summary = run_recent_window(&source, &store, &config(), &window)
        .await
        .expect("recent sync");

    assert_eq!(summary.steps_inserted, 1);
    assert_eq!(summary.notifications_sent, 0);
    assert!(store.notifications().is_empty());
}

#[tokio::test]
async fn backfill_syncs_reference_data_before_reconciling() {
    let source = seeded_source();
    let store = MemStore::new();

    source.push_page(vec![RawBillSummary::new(55, "Altera a lei X", "PL", 123, 2024)]);
    source.set_steps(55, vec![RawStep::new(1, "2024-03-01T10:00:00", 100, 200)]);
    source.set_topics(55, vec![RawCodeItem::new(3, "Sa\u{fa}de")]);

    // The store starts empty: the lookup tables have to land in this run
    // or the topic link is lost for good.
    let summary = run_backfill(
        &source,
        &store,
        &config(),
        PageRange {
            start: 1,
            end: None,
        },
    )
    .await
    .expect("backfill");

    assert_eq!(store.topics_for(55), vec![3]);
    assert!(!summary.refdata.is_empty());
}

#[tokio::test]
async fn recent_window_syncs_reference_data_before_reconciling() {
    let source = seeded_source();
    let store = MemStore::new();

    source.push_page(vec![RawBillSummary::new(55, "Altera a lei X", "PL", 123, 2024)]);
    source.set_topics(55, vec![RawCodeItem::new(3, "Sa\u{fa}de")]);

    let window = RecentWindow {
        years: vec![2024],
        ..Default::default()
    };
    let summary = run_recent_window(&source, &store, &config(), &window)
        .await
        .expect("recent sync");

    assert_eq!(store.topics_for(55), vec![3]);
    assert!(!summary.refdata.is_empty());
}

#[tokio::test]
async fn failed_bill_rolls_back_alone() {
    let source = seeded_source();
    let store = MemStore::new();

    source.push_page(vec![
        RawBillSummary::new(1, "a", "PL", 1, 2024),
        RawBillSummary::new(2, "b", "PL", 2, 2024),
        RawBillSummary::new(3, "c", "PL", 3, 2024),
    ]);
    for id in [1, 2, 3] {
        source.set_steps(id, vec![RawStep::new(1, "2024-03-01T10:00:00", 100, 200)]);
    }
    source.fail_steps_for(2);

    let summary = run_poll_cycle(&source, &store, &config())
        .await
        .expect("poll cycle");

    assert_eq!(summary.bills_new, 2);
    assert_eq!(summary.bills_failed, 1);
    assert!(store.bill(1).is_some());
    assert!(store.bill(2).is_none());
    assert!(store.bill(3).is_some());

    // The bill recovers on the next cycle.
    source.clear_step_failures();
    let retry = run_poll_cycle(&source, &store, &config())
        .await
        .expect("retry cycle");
    assert_eq!(retry.bills_new, 1);
    assert_eq!(retry.bills_failed, 0);
    assert_eq!(store.steps_for(2).len(), 1);
}

#[tokio::test]
async fn malformed_step_in_one_bill_leaves_neighbors_untouched() {
    let source = seeded_source();
    let store = MemStore::new();

    source.push_page(vec![
        RawBillSummary::new(1, "a", "PL", 1, 2024),
        RawBillSummary::new(2, "b", "PL", 2, 2024),
        RawBillSummary::new(3, "c", "PL", 3, 2024),
    ]);
    source.set_steps(1, vec![RawStep::new(1, "2024-03-01T10:00:00", 100, 200)]);
    source.set_steps(
        2,
        vec![
            RawStep::new(1, "2024-03-01T10:00:00", 100, 200),
            RawStep::new(2, "bad timestamp", 100, 200),
        ],
    );
    source.set_steps(3, vec![RawStep::new(1, "2024-03-01T10:00:00", 100, 200)]);

    let summary = run_poll_cycle(&source, &store, &config())
        .await
        .expect("poll cycle");

    // Bill 2 still commits its well-formed step; only the broken one skips.
    assert_eq!(summary.bills_new, 3);
    assert_eq!(summary.bills_failed, 0);
    assert_eq!(summary.steps_inserted, 3);
    assert_eq!(summary.steps_skipped, 1);
    assert_eq!(store.steps_for(1).len(), 1);
    assert_eq!(store.steps_for(2).len(), 1);
    assert_eq!(store.steps_for(3).len(), 1);
}

#[tokio::test]
async fn repeated_sequences_from_the_source_are_stored_once() {
    let source = seeded_source();
    let store = MemStore::new();

    source.push_page(vec![RawBillSummary::new(55, "Altera a lei X", "PL", 123, 2024)]);
    source.set_steps(
        55,
        vec![
            RawStep::new(1, "2024-03-01T10:00:00", 100, 200),
            RawStep::new(1, "2024-03-01T10:00:00", 100, 200),
            RawStep::new(2, "2024-03-05T09:30:00", 101, 200),
        ],
    );

    let summary = run_poll_cycle(&source, &store, &config())
        .await
        .expect("poll cycle");
    assert_eq!(summary.steps_inserted, 2);
    assert_eq!(store.steps_for(55).len(), 2);
}

#[tokio::test]
async fn malformed_listing_items_are_counted_not_fatal() {
    let source = seeded_source();
    let store = MemStore::new();

    let mut broken = RawBillSummary::new(0, "no id", "PL", 9, 2024);
    broken.id = serde_json::Value::Null;
    source.push_page(vec![broken, RawBillSummary::new(56, "ok", "PL", 10, 2024)]);
    source.set_steps(56, vec![RawStep::new(1, "2024-03-01T10:00:00", 100, 200)]);

    let summary = run_poll_cycle(&source, &store, &config())
        .await
        .expect("poll cycle");
    assert_eq!(summary.bills_failed, 1);
    assert_eq!(summary.bills_new, 1);
    assert!(store.bill(56).is_some());
}

#[tokio::test]
async fn malformed_steps_are_skipped_within_a_committing_bill() {
    let source = seeded_source();
    let store = MemStore::new();

    source.push_page(vec![RawBillSummary::new(55, "Altera a lei X", "PL", 123, 2024)]);
    source.set_steps(
        55,
        vec![
            RawStep::new(1, "2024-03-01T10:00:00", 100, 200),
            RawStep::new(2, "not a timestamp", 101, 200),
            RawStep::new(3, "2024-03-07T08:00:00", 101, 200),
        ],
    );

    let summary = run_poll_cycle(&source, &store, &config())
        .await
        .expect("poll cycle");
    assert_eq!(summary.bills_new, 1);
    assert_eq!(summary.steps_inserted, 2);
    assert_eq!(summary.steps_skipped, 1);
    let stored: Vec<i64> = store
        .steps_for(55)
        .iter()
        .map(|s| s.sequence_number)
        .collect();
    assert_eq!(stored, vec![1, 3]);
}

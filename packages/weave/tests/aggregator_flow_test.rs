//! End-to-end flow over the in-memory store: default generation, combined
//! equality + search filtering, dedup across streams, live mutation, and
//! sort/pagination driving.

mod common;

use common::*;
use std::sync::Arc;
use weave::store::memory::MemoryStore;
use weave::{FilterSpec, LiveViewAggregator, SortDirection};

#[tokio::test(start_paused = true)]
async fn test_default_generation_shows_everything_sorted() {
    let store = Arc::new(MemoryStore::new());
    seed_contacts(&store);
    let agg = LiveViewAggregator::spawn(store.clone(), contact_config());

    let page = wait_for_page(&agg, |p| p.total_count == 4).await;
    // Name ascending, case-folded.
    assert_eq!(row_ids(&page), ["c3", "c4", "c1", "c2"]);
    assert_eq!(page.total_pages, 1);

    agg.dispose();
}

#[tokio::test(start_paused = true)]
async fn test_search_with_equalities_merges_matching_streams() {
    let store = Arc::new(MemoryStore::new());
    seed_contacts(&store);
    let agg = LiveViewAggregator::spawn(store.clone(), contact_config());
    wait_for_page(&agg, |p| p.total_count == 4).await;

    // "jo" matches c1 on name and c2 on email, but c2 is archived: the
    // equality predicate rides along in every sub-query.
    let spec = FilterSpec::new(vec!["name".into(), "email".into()])
        .with_equality("status", "active")
        .with_term("jo");
    agg.set_filter_spec(spec);

    let page = wait_for_page(&agg, |p| p.total_count == 1).await;
    assert_eq!(row_ids(&page), ["c1"]);

    agg.dispose();
}

#[tokio::test(start_paused = true)]
async fn test_id_matched_by_both_streams_appears_once() {
    let store = Arc::new(MemoryStore::new());
    seed_contacts(&store);
    let agg = LiveViewAggregator::spawn(store.clone(), contact_config());
    wait_for_page(&agg, |p| p.total_count == 4).await;

    // c1 matches "jo" on name ("John Doe") and on email ("john@x.com"):
    // two streams deliver it, the index holds it once.
    let spec = FilterSpec::new(vec!["name".into(), "email".into()]).with_term("jo");
    agg.set_filter_spec(spec);

    let page = wait_for_page(&agg, |p| p.total_count == 2).await;
    assert_eq!(row_ids(&page), ["c1", "c2"]); // John Doe, then Mary (via joanna@)

    let snapshot = agg.snapshot().await.unwrap();
    assert_eq!(snapshot.iter().filter(|r| r.id == "c1").count(), 1);

    agg.dispose();
}

#[tokio::test(start_paused = true)]
async fn test_delete_observed_by_one_stream_removes_globally() {
    let store = Arc::new(MemoryStore::new());
    seed_contacts(&store);
    let agg = LiveViewAggregator::spawn(store.clone(), contact_config());
    wait_for_page(&agg, |p| p.total_count == 4).await;

    // Two streams reference c1 (name and email both match "jo").
    let spec = FilterSpec::new(vec!["name".into(), "email".into()])
        .with_equality("status", "active")
        .with_term("jo");
    agg.set_filter_spec(spec);
    wait_for_page(&agg, |p| p.total_count == 1).await;

    // Server-side delete: gone after the first Removed event, without
    // waiting for both streams to confirm.
    store.remove("c1");
    let page = wait_for_page(&agg, |p| p.total_count == 0).await;
    assert!(page.rows.is_empty());

    agg.dispose();
}

#[tokio::test(start_paused = true)]
async fn test_live_update_replaces_record_wholesale() {
    let store = Arc::new(MemoryStore::new());
    seed_contacts(&store);
    let agg = LiveViewAggregator::spawn(store.clone(), contact_config());
    wait_for_page(&agg, |p| p.total_count == 4).await;

    store.upsert("c1", contact("Johnny Doe", "john@x.com", "active"));

    let page = wait_for_page(&agg, |p| {
        p.rows
            .iter()
            .any(|r| r.field(&"name".into()).and_then(|v| v.as_str()) == Some("Johnny Doe"))
    })
    .await;
    assert_eq!(page.total_count, 4);

    agg.dispose();
}

#[tokio::test(start_paused = true)]
async fn test_sort_and_pagination_driving() {
    let store = Arc::new(MemoryStore::new());
    seed_contacts(&store);
    let agg = LiveViewAggregator::spawn(store.clone(), contact_config());
    wait_for_page(&agg, |p| p.total_count == 4).await;

    agg.set_sort("name", SortDirection::Desc);
    agg.set_page_size(3);
    let page = wait_for_page(&agg, |p| p.page_size == 3 && p.total_pages == 2).await;
    assert_eq!(row_ids(&page), ["c2", "c1", "c4"]); // Mary, John, Grace

    agg.set_page(1);
    let page = wait_for_page(&agg, |p| p.page == 1).await;
    assert_eq!(row_ids(&page), ["c3"]); // Ada

    // Page clamps once the window shrinks under it.
    agg.set_page(99);
    let page = wait_for_page(&agg, |p| p.page == 1).await;
    assert_eq!(page.total_pages, 2);

    agg.dispose();
}

#[tokio::test(start_paused = true)]
async fn test_irrelevant_changes_do_not_rerender() {
    let store = Arc::new(MemoryStore::new());
    seed_contacts(&store);
    let agg = LiveViewAggregator::spawn(store.clone(), contact_config());
    wait_for_page(&agg, |p| p.total_count == 4).await;

    let spec = FilterSpec::new(vec!["name".into(), "email".into()])
        .with_equality("status", "active")
        .with_term("jo");
    agg.set_filter_spec(spec);
    wait_for_page(&agg, |p| p.total_count == 1).await;

    let log = PageLog::new();
    agg.on_view_changed(log.callback());
    wait_for_page(&agg, |p| p.total_count == 1).await;
    let settled = log.len();
    assert!(settled >= 1); // registration delivers the current page

    // A record no sub-query matches never reaches the view.
    store.upsert("zz", contact("Zed", "zed@x.com", "archived"));
    wait_for_page(&agg, |p| p.total_count == 1).await;
    assert_eq!(log.len(), settled);

    agg.dispose();
}

#[tokio::test(start_paused = true)]
async fn test_open_subscriptions_stay_bounded() {
    let store = Arc::new(MemoryStore::new());
    seed_contacts(&store);
    let agg = LiveViewAggregator::spawn(store.clone(), contact_config());
    wait_for_page(&agg, |p| p.total_count == 4).await;

    // Churn through filter cycles; two search fields bound us to
    // 2 * 2 + 1 concurrently open subscriptions.
    for term in ["a", "ad", "ada", "", "jo", "john"] {
        let spec = FilterSpec::new(vec!["name".into(), "email".into()]).with_term(term);
        agg.set_filter_spec(spec);
        assert!(store.subscriber_count() <= 5);
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(store.subscriber_count() <= 5);
    }

    agg.dispose();
    // Dispose closes everything, old generations included.
    wait_for_page_closed(&store).await;
}

async fn wait_for_page_closed(store: &MemoryStore) {
    for _ in 0..200 {
        if store.subscriber_count() == 0 {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    panic!("subscriptions were not torn down on dispose");
}

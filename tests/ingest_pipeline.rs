// tests/ingest_pipeline.rs
//
// One cycle at a time through the ingest state machine: dedup, unscored posts,
// partial writes and cursor movement.

mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use common::*;
use social_sentiment_analyzer::ingest::{CycleOutcome, SourceState, StatusRegistry};
use social_sentiment_analyzer::store::{MemoryStore, PostStore, RangeQuery};

fn setup() -> (Arc<FlakyStore>, StatusRegistry) {
    (Arc::new(FlakyStore::new()), StatusRegistry::new())
}

async fn stored(store: &FlakyStore) -> Vec<social_sentiment_analyzer::AnalyzedPost> {
    store.range_query(&RangeQuery::default()).await.unwrap()
}

#[tokio::test]
async fn identical_text_in_one_batch_is_stored_once() {
    let source = ScriptedSource::new(vec![Ok(batch(vec![
        fetched(1, "Hello World!"),
        fetched(2, "Rust 1.80 is out, and it is great"),
        fetched(3, "hello   world"),
    ]))]);
    let (store, status) = setup();
    let mut p = pipeline(source, store.clone(), status, test_policy());

    let CycleOutcome::Completed(stats) = p.run_cycle(&CancellationToken::new()).await else {
        panic!("cycle should complete");
    };
    assert_eq!(stats.fetched, 3);
    assert_eq!(stats.persisted, 2);
    assert_eq!(stats.duplicates, 1);
    assert_eq!(store.inner.len(), 2);
    assert_eq!(p.cursor(), Some(&3));
}

#[tokio::test]
async fn same_post_ingested_twice_exists_once() {
    let source = ScriptedSource::new(vec![
        Ok(batch(vec![fetched(7, "Coffee is good today")])),
        Ok(batch(vec![fetched(7, "Coffee is good today")])),
    ]);
    let (store, status) = setup();
    let mut p = pipeline(source.clone(), store.clone(), status, test_policy());
    let cancel = CancellationToken::new();

    p.run_cycle(&cancel).await;
    let CycleOutcome::Completed(second) = p.run_cycle(&cancel).await else {
        panic!("second cycle should complete");
    };
    assert_eq!(second.duplicates, 1);
    assert_eq!(second.persisted, 0);

    let posts = stored(&store).await;
    assert_eq!(posts.len(), 1);
    assert_eq!(posts[0].external_id, "7");
    assert!(posts[0].polarity().unwrap() > 0.0);
}

#[tokio::test]
async fn unsupported_language_is_persisted_unscored_and_cursor_moves_on() {
    let mut post = fetched(1, "good morning everyone");
    post.post.language = Some("ja".into());
    let source = ScriptedSource::new(vec![Ok(batch(vec![post]))]);
    let (store, status) = setup();
    let mut p = pipeline(source, store.clone(), status.clone(), test_policy());

    let CycleOutcome::Completed(stats) = p.run_cycle(&CancellationToken::new()).await else {
        panic!("cycle should complete");
    };
    assert_eq!(stats.unscored, 1);
    assert_eq!(stats.analyzed, 0);
    assert_eq!(stats.persisted, 1);

    let posts = stored(&store).await;
    assert_eq!(posts.len(), 1);
    assert!(posts[0].sentiment.is_none());
    assert_eq!(p.cursor(), Some(&1));

    let s = status.get(SOURCE).unwrap();
    assert_eq!(s.state, SourceState::Idle);
    assert_eq!(s.totals.unscored, 1);
    assert_eq!(s.cursor.as_deref(), Some("1"));
}

#[tokio::test]
async fn link_only_posts_are_stored_once_without_sentiment() {
    let source = ScriptedSource::new(vec![Ok(batch(vec![
        fetched(1, "https://example.com/a"),
        fetched(2, "<a href=\"https://example.com/b\">https://example.com/b</a>"),
    ]))]);
    let (store, status) = setup();
    let mut p = pipeline(source, store.clone(), status, test_policy());

    let CycleOutcome::Completed(stats) = p.run_cycle(&CancellationToken::new()).await else {
        panic!("cycle should complete");
    };
    assert_eq!(stats.persisted, 1);
    assert_eq!(stats.duplicates, 1);
    assert_eq!(stats.unscored, 1);

    let posts = stored(&store).await;
    assert_eq!(posts[0].normalized_text, "");
    assert!(posts[0].sentiment.is_none());
}

#[tokio::test]
async fn partial_write_keeps_successes_and_stops_cursor_at_the_gap() {
    let source = ScriptedSource::new(vec![Ok(batch(vec![
        fetched(1, "first post"),
        fetched(2, "second post"),
        fetched(3, "third post"),
    ]))]);
    let (store, status) = setup();
    store.fail_writes_for(&["2"]);
    let mut p = pipeline(source.clone(), store.clone(), status.clone(), test_policy());
    let cancel = CancellationToken::new();

    let outcome = p.run_cycle(&cancel).await;
    assert_eq!(
        outcome,
        CycleOutcome::Backoff {
            attempt: 1,
            delay: Duration::from_millis(100)
        }
    );
    assert_eq!(store.inner.len(), 2, "posts 1 and 3 stay durable");
    assert_eq!(p.cursor(), Some(&1));
    let s = status.get(SOURCE).unwrap();
    assert_eq!(s.last_cycle.unwrap().failed, 1);
    assert_eq!(s.last_cycle.unwrap().persisted, 2);

    // The source redelivers from the saved cursor.
    store.heal();
    source.push(Ok(batch(vec![fetched(2, "second post"), fetched(3, "third post")])));
    let CycleOutcome::Completed(stats) = p.run_cycle(&cancel).await else {
        panic!("retry should complete");
    };
    assert_eq!(source.calls()[1].1, Some(1));
    assert_eq!(stats.persisted, 1);
    assert_eq!(stats.duplicates, 1);
    assert_eq!(store.inner.len(), 3);
    assert_eq!(p.cursor(), Some(&3));

    let saved = store.load_cursor(SOURCE).await.unwrap().unwrap();
    assert_eq!(saved.position, "3");
}

#[tokio::test]
async fn failed_cursor_save_is_transient_and_does_not_move_cursor() {
    let b = || batch(vec![fetched(1, "one"), fetched(2, "two")]);
    let source = ScriptedSource::new(vec![Ok(b()), Ok(b())]);
    let (store, status) = setup();
    store.fail_cursor_saves(true);
    let mut p = pipeline(source.clone(), store.clone(), status, test_policy());
    let cancel = CancellationToken::new();

    assert!(matches!(p.run_cycle(&cancel).await, CycleOutcome::Backoff { .. }));
    assert_eq!(p.cursor(), None);
    assert_eq!(store.inner.len(), 2);

    store.heal();
    let CycleOutcome::Completed(stats) = p.run_cycle(&cancel).await else {
        panic!("second cycle should complete");
    };
    assert_eq!(stats.duplicates, 2);
    assert_eq!(p.cursor(), Some(&2));
}

#[tokio::test]
async fn store_outage_aborts_cycle_without_writes() {
    let source = ScriptedSource::new(vec![Ok(batch(vec![fetched(1, "hello there")]))]);
    let (store, status) = setup();
    store.set_down(true);
    let mut p = pipeline(source, store.clone(), status.clone(), test_policy());

    let outcome = p.run_cycle(&CancellationToken::new()).await;
    assert!(matches!(outcome, CycleOutcome::Backoff { attempt: 1, .. }));
    assert_eq!(p.cursor(), None);
    store.heal();
    assert!(store.inner.is_empty());
    assert!(status
        .get(SOURCE)
        .unwrap()
        .last_error
        .unwrap()
        .contains("store is down"));
}

#[tokio::test]
async fn cursor_never_moves_backwards() {
    let source = ScriptedSource::new(vec![
        Ok(batch(vec![fetched(5, "five")])),
        Ok(batch(vec![fetched(3, "three")])),
    ]);
    let (store, status) = setup();
    let mut p = pipeline(source, store.clone(), status, test_policy());
    let cancel = CancellationToken::new();

    p.run_cycle(&cancel).await;
    p.run_cycle(&cancel).await;
    assert_eq!(p.cursor(), Some(&5));
    assert_eq!(store.inner.len(), 2);
}

#[tokio::test]
async fn saved_cursor_is_restored_by_a_new_pipeline() {
    let first = ScriptedSource::new(vec![Ok(batch(vec![fetched(4, "four"), fetched(9, "nine")]))]);
    let (store, status) = setup();
    let mut p = pipeline(first, store.clone(), status.clone(), test_policy());
    p.run_cycle(&CancellationToken::new()).await;
    drop(p);

    let second = ScriptedSource::new(vec![]);
    let mut p = pipeline(second.clone(), store.clone(), status, test_policy());
    p.run_cycle(&CancellationToken::new()).await;
    assert_eq!(second.calls()[0].1, Some(9));
}

#[tokio::test]
async fn corrupt_saved_cursor_counts_as_permanent_failure() {
    let store = Arc::new(FlakyStore::new());
    store
        .save_cursor(social_sentiment_analyzer::SourceCursor {
            source_id: SOURCE.into(),
            position: "not-a-number".into(),
            updated_at: ts(0),
        })
        .await
        .unwrap();
    let mut policy = test_policy();
    policy.max_consecutive_failures = 1;
    let source = ScriptedSource::new(vec![]);
    let mut p = pipeline(source.clone(), store, StatusRegistry::new(), policy);

    let outcome = p.run_cycle(&CancellationToken::new()).await;
    assert!(matches!(outcome, CycleOutcome::Failed { .. }));
    assert!(source.calls().is_empty(), "no fetch with an unreadable cursor");
}

#[tokio::test]
async fn two_tasks_on_the_same_source_never_store_a_post_twice() {
    let b = || {
        batch(vec![
            fetched(1, "shared first"),
            fetched(2, "shared second"),
            fetched(3, "shared third"),
        ])
    };
    let store = Arc::new(MemoryStore::new());
    let mut a = pipeline(
        ScriptedSource::new(vec![Ok(b())]),
        store.clone(),
        StatusRegistry::new(),
        test_policy(),
    );
    let mut c = pipeline(
        ScriptedSource::new(vec![Ok(b())]),
        store.clone(),
        StatusRegistry::new(),
        test_policy(),
    );
    let cancel = CancellationToken::new();

    let (ra, rc) = tokio::join!(a.run_cycle(&cancel), c.run_cycle(&cancel));
    let (CycleOutcome::Completed(sa), CycleOutcome::Completed(sc)) = (ra, rc) else {
        panic!("both cycles should complete");
    };
    assert_eq!(store.len(), 3);
    assert_eq!(sa.persisted + sc.persisted, 3);
    assert_eq!(sa.duplicates + sc.duplicates, 3);
    assert_eq!(a.cursor(), Some(&3));
    assert_eq!(c.cursor(), Some(&3));
}

// tests/metrics.rs
//
// The Prometheus recorder is process-wide, so this file holds a single test.

mod common;

use std::sync::Arc;

use axum::body::{self, Body};
use axum::http::{Request, StatusCode};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use common::*;
use social_sentiment_analyzer::ingest::{CycleOutcome, StatusRegistry};
use social_sentiment_analyzer::metrics::Metrics;
use social_sentiment_analyzer::store::MemoryStore;

#[tokio::test]
async fn metrics_endpoint_exposes_ingest_series() {
    let metrics = Metrics::init(2).expect("install recorder");

    let source = ScriptedSource::new(vec![
        Ok(batch(vec![
            fetched(1, "great news"),
            fetched(2, "great news"),
            fetched(3, "こんにちは"),
        ])),
        Err(unavailable()),
    ]);
    let mut p = pipeline(
        source,
        Arc::new(MemoryStore::new()),
        StatusRegistry::new(),
        test_policy(),
    );
    let cancel = CancellationToken::new();
    assert!(matches!(p.run_cycle(&cancel).await, CycleOutcome::Completed(_)));
    assert!(matches!(p.run_cycle(&cancel).await, CycleOutcome::Backoff { .. }));

    let resp = metrics
        .router()
        .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    // axum::body::to_bytes requires an explicit limit
    let body = body::to_bytes(resp.into_body(), 1_048_576).await.unwrap(); // 1 MiB
    let text = String::from_utf8(body.to_vec()).unwrap();

    for needle in [
        "ingest_sources_configured",
        r#"ingest_posts_fetched_total{source="scripted"} 3"#,
        r#"ingest_posts_duplicate_total{source="scripted"} 1"#,
        r#"ingest_posts_analyzed_total{source="scripted"} 1"#,
        r#"ingest_posts_unscored_total{source="scripted"} 1"#,
        r#"ingest_posts_persisted_total{source="scripted"} 2"#,
        r#"ingest_cycle_errors_total{source="scripted",kind="source_unavailable"} 1"#,
        r#"ingest_source_state{source="scripted"}"#,
        "ingest_cycle_ms",
    ] {
        assert!(text.contains(needle), "missing {needle:?} in:\n{text}");
    }
}

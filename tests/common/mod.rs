// tests/common/mod.rs
//
// Shared doubles for the ingest integration tests:
// - ScriptedSource: an adapter that replays a script of fetch results and
//   records when (and from which cursor) it was called.
// - FlakyStore: a MemoryStore wrapper that can fail selected writes.
#![allow(dead_code)]

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tokio::time::Instant;

use social_sentiment_analyzer::dedup::ContentFingerprint;
use social_sentiment_analyzer::error::{FetchError, StoreError};
use social_sentiment_analyzer::ingest::{
    BackoffPolicy, FetchedPost, IngestionPipeline, PipelinePolicy, RateBudget, RateLimitedFetcher,
    SourceAdapter, SourceBatch, StatusRegistry,
};
use social_sentiment_analyzer::model::{AnalyzedPost, RawPost, SourceCursor};
use social_sentiment_analyzer::store::{InsertOutcome, MemoryStore, PostStore, RangeQuery};

pub const SOURCE: &str = "scripted";

pub fn ts(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_714_521_600 + secs, 0).unwrap()
}

pub fn raw(external_id: &str, text: &str) -> RawPost {
    RawPost {
        source_id: SOURCE.into(),
        external_id: external_id.into(),
        author: "tester".into(),
        raw_text: text.into(),
        timestamp: ts(0),
        fetch_time: ts(0),
        language: None,
    }
}

/// A post whose cursor position is its numeric id.
pub fn fetched(id: u64, text: &str) -> FetchedPost<u64> {
    let mut post = raw(&id.to_string(), text);
    post.timestamp = ts(id as i64);
    FetchedPost { post, position: id }
}

pub fn batch(posts: Vec<FetchedPost<u64>>) -> SourceBatch<u64> {
    let next_cursor = posts.last().map(|p| p.position);
    SourceBatch { posts, next_cursor }
}

pub fn auth_failure() -> FetchError {
    FetchError::AuthFailure {
        source_id: SOURCE.into(),
        reason: "401".into(),
    }
}

pub fn unavailable() -> FetchError {
    FetchError::SourceUnavailable {
        source_id: SOURCE.into(),
        reason: "connection reset".into(),
    }
}

pub fn rate_limited(retry_after: Option<Duration>) -> FetchError {
    FetchError::RateLimited {
        source_id: SOURCE.into(),
        retry_after,
    }
}

#[derive(Default)]
struct Script {
    steps: VecDeque<Result<SourceBatch<u64>, FetchError>>,
    calls: Vec<(Instant, Option<u64>)>,
}

/// Replays scripted results; once the script runs out every fetch returns an
/// empty batch. Clones share the script and the call log.
#[derive(Clone, Default)]
pub struct ScriptedSource {
    inner: Arc<Mutex<Script>>,
    hang: bool,
}

impl ScriptedSource {
    pub fn new(steps: Vec<Result<SourceBatch<u64>, FetchError>>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Script {
                steps: steps.into(),
                calls: Vec::new(),
            })),
            hang: false,
        }
    }

    /// A source whose fetches never complete.
    pub fn hanging() -> Self {
        Self {
            hang: true,
            ..Self::default()
        }
    }

    pub fn push(&self, step: Result<SourceBatch<u64>, FetchError>) {
        self.inner.lock().unwrap().steps.push_back(step);
    }

    /// (time, cursor) of every fetch so far.
    pub fn calls(&self) -> Vec<(Instant, Option<u64>)> {
        self.inner.lock().unwrap().calls.clone()
    }
}

#[async_trait]
impl SourceAdapter for ScriptedSource {
    type Cursor = u64;

    fn source_id(&self) -> &str {
        SOURCE
    }

    async fn fetch_batch(
        &self,
        cursor: Option<&u64>,
        _limit: usize,
    ) -> Result<SourceBatch<u64>, FetchError> {
        let step = {
            let mut g = self.inner.lock().unwrap();
            g.calls.push((Instant::now(), cursor.copied()));
            g.steps.pop_front()
        };
        if self.hang {
            std::future::pending::<()>().await;
        }
        step.unwrap_or_else(|| Ok(SourceBatch::empty()))
    }

    fn serialize_cursor(&self, cursor: &u64) -> String {
        cursor.to_string()
    }

    fn deserialize_cursor(&self, raw: &str) -> Result<u64, FetchError> {
        raw.parse().map_err(|_| FetchError::Protocol {
            source_id: SOURCE.into(),
            reason: format!("bad cursor {raw}"),
        })
    }
}

/// MemoryStore with switchable faults.
#[derive(Default)]
pub struct FlakyStore {
    pub inner: MemoryStore,
    fail_ids: Mutex<HashSet<String>>,
    down: AtomicBool,
    fail_cursor_saves: AtomicBool,
    write_delay: Mutex<Option<Duration>>,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes of these external ids fail until [`heal`](Self::heal).
    pub fn fail_writes_for(&self, ids: &[&str]) {
        let mut g = self.fail_ids.lock().unwrap();
        g.extend(ids.iter().map(|s| s.to_string()));
    }

    /// Every `insert_batch` sleeps this long before writing.
    pub fn delay_writes(&self, delay: Duration) {
        *self.write_delay.lock().unwrap() = Some(delay);
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    pub fn fail_cursor_saves(&self, fail: bool) {
        self.fail_cursor_saves.store(fail, Ordering::SeqCst);
    }

    pub fn heal(&self) {
        self.fail_ids.lock().unwrap().clear();
        self.set_down(false);
        self.fail_cursor_saves(false);
    }

    fn check_up(&self) -> Result<(), StoreError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("store is down".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl PostStore for FlakyStore {
    async fn get_by_fingerprint(
        &self,
        source_id: &str,
        fp: &ContentFingerprint,
    ) -> Result<Option<AnalyzedPost>, StoreError> {
        self.check_up()?;
        self.inner.get_by_fingerprint(source_id, fp).await
    }

    async fn insert_batch(
        &self,
        posts: Vec<AnalyzedPost>,
    ) -> Vec<Result<InsertOutcome, StoreError>> {
        let delay = *self.write_delay.lock().unwrap();
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }
        if let Err(e) = self.check_up() {
            return posts.iter().map(|_| Err(e.clone())).collect();
        }
        let failing = self.fail_ids.lock().unwrap().clone();
        let mut out = Vec::with_capacity(posts.len());
        for p in posts {
            if failing.contains(&p.external_id) {
                out.push(Err(StoreError::Unavailable(format!(
                    "write of {} failed",
                    p.external_id
                ))));
            } else {
                out.extend(self.inner.insert_batch(vec![p]).await);
            }
        }
        out
    }

    async fn range_query(&self, query: &RangeQuery) -> Result<Vec<AnalyzedPost>, StoreError> {
        self.check_up()?;
        self.inner.range_query(query).await
    }

    async fn load_cursor(&self, source_id: &str) -> Result<Option<SourceCursor>, StoreError> {
        self.check_up()?;
        self.inner.load_cursor(source_id).await
    }

    async fn save_cursor(&self, cursor: SourceCursor) -> Result<(), StoreError> {
        self.check_up()?;
        if self.fail_cursor_saves.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("cursor save failed".into()));
        }
        self.inner.save_cursor(cursor).await
    }
}

/// Small, fast-moving policy for tests.
pub fn test_policy() -> PipelinePolicy {
    PipelinePolicy {
        batch_size: 10,
        poll_interval: Duration::from_secs(1),
        fetch_deadline: None,
        max_consecutive_failures: 5,
        backoff: BackoffPolicy {
            base_ms: 100,
            max_ms: 1_000,
            multiplier: 2.0,
        },
    }
}

pub fn generous_budget() -> RateBudget {
    RateBudget {
        capacity: 100,
        refill_per_sec: 100.0,
    }
}

pub fn pipeline(
    source: ScriptedSource,
    store: Arc<dyn PostStore>,
    status: StatusRegistry,
    policy: PipelinePolicy,
) -> IngestionPipeline<ScriptedSource> {
    IngestionPipeline::new(
        RateLimitedFetcher::new(source, generous_budget()),
        store,
        status,
        policy,
    )
}

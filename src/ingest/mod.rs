// src/ingest/mod.rs
//! Per-source ingestion: fetch → normalize → fingerprint → dedup → analyze →
//! persist, driven as a small state machine.
//!
//! ```text
//! IDLE -> FETCHING -> PROCESSING -> PERSISTING -> IDLE
//!   any step --transient--> BACKOFF --delay--> FETCHING
//!   N consecutive permanent failures --> FAILED (until reset)
//! ```
//!
//! Delivery is at-least-once: the cursor only moves past posts that are
//! durable (inserted, or known duplicates), so anything lost to a crash or a
//! failed write is fetched again and caught by dedup.

pub mod backoff;
pub mod config;
pub mod providers;
pub mod rate;
pub mod scheduler;
pub mod status;
pub mod types;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use once_cell::sync::OnceCell;
use tokio::sync::Notify;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

use crate::dedup::{fingerprint, Deduplicator};
use crate::error::{FailureKind, IngestError, StoreError};
use crate::model::{AnalyzedPost, SourceCursor};
use crate::normalize::normalize;
use crate::sentiment::{Analysis, SentimentAnalyzer};
use crate::store::{InsertOutcome, PostStore};

pub use backoff::BackoffPolicy;
pub use rate::{RateBudget, RateLimitedFetcher};
pub use status::{CycleStats, ResetOutcome, SourceState, SourceStatus, StatusRegistry};
pub use types::{FetchedPost, SourceAdapter, SourceBatch};

/// One-time metrics registration (so series show up on /metrics).
fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("ingest_posts_fetched_total", "Posts returned by source adapters.");
        describe_counter!(
            "ingest_posts_duplicate_total",
            "Posts dropped as exact duplicates after normalization."
        );
        describe_counter!("ingest_posts_analyzed_total", "Posts that received a sentiment score.");
        describe_counter!(
            "ingest_posts_unscored_total",
            "Posts stored without sentiment (empty text, unsupported language)."
        );
        describe_counter!("ingest_posts_persisted_total", "Posts durably inserted.");
        describe_counter!(
            "ingest_posts_failed_total",
            "Posts whose write failed; refetched on a later cycle."
        );
        describe_counter!("ingest_cycle_errors_total", "Ingest cycles that ended in an error.");
        describe_gauge!(
            "ingest_source_state",
            "Current state per source (0 idle .. 4 backoff, 5 failed, 6 stopped)."
        );
        describe_histogram!("ingest_cycle_ms", "Ingest cycle duration in milliseconds.");
        describe_histogram!("ingest_parse_ms", "Feed parse time in milliseconds.");
    });
}

/// Knobs for one source's loop.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelinePolicy {
    /// Max posts requested per fetch.
    pub batch_size: usize,
    /// Pause after a cycle that found the source caught up.
    pub poll_interval: Duration,
    /// How long a fetch may wait on the request budget.
    pub fetch_deadline: Option<Duration>,
    /// Consecutive permanent failures before FAILED.
    pub max_consecutive_failures: u32,
    pub backoff: BackoffPolicy,
}

impl Default for PipelinePolicy {
    fn default() -> Self {
        Self {
            batch_size: 50,
            poll_interval: Duration::from_secs(60),
            fetch_deadline: Some(Duration::from_secs(30)),
            max_consecutive_failures: 5,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// How a single [`IngestionPipeline::run_cycle`] ended.
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    Completed(CycleStats),
    Backoff { attempt: u32, delay: Duration },
    Failed { reason: String },
    /// Cancellation was observed before anything was fetched.
    Cancelled,
}

enum Progress {
    Done,
    Cancelled,
}

/// The ingest state machine for one source.
///
/// Owns the source's cursor exclusively; the store is the only thing shared
/// with other sources.
pub struct IngestionPipeline<A: SourceAdapter> {
    source_id: String,
    fetcher: RateLimitedFetcher<A>,
    store: Arc<dyn PostStore>,
    dedup: Deduplicator,
    analyzer: SentimentAnalyzer,
    policy: PipelinePolicy,
    status: StatusRegistry,
    reset: Arc<Notify>,
    cursor: Option<A::Cursor>,
    cursor_loaded: bool,
    consecutive_failures: u32,
    consecutive_permanent: u32,
}

impl<A: SourceAdapter> IngestionPipeline<A> {
    pub fn new(
        fetcher: RateLimitedFetcher<A>,
        store: Arc<dyn PostStore>,
        status: StatusRegistry,
        policy: PipelinePolicy,
    ) -> Self {
        let source_id = fetcher.source_id().to_string();
        let reset = status.register(&source_id);
        Self {
            source_id,
            fetcher,
            dedup: Deduplicator::new(store.clone()),
            store,
            analyzer: SentimentAnalyzer::new(),
            policy,
            status,
            reset,
            cursor: None,
            cursor_loaded: false,
            consecutive_failures: 0,
            consecutive_permanent: 0,
        }
    }

    pub fn with_analyzer(mut self, analyzer: SentimentAnalyzer) -> Self {
        self.analyzer = analyzer;
        self
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub fn cursor(&self) -> Option<&A::Cursor> {
        self.cursor.as_ref()
    }

    pub fn policy(&self) -> &PipelinePolicy {
        &self.policy
    }

    pub fn state(&self) -> SourceState {
        self.status
            .get(&self.source_id)
            .map(|s| s.state)
            .unwrap_or(SourceState::Idle)
    }

    fn set_state(&self, state: SourceState) {
        gauge!("ingest_source_state", "source" => self.source_id.clone()).set(state.code());
        self.status.update(&self.source_id, |s| s.state = state);
    }

    /// Load the persisted cursor, once. Later calls are no-ops.
    async fn restore_cursor(&mut self) -> Result<(), IngestError> {
        if self.cursor_loaded {
            return Ok(());
        }
        if let Some(saved) = self.store.load_cursor(&self.source_id).await? {
            let c = self.fetcher.adapter().deserialize_cursor(&saved.position)?;
            tracing::info!(
                target: "ingest",
                source = %self.source_id,
                cursor = %saved.position,
                "resuming from saved cursor"
            );
            self.status
                .update(&self.source_id, |s| s.cursor = Some(saved.position.clone()));
            self.cursor = Some(c);
        }
        self.cursor_loaded = true;
        Ok(())
    }

    /// Run exactly one cycle and report how it ended.
    ///
    /// Cancellation is only observed while fetching. Once a batch is in hand it
    /// is processed and persisted before returning.
    pub async fn run_cycle(&mut self, cancel: &CancellationToken) -> CycleOutcome {
        ensure_metrics_described();
        if cancel.is_cancelled() {
            return CycleOutcome::Cancelled;
        }

        let t0 = std::time::Instant::now();
        let mut stats = CycleStats::default();
        let result = self.try_cycle(cancel, &mut stats).await;
        self.record_stats(&stats);

        match result {
            Ok(Progress::Cancelled) => CycleOutcome::Cancelled,
            Ok(Progress::Done) => {
                histogram!("ingest_cycle_ms", "source" => self.source_id.clone())
                    .record(t0.elapsed().as_secs_f64() * 1_000.0);
                self.on_success(stats)
            }
            Err(e) => self.on_failure(e, stats),
        }
    }

    async fn try_cycle(
        &mut self,
        cancel: &CancellationToken,
        stats: &mut CycleStats,
    ) -> Result<Progress, IngestError> {
        self.restore_cursor().await?;

        // FETCHING
        self.set_state(SourceState::Fetching);
        let deadline = self.policy.fetch_deadline.map(|d| Instant::now() + d);
        let batch = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(Progress::Cancelled),
            r = self.fetcher.fetch_batch(self.cursor.as_ref(), self.policy.batch_size, deadline) => r?,
        };
        stats.fetched = batch.len() as u64;

        // PROCESSING
        self.set_state(SourceState::Processing);
        // durable[i]: post i needs no further work once the write below lands.
        let mut durable = vec![false; batch.len()];
        let mut staged: Vec<(usize, AnalyzedPost)> = Vec::with_capacity(batch.len());
        {
            let mut scope = self.dedup.batch(&self.source_id);
            for (i, item) in batch.posts.iter().enumerate() {
                let raw = &item.post;
                let text = normalize(&raw.raw_text);
                let fp = fingerprint(text.as_str());

                if scope.check(&fp).await?.is_duplicate() {
                    stats.duplicates += 1;
                    durable[i] = true;
                    continue;
                }

                let sentiment = match self.analyzer.analyze(&text, raw.language.as_deref()) {
                    Analysis::Scored(s) => {
                        stats.analyzed += 1;
                        Some(s)
                    }
                    Analysis::Unscored(reason) => {
                        tracing::debug!(
                            target: "ingest",
                            source = %self.source_id,
                            external_id = %raw.external_id,
                            ?reason,
                            "post left unscored"
                        );
                        stats.unscored += 1;
                        None
                    }
                };

                staged.push((
                    i,
                    AnalyzedPost {
                        source_id: self.source_id.clone(),
                        external_id: raw.external_id.clone(),
                        author: raw.author.clone(),
                        normalized_text: text.into_string(),
                        sentiment,
                        timestamp: raw.timestamp,
                        fingerprint: fp,
                    },
                ));
            }
        }

        // PERSISTING: one batched write.
        self.set_state(SourceState::Persisting);
        let mut write_error: Option<StoreError> = None;
        if !staged.is_empty() {
            let (slots, posts): (Vec<usize>, Vec<AnalyzedPost>) = staged.into_iter().unzip();
            let results = self.store.insert_batch(posts).await;
            for (k, &i) in slots.iter().enumerate() {
                match results.get(k) {
                    Some(Ok(InsertOutcome::Inserted)) => {
                        stats.persisted += 1;
                        durable[i] = true;
                    }
                    Some(Ok(InsertOutcome::Conflict)) => {
                        stats.duplicates += 1;
                        durable[i] = true;
                    }
                    Some(Err(e)) => {
                        stats.failed += 1;
                        write_error.get_or_insert_with(|| e.clone());
                    }
                    None => {
                        stats.failed += 1;
                        write_error.get_or_insert_with(|| {
                            StoreError::Unavailable("store returned too few results".into())
                        });
                    }
                }
            }
        }

        self.advance_cursor(&batch, &durable).await?;

        match write_error {
            Some(e) => Err(e.into()),
            None => Ok(Progress::Done),
        }
    }

    /// Move the cursor over the longest durable prefix of `batch`, then persist it.
    async fn advance_cursor(
        &mut self,
        batch: &SourceBatch<A::Cursor>,
        durable: &[bool],
    ) -> Result<(), StoreError> {
        let prefix = durable.iter().take_while(|d| **d).count();
        let target = if prefix == batch.len() {
            batch
                .next_cursor
                .as_ref()
                .or_else(|| batch.posts.last().map(|p| &p.position))
        } else if prefix > 0 {
            Some(&batch.posts[prefix - 1].position)
        } else {
            None
        };

        let Some(target) = target else {
            return Ok(());
        };
        if self.cursor.as_ref().is_some_and(|cur| target <= cur) {
            return Ok(());
        }

        let position = self.fetcher.adapter().serialize_cursor(target);
        self.store
            .save_cursor(SourceCursor {
                source_id: self.source_id.clone(),
                position: position.clone(),
                updated_at: Utc::now(),
            })
            .await?;
        self.cursor = Some(target.clone());
        self.status
            .update(&self.source_id, |s| s.cursor = Some(position));
        Ok(())
    }

    fn record_stats(&self, stats: &CycleStats) {
        let src = self.source_id.clone();
        counter!("ingest_posts_fetched_total", "source" => src.clone()).increment(stats.fetched);
        counter!("ingest_posts_duplicate_total", "source" => src.clone())
            .increment(stats.duplicates);
        counter!("ingest_posts_analyzed_total", "source" => src.clone()).increment(stats.analyzed);
        counter!("ingest_posts_unscored_total", "source" => src.clone()).increment(stats.unscored);
        counter!("ingest_posts_persisted_total", "source" => src.clone())
            .increment(stats.persisted);
        counter!("ingest_posts_failed_total", "source" => src).increment(stats.failed);
    }

    fn on_success(&mut self, stats: CycleStats) -> CycleOutcome {
        self.consecutive_failures = 0;
        self.consecutive_permanent = 0;

        if stats.fetched > 0 {
            tracing::info!(
                target: "ingest",
                source = %self.source_id,
                fetched = stats.fetched,
                duplicates = stats.duplicates,
                analyzed = stats.analyzed,
                unscored = stats.unscored,
                persisted = stats.persisted,
                "ingest cycle"
            );
        } else {
            tracing::debug!(target: "ingest", source = %self.source_id, "nothing new");
        }

        self.status.update(&self.source_id, |s| {
            s.state = SourceState::Idle;
            s.cycles += 1;
            s.last_cycle = Some(stats);
            s.totals.accumulate(&stats);
            s.consecutive_failures = 0;
            s.consecutive_permanent_failures = 0;
            s.last_error = None;
        });
        gauge!("ingest_source_state", "source" => self.source_id.clone())
            .set(SourceState::Idle.code());
        CycleOutcome::Completed(stats)
    }

    fn on_failure(&mut self, err: IngestError, stats: CycleStats) -> CycleOutcome {
        counter!(
            "ingest_cycle_errors_total",
            "source" => self.source_id.clone(),
            "kind" => err.label()
        )
        .increment(1);

        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        if err.kind() == FailureKind::Permanent {
            self.consecutive_permanent = self.consecutive_permanent.saturating_add(1);
        }

        let (next, outcome) = if err.kind() == FailureKind::Permanent
            && self.consecutive_permanent >= self.policy.max_consecutive_failures
        {
            tracing::error!(
                target: "ingest",
                source = %self.source_id,
                error = %err,
                failures = self.consecutive_permanent,
                "source failed; waiting for reset"
            );
            let reason = err.to_string();
            (
                SourceState::Failed {
                    reason: reason.clone(),
                },
                CycleOutcome::Failed { reason },
            )
        } else {
            let backoff = self.policy.backoff.delay_for(self.consecutive_failures);
            // A source hint may stretch the delay, but never past the cap.
            let ceiling = Duration::from_millis(self.policy.backoff.max_ms).max(backoff);
            let delay = err
                .retry_after()
                .map_or(backoff, |hint| hint.clamp(backoff, ceiling));
            tracing::warn!(
                target: "ingest",
                source = %self.source_id,
                error = %err,
                kind = ?err.kind(),
                attempt = self.consecutive_failures,
                delay_ms = delay.as_millis() as u64,
                "ingest cycle failed; backing off"
            );
            (
                SourceState::Backoff {
                    attempt: self.consecutive_failures,
                    delay_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                },
                CycleOutcome::Backoff {
                    attempt: self.consecutive_failures,
                    delay,
                },
            )
        };

        let (failures, permanent) = (self.consecutive_failures, self.consecutive_permanent);
        let message = err.to_string();
        gauge!("ingest_source_state", "source" => self.source_id.clone()).set(next.code());
        self.status.update(&self.source_id, |s| {
            s.state = next;
            s.consecutive_failures = failures;
            s.consecutive_permanent_failures = permanent;
            s.last_error = Some(message);
            if stats != CycleStats::default() {
                s.last_cycle = Some(stats);
                s.totals.accumulate(&stats);
            }
        });
        outcome
    }

    /// Block while FAILED. Returns false when cancelled instead of reset.
    ///
    /// [`StatusRegistry::request_reset`] has already moved the status out of
    /// FAILED by the time we are woken; a wakeup that finds it still FAILED is
    /// not a reset and is ignored.
    async fn wait_for_reset(&mut self, cancel: &CancellationToken) -> bool {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return false,
                _ = self.reset.notified() => {}
            }
            if self.state().is_failed() {
                tracing::debug!(target: "ingest", source = %self.source_id, "spurious reset wakeup");
                continue;
            }
            self.consecutive_failures = 0;
            self.consecutive_permanent = 0;
            gauge!("ingest_source_state", "source" => self.source_id.clone())
                .set(SourceState::Idle.code());
            tracing::info!(target: "ingest", source = %self.source_id, "source reset; resuming");
            return true;
        }
    }

    /// Drive the source until `cancel` fires. Returns the final state (STOPPED).
    pub async fn run(mut self, cancel: CancellationToken) -> SourceState {
        tracing::info!(target: "ingest", source = %self.source_id, "source task started");
        loop {
            let pause = match self.run_cycle(&cancel).await {
                CycleOutcome::Completed(stats) if (stats.fetched as usize) < self.policy.batch_size => {
                    Some(self.policy.poll_interval)
                }
                // Full batch: likely more waiting, go again right away.
                CycleOutcome::Completed(_) => None,
                CycleOutcome::Backoff { delay, .. } => Some(delay),
                CycleOutcome::Failed { .. } => {
                    if !self.wait_for_reset(&cancel).await {
                        break;
                    }
                    None
                }
                CycleOutcome::Cancelled => break,
            };

            if cancel.is_cancelled() {
                break;
            }
            if let Some(d) = pause {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = sleep(d) => {}
                }
            }
        }

        self.set_state(SourceState::Stopped);
        tracing::info!(target: "ingest", source = %self.source_id, "source task stopped");
        SourceState::Stopped
    }
}

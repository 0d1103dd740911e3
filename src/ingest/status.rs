//! Per-source state and counters, shared between the ingest tasks and the API.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Notify;

/// Where a source's ingest loop currently is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SourceState {
    Idle,
    Fetching,
    Processing,
    Persisting,
    Backoff { attempt: u32, delay_ms: u64 },
    /// Terminal until an external reset.
    Failed { reason: String },
    /// Cancelled (shutdown).
    Stopped,
}

impl SourceState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Fetching => "fetching",
            Self::Processing => "processing",
            Self::Persisting => "persisting",
            Self::Backoff { .. } => "backoff",
            Self::Failed { .. } => "failed",
            Self::Stopped => "stopped",
        }
    }

    /// Numeric code for the `ingest_source_state` gauge.
    pub fn code(&self) -> f64 {
        match self {
            Self::Idle => 0.0,
            Self::Fetching => 1.0,
            Self::Processing => 2.0,
            Self::Persisting => 3.0,
            Self::Backoff { .. } => 4.0,
            Self::Failed { .. } => 5.0,
            Self::Stopped => 6.0,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

/// Counts for one ingest cycle (or a running total).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CycleStats {
    pub fetched: u64,
    pub duplicates: u64,
    /// Posts that received a sentiment score.
    pub analyzed: u64,
    /// Posts stored without sentiment.
    pub unscored: u64,
    pub persisted: u64,
    /// Posts whose write failed and will be refetched.
    pub failed: u64,
}

impl CycleStats {
    pub fn accumulate(&mut self, other: &CycleStats) {
        self.fetched += other.fetched;
        self.duplicates += other.duplicates;
        self.analyzed += other.analyzed;
        self.unscored += other.unscored;
        self.persisted += other.persisted;
        self.failed += other.failed;
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceStatus {
    pub source_id: String,
    #[serde(flatten)]
    pub state: SourceState,
    pub consecutive_failures: u32,
    pub consecutive_permanent_failures: u32,
    pub cycles: u64,
    pub last_cycle: Option<CycleStats>,
    pub totals: CycleStats,
    pub last_error: Option<String>,
    /// Serialized cursor as last persisted.
    pub cursor: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl SourceStatus {
    fn new(source_id: &str) -> Self {
        Self {
            source_id: source_id.to_string(),
            state: SourceState::Idle,
            consecutive_failures: 0,
            consecutive_permanent_failures: 0,
            cycles: 0,
            last_cycle: None,
            totals: CycleStats::default(),
            last_error: None,
            cursor: None,
            updated_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetOutcome {
    Accepted,
    NotFailed,
    UnknownSource,
}

struct Entry {
    status: SourceStatus,
    reset: Arc<Notify>,
}

/// Shared registry of [`SourceStatus`], one entry per configured source.
#[derive(Clone, Default)]
pub struct StatusRegistry {
    inner: Arc<RwLock<HashMap<String, Entry>>>,
}

impl StatusRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a source (idempotent) and return the signal its task waits on while FAILED.
    pub fn register(&self, source_id: &str) -> Arc<Notify> {
        let mut g = self.inner.write().unwrap_or_else(|p| p.into_inner());
        g.entry(source_id.to_string())
            .or_insert_with(|| Entry {
                status: SourceStatus::new(source_id),
                reset: Arc::new(Notify::new()),
            })
            .reset
            .clone()
    }

    pub fn update(&self, source_id: &str, f: impl FnOnce(&mut SourceStatus)) {
        let mut g = self.inner.write().unwrap_or_else(|p| p.into_inner());
        if let Some(e) = g.get_mut(source_id) {
            f(&mut e.status);
            e.status.updated_at = Utc::now();
        }
    }

    pub fn get(&self, source_id: &str) -> Option<SourceStatus> {
        let g = self.inner.read().unwrap_or_else(|p| p.into_inner());
        g.get(source_id).map(|e| e.status.clone())
    }

    /// All sources, sorted by id.
    pub fn snapshot(&self) -> Vec<SourceStatus> {
        let g = self.inner.read().unwrap_or_else(|p| p.into_inner());
        let mut out: Vec<_> = g.values().map(|e| e.status.clone()).collect();
        out.sort_by(|a, b| a.source_id.cmp(&b.source_id));
        out
    }

    /// Ask a FAILED source to resume.
    ///
    /// The status leaves FAILED here, under the write lock, before the task is
    /// woken: a second request for the same failure sees IDLE and is refused,
    /// so at most one wakeup is ever pending per failure.
    pub fn request_reset(&self, source_id: &str) -> ResetOutcome {
        let mut g = self.inner.write().unwrap_or_else(|p| p.into_inner());
        match g.get_mut(source_id) {
            None => ResetOutcome::UnknownSource,
            Some(e) if !e.status.state.is_failed() => ResetOutcome::NotFailed,
            Some(e) => {
                let s = &mut e.status;
                s.state = SourceState::Idle;
                s.consecutive_failures = 0;
                s.consecutive_permanent_failures = 0;
                s.last_error = None;
                s.updated_at = Utc::now();
                e.reset.notify_one();
                ResetOutcome::Accepted
            }
        }
    }
}

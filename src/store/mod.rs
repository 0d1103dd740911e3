//! Persistence boundary.
//!
//! The pipeline and the query service only talk to [`PostStore`]; the engine
//! behind it is a deployment choice. [`memory::MemoryStore`] is the bundled one.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::dedup::ContentFingerprint;
use crate::error::StoreError;
use crate::model::{AnalyzedPost, SourceCursor};

pub use memory::MemoryStore;

/// Result of one conditional insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// Fingerprint or external id already present for the source. Not an error:
    /// the existing row wins and nothing is updated.
    Conflict,
}

/// Source/time window for [`PostStore::range_query`]. Bounds are inclusive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeQuery {
    pub source_id: Option<String>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl RangeQuery {
    pub fn matches(&self, post: &AnalyzedPost) -> bool {
        self.source_id
            .as_deref()
            .map_or(true, |s| s == post.source_id)
            && self.start.map_or(true, |t| post.timestamp >= t)
            && self.end.map_or(true, |t| post.timestamp <= t)
    }
}

#[async_trait]
pub trait PostStore: Send + Sync {
    async fn get_by_fingerprint(
        &self,
        source_id: &str,
        fp: &ContentFingerprint,
    ) -> Result<Option<AnalyzedPost>, StoreError>;

    /// Upsert-if-absent for a whole batch in a single write.
    ///
    /// Returns one outcome per input, in input order. A failed record does not
    /// undo the records that succeeded.
    async fn insert_batch(
        &self,
        posts: Vec<AnalyzedPost>,
    ) -> Vec<Result<InsertOutcome, StoreError>>;

    /// Posts in the window ordered by timestamp ascending.
    async fn range_query(&self, query: &RangeQuery) -> Result<Vec<AnalyzedPost>, StoreError>;

    async fn load_cursor(&self, source_id: &str) -> Result<Option<SourceCursor>, StoreError>;

    async fn save_cursor(&self, cursor: SourceCursor) -> Result<(), StoreError>;
}

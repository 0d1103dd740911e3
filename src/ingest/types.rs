// src/ingest/types.rs
use async_trait::async_trait;
use std::fmt::Debug;

use crate::error::FetchError;
use crate::model::RawPost;

/// A post together with the cursor position that resumes right after it.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedPost<C> {
    pub post: RawPost,
    pub position: C,
}

/// One page from a source, oldest post first.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceBatch<C> {
    pub posts: Vec<FetchedPost<C>>,
    /// Where the next fetch should resume once every post above is durable.
    /// `None` when the source reported no progress.
    pub next_cursor: Option<C>,
}

impl<C> SourceBatch<C> {
    pub fn empty() -> Self {
        Self {
            posts: Vec::new(),
            next_cursor: None,
        }
    }

    pub fn len(&self) -> usize {
        self.posts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.posts.is_empty()
    }
}

/// Capability interface every platform integration implements.
///
/// Cursor values are platform specific; the pipeline only compares them
/// (`Ord`, to keep progress monotonic) and round-trips them through
/// [`serialize_cursor`](Self::serialize_cursor) for persistence.
/// Fetching from an older cursor must be allowed: delivery is at-least-once.
#[async_trait]
pub trait SourceAdapter: Send + Sync + 'static {
    type Cursor: Clone + Ord + Debug + Send + Sync + 'static;

    fn source_id(&self) -> &str;

    /// Fetch up to `limit` posts after `cursor` (from the beginning when `None`).
    async fn fetch_batch(
        &self,
        cursor: Option<&Self::Cursor>,
        limit: usize,
    ) -> Result<SourceBatch<Self::Cursor>, FetchError>;

    fn serialize_cursor(&self, cursor: &Self::Cursor) -> String;

    fn deserialize_cursor(&self, raw: &str) -> Result<Self::Cursor, FetchError>;
}

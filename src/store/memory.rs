//! In-memory [`PostStore`].
//!
//! Uniqueness of fingerprint and external id per source is enforced under a
//! single write lock, so two tasks racing on the same source cannot both insert.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use super::{InsertOutcome, PostStore, RangeQuery};
use crate::dedup::ContentFingerprint;
use crate::error::StoreError;
use crate::model::{AnalyzedPost, SourceCursor};

#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    shards: HashMap<String, Shard>,
    cursors: HashMap<String, SourceCursor>,
}

/// Everything stored for one source.
#[derive(Debug, Default)]
struct Shard {
    posts: Vec<AnalyzedPost>,
    by_fingerprint: HashMap<ContentFingerprint, usize>,
    by_external_id: HashMap<String, usize>,
}

impl Shard {
    fn insert_if_absent(&mut self, post: AnalyzedPost) -> InsertOutcome {
        if self.by_fingerprint.contains_key(&post.fingerprint)
            || self.by_external_id.contains_key(&post.external_id)
        {
            return InsertOutcome::Conflict;
        }
        let idx = self.posts.len();
        self.by_fingerprint.insert(post.fingerprint, idx);
        self.by_external_id.insert(post.external_id.clone(), idx);
        self.posts.push(post);
        InsertOutcome::Inserted
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored posts across all sources.
    pub fn len(&self) -> usize {
        self.read().map_or(0, |g| g.shards.values().map(|s| s.posts.len()).sum())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Inner>, StoreError> {
        self.inner
            .read()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".into()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Inner>, StoreError> {
        self.inner
            .write()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".into()))
    }
}

#[async_trait]
impl PostStore for MemoryStore {
    async fn get_by_fingerprint(
        &self,
        source_id: &str,
        fp: &ContentFingerprint,
    ) -> Result<Option<AnalyzedPost>, StoreError> {
        let g = self.read()?;
        Ok(g.shards
            .get(source_id)
            .and_then(|s| s.by_fingerprint.get(fp).map(|&i| s.posts[i].clone())))
    }

    async fn insert_batch(
        &self,
        posts: Vec<AnalyzedPost>,
    ) -> Vec<Result<InsertOutcome, StoreError>> {
        let mut g = match self.write() {
            Ok(g) => g,
            Err(e) => return posts.iter().map(|_| Err(e.clone())).collect(),
        };
        posts
            .into_iter()
            .map(|p| {
                Ok(g.shards
                    .entry(p.source_id.clone())
                    .or_default()
                    .insert_if_absent(p))
            })
            .collect()
    }

    async fn range_query(&self, query: &RangeQuery) -> Result<Vec<AnalyzedPost>, StoreError> {
        let g = self.read()?;
        let mut out: Vec<AnalyzedPost> = match &query.source_id {
            Some(id) => g
                .shards
                .get(id)
                .map(|s| s.posts.iter().filter(|p| query.matches(p)).cloned().collect())
                .unwrap_or_default(),
            None => g
                .shards
                .values()
                .flat_map(|s| s.posts.iter())
                .filter(|p| query.matches(p))
                .cloned()
                .collect(),
        };
        out.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a.source_id.cmp(&b.source_id))
                .then_with(|| a.external_id.cmp(&b.external_id))
        });
        Ok(out)
    }

    async fn load_cursor(&self, source_id: &str) -> Result<Option<SourceCursor>, StoreError> {
        Ok(self.read()?.cursors.get(source_id).cloned())
    }

    async fn save_cursor(&self, cursor: SourceCursor) -> Result<(), StoreError> {
        self.write()?
            .cursors
            .insert(cursor.source_id.clone(), cursor);
        Ok(())
    }
}

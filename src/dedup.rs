//! # Deduplicator
//! Exact-after-normalization duplicate detection via content fingerprints.
//!
//! The check is read-only: it answers "seen before?" and leaves the decision to
//! persist to the pipeline. Near-duplicates (small edits) are not detected.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::StoreError;
use crate::store::PostStore;

/// Bumping this invalidates every stored fingerprint.
const FINGERPRINT_DOMAIN: &[u8] = b"post-fingerprint/v1\0";

/// SHA-256 of normalized text. Fixed 32 bytes; rendered as lowercase hex.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct ContentFingerprint([u8; 32]);

impl ContentFingerprint {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for ContentFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // 12 hex chars is plenty to tell fingerprints apart in logs.
        write!(f, "ContentFingerprint({}…)", &self.to_hex()[..12])
    }
}

impl fmt::Display for ContentFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl From<ContentFingerprint> for String {
    fn from(fp: ContentFingerprint) -> Self {
        fp.to_hex()
    }
}

impl TryFrom<String> for ContentFingerprint {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        let mut out = [0u8; 32];
        hex::decode_to_slice(s.as_bytes(), &mut out)
            .map_err(|e| format!("invalid fingerprint {s:?}: {e}"))?;
        Ok(Self(out))
    }
}

/// Fingerprint already-normalized text. Deterministic across processes.
pub fn fingerprint(normalized_text: &str) -> ContentFingerprint {
    let mut hasher = Sha256::new();
    hasher.update(FINGERPRINT_DOMAIN);
    hasher.update(normalized_text.as_bytes());
    ContentFingerprint(hasher.finalize().into())
}

/// Answers duplicate checks against what the store already holds.
#[derive(Clone)]
pub struct Deduplicator {
    store: Arc<dyn PostStore>,
}

/// Outcome of a duplicate check inside one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Seen {
    /// Never seen for this source.
    Fresh,
    /// An earlier post of the same batch had the same fingerprint.
    InBatch,
    /// Already persisted for this source.
    Persisted,
}

impl Seen {
    pub fn is_duplicate(self) -> bool {
        !matches!(self, Seen::Fresh)
    }
}

impl Deduplicator {
    pub fn new(store: Arc<dyn PostStore>) -> Self {
        Self { store }
    }

    /// True when `fp` is already persisted for `source_id`.
    pub async fn is_duplicate(
        &self,
        source_id: &str,
        fp: &ContentFingerprint,
    ) -> Result<bool, StoreError> {
        Ok(self.store.get_by_fingerprint(source_id, fp).await?.is_some())
    }

    /// Start a batch-scoped check that also remembers fingerprints seen
    /// earlier in the same batch.
    pub fn batch(&self, source_id: &str) -> BatchScope<'_> {
        BatchScope {
            dedup: self,
            source_id: source_id.to_string(),
            seen: HashSet::new(),
        }
    }
}

pub struct BatchScope<'a> {
    dedup: &'a Deduplicator,
    source_id: String,
    seen: HashSet<ContentFingerprint>,
}

impl BatchScope<'_> {
    pub async fn check(&mut self, fp: &ContentFingerprint) -> Result<Seen, StoreError> {
        if self.seen.contains(fp) {
            return Ok(Seen::InBatch);
        }
        if self.dedup.is_duplicate(&self.source_id, fp).await? {
            return Ok(Seen::Persisted);
        }
        self.seen.insert(*fp);
        Ok(Seen::Fresh)
    }
}

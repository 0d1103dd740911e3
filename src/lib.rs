// src/lib.rs
// Public library surface for the binary and integration tests.

pub mod api;
pub mod dedup;
pub mod error;
pub mod ingest;
pub mod metrics;
pub mod model;
pub mod normalize;
pub mod query;
pub mod sentiment;
pub mod store;

// ---- Re-exports for stable public API ----
pub use crate::api::router;
pub use crate::error::{FailureKind, FetchError, IngestError, StoreError};
pub use crate::model::{AnalyzedPost, RawPost, SentimentScore, SourceCursor};

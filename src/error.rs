//! Error taxonomy for the ingest pipeline.
//!
//! Every error that can end a cycle reports a [`FailureKind`]. The pipeline
//! decides between BACKOFF and FAILED from that value alone, never from the
//! concrete variant.
//!
//! Two conditions are not errors here:
//! - a persistence conflict (duplicate upsert race) is
//!   [`crate::store::InsertOutcome::Conflict`], a successful no-op;
//! - an unsupported language is [`AnalysisError::UnsupportedLanguage`], which the
//!   analyzer downgrades to an unscored post and never propagates.

use std::time::Duration;
use thiserror::Error;

/// Whether a failure is expected to clear up on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Rate limits, network hiccups, a store that is briefly down.
    Transient,
    /// Needs someone to fix credentials or configuration.
    Permanent,
}

/// Failures raised while pulling a batch from a source.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("source {source_id} is rate limited")]
    RateLimited {
        source_id: String,
        /// Hint from the source (e.g. `Retry-After`) or from the local budget.
        retry_after: Option<Duration>,
    },

    #[error("source {source_id} unavailable: {reason}")]
    SourceUnavailable { source_id: String, reason: String },

    #[error("authentication rejected by {source_id}: {reason}")]
    AuthFailure { source_id: String, reason: String },

    /// Unexpected status, malformed payload or an unreadable cursor.
    #[error("protocol error from {source_id}: {reason}")]
    Protocol { source_id: String, reason: String },
}

impl FetchError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::RateLimited { .. } | Self::SourceUnavailable { .. } => FailureKind::Transient,
            Self::AuthFailure { .. } | Self::Protocol { .. } => FailureKind::Permanent,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Short label used for metrics and status output.
    pub fn label(&self) -> &'static str {
        match self {
            Self::RateLimited { .. } => "rate_limited",
            Self::SourceUnavailable { .. } => "source_unavailable",
            Self::AuthFailure { .. } => "auth_failure",
            Self::Protocol { .. } => "protocol",
        }
    }
}

/// Failures of the persistence layer.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("persistence unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Unavailable(_) => FailureKind::Transient,
        }
    }
}

/// Local analyzer failures. These never leave the analyzer.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AnalysisError {
    #[error("unsupported language: {0}")]
    UnsupportedLanguage(String),

    #[error("sentiment model unavailable: {0}")]
    Unavailable(String),
}

/// Why a single ingest cycle for one source ended early.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl IngestError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Fetch(e) => e.kind(),
            Self::Store(e) => e.kind(),
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Fetch(e) => e.retry_after(),
            Self::Store(_) => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Fetch(e) => e.label(),
            Self::Store(_) => "persistence_unavailable",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unavailable() -> FetchError {
        FetchError::SourceUnavailable {
            source_id: "s".into(),
            reason: "connection reset".into(),
        }
    }

    #[test]
    fn transient_and_permanent_split() {
        let rl = FetchError::RateLimited {
            source_id: "s".into(),
            retry_after: Some(Duration::from_secs(3)),
        };
        assert_eq!(rl.kind(), FailureKind::Transient);
        assert_eq!(rl.retry_after(), Some(Duration::from_secs(3)));
        assert_eq!(unavailable().kind(), FailureKind::Transient);

        let auth = FetchError::AuthFailure {
            source_id: "s".into(),
            reason: "401".into(),
        };
        assert_eq!(auth.kind(), FailureKind::Permanent);
        assert_eq!(auth.retry_after(), None);
    }

    #[test]
    fn ingest_error_delegates_kind() {
        let e: IngestError = StoreError::Unavailable("down".into()).into();
        assert_eq!(e.kind(), FailureKind::Transient);
        assert_eq!(e.label(), "persistence_unavailable");

        let e: IngestError = unavailable().into();
        assert_eq!(e.label(), "source_unavailable");
    }
}

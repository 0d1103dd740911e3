//! # Data model
//! Posts as they flow through the pipeline: raw from a source, analyzed and
//! persisted, plus the per-source ingestion cursor.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::dedup::ContentFingerprint;

/// A post exactly as a source adapter produced it. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawPost {
    pub source_id: String,
    /// Identifier assigned by the platform; unique per source.
    pub external_id: String,
    pub author: String,
    pub raw_text: String,
    /// When the platform says the post was published.
    pub timestamp: DateTime<Utc>,
    /// When we pulled it.
    pub fetch_time: DateTime<Utc>,
    /// Language tag reported by the platform (e.g. "en"), if any.
    #[serde(default)]
    pub language: Option<String>,
}

/// Polarity in [-1, 1] and subjectivity in [0, 1].
///
/// The only constructor clamps, so an out-of-range score cannot exist.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "ScorePair")]
pub struct SentimentScore {
    polarity: f64,
    subjectivity: f64,
}

#[derive(Deserialize)]
struct ScorePair {
    polarity: f64,
    subjectivity: f64,
}

impl From<ScorePair> for SentimentScore {
    fn from(p: ScorePair) -> Self {
        Self::new(p.polarity, p.subjectivity)
    }
}

impl SentimentScore {
    /// Clamp both values into their ranges. NaN collapses to 0.
    pub fn new(polarity: f64, subjectivity: f64) -> Self {
        fn sane(x: f64) -> f64 {
            if x.is_nan() {
                0.0
            } else {
                x
            }
        }
        Self {
            polarity: sane(polarity).clamp(-1.0, 1.0),
            subjectivity: sane(subjectivity).clamp(0.0, 1.0),
        }
    }

    pub fn neutral() -> Self {
        Self::new(0.0, 0.0)
    }

    pub fn polarity(&self) -> f64 {
        self.polarity
    }

    pub fn subjectivity(&self) -> f64 {
        self.subjectivity
    }

    pub fn label(&self) -> SentimentLabel {
        SentimentLabel::from_polarity(self.polarity)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SentimentLabel {
    Positive,
    Neutral,
    Negative,
}

impl SentimentLabel {
    /// Dead zone of ±0.1 around zero counts as neutral.
    pub fn from_polarity(p: f64) -> Self {
        if p > 0.1 {
            Self::Positive
        } else if p < -0.1 {
            Self::Negative
        } else {
            Self::Neutral
        }
    }
}

/// A normalized, fingerprinted and (possibly) scored post. Immutable once stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyzedPost {
    pub source_id: String,
    pub external_id: String,
    pub author: String,
    pub normalized_text: String,
    /// `None` when the analyzer could not score the text.
    pub sentiment: Option<SentimentScore>,
    pub timestamp: DateTime<Utc>,
    pub fingerprint: ContentFingerprint,
}

impl AnalyzedPost {
    pub fn polarity(&self) -> Option<f64> {
        self.sentiment.map(|s| s.polarity())
    }

    pub fn subjectivity(&self) -> Option<f64> {
        self.sentiment.map(|s| s.subjectivity())
    }

    pub fn label(&self) -> Option<SentimentLabel> {
        self.sentiment.map(|s| s.label())
    }
}

/// Persisted ingestion progress for one source. `position` is opaque and
/// only the source adapter that wrote it can read it back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceCursor {
    pub source_id: String,
    pub position: String,
    pub updated_at: DateTime<Utc>,
}

//! # Query Service
//! Read-only filters and aggregates over persisted [`AnalyzedPost`]s.
//!
//! Nothing here writes to the store. A query that matches nothing yields an
//! empty list or an aggregate with `count == 0`, never an error.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::model::{AnalyzedPost, SentimentLabel};
use crate::sentiment::Lexicon;
use crate::store::{PostStore, RangeQuery};

const TOP_KEYWORDS: usize = 10;
const TOP_AUTHORS: usize = 5;
const MIN_KEYWORD_CHARS: usize = 4;

/// Optional filters; all bounds inclusive. `limit` applies to listings only.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PostFilter {
    pub source_id: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub min_polarity: Option<f64>,
    pub max_polarity: Option<f64>,
    pub limit: Option<usize>,
}

impl PostFilter {
    fn range(&self) -> RangeQuery {
        RangeQuery {
            source_id: self.source_id.clone(),
            start: self.start_time,
            end: self.end_time,
        }
    }

    fn has_polarity_bounds(&self) -> bool {
        self.min_polarity.is_some() || self.max_polarity.is_some()
    }

    /// Posts without a score never satisfy a polarity bound.
    fn matches_polarity(&self, post: &AnalyzedPost) -> bool {
        if !self.has_polarity_bounds() {
            return true;
        }
        let Some(p) = post.polarity() else {
            return false;
        };
        self.min_polarity.map_or(true, |min| p >= min)
            && self.max_polarity.map_or(true, |max| p <= max)
    }

    /// Bounds that cannot match anything (min above max).
    fn is_inverted(&self) -> bool {
        matches!((self.min_polarity, self.max_polarity), (Some(a), Some(b)) if a > b)
            || matches!((self.start_time, self.end_time), (Some(a), Some(b)) if a > b)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LabelCounts {
    pub positive: usize,
    pub neutral: usize,
    pub negative: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeywordCount {
    pub keyword: String,
    pub count: usize,
}

/// Activity and mean sentiment of one author within an aggregate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuthorSummary {
    pub author: String,
    pub posts: usize,
    /// Over the author's scored posts (3 decimals); `None` if none were scored.
    pub mean_polarity: Option<f64>,
}

/// Summary over a filtered set of posts.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Aggregate {
    pub count: usize,
    pub scored: usize,
    pub unscored: usize,
    /// Over scored posts; `None` when there are none.
    pub mean_polarity: Option<f64>,
    pub mean_subjectivity: Option<f64>,
    /// Share of scored posts with polarity > 0, in percent (2 decimals).
    pub positive_percent: Option<f64>,
    pub labels: LabelCounts,
    /// UTC day (`YYYY-MM-DD`) → mean polarity of scored posts that day (3 decimals).
    pub sentiment_trend: BTreeMap<String, f64>,
    pub top_keywords: Vec<KeywordCount>,
    /// Distinct authors among the matching posts.
    pub estimated_reach: usize,
    /// Most active authors, by post count then name.
    pub top_authors: Vec<AuthorSummary>,
}

fn round_to(x: f64, decimals: i32) -> f64 {
    let f = 10f64.powi(decimals);
    (x * f).round() / f
}

impl Aggregate {
    pub fn from_posts<'a>(posts: impl IntoIterator<Item = &'a AnalyzedPost>) -> Self {
        let mut agg = Aggregate::default();
        let (mut sum_p, mut sum_s, mut positive) = (0.0f64, 0.0f64, 0usize);
        let mut by_day: BTreeMap<String, (f64, usize)> = BTreeMap::new();
        let mut words: HashMap<&str, usize> = HashMap::new();
        // author -> (posts, polarity sum, scored posts)
        let mut authors: HashMap<&str, (usize, f64, usize)> = HashMap::new();
        let lexicon = Lexicon::global();

        for post in posts {
            agg.count += 1;
            let author = authors.entry(post.author.as_str()).or_default();
            author.0 += 1;
            if let Some(p) = post.polarity() {
                author.1 += p;
                author.2 += 1;
            }

            for tok in post.normalized_text.split_whitespace() {
                if tok.chars().count() >= MIN_KEYWORD_CHARS
                    && tok.chars().all(char::is_alphabetic)
                    && !lexicon.is_stopword(tok)
                {
                    *words.entry(tok).or_default() += 1;
                }
            }

            let Some(score) = post.sentiment else {
                agg.unscored += 1;
                continue;
            };
            agg.scored += 1;
            sum_p += score.polarity();
            sum_s += score.subjectivity();
            if score.polarity() > 0.0 {
                positive += 1;
            }
            match score.label() {
                SentimentLabel::Positive => agg.labels.positive += 1,
                SentimentLabel::Neutral => agg.labels.neutral += 1,
                SentimentLabel::Negative => agg.labels.negative += 1,
            }
            let day = by_day
                .entry(post.timestamp.format("%Y-%m-%d").to_string())
                .or_default();
            day.0 += score.polarity();
            day.1 += 1;
        }

        if agg.scored > 0 {
            let n = agg.scored as f64;
            agg.mean_polarity = Some(sum_p / n);
            agg.mean_subjectivity = Some(sum_s / n);
            agg.positive_percent = Some(round_to(positive as f64 * 100.0 / n, 2));
        }
        agg.sentiment_trend = by_day
            .into_iter()
            .map(|(day, (sum, n))| (day, round_to(sum / n as f64, 3)))
            .collect();

        let mut kw: Vec<_> = words.into_iter().collect();
        kw.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        agg.top_keywords = kw
            .into_iter()
            .take(TOP_KEYWORDS)
            .map(|(k, count)| KeywordCount {
                keyword: k.to_string(),
                count,
            })
            .collect();
        agg.estimated_reach = authors.len();
        let mut by_author: Vec<_> = authors.into_iter().collect();
        by_author.sort_by(|a, b| b.1 .0.cmp(&a.1 .0).then_with(|| a.0.cmp(b.0)));
        agg.top_authors = by_author
            .into_iter()
            .take(TOP_AUTHORS)
            .map(|(author, (posts, sum, scored))| AuthorSummary {
                author: author.to_string(),
                posts,
                mean_polarity: (scored > 0).then(|| round_to(sum / scored as f64, 3)),
            })
            .collect();
        agg
    }
}

/// Read-only view over a [`PostStore`].
#[derive(Clone)]
pub struct QueryService {
    store: Arc<dyn PostStore>,
}

impl QueryService {
    pub fn new(store: Arc<dyn PostStore>) -> Self {
        Self { store }
    }

    async fn matching(&self, filter: &PostFilter) -> Result<Vec<AnalyzedPost>, StoreError> {
        if filter.is_inverted() {
            return Ok(Vec::new());
        }
        let mut posts = self.store.range_query(&filter.range()).await?;
        posts.retain(|p| filter.matches_polarity(p));
        Ok(posts)
    }

    /// Matching posts, newest first, capped at `filter.limit`.
    pub async fn list(&self, filter: &PostFilter) -> Result<Vec<AnalyzedPost>, StoreError> {
        let mut posts = self.matching(filter).await?;
        posts.reverse();
        if let Some(limit) = filter.limit {
            posts.truncate(limit);
        }
        Ok(posts)
    }

    /// Aggregate over every matching post; `limit` is ignored.
    pub async fn aggregate(&self, filter: &PostFilter) -> Result<Aggregate, StoreError> {
        let posts = self.matching(filter).await?;
        Ok(Aggregate::from_posts(&posts))
    }
}

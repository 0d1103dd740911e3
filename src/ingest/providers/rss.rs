// src/ingest/providers/rss.rs
//! RSS feeds (Mastodon account/tag feeds and similar).
//!
//! Feeds only expose their newest items and ignore any "since" parameter, so
//! the cursor is a `(published_at, guid)` watermark applied client-side.

use std::cmp::Ordering;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::histogram;
use quick_xml::de::from_str;
use serde::Deserialize;
use time::{format_description::well_known::Rfc2822, OffsetDateTime};

use crate::error::FetchError;
use crate::ingest::providers::{classify_status, classify_transport, http_client};
use crate::ingest::types::{FetchedPost, SourceAdapter, SourceBatch};
use crate::model::RawPost;

#[derive(Debug, Deserialize)]
struct Rss {
    channel: Channel,
}

#[derive(Debug, Deserialize)]
struct Channel {
    title: Option<String>,
    language: Option<String>,
    #[serde(rename = "item", default)]
    item: Vec<Item>,
}

#[derive(Debug, Deserialize)]
struct Item {
    guid: Option<String>,
    title: Option<String>,
    link: Option<String>,
    #[serde(rename = "pubDate")]
    pub_date: Option<String>,
    description: Option<String>,
    #[serde(alias = "dc:creator", alias = "creator")]
    author: Option<String>,
}

/// Position of one feed item. Orders by publish time, then guid.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RssCursor {
    pub published_at: i64,
    pub guid: String,
}

impl Ord for RssCursor {
    fn cmp(&self, other: &Self) -> Ordering {
        self.published_at
            .cmp(&other.published_at)
            .then_with(|| self.guid.cmp(&other.guid))
    }
}

impl PartialOrd for RssCursor {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for RssCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.published_at, self.guid)
    }
}

fn parse_rfc2822_to_unix(ts: &str) -> Option<i64> {
    let ts = ts.trim();
    OffsetDateTime::parse(ts, &Rfc2822)
        .ok()
        .map(|dt| dt.unix_timestamp())
        // chrono also takes obsolete zone names ("GMT", "EST").
        .or_else(|| DateTime::parse_from_rfc2822(ts).ok().map(|d| d.timestamp()))
}

enum Mode {
    Fixture(String),
    Http { url: String, client: reqwest::Client },
}

pub struct RssSource {
    source_id: String,
    mode: Mode,
}

impl RssSource {
    /// Serve a fixed XML document on every fetch.
    pub fn from_fixture(source_id: impl Into<String>, xml: &str) -> Self {
        Self {
            source_id: source_id.into(),
            mode: Mode::Fixture(xml.to_string()),
        }
    }

    pub fn from_url(source_id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            mode: Mode::Http {
                url: url.into(),
                client: http_client(),
            },
        }
    }

    async fn body(&self) -> Result<String, FetchError> {
        match &self.mode {
            Mode::Fixture(s) => Ok(s.clone()),
            Mode::Http { url, client } => {
                let resp = client
                    .get(url.as_str())
                    .send()
                    .await
                    .map_err(|e| classify_transport(&self.source_id, &e))?;
                if !resp.status().is_success() {
                    return Err(classify_status(&self.source_id, resp.status(), resp.headers()));
                }
                resp.text()
                    .await
                    .map_err(|e| classify_transport(&self.source_id, &e))
            }
        }
    }

    /// Parse a feed into posts ordered oldest first. Items without a usable
    /// date or identifier are skipped.
    pub fn parse_items(&self, xml: &str) -> Result<Vec<FetchedPost<RssCursor>>, FetchError> {
        let t0 = std::time::Instant::now();
        let xml_clean = scrub_html_entities_for_xml(xml);
        let rss: Rss = from_str(&xml_clean).map_err(|e| FetchError::Protocol {
            source_id: self.source_id.clone(),
            reason: format!("parsing rss xml: {e}"),
        })?;

        let fetch_time = Utc::now();
        let channel_author = rss.channel.title.clone().unwrap_or_default();
        let language = rss.channel.language.clone();

        let mut out = Vec::with_capacity(rss.channel.item.len());
        for it in rss.channel.item {
            let Some(published_at) = it.pub_date.as_deref().and_then(parse_rfc2822_to_unix) else {
                tracing::debug!(source = %self.source_id, guid = ?it.guid, "skipping item without pubDate");
                continue;
            };
            let Some(guid) = it.guid.or(it.link).filter(|g| !g.trim().is_empty()) else {
                tracing::debug!(source = %self.source_id, "skipping item without guid/link");
                continue;
            };
            let Some(timestamp) = DateTime::<Utc>::from_timestamp(published_at, 0) else {
                continue;
            };

            let raw_text = [it.title.as_deref(), it.description.as_deref()]
                .into_iter()
                .flatten()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .collect::<Vec<_>>()
                .join(" ");

            out.push(FetchedPost {
                post: RawPost {
                    source_id: self.source_id.clone(),
                    external_id: guid.trim().to_string(),
                    author: it.author.unwrap_or_else(|| channel_author.clone()),
                    raw_text,
                    timestamp,
                    fetch_time,
                    language: language.clone(),
                },
                position: RssCursor {
                    published_at,
                    guid: guid.trim().to_string(),
                },
            });
        }
        out.sort_by(|a, b| a.position.cmp(&b.position));

        let ms = t0.elapsed().as_secs_f64() * 1_000.0;
        histogram!("ingest_parse_ms", "source" => self.source_id.clone()).record(ms);
        Ok(out)
    }
}

#[async_trait]
impl SourceAdapter for RssSource {
    type Cursor = RssCursor;

    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn fetch_batch(
        &self,
        cursor: Option<&RssCursor>,
        limit: usize,
    ) -> Result<SourceBatch<RssCursor>, FetchError> {
        let body = self.body().await?;
        let posts: Vec<_> = self
            .parse_items(&body)?
            .into_iter()
            .filter(|p| cursor.map_or(true, |c| &p.position > c))
            .take(limit)
            .collect();
        let next_cursor = posts.last().map(|p| p.position.clone());
        Ok(SourceBatch { posts, next_cursor })
    }

    fn serialize_cursor(&self, cursor: &RssCursor) -> String {
        cursor.to_string()
    }

    fn deserialize_cursor(&self, raw: &str) -> Result<RssCursor, FetchError> {
        let bad = || FetchError::Protocol {
            source_id: self.source_id.clone(),
            reason: format!("invalid rss cursor {raw:?}"),
        };
        let (ts, guid) = raw.split_once(':').ok_or_else(bad)?;
        Ok(RssCursor {
            published_at: ts.parse().map_err(|_| bad())?,
            guid: guid.to_string(),
        })
    }
}

/// XML only knows five named entities; feeds routinely use HTML ones.
fn scrub_html_entities_for_xml(s: &str) -> String {
    s.replace("&nbsp;", " ")
        .replace("&ndash;", "-")
        .replace("&mdash;", "-")
        .replace("&hellip;", "...")
        .replace("&ldquo;", "\"")
        .replace("&rdquo;", "\"")
        .replace("&lsquo;", "'")
        .replace("&rsquo;", "'")
}

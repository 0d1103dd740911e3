// src/ingest/providers/http_json.rs
//! Generic JSON timeline API:
//! `GET {endpoint}?since_id={id}&limit={n}` with an optional bearer token,
//! answering `{ "data": [..], "includes": { "users": [..] } }`.
//!
//! The server must return each page oldest-first, starting just after
//! `since_id`. The adapter advances its watermark to the newest id it
//! returns, so a newest-first page that fills `limit` hides whatever lies
//! between the cursor and the page's oldest post. Such pages are logged at
//! WARN; the missed posts are not refetched.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::error::FetchError;
use crate::ingest::providers::{classify_status, classify_transport, http_client};
use crate::ingest::types::{FetchedPost, SourceAdapter, SourceBatch};
use crate::model::RawPost;

/// True when a page filled the requested limit and came back newest-first.
fn newest_first_full_page(ids: &[u64], limit: usize) -> bool {
    ids.len() >= limit.max(2) && ids.windows(2).all(|w| w[0] > w[1])
}

/// Highest post id seen. Ids are numeric and grow over time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IdWatermark(pub u64);

impl fmt::Display for IdWatermark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum IdRepr {
    Num(u64),
    Str(String),
}

impl IdRepr {
    fn parse(&self) -> Option<u64> {
        match self {
            Self::Num(n) => Some(*n),
            Self::Str(s) => s.trim().parse().ok(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct Page {
    #[serde(default)]
    data: Vec<Item>,
    #[serde(default)]
    includes: Includes,
}

#[derive(Debug, Default, Deserialize)]
struct Includes {
    #[serde(default)]
    users: Vec<User>,
}

#[derive(Debug, Deserialize)]
struct User {
    id: String,
    username: String,
}

#[derive(Debug, Deserialize)]
struct Item {
    id: IdRepr,
    #[serde(default)]
    text: String,
    author_id: Option<String>,
    created_at: Option<String>,
    lang: Option<String>,
}

pub struct HttpJsonSource {
    source_id: String,
    endpoint: String,
    bearer_token: Option<String>,
    client: reqwest::Client,
}

impl HttpJsonSource {
    pub fn new(source_id: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            endpoint: endpoint.into(),
            bearer_token: None,
            client: http_client(),
        }
    }

    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    fn protocol(&self, reason: impl Into<String>) -> FetchError {
        FetchError::Protocol {
            source_id: self.source_id.clone(),
            reason: reason.into(),
        }
    }

    fn into_posts(&self, page: Page) -> Result<Vec<FetchedPost<IdWatermark>>, FetchError> {
        let fetch_time = Utc::now();
        let users: HashMap<String, String> = page
            .includes
            .users
            .into_iter()
            .map(|u| (u.id, u.username))
            .collect();

        let mut out = Vec::with_capacity(page.data.len());
        for it in page.data {
            let id = it
                .id
                .parse()
                .ok_or_else(|| self.protocol(format!("non-numeric post id {:?}", it.id)))?;
            let timestamp = it
                .created_at
                .as_deref()
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|d| d.with_timezone(&Utc))
                .unwrap_or(fetch_time);
            let author = match it.author_id {
                Some(a) => users.get(&a).cloned().unwrap_or(a),
                None => String::from("unknown"),
            };
            out.push(FetchedPost {
                post: RawPost {
                    source_id: self.source_id.clone(),
                    external_id: id.to_string(),
                    author,
                    raw_text: it.text,
                    timestamp,
                    fetch_time,
                    language: it.lang,
                },
                position: IdWatermark(id),
            });
        }
        Ok(out)
    }
}

#[async_trait]
impl SourceAdapter for HttpJsonSource {
    type Cursor = IdWatermark;

    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn fetch_batch(
        &self,
        cursor: Option<&IdWatermark>,
        limit: usize,
    ) -> Result<SourceBatch<IdWatermark>, FetchError> {
        let mut query: Vec<(&str, String)> = vec![("limit", limit.to_string())];
        if let Some(c) = cursor {
            query.push(("since_id", c.0.to_string()));
        }

        let mut req = self.client.get(&self.endpoint).query(&query);
        if let Some(token) = &self.bearer_token {
            req = req.bearer_auth(token);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| classify_transport(&self.source_id, &e))?;
        let status = resp.status();
        if !status.is_success() {
            tracing::debug!(source = %self.source_id, %status, "http_json fetch rejected");
            return Err(classify_status(&self.source_id, status, resp.headers()));
        }
        let body = resp
            .text()
            .await
            .map_err(|e| classify_transport(&self.source_id, &e))?;
        let page: Page = serde_json::from_str(&body)
            .map_err(|e| self.protocol(format!("decoding response: {e}")))?;

        // Servers may ignore since_id/limit; enforce both here.
        let mut posts: Vec<_> = self
            .into_posts(page)?
            .into_iter()
            .filter(|p| cursor.map_or(true, |c| p.position > *c))
            .collect();
        let ids: Vec<u64> = posts.iter().map(|p| p.position.0).collect();
        if newest_first_full_page(&ids, limit) {
            tracing::warn!(
                target: "ingest",
                source = %self.source_id,
                limit,
                oldest = ids.last().copied().unwrap_or_default(),
                since = ?cursor.map(|c| c.0),
                "full page returned newest-first; older posts may have been skipped"
            );
        }
        posts.sort_by_key(|p| p.position);
        posts.truncate(limit);

        let next_cursor = posts.last().map(|p| p.position);
        Ok(SourceBatch { posts, next_cursor })
    }

    fn serialize_cursor(&self, cursor: &IdWatermark) -> String {
        cursor.to_string()
    }

    fn deserialize_cursor(&self, raw: &str) -> Result<IdWatermark, FetchError> {
        raw.trim()
            .parse()
            .map(IdWatermark)
            .map_err(|_| self.protocol(format!("invalid id cursor {raw:?}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_usernames_and_accepts_numeric_or_string_ids() {
        let src = HttpJsonSource::new("x", "http://localhost/unused");
        let page: Page = serde_json::from_str(
            r#"{
                "data": [
                    {"id": "12", "text": "hi", "author_id": "u1", "created_at": "2024-05-01T10:00:00Z", "lang": "en"},
                    {"id": 13, "text": "yo", "author_id": "u9"}
                ],
                "includes": {"users": [{"id": "u1", "username": "alice"}]}
            }"#,
        )
        .unwrap();
        let posts = src.into_posts(page).unwrap();
        assert_eq!(posts[0].post.author, "alice");
        assert_eq!(posts[0].post.language.as_deref(), Some("en"));
        assert_eq!(posts[1].post.author, "u9");
        assert_eq!(posts[1].position, IdWatermark(13));
    }

    #[test]
    fn full_descending_page_is_flagged() {
        assert!(newest_first_full_page(&[30, 20, 10], 3));
        assert!(newest_first_full_page(&[40, 30, 20, 10], 3));
        // Oldest-first, or room left on the page: nothing can be missing.
        assert!(!newest_first_full_page(&[10, 20, 30], 3));
        assert!(!newest_first_full_page(&[30, 20], 3));
        assert!(!newest_first_full_page(&[7], 1));
        assert!(!newest_first_full_page(&[], 0));
    }

    #[test]
    fn cursor_parse() {
        let src = HttpJsonSource::new("x", "http://localhost/unused");
        assert_eq!(src.deserialize_cursor("42").unwrap(), IdWatermark(42));
        assert!(matches!(
            src.deserialize_cursor("forty-two"),
            Err(FetchError::Protocol { .. })
        ));
    }
}

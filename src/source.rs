//! External search source client.
//!
//! The engine only depends on the [`TweetSource`] trait: one page of
//! matching tweets per call, with an opaque continuation cursor.
//! [`HttpTweetSource`] is the production implementation over the scraper
//! gateway's JSON API; tests substitute scripted sources.

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

use crate::config::SourceConfig;
use crate::models::{SearchMode, SourceTweet};

/// Errors surfaced by a search source. Categories mirror what the
/// classifier needs to pick a retry policy.
#[derive(Debug, Error)]
pub enum SourceError {
    /// The source is rate limiting us. `retry_after` is the advertised
    /// reset window in seconds, when the source provides one.
    #[error("rate limited by search source")]
    RateLimited { retry_after: Option<u64> },

    #[error("search source rejected credentials: {0}")]
    Unauthorized(String),

    #[error("search source rejected the request: {0}")]
    InvalidRequest(String),

    #[error("search source unavailable (HTTP {status})")]
    ServiceUnavailable { status: u16 },

    #[error("network error talking to search source: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("could not decode search source response: {0}")]
    Decode(String),
}

/// One page of search results.
#[derive(Debug, Clone, Default)]
pub struct SearchPage {
    pub tweets: Vec<SourceTweet>,
    /// Cursor for the next page; `None` when the query is exhausted.
    pub next_cursor: Option<String>,
}

/// A paginated search source. May signal rate limiting at any page.
#[async_trait]
pub trait TweetSource: Send + Sync {
    async fn fetch_page(
        &self,
        query: &str,
        mode: SearchMode,
        cursor: Option<&str>,
        page_size: usize,
    ) -> Result<SearchPage, SourceError>;
}

// ============ HTTP implementation ============

#[derive(Debug, Deserialize)]
struct WireUser {
    id: String,
    screen_name: String,
}

#[derive(Debug, Deserialize)]
struct WireTweet {
    #[serde(default)]
    id: String,
    #[serde(default)]
    text: String,
    user: Option<WireUser>,
    timestamp: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct WirePage {
    #[serde(default)]
    tweets: Vec<WireTweet>,
    next_cursor: Option<String>,
}

/// Search source backed by the HTTP scraper gateway.
pub struct HttpTweetSource {
    client: reqwest::Client,
    base_url: String,
    bearer_token: Option<String>,
}

impl HttpTweetSource {
    pub fn new(config: &SourceConfig) -> Result<Self, SourceError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            bearer_token: config.bearer_token.clone(),
        })
    }
}

#[async_trait]
impl TweetSource for HttpTweetSource {
    async fn fetch_page(
        &self,
        query: &str,
        mode: SearchMode,
        cursor: Option<&str>,
        page_size: usize,
    ) -> Result<SearchPage, SourceError> {
        let url = format!("{}/api/search", self.base_url);

        let mut request = self
            .client
            .get(&url)
            .query(&[("q", query), ("mode", mode.as_str())])
            .query(&[("count", page_size.to_string())]);

        if let Some(c) = cursor {
            request = request.query(&[("cursor", c)]);
        }
        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();

        if status.as_u16() == 429 {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok());
            return Err(SourceError::RateLimited { retry_after });
        }
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(SourceError::Unauthorized(body_excerpt(response).await));
        }
        if status.is_client_error() {
            return Err(SourceError::InvalidRequest(body_excerpt(response).await));
        }
        if status.is_server_error() {
            return Err(SourceError::ServiceUnavailable {
                status: status.as_u16(),
            });
        }

        let page: WirePage = response
            .json()
            .await
            .map_err(|e| SourceError::Decode(e.to_string()))?;

        let tweets = page
            .tweets
            .into_iter()
            .map(|t| SourceTweet {
                id: t.id,
                text: t.text,
                author_id: t.user.as_ref().map(|u| u.id.clone()).unwrap_or_default(),
                author_handle: t
                    .user
                    .as_ref()
                    .map(|u| u.screen_name.clone())
                    .unwrap_or_default(),
                posted_at: t.timestamp,
            })
            .collect();

        Ok(SearchPage {
            tweets,
            next_cursor: page.next_cursor,
        })
    }
}

async fn body_excerpt(response: reqwest::Response) -> String {
    let text = response.text().await.unwrap_or_default();
    text.chars().take(200).collect()
}

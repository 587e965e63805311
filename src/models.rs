//! Core data models used throughout tweetvault.
//!
//! These types represent the tweets, search sessions, and topics that flow
//! through the ingestion pipeline and are persisted to SQLite.

use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Raw tweet yielded by the external search source before storage.
#[derive(Debug, Clone)]
pub struct SourceTweet {
    pub id: String,
    pub text: String,
    pub author_id: String,
    pub author_handle: String,
    /// Posting time as a unix timestamp, when the source provides one.
    pub posted_at: Option<i64>,
}

impl SourceTweet {
    /// The source sometimes yields placeholder entries for deleted or
    /// protected tweets. Those carry no id or body and are skipped
    /// silently by the engine.
    pub fn is_unavailable(&self) -> bool {
        self.id.is_empty() || self.text.is_empty()
    }
}

/// Search mode accepted by the external source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    Latest,
    Top,
}

impl SearchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SearchMode::Latest => "latest",
            SearchMode::Top => "top",
        }
    }
}

impl FromStr for SearchMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "latest" => Ok(SearchMode::Latest),
            "top" => Ok(SearchMode::Top),
            other => Err(format!(
                "unknown search mode: '{}' (expected latest or top)",
                other
            )),
        }
    }
}

impl fmt::Display for SearchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a search session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Pending => "pending",
            SessionStatus::Running => "running",
            SessionStatus::Paused => "paused",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Failed)
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SessionStatus::Pending),
            "running" => Ok(SessionStatus::Running),
            "paused" => Ok(SessionStatus::Paused),
            "completed" => Ok(SessionStatus::Completed),
            "failed" => Ok(SessionStatus::Failed),
            other => Err(format!("unknown session status: '{}'", other)),
        }
    }
}

/// Inclusive date bounds applied to the source query (`since:` / `until:`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateWindow {
    pub since: Option<NaiveDate>,
    pub until: Option<NaiveDate>,
}

impl DateWindow {
    pub fn is_empty(&self) -> bool {
        self.since.is_none() && self.until.is_none()
    }
}

/// Result counters for one session. Monotonically non-decreasing while
/// the session runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    /// Tweets newly stored by this session.
    pub collected: u64,
    /// Tweets yielded by the source and inspected.
    pub examined: u64,
    /// Tweets skipped because they were already stored.
    pub duplicates: u64,
    /// Authoring users created while storing tweets.
    pub users_created: u64,
}

/// One planned-or-executed search run, as persisted in `search_sessions`.
#[derive(Debug, Clone)]
pub struct SearchSession {
    pub id: i64,
    pub topic_id: Option<i64>,
    pub query: String,
    pub variants: Vec<String>,
    pub mode: SearchMode,
    pub max_tweets: u64,
    pub dates: DateWindow,
    /// Opaque pagination token from the source, saved at each checkpoint.
    pub cursor: Option<String>,
    /// Identifier of the last tweet processed before the checkpoint.
    pub last_tweet_id: Option<String>,
    pub stats: SessionStats,
    pub status: SessionStatus,
    pub started_at: i64,
    pub completed_at: Option<i64>,
    pub error_message: Option<String>,
    pub embeddings_generated: bool,
}

/// A named, immutable set of search variants reused across sessions.
#[derive(Debug, Clone)]
pub struct SearchTopic {
    pub id: i64,
    pub name: String,
    pub variants: Vec<String>,
    /// Sum of `collected` across completed sessions linked to this topic.
    pub total_collected: u64,
    pub created_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_mode_round_trip() {
        assert_eq!("latest".parse::<SearchMode>().unwrap(), SearchMode::Latest);
        assert_eq!("top".parse::<SearchMode>().unwrap(), SearchMode::Top);
        assert!("newest".parse::<SearchMode>().is_err());
        assert_eq!(SearchMode::Top.to_string(), "top");
    }

    #[test]
    fn terminal_statuses() {
        assert!(SessionStatus::Completed.is_terminal());
        assert!(SessionStatus::Failed.is_terminal());
        assert!(!SessionStatus::Paused.is_terminal());
        assert!(!SessionStatus::Running.is_terminal());
    }

    #[test]
    fn unavailable_tweets_detected() {
        let t = SourceTweet {
            id: String::new(),
            text: "hello".into(),
            author_id: "1".into(),
            author_handle: "a".into(),
            posted_at: None,
        };
        assert!(t.is_unavailable());
    }
}

//! Tweet record store.
//!
//! Uniqueness constraints in SQLite are the real de-duplication authority;
//! every write here reports "already present" as a normal return value
//! (`InsertOutcome` / `bool`) instead of surfacing a constraint violation,
//! so callers branch on duplicates rather than catching errors.

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;

use crate::models::SourceTweet;

/// Outcome of inserting a tweet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// Another writer (or an earlier page) stored this tweet first.
    AlreadyPresent,
}

/// Persistence port for tweets, their authors, and origin attribution.
#[async_trait]
pub trait TweetStore: Send + Sync {
    /// Whether a tweet with this source identifier is already stored.
    async fn tweet_exists(&self, id: &str) -> Result<bool>;

    /// Create the authoring user if missing. Returns `true` on creation.
    async fn ensure_user(&self, id: &str, handle: &str) -> Result<bool>;

    /// Insert a tweet; a lost race with another writer reports
    /// [`InsertOutcome::AlreadyPresent`], never an error.
    async fn insert_tweet(&self, tweet: &SourceTweet) -> Result<InsertOutcome>;

    /// Attribute a tweet to the session/variant that first discovered it.
    /// Returns `false` when an earlier session already claimed the tweet;
    /// the existing attribution is left untouched.
    async fn record_origin(&self, tweet_id: &str, session_id: i64, variant: &str) -> Result<bool>;
}

/// SQLite-backed record store.
#[derive(Clone)]
pub struct SqliteTweetStore {
    pool: SqlitePool,
}

impl SqliteTweetStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TweetStore for SqliteTweetStore {
    async fn tweet_exists(&self, id: &str) -> Result<bool> {
        let found: Option<String> = sqlx::query_scalar("SELECT id FROM tweets WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(found.is_some())
    }

    async fn ensure_user(&self, id: &str, handle: &str) -> Result<bool> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO users (id, handle, created_at) VALUES (?, ?, ?)",
        )
        .bind(id)
        .bind(handle)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn insert_tweet(&self, tweet: &SourceTweet) -> Result<InsertOutcome> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO tweets (id, user_id, text, posted_at, fetched_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&tweet.id)
        .bind(&tweet.author_id)
        .bind(&tweet.text)
        .bind(tweet.posted_at)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            Ok(InsertOutcome::Inserted)
        } else {
            Ok(InsertOutcome::AlreadyPresent)
        }
    }

    async fn record_origin(&self, tweet_id: &str, session_id: i64, variant: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO tweet_search_origins (tweet_id, session_id, variant, discovered_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(tweet_id)
        .bind(session_id)
        .bind(variant)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}

//! Search session and topic persistence.
//!
//! Sessions are mutated only by the engine that owns them; this module is
//! plain row plumbing. Topics are immutable named variant sets shared
//! across sessions.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use sqlx::{Row, SqlitePool};
use thiserror::Error;

use crate::models::{DateWindow, SearchMode, SearchSession, SearchTopic, SessionStats, SessionStatus};

/// A topic with this name already exists. Variants are immutable, so the
/// caller must pick a new name rather than expect a merge.
#[derive(Debug, Error)]
#[error("search topic '{0}' already exists")]
pub struct TopicConflict(pub String);

/// Configuration for a new session row, written in `running` state.
#[derive(Debug, Clone)]
pub struct NewSession {
    pub topic_id: Option<i64>,
    pub query: String,
    pub variants: Vec<String>,
    pub mode: SearchMode,
    pub max_tweets: u64,
    pub dates: DateWindow,
}

/// Persistence port for session and topic rows.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create_session(&self, new: &NewSession) -> Result<i64>;

    async fn get_session(&self, id: i64) -> Result<Option<SearchSession>>;

    /// Persist current counters plus the resume cursor. Called every N
    /// examined tweets so a crash loses at most one checkpoint interval.
    async fn checkpoint(
        &self,
        id: i64,
        stats: &SessionStats,
        cursor: Option<&str>,
        last_tweet_id: Option<&str>,
    ) -> Result<()>;

    /// Move a session between non-terminal states (resume, pause).
    async fn set_status(&self, id: i64, status: SessionStatus) -> Result<()>;

    /// Write final counters, terminal status, and completion time.
    async fn finalize(
        &self,
        id: i64,
        status: SessionStatus,
        stats: &SessionStats,
        error: Option<&str>,
    ) -> Result<()>;

    async fn mark_embeddings_generated(&self, id: i64) -> Result<()>;

    /// Delete sessions started more than `days` days ago. Returns the
    /// number deleted.
    async fn delete_older_than(&self, days: u32) -> Result<u64>;

    async fn get_topic_by_name(&self, name: &str) -> Result<Option<SearchTopic>>;

    /// Create a topic; a second topic with the same name is a
    /// [`TopicConflict`], not a silent merge.
    async fn create_topic(&self, name: &str, variants: &[String]) -> Result<SearchTopic>;

    async fn add_topic_collected(&self, topic_id: i64, collected: u64) -> Result<()>;
}

#[derive(Clone)]
pub struct SqliteSessionStore {
    pool: SqlitePool,
}

impl SqliteSessionStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn date_to_text(date: Option<NaiveDate>) -> Option<String> {
    date.map(|d| d.format("%Y-%m-%d").to_string())
}

fn text_to_date(text: Option<String>) -> Option<NaiveDate> {
    text.and_then(|t| NaiveDate::parse_from_str(&t, "%Y-%m-%d").ok())
}

fn row_to_session(row: &sqlx::sqlite::SqliteRow) -> Result<SearchSession> {
    let variants_json: String = row.get("variants");
    let variants: Vec<String> = serde_json::from_str(&variants_json)?;
    let mode: String = row.get("mode");
    let status: String = row.get("status");

    Ok(SearchSession {
        id: row.get("id"),
        topic_id: row.get("topic_id"),
        query: row.get("query"),
        variants,
        mode: mode.parse().map_err(anyhow::Error::msg)?,
        max_tweets: row.get::<i64, _>("max_tweets") as u64,
        dates: DateWindow {
            since: text_to_date(row.get("since_date")),
            until: text_to_date(row.get("until_date")),
        },
        cursor: row.get("cursor"),
        last_tweet_id: row.get("last_tweet_id"),
        stats: SessionStats {
            collected: row.get::<i64, _>("collected") as u64,
            examined: row.get::<i64, _>("examined") as u64,
            duplicates: row.get::<i64, _>("duplicates") as u64,
            users_created: row.get::<i64, _>("users_created") as u64,
        },
        status: status.parse().map_err(anyhow::Error::msg)?,
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
        error_message: row.get("error_message"),
        embeddings_generated: row.get::<i64, _>("embeddings_generated") != 0,
    })
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn create_session(&self, new: &NewSession) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO search_sessions
                (topic_id, query, variants, mode, max_tweets, since_date, until_date,
                 status, started_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(new.topic_id)
        .bind(&new.query)
        .bind(serde_json::to_string(&new.variants)?)
        .bind(new.mode.as_str())
        .bind(new.max_tweets as i64)
        .bind(date_to_text(new.dates.since))
        .bind(date_to_text(new.dates.until))
        .bind(SessionStatus::Running.as_str())
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    async fn get_session(&self, id: i64) -> Result<Option<SearchSession>> {
        let row = sqlx::query("SELECT * FROM search_sessions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_session).transpose()
    }

    async fn checkpoint(
        &self,
        id: i64,
        stats: &SessionStats,
        cursor: Option<&str>,
        last_tweet_id: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE search_sessions
            SET collected = ?, examined = ?, duplicates = ?, users_created = ?,
                cursor = COALESCE(?, cursor),
                last_tweet_id = COALESCE(?, last_tweet_id)
            WHERE id = ?
            "#,
        )
        .bind(stats.collected as i64)
        .bind(stats.examined as i64)
        .bind(stats.duplicates as i64)
        .bind(stats.users_created as i64)
        .bind(cursor)
        .bind(last_tweet_id)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn set_status(&self, id: i64, status: SessionStatus) -> Result<()> {
        sqlx::query("UPDATE search_sessions SET status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn finalize(
        &self,
        id: i64,
        status: SessionStatus,
        stats: &SessionStats,
        error: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE search_sessions
            SET status = ?, collected = ?, examined = ?, duplicates = ?, users_created = ?,
                completed_at = ?, error_message = ?
            WHERE id = ?
            "#,
        )
        .bind(status.as_str())
        .bind(stats.collected as i64)
        .bind(stats.examined as i64)
        .bind(stats.duplicates as i64)
        .bind(stats.users_created as i64)
        .bind(Utc::now().timestamp())
        .bind(error)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn mark_embeddings_generated(&self, id: i64) -> Result<()> {
        sqlx::query("UPDATE search_sessions SET embeddings_generated = 1 WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_older_than(&self, days: u32) -> Result<u64> {
        let cutoff = Utc::now().timestamp() - i64::from(days) * 86_400;
        let result = sqlx::query("DELETE FROM search_sessions WHERE started_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn get_topic_by_name(&self, name: &str) -> Result<Option<SearchTopic>> {
        let row = sqlx::query("SELECT * FROM search_topics WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let variants_json: String = row.get("variants");
                Ok(Some(SearchTopic {
                    id: row.get("id"),
                    name: row.get("name"),
                    variants: serde_json::from_str(&variants_json)?,
                    total_collected: row.get::<i64, _>("total_collected") as u64,
                    created_at: row.get("created_at"),
                }))
            }
            None => Ok(None),
        }
    }

    async fn create_topic(&self, name: &str, variants: &[String]) -> Result<SearchTopic> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO search_topics (name, variants, created_at) VALUES (?, ?, ?)",
        )
        .bind(name)
        .bind(serde_json::to_string(variants)?)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(TopicConflict(name.to_string()).into());
        }

        self.get_topic_by_name(name)
            .await?
            .ok_or_else(|| anyhow::anyhow!("topic '{}' missing after insert", name))
    }

    async fn add_topic_collected(&self, topic_id: i64, collected: u64) -> Result<()> {
        sqlx::query("UPDATE search_topics SET total_collected = total_collected + ? WHERE id = ?")
            .bind(collected as i64)
            .bind(topic_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::migrate;

    async fn test_store() -> SqliteSessionStore {
        let pool = db::connect_memory().await.unwrap();
        migrate::apply_schema(&pool).await.unwrap();
        SqliteSessionStore::new(pool)
    }

    fn new_session() -> NewSession {
        NewSession {
            topic_id: None,
            query: "\"AGI\" -filter:retweets".to_string(),
            variants: vec!["AGI".to_string(), "GPT-5".to_string()],
            mode: SearchMode::Latest,
            max_tweets: 100,
            dates: DateWindow::default(),
        }
    }

    #[tokio::test]
    async fn session_round_trip() {
        let store = test_store().await;
        let id = store.create_session(&new_session()).await.unwrap();

        let session = store.get_session(id).await.unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Running);
        assert_eq!(session.variants, vec!["AGI", "GPT-5"]);
        assert_eq!(session.max_tweets, 100);
        assert!(session.cursor.is_none());
        assert!(store.get_session(id + 99).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn checkpoint_saves_cursor_and_counts() {
        let store = test_store().await;
        let id = store.create_session(&new_session()).await.unwrap();

        let stats = SessionStats {
            collected: 3,
            examined: 10,
            duplicates: 2,
            users_created: 1,
        };
        store
            .checkpoint(id, &stats, Some("cursor-abc"), Some("12345"))
            .await
            .unwrap();

        let session = store.get_session(id).await.unwrap().unwrap();
        assert_eq!(session.stats, stats);
        assert_eq!(session.cursor.as_deref(), Some("cursor-abc"));
        assert_eq!(session.last_tweet_id.as_deref(), Some("12345"));

        // A checkpoint without a fresh cursor keeps the previous one.
        store.checkpoint(id, &stats, None, None).await.unwrap();
        let session = store.get_session(id).await.unwrap().unwrap();
        assert_eq!(session.cursor.as_deref(), Some("cursor-abc"));
    }

    #[tokio::test]
    async fn finalize_sets_terminal_state() {
        let store = test_store().await;
        let id = store.create_session(&new_session()).await.unwrap();

        let stats = SessionStats {
            collected: 5,
            examined: 7,
            duplicates: 2,
            users_created: 4,
        };
        store
            .finalize(id, SessionStatus::Completed, &stats, None)
            .await
            .unwrap();

        let session = store.get_session(id).await.unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Completed);
        assert!(session.completed_at.is_some());
        assert_eq!(session.stats.collected, 5);
    }

    #[tokio::test]
    async fn cleanup_deletes_only_old_sessions() {
        let store = test_store().await;
        let old_id = store.create_session(&new_session()).await.unwrap();
        let new_id = store.create_session(&new_session()).await.unwrap();

        // Backdate one session by 10 days.
        let old_start = Utc::now().timestamp() - 10 * 86_400;
        sqlx::query("UPDATE search_sessions SET started_at = ? WHERE id = ?")
            .bind(old_start)
            .bind(old_id)
            .execute(&store.pool)
            .await
            .unwrap();

        let deleted = store.delete_older_than(7).await.unwrap();
        assert_eq!(deleted, 1);
        assert!(store.get_session(old_id).await.unwrap().is_none());
        assert!(store.get_session(new_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn duplicate_topic_name_is_a_conflict() {
        let store = test_store().await;
        let variants = vec!["AGI".to_string()];

        let topic = store.create_topic("ai-watch", &variants).await.unwrap();
        assert_eq!(topic.name, "ai-watch");

        let err = store.create_topic("ai-watch", &variants).await.unwrap_err();
        assert!(err.downcast_ref::<TopicConflict>().is_some());
    }

    #[tokio::test]
    async fn topic_total_accumulates() {
        let store = test_store().await;
        let topic = store
            .create_topic("ai-watch", &["AGI".to_string()])
            .await
            .unwrap();

        store.add_topic_collected(topic.id, 3).await.unwrap();
        store.add_topic_collected(topic.id, 4).await.unwrap();

        let topic = store.get_topic_by_name("ai-watch").await.unwrap().unwrap();
        assert_eq!(topic.total_collected, 7);
    }
}

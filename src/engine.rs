//! Search session engine.
//!
//! Orchestrates one search session end-to-end: builds and splits the
//! source queries, drives the paginated source, deduplicates against the
//! tweet store, attributes each new tweet to the variant that found it,
//! checkpoints a resume cursor, and rides out rate limits. Sessions are
//! resumable after interruption without reprocessing stored tweets.
//!
//! The engine is generic over its collaborators (pattern borrowed from
//! service layers built on storage/provider ports) so tests run it
//! against scripted sources and in-memory SQLite.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Serialize;
use tracing::{info, warn};

use crate::classify::{backoff_delay, classify, ErrorCategory};
use crate::config::EngineConfig;
use crate::embedder::Embedder;
use crate::jobs::JobContext;
use crate::models::{DateWindow, SearchMode, SessionStats, SessionStatus, SourceTweet};
use crate::progress::{SearchEvent, SearchProgressReporter};
use crate::query;
use crate::sessions::{NewSession, SessionStore};
use crate::source::TweetSource;
use crate::store::{InsertOutcome, TweetStore};

/// Parameters for starting a new search session.
#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub variants: Vec<String>,
    pub topic_name: Option<String>,
    pub max_tweets: u64,
    pub mode: SearchMode,
    pub dates: DateWindow,
    pub embed: bool,
}

/// Final state of a session run, returned to the CLI/server caller.
#[derive(Debug, Clone, Serialize)]
pub struct SearchOutcome {
    pub session_id: i64,
    pub status: SessionStatus,
    pub stats: SessionStats,
    pub queries: Vec<String>,
}

enum RunEnd {
    TargetReached,
    Exhausted,
    Cancelled,
}

struct RunState {
    stats: SessionStats,
    /// Cumulative target: stop once `stats.collected` reaches it.
    target: u64,
    last_tweet_id: Option<String>,
    /// Cursor carried into the first sub-query on resume.
    initial_cursor: Option<String>,
    /// Resume floor: yielded tweets with id lexically <= this are
    /// discarded before any counting.
    floor: Option<String>,
    since_checkpoint: u64,
}

pub struct SearchEngine<Src, Rec, Ses>
where
    Src: TweetSource,
    Rec: TweetStore,
    Ses: SessionStore,
{
    source: Src,
    records: Rec,
    sessions: Ses,
    embedder: Box<dyn Embedder>,
    config: EngineConfig,
    page_size: usize,
}

impl<Src, Rec, Ses> SearchEngine<Src, Rec, Ses>
where
    Src: TweetSource,
    Rec: TweetStore,
    Ses: SessionStore,
{
    pub fn new(
        source: Src,
        records: Rec,
        sessions: Ses,
        embedder: Box<dyn Embedder>,
        config: EngineConfig,
        page_size: usize,
    ) -> Self {
        Self {
            source,
            records,
            sessions,
            embedder,
            config,
            page_size,
        }
    }

    /// Start a fresh session and run it to a terminal state (or pause it
    /// on cooperative cancellation).
    pub async fn start_search(
        &self,
        request: SearchRequest,
        job: Option<&JobContext>,
        reporter: &dyn SearchProgressReporter,
    ) -> Result<SearchOutcome> {
        if request.variants.is_empty() {
            bail!("at least one search variant is required");
        }
        if request.max_tweets == 0 {
            bail!("target tweet count must be greater than zero");
        }

        let topic_id = match &request.topic_name {
            Some(name) => Some(self.resolve_topic(name, &request.variants).await?),
            None => None,
        };

        let groups = query::split_query(&request.variants, self.config.max_query_length);
        let composed = query::build_query(&request.variants, Some(&request.dates));

        let session_id = self
            .sessions
            .create_session(&NewSession {
                topic_id,
                query: composed,
                variants: request.variants.clone(),
                mode: request.mode,
                max_tweets: request.max_tweets,
                dates: request.dates,
            })
            .await?;

        let state = RunState {
            stats: SessionStats::default(),
            target: request.max_tweets,
            last_tweet_id: None,
            initial_cursor: None,
            floor: None,
            since_checkpoint: 0,
        };

        self.execute(
            session_id,
            topic_id,
            groups,
            request.variants,
            request.dates,
            request.mode,
            request.embed,
            state,
            job,
            reporter,
        )
        .await
    }

    /// Resume an interrupted session from its saved cursor.
    pub async fn resume_search(
        &self,
        session_id: i64,
        embed: bool,
        job: Option<&JobContext>,
        reporter: &dyn SearchProgressReporter,
    ) -> Result<SearchOutcome> {
        let session = self
            .sessions
            .get_session(session_id)
            .await?
            .with_context(|| format!("search session {} not found", session_id))?;

        if session.status == SessionStatus::Completed {
            bail!("search session {} is already completed", session_id);
        }
        if session.cursor.is_none() && session.last_tweet_id.is_none() {
            bail!(
                "search session {} has no saved cursor to resume from",
                session_id
            );
        }

        self.sessions
            .set_status(session_id, SessionStatus::Running)
            .await?;

        // Splitting is deterministic for the persisted variants, so the
        // resumed run re-executes the same sub-query sequence.
        let groups = query::split_query(&session.variants, self.config.max_query_length);

        let state = RunState {
            stats: session.stats,
            target: session.max_tweets,
            last_tweet_id: session.last_tweet_id.clone(),
            initial_cursor: session.cursor.clone(),
            floor: session.last_tweet_id.clone(),
            since_checkpoint: 0,
        };

        self.execute(
            session_id,
            session.topic_id,
            groups,
            session.variants.clone(),
            session.dates,
            session.mode,
            embed,
            state,
            job,
            reporter,
        )
        .await
    }

    /// Delete sessions started more than `days` days ago.
    pub async fn cleanup(&self, days: u32) -> Result<u64> {
        self.sessions.delete_older_than(days).await
    }

    async fn resolve_topic(&self, name: &str, variants: &[String]) -> Result<i64> {
        match self.sessions.get_topic_by_name(name).await? {
            Some(topic) => {
                // Topics are immutable: reuse only on an exact variant
                // match, otherwise the caller needs a new name.
                if topic.variants != variants {
                    bail!(
                        "search topic '{}' already exists with different variants; \
                         pick a new name to change variants",
                        name
                    );
                }
                Ok(topic.id)
            }
            None => Ok(self.sessions.create_topic(name, variants).await?.id),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute(
        &self,
        session_id: i64,
        topic_id: Option<i64>,
        groups: Vec<Vec<String>>,
        variants: Vec<String>,
        dates: DateWindow,
        mode: SearchMode,
        embed: bool,
        mut state: RunState,
        job: Option<&JobContext>,
        reporter: &dyn SearchProgressReporter,
    ) -> Result<SearchOutcome> {
        let collected_before = state.stats.collected;
        let queries: Vec<String> = groups
            .iter()
            .map(|g| query::build_query(g, Some(&dates)))
            .collect();

        let end = self
            .run_groups(session_id, &groups, &variants, &dates, mode, &mut state, job, reporter)
            .await;

        match end {
            Ok(RunEnd::Cancelled) => {
                // Leave the session resumable; the job itself was
                // already marked cancelled by the tracking service.
                self.sessions
                    .checkpoint(
                        session_id,
                        &state.stats,
                        None,
                        state.last_tweet_id.as_deref(),
                    )
                    .await?;
                self.sessions
                    .set_status(session_id, SessionStatus::Paused)
                    .await?;
                info!(session = session_id, "search session paused by cancellation");

                Ok(SearchOutcome {
                    session_id,
                    status: SessionStatus::Paused,
                    stats: state.stats,
                    queries,
                })
            }
            Ok(RunEnd::TargetReached) | Ok(RunEnd::Exhausted) => {
                // Exhausting every sub-query short of the target is a
                // normal, possibly-empty completion.
                self.sessions
                    .finalize(session_id, SessionStatus::Completed, &state.stats, None)
                    .await?;

                let newly_collected = state.stats.collected - collected_before;
                if let Some(topic_id) = topic_id {
                    self.sessions
                        .add_topic_collected(topic_id, newly_collected)
                        .await?;
                }

                if embed && newly_collected > 0 {
                    match self.embedder.embed_session(session_id).await {
                        Ok(()) => {
                            self.sessions.mark_embeddings_generated(session_id).await?;
                        }
                        Err(e) => {
                            warn!(session = session_id, error = %e, "embedding step failed");
                        }
                    }
                }

                Ok(SearchOutcome {
                    session_id,
                    status: SessionStatus::Completed,
                    stats: state.stats,
                    queries,
                })
            }
            Err(e) => {
                self.sessions
                    .finalize(
                        session_id,
                        SessionStatus::Failed,
                        &state.stats,
                        Some(&e.to_string()),
                    )
                    .await?;
                Err(e)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_groups(
        &self,
        session_id: i64,
        groups: &[Vec<String>],
        variants: &[String],
        dates: &DateWindow,
        mode: SearchMode,
        state: &mut RunState,
        job: Option<&JobContext>,
        reporter: &dyn SearchProgressReporter,
    ) -> Result<RunEnd> {
        if state.stats.collected >= state.target {
            return Ok(RunEnd::TargetReached);
        }

        for (index, group) in groups.iter().enumerate() {
            reporter.report(SearchEvent::SubQuery {
                index: index + 1,
                total: groups.len(),
            });

            let sub_query = query::build_query(group, Some(dates));
            // The saved cursor belongs to the sub-query that was running
            // at interruption; later groups always start fresh and rely
            // on the resume floor plus duplicate detection.
            let mut cursor = if index == 0 {
                state.initial_cursor.take()
            } else {
                None
            };
            let mut attempts: u32 = 0;
            let mut rate_limit_waits: u32 = 0;

            loop {
                if is_cancelled(job) {
                    return Ok(RunEnd::Cancelled);
                }

                let page = match self
                    .source
                    .fetch_page(&sub_query, mode, cursor.as_deref(), self.page_size)
                    .await
                {
                    Ok(page) => {
                        attempts = 0;
                        rate_limit_waits = 0;
                        page
                    }
                    Err(e) => {
                        let err = anyhow::Error::new(e);
                        let classification = classify(&err);

                        if !classification.retryable {
                            return Err(err.context("search source rejected the sub-query"));
                        }

                        if classification.category == ErrorCategory::RateLimit {
                            // Rate-limit waits are normal operation and get
                            // their own, larger budget than transient
                            // failures — but not an unbounded one, or a
                            // permanently throttled source would spin the
                            // session forever.
                            if rate_limit_waits >= self.config.max_rate_limit_waits {
                                return Err(err.context(format!(
                                    "sub-query still rate limited after {} waits",
                                    rate_limit_waits
                                )));
                            }
                            let delay = classification
                                .suggested_delay
                                .min(Duration::from_secs(self.config.max_backoff_secs));
                            reporter.report(SearchEvent::RateLimitWait {
                                seconds: delay.as_secs(),
                            });
                            info!(
                                session = session_id,
                                wait_secs = delay.as_secs(),
                                "rate limited; retrying the same sub-query"
                            );
                            rate_limit_waits += 1;
                            tokio::time::sleep(delay).await;
                            continue;
                        }

                        if attempts >= self.config.max_retries {
                            return Err(err.context(format!(
                                "sub-query failed after {} retries",
                                attempts
                            )));
                        }

                        let delay = backoff_delay(
                            classification.suggested_delay,
                            attempts,
                            Duration::from_secs(self.config.max_backoff_secs),
                        );
                        warn!(
                            session = session_id,
                            category = classification.category.as_str(),
                            error = %err,
                            "sub-query fetch failed; backing off"
                        );

                        attempts += 1;
                        tokio::time::sleep(delay).await;
                        // Retry from where the iterator left off.
                        continue;
                    }
                };

                for tweet in &page.tweets {
                    if is_cancelled(job) {
                        return Ok(RunEnd::Cancelled);
                    }

                    // Resume floor: already processed in a previous run.
                    // Assumes source iteration order is consistent with
                    // lexical id order; unverified against the live
                    // source (see DESIGN notes).
                    if let Some(floor) = &state.floor {
                        if tweet.id.as_str() <= floor.as_str() {
                            continue;
                        }
                    }

                    state.stats.examined += 1;
                    state.since_checkpoint += 1;

                    self.push_progress(state, job, reporter).await;

                    if !tweet.is_unavailable() {
                        // Resume anchor: the last identifiable item we
                        // looked at, whether or not it was collected.
                        state.last_tweet_id = Some(tweet.id.clone());

                        if let Err(e) = self.process_tweet(session_id, tweet, variants, state).await
                        {
                            // One bad tweet never aborts the session.
                            warn!(
                                session = session_id,
                                tweet = %tweet.id,
                                error = %e,
                                "failed to store tweet; continuing"
                            );
                        }
                    }

                    if state.since_checkpoint >= self.config.checkpoint_interval {
                        state.since_checkpoint = 0;
                        self.sessions
                            .checkpoint(
                                session_id,
                                &state.stats,
                                cursor.as_deref(),
                                state.last_tweet_id.as_deref(),
                            )
                            .await?;
                    }

                    if state.stats.collected >= state.target {
                        self.sessions
                            .checkpoint(
                                session_id,
                                &state.stats,
                                page.next_cursor.as_deref(),
                                state.last_tweet_id.as_deref(),
                            )
                            .await?;
                        return Ok(RunEnd::TargetReached);
                    }
                }

                match page.next_cursor {
                    Some(next) => cursor = Some(next),
                    None => break,
                }
            }
        }

        Ok(RunEnd::Exhausted)
    }

    /// Steps 3-7 of the per-tweet pipeline: dedup, author creation,
    /// insert, first-origin attribution, count.
    async fn process_tweet(
        &self,
        session_id: i64,
        tweet: &SourceTweet,
        variants: &[String],
        state: &mut RunState,
    ) -> Result<()> {
        if self.records.tweet_exists(&tweet.id).await? {
            state.stats.duplicates += 1;
            return Ok(());
        }

        if self
            .records
            .ensure_user(&tweet.author_id, &tweet.author_handle)
            .await?
        {
            state.stats.users_created += 1;
        }

        // A lost insert race is a duplicate, not a failure.
        if self.records.insert_tweet(tweet).await? == InsertOutcome::AlreadyPresent {
            state.stats.duplicates += 1;
            return Ok(());
        }

        let variant = query::match_variant(&tweet.text, variants)
            .unwrap_or_else(|| variants[0].as_str());
        // First discovery wins; a false return means another session
        // already owns the attribution, which doesn't affect our counts.
        self.records
            .record_origin(&tweet.id, session_id, variant)
            .await?;

        state.stats.collected += 1;
        Ok(())
    }

    async fn push_progress(
        &self,
        state: &RunState,
        job: Option<&JobContext>,
        reporter: &dyn SearchProgressReporter,
    ) {
        reporter.report(SearchEvent::Progress {
            stats: state.stats,
            target: state.target,
        });
        if let Some(job) = job {
            job.progress(
                state.stats.collected,
                state.target,
                &format!(
                    "collected {}/{} (examined {})",
                    state.stats.collected, state.target, state.stats.examined
                ),
            )
            .await;
        }
    }
}

fn is_cancelled(job: Option<&JobContext>) -> bool {
    job.map(|j| j.is_cancelled()).unwrap_or(false)
}

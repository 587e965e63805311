//! Background job tracking.
//!
//! An in-process registry of running and recently finished jobs. The
//! in-memory map is authoritative for liveness and ordering; the `jobs`
//! table is a best-effort write-behind log used only for crash recovery
//! and audit, never read back during normal operation. Subscribers get a
//! full snapshot on every mutation, in the order the mutations happened.
//!
//! Cancellation is cooperative: the service signals a token, the running
//! operation polls it at safe points (the engine checks before each
//! tweet). Nothing here can interrupt in-flight work.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use tokio::sync::{broadcast, OnceCell};
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// How long a terminal job stays in memory for late observers.
pub const COMPLETED_JOB_GRACE: Duration = Duration::from_secs(30);

/// A persisted job still `running` after this long is proof the process
/// died mid-operation; `initialize` marks it failed.
pub const STALE_JOB_SECS: i64 = 3_600;

/// Persisted job rows older than this are purged on startup.
pub const JOB_RETENTION_SECS: i64 = 86_400;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Running)
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(format!("unknown job status: '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct JobProgress {
    pub current: u64,
    pub total: u64,
    pub message: String,
}

/// One running-or-recently-finished operation.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: String,
    pub kind: String,
    pub status: JobStatus,
    pub progress: JobProgress,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    pub started_at: i64,
    pub completed_at: Option<i64>,
    pub error_message: Option<String>,
}

/// Write-behind persistence port for job rows.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn upsert(&self, job: &Job) -> Result<()>;

    /// Mark rows still `running` but started before `cutoff` as failed.
    async fn fail_stale_running(&self, cutoff: i64) -> Result<u64>;

    async fn purge_older_than(&self, cutoff: i64) -> Result<u64>;

    async fn load_recent(&self, limit: i64) -> Result<Vec<Job>>;
}

struct JobEntry {
    job: Job,
    token: CancellationToken,
}

/// Handle given to the executing operation: progress sink plus the
/// cancellation check. The token is read-only here; only the service
/// signals it.
#[derive(Clone)]
pub struct JobContext {
    id: String,
    token: CancellationToken,
    service: Arc<JobTrackingService>,
}

impl JobContext {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn progress(&self, current: u64, total: u64, message: &str) {
        self.service
            .update_progress(&self.id, current, total, message)
            .await;
    }
}

/// In-process job registry. Construct one instance per process (or per
/// test) and share it via `Arc`; there is no global.
pub struct JobTrackingService {
    jobs: Mutex<HashMap<String, JobEntry>>,
    store: Arc<dyn JobStore>,
    events: broadcast::Sender<Vec<Job>>,
    init: OnceCell<()>,
    grace: Duration,
}

impl JobTrackingService {
    pub fn new(store: Arc<dyn JobStore>) -> Arc<Self> {
        Self::with_grace(store, COMPLETED_JOB_GRACE)
    }

    /// Like [`new`](Self::new) with a custom post-terminal retention
    /// window. Tests shrink it to avoid waiting 30s.
    pub fn with_grace(store: Arc<dyn JobStore>, grace: Duration) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            jobs: Mutex::new(HashMap::new()),
            store,
            events,
            init: OnceCell::new(),
            grace,
        })
    }

    /// Recover from a previous crash and preload recent jobs.
    ///
    /// Idempotent; concurrent callers await the same in-flight run.
    pub async fn initialize(self: &Arc<Self>) -> Result<()> {
        self.init
            .get_or_try_init(|| async {
                let now = Utc::now().timestamp();

                let failed = self.store.fail_stale_running(now - STALE_JOB_SECS).await?;
                if failed > 0 {
                    warn!(failed, "marked stale running jobs as failed");
                }

                self.store.purge_older_than(now - JOB_RETENTION_SECS).await?;

                // Recent rows become visible immediately; they are all
                // terminal (anything still running either just failed
                // above or belongs to this process and is already in
                // the map).
                let recent = self.store.load_recent(50).await?;
                let mut preloaded = Vec::new();
                {
                    let mut jobs = self.lock_jobs();
                    for job in recent {
                        if jobs.contains_key(&job.id) {
                            continue;
                        }
                        if job.status.is_terminal() {
                            preloaded.push(job.id.clone());
                        }
                        jobs.insert(
                            job.id.clone(),
                            JobEntry {
                                job,
                                token: CancellationToken::new(),
                            },
                        );
                    }
                }

                // Preloaded terminal rows get the same grace window as
                // live completions instead of lingering until restart.
                for id in preloaded {
                    self.schedule_eviction(id);
                }

                Ok::<(), anyhow::Error>(())
            })
            .await?;
        Ok(())
    }

    /// Register a new job and return the context handed to the operation.
    pub async fn create_job(
        self: &Arc<Self>,
        kind: &str,
        metadata: Option<serde_json::Value>,
    ) -> JobContext {
        let token = CancellationToken::new();
        let job = {
            let mut jobs = self.lock_jobs();

            // Id derives from type + creation time; disambiguate the
            // rare same-millisecond collision.
            let mut id = format!("{}-{}", kind, Utc::now().timestamp_millis());
            while jobs.contains_key(&id) {
                id.push('x');
            }

            let job = Job {
                id: id.clone(),
                kind: kind.to_string(),
                status: JobStatus::Running,
                progress: JobProgress::default(),
                metadata,
                started_at: Utc::now().timestamp(),
                completed_at: None,
                error_message: None,
            };
            jobs.insert(
                id,
                JobEntry {
                    job: job.clone(),
                    token: token.clone(),
                },
            );
            job
        };

        self.persist(&job).await;
        self.notify();

        JobContext {
            id: job.id,
            token,
            service: Arc::clone(self),
        }
    }

    /// Update a job's progress. Persistence failures are logged, never
    /// surfaced: the in-memory record is authoritative for liveness.
    pub async fn update_progress(&self, id: &str, current: u64, total: u64, message: &str) {
        let updated = {
            let mut jobs = self.lock_jobs();
            jobs.get_mut(id).map(|entry| {
                entry.job.progress = JobProgress {
                    current,
                    total,
                    message: message.to_string(),
                };
                entry.job.clone()
            })
        };

        if let Some(job) = updated {
            self.persist(&job).await;
            self.notify();
        }
    }

    /// Transition a job to `completed` or `failed` and schedule its
    /// eviction after the grace window.
    pub async fn complete_job(self: &Arc<Self>, id: &str, success: bool, error: Option<String>) {
        let completed = {
            let mut jobs = self.lock_jobs();
            jobs.get_mut(id)
                .filter(|entry| entry.job.status == JobStatus::Running)
                .map(|entry| {
                    entry.job.status = if success {
                        JobStatus::Completed
                    } else {
                        JobStatus::Failed
                    };
                    entry.job.completed_at = Some(Utc::now().timestamp());
                    entry.job.error_message = error;
                    entry.token.cancel();
                    entry.job.clone()
                })
        };

        if let Some(job) = completed {
            self.persist(&job).await;
            self.notify();
            self.schedule_eviction(id.to_string());
        }
    }

    /// Request cancellation of a running job. Returns `false` when the
    /// job is absent or not running, leaving state untouched.
    pub async fn cancel_job(self: &Arc<Self>, id: &str) -> bool {
        let cancelled = {
            let mut jobs = self.lock_jobs();
            match jobs.get_mut(id) {
                Some(entry) if entry.job.status == JobStatus::Running => {
                    entry.token.cancel();
                    entry.job.status = JobStatus::Cancelled;
                    entry.job.completed_at = Some(Utc::now().timestamp());
                    Some(entry.job.clone())
                }
                _ => None,
            }
        };

        match cancelled {
            Some(job) => {
                self.persist(&job).await;
                self.notify();
                self.schedule_eviction(id.to_string());
                true
            }
            None => false,
        }
    }

    pub fn get_job(&self, id: &str) -> Option<Job> {
        self.lock_jobs().get(id).map(|e| e.job.clone())
    }

    pub fn get_active_jobs(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self
            .lock_jobs()
            .values()
            .filter(|e| e.job.status == JobStatus::Running)
            .map(|e| e.job.clone())
            .collect();
        jobs.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        jobs
    }

    pub fn get_all_jobs(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.lock_jobs().values().map(|e| e.job.clone()).collect();
        jobs.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        jobs
    }

    /// Subscribe to snapshots; one full snapshot per mutation, in the
    /// order the mutations were applied.
    pub fn subscribe(&self) -> broadcast::Receiver<Vec<Job>> {
        self.events.subscribe()
    }

    fn schedule_eviction(self: &Arc<Self>, id: String) {
        let service = Arc::clone(self);
        let grace = self.grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let evicted = {
                let mut jobs = service.lock_jobs();
                match jobs.get(&id) {
                    Some(entry) if entry.job.status.is_terminal() => jobs.remove(&id).is_some(),
                    _ => false,
                }
            };
            if evicted {
                service.notify();
            }
        });
    }

    async fn persist(&self, job: &Job) {
        if let Err(e) = self.store.upsert(job).await {
            warn!(job = %job.id, error = %e, "job persistence failed; in-memory state kept");
        }
    }

    fn notify(&self) {
        // No receivers is fine.
        let _ = self.events.send(self.get_all_jobs());
    }

    fn lock_jobs(&self) -> std::sync::MutexGuard<'_, HashMap<String, JobEntry>> {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// ============ SQLite persistence ============

#[derive(Clone)]
pub struct SqliteJobStore {
    pool: SqlitePool,
}

impl SqliteJobStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn upsert(&self, job: &Job) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO jobs
                (id, kind, status, progress_current, progress_total, progress_message,
                 metadata, started_at, completed_at, error_message)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                progress_current = excluded.progress_current,
                progress_total = excluded.progress_total,
                progress_message = excluded.progress_message,
                completed_at = excluded.completed_at,
                error_message = excluded.error_message
            "#,
        )
        .bind(&job.id)
        .bind(&job.kind)
        .bind(job.status.as_str())
        .bind(job.progress.current as i64)
        .bind(job.progress.total as i64)
        .bind(&job.progress.message)
        .bind(job.metadata.as_ref().map(|m| m.to_string()))
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(&job.error_message)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn fail_stale_running(&self, cutoff: i64) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'failed',
                completed_at = ?,
                error_message = 'process restarted while job was running'
            WHERE status = 'running' AND started_at < ?
            "#,
        )
        .bind(Utc::now().timestamp())
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn purge_older_than(&self, cutoff: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM jobs WHERE started_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn load_recent(&self, limit: i64) -> Result<Vec<Job>> {
        let rows = sqlx::query("SELECT * FROM jobs ORDER BY started_at DESC LIMIT ?")
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        let mut jobs = Vec::with_capacity(rows.len());
        for row in rows {
            let status: String = row.get("status");
            let metadata: Option<String> = row.get("metadata");
            jobs.push(Job {
                id: row.get("id"),
                kind: row.get("kind"),
                status: status.parse().map_err(anyhow::Error::msg)?,
                progress: JobProgress {
                    current: row.get::<i64, _>("progress_current") as u64,
                    total: row.get::<i64, _>("progress_total") as u64,
                    message: row
                        .get::<Option<String>, _>("progress_message")
                        .unwrap_or_default(),
                },
                metadata: metadata.and_then(|m| serde_json::from_str(&m).ok()),
                started_at: row.get("started_at"),
                completed_at: row.get("completed_at"),
                error_message: row.get("error_message"),
            });
        }
        Ok(jobs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::migrate;

    /// In-memory store for unit tests that don't care about rows.
    struct MemoryJobStore {
        rows: Mutex<HashMap<String, Job>>,
    }

    impl MemoryJobStore {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                rows: Mutex::new(HashMap::new()),
            })
        }
    }

    #[async_trait]
    impl JobStore for MemoryJobStore {
        async fn upsert(&self, job: &Job) -> Result<()> {
            self.rows
                .lock()
                .unwrap()
                .insert(job.id.clone(), job.clone());
            Ok(())
        }

        async fn fail_stale_running(&self, _cutoff: i64) -> Result<u64> {
            Ok(0)
        }

        async fn purge_older_than(&self, _cutoff: i64) -> Result<u64> {
            Ok(0)
        }

        async fn load_recent(&self, _limit: i64) -> Result<Vec<Job>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn job_lifecycle_reaches_completed() {
        let service = JobTrackingService::new(MemoryJobStore::new());
        let ctx = service.create_job("search", None).await;

        ctx.progress(3, 10, "collecting").await;
        let job = service.get_job(ctx.id()).unwrap();
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.progress.current, 3);
        assert_eq!(job.progress.message, "collecting");

        service.complete_job(ctx.id(), true, None).await;
        let job = service.get_job(ctx.id()).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.completed_at.is_some());
    }

    #[tokio::test]
    async fn cancel_only_affects_running_jobs() {
        let service = JobTrackingService::new(MemoryJobStore::new());
        let ctx = service.create_job("search", None).await;

        assert!(!ctx.is_cancelled());
        assert!(service.cancel_job(ctx.id()).await);
        assert!(ctx.is_cancelled());

        let job = service.get_job(ctx.id()).unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(job.completed_at.is_some());

        // Second cancel and unknown id are no-ops.
        assert!(!service.cancel_job(ctx.id()).await);
        assert!(!service.cancel_job("nope").await);
        assert_eq!(
            service.get_job(ctx.id()).unwrap().status,
            JobStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn cancel_after_completion_returns_false() {
        let service = JobTrackingService::new(MemoryJobStore::new());
        let ctx = service.create_job("embed", None).await;
        service.complete_job(ctx.id(), false, Some("boom".into())).await;

        assert!(!service.cancel_job(ctx.id()).await);
        let job = service.get_job(ctx.id()).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error_message.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn subscribers_see_updates_in_order() {
        let service = JobTrackingService::new(MemoryJobStore::new());
        let mut rx = service.subscribe();

        let ctx = service.create_job("search", None).await;
        ctx.progress(1, 5, "one").await;
        ctx.progress(2, 5, "two").await;

        // create, then the two progress updates.
        let _ = rx.recv().await.unwrap();
        let snap1 = rx.recv().await.unwrap();
        let snap2 = rx.recv().await.unwrap();
        assert_eq!(snap1[0].progress.current, 1);
        assert_eq!(snap2[0].progress.current, 2);
    }

    #[tokio::test]
    async fn terminal_jobs_are_evicted_after_grace() {
        let store = MemoryJobStore::new();
        let service = JobTrackingService::with_grace(store, Duration::from_millis(20));
        let ctx = service.create_job("search", None).await;
        service.complete_job(ctx.id(), true, None).await;

        assert!(service.get_job(ctx.id()).is_some());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(service.get_job(ctx.id()).is_none());
    }

    #[tokio::test]
    async fn active_jobs_excludes_terminal() {
        let service = JobTrackingService::new(MemoryJobStore::new());
        let a = service.create_job("search", None).await;
        let _b = service.create_job("embed", None).await;
        service.complete_job(a.id(), true, None).await;

        assert_eq!(service.get_active_jobs().len(), 1);
        assert_eq!(service.get_all_jobs().len(), 2);
    }

    #[tokio::test]
    async fn initialize_recovers_stale_rows() {
        let pool = db::connect_memory().await.unwrap();
        migrate::apply_schema(&pool).await.unwrap();
        let store = Arc::new(SqliteJobStore::new(pool.clone()));

        // A job that was running when the previous process died.
        let stale = Job {
            id: "search-1".to_string(),
            kind: "search".to_string(),
            status: JobStatus::Running,
            progress: JobProgress::default(),
            metadata: None,
            started_at: Utc::now().timestamp() - 2 * STALE_JOB_SECS,
            completed_at: None,
            error_message: None,
        };
        store.upsert(&stale).await.unwrap();

        let service = JobTrackingService::new(store.clone());
        service.initialize().await.unwrap();

        let status: String = sqlx::query_scalar("SELECT status FROM jobs WHERE id = 'search-1'")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(status, "failed");

        // Idempotent.
        service.initialize().await.unwrap();
    }

    #[tokio::test]
    async fn preloaded_terminal_jobs_are_evicted_after_grace() {
        let pool = db::connect_memory().await.unwrap();
        migrate::apply_schema(&pool).await.unwrap();
        let store = Arc::new(SqliteJobStore::new(pool));

        let done = Job {
            id: "search-done".to_string(),
            kind: "search".to_string(),
            status: JobStatus::Completed,
            progress: JobProgress::default(),
            metadata: None,
            started_at: Utc::now().timestamp(),
            completed_at: Some(Utc::now().timestamp()),
            error_message: None,
        };
        store.upsert(&done).await.unwrap();

        let service = JobTrackingService::with_grace(store, Duration::from_millis(20));
        service.initialize().await.unwrap();

        // Visible right after startup, gone once the grace window passes.
        assert!(service.get_job("search-done").is_some());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(service.get_job("search-done").is_none());
    }

    #[tokio::test]
    async fn initialize_purges_expired_rows() {
        let pool = db::connect_memory().await.unwrap();
        migrate::apply_schema(&pool).await.unwrap();
        let store = Arc::new(SqliteJobStore::new(pool.clone()));

        let ancient = Job {
            id: "embed-old".to_string(),
            kind: "embed".to_string(),
            status: JobStatus::Completed,
            progress: JobProgress::default(),
            metadata: None,
            started_at: Utc::now().timestamp() - 3 * JOB_RETENTION_SECS,
            completed_at: Some(Utc::now().timestamp() - 3 * JOB_RETENTION_SECS),
            error_message: None,
        };
        store.upsert(&ancient).await.unwrap();

        let service = JobTrackingService::new(store);
        service.initialize().await.unwrap();

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM jobs")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 0);
    }
}

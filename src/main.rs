//! # TweetVault CLI (`twv`)
//!
//! The `twv` binary drives the search ingestion engine: database
//! initialization, starting and resuming search sessions, pruning old
//! sessions, and serving the HTTP API.
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `twv init` | Create the SQLite database and run schema migrations |
//! | `twv search <variants>...` | Run a search session to collect tweets |
//! | `twv resume <id>` | Resume an interrupted session from its checkpoint |
//! | `twv cleanup --older-than <days>` | Delete sessions older than N days |
//! | `twv serve` | Start the HTTP API server |
//!
//! ## Examples
//!
//! ```bash
//! # Initialize the database
//! twv init --config ./config/twv.toml
//!
//! # Collect up to 500 recent tweets for two spelling variants
//! twv search "AGI" "artificial general intelligence" --max 500
//!
//! # Restrict to a date window and group sessions under a topic
//! twv search "GPT-5" --name gpt5-watch --since 2026-08-01 --until 2026-08-29
//!
//! # Show the exact source queries without touching network or disk
//! twv search "AGI" "GPT-5" --dry-run
//!
//! # Resume session 3 after an interruption
//! twv resume 3
//!
//! # Machine-readable result on stdout, progress as JSON lines on stderr
//! twv search "AGI" --max 100 --json
//! ```

mod classify;
mod config;
mod db;
mod embedder;
mod engine;
mod jobs;
mod migrate;
mod models;
mod progress;
mod query;
mod server;
mod sessions;
mod source;
mod store;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use chrono::{Days, NaiveDate, Utc};
use clap::{Parser, Subcommand};

use crate::engine::{SearchEngine, SearchOutcome, SearchRequest};
use crate::jobs::{JobTrackingService, SqliteJobStore};
use crate::models::{DateWindow, SearchMode, SessionStatus};
use crate::progress::ProgressMode;
use crate::sessions::SqliteSessionStore;
use crate::source::HttpTweetSource;
use crate::store::SqliteTweetStore;

type CliEngine = SearchEngine<HttpTweetSource, SqliteTweetStore, SqliteSessionStore>;

/// TweetVault — a resumable tweet-search ingestion engine.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/twv.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "twv",
    about = "TweetVault — resumable tweet-search ingestion backed by SQLite",
    version,
    long_about = "TweetVault runs keyword searches against a tweet search source, splits long \
    variant lists into multiple sub-queries, deduplicates results against the local archive, \
    and checkpoints progress so interrupted sessions resume without reprocessing."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/twv.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all required tables. This
    /// command is idempotent — running it multiple times is safe.
    Init,

    /// Run a search session.
    ///
    /// Each positional argument is one search variant (a phrase or
    /// spelling of the thing you are looking for). Variants that do not
    /// fit in one source query are split into multiple sub-queries run
    /// in order.
    Search {
        /// Search variants, in priority order. Comma-separated values
        /// inside one argument are split into separate variants.
        #[arg(required = true)]
        variants: Vec<String>,

        /// Topic name to group this session under. Reusing a name
        /// requires the exact same variants.
        #[arg(long)]
        name: Option<String>,

        /// Stop after collecting this many new tweets.
        #[arg(long, default_value_t = 100)]
        max: u64,

        /// Only tweets from the last N days. Conflicts with --since/--until.
        #[arg(long, conflicts_with_all = ["since", "until"])]
        days: Option<u64>,

        /// Only tweets posted on or after this date (YYYY-MM-DD).
        #[arg(long)]
        since: Option<String>,

        /// Only tweets posted on or before this date (YYYY-MM-DD).
        #[arg(long)]
        until: Option<String>,

        /// Search mode: `latest` (reverse-chronological) or `top` (ranked).
        #[arg(long, default_value = "latest")]
        mode: String,

        /// Trigger embedding generation after the session completes.
        #[arg(long)]
        embed: bool,

        /// Print the sub-queries that would run, without any network or
        /// database access.
        #[arg(long)]
        dry_run: bool,

        /// Emit the final result as JSON on stdout and progress as JSON
        /// lines on stderr.
        #[arg(long)]
        json: bool,
    },

    /// Resume an interrupted session from its saved checkpoint.
    Resume {
        /// Session id (shown when the session started).
        session_id: i64,

        /// Trigger embedding generation after the session completes.
        #[arg(long)]
        embed: bool,

        /// Emit the final result as JSON on stdout.
        #[arg(long)]
        json: bool,
    },

    /// Delete old search sessions and their origin records.
    Cleanup {
        /// Delete sessions started more than this many days ago.
        #[arg(long = "older-than")]
        older_than: u32,
    },

    /// Start the HTTP API server.
    ///
    /// Binds to the address configured in `[server].bind` and serves the
    /// job-tracking and search endpoints.
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // Dry runs never touch config-dependent resources beyond parsing.
    if let Commands::Search {
        variants,
        days,
        since,
        until,
        dry_run: true,
        ..
    } = &cli.command
    {
        let cfg = config::load_config(&cli.config)?;
        let dates = resolve_dates(*days, since.as_deref(), until.as_deref())?;
        let variants = expand_variants(variants);
        print_dry_run(&variants, &dates, cfg.engine.max_query_length);
        return Ok(());
    }

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Search {
            variants,
            name,
            max,
            days,
            since,
            until,
            mode,
            embed,
            dry_run: _,
            json,
        } => {
            let dates = resolve_dates(days, since.as_deref(), until.as_deref())?;
            let mode = mode.parse::<SearchMode>().map_err(|e| anyhow!(e))?;
            let request = SearchRequest {
                variants: expand_variants(&variants),
                topic_name: name,
                max_tweets: max,
                mode,
                dates,
                embed,
            };
            run_search_command(&cfg, request, json).await?;
        }
        Commands::Resume {
            session_id,
            embed,
            json,
        } => {
            run_resume_command(&cfg, session_id, embed, json).await?;
        }
        Commands::Cleanup { older_than } => {
            let (engine, _jobs) = build_engine(&cfg).await?;
            let deleted = engine.cleanup(older_than).await?;
            println!("Deleted {} session(s).", deleted);
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}

/// Builds the engine and job service against the configured database.
async fn build_engine(cfg: &config::Config) -> Result<(CliEngine, Arc<JobTrackingService>)> {
    let pool = db::connect(cfg)
        .await
        .context("failed to open database; run `twv init` first")?;

    let source = HttpTweetSource::new(&cfg.source)?;
    let records = SqliteTweetStore::new(pool.clone());
    let sessions = SqliteSessionStore::new(pool.clone());
    let embedder = embedder::create_embedder(&cfg.embedding)?;

    let engine = SearchEngine::new(
        source,
        records,
        sessions,
        embedder,
        cfg.engine.clone(),
        cfg.source.page_size,
    );

    let jobs = JobTrackingService::new(Arc::new(SqliteJobStore::new(pool)));
    jobs.initialize().await?;

    Ok((engine, jobs))
}

async fn run_search_command(
    cfg: &config::Config,
    request: SearchRequest,
    json: bool,
) -> Result<()> {
    let (engine, jobs) = build_engine(cfg).await?;

    let metadata = serde_json::json!({
        "variants": request.variants,
        "max_tweets": request.max_tweets,
    });
    let ctx = jobs.create_job("search", Some(metadata)).await;
    cancel_on_ctrl_c(&jobs, ctx.id());

    let reporter = progress_mode(json).reporter();
    let result = engine.start_search(request, Some(&ctx), reporter.as_ref()).await;

    finish_job(&jobs, &ctx, &result).await;
    report_outcome(result?, json)
}

async fn run_resume_command(
    cfg: &config::Config,
    session_id: i64,
    embed: bool,
    json: bool,
) -> Result<()> {
    let (engine, jobs) = build_engine(cfg).await?;

    let metadata = serde_json::json!({ "session_id": session_id });
    let ctx = jobs.create_job("resume", Some(metadata)).await;
    cancel_on_ctrl_c(&jobs, ctx.id());

    let reporter = progress_mode(json).reporter();
    let result = engine
        .resume_search(session_id, embed, Some(&ctx), reporter.as_ref())
        .await;

    finish_job(&jobs, &ctx, &result).await;
    report_outcome(result?, json)
}

fn progress_mode(json: bool) -> ProgressMode {
    if json {
        ProgressMode::Json
    } else {
        ProgressMode::default_for_tty()
    }
}

/// Ctrl-C requests cooperative cancellation; the engine checkpoints and
/// pauses the session instead of dying mid-page.
fn cancel_on_ctrl_c(jobs: &Arc<JobTrackingService>, job_id: &str) {
    let jobs = jobs.clone();
    let job_id = job_id.to_string();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("cancelling, saving checkpoint...");
            jobs.cancel_job(&job_id).await;
        }
    });
}

async fn finish_job(
    jobs: &Arc<JobTrackingService>,
    ctx: &jobs::JobContext,
    result: &Result<SearchOutcome>,
) {
    match result {
        Ok(_) => jobs.complete_job(ctx.id(), true, None).await,
        Err(e) => jobs.complete_job(ctx.id(), false, Some(e.to_string())).await,
    }
}

fn report_outcome(outcome: SearchOutcome, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
        return Ok(());
    }

    match outcome.status {
        SessionStatus::Paused => {
            println!(
                "Session {} paused: {} collected, {} examined. Resume with `twv resume {}`.",
                outcome.session_id,
                outcome.stats.collected,
                outcome.stats.examined,
                outcome.session_id
            );
        }
        _ => {
            println!(
                "Session {} completed: {} collected, {} examined, {} duplicates, {} new users.",
                outcome.session_id,
                outcome.stats.collected,
                outcome.stats.examined,
                outcome.stats.duplicates,
                outcome.stats.users_created
            );
            if outcome.stats.collected == 0 {
                eprintln!(
                    "No new tweets matched. Try broader variants, a wider date window, \
                     or `--mode top`."
                );
            }
        }
    }
    Ok(())
}

fn print_dry_run(variants: &[String], dates: &DateWindow, max_query_length: usize) {
    let groups = query::split_query(variants, max_query_length);
    println!(
        "{} variant(s) -> {} sub-query(ies):",
        variants.len(),
        groups.len()
    );
    for (i, group) in groups.iter().enumerate() {
        let q = query::build_query(group, Some(dates));
        println!("  {}. [{} chars] {}", i + 1, q.chars().count(), q);
    }
}

/// Each CLI argument may itself carry a comma-separated variant list.
fn expand_variants(args: &[String]) -> Vec<String> {
    args.iter()
        .flat_map(|arg| query::parse_variants(arg))
        .collect()
}

fn resolve_dates(
    days: Option<u64>,
    since: Option<&str>,
    until: Option<&str>,
) -> Result<DateWindow> {
    if let Some(days) = days {
        let since = Utc::now()
            .date_naive()
            .checked_sub_days(Days::new(days))
            .ok_or_else(|| anyhow!("--days value is out of range"))?;
        return Ok(DateWindow {
            since: Some(since),
            until: None,
        });
    }

    let parse = |v: Option<&str>| -> Result<Option<NaiveDate>> {
        match v {
            None => Ok(None),
            Some(s) => NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .map(Some)
                .with_context(|| format!("invalid date '{}', expected YYYY-MM-DD", s)),
        }
    };

    let window = DateWindow {
        since: parse(since)?,
        until: parse(until)?,
    };
    if let (Some(s), Some(u)) = (window.since, window.until) {
        if s > u {
            anyhow::bail!("--since must not be after --until");
        }
    }
    Ok(window)
}

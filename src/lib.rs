//! # TweetVault
//!
//! A resumable tweet-search ingestion engine backed by SQLite.
//!
//! TweetVault runs keyword searches against a tweet search source, splits
//! long variant lists into multiple sub-queries, deduplicates results
//! against the local archive, attributes each new tweet to the variant
//! that found it, and checkpoints progress so interrupted sessions resume
//! without reprocessing. Long runs survive rate limits by waiting out the
//! advertised reset window and retrying the same sub-query.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌───────────────┐   ┌──────────┐
//! │ TweetSource  │──▶│ SearchEngine  │──▶│  SQLite  │
//! │ (HTTP pages) │   │ dedup+resume  │   │ sessions │
//! └──────────────┘   └──────┬────────┘   └────┬─────┘
//!                           │                 │
//!                    ┌──────┴──────┐   ┌──────┴─────┐
//!                    │ CLI (twv)   │   │ HTTP + SSE │
//!                    └─────────────┘   └────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! twv init                            # create database
//! twv search "AGI" "GPT-5" --max 200  # collect up to 200 tweets
//! twv resume 3                        # pick up an interrupted session
//! twv cleanup --older-than 30         # drop stale sessions
//! twv serve                           # start the HTTP API
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`query`] | Query building, splitting, and variant matching |
//! | [`classify`] | Error taxonomy and retry/backoff policy |
//! | [`source`] | HTTP tweet search source |
//! | [`store`] | Tweet/user/origin persistence |
//! | [`sessions`] | Session and topic persistence |
//! | [`engine`] | The search session engine |
//! | [`jobs`] | Background job tracking and cancellation |
//! | [`progress`] | CLI progress reporting |
//! | [`embedder`] | Post-completion embedding hook |
//! | [`server`] | HTTP API server |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod classify;
pub mod config;
pub mod db;
pub mod embedder;
pub mod engine;
pub mod jobs;
pub mod migrate;
pub mod models;
pub mod progress;
pub mod query;
pub mod server;
pub mod sessions;
pub mod source;
pub mod store;

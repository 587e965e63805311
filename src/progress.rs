//! Search progress reporting for the CLI.
//!
//! Progress is emitted on **stderr** so stdout stays parseable for
//! scripts (`--json` consumers read a single result object from stdout).

use std::io::Write;

use crate::models::SessionStats;

/// A single progress event during a search session.
#[derive(Clone, Debug)]
pub enum SearchEvent {
    /// A sub-query started (1-based index out of the split total).
    SubQuery { index: usize, total: usize },
    /// Counters changed while examining the stream.
    Progress { stats: SessionStats, target: u64 },
    /// Waiting out a rate limit before retrying the same sub-query.
    RateLimitWait { seconds: u64 },
}

/// Reports search progress. Implementations write to stderr.
pub trait SearchProgressReporter: Send + Sync {
    fn report(&self, event: SearchEvent);
}

/// Human-friendly progress lines.
pub struct StderrProgress;

impl SearchProgressReporter for StderrProgress {
    fn report(&self, event: SearchEvent) {
        let line = match &event {
            SearchEvent::SubQuery { index, total } => {
                format!("search  sub-query {} / {}\n", index, total)
            }
            SearchEvent::Progress { stats, target } => format!(
                "search  collected {} / {}  (examined {}, duplicates {})\n",
                stats.collected, target, stats.examined, stats.duplicates
            ),
            SearchEvent::RateLimitWait { seconds } => {
                format!("search  rate limited, waiting {}s\n", seconds)
            }
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl SearchProgressReporter for JsonProgress {
    fn report(&self, event: SearchEvent) {
        let obj = match &event {
            SearchEvent::SubQuery { index, total } => serde_json::json!({
                "event": "sub_query",
                "index": index,
                "total": total
            }),
            SearchEvent::Progress { stats, target } => serde_json::json!({
                "event": "progress",
                "collected": stats.collected,
                "examined": stats.examined,
                "duplicates": stats.duplicates,
                "target": target
            }),
            SearchEvent::RateLimitWait { seconds } => serde_json::json!({
                "event": "rate_limit_wait",
                "seconds": seconds
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl SearchProgressReporter for NoProgress {
    fn report(&self, _event: SearchEvent) {}
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn SearchProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}

//! Error classification and retry backoff.
//!
//! Maps errors raised during a search session onto a small taxonomy so the
//! engine can decide between wait-and-retry and failing fast. Pattern
//! matching over the error message is the fallback; errors from the source
//! client carry their category directly.

use std::time::Duration;

use crate::source::SourceError;

/// Category of a classified error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Network,
    RateLimit,
    TemporaryService,
    Authentication,
    Validation,
    Unknown,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Network => "network",
            ErrorCategory::RateLimit => "rate_limit",
            ErrorCategory::TemporaryService => "temporary_service",
            ErrorCategory::Authentication => "authentication",
            ErrorCategory::Validation => "validation",
            ErrorCategory::Unknown => "unknown",
        }
    }
}

/// Result of classifying one error.
#[derive(Debug, Clone, Copy)]
pub struct Classification {
    pub category: ErrorCategory,
    pub retryable: bool,
    /// Suggested initial delay before the first retry. Calling code
    /// combines this with [`backoff_delay`] on subsequent attempts.
    pub suggested_delay: Duration,
}

impl Classification {
    fn of(category: ErrorCategory) -> Self {
        let (retryable, secs) = match category {
            ErrorCategory::RateLimit => (true, 60),
            ErrorCategory::TemporaryService => (true, 30),
            ErrorCategory::Network => (true, 10),
            ErrorCategory::Unknown => (true, 5),
            // Require operator action; retrying cannot help.
            ErrorCategory::Authentication | ErrorCategory::Validation => (false, 0),
        };
        Classification {
            category,
            retryable,
            suggested_delay: Duration::from_secs(secs),
        }
    }
}

/// Classify an error into a category with a retry hint.
///
/// Source-client errors map directly; anything else falls back to
/// ordered message patterns, with `Unknown` as the catch-all.
pub fn classify(err: &anyhow::Error) -> Classification {
    if let Some(source_err) = err.downcast_ref::<SourceError>() {
        return classify_source(source_err);
    }
    classify_message(&err.to_string())
}

fn classify_source(err: &SourceError) -> Classification {
    match err {
        SourceError::RateLimited { retry_after } => {
            let mut c = Classification::of(ErrorCategory::RateLimit);
            if let Some(secs) = retry_after {
                c.suggested_delay = Duration::from_secs(*secs);
            }
            c
        }
        SourceError::Unauthorized(_) => Classification::of(ErrorCategory::Authentication),
        SourceError::InvalidRequest(_) => Classification::of(ErrorCategory::Validation),
        SourceError::ServiceUnavailable { .. } => {
            Classification::of(ErrorCategory::TemporaryService)
        }
        SourceError::Transport(_) => Classification::of(ErrorCategory::Network),
        SourceError::Decode(_) => Classification::of(ErrorCategory::Unknown),
    }
}

/// Ordered message patterns, most specific transport signals first.
pub fn classify_message(message: &str) -> Classification {
    let msg = message.to_lowercase();

    let matches_any = |patterns: &[&str]| patterns.iter().any(|p| msg.contains(p));

    if matches_any(&[
        "connection refused",
        "connection reset",
        "timed out",
        "timeout",
        "dns",
        "network",
        "broken pipe",
    ]) {
        Classification::of(ErrorCategory::Network)
    } else if matches_any(&["rate limit", "too many requests", "429"]) {
        Classification::of(ErrorCategory::RateLimit)
    } else if matches_any(&[
        "500",
        "502",
        "503",
        "504",
        "internal server error",
        "service unavailable",
        "bad gateway",
    ]) {
        Classification::of(ErrorCategory::TemporaryService)
    } else if matches_any(&[
        "401",
        "403",
        "unauthorized",
        "forbidden",
        "authentication",
        "suspended",
    ]) {
        Classification::of(ErrorCategory::Authentication)
    } else if matches_any(&["400", "invalid", "bad request", "missing required"]) {
        Classification::of(ErrorCategory::Validation)
    } else {
        Classification::of(ErrorCategory::Unknown)
    }
}

/// Exponential backoff with jitter, capped at `max`.
///
/// Attempt 0 yields roughly `initial`; each further attempt doubles it.
/// Jitter keeps the delay within `[d/2, d]` so concurrent sessions do not
/// retry in lockstep.
pub fn backoff_delay(initial: Duration, attempt: u32, max: Duration) -> Duration {
    let exp = initial.saturating_mul(2u32.saturating_pow(attempt)).min(max);
    let half = exp / 2;
    half + Duration::from_secs_f64(half.as_secs_f64() * fastrand::f64())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_messages_are_retryable_with_long_delay() {
        let c = classify_message("HTTP 429: too many requests");
        assert_eq!(c.category, ErrorCategory::RateLimit);
        assert!(c.retryable);
        assert!(c.suggested_delay >= Duration::from_secs(60));
    }

    #[test]
    fn auth_and_validation_are_never_retryable() {
        let auth = classify_message("401 unauthorized");
        assert_eq!(auth.category, ErrorCategory::Authentication);
        assert!(!auth.retryable);

        let validation = classify_message("invalid query parameter");
        assert_eq!(validation.category, ErrorCategory::Validation);
        assert!(!validation.retryable);
    }

    #[test]
    fn network_patterns_win_over_later_categories() {
        // "timed out" and "503" both present; network is checked first.
        let c = classify_message("request timed out talking to upstream (503)");
        assert_eq!(c.category, ErrorCategory::Network);
    }

    #[test]
    fn unknown_is_the_fallback_and_retryable() {
        let c = classify_message("something inexplicable happened");
        assert_eq!(c.category, ErrorCategory::Unknown);
        assert!(c.retryable);
    }

    #[test]
    fn delay_ordering_across_categories() {
        let rate = Classification::of(ErrorCategory::RateLimit).suggested_delay;
        let temp = Classification::of(ErrorCategory::TemporaryService).suggested_delay;
        let net = Classification::of(ErrorCategory::Network).suggested_delay;
        let unknown = Classification::of(ErrorCategory::Unknown).suggested_delay;
        assert!(rate > temp && temp > net && net > unknown);
    }

    #[test]
    fn source_rate_limit_carries_reset_hint() {
        let err = anyhow::Error::new(SourceError::RateLimited {
            retry_after: Some(123),
        });
        let c = classify(&err);
        assert_eq!(c.category, ErrorCategory::RateLimit);
        assert_eq!(c.suggested_delay, Duration::from_secs(123));
    }

    #[test]
    fn backoff_grows_and_respects_the_cap() {
        let initial = Duration::from_secs(2);
        let max = Duration::from_secs(60);

        let d0 = backoff_delay(initial, 0, max);
        assert!(d0 >= Duration::from_secs(1) && d0 <= initial);

        let d3 = backoff_delay(initial, 3, max);
        assert!(d3 >= Duration::from_secs(8) && d3 <= Duration::from_secs(16));

        let capped = backoff_delay(initial, 30, max);
        assert!(capped <= max);
        assert!(capped >= max / 2);
    }
}

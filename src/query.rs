//! Search query construction and splitting.
//!
//! Turns free-text variant lists into source query strings, splits
//! oversized variant sets into multiple sub-queries under the source's
//! query-length limit, and attributes stored tweets back to the variant
//! that discovered them. Pure and deterministic, no I/O.

use crate::models::DateWindow;

/// Character budget for one source query. Queries longer than this are
/// rejected by the search endpoint.
pub const MAX_QUERY_LENGTH: usize = 450;

/// Characters reserved out of the budget for the exclusion filter and
/// `since:`/`until:` date bounds appended by [`build_query`].
const QUERY_OVERHEAD: usize = 60;

/// Trailing filter appended to every query. Retweets duplicate the
/// original tweet's text and would be counted as distinct records.
const EXCLUSION_FILTER: &str = "-filter:retweets";

/// Parse a comma-separated variant list into ordered, trimmed terms.
///
/// Empty and whitespace-only segments are dropped. Input order is
/// preserved: it determines both query splitting and attribution
/// tie-breaks.
pub fn parse_variants(input: &str) -> Vec<String> {
    input
        .split(',')
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .collect()
}

/// Build one source query from a variant group and optional date bounds.
///
/// Each variant is quoted and joined with ` OR `; dates are rendered as
/// UTC `YYYY-MM-DD` bounds; the retweet exclusion filter is always last.
pub fn build_query(variants: &[String], dates: Option<&DateWindow>) -> String {
    let mut query = variants
        .iter()
        .map(|v| format!("\"{}\"", v))
        .collect::<Vec<_>>()
        .join(" OR ");

    if let Some(window) = dates {
        if let Some(since) = window.since {
            query.push_str(&format!(" since:{}", since.format("%Y-%m-%d")));
        }
        if let Some(until) = window.until {
            query.push_str(&format!(" until:{}", until.format("%Y-%m-%d")));
        }
    }

    query.push(' ');
    query.push_str(EXCLUSION_FILTER);
    query
}

/// Split a variant list into ordered groups whose built queries fit
/// within `max_length`.
///
/// Groups are filled greedily in input order; concatenating the groups
/// reproduces the input exactly. A variant that alone exceeds the
/// remaining budget still starts its own group — variants are never
/// dropped, the source simply truncates pathological queries.
pub fn split_query(variants: &[String], max_length: usize) -> Vec<Vec<String>> {
    let budget = max_length.saturating_sub(QUERY_OVERHEAD);

    let mut groups: Vec<Vec<String>> = Vec::new();
    let mut current: Vec<String> = Vec::new();
    let mut current_len = 0usize;

    for variant in variants {
        // Quoted length, plus the ` OR ` joiner when not first in group.
        let quoted = variant.chars().count() + 2;
        let added = if current.is_empty() { quoted } else { quoted + 4 };

        if !current.is_empty() && current_len + added > budget {
            groups.push(std::mem::take(&mut current));
            current_len = 0;
        }

        current_len += if current.is_empty() { quoted } else { quoted + 4 };
        current.push(variant.clone());
    }

    if !current.is_empty() {
        groups.push(current);
    }

    groups
}

/// Find the variant that discovered `text`, for origin attribution.
///
/// Case-insensitive substring match. When several variants match, the
/// longest wins (more specific terms are assumed more informative);
/// equal lengths resolve to input order.
pub fn match_variant<'a>(text: &str, variants: &'a [String]) -> Option<&'a str> {
    let haystack = text.to_lowercase();

    let mut best: Option<&'a str> = None;
    for variant in variants {
        if !haystack.contains(&variant.to_lowercase()) {
            continue;
        }
        match best {
            Some(b) if variant.chars().count() <= b.chars().count() => {}
            _ => best = Some(variant),
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn vars(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parse_drops_empty_segments_and_preserves_order() {
        assert_eq!(
            parse_variants("AGI, GPT-5 ,, ,foundation model"),
            vars(&["AGI", "GPT-5", "foundation model"])
        );
        assert!(parse_variants("  , ,").is_empty());
    }

    #[test]
    fn build_query_quotes_and_joins() {
        let q = build_query(&vars(&["AGI", "GPT-5"]), None);
        assert_eq!(q, "\"AGI\" OR \"GPT-5\" -filter:retweets");
    }

    #[test]
    fn build_query_appends_date_bounds() {
        let window = DateWindow {
            since: NaiveDate::from_ymd_opt(2024, 1, 1),
            until: NaiveDate::from_ymd_opt(2024, 2, 1),
        };
        let q = build_query(&vars(&["AGI"]), Some(&window));
        assert_eq!(
            q,
            "\"AGI\" since:2024-01-01 until:2024-02-01 -filter:retweets"
        );
    }

    #[test]
    fn split_preserves_order_and_partitions() {
        let input: Vec<String> = (0..40).map(|i| format!("variant-number-{:02}", i)).collect();
        let groups = split_query(&input, MAX_QUERY_LENGTH);

        assert!(groups.len() > 1);
        let flattened: Vec<String> = groups.iter().flatten().cloned().collect();
        assert_eq!(flattened, input);
    }

    #[test]
    fn split_groups_fit_the_budget() {
        let input: Vec<String> = (0..40).map(|i| format!("variant-number-{:02}", i)).collect();
        for group in split_query(&input, MAX_QUERY_LENGTH) {
            let built = build_query(&group, None);
            assert!(
                built.chars().count() <= MAX_QUERY_LENGTH,
                "query over budget: {} chars",
                built.chars().count()
            );
        }
    }

    #[test]
    fn split_never_drops_an_oversized_variant() {
        let huge = "x".repeat(600);
        let input = vars(&["short", huge.as_str(), "tail"]);
        let groups = split_query(&input, MAX_QUERY_LENGTH);

        let flattened: Vec<String> = groups.iter().flatten().cloned().collect();
        assert_eq!(flattened, input);
        // The oversized variant sits alone in its group.
        assert!(groups.iter().any(|g| g.len() == 1 && g[0] == huge));
    }

    #[test]
    fn split_small_list_is_one_group() {
        let input = vars(&["AGI", "GPT-5"]);
        assert_eq!(split_query(&input, MAX_QUERY_LENGTH), vec![input.clone()]);
    }

    #[test]
    fn match_prefers_the_longest_variant() {
        let variants = vars(&["ai", "foundation model"]);
        let text = "New foundation model drops, AI twitter melts down";
        assert_eq!(match_variant(text, &variants), Some("foundation model"));
    }

    #[test]
    fn match_is_case_insensitive() {
        let variants = vars(&["GPT-5"]);
        assert_eq!(match_variant("gpt-5 rumors again", &variants), Some("GPT-5"));
    }

    #[test]
    fn match_ties_resolve_to_input_order() {
        let variants = vars(&["abc", "xyz"]);
        assert_eq!(match_variant("xyz then abc", &variants), Some("abc"));
    }

    #[test]
    fn match_returns_none_without_a_hit() {
        let variants = vars(&["AGI"]);
        assert_eq!(match_variant("nothing relevant here", &variants), None);
    }
}

//! Human/model-readable summaries of engine results.

use crate::extract::truncate_chars;
use agentpipe_core::{ExtractResponse, FetchResult, SearchResponse};
use std::fmt::Write as _;

const SNIPPET_CHARS: usize = 500;

/// Sentinel used when a search comes back empty.
pub fn no_results(query: &str) -> String {
    format!("No results found for \"{query}\".")
}

pub fn render_search(resp: &SearchResponse) -> String {
    if resp.results.is_empty() {
        return no_results(&resp.query);
    }
    let mut out = format!("Search results for \"{}\":\n", resp.query);
    if let Some(a) = resp.answer.as_deref() {
        let _ = writeln!(out, "\nAnswer: {a}");
    }
    for (i, r) in resp.results.iter().enumerate() {
        let title = if r.title.trim().is_empty() { "(untitled)" } else { r.title.trim() };
        let _ = writeln!(out, "\n{}. {title}", i + 1);
        let _ = writeln!(out, "   URL: {}", r.url);
        let _ = writeln!(out, "   Score: {:.2}", r.score);
        let snippet = r.content.split_whitespace().collect::<Vec<_>>().join(" ");
        if !snippet.is_empty() {
            let _ = writeln!(out, "   {}", truncate_chars(&snippet, SNIPPET_CHARS).0);
        }
    }
    out.trim_end().to_string()
}

/// Per-URL content blocks, then a failures section when any URL failed.
pub fn render_extract(resp: &ExtractResponse, max_chars_per_page: usize) -> String {
    let mut out = String::new();
    for p in &resp.results {
        let _ = writeln!(out, "## {}\n", p.url);
        let _ = writeln!(out, "{}\n", truncate_chars(p.raw_content.trim(), max_chars_per_page).0);
    }
    if resp.results.is_empty() {
        out.push_str("No content extracted.\n\n");
    }
    if let Some(n) = resp.truncated_from {
        let _ = writeln!(out, "Note: {n} URLs requested; only the first {} were processed.\n", n.min(agentpipe_core::MAX_EXTRACT_URLS));
    }
    if !resp.failed_results.is_empty() {
        out.push_str("Failed URLs:\n");
        for f in &resp.failed_results {
            let _ = writeln!(out, "- {}: {}", f.url, f.error);
        }
    }
    out.trim_end().to_string()
}

pub fn render_context(query: &str, context: &str) -> String {
    format!("Context for \"{query}\":\n\n{context}")
}

pub fn render_fetch(r: &FetchResult) -> String {
    if !r.is_success() {
        return format!(
            "Failed to fetch {}: {}",
            r.url,
            r.error.as_deref().unwrap_or("unknown error")
        );
    }
    let mut out = String::new();
    if let Some(t) = r.title.as_deref() {
        let _ = writeln!(out, "Title: {t}");
    }
    if r.redirected {
        let _ = writeln!(out, "URL: {} (redirected from {})", r.final_url, r.url);
    } else {
        let _ = writeln!(out, "URL: {}", r.final_url);
    }
    if r.attempts > 1 {
        let _ = writeln!(out, "Attempts: {}", r.attempts);
    }
    let _ = write!(out, "\n{}", r.content);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentpipe_core::{ExtractFailure, ExtractedPage, FetchStatus, SearchHit};

    fn resp(results: Vec<SearchHit>) -> SearchResponse {
        SearchResponse {
            query: "rust async".into(),
            answer: None,
            results,
            response_time: None,
            attempts: 1,
        }
    }

    #[test]
    fn empty_search_renders_only_the_sentinel() {
        let s = render_search(&resp(vec![]));
        assert_eq!(s, "No results found for \"rust async\".");
        assert!(!s.contains("1."));
        assert!(!s.contains("URL:"));
    }

    #[test]
    fn search_is_a_ranked_list() {
        let s = render_search(&resp(vec![
            SearchHit {
                title: "Tokio".into(),
                url: "https://tokio.rs".into(),
                content: "An async   runtime".into(),
                score: 0.91,
                raw_content: None,
            },
            SearchHit {
                title: "".into(),
                url: "https://docs.rs".into(),
                content: "".into(),
                score: 0.5,
                raw_content: None,
            },
        ]));
        assert!(s.starts_with("Search results for \"rust async\":"));
        assert!(s.contains("1. Tokio\n   URL: https://tokio.rs\n   Score: 0.91\n   An async runtime"));
        assert!(s.contains("2. (untitled)"));
    }

    #[test]
    fn extract_lists_failures_after_content() {
        let r = ExtractResponse {
            results: vec![ExtractedPage {
                url: "https://a.example".into(),
                raw_content: "alpha".into(),
            }],
            failed_results: vec![ExtractFailure {
                url: "https://b.example".into(),
                error: "blocked".into(),
            }],
            truncated_from: None,
            response_time: None,
            attempts: 1,
        };
        let s = render_extract(&r, 100);
        let content_at = s.find("alpha").unwrap();
        let failures_at = s.find("Failed URLs:").unwrap();
        assert!(content_at < failures_at);
        assert!(s.contains("- https://b.example: blocked"));
    }

    #[test]
    fn failed_fetch_mentions_the_error() {
        let r = FetchResult {
            url: "https://x.example".into(),
            final_url: "https://x.example".into(),
            redirected: false,
            status: FetchStatus::Error,
            title: None,
            content: String::new(),
            error: Some("HTTP 404 loading https://x.example (after 1 attempt(s))".into()),
            error_code: None,
            retryable: false,
            attempts: 1,
            elapsed_ms: 3,
        };
        assert!(render_fetch(&r).contains("404"));
    }
}

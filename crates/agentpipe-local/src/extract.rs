//! HTML to normalized text.

use agentpipe_core::{Error, Result};
use std::io::Cursor;

/// Marker appended when content is cut to the configured bound.
pub const TRUNCATION_MARKER: &str = "\n...[truncated]";

/// Convert HTML to readable plain text.
///
/// Deterministic and "good enough", not a readability engine.
pub fn html_to_text(html: &str, width: usize) -> Result<String> {
    // html2text expects bytes; Cursor avoids allocating a second large buffer.
    html2text::from_read(Cursor::new(html.as_bytes()), width)
        .map_err(|e| Error::Conversion(e.to_string()))
}

/// Trim trailing whitespace per line and collapse runs of blank lines to one.
pub fn normalize_text(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut blank_run = 0usize;
    for line in s.lines() {
        let line = line.trim_end();
        if line.trim().is_empty() {
            blank_run += 1;
            if blank_run > 1 || out.is_empty() {
                continue;
            }
            out.push('\n');
            continue;
        }
        blank_run = 0;
        out.push_str(line);
        out.push('\n');
    }
    out.trim_end().to_string()
}

/// The page `<title>`, whitespace-normalized.
pub fn page_title(html: &str) -> Option<String> {
    let doc = html_scraper::Html::parse_document(html);
    let sel = html_scraper::Selector::parse("title").ok()?;
    let t = doc.select(&sel).next()?.text().collect::<Vec<_>>().join(" ");
    let t = t.split_whitespace().collect::<Vec<_>>().join(" ");
    (!t.is_empty()).then_some(t)
}

/// Cut to `max_chars` on a char boundary, appending [`TRUNCATION_MARKER`] when cut.
pub fn truncate_chars(s: &str, max_chars: usize) -> (String, bool) {
    let mut it = s.char_indices();
    match it.nth(max_chars) {
        None => (s.to_string(), false),
        Some((byte, _)) => (format!("{}{TRUNCATION_MARKER}", &s[..byte]), true),
    }
}

/// Full conversion step of the page-fetch engine.
///
/// Fails with `Error::Conversion` if the markup cannot be rendered, or renders to
/// nothing while clearly carrying a body.
pub fn convert_to_normalized_text(html: &str, max_chars: usize) -> Result<String> {
    let text = normalize_text(&html_to_text(html, 120)?);
    if text.is_empty() && html_has_body_text(html) {
        return Err(Error::Conversion(
            "markup produced no readable text".to_string(),
        ));
    }
    Ok(truncate_chars(&text, max_chars).0)
}

fn html_has_body_text(html: &str) -> bool {
    let doc = html_scraper::Html::parse_document(html);
    let Ok(sel) = html_scraper::Selector::parse("body") else {
        return false;
    };
    doc.select(&sel)
        .next()
        .map(|b| b.text().any(|t| !t.trim().is_empty()))
        .unwrap_or(false)
}

/// Best-effort guess for whether bytes are HTML-ish.
pub fn bytes_look_like_html(bytes: &[u8]) -> bool {
    let mut i = 0usize;
    while i < bytes.len() && bytes[i].is_ascii_whitespace() {
        i += 1;
    }
    let rest = &bytes[i..];
    let head: Vec<u8> = rest.iter().take(16).map(|b| b.to_ascii_lowercase()).collect();
    head.starts_with(b"<!doctype html")
        || head.starts_with(b"<html")
        || head.starts_with(b"<head")
        || head.starts_with(b"<body")
}

/// `text/html` or `application/xhtml+xml`, ignoring parameters and case.
pub fn is_html_content_type(ct: &str) -> bool {
    let main = ct.split(';').next().unwrap_or("").trim().to_ascii_lowercase();
    main == "text/html" || main == "application/xhtml+xml"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converts_and_normalizes() {
        let html = "<html><head><title> Hello \n World </title></head>\
                    <body><h1>Heading</h1><p>First</p><p></p><p></p><p>Second</p></body></html>";
        let text = convert_to_normalized_text(html, 10_000).unwrap();
        assert!(text.contains("Heading"));
        assert!(text.contains("First"));
        assert!(text.contains("Second"));
        assert!(!text.contains("\n\n\n"));
        assert_eq!(page_title(html).as_deref(), Some("Hello World"));
    }

    #[test]
    fn truncation_is_char_safe_and_marked() {
        let (s, cut) = truncate_chars("héllo wörld", 4);
        assert!(cut);
        assert_eq!(s, format!("héll{TRUNCATION_MARKER}"));
        let (s, cut) = truncate_chars("short", 10);
        assert!(!cut);
        assert_eq!(s, "short");
    }

    #[test]
    fn normalize_collapses_blank_runs() {
        assert_eq!(normalize_text("\n\na  \n\n\n\nb\n\n"), "a\n\nb");
    }

    #[test]
    fn content_type_checks() {
        assert!(is_html_content_type("text/html; charset=utf-8"));
        assert!(is_html_content_type("Application/XHTML+XML"));
        assert!(!is_html_content_type("application/pdf"));
        assert!(!is_html_content_type("application/json"));
        assert!(bytes_look_like_html(b"  <!DOCTYPE html><html>"));
        assert!(!bytes_look_like_html(b"%PDF-1.7"));
    }

    #[test]
    fn empty_document_converts_to_empty_text() {
        assert_eq!(convert_to_normalized_text("<html><body></body></html>", 100).unwrap(), "");
    }
}

use regex::{Captures, Regex};
use std::sync::LazyLock;

/// The fixed set of attribute patterns whose quoted URL values get routed
/// back through the relay prefix. `content` covers meta-refresh targets and
/// `url(...)` covers inline CSS.
static ATTR_PATTERNS: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    vec![
        ("href", Regex::new(r#"href=['"](\s*[^'"]*?\s*)['"]"#).expect("href pattern")),
        ("src", Regex::new(r#"src=['"](\s*[^'"]*?\s*)['"]"#).expect("src pattern")),
        ("action", Regex::new(r#"action=['"](\s*[^'"]*?\s*)['"]"#).expect("action pattern")),
        ("content", Regex::new(r#"content=['"](\s*[^'"]*?\s*)['"]"#).expect("content pattern")),
        ("url", Regex::new(r#"url\(['"](\s*[^'"]*?\s*)['"]\)"#).expect("css url pattern")),
    ]
});

static HEAD_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)<head[^>]*>").expect("head pattern"));
static HTML_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)<html[^>]*>").expect("html pattern"));

/// URL schemes and anchors that must never be rewritten.
const SKIP_PREFIXES: &[&str] = &[
    "http://", "https://", "//", "ftp://", "data:", "javascript:", "mailto:", "tel:", "#",
    "about:", "chrome://", "file://",
];

/// Rewrites relative URLs inside a proxied HTML payload so that follow-up
/// browser requests keep routing through the relay prefix. Text substitution
/// over the raw markup, not a DOM parse: `../` segments are not resolved and
/// every relative URL is anchored at the prefix root.
pub struct HtmlRewriter {
    proxy_prefix: String,
    target_host: String,
}

impl HtmlRewriter {
    pub fn new(proxy_prefix: impl Into<String>, target_host: impl Into<String>) -> Self {
        Self {
            proxy_prefix: proxy_prefix.into(),
            target_host: target_host.into(),
        }
    }

    /// Produces a rewritten copy of `content`. The input buffer is left
    /// untouched; the output length usually differs. Bodies that are not
    /// valid UTF-8 (legacy encodings on embedded devices) are returned
    /// byte-identical rather than transcoded.
    pub fn rewrite(&self, content: &[u8]) -> Vec<u8> {
        let mut html = match std::str::from_utf8(content) {
            Ok(text) => text.to_string(),
            Err(_) => {
                log::debug!("Skipping rewrite of non-UTF-8 body from {}", self.target_host);
                return content.to_vec();
            }
        };

        for (_, pattern) in ATTR_PATTERNS.iter() {
            html = pattern
                .replace_all(&html, |caps: &Captures| self.rewrite_attribute(caps))
                .into_owned();
        }

        // Fallback so URLs assembled at runtime still resolve under the prefix.
        if !html.to_lowercase().contains("<base") {
            html = self.inject_base_tag(&html);
        }

        log::debug!(
            "Rewrote HTML for {} ({} -> {} bytes)",
            self.target_host,
            content.len(),
            html.len()
        );

        html.into_bytes()
    }

    /// Rewrites one attribute match, leaving it untouched when the URL is
    /// absolute or otherwise exempt.
    fn rewrite_attribute(&self, caps: &Captures) -> String {
        let matched = caps.get(0).map(|m| m.as_str()).unwrap_or_default();
        let original_url = caps.get(1).map(|m| m.as_str().trim()).unwrap_or_default();

        if should_skip_url(original_url) {
            return matched.to_string();
        }

        let new_url = self.rewrite_url(original_url);
        matched.replacen(original_url, &new_url, 1)
    }

    /// Anchors a relative URL at the relay prefix. Root-relative URLs keep
    /// their leading slash; document-relative ones get one inserted.
    fn rewrite_url(&self, original_url: &str) -> String {
        if original_url.starts_with('/') {
            format!("{}{}", self.proxy_prefix, original_url)
        } else {
            format!("{}/{}", self.proxy_prefix, original_url)
        }
    }

    /// Injects `<base href="prefix/">` right after the opening `<head>` tag,
    /// synthesizing a head after `<html>` when the document has none, or
    /// prepending as a last resort.
    fn inject_base_tag(&self, html: &str) -> String {
        let base_tag = format!(r#"<base href="{}/">"#, self.proxy_prefix);

        if let Some(m) = HEAD_TAG.find(html) {
            let mut out = String::with_capacity(html.len() + base_tag.len() + 8);
            out.push_str(&html[..m.end()]);
            out.push_str("\n    ");
            out.push_str(&base_tag);
            out.push_str(&html[m.end()..]);
            return out;
        }

        if let Some(m) = HTML_TAG.find(html) {
            let mut out = String::with_capacity(html.len() + base_tag.len() + 32);
            out.push_str(&html[..m.end()]);
            out.push_str("\n  <head>\n    ");
            out.push_str(&base_tag);
            out.push_str("\n  </head>");
            out.push_str(&html[m.end()..]);
            return out;
        }

        format!("{}\n{}", base_tag, html)
    }
}

/// Whether a URL is exempt from rewriting: empty, a bare `/` or `#`, or
/// carrying an absolute scheme (matched case-insensitively).
fn should_skip_url(url: &str) -> bool {
    let url = url.trim().to_lowercase();

    if SKIP_PREFIXES.iter().any(|prefix| url.starts_with(prefix)) {
        return true;
    }

    url.is_empty() || url == "/" || url == "#"
}

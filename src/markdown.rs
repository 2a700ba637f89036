//! Markdown parsing: front-matter extraction and HTML rendering.
//!
//! Documents carry an optional YAML front-matter block delimited by `---`
//! lines at the top of the file. The remainder is rendered with
//! pulldown-cmark (tables, fenced code, footnotes, strikethrough and
//! definition lists enabled).
//!
//! Front-matter values follow the single-element-list convention of the
//! original metadata format: a value written as a one-element list unwraps to
//! its first element, and absent keys surface as the empty string.

use pulldown_cmark::{Options, Parser, html};
use regex::Regex;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::OnceLock;

use crate::error::{Error, Result};
use crate::types::Document;

/// Parsed front-matter metadata.
#[derive(Debug, Clone, Default)]
pub struct FrontMatter(BTreeMap<String, serde_yaml::Value>);

impl FrontMatter {
    /// Look up a key and normalize its value to a scalar string.
    ///
    /// One-element lists unwrap to their first element; scalars stringify;
    /// anything else (absent key, null, multi-element list, nested map)
    /// normalizes to the empty string.
    pub fn scalar(&self, key: &str) -> String {
        match self.0.get(key) {
            Some(serde_yaml::Value::Sequence(seq)) if seq.len() == 1 => scalar_to_string(&seq[0]),
            Some(value) => scalar_to_string(value),
            None => String::new(),
        }
    }

    /// Whether the key is present with a non-empty scalar value.
    pub fn has(&self, key: &str) -> bool {
        !self.scalar(key).is_empty()
    }
}

fn scalar_to_string(value: &serde_yaml::Value) -> String {
    match value {
        serde_yaml::Value::String(s) => s.clone(),
        serde_yaml::Value::Number(n) => n.to_string(),
        serde_yaml::Value::Bool(b) => b.to_string(),
        _ => String::new(),
    }
}

/// Split a source document into front-matter and Markdown body.
///
/// The front-matter block must start on the first line with `---` and end at
/// the next `---` line. A document without a fence has empty metadata.
/// An opening fence without a closing one is treated as body text.
pub fn extract_front_matter(source: &str) -> Result<(FrontMatter, &str)> {
    let trimmed = source.trim_start_matches('\u{feff}');
    let Some(rest) = trimmed.strip_prefix("---") else {
        return Ok((FrontMatter::default(), trimmed));
    };
    let Some(end) = rest.find("\n---") else {
        return Ok((FrontMatter::default(), trimmed));
    };

    let raw = &rest[..end];
    let body = rest[end + 4..].trim_start_matches(['\r', '\n']);

    if raw.trim().is_empty() {
        return Ok((FrontMatter::default(), body));
    }
    let map: BTreeMap<String, serde_yaml::Value> = serde_yaml::from_str(raw)?;
    Ok((FrontMatter(map), body))
}

/// Render a Markdown body to HTML.
pub fn render(body: &str) -> String {
    let mut options = Options::empty();
    options.insert(Options::ENABLE_TABLES);
    options.insert(Options::ENABLE_FOOTNOTES);
    options.insert(Options::ENABLE_STRIKETHROUGH);
    options.insert(Options::ENABLE_DEFINITION_LIST);

    let parser = Parser::new_ext(body, options);
    let mut out = String::with_capacity(body.len() * 2);
    html::push_html(&mut out, parser);
    out
}

/// Read and parse a document from disk.
///
/// # Errors
/// Returns [`Error::DocumentRead`] if the file is unreadable or not valid
/// UTF-8, and [`Error::Yaml`] if the front-matter block is malformed.
pub async fn load_document(path: &Path) -> Result<Document> {
    let bytes = tokio::fs::read(path).await.map_err(|e| Error::DocumentRead {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    let source = String::from_utf8(bytes).map_err(|e| Error::DocumentRead {
        path: path.to_path_buf(),
        reason: format!("not valid UTF-8: {}", e),
    })?;

    let (front_matter, body) = extract_front_matter(&source)?;
    let body_html = render(body);

    Ok(Document {
        path: path.to_path_buf(),
        front_matter,
        body_html,
    })
}

/// Resolve the article title for a document.
///
/// Fallback order: explicit `title` metadata, first `<h1>` in the rendered
/// HTML, then the file base name.
pub fn resolve_title(document: &Document) -> String {
    let title = document.front_matter.scalar("title");
    if !title.is_empty() {
        return title;
    }
    if let Some(h1) = first_h1(&document.body_html) {
        return h1;
    }
    document
        .path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Extract the text content of the first `<h1>` element, if any.
fn first_h1(body_html: &str) -> Option<String> {
    static H1_RE: OnceLock<Regex> = OnceLock::new();
    static TAG_RE: OnceLock<Regex> = OnceLock::new();
    #[allow(clippy::expect_used)]
    let h1_re =
        H1_RE.get_or_init(|| Regex::new(r"(?s)<h1[^>]*>(.*?)</h1>").expect("static pattern"));
    #[allow(clippy::expect_used)]
    let tag_re = TAG_RE.get_or_init(|| Regex::new(r"<[^>]+>").expect("static pattern"));

    let inner = h1_re.captures(body_html)?.get(1)?.as_str();
    let text = tag_re.replace_all(inner, "").trim().to_string();
    (!text.is_empty()).then_some(text)
}

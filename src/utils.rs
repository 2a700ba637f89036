//! Small helpers shared across the pipeline.

use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Truncate a string to at most `max_chars` characters.
///
/// Counts characters, not bytes, so multi-byte text is never split inside a
/// code point.
pub fn truncate_chars(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => s[..byte_idx].to_string(),
        None => s.to_string(),
    }
}

/// Escape text for embedding in HTML content or attribute values.
pub fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// Move a published source file out of the watch tree.
///
/// The file's path relative to `watch_dir` is preserved under
/// `published_dir`, so `watch/blog/2024/post.md` lands at
/// `published/blog/2024/post.md`. Missing target directories are created.
///
/// # Errors
/// Returns [`Error::Other`] if the file lies outside the watch root, and
/// [`Error::Io`] if the rename or directory creation fails.
pub fn move_to_published(path: &Path, watch_dir: &Path, published_dir: &Path) -> Result<PathBuf> {
    let relative = path.strip_prefix(watch_dir).map_err(|_| {
        Error::Other(format!(
            "'{}' is not under the watch directory '{}'",
            path.display(),
            watch_dir.display()
        ))
    })?;

    let target = published_dir.join(relative);
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::rename(path, &target)?;
    Ok(target)
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncation_counts_characters_not_bytes() {
        assert_eq!(truncate_chars("hello", 10), "hello");
        assert_eq!(truncate_chars("hello", 3), "hel");
        // Four three-byte characters; a byte-based cut at 8 would panic.
        assert_eq!(truncate_chars("文章标题", 2), "文章");
        assert_eq!(truncate_chars("", 5), "");
    }

    #[test]
    fn html_escaping_covers_attribute_context() {
        assert_eq!(
            escape_html(r#"<a href="x">&'"#),
            "&lt;a href=&quot;x&quot;&gt;&amp;&#39;"
        );
        assert_eq!(escape_html("plain"), "plain");
    }

    #[test]
    fn move_preserves_relative_subpath() {
        let root = tempfile::tempdir().unwrap();
        let watch = root.path().join("watch");
        let published = root.path().join("published");
        std::fs::create_dir_all(watch.join("blog/2024")).unwrap();

        let source = watch.join("blog/2024/post.md");
        std::fs::write(&source, "# post").unwrap();

        let target = move_to_published(&source, &watch, &published).unwrap();
        assert_eq!(target, published.join("blog/2024/post.md"));
        assert!(!source.exists());
        assert_eq!(std::fs::read_to_string(target).unwrap(), "# post");
    }

    #[test]
    fn move_rejects_paths_outside_watch_root() {
        let root = tempfile::tempdir().unwrap();
        let stray = root.path().join("stray.md");
        std::fs::write(&stray, "x").unwrap();

        let err = move_to_published(
            &stray,
            &root.path().join("watch"),
            &root.path().join("published"),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Other(_)));
        assert!(stray.exists());
    }
}

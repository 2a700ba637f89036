//! Article assembly: image rewriting, cover selection, and styling.
//!
//! This is the orchestration layer between the Markdown transform, the image
//! resolver, and the platform uploader. It rewrites every `<img>` reference
//! in the body to a platform-hosted URL where possible, picks the cover image
//! by the selection policy, and wraps the result in the styling shell with
//! all CSS inlined as `style` attributes.

use regex::Regex;
use std::path::Path;
use std::sync::OnceLock;

use tracing::{info, warn};

use crate::error::Result;
use crate::images::{ImageResolver, ScratchGuard};
use crate::markdown::{self, FrontMatter};
use crate::types::{Article, Document, ResolvedImage};
use crate::uploader::MediaUploader;
use crate::utils::escape_html;

/// Body HTML after image rewriting, plus the cover candidates found along
/// the way (document order).
#[derive(Debug)]
pub struct AssembledBody {
    /// Rewritten body HTML
    pub html: String,
    /// Every image that resolved to an existing local file, in document
    /// order, regardless of whether its inline upload succeeded
    pub candidates: Vec<ResolvedImage>,
}

#[allow(clippy::expect_used)]
fn img_tag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<img\b[^>]*>").expect("static pattern"))
}

#[allow(clippy::expect_used)]
fn data_src_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"data-src\s*=\s*["']([^"']*)["']"#).expect("static pattern"))
}

#[allow(clippy::expect_used)]
fn src_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"(src\s*=\s*["'])([^"']*)(["'])"#).expect("static pattern"))
}

/// Extract the effective source of an `<img>` tag.
///
/// `data-src` wins over `src`, matching the lazy-load convention of
/// platform-exported HTML.
fn img_src(tag: &str) -> Option<String> {
    if let Some(captures) = data_src_re().captures(tag) {
        return Some(captures[1].to_string());
    }
    // data-src handled above; make sure we don't match its tail here.
    for captures in src_re().captures_iter(tag) {
        let start = captures.get(1).map(|m| m.start()).unwrap_or(0);
        if start == 0 || !tag[..start].ends_with("data-") {
            return Some(captures[2].to_string());
        }
    }
    None
}

/// Replace (or insert) the plain `src` attribute of an `<img>` tag.
///
/// `data-src` is left untouched so the original reference stays recoverable.
fn set_img_src(tag: &str, url: &str) -> String {
    for captures in src_re().captures_iter(tag) {
        let Some(whole) = captures.get(0) else {
            continue;
        };
        if tag[..whole.start()].ends_with("data-") {
            continue;
        }
        let Some(value) = captures.get(2) else {
            continue;
        };
        let mut out = String::with_capacity(tag.len() + url.len());
        out.push_str(&tag[..value.start()]);
        out.push_str(url);
        out.push_str(&tag[value.end()..]);
        return out;
    }

    // No plain src attribute; append one before the closing bracket.
    if let Some(stripped) = tag.strip_suffix("/>") {
        format!("{} src=\"{}\" />", stripped.trim_end(), url)
    } else if let Some(stripped) = tag.strip_suffix('>') {
        format!("{} src=\"{}\">", stripped.trim_end(), url)
    } else {
        tag.to_string()
    }
}

/// Rewrite every `<img>` reference in the body.
///
/// Each reference is resolved and, if resolved, uploaded as an inline image;
/// a successful upload rewrites the `src` to the platform URL. Failure at
/// either step leaves the tag untouched and never aborts the pipeline.
/// Scratch downloads are tracked in `scratch` for the caller's single
/// cleanup stage.
pub async fn rewrite_images(
    html: &str,
    base_dir: &Path,
    resolver: &ImageResolver,
    uploader: &MediaUploader,
    scratch: &mut ScratchGuard,
) -> Result<AssembledBody> {
    let tags: Vec<(std::ops::Range<usize>, String)> = img_tag_re()
        .find_iter(html)
        .map(|m| (m.range(), m.as_str().to_string()))
        .collect();

    let mut out = String::with_capacity(html.len());
    let mut candidates = Vec::new();
    let mut last = 0;

    for (range, tag) in tags {
        out.push_str(&html[last..range.start]);
        last = range.end;

        let Some(src) = img_src(&tag) else {
            out.push_str(&tag);
            continue;
        };

        match resolver.resolve(&src, base_dir).await {
            Some(resolved) => {
                scratch.track(&resolved);
                // A resolved image is a cover candidate whether or not its
                // inline upload goes through.
                candidates.push(resolved.clone());
                match uploader.upload_inline(&resolved.local_path).await? {
                    Some(url) => out.push_str(&set_img_src(&tag, &url)),
                    None => {
                        warn!(src = %src, "inline upload failed, keeping original reference");
                        out.push_str(&tag);
                    }
                }
            }
            None => out.push_str(&tag),
        }
    }
    out.push_str(&html[last..]);

    Ok(AssembledBody {
        html: out,
        candidates,
    })
}

/// Select and upload the cover image.
///
/// Policy, first success wins: the front-matter `cover` reference, then the
/// first cover candidate from the body. Returns the platform media id, or
/// `None` when the document has no usable cover.
pub async fn select_cover(
    front_matter: &FrontMatter,
    candidates: &[ResolvedImage],
    base_dir: &Path,
    resolver: &ImageResolver,
    uploader: &MediaUploader,
    scratch: &mut ScratchGuard,
) -> Result<Option<String>> {
    let declared = front_matter.scalar("cover");
    if !declared.is_empty() {
        if let Some(resolved) = resolver.resolve(&declared, base_dir).await {
            scratch.track(&resolved);
            if let Some(media_id) = uploader.upload_thumb(&resolved.local_path).await? {
                return Ok(Some(media_id));
            }
            warn!(cover = %declared, "declared cover failed to upload, trying body images");
        } else {
            warn!(cover = %declared, "declared cover could not be resolved, trying body images");
        }
    }

    if let Some(first) = candidates.first() {
        if let Some(media_id) = uploader.upload_thumb(&first.local_path).await? {
            return Ok(Some(media_id));
        }
        warn!(path = %first.local_path.display(), "first body image failed to upload as cover");
    }

    Ok(None)
}

/// Assemble a document into a platform-ready article.
///
/// Runs image rewriting, cover selection, and styling. Returns `Ok(None)`
/// when the document yields no cover — the article is never drafted without
/// one. All scratch downloads are deleted in a single cleanup stage that
/// runs regardless of how assembly ends.
pub async fn assemble(
    document: &Document,
    default_author: &str,
    resolver: &ImageResolver,
    uploader: &MediaUploader,
) -> Result<Option<Article>> {
    let mut scratch = ScratchGuard::new();
    let result = assemble_inner(document, default_author, resolver, uploader, &mut scratch).await;
    scratch.cleanup();
    result
}

async fn assemble_inner(
    document: &Document,
    default_author: &str,
    resolver: &ImageResolver,
    uploader: &MediaUploader,
    scratch: &mut ScratchGuard,
) -> Result<Option<Article>> {
    let base_dir = document.path.parent().unwrap_or_else(|| Path::new("."));
    let title = markdown::resolve_title(document);

    let author = {
        let declared = document.front_matter.scalar("author");
        if declared.is_empty() {
            default_author.to_string()
        } else {
            declared
        }
    };
    let digest = document.front_matter.scalar("digest");

    let body = rewrite_images(&document.body_html, base_dir, resolver, uploader, scratch).await?;

    let cover_media_id = select_cover(
        &document.front_matter,
        &body.candidates,
        base_dir,
        resolver,
        uploader,
        scratch,
    )
    .await?;

    let Some(cover_media_id) = cover_media_id else {
        warn!(title = %title, "no usable cover image, document will not be drafted");
        return Ok(None);
    };

    info!(title = %title, images = body.candidates.len(), "article assembled");
    let body_html = wrap_with_style(&body.html, &title);
    Ok(Some(Article {
        title,
        author,
        digest,
        body_html,
        cover_media_id,
    }))
}

/// Per-tag style declarations, inlined into the final HTML so the article
/// carries no external style dependencies.
const STYLE_RULES: &[(&str, &str)] = &[
    (
        "h1",
        "color: #1a1a1a; font-size: 1.6em; margin: 1.5em 0 0.5em 0;",
    ),
    (
        "h2",
        "color: #1a1a1a; font-size: 1.4em; margin: 1.5em 0 0.5em 0;",
    ),
    (
        "h3",
        "color: #1a1a1a; font-size: 1.2em; margin: 1.2em 0 0.5em 0;",
    ),
    ("p", "margin: 0 0 1em 0; line-height: 1.6;"),
    ("a", "color: #007bff; text-decoration: none;"),
    (
        "img",
        "max-width: 100%; height: auto; border-radius: 4px; margin: 10px 0;",
    ),
    (
        "pre",
        "background: #f5f5f5; padding: 15px; border-radius: 4px; overflow-x: auto;",
    ),
    (
        "code",
        "font-family: Consolas, Menlo, Courier, monospace; background: #f5f5f5; border-radius: 3px;",
    ),
    (
        "blockquote",
        "border-left: 4px solid #ccc; padding-left: 10px; color: #666; margin-left: 0;",
    ),
    (
        "table",
        "border-collapse: collapse; width: 100%; margin-bottom: 1em;",
    ),
    (
        "th",
        "border: 1px solid #ddd; padding: 8px; text-align: left; background-color: #f2f2f2;",
    ),
    ("td", "border: 1px solid #ddd; padding: 8px; text-align: left;"),
];

/// Style applied to the wrapping `<article>` element.
const ARTICLE_STYLE: &str = "font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, \
     'Helvetica Neue', Arial, sans-serif; color: #333; line-height: 1.6;";

/// Wrap body HTML in the styling shell, inlining every style rule.
pub fn wrap_with_style(body_html: &str, title: &str) -> String {
    let mut styled = body_html.to_string();
    for (tag, style) in STYLE_RULES {
        #[allow(clippy::expect_used)]
        let re = Regex::new(&format!(r"<{}\b", tag)).expect("static pattern");
        styled = re
            .replace_all(&styled, format!("<{} style=\"{}\"", tag, style))
            .into_owned();
    }

    format!(
        "<!DOCTYPE html><html><head><meta charset=\"utf-8\"><title>{}</title></head>\
         <body><article style=\"{}\">{}</article></body></html>",
        escape_html(title),
        ARTICLE_STYLE,
        styled
    )
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AccountConfig, PlatformKind, PublishConfig};
    use serde_json::json;
    use std::path::PathBuf;
    use std::time::Duration;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_uploader(server: &MockServer) -> MediaUploader {
        let account = AccountConfig {
            platform: PlatformKind::Wechat,
            app_id: "id".to_string(),
            app_secret: "secret".to_string(),
            author: String::new(),
            api_base_url: Some(server.uri()),
        };
        MediaUploader::new(&account, &PublishConfig::default())
    }

    fn test_resolver() -> ImageResolver {
        ImageResolver::new(Duration::from_secs(2))
    }

    async fn mount_token(server: &MockServer) {
        Mock::given(method("GET"))
            .and(path("/cgi-bin/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "T", "expires_in": 7200,
            })))
            .mount(server)
            .await;
    }

    async fn mount_inline_upload(server: &MockServer, url: &str) {
        Mock::given(method("POST"))
            .and(path("/cgi-bin/media/uploadimg"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "url": url })))
            .mount(server)
            .await;
    }

    async fn mount_thumb_upload(server: &MockServer, media_id: &str) {
        Mock::given(method("POST"))
            .and(path("/cgi-bin/material/add_material"))
            .and(query_param("type", "thumb"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "media_id": media_id })))
            .mount(server)
            .await;
    }

    fn write_png(dir: &Path, name: &str) -> PathBuf {
        let img = image::RgbImage::from_pixel(4, 4, image::Rgb([0, 120, 240]));
        let path = dir.join(name);
        img.save(&path).unwrap();
        path
    }

    fn doc_in(dir: &Path, source: &str) -> Document {
        let (front_matter, body) = markdown::extract_front_matter(source).unwrap();
        Document {
            path: dir.join("article.md"),
            front_matter,
            body_html: markdown::render(body),
        }
    }

    #[test]
    fn img_src_prefers_data_src() {
        let tag = r#"<img data-src="real.png" src="placeholder.gif">"#;
        assert_eq!(img_src(tag).as_deref(), Some("real.png"));
        assert_eq!(
            img_src(r#"<img src="only.png" alt="x">"#).as_deref(),
            Some("only.png")
        );
        assert_eq!(img_src("<img alt=\"no source\">"), None);
    }

    #[test]
    fn set_img_src_replaces_existing_attribute() {
        let tag = r#"<img src="old.png" alt="x">"#;
        assert_eq!(
            set_img_src(tag, "https://cdn/new.png"),
            r#"<img src="https://cdn/new.png" alt="x">"#
        );

        // data-src keeps the original reference; only src is rewritten.
        let both = r#"<img data-src="lazy.png" src="old.png">"#;
        assert_eq!(
            set_img_src(both, "https://cdn/new.png"),
            r#"<img data-src="lazy.png" src="https://cdn/new.png">"#
        );
    }

    #[test]
    fn set_img_src_inserts_when_only_data_src() {
        let tag = r#"<img data-src="lazy.png">"#;
        let out = set_img_src(tag, "https://cdn/new.png");
        assert!(out.contains(r#"src="https://cdn/new.png""#));
        assert!(out.contains("data-src"));
    }

    #[tokio::test]
    async fn successful_inline_upload_rewrites_src() {
        let server = MockServer::start().await;
        mount_token(&server).await;
        mount_inline_upload(&server, "https://cdn.example/hosted.png").await;

        let dir = tempfile::tempdir().unwrap();
        write_png(dir.path(), "pic.png");

        let mut scratch = ScratchGuard::new();
        let body = rewrite_images(
            r#"<p><img src="pic.png" alt="a pic" /></p>"#,
            dir.path(),
            &test_resolver(),
            &test_uploader(&server),
            &mut scratch,
        )
        .await
        .unwrap();

        assert!(body.html.contains(r#"src="https://cdn.example/hosted.png""#));
        assert_eq!(body.candidates.len(), 1);
        assert!(!body.candidates[0].is_temporary);
    }

    #[tokio::test]
    async fn failed_inline_upload_keeps_original_and_candidate() {
        // Upload returns 500 but the local file exists: the tag stays
        // untouched and the image still becomes the cover candidate.
        let server = MockServer::start().await;
        mount_token(&server).await;
        Mock::given(method("POST"))
            .and(path("/cgi-bin/media/uploadimg"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        mount_thumb_upload(&server, "COVER-1").await;

        let dir = tempfile::tempdir().unwrap();
        write_png(dir.path(), "pic.png");
        let document = doc_in(dir.path(), "# T\n\n![a pic](pic.png)\n");

        let mut scratch = ScratchGuard::new();
        let body = rewrite_images(
            &document.body_html,
            dir.path(),
            &test_resolver(),
            &test_uploader(&server),
            &mut scratch,
        )
        .await
        .unwrap();

        assert!(body.html.contains(r#"src="pic.png""#), "original src kept");
        assert_eq!(body.candidates.len(), 1);

        // Cover upload is attempted independently and succeeds.
        let cover = select_cover(
            &document.front_matter,
            &body.candidates,
            dir.path(),
            &test_resolver(),
            &test_uploader(&server),
            &mut scratch,
        )
        .await
        .unwrap();
        assert_eq!(cover.as_deref(), Some("COVER-1"));
    }

    #[tokio::test]
    async fn unresolved_images_are_left_alone() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();

        let html = concat!(
            r#"<img src="missing.png">"#,
            r#"<img src="data:image/png;base64,AAAA">"#,
        );
        let mut scratch = ScratchGuard::new();
        let body = rewrite_images(
            html,
            dir.path(),
            &test_resolver(),
            &test_uploader(&server),
            &mut scratch,
        )
        .await
        .unwrap();

        assert_eq!(body.html, html);
        assert!(body.candidates.is_empty());
    }

    #[tokio::test]
    async fn declared_cover_wins_over_body_images() {
        // Front-matter cover exists: used even though a body image is also
        // available.
        let server = MockServer::start().await;
        mount_token(&server).await;
        mount_inline_upload(&server, "https://cdn.example/inline.png").await;
        mount_thumb_upload(&server, "COVER-DECLARED").await;

        let dir = tempfile::tempdir().unwrap();
        write_png(dir.path(), "cover.png");
        write_png(dir.path(), "body.png");
        let document = doc_in(
            dir.path(),
            "---\ntitle: T\ncover: cover.png\n---\n![b](body.png)\n",
        );

        let article = assemble(
            &document,
            "Default Author",
            &test_resolver(),
            &test_uploader(&server),
        )
        .await
        .unwrap()
        .unwrap();

        assert_eq!(article.cover_media_id, "COVER-DECLARED");
        assert_eq!(article.title, "T");
        assert_eq!(article.author, "Default Author");
        // The styled shell carries the resolved title alongside the body.
        assert!(article.body_html.contains("<title>T</title>"));
        assert!(article.body_html.contains("cdn.example/inline.png"));
    }

    #[tokio::test]
    async fn document_without_cover_is_skipped() {
        // No images and no cover front-matter: no article.
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let document = doc_in(dir.path(), "plain text, nothing else\n");

        let article = assemble(
            &document,
            "",
            &test_resolver(),
            &test_uploader(&server),
        )
        .await
        .unwrap();
        assert!(article.is_none());
    }

    #[tokio::test]
    async fn remote_download_is_cleaned_up_after_rewriting() {
        let server = MockServer::start().await;
        mount_token(&server).await;
        mount_inline_upload(&server, "https://cdn.example/inline.png").await;
        Mock::given(method("GET"))
            .and(path("/remote/pic.png"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(&[0x89u8, b'P', b'N', b'G'][..]))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let html = format!(r#"<img src="{}/remote/pic.png">"#, server.uri());

        let mut scratch = ScratchGuard::new();
        let body = rewrite_images(
            &html,
            dir.path(),
            &test_resolver(),
            &test_uploader(&server),
            &mut scratch,
        )
        .await
        .unwrap();

        assert_eq!(body.candidates.len(), 1);
        let downloaded = body.candidates[0].local_path.clone();
        assert!(body.candidates[0].is_temporary);
        assert!(downloaded.exists(), "scratch file lives through assembly");

        scratch.cleanup();
        assert!(!downloaded.exists(), "cleanup stage removes the download");
    }

    #[test]
    fn styling_shell_inlines_rules() {
        let html = wrap_with_style("<p>hello</p><pre><code>x</code></pre>", "My <Title>");
        assert!(html.contains(r#"<p style="margin: 0 0 1em 0"#));
        assert!(html.contains(r#"<pre style="background: #f5f5f5"#));
        assert!(html.contains("&lt;Title&gt;"));
        assert!(!html.contains("<style>"), "no external style block");
        assert!(html.contains("<article style="));
    }
}

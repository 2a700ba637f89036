//! Image reference resolution.
//!
//! Every `<img>` source in a document is classified as local, remote, or
//! inline (`data:`). Remote references are downloaded to uniquely named
//! scratch files; local references are checked against the document's
//! directory. Resolution never fails the pipeline — an image that cannot be
//! resolved is skipped with a warning and its tag is left untouched.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, warn};
use url::Url;

use crate::types::{ImageReference, ResolvedImage};

/// Resolves raw image references to local readable files.
#[derive(Clone)]
pub struct ImageResolver {
    client: reqwest::Client,
    download_timeout: Duration,
}

impl ImageResolver {
    /// Create a resolver with the given remote-download timeout.
    pub fn new(download_timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            download_timeout,
        }
    }

    /// Resolve a raw `src` attribute to a local file.
    ///
    /// Returns `None` for anything that cannot be resolved: `data:` URIs,
    /// missing local files, and failed downloads. Remote successes always
    /// carry `is_temporary = true`; local successes never do.
    pub async fn resolve(&self, src: &str, base_dir: &Path) -> Option<ResolvedImage> {
        match ImageReference::classify(src) {
            ImageReference::Remote(url) => self.download(&url).await,
            ImageReference::Inline => {
                debug!(src = %truncate_for_log(src), "data: image left as-is");
                None
            }
            ImageReference::Local(rel) => {
                let path = base_dir.join(rel);
                if path.exists() {
                    Some(ResolvedImage {
                        local_path: path,
                        is_temporary: false,
                    })
                } else {
                    warn!(path = %path.display(), "local image not found, skipping");
                    None
                }
            }
        }
    }

    /// Download a remote image to a scratch file, preserving the URL's
    /// extension (default `.jpg`).
    ///
    /// Any network failure resolves to `None` — the caller skips the image.
    async fn download(&self, url: &str) -> Option<ResolvedImage> {
        let response = match self
            .client
            .get(url)
            .timeout(self.download_timeout)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
        {
            Ok(r) => r,
            Err(e) => {
                warn!(url = %url, error = %e, "failed to download remote image, skipping");
                return None;
            }
        };

        let bytes = match response.bytes().await {
            Ok(b) => b,
            Err(e) => {
                warn!(url = %url, error = %e, "failed to read remote image body, skipping");
                return None;
            }
        };

        let suffix = url_extension(url).unwrap_or_else(|| ".jpg".to_string());
        let path = match write_scratch(&bytes, &suffix) {
            Ok(p) => p,
            Err(e) => {
                warn!(url = %url, error = %e, "failed to write scratch file, skipping");
                return None;
            }
        };

        debug!(url = %url, path = %path.display(), "downloaded remote image");
        Some(ResolvedImage {
            local_path: path,
            is_temporary: true,
        })
    }
}

/// Write bytes to a uniquely named scratch file that outlives the handle.
pub(crate) fn write_scratch(bytes: &[u8], suffix: &str) -> std::io::Result<PathBuf> {
    let mut file = tempfile::Builder::new()
        .prefix("md-publisher-")
        .suffix(suffix)
        .tempfile()?;
    file.write_all(bytes)?;
    file.into_temp_path().keep().map_err(|e| e.error)
}

/// Extract the file extension (with leading dot) from a URL's path.
fn url_extension(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let ext = Path::new(parsed.path()).extension()?.to_str()?.to_string();
    Some(format!(".{}", ext))
}

fn truncate_for_log(s: &str) -> &str {
    let mut end = s.len().min(48);
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Collects scratch files so they are deleted exactly once.
///
/// Temporary files are exclusively owned by the task that created them.
/// `cleanup` removes everything tracked so far; the `Drop` impl removes
/// whatever remains, so no exit path (including a panic) leaks files.
#[derive(Debug, Default)]
pub struct ScratchGuard {
    paths: Vec<PathBuf>,
}

impl ScratchGuard {
    /// Create an empty guard.
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a resolved image's scratch file, if it has one.
    pub fn track(&mut self, image: &ResolvedImage) {
        if image.is_temporary {
            self.paths.push(image.local_path.clone());
        }
    }

    /// Delete every tracked scratch file.
    pub fn cleanup(&mut self) {
        for path in self.paths.drain(..) {
            if let Err(e) = std::fs::remove_file(&path) {
                warn!(path = %path.display(), error = %e, "failed to delete scratch file");
            } else {
                debug!(path = %path.display(), "deleted scratch file");
            }
        }
    }
}

impl Drop for ScratchGuard {
    fn drop(&mut self) {
        self.cleanup();
    }
}

//! Platform media uploads and access-token lifecycle.
//!
//! The uploader owns the per-account token cache and the two media upload
//! kinds the draft API needs: inline images (returning a remote URL) and
//! cover thumbnails (returning an opaque media id). Upload failures are never
//! fatal here — they surface as `Ok(None)` and the caller decides whether a
//! missing image is acceptable. Only token failures are hard errors, because
//! no authenticated call can proceed without one.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::{AccountConfig, PublishConfig};
use crate::error::{Error, Result};
use crate::images::write_scratch;

/// Default platform API base URL (WeChat Official Account API).
pub(crate) const DEFAULT_BASE_URL: &str = "https://api.weixin.qq.com";

/// Tokens are considered expired this long before the platform says so, to
/// avoid using a token that dies mid-request.
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);

/// Fallback token lifetime when the platform omits `expires_in`.
const DEFAULT_TOKEN_LIFETIME: Duration = Duration::from_secs(7200);

/// A cached access token.
#[derive(Debug, Clone)]
struct AccessToken {
    value: String,
    expires_at: Instant,
}

impl AccessToken {
    fn is_valid(&self) -> bool {
        Instant::now() < self.expires_at
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    expires_in: Option<u64>,
    errcode: Option<i64>,
    errmsg: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    url: Option<String>,
    media_id: Option<String>,
    errcode: Option<i64>,
    errmsg: Option<String>,
}

/// Uploads media to the platform and manages the account's token cache.
///
/// Cloneable; clones share the same token cache, so concurrent tasks for one
/// account never hold divergent tokens. Refresh is an idempotent
/// GET-and-replace: a stale read triggers a refresh, and a redundant
/// concurrent refresh is harmless.
#[derive(Clone)]
pub struct MediaUploader {
    client: reqwest::Client,
    base_url: String,
    app_id: String,
    app_secret: String,
    token: Arc<RwLock<Option<AccessToken>>>,
    upload_timeout: Duration,
    cover_max_bytes: u64,
}

impl MediaUploader {
    /// Create an uploader for one account.
    pub fn new(account: &AccountConfig, publish: &PublishConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: account
                .api_base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            app_id: account.app_id.clone(),
            app_secret: account.app_secret.clone(),
            token: Arc::new(RwLock::new(None)),
            upload_timeout: publish.upload_timeout,
            cover_max_bytes: publish.cover_max_bytes,
        }
    }

    /// Return a valid access token, refreshing it if the cached one is
    /// missing or expired.
    ///
    /// # Errors
    /// Returns [`Error::Token`] if the token endpoint is unreachable or
    /// reports an error code.
    pub async fn ensure_token(&self) -> Result<String> {
        {
            let guard = self.token.read().await;
            if let Some(token) = guard.as_ref()
                && token.is_valid()
            {
                return Ok(token.value.clone());
            }
        }
        self.refresh_token().await
    }

    /// Fetch a fresh token and replace the cached one.
    async fn refresh_token(&self) -> Result<String> {
        let url = format!(
            "{}/cgi-bin/token?grant_type=client_credential&appid={}&secret={}",
            self.base_url, self.app_id, self.app_secret
        );

        let response: TokenResponse = self
            .client
            .get(&url)
            .timeout(self.upload_timeout)
            .send()
            .await
            .map_err(|e| Error::Token(format!("token request failed: {}", e)))?
            .json()
            .await
            .map_err(|e| Error::Token(format!("malformed token response: {}", e)))?;

        let Some(value) = response.access_token else {
            return Err(Error::Token(format!(
                "platform refused token (errcode {}): {}",
                response.errcode.unwrap_or(-1),
                response.errmsg.unwrap_or_else(|| "unknown error".to_string())
            )));
        };

        let lifetime = response
            .expires_in
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_TOKEN_LIFETIME);
        let token = AccessToken {
            value: value.clone(),
            expires_at: Instant::now() + lifetime.saturating_sub(TOKEN_REFRESH_MARGIN),
        };

        // Idempotent replace: a racing refresh stored an equally fresh token.
        *self.token.write().await = Some(token);
        info!("access token refreshed");
        Ok(value)
    }

    /// Upload an image appearing in the article body.
    ///
    /// Returns the platform-hosted URL on success, `None` (with a warning)
    /// when the platform rejects the upload or the transfer fails.
    pub async fn upload_inline(&self, path: &Path) -> Result<Option<String>> {
        self.upload_media(path, "/cgi-bin/media/uploadimg", "", UploadKey::Url)
            .await
    }

    /// Upload an image as the article cover (a distinct media class).
    ///
    /// Oversized sources are transparently recompressed to JPEG quality 85
    /// first; the recompressed scratch file is deleted after the attempt
    /// regardless of outcome. Returns the opaque media id on success.
    pub async fn upload_thumb(&self, path: &Path) -> Result<Option<String>> {
        let (upload_path, recompressed) = self.recompress_if_needed(path).await;
        let result = self
            .upload_media(
                &upload_path,
                "/cgi-bin/material/add_material",
                "&type=thumb",
                UploadKey::MediaId,
            )
            .await;
        if recompressed
            && let Err(e) = std::fs::remove_file(&upload_path)
        {
            warn!(path = %upload_path.display(), error = %e, "failed to delete recompressed cover");
        }
        result
    }

    /// Shared multipart upload call.
    ///
    /// Token failures propagate as errors; everything else degrades to
    /// `Ok(None)` with a warning.
    async fn upload_media(
        &self,
        path: &Path,
        endpoint: &str,
        extra_query: &str,
        key: UploadKey,
    ) -> Result<Option<String>> {
        let token = self.ensure_token().await?;

        let bytes = match tokio::fs::read(path).await {
            Ok(b) => b,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "media file unreadable, skipping upload");
                return Ok(None);
            }
        };
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "media".to_string());
        let form = reqwest::multipart::Form::new()
            .part("media", reqwest::multipart::Part::bytes(bytes).file_name(file_name));

        let url = format!(
            "{}{}?access_token={}{}",
            self.base_url, endpoint, token, extra_query
        );
        let response = match self
            .client
            .post(&url)
            .multipart(form)
            .timeout(self.upload_timeout)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "media upload failed");
                return Ok(None);
            }
        };

        let parsed: UploadResponse = match response.json().await {
            Ok(p) => p,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "malformed upload response");
                return Ok(None);
            }
        };

        let extracted = match key {
            UploadKey::Url => parsed.url,
            UploadKey::MediaId => parsed.media_id,
        };
        match extracted {
            Some(value) => {
                debug!(path = %path.display(), "media uploaded");
                Ok(Some(value))
            }
            None => {
                warn!(
                    path = %path.display(),
                    errcode = parsed.errcode.unwrap_or(-1),
                    errmsg = %parsed.errmsg.unwrap_or_else(|| "unknown error".to_string()),
                    "platform rejected media upload"
                );
                Ok(None)
            }
        }
    }

    /// Recompress a cover source that exceeds the size threshold.
    ///
    /// Returns the path to upload and whether it is a scratch file the caller
    /// must delete. Recompression failures fall back to the original file.
    async fn recompress_if_needed(&self, path: &Path) -> (PathBuf, bool) {
        let size = match tokio::fs::metadata(path).await {
            Ok(m) => m.len(),
            Err(_) => return (path.to_path_buf(), false),
        };
        if size <= self.cover_max_bytes {
            return (path.to_path_buf(), false);
        }

        let source = path.to_path_buf();
        let encoded = tokio::task::spawn_blocking(move || recompress_jpeg(&source)).await;
        match encoded {
            Ok(Ok(scratch)) => {
                info!(
                    path = %path.display(),
                    original_bytes = size,
                    "cover recompressed to JPEG quality 85"
                );
                (scratch, true)
            }
            Ok(Err(e)) => {
                warn!(path = %path.display(), error = %e, "cover recompression failed, uploading original");
                (path.to_path_buf(), false)
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cover recompression task failed, uploading original");
                (path.to_path_buf(), false)
            }
        }
    }
}

/// Which response field carries the upload result.
#[derive(Clone, Copy)]
enum UploadKey {
    Url,
    MediaId,
}

/// Re-encode an image as JPEG quality 85 into a new scratch file.
fn recompress_jpeg(path: &Path) -> Result<PathBuf> {
    let img = image::open(path).map_err(|e| Error::Other(format!("decode failed: {}", e)))?;
    let mut buf = std::io::Cursor::new(Vec::new());
    let encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut buf, 85);
    // Drop any alpha channel; JPEG has none.
    img.to_rgb8()
        .write_with_encoder(encoder)
        .map_err(|e| Error::Other(format!("encode failed: {}", e)))?;
    Ok(write_scratch(buf.get_ref(), ".jpg")?)
}

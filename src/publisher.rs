//! Platform publishers.
//!
//! A publisher turns an assembled article into a platform draft. The set of
//! platforms is a closed enum: configuration names a [`PlatformKind`], and
//! [`build_publisher`] maps it to the concrete implementation. Platforms
//! without one get an explicit unsupported publisher that fails with a typed
//! error instead of silently doing nothing.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use tracing::{info, warn};

use crate::assembler;
use crate::config::{AccountConfig, PlatformKind, PublishConfig};
use crate::error::{Error, Result};
use crate::images::ImageResolver;
use crate::types::{Article, Document, PublishOutcome};
use crate::uploader::{DEFAULT_BASE_URL, MediaUploader};
use crate::utils::truncate_chars;

/// Platform cap on draft titles, in characters.
const TITLE_MAX_CHARS: usize = 64;
/// Platform cap on the author byline, in characters.
const AUTHOR_MAX_CHARS: usize = 8;
/// Platform cap on the digest, in characters.
const DIGEST_MAX_CHARS: usize = 120;

/// A configured publisher for one account.
pub enum Publisher {
    /// WeChat Official Account draft pipeline
    WeChat(WeChatPublisher),
    /// Platform named in configuration but not implemented
    Unsupported {
        /// The platform the account asked for
        platform: PlatformKind,
    },
}

impl Publisher {
    /// Publish a document as a platform draft.
    ///
    /// # Errors
    /// Returns [`Error::NotSupported`] for unimplemented platforms,
    /// [`Error::Token`] when no access token can be obtained, and
    /// [`Error::PublishRejected`] when draft creation fails.
    pub async fn publish(&self, document: &Document) -> Result<PublishOutcome> {
        match self {
            Self::WeChat(publisher) => publisher.publish(document).await,
            Self::Unsupported { platform } => Err(Error::NotSupported(format!(
                "platform '{}' has no publisher implementation",
                platform
            ))),
        }
    }
}

/// Construct the publisher for an account.
pub fn build_publisher(account: &AccountConfig, publish: &PublishConfig) -> Publisher {
    match account.platform {
        PlatformKind::Wechat => Publisher::WeChat(WeChatPublisher::new(account, publish)),
        other => {
            warn!(platform = %other, "account targets an unimplemented platform");
            Publisher::Unsupported { platform: other }
        }
    }
}

#[derive(Debug, Serialize)]
struct DraftArticle<'a> {
    title: String,
    author: String,
    digest: String,
    content: &'a str,
    thumb_media_id: &'a str,
}

#[derive(Debug, Serialize)]
struct DraftRequest<'a> {
    articles: Vec<DraftArticle<'a>>,
}

#[derive(Debug, Deserialize)]
struct DraftResponse {
    media_id: Option<String>,
    errcode: Option<i64>,
    errmsg: Option<String>,
}

/// Publishes articles as WeChat Official Account drafts.
pub struct WeChatPublisher {
    client: reqwest::Client,
    base_url: String,
    resolver: ImageResolver,
    uploader: MediaUploader,
    default_author: String,
    request_timeout: Duration,
}

impl WeChatPublisher {
    /// Create a publisher for one WeChat account.
    pub fn new(account: &AccountConfig, publish: &PublishConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: account
                .api_base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            resolver: ImageResolver::new(publish.download_timeout),
            uploader: MediaUploader::new(account, publish),
            default_author: account.author.clone(),
            request_timeout: publish.upload_timeout,
        }
    }

    /// Run the full pipeline for one document: assemble, then draft.
    pub async fn publish(&self, document: &Document) -> Result<PublishOutcome> {
        let article = assembler::assemble(
            document,
            &self.default_author,
            &self.resolver,
            &self.uploader,
        )
        .await?;

        let Some(article) = article else {
            return Ok(PublishOutcome::Skipped {
                reason: "no usable cover image".to_string(),
            });
        };

        let draft_id = self.create_draft(&article).await?;
        info!(title = %article.title, draft_id = %draft_id, "draft created");
        Ok(PublishOutcome::Published { draft_id })
    }

    /// Submit an assembled article to the draft endpoint.
    ///
    /// Title, author, and digest are truncated to the platform's character
    /// caps here, at the last step before submission.
    async fn create_draft(&self, article: &Article) -> Result<String> {
        let token = self.uploader.ensure_token().await?;
        let request = DraftRequest {
            articles: vec![DraftArticle {
                title: truncate_chars(&article.title, TITLE_MAX_CHARS),
                author: truncate_chars(&article.author, AUTHOR_MAX_CHARS),
                digest: truncate_chars(&article.digest, DIGEST_MAX_CHARS),
                content: &article.body_html,
                thumb_media_id: &article.cover_media_id,
            }],
        };

        let url = format!("{}/cgi-bin/draft/add?access_token={}", self.base_url, token);
        let response: DraftResponse = self
            .client
            .post(&url)
            .json(&request)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| Error::PublishRejected(format!("draft request failed: {}", e)))?
            .json()
            .await
            .map_err(|e| Error::PublishRejected(format!("malformed draft response: {}", e)))?;

        response.media_id.ok_or_else(|| {
            Error::PublishRejected(format!(
                "platform refused draft (errcode {}): {}",
                response.errcode.unwrap_or(-1),
                response.errmsg.unwrap_or_else(|| "unknown error".to_string())
            ))
        })
    }
}

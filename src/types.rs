//! Core types and events shared across the pipeline.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::markdown::FrontMatter;

/// A parsed Markdown document, owned exclusively by one in-flight publish task.
///
/// Immutable once read; the raw source has already been split into
/// front-matter metadata and rendered body HTML.
#[derive(Debug, Clone)]
pub struct Document {
    /// Absolute path of the source file
    pub path: PathBuf,
    /// Parsed front-matter metadata
    pub front_matter: FrontMatter,
    /// Body rendered to HTML (before image rewriting and styling)
    pub body_html: String,
}

/// A fully assembled article, ready for draft submission.
///
/// Assembled once per publish attempt and never mutated after submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Article {
    /// Article title (platform caps applied at submission time)
    pub title: String,
    /// Author byline
    pub author: String,
    /// Short summary shown in feeds
    pub digest: String,
    /// Final body HTML with uploaded image URLs and inlined styles
    pub body_html: String,
    /// Opaque media identifier of the uploaded cover image
    pub cover_media_id: String,
}

/// Classification of a raw `<img>` source attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageReference {
    /// Path relative to the document's directory
    Local(PathBuf),
    /// `http://` or `https://` URL to fetch
    Remote(String),
    /// `data:` URI — out of scope for upload, left as-is in the HTML
    Inline,
}

impl ImageReference {
    /// Classify a raw `src` attribute value.
    pub fn classify(src: &str) -> Self {
        if src.starts_with("http://") || src.starts_with("https://") {
            Self::Remote(src.to_string())
        } else if src.starts_with("data:") {
            Self::Inline
        } else {
            Self::Local(PathBuf::from(src))
        }
    }
}

/// A successfully resolved image reference.
///
/// `is_temporary = true` means the file is a scratch download owned by the
/// resolving task and must be deleted exactly once after the inline-upload and
/// cover-upload phases have both finished with it.
#[derive(Debug, Clone)]
pub struct ResolvedImage {
    /// Local readable path of the image
    pub local_path: PathBuf,
    /// Whether this is a scratch download that the task must delete
    pub is_temporary: bool,
}

/// Terminal result of a single publish task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Draft was created; the response carried this opaque draft identifier
    Published {
        /// Draft identifier returned by the platform
        draft_id: String,
    },
    /// Document was rejected for publishing without being an error
    /// (e.g., no usable cover image); the source file stays in place
    Skipped {
        /// Human-readable reason for the skip
        reason: String,
    },
}

/// Events emitted by the coordinator via the broadcast channel.
///
/// Multiple subscribers are supported; events are informational and dropping
/// them never affects the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    /// A change event was accepted and a publish task dispatched
    DocumentDetected {
        /// Source file path
        path: PathBuf,
        /// Owning account name
        account: String,
    },
    /// A duplicate event for a path already being processed was dropped
    DuplicateDropped {
        /// Source file path
        path: PathBuf,
    },
    /// Draft creation succeeded and the source file was moved
    DocumentPublished {
        /// Source file path (pre-move)
        path: PathBuf,
        /// Owning account name
        account: String,
        /// Draft identifier returned by the platform
        draft_id: String,
    },
    /// The document was skipped as non-retryable (e.g., missing cover)
    DocumentSkipped {
        /// Source file path
        path: PathBuf,
        /// Owning account name
        account: String,
        /// Why the document was skipped
        reason: String,
    },
    /// The publish attempt failed; the file remains for the next cycle
    PublishFailed {
        /// Source file path
        path: PathBuf,
        /// Owning account name
        account: String,
        /// Error description
        error: String,
    },
    /// Coordinator is shutting down
    Shutdown,
}

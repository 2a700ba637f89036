//! Configuration types for md-publisher

use serde::{Deserialize, Serialize};
use std::{collections::HashMap, path::PathBuf, time::Duration};

use crate::error::{Error, Result};

/// Top-level configuration
///
/// All sections have sensible defaults; an empty config watches `./documents`
/// with no accounts (every event is skipped with a warning).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Directory watching settings
    #[serde(default)]
    pub watch: WatchConfig,

    /// Publishing pipeline settings
    #[serde(default)]
    pub publish: PublishConfig,

    /// Accounts keyed by name; the first path segment under the watch root
    /// selects the account for a document
    #[serde(default)]
    pub accounts: HashMap<String, AccountConfig>,
}

impl Config {
    /// Load configuration from a YAML file.
    ///
    /// # Errors
    /// Returns [`Error::Config`] if the file cannot be read, or
    /// [`Error::Yaml`] if it is not valid YAML for this schema.
    pub fn from_yaml_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| Error::Config {
            message: format!("failed to read config file '{}': {}", path.display(), e),
            key: None,
        })?;
        Ok(serde_yaml::from_str(&raw)?)
    }
}

/// Directory watching configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WatchConfig {
    /// Root directory to watch for Markdown documents (default: "./documents")
    #[serde(default = "default_watch_dir")]
    pub watch_dir: PathBuf,

    /// Root directory successful documents are moved into, preserving their
    /// relative sub-path (default: "./published")
    #[serde(default = "default_published_dir")]
    pub published_dir: PathBuf,

    /// File extensions treated as Markdown documents (default: md, markdown)
    #[serde(default = "default_file_types")]
    pub file_types: Vec<String>,

    /// Delay after a change event before reading the file, so writers that
    /// stream content in chunks have finished (default: 1s)
    #[serde(default = "default_settle_delay")]
    pub settle_delay: Duration,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            watch_dir: default_watch_dir(),
            published_dir: default_published_dir(),
            file_types: default_file_types(),
            settle_delay: default_settle_delay(),
        }
    }
}

/// Publishing pipeline configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PublishConfig {
    /// Maximum publish tasks running at once; bounds outbound request
    /// concurrency to each platform (default: 3)
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_publishes: usize,

    /// Timeout for remote image downloads (default: 10s)
    #[serde(default = "default_download_timeout")]
    pub download_timeout: Duration,

    /// Timeout for media uploads and draft creation (default: 30s)
    #[serde(default = "default_upload_timeout")]
    pub upload_timeout: Duration,

    /// Covers larger than this are recompressed to JPEG quality 85 before
    /// upload (default: 2 MiB)
    #[serde(default = "default_cover_max_bytes")]
    pub cover_max_bytes: u64,

    /// How long shutdown waits for in-flight tasks to drain (default: 30s)
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: Duration,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            max_concurrent_publishes: default_max_concurrent(),
            download_timeout: default_download_timeout(),
            upload_timeout: default_upload_timeout(),
            cover_max_bytes: default_cover_max_bytes(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

/// Per-account configuration
///
/// Immutable, shared read-only by all tasks for the account.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AccountConfig {
    /// Target platform kind
    pub platform: PlatformKind,

    /// Platform application id
    #[serde(default)]
    pub app_id: String,

    /// Platform application secret
    #[serde(default)]
    pub app_secret: String,

    /// Default author byline when the document declares none
    #[serde(default)]
    pub author: String,

    /// Override for the platform API base URL (primarily for testing)
    #[serde(default)]
    pub api_base_url: Option<String>,
}

/// Supported target platforms
///
/// An explicit registry: [`crate::publisher::build_publisher`] matches on this
/// to construct the concrete implementation. Kinds without an implementation
/// map to an explicit unsupported publisher that returns a typed error.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlatformKind {
    /// WeChat Official Account draft API (fully implemented)
    Wechat,
    /// Zhihu column articles (not yet implemented)
    Zhihu,
    /// Juejin posts (not yet implemented)
    Juejin,
    /// CSDN blog posts (not yet implemented)
    Csdn,
    /// Toutiao articles (not yet implemented)
    Toutiao,
}

impl std::fmt::Display for PlatformKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Wechat => "wechat",
            Self::Zhihu => "zhihu",
            Self::Juejin => "juejin",
            Self::Csdn => "csdn",
            Self::Toutiao => "toutiao",
        };
        f.write_str(name)
    }
}

fn default_watch_dir() -> PathBuf {
    PathBuf::from("./documents")
}

fn default_published_dir() -> PathBuf {
    PathBuf::from("./published")
}

fn default_file_types() -> Vec<String> {
    vec!["md".to_string(), "markdown".to_string()]
}

fn default_settle_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_concurrent() -> usize {
    3
}

fn default_download_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_upload_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_cover_max_bytes() -> u64 {
    2 * 1024 * 1024
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(30)
}

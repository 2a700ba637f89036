//! Directory watching for automatic document publishing.
//!
//! Watches the configured root recursively and dispatches a publish task for
//! every created or modified Markdown file. Editors and sync tools often
//! write in chunks, so a settle delay runs between the event and the
//! dispatch; the file must still exist afterwards (saves that go through a
//! temp-file rename emit events for paths that vanish).

use notify::{
    Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher,
};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::WatchConfig;
use crate::coordinator::DispatchCoordinator;
use crate::error::{Error, Result};

/// Watches the document tree and feeds the dispatch coordinator.
pub struct DocumentWatcher {
    /// Filesystem watcher instance
    watcher: RecommendedWatcher,

    /// Channel for receiving filesystem events
    rx: mpsc::UnboundedReceiver<notify::Result<Event>>,

    /// Coordinator that runs the publish tasks
    coordinator: Arc<DispatchCoordinator>,

    /// Watch settings (root, extensions, settle delay)
    config: WatchConfig,
}

impl DocumentWatcher {
    /// Create a new document watcher.
    ///
    /// # Errors
    /// Returns [`Error::FolderWatch`] if the filesystem watcher cannot be
    /// initialized.
    pub fn new(coordinator: Arc<DispatchCoordinator>, config: WatchConfig) -> Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();

        let watcher = RecommendedWatcher::new(
            move |res| {
                if let Err(e) = tx.send(res) {
                    error!("failed to forward filesystem event: {}", e);
                }
            },
            NotifyConfig::default(),
        )
        .map_err(|e| Error::FolderWatch(e.to_string()))?;

        Ok(Self {
            watcher,
            rx,
            coordinator,
            config,
        })
    }

    /// Start watching the document root (recursively).
    ///
    /// Creates the root directory if it does not exist yet.
    ///
    /// # Errors
    /// Returns [`Error::FolderWatch`] if the directory cannot be created or
    /// watched.
    pub fn start(&mut self) -> Result<()> {
        if !self.config.watch_dir.exists() {
            std::fs::create_dir_all(&self.config.watch_dir).map_err(|e| {
                Error::FolderWatch(format!("failed to create watch directory: {}", e))
            })?;
            info!(path = %self.config.watch_dir.display(), "created watch directory");
        }

        self.watcher
            .watch(&self.config.watch_dir, RecursiveMode::Recursive)
            .map_err(|e| Error::FolderWatch(format!("failed to watch directory: {}", e)))?;

        info!(path = %self.config.watch_dir.display(), "watching document directory");
        Ok(())
    }

    /// Run the watcher event loop.
    ///
    /// Should be spawned as a tokio task; runs until the event channel
    /// closes (the watcher being dropped) or the coordinator shuts down.
    pub async fn run(mut self) {
        info!("document watcher started");

        while let Some(result) = self.rx.recv().await {
            match result {
                Ok(event) => {
                    if let Err(Error::ShuttingDown) = self.handle_event(event).await {
                        info!("coordinator is shutting down, stopping watcher");
                        break;
                    }
                }
                Err(e) => {
                    error!("filesystem watcher error: {}", e);
                }
            }
        }

        info!("document watcher stopped");
    }

    /// Handle one filesystem event.
    ///
    /// Only create and modify events for Markdown files dispatch a task;
    /// everything else is ignored.
    async fn handle_event(&self, event: Event) -> Result<()> {
        match event.kind {
            EventKind::Create(_) | EventKind::Modify(_) => {
                for path in event.paths {
                    if self.is_markdown_file(&path) {
                        self.process_document(path).await?;
                    }
                }
            }
            _ => {
                // Remove, access, and metadata events are irrelevant here.
            }
        }

        Ok(())
    }

    /// Whether a path has one of the configured Markdown extensions
    /// (case-insensitive).
    fn is_markdown_file(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| {
                self.config
                    .file_types
                    .iter()
                    .any(|t| t.eq_ignore_ascii_case(ext))
            })
            .unwrap_or(false)
    }

    /// Wait out the settle delay, then dispatch the document.
    async fn process_document(&self, path: std::path::PathBuf) -> Result<()> {
        debug!(path = %path.display(), "markdown change detected");
        tokio::time::sleep(self.config.settle_delay).await;

        // Saves via temp-file rename and published moves both leave stale
        // event paths behind.
        if !path.exists() {
            debug!(path = %path.display(), "file gone after settle delay, ignoring");
            return Ok(());
        }

        match self.coordinator.dispatch(path.clone()) {
            Ok(()) => Ok(()),
            Err(Error::ShuttingDown) => Err(Error::ShuttingDown),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to dispatch document");
                Ok(())
            }
        }
    }
}

//! # md-publisher
//!
//! Library for watching a directory tree of Markdown documents and
//! publishing them as platform drafts (WeChat Official Account today).
//!
//! ## Design Philosophy
//!
//! md-publisher is designed to be:
//! - **Drop-a-file simple** - Saving a Markdown file into the watch tree is
//!   the entire publishing workflow
//! - **Sensible defaults** - Works with a minimal config naming one account
//! - **Library-first** - No CLI or UI, purely a Rust crate for embedding
//! - **Event-driven** - Consumers subscribe to events, no polling required
//!
//! ## Quick Start
//!
//! ```no_run
//! use md_publisher::{Config, DispatchCoordinator, DocumentWatcher, run_with_shutdown};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_yaml_file("config.yaml")?;
//!     let watch = config.watch.clone();
//!
//!     let coordinator = Arc::new(DispatchCoordinator::new(config));
//!
//!     // Subscribe to events
//!     let mut events = coordinator.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("Event: {:?}", event);
//!         }
//!     });
//!
//!     let mut watcher = DocumentWatcher::new(Arc::clone(&coordinator), watch)?;
//!     watcher.start()?;
//!     tokio::spawn(watcher.run());
//!
//!     // Run until SIGTERM/SIGINT, then drain in-flight publishes
//!     run_with_shutdown(coordinator).await?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Article assembly (image rewriting, cover selection, styling)
pub mod assembler;
/// Configuration types
pub mod config;
/// Publish dispatch with dedup and bounded concurrency
pub mod coordinator;
/// Error types
pub mod error;
/// Image reference resolution and scratch-file tracking
pub mod images;
/// Markdown parsing and front-matter handling
pub mod markdown;
/// Platform publishers
pub mod publisher;
/// Core types and events
pub mod types;
/// Media uploads and access-token lifecycle
pub mod uploader;
/// Utility functions
pub mod utils;
/// Directory watching for automatic publishing
pub mod watcher;

// Re-export commonly used types
pub use config::{AccountConfig, Config, PlatformKind, PublishConfig, WatchConfig};
pub use coordinator::DispatchCoordinator;
pub use error::{Error, Result};
pub use publisher::{Publisher, WeChatPublisher, build_publisher};
pub use types::{Article, Document, Event, ImageReference, PublishOutcome, ResolvedImage};
pub use watcher::DocumentWatcher;

use std::sync::Arc;

/// Helper function to run the coordinator with graceful signal handling.
///
/// Waits for a termination signal and then calls the coordinator's
/// `shutdown()` method.
///
/// - **Unix:** listens for SIGTERM and SIGINT, with fallbacks if signal
///   registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
pub async fn run_with_shutdown(coordinator: Arc<DispatchCoordinator>) -> Result<()> {
    wait_for_signal().await;
    coordinator.shutdown().await
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    // Registration can fail in restricted environments (containers, tests).
    match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
        (Ok(mut term), Ok(mut int)) => {
            tokio::select! {
                _ = term.recv() => tracing::info!("SIGTERM received, beginning shutdown"),
                _ = int.recv() => tracing::info!("SIGINT received, beginning shutdown"),
            }
        }
        (Ok(mut term), Err(e)) => {
            tracing::warn!(error = %e, "SIGINT handler unavailable, waiting on SIGTERM alone");
            term.recv().await;
            tracing::info!("SIGTERM received, beginning shutdown");
        }
        (Err(e), Ok(mut int)) => {
            tracing::warn!(error = %e, "SIGTERM handler unavailable, waiting on SIGINT alone");
            int.recv().await;
            tracing::info!("SIGINT received, beginning shutdown");
        }
        (Err(_), Err(_)) => {
            tracing::error!("no unix signal handlers available, falling back to ctrl_c");
            tokio::signal::ctrl_c().await.ok();
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "could not listen for Ctrl+C");
        return;
    }
    tracing::info!("Ctrl+C received, beginning shutdown");
}

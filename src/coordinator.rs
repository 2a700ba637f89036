//! Publish dispatch: dedup, bounded concurrency, and graceful shutdown.
//!
//! The coordinator receives candidate document paths from the watcher,
//! drops duplicates for paths already in flight, and runs each publish as a
//! tokio task gated by a semaphore so at most `max_concurrent_publishes`
//! tasks talk to the platforms at once. Consumers subscribe to the broadcast
//! event channel for progress; dropped events never affect the pipeline.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{Semaphore, broadcast};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::markdown;
use crate::publisher::{Publisher, build_publisher};
use crate::types::{Event, PublishOutcome};
use crate::utils::move_to_published;

/// Capacity of the broadcast event channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Paths currently being published.
///
/// A plain `std::sync::Mutex` so the removal guard can run in `Drop`, which
/// keeps the set consistent on every exit path including panics.
type InFlightSet = Arc<Mutex<HashSet<PathBuf>>>;

fn lock_in_flight(set: &InFlightSet) -> std::sync::MutexGuard<'_, HashSet<PathBuf>> {
    set.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Removes a path from the in-flight set when the publish task ends,
/// however it ends.
struct InFlightGuard {
    set: InFlightSet,
    path: PathBuf,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        lock_in_flight(&self.set).remove(&self.path);
    }
}

/// Dispatches publish tasks for detected documents.
pub struct DispatchCoordinator {
    config: Config,
    publishers: HashMap<String, Arc<Publisher>>,
    concurrent_limit: Arc<Semaphore>,
    accepting_new: AtomicBool,
    in_flight: InFlightSet,
    event_tx: broadcast::Sender<Event>,
}

impl DispatchCoordinator {
    /// Create a coordinator and one publisher per configured account.
    pub fn new(config: Config) -> Self {
        let publishers = config
            .accounts
            .iter()
            .map(|(name, account)| {
                (
                    name.clone(),
                    Arc::new(build_publisher(account, &config.publish)),
                )
            })
            .collect();
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Self {
            concurrent_limit: Arc::new(Semaphore::new(config.publish.max_concurrent_publishes)),
            publishers,
            accepting_new: AtomicBool::new(true),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            event_tx,
            config,
        }
    }

    /// Subscribe to pipeline events.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    /// Number of publish tasks currently in flight.
    pub fn in_flight_count(&self) -> usize {
        lock_in_flight(&self.in_flight).len()
    }

    /// Resolve the owning account for a document path.
    ///
    /// The first path segment under the watch root names the account. A file
    /// directly under the root falls back to the sole configured account, if
    /// there is exactly one; a subdirectory that names no configured account
    /// never publishes anywhere.
    pub fn account_for(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.config.watch.watch_dir).ok()?;
        if relative.components().count() >= 2 {
            let first = relative.components().next()?;
            let segment = first.as_os_str().to_string_lossy();
            return self
                .publishers
                .contains_key(segment.as_ref())
                .then(|| segment.into_owned());
        }
        if self.publishers.len() == 1 {
            return self.publishers.keys().next().cloned();
        }
        None
    }

    /// Dispatch a publish task for a detected document.
    ///
    /// Inserts the path into the in-flight set before spawning, so a second
    /// event for the same path arriving immediately after is dropped as a
    /// duplicate rather than racing the first task.
    ///
    /// # Errors
    /// Returns [`Error::ShuttingDown`] once shutdown has begun.
    pub fn dispatch(self: &Arc<Self>, path: PathBuf) -> Result<()> {
        if !self.accepting_new.load(Ordering::SeqCst) {
            return Err(Error::ShuttingDown);
        }

        {
            let mut in_flight = lock_in_flight(&self.in_flight);
            if !in_flight.insert(path.clone()) {
                debug!(path = %path.display(), "duplicate event for in-flight document dropped");
                let _ = self.event_tx.send(Event::DuplicateDropped { path });
                return Ok(());
            }
        }
        let guard = InFlightGuard {
            set: Arc::clone(&self.in_flight),
            path: path.clone(),
        };

        let Some(account) = self.account_for(&path) else {
            warn!(path = %path.display(), "no account matches this path, skipping");
            drop(guard);
            return Ok(());
        };
        // Accounts and publishers are built together; the key always resolves.
        let Some(publisher) = self.publishers.get(&account).cloned() else {
            drop(guard);
            return Ok(());
        };

        let _ = self.event_tx.send(Event::DocumentDetected {
            path: path.clone(),
            account: account.clone(),
        });

        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            // Guard moves into the task: the set entry lives exactly as long
            // as the task, permit wait included.
            let _guard = guard;
            let _permit = match coordinator.concurrent_limit.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    // Semaphore closed, nothing left to do for this task.
                    warn!(path = %path.display(), "publish pool closed, dropping task");
                    return;
                }
            };
            coordinator.run_publish(publisher, path, account).await;
        });

        Ok(())
    }

    /// Run one publish attempt and emit its terminal event.
    async fn run_publish(&self, publisher: Arc<Publisher>, path: PathBuf, account: String) {
        info!(path = %path.display(), account = %account, "publishing document");

        let outcome = async {
            let document = markdown::load_document(&path).await?;
            publisher.publish(&document).await
        }
        .await;

        match outcome {
            Ok(PublishOutcome::Published { draft_id }) => {
                match move_to_published(
                    &path,
                    &self.config.watch.watch_dir,
                    &self.config.watch.published_dir,
                ) {
                    Ok(target) => {
                        info!(
                            path = %path.display(),
                            target = %target.display(),
                            draft_id = %draft_id,
                            "document published and moved"
                        );
                    }
                    Err(e) => {
                        // The draft exists; a stuck source file only risks a
                        // duplicate draft on the next event.
                        warn!(path = %path.display(), error = %e, "draft created but file move failed");
                    }
                }
                let _ = self.event_tx.send(Event::DocumentPublished {
                    path,
                    account,
                    draft_id,
                });
            }
            Ok(PublishOutcome::Skipped { reason }) => {
                warn!(path = %path.display(), reason = %reason, "document skipped");
                let _ = self.event_tx.send(Event::DocumentSkipped {
                    path,
                    account,
                    reason,
                });
            }
            Err(e) => {
                error!(path = %path.display(), error = %e, "publish failed, file left in place");
                let _ = self.event_tx.send(Event::PublishFailed {
                    path,
                    account,
                    error: e.to_string(),
                });
            }
        }
    }

    /// Gracefully shut down the coordinator.
    ///
    /// Stops accepting new dispatches, waits for in-flight tasks to drain
    /// (bounded by the configured shutdown timeout), then emits
    /// [`Event::Shutdown`]. Tasks still running after the timeout are left to
    /// finish on their own; their files simply stay in the watch tree.
    pub async fn shutdown(&self) -> Result<()> {
        info!("initiating graceful shutdown");
        self.accepting_new.store(false, Ordering::SeqCst);

        let wait = tokio::time::timeout(
            self.config.publish.shutdown_timeout,
            self.wait_for_in_flight(),
        )
        .await;
        match wait {
            Ok(()) => info!("all publish tasks drained"),
            Err(_) => warn!(
                remaining = self.in_flight_count(),
                "timeout waiting for publish tasks, proceeding with shutdown"
            ),
        }

        let _ = self.event_tx.send(Event::Shutdown);
        info!("graceful shutdown complete");
        Ok(())
    }

    async fn wait_for_in_flight(&self) {
        loop {
            let remaining = self.in_flight_count();
            if remaining == 0 {
                return;
            }
            debug!(remaining, "waiting for publish tasks to drain");
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AccountConfig, PlatformKind, WatchConfig};
    use serde_json::json;
    use std::time::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config_with_account(root: &Path, name: &str, server_uri: &str) -> Config {
        let mut accounts = HashMap::new();
        accounts.insert(
            name.to_string(),
            AccountConfig {
                platform: PlatformKind::Wechat,
                app_id: "id".to_string(),
                app_secret: "secret".to_string(),
                author: "Author".to_string(),
                api_base_url: Some(server_uri.to_string()),
            },
        );
        Config {
            watch: WatchConfig {
                watch_dir: root.join("watch"),
                published_dir: root.join("published"),
                ..WatchConfig::default()
            },
            accounts,
            ..Config::default()
        }
    }

    async fn mount_happy_endpoints(server: &MockServer, token_delay: Duration) {
        Mock::given(method("GET"))
            .and(path("/cgi-bin/token"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_delay(token_delay)
                    .set_body_json(json!({ "access_token": "T", "expires_in": 7200 })),
            )
            .mount(server)
            .await;
        Mock::given(method("POST"))
            .and(path("/cgi-bin/media/uploadimg"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "url": "https://cdn.example/img.png",
            })))
            .mount(server)
            .await;
        Mock::given(method("POST"))
            .and(path("/cgi-bin/material/add_material"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "media_id": "THUMB-1",
            })))
            .mount(server)
            .await;
        Mock::given(method("POST"))
            .and(path("/cgi-bin/draft/add"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "media_id": "DRAFT-1",
            })))
            .mount(server)
            .await;
    }

    fn write_document(watch_dir: &Path, account: &str, name: &str) -> PathBuf {
        let dir = watch_dir.join(account);
        std::fs::create_dir_all(&dir).unwrap();
        let img = image::RgbImage::from_pixel(4, 4, image::Rgb([9, 9, 9]));
        img.save(dir.join("cover.png")).unwrap();
        let doc = dir.join(name);
        std::fs::write(&doc, "---\ntitle: T\ncover: cover.png\n---\nbody\n").unwrap();
        doc
    }

    async fn next_matching(
        rx: &mut broadcast::Receiver<Event>,
        mut predicate: impl FnMut(&Event) -> bool,
    ) -> Event {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let event = rx.recv().await.unwrap();
                if predicate(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("expected event not received")
    }

    /// The in-flight entry is released when the task finishes dropping, a
    /// moment after its terminal event is observable.
    async fn wait_until_idle(coordinator: &DispatchCoordinator) {
        for _ in 0..50 {
            if coordinator.in_flight_count() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("in-flight set never drained");
    }

    #[tokio::test]
    async fn published_document_is_moved_preserving_subpath() {
        let server = MockServer::start().await;
        mount_happy_endpoints(&server, Duration::ZERO).await;
        let root = tempfile::tempdir().unwrap();
        let config = config_with_account(root.path(), "my-blog", &server.uri());
        let published = config.watch.published_dir.clone();

        let coordinator = Arc::new(DispatchCoordinator::new(config));
        let mut rx = coordinator.subscribe();
        let doc = write_document(&root.path().join("watch"), "my-blog", "post.md");

        coordinator.dispatch(doc.clone()).unwrap();
        let event =
            next_matching(&mut rx, |e| matches!(e, Event::DocumentPublished { .. })).await;
        let Event::DocumentPublished {
            account, draft_id, ..
        } = event
        else {
            unreachable!()
        };
        assert_eq!(account, "my-blog");
        assert_eq!(draft_id, "DRAFT-1");
        assert!(!doc.exists(), "source file leaves the watch tree");
        assert!(published.join("my-blog/post.md").exists());
        wait_until_idle(&coordinator).await;
    }

    #[tokio::test]
    async fn duplicate_event_for_in_flight_path_is_dropped() {
        let server = MockServer::start().await;
        // Slow token response keeps the first task in flight.
        mount_happy_endpoints(&server, Duration::from_millis(500)).await;
        let root = tempfile::tempdir().unwrap();
        let config = config_with_account(root.path(), "my-blog", &server.uri());

        let coordinator = Arc::new(DispatchCoordinator::new(config));
        let mut rx = coordinator.subscribe();
        let doc = write_document(&root.path().join("watch"), "my-blog", "post.md");

        coordinator.dispatch(doc.clone()).unwrap();
        coordinator.dispatch(doc.clone()).unwrap();

        next_matching(&mut rx, |e| matches!(e, Event::DuplicateDropped { .. })).await;
        next_matching(&mut rx, |e| matches!(e, Event::DocumentPublished { .. })).await;

        // Exactly one draft despite two dispatches.
        let drafts = server
            .received_requests()
            .await
            .unwrap()
            .iter()
            .filter(|r| r.url.path() == "/cgi-bin/draft/add")
            .count();
        assert_eq!(drafts, 1);
    }

    #[tokio::test]
    async fn token_failure_leaves_file_in_place() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/cgi-bin/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "errcode": 40013, "errmsg": "invalid appid",
            })))
            .mount(&server)
            .await;
        let root = tempfile::tempdir().unwrap();
        let config = config_with_account(root.path(), "my-blog", &server.uri());

        let coordinator = Arc::new(DispatchCoordinator::new(config));
        let mut rx = coordinator.subscribe();
        let doc = write_document(&root.path().join("watch"), "my-blog", "post.md");

        coordinator.dispatch(doc.clone()).unwrap();
        let event = next_matching(&mut rx, |e| matches!(e, Event::PublishFailed { .. })).await;
        let Event::PublishFailed { error, .. } = event else {
            unreachable!()
        };
        assert!(error.contains("invalid appid"));
        assert!(doc.exists(), "failed document stays for the next cycle");
        wait_until_idle(&coordinator).await;
    }

    #[tokio::test]
    async fn shutdown_rejects_new_dispatches() {
        let root = tempfile::tempdir().unwrap();
        let config = config_with_account(root.path(), "my-blog", "http://localhost:9");
        let coordinator = Arc::new(DispatchCoordinator::new(config));

        coordinator.shutdown().await.unwrap();
        let err = coordinator
            .dispatch(root.path().join("watch/my-blog/post.md"))
            .unwrap_err();
        assert!(matches!(err, Error::ShuttingDown));
    }

    #[tokio::test]
    async fn shutdown_drains_in_flight_tasks() {
        let server = MockServer::start().await;
        mount_happy_endpoints(&server, Duration::from_millis(300)).await;
        let root = tempfile::tempdir().unwrap();
        let config = config_with_account(root.path(), "my-blog", &server.uri());
        let published = config.watch.published_dir.clone();

        let coordinator = Arc::new(DispatchCoordinator::new(config));
        let doc = write_document(&root.path().join("watch"), "my-blog", "post.md");

        coordinator.dispatch(doc).unwrap();
        coordinator.shutdown().await.unwrap();

        assert_eq!(coordinator.in_flight_count(), 0);
        assert!(published.join("my-blog/post.md").exists());
    }

    #[tokio::test]
    async fn account_resolution_uses_first_segment_then_sole_account() {
        let root = tempfile::tempdir().unwrap();
        let config = config_with_account(root.path(), "my-blog", "http://localhost:9");
        let coordinator = Arc::new(DispatchCoordinator::new(config));
        let watch = root.path().join("watch");

        assert_eq!(
            coordinator.account_for(&watch.join("my-blog/post.md")),
            Some("my-blog".to_string())
        );
        // Sole account catches files directly under the root only; a
        // subdirectory that names no configured account stays unmatched.
        assert_eq!(
            coordinator.account_for(&watch.join("post.md")),
            Some("my-blog".to_string())
        );
        assert_eq!(coordinator.account_for(&watch.join("other-blog/post.md")), None);
        assert_eq!(
            coordinator.account_for(&watch.join("other-blog/drafts/post.md")),
            None
        );
        assert_eq!(coordinator.account_for(Path::new("/elsewhere/post.md")), None);
    }

    #[test]
    fn in_flight_guard_removes_entry_on_panic() {
        let set: InFlightSet = Arc::new(Mutex::new(HashSet::new()));
        lock_in_flight(&set).insert(PathBuf::from("a.md"));

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe({
            let set = Arc::clone(&set);
            move || {
                let _guard = InFlightGuard {
                    set,
                    path: PathBuf::from("a.md"),
                };
                panic!("publish task panicked");
            }
        }));

        assert!(result.is_err());
        assert!(lock_in_flight(&set).is_empty());
    }
}

//! Cross-platform file system watching for Vigil
//!
//! This crate provides a change-notification engine with:
//! - Single and recursive (tree) watches with per-watch event filters
//! - Dynamic re-arming of tree watches as subdirectories come and go
//! - A uniform event model over platform backends (native kernel
//!   notifications, snapshot-diff polling, inert)
//! - Overflow and failure reporting through the same delivery channel
//!
//! Construct an [`FsWatcher`], attach an [`EventHandler`] (or a
//! [`ChannelHandler`] to drain events from a channel), and register paths:
//!
//! ```no_run
//! use watcher::{ChannelHandler, EventKind, FsWatcher};
//!
//! let watcher = FsWatcher::new()?;
//! let (handler, events) = ChannelHandler::new();
//! watcher.set_handler(handler);
//! watcher.add_tree("/tmp/project", EventKind::ALL, "*.rs");
//! for event in events {
//!     println!("{event}");
//! }
//! # anyhow::Ok(())
//! ```

pub mod backend;
pub mod config;
pub mod dispatch;
pub mod event;
pub mod filter;

mod registry;
mod translate;

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use anyhow::Result;
use crossbeam_channel::Receiver;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

pub use backend::{Backend, BackendError, BackendKind, Capabilities, RawEvent, WatchToken};
pub use config::WatcherConfig;
pub use dispatch::{ChannelHandler, EventHandler};
pub use event::{ChangeEvent, EventKind};
pub use filter::NameFilter;

use dispatch::Dispatcher;
use registry::{WatchEntry, WatchRegistry};

/// Everything the pump and the mutation calls share, behind one mutex.
///
/// The lock is held for the duration of one table mutation or one raw
/// event's translate-and-dispatch, never across a blocking receive. That
/// single domain is what lets `remove_all` and teardown guarantee that no
/// event for a cancelled watch is delivered after they return.
pub(crate) struct Inner {
    pub(crate) registry: WatchRegistry,
    pub(crate) backend: Box<dyn Backend>,
    pub(crate) dispatcher: Dispatcher,
    pub(crate) caps: Capabilities,
    /// Recently dispatched deletions, for deduplicating the twin reports a
    /// removal produces under emulated recursion
    pub(crate) recent_deletes: HashMap<PathBuf, Instant>,
}

/// The file system watch engine.
///
/// Registers interest in paths, normalizes platform notifications into
/// [`ChangeEvent`]s and delivers them, in arrival order, to the single
/// registered handler. Mutation calls (`add`, `remove`, ...) are meant to be
/// issued from one control thread; handlers run on the engine's internal
/// pump thread and must not call mutation operations.
pub struct FsWatcher {
    inner: Arc<Mutex<Inner>>,
    pump: Option<JoinHandle<()>>,
}

impl FsWatcher {
    /// Engine over the platform-detected backend.
    pub fn new() -> Result<Self> {
        Self::with_config(WatcherConfig::default())
    }

    /// Engine over the configured backend variant.
    pub fn with_config(config: WatcherConfig) -> Result<Self> {
        let (backend, raw_rx) = backend::create(config.backend, &config)?;
        Ok(Self::from_parts(backend, raw_rx))
    }

    /// Assemble the engine around an already constructed backend and its
    /// raw channel, and start the pump.
    pub(crate) fn from_parts(backend: Box<dyn Backend>, raw_rx: Receiver<RawEvent>) -> Self {
        let caps = backend.capabilities();
        let inner = Arc::new(Mutex::new(Inner {
            registry: WatchRegistry::new(),
            backend,
            dispatcher: Dispatcher::new(),
            caps,
            recent_deletes: HashMap::new(),
        }));

        let pump = {
            let inner = Arc::clone(&inner);
            thread::Builder::new()
                .name("vigil-pump".into())
                .spawn(move || {
                    while let Ok(raw) = raw_rx.recv() {
                        let mut inner = inner.lock();
                        translate::process(&mut inner, raw);
                    }
                    debug!("pump exiting");
                })
                .expect("failed to spawn pump thread")
        };

        Self { inner, pump: Some(pump) }
    }

    /// Attach the consumer's handler, replacing whatever was set before
    /// (the default handler renders events into the log stream).
    pub fn set_handler<H: EventHandler + 'static>(&self, handler: H) {
        self.inner.lock().dispatcher.set_handler(Box::new(handler));
    }

    /// Watch a single file or directory. A directory watch also covers its
    /// immediate children, but not grandchildren.
    ///
    /// Returns false, without emitting an event, if the path does not exist
    /// or is already watched; returns false after emitting an error event
    /// if the backend refuses the registration.
    pub fn add(&self, path: impl AsRef<Path>, filter: EventKind) -> bool {
        self.add_impl(path.as_ref(), filter, None, false)
    }

    /// Watch `path` and, recursively, every directory beneath it, both
    /// those present now and those created later. `name_filter` is a glob
    /// mask (`*.txt`) restricting which file names generate events; empty
    /// matches everything. The mask never restricts which directories are
    /// tracked for re-arming.
    pub fn add_tree(
        &self,
        path: impl AsRef<Path>,
        filter: EventKind,
        name_filter: &str,
    ) -> bool {
        let name_filter = match NameFilter::from_pattern(name_filter) {
            Ok(filter) => filter,
            Err(err) => {
                warn!("{err:#}");
                return false;
            }
        };
        self.add_impl(path.as_ref(), filter, name_filter, true)
    }

    fn add_impl(
        &self,
        path: &Path,
        filter: EventKind,
        name_filter: Option<NameFilter>,
        recursive: bool,
    ) -> bool {
        let path = match fs::canonicalize(path) {
            Ok(path) => path,
            Err(err) => {
                warn!("cannot watch {}: {err}", path.display());
                return false;
            }
        };

        let mut inner = self.inner.lock();
        if inner.registry.contains(&path) {
            warn!("{} is already watched", path.display());
            return false;
        }

        // Only backends with native recursion get the recursive flag; the
        // engine emulates recursion for the rest with implicit children.
        let native_recursive = recursive && inner.caps.native_recursive;
        let token = match inner.backend.register(&path, native_recursive) {
            Ok(token) => token,
            Err(err) => {
                let event = ChangeEvent::error(
                    path.clone(),
                    format!("failed to register watch for {}: {err}", path.display()),
                );
                inner.dispatcher.deliver(&event);
                return false;
            }
        };

        if filter.contains(EventKind::ACCESS | EventKind::WARNING) && !inner.caps.emits_access {
            let event = ChangeEvent::warning(
                path.clone(),
                format!(
                    "backend cannot observe access events; ACCESS will not be \
                     reported for {}",
                    path.display()
                ),
            );
            inner.dispatcher.deliver(&event);
        }

        let is_dir = path.is_dir();
        inner.registry.insert(
            path.clone(),
            WatchEntry { token, filter, recursive, name_filter },
        );

        if recursive && !inner.caps.native_recursive && is_dir {
            translate::seed_tree(&mut inner, &path);
        }

        info!(path = %path.display(), recursive, "watch added");
        true
    }

    /// Stop watching an explicitly registered path.
    ///
    /// Implicit children of tree watches are not individually removable; a
    /// recursive root cannot exist without its children, so removing one
    /// retires every implicit child with it, exactly as [`remove_tree`]
    /// does. The two calls share one implementation and differ only in the
    /// caller's intent.
    ///
    /// [`remove_tree`]: FsWatcher::remove_tree
    pub fn remove(&self, path: impl AsRef<Path>) -> bool {
        self.remove_impl(path.as_ref())
    }

    /// Stop watching a tree root and every implicit child beneath it.
    /// Equivalent to [`remove`](FsWatcher::remove) on the same root.
    pub fn remove_tree(&self, path: impl AsRef<Path>) -> bool {
        self.remove_impl(path.as_ref())
    }

    fn remove_impl(&self, path: &Path) -> bool {
        // The path may already be gone from disk; fall back to the given
        // spelling when it can no longer be canonicalized.
        let path = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());

        let mut inner = self.inner.lock();
        let Some(entry) = inner.registry.remove(&path) else {
            warn!("{} is not watched", path.display());
            return false;
        };
        inner.backend.cancel(entry.token);
        for (_, token) in inner.registry.drain_implicit_under(&path) {
            inner.backend.cancel(token);
        }
        info!(path = %path.display(), "watch removed");
        true
    }

    /// Stop watching everything. Always succeeds; a no-op on an empty
    /// watch set.
    pub fn remove_all(&self) -> bool {
        let mut inner = self.inner.lock();
        for token in inner.registry.drain_all() {
            inner.backend.cancel(token);
        }
        true
    }

    /// Number of explicitly watched paths (implicit tree children are not
    /// counted).
    pub fn watched_path_count(&self) -> usize {
        self.inner.lock().registry.len()
    }

    /// The explicitly watched paths, in path order.
    pub fn watched_paths(&self) -> Vec<PathBuf> {
        self.inner.lock().registry.paths()
    }
}

impl Drop for FsWatcher {
    fn drop(&mut self) {
        {
            let mut inner = self.inner.lock();
            for token in inner.registry.drain_all() {
                inner.backend.cancel(token);
            }
            inner.backend.shutdown();
        }
        // The backend's senders are gone; the pump drains what is already
        // queued and exits.
        if let Some(pump) = self.pump.take() {
            let _ = pump.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::null::NullBackend;
    use crossbeam_channel::Sender;
    use std::fs;
    use std::time::Duration;
    use tempfile::TempDir;

    const WAIT: Duration = Duration::from_secs(2);

    /// Engine over the inert backend plus a sender for scripted raw events
    /// and a receiver for translated output.
    fn scripted() -> (
        FsWatcher,
        Sender<RawEvent>,
        crossbeam_channel::Receiver<ChangeEvent>,
    ) {
        let (backend, raw_rx) = NullBackend::new();
        let raw_tx = backend.raw_sender().unwrap();
        let watcher = FsWatcher::from_parts(Box::new(backend), raw_rx);
        let (handler, events) = ChannelHandler::new();
        watcher.set_handler(handler);
        (watcher, raw_tx, events)
    }

    fn canon(path: &Path) -> PathBuf {
        fs::canonicalize(path).unwrap()
    }

    #[test]
    fn test_add_lists_path_exactly_once_until_removed() {
        let dir = TempDir::new().unwrap();
        let (watcher, _raw, _events) = scripted();

        assert!(watcher.add(dir.path(), EventKind::ALL));
        assert_eq!(watcher.watched_paths(), vec![canon(dir.path())]);
        assert_eq!(watcher.watched_path_count(), 1);

        assert!(watcher.remove(dir.path()));
        assert_eq!(watcher.watched_path_count(), 0);
        assert!(watcher.watched_paths().is_empty());
    }

    #[test]
    fn test_duplicate_add_fails_without_duplicating_handles() {
        let dir = TempDir::new().unwrap();
        let (watcher, _raw, events) = scripted();

        assert!(watcher.add(dir.path(), EventKind::ALL));
        assert!(!watcher.add(dir.path(), EventKind::ALL));
        assert_eq!(watcher.watched_path_count(), 1);
        // Precondition failures never surface as events.
        assert!(events.try_recv().is_err());

        // One removal empties the set: there was only ever one handle.
        assert!(watcher.remove(dir.path()));
        assert_eq!(watcher.watched_path_count(), 0);
    }

    #[test]
    fn test_add_nonexistent_path_fails_silently() {
        let (watcher, _raw, events) = scripted();
        assert!(!watcher.add("/no/such/path/anywhere", EventKind::ALL));
        assert_eq!(watcher.watched_path_count(), 0);
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_remove_unregistered_path_fails() {
        let dir = TempDir::new().unwrap();
        let (watcher, _raw, _events) = scripted();
        assert!(!watcher.remove(dir.path()));

        assert!(watcher.add(dir.path(), EventKind::ALL));
        assert!(watcher.remove(dir.path()));
        assert!(!watcher.remove(dir.path()));
    }

    #[test]
    fn test_remove_all_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let (watcher, _raw, _events) = scripted();
        watcher.add(dir.path(), EventKind::ALL);

        assert!(watcher.remove_all());
        assert_eq!(watcher.watched_path_count(), 0);
        assert!(watcher.remove_all());
        assert_eq!(watcher.watched_path_count(), 0);
    }

    #[test]
    fn test_tree_watch_covers_existing_subdirectories() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("a")).unwrap();
        let root = canon(dir.path());

        let (watcher, raw, events) = scripted();
        assert!(watcher.add_tree(&root, EventKind::ALL, ""));

        let file = root.join("a").join("f.txt");
        raw.send(RawEvent::change(&file, EventKind::CREATE)).unwrap();

        let event = events.recv_timeout(WAIT).unwrap();
        assert_eq!(event.kind, EventKind::CREATE);
        assert_eq!(event.path, file);
    }

    #[test]
    fn test_new_subdirectory_is_rearmed_dynamically() {
        let dir = TempDir::new().unwrap();
        let root = canon(dir.path());

        let (watcher, raw, events) = scripted();
        assert!(watcher.add_tree(&root, EventKind::ALL, ""));

        // A directory appears under the tree after registration.
        let sub = root.join("b");
        fs::create_dir(&sub).unwrap();
        raw.send(RawEvent::change(&sub, EventKind::CREATE)).unwrap();

        let event = events.recv_timeout(WAIT).unwrap();
        assert_eq!(event.kind, EventKind::CREATE);
        assert_eq!(event.path, sub);

        // Events inside the new directory are now covered.
        let file = sub.join("g.txt");
        raw.send(RawEvent::change(&file, EventKind::CREATE)).unwrap();
        let event = events.recv_timeout(WAIT).unwrap();
        assert_eq!(event.kind, EventKind::CREATE);
        assert_eq!(event.path, file);
    }

    #[test]
    fn test_race_window_entries_surface_as_synthetic_creates() {
        let dir = TempDir::new().unwrap();
        let root = canon(dir.path());

        let (watcher, raw, events) = scripted();
        assert!(watcher.add_tree(&root, EventKind::ALL, ""));

        // Directory and a file inside it both exist before the create
        // notification is processed.
        let sub = root.join("c");
        fs::create_dir(&sub).unwrap();
        let inside = sub.join("early.txt");
        fs::write(&inside, b"raced").unwrap();

        raw.send(RawEvent::change(&sub, EventKind::CREATE)).unwrap();

        let first = events.recv_timeout(WAIT).unwrap();
        assert_eq!((first.kind, first.path), (EventKind::CREATE, sub));
        let second = events.recv_timeout(WAIT).unwrap();
        assert_eq!((second.kind, second.path), (EventKind::CREATE, inside));
    }

    #[test]
    fn test_rename_carries_both_paths() {
        let dir = TempDir::new().unwrap();
        let root = canon(dir.path());

        let (watcher, raw, events) = scripted();
        assert!(watcher.add(&root, EventKind::ALL));

        let old = root.join("f.txt");
        let new = root.join("g.txt");
        raw.send(RawEvent::rename(&old, &new)).unwrap();

        let event = events.recv_timeout(WAIT).unwrap();
        assert_eq!(event.kind, EventKind::RENAME);
        assert_eq!(event.path, old);
        assert_eq!(event.new_path, new);
    }

    #[test]
    fn test_name_filter_suppresses_nonmatching_files() {
        let dir = TempDir::new().unwrap();
        let root = canon(dir.path());

        let (watcher, raw, events) = scripted();
        assert!(watcher.add_tree(&root, EventKind::ALL, "*.txt"));

        raw.send(RawEvent::change(root.join("noise.log"), EventKind::CREATE))
            .unwrap();
        raw.send(RawEvent::change(root.join("kept.txt"), EventKind::CREATE))
            .unwrap();

        // The .log create is dropped; the first thing through is the .txt.
        let event = events.recv_timeout(WAIT).unwrap();
        assert_eq!(event.path, root.join("kept.txt"));
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_name_filter_does_not_stop_structural_tracking() {
        let dir = TempDir::new().unwrap();
        let root = canon(dir.path());

        let (watcher, raw, events) = scripted();
        assert!(watcher.add_tree(&root, EventKind::ALL, "*.txt"));

        // A new directory whose name does not match the mask: its create is
        // suppressed, but it is still armed.
        let sub = root.join("logs");
        fs::create_dir(&sub).unwrap();
        raw.send(RawEvent::change(&sub, EventKind::CREATE)).unwrap();

        let file = sub.join("in.txt");
        raw.send(RawEvent::change(&file, EventKind::CREATE)).unwrap();

        let event = events.recv_timeout(WAIT).unwrap();
        assert_eq!((event.kind, event.path), (EventKind::CREATE, file));
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_event_filter_drops_unrequested_kinds() {
        let dir = TempDir::new().unwrap();
        let root = canon(dir.path());

        let (watcher, raw, events) = scripted();
        assert!(watcher.add(&root, EventKind::DELETE | EventKind::ERROR));

        let file = root.join("f.txt");
        raw.send(RawEvent::change(&file, EventKind::CREATE)).unwrap();
        raw.send(RawEvent::change(&file, EventKind::DELETE)).unwrap();

        let event = events.recv_timeout(WAIT).unwrap();
        assert_eq!(event.kind, EventKind::DELETE);
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_multi_kind_mask_unfolds_in_fixed_order() {
        let dir = TempDir::new().unwrap();
        let root = canon(dir.path());

        let (watcher, raw, events) = scripted();
        assert!(watcher.add(&root, EventKind::ALL));

        let file = root.join("f.txt");
        raw.send(RawEvent::change(
            &file,
            EventKind::MODIFY | EventKind::ACCESS,
        ))
        .unwrap();

        let first = events.recv_timeout(WAIT).unwrap();
        let second = events.recv_timeout(WAIT).unwrap();
        assert_eq!(first.kind, EventKind::MODIFY);
        assert_eq!(second.kind, EventKind::ACCESS);
    }

    #[test]
    fn test_overflow_becomes_warning() {
        let dir = TempDir::new().unwrap();
        let root = canon(dir.path());

        let (watcher, raw, events) = scripted();
        assert!(watcher.add(&root, EventKind::ALL));

        raw.send(RawEvent::overflow(&root)).unwrap();

        let event = events.recv_timeout(WAIT).unwrap();
        assert_eq!(event.kind, EventKind::WARNING);
        assert!(event.is_error());
        assert_eq!(event.path, root);
        assert!(event.description().contains("may have been lost"));
    }

    #[test]
    fn test_root_deleted_out_of_band_errors_and_deregisters() {
        let dir = TempDir::new().unwrap();
        let root = canon(dir.path());

        let (watcher, raw, events) = scripted();
        assert!(watcher.add(&root, EventKind::ALL));

        raw.send(RawEvent::change(&root, EventKind::DELETE)).unwrap();

        let delete = events.recv_timeout(WAIT).unwrap();
        assert_eq!((delete.kind, delete.path.clone()), (EventKind::DELETE, root));
        let error = events.recv_timeout(WAIT).unwrap();
        assert_eq!(error.kind, EventKind::ERROR);
        assert!(error.description().contains("removed from disk"));
        assert_eq!(watcher.watched_path_count(), 0);
    }

    #[test]
    fn test_remove_tree_retires_implicit_children() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("a/b")).unwrap();
        let root = canon(dir.path());

        let (watcher, raw, events) = scripted();
        assert!(watcher.add_tree(&root, EventKind::ALL, ""));
        assert!(watcher.remove_tree(&root));
        assert_eq!(watcher.watched_path_count(), 0);

        // Nothing under the former tree is governed anymore.
        raw.send(RawEvent::change(
            root.join("a/b/f.txt"),
            EventKind::CREATE,
        ))
        .unwrap();
        // Prove silence with a marker on a freshly added watch.
        let marker_dir = TempDir::new().unwrap();
        let marker_root = canon(marker_dir.path());
        assert!(watcher.add(&marker_root, EventKind::ALL));
        let marker = marker_root.join("marker");
        raw.send(RawEvent::change(&marker, EventKind::CREATE)).unwrap();

        let event = events.recv_timeout(WAIT).unwrap();
        assert_eq!(event.path, marker);
    }

    #[test]
    fn test_remove_on_a_tree_root_retires_children_like_remove_tree() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        let root = canon(dir.path());

        let (watcher, raw, events) = scripted();
        assert!(watcher.add_tree(&root, EventKind::ALL, ""));
        assert!(watcher.remove(&root));
        assert_eq!(watcher.watched_path_count(), 0);

        raw.send(RawEvent::change(
            root.join("sub").join("f.txt"),
            EventKind::CREATE,
        ))
        .unwrap();
        let marker_dir = TempDir::new().unwrap();
        let marker_root = canon(marker_dir.path());
        assert!(watcher.add(&marker_root, EventKind::ALL));
        let marker = marker_root.join("marker");
        raw.send(RawEvent::change(&marker, EventKind::CREATE)).unwrap();

        let event = events.recv_timeout(WAIT).unwrap();
        assert_eq!(event.path, marker);
    }

    #[test]
    fn test_access_request_on_blind_backend_warns() {
        struct BlindBackend(NullBackend);
        impl Backend for BlindBackend {
            fn register(
                &mut self,
                path: &Path,
                recursive: bool,
            ) -> Result<WatchToken, BackendError> {
                self.0.register(path, recursive)
            }
            fn cancel(&mut self, token: WatchToken) -> bool {
                self.0.cancel(token)
            }
            fn capabilities(&self) -> Capabilities {
                Capabilities { native_recursive: false, emits_access: false }
            }
            fn shutdown(&mut self) {
                self.0.shutdown();
            }
        }

        let dir = TempDir::new().unwrap();
        let (null, raw_rx) = NullBackend::new();
        let watcher = FsWatcher::from_parts(Box::new(BlindBackend(null)), raw_rx);
        let (handler, events) = ChannelHandler::new();
        watcher.set_handler(handler);

        assert!(watcher.add(dir.path(), EventKind::ALL));
        let event = events.recv_timeout(WAIT).unwrap();
        assert_eq!(event.kind, EventKind::WARNING);
        assert!(event.description().contains("access"));
    }
}

//! Native backend
//!
//! Wraps the platform's kernel notification mechanism through the `notify`
//! crate: inotify on Linux, FSEvents on macOS, ReadDirectoryChangesW on
//! Windows, kqueue on the BSDs. All of these express recursion natively
//! (notify emulates it where the kernel primitive is per-directory), so the
//! variant reports `native_recursive` and the engine skips implicit child
//! management on top of it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver};
use notify::event::{Event, EventKind as NotifyKind, ModifyKind, RenameMode};
use notify::{RecommendedWatcher, RecursiveMode, Watcher as _};
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::{Backend, BackendError, Capabilities, RawEvent, WatchToken};
use crate::event::EventKind;

/// How long an unpaired rename-from half may wait for its to half before it
/// degrades into a plain delete.
const RENAME_PAIR_WINDOW: Duration = Duration::from_millis(500);

/// How often the flusher sweeps the pending map. The stream may go quiet
/// right after an unpaired from half, so expiry cannot wait for a next event.
const FLUSH_TICK: Duration = Duration::from_millis(100);

/// Rename-from halves waiting for their to half, keyed by tracker cookie.
type Pending = Arc<Mutex<HashMap<usize, (PathBuf, Instant)>>>;

/// Kernel-notification backend.
pub struct NativeBackend {
    // Dropped on shutdown, which stops notify's worker and disconnects the
    // raw channel.
    watcher: Option<RecommendedWatcher>,
    paths: HashMap<WatchToken, PathBuf>,
    next_token: u64,
    stop: Arc<AtomicBool>,
    flusher: Option<JoinHandle<()>>,
}

impl NativeBackend {
    /// Bring up the platform watcher, its raw channel and the pending-rename
    /// flusher.
    pub fn new() -> Result<(Self, Receiver<RawEvent>), BackendError> {
        let (tx, rx) = unbounded();
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));

        let watcher = notify::recommended_watcher({
            let pending = Arc::clone(&pending);
            let tx = tx.clone();
            move |result: Result<Event, notify::Error>| match result {
                Ok(event) => {
                    let raws = translate_native(event, &mut pending.lock());
                    for raw in raws {
                        if tx.send(raw).is_err() {
                            return;
                        }
                    }
                }
                Err(err) => {
                    // Stream-level failures (queue overflows included) reach
                    // the consumer as degraded-delivery warnings.
                    warn!("native watch stream error: {err}");
                    let path = err.paths.first().cloned().unwrap_or_default();
                    let _ = tx.send(RawEvent::overflow(path));
                }
            }
        })
        .map_err(|err| BackendError::Unavailable(err.to_string()))?;

        let stop = Arc::new(AtomicBool::new(false));
        let flusher = {
            let stop = Arc::clone(&stop);
            thread::Builder::new()
                .name("vigil-rename-flush".into())
                .spawn(move || {
                    while !stop.load(Ordering::Relaxed) {
                        thread::sleep(FLUSH_TICK);
                        for raw in expire_pending(&mut pending.lock(), Instant::now()) {
                            if tx.send(raw).is_err() {
                                return;
                            }
                        }
                    }
                })
                .expect("failed to spawn rename flush thread")
        };

        let backend = Self {
            watcher: Some(watcher),
            paths: HashMap::new(),
            next_token: 0,
            stop,
            flusher: Some(flusher),
        };
        Ok((backend, rx))
    }

    fn watcher(&mut self) -> Result<&mut RecommendedWatcher, BackendError> {
        self.watcher
            .as_mut()
            .ok_or_else(|| BackendError::Unavailable("backend is shut down".into()))
    }
}

impl Backend for NativeBackend {
    fn register(&mut self, path: &Path, recursive: bool) -> Result<WatchToken, BackendError> {
        let mode = if recursive {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        };
        self.watcher()?
            .watch(path, mode)
            .map_err(map_notify_error)?;

        self.next_token += 1;
        let token = WatchToken(self.next_token);
        self.paths.insert(token, path.to_path_buf());
        debug!(path = %path.display(), recursive, ?token, "native watch registered");
        Ok(token)
    }

    fn cancel(&mut self, token: WatchToken) -> bool {
        let Some(path) = self.paths.remove(&token) else {
            return false;
        };
        match self.watcher() {
            Ok(watcher) => match watcher.unwatch(&path) {
                Ok(()) => true,
                Err(err) => {
                    // The kernel watch may already be gone (path deleted);
                    // the token is retired either way.
                    debug!(path = %path.display(), "unwatch failed: {err}");
                    false
                }
            },
            Err(_) => false,
        }
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            native_recursive: true,
            // Only inotify reports accesses; FSEvents and the Windows change
            // buffer do not.
            emits_access: cfg!(any(target_os = "linux", target_os = "android")),
        }
    }

    fn shutdown(&mut self) {
        self.paths.clear();
        self.watcher = None;
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.flusher.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for NativeBackend {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn map_notify_error(err: notify::Error) -> BackendError {
    match err.kind {
        notify::ErrorKind::PathNotFound => {
            BackendError::PathNotFound(err.paths.first().cloned().unwrap_or_default())
        }
        notify::ErrorKind::MaxFilesWatch => BackendError::WatchLimit,
        notify::ErrorKind::Io(io) => BackendError::Io(io),
        other => BackendError::Other(format!("{other:?}")),
    }
}

/// Degrade every pending rename-from half older than [`RENAME_PAIR_WINDOW`]
/// into a plain delete (the destination left the watched tree). Called from
/// the translation path and, so a quiet stream still flushes, from the
/// flusher thread.
fn expire_pending(
    pending: &mut HashMap<usize, (PathBuf, Instant)>,
    now: Instant,
) -> Vec<RawEvent> {
    let mut out = Vec::new();
    pending.retain(|_, (path, since)| {
        if now.duration_since(*since) > RENAME_PAIR_WINDOW {
            out.push(RawEvent::change(path.clone(), EventKind::DELETE));
            false
        } else {
            true
        }
    });
    out
}

/// Normalize one notify event into raw events.
///
/// Rename halves arrive as separate From/To notifications on most platforms;
/// they are paired through notify's tracker cookie.
fn translate_native(
    event: Event,
    pending: &mut HashMap<usize, (PathBuf, Instant)>,
) -> Vec<RawEvent> {
    // Expired halves first, to preserve arrival order as closely as
    // possible.
    let mut out = expire_pending(pending, Instant::now());

    if event.need_rescan() {
        let path = event.paths.first().cloned().unwrap_or_default();
        out.push(RawEvent::overflow(path));
        return out;
    }

    let Some(path) = event.paths.first().cloned() else {
        return out;
    };

    match event.kind {
        NotifyKind::Create(_) => out.push(RawEvent::change(path, EventKind::CREATE)),
        NotifyKind::Remove(_) => out.push(RawEvent::change(path, EventKind::DELETE)),
        NotifyKind::Access(_) => out.push(RawEvent::change(path, EventKind::ACCESS)),
        NotifyKind::Modify(ModifyKind::Name(mode)) => match mode {
            RenameMode::Both => {
                if event.paths.len() >= 2 {
                    out.push(RawEvent::rename(path, event.paths[1].clone()));
                } else {
                    out.push(RawEvent::change(path, EventKind::MODIFY));
                }
            }
            RenameMode::From => match event.attrs.tracker() {
                Some(cookie) => {
                    pending.insert(cookie, (path, Instant::now()));
                }
                // No cookie to pair on: the entry left the tree.
                None => out.push(RawEvent::change(path, EventKind::DELETE)),
            },
            RenameMode::To => {
                let old = event
                    .attrs
                    .tracker()
                    .and_then(|cookie| pending.remove(&cookie));
                match old {
                    Some((old_path, _)) => out.push(RawEvent::rename(old_path, path)),
                    // The from half happened outside the watched tree.
                    None => out.push(RawEvent::change(path, EventKind::CREATE)),
                }
            }
            RenameMode::Any | RenameMode::Other => {
                if event.paths.len() >= 2 {
                    out.push(RawEvent::rename(path, event.paths[1].clone()));
                } else {
                    out.push(RawEvent::change(path, EventKind::MODIFY));
                }
            }
        },
        NotifyKind::Modify(_) => out.push(RawEvent::change(path, EventKind::MODIFY)),
        // Ambiguous platform notifications; treat as a modification rather
        // than dropping them.
        NotifyKind::Any | NotifyKind::Other => {
            out.push(RawEvent::change(path, EventKind::MODIFY))
        }
    }

    out
}

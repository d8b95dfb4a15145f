//! Polling fallback backend
//!
//! Periodically snapshots each watched path (a file's metadata, or a
//! directory's immediate children) and diffs consecutive snapshots into raw
//! events. Portable to any filesystem at the cost of latency and fidelity:
//! accesses are invisible, and a rename surfaces as delete + create.

use std::collections::{BTreeMap, HashMap};
use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime};

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, trace};

use super::{Backend, BackendError, Capabilities, RawEvent, WatchToken};
use crate::event::EventKind;

/// What we remember about one directory entry between ticks.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Stamp {
    mtime: Option<SystemTime>,
    len: u64,
    is_dir: bool,
}

impl Stamp {
    fn of(metadata: &fs::Metadata) -> Self {
        Self {
            mtime: metadata.modified().ok(),
            len: metadata.len(),
            is_dir: metadata.is_dir(),
        }
    }
}

/// Last observed state of one watch.
#[derive(Debug)]
enum Snapshot {
    /// A single file (None once it has gone missing)
    File(Option<Stamp>),
    /// A directory's immediate children
    Dir(BTreeMap<OsString, Stamp>),
    /// The watched directory itself vanished; its deletion was reported
    Gone,
}

struct WatchState {
    path: PathBuf,
    snapshot: Snapshot,
}

type Table = Arc<Mutex<HashMap<WatchToken, WatchState>>>;

/// Snapshot-diff backend driven by a dedicated poller thread.
pub struct PollBackend {
    table: Table,
    stop: Arc<AtomicBool>,
    poller: Option<JoinHandle<()>>,
    next_token: u64,
}

impl PollBackend {
    /// Construct the backend and its raw channel; spawns the poller.
    pub fn new(interval: Duration) -> (Self, Receiver<RawEvent>) {
        let (tx, rx) = unbounded();
        let table: Table = Arc::new(Mutex::new(HashMap::new()));
        let stop = Arc::new(AtomicBool::new(false));

        let poller = {
            let table = Arc::clone(&table);
            let stop = Arc::clone(&stop);
            thread::Builder::new()
                .name("vigil-poll".into())
                .spawn(move || run_poller(table, stop, tx, interval))
                .expect("failed to spawn poller thread")
        };

        let backend = Self { table, stop, poller: Some(poller), next_token: 0 };
        (backend, rx)
    }
}

impl Backend for PollBackend {
    fn register(&mut self, path: &Path, _recursive: bool) -> Result<WatchToken, BackendError> {
        let metadata = fs::metadata(path).map_err(|err| {
            if err.kind() == io::ErrorKind::NotFound {
                BackendError::PathNotFound(path.to_path_buf())
            } else {
                BackendError::Io(err)
            }
        })?;

        let snapshot = if metadata.is_dir() {
            Snapshot::Dir(scan_dir(path)?)
        } else {
            Snapshot::File(Some(Stamp::of(&metadata)))
        };

        self.next_token += 1;
        let token = WatchToken(self.next_token);
        self.table.lock().insert(
            token,
            WatchState { path: path.to_path_buf(), snapshot },
        );
        debug!(path = %path.display(), ?token, "poll watch registered");
        Ok(token)
    }

    fn cancel(&mut self, token: WatchToken) -> bool {
        self.table.lock().remove(&token).is_some()
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities { native_recursive: false, emits_access: false }
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.poller.take() {
            let _ = handle.join();
        }
        self.table.lock().clear();
    }
}

impl Drop for PollBackend {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Immediate children of `path`, keyed by file name.
fn scan_dir(path: &Path) -> io::Result<BTreeMap<OsString, Stamp>> {
    let mut children = BTreeMap::new();
    for entry in fs::read_dir(path)? {
        let entry = entry?;
        // An entry may vanish between readdir and stat; skip it rather than
        // failing the whole scan.
        if let Ok(metadata) = entry.metadata() {
            children.insert(entry.file_name(), Stamp::of(&metadata));
        }
    }
    Ok(children)
}

fn run_poller(table: Table, stop: Arc<AtomicBool>, tx: Sender<RawEvent>, interval: Duration) {
    // Sleep in short slices so shutdown never waits a full long interval.
    let slice = interval.min(Duration::from_millis(50));
    let mut elapsed = Duration::ZERO;

    loop {
        thread::sleep(slice);
        if stop.load(Ordering::Relaxed) {
            break;
        }
        elapsed += slice;
        if elapsed < interval {
            continue;
        }
        elapsed = Duration::ZERO;

        if !poll_once(&table, &tx) {
            // Receiver dropped: the engine is gone, nothing left to do.
            break;
        }
    }
    trace!("poller exiting");
}

/// One diff pass over every watch. Returns false when the raw channel has
/// disconnected.
fn poll_once(table: &Table, tx: &Sender<RawEvent>) -> bool {
    let mut out = Vec::new();
    {
        let mut table = table.lock();
        for state in table.values_mut() {
            diff_watch(state, &mut out);
        }
    }
    for event in out {
        if tx.send(event).is_err() {
            return false;
        }
    }
    true
}

fn diff_watch(state: &mut WatchState, out: &mut Vec<RawEvent>) {
    match &mut state.snapshot {
        Snapshot::File(stamp) => {
            match fs::metadata(&state.path) {
                Ok(metadata) => {
                    let fresh = Stamp::of(&metadata);
                    match stamp {
                        Some(old) if *old != fresh => {
                            out.push(RawEvent::change(&state.path, EventKind::MODIFY));
                        }
                        None => {
                            out.push(RawEvent::change(&state.path, EventKind::CREATE));
                        }
                        _ => {}
                    }
                    *stamp = Some(fresh);
                }
                Err(_) => {
                    if stamp.is_some() {
                        out.push(RawEvent::change(&state.path, EventKind::DELETE));
                        *stamp = None;
                    }
                }
            }
        }
        Snapshot::Dir(children) => match scan_dir(&state.path) {
            Ok(fresh) => {
                for (name, stamp) in &fresh {
                    match children.get(name) {
                        None => {
                            out.push(RawEvent::change(
                                state.path.join(name),
                                EventKind::CREATE,
                            ));
                        }
                        // Directory mtimes move whenever children change;
                        // only report content changes for files.
                        Some(old) if old != stamp && !stamp.is_dir => {
                            out.push(RawEvent::change(
                                state.path.join(name),
                                EventKind::MODIFY,
                            ));
                        }
                        _ => {}
                    }
                }
                for name in children.keys() {
                    if !fresh.contains_key(name) {
                        out.push(RawEvent::change(state.path.join(name), EventKind::DELETE));
                    }
                }
                *children = fresh;
            }
            Err(_) => {
                // The watched directory itself is gone.
                out.push(RawEvent::change(&state.path, EventKind::DELETE));
                state.snapshot = Snapshot::Gone;
            }
        },
        Snapshot::Gone => {}
    }
}

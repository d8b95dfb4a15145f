//! Inert backend
//!
//! Accepts every registration and never emits an event. Used on platforms
//! with no usable notification mechanism, and by tests that drive the engine
//! through an injected raw channel.

use std::collections::HashSet;
use std::path::Path;

use crossbeam_channel::{unbounded, Receiver, Sender};

use super::{Backend, BackendError, Capabilities, RawEvent, WatchToken};

/// Backend that watches nothing.
pub struct NullBackend {
    next_token: u64,
    live: HashSet<WatchToken>,
    // Held so the raw channel stays connected until shutdown; tests clone it
    // to inject events.
    tx: Option<Sender<RawEvent>>,
}

impl NullBackend {
    /// Construct the backend and its (forever silent) raw channel.
    pub fn new() -> (Self, Receiver<RawEvent>) {
        let (tx, rx) = unbounded();
        let backend = Self { next_token: 0, live: HashSet::new(), tx: Some(tx) };
        (backend, rx)
    }

    /// A sender onto the raw channel, for scripted event injection.
    pub fn raw_sender(&self) -> Option<Sender<RawEvent>> {
        self.tx.clone()
    }
}

impl Backend for NullBackend {
    fn register(&mut self, path: &Path, _recursive: bool) -> Result<WatchToken, BackendError> {
        if !path.exists() {
            return Err(BackendError::PathNotFound(path.to_path_buf()));
        }
        self.next_token += 1;
        let token = WatchToken(self.next_token);
        self.live.insert(token);
        Ok(token)
    }

    fn cancel(&mut self, token: WatchToken) -> bool {
        self.live.remove(&token)
    }

    fn capabilities(&self) -> Capabilities {
        // No native recursion: the engine exercises its implicit-watch
        // management even over the inert variant.
        Capabilities { native_recursive: false, emits_access: true }
    }

    fn shutdown(&mut self) {
        self.tx = None;
        self.live.clear();
    }
}

//! Event dispatch
//!
//! One consumer per engine. The consumer either attaches an [`EventHandler`]
//! of its own (last one set wins) or relies on the default, which logs
//! through `tracing`. Delivery is synchronous and in translator order;
//! warnings and errors share the channel but arrive through their own
//! override points.

use std::path::Path;

use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::{debug, error, warn};

use crate::event::{ChangeEvent, EventKind};

/// Consumer-side override points.
///
/// All methods default to no-ops so a consumer only overrides what it needs.
/// Handlers run on the engine's pump thread and must not call back into the
/// engine's mutation operations.
pub trait EventHandler: Send {
    /// A file system change at `path` (for renames, `new_path` is the
    /// destination; otherwise it equals `path`).
    fn on_change(&mut self, kind: EventKind, path: &Path, new_path: &Path) {
        let _ = (kind, path, new_path);
    }

    /// A degraded-delivery condition (e.g. overflow) concerning `path`;
    /// watching continues.
    fn on_warning(&mut self, path: &Path, message: &str) {
        let _ = (path, message);
    }

    /// A backend failure concerning `path`; the affected watch may have
    /// been retired.
    fn on_error(&mut self, path: &Path, message: &str) {
        let _ = (path, message);
    }
}

/// Default terminal handler: renders events into the log stream.
struct LogHandler;

impl EventHandler for LogHandler {
    fn on_change(&mut self, kind: EventKind, path: &Path, new_path: &Path) {
        if kind == EventKind::RENAME {
            debug!("{kind:?} {} -> {}", path.display(), new_path.display());
        } else {
            debug!("{kind:?} {}", path.display());
        }
    }

    fn on_warning(&mut self, path: &Path, message: &str) {
        warn!(path = %path.display(), "{message}");
    }

    fn on_error(&mut self, path: &Path, message: &str) {
        error!(path = %path.display(), "{message}");
    }
}

/// Handler adapter that forwards whole events onto a channel, for consumers
/// that drain events from their own loop (and for tests).
pub struct ChannelHandler {
    tx: Sender<ChangeEvent>,
}

impl ChannelHandler {
    /// The handler and the receiving end of its channel.
    pub fn new() -> (Self, Receiver<ChangeEvent>) {
        let (tx, rx) = unbounded();
        (Self { tx }, rx)
    }
}

impl EventHandler for ChannelHandler {
    fn on_change(&mut self, kind: EventKind, path: &Path, new_path: &Path) {
        let event = if kind == EventKind::RENAME {
            ChangeEvent::rename(path, new_path)
        } else {
            ChangeEvent::new(kind, path)
        };
        let _ = self.tx.send(event);
    }

    fn on_warning(&mut self, path: &Path, message: &str) {
        let _ = self.tx.send(ChangeEvent::warning(path, message));
    }

    fn on_error(&mut self, path: &Path, message: &str) {
        let _ = self.tx.send(ChangeEvent::error(path, message));
    }
}

/// Owns the single registered handler and feeds it translated events.
pub(crate) struct Dispatcher {
    handler: Box<dyn EventHandler>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self { handler: Box::new(LogHandler) }
    }

    /// Replace the registered handler; the previous one is dropped.
    pub fn set_handler(&mut self, handler: Box<dyn EventHandler>) {
        self.handler = handler;
    }

    /// Deliver one event, branching warnings and errors to their override
    /// points.
    pub fn deliver(&mut self, event: &ChangeEvent) {
        if event.kind == EventKind::WARNING {
            self.handler.on_warning(&event.path, event.description());
        } else if event.kind == EventKind::ERROR {
            self.handler.on_error(&event.path, event.description());
        } else {
            self.handler
                .on_change(event.kind, &event.path, &event.new_path);
        }
    }
}

//! Watch registry
//!
//! Tracks the explicitly registered roots (the externally visible watch set)
//! and the implicit per-directory children the engine maintains under
//! recursive roots on backends without native recursion. The registry owns
//! every [`WatchToken`]; backends only ever see tokens to cancel.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use crate::backend::WatchToken;
use crate::event::EventKind;
use crate::filter::NameFilter;

/// One explicitly registered watch root.
#[derive(Debug, Clone)]
pub(crate) struct WatchEntry {
    /// Backend handle for the root itself
    pub token: WatchToken,
    /// Requested event kinds
    pub filter: EventKind,
    /// Tree watch (extends to all current and future descendants)
    pub recursive: bool,
    /// File-name mask for tree watches
    pub name_filter: Option<NameFilter>,
}

/// One implicit child watch under a recursive root.
#[derive(Debug, Clone)]
pub(crate) struct ImplicitWatch {
    pub token: WatchToken,
    /// The explicit root this child belongs to
    pub root: PathBuf,
}

/// The watch governing some event path, resolved and cloned out of the
/// table so callers can act on it without holding borrows into the maps.
#[derive(Debug, Clone)]
pub(crate) struct Governing {
    pub root: PathBuf,
    pub filter: EventKind,
    pub recursive: bool,
    pub name_filter: Option<NameFilter>,
    /// The event path is the explicit root itself
    pub is_root: bool,
}

/// Table of explicit roots and implicit children.
#[derive(Default)]
pub(crate) struct WatchRegistry {
    explicit: BTreeMap<PathBuf, WatchEntry>,
    implicit: HashMap<PathBuf, ImplicitWatch>,
}

impl WatchRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of explicit roots (implicit children are not visible).
    pub fn len(&self) -> usize {
        self.explicit.len()
    }

    /// Explicit roots in path order.
    pub fn paths(&self) -> Vec<PathBuf> {
        self.explicit.keys().cloned().collect()
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.explicit.contains_key(path)
    }

    pub fn insert(&mut self, path: PathBuf, entry: WatchEntry) {
        debug_assert!(!self.explicit.contains_key(&path));
        self.explicit.insert(path, entry);
    }

    pub fn remove(&mut self, path: &Path) -> Option<WatchEntry> {
        self.explicit.remove(path)
    }

    pub fn insert_implicit(&mut self, dir: PathBuf, watch: ImplicitWatch) {
        self.implicit.insert(dir, watch);
    }

    pub fn has_implicit(&self, dir: &Path) -> bool {
        self.implicit.contains_key(dir)
    }

    /// Retire every implicit child at or under `prefix`, returning the
    /// retired (path, token) pairs for backend cancellation.
    pub fn drain_implicit_under(&mut self, prefix: &Path) -> Vec<(PathBuf, WatchToken)> {
        let mut drained = Vec::new();
        self.implicit.retain(|path, watch| {
            if path.starts_with(prefix) {
                drained.push((path.clone(), watch.token));
                false
            } else {
                true
            }
        });
        drained.sort();
        drained
    }

    /// Retire everything, returning every live token.
    pub fn drain_all(&mut self) -> Vec<WatchToken> {
        let mut tokens: Vec<WatchToken> =
            self.explicit.values().map(|entry| entry.token).collect();
        tokens.extend(self.implicit.values().map(|watch| watch.token));
        self.explicit.clear();
        self.implicit.clear();
        tokens
    }

    /// Find the watch governing an event at `path`.
    ///
    /// In order: the path itself as an explicit root; the path as an
    /// implicit child (governed by its root's entry); the parent directory
    /// (a directory watch covers immediate children); and, on natively
    /// recursive backends where no implicit children exist, the nearest
    /// recursive ancestor root.
    pub fn resolve(&self, path: &Path, native_recursive: bool) -> Option<Governing> {
        if let Some(entry) = self.explicit.get(path) {
            return Some(governing(path, entry, true));
        }

        if let Some(watch) = self.implicit.get(path) {
            let entry = self.explicit.get(&watch.root)?;
            return Some(governing(&watch.root, entry, false));
        }

        if let Some(parent) = path.parent() {
            if let Some(entry) = self.explicit.get(parent) {
                return Some(governing(parent, entry, false));
            }
            if let Some(watch) = self.implicit.get(parent) {
                let entry = self.explicit.get(&watch.root)?;
                return Some(governing(&watch.root, entry, false));
            }
        }

        if native_recursive {
            for ancestor in path.ancestors().skip(1) {
                if let Some(entry) = self.explicit.get(ancestor) {
                    if entry.recursive {
                        return Some(governing(ancestor, entry, false));
                    }
                    // A non-recursive ancestor does not reach this deep.
                    break;
                }
            }
        }

        None
    }
}

fn governing(root: &Path, entry: &WatchEntry, is_root: bool) -> Governing {
    Governing {
        root: root.to_path_buf(),
        filter: entry.filter,
        recursive: entry.recursive,
        name_filter: entry.name_filter.clone(),
        is_root,
    }
}

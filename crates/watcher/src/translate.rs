//! Raw-event translation
//!
//! Turns backend [`RawEvent`]s into consumer-facing [`ChangeEvent`]s: splits
//! multi-kind masks, applies per-watch event and name filters, keeps the
//! implicit child-watch set of recursive roots in step with directory
//! creation/deletion, and synthesizes warnings for overflow conditions.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::backend::RawEvent;
use crate::event::{ChangeEvent, EventKind};
use crate::registry::{Governing, ImplicitWatch};
use crate::Inner;

/// Fixed order in which a multi-kind raw mask unfolds into events.
const KIND_ORDER: [EventKind; 5] = [
    EventKind::CREATE,
    EventKind::DELETE,
    EventKind::RENAME,
    EventKind::MODIFY,
    EventKind::ACCESS,
];

/// Window within which a second DELETE for the same path is considered a
/// duplicate report of the same removal. Under emulated recursion both a
/// directory's own watch and its parent's watch observe the removal.
const DELETE_DEDUP_WINDOW: Duration = Duration::from_secs(2);

/// Process one raw backend notification.
pub(crate) fn process(inner: &mut Inner, raw: RawEvent) {
    if raw.overflow {
        let message = format!(
            "event queue overflowed; some events for {} may have been lost",
            raw.path.display()
        );
        let wanted = inner
            .registry
            .resolve(&raw.path, inner.caps.native_recursive)
            .map_or(true, |g| g.filter.contains(EventKind::WARNING));
        if wanted {
            inner
                .dispatcher
                .deliver(&ChangeEvent::warning(raw.path.clone(), message));
        }
        return;
    }

    for kind in KIND_ORDER {
        if raw.kinds.contains(kind) {
            handle_kind(inner, kind, &raw);
        }
    }
}

fn handle_kind(inner: &mut Inner, kind: EventKind, raw: &RawEvent) {
    // Resolved fresh per kind: structural handling may mutate the table.
    let Some(governing) = inner
        .registry
        .resolve(&raw.path, inner.caps.native_recursive)
    else {
        debug!(path = %raw.path.display(), "event for unwatched path dropped");
        return;
    };

    if kind == EventKind::CREATE {
        handle_create(inner, raw, governing);
    } else if kind == EventKind::DELETE {
        handle_delete(inner, raw, governing);
    } else if kind == EventKind::RENAME {
        handle_rename(inner, raw, governing);
    } else if passes(&governing, kind, &raw.path, None) {
        inner
            .dispatcher
            .deliver(&ChangeEvent::new(kind, raw.path.clone()));
    }
}

/// Event-filter and name-filter gate. For renames either name may match.
fn passes(governing: &Governing, kind: EventKind, path: &Path, other: Option<&Path>) -> bool {
    if !governing.filter.contains(kind) {
        return false;
    }
    match &governing.name_filter {
        Some(filter) => {
            filter.matches(path) || other.map_or(false, |other| filter.matches(other))
        }
        None => true,
    }
}

fn handle_create(inner: &mut Inner, raw: &RawEvent, governing: Governing) {
    inner.recent_deletes.remove(&raw.path);

    // Re-arm before dispatch: a directory appearing under a tree watch gets
    // its implicit watch first, so nothing created inside it afterwards can
    // be missed. Entries that appeared inside it during the race window are
    // surfaced as synthetic creates.
    let mut discovered = Vec::new();
    if governing.recursive
        && !inner.caps.native_recursive
        && raw.path != governing.root
        && !inner.registry.has_implicit(&raw.path)
        && raw.path.is_dir()
    {
        discovered = arm_new_directory(inner, &governing.root, &raw.path);
    }

    if passes(&governing, EventKind::CREATE, &raw.path, None) {
        inner
            .dispatcher
            .deliver(&ChangeEvent::new(EventKind::CREATE, raw.path.clone()));
    }
    for path in discovered {
        inner.recent_deletes.remove(&path);
        if passes(&governing, EventKind::CREATE, &path, None) {
            inner
                .dispatcher
                .deliver(&ChangeEvent::new(EventKind::CREATE, path));
        }
    }
}

fn handle_delete(inner: &mut Inner, raw: &RawEvent, governing: Governing) {
    let now = Instant::now();
    inner
        .recent_deletes
        .retain(|_, seen| now.duration_since(*seen) < DELETE_DEDUP_WINDOW);
    let duplicate = inner.recent_deletes.contains_key(&raw.path);

    if !duplicate && passes(&governing, EventKind::DELETE, &raw.path, None) {
        inner
            .dispatcher
            .deliver(&ChangeEvent::new(EventKind::DELETE, raw.path.clone()));
    }
    inner.recent_deletes.insert(raw.path.clone(), now);

    if governing.is_root {
        // The root went away out-of-band (not via remove/remove_tree):
        // report the failure and retire the watch rather than leaving a
        // handle pointed at nothing.
        if governing.filter.contains(EventKind::ERROR) {
            let message = format!(
                "watched path {} was removed from disk; watch retired",
                governing.root.display()
            );
            inner
                .dispatcher
                .deliver(&ChangeEvent::error(governing.root.clone(), message));
        }
        retire_root(inner, &governing.root);
    } else if inner.registry.has_implicit(&raw.path) {
        // A subdirectory of a tree watch is gone; its watch (and those of
        // anything beneath it) is retired exactly once, after dispatch.
        for (path, token) in inner.registry.drain_implicit_under(&raw.path) {
            inner.backend.cancel(token);
            debug!(path = %path.display(), "implicit watch retired");
        }
    }
}

fn handle_rename(inner: &mut Inner, raw: &RawEvent, governing: Governing) {
    let new_path = raw
        .new_path
        .clone()
        .unwrap_or_else(|| raw.path.clone());

    if passes(&governing, EventKind::RENAME, &raw.path, Some(&new_path)) {
        inner
            .dispatcher
            .deliver(&ChangeEvent::rename(raw.path.clone(), new_path.clone()));
    }

    if governing.is_root {
        // Renaming the root out-of-band invalidates the registration the
        // same way deleting it does.
        if governing.filter.contains(EventKind::ERROR) {
            let message = format!(
                "watched path {} was renamed to {}; watch retired",
                governing.root.display(),
                new_path.display()
            );
            inner
                .dispatcher
                .deliver(&ChangeEvent::error(governing.root.clone(), message));
        }
        retire_root(inner, &governing.root);
    } else if inner.registry.has_implicit(&raw.path) {
        for (_, token) in inner.registry.drain_implicit_under(&raw.path) {
            inner.backend.cancel(token);
        }
        // Still inside the tree under its new name: arm it there. Contents
        // moved with it, so no synthetic creates.
        if governing.recursive
            && !inner.caps.native_recursive
            && new_path.starts_with(&governing.root)
            && new_path.is_dir()
        {
            arm_new_directory(inner, &governing.root, &new_path);
        }
    }
}

/// Retire an explicit root and every implicit child beneath it.
pub(crate) fn retire_root(inner: &mut Inner, root: &Path) {
    if let Some(entry) = inner.registry.remove(root) {
        inner.backend.cancel(entry.token);
    }
    for (_, token) in inner.registry.drain_implicit_under(root) {
        inner.backend.cancel(token);
    }
}

/// Seed implicit watches for every subdirectory of a freshly added tree
/// root. Registration failures surface as error events; the walk continues.
pub(crate) fn seed_tree(inner: &mut Inner, root: &Path) {
    for entry in WalkDir::new(root).min_depth(1).follow_links(false) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                warn!("tree walk under {} failed: {err}", root.display());
                continue;
            }
        };
        if entry.file_type().is_dir() {
            register_implicit(inner, root, entry.path());
        }
    }
}

/// Arm a directory that appeared under a tree watch: register it and every
/// nested directory, returning all entries found beneath it (the race-window
/// discoveries, dispatched as synthetic creates by the caller).
fn arm_new_directory(inner: &mut Inner, root: &Path, dir: &Path) -> Vec<PathBuf> {
    let mut discovered = Vec::new();
    for entry in WalkDir::new(dir).follow_links(false) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                // The directory may be mutating while we walk it; whatever
                // we miss here will be reported by its own watch.
                debug!("walk under {} failed: {err}", dir.display());
                continue;
            }
        };
        let path = entry.path();
        if entry.file_type().is_dir() && !inner.registry.has_implicit(path) && path != root {
            register_implicit(inner, root, path);
        }
        if path != dir {
            discovered.push(path.to_path_buf());
        }
    }
    discovered
}

fn register_implicit(inner: &mut Inner, root: &Path, dir: &Path) {
    match inner.backend.register(dir, false) {
        Ok(token) => {
            inner.registry.insert_implicit(
                dir.to_path_buf(),
                ImplicitWatch { token, root: root.to_path_buf() },
            );
            debug!(path = %dir.display(), "implicit watch armed");
        }
        Err(err) => {
            let message = format!(
                "failed to watch subdirectory {}: {err}",
                dir.display()
            );
            inner
                .dispatcher
                .deliver(&ChangeEvent::error(dir.to_path_buf(), message));
        }
    }
}

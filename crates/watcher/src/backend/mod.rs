//! Platform backend abstraction
//!
//! A backend turns registry entries into OS-level watch registrations and
//! feeds raw notifications back over a channel. All variants emit the same
//! [`RawEvent`] shape; differences in platform power are declared through
//! [`Capabilities`] and compensated for by the engine, not leaked to the
//! consumer.

pub mod native;
pub mod null;
pub mod poll;

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crossbeam_channel::Receiver;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::WatcherConfig;
use crate::event::EventKind;

/// One raw platform notification, normalized to a uniform shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    /// Primary affected path
    pub path: PathBuf,
    /// Rename destination, if the notification carried one
    pub new_path: Option<PathBuf>,
    /// Mask of raw kinds; a single notification may carry several
    pub kinds: EventKind,
    /// The OS buffer overflowed and events may have been lost
    pub overflow: bool,
}

impl RawEvent {
    /// A plain notification at `path`.
    pub fn change(path: impl Into<PathBuf>, kinds: EventKind) -> Self {
        Self { path: path.into(), new_path: None, kinds, overflow: false }
    }

    /// A rename notification carrying both halves.
    pub fn rename(path: impl Into<PathBuf>, new_path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            new_path: Some(new_path.into()),
            kinds: EventKind::RENAME,
            overflow: false,
        }
    }

    /// An overflow marker for `path` (possibly a watch root).
    pub fn overflow(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            new_path: None,
            kinds: EventKind::empty(),
            overflow: true,
        }
    }
}

/// Opaque handle to one OS-level watch registration.
///
/// The registry owns the watch; a token is only good for cancelling it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatchToken(pub(crate) u64);

/// Errors surfaced by backend registration and cancellation.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("path not found: {0}")]
    PathNotFound(PathBuf),

    #[error("watch limit reached")]
    WatchLimit,

    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

/// What a backend variant can express natively.
///
/// The engine consults this once at construction: a backend without native
/// recursion gets per-directory implicit watches managed on top of it, and a
/// backend that cannot observe accesses triggers a degraded-delivery warning
/// when a filter requests them.
#[derive(Debug, Clone, Copy)]
pub struct Capabilities {
    /// One registration covers a whole directory tree, present and future
    pub native_recursive: bool,
    /// ACCESS events can actually be observed
    pub emits_access: bool,
}

/// Contract every platform variant satisfies.
///
/// Raw events flow over the `Receiver<RawEvent>` handed out when the backend
/// is constructed; registration and cancellation are synchronous and fast
/// (never block on the notification stream).
pub trait Backend: Send {
    /// Register an OS-level watch for `path`.
    ///
    /// `recursive` is honored only by variants with native recursion; the
    /// engine emulates recursion for the rest.
    fn register(&mut self, path: &Path, recursive: bool) -> Result<WatchToken, BackendError>;

    /// Cancel a previously registered watch. Returns false if the token is
    /// unknown (already cancelled or never issued).
    fn cancel(&mut self, token: WatchToken) -> bool;

    /// What this variant can express natively.
    fn capabilities(&self) -> Capabilities;

    /// Stop producing events and release platform resources. The raw channel
    /// disconnects once the last sender is gone, which lets the engine's
    /// pump thread run to completion.
    fn shutdown(&mut self) {}
}

/// Which backend variant to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Prefer the native variant, fall back to polling
    #[default]
    Auto,
    /// Kernel-provided notifications via the platform's native mechanism
    Native,
    /// Portable snapshot-diff polling
    Poll,
    /// Inert variant that accepts registrations and emits nothing
    Null,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackendKind::Auto => "auto",
            BackendKind::Native => "native",
            BackendKind::Poll => "poll",
            BackendKind::Null => "null",
        };
        f.write_str(name)
    }
}

// Hand-rolled FromStr so the CLI can take `--backend poll` without pulling
// clap into the library.
impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(BackendKind::Auto),
            "native" => Ok(BackendKind::Native),
            "poll" => Ok(BackendKind::Poll),
            "null" => Ok(BackendKind::Null),
            other => Err(format!("unknown backend kind {other:?}")),
        }
    }
}

/// Construct the configured backend variant together with its raw channel.
///
/// `Auto` prefers the native variant and degrades to polling when the
/// platform mechanism cannot be brought up (reported via `tracing`, not as
/// an error: selection happens before any consumer is attached).
pub(crate) fn create(
    kind: BackendKind,
    config: &WatcherConfig,
) -> anyhow::Result<(Box<dyn Backend>, Receiver<RawEvent>)> {
    match kind {
        BackendKind::Native => {
            let (backend, rx) = native::NativeBackend::new()?;
            Ok((Box::new(backend), rx))
        }
        BackendKind::Poll => {
            let (backend, rx) = poll::PollBackend::new(config.poll_interval());
            Ok((Box::new(backend), rx))
        }
        BackendKind::Null => {
            let (backend, rx) = null::NullBackend::new();
            Ok((Box::new(backend), rx))
        }
        BackendKind::Auto => match native::NativeBackend::new() {
            Ok((backend, rx)) => Ok((Box::new(backend), rx)),
            Err(err) => {
                tracing::warn!("native backend unavailable ({err}), falling back to polling");
                let (backend, rx) = poll::PollBackend::new(config.poll_interval());
                Ok((Box::new(backend), rx))
            }
        },
    }
}

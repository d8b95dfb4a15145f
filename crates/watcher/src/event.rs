//! Uniform change-event model
//!
//! Every backend, whatever its native notification shape, ends up producing
//! [`ChangeEvent`]s through the translator. Event kinds are a bitmask so a
//! single mask can serve both as the kind of one event and as a per-watch
//! filter of requested kinds.

use std::fmt;
use std::path::{Path, PathBuf};

use bitflags::bitflags;

bitflags! {
    /// Kinds of file system change events.
    ///
    /// A [`ChangeEvent`] carries exactly one bit; a watch filter may carry
    /// any union of them.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct EventKind: u32 {
        /// File or directory was created
        const CREATE = 0x01;
        /// File or directory was deleted
        const DELETE = 0x02;
        /// File or directory was renamed
        const RENAME = 0x04;
        /// File or directory contents/metadata were modified
        const MODIFY = 0x08;
        /// File or directory was accessed
        const ACCESS = 0x10;
        /// A degraded-delivery condition arose (e.g. buffer overflow)
        const WARNING = 0x20;
        /// A backend failure arose
        const ERROR = 0x40;

        /// Every kind, including warnings and errors
        const ALL = 0x7F;
    }
}

impl EventKind {
    /// Name of a single-bit kind, for rendering.
    fn name(self) -> &'static str {
        if self == EventKind::CREATE {
            "CREATE"
        } else if self == EventKind::DELETE {
            "DELETE"
        } else if self == EventKind::RENAME {
            "RENAME"
        } else if self == EventKind::MODIFY {
            "MODIFY"
        } else if self == EventKind::ACCESS {
            "ACCESS"
        } else if self == EventKind::WARNING {
            "WARNING"
        } else if self == EventKind::ERROR {
            "ERROR"
        } else {
            "UNKNOWN"
        }
    }
}

/// A single translated file system change, delivered once to the consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    /// The kind of change (exactly one [`EventKind`] bit)
    pub kind: EventKind,

    /// Path at which the change occurred
    pub path: PathBuf,

    /// Rename destination; equals `path` for every other kind
    pub new_path: PathBuf,

    /// Description, present only for warnings and errors
    pub message: Option<String>,
}

impl ChangeEvent {
    /// A plain change at `path`.
    pub fn new(kind: EventKind, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let new_path = path.clone();
        Self { kind, path, new_path, message: None }
    }

    /// A rename from `path` to `new_path`.
    pub fn rename(path: impl Into<PathBuf>, new_path: impl Into<PathBuf>) -> Self {
        Self {
            kind: EventKind::RENAME,
            path: path.into(),
            new_path: new_path.into(),
            message: None,
        }
    }

    /// A degraded-delivery warning concerning `path`.
    pub fn warning(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        let path = path.into();
        let new_path = path.clone();
        Self {
            kind: EventKind::WARNING,
            path,
            new_path,
            message: Some(message.into()),
        }
    }

    /// A backend failure concerning `path`.
    pub fn error(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        let path = path.into();
        let new_path = path.clone();
        Self {
            kind: EventKind::ERROR,
            path,
            new_path,
            message: Some(message.into()),
        }
    }

    /// True for warning and error events.
    pub fn is_error(&self) -> bool {
        self.kind.intersects(EventKind::WARNING | EventKind::ERROR)
    }

    /// Warning/error description, empty for plain changes.
    pub fn description(&self) -> &str {
        self.message.as_deref().unwrap_or("")
    }

    /// Path accessor, mirroring the public event payload.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rename destination accessor.
    pub fn new_path(&self) -> &Path {
        &self.new_path
    }
}

impl fmt::Display for ChangeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.kind == EventKind::RENAME {
            write!(
                f,
                "RENAME {} -> {}",
                self.path.display(),
                self.new_path.display()
            )
        } else if self.is_error() {
            write!(f, "{} {}", self.kind.name(), self.description())
        } else {
            write!(f, "{} {}", self.kind.name(), self.path.display())
        }
    }
}

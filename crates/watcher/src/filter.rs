//! File-name filters for tree watches
//!
//! A tree watch may carry a glob-style mask (`*.txt`) restricting which file
//! names generate events. The mask never restricts which directories are
//! watched; structural tracking continues underneath it.

use std::path::Path;

use anyhow::{Context, Result};
use globset::{Glob, GlobMatcher};

/// Compiled file-name mask for a tree watch.
///
/// Matches against the final path component only, so `*.txt` accepts
/// `/tmp/root/a/f.txt` regardless of depth.
#[derive(Debug, Clone)]
pub struct NameFilter {
    pattern: String,
    matcher: GlobMatcher,
}

impl NameFilter {
    /// Compile a glob pattern. An empty pattern means "match everything";
    /// callers represent that as `None` instead of constructing a filter.
    pub fn new(pattern: &str) -> Result<Self> {
        let glob = Glob::new(pattern)
            .with_context(|| format!("invalid name filter pattern {pattern:?}"))?;
        Ok(Self {
            pattern: pattern.to_string(),
            matcher: glob.compile_matcher(),
        })
    }

    /// Compile an optional pattern, mapping empty to `None`.
    pub fn from_pattern(pattern: &str) -> Result<Option<Self>> {
        if pattern.is_empty() {
            Ok(None)
        } else {
            Self::new(pattern).map(Some)
        }
    }

    /// The source pattern.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Whether the final component of `path` matches the mask.
    pub fn matches(&self, path: &Path) -> bool {
        match path.file_name() {
            Some(name) => self.matcher.is_match(name),
            // A bare root has no file name; let it through rather than
            // silently suppressing events for the watch root itself.
            None => true,
        }
    }
}

//! Engine configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backend::BackendKind;

/// Tunables for one watcher instance.
///
/// Deserializable so frontends can load it from a config file and override
/// individual fields from flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatcherConfig {
    /// Backend variant selection (default: auto-detect)
    #[serde(default)]
    pub backend: BackendKind,

    /// Snapshot interval for the polling backend, in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl WatcherConfig {
    /// Polling interval as a [`Duration`].
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Auto,
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

fn default_poll_interval_ms() -> u64 {
    200
}

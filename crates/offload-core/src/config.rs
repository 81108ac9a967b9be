//! Runtime configuration shared by all worker backends.

use std::time::Duration;

/// Environment variable overriding [`WorkerConfig::poll_interval`] (milliseconds).
pub const POLL_INTERVAL_ENV: &str = "OFFLOAD_POLL_INTERVAL_MS";

/// Environment variable overriding [`WorkerConfig::max_message_bytes`].
pub const MAX_MESSAGE_BYTES_ENV: &str = "OFFLOAD_MAX_MESSAGE_BYTES";

/// Configuration for worker handles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Interval between liveness checks while joining a process-backed handle.
    pub poll_interval: Duration,

    /// Largest IPC frame accepted from a worker process.
    pub max_message_bytes: usize,

    /// Kill and reap still-running worker processes when their handle is dropped.
    pub kill_on_drop: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(10),
            max_message_bytes: 100 * 1024 * 1024,
            kill_on_drop: true,
        }
    }
}

impl WorkerConfig {
    /// Defaults, overridden by `OFFLOAD_POLL_INTERVAL_MS` and
    /// `OFFLOAD_MAX_MESSAGE_BYTES` when set to valid numbers.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(raw) = lookup(POLL_INTERVAL_ENV) {
            match raw.trim().parse::<u64>() {
                Ok(ms) if ms > 0 => config.poll_interval = Duration::from_millis(ms),
                _ => tracing::warn!("Ignoring invalid {}={:?}", POLL_INTERVAL_ENV, raw),
            }
        }

        if let Some(raw) = lookup(MAX_MESSAGE_BYTES_ENV) {
            match raw.trim().parse::<usize>() {
                Ok(bytes) if bytes > 0 => config.max_message_bytes = bytes,
                _ => tracing::warn!("Ignoring invalid {}={:?}", MAX_MESSAGE_BYTES_ENV, raw),
            }
        }

        config
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn max_message_bytes(mut self, bytes: usize) -> Self {
        self.max_message_bytes = bytes;
        self
    }

    pub fn kill_on_drop(mut self, kill: bool) -> Self {
        self.kill_on_drop = kill;
        self
    }
}

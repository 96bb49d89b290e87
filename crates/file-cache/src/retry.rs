//! Per-path poll counters for the stampede wait

use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// What a `get` should do after a miss
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Sleep and look again
    Wait { attempt: u32 },
    /// Budget exhausted, report the key as absent
    GiveUp,
}

/// Consecutive misses per cache file, owned by one cache instance
#[derive(Debug, Default)]
pub struct RetryState {
    counts: Mutex<HashMap<PathBuf, u32>>,
}

impl RetryState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a miss for `path` and decide whether to keep polling.
    ///
    /// On exhaustion the counter is reset to 1, so the next independent `get`
    /// starts a fresh (one shorter) wait instead of giving up immediately.
    pub fn observe_miss(&self, path: &Path, max_retries: u32) -> RetryDecision {
        let mut counts = self.counts.lock();
        let count = counts.entry(path.to_path_buf()).or_insert(0);
        if *count < max_retries {
            *count += 1;
            RetryDecision::Wait { attempt: *count }
        } else {
            *count = 1;
            RetryDecision::GiveUp
        }
    }

    /// Forget the counter once the key resolved to a value
    pub fn resolve(&self, path: &Path) {
        self.counts.lock().remove(path);
    }

    pub fn clear(&self) {
        self.counts.lock().clear();
    }

    pub fn count(&self, path: &Path) -> Option<u32> {
        self.counts.lock().get(path).copied()
    }
}

//! The file cache store
//!
//! Each key lives in its own file under the base directory. Reads poll for a
//! bounded time when a key is missing so that a caller racing a concurrent
//! writer picks up the value instead of reporting a miss.

use crate::codec::{self, DecodeError, Entry};
use crate::config::CacheConfig;
use crate::error::{BatchError, CacheError, KeyFailure, Result};
use crate::path;
use crate::retry::{RetryDecision, RetryState};
use crate::value::Value;
use futures::future::join_all;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info, warn};

/// Per-operation diagnostics, only emitted when the cache is verbose
macro_rules! verbose {
    ($cache:expr, $($arg:tt)+) => {
        if $cache.config.verbose {
            debug!($($arg)+);
        }
    };
}

/// Options for a single write
#[derive(Debug, Clone, Copy, Default)]
pub struct SetOptions {
    /// TTL in seconds; `None` or `0` use the configured default
    pub ttl_secs: Option<u64>,
    /// Sliding expiration on every hit. Not supported by this store.
    pub refresh: bool,
}

/// What a single look at the entry file found
enum Lookup {
    Hit(Entry),
    Expired(Entry),
    Corrupt(DecodeError),
    Absent,
}

/// A key/value cache persisted as one file per key
#[derive(Debug)]
pub struct FileCache {
    config: CacheConfig,
    retries: RetryState,
}

impl FileCache {
    /// Store type reported to cache managers
    pub const STORE_TYPE: &'static str = "file-cache";

    pub fn new(config: CacheConfig) -> Self {
        info!(base_dir = ?config.base_dir, "File cache configured");
        Self {
            config,
            retries: RetryState::new(),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn base_dir(&self) -> &Path {
        &self.config.base_dir
    }

    /// Location of the entry file for `key`
    pub fn path_for(&self, key: &str) -> PathBuf {
        path::path_for(&self.config.base_dir, key)
    }

    async fn look_up(&self, key: &str, path: &Path) -> Result<Lookup> {
        if !fs::try_exists(path).await? {
            verbose!(self, key, "No cache entry found");
            return Ok(Lookup::Absent);
        }

        verbose!(self, key, path = ?path, "Loading cache entry");
        let bytes = match fs::read(path).await {
            Ok(bytes) => bytes,
            // Deleted between the existence check and the read
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Lookup::Absent),
            Err(e) => return Err(e.into()),
        };

        Ok(match codec::decode(&bytes) {
            Ok(entry) if entry.is_valid_at(codec::now_millis()) => Lookup::Hit(entry),
            Ok(entry) => Lookup::Expired(entry),
            Err(e) => Lookup::Corrupt(e),
        })
    }

    /// Fetch the value for `key`.
    ///
    /// Missing, expired and unreadable entries are polled for up to
    /// `max_retries` times, `retry_delay` apart, before resolving to `None`.
    /// Only filesystem failures other than "not found" are errors.
    pub async fn get(&self, key: &str) -> Result<Option<Value>> {
        let path = self.path_for(key);

        loop {
            match self.look_up(key, &path).await {
                Ok(Lookup::Hit(entry)) => {
                    self.retries.resolve(&path);
                    return Ok(Some(entry.value));
                }
                Ok(Lookup::Expired(entry)) => {
                    verbose!(self, key, expires_at = entry.expires_at, "Cache entry expired");
                }
                Ok(Lookup::Corrupt(e)) => {
                    verbose!(self, key, error = %e, "Cache entry could not be parsed");
                }
                Ok(Lookup::Absent) => {}
                Err(e) => {
                    warn!(key, error = %e, "Failed to read cache entry");
                    return Err(e);
                }
            }

            match self.retries.observe_miss(&path, self.config.max_retries) {
                RetryDecision::Wait { attempt } => {
                    verbose!(
                        self,
                        key,
                        attempt,
                        delay_ms = self.config.retry_delay.as_millis() as u64,
                        "Waiting for cache entry"
                    );
                    tokio::time::sleep(self.config.retry_delay).await;
                }
                RetryDecision::GiveUp => {
                    verbose!(self, key, "Giving up on cache entry");
                    return Ok(None);
                }
            }
        }
    }

    /// Fetch several keys concurrently, each with its own wait budget.
    ///
    /// Every requested key is present in the result; keys that resolved to
    /// nothing map to `None`. A key whose read fails is logged and also maps
    /// to `None`, so the values of the other keys are still returned.
    pub async fn mget<K: AsRef<str>>(&self, keys: &[K]) -> HashMap<String, Option<Value>> {
        let lookups = keys.iter().map(|key| async move {
            let key = key.as_ref();
            (key.to_string(), self.get(key).await)
        });

        join_all(lookups)
            .await
            .into_iter()
            .map(|(key, result)| {
                let value = result.unwrap_or_else(|e| {
                    warn!(key = %key, error = %e, "Lookup failed in batch, treating as absent");
                    None
                });
                (key, value)
            })
            .collect()
    }

    fn effective_ttl(&self, ttl_secs: Option<u64>) -> u64 {
        ttl_secs
            .filter(|ttl| *ttl > 0)
            .unwrap_or(self.config.default_ttl_secs)
    }

    fn prepare_write(
        &self,
        key: &str,
        value: &Value,
        ttl_secs: Option<u64>,
    ) -> Result<(PathBuf, Vec<u8>)> {
        let ttl_secs = self.effective_ttl(ttl_secs);
        let path = self.path_for(key);
        let bytes = codec::encode(key, ttl_secs, value, codec::now_millis())?;
        verbose!(self, key, path = ?path, ttl_secs, "Writing cache entry");
        Ok((path, bytes))
    }

    async fn write_entry(&self, key: &str, value: &Value, ttl_secs: Option<u64>) -> Result<()> {
        let (path, bytes) = self.prepare_write(key, value, ttl_secs)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&path, bytes).await?;
        Ok(())
    }

    fn write_entry_blocking(
        &self,
        key: &str,
        value: &Value,
        ttl_secs: Option<u64>,
    ) -> Result<()> {
        let (path, bytes) = self.prepare_write(key, value, ttl_secs)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, bytes)?;
        Ok(())
    }

    /// Store `value` under `key`, replacing any previous entry
    pub async fn set(
        &self,
        key: &str,
        value: impl Into<Value>,
        ttl_secs: Option<u64>,
    ) -> Result<()> {
        self.set_with(
            key,
            value,
            SetOptions {
                ttl_secs,
                refresh: false,
            },
        )
        .await
    }

    pub async fn set_with(
        &self,
        key: &str,
        value: impl Into<Value>,
        options: SetOptions,
    ) -> Result<()> {
        reject_refresh(&options)?;
        self.write_entry(key, &value.into(), options.ttl_secs).await
    }

    /// Synchronous form of [`set`](Self::set)
    pub fn set_blocking(
        &self,
        key: &str,
        value: impl Into<Value>,
        ttl_secs: Option<u64>,
    ) -> Result<()> {
        self.write_entry_blocking(key, &value.into(), ttl_secs)
    }

    /// Store every entry concurrently. Failed keys are reported together;
    /// entries that were written stay written.
    pub async fn mset<I, K, V>(&self, entries: I, ttl_secs: Option<u64>) -> Result<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        let entries = collect_entries(entries);
        let writes = entries.iter().map(|(key, value)| async move {
            (key.clone(), self.write_entry(key, value, ttl_secs).await)
        });
        batch_unit(join_all(writes).await)
    }

    /// Synchronous form of [`mset`](Self::mset)
    pub fn mset_blocking<I, K, V>(&self, entries: I, ttl_secs: Option<u64>) -> Result<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        let results = collect_entries(entries)
            .into_iter()
            .map(|(key, value)| {
                let result = self.write_entry_blocking(&key, &value, ttl_secs);
                (key, result)
            })
            .collect::<Vec<_>>();
        batch_unit(results)
    }

    /// Remove the entry for `key`. Returns whether a file was removed.
    pub async fn del(&self, key: &str) -> Result<bool> {
        let path = self.path_for(key);
        match fs::remove_file(&path).await {
            Ok(()) => {
                verbose!(self, key, "Deleted cache entry");
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => {
                warn!(key, error = %e, "Could not delete cache entry");
                Err(e.into())
            }
        }
    }

    fn del_one_blocking(&self, key: &str) -> Result<bool> {
        match std::fs::remove_file(self.path_for(key)) {
            Ok(()) => {
                verbose!(self, key, "Deleted cache entry");
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => {
                warn!(key, error = %e, "Could not delete cache entry");
                Err(e.into())
            }
        }
    }

    /// Remove several keys concurrently and return how many files were
    /// removed. A failing key does not stop the others.
    pub async fn del_many<K: AsRef<str>>(&self, keys: &[K]) -> Result<usize> {
        let removals = keys.iter().map(|key| async move {
            let key = key.as_ref();
            (key.to_string(), self.del(key).await)
        });
        batch_count(join_all(removals).await)
    }

    /// Synchronous form of [`del_many`](Self::del_many)
    pub fn del_blocking<K: AsRef<str>>(&self, keys: &[K]) -> Result<usize> {
        let results = keys
            .iter()
            .map(|key| {
                let key = key.as_ref();
                (key.to_string(), self.del_one_blocking(key))
            })
            .collect::<Vec<_>>();
        batch_count(results)
    }

    /// Drop every entry and all wait counters
    pub async fn flush(&self) -> Result<()> {
        verbose!(self, "Flushing everything");
        self.retries.clear();
        match fs::remove_dir_all(&self.config.base_dir).await {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    /// Synchronous form of [`flush`](Self::flush)
    pub fn flush_blocking(&self) -> Result<()> {
        verbose!(self, "Flushing everything");
        self.retries.clear();
        match std::fs::remove_dir_all(&self.config.base_dir) {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    /// Number of entry files currently in the base directory
    pub async fn entry_count(&self) -> Result<usize> {
        let mut dir = match fs::read_dir(&self.config.base_dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut count = 0;
        while let Some(item) = dir.next_entry().await? {
            let is_entry = item
                .path()
                .extension()
                .is_some_and(|ext| ext == path::ENTRY_EXTENSION);
            if is_entry {
                count += 1;
            }
        }
        Ok(count)
    }
}

fn reject_refresh(options: &SetOptions) -> Result<()> {
    if options.refresh {
        return Err(CacheError::Unsupported(
            "refresh is not supported by this store".to_string(),
        ));
    }
    Ok(())
}

fn collect_entries<I, K, V>(entries: I) -> Vec<(String, Value)>
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<Value>,
{
    entries
        .into_iter()
        .map(|(key, value)| (key.into(), value.into()))
        .collect()
}

fn partition<T>(results: Vec<(String, Result<T>)>) -> (Vec<(String, T)>, Vec<KeyFailure>) {
    let mut ok = Vec::new();
    let mut failures = Vec::new();
    for (key, result) in results {
        match result {
            Ok(value) => ok.push((key, value)),
            Err(error) => failures.push(KeyFailure { key, error }),
        }
    }
    (ok, failures)
}

fn batch_unit(results: Vec<(String, Result<()>)>) -> Result<()> {
    let (written, failures) = partition(results);
    if failures.is_empty() {
        Ok(())
    } else {
        Err(BatchError {
            completed: written.len(),
            failures,
        }
        .into())
    }
}

fn batch_count(results: Vec<(String, Result<bool>)>) -> Result<usize> {
    let (done, failures) = partition(results);
    let removed = done.iter().filter(|(_, removed)| *removed).count();
    if failures.is_empty() {
        Ok(removed)
    } else {
        Err(BatchError {
            completed: removed,
            failures,
        }
        .into())
    }
}

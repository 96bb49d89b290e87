//! Error types for the file cache

use std::fmt;

/// Errors surfaced to callers of the cache.
///
/// Missing, expired and corrupt entries are not errors; they resolve to an
/// absent value.
#[derive(Debug)]
pub enum CacheError {
    /// Filesystem failure other than "not found"
    Io(Box<std::io::Error>),
    /// Value graph could not be serialized
    Serialization(String),
    /// Requested behaviour is not supported by this store
    Unsupported(String),
    /// Invalid or missing configuration
    Config(String),
    /// One or more keys of a batch operation failed
    Batch(BatchError),
}

/// Partial outcome of a batch operation that had failures.
///
/// Work completed before or alongside the failures is not rolled back.
#[derive(Debug)]
pub struct BatchError {
    /// Number of keys that were processed successfully
    pub completed: usize,
    pub failures: Vec<KeyFailure>,
}

/// A single key's failure inside a batch
#[derive(Debug)]
pub struct KeyFailure {
    pub key: String,
    pub error: CacheError,
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheError::Io(err) => write!(f, "IO error: {}", err),
            CacheError::Serialization(msg) => write!(f, "Serialization error: {}", msg),
            CacheError::Unsupported(msg) => write!(f, "Unsupported: {}", msg),
            CacheError::Config(msg) => write!(f, "Configuration error: {}", msg),
            CacheError::Batch(err) => write!(f, "{}", err),
        }
    }
}

impl fmt::Display for BatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Batch failed for {} key(s) ({} completed)",
            self.failures.len(),
            self.completed
        )?;
        if let Some(first) = self.failures.first() {
            write!(f, ": {}: {}", first.key, first.error)?;
        }
        Ok(())
    }
}

impl std::error::Error for CacheError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CacheError::Io(err) => Some(err.as_ref()),
            CacheError::Batch(err) => err
                .failures
                .first()
                .map(|failure| &failure.error as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

impl From<std::io::Error> for CacheError {
    fn from(err: std::io::Error) -> Self {
        CacheError::Io(Box::new(err))
    }
}

impl From<BatchError> for CacheError {
    fn from(err: BatchError) -> Self {
        CacheError::Batch(err)
    }
}

pub type Result<T> = std::result::Result<T, CacheError>;

//! File-based key/value cache with TTL expiration
//!
//! Every entry is stored as its own file, named after a digest of the key,
//! so the cache survives restarts and can be shared by processes on one
//! host. Reads of a missing key wait a bounded time for a concurrent writer
//! before reporting a miss. Expiration is checked lazily on read.

pub mod codec;
pub mod config;
pub mod error;
pub mod path;
pub mod retry;
mod store;
pub mod value;

pub use codec::{DecodeError, Entry};
pub use config::CacheConfig;
pub use error::{BatchError, CacheError, KeyFailure, Result};
pub use store::{FileCache, SetOptions};
pub use value::{List, Map, Value};

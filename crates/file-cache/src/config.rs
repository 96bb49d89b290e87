//! Cache configuration

use crate::error::{CacheError, Result};
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

pub const DEFAULT_TTL_SECS: u64 = 900; // 15 minutes
pub const DEFAULT_MAX_RETRIES: u32 = 4;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(250);

/// Configuration for a [`FileCache`](crate::FileCache)
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Directory holding one file per cached key
    pub base_dir: PathBuf,
    /// TTL applied when a write does not name one
    pub default_ttl_secs: u64,
    /// Poll cycles a `get` performs while waiting for a missing key
    pub max_retries: u32,
    /// Pause between poll cycles
    pub retry_delay: Duration,
    /// Emit per-operation diagnostics
    pub verbose: bool,
}

impl CacheConfig {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            default_ttl_secs: DEFAULT_TTL_SECS,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
            verbose: false,
        }
    }

    /// Derive the base directory from an identifier under the system temp dir
    pub fn for_identifier(identifier: &str) -> Result<Self> {
        if identifier.is_empty() {
            return Err(CacheError::Config(
                "either a base directory or an identifier is required".to_string(),
            ));
        }
        Ok(Self::new(std::env::temp_dir().join(identifier)))
    }

    pub fn with_default_ttl_secs(mut self, ttl_secs: u64) -> Self {
        self.default_ttl_secs = ttl_secs;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Load configuration from `FILE_CACHE_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let config = match lookup("FILE_CACHE_DIR") {
            Some(dir) if !dir.is_empty() => Self::new(dir),
            _ => {
                let identifier = lookup("FILE_CACHE_KEY").ok_or_else(|| {
                    CacheError::Config(
                        "either FILE_CACHE_DIR or FILE_CACHE_KEY must be set".to_string(),
                    )
                })?;
                Self::for_identifier(&identifier)?
            }
        };

        let default_ttl_secs = parse_or(
            &lookup,
            "FILE_CACHE_TTL_SECS",
            config.default_ttl_secs,
        );
        let max_retries = parse_or(&lookup, "FILE_CACHE_MAX_RETRIES", config.max_retries);
        let retry_delay_ms = parse_or(
            &lookup,
            "FILE_CACHE_RETRY_DELAY_MS",
            config.retry_delay.as_millis() as u64,
        );
        let verbose = lookup("FILE_CACHE_VERBOSE")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        Ok(config
            .with_default_ttl_secs(default_ttl_secs)
            .with_max_retries(max_retries)
            .with_retry_delay(Duration::from_millis(retry_delay_ms))
            .with_verbose(verbose))
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    match lookup(name) {
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            warn!(variable = name, value = %raw, "Ignoring unparsable value");
            default
        }),
        None => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name: &str| vars.get(name).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = CacheConfig::new("/tmp/cache");
        assert_eq!(config.base_dir, PathBuf::from("/tmp/cache"));
        assert_eq!(config.default_ttl_secs, 900);
        assert_eq!(config.max_retries, 4);
        assert_eq!(config.retry_delay, Duration::from_millis(250));
        assert!(!config.verbose);
    }

    #[test]
    fn test_for_identifier_uses_temp_dir() {
        let config = CacheConfig::for_identifier("my-app").unwrap();
        assert_eq!(config.base_dir, std::env::temp_dir().join("my-app"));
    }

    #[test]
    fn test_for_identifier_rejects_empty() {
        assert!(matches!(
            CacheConfig::for_identifier(""),
            Err(CacheError::Config(_))
        ));
    }

    #[test]
    fn test_from_lookup_requires_location() {
        let result = CacheConfig::from_lookup(lookup_from(&[]));
        assert!(matches!(result, Err(CacheError::Config(_))));
    }

    #[test]
    fn test_from_lookup_reads_overrides() {
        let config = CacheConfig::from_lookup(lookup_from(&[
            ("FILE_CACHE_DIR", "/var/cache/app"),
            ("FILE_CACHE_TTL_SECS", "60"),
            ("FILE_CACHE_MAX_RETRIES", "2"),
            ("FILE_CACHE_RETRY_DELAY_MS", "10"),
            ("FILE_CACHE_VERBOSE", "true"),
        ]))
        .unwrap();

        assert_eq!(config.base_dir, PathBuf::from("/var/cache/app"));
        assert_eq!(config.default_ttl_secs, 60);
        assert_eq!(config.max_retries, 2);
        assert_eq!(config.retry_delay, Duration::from_millis(10));
        assert!(config.verbose);
    }

    #[test]
    fn test_from_lookup_falls_back_on_bad_numbers() {
        let config = CacheConfig::from_lookup(lookup_from(&[
            ("FILE_CACHE_KEY", "fallback"),
            ("FILE_CACHE_TTL_SECS", "soon"),
        ]))
        .unwrap();

        assert_eq!(config.base_dir, std::env::temp_dir().join("fallback"));
        assert_eq!(config.default_ttl_secs, DEFAULT_TTL_SECS);
    }
}

//! file-cache - inspect and maintain a file cache directory
//!
//! Configuration comes from `FILE_CACHE_*` environment variables.
//!
//! ```text
//! file-cache get KEY
//! file-cache set KEY VALUE [TTL_SECS]
//! file-cache del KEY...
//! file-cache flush
//! file-cache count
//! ```

use file_cache::{CacheConfig, CacheError, FileCache, Result, Value};
use tracing::info;
use tracing_subscriber::filter::{Directive, ParseError};
use tracing_subscriber::{prelude::*, EnvFilter};

const USAGE: &str = "usage: file-cache <get KEY | set KEY VALUE [TTL_SECS] | del KEY... | flush | count>";

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first so verbose mode can raise the log level
    let config = CacheConfig::from_env()?;

    // Initialize logging
    let env_filter = env_filter(EnvFilter::from_default_env(), &config)?;

    // Use JSON format for GCP Cloud Logging when LOG_FORMAT=json
    if std::env::var("LOG_FORMAT")
        .map(|v| v == "json")
        .unwrap_or(false)
    {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_stackdriver::layer())
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .init();
    };

    info!("Cache dir: {:?}", config.base_dir);
    info!("Default TTL: {} seconds", config.default_ttl_secs);

    let cache = FileCache::new(config);
    let args: Vec<String> = std::env::args().skip(1).collect();
    run(&cache, &args).await
}

/// Crate log directive; verbose caches emit their diagnostics at debug
fn log_directive(config: &CacheConfig) -> &'static str {
    if config.verbose {
        "file_cache=debug"
    } else {
        "file_cache=info"
    }
}

fn env_filter(base: EnvFilter, config: &CacheConfig) -> Result<EnvFilter> {
    let directive: Directive = log_directive(config)
        .parse()
        .map_err(|e: ParseError| CacheError::Config(e.to_string()))?;
    Ok(base.add_directive(directive))
}

async fn run(cache: &FileCache, args: &[String]) -> Result<()> {
    match args {
        [cmd, key] if cmd == "get" => {
            match cache.get(key).await? {
                Some(value) => println!("{}", render(&value)),
                None => println!("null"),
            }
            Ok(())
        }
        [cmd, key, value, rest @ ..] if cmd == "set" && rest.len() <= 1 => {
            let ttl_secs = match rest.first() {
                Some(raw) => Some(raw.parse::<u64>().map_err(|_| {
                    CacheError::Config(format!("invalid TTL_SECS: {}", raw))
                })?),
                None => None,
            };
            cache.set(key, parse_value(value), ttl_secs).await
        }
        [cmd, keys @ ..] if cmd == "del" && !keys.is_empty() => {
            let removed = cache.del_many(keys).await?;
            println!("{}", removed);
            Ok(())
        }
        [cmd] if cmd == "flush" => cache.flush().await,
        [cmd] if cmd == "count" => {
            println!("{}", cache.entry_count().await?);
            Ok(())
        }
        _ => Err(CacheError::Config(USAGE.to_string())),
    }
}

/// JSON input is stored structurally, anything else as a string
fn parse_value(raw: &str) -> Value {
    serde_json::from_str::<serde_json::Value>(raw)
        .map(Value::from)
        .unwrap_or_else(|_| Value::from(raw))
}

fn render(value: &Value) -> String {
    match value.to_json() {
        Some(json) => json.to_string(),
        None => format!("{:?}", value),
    }
}

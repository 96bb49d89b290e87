//! Mapping from logical keys to cache file paths

use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

pub const ENTRY_EXTENSION: &str = "json";

/// Hex-encoded SHA-256 digest of a key
pub fn digest_key(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hex::encode(hasher.finalize())
}

/// Location of the entry file for `key` under `base_dir`. Never touches the filesystem.
pub fn path_for(base_dir: &Path, key: &str) -> PathBuf {
    base_dir.join(format!("{}.{}", digest_key(key), ENTRY_EXTENSION))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_is_deterministic() {
        let base = Path::new("/cache");
        let path1 = path_for(base, "user:42");
        let path2 = path_for(base, "user:42");
        let path3 = path_for(base, "user:43");

        assert_eq!(path1, path2);
        assert_ne!(path1, path3);
        assert_eq!(path1.parent(), Some(base));
    }

    #[test]
    fn test_file_name_is_hex_digest() {
        let path = path_for(Path::new("/cache"), "xxx");
        let name = path.file_name().unwrap().to_str().unwrap();
        let (stem, ext) = name.split_once('.').unwrap();

        // 64 hex chars for SHA256
        assert_eq!(stem.len(), 64);
        assert!(stem.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(ext, ENTRY_EXTENSION);
    }

    #[test]
    fn test_digest_handles_unicode_and_empty_keys() {
        assert_eq!(digest_key("").len(), 64);
        assert_ne!(digest_key("café"), digest_key("cafe"));
    }
}

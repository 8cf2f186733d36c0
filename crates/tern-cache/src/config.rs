use std::collections::BTreeMap;
use std::path::PathBuf;

pub const PATH_KEY: &str = "FunctionResponseCache.path";
pub const PREFIX_KEY: &str = "FunctionResponseCache.prefix";
pub const SIZE_KEY: &str = "FunctionResponseCache.size";

pub const DEFAULT_CACHE_DIR: &str = "/tmp/";
pub const DEFAULT_PREFIX: &str = "rc";
pub const DEFAULT_SIZE_MB: u64 = 20_000;

/// Configuration for the function response cache.
///
/// An explicit record passed in at construction; nothing here depends on
/// static initialization order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheConfig {
    /// Directory entries live in. Must exist, or the cache is disabled.
    pub cache_dir: PathBuf,
    /// Filename prefix, lowercased, so cached items are easy to identify
    /// when a shared directory like `/tmp` is used.
    pub prefix: String,
    /// Eviction threshold in megabytes. Zero disables the cache.
    pub size_limit_mb: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from(DEFAULT_CACHE_DIR),
            prefix: DEFAULT_PREFIX.to_string(),
            size_limit_mb: DEFAULT_SIZE_MB,
        }
    }
}

impl CacheConfig {
    /// Build a configuration from the server's key-value settings.
    ///
    /// Unknown keys are ignored; an unparseable size falls back to the
    /// default.
    pub fn from_keys(keys: &BTreeMap<String, String>) -> Self {
        let mut config = Self::default();
        if let Some(dir) = keys.get(PATH_KEY) {
            config.cache_dir = PathBuf::from(dir);
        }
        if let Some(prefix) = keys.get(PREFIX_KEY) {
            config.prefix = prefix.to_lowercase();
        }
        if let Some(size) = keys.get(SIZE_KEY) {
            match size.parse::<u64>() {
                Ok(mb) => config.size_limit_mb = mb,
                Err(_) => {
                    tracing::debug!(
                        target = "tern.cache",
                        size,
                        "unparseable cache size; using default"
                    );
                }
            }
        }
        config
    }

    pub fn size_limit_bytes(&self) -> u64 {
        self.size_limit_mb.saturating_mul(1024 * 1024)
    }

    /// The cache is enabled only when its directory exists and the size
    /// limit is positive.
    pub fn is_enabled(&self) -> bool {
        self.size_limit_mb > 0 && self.cache_dir.is_dir()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn defaults_apply_when_keys_are_absent() {
        let config = CacheConfig::from_keys(&BTreeMap::new());
        assert_eq!(config, CacheConfig::default());
        assert_eq!(config.cache_dir, PathBuf::from("/tmp/"));
        assert_eq!(config.prefix, "rc");
        assert_eq!(config.size_limit_mb, 20_000);
    }

    #[test]
    fn recognized_keys_override_defaults() {
        let config = CacheConfig::from_keys(&keys(&[
            (PATH_KEY, "/var/cache/tern"),
            (PREFIX_KEY, "FRC"),
            (SIZE_KEY, "512"),
            ("Some.Other.Key", "ignored"),
        ]));
        assert_eq!(config.cache_dir, PathBuf::from("/var/cache/tern"));
        assert_eq!(config.prefix, "frc", "prefix is lowercased on read");
        assert_eq!(config.size_limit_mb, 512);
    }

    #[test]
    fn unparseable_size_falls_back_to_default() {
        let config = CacheConfig::from_keys(&keys(&[(SIZE_KEY, "lots")]));
        assert_eq!(config.size_limit_mb, DEFAULT_SIZE_MB);
    }

    #[test]
    fn zero_size_or_missing_directory_disables_the_cache() {
        let tmp = tempfile::TempDir::new().unwrap();
        let mut config = CacheConfig {
            cache_dir: tmp.path().to_path_buf(),
            prefix: "rc".into(),
            size_limit_mb: 1,
        };
        assert!(config.is_enabled());

        config.size_limit_mb = 0;
        assert!(!config.is_enabled());

        config.size_limit_mb = 1;
        config.cache_dir = tmp.path().join("absent");
        assert!(!config.is_enabled());
    }
}

use crate::fingerprint::Fingerprint;
use std::path::{Path, PathBuf};

/// Maps a fingerprint plus a collision suffix to a filesystem path.
///
/// Pure name derivation, no I/O, so collision policy is testable without
/// touching disk. The suffix scan itself lives in the orchestrator.
#[derive(Clone, Debug)]
pub struct PathStore {
    dir: PathBuf,
    prefix: String,
}

impl PathStore {
    pub fn new(dir: impl Into<PathBuf>, prefix: &str) -> Self {
        Self { dir: dir.into(), prefix: prefix.to_lowercase() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// `<cache-dir>/<prefix>_<fingerprint>_<suffix>`
    pub fn entry_path(&self, fingerprint: Fingerprint, suffix: u64) -> PathBuf {
        self.dir.join(format!("{}_{}_{}", self.prefix, fingerprint, suffix))
    }

    /// The size ledger's sidecar file.
    pub fn sidecar_path(&self) -> PathBuf {
        self.dir.join(format!("{}.cache_info", self.prefix))
    }

    /// The lock file guarding sidecar read-modify-write cycles.
    pub fn sidecar_lock_path(&self) -> PathBuf {
        self.dir.join(format!("{}.cache_info.lock", self.prefix))
    }

    /// Whether `path` names a cache entry owned by this store.
    ///
    /// The sidecar and its lock use a `<prefix>.` name and are excluded, as is
    /// anything else sharing the directory.
    pub fn is_entry(&self, path: &Path) -> bool {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            return false;
        };
        name.starts_with(&format!("{}_", self.prefix))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::ResourceId;

    #[test]
    fn entry_paths_use_prefix_fingerprint_and_suffix() {
        let store = PathStore::new("/var/cache/tern", "rc");
        let fingerprint = Fingerprint::of(&ResourceId::new("ds.nc", "mean(x)"));
        let path = store.entry_path(fingerprint, 3);
        assert_eq!(
            path,
            PathBuf::from(format!("/var/cache/tern/rc_{}_3", fingerprint))
        );
    }

    #[test]
    fn prefix_is_lowercased() {
        let store = PathStore::new("/tmp", "RC");
        assert_eq!(store.prefix(), "rc");
    }

    #[test]
    fn sidecar_files_are_not_entries() {
        let store = PathStore::new("/tmp", "rc");
        assert!(!store.is_entry(&store.sidecar_path()));
        assert!(!store.is_entry(&store.sidecar_lock_path()));
        let fingerprint = Fingerprint::of(&ResourceId::new("a", "b"));
        assert!(store.is_entry(&store.entry_path(fingerprint, 0)));
    }

    #[test]
    fn foreign_files_are_not_entries() {
        let store = PathStore::new("/tmp", "rc");
        assert!(!store.is_entry(Path::new("/tmp/other_123_0")));
        assert!(!store.is_entry(Path::new("/tmp/rc.cache_info")));
    }
}

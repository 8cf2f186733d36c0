use crate::error::{CacheError, Result};
use crate::path_store::PathStore;
use bincode::Options as _;
use fs2::FileExt as _;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Upper bound on a plausible sidecar file; anything larger is corruption.
const MAX_SIDECAR_LEN: u64 = 1024;

#[derive(Debug, Serialize, Deserialize)]
struct LedgerRecord {
    total_bytes: u64,
}

/// Tracks the total on-disk size of cache entries.
///
/// The running total is persisted in a sidecar file so concurrent writers
/// converge; every read-modify-write happens under an exclusive lock on a
/// dedicated lock file. The total is best-effort: a missing or corrupt
/// sidecar is rebuilt by scanning the cache directory, never surfaced as an
/// initialization failure.
#[derive(Clone, Debug)]
pub struct SizeLedger {
    store: PathStore,
}

impl SizeLedger {
    pub fn new(store: PathStore) -> Self {
        Self { store }
    }

    /// Add a newly written entry to the total and persist it.
    pub fn record(&self, path: &Path) -> Result<u64> {
        let guard = self.lock_sidecar()?;
        let mut total = self.read_total(&guard);
        total = total.saturating_add(fs::metadata(path)?.len());
        self.write_total(total)?;
        Ok(total)
    }

    /// Delete least-recently-modified entries until the total is at or under
    /// `limit_bytes`, then persist the new total.
    ///
    /// `protected` is never selected; it is the entry the current writer just
    /// produced and still holds a shared lock on. Victims another process is
    /// actively writing or reading are skipped: each candidate is locked with
    /// a non-blocking exclusive attempt and deleted under that lock, so a
    /// concurrent reader observes either the entry or `ENOENT`.
    pub fn evict_until_under(&self, limit_bytes: u64, protected: &Path) -> Result<u64> {
        let guard = self.lock_sidecar()?;
        let mut total = self.read_total(&guard);
        if total <= limit_bytes {
            return Ok(total);
        }

        let mut victims = self.scan_entries();
        victims.sort_by(|a, b| a.mtime.cmp(&b.mtime).then_with(|| a.path.cmp(&b.path)));

        for victim in victims {
            if total <= limit_bytes {
                break;
            }
            if victim.path == protected {
                continue;
            }
            let file = match OpenOptions::new().read(true).write(true).open(&victim.path) {
                Ok(file) => file,
                Err(err) if err.kind() == io::ErrorKind::NotFound => {
                    // Deleted by another process; the total was stale.
                    total = total.saturating_sub(victim.len);
                    continue;
                }
                Err(err) => {
                    tracing::debug!(
                        target = "tern.cache",
                        path = %victim.path.display(),
                        error = %err,
                        "failed to open eviction candidate"
                    );
                    continue;
                }
            };
            if file.try_lock_exclusive().is_err() {
                // Locked by a writer or reader; never evict an entry in use.
                continue;
            }
            match fs::remove_file(&victim.path) {
                Ok(()) => {
                    total = total.saturating_sub(victim.len);
                    tracing::debug!(
                        target = "tern.cache",
                        path = %victim.path.display(),
                        len = victim.len,
                        "evicted cache entry"
                    );
                }
                Err(err) if err.kind() == io::ErrorKind::NotFound => {
                    total = total.saturating_sub(victim.len);
                }
                Err(err) => {
                    tracing::warn!(
                        target = "tern.cache",
                        path = %victim.path.display(),
                        error = %err,
                        "failed to evict cache entry"
                    );
                }
            }
            let _ = file.unlock();
        }

        self.write_total(total)?;
        Ok(total)
    }

    /// The persisted total, rebuilding from a directory scan when the sidecar
    /// is missing or unreadable.
    pub fn total(&self) -> Result<u64> {
        let guard = self.lock_sidecar()?;
        Ok(self.read_total(&guard))
    }

    fn lock_sidecar(&self) -> Result<SidecarGuard> {
        let path = self.store.sidecar_lock_path();
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|err| CacheError::Locking { path: path.clone(), source: err })?;
        file.lock_exclusive()
            .map_err(|err| CacheError::Locking { path, source: err })?;
        Ok(SidecarGuard { file })
    }

    // Requires the sidecar lock; the guard parameter enforces that at the
    // call sites.
    fn read_total(&self, _guard: &SidecarGuard) -> u64 {
        let path = self.store.sidecar_path();
        match read_record(&path) {
            Some(record) => record.total_bytes,
            None => {
                let total = self.scan_entries().iter().map(|e| e.len).sum();
                tracing::warn!(
                    target = "tern.cache",
                    sidecar = %path.display(),
                    total,
                    "size ledger sidecar missing or unreadable; rebuilt from directory scan"
                );
                total
            }
        }
    }

    fn write_total(&self, total_bytes: u64) -> Result<()> {
        let bytes = bincode_options().serialize(&LedgerRecord { total_bytes })?;
        fs::write(self.store.sidecar_path(), bytes)?;
        Ok(())
    }

    fn scan_entries(&self) -> Vec<EntryStat> {
        let mut entries = Vec::new();
        let dir = match fs::read_dir(self.store.dir()) {
            Ok(dir) => dir,
            Err(err) => {
                tracing::debug!(
                    target = "tern.cache",
                    dir = %self.store.dir().display(),
                    error = %err,
                    "failed to read cache directory while scanning entries"
                );
                return entries;
            }
        };
        for entry in dir {
            let Ok(entry) = entry else { continue };
            let path = entry.path();
            if !self.store.is_entry(&path) {
                continue;
            }
            // Entries can race with eviction elsewhere; a failed stat just
            // drops the candidate.
            let Ok(meta) = fs::symlink_metadata(&path) else { continue };
            if !meta.is_file() {
                continue;
            }
            let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            entries.push(EntryStat { path, len: meta.len(), mtime });
        }
        entries
    }
}

#[derive(Debug)]
struct EntryStat {
    path: PathBuf,
    len: u64,
    mtime: SystemTime,
}

struct SidecarGuard {
    file: File,
}

impl Drop for SidecarGuard {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

fn bincode_options() -> impl bincode::Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_little_endian()
}

fn read_record(path: &Path) -> Option<LedgerRecord> {
    let meta = fs::symlink_metadata(path).ok()?;
    if !meta.is_file() || meta.len() > MAX_SIDECAR_LEN {
        return None;
    }
    let bytes = fs::read(path).ok()?;
    bincode_options().deserialize(&bytes).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::EntryLock;
    use std::thread;
    use std::time::Duration;
    use tempfile::TempDir;

    fn store(tmp: &TempDir) -> PathStore {
        PathStore::new(tmp.path(), "rc")
    }

    fn write_entry(store: &PathStore, name: &str, len: usize) -> PathBuf {
        let path = store.dir().join(name);
        fs::write(&path, vec![b'x'; len]).unwrap();
        path
    }

    #[test]
    fn record_accumulates_entry_sizes() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        let ledger = SizeLedger::new(store.clone());

        let a = write_entry(&store, "rc_1_0", 100);
        let b = write_entry(&store, "rc_2_0", 50);
        assert_eq!(ledger.record(&a).unwrap(), 100);
        assert_eq!(ledger.record(&b).unwrap(), 150);
        assert_eq!(ledger.total().unwrap(), 150);
    }

    #[test]
    fn missing_sidecar_rebuilds_from_scan() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        write_entry(&store, "rc_1_0", 100);
        write_entry(&store, "rc_2_0", 25);
        // A foreign file and the sidecar itself are not counted.
        fs::write(store.dir().join("other"), vec![0u8; 500]).unwrap();

        let ledger = SizeLedger::new(store);
        assert_eq!(ledger.total().unwrap(), 125);
    }

    #[test]
    fn corrupt_sidecar_rebuilds_from_scan() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        write_entry(&store, "rc_1_0", 100);
        fs::write(store.sidecar_path(), b"garbage").unwrap();

        let ledger = SizeLedger::new(store);
        assert_eq!(ledger.total().unwrap(), 100);
    }

    #[test]
    fn eviction_removes_oldest_first_and_spares_protected() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        let ledger = SizeLedger::new(store.clone());

        let old = write_entry(&store, "rc_1_0", 400);
        ledger.record(&old).unwrap();
        thread::sleep(Duration::from_millis(20));
        let mid = write_entry(&store, "rc_2_0", 400);
        ledger.record(&mid).unwrap();
        thread::sleep(Duration::from_millis(20));
        let new = write_entry(&store, "rc_3_0", 400);
        ledger.record(&new).unwrap();

        let total = ledger.evict_until_under(800, &new).unwrap();
        assert!(total <= 800, "total {total} exceeds limit");
        assert!(!old.exists());
        assert!(new.exists());
    }

    #[test]
    fn protected_entry_survives_even_when_over_limit() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        let ledger = SizeLedger::new(store.clone());

        let only = write_entry(&store, "rc_1_0", 400);
        ledger.record(&only).unwrap();

        let total = ledger.evict_until_under(100, &only).unwrap();
        assert_eq!(total, 400);
        assert!(only.exists());
    }

    #[test]
    fn locked_victims_are_skipped() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        let ledger = SizeLedger::new(store.clone());

        let busy = write_entry(&store, "rc_1_0", 400);
        ledger.record(&busy).unwrap();
        thread::sleep(Duration::from_millis(20));
        let idle = write_entry(&store, "rc_2_0", 400);
        ledger.record(&idle).unwrap();

        let held = EntryLock::try_read(&busy).unwrap().unwrap();
        let protected = store.dir().join("rc_none_0");
        ledger.evict_until_under(500, &protected).unwrap();
        drop(held);

        assert!(busy.exists(), "an entry under lock must never be evicted");
        assert!(!idle.exists());
    }
}

use crate::codec;
use crate::config::CacheConfig;
use crate::error::{CacheError, Result};
use crate::fingerprint::{Fingerprint, ResourceId, MAX_CACHEABLE_ID_LEN};
use crate::ledger::SizeLedger;
use crate::lock::EntryLock;
use crate::path_store::PathStore;
use std::fs;
use std::io::{self, BufRead, BufReader, BufWriter, Read as _, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tern_dap::{ConstraintEvaluator, Dataset};

/// Collision suffixes examined before lookup fails.
///
/// More than this many distinct resources sharing one fingerprint means a
/// pathological hash or corruption; surfacing beats silently degrading.
pub const MAX_COLLISIONS: u64 = 50;

/// Lost create races tolerated before degrading to direct evaluation.
const MAX_CREATE_RACES: u32 = 8;

static GLOBAL: OnceLock<FunctionResponseCache> = OnceLock::new();

/// Memoizes the result of evaluating a server-side function over a dataset
/// under a constraint expression.
///
/// Entries are whole serialized responses, one file each, shared between
/// processes. Isolation is entirely per-entry advisory file locks; there is
/// no in-memory state that outlives a single [`get_or_compute`] call.
///
/// [`get_or_compute`]: FunctionResponseCache::get_or_compute
#[derive(Debug)]
pub struct FunctionResponseCache {
    config: CacheConfig,
    store: PathStore,
    ledger: SizeLedger,
    enabled: bool,
}

enum Probe {
    Hit(Dataset),
    /// The first suffix this resource can be written at. `reclaim` marks an
    /// existing invalid or stale entry to be rebuilt in place.
    Candidate {
        path: PathBuf,
        reclaim: bool,
    },
}

enum Reclaimed {
    /// Another process rebuilt the entry while we waited for the lock.
    Hit(Dataset),
    /// We hold the exclusive lock on a truncated file, ready to build.
    Writer(EntryLock),
    /// The entry vanished or now belongs to a different resource.
    Gone,
}

impl FunctionResponseCache {
    pub fn new(config: CacheConfig) -> Self {
        let store = PathStore::new(&config.cache_dir, &config.prefix);
        let ledger = SizeLedger::new(store.clone());
        let enabled = config.is_enabled();
        if !enabled {
            tracing::debug!(
                target = "tern.cache",
                dir = %config.cache_dir.display(),
                size_limit_mb = config.size_limit_mb,
                "function response cache disabled"
            );
        }
        Self { config, store, ledger, enabled }
    }

    /// The one-per-process instance. The first call's configuration wins.
    pub fn initialize_global(config: CacheConfig) -> &'static FunctionResponseCache {
        GLOBAL.get_or_init(|| FunctionResponseCache::new(config))
    }

    pub fn global() -> Option<&'static FunctionResponseCache> {
        GLOBAL.get()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn store(&self) -> &PathStore {
        &self.store
    }

    pub fn ledger(&self) -> &SizeLedger {
        &self.ledger
    }

    /// Return the response for `dataset` under `constraint`, from the cache
    /// when possible.
    ///
    /// A hit rehydrates the stored response; a miss evaluates, writes the
    /// entry, and returns the evaluator's result. Responses too large to key
    /// (or a disabled cache) bypass the disk entirely.
    pub fn get_or_compute(
        &self,
        dataset: &mut Dataset,
        constraint: &str,
        eval: &mut dyn ConstraintEvaluator,
    ) -> Result<Dataset> {
        let resource = ResourceId::new(dataset.name(), constraint);
        if !self.enabled {
            return evaluate(dataset, constraint, eval);
        }
        if !resource.is_cacheable() {
            tracing::debug!(
                target = "tern.cache",
                resource_len = resource.as_str().len(),
                max = MAX_CACHEABLE_ID_LEN,
                "resource id not cacheable; evaluating directly"
            );
            return evaluate(dataset, constraint, eval);
        }

        let fingerprint = Fingerprint::of(&resource);
        let caller = dataset.name().to_string();
        tracing::debug!(
            target = "tern.cache",
            resource = resource.as_str(),
            %fingerprint,
            "function response lookup"
        );

        let mut races = 0u32;
        loop {
            match self.probe(&resource, fingerprint, &caller)? {
                Probe::Hit(found) => return Ok(found),
                Probe::Candidate { path, reclaim } => {
                    let lock = if reclaim {
                        match self.reclaim(&path, &resource, &caller)? {
                            Reclaimed::Hit(found) => return Ok(found),
                            Reclaimed::Writer(lock) => Some(lock),
                            Reclaimed::Gone => EntryLock::create_exclusive(&path)?,
                        }
                    } else {
                        EntryLock::create_exclusive(&path)?
                    };
                    match lock {
                        Some(lock) => {
                            return self.build_entry(lock, dataset, constraint, &resource, eval)
                        }
                        None => {
                            // Another process started a build between the
                            // probe and the create. Rescan from suffix 0 to
                            // read their finished entry.
                            races += 1;
                            if races > MAX_CREATE_RACES {
                                tracing::warn!(
                                    target = "tern.cache",
                                    resource = resource.as_str(),
                                    races,
                                    "repeatedly lost the create race; evaluating directly"
                                );
                                return evaluate(dataset, constraint, eval);
                            }
                        }
                    }
                }
            }
        }
    }

    /// Scan suffixes for this fingerprint until a hit, a free slot, or a
    /// reclaimable entry is found. Slots are always used smallest-first, so
    /// on-disk suffixes stay contiguous from zero.
    fn probe(
        &self,
        resource: &ResourceId,
        fingerprint: Fingerprint,
        caller: &str,
    ) -> Result<Probe> {
        for suffix in 0..=MAX_COLLISIONS {
            let path = self.store.entry_path(fingerprint, suffix);
            let Some(lock) = EntryLock::try_read(&path)? else {
                return Ok(Probe::Candidate { path, reclaim: false });
            };

            let mut reader = BufReader::new(lock.file());
            let Some(witness) = read_witness(&mut reader)? else {
                tracing::debug!(
                    target = "tern.cache",
                    path = %path.display(),
                    "entry has no valid witness line; rebuilding"
                );
                return Ok(Probe::Candidate { path, reclaim: true });
            };

            if witness != resource.as_str() {
                tracing::debug!(
                    target = "tern.cache",
                    path = %path.display(),
                    suffix,
                    "fingerprint collision; trying next suffix"
                );
                continue;
            }

            if !entry_is_fresh(&path, caller) {
                tracing::debug!(
                    target = "tern.cache",
                    path = %path.display(),
                    "entry is older than its dataset; rebuilding"
                );
                return Ok(Probe::Candidate { path, reclaim: true });
            }

            match codec::read_body(&mut reader, &path) {
                Ok(mut found) => {
                    // The file may have been written under a different
                    // dataset path; the caller's identifier wins.
                    found.set_name(caller);
                    tracing::debug!(target = "tern.cache", path = %path.display(), "cache hit");
                    return Ok(Probe::Hit(found));
                }
                Err(err) => {
                    tracing::debug!(
                        target = "tern.cache",
                        path = %path.display(),
                        error = %err,
                        "failed to rehydrate entry; rebuilding"
                    );
                    return Ok(Probe::Candidate { path, reclaim: true });
                }
            }
        }

        Err(CacheError::TooManyCollisions {
            resource: resource.to_string(),
            count: MAX_COLLISIONS,
        })
    }

    /// Take the exclusive lock on an invalid or stale entry and prepare to
    /// rebuild it in place. Revalidates first: by the time the lock is
    /// granted another process may already have rebuilt the entry.
    fn reclaim(&self, path: &Path, resource: &ResourceId, caller: &str) -> Result<Reclaimed> {
        let Some(mut lock) = EntryLock::reclaim_exclusive(path)? else {
            return Ok(Reclaimed::Gone);
        };

        let mut reader = BufReader::new(lock.file());
        if let Ok(Some(witness)) = read_witness(&mut reader) {
            if witness == resource.as_str() {
                if entry_is_fresh(path, caller) {
                    match codec::read_body(&mut reader, path) {
                        Ok(mut found) => {
                            found.set_name(caller);
                            return Ok(Reclaimed::Hit(found));
                        }
                        Err(err) => {
                            tracing::debug!(
                                target = "tern.cache",
                                path = %path.display(),
                                error = %err,
                                "reclaimed entry still unreadable; rebuilding"
                            );
                        }
                    }
                }
            } else {
                // A valid entry for some other resource now occupies the
                // slot; never clobber it. The caller rescans and treats it
                // as an ordinary collision.
                return Ok(Reclaimed::Gone);
            }
        }

        lock.file_mut().set_len(0).map_err(CacheError::Io)?;
        lock.file_mut().seek(SeekFrom::Start(0))?;
        Ok(Reclaimed::Writer(lock))
    }

    /// Build the entry under an exclusive lock: witness line, evaluation,
    /// schema, data. The partial file is deleted on every non-success exit.
    fn build_entry(
        &self,
        mut lock: EntryLock,
        dataset: &mut Dataset,
        constraint: &str,
        resource: &ResourceId,
        eval: &mut dyn ConstraintEvaluator,
    ) -> Result<Dataset> {
        let mut guard = PartialEntryGuard { path: lock.path().to_path_buf(), armed: true };

        let built = (|| -> Result<Dataset> {
            let mut w = BufWriter::new(lock.file_mut());
            writeln!(w, "{resource}")?;

            eval.parse_constraint(constraint, dataset)?;
            let result = eval.eval_functions(dataset)?;

            codec::write_body(&mut w, dataset)?;
            w.flush()?;
            Ok(result)
        })();

        match built {
            Ok(result) => {
                // Hand readability off without an unlocked window an evictor
                // could exploit.
                lock.downgrade()?;
                guard.armed = false;
                self.account(lock.path());
                tracing::debug!(
                    target = "tern.cache",
                    path = %lock.path().display(),
                    resource = resource.as_str(),
                    "cached function response"
                );
                Ok(result)
            }
            Err(err) => {
                // `guard` removes the partial file while the exclusive lock
                // is still held; the lock releases when `lock` drops.
                drop(guard);
                drop(lock);
                Err(err)
            }
        }
    }

    /// Ledger bookkeeping after a successful build. Best-effort: a broken
    /// ledger must not lose a valid cache entry.
    fn account(&self, path: &Path) {
        let limit = self.config.size_limit_bytes();
        match self.ledger.record(path) {
            Ok(total) if total > limit => {
                if let Err(err) = self.ledger.evict_until_under(limit, path) {
                    tracing::warn!(
                        target = "tern.cache",
                        path = %path.display(),
                        error = %err,
                        "cache eviction failed"
                    );
                }
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(
                    target = "tern.cache",
                    path = %path.display(),
                    error = %err,
                    "size ledger update failed"
                );
            }
        }
    }
}

struct PartialEntryGuard {
    path: PathBuf,
    armed: bool,
}

impl Drop for PartialEntryGuard {
    fn drop(&mut self) {
        if self.armed {
            if let Err(err) = fs::remove_file(&self.path) {
                if err.kind() != io::ErrorKind::NotFound {
                    tracing::warn!(
                        target = "tern.cache",
                        path = %self.path.display(),
                        error = %err,
                        "failed to remove partial cache entry"
                    );
                }
            }
        }
    }
}

fn evaluate(
    dataset: &mut Dataset,
    constraint: &str,
    eval: &mut dyn ConstraintEvaluator,
) -> Result<Dataset> {
    eval.parse_constraint(constraint, dataset)?;
    Ok(eval.eval_functions(dataset)?)
}

/// Read the witness line, bounded by the cacheability cap plus separator
/// slack. `None` means the entry is empty, truncated, or not text; that is
/// always invalid, never an error.
fn read_witness(r: &mut impl BufRead) -> io::Result<Option<String>> {
    let mut line = String::new();
    let mut bounded = r.take((MAX_CACHEABLE_ID_LEN + 2) as u64);
    match bounded.read_line(&mut line) {
        Ok(0) => Ok(None),
        Ok(_) => {
            if line.ends_with('\n') {
                line.pop();
                Ok(Some(line))
            } else {
                Ok(None)
            }
        }
        Err(err) if err.kind() == io::ErrorKind::InvalidData => Ok(None),
        Err(err) => Err(err),
    }
}

/// Zero-size entries are always invalid: a response, even with no data, still
/// has a metadata part. An entry older than the dataset file it was computed
/// from is stale; when the dataset id is not a regular file its modification
/// time is unknowable and the entry is assumed fresh.
fn entry_is_fresh(entry: &Path, dataset: &str) -> bool {
    let Ok(entry_meta) = fs::metadata(entry) else {
        return false;
    };
    if entry_meta.len() == 0 {
        return false;
    }
    let Ok(entry_mtime) = entry_meta.modified() else {
        return true;
    };
    let Ok(dataset_meta) = fs::metadata(Path::new(dataset)) else {
        return true;
    };
    if !dataset_meta.is_file() {
        return true;
    }
    match dataset_meta.modified() {
        Ok(dataset_mtime) => dataset_mtime <= entry_mtime,
        Err(_) => true,
    }
}

//! Disk-backed, multi-process-safe memoization of function responses.
//!
//! The cache stores whole serialized responses, one content-addressed file
//! per `(dataset, constraint)` pair:
//! - fingerprint/lookup with hash-collision resolution ([`Fingerprint`],
//!   [`PathStore`])
//! - per-entry advisory file locks shared across processes ([`EntryLock`])
//! - size accounting with least-recently-modified eviction ([`SizeLedger`])
//! - a two-section entry format: a witness line plus text schema, then typed
//!   binary payloads behind a `--DATA:` sentinel
//!
//! [`FunctionResponseCache::get_or_compute`] orchestrates the above around an
//! opaque constraint evaluator.

mod cache;
mod codec;
mod config;
mod error;
mod fingerprint;
mod ledger;
mod lock;
mod marshal;
mod path_store;

pub use cache::{FunctionResponseCache, MAX_COLLISIONS};
pub use config::{
    CacheConfig, DEFAULT_CACHE_DIR, DEFAULT_PREFIX, DEFAULT_SIZE_MB, PATH_KEY, PREFIX_KEY,
    SIZE_KEY,
};
pub use error::{CacheError, Result};
pub use fingerprint::{Fingerprint, ResourceId, MAX_CACHEABLE_ID_LEN};
pub use ledger::SizeLedger;
pub use lock::EntryLock;
pub use path_store::PathStore;

use sha2::{Digest, Sha256};
use std::fmt;

/// Responses whose dataset identifier plus constraint exceed this many bytes
/// are never cached.
pub const MAX_CACHEABLE_ID_LEN: usize = 4096;

/// The logical cache key: `<dataset-identifier>#<constraint-expression>`.
///
/// Two requests with equal resource ids must produce equal cached outputs;
/// identifier uniqueness is the caller's responsibility.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ResourceId(String);

impl ResourceId {
    pub fn new(dataset: &str, constraint: &str) -> Self {
        Self(format!("{dataset}#{constraint}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this response may be cached at all.
    ///
    /// The combined identifier and constraint length (the joining `#` is not
    /// counted) must fit the cap, and the id must be storable as a single
    /// witness line, so embedded line breaks disqualify it.
    pub fn is_cacheable(&self) -> bool {
        self.0.len() - 1 <= MAX_CACHEABLE_ID_LEN && !self.0.contains(['\n', '\r'])
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// The physical cache key: a stable, well-mixed integer hash of a resource id.
///
/// Derived from the first eight bytes of the SHA-256 digest, so it is
/// deterministic across processes (and builds). Collisions are expected to be
/// rare but are handled by the lookup layer's suffix scan.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Fingerprint(u64);

impl Fingerprint {
    pub fn of(resource: &ResourceId) -> Self {
        let digest = Sha256::digest(resource.as_str().as_bytes());
        let mut head = [0u8; 8];
        head.copy_from_slice(&digest[..8]);
        Self(u64::from_le_bytes(head))
    }

    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

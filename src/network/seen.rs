use crate::crypto::Sha256Hash;
use lru::LruCache;
use std::fmt;
use std::num::NonZeroUsize;

/// Bounded set of inventory hashes. When full, the least recently recorded hash is
/// forgotten first.
pub struct SeenSet {
    cache: LruCache<Sha256Hash, ()>,
}

impl SeenSet {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        SeenSet {
            cache: LruCache::new(capacity),
        }
    }

    /// Records `hash`. Returns `false` if it was already present.
    pub fn insert(&mut self, hash: Sha256Hash) -> bool {
        self.cache.put(hash, ()).is_none()
    }

    /// Membership test that leaves the eviction order untouched.
    pub fn contains(&self, hash: &Sha256Hash) -> bool {
        self.cache.contains(hash)
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

impl fmt::Debug for SeenSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SeenSet")
            .field("len", &self.cache.len())
            .field("capacity", &self.cache.cap())
            .finish()
    }
}

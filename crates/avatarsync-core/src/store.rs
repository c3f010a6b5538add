//! Content-addressable avatar store
//!
//! Maps a content hash to image bytes across two tiers: a volatile in-memory
//! cache that is always authoritative for the running session, and a
//! persistent tier behind the [`PersistentStore`] seam (redb in production,
//! a plain map in tests).
//!
//! Entries are reference-counted externally by the identity-hash index; the
//! store itself never decides to purge. `purge` must only be called once the
//! caller has established via the index that no identity references the hash.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::error::AvatarResult;
use crate::types::AvatarHash;

/// The persistent byte-store consumed by the avatar store.
///
/// Implementations perform local I/O only; they never touch the network.
/// The production implementation is [`crate::storage::Storage`].
pub trait PersistentStore: Send + Sync {
    /// Write `data` under `hash`, overwriting any previous value.
    fn write(&self, hash: &AvatarHash, data: &[u8]) -> AvatarResult<()>;

    /// Read the bytes stored under `hash`, or `None` if never written or
    /// already deleted.
    fn read(&self, hash: &AvatarHash) -> AvatarResult<Option<Bytes>>;

    /// Delete the entry for `hash`. Deleting a missing entry is a no-op.
    fn delete(&self, hash: &AvatarHash) -> AvatarResult<()>;
}

/// Content-addressable store for avatar images.
///
/// `put` is idempotent: equal bytes always yield the same hash and are
/// stored once. `get` never blocks on the network.
pub struct AvatarStore {
    /// Volatile tier, authoritative for the session
    volatile: RwLock<HashMap<AvatarHash, Bytes>>,
    /// Persistent tier behind the byte-store seam
    persistent: Arc<dyn PersistentStore>,
}

impl AvatarStore {
    /// Create a store over the given persistent tier.
    pub fn new(persistent: Arc<dyn PersistentStore>) -> Self {
        Self {
            volatile: RwLock::new(HashMap::new()),
            persistent,
        }
    }

    /// Store image bytes, returning their content hash.
    ///
    /// If the hash is already present in the volatile tier this is a no-op.
    /// A persistent-tier failure is returned as an error, but the volatile
    /// entry stays in place: the image is usable for the session and only
    /// at risk of being lost on restart.
    pub fn put(&self, data: Bytes) -> AvatarResult<AvatarHash> {
        let hash = AvatarHash::of(&data);

        {
            let mut volatile = self.volatile.write();
            if volatile.contains_key(&hash) {
                debug!(%hash, "Avatar already cached");
                return Ok(hash);
            }
            volatile.insert(hash.clone(), data.clone());
        }

        debug!(%hash, len = data.len(), "Caching new avatar");
        self.persistent.write(&hash, &data)?;
        Ok(hash)
    }

    /// Read the bytes for a hash, checking the volatile tier first and
    /// falling back to the persistent tier (populating the volatile tier on
    /// a hit). Returns `None` if never written or already purged.
    ///
    /// The reserved empty hash owns no bytes and always resolves to `None`.
    pub fn get(&self, hash: &AvatarHash) -> AvatarResult<Option<Bytes>> {
        if hash.is_empty() {
            return Ok(None);
        }

        if let Some(data) = self.volatile.read().get(hash) {
            return Ok(Some(data.clone()));
        }

        match self.persistent.read(hash)? {
            Some(data) => {
                self.volatile.write().insert(hash.clone(), data.clone());
                Ok(Some(data))
            }
            None => Ok(None),
        }
    }

    /// Whether the hash is present in either tier.
    pub fn contains(&self, hash: &AvatarHash) -> AvatarResult<bool> {
        if hash.is_empty() {
            return Ok(false);
        }
        if self.volatile.read().contains_key(hash) {
            return Ok(true);
        }
        Ok(self.persistent.read(hash)?.is_some())
    }

    /// Remove the entry from both tiers unconditionally.
    ///
    /// The caller must have established via the index that no identity
    /// currently references `hash`. A persistent-tier failure is logged and
    /// swallowed; the volatile removal already happened and the orphaned
    /// persistent entry is merely uncollected garbage.
    pub fn purge(&self, hash: &AvatarHash) {
        if hash.is_empty() {
            // The reserved value owns no bytes
            return;
        }

        self.volatile.write().remove(hash);
        if let Err(e) = self.persistent.delete(hash) {
            warn!(%hash, error = %e, "Failed to purge persistent avatar entry");
        } else {
            debug!(%hash, "Purged avatar");
        }
    }
}

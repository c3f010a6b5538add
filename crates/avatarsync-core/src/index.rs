//! Identity → avatar-hash index with multi-owner reference tracking
//!
//! The index answers two questions for the sync coordinator: "is this
//! advertised hash new for this identity?" and "does any identity still
//! reference this hash?". The first gates every fetch; the second gates
//! every purge.
//!
//! All predicate-then-write steps happen under a single mutex hold, so two
//! concurrent advertisements for the same identity can never both be treated
//! as new.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::types::{AvatarHash, IdentityId};

#[derive(Default)]
struct IndexInner {
    /// At most one current hash per identity
    by_identity: HashMap<IdentityId, AvatarHash>,
    /// Number of identities mapped to each hash; the reserved empty hash is
    /// never counted since it owns no bytes
    ref_counts: HashMap<AvatarHash, usize>,
}

impl IndexInner {
    fn increment(&mut self, hash: &AvatarHash) {
        if !hash.is_empty() {
            *self.ref_counts.entry(hash.clone()).or_insert(0) += 1;
        }
    }

    fn decrement(&mut self, hash: &AvatarHash) {
        if hash.is_empty() {
            return;
        }
        if let Some(count) = self.ref_counts.get_mut(hash) {
            *count -= 1;
            if *count == 0 {
                self.ref_counts.remove(hash);
            }
        }
    }

    fn set(&mut self, identity: IdentityId, hash: AvatarHash) -> Option<AvatarHash> {
        let old = self.by_identity.insert(identity, hash.clone());
        if let Some(old) = &old {
            self.decrement(old);
        }
        self.increment(&hash);
        old
    }
}

/// Thread-safe identity-hash index shared by all coordinator workers.
#[derive(Default)]
pub struct HashIndex {
    inner: Mutex<IndexInner>,
}

impl HashIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// The identity's currently known hash, or `None` if never set.
    pub fn current_hash(&self, identity: &IdentityId) -> Option<AvatarHash> {
        self.inner.lock().by_identity.get(identity).cloned()
    }

    /// True iff `candidate` differs from the identity's current hash,
    /// including the absent→value transition and the value→empty transition.
    pub fn is_new_hash(&self, identity: &IdentityId, candidate: &AvatarHash) -> bool {
        self.inner.lock().by_identity.get(identity) != Some(candidate)
    }

    /// Overwrite the identity's mapping, returning the displaced old hash so
    /// the caller can decide on purge eligibility. Reference counts are
    /// adjusted in the same lock hold.
    pub fn set_hash(&self, identity: IdentityId, hash: AvatarHash) -> Option<AvatarHash> {
        self.inner.lock().set(identity, hash)
    }

    /// Atomic is-new check plus overwrite.
    ///
    /// Returns `None` when `candidate` already equals the identity's current
    /// hash (nothing written), otherwise `Some(old_hash)` with the displaced
    /// mapping (`Some(None)` for the absent→value transition).
    pub fn check_and_set(
        &self,
        identity: IdentityId,
        candidate: AvatarHash,
    ) -> Option<Option<AvatarHash>> {
        let mut inner = self.inner.lock();
        if inner.by_identity.get(&identity) == Some(&candidate) {
            return None;
        }
        Some(inner.set(identity, candidate))
    }

    /// Drop the identity's mapping entirely, returning the displaced hash
    /// so the caller can decide on purge eligibility.
    pub fn remove(&self, identity: &IdentityId) -> Option<AvatarHash> {
        let mut inner = self.inner.lock();
        let old = inner.by_identity.remove(identity);
        if let Some(old) = &old {
            inner.decrement(old);
        }
        old
    }

    /// All identities currently mapped to `hash`. An empty result means a
    /// purge of the hash is safe.
    pub fn owners(&self, hash: &AvatarHash) -> Vec<IdentityId> {
        let inner = self.inner.lock();
        inner
            .by_identity
            .iter()
            .filter(|(_, h)| *h == hash)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Number of identities currently mapped to `hash`.
    pub fn owner_count(&self, hash: &AvatarHash) -> usize {
        if hash.is_empty() {
            return 0;
        }
        self.inner
            .lock()
            .ref_counts
            .get(hash)
            .copied()
            .unwrap_or(0)
    }

    /// Bulk restore from persisted entries at startup.
    pub fn load_from(&self, entries: impl IntoIterator<Item = (IdentityId, AvatarHash)>) {
        let mut inner = self.inner.lock();
        for (identity, hash) in entries {
            inner.set(identity, hash);
        }
    }

    /// Snapshot of all current mappings.
    pub fn entries(&self) -> Vec<(IdentityId, AvatarHash)> {
        self.inner
            .lock()
            .by_identity
            .iter()
            .map(|(id, hash)| (id.clone(), hash.clone()))
            .collect()
    }
}

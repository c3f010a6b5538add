//! Avatar sync coordinator
//!
//! Consumes inbound hash advertisements per identity, decides fetch vs.
//! skip, dispatches asynchronous fetches, and reconciles results back into
//! the content-addressable store and the identity-hash index.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  AvatarSyncCoordinator                                          │
//! │  ├── in_flight: Mutex<HashMap<IdentityId, InFlight>>            │
//! │  │   └── At most one fetch task per identity; later             │
//! │  │       advertisements coalesce into the running fetch         │
//! │  ├── store / index: shared CAAS + identity-hash index           │
//! │  └── event_tx: broadcast::Sender<AvatarEvent>                   │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Per identity the state machine is `Idle → Fetching → Idle`; a failure
//! always returns the identity to `Idle` without touching store or index, so
//! the previously cached avatar stays intact.
//!
//! The `in_flight` mutex doubles as the coordinator's sync lock: the
//! advertisement gate, fetch dispatch, and the entire reconcile fold (store
//! put, index write, purge decision) run under it, so a purge decision can
//! never interleave with another identity's reconcile. Only the network
//! fetch itself runs outside the lock.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::AvatarResult;
use crate::events::AvatarEvent;
use crate::index::HashIndex;
use crate::source::AvatarSource;
use crate::storage::Storage;
use crate::store::AvatarStore;
use crate::types::{AvatarHash, IdentityId};

/// Default capacity for the event broadcast channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// The local account's currently advertised avatar hash.
///
/// The presence transport shares this handle and embeds the hash in every
/// outgoing presence; the coordinator populates it whenever the local
/// account's avatar is reconciled.
pub struct LocalPresence {
    identity: IdentityId,
    hash: parking_lot::RwLock<Option<AvatarHash>>,
}

impl LocalPresence {
    pub fn new(identity: IdentityId) -> Self {
        Self {
            identity,
            hash: parking_lot::RwLock::new(None),
        }
    }

    /// The local account identity this slot advertises for.
    pub fn identity(&self) -> &IdentityId {
        &self.identity
    }

    /// The hash to embed in outgoing presence, or `None` while unknown.
    pub fn advertised(&self) -> Option<AvatarHash> {
        self.hash.read().clone()
    }

    fn set(&self, hash: Option<AvatarHash>) {
        *self.hash.write() = hash;
    }
}

/// State for one identity's in-flight fetch
struct InFlight {
    /// Latest advertised target; a superseding advertisement updates this
    /// instead of queueing a second fetch
    advertised: AvatarHash,
    /// Handle to the background fetch task
    task: JoinHandle<()>,
}

struct Shared {
    store: Arc<AvatarStore>,
    index: Arc<HashIndex>,
    source: Arc<dyn AvatarSource>,
    in_flight: Mutex<HashMap<IdentityId, InFlight>>,
    event_tx: broadcast::Sender<AvatarEvent>,
    default_avatar: Bytes,
    /// Write-through target for index mutations, if persistence is enabled
    persist: Option<Storage>,
    local: Option<Arc<LocalPresence>>,
}

/// Coordinator for asynchronous avatar synchronization across identities.
pub struct AvatarSyncCoordinator {
    shared: Arc<Shared>,
}

impl AvatarSyncCoordinator {
    /// Create a coordinator over shared store/index state.
    ///
    /// `persist` enables write-through of index mutations; `local`, when
    /// given, is kept up to date with the local account's reconciled hash.
    pub fn new(
        store: Arc<AvatarStore>,
        index: Arc<HashIndex>,
        source: Arc<dyn AvatarSource>,
        default_avatar: Bytes,
        persist: Option<Storage>,
        local: Option<Arc<LocalPresence>>,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        // Seed the presence slot from whatever the restored index knows
        if let Some(local) = &local {
            local.set(index.current_hash(local.identity()));
        }

        Self {
            shared: Arc::new(Shared {
                store,
                index,
                source,
                in_flight: Mutex::new(HashMap::new()),
                event_tx,
                default_avatar,
                persist,
                local,
            }),
        }
    }

    /// Subscribe to avatar change events.
    ///
    /// Multiple subscribers can exist; events are broadcast to all, strictly
    /// after the store/index mutation they describe.
    pub fn subscribe(&self) -> broadcast::Receiver<AvatarEvent> {
        self.shared.event_tx.subscribe()
    }

    /// Best-effort read of an identity's cached avatar. Never fetches.
    pub fn avatar(&self, identity: &IdentityId) -> AvatarResult<Option<Bytes>> {
        match self.shared.index.current_hash(identity) {
            Some(hash) => self.shared.store.get(&hash),
            None => Ok(None),
        }
    }

    /// The identity's currently known hash, or `None` if never reconciled.
    pub fn current_hash(&self, identity: &IdentityId) -> Option<AvatarHash> {
        self.shared.index.current_hash(identity)
    }

    /// The hash to advertise in locally originated presence, if a local
    /// account is configured.
    pub fn local_presence_hash(&self) -> Option<AvatarHash> {
        self.shared.local.as_ref().and_then(|l| l.advertised())
    }

    /// Number of identities currently in the `Fetching` state.
    pub fn fetching_count(&self) -> usize {
        self.shared.in_flight.lock().len()
    }

    /// Handle an inbound hash advertisement for an identity.
    ///
    /// An absent hash is ignored (the remote client is not ready to report).
    /// An unchanged hash is ignored, which is what suppresses the redundant
    /// download storm when every contact re-announces on reconnect. A new
    /// hash transitions the identity to `Fetching` unless a fetch is already
    /// in flight, in which case the advertisement coalesces into it.
    pub fn on_hash_advertised(&self, identity: &IdentityId, advertised: Option<AvatarHash>) {
        let Some(advertised) = advertised else {
            debug!(%identity, "Advertisement without hash, ignoring");
            return;
        };

        // Gate and dispatch under the sync lock, so an advertisement racing
        // a reconcile either coalesces into the in-flight fetch or sees the
        // already-updated index, never a stale gap between the two
        let mut in_flight = self.shared.in_flight.lock();
        if !self.shared.index.is_new_hash(identity, &advertised) {
            debug!(%identity, hash = %advertised, "Avatar already in sync, skipping fetch");
            return;
        }

        info!(%identity, hash = %advertised, "New avatar hash advertised");
        Self::spawn_or_coalesce(&self.shared, &mut in_flight, identity, advertised);
    }

    /// Force a reconcile for an identity, bypassing the is-new gate.
    ///
    /// Used when the identity's own account info changed locally and must be
    /// verified against the source even though the advertised hash looks
    /// unchanged. Still coalesces with any in-flight fetch.
    pub fn force_update(&self, identity: &IdentityId) {
        info!(%identity, "Forced avatar update");
        let mut in_flight = self.shared.in_flight.lock();
        let target = self
            .shared
            .index
            .current_hash(identity)
            .unwrap_or_else(AvatarHash::empty);
        Self::spawn_or_coalesce(&self.shared, &mut in_flight, identity, target);
    }

    /// Stop tracking an identity: abort any in-flight fetch, drop its index
    /// mapping (persisted too), and purge its hash once no other identity
    /// references it.
    pub fn forget(&self, identity: &IdentityId) {
        let mut in_flight = self.shared.in_flight.lock();
        if let Some(entry) = in_flight.remove(identity) {
            entry.task.abort();
        }

        let Some(old_hash) = self.shared.index.remove(identity) else {
            return;
        };
        info!(%identity, hash = %old_hash, "Identity forgotten");

        if let Some(persist) = &self.shared.persist {
            if let Err(e) = persist.remove_index_entry(identity) {
                warn!(%identity, error = %e, "Index entry removal failed");
            }
        }

        if !old_hash.is_empty() && self.shared.index.owners(&old_hash).is_empty() {
            self.shared.store.purge(&old_hash);
        }
    }

    /// Dispatch a fetch, or fold the advertisement into the one already in
    /// flight. Must be called with the sync lock held: the task cannot
    /// remove its entry before it is inserted.
    fn spawn_or_coalesce(
        shared: &Arc<Shared>,
        in_flight: &mut HashMap<IdentityId, InFlight>,
        identity: &IdentityId,
        advertised: AvatarHash,
    ) {
        if let Some(entry) = in_flight.get_mut(identity) {
            debug!(%identity, hash = %advertised, "Coalescing advertisement into in-flight fetch");
            entry.advertised = advertised;
            return;
        }

        let shared = shared.clone();
        let identity_for_task = identity.clone();
        let task = tokio::spawn(async move {
            Self::fetch_task(shared, identity_for_task).await;
        });

        in_flight.insert(identity.clone(), InFlight { advertised, task });
    }

    /// Background fetch for one identity. The network round-trip happens
    /// outside every lock.
    async fn fetch_task(shared: Arc<Shared>, identity: IdentityId) {
        let result = shared.source.fetch_avatar(&identity).await;

        match result {
            Ok(bytes) => Self::reconcile(&shared, &identity, bytes),
            Err(e) => {
                // Back to Idle with store and index untouched; the next
                // genuinely new advertisement retries naturally.
                shared.in_flight.lock().remove(&identity);
                warn!(%identity, error = %e, "Avatar fetch failed");
            }
        }
    }

    /// Fold a successful fetch back into store and index, decide purge
    /// eligibility for the displaced hash, and notify subscribers.
    ///
    /// The whole fold runs under the sync lock. Put always precedes the
    /// index write and the purge decision sees the final ownership state,
    /// so a hash another identity has just stored can never be purged out
    /// from under its pending index write.
    fn reconcile(shared: &Shared, identity: &IdentityId, bytes: Bytes) {
        {
            let mut in_flight = shared.in_flight.lock();

            let stored_hash = if bytes.is_empty() {
                AvatarHash::empty()
            } else {
                match shared.store.put(bytes.clone()) {
                    Ok(hash) => hash,
                    Err(e) => {
                        // Volatile tier is still authoritative for the
                        // session; the image is merely at risk of loss on
                        // restart.
                        warn!(%identity, error = %e, "Persistent tier write failed");
                        AvatarHash::of(&bytes)
                    }
                }
            };

            // Leave the Fetching state in the same critical section as the
            // index write, so a racing re-advertisement of this hash either
            // coalesces or sees the updated index
            if let Some(entry) = in_flight.remove(identity) {
                if entry.advertised != stored_hash && !entry.advertised.is_empty() {
                    debug!(
                        %identity,
                        advertised = %entry.advertised,
                        stored = %stored_hash,
                        "Fetched content disagrees with last advertisement"
                    );
                }
            }

            // Predicate and write in one atomic step
            if let Some(old_hash) = shared
                .index
                .check_and_set(identity.clone(), stored_hash.clone())
            {
                if let Some(persist) = &shared.persist {
                    if let Err(e) = persist.write_index_entry(identity, &stored_hash) {
                        warn!(%identity, error = %e, "Index write-through failed");
                    }
                }

                // Purge the displaced hash only once no identity references it
                if let Some(old_hash) = old_hash {
                    if old_hash != stored_hash && !old_hash.is_empty() {
                        let owners = shared.index.owners(&old_hash);
                        if owners.is_empty() {
                            shared.store.purge(&old_hash);
                        } else {
                            debug!(
                                hash = %old_hash,
                                owners = owners.len(),
                                "Displaced hash still owned, deferring purge"
                            );
                        }
                    }
                }

                info!(%identity, hash = %stored_hash, "Avatar reconciled");
            } else {
                debug!(%identity, hash = %stored_hash, "Reconciled to unchanged hash");
            }

            if let Some(local) = &shared.local {
                if local.identity() == identity {
                    local.set(Some(stored_hash));
                }
            }
        }

        // Notify strictly after the mutation, outside the sync lock
        let image = if bytes.is_empty() {
            shared.default_avatar.clone()
        } else {
            bytes
        };
        let _ = shared.event_tx.send(AvatarEvent::AvatarChanged {
            identity: identity.clone(),
            image,
        });
    }

    /// Abort all in-flight fetches.
    pub fn shutdown(&self) {
        let mut in_flight = self.shared.in_flight.lock();
        for (identity, entry) in in_flight.drain() {
            debug!(%identity, "Aborting fetch task");
            entry.task.abort();
        }
    }
}

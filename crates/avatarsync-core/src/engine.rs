//! Engine facade wiring storage, store, index, coordinator, and aggregator.

use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc};
use tracing::info;

use crate::aggregator::GlobalDisplayAggregator;
use crate::coordinator::{AvatarSyncCoordinator, LocalPresence};
use crate::error::AvatarResult;
use crate::events::{AvatarEvent, DisplayEvent};
use crate::index::HashIndex;
use crate::source::{AvatarSource, ProviderEvent};
use crate::storage::Storage;
use crate::store::AvatarStore;
use crate::types::{AvatarHash, IdentityId, ProviderId};

/// Capacity of the provider registry event feed
const PROVIDER_CHANNEL_CAPACITY: usize = 64;

/// Engine construction parameters.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Path of the redb database file
    pub db_path: PathBuf,
    /// Operator-provided display name override; absolute precedence
    pub override_display_name: Option<String>,
    /// Image announced in place of an explicitly empty avatar
    pub default_avatar: Bytes,
    /// The local account whose reconciled hash feeds outgoing presence
    pub local_identity: Option<IdentityId>,
}

/// Facade over the avatar synchronization components.
///
/// Construction restores the identity-hash index from disk, wires the
/// coordinator over the shared store/index, and starts the display
/// aggregator's provider-registry driver.
pub struct AvatarEngine {
    coordinator: AvatarSyncCoordinator,
    aggregator: GlobalDisplayAggregator,
    provider_tx: mpsc::Sender<ProviderEvent>,
}

impl AvatarEngine {
    /// Create an engine with the given fetch collaborator.
    pub fn new(config: EngineConfig, source: Arc<dyn AvatarSource>) -> AvatarResult<Self> {
        let storage = Storage::new(&config.db_path)?;

        let store = Arc::new(AvatarStore::new(Arc::new(storage.clone())));
        let index = Arc::new(HashIndex::new());
        let restored = storage.load_index()?;
        if !restored.is_empty() {
            info!(entries = restored.len(), "Restored avatar index");
            index.load_from(restored);
        }

        let local = config
            .local_identity
            .map(|identity| Arc::new(LocalPresence::new(identity)));

        let coordinator = AvatarSyncCoordinator::new(
            store,
            index,
            source,
            config.default_avatar.clone(),
            Some(storage),
            local,
        );

        let aggregator = GlobalDisplayAggregator::new(
            config.override_display_name,
            config.default_avatar,
        );
        let (provider_tx, provider_rx) = mpsc::channel(PROVIDER_CHANNEL_CAPACITY);
        aggregator.run(provider_rx);

        Ok(Self {
            coordinator,
            aggregator,
            provider_tx,
        })
    }

    /// Sender half of the provider registry feed. The transport layer sends
    /// `Activated`/`Deactivated` events here.
    pub fn provider_events(&self) -> mpsc::Sender<ProviderEvent> {
        self.provider_tx.clone()
    }

    /// Subscribe to avatar change events.
    pub fn subscribe_avatars(&self) -> broadcast::Receiver<AvatarEvent> {
        self.coordinator.subscribe()
    }

    /// Subscribe to global display change events.
    pub fn subscribe_display(&self) -> broadcast::Receiver<DisplayEvent> {
        self.aggregator.subscribe()
    }

    /// Handle an inbound hash advertisement from the presence transport.
    pub fn on_hash_advertised(&self, identity: &IdentityId, advertised: Option<AvatarHash>) {
        self.coordinator.on_hash_advertised(identity, advertised);
    }

    /// Explicit refresh request, bypassing the change-detection gate.
    pub fn force_update(&self, identity: &IdentityId) {
        self.coordinator.force_update(identity);
    }

    /// Stop tracking an identity (e.g. a removed contact), dropping its
    /// persisted index entry and purging its avatar once unreferenced.
    pub fn forget(&self, identity: &IdentityId) {
        self.coordinator.forget(identity);
    }

    /// Server-stored details changed for a provider's account.
    pub fn on_details_changed(&self, provider_id: &ProviderId) {
        self.aggregator.on_details_changed(provider_id);
    }

    /// Best-effort read of an identity's cached avatar. Never fetches.
    pub fn avatar(&self, identity: &IdentityId) -> AvatarResult<Option<Bytes>> {
        self.coordinator.avatar(identity)
    }

    /// The identity's currently known hash.
    pub fn current_hash(&self, identity: &IdentityId) -> Option<AvatarHash> {
        self.coordinator.current_hash(identity)
    }

    /// The canonical display name for the local user.
    pub fn display_name(&self) -> Option<String> {
        self.aggregator.display_name()
    }

    /// Display name to show for a specific provider's account.
    pub fn display_name_for(&self, provider_id: &ProviderId) -> Option<String> {
        self.aggregator.display_name_for(provider_id)
    }

    /// The current global avatar for the local user.
    pub fn global_avatar(&self) -> Option<Bytes> {
        self.aggregator.global_avatar()
    }

    /// The hash to embed in locally originated presence.
    pub fn local_presence_hash(&self) -> Option<AvatarHash> {
        self.coordinator.local_presence_hash()
    }

    /// Abort all background work.
    pub fn shutdown(&self) {
        info!("Shutting down avatar engine");
        self.coordinator.shutdown();
        self.aggregator.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::BoxFuture;
    use tempfile::TempDir;

    struct FixedSource(Bytes);

    impl AvatarSource for FixedSource {
        fn fetch_avatar(&self, _identity: &IdentityId) -> BoxFuture<'_, AvatarResult<Bytes>> {
            let bytes = self.0.clone();
            Box::pin(async move { Ok(bytes) })
        }
    }

    fn config(dir: &TempDir) -> EngineConfig {
        EngineConfig {
            db_path: dir.path().join("avatars.redb"),
            override_display_name: None,
            default_avatar: Bytes::from_static(b"default"),
            local_identity: None,
        }
    }

    async fn settle(engine: &AvatarEngine, identity: &IdentityId) {
        for _ in 0..200 {
            if engine.current_hash(identity).is_some() {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        panic!("identity never reconciled");
    }

    #[tokio::test]
    async fn test_engine_creates() {
        let dir = TempDir::new().unwrap();
        let engine = AvatarEngine::new(
            config(&dir),
            Arc::new(FixedSource(Bytes::from_static(b"img"))),
        );
        assert!(engine.is_ok());
    }

    #[tokio::test]
    async fn test_index_survives_restart() {
        let dir = TempDir::new().unwrap();
        let alice = IdentityId::new("alice@example");
        let hash = AvatarHash::of(b"img");

        {
            let engine = AvatarEngine::new(
                config(&dir),
                Arc::new(FixedSource(Bytes::from_static(b"img"))),
            )
            .unwrap();
            engine.on_hash_advertised(&alice, Some(hash.clone()));
            settle(&engine, &alice).await;
            engine.shutdown();
        }

        // The completed fetch task may still hold the database handle briefly
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        // A fresh engine over the same database file knows the mapping and
        // the bytes without any fetch
        let engine = AvatarEngine::new(
            config(&dir),
            Arc::new(FixedSource(Bytes::from_static(b"other"))),
        )
        .unwrap();
        assert_eq!(engine.current_hash(&alice), Some(hash));
        assert_eq!(
            engine.avatar(&alice).unwrap(),
            Some(Bytes::from_static(b"img"))
        );
        engine.shutdown();
    }

    #[tokio::test]
    async fn test_forget_drops_persisted_index_entry() {
        let dir = TempDir::new().unwrap();
        let alice = IdentityId::new("alice@example");

        {
            let engine = AvatarEngine::new(
                config(&dir),
                Arc::new(FixedSource(Bytes::from_static(b"img"))),
            )
            .unwrap();
            engine.on_hash_advertised(&alice, Some(AvatarHash::of(b"img")));
            settle(&engine, &alice).await;
            engine.forget(&alice);
            assert_eq!(engine.current_hash(&alice), None);
            assert_eq!(engine.avatar(&alice).unwrap(), None);
            engine.shutdown();
        }

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        // A restart restores nothing for the forgotten identity
        let engine = AvatarEngine::new(
            config(&dir),
            Arc::new(FixedSource(Bytes::from_static(b"img"))),
        )
        .unwrap();
        assert_eq!(engine.current_hash(&alice), None);
        engine.shutdown();
    }

    #[tokio::test]
    async fn test_local_presence_restored_from_index() {
        let dir = TempDir::new().unwrap();
        let me = IdentityId::new("me@example");
        let hash = AvatarHash::of(b"mine");

        {
            let mut cfg = config(&dir);
            cfg.local_identity = Some(me.clone());
            let engine = AvatarEngine::new(
                cfg,
                Arc::new(FixedSource(Bytes::from_static(b"mine"))),
            )
            .unwrap();
            engine.force_update(&me);
            settle(&engine, &me).await;
            assert_eq!(engine.local_presence_hash(), Some(hash.clone()));
            engine.shutdown();
        }

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let mut cfg = config(&dir);
        cfg.local_identity = Some(me);
        let engine = AvatarEngine::new(
            cfg,
            Arc::new(FixedSource(Bytes::from_static(b"mine"))),
        )
        .unwrap();
        assert_eq!(engine.local_presence_hash(), Some(hash));
        engine.shutdown();
    }
}

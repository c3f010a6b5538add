//! Shared stub collaborators for integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use avatarsync_core::{
    AccountInfo, AccountInfoSource, AvatarHash, AvatarResult, AvatarSource, IdentityId,
    IdentityProvider, PersistentStore, ProviderId,
};
use bytes::Bytes;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::{broadcast, Notify};

/// In-memory persistent tier for tests that bypass redb.
#[derive(Default)]
pub struct MemStore {
    entries: Mutex<HashMap<AvatarHash, Bytes>>,
}

impl PersistentStore for MemStore {
    fn write(&self, hash: &AvatarHash, data: &[u8]) -> AvatarResult<()> {
        self.entries
            .lock()
            .insert(hash.clone(), Bytes::copy_from_slice(data));
        Ok(())
    }

    fn read(&self, hash: &AvatarHash) -> AvatarResult<Option<Bytes>> {
        Ok(self.entries.lock().get(hash).cloned())
    }

    fn delete(&self, hash: &AvatarHash) -> AvatarResult<()> {
        self.entries.lock().remove(hash);
        Ok(())
    }
}

/// Fetch stub with a per-identity avatar table, a call counter, and an
/// optional gate that holds every fetch until released.
pub struct CountingSource {
    avatars: Mutex<HashMap<IdentityId, Bytes>>,
    pub calls: AtomicUsize,
    pub fail: AtomicBool,
    gate: Option<Arc<Notify>>,
}

impl CountingSource {
    pub fn new() -> Self {
        Self {
            avatars: Mutex::new(HashMap::new()),
            calls: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
            gate: None,
        }
    }

    /// A source whose fetches block until the returned gate is notified.
    pub fn gated() -> (Self, Arc<Notify>) {
        let gate = Arc::new(Notify::new());
        let mut source = Self::new();
        source.gate = Some(gate.clone());
        (source, gate)
    }

    pub fn set_avatar(&self, identity: &IdentityId, bytes: impl Into<Bytes>) {
        self.avatars.lock().insert(identity.clone(), bytes.into());
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl AvatarSource for CountingSource {
    fn fetch_avatar(&self, identity: &IdentityId) -> BoxFuture<'_, AvatarResult<Bytes>> {
        let identity = identity.clone();
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            if self.fail.load(Ordering::SeqCst) {
                return Err(avatarsync_core::AvatarError::Fetch(
                    "stub transport down".to_string(),
                ));
            }
            // An unknown identity fetches successfully with no photo
            Ok(self
                .avatars
                .lock()
                .get(&identity)
                .cloned()
                .unwrap_or_else(Bytes::new))
        })
    }
}

/// Account-info stub with a configurable answer delay, so tests can order
/// slow and fast providers deterministically.
pub struct StubAccountInfo {
    pub info: AccountInfo,
    pub delay: Duration,
    pub fail: bool,
    pub calls: AtomicUsize,
}

impl StubAccountInfo {
    pub fn new(info: AccountInfo) -> Self {
        Self {
            info,
            delay: Duration::ZERO,
            fail: false,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }
}

impl AccountInfoSource for StubAccountInfo {
    fn fetch_account_info(
        &self,
        _identity: &IdentityId,
    ) -> BoxFuture<'_, AvatarResult<AccountInfo>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.fail {
                return Err(avatarsync_core::AvatarError::Fetch(
                    "account info unavailable".to_string(),
                ));
            }
            Ok(self.info.clone())
        })
    }
}

/// Identity provider stub with optional account-info and avatar-notification
/// capabilities.
pub struct StubProvider {
    id: ProviderId,
    identity: IdentityId,
    account_info: Option<Arc<StubAccountInfo>>,
    avatar_tx: Option<broadcast::Sender<Bytes>>,
}

impl StubProvider {
    pub fn new(id: &str, identity: &str) -> Self {
        Self {
            id: ProviderId::new(id),
            identity: IdentityId::new(identity),
            account_info: None,
            avatar_tx: None,
        }
    }

    pub fn with_account_info(mut self, source: Arc<StubAccountInfo>) -> Self {
        self.account_info = Some(source);
        self
    }

    /// Enable the avatar-notification capability; push images through the
    /// returned sender.
    pub fn with_avatar_notifications(mut self) -> (Self, broadcast::Sender<Bytes>) {
        let (tx, _) = broadcast::channel(16);
        self.avatar_tx = Some(tx.clone());
        (self, tx)
    }
}

impl IdentityProvider for StubProvider {
    fn id(&self) -> ProviderId {
        self.id.clone()
    }

    fn identity(&self) -> IdentityId {
        self.identity.clone()
    }

    fn account_info(&self) -> Option<Arc<dyn AccountInfoSource>> {
        self.account_info
            .clone()
            .map(|s| s as Arc<dyn AccountInfoSource>)
    }

    fn subscribe_avatars(&self) -> Option<broadcast::Receiver<Bytes>> {
        self.avatar_tx.as_ref().map(|tx| tx.subscribe())
    }
}

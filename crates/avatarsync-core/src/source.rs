//! External collaborator seams
//!
//! The engine never talks to a server itself. Remote fetches, account-info
//! queries, and provider lifecycle notifications are injected behind the
//! traits in this module; the transport/session layer implements them.
//!
//! Trait methods that suspend return a `BoxFuture` so collaborators can be
//! held as trait objects behind `Arc<dyn ..>`.

use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use tokio::sync::broadcast;

use crate::error::AvatarResult;
use crate::types::{AccountInfo, IdentityId, ProviderId};

/// The remote avatar fetch operation ("download vCard for identity X").
///
/// A successful fetch with zero-length bytes means the identity explicitly
/// has no avatar. Timeout and cancellation policy belong to the
/// implementation; the coordinator only sees success or failure.
pub trait AvatarSource: Send + Sync {
    fn fetch_avatar(&self, identity: &IdentityId) -> BoxFuture<'_, AvatarResult<Bytes>>;
}

/// Server-stored account details query for a provider's own account.
pub trait AccountInfoSource: Send + Sync {
    fn fetch_account_info(&self, identity: &IdentityId)
        -> BoxFuture<'_, AvatarResult<AccountInfo>>;
}

/// An active identity provider (one registered account).
///
/// Capabilities are probed with `Option` accessors: a provider that does not
/// support server-stored account info returns `None` from `account_info`,
/// and the aggregator skips the probe entirely. Likewise for avatar change
/// notifications; dropping the returned receiver is the unsubscribe.
pub trait IdentityProvider: Send + Sync {
    /// Stable key for lifecycle tracking.
    fn id(&self) -> ProviderId;

    /// The local account identity this provider serves.
    fn identity(&self) -> IdentityId;

    /// Account-info capability, if supported.
    fn account_info(&self) -> Option<Arc<dyn AccountInfoSource>>;

    /// Avatar-notification capability, if supported. Each received value is
    /// the provider's new avatar image; zero-length means explicitly none.
    fn subscribe_avatars(&self) -> Option<broadcast::Receiver<Bytes>>;
}

/// Provider registry lifecycle notifications, delivered to the aggregator
/// over an mpsc channel.
pub enum ProviderEvent {
    /// A provider finished registering and is now active.
    Activated(Arc<dyn IdentityProvider>),
    /// A provider is unregistering or its connection failed.
    Deactivated(ProviderId),
}

impl std::fmt::Debug for ProviderEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderEvent::Activated(p) => write!(f, "Activated({})", p.id()),
            ProviderEvent::Deactivated(id) => write!(f, "Deactivated({})", id),
        }
    }
}

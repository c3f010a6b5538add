//! Change events broadcast to subscribers
//!
//! Both the sync coordinator and the display aggregator fan events out over
//! tokio broadcast channels. Events are emitted strictly after the store and
//! index mutation they describe has completed, so a subscriber never observes
//! a half-updated store/index pair.

use bytes::Bytes;

use crate::types::IdentityId;

/// Events emitted by the avatar sync coordinator.
#[derive(Debug, Clone)]
pub enum AvatarEvent {
    /// An identity's avatar was reconciled to new content.
    ///
    /// `image` carries the resolved bytes, or the configured default image
    /// when the identity explicitly has no avatar.
    AvatarChanged {
        /// The identity whose avatar changed
        identity: IdentityId,
        /// The resolved image bytes
        image: Bytes,
    },
}

impl AvatarEvent {
    /// The identity this event concerns.
    pub fn identity(&self) -> &IdentityId {
        match self {
            AvatarEvent::AvatarChanged { identity, .. } => identity,
        }
    }
}

/// Events emitted by the global display aggregator.
#[derive(Debug, Clone)]
pub enum DisplayEvent {
    /// The aggregated display name for the local user changed.
    GlobalNameChanged {
        /// The new display name (never empty)
        name: String,
    },
    /// The global avatar for the local user changed.
    GlobalAvatarChanged {
        /// The new avatar bytes (default-coerced, never empty)
        image: Bytes,
    },
}

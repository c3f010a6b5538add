//! Avatar Synchronization Core Library
//!
//! Keeps a local, multi-account client consistent with avatar data
//! advertised by remote peers and concurrently registering accounts, while
//! minimizing redundant network fetches and safely reclaiming storage shared
//! by several identities.
//!
//! ## Overview
//!
//! - **Content-addressable store**: avatar images keyed by their BLAKE3
//!   content hash, in a volatile cache over a redb persistent tier
//! - **Identity-hash index**: one current hash per identity, with
//!   multi-owner reference tracking gating every purge
//! - **Sync coordinator**: turns inbound hash advertisements into at most
//!   one in-flight fetch per identity and reconciles the results
//! - **Display aggregator**: converges N concurrently active identity
//!   providers onto one canonical display name and avatar
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use avatarsync_core::{AvatarEngine, EngineConfig, IdentityId};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = EngineConfig {
//!         db_path: "~/.myclient/avatars.redb".into(),
//!         override_display_name: None,
//!         default_avatar: DEFAULT_PNG.into(),
//!         local_identity: Some(IdentityId::new("me@example")),
//!     };
//!     let engine = AvatarEngine::new(config, Arc::new(my_transport))?;
//!
//!     let mut events = engine.subscribe_avatars();
//!
//!     // Presence transport feeds advertisements in:
//!     engine.on_hash_advertised(&IdentityId::new("alice@example"), Some(hash));
//!
//!     while let Ok(event) = events.recv().await {
//!         println!("avatar changed: {}", event.identity());
//!     }
//!     Ok(())
//! }
//! ```

pub mod aggregator;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod events;
pub mod index;
pub mod source;
pub mod storage;
pub mod store;
pub mod types;

// Re-exports
pub use aggregator::GlobalDisplayAggregator;
pub use coordinator::{AvatarSyncCoordinator, LocalPresence};
pub use engine::{AvatarEngine, EngineConfig};
pub use error::{AvatarError, AvatarResult};
pub use events::{AvatarEvent, DisplayEvent};
pub use index::HashIndex;
pub use source::{AccountInfoSource, AvatarSource, IdentityProvider, ProviderEvent};
pub use storage::Storage;
pub use store::{AvatarStore, PersistentStore};
pub use types::{AccountInfo, AvatarHash, IdentityId, ProviderId};

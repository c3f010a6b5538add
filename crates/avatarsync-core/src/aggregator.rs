//! Global display aggregator
//!
//! Observes provider lifecycle events across multiple concurrently active
//! identity providers and converges on one canonical display name and avatar
//! for the local user.
//!
//! Name precedence, first match wins and is sticky:
//!
//! 1. The operator-provided override display name — when set, provider data
//!    never touches the name.
//! 2. First name + last name (single separating space; either alone when
//!    only one is known).
//! 3. A provider-supplied display name, used only while no provider has ever
//!    supplied a first or last name.
//!
//! Because providers finish their account-info probes in arbitrary order,
//! every field write is a check-then-set under a single lock hold: the first
//! provider to answer wins, later answers never downgrade an already-set
//! field.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::events::DisplayEvent;
use crate::source::{IdentityProvider, ProviderEvent};
use crate::types::ProviderId;

/// Default capacity for the event broadcast channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Default)]
struct DisplayState {
    first_name: Option<String>,
    last_name: Option<String>,
    /// Lowest-precedence name source, only consulted while no first/last
    /// name was ever obtained
    provider_display_name: Option<String>,
    global_display_name: Option<String>,
    global_avatar: Option<Bytes>,
    /// Last announced avatar per provider; preferred over re-fetching
    avatar_cache: HashMap<ProviderId, Bytes>,
}

/// Background tasks owned per active provider
struct ProviderTasks {
    probe: Option<JoinHandle<()>>,
    avatar_sub: Option<JoinHandle<()>>,
}

struct Shared {
    state: Mutex<DisplayState>,
    /// Set once at construction; absolute precedence over provider data
    override_name: Option<String>,
    default_avatar: Bytes,
    event_tx: broadcast::Sender<DisplayEvent>,
    providers: Mutex<HashMap<ProviderId, Arc<dyn IdentityProvider>>>,
    tasks: Mutex<HashMap<ProviderId, ProviderTasks>>,
}

/// Aggregator converging on one global display identity across providers.
pub struct GlobalDisplayAggregator {
    shared: Arc<Shared>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl GlobalDisplayAggregator {
    /// Create an aggregator.
    ///
    /// `override_name` comes from external configuration and, when present,
    /// short-circuits all name aggregation. `default_avatar` replaces empty
    /// fetched avatars before they are cached or announced.
    pub fn new(override_name: Option<String>, default_avatar: Bytes) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(DisplayState::default()),
                override_name: override_name.filter(|n| !n.is_empty()),
                default_avatar,
                event_tx,
                providers: Mutex::new(HashMap::new()),
                tasks: Mutex::new(HashMap::new()),
            }),
            driver: Mutex::new(None),
        }
    }

    /// Subscribe to display change events.
    pub fn subscribe(&self) -> broadcast::Receiver<DisplayEvent> {
        self.shared.event_tx.subscribe()
    }

    /// Start consuming provider registry lifecycle events.
    pub fn run(&self, mut registry_rx: mpsc::Receiver<ProviderEvent>) {
        let shared = self.shared.clone();
        let handle = tokio::spawn(async move {
            while let Some(event) = registry_rx.recv().await {
                match event {
                    ProviderEvent::Activated(provider) => {
                        Self::handle_activated(&shared, provider);
                    }
                    ProviderEvent::Deactivated(id) => {
                        Self::handle_deactivated(&shared, &id);
                    }
                }
            }
            debug!("Provider registry feed closed");
        });
        *self.driver.lock() = Some(handle);
    }

    /// The canonical display name: the override if configured, otherwise the
    /// aggregated name, otherwise `None` while no provider has answered.
    pub fn display_name(&self) -> Option<String> {
        if let Some(name) = &self.shared.override_name {
            return Some(name.clone());
        }
        self.shared.state.lock().global_display_name.clone()
    }

    /// Display name to show for a specific provider's account: the
    /// canonical name when known, falling back to the account address.
    pub fn display_name_for(&self, provider_id: &ProviderId) -> Option<String> {
        if let Some(name) = self.display_name() {
            return Some(name);
        }
        self.shared
            .providers
            .lock()
            .get(provider_id)
            .map(|p| p.identity().as_str().to_string())
    }

    /// The current global avatar, if any provider has announced one.
    pub fn global_avatar(&self) -> Option<Bytes> {
        self.shared.state.lock().global_avatar.clone()
    }

    /// Server-stored details changed for a provider: force a re-probe even
    /// though cached data exists. No-op while the override name is set and
    /// the provider has no avatar to refresh.
    pub fn on_details_changed(&self, provider_id: &ProviderId) {
        let provider = self.shared.providers.lock().get(provider_id).cloned();
        let Some(provider) = provider else {
            debug!(%provider_id, "Details changed for unknown provider");
            return;
        };

        info!(%provider_id, "Server-stored details changed, re-probing");
        let shared = self.shared.clone();
        let handle = tokio::spawn(async move {
            Self::probe(shared, provider, true).await;
        });
        if let Some(tasks) = self.shared.tasks.lock().get_mut(provider_id) {
            tasks.probe = Some(handle);
        }
    }

    fn handle_activated(shared: &Arc<Shared>, provider: Arc<dyn IdentityProvider>) {
        let provider_id = provider.id();
        info!(%provider_id, identity = %provider.identity(), "Provider activated");

        shared
            .providers
            .lock()
            .insert(provider_id.clone(), provider.clone());

        // Probe account info only when the provider supports it; spawning a
        // task that cannot do anything useful is pointless.
        let probe = provider.account_info().is_some().then(|| {
            let shared = shared.clone();
            let provider = provider.clone();
            tokio::spawn(async move {
                Self::probe(shared, provider, false).await;
            })
        });

        let avatar_sub = provider.subscribe_avatars().map(|rx| {
            let shared = shared.clone();
            let provider_id = provider_id.clone();
            tokio::spawn(async move {
                Self::avatar_subscription(shared, provider_id, rx).await;
            })
        });

        shared
            .tasks
            .lock()
            .insert(provider_id, ProviderTasks { probe, avatar_sub });
    }

    fn handle_deactivated(shared: &Arc<Shared>, provider_id: &ProviderId) {
        info!(%provider_id, "Provider deactivated");
        shared.providers.lock().remove(provider_id);

        // Aborting the subscription consumer is the unsubscribe
        if let Some(tasks) = shared.tasks.lock().remove(provider_id) {
            if let Some(task) = tasks.probe {
                task.abort();
            }
            if let Some(task) = tasks.avatar_sub {
                task.abort();
            }
        }
    }

    /// Query a provider's account info and fold the answer into the global
    /// display state. The query happens outside every lock; the fields are
    /// applied in one lock hold.
    async fn probe(shared: Arc<Shared>, provider: Arc<dyn IdentityProvider>, is_update: bool) {
        let provider_id = provider.id();
        let cached = shared
            .state
            .lock()
            .avatar_cache
            .get(&provider_id)
            .cloned();

        // A cached avatar is preferred over re-fetching unless this is an
        // explicit update signal.
        let need_fetch = is_update || cached.is_none();

        let info = if need_fetch {
            let Some(source) = provider.account_info() else {
                return;
            };
            match source.fetch_account_info(&provider.identity()).await {
                Ok(info) => Some(info),
                Err(e) => {
                    // Swallowed: the fields stay unset and a later provider
                    // or the default gets its chance.
                    warn!(%provider_id, error = %e, "Account info query failed");
                    None
                }
            }
        } else {
            None
        };

        // Avatar resolution: fetched (default-coerced) wins, else the cache.
        let avatar = match &info {
            Some(info) => Some(Self::coerce_avatar(&shared, info.avatar.clone())),
            None => cached,
        };

        let name_changed = {
            let mut state = shared.state.lock();

            if let Some(avatar) = &avatar {
                state
                    .avatar_cache
                    .insert(provider_id.clone(), avatar.clone());
                state.global_avatar = Some(avatar.clone());
            }

            match &info {
                Some(info) => Self::apply_names(&shared, &mut state, info, is_update),
                None => None,
            }
        };

        // Notify strictly after the state mutation completed
        if let Some(avatar) = avatar {
            let _ = shared
                .event_tx
                .send(DisplayEvent::GlobalAvatarChanged { image: avatar });
        }
        if let Some(name) = name_changed {
            info!(%provider_id, name = %name, "Global display name changed");
            let _ = shared
                .event_tx
                .send(DisplayEvent::GlobalNameChanged { name });
        }
    }

    /// Sticky check-then-set of the name fields. Must be called with the
    /// state lock held; returns the new global name when it changed.
    fn apply_names(
        shared: &Shared,
        state: &mut DisplayState,
        info: &crate::types::AccountInfo,
        is_update: bool,
    ) -> Option<String> {
        // The override takes absolute precedence; provider data is never
        // applied to the name.
        if shared.override_name.is_some() {
            return None;
        }
        if state.global_display_name.is_some() && !is_update {
            return None;
        }

        if state.first_name.is_none() {
            if let Some(first) = nonempty(&info.first_name) {
                state.first_name = Some(first);
            }
        }
        if state.last_name.is_none() {
            if let Some(last) = nonempty(&info.last_name) {
                state.last_name = Some(last);
            }
        }
        if state.first_name.is_none() && state.last_name.is_none() {
            if let Some(display) = nonempty(&info.display_name) {
                state.provider_display_name = Some(display);
            }
        }

        let name = match (&state.first_name, &state.last_name) {
            (Some(first), Some(last)) => Some(format!("{} {}", first, last)),
            (Some(first), None) => Some(first.clone()),
            (None, Some(last)) => Some(last.clone()),
            (None, None) => state.provider_display_name.clone(),
        }?;

        if state.global_display_name.as_deref() == Some(name.as_str()) {
            return None;
        }
        state.global_display_name = Some(name.clone());
        Some(name)
    }

    /// Consume a provider's avatar change notifications while it is active.
    async fn avatar_subscription(
        shared: Arc<Shared>,
        provider_id: ProviderId,
        mut rx: broadcast::Receiver<Bytes>,
    ) {
        loop {
            match rx.recv().await {
                Ok(image) => {
                    let image = Self::coerce_avatar(&shared, Some(image));
                    {
                        let mut state = shared.state.lock();
                        state
                            .avatar_cache
                            .insert(provider_id.clone(), image.clone());
                        state.global_avatar = Some(image.clone());
                    }
                    debug!(%provider_id, len = image.len(), "Provider avatar changed");
                    let _ = shared
                        .event_tx
                        .send(DisplayEvent::GlobalAvatarChanged { image });
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(%provider_id, skipped, "Avatar notifications lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    /// An empty or missing image becomes the configured default; the
    /// aggregator never announces an absent avatar.
    fn coerce_avatar(shared: &Shared, image: Option<Bytes>) -> Bytes {
        match image {
            Some(image) if !image.is_empty() => image,
            _ => shared.default_avatar.clone(),
        }
    }

    /// Abort the driver and all per-provider tasks.
    pub fn shutdown(&self) {
        if let Some(handle) = self.driver.lock().take() {
            handle.abort();
        }
        let mut tasks = self.shared.tasks.lock();
        for (provider_id, tasks) in tasks.drain() {
            debug!(%provider_id, "Aborting provider tasks");
            if let Some(task) = tasks.probe {
                task.abort();
            }
            if let Some(task) = tasks.avatar_sub {
                task.abort();
            }
        }
    }
}

fn nonempty(value: &Option<String>) -> Option<String> {
    value.as_deref().filter(|s| !s.is_empty()).map(String::from)
}

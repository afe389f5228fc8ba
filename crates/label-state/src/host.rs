//! Host collaborators consumed by the aggregation core
//!
//! [`LabelHost`] is everything a controller needs from the runtime: label
//! membership queries, per-entity state subscriptions, current state reads
//! and a place to publish derived states. [`HassHost`] implements it over
//! the in-process event bus, state machine and registries.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use dashmap::DashMap;
use ha_core::events::{EntityRegistryUpdatedData, LabelRegistryUpdatedData, StateChangedData};
use ha_core::{Context, EntityId, State};
use ha_event_bus::{EventBus, ListenerId};
use ha_registries::{EntityRegistry, LabelRegistry};
use ha_state_machine::StateMachine;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, trace, warn};

/// Result of resolving a label
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Membership {
    /// The label does not exist
    Missing,
    /// Entities currently carrying the label
    Present(BTreeSet<EntityId>),
}

impl Membership {
    pub fn is_missing(&self) -> bool {
        matches!(self, Membership::Missing)
    }

    /// Members, empty when the label is missing
    pub fn into_entity_ids(self) -> BTreeSet<EntityId> {
        match self {
            Membership::Missing => BTreeSet::new(),
            Membership::Present(ids) => ids,
        }
    }
}

/// Opaque token returned by the subscribe calls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionHandle(u64);

impl SubscriptionHandle {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn id(&self) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SubscriptionError {
    #[error("host refused subscription: {0}")]
    Refused(String),
}

/// A state change delivered for one subscribed entity
#[derive(Debug, Clone)]
pub struct StateChange {
    pub entity_id: EntityId,
    /// `None` when the entity's state was removed
    pub new_state: Option<State>,
}

pub type StateChangeCallback = Box<dyn Fn(StateChange) + Send + Sync>;

pub type MembershipCallback = Box<dyn Fn() + Send + Sync>;

/// The runtime as seen by a label aggregation controller
///
/// Callbacks may be invoked on any thread, synchronously inside the host's
/// dispatch. Once `unsubscribe` returns, the callback is never invoked again.
#[async_trait]
pub trait LabelHost: Send + Sync {
    fn entity_ids_for_label(&self, label_id: &str) -> Membership;

    async fn subscribe_state_changed(
        &self,
        entity_id: &EntityId,
        callback: StateChangeCallback,
    ) -> Result<SubscriptionHandle, SubscriptionError>;

    /// Fires when an entity gains or loses the label, or the label itself changes
    async fn subscribe_label_membership_changed(
        &self,
        label_id: &str,
        callback: MembershipCallback,
    ) -> Result<SubscriptionHandle, SubscriptionError>;

    async fn unsubscribe(&self, handle: SubscriptionHandle);

    fn current_state(&self, entity_id: &EntityId) -> Option<State>;

    fn publish_state(&self, entity_id: &EntityId, value: &str, attributes: HashMap<String, Value>);

    fn remove_state(&self, entity_id: &EntityId);

    fn label_name(&self, label_id: &str) -> Option<String>;

    fn entity_name(&self, entity_id: &EntityId) -> Option<String>;
}

type SharedStateCallback = Arc<dyn Fn(StateChange) + Send + Sync>;

type StateCallbacks = DashMap<EntityId, Vec<(SubscriptionHandle, SharedStateCallback)>>;

enum Registration {
    /// Bus listeners owned by the subscription
    Listeners(Vec<ListenerId>),
    /// Entry in the shared state change table
    StateChanged(EntityId),
}

/// [`LabelHost`] over the in-process runtime
///
/// State subscriptions share a single `state_changed` bus listener, which
/// exists only while at least one entity is subscribed.
pub struct HassHost {
    bus: Arc<EventBus>,
    states: Arc<StateMachine>,
    entities: Arc<EntityRegistry>,
    labels: Arc<LabelRegistry>,
    subscriptions: DashMap<SubscriptionHandle, Registration>,
    state_callbacks: Arc<StateCallbacks>,
    state_listener: Mutex<Option<ListenerId>>,
    next_handle: AtomicU64,
}

impl HassHost {
    pub fn new(
        bus: Arc<EventBus>,
        states: Arc<StateMachine>,
        entities: Arc<EntityRegistry>,
        labels: Arc<LabelRegistry>,
    ) -> Self {
        Self {
            bus,
            states,
            entities,
            labels,
            subscriptions: DashMap::new(),
            state_callbacks: Arc::new(DashMap::new()),
            state_listener: Mutex::new(None),
            next_handle: AtomicU64::new(1),
        }
    }

    fn next_handle(&self) -> SubscriptionHandle {
        SubscriptionHandle(self.next_handle.fetch_add(1, Ordering::SeqCst))
    }

    fn register(&self, registration: Registration) -> SubscriptionHandle {
        let handle = self.next_handle();
        self.subscriptions.insert(handle, registration);
        handle
    }

    fn add_state_callback(
        &self,
        entity_id: &EntityId,
        handle: SubscriptionHandle,
        callback: SharedStateCallback,
    ) {
        let mut listener = self
            .state_listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        self.state_callbacks
            .entry(entity_id.clone())
            .or_default()
            .push((handle, callback));

        if listener.is_none() {
            let callbacks = Arc::clone(&self.state_callbacks);
            *listener = Some(
                self.bus
                    .listen_typed::<StateChangedData>(move |event| dispatch(&callbacks, event.data)),
            );
            debug!("Shared state change listener added");
        }
    }

    fn remove_state_callback(&self, entity_id: &EntityId, handle: SubscriptionHandle) {
        let mut listener = self
            .state_listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(mut callbacks) = self.state_callbacks.get_mut(entity_id) {
            callbacks.retain(|(h, _)| *h != handle);
        }
        self.state_callbacks
            .remove_if(entity_id, |_, callbacks| callbacks.is_empty());

        if self.state_callbacks.is_empty() {
            if let Some(id) = listener.take() {
                self.bus.remove_listener(id);
                debug!("Shared state change listener removed");
            }
        }
    }

    /// Number of live subscriptions
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }
}

#[async_trait]
impl LabelHost for HassHost {
    fn entity_ids_for_label(&self, label_id: &str) -> Membership {
        if !self.labels.contains(label_id) {
            return Membership::Missing;
        }
        let ids = self
            .entities
            .entity_ids_for_label(label_id)
            .into_iter()
            .filter_map(|id| match id.parse::<EntityId>() {
                Ok(entity_id) => Some(entity_id),
                Err(e) => {
                    warn!(entity_id = %id, error = %e, "Skipping malformed registry entity");
                    None
                }
            })
            .collect();
        Membership::Present(ids)
    }

    async fn subscribe_state_changed(
        &self,
        entity_id: &EntityId,
        callback: StateChangeCallback,
    ) -> Result<SubscriptionHandle, SubscriptionError> {
        let handle = self.next_handle();
        self.add_state_callback(entity_id, handle, Arc::from(callback));
        self.subscriptions
            .insert(handle, Registration::StateChanged(entity_id.clone()));
        debug!(entity_id = %entity_id, "Subscribed to state changes");
        Ok(handle)
    }

    async fn subscribe_label_membership_changed(
        &self,
        label_id: &str,
        callback: MembershipCallback,
    ) -> Result<SubscriptionHandle, SubscriptionError> {
        let callback: Arc<dyn Fn() + Send + Sync> = Arc::from(callback);

        let label = label_id.to_string();
        let on_entity = Arc::clone(&callback);
        let entity_listener = self
            .bus
            .listen_typed::<EntityRegistryUpdatedData>(move |event| {
                if event.data.touches_label(&label) {
                    on_entity();
                }
            });

        let label = label_id.to_string();
        let label_listener = self
            .bus
            .listen_typed::<LabelRegistryUpdatedData>(move |event| {
                if event.data.label_id == label {
                    callback();
                }
            });

        debug!(label_id, "Subscribed to label membership changes");
        Ok(self.register(Registration::Listeners(vec![entity_listener, label_listener])))
    }

    async fn unsubscribe(&self, handle: SubscriptionHandle) {
        match self.subscriptions.remove(&handle) {
            Some((_, Registration::Listeners(listeners))) => {
                for listener in listeners {
                    self.bus.remove_listener(listener);
                }
            }
            Some((_, Registration::StateChanged(entity_id))) => {
                self.remove_state_callback(&entity_id, handle);
            }
            None => trace!(handle = handle.id(), "Unsubscribe of unknown handle"),
        }
    }

    fn current_state(&self, entity_id: &EntityId) -> Option<State> {
        self.states.get(&entity_id.to_string())
    }

    fn publish_state(&self, entity_id: &EntityId, value: &str, attributes: HashMap<String, Value>) {
        self.states
            .set(entity_id.clone(), value, attributes, Context::new());
    }

    fn remove_state(&self, entity_id: &EntityId) {
        self.states.remove(entity_id, Context::new());
    }

    fn label_name(&self, label_id: &str) -> Option<String> {
        self.labels.get(label_id).map(|label| label.name.clone())
    }

    /// Registry name, then the state's friendly name
    fn entity_name(&self, entity_id: &EntityId) -> Option<String> {
        let key = entity_id.to_string();
        self.entities
            .get(&key)
            .and_then(|entry| entry.display_name().map(String::from))
            .or_else(|| {
                self.states
                    .get(&key)
                    .and_then(|state| state.friendly_name().map(String::from))
            })
    }
}

/// Hand a `state_changed` payload to the callbacks of its entity
fn dispatch(callbacks: &StateCallbacks, data: StateChangedData) {
    let matching: Vec<SharedStateCallback> = match callbacks.get(&data.entity_id) {
        Some(entry) => entry.iter().map(|(_, callback)| Arc::clone(callback)).collect(),
        None => return,
    };
    trace!(entity_id = %data.entity_id, callbacks = matching.len(), "Dispatching state change");
    for callback in matching {
        callback(StateChange {
            entity_id: data.entity_id.clone(),
            new_state: data.new_state.clone(),
        });
    }
}

//! Entity state machine
//!
//! Tracks the current state of every entity and fires STATE_CHANGED on the
//! event bus for each write and removal.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use ha_core::events::StateChangedData;
use ha_core::{Context, EntityId, State, MAX_STATE_LENGTH, STATE_UNKNOWN};
use ha_event_bus::EventBus;
use tracing::{debug, instrument, trace, warn};

/// Current states of all entities, keyed by entity_id string
pub struct StateMachine {
    states: DashMap<String, State>,
    event_bus: Arc<EventBus>,
}

impl StateMachine {
    pub fn new(event_bus: Arc<EventBus>) -> Self {
        Self {
            states: DashMap::new(),
            event_bus,
        }
    }

    /// Set the state of an entity and fire STATE_CHANGED
    ///
    /// Values longer than [`MAX_STATE_LENGTH`] are stored as `unknown`.
    #[instrument(skip(self, state, attributes, context), fields(entity_id = %entity_id))]
    pub fn set(
        &self,
        entity_id: EntityId,
        state: impl Into<String>,
        attributes: HashMap<String, serde_json::Value>,
        context: Context,
    ) -> State {
        let mut state = state.into();
        if state.len() > MAX_STATE_LENGTH {
            warn!(len = state.len(), "State value too long, storing as unknown");
            state = STATE_UNKNOWN.to_string();
        }

        let key = entity_id.to_string();
        let old_state = self.states.get(&key).map(|s| s.clone());

        let new_state = match &old_state {
            Some(existing) => existing.with_update(state, attributes, context.clone()),
            None => State::new(entity_id.clone(), state, attributes, context.clone()),
        };

        debug!(
            state = %new_state.state,
            changed = old_state.as_ref().map_or(true, |s| s.state != new_state.state),
            "Setting entity state"
        );

        // Stored before firing so listeners reading back see the new value
        self.states.insert(key, new_state.clone());

        self.event_bus.fire_typed(
            StateChangedData {
                entity_id,
                old_state,
                new_state: Some(new_state.clone()),
            },
            context,
        );

        new_state
    }

    /// Get the current state of an entity
    pub fn get(&self, entity_id: &str) -> Option<State> {
        self.states.get(entity_id).map(|s| s.clone())
    }

    /// Get the state value, or None if the entity has no state
    pub fn get_state(&self, entity_id: &str) -> Option<String> {
        self.states.get(entity_id).map(|s| s.state.clone())
    }

    pub fn is_state(&self, entity_id: &str, state: &str) -> bool {
        self.get_state(entity_id).as_deref() == Some(state)
    }

    /// Remove an entity's state, firing STATE_CHANGED with no new state
    #[instrument(skip(self, context), fields(entity_id = %entity_id))]
    pub fn remove(&self, entity_id: &EntityId, context: Context) -> Option<State> {
        let old_state = self.states.remove(&entity_id.to_string()).map(|(_, s)| s);

        if let Some(ref state) = old_state {
            trace!("Removing entity state");
            self.event_bus.fire_typed(
                StateChangedData {
                    entity_id: entity_id.clone(),
                    old_state: Some(state.clone()),
                    new_state: None,
                },
                context,
            );
        }

        old_state
    }

    pub fn all_entity_ids(&self) -> Vec<String> {
        self.states.iter().map(|r| r.key().clone()).collect()
    }

    pub fn entity_count(&self) -> usize {
        self.states.len()
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn make_test_setup() -> (Arc<EventBus>, StateMachine) {
        let event_bus = Arc::new(EventBus::new());
        let state_machine = StateMachine::new(event_bus.clone());
        (event_bus, state_machine)
    }

    fn id(s: &str) -> EntityId {
        s.parse().unwrap()
    }

    #[test]
    fn test_set_and_get_state() {
        let (_, sm) = make_test_setup();
        let attrs = HashMap::from([("friendly_name".to_string(), json!("Test 1"))]);

        let state = sm.set(id("sensor.test_1"), "11", attrs.clone(), Context::new());
        assert_eq!(state.state, "11");
        assert_eq!(state.attributes, attrs);

        assert!(sm.is_state("sensor.test_1", "11"));
        assert!(!sm.is_state("sensor.test_2", "11"));
        assert_eq!(sm.entity_count(), 1);
    }

    #[test]
    fn test_overlong_state_becomes_unknown() {
        let (_, sm) = make_test_setup();
        let state = sm.set(
            id("sensor.long"),
            "x".repeat(MAX_STATE_LENGTH + 1),
            HashMap::new(),
            Context::new(),
        );
        assert_eq!(state.state, STATE_UNKNOWN);
    }

    #[test]
    fn test_listener_sees_stored_state() {
        let (bus, sm) = make_test_setup();
        let sm = Arc::new(sm);
        let observed = Arc::new(std::sync::Mutex::new(None));

        let (sm_ref, sink) = (sm.clone(), observed.clone());
        bus.listen_typed::<StateChangedData>(move |event| {
            *sink.lock().unwrap() = sm_ref.get_state(&event.data.entity_id.to_string());
        });

        sm.set(id("sensor.test_1"), "12", HashMap::new(), Context::new());
        assert_eq!(observed.lock().unwrap().as_deref(), Some("12"));
    }

    #[tokio::test]
    async fn test_remove_fires_state_changed_without_new_state() {
        let (bus, sm) = make_test_setup();
        sm.set(id("sensor.test_1"), "on", HashMap::new(), Context::new());

        let mut rx = bus.subscribe_typed::<StateChangedData>();
        let removed = sm.remove(&id("sensor.test_1"), Context::new());
        assert_eq!(removed.unwrap().state, "on");
        assert!(sm.get("sensor.test_1").is_none());

        let event = rx.recv().await.unwrap();
        assert!(event.data.new_state.is_none());
        assert_eq!(event.data.old_state.unwrap().state, "on");

        // Removing again is a no-op
        assert!(sm.remove(&id("sensor.test_1"), Context::new()).is_none());
    }
}

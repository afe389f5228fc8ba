//! Last known state of each tracked entity

use std::collections::BTreeMap;

use ha_core::{EntityId, State, STATE_UNAVAILABLE};

/// A label member and the last state value it reported
#[derive(Debug, Clone, PartialEq)]
pub struct TrackedEntity {
    pub entity_id: EntityId,
    /// `None` until the entity reports, or after its state is removed
    pub state: Option<String>,
}

impl TrackedEntity {
    pub fn new(entity_id: EntityId, state: Option<String>) -> Self {
        Self { entity_id, state }
    }

    pub fn is_available(&self) -> bool {
        self.state.as_deref().is_some_and(|s| s != STATE_UNAVAILABLE)
    }

    /// The state parsed as a finite float, `None` while unavailable
    pub fn numeric_value(&self) -> Option<f64> {
        if !self.is_available() {
            return None;
        }
        self.state
            .as_deref()
            .and_then(|s| s.trim().parse::<f64>().ok())
            .filter(|v| v.is_finite())
    }
}

/// Snapshot collection keyed by entity ID, iterated in sorted order
#[derive(Debug, Default, Clone)]
pub struct SnapshotCache {
    entities: BTreeMap<EntityId, TrackedEntity>,
}

impl SnapshotCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking an entity, seeded from its current host state
    pub fn track(&mut self, entity_id: EntityId, current: Option<&State>) {
        let state = current.map(|s| s.state.clone());
        self.entities
            .insert(entity_id.clone(), TrackedEntity::new(entity_id, state));
    }

    /// Record a new state; returns false for untracked entities
    pub fn update(&mut self, entity_id: &EntityId, new_state: Option<&State>) -> bool {
        match self.entities.get_mut(entity_id) {
            Some(tracked) => {
                tracked.state = new_state.map(|s| s.state.clone());
                true
            }
            None => false,
        }
    }

    pub fn untrack(&mut self, entity_id: &EntityId) -> Option<TrackedEntity> {
        self.entities.remove(entity_id)
    }

    pub fn contains(&self, entity_id: &EntityId) -> bool {
        self.entities.contains_key(entity_id)
    }

    pub fn get(&self, entity_id: &EntityId) -> Option<&TrackedEntity> {
        self.entities.get(entity_id)
    }

    pub fn entity_ids(&self) -> impl Iterator<Item = &EntityId> {
        self.entities.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TrackedEntity> {
        self.entities.values()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn clear(&mut self) {
        self.entities.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ha_core::Context;
    use std::collections::HashMap;

    fn state(entity_id: &EntityId, value: &str) -> State {
        State::new(entity_id.clone(), value, HashMap::new(), Context::new())
    }

    #[test]
    fn test_track_update_untrack() {
        let a: EntityId = "sensor.a".parse().unwrap();
        let b: EntityId = "sensor.b".parse().unwrap();
        let mut cache = SnapshotCache::new();

        cache.track(b.clone(), None);
        cache.track(a.clone(), Some(&state(&a, "12.5")));
        assert_eq!(cache.entity_ids().collect::<Vec<_>>(), vec![&a, &b]);
        assert_eq!(cache.get(&a).unwrap().numeric_value(), Some(12.5));
        assert!(!cache.get(&b).unwrap().is_available());

        assert!(cache.update(&b, Some(&state(&b, "unavailable"))));
        assert!(!cache.get(&b).unwrap().is_available());
        assert_eq!(cache.get(&b).unwrap().state.as_deref(), Some("unavailable"));

        let c: EntityId = "sensor.c".parse().unwrap();
        assert!(!cache.update(&c, Some(&state(&c, "on"))));
        assert!(!cache.contains(&c));

        cache.untrack(&a);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_numeric_value_rejects_non_finite() {
        let id: EntityId = "sensor.a".parse().unwrap();
        for value in ["nan", "inf", "on", "", "unavailable"] {
            let tracked = TrackedEntity::new(id.clone(), Some(value.to_string()));
            assert_eq!(tracked.numeric_value(), None, "{value}");
        }
        let tracked = TrackedEntity::new(id, Some(" 3.8 ".to_string()));
        assert_eq!(tracked.numeric_value(), Some(3.8));
    }
}

//! State type representing an entity's current state

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Context, EntityId, ATTR_FRIENDLY_NAME, STATE_UNAVAILABLE, STATE_UNKNOWN};

/// The state of an entity at a point in time
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct State {
    /// The entity this state belongs to
    pub entity_id: EntityId,

    /// The state value (e.g., "on", "off", "23.5", "unavailable")
    pub state: String,

    /// Additional attributes associated with the state
    #[serde(default)]
    pub attributes: HashMap<String, serde_json::Value>,

    /// When the state value last changed
    pub last_changed: DateTime<Utc>,

    /// When the state was last written, even with an unchanged value
    pub last_updated: DateTime<Utc>,

    /// Context of the change that created this state
    pub context: Context,
}

impl State {
    /// Create a new state stamped with the current time
    pub fn new(
        entity_id: EntityId,
        state: impl Into<String>,
        attributes: HashMap<String, serde_json::Value>,
        context: Context,
    ) -> Self {
        let now = Utc::now();
        Self {
            entity_id,
            state: state.into(),
            attributes,
            last_changed: now,
            last_updated: now,
            context,
        }
    }

    /// Derive the next state, keeping `last_changed` when the value is unchanged
    pub fn with_update(
        &self,
        new_state: impl Into<String>,
        new_attributes: HashMap<String, serde_json::Value>,
        context: Context,
    ) -> Self {
        let now = Utc::now();
        let new_state = new_state.into();
        let last_changed = if self.state == new_state {
            self.last_changed
        } else {
            now
        };

        Self {
            entity_id: self.entity_id.clone(),
            state: new_state,
            attributes: new_attributes,
            last_changed,
            last_updated: now,
            context,
        }
    }

    pub fn is_unavailable(&self) -> bool {
        self.state == STATE_UNAVAILABLE
    }

    pub fn is_unknown(&self) -> bool {
        self.state == STATE_UNKNOWN
    }

    /// The state parsed as a finite float, if it is one
    pub fn numeric_value(&self) -> Option<f64> {
        self.state.trim().parse::<f64>().ok().filter(|v| v.is_finite())
    }

    /// The `friendly_name` attribute, if set
    pub fn friendly_name(&self) -> Option<&str> {
        self.attributes
            .get(ATTR_FRIENDLY_NAME)
            .and_then(|v| v.as_str())
    }

    /// Get an attribute value by key
    pub fn attribute<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.attributes
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

impl PartialEq for State {
    fn eq(&self, other: &Self) -> bool {
        // Timestamps and context are not compared
        self.entity_id == other.entity_id
            && self.state == other.state
            && self.attributes == other.attributes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn state(value: &str) -> State {
        State::new(
            "sensor.test_1".parse().unwrap(),
            value,
            HashMap::new(),
            Context::new(),
        )
    }

    #[test]
    fn test_numeric_value() {
        assert_eq!(state("11").numeric_value(), Some(11.0));
        assert_eq!(state(" 15.2 ").numeric_value(), Some(15.2));
        assert_eq!(state("-3.8").numeric_value(), Some(-3.8));
        assert_eq!(state("string").numeric_value(), None);
        assert_eq!(state("unavailable").numeric_value(), None);
        assert_eq!(state("NaN").numeric_value(), None);
        assert_eq!(state("inf").numeric_value(), None);
    }

    #[test]
    fn test_sentinels() {
        assert!(state("unavailable").is_unavailable());
        assert!(state("unknown").is_unknown());
        assert!(!state("off").is_unavailable());
    }

    #[test]
    fn test_update_keeps_last_changed_for_same_value() {
        let first = state("on");
        let same = first.with_update("on", HashMap::new(), Context::new());
        assert_eq!(first.last_changed, same.last_changed);
        assert!(same.last_updated >= first.last_updated);

        let other = first.with_update("off", HashMap::new(), Context::new());
        assert!(other.last_changed >= first.last_changed);
        assert_eq!(other.state, "off");
    }

    #[test]
    fn test_friendly_name() {
        let mut s = state("on");
        assert_eq!(s.friendly_name(), None);
        s.attributes
            .insert(ATTR_FRIENDLY_NAME.to_string(), json!("Front door"));
        assert_eq!(s.friendly_name(), Some("Front door"));
        assert_eq!(s.attribute::<String>(ATTR_FRIENDLY_NAME).as_deref(), Some("Front door"));
    }
}

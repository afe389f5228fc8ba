//! The derived binary sensor: published value and attributes

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use ha_core::{ATTR_FRIENDLY_NAME, STATE_OFF, STATE_ON, STATE_UNAVAILABLE};
use serde_json::{json, Value};

use crate::config::LabelStateConfig;
use crate::constants::{ATTR_ENTITIES, ATTR_ENTITY_NAMES, ATTR_LABEL_NAME, ATTR_STATE_TYPE};

/// Result of the latest evaluation
#[derive(Debug, Clone, PartialEq)]
pub struct AggregationState {
    pub is_on: bool,
    /// The label did not exist at the last resolution
    pub label_missing: bool,
    pub last_modified: DateTime<Utc>,
}

impl AggregationState {
    pub fn new(is_on: bool, label_missing: bool) -> Self {
        Self {
            is_on,
            label_missing,
            last_modified: Utc::now(),
        }
    }

    /// `on`, `off`, or `unavailable` for a missing label
    pub fn state_value(&self) -> &'static str {
        match (self.label_missing, self.is_on) {
            (true, _) => STATE_UNAVAILABLE,
            (false, true) => STATE_ON,
            (false, false) => STATE_OFF,
        }
    }
}

/// Attributes of the binary sensor
///
/// `entities` and `entity_names` are parallel lists in entity ID order.
pub fn attributes(
    config: &LabelStateConfig,
    entities: Vec<String>,
    entity_names: Vec<String>,
    label_name: Option<String>,
) -> HashMap<String, Value> {
    let mut attributes = HashMap::from([
        (ATTR_FRIENDLY_NAME.to_string(), json!(config.name)),
        (ATTR_ENTITIES.to_string(), json!(entities)),
        (ATTR_ENTITY_NAMES.to_string(), json!(entity_names)),
        (ATTR_STATE_TYPE.to_string(), json!(config.state_type().as_str())),
    ]);
    if let Some(label_name) = label_name {
        attributes.insert(ATTR_LABEL_NAME.to_string(), json!(label_name));
    }
    attributes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuleConfig;

    #[test]
    fn test_state_value() {
        assert_eq!(AggregationState::new(true, false).state_value(), "on");
        assert_eq!(AggregationState::new(false, false).state_value(), "off");
        assert_eq!(AggregationState::new(false, true).state_value(), "unavailable");
    }

    #[test]
    fn test_attributes() {
        let config = LabelStateConfig {
            name: "Doors open".into(),
            label: "doors".into(),
            rule: RuleConfig::StateMatch {
                target_state: "on".into(),
            },
            extremum: None,
        };
        let attributes = attributes(
            &config,
            vec!["binary_sensor.back".into(), "binary_sensor.front".into()],
            vec!["Back".into(), "Front".into()],
            None,
        );
        assert_eq!(attributes["friendly_name"], "Doors open");
        assert_eq!(attributes["entities"], json!(["binary_sensor.back", "binary_sensor.front"]));
        assert_eq!(attributes["entity_names"], json!(["Back", "Front"]));
        assert_eq!(attributes["state_type"], "state");
        assert!(!attributes.contains_key("label_name"));
    }
}

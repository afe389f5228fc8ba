//! Extremum value sensor
//!
//! Follows the minimum or maximum of every numeric value reported by a
//! label member since setup or the last reset.

use std::collections::HashMap;

use ha_core::{EntityId, ATTR_FRIENDLY_NAME, STATE_UNKNOWN};
use serde_json::{json, Value};

use crate::config::Extremum;
use crate::constants::ATTR_EXTREMUM_ENTITY;
use crate::snapshot::TrackedEntity;

#[derive(Debug, Clone, PartialEq)]
pub struct ExtremumTracker {
    kind: Extremum,
    value: Option<f64>,
    /// Member that reported the current extremum
    source: Option<EntityId>,
}

impl ExtremumTracker {
    pub fn new(kind: Extremum) -> Self {
        Self {
            kind,
            value: None,
            source: None,
        }
    }

    pub fn kind(&self) -> Extremum {
        self.kind
    }

    pub fn value(&self) -> Option<f64> {
        self.value
    }

    /// Fold one member's state in; returns true when the extremum moved
    pub fn observe(&mut self, entity: &TrackedEntity) -> bool {
        match entity.numeric_value() {
            Some(v) if self.kind.beats(self.value, v) => {
                self.value = Some(v);
                self.source = Some(entity.entity_id.clone());
                true
            }
            _ => false,
        }
    }

    /// Forget everything, then fold in the given members
    pub fn reset<'a>(&mut self, entities: impl IntoIterator<Item = &'a TrackedEntity>) {
        self.value = None;
        self.source = None;
        for entity in entities {
            self.observe(entity);
        }
    }

    /// Published value; `unknown` before the first numeric report
    pub fn state_value(&self) -> String {
        self.value
            .map(format_float)
            .unwrap_or_else(|| STATE_UNKNOWN.to_string())
    }

    pub fn attributes(&self, name: &str) -> HashMap<String, Value> {
        let mut attributes = HashMap::from([(
            ATTR_FRIENDLY_NAME.to_string(),
            json!(format!("{} {}", name, self.kind.as_str())),
        )]);
        if let Some(source) = &self.source {
            attributes.insert(ATTR_EXTREMUM_ENTITY.to_string(), json!(source.to_string()));
        }
        attributes
    }
}

/// Integral floats keep one decimal: `6.0`, `15.2`
fn format_float(value: f64) -> String {
    let formatted = value.to_string();
    if formatted.contains(['.', 'e', 'E']) {
        formatted
    } else {
        format!("{formatted}.0")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracked(id: &str, value: &str) -> TrackedEntity {
        TrackedEntity::new(id.parse().unwrap(), Some(value.to_string()))
    }

    #[test]
    fn test_tracks_running_max() {
        let mut tracker = ExtremumTracker::new(Extremum::Max);
        assert_eq!(tracker.state_value(), "unknown");

        for (i, value) in ["17", "20", "15.2", "string", "5"].iter().enumerate() {
            tracker.observe(&tracked(&format!("sensor.test_{}", i + 1), value));
        }
        assert_eq!(tracker.value(), Some(20.0));
        assert_eq!(tracker.state_value(), "20.0");
        assert_eq!(tracker.attributes("Rooms")["extremum_entity_id"], "sensor.test_2");
        assert_eq!(tracker.attributes("Rooms")["friendly_name"], "Rooms max");
    }

    #[test]
    fn test_reset_reseeds() {
        let mut tracker = ExtremumTracker::new(Extremum::Min);
        tracker.observe(&tracked("sensor.a", "3.8"));
        tracker.reset([&tracked("sensor.a", "6"), &tracked("sensor.b", "9.2")]);
        assert_eq!(tracker.state_value(), "6.0");

        tracker.reset(std::iter::empty());
        assert_eq!(tracker.value(), None);
        assert!(!tracker.attributes("Rooms").contains_key("extremum_entity_id"));
    }

    #[test]
    fn test_format_float() {
        assert_eq!(format_float(6.0), "6.0");
        assert_eq!(format_float(-2.0), "-2.0");
        assert_eq!(format_float(15.2), "15.2");
    }
}

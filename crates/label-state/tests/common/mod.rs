//! Shared harness for the integration tests

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use ha_config_entries::ConfigEntry;
use ha_core::{Context, EntityId};
use label_state::{HomeAssistant, LabelStateIntegration, DOMAIN};
use serde_json::{Map, Value};

pub struct Harness {
    pub hass: HomeAssistant,
    pub integration: Arc<LabelStateIntegration>,
}

pub fn harness() -> Harness {
    let hass = HomeAssistant::new();
    let integration = LabelStateIntegration::setup(&hass);
    Harness { hass, integration }
}

pub fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => panic!("expected a JSON object, got {other}"),
    }
}

impl Harness {
    /// Create a label, returning its ID
    pub fn label(&self, name: &str) -> String {
        self.hass.registries.labels.create(name).unwrap().id.clone()
    }

    /// Register an entity carrying `labels` and give it a state
    pub fn entity(&self, entity_id: &str, labels: &[&str], state: &str) {
        self.hass.registries.entities.get_or_create(
            "test",
            entity_id,
            Some(&format!("unique_{entity_id}")),
            None,
        );
        self.set_labels(entity_id, labels);
        self.set_state(entity_id, state);
    }

    pub fn set_labels(&self, entity_id: &str, labels: &[&str]) {
        self.hass
            .registries
            .entities
            .set_labels(entity_id, labels.iter().copied())
            .unwrap();
    }

    pub fn set_state(&self, entity_id: &str, state: &str) {
        let id: EntityId = entity_id.parse().unwrap();
        self.hass
            .states
            .set(id, state, HashMap::new(), Context::new());
    }

    pub fn state(&self, entity_id: &str) -> Option<String> {
        self.hass.states.get_state(entity_id)
    }

    pub fn attribute(&self, entity_id: &str, key: &str) -> Option<Value> {
        self.hass
            .states
            .get(entity_id)
            .and_then(|s| s.attributes.get(key).cloned())
    }

    /// Add an entry with `options` and set it up
    pub async fn entry(&self, options: Value) -> ConfigEntry {
        let title = options["name"].as_str().unwrap_or_default().to_string();
        let entry = ConfigEntry::new(DOMAIN, title)
            .with_options(object(options))
            .with_version(1, 1);
        let entry = self.hass.config_entries.add(entry).unwrap();
        self.hass.config_entries.setup(&entry.entry_id).await.unwrap();
        self.block_till_done().await;
        self.hass.config_entries.get(&entry.entry_id).unwrap()
    }

    pub async fn block_till_done(&self) {
        self.integration.block_till_done().await;
    }
}

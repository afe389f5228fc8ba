//! YAML configuration of the server
//!
//! ```yaml
//! labels:
//!   - name: Doors
//! entities:
//!   - entity_id: binary_sensor.front_door
//!     name: Front door
//!     labels: [doors]
//!     state: "off"
//! label_state:
//!   - name: Doors open
//!     label: doors
//!     state_type: state
//!     state_to: "on"
//! ```

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use ha_config_entries::{ConfigEntry, ConfigEntrySource};
use ha_core::{Context, EntityId, ATTR_FRIENDLY_NAME};
use ha_registries::LabelRegistryError;
use label_state::constants::{CONFIG_VERSION, CONF_NAME};
use label_state::{HomeAssistant, DOMAIN};
use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ServerConfigError {
    #[error("failed to read file {path}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse YAML in {path}: {source}")]
    ParseYaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid entity_id '{entity_id}': {reason}")]
    InvalidEntityId { entity_id: String, reason: String },
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct LabelConfig {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct EntityConfig {
    pub entity_id: String,
    #[serde(default)]
    pub name: Option<String>,
    /// Label IDs
    #[serde(default)]
    pub labels: Vec<String>,
    /// Initial state; numbers and booleans are written as text
    #[serde(default)]
    pub state: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct ServerConfig {
    #[serde(default)]
    pub labels: Vec<LabelConfig>,
    #[serde(default)]
    pub entities: Vec<EntityConfig>,
    /// Options of one `label_state` entry each
    #[serde(default, rename = "label_state")]
    pub entries: Vec<Map<String, Value>>,
}

impl ServerConfig {
    pub fn load(path: &Path) -> Result<Self, ServerConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ServerConfigError::ReadFile {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content).map_err(|source| ServerConfigError::ParseYaml {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn parse(content: &str) -> Result<Self, serde_yaml::Error> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(content)
    }

    /// Create labels, entities and states, then add one entry per `label_state` item
    ///
    /// Entries are added but not set up.
    pub fn apply(&self, hass: &HomeAssistant) -> Result<Vec<ConfigEntry>, ServerConfigError> {
        for label in &self.labels {
            match hass.registries.labels.create(&label.name) {
                Ok(entry) => debug!(label_id = %entry.id, "Created label"),
                Err(LabelRegistryError::NameInUse { .. }) => {
                    warn!(name = %label.name, "Duplicate label in configuration")
                }
                Err(e) => warn!(name = %label.name, error = %e, "Cannot create label"),
            }
        }

        for entity in &self.entities {
            let entity_id: EntityId =
                entity
                    .entity_id
                    .parse()
                    .map_err(|e: ha_core::EntityIdError| ServerConfigError::InvalidEntityId {
                        entity_id: entity.entity_id.clone(),
                        reason: e.to_string(),
                    })?;
            let registries = &hass.registries;
            registries
                .entities
                .get_or_create("yaml", &entity.entity_id, Some(&entity.entity_id), None);
            let name = entity.name.clone();
            let labels = entity.labels.clone();
            if let Err(e) = registries.entities.update(&entity.entity_id, |e| {
                e.name = name;
                e.labels = labels.into_iter().collect();
            }) {
                warn!(entity_id = %entity.entity_id, error = %e, "Cannot update entity");
            }

            if let Some(state) = &entity.state {
                let mut attributes = HashMap::new();
                if let Some(name) = &entity.name {
                    attributes.insert(ATTR_FRIENDLY_NAME.to_string(), Value::from(name.clone()));
                }
                hass.states
                    .set(entity_id, state_text(state), attributes, Context::new());
            }
        }

        let mut added = Vec::new();
        for options in &self.entries {
            let title = options
                .get(CONF_NAME)
                .and_then(Value::as_str)
                .unwrap_or(DOMAIN)
                .to_string();
            let entry = ConfigEntry::new(DOMAIN, title)
                .with_options(options.clone())
                .with_source(ConfigEntrySource::Import)
                .with_version(CONFIG_VERSION, 1);
            match hass.config_entries.add(entry) {
                Ok(entry) => added.push(entry),
                Err(e) => warn!(error = %e, "Cannot add entry"),
            }
        }

        info!(
            labels = self.labels.len(),
            entities = self.entities.len(),
            entries = added.len(),
            "Configuration applied"
        );
        Ok(added)
    }
}

fn state_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => ha_core::STATE_UNKNOWN.to_string(),
        other => other.to_string(),
    }
}

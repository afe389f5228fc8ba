//! Label Registry
//!
//! Tracks the labels users attach to entities. Every create, update and
//! removal fires LABEL_REGISTRY_UPDATED.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use ha_core::events::{LabelRegistryUpdatedData, RegistryAction};
use ha_core::{slugify, Context};
use ha_event_bus::EventBus;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

/// Errors that can occur in the label registry
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LabelRegistryError {
    #[error("The name {name} ({normalized}) is already in use")]
    NameInUse { name: String, normalized: String },

    #[error("Label not found: {0}")]
    NotFound(String),
}

/// A registered label entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelEntry {
    #[serde(alias = "label_id")]
    pub id: String,

    /// Label name (e.g., "Doors", "Outdoor")
    pub name: String,

    /// Normalized name for lookups
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub normalized_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,

    /// Hex color code
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,

    #[serde(default = "Utc::now")]
    pub modified_at: DateTime<Utc>,
}

impl LabelEntry {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        let name = name.into();
        let now = Utc::now();
        Self {
            id: id.into(),
            normalized_name: Some(normalize_name(&name)),
            name,
            icon: None,
            color: None,
            description: None,
            created_at: now,
            modified_at: now,
        }
    }
}

/// Case-fold and drop whitespace
fn normalize_name(name: &str) -> String {
    name.to_lowercase().split_whitespace().collect()
}

/// Label Registry
///
/// Entries are stored as `Arc<LabelEntry>` to avoid cloning on reads.
pub struct LabelRegistry {
    /// Primary index: label_id -> LabelEntry
    by_id: DashMap<String, Arc<LabelEntry>>,

    /// Index: normalized_name -> label_id
    by_name: DashMap<String, String>,

    event_bus: Arc<EventBus>,
}

impl LabelRegistry {
    pub fn new(event_bus: Arc<EventBus>) -> Self {
        Self {
            by_id: DashMap::new(),
            by_name: DashMap::new(),
            event_bus,
        }
    }

    fn index_entry(&self, entry: Arc<LabelEntry>) {
        if let Some(ref normalized) = entry.normalized_name {
            self.by_name.insert(normalized.clone(), entry.id.clone());
        }
        self.by_id.insert(entry.id.clone(), entry);
    }

    fn fire(&self, action: RegistryAction, label_id: &str) {
        self.event_bus.fire_typed(
            LabelRegistryUpdatedData {
                action,
                label_id: label_id.to_string(),
            },
            Context::new(),
        );
    }

    pub fn get(&self, label_id: &str) -> Option<Arc<LabelEntry>> {
        self.by_id.get(label_id).map(|r| Arc::clone(r.value()))
    }

    /// Look a label up by name (case and whitespace insensitive)
    pub fn get_by_name(&self, name: &str) -> Option<Arc<LabelEntry>> {
        let label_id = self.by_name.get(&normalize_name(name))?.clone();
        self.get(&label_id)
    }

    pub fn contains(&self, label_id: &str) -> bool {
        self.by_id.contains_key(label_id)
    }

    /// Create a new label; its ID is the slugified name
    pub fn create(&self, name: &str) -> Result<Arc<LabelEntry>, LabelRegistryError> {
        let normalized = normalize_name(name);
        if self.by_name.contains_key(&normalized) {
            return Err(LabelRegistryError::NameInUse {
                name: name.to_string(),
                normalized,
            });
        }

        let entry = Arc::new(LabelEntry::new(self.generate_id(name), name));
        info!("Created label: {} ({})", name, entry.id);
        self.index_entry(Arc::clone(&entry));
        self.fire(RegistryAction::Create, &entry.id);
        Ok(entry)
    }

    /// Slugified name, suffixed `_2`, `_3`, ... on conflict
    pub fn generate_id(&self, name: &str) -> String {
        let base = match slugify(name) {
            slug if slug.is_empty() => "label".to_string(),
            slug => slug,
        };
        if !self.by_id.contains_key(&base) {
            return base;
        }
        (2..)
            .map(|n| format!("{}_{}", base, n))
            .find(|candidate| !self.by_id.contains_key(candidate))
            .unwrap_or(base)
    }

    /// Update a label
    ///
    /// `modified_at` only moves when a visible field changed.
    pub fn update<F>(&self, label_id: &str, f: F) -> Result<Arc<LabelEntry>, LabelRegistryError>
    where
        F: FnOnce(&mut LabelEntry),
    {
        let current = self
            .get(label_id)
            .ok_or_else(|| LabelRegistryError::NotFound(label_id.to_string()))?;

        let mut entry = (*current).clone();
        f(&mut entry);
        entry.id = current.id.clone();
        let normalized = normalize_name(&entry.name);
        entry.normalized_name = Some(normalized.clone());

        if entry.name != current.name {
            let taken = self
                .by_name
                .get(&normalized)
                .is_some_and(|owner| owner.value() != label_id);
            if taken {
                return Err(LabelRegistryError::NameInUse {
                    name: entry.name,
                    normalized,
                });
            }
        }

        let changed = entry.name != current.name
            || entry.icon != current.icon
            || entry.color != current.color
            || entry.description != current.description;
        if !changed {
            return Ok(current);
        }
        entry.modified_at = Utc::now();

        if let Some(ref old) = current.normalized_name {
            self.by_name.remove(old);
        }
        let entry = Arc::new(entry);
        self.index_entry(Arc::clone(&entry));
        self.fire(RegistryAction::Update, label_id);
        Ok(entry)
    }

    /// Remove a label
    pub fn remove(&self, label_id: &str) -> Option<Arc<LabelEntry>> {
        let (_, entry) = self.by_id.remove(label_id)?;
        if let Some(ref normalized) = entry.normalized_name {
            self.by_name.remove(normalized);
        }
        info!("Removed label: {}", label_id);
        self.fire(RegistryAction::Remove, label_id);
        Some(entry)
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// All labels sorted by name
    pub fn sorted_by_name(&self) -> Vec<Arc<LabelEntry>> {
        let mut labels: Vec<_> = self.by_id.iter().map(|r| Arc::clone(r.value())).collect();
        labels.sort_by(|a, b| a.name.cmp(&b.name));
        labels
    }
}

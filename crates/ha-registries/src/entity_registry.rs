//! Entity Registry
//!
//! Tracks registered entities with unique_id tracking and a label index.
//! Every mutation fires ENTITY_REGISTRY_UPDATED carrying the label set
//! before and after, which is what label membership listeners key on.

use std::collections::{BTreeSet, HashSet};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use ha_core::events::{EntityRegistryUpdatedData, RegistryAction};
use ha_core::Context;
use ha_event_bus::EventBus;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

/// Errors that can occur in the entity registry
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EntityRegistryError {
    #[error("Entity not found: {0}")]
    NotFound(String),

    #[error("Entity ID already registered: {0}")]
    EntityIdInUse(String),
}

/// Reason an entity was disabled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisabledBy {
    ConfigEntry,
    Integration,
    User,
}

/// A registered entity entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityEntry {
    /// Internal ULID
    pub id: String,
    /// Full entity ID (domain.object_id)
    pub entity_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unique_id: Option<String>,

    /// Component/platform that provides this entity
    pub platform: String,
    /// Config entry that created this entity
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_entry_id: Option<String>,

    /// User-set name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Platform default name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disabled_by: Option<DisabledBy>,

    /// Label IDs, kept sorted
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub labels: BTreeSet<String>,

    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub modified_at: DateTime<Utc>,
}

impl EntityEntry {
    pub fn new(
        entity_id: impl Into<String>,
        platform: impl Into<String>,
        unique_id: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: ulid::Ulid::new().to_string().to_lowercase(),
            entity_id: entity_id.into(),
            unique_id,
            platform: platform.into(),
            config_entry_id: None,
            name: None,
            original_name: None,
            disabled_by: None,
            labels: BTreeSet::new(),
            created_at: now,
            modified_at: now,
        }
    }

    pub fn domain(&self) -> &str {
        self.entity_id.split('.').next().unwrap_or(&self.entity_id)
    }

    /// User name, falling back to the platform name
    pub fn display_name(&self) -> Option<&str> {
        self.name.as_deref().or(self.original_name.as_deref())
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled_by.is_some()
    }
}

/// Entity Registry with multi-index support
///
/// Provides lookups by entity_id (primary), unique_id and label.
pub struct EntityRegistry {
    /// Primary index, insertion ordered
    by_entity_id: RwLock<IndexMap<String, Arc<EntityEntry>>>,

    /// Index: unique_id -> entity_id
    by_unique_id: DashMap<String, String>,

    /// Index: label_id -> set of entity_ids
    by_label: DashMap<String, HashSet<String>>,

    event_bus: Arc<EventBus>,
}

impl EntityRegistry {
    pub fn new(event_bus: Arc<EventBus>) -> Self {
        Self {
            by_entity_id: RwLock::new(IndexMap::new()),
            by_unique_id: DashMap::new(),
            by_label: DashMap::new(),
            event_bus,
        }
    }

    fn index_entry(&self, entry: Arc<EntityEntry>) {
        let entity_id = entry.entity_id.clone();

        if let Some(ref unique_id) = entry.unique_id {
            self.by_unique_id.insert(unique_id.clone(), entity_id.clone());
        }
        for label in &entry.labels {
            self.by_label
                .entry(label.clone())
                .or_default()
                .insert(entity_id.clone());
        }

        if let Ok(mut idx) = self.by_entity_id.write() {
            idx.insert(entity_id, entry);
        }
    }

    /// Remove an entry from the secondary indexes
    fn unindex_secondary(&self, entry: &EntityEntry) {
        if let Some(ref unique_id) = entry.unique_id {
            self.by_unique_id.remove(unique_id);
        }
        for label in &entry.labels {
            if let Some(mut ids) = self.by_label.get_mut(label) {
                ids.remove(&entry.entity_id);
            }
        }
    }

    fn fire(
        &self,
        action: RegistryAction,
        entity_id: &str,
        old_labels: BTreeSet<String>,
        new_labels: BTreeSet<String>,
    ) {
        self.event_bus.fire_typed(
            EntityRegistryUpdatedData {
                action,
                entity_id: entity_id.to_string(),
                old_labels,
                new_labels,
            },
            Context::new(),
        );
    }

    pub fn get(&self, entity_id: &str) -> Option<Arc<EntityEntry>> {
        self.by_entity_id
            .read()
            .ok()
            .and_then(|idx| idx.get(entity_id).cloned())
    }

    pub fn get_by_unique_id(&self, unique_id: &str) -> Option<Arc<EntityEntry>> {
        self.by_unique_id
            .get(unique_id)
            .and_then(|entity_id| self.get(&entity_id))
    }

    /// Entity IDs carrying a label, sorted
    pub fn entity_ids_for_label(&self, label_id: &str) -> BTreeSet<String> {
        self.by_label
            .get(label_id)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Get or create an entity entry
    ///
    /// An existing entry with the same unique_id wins over `entity_id`.
    pub fn get_or_create(
        &self,
        platform: &str,
        entity_id: &str,
        unique_id: Option<&str>,
        config_entry_id: Option<&str>,
    ) -> Arc<EntityEntry> {
        if let Some(existing) = unique_id.and_then(|uid| self.get_by_unique_id(uid)) {
            debug!("Found existing entity by unique_id: {}", existing.entity_id);
            return existing;
        }
        if let Some(existing) = self.get(entity_id) {
            return existing;
        }

        let mut entry = EntityEntry::new(entity_id, platform, unique_id.map(String::from));
        entry.config_entry_id = config_entry_id.map(String::from);

        let entry = Arc::new(entry);
        self.index_entry(Arc::clone(&entry));

        info!("Registered new entity: {}", entity_id);
        self.fire(
            RegistryAction::Create,
            entity_id,
            BTreeSet::new(),
            BTreeSet::new(),
        );
        entry
    }

    /// Update an entity entry
    ///
    /// The closure receives a mutable copy which then replaces the stored
    /// entry. Renaming the entity_id through the closure is not allowed.
    pub fn update<F>(&self, entity_id: &str, f: F) -> Result<Arc<EntityEntry>, EntityRegistryError>
    where
        F: FnOnce(&mut EntityEntry),
    {
        let current = self
            .get(entity_id)
            .ok_or_else(|| EntityRegistryError::NotFound(entity_id.to_string()))?;

        let mut entry = (*current).clone();
        f(&mut entry);
        entry.entity_id = current.entity_id.clone();
        entry.modified_at = Utc::now();

        self.unindex_secondary(&current);
        let entry = Arc::new(entry);
        self.index_entry(Arc::clone(&entry));

        self.fire(
            RegistryAction::Update,
            entity_id,
            current.labels.clone(),
            entry.labels.clone(),
        );
        Ok(entry)
    }

    /// Replace the label set of an entity
    pub fn set_labels<I, S>(
        &self,
        entity_id: &str,
        labels: I,
    ) -> Result<Arc<EntityEntry>, EntityRegistryError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let labels: BTreeSet<String> = labels.into_iter().map(Into::into).collect();
        self.update(entity_id, |entry| entry.labels = labels)
    }

    /// Drop a label from every entity carrying it
    ///
    /// Returns the entity IDs that were touched.
    pub fn strip_label(&self, label_id: &str) -> Vec<String> {
        let carriers = self.entity_ids_for_label(label_id);
        carriers
            .into_iter()
            .filter(|entity_id| {
                self.update(entity_id, |entry| {
                    entry.labels.remove(label_id);
                })
                .is_ok()
            })
            .collect()
    }

    pub fn remove(&self, entity_id: &str) -> Option<Arc<EntityEntry>> {
        let entry = self
            .by_entity_id
            .write()
            .ok()
            .and_then(|mut idx| idx.shift_remove(entity_id))?;

        self.unindex_secondary(&entry);
        info!("Removed entity: {}", entity_id);
        self.fire(
            RegistryAction::Remove,
            entity_id,
            entry.labels.clone(),
            BTreeSet::new(),
        );
        Some(entry)
    }

    pub fn entity_ids(&self) -> Vec<String> {
        self.by_entity_id
            .read()
            .map(|idx| idx.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.by_entity_id.read().map(|idx| idx.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_registered(&self, entity_id: &str) -> bool {
        self.by_entity_id
            .read()
            .map(|idx| idx.contains_key(entity_id))
            .unwrap_or(false)
    }
}

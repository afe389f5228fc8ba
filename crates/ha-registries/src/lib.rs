//! Home Assistant Registries
//!
//! In-memory registries for:
//! - Entities (EntityRegistry)
//! - Labels (LabelRegistry)
//!
//! Both publish `*_registry_updated` events on the shared event bus.

pub mod entity_registry;
pub mod label_registry;

pub use entity_registry::{DisabledBy, EntityEntry, EntityRegistry, EntityRegistryError};
pub use label_registry::{LabelEntry, LabelRegistry, LabelRegistryError};

use std::sync::{Arc, Weak};

use ha_core::events::{LabelRegistryUpdatedData, RegistryAction};
use ha_event_bus::{EventBus, ListenerId};
use tracing::debug;

/// All registries bundled together
pub struct Registries {
    pub entities: Arc<EntityRegistry>,
    pub labels: Arc<LabelRegistry>,
    label_cleanup: ListenerId,
    event_bus: Arc<EventBus>,
}

impl Registries {
    /// Create the registries on a shared bus
    ///
    /// Removing a label strips it from every entity that carried it.
    pub fn new(event_bus: Arc<EventBus>) -> Self {
        let entities = Arc::new(EntityRegistry::new(event_bus.clone()));
        let labels = Arc::new(LabelRegistry::new(event_bus.clone()));

        let weak: Weak<EntityRegistry> = Arc::downgrade(&entities);
        let label_cleanup = event_bus.listen_typed::<LabelRegistryUpdatedData>(move |event| {
            if event.data.action != RegistryAction::Remove {
                return;
            }
            if let Some(entities) = weak.upgrade() {
                let touched = entities.strip_label(&event.data.label_id);
                debug!(label_id = %event.data.label_id, count = touched.len(), "Stripped removed label");
            }
        });

        Self {
            entities,
            labels,
            label_cleanup,
            event_bus,
        }
    }
}

impl Drop for Registries {
    fn drop(&mut self) {
        self.event_bus.remove_listener(self.label_cleanup);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn test_removing_label_strips_entities() {
        let bus = Arc::new(EventBus::new());
        let registries = Registries::new(bus);

        let label = registries.labels.create("Doors").unwrap();
        registries.entities.get_or_create("demo", "binary_sensor.front", None, None);
        registries
            .entities
            .set_labels("binary_sensor.front", [label.id.clone()])
            .unwrap();
        assert_eq!(registries.entities.entity_ids_for_label(&label.id).len(), 1);

        registries.labels.remove(&label.id);

        assert!(registries.entities.entity_ids_for_label(&label.id).is_empty());
        assert_eq!(
            registries.entities.get("binary_sensor.front").unwrap().labels,
            BTreeSet::new()
        );
    }
}

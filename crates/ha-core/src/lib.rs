//! Core types shared by the host runtime and the label_state integration
//!
//! EntityId, State, Event, Context and ServiceCall, plus the typed payloads
//! for the events the integration listens to.

mod context;
mod entity_id;
mod event;
mod service_call;
mod slug;
mod state;

pub use context::Context;
pub use entity_id::{EntityId, EntityIdError};
pub use event::{Event, EventData, EventOrigin, EventType};
pub use service_call::{ServiceCall, SupportsResponse};
pub use slug::slugify;
pub use state::State;

/// Maximum length for a state value
pub const MAX_STATE_LENGTH: usize = 255;

/// State value for an entity whose value is not known yet
pub const STATE_UNKNOWN: &str = "unknown";

/// State value for an entity that cannot currently be reached
pub const STATE_UNAVAILABLE: &str = "unavailable";

/// Binary "on" state
pub const STATE_ON: &str = "on";

/// Binary "off" state
pub const STATE_OFF: &str = "off";

/// Attribute holding the display name of an entity
pub const ATTR_FRIENDLY_NAME: &str = "friendly_name";

/// Standard event types and their payloads
pub mod events {
    use std::collections::BTreeSet;

    use serde::{Deserialize, Serialize};

    use super::*;

    /// Event type for state changes
    pub const STATE_CHANGED: &str = "state_changed";

    /// Event type for entity registry mutations
    pub const ENTITY_REGISTRY_UPDATED: &str = "entity_registry_updated";

    /// Event type for label registry mutations
    pub const LABEL_REGISTRY_UPDATED: &str = "label_registry_updated";

    /// Data for STATE_CHANGED events
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct StateChangedData {
        pub entity_id: EntityId,
        pub old_state: Option<State>,
        pub new_state: Option<State>,
    }

    impl EventData for StateChangedData {
        fn event_type() -> &'static str {
            STATE_CHANGED
        }
    }

    /// What happened to a registry entry
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum RegistryAction {
        Create,
        Update,
        Remove,
    }

    /// Data for ENTITY_REGISTRY_UPDATED events
    ///
    /// `old_labels` and `new_labels` carry the label set before and after the
    /// mutation so listeners can tell whether a given label was touched.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct EntityRegistryUpdatedData {
        pub action: RegistryAction,
        pub entity_id: String,
        #[serde(default)]
        pub old_labels: BTreeSet<String>,
        #[serde(default)]
        pub new_labels: BTreeSet<String>,
    }

    impl EntityRegistryUpdatedData {
        /// Whether the mutation added or removed `label_id` on the entity
        pub fn touches_label(&self, label_id: &str) -> bool {
            self.old_labels.contains(label_id) || self.new_labels.contains(label_id)
        }
    }

    impl EventData for EntityRegistryUpdatedData {
        fn event_type() -> &'static str {
            ENTITY_REGISTRY_UPDATED
        }
    }

    /// Data for LABEL_REGISTRY_UPDATED events
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct LabelRegistryUpdatedData {
        pub action: RegistryAction,
        pub label_id: String,
    }

    impl EventData for LabelRegistryUpdatedData {
        fn event_type() -> &'static str {
            LABEL_REGISTRY_UPDATED
        }
    }
}

//! In-process runtime bundle

use std::sync::Arc;

use ha_config_entries::ConfigEntries;
use ha_event_bus::EventBus;
use ha_registries::Registries;
use ha_service_registry::ServiceRegistry;
use ha_state_machine::StateMachine;

use crate::host::HassHost;

/// The runtime the integration is loaded into
pub struct HomeAssistant {
    /// Event bus for pub/sub communication
    pub bus: Arc<EventBus>,
    /// State machine for entity states
    pub states: Arc<StateMachine>,
    /// Entity and label registries
    pub registries: Registries,
    /// Service registry for service calls
    pub services: Arc<ServiceRegistry>,
    pub config_entries: Arc<ConfigEntries>,
    host: Arc<HassHost>,
}

impl HomeAssistant {
    pub fn new() -> Self {
        let bus = Arc::new(EventBus::new());
        let states = Arc::new(StateMachine::new(bus.clone()));
        let registries = Registries::new(bus.clone());
        let host = Arc::new(HassHost::new(
            bus.clone(),
            states.clone(),
            registries.entities.clone(),
            registries.labels.clone(),
        ));

        Self {
            bus,
            states,
            registries,
            services: Arc::new(ServiceRegistry::new()),
            config_entries: ConfigEntries::new(),
            host,
        }
    }

    /// Shared [`HassHost`] handed to every controller
    pub fn host(&self) -> Arc<HassHost> {
        Arc::clone(&self.host)
    }
}

impl Default for HomeAssistant {
    fn default() -> Self {
        Self::new()
    }
}

//! label_state integration
//!
//! Aggregates the states of every entity carrying a label into one binary
//! sensor, and optionally a sensor tracking the minimum or maximum of their
//! numeric values.
//!
//! # Key Types
//!
//! - [`LabelStateConfig`] - Validated entry options
//! - [`ControllerHandle`] - One running aggregation per entry
//! - [`LabelHost`] - Everything the aggregation needs from the runtime
//! - [`LabelStateIntegration`] - Entry setup and unload, the reset service
//! - [`FlowManager`] - Config and options flows

pub mod binary_sensor;
pub mod config;
pub mod config_flow;
pub mod constants;
pub mod controller;
pub mod evaluator;
pub mod hass;
pub mod host;
pub mod resolver;
pub mod sensor;
pub mod services;
pub mod snapshot;

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::join_all;
use ha_config_entries::{ConfigEntry, EntryHandler, SetupFailure};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

pub use binary_sensor::AggregationState;
pub use config::{ConfigValidationError, Extremum, LabelStateConfig, RuleConfig, StateType};
pub use config_flow::{FieldSpec, FlowError, FlowManager, FlowResult, Selector};
pub use constants::{Manifest, DOMAIN};
pub use controller::{ControllerError, ControllerHandle, ControllerPhase};
pub use hass::HomeAssistant;
pub use host::{HassHost, LabelHost, Membership, SubscriptionError, SubscriptionHandle};

#[derive(Debug, Error)]
pub enum SetupError {
    #[error(transparent)]
    Config(#[from] ConfigValidationError),

    #[error(transparent)]
    Subscription(SubscriptionError),

    #[error(transparent)]
    Controller(ControllerError),
}

impl From<ControllerError> for SetupError {
    fn from(e: ControllerError) -> Self {
        match e {
            ControllerError::Subscription(e) => SetupError::Subscription(e),
            other => SetupError::Controller(other),
        }
    }
}

impl From<SetupError> for SetupFailure {
    fn from(e: SetupError) -> Self {
        match e {
            SetupError::Subscription(_) => SetupFailure::NotReady(e.to_string()),
            _ => SetupFailure::Failed(e.to_string()),
        }
    }
}

/// The integration: one controller per loaded entry
pub struct LabelStateIntegration {
    host: Arc<dyn LabelHost>,
    /// entry_id -> controller
    controllers: DashMap<String, Arc<ControllerHandle>>,
}

impl LabelStateIntegration {
    pub fn new(host: Arc<dyn LabelHost>) -> Arc<Self> {
        Arc::new(Self {
            host,
            controllers: DashMap::new(),
        })
    }

    /// Load the integration into a runtime
    ///
    /// Registers the entry handler and the reset service. Entries already
    /// present are not set up; callers run `config_entries.setup_all()`.
    pub fn setup(hass: &HomeAssistant) -> Arc<Self> {
        let integration = Self::new(hass.host());
        hass.config_entries
            .register_handler(DOMAIN, integration.clone());
        services::register(&hass.services, &integration);
        info!(domain = DOMAIN, "Integration loaded");
        integration
    }

    /// Unload every entry of the domain and remove the integration's services
    pub async fn shutdown(&self, hass: &HomeAssistant) {
        for entry in hass.config_entries.get_by_domain(DOMAIN) {
            if let Err(e) = hass.config_entries.unload(&entry.entry_id).await {
                warn!(entry_id = %entry.entry_id, error = %e, "Failed to unload entry");
            }
        }
        let removed = hass.services.unregister_domain(DOMAIN);
        info!(services = removed, "Integration unloaded");
    }

    pub async fn setup_entry_config(
        &self,
        entry_id: &str,
        config: LabelStateConfig,
    ) -> Result<(), SetupError> {
        if let Some((_, stale)) = self.controllers.remove(entry_id) {
            warn!(entry_id, "Replacing controller that was never unloaded");
            if let Err(e) = stale.shutdown().await {
                debug!(entry_id, error = %e, "Stale controller already stopped");
            }
        }

        let handle = ControllerHandle::start(Arc::clone(&self.host), config).await?;
        self.controllers
            .insert(entry_id.to_string(), Arc::new(handle));
        Ok(())
    }

    pub fn controller(&self, entry_id: &str) -> Option<Arc<ControllerHandle>> {
        self.controllers.get(entry_id).map(|c| Arc::clone(c.value()))
    }

    pub fn controller_count(&self) -> usize {
        self.controllers.len()
    }

    fn handles(&self) -> Vec<Arc<ControllerHandle>> {
        self.controllers.iter().map(|c| Arc::clone(c.value())).collect()
    }

    /// Wait until every controller has drained its queue
    pub async fn block_till_done(&self) {
        let handles = self.handles();
        let results = join_all(handles.iter().map(|handle| handle.block_till_done())).await;
        for (handle, result) in handles.iter().zip(results) {
            if let Err(e) = result {
                debug!(entity_id = %handle.binary_sensor_id(), error = %e, "Controller stopped");
            }
        }
    }

    /// Reset the extremum of every controller publishing one of `entity_ids`
    ///
    /// Returns once the resets have been applied.
    #[instrument(skip(self))]
    pub async fn reset(&self, entity_ids: &[String]) -> Result<(), ControllerError> {
        for entity_id in entity_ids {
            let matching: Vec<_> = self
                .handles()
                .into_iter()
                .filter(|handle| handle.publishes(entity_id))
                .collect();
            if matching.is_empty() {
                warn!(entity_id = %entity_id, "No {} entity to reset", DOMAIN);
            }
            for handle in matching {
                handle.reset()?;
                handle.block_till_done().await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl EntryHandler for LabelStateIntegration {
    #[instrument(skip_all, fields(entry_id = %entry.entry_id, title = %entry.title))]
    async fn setup_entry(&self, entry: &ConfigEntry) -> Result<(), SetupFailure> {
        let config = LabelStateConfig::from_options(&entry.options).map_err(SetupError::from)?;
        self.setup_entry_config(&entry.entry_id, config).await?;
        Ok(())
    }

    #[instrument(skip_all, fields(entry_id = %entry.entry_id))]
    async fn unload_entry(&self, entry: &ConfigEntry) -> Result<(), String> {
        let Some((_, handle)) = self.controllers.remove(&entry.entry_id) else {
            return Ok(());
        };
        handle.shutdown().await.map_err(|e| e.to_string())
    }
}

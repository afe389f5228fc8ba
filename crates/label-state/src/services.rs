//! `label_state.*` services

use std::sync::{Arc, Weak};

use ha_core::{ServiceCall, SupportsResponse};
use ha_service_registry::{ServiceDescription, ServiceError, ServiceRegistry};
use tracing::{debug, instrument};

use crate::constants::{DOMAIN, SERVICE_RESET};
use crate::LabelStateIntegration;

/// Register the reset service
///
/// Holds only a weak reference so the registry never keeps the integration
/// alive.
pub fn register(services: &ServiceRegistry, integration: &Arc<LabelStateIntegration>) {
    let mut description = ServiceDescription::new(DOMAIN, SERVICE_RESET);
    description.name = Some("Reset".into());
    description.description =
        Some("Reset the tracked minimum or maximum to the current member values".into());
    description.supports_response = SupportsResponse::None;

    let integration = Arc::downgrade(integration);
    services.register_with_description(description, move |call| {
        handle_reset(integration.clone(), call)
    });
    debug!("Registered {}.{}", DOMAIN, SERVICE_RESET);
}

#[instrument(skip_all, fields(service = %call.service_id()))]
async fn handle_reset(
    integration: Weak<LabelStateIntegration>,
    call: ServiceCall,
) -> Result<Option<serde_json::Value>, ServiceError> {
    let targets = call.entity_ids();
    if targets.is_empty() {
        return Err(ServiceError::InvalidData("entity_id is required".into()));
    }

    let integration = integration
        .upgrade()
        .ok_or_else(|| ServiceError::CallFailed(format!("{DOMAIN} is not loaded")))?;

    integration
        .reset(&targets)
        .await
        .map_err(|e| ServiceError::CallFailed(e.to_string()))?;
    Ok(None)
}

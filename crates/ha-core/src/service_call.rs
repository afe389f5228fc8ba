//! Service call type for invoking services

use crate::Context;
use serde::{Deserialize, Serialize};

/// A call to a registered service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceCall {
    /// The domain the service belongs to (e.g., "label_state")
    pub domain: String,

    /// The service name (e.g., "reset")
    pub service: String,

    /// Data passed to the service
    pub service_data: serde_json::Value,

    /// Context tracking who initiated this call
    pub context: Context,
}

impl ServiceCall {
    pub fn new(
        domain: impl Into<String>,
        service: impl Into<String>,
        service_data: serde_json::Value,
        context: Context,
    ) -> Self {
        Self {
            domain: domain.into(),
            service: service.into(),
            service_data,
            context,
        }
    }

    /// Get the full service identifier (domain.service)
    pub fn service_id(&self) -> String {
        format!("{}.{}", self.domain, self.service)
    }

    /// Target entity IDs from `entity_id` or `target.entity_id`
    ///
    /// Both accept a single string or a list of strings.
    pub fn entity_ids(&self) -> Vec<String> {
        let value = self.service_data.get("entity_id").or_else(|| {
            self.service_data
                .get("target")
                .and_then(|target| target.get("entity_id"))
        });

        match value {
            Some(serde_json::Value::String(s)) => vec![s.clone()],
            Some(serde_json::Value::Array(arr)) => arr
                .iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect(),
            _ => vec![],
        }
    }
}

/// Whether a service supports returning a response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SupportsResponse {
    #[default]
    None,
    Optional,
    Only,
}

//! Service registry with async handlers
//!
//! Services are keyed by `domain.service`. Integrations register a handler
//! once and callers route through [`ServiceRegistry::call`].

use dashmap::DashMap;
use ha_core::{Context, ServiceCall, SupportsResponse};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, instrument, warn};

/// Result type for service calls
pub type ServiceResult = Result<Option<serde_json::Value>, ServiceError>;

/// Future type for async service handlers
pub type ServiceFuture = Pin<Box<dyn Future<Output = ServiceResult> + Send>>;

/// Service handler function type
pub type ServiceHandler = Arc<dyn Fn(ServiceCall) -> ServiceFuture + Send + Sync>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ServiceError {
    #[error("service not found: {domain}.{service}")]
    NotFound { domain: String, service: String },

    #[error("service call failed: {0}")]
    CallFailed(String),

    #[error("invalid service data: {0}")]
    InvalidData(String),

    #[error("service does not support responses")]
    ResponseNotSupported,
}

/// Information about a registered service
#[derive(Debug, Clone)]
pub struct ServiceDescription {
    pub domain: String,
    pub service: String,
    /// Human-readable name
    pub name: Option<String>,
    pub description: Option<String>,
    pub supports_response: SupportsResponse,
}

impl ServiceDescription {
    pub fn new(domain: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            service: service.into(),
            name: None,
            description: None,
            supports_response: SupportsResponse::None,
        }
    }

    fn key(&self) -> String {
        format!("{}.{}", self.domain, self.service)
    }
}

struct RegisteredService {
    handler: ServiceHandler,
    description: ServiceDescription,
}

/// The service registry manages all registered services
pub struct ServiceRegistry {
    /// Services indexed by "domain.service" key
    services: DashMap<String, RegisteredService>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self {
            services: DashMap::new(),
        }
    }

    /// Register a service, replacing any previous handler under the same key
    pub fn register<F, Fut>(
        &self,
        domain: impl Into<String>,
        service: impl Into<String>,
        handler: F,
        supports_response: SupportsResponse,
    ) where
        F: Fn(ServiceCall) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ServiceResult> + Send + 'static,
    {
        let mut description = ServiceDescription::new(domain, service);
        description.supports_response = supports_response;
        self.register_with_description(description, handler);
    }

    /// Register a service with full description
    #[instrument(skip(self, handler), fields(service = %description.key()))]
    pub fn register_with_description<F, Fut>(&self, description: ServiceDescription, handler: F)
    where
        F: Fn(ServiceCall) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ServiceResult> + Send + 'static,
    {
        debug!("Registering service");

        let handler: ServiceHandler =
            Arc::new(move |call| Box::pin(handler(call)) as ServiceFuture);

        self.services.insert(
            description.key(),
            RegisteredService {
                handler,
                description,
            },
        );
    }

    /// Call a service
    ///
    /// The response is only returned when `return_response` is set.
    #[instrument(skip(self, service_data, context))]
    pub async fn call(
        &self,
        domain: &str,
        service: &str,
        service_data: serde_json::Value,
        context: Context,
        return_response: bool,
    ) -> ServiceResult {
        let key = format!("{}.{}", domain, service);

        let handler = {
            let registered = self.services.get(&key).ok_or_else(|| {
                warn!(domain = %domain, service = %service, "Service not found");
                ServiceError::NotFound {
                    domain: domain.to_string(),
                    service: service.to_string(),
                }
            })?;

            if return_response
                && registered.description.supports_response == SupportsResponse::None
            {
                return Err(ServiceError::ResponseNotSupported);
            }
            // Release the map guard before awaiting the handler
            registered.handler.clone()
        };

        debug!(domain = %domain, service = %service, "Calling service");
        let result = handler(ServiceCall::new(domain, service, service_data, context)).await?;

        Ok(if return_response { result } else { None })
    }

    pub fn has_service(&self, domain: &str, service: &str) -> bool {
        self.services.contains_key(&format!("{}.{}", domain, service))
    }

    /// Unregister all services for a domain
    #[instrument(skip(self))]
    pub fn unregister_domain(&self, domain: &str) -> usize {
        let before = self.services.len();
        self.services.retain(|_, s| s.description.domain != domain);
        let count = before - self.services.len();
        debug!(count, "Unregistered domain services");
        count
    }

    pub fn service_count(&self) -> usize {
        self.services.len()
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

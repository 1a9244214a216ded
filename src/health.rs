use async_trait::async_trait;
use axum::{
    Json,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::app::AppContext;
use crate::billing::EntitlementStore;

/// Health check status
#[non_exhaustive]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Health check result for a single component
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub name: String,
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Overall health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub checks: Vec<ComponentHealth>,
}

impl IntoResponse for HealthResponse {
    fn into_response(self) -> Response {
        let status_code = match self.status {
            HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
            HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        };

        (status_code, Json(self)).into_response()
    }
}

#[async_trait]
pub trait HealthCheck: Send + Sync {
    fn name(&self) -> &str;
    async fn check(&self) -> ComponentHealth;
}

/// Probes the entitlement store with a read.
pub struct StoreHealthCheck {
    store: Arc<dyn EntitlementStore>,
}

impl StoreHealthCheck {
    pub fn new(store: Arc<dyn EntitlementStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl HealthCheck for StoreHealthCheck {
    fn name(&self) -> &str {
        "entitlement_store"
    }

    async fn check(&self) -> ComponentHealth {
        let (status, message) = match self.store.is_event_processed("health-check").await {
            Ok(_) => (HealthStatus::Healthy, None),
            Err(e) => (HealthStatus::Unhealthy, Some(e.to_string())),
        };
        ComponentHealth {
            name: self.name().to_string(),
            status,
            message,
        }
    }
}

/// Reports whether Stripe credentials were configured at startup.
///
/// A deployment without them still serves entitlement reads, so this is
/// only ever degraded.
pub struct ProviderHealthCheck {
    configured: bool,
}

impl ProviderHealthCheck {
    pub fn new(configured: bool) -> Self {
        Self { configured }
    }
}

#[async_trait]
impl HealthCheck for ProviderHealthCheck {
    fn name(&self) -> &str {
        "billing_provider"
    }

    async fn check(&self) -> ComponentHealth {
        let (status, message) = if self.configured {
            (HealthStatus::Healthy, None)
        } else {
            (
                HealthStatus::Degraded,
                Some("STRIPE_SECRET_KEY not configured".to_string()),
            )
        };
        ComponentHealth {
            name: self.name().to_string(),
            status,
            message,
        }
    }
}

/// Health check manager that runs all registered checks
#[derive(Default)]
pub struct HealthChecker {
    checks: Vec<Arc<dyn HealthCheck>>,
}

impl HealthChecker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_context(context: &AppContext) -> Self {
        Self::new()
            .with_check(Arc::new(StoreHealthCheck::new(context.store.clone())))
            .with_check(Arc::new(ProviderHealthCheck::new(
                context.provider_configured(),
            )))
    }

    pub fn with_check(mut self, check: Arc<dyn HealthCheck>) -> Self {
        self.checks.push(check);
        self
    }

    pub async fn check_health(&self) -> HealthResponse {
        let mut checks = Vec::with_capacity(self.checks.len());
        let mut overall_status = HealthStatus::Healthy;

        for check in &self.checks {
            let result = check.check().await;

            match result.status {
                HealthStatus::Unhealthy => overall_status = HealthStatus::Unhealthy,
                HealthStatus::Degraded if overall_status == HealthStatus::Healthy => {
                    overall_status = HealthStatus::Degraded
                }
                _ => {}
            }

            checks.push(result);
        }

        HealthResponse {
            status: overall_status,
            checks,
        }
    }
}

/// Handler for the health endpoint
pub async fn health_handler(State(context): State<AppContext>) -> HealthResponse {
    HealthChecker::for_context(&context).check_health().await
}

//! Stripe billing portal sessions.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::audit::{BillingAuditEvent, BillingAuditLogger, NoOpAuditLogger};
use super::error::BillingError;
use super::provider::BillingProvider;
use super::storage::EntitlementStore;
use crate::error::Result;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortalRequest {
    pub user_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortalResponse {
    pub url: String,
}

/// Creates billing portal sessions for users with a provider customer.
pub struct PortalInitiator {
    store: Arc<dyn EntitlementStore>,
    provider: Option<Arc<dyn BillingProvider>>,
    app_url: Option<String>,
    audit: Arc<dyn BillingAuditLogger>,
}

impl PortalInitiator {
    #[must_use]
    pub fn new(store: Arc<dyn EntitlementStore>) -> Self {
        Self {
            store,
            provider: None,
            app_url: None,
            audit: Arc::new(NoOpAuditLogger),
        }
    }

    #[must_use]
    pub fn with_provider(mut self, provider: Arc<dyn BillingProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    #[must_use]
    pub fn with_app_url(mut self, app_url: impl Into<String>) -> Self {
        self.app_url = Some(app_url.into().trim_end_matches('/').to_string());
        self
    }

    #[must_use]
    pub fn with_audit_logger(mut self, audit: Arc<dyn BillingAuditLogger>) -> Self {
        self.audit = audit;
        self
    }

    /// Create a portal session returning to the billing settings page.
    pub async fn create_portal_session(&self, user_id: &str) -> Result<PortalResponse> {
        if user_id.trim().is_empty() {
            return Err(BillingError::MissingField { field: "userId" }.into());
        }

        let customer_id = self
            .store
            .get_entitlement(user_id)
            .await?
            .and_then(|record| record.billing_customer_ref)
            .ok_or_else(|| BillingError::NoCustomer {
                user_id: user_id.to_string(),
            })?;

        let app_url = self
            .app_url
            .as_deref()
            .ok_or(BillingError::NotConfigured { setting: "APP_URL" })?;
        let provider = self.provider.as_ref().ok_or(BillingError::NotConfigured {
            setting: "STRIPE_SECRET_KEY",
        })?;

        let session = provider
            .create_portal_session(&customer_id, &format!("{}/settings/billing", app_url))
            .await?;

        self.audit
            .log(BillingAuditEvent::PortalSessionCreated {
                user_id: user_id.to_string(),
                session_id: session.id,
            })
            .await;

        Ok(PortalResponse { url: session.url })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::provider::test::MockBillingProvider;
    use crate::billing::storage::{EntitlementRecord, InMemoryEntitlementStore};
    use crate::error::InkflowError;

    fn initiator(store: &InMemoryEntitlementStore) -> PortalInitiator {
        PortalInitiator::new(Arc::new(store.clone()))
            .with_provider(Arc::new(MockBillingProvider::new()))
            .with_app_url("https://app.inkflow.test")
    }

    #[tokio::test]
    async fn test_create_portal_session() {
        let store = InMemoryEntitlementStore::new();
        let mut record = EntitlementRecord::new("user_1", 1_700_000_000);
        record.billing_customer_ref = Some("cus_1".to_string());
        store.insert(record).unwrap();

        let response = initiator(&store).create_portal_session("user_1").await.unwrap();

        assert!(response.url.contains("customer=cus_1"));
        assert!(response.url.contains("https://app.inkflow.test/settings/billing"));
    }

    #[tokio::test]
    async fn test_no_customer_is_not_found() {
        let store = InMemoryEntitlementStore::new();
        store
            .insert(EntitlementRecord::new("user_1", 1_700_000_000))
            .unwrap();

        let result = initiator(&store).create_portal_session("user_1").await;
        match result {
            Err(InkflowError::NotFound(message)) => assert_eq!(message, "No active subscription"),
            other => panic!("expected not found, got {:?}", other),
        }

        let result = initiator(&store).create_portal_session("ghost").await;
        assert!(matches!(result, Err(InkflowError::NotFound(_))));
    }
}

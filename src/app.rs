use std::sync::Arc;

use crate::billing::{
    BillingAuditLogger, BillingEventReconciler, BillingProvider, CheckoutInitiator,
    DriftReconciler, EntitlementQueryService, EntitlementStore, InMemoryEntitlementStore,
    NoOpAuditLogger, PortalInitiator, PriceCatalog,
};
use crate::config::BillingConfig;

/// Application context holding the billing services shared by all handlers.
///
/// Every service holds the same store handle, so a webhook applied through
/// the reconciler is immediately visible to entitlement reads.
#[derive(Clone)]
pub struct AppContext {
    pub store: Arc<dyn EntitlementStore>,
    pub reconciler: Arc<BillingEventReconciler>,
    pub entitlements: EntitlementQueryService,
    pub checkout: Arc<CheckoutInitiator>,
    pub portal: Arc<PortalInitiator>,
    pub drift: Arc<DriftReconciler>,
    provider_configured: bool,
}

impl AppContext {
    /// Context backed by an in-memory store with no provider configured.
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> AppContextBuilder {
        AppContextBuilder::new()
    }

    /// Whether a live billing provider was wired in.
    pub fn provider_configured(&self) -> bool {
        self.provider_configured
    }
}

impl Default for AppContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for AppContext with fluent API
#[must_use = "builder does nothing until you call build()"]
pub struct AppContextBuilder {
    billing: BillingConfig,
    store: Option<Arc<dyn EntitlementStore>>,
    provider: Option<Arc<dyn BillingProvider>>,
    audit: Option<Arc<dyn BillingAuditLogger>>,
}

impl AppContextBuilder {
    pub fn new() -> Self {
        Self {
            billing: BillingConfig::default(),
            store: None,
            provider: None,
            audit: None,
        }
    }

    /// Price ids, redirect base URL, trial length, webhook secret and grace period.
    pub fn with_billing_config(mut self, billing: &BillingConfig) -> Self {
        self.billing = billing.clone();
        self
    }

    /// Set the entitlement store (defaults to an in-memory store)
    pub fn with_store(mut self, store: Arc<dyn EntitlementStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the billing provider
    ///
    /// # Example
    /// ```ignore
    /// let provider = Arc::new(StripeBillingProvider::new(key, Duration::from_secs(30))?);
    /// let context = AppContext::builder()
    ///     .with_provider(provider)
    ///     .build();
    /// ```
    pub fn with_provider(mut self, provider: Arc<dyn BillingProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn with_audit_logger(mut self, audit: Arc<dyn BillingAuditLogger>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn build(self) -> AppContext {
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryEntitlementStore::new()));
        let audit = self.audit.unwrap_or_else(|| Arc::new(NoOpAuditLogger));
        let catalog = PriceCatalog::from_config(&self.billing);

        let mut reconciler = BillingEventReconciler::new(store.clone(), catalog.clone())
            .with_audit_logger(audit.clone());
        if let Some(secret) = &self.billing.webhook_secret {
            reconciler = reconciler.with_webhook_secret(secret.clone());
        }

        let mut checkout = CheckoutInitiator::new(catalog.clone())
            .with_trial_days(self.billing.trial_days)
            .with_audit_logger(audit.clone());
        let mut portal = PortalInitiator::new(store.clone()).with_audit_logger(audit.clone());
        if let Some(app_url) = &self.billing.app_url {
            checkout = checkout.with_app_url(app_url.as_str());
            portal = portal.with_app_url(app_url.as_str());
        }

        let mut drift = DriftReconciler::new(store.clone(), catalog).with_audit_logger(audit);

        let provider_configured = self.provider.is_some();
        if let Some(provider) = self.provider {
            reconciler = reconciler.with_provider(provider.clone());
            checkout = checkout.with_provider(provider.clone());
            portal = portal.with_provider(provider.clone());
            drift = drift.with_provider(provider);
        }

        let entitlements = EntitlementQueryService::new(store.clone())
            .with_past_due_grace_days(u64::from(self.billing.past_due_grace_days));

        AppContext {
            store,
            reconciler: Arc::new(reconciler),
            entitlements,
            checkout: Arc::new(checkout),
            portal: Arc::new(portal),
            drift: Arc::new(drift),
            provider_configured,
        }
    }
}

impl Default for AppContextBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::MockBillingProvider;
    use crate::billing::{CheckoutRequest, Tier};
    use crate::config::ConfigBuilder;

    #[tokio::test]
    async fn test_default_context_has_no_provider() {
        let context = AppContext::new();
        assert!(!context.provider_configured());

        let record = context.entitlements.bootstrap("user_1", 1_700_000_000).await.unwrap();
        assert_eq!(record.tier, Tier::Free);
        assert!(context.store.get_entitlement("user_1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_builder_wires_billing_config() {
        let config = ConfigBuilder::new()
            .with_pro_prices("price_m", "price_y")
            .with_app_url("https://app.inkflow.test")
            .with_trial_days(0)
            .build()
            .unwrap();
        let provider = Arc::new(MockBillingProvider::new());

        let context = AppContext::builder()
            .with_billing_config(&config.billing)
            .with_provider(provider.clone())
            .build();
        assert!(context.provider_configured());

        context
            .checkout
            .create_checkout_session(CheckoutRequest {
                user_id: "user_1".to_string(),
                email: "writer@inkflow.test".to_string(),
                tier: "pro".to_string(),
                billing_period: "monthly".to_string(),
            })
            .await
            .unwrap();

        let sent = provider.checkout_requests();
        assert_eq!(sent[0].price_id, "price_m");
        assert_eq!(sent[0].trial_period_days, None);
        assert_eq!(sent[0].cancel_url, "https://app.inkflow.test/billing/canceled");
    }
}

//! Manual drift reconciliation.
//!
//! Pulls the authoritative subscription state from the provider for one user
//! and overwrites the entitlement record with it. Used from the billing
//! settings page when a webhook was missed.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::audit::{BillingAuditEvent, BillingAuditLogger, NoOpAuditLogger};
use super::error::BillingError;
use super::provider::{BillingProvider, ProviderSubscription};
use super::reconciler::subscription_update;
use super::storage::{EntitlementStore, EntitlementUpdate, SubscriptionStatus};
use super::tier::{PriceCatalog, Tier};
use crate::error::Result;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    pub user_id: String,
    /// Email address the provider customer was registered with.
    pub contact_address: String,
}

/// Sync outcome. Failures are reported here rather than as errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResult {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tier: Option<Tier>,
}

impl SyncResult {
    fn synced(message: impl Into<String>, tier: Tier) -> Self {
        Self {
            success: true,
            message: message.into(),
            tier: Some(tier),
        }
    }

    fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            tier: None,
        }
    }
}

/// The subscription that decides the entitlement: the live one with the
/// latest period start.
fn select_subscription(subscriptions: Vec<ProviderSubscription>) -> Option<ProviderSubscription> {
    subscriptions
        .into_iter()
        .filter(ProviderSubscription::is_live)
        .max_by_key(|sub| sub.current_period_start)
}

pub struct DriftReconciler {
    store: Arc<dyn EntitlementStore>,
    provider: Option<Arc<dyn BillingProvider>>,
    catalog: PriceCatalog,
    audit: Arc<dyn BillingAuditLogger>,
}

impl DriftReconciler {
    #[must_use]
    pub fn new(store: Arc<dyn EntitlementStore>, catalog: PriceCatalog) -> Self {
        Self {
            store,
            provider: None,
            catalog,
            audit: Arc::new(NoOpAuditLogger),
        }
    }

    #[must_use]
    pub fn with_provider(mut self, provider: Arc<dyn BillingProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    #[must_use]
    pub fn with_audit_logger(mut self, audit: Arc<dyn BillingAuditLogger>) -> Self {
        self.audit = audit;
        self
    }

    /// Re-derive a user's entitlement from the provider.
    ///
    /// Never fails: provider and store errors become an unsuccessful result.
    pub async fn sync(&self, user_id: &str, contact_address: &str, now: u64) -> SyncResult {
        let result = match self.try_sync(user_id, contact_address, now).await {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(
                    user_id = %user_id,
                    error = %e,
                    "Subscription sync failed"
                );
                SyncResult::failed(format!("Sync failed: {}", e.safe_message()))
            }
        };

        self.audit
            .log(BillingAuditEvent::SyncCompleted {
                user_id: user_id.to_string(),
                tier: result.tier.map(|t| t.to_string()),
                message: result.message.clone(),
            })
            .await;

        result
    }

    async fn try_sync(&self, user_id: &str, contact_address: &str, now: u64) -> Result<SyncResult> {
        if user_id.trim().is_empty() {
            return Err(BillingError::MissingField { field: "userId" }.into());
        }
        let contact_address = contact_address.trim();
        if contact_address.is_empty() {
            return Err(BillingError::MissingField {
                field: "contactAddress",
            }
            .into());
        }
        let provider = self.provider.as_ref().ok_or(BillingError::NotConfigured {
            setting: "STRIPE_SECRET_KEY",
        })?;

        let Some(customer) = provider.find_customer_by_email(contact_address).await? else {
            self.revert_to_free(user_id, None, now).await?;
            return Ok(SyncResult::synced(
                "No billing customer found; reverted to the free tier",
                Tier::Free,
            ));
        };
        if customer.is_owned_by_other(user_id) {
            return Err(BillingError::CustomerOwnedByOtherUser {
                customer_id: customer.id,
            }
            .into());
        }
        let customer_id = customer.id;

        let subscriptions = provider.list_subscriptions(&customer_id).await?;
        let Some(sub) = select_subscription(subscriptions) else {
            self.revert_to_free(user_id, Some(customer_id), now).await?;
            return Ok(SyncResult::synced(
                "No active subscription found; reverted to the free tier",
                Tier::Free,
            ));
        };

        let stored_tier = self
            .store
            .get_entitlement(user_id)
            .await?
            .map_or(Tier::Free, |r| r.tier);
        let update = EntitlementUpdate {
            billing_customer_ref: Some(Some(customer_id)),
            billing_subscription_ref: Some(Some(sub.id.clone())),
            billing_price_ref: Some(sub.price_id.clone()),
            ..subscription_update(&sub, &self.catalog, stored_tier)
        };

        let record = self.store.upsert_entitlement(user_id, update, now).await?;
        tracing::info!(
            user_id = %user_id,
            subscription_id = %sub.id,
            tier = %record.tier,
            status = %record.status,
            "Subscription synced from provider"
        );

        Ok(SyncResult::synced(
            format!("Subscription synced: {} ({})", record.tier, record.status),
            record.tier,
        ))
    }

    async fn revert_to_free(
        &self,
        user_id: &str,
        customer_id: Option<String>,
        now: u64,
    ) -> Result<()> {
        let mut update = EntitlementUpdate::revert_to_free(SubscriptionStatus::Inactive);
        if customer_id.is_some() {
            update.billing_customer_ref = Some(customer_id);
        }
        self.store.upsert_entitlement(user_id, update, now).await?;
        Ok(())
    }
}

//! Stripe Checkout session creation.
//!
//! Creates a hosted checkout page for the purchasable tier. Nothing is
//! written locally: the entitlement changes only when the provider confirms
//! the purchase through `checkout.session.completed`.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::audit::{BillingAuditEvent, BillingAuditLogger, NoOpAuditLogger};
use super::error::BillingError;
use super::provider::{BillingProvider, CreateCheckoutSession};
use super::tier::{BillingPeriod, PriceCatalog, Tier};
use crate::error::Result;

/// Checkout request from the client.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutRequest {
    pub user_id: String,
    pub email: String,
    pub tier: String,
    pub billing_period: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutResponse {
    pub session_id: String,
    pub url: String,
}

/// Creates checkout sessions.
pub struct CheckoutInitiator {
    provider: Option<Arc<dyn BillingProvider>>,
    catalog: PriceCatalog,
    app_url: Option<String>,
    trial_days: u32,
    audit: Arc<dyn BillingAuditLogger>,
}

impl CheckoutInitiator {
    #[must_use]
    pub fn new(catalog: PriceCatalog) -> Self {
        Self {
            provider: None,
            catalog,
            app_url: None,
            trial_days: 0,
            audit: Arc::new(NoOpAuditLogger),
        }
    }

    #[must_use]
    pub fn with_provider(mut self, provider: Arc<dyn BillingProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Base URL the success and cancel pages hang off.
    #[must_use]
    pub fn with_app_url(mut self, app_url: impl Into<String>) -> Self {
        self.app_url = Some(app_url.into().trim_end_matches('/').to_string());
        self
    }

    /// Trial length granted on new subscriptions. `0` disables the trial.
    #[must_use]
    pub fn with_trial_days(mut self, days: u32) -> Self {
        self.trial_days = days;
        self
    }

    #[must_use]
    pub fn with_audit_logger(mut self, audit: Arc<dyn BillingAuditLogger>) -> Self {
        self.audit = audit;
        self
    }

    /// Create a hosted checkout session.
    ///
    /// Reuses the provider customer registered under the email address and
    /// only creates one when none exists.
    pub async fn create_checkout_session(
        &self,
        request: CheckoutRequest,
    ) -> Result<CheckoutResponse> {
        if request.user_id.trim().is_empty() {
            return Err(BillingError::MissingField { field: "userId" }.into());
        }
        if request.email.trim().is_empty() {
            return Err(BillingError::MissingField { field: "email" }.into());
        }

        let tier: Tier = request.tier.parse()?;
        if !tier.is_purchasable() {
            return Err(BillingError::TierNotPurchasable {
                tier: tier.to_string(),
            }
            .into());
        }
        let period: BillingPeriod = request.billing_period.parse()?;

        let price_id = self
            .catalog
            .price_for(tier, period)
            .ok_or(BillingError::NotConfigured {
                setting: match period {
                    BillingPeriod::Monthly => "STRIPE_PRICE_PRO_MONTHLY",
                    BillingPeriod::Yearly => "STRIPE_PRICE_PRO_YEARLY",
                },
            })?;
        let app_url = self
            .app_url
            .as_deref()
            .ok_or(BillingError::NotConfigured { setting: "APP_URL" })?;
        let provider = self.provider.as_ref().ok_or(BillingError::NotConfigured {
            setting: "STRIPE_SECRET_KEY",
        })?;

        let email = request.email.trim();
        let customer_id = match provider.find_customer_by_email(email).await? {
            Some(customer) => customer.id,
            None => {
                let id = provider.create_customer(email, &request.user_id).await?;
                self.audit
                    .log(BillingAuditEvent::CustomerCreated {
                        user_id: request.user_id.clone(),
                        customer_id: id.clone(),
                    })
                    .await;
                id
            }
        };

        let session = provider
            .create_checkout_session(CreateCheckoutSession {
                customer_id,
                price_id: price_id.to_string(),
                user_id: request.user_id.clone(),
                tier,
                billing_period: period,
                trial_period_days: (self.trial_days > 0).then_some(self.trial_days),
                success_url: format!(
                    "{}/billing/success?session_id={{CHECKOUT_SESSION_ID}}",
                    app_url
                ),
                cancel_url: format!("{}/billing/canceled", app_url),
            })
            .await?;

        self.audit
            .log(BillingAuditEvent::CheckoutCreated {
                user_id: request.user_id,
                tier: tier.to_string(),
                billing_period: period.to_string(),
                session_id: session.id.clone(),
            })
            .await;

        Ok(CheckoutResponse {
            session_id: session.id,
            url: session.url,
        })
    }
}

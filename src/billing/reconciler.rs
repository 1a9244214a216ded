//! Billing event reconciler.
//!
//! Applies verified provider events to the entitlement store. Every handler
//! writes absolute values taken from the event or from the provider, so
//! applying the same event twice leaves the same record behind; the processed
//! event ledger only saves the second round trip.
//!
//! Deliveries are applied in arrival order. There is no comparison between
//! the event's creation time and the record's `updated_at`, so an older
//! `customer.subscription.updated` delivered after a newer one overwrites it
//! until the next event or a manual sync.

use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use std::sync::Arc;

use super::audit::{BillingAuditEvent, BillingAuditLogger, NoOpAuditLogger};
use super::error::BillingError;
use super::provider::{
    BillingProvider, META_BILLING_PERIOD, META_TIER, META_USER_ID, ProviderSubscription,
};
use super::storage::{EntitlementStore, EntitlementUpdate, SubscriptionStatus};
use super::tier::{BillingPeriod, PriceCatalog, Tier};
use super::webhook::{BillingEvent, CheckoutSessionObject, FailedInvoice, WebhookEvent, verify_signature};
use crate::error::Result;
use crate::utils::unix_now;

/// Outcome of webhook processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookOutcome {
    /// The entitlement record was written.
    Applied,
    /// No state change; an alert was emitted.
    Notified,
    /// A known event that could not be applied (malformed or unresolvable user).
    Dropped,
    /// Event type the core does not react to.
    Ignored,
    /// Event id found in the processed ledger.
    AlreadyProcessed,
}

impl WebhookOutcome {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Applied => "applied",
            Self::Notified => "notified",
            Self::Dropped => "dropped",
            Self::Ignored => "ignored",
            Self::AlreadyProcessed => "already_processed",
        }
    }

    fn is_recorded(self) -> bool {
        matches!(self, Self::Applied | Self::Notified)
    }
}

/// Entitlement update for a provider subscription snapshot.
///
/// The tier comes from the price id, then from the subscription's `tier`
/// metadata, then from the stored record. Refs and the usage counter are
/// left alone.
pub(crate) fn subscription_update(
    sub: &ProviderSubscription,
    catalog: &PriceCatalog,
    stored_tier: Tier,
) -> EntitlementUpdate {
    let tier = sub
        .price_id
        .as_deref()
        .and_then(|price| catalog.tier_for_price(price))
        .or_else(|| sub.metadata.get(META_TIER).and_then(|t| t.parse().ok()))
        .unwrap_or(stored_tier);

    let status = SubscriptionStatus::from_provider(&sub.status, sub.trial_end.is_some());
    let trial_ends_at = sub.trial_end.filter(|_| status == SubscriptionStatus::Trial);

    let mut update = EntitlementUpdate {
        status: Some(status),
        trial_ends_at: Some(trial_ends_at),
        cancel_at_period_end: Some(sub.cancel_at_period_end),
        ..Default::default()
    }
    .with_tier(tier);

    if sub.current_period_end > 0 {
        update.current_period_start = Some(sub.current_period_start);
        update.current_period_end = Some(sub.current_period_end);
    }

    update
}

/// Applies provider webhooks to the entitlement store.
pub struct BillingEventReconciler {
    store: Arc<dyn EntitlementStore>,
    provider: Option<Arc<dyn BillingProvider>>,
    catalog: PriceCatalog,
    audit: Arc<dyn BillingAuditLogger>,
    webhook_secret: Option<SecretString>,
}

impl BillingEventReconciler {
    #[must_use]
    pub fn new(store: Arc<dyn EntitlementStore>, catalog: PriceCatalog) -> Self {
        Self {
            store,
            provider: None,
            catalog,
            audit: Arc::new(NoOpAuditLogger),
            webhook_secret: None,
        }
    }

    /// Provider used to fetch the subscription behind a completed checkout.
    #[must_use]
    pub fn with_provider(mut self, provider: Arc<dyn BillingProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    #[must_use]
    pub fn with_webhook_secret(mut self, secret: impl Into<SecretString>) -> Self {
        self.webhook_secret = Some(secret.into());
        self
    }

    #[must_use]
    pub fn with_audit_logger(mut self, audit: Arc<dyn BillingAuditLogger>) -> Self {
        self.audit = audit;
        self
    }

    /// Verify a delivery's signature and parse its envelope.
    ///
    /// # Errors
    ///
    /// Configuration error without a webhook secret, authentication error on a
    /// bad signature, validation error on a malformed envelope.
    pub fn verify(&self, payload: &[u8], signature: &str) -> Result<WebhookEvent> {
        let secret = self
            .webhook_secret
            .as_ref()
            .ok_or(BillingError::NotConfigured {
                setting: "STRIPE_WEBHOOK_SECRET",
            })?;

        if let Err(e) = verify_signature(payload, signature, secret.expose_secret(), unix_now() as i64) {
            tracing::warn!(
                target: "inkflow::billing::webhook",
                error = %e,
                "Rejected webhook delivery"
            );
            return Err(e.into());
        }

        Ok(WebhookEvent::parse(payload)?)
    }

    /// Verify and apply one delivery.
    pub async fn process(&self, payload: &[u8], signature: &str) -> Result<WebhookOutcome> {
        let event = self.verify(payload, signature)?;
        self.handle_event(event, unix_now()).await
    }

    /// Apply a verified event.
    ///
    /// Only applied and notified events enter the processed ledger, so an
    /// event dropped because its user was not yet known is applied if the
    /// provider delivers it again.
    pub async fn handle_event(&self, event: WebhookEvent, now: u64) -> Result<WebhookOutcome> {
        if self.store.is_event_processed(&event.id).await? {
            tracing::debug!(
                target: "inkflow::billing::webhook",
                event_id = %event.id,
                "Webhook event already processed"
            );
            return Ok(WebhookOutcome::AlreadyProcessed);
        }

        let outcome = match BillingEvent::decode(&event) {
            Ok(decoded) => self.apply(decoded, now).await?,
            Err(e) => {
                tracing::warn!(
                    target: "inkflow::billing::webhook",
                    event_id = %event.id,
                    event_type = %event.event_type,
                    error = %e,
                    "Dropping malformed webhook event"
                );
                WebhookOutcome::Dropped
            }
        };

        if outcome.is_recorded() {
            self.store.mark_event_processed(&event.id, now).await?;
        }

        self.audit
            .log(BillingAuditEvent::WebhookProcessed {
                event_id: event.id,
                event_type: event.event_type,
                outcome: outcome.as_str().to_string(),
            })
            .await;

        Ok(outcome)
    }

    async fn apply(&self, event: BillingEvent, now: u64) -> Result<WebhookOutcome> {
        match event {
            BillingEvent::CheckoutCompleted(session) => self.checkout_completed(session, now).await,
            BillingEvent::SubscriptionUpdated(sub) => self.subscription_updated(sub, now).await,
            BillingEvent::SubscriptionDeleted(sub) => self.subscription_deleted(sub, now).await,
            BillingEvent::TrialWillEnd(sub) => self.trial_will_end(sub).await,
            BillingEvent::PaymentFailed(invoice) => self.payment_failed(invoice, now).await,
            BillingEvent::Unhandled { event_type } => {
                tracing::debug!(
                    target: "inkflow::billing::webhook",
                    event_type = %event_type,
                    "Ignoring unhandled webhook event"
                );
                Ok(WebhookOutcome::Ignored)
            }
        }
    }

    async fn checkout_completed(
        &self,
        session: CheckoutSessionObject,
        now: u64,
    ) -> Result<WebhookOutcome> {
        let user_id = session.metadata.get(META_USER_ID).filter(|s| !s.is_empty());
        let tier = session
            .metadata
            .get(META_TIER)
            .and_then(|t| t.parse::<Tier>().ok());
        let period = session
            .metadata
            .get(META_BILLING_PERIOD)
            .and_then(|p| p.parse::<BillingPeriod>().ok());

        let (Some(user_id), Some(tier), Some(_period)) = (user_id, tier, period) else {
            return Ok(dropped(&session.id, "checkout session metadata incomplete"));
        };
        let Some(subscription_id) = session.subscription.as_deref() else {
            return Ok(dropped(&session.id, "checkout session has no subscription"));
        };

        let provider = self.provider.as_ref().ok_or(BillingError::NotConfigured {
            setting: "STRIPE_SECRET_KEY",
        })?;
        let sub = provider.get_subscription(subscription_id).await?;

        let trial_ends_at = sub.trial_end.filter(|end| *end > now);
        let status = if trial_ends_at.is_some() {
            SubscriptionStatus::Trial
        } else {
            SubscriptionStatus::Active
        };
        let customer_id = session.customer.clone().unwrap_or_else(|| sub.customer_id.clone());

        let mut update = EntitlementUpdate {
            status: Some(status),
            billing_customer_ref: Some(Some(customer_id)),
            billing_subscription_ref: Some(Some(sub.id.clone())),
            billing_price_ref: Some(sub.price_id.clone()),
            trial_ends_at: Some(trial_ends_at),
            cancel_at_period_end: Some(sub.cancel_at_period_end),
            tokens_used_this_period: Some(0),
            ..Default::default()
        }
        .with_tier(tier);
        if sub.current_period_end > 0 {
            update.current_period_start = Some(sub.current_period_start);
            update.current_period_end = Some(sub.current_period_end);
        }

        let record = self.store.upsert_entitlement(user_id, update, now).await?;
        self.record_update(&record.user_id, record.tier, record.status, "checkout.session.completed")
            .await;

        Ok(WebhookOutcome::Applied)
    }

    async fn subscription_updated(
        &self,
        sub: ProviderSubscription,
        now: u64,
    ) -> Result<WebhookOutcome> {
        let Some(user_id) = self
            .resolve_user(sub.user_id(), Some(&sub.id), Some(&sub.customer_id))
            .await?
        else {
            return Ok(dropped(&sub.id, "no user for subscription"));
        };

        let stored_tier = self
            .store
            .get_entitlement(&user_id)
            .await?
            .map_or(Tier::Free, |r| r.tier);
        let update = subscription_update(&sub, &self.catalog, stored_tier);

        let record = self.store.upsert_entitlement(&user_id, update, now).await?;
        self.record_update(&record.user_id, record.tier, record.status, "customer.subscription.updated")
            .await;

        Ok(WebhookOutcome::Applied)
    }

    async fn subscription_deleted(
        &self,
        sub: ProviderSubscription,
        now: u64,
    ) -> Result<WebhookOutcome> {
        let Some(user_id) = self
            .resolve_user(sub.user_id(), Some(&sub.id), Some(&sub.customer_id))
            .await?
        else {
            return Ok(dropped(&sub.id, "no user for subscription"));
        };

        let update = EntitlementUpdate {
            tokens_used_this_period: Some(0),
            ..EntitlementUpdate::revert_to_free(SubscriptionStatus::Canceled)
        };
        self.store.upsert_entitlement(&user_id, update, now).await?;

        self.audit
            .log(BillingAuditEvent::SubscriptionCanceled {
                user_id,
                subscription_id: sub.id,
            })
            .await;

        Ok(WebhookOutcome::Applied)
    }

    async fn trial_will_end(&self, sub: ProviderSubscription) -> Result<WebhookOutcome> {
        let Some(user_id) = self
            .resolve_user(sub.user_id(), Some(&sub.id), Some(&sub.customer_id))
            .await?
        else {
            return Ok(dropped(&sub.id, "no user for subscription"));
        };

        self.audit
            .log(BillingAuditEvent::TrialEnding {
                user_id,
                subscription_id: sub.id,
                trial_ends_at: sub.trial_end,
            })
            .await;

        Ok(WebhookOutcome::Notified)
    }

    async fn payment_failed(&self, invoice: FailedInvoice, now: u64) -> Result<WebhookOutcome> {
        let Some(user_id) = self
            .resolve_user(
                invoice.user_id(),
                invoice.subscription.as_deref(),
                invoice.customer.as_deref(),
            )
            .await?
        else {
            return Ok(dropped(&invoice.id, "no user for invoice"));
        };

        let update = EntitlementUpdate::default().with_status(SubscriptionStatus::PastDue);
        self.store.upsert_entitlement(&user_id, update, now).await?;

        self.audit
            .log(BillingAuditEvent::PaymentFailed {
                user_id,
                invoice_id: invoice.id,
            })
            .await;

        Ok(WebhookOutcome::Applied)
    }

    /// Metadata user id first, then the record holding the subscription, then the customer.
    async fn resolve_user(
        &self,
        metadata_user: Option<&str>,
        subscription_id: Option<&str>,
        customer_id: Option<&str>,
    ) -> Result<Option<String>> {
        if let Some(user_id) = metadata_user {
            return Ok(Some(user_id.to_string()));
        }
        if let Some(subscription_id) = subscription_id {
            if let Some(record) = self.store.find_by_subscription_ref(subscription_id).await? {
                return Ok(Some(record.user_id));
            }
        }
        if let Some(customer_id) = customer_id {
            if let Some(record) = self.store.find_by_customer_ref(customer_id).await? {
                return Ok(Some(record.user_id));
            }
        }
        Ok(None)
    }

    async fn record_update(&self, user_id: &str, tier: Tier, status: SubscriptionStatus, source: &str) {
        self.audit
            .log(BillingAuditEvent::EntitlementUpdated {
                user_id: user_id.to_string(),
                tier: tier.to_string(),
                status: status.to_string(),
                source: source.to_string(),
            })
            .await;
    }
}

fn dropped(object_id: &str, reason: &str) -> WebhookOutcome {
    tracing::warn!(
        target: "inkflow::billing::webhook",
        object_id = %object_id,
        reason = reason,
        "Dropping webhook event"
    );
    WebhookOutcome::Dropped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::audit::test::RecordingAuditLogger;
    use crate::billing::provider::test::{MockBillingProvider, subscription};
    use crate::billing::storage::{EntitlementRecord, InMemoryEntitlementStore};
    use crate::billing::tier::UNLIMITED_TOKENS;
    use crate::billing::webhook::{WebhookEventData, signature_header};
    use crate::error::InkflowError;
    use serde_json::json;

    const NOW: u64 = 1_700_000_100;
    const TRIAL_END: u64 = 1_700_000_000 + 7 * 86_400;

    struct Harness {
        store: InMemoryEntitlementStore,
        provider: Arc<MockBillingProvider>,
        audit: RecordingAuditLogger,
        reconciler: BillingEventReconciler,
    }

    fn harness(provider: MockBillingProvider) -> Harness {
        let store = InMemoryEntitlementStore::new();
        let provider = Arc::new(provider);
        let audit = RecordingAuditLogger::new();
        let reconciler = BillingEventReconciler::new(
            Arc::new(store.clone()),
            PriceCatalog::new(Some("price_m".into()), Some("price_y".into())),
        )
        .with_provider(provider.clone())
        .with_audit_logger(Arc::new(audit.clone()))
        .with_webhook_secret("whsec_test");

        Harness {
            store,
            provider,
            audit,
            reconciler,
        }
    }

    fn trialing_subscription() -> ProviderSubscription {
        let mut sub = subscription("sub_1", "cus_1", "price_m");
        sub.status = "trialing".to_string();
        sub.trial_end = Some(TRIAL_END);
        sub
    }

    fn event(id: &str, event_type: &str, object: serde_json::Value) -> WebhookEvent {
        WebhookEvent {
            id: id.to_string(),
            event_type: event_type.to_string(),
            data: WebhookEventData { object },
            created: NOW,
        }
    }

    fn checkout_event(id: &str) -> WebhookEvent {
        event(
            id,
            "checkout.session.completed",
            json!({
                "id": "cs_1",
                "customer": "cus_1",
                "subscription": "sub_1",
                "metadata": {"userId": "user_1", "tier": "pro", "billingPeriod": "monthly"}
            }),
        )
    }

    fn pro_record() -> EntitlementRecord {
        let mut record = EntitlementRecord::new("user_1", NOW);
        record.tier = Tier::Pro;
        record.tokens_limit = Tier::Pro.token_limit();
        record.tokens_used_this_period = 1_234;
        record.billing_customer_ref = Some("cus_1".to_string());
        record.billing_subscription_ref = Some("sub_1".to_string());
        record.billing_price_ref = Some("price_m".to_string());
        record
    }

    #[tokio::test]
    async fn test_checkout_completed_with_trial() {
        let h = harness(MockBillingProvider::new().with_subscription(trialing_subscription()));

        let outcome = h.reconciler.handle_event(checkout_event("evt_1"), NOW).await.unwrap();
        assert_eq!(outcome, WebhookOutcome::Applied);

        let record = h.store.get_entitlement("user_1").await.unwrap().unwrap();
        assert_eq!(record.tier, Tier::Pro);
        assert_eq!(record.status, SubscriptionStatus::Trial);
        assert_eq!(record.trial_ends_at, Some(TRIAL_END));
        assert_eq!(record.tokens_used_this_period, 0);
        assert_eq!(record.tokens_limit, Tier::Pro.token_limit());
        assert_eq!(record.billing_customer_ref.as_deref(), Some("cus_1"));
        assert_eq!(record.billing_subscription_ref.as_deref(), Some("sub_1"));
        assert_eq!(record.billing_price_ref.as_deref(), Some("price_m"));
        assert!(h.store.is_event_processed("evt_1").await.unwrap());
    }

    #[tokio::test]
    async fn test_checkout_completed_replay_is_idempotent() {
        let h = harness(MockBillingProvider::new().with_subscription(trialing_subscription()));

        h.reconciler.handle_event(checkout_event("evt_1"), NOW).await.unwrap();
        let first = h.store.get_entitlement("user_1").await.unwrap().unwrap();

        let outcome = h.reconciler.handle_event(checkout_event("evt_1"), NOW + 60).await.unwrap();
        assert_eq!(outcome, WebhookOutcome::AlreadyProcessed);
        assert_eq!(h.store.get_entitlement("user_1").await.unwrap().unwrap(), first);

        // A redelivery under a new event id writes the same values.
        h.reconciler.handle_event(checkout_event("evt_2"), NOW).await.unwrap();
        assert_eq!(h.store.get_entitlement("user_1").await.unwrap().unwrap(), first);
    }

    #[tokio::test]
    async fn test_checkout_without_trial_is_active() {
        let h = harness(
            MockBillingProvider::new().with_subscription(subscription("sub_1", "cus_1", "price_m")),
        );

        h.reconciler.handle_event(checkout_event("evt_1"), NOW).await.unwrap();

        let record = h.store.get_entitlement("user_1").await.unwrap().unwrap();
        assert_eq!(record.status, SubscriptionStatus::Active);
        assert_eq!(record.trial_ends_at, None);
    }

    #[tokio::test]
    async fn test_checkout_missing_metadata_is_dropped() {
        let h = harness(MockBillingProvider::new().with_subscription(trialing_subscription()));

        let outcome = h
            .reconciler
            .handle_event(
                event(
                    "evt_1",
                    "checkout.session.completed",
                    json!({"id": "cs_1", "subscription": "sub_1", "metadata": {"userId": "user_1"}}),
                ),
                NOW,
            )
            .await
            .unwrap();

        assert_eq!(outcome, WebhookOutcome::Dropped);
        assert!(h.store.is_empty().unwrap());
        assert!(!h.store.is_event_processed("evt_1").await.unwrap());
    }

    #[tokio::test]
    async fn test_checkout_provider_failure_propagates() {
        let h = harness(MockBillingProvider::new().with_subscription(trialing_subscription()));
        h.provider.set_failing(true);

        let result = h.reconciler.handle_event(checkout_event("evt_1"), NOW).await;

        assert!(matches!(result, Err(InkflowError::Upstream(_))));
        assert!(!h.store.is_event_processed("evt_1").await.unwrap());
        assert!(h.store.is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_subscription_updated_keeps_refs_and_usage() {
        let h = harness(MockBillingProvider::new());
        h.store.insert(pro_record()).unwrap();

        let outcome = h
            .reconciler
            .handle_event(
                event(
                    "evt_1",
                    "customer.subscription.updated",
                    json!({
                        "id": "sub_1",
                        "customer": "cus_1",
                        "status": "active",
                        "current_period_start": 1_702_592_000u64,
                        "current_period_end": 1_705_184_000u64,
                        "cancel_at_period_end": true,
                        "items": {"data": [{"price": {"id": "price_y"}}]}
                    }),
                ),
                NOW,
            )
            .await
            .unwrap();
        assert_eq!(outcome, WebhookOutcome::Applied);

        let record = h.store.get_entitlement("user_1").await.unwrap().unwrap();
        assert_eq!(record.status, SubscriptionStatus::Active);
        assert!(record.cancel_at_period_end);
        assert_eq!(record.current_period_end, 1_705_184_000);
        assert_eq!(record.tokens_used_this_period, 1_234);
        assert_eq!(record.billing_price_ref.as_deref(), Some("price_m"));
    }

    #[tokio::test]
    async fn test_trial_converted_to_paid_clears_trial_end() {
        let h = harness(MockBillingProvider::new());
        let mut record = pro_record();
        record.status = SubscriptionStatus::Trial;
        record.trial_ends_at = Some(NOW + 400);
        h.store.insert(record).unwrap();

        let later = NOW + 1_000;
        h.reconciler
            .handle_event(
                event(
                    "evt_1",
                    "customer.subscription.updated",
                    json!({
                        "id": "sub_1",
                        "customer": "cus_1",
                        "status": "active",
                        "trial_end": NOW + 400,
                        "current_period_start": NOW + 400,
                        "current_period_end": NOW + 400 + 30 * 86_400,
                        "items": {"data": [{"price": {"id": "price_m"}}]}
                    }),
                ),
                later,
            )
            .await
            .unwrap();

        let record = h.store.get_entitlement("user_1").await.unwrap().unwrap();
        assert_eq!(record.status, SubscriptionStatus::Active);
        assert_eq!(record.trial_ends_at, None);
        assert!(!crate::billing::entitlements::is_trial_expired(&record, later));
    }

    #[tokio::test]
    async fn test_subscription_updated_unknown_user_is_dropped() {
        let h = harness(MockBillingProvider::new());

        let outcome = h
            .reconciler
            .handle_event(
                event(
                    "evt_1",
                    "customer.subscription.updated",
                    json!({"id": "sub_x", "customer": "cus_x", "status": "active"}),
                ),
                NOW,
            )
            .await
            .unwrap();

        assert_eq!(outcome, WebhookOutcome::Dropped);
        assert!(h.store.is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_subscription_updated_tier_from_metadata() {
        let h = harness(MockBillingProvider::new());

        h.reconciler
            .handle_event(
                event(
                    "evt_1",
                    "customer.subscription.updated",
                    json!({
                        "id": "sub_9",
                        "customer": "cus_9",
                        "status": "active",
                        "items": {"data": [{"price": {"id": "price_legacy"}}]},
                        "metadata": {"userId": "user_9", "tier": "unlimited"}
                    }),
                ),
                NOW,
            )
            .await
            .unwrap();

        let record = h.store.get_entitlement("user_9").await.unwrap().unwrap();
        assert_eq!(record.tier, Tier::Unlimited);
        assert_eq!(record.tokens_limit, UNLIMITED_TOKENS);
    }

    #[tokio::test]
    async fn test_subscription_deleted_reverts_to_free() {
        let h = harness(MockBillingProvider::new());
        let mut record = pro_record();
        record.status = SubscriptionStatus::Trial;
        record.trial_ends_at = Some(TRIAL_END);
        h.store.insert(record).unwrap();

        let outcome = h
            .reconciler
            .handle_event(
                event(
                    "evt_1",
                    "customer.subscription.deleted",
                    json!({"id": "sub_1", "customer": "cus_1", "status": "canceled"}),
                ),
                NOW,
            )
            .await
            .unwrap();
        assert_eq!(outcome, WebhookOutcome::Applied);

        let record = h.store.get_entitlement("user_1").await.unwrap().unwrap();
        assert_eq!(record.tier, Tier::Free);
        assert_eq!(record.status, SubscriptionStatus::Canceled);
        assert_eq!(record.tokens_limit, Tier::Free.token_limit());
        assert_eq!(record.tokens_used_this_period, 0);
        assert_eq!(record.billing_subscription_ref, None);
        assert_eq!(record.billing_price_ref, None);
        assert_eq!(record.trial_ends_at, None);
        assert_eq!(record.billing_customer_ref.as_deref(), Some("cus_1"));
        assert_eq!(h.audit.events_of("subscription_canceled").await.len(), 1);
    }

    #[tokio::test]
    async fn test_trial_will_end_notifies_without_writing() {
        let h = harness(MockBillingProvider::new());
        h.store.insert(pro_record()).unwrap();
        let before = h.store.get_entitlement("user_1").await.unwrap().unwrap();

        let outcome = h
            .reconciler
            .handle_event(
                event(
                    "evt_1",
                    "customer.subscription.trial_will_end",
                    json!({"id": "sub_1", "customer": "cus_1", "status": "trialing", "trial_end": TRIAL_END}),
                ),
                NOW,
            )
            .await
            .unwrap();

        assert_eq!(outcome, WebhookOutcome::Notified);
        assert_eq!(h.store.get_entitlement("user_1").await.unwrap().unwrap(), before);
        assert_eq!(h.audit.events_of("trial_ending").await.len(), 1);
    }

    #[tokio::test]
    async fn test_payment_failed_marks_past_due() {
        let h = harness(MockBillingProvider::new());
        h.store.insert(pro_record()).unwrap();

        let outcome = h
            .reconciler
            .handle_event(
                event(
                    "evt_1",
                    "invoice.payment_failed",
                    json!({"id": "in_1", "customer": "cus_1", "subscription": "sub_1"}),
                ),
                NOW,
            )
            .await
            .unwrap();
        assert_eq!(outcome, WebhookOutcome::Applied);

        let record = h.store.get_entitlement("user_1").await.unwrap().unwrap();
        assert_eq!(record.status, SubscriptionStatus::PastDue);
        assert_eq!(record.tier, Tier::Pro);
        assert_eq!(h.audit.events_of("payment_failed").await.len(), 1);
    }

    #[tokio::test]
    async fn test_unhandled_event_is_ignored_and_not_recorded() {
        let h = harness(MockBillingProvider::new());

        let outcome = h
            .reconciler
            .handle_event(event("evt_1", "charge.refunded", json!({})), NOW)
            .await
            .unwrap();

        assert_eq!(outcome, WebhookOutcome::Ignored);
        assert!(!h.store.is_event_processed("evt_1").await.unwrap());
    }

    #[tokio::test]
    async fn test_process_rejects_bad_signature_without_writes() {
        let h = harness(MockBillingProvider::new().with_subscription(trialing_subscription()));
        let payload = serde_json::to_vec(&json!({
            "id": "evt_1",
            "type": "checkout.session.completed",
            "data": {"object": {"id": "cs_1", "subscription": "sub_1",
                "metadata": {"userId": "user_1", "tier": "pro", "billingPeriod": "monthly"}}}
        }))
        .unwrap();
        let header = signature_header("whsec_wrong", &payload, unix_now() as i64).unwrap();

        let result = h.reconciler.process(&payload, &header).await;

        assert!(matches!(result, Err(InkflowError::Authentication(_))));
        assert!(h.store.is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_process_signed_delivery() {
        let h = harness(MockBillingProvider::new().with_subscription(trialing_subscription()));
        let payload = serde_json::to_vec(&json!({
            "id": "evt_1",
            "type": "checkout.session.completed",
            "data": {"object": {"id": "cs_1", "customer": "cus_1", "subscription": "sub_1",
                "metadata": {"userId": "user_1", "tier": "pro", "billingPeriod": "yearly"}}}
        }))
        .unwrap();
        let header = signature_header("whsec_test", &payload, unix_now() as i64).unwrap();

        let outcome = h.reconciler.process(&payload, &header).await.unwrap();

        assert_eq!(outcome, WebhookOutcome::Applied);
        assert!(h.store.get_entitlement("user_1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_verify_without_secret_is_configuration_error() {
        let reconciler = BillingEventReconciler::new(
            Arc::new(InMemoryEntitlementStore::new()),
            PriceCatalog::default(),
        );

        let result = reconciler.verify(b"{}", "t=1,v1=00");
        assert!(matches!(result, Err(InkflowError::Configuration(_))));
    }
}

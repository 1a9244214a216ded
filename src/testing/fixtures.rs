//! Stripe event fixtures for driving the webhook endpoint in tests.

use serde_json::{Value, json};
use uuid::Uuid;

use crate::billing::provider::{META_BILLING_PERIOD, META_TIER, META_USER_ID};

/// Helper functions for generating fake test data
pub mod fake {
    use super::*;

    pub fn user_id() -> String {
        format!("user_{}", &Uuid::new_v4().simple().to_string()[..12])
    }

    pub fn email() -> String {
        format!("writer-{}@inkflow.test", &Uuid::new_v4().simple().to_string()[..8])
    }

    pub fn event_id() -> String {
        format!("evt_{}", Uuid::new_v4().simple())
    }
}

/// A Stripe event envelope under construction.
#[derive(Debug, Clone)]
pub struct EventFixture {
    id: String,
    event_type: String,
    object: Value,
}

impl EventFixture {
    /// Event with a random id.
    pub fn new(event_type: impl Into<String>, object: Value) -> Self {
        Self {
            id: fake::event_id(),
            event_type: event_type.into(),
            object,
        }
    }

    /// `checkout.session.completed` for a monthly pro purchase.
    pub fn checkout_completed(user_id: &str, customer_id: &str, subscription_id: &str) -> Self {
        Self::new(
            "checkout.session.completed",
            json!({
                "id": format!("cs_{}", subscription_id),
                "object": "checkout.session",
                "customer": customer_id,
                "subscription": subscription_id,
                "metadata": {
                    META_USER_ID: user_id,
                    META_TIER: "pro",
                    META_BILLING_PERIOD: "monthly",
                },
            }),
        )
    }

    /// Subscription event (`customer.subscription.*`) for one price.
    pub fn subscription(
        event_type: &str,
        user_id: &str,
        customer_id: &str,
        subscription_id: &str,
        status: &str,
        price_id: &str,
    ) -> Self {
        Self::new(
            event_type,
            json!({
                "id": subscription_id,
                "object": "subscription",
                "customer": customer_id,
                "status": status,
                "current_period_start": 1_700_000_000u64,
                "current_period_end": 1_702_592_000u64,
                "trial_end": null,
                "cancel_at_period_end": false,
                "items": { "data": [ { "price": { "id": price_id } } ] },
                "metadata": { META_USER_ID: user_id },
            }),
        )
    }

    pub fn subscription_deleted(user_id: &str, customer_id: &str, subscription_id: &str) -> Self {
        Self::subscription(
            "customer.subscription.deleted",
            user_id,
            customer_id,
            subscription_id,
            "canceled",
            "price_unused",
        )
    }

    pub fn payment_failed(user_id: &str, customer_id: &str, subscription_id: &str) -> Self {
        Self::new(
            "invoice.payment_failed",
            json!({
                "id": format!("in_{}", subscription_id),
                "object": "invoice",
                "customer": customer_id,
                "subscription": subscription_id,
                "subscription_details": { "metadata": { META_USER_ID: user_id } },
            }),
        )
    }

    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn to_json(&self) -> Value {
        json!({
            "id": self.id,
            "object": "event",
            "type": self.event_type,
            "created": 1_700_000_000u64,
            "data": { "object": self.object },
        })
    }

    /// Payload bytes as the provider would send them.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.to_json().to_string().into_bytes()
    }
}

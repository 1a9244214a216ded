//! Stripe webhook ingress.
//!
//! Signature verification and decoding of the event envelope into the closed
//! [`BillingEvent`] set. Applying events lives in
//! [`reconciler`](super::reconciler).

use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use sha2::Sha256;
use std::collections::HashMap;
use subtle::ConstantTimeEq;

use super::error::BillingError;
use super::provider::{META_USER_ID, ProviderSubscription};

/// Maximum age of a signed delivery.
pub const SIGNATURE_TOLERANCE_SECONDS: i64 = 300;

type HmacSha256 = Hmac<Sha256>;

/// Webhook envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEvent {
    pub id: String,
    /// Event type (e.g., "checkout.session.completed").
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: WebhookEventData,
    #[serde(default)]
    pub created: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEventData {
    /// The object that triggered the event.
    pub object: serde_json::Value,
}

impl WebhookEvent {
    /// Parse a verified payload.
    pub fn parse(payload: &[u8]) -> Result<Self, BillingError> {
        serde_json::from_slice(payload).map_err(|e| {
            tracing::warn!(
                target: "inkflow::billing::webhook",
                error = %e,
                "Failed to parse webhook payload"
            );
            BillingError::InvalidWebhookPayload {
                message: "malformed JSON payload".to_string(),
            }
        })
    }
}

/// Checkout session fields the reconciler reads.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CheckoutSessionObject {
    pub id: String,
    #[serde(default)]
    pub customer: Option<String>,
    #[serde(default)]
    pub subscription: Option<String>,
    #[serde(default, deserialize_with = "nullable_map")]
    pub metadata: HashMap<String, String>,
}

/// Invoice fields the reconciler reads from `invoice.payment_failed`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FailedInvoice {
    pub id: String,
    #[serde(default)]
    pub customer: Option<String>,
    #[serde(default)]
    pub subscription: Option<String>,
    #[serde(default)]
    subscription_details: Option<SubscriptionDetails>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
struct SubscriptionDetails {
    #[serde(default, deserialize_with = "nullable_map")]
    metadata: HashMap<String, String>,
}

impl FailedInvoice {
    /// User id carried on the invoice's subscription metadata.
    #[must_use]
    pub fn user_id(&self) -> Option<&str> {
        self.subscription_details
            .as_ref()
            .and_then(|d| d.metadata.get(META_USER_ID))
            .map(String::as_str)
            .filter(|s| !s.is_empty())
    }
}

#[derive(Debug, Deserialize)]
struct SubscriptionObject {
    id: String,
    customer: String,
    status: String,
    #[serde(default)]
    current_period_start: u64,
    #[serde(default)]
    current_period_end: u64,
    #[serde(default)]
    trial_end: Option<u64>,
    #[serde(default)]
    cancel_at_period_end: bool,
    #[serde(default)]
    items: Option<SubscriptionItems>,
    #[serde(default, deserialize_with = "nullable_map")]
    metadata: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct SubscriptionItems {
    #[serde(default)]
    data: Vec<SubscriptionItem>,
}

#[derive(Debug, Deserialize)]
struct SubscriptionItem {
    #[serde(default)]
    price: Option<PriceRef>,
}

#[derive(Debug, Deserialize)]
struct PriceRef {
    id: String,
}

impl From<SubscriptionObject> for ProviderSubscription {
    fn from(obj: SubscriptionObject) -> Self {
        let price_id = obj
            .items
            .and_then(|items| items.data.into_iter().next())
            .and_then(|item| item.price)
            .map(|price| price.id);

        Self {
            id: obj.id,
            customer_id: obj.customer,
            status: obj.status,
            price_id,
            current_period_start: obj.current_period_start,
            current_period_end: obj.current_period_end,
            trial_end: obj.trial_end,
            cancel_at_period_end: obj.cancel_at_period_end,
            metadata: obj.metadata,
        }
    }
}

fn nullable_map<'de, D>(deserializer: D) -> Result<HashMap<String, String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<HashMap<String, String>>::deserialize(deserializer)?.unwrap_or_default())
}

/// Provider events the subscription core reacts to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BillingEvent {
    CheckoutCompleted(CheckoutSessionObject),
    /// `customer.subscription.updated`, and `.created` which carries the same shape.
    SubscriptionUpdated(ProviderSubscription),
    SubscriptionDeleted(ProviderSubscription),
    TrialWillEnd(ProviderSubscription),
    PaymentFailed(FailedInvoice),
    Unhandled { event_type: String },
}

impl BillingEvent {
    /// Decode the event object for a known event type.
    ///
    /// # Errors
    ///
    /// Returns [`BillingError::InvalidWebhookPayload`] when the object of a
    /// known event type is missing required fields.
    pub fn decode(event: &WebhookEvent) -> Result<Self, BillingError> {
        let object = &event.data.object;
        let decoded = match event.event_type.as_str() {
            "checkout.session.completed" => Self::CheckoutCompleted(from_object(object)?),
            "customer.subscription.created" | "customer.subscription.updated" => {
                Self::SubscriptionUpdated(subscription(object)?)
            }
            "customer.subscription.deleted" => Self::SubscriptionDeleted(subscription(object)?),
            "customer.subscription.trial_will_end" => Self::TrialWillEnd(subscription(object)?),
            "invoice.payment_failed" => Self::PaymentFailed(from_object(object)?),
            other => Self::Unhandled {
                event_type: other.to_string(),
            },
        };
        Ok(decoded)
    }
}

fn from_object<T: DeserializeOwned>(object: &serde_json::Value) -> Result<T, BillingError> {
    T::deserialize(object).map_err(|e| BillingError::InvalidWebhookPayload {
        message: e.to_string(),
    })
}

fn subscription(object: &serde_json::Value) -> Result<ProviderSubscription, BillingError> {
    from_object::<SubscriptionObject>(object).map(Into::into)
}

struct SignatureParts {
    timestamp: i64,
    signatures: Vec<String>,
}

/// Parse the `Stripe-Signature` header (`t=...,v1=...[,v1=...]`).
fn parse_signature_header(header: &str) -> Result<SignatureParts, BillingError> {
    let mut timestamp = None;
    let mut signatures = Vec::new();

    for part in header.split(',') {
        let (key, value) =
            part.split_once('=')
                .ok_or_else(|| BillingError::InvalidSignatureHeader {
                    reason: "expected key=value pairs".to_string(),
                })?;

        match key.trim() {
            "t" => timestamp = value.trim().parse().ok(),
            "v1" => signatures.push(value.trim().to_string()),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or_else(|| BillingError::InvalidSignatureHeader {
        reason: "missing timestamp".to_string(),
    })?;
    if signatures.is_empty() {
        return Err(BillingError::InvalidSignatureHeader {
            reason: "missing v1 signature".to_string(),
        });
    }

    Ok(SignatureParts {
        timestamp,
        signatures,
    })
}

fn compute_signature(secret: &str, timestamp: i64, payload: &[u8]) -> Result<Vec<u8>, BillingError> {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| BillingError::Internal {
            message: "HMAC key error".to_string(),
        })?;

    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Verify a delivery against the endpoint secret.
///
/// # Errors
///
/// Fails when the header is malformed, the timestamp is more than
/// [`SIGNATURE_TOLERANCE_SECONDS`] away from `now`, or no `v1` signature
/// matches the payload.
pub fn verify_signature(
    payload: &[u8],
    header: &str,
    secret: &str,
    now: i64,
) -> Result<(), BillingError> {
    let parts = parse_signature_header(header)?;

    let age_seconds = now - parts.timestamp;
    if age_seconds.abs() > SIGNATURE_TOLERANCE_SECONDS {
        return Err(BillingError::WebhookTimestampExpired { age_seconds });
    }

    let expected = compute_signature(secret, parts.timestamp, payload)?;
    let matched = parts
        .signatures
        .iter()
        .filter_map(|sig| hex::decode(sig).ok())
        .any(|provided| expected.ct_eq(&provided).unwrap_u8() == 1);

    if matched {
        Ok(())
    } else {
        Err(BillingError::InvalidWebhookSignature)
    }
}

/// Build a `Stripe-Signature` header value for a payload.
///
/// # Errors
///
/// Only fails if the HMAC key is rejected.
pub fn signature_header(secret: &str, payload: &[u8], timestamp: i64) -> Result<String, BillingError> {
    let signature = compute_signature(secret, timestamp, payload)?;
    Ok(format!("t={},v1={}", timestamp, hex::encode(signature)))
}

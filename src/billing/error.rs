//! Billing-specific error types.
//!
//! Granular errors for billing operations. They convert into
//! [`InkflowError`](crate::error::InkflowError) at the request boundary,
//! which decides the HTTP status.

use std::fmt;

/// Billing-specific errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BillingError {
    // Validation errors
    /// Unknown tier name.
    InvalidTier { value: String },
    /// The tier exists but cannot be bought through checkout.
    TierNotPurchasable { tier: String },
    /// Billing period is not monthly or yearly.
    InvalidBillingPeriod { value: String },
    /// A required request field is empty.
    MissingField { field: &'static str },
    /// Usage increments and cost estimates must lie in `1..=MAX_USAGE_AMOUNT`.
    InvalidUsageAmount { amount: i64 },
    /// Unknown gated action name.
    InvalidAction { value: String },

    // Lookup errors
    /// No entitlement record exists for the user.
    EntitlementNotFound { user_id: String },
    /// The user has no billing customer reference.
    NoCustomer { user_id: String },
    /// The provider customer found for a contact address is stamped with another user id.
    CustomerOwnedByOtherUser { customer_id: String },

    // Configuration errors
    /// A required billing setting is absent.
    NotConfigured { setting: &'static str },

    // Webhook errors
    /// Webhook signature does not match the payload.
    InvalidWebhookSignature,
    /// The `Stripe-Signature` header is missing or unparseable.
    InvalidSignatureHeader { reason: String },
    /// Webhook timestamp is outside the tolerance window.
    WebhookTimestampExpired { age_seconds: i64 },
    /// Webhook envelope or event object is malformed.
    InvalidWebhookPayload { message: String },

    // Provider errors
    /// Stripe returned an error.
    ProviderApi {
        operation: String,
        message: String,
        code: Option<String>,
        http_status: Option<u16>,
    },
    /// A Stripe call exceeded its time budget.
    ProviderTimeout { operation: String, seconds: u64 },

    /// An unexpected internal error occurred.
    Internal { message: String },
}

impl fmt::Display for BillingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidTier { value } => write!(f, "Unknown tier '{}'", value),
            Self::TierNotPurchasable { tier } => {
                write!(f, "Tier '{}' cannot be purchased; only 'pro' is available", tier)
            }
            Self::InvalidBillingPeriod { value } => {
                write!(f, "Invalid billing period '{}': expected monthly or yearly", value)
            }
            Self::MissingField { field } => write!(f, "Missing required field '{}'", field),
            Self::InvalidUsageAmount { amount } => {
                write!(
                    f,
                    "Usage amount must be between 1 and {}, got {}",
                    super::storage::MAX_USAGE_AMOUNT,
                    amount
                )
            }
            Self::InvalidAction { value } => write!(f, "Unknown action '{}'", value),
            Self::EntitlementNotFound { user_id } => {
                write!(f, "No entitlement found for user '{}'", user_id)
            }
            Self::NoCustomer { .. } => write!(f, "No active subscription"),
            Self::CustomerOwnedByOtherUser { customer_id } => write!(
                f,
                "Billing customer '{}' is linked to a different account",
                customer_id
            ),
            Self::NotConfigured { setting } => {
                write!(f, "Billing is not configured: {} is not set", setting)
            }
            Self::InvalidWebhookSignature => write!(f, "Invalid webhook signature"),
            Self::InvalidSignatureHeader { reason } => {
                write!(f, "Invalid signature header: {}", reason)
            }
            Self::WebhookTimestampExpired { age_seconds } => {
                write!(f, "Webhook timestamp expired ({} seconds old)", age_seconds)
            }
            Self::InvalidWebhookPayload { message } => {
                write!(f, "Invalid webhook payload: {}", message)
            }
            Self::ProviderApi {
                operation,
                message,
                code,
                http_status,
            } => {
                write!(f, "Stripe API error during '{}': {}", operation, message)?;
                if let Some(code) = code {
                    write!(f, " (code: {})", code)?;
                }
                if let Some(status) = http_status {
                    write!(f, " [HTTP {}]", status)?;
                }
                Ok(())
            }
            Self::ProviderTimeout { operation, seconds } => {
                write!(f, "Stripe call '{}' timed out after {} seconds", operation, seconds)
            }
            Self::Internal { message } => write!(f, "Internal billing error: {}", message),
        }
    }
}

impl std::error::Error for BillingError {}

impl From<BillingError> for crate::error::InkflowError {
    fn from(err: BillingError) -> Self {
        use crate::error::InkflowError;

        match &err {
            BillingError::InvalidTier { .. }
            | BillingError::TierNotPurchasable { .. }
            | BillingError::InvalidBillingPeriod { .. }
            | BillingError::MissingField { .. }
            | BillingError::InvalidUsageAmount { .. }
            | BillingError::InvalidAction { .. }
            | BillingError::CustomerOwnedByOtherUser { .. }
            | BillingError::InvalidWebhookPayload { .. } => {
                InkflowError::Validation(err.to_string())
            }

            BillingError::EntitlementNotFound { .. } | BillingError::NoCustomer { .. } => {
                InkflowError::NotFound(err.to_string())
            }

            BillingError::NotConfigured { .. } => InkflowError::Configuration(err.to_string()),

            BillingError::InvalidWebhookSignature
            | BillingError::InvalidSignatureHeader { .. }
            | BillingError::WebhookTimestampExpired { .. } => {
                InkflowError::Authentication(err.to_string())
            }

            BillingError::ProviderApi { .. } | BillingError::ProviderTimeout { .. } => {
                InkflowError::Upstream(err.to_string())
            }

            BillingError::Internal { .. } => InkflowError::Internal(err.to_string()),
        }
    }
}

impl BillingError {
    /// Whether the caller must change its input to succeed.
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidTier { .. }
                | Self::TierNotPurchasable { .. }
                | Self::InvalidBillingPeriod { .. }
                | Self::MissingField { .. }
                | Self::InvalidUsageAmount { .. }
                | Self::InvalidAction { .. }
                | Self::EntitlementNotFound { .. }
                | Self::NoCustomer { .. }
                | Self::CustomerOwnedByOtherUser { .. }
                | Self::InvalidWebhookSignature
                | Self::InvalidSignatureHeader { .. }
                | Self::WebhookTimestampExpired { .. }
                | Self::InvalidWebhookPayload { .. }
        )
    }
}

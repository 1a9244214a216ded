//! Audit logging for billing operations.
//!
//! Every state change driven by checkout, webhooks or manual sync emits a
//! [`BillingAuditEvent`]. Trial and payment-failure alerts travel the same
//! channel so that an implementation can forward them to email or chat.

use async_trait::async_trait;
use std::fmt;

/// Audit event types for billing operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BillingAuditEvent {
    CheckoutCreated {
        user_id: String,
        tier: String,
        billing_period: String,
        session_id: String,
    },
    CustomerCreated {
        user_id: String,
        customer_id: String,
    },
    PortalSessionCreated {
        user_id: String,
        session_id: String,
    },
    /// Entitlement written from a provider event or manual sync.
    EntitlementUpdated {
        user_id: String,
        tier: String,
        status: String,
        source: String,
    },
    SubscriptionCanceled {
        user_id: String,
        subscription_id: String,
    },
    /// The provider announced the end of a trial (usually three days ahead).
    TrialEnding {
        user_id: String,
        subscription_id: String,
        trial_ends_at: Option<u64>,
    },
    PaymentFailed {
        user_id: String,
        invoice_id: String,
    },
    WebhookProcessed {
        event_id: String,
        event_type: String,
        outcome: String,
    },
    SyncCompleted {
        user_id: String,
        tier: Option<String>,
        message: String,
    },
}

impl fmt::Display for BillingAuditEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CheckoutCreated {
                user_id,
                tier,
                billing_period,
                session_id,
            } => write!(
                f,
                "Checkout created: user={}, tier={}, period={}, session={}",
                user_id, tier, billing_period, session_id
            ),
            Self::CustomerCreated {
                user_id,
                customer_id,
            } => write!(f, "Customer created: user={}, customer={}", user_id, customer_id),
            Self::PortalSessionCreated {
                user_id,
                session_id,
            } => write!(f, "Portal session created: user={}, session={}", user_id, session_id),
            Self::EntitlementUpdated {
                user_id,
                tier,
                status,
                source,
            } => write!(
                f,
                "Entitlement updated: user={}, tier={}, status={}, source={}",
                user_id, tier, status, source
            ),
            Self::SubscriptionCanceled {
                user_id,
                subscription_id,
            } => write!(
                f,
                "Subscription canceled: user={}, sub={}",
                user_id, subscription_id
            ),
            Self::TrialEnding {
                user_id,
                subscription_id,
                trial_ends_at,
            } => match trial_ends_at {
                Some(at) => write!(
                    f,
                    "Trial ending: user={}, sub={}, ends_at={}",
                    user_id, subscription_id, at
                ),
                None => write!(f, "Trial ending: user={}, sub={}", user_id, subscription_id),
            },
            Self::PaymentFailed {
                user_id,
                invoice_id,
            } => write!(f, "Payment failed: user={}, invoice={}", user_id, invoice_id),
            Self::WebhookProcessed {
                event_id,
                event_type,
                outcome,
            } => write!(
                f,
                "Webhook processed: event={}, type={}, outcome={}",
                event_id, event_type, outcome
            ),
            Self::SyncCompleted {
                user_id,
                tier,
                message,
            } => write!(
                f,
                "Sync completed: user={}, tier={}, message={}",
                user_id,
                tier.as_deref().unwrap_or("-"),
                message
            ),
        }
    }
}

impl BillingAuditEvent {
    /// Event kind for structured logging.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CheckoutCreated { .. } => "checkout_created",
            Self::CustomerCreated { .. } => "customer_created",
            Self::PortalSessionCreated { .. } => "portal_session_created",
            Self::EntitlementUpdated { .. } => "entitlement_updated",
            Self::SubscriptionCanceled { .. } => "subscription_canceled",
            Self::TrialEnding { .. } => "trial_ending",
            Self::PaymentFailed { .. } => "payment_failed",
            Self::WebhookProcessed { .. } => "webhook_processed",
            Self::SyncCompleted { .. } => "sync_completed",
        }
    }

    /// Whether someone should be told about this event.
    #[must_use]
    pub fn is_alert(&self) -> bool {
        matches!(self, Self::TrialEnding { .. } | Self::PaymentFailed { .. })
    }
}

/// Trait for audit logging backends.
///
/// Implementations must not fail the billing operation: handle delivery
/// errors internally.
#[async_trait]
pub trait BillingAuditLogger: Send + Sync {
    async fn log(&self, event: BillingAuditEvent);
}

/// Audit logger that discards events.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpAuditLogger;

#[async_trait]
impl BillingAuditLogger for NoOpAuditLogger {
    async fn log(&self, _event: BillingAuditEvent) {}
}

/// Tracing-based audit logger.
///
/// Alerts are logged at WARN, everything else at INFO.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditLogger;

#[async_trait]
impl BillingAuditLogger for TracingAuditLogger {
    async fn log(&self, event: BillingAuditEvent) {
        if event.is_alert() {
            tracing::warn!(
                target: "billing::audit",
                event_type = %event.kind(),
                "{}", event
            );
        } else {
            tracing::info!(
                target: "billing::audit",
                event_type = %event.kind(),
                "{}", event
            );
        }
    }
}

/// Audit logger that keeps events in memory.
#[cfg(any(test, feature = "test-billing"))]
pub mod test {
    use super::*;
    use std::sync::Arc;
    use tokio::sync::Mutex;

    #[derive(Debug, Default, Clone)]
    pub struct RecordingAuditLogger {
        events: Arc<Mutex<Vec<BillingAuditEvent>>>,
    }

    impl RecordingAuditLogger {
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        pub async fn events(&self) -> Vec<BillingAuditEvent> {
            self.events.lock().await.clone()
        }

        /// Recorded events of one kind.
        pub async fn events_of(&self, kind: &str) -> Vec<BillingAuditEvent> {
            self.events
                .lock()
                .await
                .iter()
                .filter(|e| e.kind() == kind)
                .cloned()
                .collect()
        }
    }

    #[async_trait]
    impl BillingAuditLogger for RecordingAuditLogger {
        async fn log(&self, event: BillingAuditEvent) {
            self.events.lock().await.push(event);
        }
    }
}

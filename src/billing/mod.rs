//! Subscription entitlement core.
//!
//! Keeps one entitlement record per user consistent with Stripe's
//! asynchronous event stream and answers synchronous gating questions.
//!
//! # Example
//!
//! ```rust,ignore
//! use inkflow::billing::{
//!     BillingEventReconciler, EntitlementQueryService, GatedAction, InMemoryEntitlementStore,
//!     PriceCatalog,
//! };
//!
//! let store = Arc::new(InMemoryEntitlementStore::new());
//! let catalog = PriceCatalog::new(Some("price_pro_m".into()), Some("price_pro_y".into()));
//!
//! let reconciler = BillingEventReconciler::new(store.clone(), catalog)
//!     .with_provider(provider)
//!     .with_webhook_secret(webhook_secret);
//! let outcome = reconciler.process(&body, signature).await?;
//!
//! let entitlements = EntitlementQueryService::new(store);
//! let decision = entitlements
//!     .can_perform(&user_id, GatedAction::CreateAgent, None, unix_now())
//!     .await?;
//! ```

pub mod audit;
pub mod checkout;
pub mod entitlements;
pub mod error;
pub mod live_client;
pub mod portal;
pub mod provider;
pub mod reconciler;
pub mod sea_orm_store;
pub mod storage;
pub mod sync;
pub mod tier;
pub mod webhook;

pub use audit::{BillingAuditEvent, BillingAuditLogger, NoOpAuditLogger, TracingAuditLogger};
pub use checkout::{CheckoutInitiator, CheckoutRequest, CheckoutResponse};
pub use entitlements::{
    Decision, EntitlementQueryService, EntitlementSummary, GatedAction, UsageDecision,
};
pub use error::BillingError;
pub use live_client::{InvalidApiKeyError, StripeBillingProvider};
pub use portal::{PortalInitiator, PortalRequest, PortalResponse};
pub use provider::{
    BillingProvider, CreateCheckoutSession, HostedSession, ProviderCustomer, ProviderSubscription,
};
pub use reconciler::{BillingEventReconciler, WebhookOutcome};
pub use sea_orm_store::SeaOrmEntitlementStore;
pub use storage::{
    EntitlementRecord, EntitlementStore, EntitlementUpdate, InMemoryEntitlementStore,
    MAX_USAGE_AMOUNT, SubscriptionStatus, UsageOutcome,
};
pub use sync::{DriftReconciler, SyncRequest, SyncResult};
pub use tier::{BillingPeriod, DEFAULT_PERIOD_SECONDS, PriceCatalog, Tier, UNLIMITED_TOKENS};
pub use webhook::{BillingEvent, WebhookEvent, signature_header, verify_signature};

#[cfg(any(test, feature = "test-billing"))]
pub use audit::test::RecordingAuditLogger;

#[cfg(any(test, feature = "test-billing"))]
pub use provider::test::MockBillingProvider;

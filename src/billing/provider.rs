//! Billing provider abstraction.
//!
//! Everything the subscription core needs from Stripe sits behind
//! [`BillingProvider`], so one client can be built at startup and shared as
//! `Arc<dyn BillingProvider>`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::tier::{BillingPeriod, Tier};
use crate::error::Result;

/// Metadata key carrying the internal user id on customers, sessions and subscriptions.
pub const META_USER_ID: &str = "userId";
/// Metadata key carrying the purchased tier.
pub const META_TIER: &str = "tier";
/// Metadata key carrying the purchased billing period.
pub const META_BILLING_PERIOD: &str = "billingPeriod";

/// Subscription as reported by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderSubscription {
    pub id: String,
    pub customer_id: String,
    /// Raw provider status (`trialing`, `active`, `past_due`, ...).
    pub status: String,
    /// Price of the first subscription item.
    pub price_id: Option<String>,
    pub current_period_start: u64,
    pub current_period_end: u64,
    pub trial_end: Option<u64>,
    pub cancel_at_period_end: bool,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl ProviderSubscription {
    /// Whether the subscription still grants access.
    #[must_use]
    pub fn is_live(&self) -> bool {
        matches!(
            self.status.as_str(),
            "active" | "trialing" | "past_due" | "unpaid"
        )
    }

    /// Internal user id stamped on the subscription at checkout.
    #[must_use]
    pub fn user_id(&self) -> Option<&str> {
        self.metadata
            .get(META_USER_ID)
            .map(String::as_str)
            .filter(|s| !s.is_empty())
    }
}

/// Customer as reported by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderCustomer {
    pub id: String,
    /// Internal user id stamped on the customer when it was created.
    pub user_id: Option<String>,
}

impl ProviderCustomer {
    #[must_use]
    pub fn new(id: impl Into<String>, user_id: Option<String>) -> Self {
        Self {
            id: id.into(),
            user_id: user_id.filter(|u| !u.is_empty()),
        }
    }

    /// Whether the customer is stamped with a user id other than `user_id`.
    ///
    /// Customers created outside checkout carry no user id and belong to nobody.
    #[must_use]
    pub fn is_owned_by_other(&self, user_id: &str) -> bool {
        self.user_id.as_deref().is_some_and(|owner| owner != user_id)
    }
}

/// Request to create a hosted checkout session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateCheckoutSession {
    pub customer_id: String,
    pub price_id: String,
    pub user_id: String,
    pub tier: Tier,
    pub billing_period: BillingPeriod,
    pub trial_period_days: Option<u32>,
    pub success_url: String,
    pub cancel_url: String,
}

impl CreateCheckoutSession {
    /// Metadata stamped on both the session and the subscription it creates.
    #[must_use]
    pub fn metadata(&self) -> HashMap<String, String> {
        HashMap::from([
            (META_USER_ID.to_string(), self.user_id.clone()),
            (META_TIER.to_string(), self.tier.as_str().to_string()),
            (
                META_BILLING_PERIOD.to_string(),
                self.billing_period.as_str().to_string(),
            ),
        ])
    }
}

/// Provider-hosted page (checkout or billing portal).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostedSession {
    pub id: String,
    pub url: String,
}

/// Stripe operations used by checkout, the webhook reconciler and manual sync.
#[async_trait]
pub trait BillingProvider: Send + Sync {
    /// Find an existing customer by email.
    async fn find_customer_by_email(&self, email: &str) -> Result<Option<ProviderCustomer>>;

    /// Create a customer tagged with the internal user id.
    async fn create_customer(&self, email: &str, user_id: &str) -> Result<String>;

    /// Fetch a subscription by id.
    async fn get_subscription(&self, subscription_id: &str) -> Result<ProviderSubscription>;

    /// List every subscription of a customer, in any status.
    async fn list_subscriptions(&self, customer_id: &str) -> Result<Vec<ProviderSubscription>>;

    /// Create a subscription-mode checkout session.
    async fn create_checkout_session(&self, request: CreateCheckoutSession)
    -> Result<HostedSession>;

    /// Create a billing portal session for a customer.
    async fn create_portal_session(
        &self,
        customer_id: &str,
        return_url: &str,
    ) -> Result<HostedSession>;
}

/// In-memory provider double for tests.
#[cfg(any(test, feature = "test-billing"))]
pub mod test {
    use super::*;
    use crate::billing::error::BillingError;
    use std::sync::RwLock;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

    #[derive(Default)]
    struct MockState {
        customers: HashMap<String, ProviderCustomer>,
        subscriptions: Vec<ProviderSubscription>,
        checkout_requests: Vec<CreateCheckoutSession>,
    }

    /// Mock Stripe provider.
    ///
    /// Customers and subscriptions are seeded with the `with_*` builders.
    /// Created sessions are recorded for assertions.
    #[derive(Default)]
    pub struct MockBillingProvider {
        state: RwLock<MockState>,
        customer_counter: AtomicU64,
        session_counter: AtomicU64,
        failing: AtomicBool,
    }

    impl MockBillingProvider {
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Seed a customer without a user id.
        #[must_use]
        pub fn with_customer(self, email: &str, customer_id: &str) -> Self {
            self.state
                .write()
                .unwrap()
                .customers
                .insert(email.to_string(), ProviderCustomer::new(customer_id, None));
            self
        }

        /// Seed a customer created by checkout for `user_id`.
        #[must_use]
        pub fn with_customer_of(self, email: &str, customer_id: &str, user_id: &str) -> Self {
            self.state.write().unwrap().customers.insert(
                email.to_string(),
                ProviderCustomer::new(customer_id, Some(user_id.to_string())),
            );
            self
        }

        /// Seed a subscription.
        #[must_use]
        pub fn with_subscription(self, subscription: ProviderSubscription) -> Self {
            self.state.write().unwrap().subscriptions.push(subscription);
            self
        }

        /// Make every call fail with an upstream error.
        pub fn set_failing(&self, failing: bool) {
            self.failing.store(failing, Ordering::SeqCst);
        }

        /// Checkout requests received so far.
        pub fn checkout_requests(&self) -> Vec<CreateCheckoutSession> {
            self.state.read().unwrap().checkout_requests.clone()
        }

        /// Number of customers created through the provider.
        pub fn customers_created(&self) -> u64 {
            self.customer_counter.load(Ordering::SeqCst)
        }

        fn check(&self, operation: &str) -> Result<()> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(BillingError::ProviderApi {
                    operation: operation.to_string(),
                    message: "mock provider failure".to_string(),
                    code: None,
                    http_status: Some(500),
                }
                .into());
            }
            Ok(())
        }
    }

    #[async_trait]
    impl BillingProvider for MockBillingProvider {
        async fn find_customer_by_email(&self, email: &str) -> Result<Option<ProviderCustomer>> {
            self.check("find_customer_by_email")?;
            Ok(self.state.read().unwrap().customers.get(email).cloned())
        }

        async fn create_customer(&self, email: &str, user_id: &str) -> Result<String> {
            self.check("create_customer")?;
            let id = format!(
                "cus_mock_{}",
                self.customer_counter.fetch_add(1, Ordering::SeqCst)
            );
            self.state.write().unwrap().customers.insert(
                email.to_string(),
                ProviderCustomer::new(id.clone(), Some(user_id.to_string())),
            );
            Ok(id)
        }

        async fn get_subscription(&self, subscription_id: &str) -> Result<ProviderSubscription> {
            self.check("get_subscription")?;
            self.state
                .read()
                .unwrap()
                .subscriptions
                .iter()
                .find(|s| s.id == subscription_id)
                .cloned()
                .ok_or_else(|| {
                    BillingError::ProviderApi {
                        operation: "get_subscription".to_string(),
                        message: format!("No such subscription: '{}'", subscription_id),
                        code: Some("resource_missing".to_string()),
                        http_status: Some(404),
                    }
                    .into()
                })
        }

        async fn list_subscriptions(
            &self,
            customer_id: &str,
        ) -> Result<Vec<ProviderSubscription>> {
            self.check("list_subscriptions")?;
            Ok(self
                .state
                .read()
                .unwrap()
                .subscriptions
                .iter()
                .filter(|s| s.customer_id == customer_id)
                .cloned()
                .collect())
        }

        async fn create_checkout_session(
            &self,
            request: CreateCheckoutSession,
        ) -> Result<HostedSession> {
            self.check("create_checkout_session")?;
            let id = format!(
                "cs_test_{}",
                self.session_counter.fetch_add(1, Ordering::SeqCst)
            );
            self.state.write().unwrap().checkout_requests.push(request);
            Ok(HostedSession {
                url: format!("https://checkout.stripe.com/c/pay/{}", id),
                id,
            })
        }

        async fn create_portal_session(
            &self,
            customer_id: &str,
            return_url: &str,
        ) -> Result<HostedSession> {
            self.check("create_portal_session")?;
            let id = format!(
                "bps_mock_{}",
                self.session_counter.fetch_add(1, Ordering::SeqCst)
            );
            Ok(HostedSession {
                url: format!(
                    "https://billing.stripe.com/p/session/{}?customer={}&return={}",
                    id, customer_id, return_url
                ),
                id,
            })
        }
    }

    /// Subscription fixture in the `active` state with the given price.
    #[must_use]
    pub fn subscription(id: &str, customer_id: &str, price_id: &str) -> ProviderSubscription {
        ProviderSubscription {
            id: id.to_string(),
            customer_id: customer_id.to_string(),
            status: "active".to_string(),
            price_id: Some(price_id.to_string()),
            current_period_start: 1_700_000_000,
            current_period_end: 1_700_000_000 + 30 * crate::utils::SECONDS_PER_DAY,
            trial_end: None,
            cancel_at_period_end: false,
            metadata: HashMap::new(),
        }
    }
}

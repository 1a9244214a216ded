//! Live Stripe provider.
//!
//! Secure API key handling, a per-call timeout and error mapping into
//! [`BillingError`]. Calls are not retried: webhook deliveries are retried by
//! Stripe itself and interactive calls report failure to the user.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use super::error::BillingError;
use super::provider::{
    BillingProvider, CreateCheckoutSession, HostedSession, META_USER_ID, ProviderCustomer,
    ProviderSubscription,
};
use crate::error::{InkflowError, Result};

/// Error returned when API key validation fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidApiKeyError {
    pub reason: String,
}

impl std::fmt::Display for InvalidApiKeyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Invalid Stripe API key: {}", self.reason)
    }
}

impl std::error::Error for InvalidApiKeyError {}

/// Validate a Stripe secret or restricted key.
fn validate_api_key(key: &str) -> std::result::Result<(), InvalidApiKeyError> {
    const MIN_KEY_LENGTH: usize = 20;
    const PREFIXES: [&str; 4] = ["sk_test_", "sk_live_", "rk_test_", "rk_live_"];

    if key.is_empty() {
        return Err(InvalidApiKeyError {
            reason: "API key cannot be empty".to_string(),
        });
    }
    if key.len() < MIN_KEY_LENGTH {
        return Err(InvalidApiKeyError {
            reason: format!("API key too short (minimum {} characters)", MIN_KEY_LENGTH),
        });
    }
    if !PREFIXES.iter().any(|prefix| key.starts_with(prefix)) {
        return Err(InvalidApiKeyError {
            reason: "API key must start with sk_test_, sk_live_, rk_test_, or rk_live_"
                .to_string(),
        });
    }

    Ok(())
}

/// Stripe's maximum page size for list endpoints.
const SUBSCRIPTION_PAGE_SIZE: u64 = 100;
const MAX_SUBSCRIPTION_PAGES: usize = 10;

/// One page of a cursor-paginated listing.
struct Page<T> {
    items: Vec<T>,
    has_more: bool,
}

/// Follow `starting_after` cursors until the listing is exhausted or
/// `max_pages` pages were read. The flag is set when pages were left unread.
async fn collect_pages<T, C, K, F, Fut>(
    max_pages: usize,
    cursor_of: K,
    mut fetch: F,
) -> Result<(Vec<T>, bool)>
where
    K: Fn(&T) -> C,
    F: FnMut(Option<C>) -> Fut,
    Fut: Future<Output = Result<Page<T>>>,
{
    let mut items = Vec::new();
    let mut cursor = None;

    for _ in 0..max_pages {
        let page = fetch(cursor.take()).await?;
        let next = page.items.last().map(&cursor_of);
        items.extend(page.items);

        match next {
            Some(next) if page.has_more => cursor = Some(next),
            _ => return Ok((items, false)),
        }
    }

    Ok((items, true))
}

fn parse_customer_id(id: &str) -> Result<stripe::CustomerId> {
    id.parse()
        .map_err(|_| InkflowError::validation(format!("Invalid customer ID: {}", id)))
}

fn parse_subscription_id(id: &str) -> Result<stripe::SubscriptionId> {
    id.parse()
        .map_err(|_| InkflowError::validation(format!("Invalid subscription ID: {}", id)))
}

/// Stripe-backed [`BillingProvider`].
#[derive(Clone)]
pub struct StripeBillingProvider {
    client: stripe::Client,
    api_key: SecretString,
    timeout: Duration,
}

impl StripeBillingProvider {
    /// Create a provider from a secret key.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is not a Stripe secret or restricted key.
    pub fn new(
        api_key: impl Into<SecretString>,
        timeout: Duration,
    ) -> std::result::Result<Self, InvalidApiKeyError> {
        let api_key: SecretString = api_key.into();
        validate_api_key(api_key.expose_secret())?;

        let client = stripe::Client::new(api_key.expose_secret()).with_app_info(
            "inkflow".to_string(),
            Some(env!("CARGO_PKG_VERSION").to_string()),
            None,
        );

        Ok(Self {
            client,
            api_key,
            timeout,
        })
    }

    #[must_use]
    pub fn is_test_mode(&self) -> bool {
        let key = self.api_key.expose_secret();
        key.starts_with("sk_test_") || key.starts_with("rk_test_")
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn idempotency_key(operation: &str) -> String {
        format!("{}_{}", operation, uuid::Uuid::new_v4())
    }

    /// Client that sends an idempotency key, for mutating calls.
    fn idempotent_client(&self, operation: &str) -> stripe::Client {
        self.client
            .clone()
            .with_strategy(stripe::RequestStrategy::Idempotent(Self::idempotency_key(
                operation,
            )))
    }

    /// Run one Stripe request under the configured timeout.
    async fn call<T, F>(&self, operation: &str, request: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, stripe::StripeError>>,
    {
        match tokio::time::timeout(self.timeout, request).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                tracing::warn!(
                    target: "inkflow::billing::stripe",
                    operation = operation,
                    error = %e,
                    "Stripe API call failed"
                );
                Err(map_stripe_error(e, operation))
            }
            Err(_elapsed) => {
                tracing::warn!(
                    target: "inkflow::billing::stripe",
                    operation = operation,
                    timeout_seconds = self.timeout.as_secs(),
                    "Stripe API call timed out"
                );
                Err(BillingError::ProviderTimeout {
                    operation: operation.to_string(),
                    seconds: self.timeout.as_secs(),
                }
                .into())
            }
        }
    }
}

impl std::fmt::Debug for StripeBillingProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StripeBillingProvider")
            .field("timeout", &self.timeout)
            .field("is_test_mode", &self.is_test_mode())
            .finish_non_exhaustive()
    }
}

fn map_stripe_error(error: stripe::StripeError, operation: &str) -> InkflowError {
    match error {
        stripe::StripeError::Stripe(request_error) => BillingError::ProviderApi {
            operation: operation.to_string(),
            message: request_error
                .message
                .clone()
                .unwrap_or_else(|| "Unknown error".to_string()),
            code: request_error.code.as_ref().map(|c| format!("{c:?}")),
            http_status: Some(request_error.http_status),
        }
        .into(),
        stripe::StripeError::QueryStringSerialize(e) => BillingError::Internal {
            message: format!("Failed to serialize request: {e}"),
        }
        .into(),
        stripe::StripeError::JSONSerialize(e) => BillingError::Internal {
            message: format!("Failed to serialize JSON: {e}"),
        }
        .into(),
        stripe::StripeError::UnsupportedVersion => BillingError::Internal {
            message: "Unsupported Stripe API version".to_string(),
        }
        .into(),
        stripe::StripeError::ClientError(msg) => BillingError::ProviderApi {
            operation: operation.to_string(),
            message: format!("HTTP client error: {msg}"),
            code: None,
            http_status: None,
        }
        .into(),
        stripe::StripeError::Timeout => BillingError::ProviderApi {
            operation: operation.to_string(),
            message: "Request timed out".to_string(),
            code: None,
            http_status: Some(408),
        }
        .into(),
    }
}

fn status_str(status: &stripe::SubscriptionStatus) -> &'static str {
    match status {
        stripe::SubscriptionStatus::Active => "active",
        stripe::SubscriptionStatus::Canceled => "canceled",
        stripe::SubscriptionStatus::Incomplete => "incomplete",
        stripe::SubscriptionStatus::IncompleteExpired => "incomplete_expired",
        stripe::SubscriptionStatus::PastDue => "past_due",
        stripe::SubscriptionStatus::Trialing => "trialing",
        stripe::SubscriptionStatus::Unpaid => "unpaid",
        stripe::SubscriptionStatus::Paused => "paused",
    }
}

fn map_subscription(sub: stripe::Subscription) -> ProviderSubscription {
    let price_id = sub
        .items
        .data
        .first()
        .and_then(|item| item.price.as_ref())
        .map(|price| price.id.to_string());

    ProviderSubscription {
        id: sub.id.to_string(),
        customer_id: sub.customer.id().to_string(),
        status: status_str(&sub.status).to_string(),
        price_id,
        current_period_start: sub.current_period_start.max(0) as u64,
        current_period_end: sub.current_period_end.max(0) as u64,
        trial_end: sub.trial_end.map(|t| t.max(0) as u64),
        cancel_at_period_end: sub.cancel_at_period_end,
        metadata: sub.metadata,
    }
}

#[async_trait]
impl BillingProvider for StripeBillingProvider {
    async fn find_customer_by_email(&self, email: &str) -> Result<Option<ProviderCustomer>> {
        let mut params = stripe::ListCustomers::new();
        params.email = Some(email);
        params.limit = Some(1);

        let customers = self
            .call(
                "find_customer_by_email",
                stripe::Customer::list(&self.client, &params),
            )
            .await?;

        Ok(customers.data.first().map(|c| {
            let user_id = c
                .metadata
                .as_ref()
                .and_then(|metadata| metadata.get(META_USER_ID))
                .cloned();
            ProviderCustomer::new(c.id.to_string(), user_id)
        }))
    }

    async fn create_customer(&self, email: &str, user_id: &str) -> Result<String> {
        let client = self.idempotent_client("create_customer");

        let mut params = stripe::CreateCustomer::new();
        params.email = Some(email);
        params.metadata = Some(HashMap::from([(
            META_USER_ID.to_string(),
            user_id.to_string(),
        )]));

        let customer = self
            .call("create_customer", stripe::Customer::create(&client, params))
            .await?;

        Ok(customer.id.to_string())
    }

    async fn get_subscription(&self, subscription_id: &str) -> Result<ProviderSubscription> {
        let sub_id = parse_subscription_id(subscription_id)?;

        let subscription = self
            .call(
                "get_subscription",
                stripe::Subscription::retrieve(&self.client, &sub_id, &[]),
            )
            .await?;

        Ok(map_subscription(subscription))
    }

    async fn list_subscriptions(&self, customer_id: &str) -> Result<Vec<ProviderSubscription>> {
        let customer = parse_customer_id(customer_id)?;

        let (subscriptions, truncated) = collect_pages(
            MAX_SUBSCRIPTION_PAGES,
            |sub: &stripe::Subscription| sub.id.clone(),
            |starting_after| {
                let params = stripe::ListSubscriptions {
                    customer: Some(customer.clone()),
                    status: Some(stripe::SubscriptionStatusFilter::All),
                    limit: Some(SUBSCRIPTION_PAGE_SIZE),
                    starting_after,
                    ..Default::default()
                };
                async move {
                    let list = self
                        .call(
                            "list_subscriptions",
                            stripe::Subscription::list(&self.client, &params),
                        )
                        .await?;
                    Ok(Page {
                        items: list.data,
                        has_more: list.has_more,
                    })
                }
            },
        )
        .await?;

        if truncated {
            tracing::warn!(
                target: "inkflow::billing::stripe",
                customer_id = %customer_id,
                count = subscriptions.len(),
                "Subscription listing truncated"
            );
        }

        Ok(subscriptions.into_iter().map(map_subscription).collect())
    }

    async fn create_checkout_session(
        &self,
        request: CreateCheckoutSession,
    ) -> Result<HostedSession> {
        let client = self.idempotent_client("create_checkout_session");
        let metadata = request.metadata();

        let mut params = stripe::CreateCheckoutSession::new();
        params.customer = Some(parse_customer_id(&request.customer_id)?);
        params.mode = Some(stripe::CheckoutSessionMode::Subscription);
        params.success_url = Some(&request.success_url);
        params.cancel_url = Some(&request.cancel_url);
        params.line_items = Some(vec![stripe::CreateCheckoutSessionLineItems {
            price: Some(request.price_id.clone()),
            quantity: Some(1),
            ..Default::default()
        }]);
        params.subscription_data = Some(stripe::CreateCheckoutSessionSubscriptionData {
            trial_period_days: request.trial_period_days,
            metadata: Some(metadata.clone()),
            ..Default::default()
        });
        params.metadata = Some(metadata);

        let session = self
            .call(
                "create_checkout_session",
                stripe::CheckoutSession::create(&client, params),
            )
            .await?;

        let url = session
            .url
            .ok_or_else(|| InkflowError::upstream("Checkout session URL missing"))?;

        Ok(HostedSession {
            id: session.id.to_string(),
            url,
        })
    }

    async fn create_portal_session(
        &self,
        customer_id: &str,
        return_url: &str,
    ) -> Result<HostedSession> {
        let mut params = stripe::CreateBillingPortalSession::new(parse_customer_id(customer_id)?);
        params.return_url = Some(return_url);

        let session = self
            .call(
                "create_portal_session",
                stripe::BillingPortalSession::create(&self.client, params),
            )
            .await?;

        Ok(HostedSession {
            id: session.id.to_string(),
            url: session.url,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_api_key() {
        assert!(validate_api_key("sk_test_1234567890abcdef").is_ok());
        assert!(validate_api_key("rk_live_1234567890abcdef").is_ok());

        assert!(validate_api_key("").is_err());
        assert!(validate_api_key("sk_test_short").is_err());
        assert!(validate_api_key("pk_test_1234567890abcdef").is_err());
    }

    #[test]
    fn test_debug_does_not_expose_api_key() {
        let provider =
            StripeBillingProvider::new("sk_test_secret_key_1234567890", Duration::from_secs(5))
                .unwrap();
        let debug_output = format!("{:?}", provider);

        assert!(!debug_output.contains("sk_test_secret_key_1234567890"));
        assert!(debug_output.contains("is_test_mode: true"));
    }

    #[test]
    fn test_idempotency_keys_are_unique() {
        let a = StripeBillingProvider::idempotency_key("create_customer");
        let b = StripeBillingProvider::idempotency_key("create_customer");

        assert!(a.starts_with("create_customer_"));
        assert_ne!(a, b);
    }

    #[test]
    fn test_parse_ids() {
        assert!(parse_customer_id("cus_123").is_ok());
        assert!(parse_subscription_id("sub_123").is_ok());
        assert!(matches!(
            parse_customer_id("sub_123"),
            Err(InkflowError::Validation(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_times_out() {
        let provider =
            StripeBillingProvider::new("sk_test_1234567890abcdef", Duration::from_millis(10))
                .unwrap();

        let result: Result<()> = provider
            .call("get_subscription", async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(InkflowError::Upstream(_))));
    }

    #[tokio::test]
    async fn test_call_maps_client_errors() {
        let provider =
            StripeBillingProvider::new("sk_test_1234567890abcdef", Duration::from_secs(1))
                .unwrap();

        let result: Result<()> = provider
            .call("list_subscriptions", async {
                Err(stripe::StripeError::ClientError("connection reset".to_string()))
            })
            .await;

        match result {
            Err(InkflowError::Upstream(message)) => assert!(message.contains("connection reset")),
            other => panic!("expected upstream error, got {:?}", other),
        }
    }

    fn page_of(all: &[u32], after: Option<u32>, size: usize) -> Page<u32> {
        let start = after.map_or(0, |id| id as usize);
        let items: Vec<u32> = all.iter().copied().skip(start).take(size).collect();
        Page {
            has_more: start + items.len() < all.len(),
            items,
        }
    }

    #[tokio::test]
    async fn test_collect_pages_follows_cursor() {
        let all: Vec<u32> = (1..=7).collect();
        let mut cursors = Vec::new();

        let (items, truncated) = collect_pages(
            10,
            |id: &u32| *id,
            |after| {
                cursors.push(after);
                let page = page_of(&all, after, 3);
                async move { Ok(page) }
            },
        )
        .await
        .unwrap();

        assert_eq!(items, all);
        assert!(!truncated);
        assert_eq!(cursors, vec![None, Some(3), Some(6)]);
    }

    #[tokio::test]
    async fn test_collect_pages_stops_at_page_cap() {
        let all: Vec<u32> = (1..=10).collect();

        let (items, truncated) = collect_pages(
            2,
            |id: &u32| *id,
            |after| {
                let page = page_of(&all, after, 3);
                async move { Ok(page) }
            },
        )
        .await
        .unwrap();

        assert_eq!(items, vec![1, 2, 3, 4, 5, 6]);
        assert!(truncated);
    }

    #[tokio::test]
    async fn test_collect_pages_propagates_errors() {
        let result: Result<(Vec<u32>, bool)> = collect_pages(
            3,
            |id: &u32| *id,
            |after: Option<u32>| async move {
                match after {
                    None => Ok(Page {
                        items: vec![1],
                        has_more: true,
                    }),
                    Some(_) => Err(InkflowError::upstream("page failed")),
                }
            },
        )
        .await;

        assert!(matches!(result, Err(InkflowError::Upstream(_))));
    }
}

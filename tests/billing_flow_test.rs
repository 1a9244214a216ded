//! End-to-end billing flows through the HTTP router.
//!
//! Drives signed Stripe deliveries, entitlement checks, usage metering and
//! manual sync against an in-memory store and a local provider stub.

use async_trait::async_trait;
use axum::Router;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use inkflow::billing::{
    BillingProvider, CreateCheckoutSession, EntitlementStore, HostedSession,
    InMemoryEntitlementStore, ProviderCustomer, ProviderSubscription,
};
use inkflow::testing::{self, EventFixture};
use inkflow::{App, AppContext, ConfigBuilder, InkflowError, Result, unix_now};

const WEBHOOK_SECRET: &str = "whsec_integration_secret";
const PRO_MONTHLY: &str = "price_pro_monthly";
const PRO_YEARLY: &str = "price_pro_yearly";

/// Provider stub holding subscriptions and customers in memory.
#[derive(Default)]
struct StubProvider {
    subscriptions: Mutex<HashMap<String, ProviderSubscription>>,
    customers: Mutex<HashMap<String, String>>,
}

impl StubProvider {
    fn add_subscription(&self, sub: ProviderSubscription) {
        self.subscriptions
            .lock()
            .unwrap()
            .insert(sub.id.clone(), sub);
    }

    fn add_customer(&self, email: &str, customer_id: &str) {
        self.customers
            .lock()
            .unwrap()
            .insert(email.to_string(), customer_id.to_string());
    }
}

#[async_trait]
impl BillingProvider for StubProvider {
    async fn find_customer_by_email(&self, email: &str) -> Result<Option<ProviderCustomer>> {
        Ok(self
            .customers
            .lock()
            .unwrap()
            .get(email)
            .map(|id| ProviderCustomer::new(id.clone(), None)))
    }

    async fn create_customer(&self, email: &str, _user_id: &str) -> Result<String> {
        let id = format!("cus_{}", email.len());
        self.add_customer(email, &id);
        Ok(id)
    }

    async fn get_subscription(&self, subscription_id: &str) -> Result<ProviderSubscription> {
        self.subscriptions
            .lock()
            .unwrap()
            .get(subscription_id)
            .cloned()
            .ok_or_else(|| InkflowError::upstream(format!("No such subscription: {}", subscription_id)))
    }

    async fn list_subscriptions(&self, customer_id: &str) -> Result<Vec<ProviderSubscription>> {
        Ok(self
            .subscriptions
            .lock()
            .unwrap()
            .values()
            .filter(|sub| sub.customer_id == customer_id)
            .cloned()
            .collect())
    }

    async fn create_checkout_session(
        &self,
        request: CreateCheckoutSession,
    ) -> Result<HostedSession> {
        Ok(HostedSession {
            id: format!("cs_{}", request.user_id),
            url: format!("https://checkout.stripe.test/{}", request.user_id),
        })
    }

    async fn create_portal_session(
        &self,
        customer_id: &str,
        return_url: &str,
    ) -> Result<HostedSession> {
        Ok(HostedSession {
            id: format!("bps_{}", customer_id),
            url: format!("https://billing.stripe.test/{}?return={}", customer_id, return_url),
        })
    }
}

fn subscription(id: &str, customer_id: &str, user_id: &str, trial_end: Option<u64>) -> ProviderSubscription {
    let now = unix_now();
    ProviderSubscription {
        id: id.to_string(),
        customer_id: customer_id.to_string(),
        status: if trial_end.is_some() { "trialing" } else { "active" }.to_string(),
        price_id: Some(PRO_MONTHLY.to_string()),
        current_period_start: now,
        current_period_end: now + 30 * 86_400,
        trial_end,
        cancel_at_period_end: false,
        metadata: HashMap::from([("userId".to_string(), user_id.to_string())]),
    }
}

struct Harness {
    store: InMemoryEntitlementStore,
    provider: Arc<StubProvider>,
    router: Router,
}

impl Harness {
    fn new() -> Self {
        let config = ConfigBuilder::new()
            .with_webhook_secret(WEBHOOK_SECRET)
            .with_pro_prices(PRO_MONTHLY, PRO_YEARLY)
            .with_app_url("https://app.inkflow.test")
            .build()
            .unwrap();
        let store = InMemoryEntitlementStore::new();
        let provider = Arc::new(StubProvider::default());

        let context = AppContext::builder()
            .with_billing_config(&config.billing)
            .with_store(Arc::new(store.clone()))
            .with_provider(provider.clone())
            .build();
        let router = App::with_config(config).with_context(context).into_test_router();

        Self {
            store,
            provider,
            router,
        }
    }

    async fn deliver(&self, fixture: &EventFixture) -> Value {
        testing::signed_webhook(
            self.router.clone(),
            "/webhooks/billing",
            &fixture.to_bytes(),
            WEBHOOK_SECRET,
        )
        .execute()
        .await
        .assert_ok()
        .json()
        .await
    }

    async fn entitlement(&self, user_id: &str) -> Value {
        testing::get(self.router.clone(), &format!("/api/entitlements/{}", user_id))
            .execute()
            .await
            .assert_ok()
            .json()
            .await
    }

    async fn usage(&self, user_id: &str, amount: i64) -> Value {
        testing::post(self.router.clone(), &format!("/api/entitlements/{}/usage", user_id))
            .json_body(&json!({ "amount": amount }))
            .execute()
            .await
            .assert_ok()
            .json()
            .await
    }

    async fn bootstrap(&self, user_id: &str) {
        testing::post(self.router.clone(), &format!("/api/entitlements/{}/bootstrap", user_id))
            .execute()
            .await
            .assert_ok();
    }
}

#[tokio::test]
async fn test_invalid_signature_is_rejected_without_writes() {
    let h = Harness::new();
    let fixture = EventFixture::checkout_completed("user_1", "cus_1", "sub_1");
    h.provider
        .add_subscription(subscription("sub_1", "cus_1", "user_1", None));

    testing::signed_webhook(
        h.router.clone(),
        "/webhooks/billing",
        &fixture.to_bytes(),
        "whsec_someone_else",
    )
    .execute()
    .await
    .assert_bad_request();

    testing::post(h.router.clone(), "/webhooks/billing")
        .raw_body(fixture.to_bytes())
        .execute()
        .await
        .assert_bad_request();

    assert!(h.store.is_empty().unwrap());
    assert!(!h.store.is_event_processed(fixture.id()).await.unwrap());
}

#[tokio::test]
async fn test_checkout_with_trial_grants_pro_trial() {
    let h = Harness::new();
    let trial_end = unix_now() + 7 * 86_400;
    h.provider
        .add_subscription(subscription("sub_1", "cus_1", "user_1", Some(trial_end)));
    h.bootstrap("user_1").await;
    h.usage("user_1", 1_500).await;

    let ack = h
        .deliver(&EventFixture::checkout_completed("user_1", "cus_1", "sub_1"))
        .await;
    assert_eq!(ack["received"], json!(true));
    assert_eq!(ack["outcome"], json!("applied"));

    let record = h.entitlement("user_1").await;
    assert_eq!(record["tier"], json!("pro"));
    assert_eq!(record["status"], json!("trial"));
    assert_eq!(record["trialEndsAt"], json!(trial_end));
    assert_eq!(record["tokensUsedThisPeriod"], json!(0));
    assert_eq!(record["tokensLimit"], json!(250_000));
    assert_eq!(record["billingSubscriptionRef"], json!("sub_1"));
    assert_eq!(record["trialExpired"], json!(false));
}

#[tokio::test]
async fn test_replayed_checkout_is_not_applied_twice() {
    let h = Harness::new();
    h.provider
        .add_subscription(subscription("sub_1", "cus_1", "user_1", None));
    let fixture = EventFixture::checkout_completed("user_1", "cus_1", "sub_1");

    let first = h.deliver(&fixture).await;
    assert_eq!(first["outcome"], json!("applied"));

    h.usage("user_1", 400).await;

    let replay = h.deliver(&fixture).await;
    assert_eq!(replay["outcome"], json!("already_processed"));

    let record = h.entitlement("user_1").await;
    assert_eq!(record["tier"], json!("pro"));
    assert_eq!(record["status"], json!("active"));
    assert_eq!(record["tokensUsedThisPeriod"], json!(400));
}

#[tokio::test]
async fn test_subscription_deletion_reverts_to_free() {
    let h = Harness::new();
    h.provider
        .add_subscription(subscription("sub_1", "cus_1", "user_1", None));
    h.deliver(&EventFixture::checkout_completed("user_1", "cus_1", "sub_1"))
        .await;

    let ack = h
        .deliver(&EventFixture::subscription_deleted("user_1", "cus_1", "sub_1"))
        .await;
    assert_eq!(ack["outcome"], json!("applied"));

    let record = h.entitlement("user_1").await;
    assert_eq!(record["tier"], json!("free"));
    assert_eq!(record["status"], json!("canceled"));
    assert_eq!(record["tokensLimit"], json!(10_000));
    assert_eq!(record["billingSubscriptionRef"], Value::Null);

    let decision: Value = testing::post(h.router.clone(), "/api/entitlements/user_1/check")
        .json_body(&json!({ "action": "generate_content" }))
        .execute()
        .await
        .assert_ok()
        .json()
        .await;
    assert_eq!(decision["allowed"], json!(false));
}

#[tokio::test]
async fn test_quota_denial_reports_remaining_tokens() {
    let h = Harness::new();
    h.bootstrap("user_1").await;

    let recorded = h.usage("user_1", 9_990).await;
    assert_eq!(recorded["allowed"], json!(true));
    assert_eq!(recorded["record"]["tokensUsedThisPeriod"], json!(9_990));

    let decision: Value = testing::post(h.router.clone(), "/api/entitlements/user_1/check")
        .json_body(&json!({ "action": "generate_content", "estimatedCost": 20 }))
        .execute()
        .await
        .assert_ok()
        .json()
        .await;
    assert_eq!(decision["allowed"], json!(false));
    assert!(decision["reason"].as_str().unwrap().contains("10 remaining"));

    let denied = h.usage("user_1", 20).await;
    assert_eq!(denied["allowed"], json!(false));
    assert_eq!(h.entitlement("user_1").await["tokensUsedThisPeriod"], json!(9_990));
}

#[tokio::test]
async fn test_concurrent_usage_never_exceeds_quota() {
    let h = Harness::new();
    h.bootstrap("user_1").await;

    let (first, second) = tokio::join!(h.usage("user_1", 6_000), h.usage("user_1", 6_000));

    let allowed = [first, second]
        .iter()
        .filter(|d| d["allowed"] == json!(true))
        .count();
    assert_eq!(allowed, 1);
    assert_eq!(h.entitlement("user_1").await["tokensUsedThisPeriod"], json!(6_000));
}

#[tokio::test]
async fn test_extreme_amounts_cannot_bypass_quota() {
    let h = Harness::new();
    h.bootstrap("user_1").await;
    h.usage("user_1", 5).await;

    testing::post(h.router.clone(), "/api/entitlements/user_1/check")
        .json_body(&json!({ "action": "generate_content", "estimatedCost": i64::MAX }))
        .execute()
        .await
        .assert_bad_request();

    testing::post(h.router.clone(), "/api/entitlements/user_1/usage")
        .json_body(&json!({ "amount": i64::MAX }))
        .execute()
        .await
        .assert_bad_request();

    let record = h.entitlement("user_1").await;
    assert_eq!(record["tokensUsedThisPeriod"], json!(5));
    assert_eq!(record["tokensRemaining"], json!(9_995));
}

#[tokio::test]
async fn test_unknown_action_is_bad_request() {
    let h = Harness::new();

    testing::post(h.router.clone(), "/api/entitlements/user_1/check")
        .json_body(&json!({ "action": "launch_rocket" }))
        .execute()
        .await
        .assert_bad_request()
        .assert_json_path("error", json!("Validation error: Unknown action 'launch_rocket'"))
        .await;
}

#[tokio::test]
async fn test_sync_without_subscriptions_reverts_to_free() {
    let h = Harness::new();
    h.provider.add_customer("writer@inkflow.test", "cus_1");
    h.provider
        .add_subscription(subscription("sub_1", "cus_1", "user_1", None));
    h.deliver(&EventFixture::checkout_completed("user_1", "cus_1", "sub_1"))
        .await;
    h.provider.subscriptions.lock().unwrap().clear();

    let result: Value = testing::post(h.router.clone(), "/api/billing/sync")
        .json_body(&json!({ "userId": "user_1", "contactAddress": "writer@inkflow.test" }))
        .execute()
        .await
        .assert_ok()
        .json()
        .await;
    assert_eq!(result["success"], json!(true));
    assert_eq!(result["tier"], json!("free"));

    let record = h.entitlement("user_1").await;
    assert_eq!(record["tier"], json!("free"));
    assert_eq!(record["status"], json!("inactive"));
}

#[tokio::test]
async fn test_checkout_and_portal_sessions() {
    let h = Harness::new();

    let checkout: Value = testing::post(h.router.clone(), "/api/billing/checkout")
        .json_body(&json!({
            "userId": "user_1",
            "email": "writer@inkflow.test",
            "tier": "pro",
            "billingPeriod": "yearly",
        }))
        .execute()
        .await
        .assert_ok()
        .json()
        .await;
    assert_eq!(checkout["sessionId"], json!("cs_user_1"));

    testing::post(h.router.clone(), "/api/billing/portal")
        .json_body(&json!({ "userId": "user_1" }))
        .execute()
        .await
        .assert_not_found();

    h.provider
        .add_subscription(subscription("sub_1", "cus_1", "user_1", None));
    h.deliver(&EventFixture::checkout_completed("user_1", "cus_1", "sub_1"))
        .await;

    let portal: Value = testing::post(h.router.clone(), "/api/billing/portal")
        .json_body(&json!({ "userId": "user_1" }))
        .execute()
        .await
        .assert_ok()
        .json()
        .await;
    assert!(portal["url"]
        .as_str()
        .unwrap()
        .ends_with("return=https://app.inkflow.test/settings/billing"));
}

#[tokio::test]
async fn test_checkout_rejects_unpurchasable_tier() {
    let h = Harness::new();

    testing::post(h.router.clone(), "/api/billing/checkout")
        .json_body(&json!({
            "userId": "user_1",
            "email": "writer@inkflow.test",
            "tier": "unlimited",
            "billingPeriod": "monthly",
        }))
        .execute()
        .await
        .assert_bad_request();
}

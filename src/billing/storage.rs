//! Entitlement storage.
//!
//! One [`EntitlementRecord`] per user, written only through merge-style
//! updates. Implement [`EntitlementStore`] to persist records in your
//! document store; [`InMemoryEntitlementStore`] is provided for single-node
//! deployments and tests.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::error::BillingError;
use super::tier::{DEFAULT_PERIOD_SECONDS, Tier, UNLIMITED_TOKENS};
use crate::error::{InkflowError, Result};

/// Internal subscription status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Trial,
    PastDue,
    Canceled,
    /// No live subscription (never subscribed, or an incomplete/paused one).
    Inactive,
}

impl SubscriptionStatus {
    /// Map a Stripe subscription status.
    ///
    /// `trialing` only becomes [`Trial`](Self::Trial) when the subscription
    /// carries a trial end; a trial without an end date is treated as active.
    #[must_use]
    pub fn from_provider(status: &str, has_trial_end: bool) -> Self {
        match status {
            "trialing" if has_trial_end => Self::Trial,
            "trialing" | "active" => Self::Active,
            "past_due" | "unpaid" => Self::PastDue,
            "canceled" => Self::Canceled,
            _ => Self::Inactive,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Trial => "trial",
            Self::PastDue => "past_due",
            Self::Canceled => "canceled",
            Self::Inactive => "inactive",
        }
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a user is allowed to do and how much quota remains.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntitlementRecord {
    pub user_id: String,
    pub tier: Tier,
    pub status: SubscriptionStatus,
    pub billing_customer_ref: Option<String>,
    pub billing_subscription_ref: Option<String>,
    pub billing_price_ref: Option<String>,
    pub trial_ends_at: Option<u64>,
    pub current_period_start: u64,
    pub current_period_end: u64,
    pub cancel_at_period_end: bool,
    pub tokens_used_this_period: i64,
    /// Token allowance for the period, [`UNLIMITED_TOKENS`] for no quota.
    pub tokens_limit: i64,
    pub created_at: u64,
    pub updated_at: u64,
}

impl EntitlementRecord {
    /// Default record created on first login: free tier, active, empty counter.
    #[must_use]
    pub fn new(user_id: impl Into<String>, now: u64) -> Self {
        Self {
            user_id: user_id.into(),
            tier: Tier::Free,
            status: SubscriptionStatus::Active,
            billing_customer_ref: None,
            billing_subscription_ref: None,
            billing_price_ref: None,
            trial_ends_at: None,
            current_period_start: now,
            current_period_end: now + DEFAULT_PERIOD_SECONDS,
            cancel_at_period_end: false,
            tokens_used_this_period: 0,
            tokens_limit: Tier::Free.token_limit(),
            created_at: now,
            updated_at: now,
        }
    }

    #[must_use]
    pub fn is_unlimited(&self) -> bool {
        self.tokens_limit == UNLIMITED_TOKENS
    }

    /// Whether the current period ended at or before `now`.
    #[must_use]
    pub fn period_elapsed(&self, now: u64) -> bool {
        self.current_period_end > 0 && now >= self.current_period_end
    }

    /// Tokens used in the period that contains `now`.
    #[must_use]
    pub fn usage_at(&self, now: u64) -> i64 {
        if self.period_elapsed(now) {
            0
        } else {
            self.tokens_used_this_period
        }
    }

    /// Tokens left in the period that contains `now`, `None` when unlimited.
    #[must_use]
    pub fn tokens_remaining(&self, now: u64) -> Option<i64> {
        if self.is_unlimited() {
            return None;
        }
        Some(self.tokens_limit.saturating_sub(self.usage_at(now)).max(0))
    }

    /// Merge an update into the record and bump `updated_at`.
    ///
    /// Fields absent from the update keep their stored values. After the merge
    /// a free record never references a subscription, a trial end date is
    /// present exactly while the status is trial, and the counter never
    /// exceeds a finite limit.
    pub fn apply(&mut self, update: &EntitlementUpdate, now: u64) {
        if let Some(tier) = update.tier {
            self.tier = tier;
        }
        if let Some(status) = update.status {
            self.status = status;
        }
        if let Some(ref customer) = update.billing_customer_ref {
            self.billing_customer_ref = customer.clone();
        }
        if let Some(ref subscription) = update.billing_subscription_ref {
            self.billing_subscription_ref = subscription.clone();
        }
        if let Some(ref price) = update.billing_price_ref {
            self.billing_price_ref = price.clone();
        }
        if let Some(trial_ends_at) = update.trial_ends_at {
            self.trial_ends_at = trial_ends_at;
        }
        if let Some(start) = update.current_period_start {
            self.current_period_start = start;
        }
        if let Some(end) = update.current_period_end {
            self.current_period_end = end;
        }
        if let Some(cancel) = update.cancel_at_period_end {
            self.cancel_at_period_end = cancel;
        }
        if let Some(used) = update.tokens_used_this_period {
            self.tokens_used_this_period = used;
        }
        if let Some(limit) = update.tokens_limit {
            self.tokens_limit = limit;
        }

        if self.tier == Tier::Free {
            self.billing_subscription_ref = None;
            self.billing_price_ref = None;
        }
        if self.status == SubscriptionStatus::Trial && self.trial_ends_at.is_none() {
            self.status = SubscriptionStatus::Active;
        }
        if self.status != SubscriptionStatus::Trial {
            self.trial_ends_at = None;
        }
        if !self.is_unlimited() && self.tokens_used_this_period > self.tokens_limit {
            self.tokens_used_this_period = self.tokens_limit;
        }

        self.updated_at = now;
    }

    /// Advance an elapsed usage window so that it contains `now`, resetting the counter.
    pub(crate) fn roll_period(&mut self, now: u64) {
        if !self.period_elapsed(now) {
            return;
        }

        let length = self
            .current_period_end
            .saturating_sub(self.current_period_start);
        let length = if length == 0 { DEFAULT_PERIOD_SECONDS } else { length };
        let skipped = (now - self.current_period_end) / length;

        self.current_period_start = self.current_period_end + skipped * length;
        self.current_period_end = self.current_period_start + length;
        self.tokens_used_this_period = 0;
    }
}

/// Partial write to an [`EntitlementRecord`].
///
/// `None` leaves a field untouched. Nullable fields use `Some(None)` to clear.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntitlementUpdate {
    pub tier: Option<Tier>,
    pub status: Option<SubscriptionStatus>,
    pub billing_customer_ref: Option<Option<String>>,
    pub billing_subscription_ref: Option<Option<String>>,
    pub billing_price_ref: Option<Option<String>>,
    pub trial_ends_at: Option<Option<u64>>,
    pub current_period_start: Option<u64>,
    pub current_period_end: Option<u64>,
    pub cancel_at_period_end: Option<bool>,
    pub tokens_used_this_period: Option<i64>,
    pub tokens_limit: Option<i64>,
}

impl EntitlementUpdate {
    /// Set the tier together with its token limit.
    #[must_use]
    pub fn with_tier(mut self, tier: Tier) -> Self {
        self.tier = Some(tier);
        self.tokens_limit = Some(tier.token_limit());
        self
    }

    #[must_use]
    pub fn with_status(mut self, status: SubscriptionStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Update that reverts a user to the free tier with the given status.
    ///
    /// Subscription and price refs and the trial end are cleared; the
    /// customer ref is kept so the billing portal stays reachable.
    #[must_use]
    pub fn revert_to_free(status: SubscriptionStatus) -> Self {
        Self {
            billing_subscription_ref: Some(None),
            billing_price_ref: Some(None),
            trial_ends_at: Some(None),
            cancel_at_period_end: Some(false),
            ..Self::default()
        }
        .with_tier(Tier::Free)
        .with_status(status)
    }
}

/// Largest token amount accepted for a single usage increment or cost estimate.
pub const MAX_USAGE_AMOUNT: i64 = 1_000_000_000;

/// Reject non-positive and oversized usage amounts.
pub(crate) fn validate_usage_amount(amount: i64) -> Result<()> {
    if amount <= 0 || amount > MAX_USAGE_AMOUNT {
        return Err(BillingError::InvalidUsageAmount { amount }.into());
    }
    Ok(())
}

/// Result of an atomic usage increment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UsageOutcome {
    /// Counter incremented; the updated record.
    Recorded(EntitlementRecord),
    /// Increment rejected before the counter changed.
    QuotaExceeded {
        used: i64,
        limit: i64,
        requested: i64,
    },
}

impl UsageOutcome {
    #[must_use]
    pub fn is_recorded(&self) -> bool {
        matches!(self, Self::Recorded(_))
    }
}

/// Trait for persisting entitlement records.
///
/// `increment_usage` must be an atomic check-then-increment: two concurrent
/// increments that together exceed the quota must not both succeed.
#[async_trait]
pub trait EntitlementStore: Send + Sync {
    /// Get the record for a user.
    async fn get_entitlement(&self, user_id: &str) -> Result<Option<EntitlementRecord>>;

    /// Get the record for a user, creating the default free record if absent.
    async fn ensure_entitlement(&self, user_id: &str, now: u64) -> Result<EntitlementRecord>;

    /// Merge an update into the user's record, creating the default record first if absent.
    async fn upsert_entitlement(
        &self,
        user_id: &str,
        update: EntitlementUpdate,
        now: u64,
    ) -> Result<EntitlementRecord>;

    /// Add `amount` tokens to the current period's counter unless that would exceed the limit.
    async fn increment_usage(&self, user_id: &str, amount: i64, now: u64) -> Result<UsageOutcome>;

    /// Find the record referencing a Stripe subscription.
    async fn find_by_subscription_ref(
        &self,
        subscription_ref: &str,
    ) -> Result<Option<EntitlementRecord>>;

    /// Find the record referencing a Stripe customer.
    async fn find_by_customer_ref(&self, customer_ref: &str) -> Result<Option<EntitlementRecord>>;

    // Webhook idempotency

    /// Check if a webhook event has already been applied.
    async fn is_event_processed(&self, event_id: &str) -> Result<bool>;

    /// Record a webhook event as applied.
    async fn mark_event_processed(&self, event_id: &str, now: u64) -> Result<()>;
}

/// In-memory entitlement store.
///
/// Cheap to clone; clones share the same maps. All writes for all users go
/// through one lock, which also serializes usage increments per user.
#[derive(Debug, Default, Clone)]
pub struct InMemoryEntitlementStore {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    records: RwLock<HashMap<String, EntitlementRecord>>,
    processed_events: RwLock<HashMap<String, u64>>,
}

impl InMemoryEntitlementStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a record as-is.
    pub fn insert(&self, record: EntitlementRecord) -> Result<()> {
        write(&self.inner.records)?.insert(record.user_id.clone(), record);
        Ok(())
    }

    /// Number of stored records.
    pub fn len(&self) -> Result<usize> {
        Ok(read(&self.inner.records)?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

fn read<T>(lock: &RwLock<T>) -> Result<RwLockReadGuard<'_, T>> {
    lock.read()
        .map_err(|_| InkflowError::internal("entitlement store lock poisoned"))
}

fn write<T>(lock: &RwLock<T>) -> Result<RwLockWriteGuard<'_, T>> {
    lock.write()
        .map_err(|_| InkflowError::internal("entitlement store lock poisoned"))
}

#[async_trait]
impl EntitlementStore for InMemoryEntitlementStore {
    async fn get_entitlement(&self, user_id: &str) -> Result<Option<EntitlementRecord>> {
        Ok(read(&self.inner.records)?.get(user_id).cloned())
    }

    async fn ensure_entitlement(&self, user_id: &str, now: u64) -> Result<EntitlementRecord> {
        let mut records = write(&self.inner.records)?;
        let record = records
            .entry(user_id.to_string())
            .or_insert_with(|| EntitlementRecord::new(user_id, now));
        Ok(record.clone())
    }

    async fn upsert_entitlement(
        &self,
        user_id: &str,
        update: EntitlementUpdate,
        now: u64,
    ) -> Result<EntitlementRecord> {
        let mut records = write(&self.inner.records)?;
        let record = records
            .entry(user_id.to_string())
            .or_insert_with(|| EntitlementRecord::new(user_id, now));
        record.apply(&update, now);
        Ok(record.clone())
    }

    async fn increment_usage(&self, user_id: &str, amount: i64, now: u64) -> Result<UsageOutcome> {
        validate_usage_amount(amount)?;

        let mut records = write(&self.inner.records)?;
        let record = records
            .entry(user_id.to_string())
            .or_insert_with(|| EntitlementRecord::new(user_id, now));

        record.roll_period(now);

        let total = match record.tokens_used_this_period.checked_add(amount) {
            Some(total) if record.is_unlimited() || total <= record.tokens_limit => total,
            _ => {
                return Ok(UsageOutcome::QuotaExceeded {
                    used: record.tokens_used_this_period,
                    limit: record.tokens_limit,
                    requested: amount,
                });
            }
        };

        record.tokens_used_this_period = total;
        record.updated_at = now;
        Ok(UsageOutcome::Recorded(record.clone()))
    }

    async fn find_by_subscription_ref(
        &self,
        subscription_ref: &str,
    ) -> Result<Option<EntitlementRecord>> {
        Ok(read(&self.inner.records)?
            .values()
            .find(|r| r.billing_subscription_ref.as_deref() == Some(subscription_ref))
            .cloned())
    }

    async fn find_by_customer_ref(&self, customer_ref: &str) -> Result<Option<EntitlementRecord>> {
        Ok(read(&self.inner.records)?
            .values()
            .find(|r| r.billing_customer_ref.as_deref() == Some(customer_ref))
            .cloned())
    }

    async fn is_event_processed(&self, event_id: &str) -> Result<bool> {
        Ok(read(&self.inner.processed_events)?.contains_key(event_id))
    }

    async fn mark_event_processed(&self, event_id: &str, now: u64) -> Result<()> {
        write(&self.inner.processed_events)?.insert(event_id.to_string(), now);
        Ok(())
    }
}

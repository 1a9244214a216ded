//! Entitlement queries and quota gating.
//!
//! The read side of the subscription core: "can this user create another
//! agent?" and the atomic usage meter in front of content generation.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use super::error::BillingError;
use super::storage::{
    EntitlementRecord, EntitlementStore, SubscriptionStatus, UsageOutcome, validate_usage_amount,
};
use crate::error::Result;
use crate::utils::SECONDS_PER_DAY;

/// Default grace period for past-due accounts after their period ends.
pub const DEFAULT_PAST_DUE_GRACE_DAYS: u64 = 3;

/// Actions gated by the user's entitlement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatedAction {
    CreateAgent,
    CreateTask,
    GenerateContent,
}

impl GatedAction {
    /// Smallest token cost the action is charged against the quota.
    #[must_use]
    pub const fn min_cost(self) -> i64 {
        1
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::CreateAgent => "create_agent",
            Self::CreateTask => "create_task",
            Self::GenerateContent => "generate_content",
        }
    }
}

impl fmt::Display for GatedAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GatedAction {
    type Err = BillingError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "create_agent" => Ok(Self::CreateAgent),
            "create_task" => Ok(Self::CreateTask),
            "generate_content" => Ok(Self::GenerateContent),
            _ => Err(BillingError::InvalidAction {
                value: s.to_string(),
            }),
        }
    }
}

/// Gating decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Decision {
    #[must_use]
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    #[must_use]
    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
        }
    }
}

/// Result of metering usage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageDecision {
    #[serde(flatten)]
    pub decision: Decision,
    /// Record after the increment, present when usage was recorded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record: Option<EntitlementRecord>,
}

/// Record plus the values derived from it for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntitlementSummary {
    #[serde(flatten)]
    pub record: EntitlementRecord,
    /// `None` when the tier is unlimited.
    pub tokens_remaining: Option<i64>,
    pub trial_days_remaining: Option<u64>,
    pub trial_expired: bool,
}

fn quota_reason(remaining: i64, cost: i64) -> String {
    format!(
        "Not enough tokens: {} remaining this period, {} required",
        remaining.max(0),
        cost
    )
}

/// Denial caused by the subscription status alone.
fn status_denial(record: &EntitlementRecord, now: u64, grace_secs: u64) -> Option<String> {
    match record.status {
        SubscriptionStatus::Canceled => {
            Some("Subscription canceled: subscribe again to continue".to_string())
        }
        SubscriptionStatus::PastDue
            if now >= record.current_period_end.saturating_add(grace_secs) =>
        {
            Some("Payment past due: update your payment method to continue".to_string())
        }
        _ => None,
    }
}

/// Decide whether an action costing `cost` tokens fits the record at `now`.
#[must_use]
pub fn evaluate(record: &EntitlementRecord, cost: i64, now: u64, grace_secs: u64) -> Decision {
    if let Some(reason) = status_denial(record, now, grace_secs) {
        return Decision::deny(reason);
    }
    if record.is_unlimited() {
        return Decision::allow();
    }

    let used = record.usage_at(now);
    match used.checked_add(cost) {
        Some(total) if total <= record.tokens_limit => Decision::allow(),
        _ => Decision::deny(quota_reason(record.tokens_limit.saturating_sub(used), cost)),
    }
}

/// Whole days left in the trial, rounded up.
#[must_use]
pub fn trial_days_remaining(record: &EntitlementRecord, now: u64) -> Option<u64> {
    record
        .trial_ends_at
        .map(|end| end.saturating_sub(now).div_ceil(SECONDS_PER_DAY))
}

#[must_use]
pub fn is_trial_expired(record: &EntitlementRecord, now: u64) -> bool {
    record.trial_ends_at.is_some_and(|end| end <= now)
}

/// Synchronous entitlement reads and usage metering.
#[derive(Clone)]
pub struct EntitlementQueryService {
    store: Arc<dyn EntitlementStore>,
    past_due_grace_secs: u64,
}

impl EntitlementQueryService {
    #[must_use]
    pub fn new(store: Arc<dyn EntitlementStore>) -> Self {
        Self {
            store,
            past_due_grace_secs: DEFAULT_PAST_DUE_GRACE_DAYS * SECONDS_PER_DAY,
        }
    }

    #[must_use]
    pub fn with_past_due_grace_days(mut self, days: u64) -> Self {
        self.past_due_grace_secs = days * SECONDS_PER_DAY;
        self
    }

    /// Gate an action.
    ///
    /// A user without a record is evaluated as a fresh free-tier user.
    pub async fn can_perform(
        &self,
        user_id: &str,
        action: GatedAction,
        estimated_cost: Option<i64>,
        now: u64,
    ) -> Result<Decision> {
        require_user(user_id)?;
        let cost = estimated_cost.unwrap_or(0).max(action.min_cost());
        validate_usage_amount(cost)?;

        let record = self
            .store
            .get_entitlement(user_id)
            .await?
            .unwrap_or_else(|| EntitlementRecord::new(user_id, now));

        let decision = evaluate(&record, cost, now, self.past_due_grace_secs);
        if !decision.allowed {
            tracing::debug!(
                user_id = %user_id,
                action = %action,
                cost = cost,
                reason = decision.reason.as_deref().unwrap_or_default(),
                "Action denied"
            );
        }
        Ok(decision)
    }

    /// Stored record for a user.
    pub async fn get_entitlement(&self, user_id: &str) -> Result<EntitlementRecord> {
        require_user(user_id)?;
        self.store
            .get_entitlement(user_id)
            .await?
            .ok_or_else(|| {
                BillingError::EntitlementNotFound {
                    user_id: user_id.to_string(),
                }
                .into()
            })
    }

    /// Stored record with remaining tokens and trial state.
    pub async fn summary(&self, user_id: &str, now: u64) -> Result<EntitlementSummary> {
        let record = self.get_entitlement(user_id).await?;
        Ok(EntitlementSummary {
            tokens_remaining: record.tokens_remaining(now),
            trial_days_remaining: trial_days_remaining(&record, now),
            trial_expired: is_trial_expired(&record, now),
            record,
        })
    }

    /// Create the default record on first login, or return the existing one.
    pub async fn bootstrap(&self, user_id: &str, now: u64) -> Result<EntitlementRecord> {
        require_user(user_id)?;
        self.store.ensure_entitlement(user_id, now).await
    }

    /// Meter `amount` tokens against the user's quota.
    ///
    /// The quota check and the increment happen atomically in the store.
    /// Exceeding the quota is a denial, not an error.
    pub async fn record_usage(&self, user_id: &str, amount: i64, now: u64) -> Result<UsageDecision> {
        require_user(user_id)?;
        validate_usage_amount(amount)?;

        if let Some(record) = self.store.get_entitlement(user_id).await? {
            if let Some(reason) = status_denial(&record, now, self.past_due_grace_secs) {
                return Ok(UsageDecision {
                    decision: Decision::deny(reason),
                    record: None,
                });
            }
        }

        match self.store.increment_usage(user_id, amount, now).await? {
            UsageOutcome::Recorded(record) => Ok(UsageDecision {
                decision: Decision::allow(),
                record: Some(record),
            }),
            UsageOutcome::QuotaExceeded {
                used,
                limit,
                requested,
            } => {
                tracing::info!(
                    user_id = %user_id,
                    used = used,
                    limit = limit,
                    requested = requested,
                    "Usage rejected: quota exceeded"
                );
                Ok(UsageDecision {
                    decision: Decision::deny(quota_reason(limit.saturating_sub(used), requested)),
                    record: None,
                })
            }
        }
    }
}

fn require_user(user_id: &str) -> Result<()> {
    if user_id.trim().is_empty() {
        return Err(BillingError::MissingField { field: "userId" }.into());
    }
    Ok(())
}

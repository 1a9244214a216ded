//! SeaORM-backed entitlement storage.
//!
//! Persists entitlement records and the processed-event ledger in Postgres or
//! SQLite so that tiers, usage counters and webhook idempotency survive a
//! restart.
//!
//! # Example
//!
//! ```rust,ignore
//! use inkflow::billing::SeaOrmEntitlementStore;
//!
//! let store = SeaOrmEntitlementStore::connect(&config.database).await?;
//! store.create_schema().await?;
//!
//! let context = AppContext::builder()
//!     .with_billing_config(&config.billing)
//!     .with_store(Arc::new(store))
//!     .build();
//! ```

use async_trait::async_trait;
use sea_orm::{
    ColumnTrait, Condition, ConnectOptions, ConnectionTrait, Database, DatabaseConnection, DbErr,
    EntityTrait, QueryFilter, Schema, Set,
    sea_query::{Expr, OnConflict},
};
use secrecy::ExposeSecret;
use std::time::Duration;

use super::storage::{
    EntitlementRecord, EntitlementStore, EntitlementUpdate, SubscriptionStatus, UsageOutcome,
    validate_usage_amount,
};
use super::tier::{Tier, UNLIMITED_TOKENS};
use crate::config::DatabaseConfig;
use crate::error::{InkflowError, Result};

// =============================================================================
// SeaORM Entities
// =============================================================================

mod entity {
    pub mod entitlement {
        use sea_orm::entity::prelude::*;

        #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
        #[sea_orm(table_name = "entitlements")]
        pub struct Model {
            #[sea_orm(primary_key, auto_increment = false)]
            pub user_id: String,
            pub tier: String,
            pub status: String,
            pub billing_customer_ref: Option<String>,
            pub billing_subscription_ref: Option<String>,
            pub billing_price_ref: Option<String>,
            pub trial_ends_at: Option<i64>,
            pub current_period_start: i64,
            pub current_period_end: i64,
            pub cancel_at_period_end: bool,
            pub tokens_used_this_period: i64,
            pub tokens_limit: i64,
            /// Bumped on every write; read-modify-write updates are conditional on it.
            pub version: i64,
            pub created_at: i64,
            pub updated_at: i64,
        }

        #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
        pub enum Relation {}

        impl ActiveModelBehavior for ActiveModel {}
    }

    pub mod processed_event {
        use sea_orm::entity::prelude::*;

        #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
        #[sea_orm(table_name = "billing_processed_events")]
        pub struct Model {
            #[sea_orm(primary_key, auto_increment = false)]
            pub event_id: String,
            pub processed_at: i64,
        }

        #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
        pub enum Relation {}

        impl ActiveModelBehavior for ActiveModel {}
    }
}

use entity::{entitlement, processed_event};

/// Attempts at a version-checked write before giving up on a contended record.
const MAX_WRITE_ATTEMPTS: usize = 8;

// =============================================================================
// Helper Functions
// =============================================================================

/// Convert i64 to u64 safely (negative values become 0).
#[inline]
fn i64_to_u64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

/// Convert u64 to i64 safely (values > i64::MAX become i64::MAX).
#[inline]
fn u64_to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn db_err(err: DbErr) -> InkflowError {
    InkflowError::database(err.to_string())
}

fn parse_status(value: &str) -> Option<SubscriptionStatus> {
    match value {
        "active" => Some(SubscriptionStatus::Active),
        "trial" => Some(SubscriptionStatus::Trial),
        "past_due" => Some(SubscriptionStatus::PastDue),
        "canceled" => Some(SubscriptionStatus::Canceled),
        "inactive" => Some(SubscriptionStatus::Inactive),
        _ => None,
    }
}

fn model_to_record(model: entitlement::Model) -> Result<EntitlementRecord> {
    let tier: Tier = model.tier.parse().map_err(|_| {
        InkflowError::database(format!(
            "unknown tier '{}' stored for user '{}'",
            model.tier, model.user_id
        ))
    })?;
    let status = parse_status(&model.status).ok_or_else(|| {
        InkflowError::database(format!(
            "unknown status '{}' stored for user '{}'",
            model.status, model.user_id
        ))
    })?;

    Ok(EntitlementRecord {
        user_id: model.user_id,
        tier,
        status,
        billing_customer_ref: model.billing_customer_ref,
        billing_subscription_ref: model.billing_subscription_ref,
        billing_price_ref: model.billing_price_ref,
        trial_ends_at: model.trial_ends_at.map(i64_to_u64),
        current_period_start: i64_to_u64(model.current_period_start),
        current_period_end: i64_to_u64(model.current_period_end),
        cancel_at_period_end: model.cancel_at_period_end,
        tokens_used_this_period: model.tokens_used_this_period,
        tokens_limit: model.tokens_limit,
        created_at: i64_to_u64(model.created_at),
        updated_at: i64_to_u64(model.updated_at),
    })
}

/// ActiveModel for inserting a fresh record.
fn record_to_active_model(record: &EntitlementRecord) -> entitlement::ActiveModel {
    entitlement::ActiveModel {
        user_id: Set(record.user_id.clone()),
        tier: Set(record.tier.as_str().to_string()),
        status: Set(record.status.as_str().to_string()),
        billing_customer_ref: Set(record.billing_customer_ref.clone()),
        billing_subscription_ref: Set(record.billing_subscription_ref.clone()),
        billing_price_ref: Set(record.billing_price_ref.clone()),
        trial_ends_at: Set(record.trial_ends_at.map(u64_to_i64)),
        current_period_start: Set(u64_to_i64(record.current_period_start)),
        current_period_end: Set(u64_to_i64(record.current_period_end)),
        cancel_at_period_end: Set(record.cancel_at_period_end),
        tokens_used_this_period: Set(record.tokens_used_this_period),
        tokens_limit: Set(record.tokens_limit),
        version: Set(0),
        created_at: Set(u64_to_i64(record.created_at)),
        updated_at: Set(u64_to_i64(record.updated_at)),
    }
}

/// Conditional UPDATE writing every field of `record` if the row is still at `expected_version`.
fn build_record_update(
    record: &EntitlementRecord,
    expected_version: i64,
) -> sea_orm::UpdateMany<entitlement::Entity> {
    use entitlement::Column;

    entitlement::Entity::update_many()
        .col_expr(Column::Tier, Expr::value(record.tier.as_str()))
        .col_expr(Column::Status, Expr::value(record.status.as_str()))
        .col_expr(
            Column::BillingCustomerRef,
            Expr::value(record.billing_customer_ref.clone()),
        )
        .col_expr(
            Column::BillingSubscriptionRef,
            Expr::value(record.billing_subscription_ref.clone()),
        )
        .col_expr(
            Column::BillingPriceRef,
            Expr::value(record.billing_price_ref.clone()),
        )
        .col_expr(
            Column::TrialEndsAt,
            Expr::value(record.trial_ends_at.map(u64_to_i64)),
        )
        .col_expr(
            Column::CurrentPeriodStart,
            Expr::value(u64_to_i64(record.current_period_start)),
        )
        .col_expr(
            Column::CurrentPeriodEnd,
            Expr::value(u64_to_i64(record.current_period_end)),
        )
        .col_expr(
            Column::CancelAtPeriodEnd,
            Expr::value(record.cancel_at_period_end),
        )
        .col_expr(
            Column::TokensUsedThisPeriod,
            Expr::value(record.tokens_used_this_period),
        )
        .col_expr(Column::TokensLimit, Expr::value(record.tokens_limit))
        .col_expr(Column::Version, Expr::value(expected_version + 1))
        .col_expr(Column::UpdatedAt, Expr::value(u64_to_i64(record.updated_at)))
        .filter(Column::UserId.eq(record.user_id.as_str()))
        .filter(Column::Version.eq(expected_version))
}

/// Conditional increment: the row must be in the period containing `now`
/// and have room for `amount` tokens (or be unlimited without overflowing).
fn build_usage_increment(
    user_id: &str,
    amount: i64,
    now: i64,
) -> sea_orm::UpdateMany<entitlement::Entity> {
    use entitlement::Column;

    let in_period = Condition::any()
        .add(Column::CurrentPeriodEnd.eq(0))
        .add(Column::CurrentPeriodEnd.gt(now));

    let fits = Condition::any()
        .add(
            Condition::all()
                .add(Column::TokensLimit.eq(UNLIMITED_TOKENS))
                .add(Column::TokensUsedThisPeriod.lte(i64::MAX - amount)),
        )
        .add(
            Condition::all()
                .add(Column::TokensLimit.gte(0))
                .add(
                    Expr::col(Column::TokensUsedThisPeriod)
                        .lte(Expr::col(Column::TokensLimit).sub(amount)),
                ),
        );

    entitlement::Entity::update_many()
        .col_expr(
            Column::TokensUsedThisPeriod,
            Expr::col(Column::TokensUsedThisPeriod).add(amount),
        )
        .col_expr(Column::Version, Expr::col(Column::Version).add(1))
        .col_expr(Column::UpdatedAt, Expr::value(now))
        .filter(Column::UserId.eq(user_id))
        .filter(in_period)
        .filter(fits)
}

// =============================================================================
// SeaOrmEntitlementStore
// =============================================================================

/// SeaORM-backed entitlement store.
///
/// Usage increments are a single conditional `UPDATE`, so concurrent
/// increments from any number of service instances cannot overshoot the
/// quota. Merge-style upserts use optimistic locking on a version column.
#[derive(Clone, Debug)]
pub struct SeaOrmEntitlementStore {
    db: DatabaseConnection,
}

impl SeaOrmEntitlementStore {
    #[must_use]
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// Connect using the database section of the config.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when no URL is set and a database error
    /// when the connection cannot be established.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let url = config
            .url
            .as_ref()
            .ok_or_else(|| InkflowError::configuration("DATABASE_URL is not set"))?;

        let mut opt = ConnectOptions::new(url.expose_secret().to_string());
        opt.max_connections(config.max_connections)
            .connect_timeout(Duration::from_secs(config.connect_timeout_seconds))
            .sqlx_logging(false);

        let db = Database::connect(opt)
            .await
            .map_err(|e| InkflowError::database(format!("Failed to connect to database: {}", e)))?;

        tracing::info!(
            max_connections = config.max_connections,
            backend = ?db.get_database_backend(),
            "Entitlement database connected"
        );

        Ok(Self::new(db))
    }

    /// Get a reference to the underlying database connection.
    #[must_use]
    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }

    /// Create the entitlement and processed-event tables if they do not exist.
    pub async fn create_schema(&self) -> Result<()> {
        let backend = self.db.get_database_backend();
        let schema = Schema::new(backend);

        let mut entitlements = schema.create_table_from_entity(entitlement::Entity);
        entitlements.if_not_exists();
        let mut events = schema.create_table_from_entity(processed_event::Entity);
        events.if_not_exists();

        self.db
            .execute(backend.build(&entitlements))
            .await
            .map_err(db_err)?;
        self.db
            .execute(backend.build(&events))
            .await
            .map_err(db_err)?;

        tracing::info!("Entitlement schema ready");
        Ok(())
    }

    async fn load(&self, user_id: &str) -> Result<Option<entitlement::Model>> {
        entitlement::Entity::find_by_id(user_id)
            .one(&self.db)
            .await
            .map_err(db_err)
    }

    /// Load the row for a user, inserting the default free record first if absent.
    async fn load_or_create(&self, user_id: &str, now: u64) -> Result<entitlement::Model> {
        if let Some(model) = self.load(user_id).await? {
            return Ok(model);
        }

        let record = EntitlementRecord::new(user_id, now);

        // INSERT ... ON CONFLICT DO NOTHING: a concurrent first login wins the race.
        entitlement::Entity::insert(record_to_active_model(&record))
            .on_conflict(
                OnConflict::column(entitlement::Column::UserId)
                    .do_nothing()
                    .to_owned(),
            )
            .do_nothing()
            .exec(&self.db)
            .await
            .map_err(db_err)?;

        self.load(user_id).await?.ok_or_else(|| {
            InkflowError::database(format!("entitlement for user '{}' vanished after insert", user_id))
        })
    }

    /// Write `record` if the row is still at `expected_version`.
    async fn compare_and_save(&self, record: &EntitlementRecord, expected_version: i64) -> Result<bool> {
        let result = build_record_update(record, expected_version)
            .exec(&self.db)
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected > 0)
    }

    fn contended(user_id: &str) -> InkflowError {
        InkflowError::database(format!(
            "entitlement for user '{}' is under heavy concurrent modification",
            user_id
        ))
    }
}

#[async_trait]
impl EntitlementStore for SeaOrmEntitlementStore {
    async fn get_entitlement(&self, user_id: &str) -> Result<Option<EntitlementRecord>> {
        self.load(user_id).await?.map(model_to_record).transpose()
    }

    async fn ensure_entitlement(&self, user_id: &str, now: u64) -> Result<EntitlementRecord> {
        model_to_record(self.load_or_create(user_id, now).await?)
    }

    async fn upsert_entitlement(
        &self,
        user_id: &str,
        update: EntitlementUpdate,
        now: u64,
    ) -> Result<EntitlementRecord> {
        for _ in 0..MAX_WRITE_ATTEMPTS {
            let model = self.load_or_create(user_id, now).await?;
            let version = model.version;
            let mut record = model_to_record(model)?;
            record.apply(&update, now);

            if self.compare_and_save(&record, version).await? {
                return Ok(record);
            }
            tracing::debug!(user_id = %user_id, version = version, "entitlement version moved, retrying");
        }

        Err(Self::contended(user_id))
    }

    async fn increment_usage(&self, user_id: &str, amount: i64, now: u64) -> Result<UsageOutcome> {
        validate_usage_amount(amount)?;

        for _ in 0..MAX_WRITE_ATTEMPTS {
            let model = self.load_or_create(user_id, now).await?;
            let version = model.version;
            let record = model_to_record(model)?;

            if record.period_elapsed(now) {
                let mut rolled = record;
                rolled.roll_period(now);
                rolled.updated_at = now;
                // Losing this race means someone else rolled or wrote; re-read either way.
                self.compare_and_save(&rolled, version).await?;
                continue;
            }

            let result = build_usage_increment(user_id, amount, u64_to_i64(now))
                .exec(&self.db)
                .await
                .map_err(db_err)?;

            let current = self.load(user_id).await?.ok_or_else(|| {
                InkflowError::database(format!("entitlement for user '{}' vanished", user_id))
            })?;
            let current = model_to_record(current)?;

            if result.rows_affected > 0 {
                return Ok(UsageOutcome::Recorded(current));
            }
            if current.period_elapsed(now) {
                continue;
            }
            return Ok(UsageOutcome::QuotaExceeded {
                used: current.tokens_used_this_period,
                limit: current.tokens_limit,
                requested: amount,
            });
        }

        Err(Self::contended(user_id))
    }

    async fn find_by_subscription_ref(
        &self,
        subscription_ref: &str,
    ) -> Result<Option<EntitlementRecord>> {
        entitlement::Entity::find()
            .filter(entitlement::Column::BillingSubscriptionRef.eq(subscription_ref))
            .one(&self.db)
            .await
            .map_err(db_err)?
            .map(model_to_record)
            .transpose()
    }

    async fn find_by_customer_ref(&self, customer_ref: &str) -> Result<Option<EntitlementRecord>> {
        entitlement::Entity::find()
            .filter(entitlement::Column::BillingCustomerRef.eq(customer_ref))
            .one(&self.db)
            .await
            .map_err(db_err)?
            .map(model_to_record)
            .transpose()
    }

    // -------------------------------------------------------------------------
    // Webhook Idempotency
    // -------------------------------------------------------------------------

    async fn is_event_processed(&self, event_id: &str) -> Result<bool> {
        let event = processed_event::Entity::find_by_id(event_id)
            .one(&self.db)
            .await
            .map_err(db_err)?;

        Ok(event.is_some())
    }

    async fn mark_event_processed(&self, event_id: &str, now: u64) -> Result<()> {
        let event = processed_event::ActiveModel {
            event_id: Set(event_id.to_string()),
            processed_at: Set(u64_to_i64(now)),
        };

        processed_event::Entity::insert(event)
            .on_conflict(
                OnConflict::column(processed_event::Column::EventId)
                    .do_nothing()
                    .to_owned(),
            )
            .do_nothing()
            .exec(&self.db)
            .await
            .map_err(db_err)?;

        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

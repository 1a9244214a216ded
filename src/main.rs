use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;

use inkflow::billing::{
    EntitlementStore, InMemoryEntitlementStore, SeaOrmEntitlementStore, StripeBillingProvider,
    TracingAuditLogger,
};
use inkflow::{App, AppContext, ConfigBuilder, DatabaseConfig};

async fn entitlement_store(config: &DatabaseConfig) -> anyhow::Result<Arc<dyn EntitlementStore>> {
    if config.url.is_none() {
        tracing::warn!(
            "DATABASE_URL not set; entitlements are kept in memory and lost on restart"
        );
        return Ok(Arc::new(InMemoryEntitlementStore::new()));
    }

    let store = SeaOrmEntitlementStore::connect(config)
        .await
        .context("failed to connect to the entitlement database")?;
    if config.auto_migrate {
        store
            .create_schema()
            .await
            .context("failed to create the entitlement schema")?;
    }
    Ok(Arc::new(store))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ConfigBuilder::new()
        .from_env()
        .build()
        .context("invalid configuration")?;
    inkflow::init_tracing_with_config(&config);

    let store = entitlement_store(&config.database).await?;

    let mut context = AppContext::builder()
        .with_billing_config(&config.billing)
        .with_store(store)
        .with_audit_logger(Arc::new(TracingAuditLogger));

    match config.billing.stripe_secret_key.clone() {
        Some(key) => {
            let provider = StripeBillingProvider::new(
                key,
                Duration::from_secs(config.billing.provider_timeout_seconds),
            )
            .context("failed to create Stripe client")?;
            tracing::info!(test_mode = provider.is_test_mode(), "Stripe client configured");
            context = context.with_provider(Arc::new(provider));
        }
        None => {
            tracing::warn!("STRIPE_SECRET_KEY not set; checkout, portal and sync are disabled");
        }
    }
    if config.billing.webhook_secret.is_none() {
        tracing::warn!("STRIPE_WEBHOOK_SECRET not set; webhook deliveries will be rejected");
    }

    App::with_config(config)
        .with_context(context.build())
        .serve()
        .await
        .context("server error")?;

    Ok(())
}

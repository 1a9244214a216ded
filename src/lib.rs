//! inkflow - subscription entitlement core
//!
//! Keeps a per-user entitlement record (tier, status, token quota) consistent
//! with Stripe's webhook stream, gates actions and meters token usage against
//! it, and opens hosted checkout and billing portal sessions.
//!
//! # Features
//!
//! - **Webhooks**: signature-verified, idempotent reconciliation of Stripe events
//! - **Entitlements**: quota checks and atomic usage metering
//! - **Checkout / portal**: hosted Stripe sessions for the pro tier
//! - **Sync**: manual repair of drift between Stripe and local state
//! - **Testing**: Alba-style HTTP testing utilities and event fixtures
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use inkflow::{App, AppContext, ConfigBuilder};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ConfigBuilder::new().from_env().build()?;
//!     inkflow::init_tracing_with_config(&config);
//!
//!     let context = AppContext::builder()
//!         .with_billing_config(&config.billing)
//!         .build();
//!
//!     App::with_config(config).with_context(context).serve().await?;
//!     Ok(())
//! }
//! ```

mod app;
pub mod billing;
mod config;
mod core;
mod error;
pub mod health;
pub mod http;
mod middleware;
pub mod testing;
mod utils;

// Re-exports for public API
pub use app::{AppContext, AppContextBuilder};
pub use config::{
    BillingConfig, Config, ConfigBuilder, DatabaseConfig, LoggingConfig, ServerConfig,
};
pub use core::{App, AppBuilder};
pub use error::{ErrorResponse, InkflowError, Result};
pub use health::{ComponentHealth, HealthCheck, HealthChecker, HealthStatus};
pub use http::RouteModule;
pub use utils::unix_now;

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize tracing/logging with sensible defaults
///
/// # Environment Variables
///
/// - `RUST_LOG`: Set log level (e.g., "info", "debug", "inkflow=debug,billing::audit=info")
/// - `INKFLOW_LOG_JSON`: Set to "true" for JSON formatted logs
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let json_logs = std::env::var("INKFLOW_LOG_JSON")
        .map(|v| v.parse::<bool>().unwrap_or(false))
        .unwrap_or(false);

    install_subscriber(env_filter, json_logs);
}

/// Initialize tracing from the logging section of the config
///
/// `RUST_LOG` still wins when set, so per-target filters keep working.
pub fn init_tracing_with_config(config: &Config) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    install_subscriber(env_filter, config.logging.json);
}

fn install_subscriber(env_filter: EnvFilter, json: bool) {
    let registry = tracing_subscriber::registry().with(env_filter);

    // try_init: a second initialization (tests, embedding) is not an error.
    let result = if json {
        registry.with(tracing_subscriber::fmt::layer().json()).try_init()
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()
    };

    if let Err(e) = result {
        tracing::debug!(error = %e, "Tracing subscriber already installed");
    }
}

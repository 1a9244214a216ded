use axum::{
    Json, Router,
    body::Bytes,
    extract::State,
    http::HeaderMap,
    routing::post,
};
use serde::Serialize;

use super::routes::RouteModule;
use crate::app::AppContext;
use crate::billing::WebhookOutcome;
use crate::error::{InkflowError, Result};

pub const STRIPE_SIGNATURE_HEADER: &str = "stripe-signature";

#[derive(Debug, Serialize)]
pub struct WebhookAck {
    pub received: bool,
    pub outcome: WebhookOutcome,
}

/// Stripe webhook endpoint.
///
/// The body is taken as raw bytes: the signature covers the exact payload,
/// so it must not be re-serialized before verification.
pub async fn receive_billing_webhook(
    State(ctx): State<AppContext>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookAck>> {
    let signature = headers
        .get(STRIPE_SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| InkflowError::authentication("Missing Stripe-Signature header"))?;

    let outcome = ctx.reconciler.process(&body, signature).await?;

    Ok(Json(WebhookAck {
        received: true,
        outcome,
    }))
}

pub struct WebhookRoutes;

impl RouteModule for WebhookRoutes {
    fn routes(&self) -> Router<AppContext> {
        Router::new().route("/billing", post(receive_billing_webhook))
    }

    fn prefix(&self) -> Option<&str> {
        Some("/webhooks")
    }
}

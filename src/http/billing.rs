use axum::{Json, Router, extract::State, routing::post};

use super::routes::RouteModule;
use crate::app::AppContext;
use crate::billing::{
    CheckoutRequest, CheckoutResponse, PortalRequest, PortalResponse, SyncRequest, SyncResult,
};
use crate::error::Result;
use crate::utils::unix_now;

pub async fn create_checkout(
    State(ctx): State<AppContext>,
    Json(request): Json<CheckoutRequest>,
) -> Result<Json<CheckoutResponse>> {
    let response = ctx.checkout.create_checkout_session(request).await?;
    Ok(Json(response))
}

pub async fn create_portal(
    State(ctx): State<AppContext>,
    Json(request): Json<PortalRequest>,
) -> Result<Json<PortalResponse>> {
    let response = ctx.portal.create_portal_session(&request.user_id).await?;
    Ok(Json(response))
}

/// Sync failures are reported in the body with `success: false`.
pub async fn sync_subscription(
    State(ctx): State<AppContext>,
    Json(request): Json<SyncRequest>,
) -> Json<SyncResult> {
    Json(
        ctx.drift
            .sync(&request.user_id, &request.contact_address, unix_now())
            .await,
    )
}

pub struct BillingRoutes;

impl RouteModule for BillingRoutes {
    fn routes(&self) -> Router<AppContext> {
        Router::new()
            .route("/checkout", post(create_checkout))
            .route("/portal", post(create_portal))
            .route("/sync", post(sync_subscription))
    }

    fn prefix(&self) -> Option<&str> {
        Some("/api/billing")
    }
}

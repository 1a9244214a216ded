use axum::{
    Json, Router,
    extract::{Path, State},
    routing::{get, post},
};
use serde::Deserialize;

use super::routes::RouteModule;
use crate::app::AppContext;
use crate::billing::{
    Decision, EntitlementRecord, EntitlementSummary, GatedAction, UsageDecision,
};
use crate::error::Result;
use crate::utils::unix_now;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckRequest {
    pub action: String,
    #[serde(default)]
    pub estimated_cost: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct UsageRequest {
    pub amount: i64,
}

pub async fn get_entitlement(
    State(ctx): State<AppContext>,
    Path(user_id): Path<String>,
) -> Result<Json<EntitlementSummary>> {
    Ok(Json(ctx.entitlements.summary(&user_id, unix_now()).await?))
}

/// Called on login: creates the free-tier record for first-time users.
pub async fn bootstrap_entitlement(
    State(ctx): State<AppContext>,
    Path(user_id): Path<String>,
) -> Result<Json<EntitlementRecord>> {
    Ok(Json(ctx.entitlements.bootstrap(&user_id, unix_now()).await?))
}

pub async fn check_action(
    State(ctx): State<AppContext>,
    Path(user_id): Path<String>,
    Json(request): Json<CheckRequest>,
) -> Result<Json<Decision>> {
    let action: GatedAction = request.action.parse()?;
    let decision = ctx
        .entitlements
        .can_perform(&user_id, action, request.estimated_cost, unix_now())
        .await?;
    Ok(Json(decision))
}

pub async fn record_usage(
    State(ctx): State<AppContext>,
    Path(user_id): Path<String>,
    Json(request): Json<UsageRequest>,
) -> Result<Json<UsageDecision>> {
    let decision = ctx
        .entitlements
        .record_usage(&user_id, request.amount, unix_now())
        .await?;
    Ok(Json(decision))
}

pub struct EntitlementRoutes;

impl RouteModule for EntitlementRoutes {
    fn routes(&self) -> Router<AppContext> {
        Router::new()
            .route("/:user_id", get(get_entitlement))
            .route("/:user_id/bootstrap", post(bootstrap_entitlement))
            .route("/:user_id/check", post(check_action))
            .route("/:user_id/usage", post(record_usage))
    }

    fn prefix(&self) -> Option<&str> {
        Some("/api/entitlements")
    }
}

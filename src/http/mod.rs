//! HTTP surface: route modules and their handlers.
//!
//! Handlers are thin. They extract the request, call one billing service
//! from the [`AppContext`](crate::AppContext) and serialize its result;
//! failures become JSON error bodies through `InkflowError`'s `IntoResponse`.

pub mod billing;
pub mod entitlements;
pub mod routes;
pub mod webhooks;

pub use billing::BillingRoutes;
pub use entitlements::EntitlementRoutes;
pub use routes::RouteModule;
pub use webhooks::{STRIPE_SIGNATURE_HEADER, WebhookRoutes};

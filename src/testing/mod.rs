//! Testing utilities for inkflow
//!
//! - Alba-style HTTP endpoint testing without running a server
//! - Signed Stripe webhook deliveries
//! - Event payload fixtures
//!
//! # Example
//!
//! ```rust,ignore
//! use inkflow::testing::{self, EventFixture};
//!
//! #[tokio::test]
//! async fn test_checkout_completed() {
//!     let payload = EventFixture::checkout_completed("user_1", "cus_1", "sub_1").to_bytes();
//!
//!     testing::signed_webhook(app, "/webhooks/billing", &payload, "whsec_test")
//!         .execute()
//!         .await
//!         .assert_ok()
//!         .assert_json_path("outcome", json!("applied"))
//!         .await;
//! }
//! ```

mod fixtures;
mod scenario;

pub use fixtures::{EventFixture, fake};
pub use scenario::{Scenario, ScenarioAssert, get, post, signed_webhook};

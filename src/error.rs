use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

/// The main error type for inkflow request handlers.
#[derive(Debug, thiserror::Error)]
pub enum InkflowError {
    /// Required external configuration is missing. Fatal for the request.
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Webhook signature mismatch or a missing signature header.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// The billing provider call failed or timed out.
    #[error("Billing provider error: {0}")]
    Upstream(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Internal server error: {0}")]
    Internal(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// JSON body returned for every failed request.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    error: String,
    error_id: String,
}

impl InkflowError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn authentication(msg: impl Into<String>) -> Self {
        Self::Authentication(msg.into())
    }

    pub fn upstream(msg: impl Into<String>) -> Self {
        Self::Upstream(msg.into())
    }

    pub fn database(msg: impl Into<String>) -> Self {
        Self::Database(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub(crate) fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) | Self::Authentication(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Configuration(_)
            | Self::Upstream(_)
            | Self::Database(_)
            | Self::Internal(_)
            | Self::Anyhow(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message suitable for clients.
    ///
    /// Configuration and provider failures carry a descriptive message so the
    /// caller can tell a misconfigured deployment from a provider outage.
    /// Internal failures are reduced to a generic message; the full error is
    /// only written to the server log.
    pub(crate) fn safe_message(&self) -> String {
        match self {
            Self::Database(_) | Self::Internal(_) | Self::Anyhow(_) => {
                "Internal server error".to_string()
            }
            other => other.to_string(),
        }
    }
}

impl IntoResponse for InkflowError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let error_id = uuid::Uuid::new_v4().to_string();

        tracing::error!(
            status = status.as_u16(),
            error_id = %error_id,
            error = %self,
            "Request failed"
        );

        let body = ErrorResponse {
            error: self.safe_message(),
            error_id,
        };

        (status, Json(body)).into_response()
    }
}

/// Result type alias for inkflow operations.
pub type Result<T> = std::result::Result<T, InkflowError>;

impl From<serde_json::Error> for InkflowError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_syntax() || err.is_eof() {
            InkflowError::Validation(format!("JSON error: {}", err))
        } else {
            InkflowError::Internal(format!("JSON serialization error: {}", err))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_taxonomy_status_codes() {
        assert_eq!(
            InkflowError::configuration("missing price").status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            InkflowError::validation("bad tier").status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            InkflowError::not_found("no customer").status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            InkflowError::authentication("bad signature").status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            InkflowError::upstream("stripe down").status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_display() {
        let err = InkflowError::not_found("No active subscription");
        assert_eq!(err.to_string(), "Not found: No active subscription");

        let err = InkflowError::upstream("card_declined");
        assert_eq!(err.to_string(), "Billing provider error: card_declined");
    }

    #[test]
    fn test_safe_message_hides_internal_details() {
        assert_eq!(
            InkflowError::internal("lock poisoned at store.rs:42").safe_message(),
            "Internal server error"
        );

        assert_eq!(
            InkflowError::database("relation \"entitlements\" does not exist").safe_message(),
            "Internal server error"
        );

        let err: InkflowError = anyhow::anyhow!("secret detail").into();
        assert_eq!(err.safe_message(), "Internal server error");
    }

    #[test]
    fn test_safe_message_keeps_provider_message() {
        let err = InkflowError::upstream("No such price: 'price_123'");
        assert!(err.safe_message().contains("No such price"));
    }

    #[test]
    fn test_from_serde_json_syntax_error() {
        let result: std::result::Result<serde_json::Value, _> = serde_json::from_str("{ nope");
        let err: InkflowError = result.unwrap_err().into();
        assert!(matches!(err, InkflowError::Validation(_)));
    }

    #[tokio::test]
    async fn test_into_response_body() {
        let response = InkflowError::validation("tier must be pro").into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();

        assert_eq!(json["error"], "Validation error: tier must be pro");
        let error_id = json["errorId"].as_str().unwrap();
        assert!(uuid::Uuid::parse_str(error_id).is_ok());
    }

    #[tokio::test]
    async fn test_internal_response_is_generic() {
        let response = InkflowError::internal("db password is hunter2").into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"], "Internal server error");
    }
}

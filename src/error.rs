use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

/// The main error type for billing operations.
#[derive(Debug, thiserror::Error)]
pub enum BillingError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Request timeout")]
    RequestTimeout,

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),

    #[cfg(feature = "database")]
    #[error("Database error: {0}")]
    Database(String),
}

/// Standard error response body for API errors.
#[derive(Serialize)]
pub struct ErrorResponse {
    error: String,
    error_id: String,
}

impl BillingError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::Forbidden(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn service_unavailable(msg: impl Into<String>) -> Self {
        Self::ServiceUnavailable(msg.into())
    }

    fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::Internal(_) | Self::Anyhow(_) => StatusCode::INTERNAL_SERVER_ERROR,
            #[cfg(feature = "database")]
            Self::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::RequestTimeout => StatusCode::REQUEST_TIMEOUT,
        }
    }

    /// Returns a message suitable for client responses.
    ///
    /// Client errors (4xx) expose their message; server errors (5xx) return a
    /// generic message so internal details never reach clients. Full details
    /// are logged server-side.
    fn safe_message(&self) -> String {
        match self {
            Self::NotFound(msg) => format!("Not found: {}", msg),
            Self::BadRequest(msg) => format!("Bad request: {}", msg),
            Self::Conflict(msg) => format!("Conflict: {}", msg),
            Self::Forbidden(msg) => format!("Forbidden: {}", msg),
            Self::RequestTimeout => "Request timeout".to_string(),

            Self::Internal(_) | Self::Anyhow(_) => "Internal server error".to_string(),
            Self::ServiceUnavailable(_) => "Service unavailable".to_string(),

            #[cfg(feature = "database")]
            Self::Database(_) => "Database error".to_string(),
        }
    }
}

impl IntoResponse for BillingError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let error_id = uuid::Uuid::new_v4().to_string();

        tracing::error!(
            status = status.as_u16(),
            error_id = %error_id,
            error = %self,
            "Request failed"
        );

        let body = Json(ErrorResponse {
            error: self.safe_message(),
            error_id,
        });

        (status, body).into_response()
    }
}

/// Result type alias for billing operations.
pub type Result<T> = std::result::Result<T, BillingError>;

impl From<serde_json::Error> for BillingError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_syntax() || err.is_eof() {
            BillingError::BadRequest(format!("JSON error: {}", err))
        } else {
            BillingError::Internal(format!("JSON serialization error: {}", err))
        }
    }
}

impl From<reqwest::Error> for BillingError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            BillingError::RequestTimeout
        } else if err.is_connect() {
            BillingError::ServiceUnavailable(format!("Connection error: {}", err))
        } else if err.is_status() {
            match err.status().map(|s| s.as_u16()) {
                Some(404) => BillingError::NotFound("Upstream resource not found".to_string()),
                Some(400..=499) => {
                    BillingError::BadRequest(format!("Upstream rejected request: {}", err))
                }
                _ => BillingError::ServiceUnavailable(format!("Upstream error: {}", err)),
            }
        } else {
            BillingError::Internal(format!("Request error: {}", err))
        }
    }
}

#[cfg(feature = "database")]
impl From<sea_orm::DbErr> for BillingError {
    fn from(err: sea_orm::DbErr) -> Self {
        match &err {
            sea_orm::DbErr::RecordNotFound(msg) => BillingError::NotFound(if msg.is_empty() {
                "Record not found".to_string()
            } else {
                msg.clone()
            }),
            _ => BillingError::Database(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            BillingError::not_found("user").status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            BillingError::bad_request("plan").status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            BillingError::conflict("already upgraded").status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            BillingError::internal("boom").status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            BillingError::service_unavailable("gateway down").status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            BillingError::RequestTimeout.status_code(),
            StatusCode::REQUEST_TIMEOUT
        );
    }

    #[test]
    fn test_safe_message_hides_server_errors() {
        assert_eq!(
            BillingError::internal("db password is hunter2").safe_message(),
            "Internal server error"
        );
        assert_eq!(
            BillingError::service_unavailable("gateway at 10.0.0.3 unreachable").safe_message(),
            "Service unavailable"
        );
    }

    #[test]
    fn test_safe_message_exposes_client_errors() {
        assert_eq!(
            BillingError::conflict("already on business").safe_message(),
            "Conflict: already on business"
        );
        assert_eq!(
            BillingError::not_found("no user for email").safe_message(),
            "Not found: no user for email"
        );
    }

    #[tokio::test]
    async fn test_into_response() {
        let response = BillingError::conflict("redundant upgrade").into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"], "Conflict: redundant upgrade");
        assert!(uuid::Uuid::parse_str(json["error_id"].as_str().unwrap()).is_ok());
    }
}

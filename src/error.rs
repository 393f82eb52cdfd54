//! # Error Handling
//!
//! Two response envelopes live here:
//!
//! * [`ApiError`] renders operator/admin failures as `application/problem+json` with a trace id.
//! * [`ActionResult`] / [`ActionError`] render client-facing actions as
//!   `{ "success": bool, "data" | "message", "code"? }` so callers never have to parse
//!   two shapes for the same endpoint.
//!
//! OAuth callbacks report failures through redirect query parameters instead; the closed set
//! of codes and their user-facing messages is [`CallbackErrorCode`].

use axum::{
    extract::rejection::{JsonRejection, QueryRejection},
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

use crate::telemetry;

/// Unified API error response structure
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ApiError {
    /// HTTP status code for the response
    #[serde(skip_serializing, skip_deserializing)]
    pub status: StatusCode,
    /// Error code for programmatic handling
    pub code: Box<str>,
    /// Human-readable error message
    pub message: Box<str>,
    /// Additional error details (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Box<serde_json::Value>>,
    /// Suggested retry delay in seconds (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
    /// Correlation trace ID for debugging (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<Box<str>>,
}

impl ApiError {
    /// Create a new API error with the given status code and message
    pub fn new<C: Into<String>, M: Into<String>>(status: StatusCode, code: C, message: M) -> Self {
        Self {
            status,
            code: code.into().into_boxed_str(),
            message: message.into().into_boxed_str(),
            details: None,
            retry_after: None,
            trace_id: Self::current_trace_id(),
        }
    }

    /// Add details to the error
    pub fn with_details<V: Into<serde_json::Value>>(mut self, details: V) -> Self {
        self.details = Some(Box::new(details.into()));
        self
    }

    /// Set retry after delay
    pub fn with_retry_after(mut self, seconds: u64) -> Self {
        self.retry_after = Some(seconds);
        self
    }

    /// Trace id of the running request, or a short correlation id outside of one.
    fn current_trace_id() -> Option<Box<str>> {
        telemetry::current_trace_id()
            .map(|trace_id| trace_id.into_boxed_str())
            .or_else(|| {
                Some(format!("corr-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]).into_boxed_str())
            })
    }
}

/// Detects unique-constraint violations across Postgres and SQLite.
pub(crate) fn is_unique_violation(error: &sea_orm::DbErr) -> bool {
    use sea_orm::RuntimeErr;

    const PG_UNIQUE: &str = "23505";
    const SQLITE_DUPLICATE_CODES: &[&str] = &["1555", "2067"];

    let runtime_err = match error {
        sea_orm::DbErr::Query(RuntimeErr::SqlxError(sqlx_err))
        | sea_orm::DbErr::Exec(RuntimeErr::SqlxError(sqlx_err)) => sqlx_err,
        _ => return false,
    };

    let Some(db_error) = runtime_err.as_database_error() else {
        return false;
    };

    if db_error.is_unique_violation() {
        return true;
    }

    db_error.code().is_some_and(|code| {
        let code = code.as_ref();
        code == PG_UNIQUE || SQLITE_DUPLICATE_CODES.contains(&code)
    })
}

/// Standard error types with predefined status codes
#[derive(Debug, Error)]
pub enum ErrorType {
    #[error("Bad Request")]
    BadRequest,
    #[error("Unauthorized")]
    Unauthorized,
    #[error("Forbidden")]
    Forbidden,
    #[error("Not Found")]
    NotFound,
    #[error("Conflict")]
    Conflict,
    #[error("Internal Server Error")]
    InternalServerError,
    #[error("Bad Gateway")]
    BadGateway,
    #[error("Service Unavailable")]
    ServiceUnavailable,
}

impl ErrorType {
    /// Get the appropriate HTTP status code for this error type
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorType::BadRequest => StatusCode::BAD_REQUEST,
            ErrorType::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorType::Forbidden => StatusCode::FORBIDDEN,
            ErrorType::NotFound => StatusCode::NOT_FOUND,
            ErrorType::Conflict => StatusCode::CONFLICT,
            ErrorType::InternalServerError => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorType::BadGateway => StatusCode::BAD_GATEWAY,
            ErrorType::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Get the error code string for this error type
    pub fn error_code(&self) -> &'static str {
        match self {
            ErrorType::BadRequest => "VALIDATION_FAILED",
            ErrorType::Unauthorized => "UNAUTHORIZED",
            ErrorType::Forbidden => "FORBIDDEN",
            ErrorType::NotFound => "NOT_FOUND",
            ErrorType::Conflict => "CONFLICT",
            ErrorType::InternalServerError => "INTERNAL_SERVER_ERROR",
            ErrorType::BadGateway => "PROVIDER_ERROR",
            ErrorType::ServiceUnavailable => "SERVICE_UNAVAILABLE",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut headers = HeaderMap::new();
        headers.insert(
            "content-type",
            HeaderValue::from_static("application/problem+json"),
        );

        if let Some(retry_after) = self.retry_after
            && let Ok(header_value) = HeaderValue::from_str(&retry_after.to_string())
        {
            headers.insert("retry-after", header_value);
        }

        (self.status, headers, axum::Json(self)).into_response()
    }
}

impl From<ErrorType> for ApiError {
    fn from(error_type: ErrorType) -> Self {
        Self::new(
            error_type.status_code(),
            error_type.error_code(),
            error_type.to_string(),
        )
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(error: anyhow::Error) -> Self {
        tracing::error!("Internal error: {:?}", error);

        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "INTERNAL_SERVER_ERROR",
            "An internal error occurred",
        )
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        let message = match rejection {
            JsonRejection::JsonDataError(err) => format!("Invalid JSON: {}", err.body_text()),
            JsonRejection::JsonSyntaxError(err) => {
                format!("JSON syntax error: {}", err.body_text())
            }
            JsonRejection::MissingJsonContentType(_) => {
                "Missing 'Content-Type: application/json' header".to_string()
            }
            _ => "Invalid request body".to_string(),
        };

        Self::new(StatusCode::BAD_REQUEST, "VALIDATION_FAILED", message)
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self::new(
            StatusCode::BAD_REQUEST,
            "VALIDATION_FAILED",
            format!("Invalid query string: {}", rejection.body_text()),
        )
    }
}

impl From<sea_orm::DbErr> for ApiError {
    fn from(error: sea_orm::DbErr) -> Self {
        if is_unique_violation(&error) {
            tracing::debug!(?error, "Unique constraint violation detected");
            return Self::new(StatusCode::CONFLICT, "CONFLICT", "Resource already exists");
        }

        match error {
            sea_orm::DbErr::RecordNotFound(record) => Self::new(
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                format!("Record not found: {}", record),
            ),
            sea_orm::DbErr::Conn(connection_err) => {
                tracing::error!("Database connection error: {:?}", connection_err);
                Self::new(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "SERVICE_UNAVAILABLE",
                    "Database service unavailable",
                )
            }
            other => {
                tracing::error!("Database error: {:?}", other);
                Self::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_SERVER_ERROR",
                    "Database error occurred",
                )
            }
        }
    }
}

/// Create an unauthorized error (401)
pub fn unauthorized(message: Option<&str>) -> ApiError {
    let msg = message.unwrap_or("Authentication required");
    ApiError::new(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", msg)
}

/// Create a forbidden error (403)
pub fn forbidden(message: Option<&str>) -> ApiError {
    let msg = message.unwrap_or("Insufficient permissions");
    ApiError::new(StatusCode::FORBIDDEN, "FORBIDDEN", msg)
}

/// Create a not found error (404)
pub fn not_found(message: impl Into<String>) -> ApiError {
    ApiError::new(StatusCode::NOT_FOUND, "NOT_FOUND", message)
}

/// Create a validation error with field details
pub fn validation_error(message: &str, field_errors: serde_json::Value) -> ApiError {
    ApiError::new(StatusCode::BAD_REQUEST, "VALIDATION_FAILED", message).with_details(field_errors)
}

/// Uniform result envelope for client-facing actions.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ActionResult<T> {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl<T> ActionResult<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: None,
            code: None,
        }
    }

    pub fn failure(message: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            message: Some(message.into()),
            code: Some(code.into()),
        }
    }
}

/// An [`ApiError`] rendered in the [`ActionResult`] shape, keeping its HTTP status.
#[derive(Debug)]
pub struct ActionError(pub ApiError);

impl<E: Into<ApiError>> From<E> for ActionError {
    fn from(error: E) -> Self {
        Self(error.into())
    }
}

impl IntoResponse for ActionError {
    fn into_response(self) -> Response {
        let ApiError {
            status,
            code,
            message,
            ..
        } = self.0;
        let body: ActionResult<()> = ActionResult::failure(message, code);
        (status, axum::Json(body)).into_response()
    }
}

/// Failure reasons reported to the dashboard through the `error` query parameter of an OAuth
/// callback redirect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum CallbackErrorCode {
    NoRefreshTokenIssued,
    DbConfigFailed,
    FitbitTokenExchangeFailed,
    TokenExchangeFailed,
    InvalidState,
    AccessDenied,
    MissingCode,
    UserinfoFailed,
    ProviderNotConfigured,
}

impl CallbackErrorCode {
    pub const ALL: [CallbackErrorCode; 9] = [
        Self::NoRefreshTokenIssued,
        Self::DbConfigFailed,
        Self::FitbitTokenExchangeFailed,
        Self::TokenExchangeFailed,
        Self::InvalidState,
        Self::AccessDenied,
        Self::MissingCode,
        Self::UserinfoFailed,
        Self::ProviderNotConfigured,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::NoRefreshTokenIssued => "no_refresh_token_issued",
            Self::DbConfigFailed => "db_config_failed",
            Self::FitbitTokenExchangeFailed => "fitbit_token_exchange_failed",
            Self::TokenExchangeFailed => "token_exchange_failed",
            Self::InvalidState => "invalid_state",
            Self::AccessDenied => "access_denied",
            Self::MissingCode => "missing_code",
            Self::UserinfoFailed => "userinfo_failed",
            Self::ProviderNotConfigured => "provider_not_configured",
        }
    }

    pub fn parse(code: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|candidate| candidate.as_str() == code)
    }

    /// Message shown to the user for this code.
    pub fn user_message(self) -> &'static str {
        match self {
            Self::NoRefreshTokenIssued => {
                "The provider did not issue a long-lived token. Remove this app's access from your account's security settings, then connect again."
            }
            Self::DbConfigFailed => {
                "The connection succeeded but could not be saved. Please try again."
            }
            Self::FitbitTokenExchangeFailed => {
                "Fitbit did not accept the authorization. Please try connecting again."
            }
            Self::TokenExchangeFailed => {
                "The provider did not accept the authorization. Please try connecting again."
            }
            Self::InvalidState => "This connection link has expired. Please start again.",
            Self::AccessDenied => "Access was not granted, so nothing was connected.",
            Self::MissingCode => "The provider did not return an authorization code.",
            Self::UserinfoFailed => "Could not read the connected account's identity.",
            Self::ProviderNotConfigured => "This integration is not configured on the server.",
        }
    }
}

impl std::fmt::Display for CallbackErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use serde_json::json;

    #[test]
    fn test_api_error_basic() {
        let error = ApiError::new(
            StatusCode::BAD_REQUEST,
            "VALIDATION_FAILED",
            "Test error message",
        );

        assert_eq!(error.code, Box::from("VALIDATION_FAILED"));
        assert_eq!(error.message, Box::from("Test error message"));
        assert_eq!(error.details, None);
        assert_eq!(error.retry_after, None);
    }

    #[test]
    fn test_api_error_with_details() {
        let error = ApiError::new(StatusCode::BAD_REQUEST, "BAD_REQUEST", "Test error message")
            .with_details(json!({"field": "value"}));

        assert_eq!(error.details, Some(Box::new(json!({"field": "value"}))));
    }

    #[test]
    fn test_error_type_mapping() {
        let not_found_error: ApiError = ErrorType::NotFound.into();
        assert_eq!(not_found_error.code, Box::from("NOT_FOUND"));
        assert_eq!(not_found_error.message, Box::from("Not Found"));
    }

    #[test]
    fn test_from_anyhow_hides_details() {
        let api_error: ApiError = anyhow::anyhow!("connection string leaked").into();

        assert_eq!(api_error.code, Box::from("INTERNAL_SERVER_ERROR"));
        assert!(!api_error.message.contains("leaked"));
    }

    #[test]
    fn test_content_type_and_retry_after() {
        let response = ApiError::new(StatusCode::TOO_MANY_REQUESTS, "RATE_LIMITED", "slow down")
            .with_retry_after(60)
            .into_response();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers().get("retry-after").unwrap(), "60");
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "application/problem+json"
        );
    }

    #[test]
    fn test_trace_id_fallback_outside_request() {
        let error = ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "X", "Test error");
        let trace_id = error.trace_id.unwrap();
        assert!(trace_id.starts_with("corr-"));
        assert_eq!(trace_id.len(), 13);
    }

    #[tokio::test]
    async fn test_trace_id_uses_active_context() {
        let error = telemetry::with_trace_context(
            telemetry::TraceContext {
                trace_id: "trace-abc".to_string(),
            },
            async { ApiError::new(StatusCode::NOT_FOUND, "NOT_FOUND", "missing") },
        )
        .await;
        assert_eq!(error.trace_id.as_deref(), Some("trace-abc"));
    }

    #[test]
    fn test_database_error_mapping() {
        let api_error: ApiError = sea_orm::DbErr::RecordNotFound("test_record".to_string()).into();

        assert_eq!(api_error.status, StatusCode::NOT_FOUND);
        assert!(api_error.message.contains("test_record"));
    }

    #[test]
    fn test_auth_error_helpers() {
        assert_eq!(unauthorized(None).status, StatusCode::UNAUTHORIZED);
        assert_eq!(
            unauthorized(Some("Invalid token")).message,
            Box::from("Invalid token")
        );
        let forbidden_error = forbidden(None);
        assert_eq!(forbidden_error.status, StatusCode::FORBIDDEN);
        assert_eq!(forbidden_error.code, Box::from("FORBIDDEN"));
    }

    #[test]
    fn test_validation_error_with_details() {
        let field_errors = json!({"timesDone": "must be provided"});
        let error = validation_error("Validation failed", field_errors.clone());

        assert_eq!(error.status, StatusCode::BAD_REQUEST);
        assert_eq!(error.details, Some(Box::new(field_errors)));
    }

    #[test]
    fn test_action_result_shapes() {
        let ok = serde_json::to_value(ActionResult::ok(json!({"timesDone": 2}))).unwrap();
        assert_eq!(ok, json!({"success": true, "data": {"timesDone": 2}}));

        let failure: ActionResult<()> = ActionResult::failure("nope", "FORBIDDEN");
        let failure = serde_json::to_value(failure).unwrap();
        assert_eq!(
            failure,
            json!({"success": false, "message": "nope", "code": "FORBIDDEN"})
        );
    }

    #[tokio::test]
    async fn test_action_error_keeps_status_and_shape() {
        let response = ActionError::from(forbidden(Some("Not enrolled"))).into_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["success"], false);
        assert_eq!(value["message"], "Not enrolled");
        assert_eq!(value["code"], "FORBIDDEN");
        assert!(value.get("data").is_none());
    }

    #[test]
    fn test_callback_codes_roundtrip_and_have_messages() {
        for code in CallbackErrorCode::ALL {
            assert_eq!(CallbackErrorCode::parse(code.as_str()), Some(code));
            assert!(!code.user_message().is_empty());
            let serialized = serde_json::to_value(code).unwrap();
            assert_eq!(serialized, json!(code.as_str()));
        }
        assert_eq!(CallbackErrorCode::parse("unknown_code"), None);
    }
}

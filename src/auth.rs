//! # Authentication and Authorization
//!
//! Protected routes sit behind the dashboard's session gateway, which calls this service with
//! an operator bearer token and names the signed-in client in `X-Client-Id`. The middleware
//! checks both and inserts an [`ActingClient`]; handlers then load the client and check roles.

use std::sync::Arc;

use axum::{
    extract::{FromRef, FromRequestParts, Request, State},
    http::{HeaderMap, header::AUTHORIZATION, request::Parts},
    middleware::Next,
    response::Response,
};
use sea_orm::DatabaseConnection;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use utoipa::IntoParams;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::error::{ApiError, forbidden, unauthorized, validation_error};
use crate::models::client;
use crate::repositories::ClientRepository;
use crate::server::AppState;

/// Header naming the signed-in client
pub const CLIENT_ID_HEADER: &str = "X-Client-Id";

/// The client on whose behalf a request is made
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActingClient(pub Uuid);

impl FromRef<AppState> for Arc<AppConfig> {
    fn from_ref(app_state: &AppState) -> Self {
        Arc::clone(&app_state.config)
    }
}

/// Validates the operator bearer token and the acting client header.
pub async fn auth_middleware(
    State(config): State<Arc<AppConfig>>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let headers = request.headers();

    let token = extract_bearer_token(headers)?;
    validate_token(&config, token)?;

    let acting = extract_client_id(headers)?;
    tracing::debug!(client_id = %acting.0, "Authenticated request");

    request.extensions_mut().insert(acting);

    Ok(next.run(request).await)
}

fn extract_bearer_token(headers: &HeaderMap) -> Result<&str, ApiError> {
    let header = headers
        .get(AUTHORIZATION)
        .ok_or_else(|| unauthorized(Some("Missing Authorization header")))?
        .to_str()
        .map_err(|_| unauthorized(Some("Invalid Authorization header")))?;

    header
        .strip_prefix("Bearer ")
        .ok_or_else(|| unauthorized(Some("Authorization header must use Bearer scheme")))
}

fn validate_token(config: &AppConfig, token: &str) -> Result<(), ApiError> {
    let is_valid = config
        .operator_tokens
        .iter()
        .any(|configured| ConstantTimeEq::ct_eq(token.as_bytes(), configured.as_bytes()).into());

    if is_valid {
        Ok(())
    } else {
        Err(unauthorized(Some("Invalid bearer token")))
    }
}

fn extract_client_id(headers: &HeaderMap) -> Result<ActingClient, ApiError> {
    let header_value = headers
        .get(CLIENT_ID_HEADER)
        .ok_or_else(|| {
            validation_error(
                "Missing required header",
                serde_json::json!({ CLIENT_ID_HEADER: "Required header is missing" }),
            )
        })?
        .to_str()
        .map_err(|_| {
            validation_error(
                "Invalid client header",
                serde_json::json!({ CLIENT_ID_HEADER: "Header must be valid UTF-8" }),
            )
        })?;

    header_value.parse::<Uuid>().map(ActingClient).map_err(|_| {
        validation_error(
            "Invalid client ID",
            serde_json::json!({ CLIENT_ID_HEADER: "Must be a valid UUID" }),
        )
    })
}

/// OpenAPI header parameter for X-Client-Id
#[derive(Debug, Serialize, Deserialize, IntoParams, utoipa::ToSchema)]
#[into_params(parameter_in = Header)]
pub struct ClientHeader {
    /// Identifier (UUID) of the signed-in client
    #[serde(rename = "X-Client-Id")]
    #[param(rename = "X-Client-Id", value_type = String)]
    pub client_id: String,
}

impl<S> FromRequestParts<S> for ActingClient
where
    S: Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<ActingClient>()
            .copied()
            .ok_or_else(|| unauthorized(Some("Client context missing")))
    }
}

/// Loads the acting client; an unknown id is treated as unauthenticated.
pub async fn load_client(
    db: &DatabaseConnection,
    acting: ActingClient,
) -> Result<client::Model, ApiError> {
    ClientRepository::new(Arc::new(db.clone()))
        .find_by_id(acting.0)
        .await?
        .ok_or_else(|| unauthorized(Some("Unknown client")))
}

/// Loads the acting client and requires the Admin or SystemAdmin role.
pub async fn require_admin(
    db: &DatabaseConnection,
    acting: ActingClient,
) -> Result<client::Model, ApiError> {
    let client = load_client(db, acting).await?;
    if !client.is_admin() {
        tracing::warn!(client_id = %acting.0, "Admin route denied");
        return Err(forbidden(Some("Administrator role required")));
    }
    Ok(client)
}

//! # Integration Handlers
//!
//! Listing, verifying and disconnecting stored OAuth integrations.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::auth::{ActingClient, ClientHeader, load_client, require_admin};
use crate::credentials::{CredentialError, IntegrationSummary, millis_to_datetime};
use crate::error::ApiError;
use crate::handlers::connect::system_provider;
use crate::providers::ProviderKind;
use crate::server::AppState;

/// Stored system integrations and the providers this deployment can connect
#[derive(Debug, Serialize, ToSchema)]
pub struct IntegrationsResponse {
    pub integrations: Vec<IntegrationSummary>,
    pub configured_providers: Vec<ProviderKind>,
}

/// Result of checking that a system integration can still mint access tokens
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct VerifyIntegrationResponse {
    pub provider: String,
    pub connected_email: String,
    pub expires_at: Option<DateTime<Utc>>,
    /// Whether a refresh was needed
    pub refreshed: bool,
}

/// Fitbit connection state for the acting client
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct FitbitStatusResponse {
    pub connected: bool,
    pub user_id: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// List system integrations
#[utoipa::path(
    get,
    path = "/api/admin/integrations",
    security(("bearer_auth" = [])),
    params(ClientHeader),
    responses(
        (status = 200, description = "Stored integrations", body = IntegrationsResponse),
        (status = 401, description = "Missing or invalid authorization token", body = ApiError),
        (status = 403, description = "Administrator role required", body = ApiError)
    ),
    tag = "integrations"
)]
pub async fn list_integrations(
    State(state): State<AppState>,
    acting: ActingClient,
) -> Result<Json<IntegrationsResponse>, ApiError> {
    require_admin(&state.db, acting).await?;

    let integrations = state.credentials.list_connections().await?;

    Ok(Json(IntegrationsResponse {
        integrations,
        configured_providers: state.credentials.configured_providers(),
    }))
}

/// Verify a system integration
///
/// Obtains an access token for the provider, refreshing it when the stored one is stale.
#[utoipa::path(
    post,
    path = "/api/admin/integrations/{provider}/verify",
    security(("bearer_auth" = [])),
    params(
        ("provider" = String, Path, description = "System integration: 'gmail' or 'google_chat'"),
        ClientHeader
    ),
    responses(
        (status = 200, description = "Integration is usable", body = VerifyIntegrationResponse),
        (status = 404, description = "Integration not connected", body = ApiError),
        (status = 409, description = "Reconnect required", body = ApiError)
    ),
    tag = "integrations"
)]
pub async fn verify_integration(
    State(state): State<AppState>,
    acting: ActingClient,
    Path(provider): Path<String>,
) -> Result<Json<VerifyIntegrationResponse>, ApiError> {
    require_admin(&state.db, acting).await?;
    let kind = system_provider(&provider)?;

    let token = state.credentials.authorized_access_token(kind).await?;

    Ok(Json(VerifyIntegrationResponse {
        provider: kind.as_str().to_string(),
        connected_email: token.account,
        expires_at: token.expires_at.and_then(millis_to_datetime),
        refreshed: token.refreshed,
    }))
}

/// Disconnect a system integration record
#[utoipa::path(
    delete,
    path = "/api/admin/integrations/{provider}/{id}",
    security(("bearer_auth" = [])),
    params(
        ("provider" = String, Path, description = "System integration: 'gmail' or 'google_chat'"),
        ("id" = Uuid, Path, description = "Integration record id"),
        ClientHeader
    ),
    responses(
        (status = 204, description = "Integration removed"),
        (status = 404, description = "Integration not connected", body = ApiError)
    ),
    tag = "integrations"
)]
pub async fn disconnect_integration(
    State(state): State<AppState>,
    acting: ActingClient,
    Path((provider, id)): Path<(String, Uuid)>,
) -> Result<StatusCode, ApiError> {
    require_admin(&state.db, acting).await?;
    let kind = system_provider(&provider)?;

    state.credentials.disconnect(kind, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Fitbit status for the acting client
#[utoipa::path(
    get,
    path = "/api/client/integrations/fitbit",
    security(("bearer_auth" = [])),
    params(ClientHeader),
    responses(
        (status = 200, description = "Connection state", body = FitbitStatusResponse),
        (status = 409, description = "Reconnect required", body = ApiError)
    ),
    tag = "integrations"
)]
pub async fn fitbit_status(
    State(state): State<AppState>,
    acting: ActingClient,
) -> Result<Json<FitbitStatusResponse>, ApiError> {
    load_client(&state.db, acting).await?;

    match state.credentials.client_access_token(acting.0).await {
        Ok(token) => Ok(Json(FitbitStatusResponse {
            connected: true,
            user_id: Some(token.account),
            expires_at: token.expires_at.and_then(millis_to_datetime),
        })),
        Err(CredentialError::NotConnected(_)) => Ok(Json(FitbitStatusResponse {
            connected: false,
            user_id: None,
            expires_at: None,
        })),
        Err(e) => Err(e.into()),
    }
}

/// Disconnect Fitbit for the acting client
#[utoipa::path(
    delete,
    path = "/api/client/integrations/fitbit",
    security(("bearer_auth" = [])),
    params(ClientHeader),
    responses(
        (status = 204, description = "Fitbit removed"),
        (status = 404, description = "Fitbit not connected", body = ApiError)
    ),
    tag = "integrations"
)]
pub async fn disconnect_fitbit(
    State(state): State<AppState>,
    acting: ActingClient,
) -> Result<StatusCode, ApiError> {
    load_client(&state.db, acting).await?;

    state.credentials.disconnect_client(acting.0).await?;
    Ok(StatusCode::NO_CONTENT)
}

//! # Connection Handlers
//!
//! Starting OAuth flows, the provider callback, and the callback error lookup.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Redirect, Response},
};
use metrics::counter;
use serde::{Deserialize, Serialize};
use url::Url;
use utoipa::{IntoParams, ToSchema};

use crate::auth::{ActingClient, ClientHeader, load_client, require_admin};
use crate::credentials::CredentialError;
use crate::error::{ApiError, CallbackErrorCode, not_found};
use crate::providers::ProviderKind;
use crate::server::AppState;

const MAX_AUTHORIZE_URL_LEN: usize = 2048;

/// OAuth authorization URL response for API
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct AuthorizeUrlResponse {
    /// Complete authorization URL for user redirection
    pub authorize_url: String,
}

/// Query parameters a provider appends to the callback
#[derive(Debug, Default, Deserialize, IntoParams)]
pub struct CallbackQuery {
    pub code: Option<String>,
    pub state: Option<String>,
    /// Set by the provider when the user declined or the request was invalid
    pub error: Option<String>,
}

/// A callback error code and its user-facing message
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct CallbackErrorResponse {
    pub code: String,
    pub message: String,
}

/// Resolves a path provider key to a system integration.
pub(crate) fn system_provider(provider: &str) -> Result<ProviderKind, ApiError> {
    match ProviderKind::parse(provider) {
        Some(kind) if kind.is_system() => Ok(kind),
        Some(kind) => Err(CredentialError::UnsupportedProvider(kind).into()),
        None => Err(not_found(format!("provider '{}' not found", provider))),
    }
}

/// Start OAuth flow for a system integration
#[utoipa::path(
    post,
    path = "/api/admin/integrations/{provider}/connect",
    security(("bearer_auth" = [])),
    params(
        ("provider" = String, Path, description = "System integration: 'gmail' or 'google_chat'"),
        ClientHeader
    ),
    responses(
        (status = 200, description = "Authorization URL generated", body = AuthorizeUrlResponse),
        (status = 400, description = "Provider not configured or not a system integration", body = ApiError),
        (status = 401, description = "Missing or invalid authorization token", body = ApiError),
        (status = 403, description = "Administrator role required", body = ApiError),
        (status = 404, description = "Unknown provider", body = ApiError)
    ),
    tag = "integrations"
)]
pub async fn connect_system_integration(
    State(state): State<AppState>,
    acting: ActingClient,
    Path(provider): Path<String>,
) -> Result<Json<AuthorizeUrlResponse>, ApiError> {
    require_admin(&state.db, acting).await?;
    let kind = system_provider(&provider)?;

    let authorize_url = state.credentials.begin_system_connection(kind).await?;
    validate_authorize_url(&authorize_url)?;

    tracing::info!(provider = %kind, client_id = %acting.0, "OAuth flow initiated");

    Ok(Json(AuthorizeUrlResponse {
        authorize_url: authorize_url.to_string(),
    }))
}

/// Start Fitbit OAuth flow for the acting client
#[utoipa::path(
    post,
    path = "/api/client/integrations/fitbit/connect",
    security(("bearer_auth" = [])),
    params(ClientHeader),
    responses(
        (status = 200, description = "Authorization URL generated", body = AuthorizeUrlResponse),
        (status = 400, description = "Fitbit is not configured", body = ApiError),
        (status = 401, description = "Missing or invalid authorization token", body = ApiError)
    ),
    tag = "integrations"
)]
pub async fn connect_fitbit(
    State(state): State<AppState>,
    acting: ActingClient,
) -> Result<Json<AuthorizeUrlResponse>, ApiError> {
    load_client(&state.db, acting).await?;

    let authorize_url = state.credentials.begin_client_connection(acting.0).await?;
    validate_authorize_url(&authorize_url)?;

    tracing::info!(client_id = %acting.0, "Fitbit OAuth flow initiated");

    Ok(Json(AuthorizeUrlResponse {
        authorize_url: authorize_url.to_string(),
    }))
}

/// OAuth callback
///
/// Consumes the state, completes the connection and redirects the browser back to the
/// dashboard with either `connected=<provider>` or `error=<code>`.
#[utoipa::path(
    get,
    path = "/api/integrations/{provider}/callback",
    params(
        ("provider" = String, Path, description = "Provider key"),
        CallbackQuery
    ),
    responses(
        (status = 303, description = "Redirect back to the dashboard"),
        (status = 404, description = "Unknown provider", body = ApiError)
    ),
    tag = "integrations"
)]
pub async fn oauth_callback(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    Query(query): Query<CallbackQuery>,
) -> Result<Response, ApiError> {
    let kind = ProviderKind::parse(&provider)
        .ok_or_else(|| not_found(format!("provider '{}' not found", provider)))?;

    let outcome = complete_callback(&state, kind, query).await;

    let outcome_label = match outcome {
        Ok(()) => "success",
        Err(code) => code.as_str(),
    };
    counter!(
        "oauth_callback_total",
        "provider" => kind.as_str(),
        "outcome" => outcome_label
    )
    .increment(1);

    let target = callback_redirect(&state.config.app_base_url, kind, outcome)?;
    Ok(Redirect::to(target.as_str()).into_response())
}

async fn complete_callback(
    state: &AppState,
    kind: ProviderKind,
    query: CallbackQuery,
) -> Result<(), CallbackErrorCode> {
    let Some(state_token) = query.state.as_deref().filter(|s| !s.is_empty()) else {
        return Err(CallbackErrorCode::InvalidState);
    };

    let client_id = state
        .credentials
        .consume_state(kind, state_token)
        .await
        .map_err(|e| {
            tracing::warn!(provider = %kind, error = %e, "Rejected OAuth callback state");
            e.callback_code()
        })?;

    if let Some(error) = query.error.as_deref() {
        tracing::info!(provider = %kind, provider_error = %error, "Provider reported an authorization error");
        return Err(CallbackErrorCode::AccessDenied);
    }

    let Some(code) = query.code.as_deref().filter(|c| !c.is_empty()) else {
        return Err(CallbackErrorCode::MissingCode);
    };

    let result = match client_id {
        Some(client_id) => state
            .credentials
            .complete_client_connection(client_id, code)
            .await
            .map(|_| ()),
        None => state
            .credentials
            .complete_system_connection(kind, code)
            .await
            .map(|_| ()),
    };

    result.map_err(|e| {
        tracing::warn!(provider = %kind, error = %e, "OAuth callback failed");
        e.callback_code()
    })
}

/// Dashboard location a callback for `kind` returns to.
pub(crate) fn callback_redirect(
    app_base_url: &str,
    kind: ProviderKind,
    outcome: Result<(), CallbackErrorCode>,
) -> Result<Url, ApiError> {
    let page = if kind.is_system() {
        "admin/integrations"
    } else {
        "client/settings"
    };

    let mut url = Url::parse(&format!("{}/{}", app_base_url.trim_end_matches('/'), page))
        .map_err(|e| {
            tracing::error!(error = %e, "Invalid app base URL");
            ApiError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_SERVER_ERROR",
                "Invalid redirect configuration",
            )
        })?;

    match outcome {
        Ok(()) => url.query_pairs_mut().append_pair("connected", kind.as_str()),
        Err(code) => url.query_pairs_mut().append_pair("error", code.as_str()),
    };

    Ok(url)
}

/// Look up the message for a callback error code
#[utoipa::path(
    get,
    path = "/api/integrations/errors/{code}",
    params(("code" = String, Path, description = "Error code from a callback redirect")),
    responses(
        (status = 200, description = "Message for the code", body = CallbackErrorResponse),
        (status = 404, description = "Unknown code", body = ApiError)
    ),
    tag = "integrations"
)]
pub async fn callback_error_lookup(
    Path(code): Path<String>,
) -> Result<Json<CallbackErrorResponse>, ApiError> {
    let code = CallbackErrorCode::parse(&code)
        .ok_or_else(|| not_found(format!("Unknown error code '{}'", code)))?;

    Ok(Json(CallbackErrorResponse {
        code: code.as_str().to_string(),
        message: code.user_message().to_string(),
    }))
}

/// Validate a generated authorization URL before handing it to a browser
fn validate_authorize_url(url: &Url) -> Result<(), ApiError> {
    let loopback = matches!(url.host_str(), Some("localhost" | "127.0.0.1"));
    if url.scheme() != "https" && !loopback {
        return Err(ApiError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "INTERNAL_SERVER_ERROR",
            "Generated authorization URL must use HTTPS",
        ));
    }

    // RFC 6749 section 3.1
    if url.fragment().is_some() {
        return Err(ApiError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "INTERNAL_SERVER_ERROR",
            "Generated authorization URL must not include a fragment",
        ));
    }

    if url.as_str().len() > MAX_AUTHORIZE_URL_LEN {
        return Err(ApiError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "INTERNAL_SERVER_ERROR",
            "Generated authorization URL exceeds 2048 characters",
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redirects_system_providers_to_admin_page() {
        let url =
            callback_redirect("https://app.example.com/", ProviderKind::Gmail, Ok(())).unwrap();
        assert_eq!(
            url.as_str(),
            "https://app.example.com/admin/integrations?connected=gmail"
        );

        let url = callback_redirect(
            "https://app.example.com",
            ProviderKind::GoogleChat,
            Err(CallbackErrorCode::NoRefreshTokenIssued),
        )
        .unwrap();
        assert_eq!(
            url.as_str(),
            "https://app.example.com/admin/integrations?error=no_refresh_token_issued"
        );
    }

    #[test]
    fn redirects_fitbit_to_client_settings() {
        let url = callback_redirect(
            "http://localhost:3000",
            ProviderKind::Fitbit,
            Err(CallbackErrorCode::FitbitTokenExchangeFailed),
        )
        .unwrap();
        assert_eq!(
            url.as_str(),
            "http://localhost:3000/client/settings?error=fitbit_token_exchange_failed"
        );
    }

    #[test]
    fn system_provider_parsing() {
        assert_eq!(system_provider("gmail").unwrap(), ProviderKind::Gmail);
        assert_eq!(system_provider("fitbit").unwrap_err().status, StatusCode::BAD_REQUEST);
        assert_eq!(system_provider("strava").unwrap_err().status, StatusCode::NOT_FOUND);
    }

    #[test]
    fn authorize_url_validation() {
        let check = |raw: &str| validate_authorize_url(&Url::parse(raw).unwrap());

        assert!(check("https://accounts.google.com/o/oauth2/v2/auth?a=b").is_ok());
        assert!(check("http://127.0.0.1:1234/auth").is_ok());
        assert!(check("http://evil.example.com/auth").is_err());
        assert!(check("https://accounts.google.com/auth#frag").is_err());

        let long = format!("https://accounts.google.com/auth?x={}", "a".repeat(2100));
        assert!(check(&long).is_err());
    }
}

//! # Credential Service
//!
//! Keeps OAuth integrations authenticated without user interaction.
//!
//! * System integrations (Gmail, Google Chat) live in `oauth_services`, one row per connected
//!   account, with the refresh token encrypted in the properties blob.
//! * Fitbit is connected per client and stored as the `fitbit` entry of `Client.settings`,
//!   with both tokens encrypted.
//!
//! Every record follows the same rule: a stored access token that is still valid (after the
//! configured leeway) is served as is; otherwise the refresh token is decrypted, exactly one
//! refresh is attempted, and the new token is persisted before it is returned. A failed
//! refresh leaves the record untouched and surfaces [`CredentialError::ReauthRequired`].

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use rand::Rng;
use sea_orm::DatabaseConnection;
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, instrument, warn};
use url::Url;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::crypto::{CredentialCipher, CredentialPurpose, CryptoError};
use crate::error::{ApiError, CallbackErrorCode};
use crate::models::oauth_service::OAuthServiceProperties;
use crate::models::settings::{self, IntegrationSetting};
use crate::providers::{OAuthProvider, ProviderError, ProviderKind, ProviderSet, TokenGrant};
use crate::repositories::{ClientRepository, OAuthServiceRepository, OAuthStateRepository};

/// Settings entry id and property names for the per-client Fitbit integration.
pub const FITBIT_SETTING_ID: &str = "fitbit";
const INTEGRATION_SETTING_TYPE: &str = "integration";
pub const PROP_USER_ID: &str = "userId";
pub const PROP_ACCESS_TOKEN: &str = "accessToken";
pub const PROP_REFRESH_TOKEN: &str = "refreshToken";
pub const PROP_EXPIRES_AT: &str = "expiresAt";
pub const PROP_SCOPES: &str = "scopes";

/// Classification of token refresh errors, used for logs and metrics only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshErrorClassification {
    /// The grant is gone (e.g. `invalid_grant`); only a reconnect helps
    Permanent,
    /// Network issues and provider hiccups
    Transient,
    RateLimited,
}

impl RefreshErrorClassification {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Permanent => "permanent",
            Self::Transient => "transient",
            Self::RateLimited => "rate_limited",
        }
    }
}

/// Classify a refresh failure by its error text.
pub fn classify_refresh_error(error_str: &str) -> RefreshErrorClassification {
    let error_lower = error_str.to_lowercase();

    if error_lower.contains("invalid_grant")
        || error_lower.contains("invalid_client")
        || error_lower.contains("unauthorized_client")
        || error_lower.contains("revoked")
        || error_lower.contains("forbidden")
        || error_lower.contains("access_denied")
        || error_lower.contains("unsupported_grant_type")
    {
        return RefreshErrorClassification::Permanent;
    }

    if error_lower.contains("rate limit")
        || error_lower.contains("rate_limit")
        || error_lower.contains("too_many_requests")
        || error_lower.contains("temporarily_unavailable")
        || error_lower.contains("quota_exceeded")
    {
        return RefreshErrorClassification::RateLimited;
    }

    RefreshErrorClassification::Transient
}

fn classify_provider_error(error: &ProviderError) -> RefreshErrorClassification {
    match error {
        ProviderError::RateLimited { .. } => RefreshErrorClassification::RateLimited,
        ProviderError::Network(_) => RefreshErrorClassification::Transient,
        other => classify_refresh_error(&other.to_string()),
    }
}

/// Whether an access token expiring at `expires_at_ms` is still usable at `now_ms`.
pub fn is_token_fresh(expires_at_ms: Option<i64>, now_ms: i64, leeway_secs: u64) -> bool {
    let leeway_ms = i64::try_from(leeway_secs)
        .unwrap_or(i64::MAX)
        .saturating_mul(1000);
    expires_at_ms.is_some_and(|expires| expires.saturating_sub(leeway_ms) > now_ms)
}

/// 32 random bytes, base64url encoded.
pub fn generate_secure_state() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill(&mut bytes);
    base64_url::encode(&bytes)
}

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("{0} is not configured")]
    ProviderNotConfigured(ProviderKind),

    #[error("{0} cannot be connected here")]
    UnsupportedProvider(ProviderKind),

    #[error("{0} is not connected")]
    NotConnected(ProviderKind),

    #[error("{provider} authorization must be renewed: {reason}")]
    ReauthRequired {
        provider: ProviderKind,
        reason: String,
    },

    #[error("OAuth state is unknown, expired or for another provider")]
    InvalidState,

    #[error("Client {0} not found")]
    ClientNotFound(Uuid),

    /// A connection attempt failed; the code is reported to the dashboard.
    #[error("Connecting {provider} failed: {code}")]
    Callback {
        provider: ProviderKind,
        code: CallbackErrorCode,
    },

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Credential encryption failed: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Database error: {0}")]
    Database(#[from] sea_orm::DbErr),
}

impl CredentialError {
    /// Code reported through the callback redirect for this failure.
    pub fn callback_code(&self) -> CallbackErrorCode {
        match self {
            Self::Callback { code, .. } => *code,
            Self::InvalidState => CallbackErrorCode::InvalidState,
            Self::ProviderNotConfigured(_) | Self::UnsupportedProvider(_) => {
                CallbackErrorCode::ProviderNotConfigured
            }
            _ => CallbackErrorCode::DbConfigFailed,
        }
    }

    fn reauth(provider: ProviderKind, reason: impl fmt::Display) -> Self {
        Self::ReauthRequired {
            provider,
            reason: reason.to_string(),
        }
    }

    fn callback(provider: ProviderKind, code: CallbackErrorCode) -> Self {
        Self::Callback { provider, code }
    }
}

impl From<CredentialError> for ApiError {
    fn from(error: CredentialError) -> Self {
        match error {
            CredentialError::ProviderNotConfigured(kind) => ApiError::new(
                StatusCode::BAD_REQUEST,
                "PROVIDER_NOT_CONFIGURED",
                format!("The {} integration is not configured", kind),
            ),
            CredentialError::UnsupportedProvider(kind) => ApiError::new(
                StatusCode::BAD_REQUEST,
                "VALIDATION_FAILED",
                format!("The {} integration is not available on this route", kind),
            ),
            CredentialError::NotConnected(kind) => ApiError::new(
                StatusCode::NOT_FOUND,
                "NOT_CONNECTED",
                format!("The {} integration is not connected", kind),
            ),
            CredentialError::ReauthRequired { provider, .. } => ApiError::new(
                StatusCode::CONFLICT,
                "REAUTH_REQUIRED",
                format!(
                    "Reconnect required: the stored {} authorization is no longer valid. Please connect it again.",
                    provider
                ),
            ),
            CredentialError::InvalidState => ApiError::new(
                StatusCode::BAD_REQUEST,
                "INVALID_STATE",
                CallbackErrorCode::InvalidState.user_message(),
            ),
            CredentialError::ClientNotFound(id) => {
                crate::error::not_found(format!("Client {} not found", id))
            }
            CredentialError::Callback { code, .. } => {
                let status = match code {
                    CallbackErrorCode::DbConfigFailed => StatusCode::INTERNAL_SERVER_ERROR,
                    CallbackErrorCode::TokenExchangeFailed
                    | CallbackErrorCode::FitbitTokenExchangeFailed
                    | CallbackErrorCode::UserinfoFailed => StatusCode::BAD_GATEWAY,
                    _ => StatusCode::BAD_REQUEST,
                };
                ApiError::new(status, code.as_str().to_uppercase(), code.user_message())
            }
            CredentialError::Provider(err) => {
                error!(error = %err, "Provider configuration error");
                ApiError::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_SERVER_ERROR",
                    "Integration provider is misconfigured",
                )
            }
            CredentialError::Crypto(err) => {
                error!(error = %err, "Credential encryption error");
                ApiError::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_SERVER_ERROR",
                    "An internal error occurred",
                )
            }
            CredentialError::Database(err) => err.into(),
        }
    }
}

/// A usable access token. The token never appears in `Debug` output.
#[derive(Clone)]
pub struct AccessToken {
    pub token: String,
    /// Unix epoch milliseconds
    pub expires_at: Option<i64>,
    /// Whether a refresh was performed to obtain it
    pub refreshed: bool,
    /// Connected email (system integrations) or Fitbit user id
    pub account: String,
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("token", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .field("refreshed", &self.refreshed)
            .field("account", &self.account)
            .finish()
    }
}

/// Outcome of a completed system connection
#[derive(Debug, Clone)]
pub struct ConnectedAccount {
    pub id: Uuid,
    pub provider: ProviderKind,
    pub account: String,
    pub created: bool,
}

/// Non-secret view of a stored system integration
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct IntegrationSummary {
    pub id: Uuid,
    pub provider: String,
    pub connected_email: String,
    pub scopes: Vec<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// Converts unix milliseconds into a timestamp for responses.
pub fn millis_to_datetime(millis: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis)
}

pub struct CredentialService {
    oauth_services: OAuthServiceRepository,
    clients: ClientRepository,
    states: OAuthStateRepository,
    cipher: Arc<CredentialCipher>,
    providers: ProviderSet,
    config: Arc<AppConfig>,
}

impl CredentialService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        cipher: Arc<CredentialCipher>,
        providers: ProviderSet,
        config: Arc<AppConfig>,
    ) -> Self {
        Self {
            oauth_services: OAuthServiceRepository::new(db.clone()),
            clients: ClientRepository::new(db.clone()),
            states: OAuthStateRepository::new(db),
            cipher,
            providers,
            config,
        }
    }

    /// Providers with a client registration in this deployment.
    pub fn configured_providers(&self) -> Vec<ProviderKind> {
        self.providers.configured()
    }

    fn provider(&self, kind: ProviderKind) -> Result<Arc<dyn OAuthProvider>, CredentialError> {
        self.providers
            .get(kind)
            .ok_or(CredentialError::ProviderNotConfigured(kind))
    }

    fn now_millis() -> i64 {
        Utc::now().timestamp_millis()
    }

    async fn begin(
        &self,
        kind: ProviderKind,
        client_id: Option<Uuid>,
    ) -> Result<Url, CredentialError> {
        let provider = self.provider(kind)?;

        if let Err(e) = self.states.cleanup_expired().await {
            warn!(error = %e, "Failed to clean up expired OAuth states");
        }

        let state = generate_secure_state();
        self.states
            .create(
                kind.as_str(),
                &state,
                client_id,
                self.config.oauth_state_ttl_minutes,
            )
            .await?;

        let redirect_uri = self.config.redirect_uri_for(kind.as_str());
        Ok(provider.authorize_url(&state, &redirect_uri)?)
    }

    /// Consume a callback state for `kind`. The state is spent even on mismatch.
    #[instrument(skip_all, fields(provider = %kind))]
    pub async fn consume_state(
        &self,
        kind: ProviderKind,
        state: &str,
    ) -> Result<Option<Uuid>, CredentialError> {
        let record = self
            .states
            .find_and_consume(state)
            .await?
            .ok_or(CredentialError::InvalidState)?;

        if record.provider != kind.as_str() {
            warn!(stored = %record.provider, "OAuth state used with another provider");
            return Err(CredentialError::InvalidState);
        }

        if kind.is_system() != record.client_id.is_none() {
            return Err(CredentialError::InvalidState);
        }

        Ok(record.client_id)
    }

    /// Performs exactly one refresh, recording latency, outcome and failure class.
    async fn refresh_once(
        &self,
        provider: &dyn OAuthProvider,
        refresh_token: &str,
    ) -> Result<TokenGrant, CredentialError> {
        let kind = provider.kind();
        let refresh_start = Instant::now();

        match provider.refresh(refresh_token).await {
            Ok(grant) => {
                let refresh_duration = refresh_start.elapsed();
                histogram!("token_refresh_latency_ms")
                    .record(refresh_duration.as_secs_f64() * 1_000.0);
                counter!("token_refresh_success_total", "provider" => kind.as_str()).increment(1);

                info!(
                    provider = %kind,
                    refresh_duration_ms = refresh_duration.as_millis(),
                    rotated_refresh_token = grant.refresh_token.is_some(),
                    "Refreshed access token"
                );
                Ok(grant)
            }
            Err(e) => {
                let classification = classify_provider_error(&e);
                match classification {
                    RefreshErrorClassification::Permanent => {
                        error!(provider = %kind, error = %e, "Permanent token refresh failure - reconnect required")
                    }
                    RefreshErrorClassification::Transient => {
                        warn!(provider = %kind, error = %e, "Transient token refresh failure")
                    }
                    RefreshErrorClassification::RateLimited => {
                        warn!(provider = %kind, error = %e, "Rate limited during token refresh")
                    }
                }

                counter!(
                    "token_refresh_failure_total",
                    "provider" => kind.as_str(),
                    "classification" => classification.as_str()
                )
                .increment(1);

                Err(CredentialError::reauth(kind, e))
            }
        }
    }

    // System integrations

    /// Start connecting a system integration; returns the provider consent URL.
    #[instrument(skip(self))]
    pub async fn begin_system_connection(&self, kind: ProviderKind) -> Result<Url, CredentialError> {
        if !kind.is_system() {
            return Err(CredentialError::UnsupportedProvider(kind));
        }
        self.begin(kind, None).await
    }

    /// Finish a system connection from a callback code.
    ///
    /// Nothing is persisted unless the provider issued a refresh token.
    #[instrument(skip(self, code))]
    pub async fn complete_system_connection(
        &self,
        kind: ProviderKind,
        code: &str,
    ) -> Result<ConnectedAccount, CredentialError> {
        if !kind.is_system() {
            return Err(CredentialError::UnsupportedProvider(kind));
        }
        let provider = self.provider(kind)?;
        let redirect_uri = self.config.redirect_uri_for(kind.as_str());

        let grant = provider
            .exchange_code(code, &redirect_uri)
            .await
            .map_err(|e| {
                warn!(error = %e, "Authorization code exchange failed");
                CredentialError::callback(kind, CallbackErrorCode::TokenExchangeFailed)
            })?;

        let Some(refresh_token) = grant.refresh_token.as_deref().filter(|t| !t.is_empty()) else {
            warn!("Provider issued no refresh token; nothing stored");
            return Err(CredentialError::callback(
                kind,
                CallbackErrorCode::NoRefreshTokenIssued,
            ));
        };

        let email = provider.account_identity(&grant).await.map_err(|e| {
            warn!(error = %e, "Failed to resolve connected account");
            CredentialError::callback(kind, CallbackErrorCode::UserinfoFailed)
        })?;

        let encrypted_refresh_token = self
            .cipher
            .encrypt(kind.refresh_token_purpose(), refresh_token)
            .map_err(|e| {
                error!(error = %e, "Failed to encrypt refresh token");
                CredentialError::callback(kind, CallbackErrorCode::DbConfigFailed)
            })?;

        let properties = OAuthServiceProperties {
            access_token: Some(grant.access_token.clone()),
            expires_at: grant.expires_at_millis(Self::now_millis()),
            scopes: grant.scopes(),
            connected_email: email.clone(),
            encrypted_refresh_token,
        };

        let (record, created) = self
            .oauth_services
            .upsert(kind.as_str(), &email, &properties)
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to persist integration");
                CredentialError::callback(kind, CallbackErrorCode::DbConfigFailed)
            })?;

        info!(record_id = %record.id, created, "Integration connected");

        Ok(ConnectedAccount {
            id: record.id,
            provider: kind,
            account: email,
            created,
        })
    }

    /// Access token for the most recently updated record of `kind`, refreshing it if needed.
    #[instrument(skip(self))]
    pub async fn authorized_access_token(
        &self,
        kind: ProviderKind,
    ) -> Result<AccessToken, CredentialError> {
        if !kind.is_system() {
            return Err(CredentialError::UnsupportedProvider(kind));
        }

        let record = self
            .oauth_services
            .latest_by_name(kind.as_str())
            .await?
            .ok_or(CredentialError::NotConnected(kind))?;

        let mut properties = record
            .typed_properties()
            .map_err(|e| CredentialError::reauth(kind, format!("unreadable record: {}", e)))?;

        let now = Self::now_millis();
        if let Some(token) = properties.access_token.as_deref()
            && is_token_fresh(properties.expires_at, now, self.config.token_refresh_leeway_seconds)
        {
            return Ok(AccessToken {
                token: token.to_string(),
                expires_at: properties.expires_at,
                refreshed: false,
                account: properties.connected_email,
            });
        }

        let refresh_token = self
            .cipher
            .decrypt(kind.refresh_token_purpose(), &properties.encrypted_refresh_token)
            .map_err(|e| {
                warn!(record_id = %record.id, error = %e, "Stored refresh token cannot be decrypted");
                CredentialError::reauth(kind, e)
            })?;

        let provider = self.provider(kind)?;
        let grant = self.refresh_once(provider.as_ref(), &refresh_token).await?;

        let now = Self::now_millis();
        properties.access_token = Some(grant.access_token.clone());
        properties.expires_at = grant.expires_at_millis(now);
        if grant.scope.is_some() {
            properties.scopes = grant.scopes();
        }
        if let Some(rotated) = grant.refresh_token.as_deref().filter(|t| !t.is_empty()) {
            properties.encrypted_refresh_token =
                self.cipher.encrypt(kind.refresh_token_purpose(), rotated)?;
        }

        let updated = self.oauth_services.update_properties(record, &properties).await?;
        info!(record_id = %updated.id, "Persisted refreshed access token");

        Ok(AccessToken {
            token: grant.access_token,
            expires_at: properties.expires_at,
            refreshed: true,
            account: properties.connected_email,
        })
    }

    pub async fn list_connections(&self) -> Result<Vec<IntegrationSummary>, CredentialError> {
        let records = self.oauth_services.list().await?;

        Ok(records
            .into_iter()
            .filter(|r| ProviderKind::parse(&r.name).is_some_and(ProviderKind::is_system))
            .map(|record| {
                let properties = record.typed_properties().ok();
                IntegrationSummary {
                    id: record.id,
                    connected_email: properties
                        .as_ref()
                        .map(|p| p.connected_email.clone())
                        .unwrap_or_else(|| record.account_key.clone()),
                    scopes: properties
                        .as_ref()
                        .map(|p| p.scopes.clone())
                        .unwrap_or_default(),
                    expires_at: properties
                        .and_then(|p| p.expires_at)
                        .and_then(millis_to_datetime),
                    provider: record.name,
                    updated_at: record.updated_at,
                }
            })
            .collect())
    }

    #[instrument(skip(self))]
    pub async fn disconnect(&self, kind: ProviderKind, id: Uuid) -> Result<(), CredentialError> {
        if !self.oauth_services.delete(kind.as_str(), id).await? {
            return Err(CredentialError::NotConnected(kind));
        }
        info!(record_id = %id, "Integration disconnected");
        Ok(())
    }

    // Per-client Fitbit

    /// Start connecting Fitbit for `client_id`; the state is bound to the client.
    #[instrument(skip(self))]
    pub async fn begin_client_connection(&self, client_id: Uuid) -> Result<Url, CredentialError> {
        self.clients
            .find_by_id(client_id)
            .await?
            .ok_or(CredentialError::ClientNotFound(client_id))?;
        self.begin(ProviderKind::Fitbit, Some(client_id)).await
    }

    /// Finish a Fitbit connection; returns the Fitbit user id.
    ///
    /// Writes or replaces the client's `fitbit` settings entry, and nothing at all unless a
    /// refresh token was issued.
    #[instrument(skip(self, code))]
    pub async fn complete_client_connection(
        &self,
        client_id: Uuid,
        code: &str,
    ) -> Result<String, CredentialError> {
        let kind = ProviderKind::Fitbit;
        let provider = self.provider(kind)?;
        let redirect_uri = self.config.redirect_uri_for(kind.as_str());

        let grant = provider
            .exchange_code(code, &redirect_uri)
            .await
            .map_err(|e| {
                warn!(error = %e, "Fitbit code exchange failed");
                CredentialError::callback(kind, CallbackErrorCode::FitbitTokenExchangeFailed)
            })?;

        let Some(refresh_token) = grant.refresh_token.as_deref().filter(|t| !t.is_empty()) else {
            warn!("Fitbit issued no refresh token; nothing stored");
            return Err(CredentialError::callback(
                kind,
                CallbackErrorCode::NoRefreshTokenIssued,
            ));
        };

        let user_id = provider.account_identity(&grant).await.map_err(|e| {
            warn!(error = %e, "Fitbit token response has no usable user id");
            CredentialError::callback(kind, CallbackErrorCode::UserinfoFailed)
        })?;

        let db_failed = |e: &dyn fmt::Display| {
            error!(error = %e, "Failed to persist Fitbit connection");
            CredentialError::callback(kind, CallbackErrorCode::DbConfigFailed)
        };

        let client = self
            .clients
            .find_by_id(client_id)
            .await
            .map_err(|e| db_failed(&e))?
            .ok_or_else(|| db_failed(&format!("client {} not found", client_id)))?;

        let mut entries = client
            .integration_settings()
            .map_err(|e| db_failed(&e))?;

        let setting = self
            .fitbit_setting(
                &user_id,
                &grant.access_token,
                refresh_token,
                grant.expires_at_millis(Self::now_millis()),
                &grant.scopes(),
            )
            .map_err(|e| db_failed(&e))?;

        settings::upsert_setting(&mut entries, setting);
        self.clients
            .save_settings(client, &entries)
            .await
            .map_err(|e| db_failed(&e))?;

        info!(%client_id, "Fitbit connected");
        Ok(user_id)
    }

    fn fitbit_setting(
        &self,
        user_id: &str,
        access_token: &str,
        refresh_token: &str,
        expires_at: Option<i64>,
        scopes: &[String],
    ) -> Result<IntegrationSetting, CryptoError> {
        let access = self
            .cipher
            .encrypt(CredentialPurpose::FitbitAccessToken, access_token)?;
        let refresh = self
            .cipher
            .encrypt(CredentialPurpose::FitbitRefreshToken, refresh_token)?;

        Ok(
            IntegrationSetting::new(FITBIT_SETTING_ID, INTEGRATION_SETTING_TYPE)
                .with(PROP_USER_ID, user_id, false, false)
                .with(PROP_ACCESS_TOKEN, access, false, true)
                .with(PROP_REFRESH_TOKEN, refresh, false, true)
                .with(
                    PROP_EXPIRES_AT,
                    expires_at.map(|v| v.to_string()).unwrap_or_default(),
                    false,
                    false,
                )
                .with(PROP_SCOPES, scopes.join(" "), false, false),
        )
    }

    /// Fitbit access token for `client_id`, refreshing and persisting it if needed.
    #[instrument(skip(self))]
    pub async fn client_access_token(&self, client_id: Uuid) -> Result<AccessToken, CredentialError> {
        let kind = ProviderKind::Fitbit;
        let client = self
            .clients
            .find_by_id(client_id)
            .await?
            .ok_or(CredentialError::ClientNotFound(client_id))?;

        let mut entries = client
            .integration_settings()
            .map_err(|e| CredentialError::reauth(kind, format!("unreadable settings: {}", e)))?;

        let setting = settings::find_setting(&entries, FITBIT_SETTING_ID)
            .ok_or(CredentialError::NotConnected(kind))?
            .clone();

        let user_id = setting.value(PROP_USER_ID).unwrap_or_default().to_string();
        let expires_at = setting
            .value(PROP_EXPIRES_AT)
            .and_then(|v| v.parse::<i64>().ok());

        if is_token_fresh(expires_at, Self::now_millis(), self.config.token_refresh_leeway_seconds)
        {
            let token = self.decrypt_setting(&setting, PROP_ACCESS_TOKEN, CredentialPurpose::FitbitAccessToken)?;
            return Ok(AccessToken {
                token,
                expires_at,
                refreshed: false,
                account: user_id,
            });
        }

        let refresh_token =
            self.decrypt_setting(&setting, PROP_REFRESH_TOKEN, CredentialPurpose::FitbitRefreshToken)?;

        let provider = self.provider(kind)?;
        let grant = self.refresh_once(provider.as_ref(), &refresh_token).await?;

        // Fitbit refresh tokens are single use, so a rotated one must replace the old
        let next_refresh = grant
            .refresh_token
            .as_deref()
            .filter(|t| !t.is_empty())
            .unwrap_or(&refresh_token);
        let scopes = if grant.scope.is_some() {
            grant.scopes()
        } else {
            setting
                .value(PROP_SCOPES)
                .map(|s| s.split_whitespace().map(str::to_string).collect())
                .unwrap_or_default()
        };
        let new_expires_at = grant.expires_at_millis(Self::now_millis());

        let updated = self.fitbit_setting(
            &user_id,
            &grant.access_token,
            next_refresh,
            new_expires_at,
            &scopes,
        )?;
        settings::upsert_setting(&mut entries, updated);
        self.clients.save_settings(client, &entries).await?;
        info!(%client_id, "Persisted refreshed Fitbit token");

        Ok(AccessToken {
            token: grant.access_token,
            expires_at: new_expires_at,
            refreshed: true,
            account: user_id,
        })
    }

    fn decrypt_setting(
        &self,
        setting: &IntegrationSetting,
        name: &str,
        purpose: CredentialPurpose,
    ) -> Result<String, CredentialError> {
        let kind = ProviderKind::Fitbit;
        let stored = setting
            .value(name)
            .ok_or_else(|| CredentialError::reauth(kind, format!("{} missing", name)))?;
        self.cipher.decrypt(purpose, stored).map_err(|e| {
            warn!(property = name, error = %e, "Stored Fitbit credential cannot be decrypted");
            CredentialError::reauth(kind, e)
        })
    }

    /// Remove the client's Fitbit entry.
    #[instrument(skip(self))]
    pub async fn disconnect_client(&self, client_id: Uuid) -> Result<(), CredentialError> {
        let client = self
            .clients
            .find_by_id(client_id)
            .await?
            .ok_or(CredentialError::ClientNotFound(client_id))?;

        let mut entries = client
            .integration_settings()
            .map_err(|e| CredentialError::reauth(ProviderKind::Fitbit, e))?;

        if !settings::remove_setting(&mut entries, FITBIT_SETTING_ID) {
            return Err(CredentialError::NotConnected(ProviderKind::Fitbit));
        }

        self.clients.save_settings(client, &entries).await?;
        info!(%client_id, "Fitbit disconnected");
        Ok(())
    }
}

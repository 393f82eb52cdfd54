//! # OAuth Providers
//!
//! Clients for the third-party authorization servers the service connects to. Each provider
//! builds its authorize URL, exchanges codes, refreshes tokens and resolves the external
//! account identity a credential record is keyed by.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;
use utoipa::ToSchema;

use crate::config::AppConfig;
use crate::crypto::CredentialPurpose;

pub mod fitbit;
pub mod google;

pub use fitbit::FitbitProvider;
pub use google::GoogleProvider;

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_RETRY_AFTER_SECS: u64 = 60;

/// Integrations the service knows how to connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Gmail,
    GoogleChat,
    Fitbit,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 3] = [Self::Gmail, Self::GoogleChat, Self::Fitbit];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Gmail => "gmail",
            Self::GoogleChat => "google_chat",
            Self::Fitbit => "fitbit",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == value)
    }

    /// System integrations are stored in `oauth_services`; the rest live in client settings.
    pub fn is_system(self) -> bool {
        matches!(self, Self::Gmail | Self::GoogleChat)
    }

    /// AAD label under which this provider's refresh token is encrypted.
    pub fn refresh_token_purpose(self) -> CredentialPurpose {
        match self {
            Self::Gmail => CredentialPurpose::GmailRefreshToken,
            Self::GoogleChat => CredentialPurpose::GoogleChatRefreshToken,
            Self::Fitbit => CredentialPurpose::FitbitRefreshToken,
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Token endpoint response, shared by the authorization-code and refresh grants.
#[derive(Clone, Deserialize)]
pub struct TokenGrant {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Lifetime in seconds
    #[serde(default)]
    pub expires_in: Option<i64>,
    /// Space-separated granted scopes
    #[serde(default)]
    pub scope: Option<String>,
    /// Fitbit returns the account's user id alongside the tokens
    #[serde(default)]
    pub user_id: Option<String>,
}

impl TokenGrant {
    /// Absolute expiry in unix milliseconds, measured from `now_millis`.
    pub fn expires_at_millis(&self, now_millis: i64) -> Option<i64> {
        self.expires_in
            .map(|secs| now_millis.saturating_add(secs.saturating_mul(1000)))
    }

    pub fn scopes(&self) -> Vec<String> {
        self.scope
            .as_deref()
            .map(|s| s.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default()
    }
}

impl fmt::Debug for TokenGrant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenGrant")
            .field("access_token", &"[REDACTED]")
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("expires_in", &self.expires_in)
            .field("scope", &self.scope)
            .field("user_id", &self.user_id)
            .finish()
    }
}

/// Provider call errors
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Rate limit exceeded: retry after {retry_after}s")]
    RateLimited { retry_after: u64 },

    #[error("Token exchange failed: {0}")]
    TokenExchange(String),

    #[error("Token refresh failed: {0}")]
    TokenRefresh(String),

    #[error("Userinfo error: {0}")]
    Userinfo(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

#[async_trait]
pub trait OAuthProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Consent page URL carrying `state` and the callback `redirect_uri`.
    fn authorize_url(&self, state: &str, redirect_uri: &str) -> Result<Url, ProviderError>;

    async fn exchange_code(&self, code: &str, redirect_uri: &str)
    -> Result<TokenGrant, ProviderError>;

    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, ProviderError>;

    /// External account identity used as the credential record key.
    async fn account_identity(&self, grant: &TokenGrant) -> Result<String, ProviderError>;
}

/// The providers that have a client registration in this deployment.
#[derive(Clone, Default)]
pub struct ProviderSet {
    providers: HashMap<ProviderKind, Arc<dyn OAuthProvider>>,
}

impl fmt::Debug for ProviderSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderSet")
            .field("configured", &self.configured())
            .finish()
    }
}

impl ProviderSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, provider: Arc<dyn OAuthProvider>) -> Self {
        self.providers.insert(provider.kind(), provider);
        self
    }

    /// Builds every provider whose client id is configured.
    pub fn from_config(config: &AppConfig) -> Result<Self, ProviderError> {
        let mut set = Self::new();

        let google = [
            (ProviderKind::Gmail, &config.gmail, &config.gmail_scopes),
            (
                ProviderKind::GoogleChat,
                &config.google_chat,
                &config.google_chat_scopes,
            ),
        ];
        for (kind, credentials, scopes) in google {
            if let Some(client_id) = credentials.client_id.as_deref().filter(|v| !v.is_empty()) {
                let provider = GoogleProvider::new(
                    kind,
                    client_id.to_string(),
                    credentials.client_secret.clone().unwrap_or_default(),
                    scopes.clone(),
                )?;
                set = set.with(Arc::new(provider));
            }
        }

        if let Some(client_id) = config.fitbit.client_id.as_deref().filter(|v| !v.is_empty()) {
            let provider = FitbitProvider::new(
                client_id.to_string(),
                config.fitbit.client_secret.clone().unwrap_or_default(),
                config.fitbit_scopes.clone(),
            )?;
            set = set.with(Arc::new(provider));
        }

        Ok(set)
    }

    pub fn get(&self, kind: ProviderKind) -> Option<Arc<dyn OAuthProvider>> {
        self.providers.get(&kind).cloned()
    }

    pub fn configured(&self) -> Vec<ProviderKind> {
        ProviderKind::ALL
            .into_iter()
            .filter(|kind| self.providers.contains_key(kind))
            .collect()
    }
}

pub(crate) fn build_http_client() -> Result<Client, ProviderError> {
    Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .map_err(|e| ProviderError::Configuration(format!("Failed to create HTTP client: {}", e)))
}

fn retry_after(response: &Response) -> Option<u64> {
    response
        .headers()
        .get("Retry-After")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse().ok())
}

/// Maps a token endpoint response to a grant. Throttling (429, or a 403 whose body names a
/// quota) becomes [`ProviderError::RateLimited`]; other failures go through `on_failure`.
pub(crate) async fn read_token_response(
    response: Response,
    on_failure: fn(String) -> ProviderError,
) -> Result<TokenGrant, ProviderError> {
    let status = response.status();

    if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(ProviderError::RateLimited {
            retry_after: retry_after(&response).unwrap_or(DEFAULT_RETRY_AFTER_SECS),
        });
    }

    if !status.is_success() {
        let retry_after_header = retry_after(&response);
        let body = response.text().await.unwrap_or_default();

        if status == StatusCode::FORBIDDEN && is_quota_error(&body) {
            return Err(ProviderError::RateLimited {
                retry_after: retry_after_header.unwrap_or(DEFAULT_RETRY_AFTER_SECS),
            });
        }

        return Err(on_failure(format!("status {}: {}", status, body)));
    }

    response
        .json::<TokenGrant>()
        .await
        .map_err(|e| ProviderError::InvalidResponse(format!("Failed to parse token response: {}", e)))
}

fn is_quota_error(body: &str) -> bool {
    let body = body.to_lowercase();
    [
        "userratelimitexceeded",
        "ratelimitexceeded",
        "quotaexceeded",
        "daily limit",
    ]
    .iter()
    .any(|pattern| body.contains(pattern))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderCredentials;

    #[test]
    fn kind_roundtrip() {
        for kind in ProviderKind::ALL {
            assert_eq!(ProviderKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(ProviderKind::parse("strava"), None);
        assert!(ProviderKind::GoogleChat.is_system());
        assert!(!ProviderKind::Fitbit.is_system());
    }

    #[test]
    fn grant_expiry_and_scopes() {
        let grant: TokenGrant = serde_json::from_value(serde_json::json!({
            "access_token": "at",
            "expires_in": 3600,
            "scope": "a b"
        }))
        .unwrap();
        assert_eq!(grant.expires_at_millis(1_000), Some(3_601_000));
        assert_eq!(grant.scopes(), vec!["a", "b"]);
        assert!(grant.refresh_token.is_none());
    }

    #[test]
    fn grant_debug_hides_tokens() {
        let grant: TokenGrant = serde_json::from_value(serde_json::json!({
            "access_token": "secret-access",
            "refresh_token": "secret-refresh"
        }))
        .unwrap();
        let rendered = format!("{:?}", grant);
        assert!(!rendered.contains("secret-access"));
        assert!(!rendered.contains("secret-refresh"));
    }

    #[test]
    fn only_providers_with_client_ids_are_built() {
        let config = AppConfig {
            gmail: ProviderCredentials {
                client_id: Some("gmail-id".to_string()),
                client_secret: Some("gmail-secret".to_string()),
                redirect_uri: None,
            },
            fitbit: ProviderCredentials {
                client_id: Some(String::new()),
                ..Default::default()
            },
            ..Default::default()
        };

        let set = ProviderSet::from_config(&config).unwrap();
        assert_eq!(set.configured(), vec![ProviderKind::Gmail]);
        assert!(set.get(ProviderKind::Fitbit).is_none());
    }

    #[test]
    fn quota_bodies_are_detected() {
        assert!(is_quota_error(r#"{"error":{"status":"userRateLimitExceeded"}}"#));
        assert!(!is_quota_error(r#"{"error":"access_denied"}"#));
    }
}

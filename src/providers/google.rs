//! Google OAuth client, shared by the Gmail and Google Chat integrations.

use std::collections::HashMap;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use url::Url;

use super::{
    OAuthProvider, ProviderError, ProviderKind, TokenGrant, build_http_client, read_token_response,
};

const GOOGLE_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const GOOGLE_USERINFO_URL: &str = "https://www.googleapis.com/oauth2/v2/userinfo";

/// Google endpoint set (overridable for tests)
#[derive(Debug, Clone)]
pub struct GoogleEndpoints {
    pub auth_url: String,
    pub token_url: String,
    pub userinfo_url: String,
}

impl Default for GoogleEndpoints {
    fn default() -> Self {
        Self {
            auth_url: GOOGLE_AUTH_URL.to_string(),
            token_url: GOOGLE_TOKEN_URL.to_string(),
            userinfo_url: GOOGLE_USERINFO_URL.to_string(),
        }
    }
}

impl GoogleEndpoints {
    /// All endpoints rooted at `base`, e.g. a mock server URI.
    pub fn with_base(base: &str) -> Self {
        let base = base.trim_end_matches('/');
        Self {
            auth_url: format!("{}/o/oauth2/v2/auth", base),
            token_url: format!("{}/token", base),
            userinfo_url: format!("{}/oauth2/v2/userinfo", base),
        }
    }
}

#[derive(Debug, Deserialize)]
struct GoogleUserinfo {
    email: String,
}

pub struct GoogleProvider {
    kind: ProviderKind,
    client_id: String,
    client_secret: String,
    scopes: Vec<String>,
    endpoints: GoogleEndpoints,
    http_client: Client,
}

impl GoogleProvider {
    pub fn new(
        kind: ProviderKind,
        client_id: String,
        client_secret: String,
        scopes: Vec<String>,
    ) -> Result<Self, ProviderError> {
        if !kind.is_system() {
            return Err(ProviderError::Configuration(format!(
                "{} is not a Google integration",
                kind
            )));
        }
        Ok(Self {
            kind,
            client_id,
            client_secret,
            scopes,
            endpoints: GoogleEndpoints::default(),
            http_client: build_http_client()?,
        })
    }

    pub fn with_endpoints(mut self, endpoints: GoogleEndpoints) -> Self {
        self.endpoints = endpoints;
        self
    }
}

#[async_trait]
impl OAuthProvider for GoogleProvider {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    fn authorize_url(&self, state: &str, redirect_uri: &str) -> Result<Url, ProviderError> {
        let mut url = Url::parse(&self.endpoints.auth_url)
            .map_err(|e| ProviderError::Configuration(format!("Invalid auth URL: {}", e)))?;

        url.query_pairs_mut()
            .append_pair("client_id", &self.client_id)
            .append_pair("redirect_uri", redirect_uri)
            .append_pair("response_type", "code")
            .append_pair("scope", &self.scopes.join(" "))
            // Without both of these Google omits the refresh token on repeat consent
            .append_pair("access_type", "offline")
            .append_pair("prompt", "consent")
            .append_pair("include_granted_scopes", "true")
            .append_pair("state", state);

        Ok(url)
    }

    async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
    ) -> Result<TokenGrant, ProviderError> {
        let mut params = HashMap::new();
        params.insert("client_id", self.client_id.as_str());
        params.insert("client_secret", self.client_secret.as_str());
        params.insert("code", code);
        params.insert("grant_type", "authorization_code");
        params.insert("redirect_uri", redirect_uri);

        let response = self
            .http_client
            .post(&self.endpoints.token_url)
            .header("Accept", "application/json")
            .form(&params)
            .send()
            .await
            .map_err(|e| ProviderError::Network(format!("Token request failed: {}", e)))?;

        read_token_response(response, ProviderError::TokenExchange).await
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, ProviderError> {
        let mut params = HashMap::new();
        params.insert("client_id", self.client_id.as_str());
        params.insert("client_secret", self.client_secret.as_str());
        params.insert("refresh_token", refresh_token);
        params.insert("grant_type", "refresh_token");

        let response = self
            .http_client
            .post(&self.endpoints.token_url)
            .header("Accept", "application/json")
            .form(&params)
            .send()
            .await
            .map_err(|e| ProviderError::Network(format!("Token refresh request failed: {}", e)))?;

        read_token_response(response, ProviderError::TokenRefresh).await
    }

    async fn account_identity(&self, grant: &TokenGrant) -> Result<String, ProviderError> {
        let response = self
            .http_client
            .get(&self.endpoints.userinfo_url)
            .bearer_auth(&grant.access_token)
            .send()
            .await
            .map_err(|e| ProviderError::Network(format!("Failed to fetch userinfo: {}", e)))?;

        if !response.status().is_success() {
            return Err(ProviderError::Userinfo(format!(
                "Userinfo request failed with status {}: {}",
                response.status(),
                response.text().await.unwrap_or_default()
            )));
        }

        let userinfo: GoogleUserinfo = response.json().await.map_err(|e| {
            ProviderError::InvalidResponse(format!("Failed to parse userinfo response: {}", e))
        })?;

        Ok(userinfo.email)
    }
}

//! Fitbit OAuth client.
//!
//! The token endpoint authenticates the client with HTTP Basic credentials, and the token
//! response carries the Fitbit `user_id` used as the account identity.

use std::collections::HashMap;

use async_trait::async_trait;
use reqwest::Client;
use url::Url;

use super::{
    OAuthProvider, ProviderError, ProviderKind, TokenGrant, build_http_client, read_token_response,
};

const FITBIT_AUTH_URL: &str = "https://www.fitbit.com/oauth2/authorize";
const FITBIT_TOKEN_URL: &str = "https://api.fitbit.com/oauth2/token";

pub struct FitbitProvider {
    client_id: String,
    client_secret: String,
    scopes: Vec<String>,
    auth_url: String,
    token_url: String,
    http_client: Client,
}

impl FitbitProvider {
    pub fn new(
        client_id: String,
        client_secret: String,
        scopes: Vec<String>,
    ) -> Result<Self, ProviderError> {
        Ok(Self {
            client_id,
            client_secret,
            scopes,
            auth_url: FITBIT_AUTH_URL.to_string(),
            token_url: FITBIT_TOKEN_URL.to_string(),
            http_client: build_http_client()?,
        })
    }

    /// Point both endpoints at `base` (tests)
    pub fn with_base_url(mut self, base: &str) -> Self {
        let base = base.trim_end_matches('/');
        self.auth_url = format!("{}/oauth2/authorize", base);
        self.token_url = format!("{}/oauth2/token", base);
        self
    }

    async fn token_request(
        &self,
        params: &HashMap<&str, &str>,
        on_failure: fn(String) -> ProviderError,
    ) -> Result<TokenGrant, ProviderError> {
        let response = self
            .http_client
            .post(&self.token_url)
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .header("Accept", "application/json")
            .form(params)
            .send()
            .await
            .map_err(|e| ProviderError::Network(format!("Fitbit token request failed: {}", e)))?;

        read_token_response(response, on_failure).await
    }
}

#[async_trait]
impl OAuthProvider for FitbitProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Fitbit
    }

    fn authorize_url(&self, state: &str, redirect_uri: &str) -> Result<Url, ProviderError> {
        let mut url = Url::parse(&self.auth_url)
            .map_err(|e| ProviderError::Configuration(format!("Invalid auth URL: {}", e)))?;

        url.query_pairs_mut()
            .append_pair("client_id", &self.client_id)
            .append_pair("response_type", "code")
            .append_pair("scope", &self.scopes.join(" "))
            .append_pair("redirect_uri", redirect_uri)
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
        params.insert("grant_type", "authorization_code");
        params.insert("code", code);
        params.insert("redirect_uri", redirect_uri);

        self.token_request(&params, ProviderError::TokenExchange).await
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, ProviderError> {
        let mut params = HashMap::new();
        params.insert("grant_type", "refresh_token");
        params.insert("refresh_token", refresh_token);

        self.token_request(&params, ProviderError::TokenRefresh).await
    }

    async fn account_identity(&self, grant: &TokenGrant) -> Result<String, ProviderError> {
        grant
            .user_id
            .clone()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| {
                ProviderError::InvalidResponse("Fitbit token response has no user_id".to_string())
            })
    }
}

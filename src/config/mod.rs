//! Configuration loading for the wellness coach service.
//!
//! Loads layered `.env` files and environment variables prefixed with
//! `WELLNESS_`, producing a typed [`AppConfig`]. The credential encryption
//! secret additionally falls back to the unprefixed `NEXTAUTH_SECRET`.

use std::{collections::BTreeMap, env, net::SocketAddr, path::PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

const ENV_PREFIX: &str = "WELLNESS_";
const NEXTAUTH_SECRET_VAR: &str = "NEXTAUTH_SECRET";
const MIN_APP_SECRET_LEN: usize = 32;
const REDACTED: &str = "[REDACTED]";

/// OAuth client registration for a single provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct ProviderCredentials {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect_uri: Option<String>,
}

impl ProviderCredentials {
    /// A provider counts as configured once both halves of the client registration exist.
    pub fn is_configured(&self) -> bool {
        self.client_id.as_deref().is_some_and(|v| !v.is_empty())
            && self.client_secret.as_deref().is_some_and(|v| !v.is_empty())
    }

    fn redact(&mut self) {
        if self.client_secret.is_some() {
            self.client_secret = Some(REDACTED.to_string());
        }
    }
}

/// Application configuration derived from `WELLNESS_*` environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct AppConfig {
    #[serde(default = "default_profile")]
    pub profile: String,
    #[serde(default = "default_api_bind_addr")]
    pub api_bind_addr: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_format")]
    pub log_format: String,
    #[serde(default = "default_database_url")]
    pub database_url: String,
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,
    #[serde(default = "default_db_acquire_timeout_ms")]
    pub db_acquire_timeout_ms: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub operator_tokens: Vec<String>,
    /// Shared secret used as scrypt input for credential encryption.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_secret: Option<String>,
    /// Base URL of the dashboard; callback redirects land here.
    #[serde(default = "default_app_base_url")]
    pub app_base_url: String,
    /// Base URL under which this service is reachable by OAuth providers.
    #[serde(default = "default_public_base_url")]
    pub public_base_url: String,
    #[serde(default)]
    pub gmail: ProviderCredentials,
    #[serde(default = "default_gmail_scopes")]
    pub gmail_scopes: Vec<String>,
    #[serde(default)]
    pub google_chat: ProviderCredentials,
    #[serde(default = "default_google_chat_scopes")]
    pub google_chat_scopes: Vec<String>,
    #[serde(default)]
    pub fitbit: ProviderCredentials,
    #[serde(default = "default_fitbit_scopes")]
    pub fitbit_scopes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub messenger_verify_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub messenger_app_secret: Option<String>,
    /// Access tokens expiring within this many seconds are treated as expired.
    #[serde(default = "default_token_refresh_leeway_seconds")]
    pub token_refresh_leeway_seconds: u64,
    #[serde(default = "default_oauth_state_ttl_minutes")]
    pub oauth_state_ttl_minutes: i64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            profile: default_profile(),
            api_bind_addr: default_api_bind_addr(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            database_url: default_database_url(),
            db_max_connections: default_db_max_connections(),
            db_acquire_timeout_ms: default_db_acquire_timeout_ms(),
            operator_tokens: Vec::new(),
            app_secret: None,
            app_base_url: default_app_base_url(),
            public_base_url: default_public_base_url(),
            gmail: ProviderCredentials::default(),
            gmail_scopes: default_gmail_scopes(),
            google_chat: ProviderCredentials::default(),
            google_chat_scopes: default_google_chat_scopes(),
            fitbit: ProviderCredentials::default(),
            fitbit_scopes: default_fitbit_scopes(),
            messenger_verify_token: None,
            messenger_app_secret: None,
            token_refresh_leeway_seconds: default_token_refresh_leeway_seconds(),
            oauth_state_ttl_minutes: default_oauth_state_ttl_minutes(),
        }
    }
}

impl AppConfig {
    /// Returns the configured bind address as a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        self.api_bind_addr.parse()
    }

    /// Callback URI registered with a provider. Falls back to this service's own callback route.
    pub fn redirect_uri_for(&self, provider: &str) -> String {
        let configured = match provider {
            "gmail" => self.gmail.redirect_uri.as_ref(),
            "google_chat" => self.google_chat.redirect_uri.as_ref(),
            "fitbit" => self.fitbit.redirect_uri.as_ref(),
            _ => None,
        };

        configured.cloned().unwrap_or_else(|| {
            format!(
                "{}/api/integrations/{}/callback",
                self.public_base_url.trim_end_matches('/'),
                provider
            )
        })
    }

    /// Returns a redacted JSON representation (secrets are redacted).
    pub fn redacted_json(&self) -> serde_json::Result<String> {
        let mut config = self.clone();
        if !config.operator_tokens.is_empty() {
            config.operator_tokens = vec![REDACTED.to_string()];
        }
        if config.app_secret.is_some() {
            config.app_secret = Some(REDACTED.to_string());
        }
        config.gmail.redact();
        config.google_chat.redact();
        config.fitbit.redact();
        if config.messenger_verify_token.is_some() {
            config.messenger_verify_token = Some(REDACTED.to_string());
        }
        if config.messenger_app_secret.is_some() {
            config.messenger_app_secret = Some(REDACTED.to_string());
        }
        serde_json::to_string_pretty(&config)
    }

    /// Validates the configuration, returning an error if required settings are missing.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.app_secret.as_deref() {
            None | Some("") => return Err(ConfigError::MissingAppSecret),
            Some(secret) if secret.len() < MIN_APP_SECRET_LEN => {
                return Err(ConfigError::WeakAppSecret {
                    length: secret.len(),
                    minimum: MIN_APP_SECRET_LEN,
                });
            }
            Some(_) => {}
        }

        if self.operator_tokens.is_empty() {
            return Err(ConfigError::MissingOperatorTokens);
        }

        if self.token_refresh_leeway_seconds > 3600 {
            return Err(ConfigError::InvalidRefreshLeeway {
                value: self.token_refresh_leeway_seconds,
            });
        }

        if !(1..=60).contains(&self.oauth_state_ttl_minutes) {
            return Err(ConfigError::InvalidStateTtl {
                value: self.oauth_state_ttl_minutes,
            });
        }

        // Half-configured providers are tolerated locally so developers can run without secrets.
        if !matches!(self.profile.as_str(), "local" | "test") {
            for (name, creds) in [
                ("gmail", &self.gmail),
                ("google_chat", &self.google_chat),
                ("fitbit", &self.fitbit),
            ] {
                if creds.client_id.is_some() && creds.client_secret.is_none() {
                    return Err(ConfigError::MissingClientSecret {
                        provider: name.to_string(),
                    });
                }
            }
        }

        Ok(())
    }
}

fn default_profile() -> String {
    "local".to_string()
}

fn default_api_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_database_url() -> String {
    "sqlite::memory:".to_string()
}

fn default_db_max_connections() -> u32 {
    10
}

fn default_db_acquire_timeout_ms() -> u64 {
    5000
}

fn default_app_base_url() -> String {
    "http://localhost:3000".to_string()
}

fn default_public_base_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_gmail_scopes() -> Vec<String> {
    vec![
        "https://www.googleapis.com/auth/gmail.send".to_string(),
        "https://www.googleapis.com/auth/userinfo.email".to_string(),
    ]
}

fn default_google_chat_scopes() -> Vec<String> {
    vec![
        "https://www.googleapis.com/auth/chat.messages".to_string(),
        "https://www.googleapis.com/auth/userinfo.email".to_string(),
    ]
}

fn default_fitbit_scopes() -> Vec<String> {
    ["activity", "heartrate", "sleep", "profile", "weight"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_token_refresh_leeway_seconds() -> u64 {
    60
}

fn default_oauth_state_ttl_minutes() -> i64 {
    15
}

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load environment file {path}: {source}")]
    EnvFile {
        path: PathBuf,
        source: dotenvy::Error,
    },
    #[error("invalid api bind address '{value}': {source}")]
    InvalidBindAddr {
        value: String,
        source: std::net::AddrParseError,
    },
    #[error("no operator tokens configured; set WELLNESS_OPERATOR_TOKEN or WELLNESS_OPERATOR_TOKENS")]
    MissingOperatorTokens,
    #[error("app secret is missing; set WELLNESS_APP_SECRET or NEXTAUTH_SECRET")]
    MissingAppSecret,
    #[error("app secret must be at least {minimum} characters, got {length}")]
    WeakAppSecret { length: usize, minimum: usize },
    #[error("client secret for provider {provider} is missing")]
    MissingClientSecret { provider: String },
    #[error("token refresh leeway must not exceed 3600 seconds, got {value}")]
    InvalidRefreshLeeway { value: u64 },
    #[error("oauth state ttl must be between 1 and 60 minutes, got {value}")]
    InvalidStateTtl { value: i64 },
}

/// Loads configuration using layered `.env` files and `WELLNESS_*` env vars.
pub struct ConfigLoader {
    base_dir: PathBuf,
}

impl ConfigLoader {
    /// Creates a new loader rooted at the current working directory.
    pub fn new() -> Self {
        Self {
            base_dir: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }

    /// Creates a loader rooted at the provided directory (useful for tests).
    pub fn with_base_dir(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    /// Loads and validates the configuration.
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let (mut layered, profile_hint, nextauth_secret) = self.collect_layered_env()?;

        // Overlay process environment last so it wins.
        for (key, value) in env::vars() {
            if let Some(stripped) = key.strip_prefix(ENV_PREFIX) {
                layered.insert(stripped.to_string(), value);
            }
        }
        let nextauth_secret = env::var(NEXTAUTH_SECRET_VAR).ok().or(nextauth_secret);

        let profile = take_non_empty(&mut layered, "PROFILE").unwrap_or(profile_hint);
        let api_bind_addr =
            take_non_empty(&mut layered, "API_BIND_ADDR").unwrap_or_else(default_api_bind_addr);
        let log_level = take_non_empty(&mut layered, "LOG_LEVEL").unwrap_or_else(default_log_level);
        let log_format =
            take_non_empty(&mut layered, "LOG_FORMAT").unwrap_or_else(default_log_format);
        let database_url =
            take_non_empty(&mut layered, "DATABASE_URL").unwrap_or_else(default_database_url);
        let db_max_connections = layered
            .remove("DB_MAX_CONNECTIONS")
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(default_db_max_connections);
        let db_acquire_timeout_ms = layered
            .remove("DB_ACQUIRE_TIMEOUT_MS")
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(default_db_acquire_timeout_ms);

        let operator_tokens = if let Some(tokens) = layered.remove("OPERATOR_TOKENS") {
            split_list(&tokens)
        } else if let Some(token) = take_non_empty(&mut layered, "OPERATOR_TOKEN") {
            vec![token]
        } else {
            Vec::new()
        };

        let app_secret = take_non_empty(&mut layered, "APP_SECRET")
            .or_else(|| nextauth_secret.filter(|v| !v.is_empty()));

        let app_base_url =
            take_non_empty(&mut layered, "APP_BASE_URL").unwrap_or_else(default_app_base_url);
        let public_base_url = take_non_empty(&mut layered, "PUBLIC_BASE_URL")
            .unwrap_or_else(default_public_base_url);

        let gmail = take_provider(&mut layered, "GMAIL");
        let google_chat = take_provider(&mut layered, "GOOGLE_CHAT");
        let fitbit = take_provider(&mut layered, "FITBIT");

        let gmail_scopes = layered
            .remove("GMAIL_SCOPES")
            .map(|v| split_list(&v))
            .filter(|v| !v.is_empty())
            .unwrap_or_else(default_gmail_scopes);
        let google_chat_scopes = layered
            .remove("GOOGLE_CHAT_SCOPES")
            .map(|v| split_list(&v))
            .filter(|v| !v.is_empty())
            .unwrap_or_else(default_google_chat_scopes);
        let fitbit_scopes = layered
            .remove("FITBIT_SCOPES")
            .map(|v| split_list(&v))
            .filter(|v| !v.is_empty())
            .unwrap_or_else(default_fitbit_scopes);

        let messenger_verify_token = take_non_empty(&mut layered, "MESSENGER_VERIFY_TOKEN");
        let messenger_app_secret = take_non_empty(&mut layered, "MESSENGER_APP_SECRET");

        let token_refresh_leeway_seconds = layered
            .remove("TOKEN_REFRESH_LEEWAY_SECONDS")
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(default_token_refresh_leeway_seconds);
        let oauth_state_ttl_minutes = layered
            .remove("OAUTH_STATE_TTL_MINUTES")
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(default_oauth_state_ttl_minutes);

        let config = AppConfig {
            profile,
            api_bind_addr,
            log_level,
            log_format,
            database_url,
            db_max_connections,
            db_acquire_timeout_ms,
            operator_tokens,
            app_secret,
            app_base_url,
            public_base_url,
            gmail,
            gmail_scopes,
            google_chat,
            google_chat_scopes,
            fitbit,
            fitbit_scopes,
            messenger_verify_token,
            messenger_app_secret,
            token_refresh_leeway_seconds,
            oauth_state_ttl_minutes,
        };

        config.validate()?;

        match config.bind_addr() {
            Ok(_) => Ok(config),
            Err(source) => Err(ConfigError::InvalidBindAddr {
                value: config.api_bind_addr.clone(),
                source,
            }),
        }
    }

    /// Returns the merged prefixed values, the profile, and any `NEXTAUTH_SECRET` found in files.
    fn collect_layered_env(
        &self,
    ) -> Result<(BTreeMap<String, String>, String, Option<String>), ConfigError> {
        let mut values = BTreeMap::new();
        let mut nextauth_secret = None;

        self.merge_dotenv(self.base_dir.join(".env"), &mut values, &mut nextauth_secret)?;
        self.merge_dotenv(
            self.base_dir.join(".env.local"),
            &mut values,
            &mut nextauth_secret,
        )?;

        let profile = env::var(format!("{ENV_PREFIX}PROFILE"))
            .ok()
            .or_else(|| values.get("PROFILE").cloned())
            .unwrap_or_else(default_profile);

        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}", &profile)),
            &mut values,
            &mut nextauth_secret,
        )?;
        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}.local", &profile)),
            &mut values,
            &mut nextauth_secret,
        )?;

        Ok((values, profile, nextauth_secret))
    }

    fn merge_dotenv(
        &self,
        path: PathBuf,
        values: &mut BTreeMap<String, String>,
        nextauth_secret: &mut Option<String>,
    ) -> Result<(), ConfigError> {
        match dotenvy::from_path_iter(&path) {
            Ok(iter) => {
                for item in iter {
                    let (key, value) = item.map_err(|source| ConfigError::EnvFile {
                        path: path.clone(),
                        source,
                    })?;
                    if let Some(stripped) = key.strip_prefix(ENV_PREFIX) {
                        values.insert(stripped.to_string(), value);
                    } else if key == NEXTAUTH_SECRET_VAR {
                        *nextauth_secret = Some(value);
                    }
                }
                Ok(())
            }
            Err(dotenvy::Error::Io(ref io_err))
                if io_err.kind() == std::io::ErrorKind::NotFound =>
            {
                Ok(())
            }
            Err(err) => Err(ConfigError::EnvFile { path, source: err }),
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn take_non_empty(values: &mut BTreeMap<String, String>, key: &str) -> Option<String> {
    values
        .remove(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn take_provider(values: &mut BTreeMap<String, String>, prefix: &str) -> ProviderCredentials {
    ProviderCredentials {
        client_id: take_non_empty(values, &format!("{prefix}_CLIENT_ID")),
        client_secret: take_non_empty(values, &format!("{prefix}_CLIENT_SECRET")),
        redirect_uri: take_non_empty(values, &format!("{prefix}_REDIRECT_URI")),
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

//! Integration tests for the OAuth callback endpoint
//!
//! A real listener serves the app while wiremock stands in for the Google and Fitbit
//! token endpoints. Covers:
//! - Refresh tokens persisted encrypted, and nothing persisted without one
//! - Reconnecting the same account updating its record in place
//! - Single-use state and redirect error codes
//! - Fitbit credentials written to the client's settings

use anyhow::{Context, Result as AnyhowResult};
use reqwest::StatusCode;
use sea_orm::DatabaseConnection;
use serde_json::json;
use std::sync::Arc;
use tokio::{net::TcpListener, sync::oneshot, task::JoinHandle};
use uuid::Uuid;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use wellness_coach::crypto::{CredentialCipher, CredentialPurpose};
use wellness_coach::models::client::Role;
use wellness_coach::providers::google::GoogleEndpoints;
use wellness_coach::providers::{FitbitProvider, GoogleProvider, ProviderKind, ProviderSet};
use wellness_coach::repositories::{ClientRepository, OAuthServiceRepository, OAuthStateRepository};
use wellness_coach::server::{AppState, create_app};

#[path = "test_utils/mod.rs"]
mod test_utils;

struct TestServerHandle {
    shutdown_tx: Option<oneshot::Sender<()>>,
    join_handle: Option<JoinHandle<std::io::Result<()>>>,
}

impl TestServerHandle {
    async fn shutdown(mut self) -> AnyhowResult<()> {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }

        if let Some(handle) = self.join_handle.take() {
            let result = handle.await.context("server task join failed")?;
            result?;
        }

        Ok(())
    }
}

struct TestApp {
    base_url: String,
    db: Arc<DatabaseConnection>,
    http: reqwest::Client,
    handle: TestServerHandle,
}

impl TestApp {
    async fn callback(&self, provider: &str, query: &str) -> reqwest::Response {
        self.http
            .get(format!(
                "{}/api/integrations/{}/callback?{}",
                self.base_url, provider, query
            ))
            .send()
            .await
            .unwrap()
    }

    async fn seed_state(&self, provider: &str, state: &str, client_id: Option<Uuid>) {
        OAuthStateRepository::new(self.db.clone())
            .create(provider, state, client_id, 15)
            .await
            .unwrap();
    }
}

/// Spawns the app on an ephemeral port
async fn spawn_test_app(providers: ProviderSet) -> TestApp {
    let db = test_utils::setup_test_db().await.unwrap();
    let shared = Arc::new(db.clone());

    let state = AppState::new(Arc::new(test_utils::test_config()), db, providers).unwrap();
    let app = create_app(state);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

    let join_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    let http = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap();

    TestApp {
        base_url: format!("http://{}", addr),
        db: shared,
        http,
        handle: TestServerHandle {
            shutdown_tx: Some(shutdown_tx),
            join_handle: Some(join_handle),
        },
    }
}

fn gmail_providers(mock: &MockServer) -> ProviderSet {
    ProviderSet::new().with(Arc::new(
        GoogleProvider::new(
            ProviderKind::Gmail,
            "gmail-client".to_string(),
            "gmail-secret".to_string(),
            vec!["https://www.googleapis.com/auth/gmail.send".to_string()],
        )
        .unwrap()
        .with_endpoints(GoogleEndpoints::with_base(&mock.uri())),
    ))
}

fn fitbit_providers(mock: &MockServer) -> ProviderSet {
    ProviderSet::new().with(Arc::new(
        FitbitProvider::new(
            "fitbit-client".to_string(),
            "fitbit-secret".to_string(),
            vec!["activity".to_string()],
        )
        .unwrap()
        .with_base_url(&mock.uri()),
    ))
}

fn location(response: &reqwest::Response) -> String {
    response
        .headers()
        .get(reqwest::header::LOCATION)
        .expect("redirect location")
        .to_str()
        .unwrap()
        .to_string()
}

async fn mount_google_userinfo(mock: &MockServer, email: &str) {
    Mock::given(method("GET"))
        .and(path("/oauth2/v2/userinfo"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "email": email })))
        .mount(mock)
        .await;
}

#[tokio::test]
async fn test_gmail_callback_persists_encrypted_refresh_token() {
    let mock = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("grant_type=authorization_code"))
        .and(body_string_contains("code=auth-code"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "ya29.first",
            "refresh_token": "1//gmail-refresh",
            "expires_in": 3599,
            "scope": "https://www.googleapis.com/auth/gmail.send"
        })))
        .expect(1)
        .mount(&mock)
        .await;
    mount_google_userinfo(&mock, "coach@example.com").await;

    let app = spawn_test_app(gmail_providers(&mock)).await;
    app.seed_state("gmail", "state-gmail", None).await;

    let response = app.callback("gmail", "code=auth-code&state=state-gmail").await;
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    assert_eq!(
        location(&response),
        "https://app.example.com/admin/integrations?connected=gmail"
    );

    let record = OAuthServiceRepository::new(app.db.clone())
        .latest_by_name("gmail")
        .await
        .unwrap()
        .expect("integration stored");
    assert_eq!(record.account_key, "coach@example.com");

    let properties = record.typed_properties().unwrap();
    assert_eq!(properties.connected_email, "coach@example.com");
    assert_eq!(properties.access_token.as_deref(), Some("ya29.first"));
    assert!(properties.expires_at.is_some());
    assert_ne!(properties.encrypted_refresh_token, "1//gmail-refresh");
    assert_eq!(properties.encrypted_refresh_token.split(':').count(), 3);

    let cipher = CredentialCipher::from_secret(test_utils::TEST_SECRET).unwrap();
    let refresh = cipher
        .decrypt(
            CredentialPurpose::GmailRefreshToken,
            &properties.encrypted_refresh_token,
        )
        .unwrap();
    assert_eq!(refresh, "1//gmail-refresh");

    app.handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_reconnecting_same_account_updates_record() {
    let mock = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "ya29.again",
            "refresh_token": "1//again",
            "expires_in": 3599
        })))
        .expect(2)
        .mount(&mock)
        .await;
    mount_google_userinfo(&mock, "coach@example.com").await;

    let app = spawn_test_app(gmail_providers(&mock)).await;
    app.seed_state("gmail", "first", None).await;
    app.seed_state("gmail", "second", None).await;

    let first = app.callback("gmail", "code=c1&state=first").await;
    assert!(location(&first).ends_with("connected=gmail"));
    let second = app.callback("gmail", "code=c2&state=second").await;
    assert!(location(&second).ends_with("connected=gmail"));

    let records = OAuthServiceRepository::new(app.db.clone())
        .list()
        .await
        .unwrap();
    assert_eq!(records.len(), 1);

    app.handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_missing_refresh_token_persists_nothing() {
    let mock = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "ya29.no-refresh",
            "expires_in": 3599
        })))
        .mount(&mock)
        .await;
    Mock::given(method("GET"))
        .and(path("/oauth2/v2/userinfo"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "email": "x@example.com" })))
        .expect(0)
        .mount(&mock)
        .await;

    let app = spawn_test_app(gmail_providers(&mock)).await;
    app.seed_state("gmail", "state-no-refresh", None).await;

    let response = app
        .callback("gmail", "code=auth-code&state=state-no-refresh")
        .await;
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    assert_eq!(
        location(&response),
        "https://app.example.com/admin/integrations?error=no_refresh_token_issued"
    );

    let records = OAuthServiceRepository::new(app.db.clone())
        .list()
        .await
        .unwrap();
    assert!(records.is_empty());

    app.handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_token_exchange_failure_redirects_with_code() {
    let mock = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": "invalid_grant"
        })))
        .mount(&mock)
        .await;

    let app = spawn_test_app(gmail_providers(&mock)).await;
    app.seed_state("gmail", "state-bad-code", None).await;

    let response = app.callback("gmail", "code=stale&state=state-bad-code").await;
    assert_eq!(
        location(&response),
        "https://app.example.com/admin/integrations?error=token_exchange_failed"
    );

    app.handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_state_cannot_be_replayed() {
    let mock = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "ya29.once",
            "refresh_token": "1//once",
            "expires_in": 3599
        })))
        .expect(1)
        .mount(&mock)
        .await;
    mount_google_userinfo(&mock, "coach@example.com").await;

    let app = spawn_test_app(gmail_providers(&mock)).await;
    app.seed_state("gmail", "single-use", None).await;

    let first = app.callback("gmail", "code=c&state=single-use").await;
    assert!(location(&first).ends_with("connected=gmail"));

    let replay = app.callback("gmail", "code=c&state=single-use").await;
    assert_eq!(
        location(&replay),
        "https://app.example.com/admin/integrations?error=invalid_state"
    );

    app.handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_fitbit_callback_writes_encrypted_client_settings() {
    let mock = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/oauth2/token"))
        .and(body_string_contains("grant_type=authorization_code"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "fitbit-access",
            "refresh_token": "fitbit-refresh",
            "expires_in": 28800,
            "scope": "activity sleep",
            "user_id": "ABC123"
        })))
        .expect(1)
        .mount(&mock)
        .await;

    let app = spawn_test_app(fitbit_providers(&mock)).await;
    let client_id = test_utils::create_test_client(&app.db, &[Role::Client])
        .await
        .unwrap();
    app.seed_state("fitbit", "fitbit-state", Some(client_id)).await;

    let response = app.callback("fitbit", "code=fb-code&state=fitbit-state").await;
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    assert_eq!(
        location(&response),
        "https://app.example.com/client/settings?connected=fitbit"
    );

    let client = ClientRepository::new(app.db.clone())
        .find_by_id(client_id)
        .await
        .unwrap()
        .unwrap();
    let settings = client.integration_settings().unwrap();
    let fitbit = settings
        .iter()
        .find(|s| s.id == "fitbit")
        .expect("fitbit settings entry");

    assert_eq!(fitbit.value("userId"), Some("ABC123"));
    assert_eq!(fitbit.value("scopes"), Some("activity sleep"));
    assert!(fitbit.is_encrypted("accessToken"));
    assert!(fitbit.is_encrypted("refreshToken"));

    let cipher = CredentialCipher::from_secret(test_utils::TEST_SECRET).unwrap();
    let access = cipher
        .decrypt(
            CredentialPurpose::FitbitAccessToken,
            fitbit.value("accessToken").unwrap(),
        )
        .unwrap();
    assert_eq!(access, "fitbit-access");

    app.handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_fitbit_state_without_client_is_rejected() {
    let mock = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/oauth2/token"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&mock)
        .await;

    let app = spawn_test_app(fitbit_providers(&mock)).await;
    app.seed_state("fitbit", "unbound", None).await;

    let response = app.callback("fitbit", "code=fb-code&state=unbound").await;
    assert_eq!(
        location(&response),
        "https://app.example.com/client/settings?error=invalid_state"
    );

    app.handle.shutdown().await.unwrap();
}

//! # Server Configuration
//!
//! Router assembly, shared state, startup sequence and the OpenAPI document.

use std::sync::Arc;

use anyhow::{Context, anyhow};
use axum::{
    Router, middleware,
    routing::{delete, get, post},
};
use migration::{Migrator, MigratorTrait};
use sea_orm::DatabaseConnection;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::auth::auth_middleware;
use crate::config::AppConfig;
use crate::credentials::CredentialService;
use crate::crypto::CredentialCipher;
use crate::habits::HabitCompletionService;
use crate::handlers::{self, connect, habits, integrations, messenger};
use crate::providers::ProviderSet;
use crate::telemetry;

/// Application state containing shared resources
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub db: DatabaseConnection,
    pub credentials: Arc<CredentialService>,
    pub habits: Arc<HabitCompletionService>,
}

impl AppState {
    /// Builds the services over `db`. Fails when no credential secret is configured.
    pub fn new(
        config: Arc<AppConfig>,
        db: DatabaseConnection,
        providers: ProviderSet,
    ) -> anyhow::Result<Self> {
        let secret = config
            .app_secret
            .as_deref()
            .ok_or_else(|| anyhow!("WELLNESS_APP_SECRET or NEXTAUTH_SECRET must be set"))?;
        let cipher = Arc::new(
            CredentialCipher::from_secret(secret).context("Failed to derive credential key")?,
        );

        let shared_db = Arc::new(db.clone());
        let credentials = Arc::new(CredentialService::new(
            Arc::clone(&shared_db),
            cipher,
            providers,
            Arc::clone(&config),
        ));
        let habits = Arc::new(HabitCompletionService::new(shared_db));

        Ok(Self {
            config,
            db,
            credentials,
            habits,
        })
    }
}

/// Creates and configures the Axum application router
pub fn create_app(state: AppState) -> Router {
    let protected = Router::new()
        .route(
            "/api/admin/integrations",
            get(integrations::list_integrations),
        )
        .route(
            "/api/admin/integrations/{provider}/connect",
            post(connect::connect_system_integration),
        )
        .route(
            "/api/admin/integrations/{provider}/verify",
            post(integrations::verify_integration),
        )
        .route(
            "/api/admin/integrations/{provider}/{id}",
            delete(integrations::disconnect_integration),
        )
        .route(
            "/api/client/integrations/fitbit",
            get(integrations::fitbit_status).delete(integrations::disconnect_fitbit),
        )
        .route(
            "/api/client/integrations/fitbit/connect",
            post(connect::connect_fitbit),
        )
        .route(
            "/api/client/habits/{programme_habit_id}/completions",
            post(habits::record_completion).get(habits::completion_history),
        )
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state.config),
            auth_middleware,
        ));

    let public = Router::new()
        .route("/", get(handlers::root))
        .route("/health", get(handlers::health))
        .route(
            "/api/integrations/errors/{code}",
            get(connect::callback_error_lookup),
        )
        .route(
            "/api/integrations/{provider}/callback",
            get(connect::oauth_callback),
        )
        .route(
            "/api/webhooks/messenger",
            get(messenger::verify_subscription).post(messenger::receive_events),
        );

    Router::new()
        .merge(public)
        .merge(protected)
        .with_state(state)
        .merge(SwaggerUi::new("/docs").url("/openapi.json", ApiDoc::openapi()))
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(telemetry::trace_context_middleware))
}

/// Starts the server with the given configuration
pub async fn run_server(config: AppConfig) -> anyhow::Result<()> {
    config.validate().context("Invalid configuration")?;
    telemetry::init_tracing(&config).context("Failed to initialise tracing")?;

    let db = crate::db::init_pool(&config).await?;
    Migrator::up(&db, None)
        .await
        .context("Failed to run database migrations")?;

    let providers = ProviderSet::from_config(&config).context("Invalid provider configuration")?;
    let configured = providers.configured();
    if configured.is_empty() {
        tracing::warn!("No OAuth providers configured; integrations cannot be connected");
    } else {
        tracing::info!(providers = ?configured, "OAuth providers configured");
    }

    let addr = config
        .bind_addr()
        .with_context(|| format!("Invalid server address: {}", config.api_bind_addr))?;

    let state = AppState::new(Arc::new(config), db, providers)?;
    let app = create_app(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    tracing::info!(%addr, "Server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown signal received");
        })
        .await
        .context("Server exited unexpectedly")?;

    Ok(())
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    paths(
        crate::handlers::root,
        crate::handlers::health,
        crate::handlers::connect::connect_system_integration,
        crate::handlers::connect::connect_fitbit,
        crate::handlers::connect::oauth_callback,
        crate::handlers::connect::callback_error_lookup,
        crate::handlers::integrations::list_integrations,
        crate::handlers::integrations::verify_integration,
        crate::handlers::integrations::disconnect_integration,
        crate::handlers::integrations::fitbit_status,
        crate::handlers::integrations::disconnect_fitbit,
        crate::handlers::habits::record_completion,
        crate::handlers::habits::completion_history,
        crate::handlers::messenger::verify_subscription,
        crate::handlers::messenger::receive_events,
    ),
    components(
        schemas(
            crate::models::ServiceInfo,
            crate::handlers::HealthResponse,
            crate::handlers::connect::AuthorizeUrlResponse,
            crate::handlers::connect::CallbackErrorResponse,
            crate::handlers::integrations::IntegrationsResponse,
            crate::handlers::integrations::VerifyIntegrationResponse,
            crate::handlers::integrations::FitbitStatusResponse,
            crate::credentials::IntegrationSummary,
            crate::providers::ProviderKind,
            crate::habits::HabitCompletionRequest,
            crate::habits::HabitCompletionView,
            crate::habits::HabitHistoryView,
            crate::error::ApiError,
            crate::error::CallbackErrorCode,
        )
    ),
    tags(
        (name = "root", description = "Service information and health"),
        (name = "integrations", description = "OAuth integrations"),
        (name = "habits", description = "Habit completion tracking"),
        (name = "webhooks", description = "Inbound provider webhooks")
    ),
    info(
        title = "Wellness Coach API",
        description = "Integration credentials and habit tracking for the coaching dashboard",
        version = env!("CARGO_PKG_VERSION"),
    )
)]
pub struct ApiDoc;

//! Test utilities for database and service testing.
//!
//! In-memory SQLite databases with migrations applied, fixture inserts for
//! clients, programmes and habits, and a ready-made credential service.

#![allow(dead_code)]

use anyhow::Result;
use chrono::Utc;
use migration::{Migrator, MigratorTrait};
use sea_orm::{Database, DatabaseConnection, EntityTrait, Set};
use std::sync::Arc;
use uuid::Uuid;

use wellness_coach::config::AppConfig;
use wellness_coach::credentials::CredentialService;
use wellness_coach::crypto::{CredentialCipher, DerivedKey, KEY_LEN};
use wellness_coach::models::client::Role;
use wellness_coach::models::{programme, programme_enrolment, programme_habit};
use wellness_coach::providers::ProviderSet;
use wellness_coach::repositories::ClientRepository;

pub const TEST_SECRET: &str = "integration-test-secret-0123456789abcdef";

/// Sets up an in-memory SQLite database with all migrations applied.
pub async fn setup_test_db() -> Result<DatabaseConnection> {
    let db = Database::connect("sqlite::memory:").await?;
    Migrator::up(&db, None).await?;
    Ok(db)
}

/// Sets up an in-memory SQLite database with all migrations applied and returns an Arc.
pub async fn setup_test_db_arc() -> Result<Arc<DatabaseConnection>> {
    let db = setup_test_db().await?;
    Ok(Arc::new(db))
}

/// Configuration accepted by `AppConfig::validate`.
pub fn test_config() -> AppConfig {
    AppConfig {
        profile: "test".to_string(),
        operator_tokens: vec!["test-operator-token".to_string()],
        app_secret: Some(TEST_SECRET.to_string()),
        app_base_url: "https://app.example.com".to_string(),
        public_base_url: "https://api.example.com".to_string(),
        ..Default::default()
    }
}

/// A cipher over a fixed key; skips scrypt to keep tests fast.
pub fn test_cipher() -> CredentialCipher {
    CredentialCipher::new(DerivedKey::from_bytes([7u8; KEY_LEN]))
}

pub fn credential_service(
    db: Arc<DatabaseConnection>,
    providers: ProviderSet,
) -> CredentialService {
    CredentialService::new(
        db,
        Arc::new(test_cipher()),
        providers,
        Arc::new(test_config()),
    )
}

/// Inserts a client with the given roles and returns its id.
pub async fn create_test_client(db: &DatabaseConnection, roles: &[Role]) -> Result<Uuid> {
    let client = ClientRepository::new(Arc::new(db.clone()))
        .create(&format!("{}@example.com", Uuid::new_v4()), Some("Test Client"), roles)
        .await?;
    Ok(client.id)
}

pub async fn create_test_programme(db: &DatabaseConnection) -> Result<Uuid> {
    let id = Uuid::new_v4();
    programme::Entity::insert(programme::ActiveModel {
        id: Set(id),
        name: Set("Test Programme".to_string()),
        created_at: Set(Utc::now()),
    })
    .exec_without_returning(db)
    .await?;
    Ok(id)
}

pub async fn enrol_client(
    db: &DatabaseConnection,
    programme_id: Uuid,
    client_id: Uuid,
    status: &str,
) -> Result<Uuid> {
    let id = Uuid::new_v4();
    programme_enrolment::Entity::insert(programme_enrolment::ActiveModel {
        id: Set(id),
        programme_id: Set(programme_id),
        client_id: Set(client_id),
        status: Set(status.to_string()),
        created_at: Set(Utc::now()),
    })
    .exec_without_returning(db)
    .await?;
    Ok(id)
}

/// Inserts a habit requiring `per_day` completions every day of the week.
pub async fn create_test_habit(
    db: &DatabaseConnection,
    programme_id: Uuid,
    per_day: Option<i32>,
) -> Result<Uuid> {
    let id = Uuid::new_v4();
    programme_habit::Entity::insert(programme_habit::ActiveModel {
        id: Set(id),
        programme_id: Set(programme_id),
        title: Set("Stretch".to_string()),
        monday: Set(per_day),
        tuesday: Set(per_day),
        wednesday: Set(per_day),
        thursday: Set(per_day),
        friday: Set(per_day),
        saturday: Set(per_day),
        sunday: Set(per_day),
        created_at: Set(Utc::now()),
    })
    .exec_without_returning(db)
    .await?;
    Ok(id)
}

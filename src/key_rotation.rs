//! # Credential Key Rotation
//!
//! Re-encrypts every stored credential from one secret to another under the same AAD:
//! the refresh token of each `oauth_services` row and each encrypted property in client
//! settings. Values that fail to decrypt under the old key are reported and left as they are.

use std::sync::Arc;

use sea_orm::DatabaseConnection;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::credentials::{FITBIT_SETTING_ID, PROP_ACCESS_TOKEN, PROP_REFRESH_TOKEN};
use crate::crypto::{CredentialCipher, CredentialPurpose, CryptoError};
use crate::providers::ProviderKind;
use crate::repositories::{ClientRepository, OAuthServiceRepository};

/// A value that could not be rotated
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RotationFailure {
    /// `oauth_services` or `clients`
    pub table: &'static str,
    pub record_id: Uuid,
    /// Property that failed, e.g. `encryptedRefreshToken` or `fitbit.accessToken`
    pub field: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RotationReport {
    pub oauth_services_rotated: usize,
    pub client_values_rotated: usize,
    pub failures: Vec<RotationFailure>,
    pub dry_run: bool,
}

impl RotationReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    fn service_failure(&mut self, record_id: Uuid, reason: String) {
        warn!(%record_id, %reason, "Skipping oauth service record");
        self.failures.push(RotationFailure {
            table: "oauth_services",
            record_id,
            field: "encryptedRefreshToken".to_string(),
            reason,
        });
    }
}

/// AAD purpose for an encrypted client settings property.
pub fn settings_purpose(setting_id: &str, property: &str) -> Option<CredentialPurpose> {
    match (setting_id, property) {
        (FITBIT_SETTING_ID, PROP_ACCESS_TOKEN) => Some(CredentialPurpose::FitbitAccessToken),
        (FITBIT_SETTING_ID, PROP_REFRESH_TOKEN) => Some(CredentialPurpose::FitbitRefreshToken),
        _ => None,
    }
}

fn reencrypt(
    old: &CredentialCipher,
    new: &CredentialCipher,
    purpose: CredentialPurpose,
    stored: &str,
) -> Result<String, CryptoError> {
    let plaintext = old.decrypt(purpose, stored)?;
    new.encrypt(purpose, &plaintext)
}

pub struct KeyRotator {
    oauth_services: OAuthServiceRepository,
    clients: ClientRepository,
    old: CredentialCipher,
    new: CredentialCipher,
}

impl KeyRotator {
    pub fn new(db: Arc<DatabaseConnection>, old: CredentialCipher, new: CredentialCipher) -> Self {
        Self {
            oauth_services: OAuthServiceRepository::new(db.clone()),
            clients: ClientRepository::new(db),
            old,
            new,
        }
    }

    /// Rotates every stored credential. With `dry_run` nothing is written.
    pub async fn rotate(&self, dry_run: bool) -> Result<RotationReport, sea_orm::DbErr> {
        let mut report = RotationReport {
            dry_run,
            ..Default::default()
        };

        self.rotate_oauth_services(dry_run, &mut report).await?;
        self.rotate_client_settings(dry_run, &mut report).await?;

        info!(
            oauth_services = report.oauth_services_rotated,
            client_values = report.client_values_rotated,
            failures = report.failures.len(),
            dry_run,
            "Credential key rotation finished"
        );
        Ok(report)
    }

    async fn rotate_oauth_services(
        &self,
        dry_run: bool,
        report: &mut RotationReport,
    ) -> Result<(), sea_orm::DbErr> {
        for record in self.oauth_services.list().await? {
            let record_id = record.id;

            let Some(kind) = ProviderKind::parse(&record.name) else {
                let reason = format!("unknown provider '{}'", record.name);
                report.service_failure(record_id, reason);
                continue;
            };
            let mut properties = match record.typed_properties() {
                Ok(properties) => properties,
                Err(e) => {
                    report.service_failure(record_id, format!("unreadable properties: {}", e));
                    continue;
                }
            };

            let purpose = kind.refresh_token_purpose();
            match reencrypt(&self.old, &self.new, purpose, &properties.encrypted_refresh_token) {
                Ok(rotated) => {
                    properties.encrypted_refresh_token = rotated;
                    if !dry_run {
                        self.oauth_services
                            .update_properties(record, &properties)
                            .await?;
                    }
                    report.oauth_services_rotated += 1;
                }
                Err(e) => report.service_failure(record_id, e.to_string()),
            }
        }
        Ok(())
    }

    async fn rotate_client_settings(
        &self,
        dry_run: bool,
        report: &mut RotationReport,
    ) -> Result<(), sea_orm::DbErr> {
        for client in self.clients.list().await? {
            let client_id = client.id;
            let mut entries = match client.integration_settings() {
                Ok(entries) => entries,
                Err(e) => {
                    report.failures.push(RotationFailure {
                        table: "clients",
                        record_id: client_id,
                        field: "settings".to_string(),
                        reason: format!("unreadable settings: {}", e),
                    });
                    continue;
                }
            };

            let mut rotated = 0;
            for entry in entries.iter_mut() {
                for property in entry.properties.iter_mut().filter(|p| p.encrypted) {
                    let field = format!("{}.{}", entry.id, property.name);
                    let result = match settings_purpose(&entry.id, &property.name) {
                        Some(purpose) => reencrypt(&self.old, &self.new, purpose, &property.value)
                            .map_err(|e| e.to_string()),
                        None => Err("no credential purpose for property".to_string()),
                    };

                    match result {
                        Ok(value) => {
                            property.value = value;
                            rotated += 1;
                        }
                        Err(reason) => {
                            warn!(%client_id, %field, %reason, "Skipping client setting");
                            report.failures.push(RotationFailure {
                                table: "clients",
                                record_id: client_id,
                                field,
                                reason,
                            });
                        }
                    }
                }
            }

            if rotated > 0 && !dry_run {
                self.clients.save_settings(client, &entries).await?;
            }
            report.client_values_rotated += rotated;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{DerivedKey, KEY_LEN};
    use crate::models::client::Role;
    use crate::models::oauth_service::OAuthServiceProperties;
    use crate::models::settings::IntegrationSetting;
    use migration::{Migrator, MigratorTrait};
    use sea_orm::Database;

    fn cipher(byte: u8) -> CredentialCipher {
        CredentialCipher::new(DerivedKey::from_bytes([byte; KEY_LEN]))
    }

    #[test]
    fn only_fitbit_tokens_have_settings_purposes() {
        assert_eq!(
            settings_purpose("fitbit", "refreshToken"),
            Some(CredentialPurpose::FitbitRefreshToken)
        );
        assert_eq!(settings_purpose("fitbit", "userId"), None);
        assert_eq!(settings_purpose("strava", "accessToken"), None);
    }

    #[tokio::test]
    async fn rotates_services_and_settings_and_reports_failures() {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        Migrator::up(&db, None).await.unwrap();
        let db = Arc::new(db);
        let (old, new) = (cipher(1), cipher(2));

        let services = OAuthServiceRepository::new(db.clone());
        let (gmail, _) = services
            .upsert(
                "gmail",
                "coach@example.com",
                &OAuthServiceProperties {
                    connected_email: "coach@example.com".to_string(),
                    encrypted_refresh_token: old
                        .encrypt(CredentialPurpose::GmailRefreshToken, "gmail-refresh")
                        .unwrap(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let (stale, _) = services
            .upsert(
                "google_chat",
                "bot@example.com",
                &OAuthServiceProperties {
                    connected_email: "bot@example.com".to_string(),
                    encrypted_refresh_token: new
                        .encrypt(CredentialPurpose::GoogleChatRefreshToken, "already-new")
                        .unwrap(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let clients = ClientRepository::new(db.clone());
        let client = clients
            .create("client@example.com", None, &[Role::Client])
            .await
            .unwrap();
        let setting = IntegrationSetting::new("fitbit", "integration")
            .with("userId", "ABC", false, false)
            .with(
                "accessToken",
                old.encrypt(CredentialPurpose::FitbitAccessToken, "fb-access").unwrap(),
                false,
                true,
            )
            .with(
                "refreshToken",
                old.encrypt(CredentialPurpose::FitbitRefreshToken, "fb-refresh").unwrap(),
                false,
                true,
            );
        clients.save_settings(client, &[setting]).await.unwrap();

        let rotator = KeyRotator::new(db.clone(), cipher(1), cipher(2));

        let dry = rotator.rotate(true).await.unwrap();
        assert_eq!(dry.oauth_services_rotated, 1);
        assert_eq!(dry.client_values_rotated, 2);
        let unchanged = services.find_by_id(gmail.id).await.unwrap().unwrap();
        assert_eq!(unchanged.properties, gmail.properties);

        let report = rotator.rotate(false).await.unwrap();
        assert!(!report.is_success());
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].record_id, stale.id);

        let rotated = services.find_by_id(gmail.id).await.unwrap().unwrap();
        let props = rotated.typed_properties().unwrap();
        assert_eq!(
            new.decrypt(CredentialPurpose::GmailRefreshToken, &props.encrypted_refresh_token)
                .unwrap(),
            "gmail-refresh"
        );

        let stored = clients.list().await.unwrap().remove(0);
        let entries = stored.integration_settings().unwrap();
        let fitbit = &entries[0];
        assert_eq!(fitbit.value("userId"), Some("ABC"));
        assert_eq!(
            new.decrypt(
                CredentialPurpose::FitbitRefreshToken,
                fitbit.value("refreshToken").unwrap()
            )
            .unwrap(),
            "fb-refresh"
        );
    }
}

//! # OAuth Service Repository
//!
//! Persistence for system-level integrations, keyed by `(name, account_key)`.

use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, Set,
};
use std::sync::Arc;
use uuid::Uuid;

use crate::error::is_unique_violation;
use crate::models::oauth_service::{self, ActiveModel, Entity, Model, OAuthServiceProperties};

fn to_json(properties: &OAuthServiceProperties) -> Result<serde_json::Value, sea_orm::DbErr> {
    serde_json::to_value(properties).map_err(|e| sea_orm::DbErr::Json(e.to_string()))
}

/// Repository for system integration records
#[derive(Debug, Clone)]
pub struct OAuthServiceRepository {
    db: Arc<DatabaseConnection>,
}

impl OAuthServiceRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    pub async fn find_by_id(&self, id: Uuid) -> Result<Option<Model>, sea_orm::DbErr> {
        Entity::find_by_id(id).one(&*self.db).await
    }

    pub async fn find_by_name_and_account(
        &self,
        name: &str,
        account_key: &str,
    ) -> Result<Option<Model>, sea_orm::DbErr> {
        Entity::find()
            .filter(oauth_service::Column::Name.eq(name))
            .filter(oauth_service::Column::AccountKey.eq(account_key))
            .one(&*self.db)
            .await
    }

    /// Most recently updated record for a provider
    pub async fn latest_by_name(&self, name: &str) -> Result<Option<Model>, sea_orm::DbErr> {
        Entity::find()
            .filter(oauth_service::Column::Name.eq(name))
            .order_by_desc(oauth_service::Column::UpdatedAt)
            .one(&*self.db)
            .await
    }

    pub async fn list(&self) -> Result<Vec<Model>, sea_orm::DbErr> {
        Entity::find()
            .order_by_asc(oauth_service::Column::Name)
            .order_by_asc(oauth_service::Column::AccountKey)
            .all(&*self.db)
            .await
    }

    /// Insert a record or update the existing one for the same account.
    ///
    /// Returns the stored model and whether it was newly created.
    pub async fn upsert(
        &self,
        name: &str,
        account_key: &str,
        properties: &OAuthServiceProperties,
    ) -> Result<(Model, bool), sea_orm::DbErr> {
        let json = to_json(properties)?;
        let now = Utc::now();

        if let Some(existing) = self.find_by_name_and_account(name, account_key).await? {
            let updated = self.replace_properties(existing, json).await?;
            return Ok((updated, false));
        }

        let model = Model {
            id: Uuid::new_v4(),
            name: name.to_string(),
            account_key: account_key.to_string(),
            properties: json,
            created_at: now,
            updated_at: now,
        };
        let active = ActiveModel {
            id: Set(model.id),
            name: Set(model.name.clone()),
            account_key: Set(model.account_key.clone()),
            properties: Set(model.properties.clone()),
            created_at: Set(now),
            updated_at: Set(now),
        };
        match Entity::insert(active).exec_without_returning(&*self.db).await {
            Ok(_) => Ok((model, true)),
            Err(e) if is_unique_violation(&e) => {
                // Another callback connected the same account first; update its row
                tracing::debug!(provider = name, "Concurrent integration insert, updating instead");
                let existing = self
                    .find_by_name_and_account(name, account_key)
                    .await?
                    .ok_or(e)?;
                let updated = self.replace_properties(existing, model.properties).await?;
                Ok((updated, false))
            }
            Err(e) => Err(e),
        }
    }

    async fn replace_properties(
        &self,
        record: Model,
        json: serde_json::Value,
    ) -> Result<Model, sea_orm::DbErr> {
        let mut active: ActiveModel = record.into();
        active.properties = Set(json);
        active.updated_at = Set(Utc::now());
        active.update(&*self.db).await
    }

    /// Replace the properties of an existing record
    pub async fn update_properties(
        &self,
        record: Model,
        properties: &OAuthServiceProperties,
    ) -> Result<Model, sea_orm::DbErr> {
        self.replace_properties(record, to_json(properties)?).await
    }

    /// Delete a record of the given provider. Returns false when nothing matched.
    pub async fn delete(&self, name: &str, id: Uuid) -> Result<bool, sea_orm::DbErr> {
        let result = Entity::delete_many()
            .filter(oauth_service::Column::Id.eq(id))
            .filter(oauth_service::Column::Name.eq(name))
            .exec(&*self.db)
            .await?;
        Ok(result.rows_affected > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use migration::{Migrator, MigratorTrait};
    use sea_orm::Database;

    async fn repo() -> OAuthServiceRepository {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        Migrator::up(&db, None).await.unwrap();
        OAuthServiceRepository::new(Arc::new(db))
    }

    fn props(token: &str) -> OAuthServiceProperties {
        OAuthServiceProperties {
            access_token: Some(token.to_string()),
            expires_at: Some(0),
            scopes: Vec::new(),
            connected_email: "coach@example.com".to_string(),
            encrypted_refresh_token: "iv:tag:ct".to_string(),
        }
    }

    #[tokio::test]
    async fn upsert_updates_same_account_in_place() {
        let repo = repo().await;
        let (first, created) = repo.upsert("gmail", "coach@example.com", &props("a")).await.unwrap();
        assert!(created);
        let (second, created) = repo.upsert("gmail", "coach@example.com", &props("b")).await.unwrap();
        assert!(!created);
        assert_eq!(first.id, second.id);

        let all = repo.list().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(
            all[0].typed_properties().unwrap().access_token.as_deref(),
            Some("b")
        );
    }

    #[tokio::test]
    async fn concurrent_connects_of_one_account_share_a_row() {
        let repo = repo().await;

        let (props_a, props_b) = (props("a"), props("b"));
        let (a, b) = tokio::join!(
            repo.upsert("gmail", "coach@example.com", &props_a),
            repo.upsert("gmail", "coach@example.com", &props_b),
        );
        let (a, a_created) = a.unwrap();
        let (b, b_created) = b.unwrap();

        assert_eq!(a.id, b.id);
        assert!(a_created ^ b_created);
        assert_eq!(repo.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn delete_requires_matching_provider() {
        let repo = repo().await;
        let (record, _) = repo.upsert("gmail", "coach@example.com", &props("a")).await.unwrap();
        assert!(!repo.delete("google_chat", record.id).await.unwrap());
        assert!(repo.delete("gmail", record.id).await.unwrap());
        assert!(repo.latest_by_name("gmail").await.unwrap().is_none());
    }
}

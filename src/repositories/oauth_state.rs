//! # OAuth State Repository
//!
//! Single-use CSRF state tokens. A state is consumed (deleted) on first lookup whether or
//! not it has expired, so it can never be replayed.

use chrono::{Duration, Utc};
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set};
use std::sync::Arc;
use uuid::Uuid;

use crate::models::oauth_state::{self, ActiveModel, Entity, Model};

/// Repository for OAuth state database operations
#[derive(Debug, Clone)]
pub struct OAuthStateRepository {
    db: Arc<DatabaseConnection>,
}

impl OAuthStateRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Create a new OAuth state record
    pub async fn create(
        &self,
        provider: &str,
        state: &str,
        client_id: Option<Uuid>,
        expires_in_minutes: i64,
    ) -> Result<Model, sea_orm::DbErr> {
        let now = Utc::now();
        let model = Model {
            id: Uuid::new_v4(),
            provider: provider.to_string(),
            state: state.to_string(),
            client_id,
            expires_at: now + Duration::minutes(expires_in_minutes),
            created_at: now,
        };

        let active = ActiveModel {
            id: Set(model.id),
            provider: Set(model.provider.clone()),
            state: Set(model.state.clone()),
            client_id: Set(model.client_id),
            expires_at: Set(model.expires_at),
            created_at: Set(model.created_at),
        };

        // Insert without RETURNING so uuid keys behave the same on SQLite and Postgres
        Entity::insert(active).exec_without_returning(&*self.db).await?;

        Ok(model)
    }

    /// Find and consume a state token. Expired states are deleted and reported as absent.
    pub async fn find_and_consume(&self, state: &str) -> Result<Option<Model>, sea_orm::DbErr> {
        let Some(found) = Entity::find()
            .filter(oauth_state::Column::State.eq(state))
            .one(&*self.db)
            .await?
        else {
            return Ok(None);
        };

        // Only the caller whose delete removed the row owns the state
        let deleted = Entity::delete_by_id(found.id).exec(&*self.db).await?;
        if deleted.rows_affected != 1 {
            tracing::debug!(provider = %found.provider, "OAuth state already consumed");
            return Ok(None);
        }

        if found.is_expired(Utc::now()) {
            tracing::debug!(provider = %found.provider, "Discarded expired OAuth state");
            return Ok(None);
        }

        Ok(Some(found))
    }

    /// Clean up expired OAuth states
    pub async fn cleanup_expired(&self) -> Result<u64, sea_orm::DbErr> {
        let result = Entity::delete_many()
            .filter(oauth_state::Column::ExpiresAt.lte(Utc::now()))
            .exec(&*self.db)
            .await?;

        Ok(result.rows_affected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use migration::{Migrator, MigratorTrait};
    use sea_orm::Database;

    async fn repo() -> OAuthStateRepository {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        Migrator::up(&db, None).await.unwrap();
        OAuthStateRepository::new(Arc::new(db))
    }

    #[tokio::test]
    async fn state_is_single_use() {
        let repo = repo().await;
        let client_id = Uuid::new_v4();
        repo.create("fitbit", "abc", Some(client_id), 15).await.unwrap();

        let first = repo.find_and_consume("abc").await.unwrap().unwrap();
        assert_eq!(first.provider, "fitbit");
        assert_eq!(first.client_id, Some(client_id));
        assert!(repo.find_and_consume("abc").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn concurrent_consumers_get_the_state_once() {
        let repo = repo().await;
        repo.create("gmail", "racy", None, 15).await.unwrap();

        let (a, b) = tokio::join!(repo.find_and_consume("racy"), repo.find_and_consume("racy"));
        let winners = [a.unwrap(), b.unwrap()]
            .into_iter()
            .filter(Option::is_some)
            .count();
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn expired_state_is_rejected_and_removed() {
        let repo = repo().await;
        repo.create("gmail", "old", None, -1).await.unwrap();
        repo.create("gmail", "fresh", None, 15).await.unwrap();

        assert!(repo.find_and_consume("old").await.unwrap().is_none());
        assert_eq!(repo.cleanup_expired().await.unwrap(), 0);
        assert!(repo.find_and_consume("fresh").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn cleanup_removes_only_expired() {
        let repo = repo().await;
        repo.create("gmail", "old", None, -5).await.unwrap();
        repo.create("gmail", "fresh", None, 15).await.unwrap();

        assert_eq!(repo.cleanup_expired().await.unwrap(), 1);
        assert!(repo.find_and_consume("fresh").await.unwrap().is_some());
    }
}

//! Client repository: lookups and settings writes for client records.

use chrono::Utc;
use sea_orm::{ActiveModelTrait, DatabaseConnection, EntityTrait, QueryOrder, Set};
use std::sync::Arc;
use uuid::Uuid;

use crate::models::client::{self, ActiveModel, Entity, Model, Role};
use crate::models::settings::IntegrationSetting;

#[derive(Debug, Clone)]
pub struct ClientRepository {
    db: Arc<DatabaseConnection>,
}

impl ClientRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    pub async fn create(
        &self,
        email: &str,
        name: Option<&str>,
        roles: &[Role],
    ) -> Result<Model, sea_orm::DbErr> {
        let now = Utc::now();
        let model = Model {
            id: Uuid::new_v4(),
            email: email.to_string(),
            name: name.map(str::to_string),
            roles: serde_json::to_value(roles).map_err(|e| sea_orm::DbErr::Json(e.to_string()))?,
            settings: serde_json::json!([]),
            created_at: now,
            updated_at: now,
        };
        let active = ActiveModel {
            id: Set(model.id),
            email: Set(model.email.clone()),
            name: Set(model.name.clone()),
            roles: Set(model.roles.clone()),
            settings: Set(model.settings.clone()),
            created_at: Set(now),
            updated_at: Set(now),
        };
        Entity::insert(active).exec_without_returning(&*self.db).await?;
        Ok(model)
    }

    pub async fn find_by_id(&self, id: Uuid) -> Result<Option<Model>, sea_orm::DbErr> {
        Entity::find_by_id(id).one(&*self.db).await
    }

    pub async fn list(&self) -> Result<Vec<Model>, sea_orm::DbErr> {
        Entity::find()
            .order_by_asc(client::Column::CreatedAt)
            .all(&*self.db)
            .await
    }

    /// Overwrite the client's settings array
    pub async fn save_settings(
        &self,
        record: Model,
        settings: &[IntegrationSetting],
    ) -> Result<Model, sea_orm::DbErr> {
        let json =
            serde_json::to_value(settings).map_err(|e| sea_orm::DbErr::Json(e.to_string()))?;
        let mut active: ActiveModel = record.into();
        active.settings = Set(json);
        active.updated_at = Set(Utc::now());
        active.update(&*self.db).await
    }
}

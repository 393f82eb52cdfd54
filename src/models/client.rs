//! # Client Model
//!
//! A client is the application's user record. Roles and per-user integration settings are
//! JSON columns; [`Model::roles`] and [`Model::integration_settings`] give typed views.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::models::settings::IntegrationSetting;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "clients")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    #[sea_orm(unique)]
    pub email: String,
    pub name: Option<String>,
    /// JSON array of role names
    #[sea_orm(column_type = "JsonBinary")]
    pub roles: Json,
    /// JSON array of [`IntegrationSetting`]
    #[sea_orm(column_type = "JsonBinary")]
    pub settings: Json,
    pub created_at: DateTimeUtc,
    pub updated_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

/// Access roles carried on a client record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
pub enum Role {
    SystemAdmin,
    Admin,
    Trainer,
    Client,
}

impl Role {
    pub fn is_admin(self) -> bool {
        matches!(self, Role::SystemAdmin | Role::Admin)
    }
}

impl Model {
    /// Known roles on this record; unrecognised entries are ignored.
    pub fn roles(&self) -> Vec<Role> {
        self.roles
            .as_array()
            .map(|values| {
                values
                    .iter()
                    .filter_map(|value| serde_json::from_value(value.clone()).ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn is_admin(&self) -> bool {
        self.roles().into_iter().any(Role::is_admin)
    }

    /// Parses the settings column. A null column reads as no settings.
    pub fn integration_settings(&self) -> Result<Vec<IntegrationSetting>, serde_json::Error> {
        if self.settings.is_null() {
            return Ok(Vec::new());
        }
        serde_json::from_value(self.settings.clone())
    }
}

//! # OAuth Service Model
//!
//! System-level integrations (Gmail, Google Chat). One row per connected account; the
//! `properties` column holds [`OAuthServiceProperties`].

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "oauth_services")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    /// Provider key, e.g. "gmail"
    pub name: String,
    /// External account identity (connected email)
    pub account_key: String,
    #[sea_orm(column_type = "JsonBinary")]
    pub properties: Json,
    pub created_at: DateTimeUtc,
    pub updated_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

/// Contents of `oauth_services.properties`.
///
/// The refresh token is only ever present encrypted; the short-lived access token is kept as
/// issued so a valid one can be served without a decrypt.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OAuthServiceProperties {
    #[serde(default)]
    pub access_token: Option<String>,
    /// Unix epoch milliseconds
    #[serde(default)]
    pub expires_at: Option<i64>,
    #[serde(default)]
    pub scopes: Vec<String>,
    pub connected_email: String,
    pub encrypted_refresh_token: String,
}

impl Model {
    pub fn typed_properties(&self) -> Result<OAuthServiceProperties, serde_json::Error> {
        serde_json::from_value(self.properties.clone())
    }
}

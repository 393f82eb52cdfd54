//! Creates the oauth_services table holding system-level integrations.
//!
//! One row per (provider name, connected account); the refresh token lives
//! encrypted inside `properties`.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(OAuthServices::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(OAuthServices::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(OAuthServices::Name).string().not_null())
                    .col(ColumnDef::new(OAuthServices::AccountKey).string().not_null())
                    .col(
                        ColumnDef::new(OAuthServices::Properties)
                            .json_binary()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(OAuthServices::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(OAuthServices::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_oauth_services_name_account")
                    .table(OAuthServices::Table)
                    .col(OAuthServices::Name)
                    .col(OAuthServices::AccountKey)
                    .unique()
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_oauth_services_name_account")
                    .table(OAuthServices::Table)
                    .to_owned(),
            )
            .await?;

        manager
            .drop_table(Table::drop().table(OAuthServices::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum OAuthServices {
    #[sea_orm(iden = "oauth_services")]
    Table,
    Id,
    Name,
    AccountKey,
    Properties,
    CreatedAt,
    UpdatedAt,
}

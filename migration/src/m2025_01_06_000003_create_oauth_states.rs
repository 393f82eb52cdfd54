//! Creates the oauth_states table used for CSRF protection of OAuth flows.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(OAuthStates::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(OAuthStates::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(OAuthStates::Provider).string().not_null())
                    .col(ColumnDef::new(OAuthStates::State).string().not_null())
                    // Set only for per-client flows (Fitbit)
                    .col(ColumnDef::new(OAuthStates::ClientId).uuid().null())
                    .col(
                        ColumnDef::new(OAuthStates::ExpiresAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(OAuthStates::CreatedAt)
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
                    .name("idx_oauth_states_state")
                    .table(OAuthStates::Table)
                    .col(OAuthStates::State)
                    .unique()
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_oauth_states_state")
                    .table(OAuthStates::Table)
                    .to_owned(),
            )
            .await?;

        manager
            .drop_table(Table::drop().table(OAuthStates::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum OAuthStates {
    #[sea_orm(iden = "oauth_states")]
    Table,
    Id,
    Provider,
    State,
    ClientId,
    ExpiresAt,
    CreatedAt,
}

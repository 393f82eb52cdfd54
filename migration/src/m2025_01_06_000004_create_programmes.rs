//! Creates the programmes table.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Programmes::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Programmes::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Programmes::Name).string().not_null())
                    .col(
                        ColumnDef::new(Programmes::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Programmes::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
pub(crate) enum Programmes {
    Table,
    Id,
    Name,
    CreatedAt,
}

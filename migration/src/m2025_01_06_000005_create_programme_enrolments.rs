//! Creates the programme_enrolments table linking clients to programmes.

use sea_orm_migration::prelude::*;

use crate::m2025_01_06_000001_create_clients::Clients;
use crate::m2025_01_06_000004_create_programmes::Programmes;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(ProgrammeEnrolments::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(ProgrammeEnrolments::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(ProgrammeEnrolments::ProgrammeId)
                            .uuid()
                            .not_null(),
                    )
                    .col(ColumnDef::new(ProgrammeEnrolments::ClientId).uuid().not_null())
                    .col(
                        ColumnDef::new(ProgrammeEnrolments::Status)
                            .string()
                            .not_null()
                            .default("active"),
                    )
                    .col(
                        ColumnDef::new(ProgrammeEnrolments::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_programme_enrolments_programme")
                            .from(ProgrammeEnrolments::Table, ProgrammeEnrolments::ProgrammeId)
                            .to(Programmes::Table, Programmes::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_programme_enrolments_client")
                            .from(ProgrammeEnrolments::Table, ProgrammeEnrolments::ClientId)
                            .to(Clients::Table, Clients::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_programme_enrolments_programme_client")
                    .table(ProgrammeEnrolments::Table)
                    .col(ProgrammeEnrolments::ProgrammeId)
                    .col(ProgrammeEnrolments::ClientId)
                    .unique()
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_programme_enrolments_programme_client")
                    .table(ProgrammeEnrolments::Table)
                    .to_owned(),
            )
            .await?;

        manager
            .drop_table(Table::drop().table(ProgrammeEnrolments::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum ProgrammeEnrolments {
    Table,
    Id,
    ProgrammeId,
    ClientId,
    Status,
    CreatedAt,
}

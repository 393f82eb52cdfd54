//! Creates the programme_habits table.
//!
//! Each weekday column holds the number of completions required that day;
//! NULL or 0 is read as 1 by the application.

use sea_orm_migration::prelude::*;

use crate::m2025_01_06_000004_create_programmes::Programmes;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(ProgrammeHabits::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(ProgrammeHabits::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(ProgrammeHabits::ProgrammeId).uuid().not_null())
                    .col(ColumnDef::new(ProgrammeHabits::Title).string().not_null())
                    .col(ColumnDef::new(ProgrammeHabits::Monday).integer().null())
                    .col(ColumnDef::new(ProgrammeHabits::Tuesday).integer().null())
                    .col(ColumnDef::new(ProgrammeHabits::Wednesday).integer().null())
                    .col(ColumnDef::new(ProgrammeHabits::Thursday).integer().null())
                    .col(ColumnDef::new(ProgrammeHabits::Friday).integer().null())
                    .col(ColumnDef::new(ProgrammeHabits::Saturday).integer().null())
                    .col(ColumnDef::new(ProgrammeHabits::Sunday).integer().null())
                    .col(
                        ColumnDef::new(ProgrammeHabits::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_programme_habits_programme")
                            .from(ProgrammeHabits::Table, ProgrammeHabits::ProgrammeId)
                            .to(Programmes::Table, Programmes::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(ProgrammeHabits::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
pub(crate) enum ProgrammeHabits {
    Table,
    Id,
    ProgrammeId,
    Title,
    Monday,
    Tuesday,
    Wednesday,
    Thursday,
    Friday,
    Saturday,
    Sunday,
    CreatedAt,
}

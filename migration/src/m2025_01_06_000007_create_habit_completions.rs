//! Creates the habit_completions table.
//!
//! The unique index on (programme_habit_id, client_id, habit_date) is the
//! upsert key; concurrent writers rely on it for last-write-wins semantics.

use sea_orm_migration::prelude::*;

use crate::m2025_01_06_000001_create_clients::Clients;
use crate::m2025_01_06_000006_create_programme_habits::ProgrammeHabits;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(HabitCompletions::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(HabitCompletions::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(HabitCompletions::ProgrammeHabitId)
                            .uuid()
                            .not_null(),
                    )
                    .col(ColumnDef::new(HabitCompletions::ClientId).uuid().not_null())
                    .col(ColumnDef::new(HabitCompletions::HabitDate).date().not_null())
                    .col(
                        ColumnDef::new(HabitCompletions::TimesDone)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(HabitCompletions::RequiredPerDay)
                            .integer()
                            .not_null()
                            .default(1),
                    )
                    .col(
                        ColumnDef::new(HabitCompletions::Completed)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(
                        ColumnDef::new(HabitCompletions::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(HabitCompletions::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_habit_completions_habit")
                            .from(HabitCompletions::Table, HabitCompletions::ProgrammeHabitId)
                            .to(ProgrammeHabits::Table, ProgrammeHabits::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_habit_completions_client")
                            .from(HabitCompletions::Table, HabitCompletions::ClientId)
                            .to(Clients::Table, Clients::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_habit_completions_habit_client_date")
                    .table(HabitCompletions::Table)
                    .col(HabitCompletions::ProgrammeHabitId)
                    .col(HabitCompletions::ClientId)
                    .col(HabitCompletions::HabitDate)
                    .unique()
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_habit_completions_habit_client_date")
                    .table(HabitCompletions::Table)
                    .to_owned(),
            )
            .await?;

        manager
            .drop_table(Table::drop().table(HabitCompletions::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum HabitCompletions {
    Table,
    Id,
    ProgrammeHabitId,
    ClientId,
    HabitDate,
    TimesDone,
    RequiredPerDay,
    Completed,
    CreatedAt,
    UpdatedAt,
}

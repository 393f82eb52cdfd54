//! # Habit Repository
//!
//! Data access for programme habits, enrolments and daily completions.

use chrono::{NaiveDate, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter,
    QueryOrder, Set,
};
use std::sync::Arc;
use uuid::Uuid;

use crate::models::programme_enrolment::EnrolmentStatus;
use crate::models::{habit_completion, programme_enrolment, programme_habit};

/// Fields written on a completion upsert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionValues {
    pub times_done: i32,
    pub required_per_day: i32,
    pub completed: bool,
}

#[derive(Debug, Clone)]
pub struct HabitRepository {
    db: Arc<DatabaseConnection>,
}

impl HabitRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    pub async fn find_habit(
        &self,
        id: Uuid,
    ) -> Result<Option<programme_habit::Model>, sea_orm::DbErr> {
        programme_habit::Entity::find_by_id(id).one(&*self.db).await
    }

    pub async fn has_active_enrolment(
        &self,
        programme_id: Uuid,
        client_id: Uuid,
    ) -> Result<bool, sea_orm::DbErr> {
        let count = programme_enrolment::Entity::find()
            .filter(programme_enrolment::Column::ProgrammeId.eq(programme_id))
            .filter(programme_enrolment::Column::ClientId.eq(client_id))
            .filter(programme_enrolment::Column::Status.eq(EnrolmentStatus::Active.as_str()))
            .count(&*self.db)
            .await?;
        Ok(count > 0)
    }

    pub async fn find_completion(
        &self,
        programme_habit_id: Uuid,
        client_id: Uuid,
        habit_date: NaiveDate,
    ) -> Result<Option<habit_completion::Model>, sea_orm::DbErr> {
        habit_completion::Entity::find()
            .filter(habit_completion::Column::ProgrammeHabitId.eq(programme_habit_id))
            .filter(habit_completion::Column::ClientId.eq(client_id))
            .filter(habit_completion::Column::HabitDate.eq(habit_date))
            .one(&*self.db)
            .await
    }

    pub async fn insert_completion(
        &self,
        programme_habit_id: Uuid,
        client_id: Uuid,
        habit_date: NaiveDate,
        values: CompletionValues,
    ) -> Result<habit_completion::Model, sea_orm::DbErr> {
        let now = Utc::now();
        let model = habit_completion::Model {
            id: Uuid::new_v4(),
            programme_habit_id,
            client_id,
            habit_date,
            times_done: values.times_done,
            required_per_day: values.required_per_day,
            completed: values.completed,
            created_at: now,
            updated_at: now,
        };
        let active = habit_completion::ActiveModel {
            id: Set(model.id),
            programme_habit_id: Set(programme_habit_id),
            client_id: Set(client_id),
            habit_date: Set(habit_date),
            times_done: Set(values.times_done),
            required_per_day: Set(values.required_per_day),
            completed: Set(values.completed),
            created_at: Set(now),
            updated_at: Set(now),
        };
        habit_completion::Entity::insert(active)
            .exec_without_returning(&*self.db)
            .await?;
        Ok(model)
    }

    pub async fn update_completion(
        &self,
        existing: habit_completion::Model,
        values: CompletionValues,
    ) -> Result<habit_completion::Model, sea_orm::DbErr> {
        let mut active: habit_completion::ActiveModel = existing.into();
        active.times_done = Set(values.times_done);
        active.required_per_day = Set(values.required_per_day);
        active.completed = Set(values.completed);
        active.updated_at = Set(Utc::now());
        active.update(&*self.db).await
    }

    /// Completions in `[from, to]`, oldest first
    pub async fn list_completions(
        &self,
        programme_habit_id: Uuid,
        client_id: Uuid,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<habit_completion::Model>, sea_orm::DbErr> {
        habit_completion::Entity::find()
            .filter(habit_completion::Column::ProgrammeHabitId.eq(programme_habit_id))
            .filter(habit_completion::Column::ClientId.eq(client_id))
            .filter(habit_completion::Column::HabitDate.gte(from))
            .filter(habit_completion::Column::HabitDate.lte(to))
            .order_by_asc(habit_completion::Column::HabitDate)
            .all(&*self.db)
            .await
    }

    /// Completed days up to and including `through`, oldest first
    pub async fn completed_through(
        &self,
        programme_habit_id: Uuid,
        client_id: Uuid,
        through: NaiveDate,
    ) -> Result<Vec<habit_completion::Model>, sea_orm::DbErr> {
        habit_completion::Entity::find()
            .filter(habit_completion::Column::ProgrammeHabitId.eq(programme_habit_id))
            .filter(habit_completion::Column::ClientId.eq(client_id))
            .filter(habit_completion::Column::Completed.eq(true))
            .filter(habit_completion::Column::HabitDate.lte(through))
            .order_by_asc(habit_completion::Column::HabitDate)
            .all(&*self.db)
            .await
    }
}

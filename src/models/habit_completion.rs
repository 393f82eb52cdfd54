//! # Habit Completion Model
//!
//! One row per (programme habit, client, day). `completed` is derived from `times_done` and
//! `required_per_day` at write time.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "habit_completions")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub programme_habit_id: Uuid,
    pub client_id: Uuid,
    pub habit_date: Date,
    pub times_done: i32,
    pub required_per_day: i32,
    pub completed: bool,
    pub created_at: DateTimeUtc,
    pub updated_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

//! # Programme Habit Model
//!
//! A habit assigned within a programme, with a required completion count per weekday.

use chrono::Weekday;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "programme_habits")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub programme_id: Uuid,
    pub title: String,
    pub monday: Option<i32>,
    pub tuesday: Option<i32>,
    pub wednesday: Option<i32>,
    pub thursday: Option<i32>,
    pub friday: Option<i32>,
    pub saturday: Option<i32>,
    pub sunday: Option<i32>,
    pub created_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    /// Raw configured frequency for `weekday`, before any fallback.
    pub fn frequency_for(&self, weekday: Weekday) -> Option<i32> {
        match weekday {
            Weekday::Mon => self.monday,
            Weekday::Tue => self.tuesday,
            Weekday::Wed => self.wednesday,
            Weekday::Thu => self.thursday,
            Weekday::Fri => self.friday,
            Weekday::Sat => self.saturday,
            Weekday::Sun => self.sunday,
        }
    }
}

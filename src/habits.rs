//! # Habit Completion Tracking
//!
//! Daily completion counts for programme habits. The required count comes from the habit's
//! weekday column, `times_done` is clamped to `[0, MAX_PER_DAY]`, and `completed` is always
//! derived from the two. Writes are idempotent per `(habit, client, date)`.

use std::sync::Arc;

use axum::http::StatusCode;
use chrono::{Datelike, Duration, NaiveDate};
use metrics::counter;
use sea_orm::DatabaseConnection;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::error::{ApiError, is_unique_violation};
use crate::models::{habit_completion, programme_habit};
use crate::repositories::{CompletionValues, HabitRepository};

/// Ceiling on completions recorded for one habit on one day.
pub const MAX_PER_DAY: i32 = 20;

/// Widest history window served in one request.
pub const MAX_HISTORY_DAYS: i64 = 366;

/// Required completions for `habit` on `date`; an unset or zero frequency means once.
pub fn required_per_day(habit: &programme_habit::Model, date: NaiveDate) -> i32 {
    match habit.frequency_for(date.weekday()) {
        Some(n) if n > 0 => n,
        _ => 1,
    }
}

/// How a submission changes the day's count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimesDoneUpdate {
    Set(i32),
    Delta(i32),
}

impl TimesDoneUpdate {
    /// Exactly one of `times_done` and `delta` must be given.
    pub fn from_parts(times_done: Option<i32>, delta: Option<i32>) -> Result<Self, HabitError> {
        match (times_done, delta) {
            (Some(n), None) => Ok(Self::Set(n)),
            (None, Some(d)) => Ok(Self::Delta(d)),
            _ => Err(HabitError::InvalidUpdate),
        }
    }

    /// New count given the current one, clamped to `[0, MAX_PER_DAY]`.
    pub fn apply(self, current: i32) -> i32 {
        let raw = match self {
            Self::Set(n) => n,
            Self::Delta(d) => current.saturating_add(d),
        };
        raw.clamp(0, MAX_PER_DAY)
    }
}

pub fn is_completed(times_done: i32, required: i32) -> bool {
    times_done >= required
}

/// Consecutive completed days ending today, or ending yesterday while today is still open.
pub fn current_streak(completions: &[habit_completion::Model], today: NaiveDate) -> u32 {
    let mut done: Vec<NaiveDate> = completions
        .iter()
        .filter(|c| c.completed && c.habit_date <= today)
        .map(|c| c.habit_date)
        .collect();
    done.sort_unstable();
    done.dedup();

    let mut expected = today;
    if done.last() != Some(&today) {
        expected = today - Duration::days(1);
    }

    let mut streak = 0;
    for date in done.iter().rev() {
        if *date != expected {
            break;
        }
        streak += 1;
        expected = expected - Duration::days(1);
    }
    streak
}

/// Longest run of consecutive completed days.
pub fn longest_streak(completions: &[habit_completion::Model]) -> u32 {
    let mut done: Vec<NaiveDate> = completions
        .iter()
        .filter(|c| c.completed)
        .map(|c| c.habit_date)
        .collect();
    done.sort_unstable();
    done.dedup();

    let mut longest = 0;
    let mut run = 0;
    let mut previous: Option<NaiveDate> = None;
    for date in done {
        run = match previous {
            Some(prev) if date - prev == Duration::days(1) => run + 1,
            _ => 1,
        };
        longest = longest.max(run);
        previous = Some(date);
    }
    longest
}

#[derive(Debug, Error)]
pub enum HabitError {
    #[error("Habit {0} not found")]
    HabitNotFound(Uuid),

    #[error("Client is not actively enrolled in this habit's programme")]
    NotEnrolled,

    #[error("Exactly one of timesDone or delta must be provided")]
    InvalidUpdate,

    #[error("Invalid request: {0}")]
    InvalidPayload(String),

    #[error("Invalid date range: {0}")]
    InvalidRange(String),

    #[error("Database error: {0}")]
    Database(#[from] sea_orm::DbErr),
}

impl From<HabitError> for ApiError {
    fn from(error: HabitError) -> Self {
        match error {
            HabitError::HabitNotFound(_) => crate::error::not_found("Habit not found"),
            HabitError::NotEnrolled => crate::error::forbidden(Some(
                "You are not enrolled in the programme this habit belongs to",
            )),
            HabitError::InvalidUpdate => ApiError::new(
                StatusCode::BAD_REQUEST,
                "VALIDATION_FAILED",
                "Provide exactly one of timesDone or delta",
            ),
            HabitError::InvalidPayload(message) | HabitError::InvalidRange(message) => {
                ApiError::new(StatusCode::BAD_REQUEST, "VALIDATION_FAILED", message)
            }
            HabitError::Database(err) => err.into(),
        }
    }
}

/// Body of a completion submission
#[derive(Debug, Clone, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct HabitCompletionRequest {
    /// Day being recorded, `YYYY-MM-DD`
    pub habit_date: String,
    /// Absolute count for the day
    #[serde(default)]
    pub times_done: Option<i32>,
    /// Signed adjustment to the day's count
    #[serde(default)]
    pub delta: Option<i32>,
}

/// A day's completion as returned to clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct HabitCompletionView {
    pub id: Uuid,
    pub programme_habit_id: Uuid,
    pub habit_date: NaiveDate,
    pub times_done: i32,
    pub required_per_day: i32,
    pub completed: bool,
}

impl From<habit_completion::Model> for HabitCompletionView {
    fn from(model: habit_completion::Model) -> Self {
        Self {
            id: model.id,
            programme_habit_id: model.programme_habit_id,
            habit_date: model.habit_date,
            times_done: model.times_done,
            required_per_day: model.required_per_day,
            completed: model.completed,
        }
    }
}

/// Completions in a date range plus streaks
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct HabitHistoryView {
    pub programme_habit_id: Uuid,
    pub from: NaiveDate,
    pub to: NaiveDate,
    pub completions: Vec<HabitCompletionView>,
    pub current_streak: u32,
    pub longest_streak: u32,
}

pub struct HabitCompletionService {
    habits: HabitRepository,
}

impl HabitCompletionService {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self {
            habits: HabitRepository::new(db),
        }
    }

    /// Loads the habit and checks the acting client's enrolment in its programme.
    pub async fn ensure_access(
        &self,
        client_id: Uuid,
        programme_habit_id: Uuid,
    ) -> Result<programme_habit::Model, HabitError> {
        let habit = self
            .habits
            .find_habit(programme_habit_id)
            .await?
            .ok_or(HabitError::HabitNotFound(programme_habit_id))?;

        if !self
            .habits
            .has_active_enrolment(habit.programme_id, client_id)
            .await?
        {
            return Err(HabitError::NotEnrolled);
        }

        Ok(habit)
    }

    /// Record a completion for `date`, inserting or updating the day's row.
    #[instrument(skip(self))]
    pub async fn record(
        &self,
        client_id: Uuid,
        programme_habit_id: Uuid,
        date: NaiveDate,
        update: TimesDoneUpdate,
    ) -> Result<HabitCompletionView, HabitError> {
        let habit = self
            .ensure_access(client_id, programme_habit_id)
            .await
            .inspect_err(count_rejection)?;
        self.upsert(&habit, client_id, date, update).await
    }

    /// Record a completion from an unvalidated request body.
    ///
    /// Enrolment is checked before the body is looked at, so an unenrolled client is
    /// rejected whatever it sent.
    #[instrument(skip(self, request))]
    pub async fn submit(
        &self,
        client_id: Uuid,
        programme_habit_id: Uuid,
        request: Result<HabitCompletionRequest, String>,
    ) -> Result<HabitCompletionView, HabitError> {
        let habit = self
            .ensure_access(client_id, programme_habit_id)
            .await
            .inspect_err(count_rejection)?;

        let request = request.map_err(HabitError::InvalidPayload)?;
        let date = NaiveDate::parse_from_str(&request.habit_date, "%Y-%m-%d").map_err(|_| {
            HabitError::InvalidPayload("habitDate must be a YYYY-MM-DD date".to_string())
        })?;
        let update = TimesDoneUpdate::from_parts(request.times_done, request.delta)?;

        self.upsert(&habit, client_id, date, update).await
    }

    async fn upsert(
        &self,
        habit: &programme_habit::Model,
        client_id: Uuid,
        date: NaiveDate,
        update: TimesDoneUpdate,
    ) -> Result<HabitCompletionView, HabitError> {
        let required = required_per_day(habit, date);
        let existing = self
            .habits
            .find_completion(habit.id, client_id, date)
            .await?;

        let (model, result) = match existing {
            Some(row) => {
                let values = values_for(update.apply(row.times_done), required);
                (self.habits.update_completion(row, values).await?, "updated")
            }
            None => {
                let values = values_for(update.apply(0), required);
                match self
                    .habits
                    .insert_completion(habit.id, client_id, date, values)
                    .await
                {
                    Ok(model) => (model, "inserted"),
                    Err(e) if is_unique_violation(&e) => {
                        // Lost an insert race for the same day; apply on top of the winner
                        debug!("Concurrent completion insert, updating instead");
                        let row = self
                            .habits
                            .find_completion(habit.id, client_id, date)
                            .await?
                            .ok_or(e)?;
                        let values = values_for(update.apply(row.times_done), required);
                        (self.habits.update_completion(row, values).await?, "updated")
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        };

        counter!("habit_completion_upsert_total", "result" => result).increment(1);
        Ok(model.into())
    }

    /// Completions between `from` and `to` inclusive, with streaks as of `today`.
    ///
    /// Streaks cover every completed day up to `today`, not just the requested window.
    #[instrument(skip(self))]
    pub async fn history(
        &self,
        client_id: Uuid,
        programme_habit_id: Uuid,
        from: NaiveDate,
        to: NaiveDate,
        today: NaiveDate,
    ) -> Result<HabitHistoryView, HabitError> {
        if from > to {
            return Err(HabitError::InvalidRange("from must not be after to".to_string()));
        }
        if (to - from).num_days() >= MAX_HISTORY_DAYS {
            return Err(HabitError::InvalidRange(format!(
                "range must be shorter than {} days",
                MAX_HISTORY_DAYS
            )));
        }

        let habit = self.ensure_access(client_id, programme_habit_id).await?;
        let rows = self
            .habits
            .list_completions(habit.id, client_id, from, to)
            .await?;
        let done = self
            .habits
            .completed_through(habit.id, client_id, today)
            .await?;

        Ok(HabitHistoryView {
            programme_habit_id: habit.id,
            from,
            to,
            current_streak: current_streak(&done, today),
            longest_streak: longest_streak(&done),
            completions: rows.into_iter().map(HabitCompletionView::from).collect(),
        })
    }
}

fn count_rejection(error: &HabitError) {
    if matches!(error, HabitError::NotEnrolled) {
        counter!("habit_completion_upsert_total", "result" => "rejected").increment(1);
    }
}

fn values_for(times_done: i32, required: i32) -> CompletionValues {
    CompletionValues {
        times_done,
        required_per_day: required,
        completed: is_completed(times_done, required),
    }
}

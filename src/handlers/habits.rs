//! Habit completion endpoints for the acting client.

use axum::{
    extract::{
        Path, Query, State,
        rejection::{JsonRejection, QueryRejection},
    },
    response::Json,
};
use chrono::{Duration, NaiveDate, Utc};
use serde::Deserialize;
use utoipa::IntoParams;
use uuid::Uuid;

use crate::auth::{ActingClient, ClientHeader};
use crate::error::{ActionError, ActionResult, ApiError};
use crate::habits::{HabitCompletionRequest, HabitCompletionView, HabitHistoryView};
use crate::server::AppState;

const DEFAULT_HISTORY_DAYS: i64 = 30;

/// Date range for completion history; defaults to the last 30 days
#[derive(Debug, Default, Deserialize, IntoParams)]
pub struct HistoryQuery {
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
}

/// Record a habit completion
///
/// Sets (`timesDone`) or adjusts (`delta`) the day's count. Repeated submissions for the same
/// day update the existing row.
#[utoipa::path(
    post,
    path = "/api/client/habits/{programme_habit_id}/completions",
    security(("bearer_auth" = [])),
    params(
        ("programme_habit_id" = Uuid, Path, description = "Programme habit id"),
        ClientHeader
    ),
    request_body = HabitCompletionRequest,
    responses(
        (status = 200, description = "Completion recorded", body = ActionResult<HabitCompletionView>),
        (status = 400, description = "Invalid payload", body = ActionResult<String>),
        (status = 403, description = "Not enrolled in the habit's programme", body = ActionResult<String>),
        (status = 404, description = "Habit not found", body = ActionResult<String>)
    ),
    tag = "habits"
)]
pub async fn record_completion(
    State(state): State<AppState>,
    acting: ActingClient,
    Path(programme_habit_id): Path<Uuid>,
    payload: Result<Json<HabitCompletionRequest>, JsonRejection>,
) -> Result<Json<ActionResult<HabitCompletionView>>, ActionError> {
    let request = payload
        .map(|Json(body)| body)
        .map_err(|rejection| ApiError::from(rejection).message.into_string());

    let view = state
        .habits
        .submit(acting.0, programme_habit_id, request)
        .await?;

    Ok(Json(ActionResult::ok(view)))
}

/// Completion history with streaks
#[utoipa::path(
    get,
    path = "/api/client/habits/{programme_habit_id}/completions",
    security(("bearer_auth" = [])),
    params(
        ("programme_habit_id" = Uuid, Path, description = "Programme habit id"),
        HistoryQuery,
        ClientHeader
    ),
    responses(
        (status = 200, description = "Completions in range", body = ActionResult<HabitHistoryView>),
        (status = 400, description = "Invalid range", body = ActionResult<String>),
        (status = 403, description = "Not enrolled in the habit's programme", body = ActionResult<String>)
    ),
    tag = "habits"
)]
pub async fn completion_history(
    State(state): State<AppState>,
    acting: ActingClient,
    Path(programme_habit_id): Path<Uuid>,
    query: Result<Query<HistoryQuery>, QueryRejection>,
) -> Result<Json<ActionResult<HabitHistoryView>>, ActionError> {
    let Query(query) = query?;

    let today = Utc::now().date_naive();
    let to = query.to.unwrap_or(today);
    let from = query
        .from
        .unwrap_or(to - Duration::days(DEFAULT_HISTORY_DAYS - 1));

    let history = state
        .habits
        .history(acting.0, programme_habit_id, from, to, today)
        .await?;

    Ok(Json(ActionResult::ok(history)))
}
